//! Input sources and the small amount of URI handling schema references need.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use url::Url;

use crate::error::{Result, ValidationError};

/// Something that can be parsed: a URI to read from, or bytes already in memory.
///
/// The system identifier doubles as the base URI for relative references inside the document.
#[derive(Debug, Clone)]
pub struct InputSource {
    system_id: Option<Url>,
    bytes: Option<Arc<[u8]>>,
}

impl InputSource {
    pub fn from_uri(uri: Url) -> Self {
        Self {
            system_id: Some(uri),
            bytes: None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let absolute = std::path::absolute(path)?;
        let uri = Url::from_file_path(&absolute).map_err(|_| ValidationError::UnsupportedUri {
            uri: absolute.display().to_string(),
            reason: "path cannot be expressed as a file URI".to_string(),
        })?;
        Ok(Self::from_uri(uri))
    }

    /// Treats `value` as an absolute URI when it parses as one, otherwise as a file name.
    pub fn from_uri_or_path(value: &str) -> Result<Self> {
        match Url::parse(value) {
            // Single-letter schemes are Windows drive letters.
            Ok(uri) if uri.scheme().len() > 1 => Ok(Self::from_uri(uri)),
            _ => Self::from_path(Path::new(value)),
        }
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, system_id: Option<Url>) -> Self {
        Self {
            system_id,
            bytes: Some(bytes.into()),
        }
    }

    pub fn system_id(&self) -> Option<&Url> {
        self.system_id.as_ref()
    }

    /// Human readable identifier for diagnostics.
    pub fn display_id(&self) -> String {
        self.system_id
            .as_ref()
            .map(Url::to_string)
            .unwrap_or_else(|| "<memory>".to_string())
    }

    /// The document bytes, when they were supplied up front.
    pub fn in_memory(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.system_id
            .as_ref()
            .filter(|uri| uri.scheme() == "file")
            .and_then(|uri| uri.to_file_path().ok())
    }

    /// Reads the whole document. Only `file:` URIs are fetched; other schemes are rejected.
    pub fn read_bytes(&self) -> Result<Arc<[u8]>> {
        if let Some(bytes) = &self.bytes {
            return Ok(Arc::clone(bytes));
        }
        let uri = self
            .system_id
            .as_ref()
            .ok_or_else(|| ValidationError::UnsupportedUri {
                uri: String::new(),
                reason: "input source has neither bytes nor a system identifier".to_string(),
            })?;
        let path = self
            .file_path()
            .ok_or_else(|| ValidationError::UnsupportedUri {
                uri: uri.to_string(),
                reason: format!("scheme '{}' is not supported", uri.scheme()),
            })?;
        Ok(Arc::from(std::fs::read(path)?))
    }
}

/// True if `value` is an absolute URI (it has a scheme).
pub fn is_absolute_uri(value: &str) -> bool {
    Url::parse(value).is_ok()
}

pub fn has_fragment_id(value: &str) -> bool {
    value.contains('#')
}

/// Percent-encodes characters that may not appear literally in a URI reference.
///
/// `%` is left alone so already-escaped references stay as they are.
pub fn escape_disallowed_chars(value: &str) -> Cow<'_, str> {
    fn disallowed(c: char) -> bool {
        !c.is_ascii()
            || c.is_ascii_control()
            || matches!(c, ' ' | '<' | '>' | '"' | '{' | '}' | '|' | '\\' | '^' | '`')
    }

    if !value.chars().any(disallowed) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    let mut utf8 = [0u8; 4];
    for c in value.chars() {
        if disallowed(c) {
            for byte in c.encode_utf8(&mut utf8).bytes() {
                let _ = write!(escaped, "%{:02X}", byte);
            }
        } else {
            escaped.push(c);
        }
    }
    Cow::Owned(escaped)
}

/// Resolves a reference against an optional base.
pub fn resolve_reference(base: Option<&Url>, reference: &str) -> Result<Url> {
    let escaped = escape_disallowed_chars(reference);
    let resolved = match base {
        Some(base) => base.join(&escaped),
        None => Url::parse(&escaped),
    };
    resolved.map_err(|e| ValidationError::UnsupportedUri {
        uri: reference.to_string(),
        reason: e.to_string(),
    })
}

/// Base URI in effect at each open element, following `xml:base` inheritance.
#[derive(Debug, Clone)]
pub struct BaseUriStack {
    stack: Vec<Option<Url>>,
}

impl BaseUriStack {
    pub fn new(document_uri: Option<Url>) -> Self {
        Self {
            stack: vec![document_uri],
        }
    }

    pub fn current(&self) -> Option<&Url> {
        self.stack.last().and_then(Option::as_ref)
    }

    /// Enters an element, applying its `xml:base` attribute if it has one. An unresolvable
    /// `xml:base` leaves the inherited base in place.
    pub fn start_element(&mut self, xml_base: Option<&str>) {
        let inherited = self.current().cloned();
        let base = match xml_base {
            Some(value) => resolve_reference(inherited.as_ref(), value)
                .ok()
                .or(inherited),
            None => inherited,
        };
        self.stack.push(base);
    }

    pub fn end_element(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_uri_detection() {
        assert!(is_absolute_uri("urn:a"));
        assert!(is_absolute_uri("http://example.com/ns"));
        assert!(!is_absolute_uri("relative/path"));
        assert!(!is_absolute_uri(""));
    }

    #[test]
    fn test_fragment_detection() {
        assert!(has_fragment_id("schema.xsd#part"));
        assert!(!has_fragment_id("schema.xsd"));
    }

    #[test]
    fn test_escape_disallowed_chars() {
        assert_eq!(escape_disallowed_chars("a b.xsd"), "a%20b.xsd");
        assert_eq!(escape_disallowed_chars("caf\u{e9}.xsd"), "caf%C3%A9.xsd");
        assert_eq!(escape_disallowed_chars("already%20ok"), "already%20ok");
        assert!(matches!(escape_disallowed_chars("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_resolve_reference() {
        let base = Url::parse("file:///rules/main.xml").unwrap();
        let resolved = resolve_reference(Some(&base), "schemas/a.xsd").unwrap();
        assert_eq!(resolved.as_str(), "file:///rules/schemas/a.xsd");

        let resolved = resolve_reference(Some(&base), "my schema.xsd").unwrap();
        assert_eq!(resolved.as_str(), "file:///rules/my%20schema.xsd");

        assert!(resolve_reference(None, "relative.xsd").is_err());
        assert!(resolve_reference(None, "file:///abs.xsd").is_ok());
    }

    #[test]
    fn test_base_uri_stack_scoping() {
        let mut stack = BaseUriStack::new(Some(Url::parse("file:///a/doc.xml").unwrap()));
        stack.start_element(None);
        assert_eq!(stack.current().unwrap().as_str(), "file:///a/doc.xml");

        stack.start_element(Some("sub/"));
        assert_eq!(stack.current().unwrap().as_str(), "file:///a/sub/");

        stack.start_element(Some("deeper/"));
        assert_eq!(stack.current().unwrap().as_str(), "file:///a/sub/deeper/");

        stack.end_element();
        stack.end_element();
        assert_eq!(stack.current().unwrap().as_str(), "file:///a/doc.xml");

        // Never pops the document base.
        stack.end_element();
        stack.end_element();
        assert_eq!(stack.current().unwrap().as_str(), "file:///a/doc.xml");
    }

    #[test]
    fn test_read_bytes_from_memory_and_file() {
        let source = InputSource::from_bytes(b"<a/>".to_vec(), None);
        assert_eq!(&*source.read_bytes().unwrap(), b"<a/>");
        assert_eq!(source.display_id(), "<memory>");

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("doc.xml");
        std::fs::write(&path, "<b/>").unwrap();
        let source = InputSource::from_path(&path).unwrap();
        assert_eq!(&*source.read_bytes().unwrap(), b"<b/>");
        assert_eq!(source.file_path().unwrap(), path);
    }

    #[test]
    fn test_read_bytes_missing_file_is_io_error() {
        let source = InputSource::from_uri(Url::parse("file:///definitely/not/here.xml").unwrap());
        assert!(matches!(source.read_bytes(), Err(ValidationError::Io(_))));
    }

    #[test]
    fn test_read_bytes_rejects_remote_scheme() {
        let source = InputSource::from_uri(Url::parse("http://example.com/a.xsd").unwrap());
        assert!(matches!(
            source.read_bytes(),
            Err(ValidationError::UnsupportedUri { .. })
        ));
    }
}
