//! Event source: turns document bytes into [`ContentHandler`] callbacks.
//!
//! Built on `quick-xml`'s namespace-resolving reader. Empty elements are expanded into a start
//! and an end event, anything but whitespace outside the root element is a parse error, and
//! every callback gets a line/column location computed from the reader's byte offset.

use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::events::attributes::Attribute as RawAttribute;
use quick_xml::name::{PrefixDeclaration, ResolveResult};
use quick_xml::reader::NsReader;

use crate::error::{Result, ValidationError};
use crate::event::{Attribute, ContentHandler, Location, NamespaceBinding, QName, StartElement};
use crate::input::InputSource;

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Parses `source`, pushing its events into `handler`.
pub fn parse_source<H: ContentHandler + ?Sized>(source: &InputSource, handler: &mut H) -> Result<()> {
    let bytes = source.read_bytes()?;
    let system_id = source.system_id().map(|uri| Arc::from(uri.as_str()));
    parse_bytes(&bytes, system_id, handler)
}

pub fn parse_bytes<H: ContentHandler + ?Sized>(
    bytes: &[u8],
    system_id: Option<Arc<str>>,
    handler: &mut H,
) -> Result<()> {
    let mut pump = EventPump::new(bytes, system_id);
    // Open elements with the bindings in scope for their content.
    let mut open: Vec<(QName, Arc<[NamespaceBinding]>)> = Vec::new();
    let mut seen_root = false;

    handler.start_document()?;
    loop {
        let (location, event) = pump.next_event()?;
        match event {
            PumpEvent::Start(mut element) => {
                if seen_root && open.is_empty() {
                    return Err(pump.error_at(&location, "content after the root element"));
                }
                seen_root = true;
                let inherited = open.last().map(|(_, scope)| scope);
                element.in_scope_namespaces = in_scope(inherited, &element.namespace_declarations);
                handler.start_element(&element, &location)?;
                open.push((element.name, element.in_scope_namespaces));
            }
            PumpEvent::End => {
                let (name, _) = open
                    .pop()
                    .ok_or_else(|| pump.error_at(&location, "unexpected end tag"))?;
                handler.end_element(&name, &location)?;
            }
            PumpEvent::Text(text) => {
                if !open.is_empty() {
                    handler.characters(&text, &location)?;
                } else if !is_xml_whitespace(&text) {
                    return Err(pump.error_at(&location, "text outside the root element"));
                }
            }
            PumpEvent::Eof => {
                if !seen_root {
                    return Err(pump.error_at(&location, "document has no root element"));
                }
                if let Some((name, _)) = open.last() {
                    let message = format!("unexpected end of document inside <{}>", name);
                    return Err(pump.error_at(&location, &message));
                }
                return handler.end_document(&location);
            }
        }
    }
}

/// Bindings in effect on an element: the inherited ones, overridden by its own declarations.
fn in_scope(
    inherited: Option<&Arc<[NamespaceBinding]>>,
    declarations: &[NamespaceBinding],
) -> Arc<[NamespaceBinding]> {
    match inherited {
        Some(scope) if declarations.is_empty() => Arc::clone(scope),
        _ => {
            let mut bindings: Vec<NamespaceBinding> = inherited
                .into_iter()
                .flat_map(|scope| scope.iter())
                .filter(|binding| declarations.iter().all(|own| own.prefix != binding.prefix))
                .cloned()
                .collect();
            bindings.extend(declarations.iter().cloned());
            Arc::from(bindings)
        }
    }
}

fn is_xml_whitespace(text: &str) -> bool {
    text.chars()
        .all(|c| matches!(c, ' ' | '\t' | '\r' | '\n' | '\u{feff}'))
}

/// Reads only as far as the root start tag and returns its name.
pub fn root_element_name(source: &InputSource) -> Result<QName> {
    let bytes = source.read_bytes()?;
    let system_id = source.system_id().map(|uri| Arc::from(uri.as_str()));
    let mut pump = EventPump::new(&bytes, system_id);
    loop {
        let (location, event) = pump.next_event()?;
        match event {
            PumpEvent::Start(element) => return Ok(element.name),
            PumpEvent::Eof | PumpEvent::End => {
                return Err(pump.error_at(&location, "document has no root element"));
            }
            PumpEvent::Text(_) => {}
        }
    }
}

enum PumpEvent {
    Start(StartElement),
    End,
    Text(String),
    Eof,
}

struct EventPump<'a> {
    reader: NsReader<&'a [u8]>,
    bytes: &'a [u8],
    system_id: Option<Arc<str>>,
    lines: LineTracker,
    buf: Vec<u8>,
}

impl<'a> EventPump<'a> {
    fn new(bytes: &'a [u8], system_id: Option<Arc<str>>) -> Self {
        let mut reader = NsReader::from_reader(bytes);
        let config = reader.config_mut();
        config.expand_empty_elements = true;
        config.trim_text(false);
        Self {
            reader,
            bytes,
            system_id,
            lines: LineTracker::default(),
            buf: Vec::new(),
        }
    }

    fn location_at(&mut self, offset: usize) -> Location {
        let (line, column) = self.lines.advance(self.bytes, offset);
        Location::new(self.system_id.clone(), line, column)
    }

    fn error_at(&self, location: &Location, message: &str) -> ValidationError {
        parse_error(&self.system_id, location, message)
    }

    fn next_event(&mut self) -> Result<(Location, PumpEvent)> {
        loop {
            let offset = self.reader.buffer_position() as usize;
            let location = self.location_at(offset);
            self.buf.clear();
            let system_id = &self.system_id;
            let (resolved, event) = self
                .reader
                .read_resolved_event_into(&mut self.buf)
                .map_err(|e| parse_error(system_id, &location, &e.to_string()))?;
            let pump_event = match event {
                Event::Start(start) => {
                    let namespace = match resolved {
                        ResolveResult::Bound(ns) => utf8(ns.as_ref())?,
                        ResolveResult::Unbound => String::new(),
                        ResolveResult::Unknown(prefix) => {
                            return Err(unbound_prefix(system_id, &location, &prefix));
                        }
                    };
                    let local = utf8(start.local_name().as_ref())?;
                    let mut element = StartElement::new(QName::new(namespace, local));
                    for attr in start.attributes() {
                        let attr =
                            attr.map_err(|e| parse_error(system_id, &location, &e.to_string()))?;
                        push_attribute(&self.reader, system_id, &mut element, attr, &location)?;
                    }
                    PumpEvent::Start(element)
                }
                Event::End(_) => PumpEvent::End,
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| parse_error(system_id, &location, &e.to_string()))?;
                    PumpEvent::Text(text.into_owned())
                }
                Event::CData(cdata) => PumpEvent::Text(utf8(&cdata.into_inner())?),
                Event::Eof => PumpEvent::Eof,
                // Declarations, comments, processing instructions and doctypes carry no
                // structure for validation.
                _ => continue,
            };
            return Ok((location, pump_event));
        }
    }
}

fn push_attribute(
    reader: &NsReader<&[u8]>,
    system_id: &Option<Arc<str>>,
    element: &mut StartElement,
    attr: RawAttribute<'_>,
    location: &Location,
) -> Result<()> {
    let value = attr
        .unescape_value()
        .map_err(|e| parse_error(system_id, location, &e.to_string()))?
        .into_owned();
    if let Some(declaration) = attr.key.as_namespace_binding() {
        let prefix = match declaration {
            PrefixDeclaration::Default => None,
            PrefixDeclaration::Named(prefix) => Some(utf8(prefix)?),
        };
        element
            .namespace_declarations
            .push(NamespaceBinding { prefix, uri: value });
        return Ok(());
    }
    let (resolved, local) = reader.resolve_attribute(attr.key);
    let namespace = match resolved {
        ResolveResult::Bound(ns) => utf8(ns.as_ref())?,
        ResolveResult::Unbound => String::new(),
        ResolveResult::Unknown(prefix) if prefix == b"xml" => XML_NAMESPACE.to_string(),
        ResolveResult::Unknown(prefix) => {
            return Err(unbound_prefix(system_id, location, &prefix));
        }
    };
    element
        .attributes
        .push(Attribute::new(QName::new(namespace, utf8(local.as_ref())?), value));
    Ok(())
}

fn parse_error(system_id: &Option<Arc<str>>, location: &Location, message: &str) -> ValidationError {
    ValidationError::Parse {
        system_id: system_id.as_deref().unwrap_or("<memory>").to_string(),
        line: location.line,
        column: location.column,
        message: message.to_string(),
    }
}

fn unbound_prefix(system_id: &Option<Arc<str>>, location: &Location, prefix: &[u8]) -> ValidationError {
    let message = format!(
        "unbound namespace prefix '{}'",
        String::from_utf8_lossy(prefix)
    );
    parse_error(system_id, location, &message)
}

fn utf8(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| ValidationError::Parse {
            system_id: "<memory>".to_string(),
            line: 0,
            column: 0,
            message: format!("invalid UTF-8: {}", e),
        })
}

/// Incremental byte offset to (line, column) conversion; offsets only move forward. Columns
/// count characters, not bytes.
#[derive(Debug)]
struct LineTracker {
    scanned: usize,
    line: u64,
    line_start: usize,
}

impl Default for LineTracker {
    fn default() -> Self {
        Self {
            scanned: 0,
            line: 1,
            line_start: 0,
        }
    }
}

impl LineTracker {
    fn advance(&mut self, bytes: &[u8], offset: usize) -> (u64, u64) {
        let offset = offset.min(bytes.len());
        if offset > self.scanned {
            for (i, b) in bytes[self.scanned..offset].iter().enumerate() {
                if *b == b'\n' {
                    self.line += 1;
                    self.line_start = self.scanned + i + 1;
                }
            }
            self.scanned = offset;
        }
        let start = self.line_start.min(offset);
        let chars = bytes[start..offset]
            .iter()
            .filter(|b| (**b & 0xC0) != 0x80)
            .count();
        (self.line, chars as u64 + 1)
    }
}
