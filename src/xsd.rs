//! W3C XML Schema backend on top of libxml2.
//!
//! libxml2 validates whole documents, while the dispatcher hands a validator a stream of events
//! for one subtree. [`XsdValidator`] bridges the two: it re-serializes the subtree it receives
//! and runs libxml2 on it when the subtree's root ends. Element start tags are padded with
//! newlines so that libxml2's line numbers match the original document.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use indexmap::IndexMap;
use moka::sync::Cache;
use quick_xml::Writer;
use quick_xml::escape::escape;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use tracing::debug;
use url::Url;

use crate::error::{LibXml2Error, Result, ValidationError};
use crate::event::{ContentHandler, Location, QName, StartElement};
use crate::id_soundness::{IdType, IdTypeMap, IdTypeMapBuilder};
use crate::input::InputSource;
use crate::libxml2::{LibXml2Wrapper, StructuredError, ValidationResult, XmlSchemaPtr};
use crate::reader::{self, XML_NAMESPACE};
use crate::schema::{BEARER_LOCAL_NAME, BEARER_NAMESPACE, CompiledSchema, SchemaFactory, Validator};
use crate::sink::{Diagnostic, SharedSink, Severity};

pub const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";

/// Compiled schemas keyed by file path and modification time.
pub struct ParsedSchemaCache {
    cache: Cache<String, Arc<XsdSchema>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCacheStats {
    pub entry_count: u64,
}

impl ParsedSchemaCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub fn get(&self, key: &str) -> Option<Arc<XsdSchema>> {
        self.cache.get(key)
    }

    pub fn insert(&self, key: String, schema: Arc<XsdSchema>) {
        self.cache.insert(key, schema);
    }

    pub fn stats(&self) -> ParsedCacheStats {
        self.cache.run_pending_tasks();
        ParsedCacheStats {
            entry_count: self.cache.entry_count(),
        }
    }
}

/// Creates [`XsdSchema`]s from schema documents.
///
/// Schemas read from files are cached until the file changes; in-memory schemas are compiled
/// on every request.
pub struct XsdSchemaFactory {
    wrapper: LibXml2Wrapper,
    cache: ParsedSchemaCache,
}

impl Default for XsdSchemaFactory {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(24 * 3600))
    }
}

impl XsdSchemaFactory {
    pub fn new(max_schemas: u64, ttl: Duration) -> Self {
        Self {
            wrapper: LibXml2Wrapper::new(),
            cache: ParsedSchemaCache::new(max_schemas, ttl),
        }
    }

    pub fn cache_stats(&self) -> ParsedCacheStats {
        self.cache.stats()
    }

    fn cache_key(path: &Path) -> Result<String> {
        let modified = std::fs::metadata(path)?.modified()?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Ok(format!("{}@{}", path.display(), nanos))
    }

    fn report_all(
        sink: &SharedSink,
        errors: &[StructuredError],
        system_id: &str,
    ) -> Result<()> {
        for error in errors {
            let location = Location::new(
                Some(Arc::from(error.file.as_deref().unwrap_or(system_id))),
                error.line.unwrap_or(0),
                error.column.unwrap_or(0),
            );
            sink.report(Diagnostic {
                severity: if error.warning {
                    Severity::Warning
                } else {
                    Severity::Error
                },
                message: error.message.clone(),
                location: Some(location),
            })?;
        }
        Ok(())
    }
}

impl SchemaFactory for XsdSchemaFactory {
    fn create_schema(
        &self,
        source: &InputSource,
        sink: &SharedSink,
    ) -> Result<Arc<dyn CompiledSchema>> {
        let system_id = source.display_id();
        let mut errors = Vec::new();

        let (parsed, cache_key) = if let Some(bytes) = source.in_memory() {
            (self.wrapper.parse_schema_from_memory(bytes, &mut errors), None)
        } else if let Some(path) = source.file_path() {
            let key = Self::cache_key(&path)?;
            if let Some(schema) = self.cache.get(&key) {
                debug!(schema = %system_id, "compiled schema cache hit");
                return Ok(schema);
            }
            let path_str = path.to_str().ok_or_else(|| ValidationError::UnsupportedUri {
                uri: system_id.clone(),
                reason: "path is not valid UTF-8".to_string(),
            })?;
            (self.wrapper.parse_schema_from_url(path_str, &mut errors), Some(key))
        } else {
            // Neither bytes nor a local file: let read_bytes explain why.
            source.read_bytes()?;
            return Err(ValidationError::UnsupportedUri {
                uri: system_id,
                reason: "schema source cannot be read".to_string(),
            });
        };

        Self::report_all(sink, &errors, &system_id)?;
        let ptr = match parsed {
            Ok(ptr) => ptr,
            Err(LibXml2Error::SchemaParseFailed { .. }) => {
                return Err(ValidationError::IncorrectSchema { system_id });
            }
            Err(other) => return Err(other.into()),
        };

        let mut scanner = IdTypeScanner::default();
        reader::parse_source(source, &mut scanner)?;
        let id_type_map = scanner.finish();

        let schema = Arc::new(XsdSchema {
            ptr,
            id_type_map,
            system_id: system_id.clone(),
        });
        if let Some(key) = cache_key {
            self.cache.insert(key, Arc::clone(&schema));
        }
        debug!(schema = %system_id, id_types = schema.has_id_types(), "compiled schema");
        Ok(schema)
    }

    fn attributes_wrapper(&self, schema_uri: &Url, namespace: &str) -> Result<InputSource> {
        let location = match schema_uri.to_file_path() {
            Ok(path) if schema_uri.scheme() == "file" => path.display().to_string(),
            _ => schema_uri.to_string(),
        };
        let wrapper = format!(
            r#"<xs:schema xmlns:xs="{xs}" targetNamespace="{bearer_ns}" elementFormDefault="qualified">
  <xs:import namespace="{ns}" schemaLocation="{location}"/>
  <xs:element name="{bearer}">
    <xs:complexType>
      <xs:anyAttribute namespace="{ns}" processContents="strict"/>
    </xs:complexType>
  </xs:element>
</xs:schema>
"#,
            xs = XSD_NAMESPACE,
            bearer_ns = BEARER_NAMESPACE,
            bearer = BEARER_LOCAL_NAME,
            ns = escape(namespace),
            location = escape(location.as_str()),
        );
        Ok(InputSource::from_bytes(
            wrapper.into_bytes(),
            Some(schema_uri.clone()),
        ))
    }
}

#[derive(Debug)]
pub struct XsdSchema {
    ptr: XmlSchemaPtr,
    id_type_map: Option<Arc<IdTypeMap>>,
    system_id: String,
}

impl XsdSchema {
    pub fn system_id(&self) -> &str {
        &self.system_id
    }
}

impl CompiledSchema for XsdSchema {
    fn create_validator(&self, sink: SharedSink) -> Box<dyn Validator> {
        Box::new(XsdValidator::new(self.ptr.clone(), sink))
    }

    fn id_type_map(&self) -> Option<Arc<IdTypeMap>> {
        self.id_type_map.clone()
    }
}

/// Buffers one subtree and validates it with libxml2 when the subtree's root ends.
pub struct XsdValidator {
    schema: XmlSchemaPtr,
    wrapper: LibXml2Wrapper,
    sink: SharedSink,
    writer: Writer<Vec<u8>>,
    scanned: usize,
    output_line: u64,
    depth: usize,
    root: Option<Location>,
    columns: HashMap<u64, u64>,
    valid: bool,
}

impl XsdValidator {
    pub fn new(schema: XmlSchemaPtr, sink: SharedSink) -> Self {
        Self {
            schema,
            wrapper: LibXml2Wrapper::new(),
            sink,
            writer: Writer::new(Vec::new()),
            scanned: 0,
            output_line: 1,
            depth: 0,
            root: None,
            columns: HashMap::new(),
            valid: true,
        }
    }

    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| ValidationError::LibXml2Internal {
                details: format!("cannot serialize subtree: {}", e),
            })?;
        let written = &self.writer.get_ref()[self.scanned..];
        self.output_line += written.iter().filter(|b| **b == b'\n').count() as u64;
        self.scanned = self.writer.get_ref().len();
        Ok(())
    }

    /// Builds the inside of a start tag: name, padding up to `line`, namespace declarations
    /// and attributes. A subtree root also redeclares the prefixes inherited from outside the
    /// subtree, so QName values keep resolving.
    fn start_tag_content(&self, element: &StartElement, line: u64, subtree_root: bool) -> String {
        let mut content = element.name.local.clone();
        for _ in self.output_line..line {
            content.push('\n');
        }
        content.push_str(&format!(
            " xmlns=\"{}\"",
            escape(element.name.namespace.as_str())
        ));

        let inherited = element.in_scope_namespaces.iter().filter(|binding| {
            subtree_root
                && element
                    .namespace_declarations
                    .iter()
                    .all(|own| own.prefix != binding.prefix)
        });
        let mut prefixes: IndexMap<&str, String> = IndexMap::new();
        for binding in inherited.chain(&element.namespace_declarations) {
            if let Some(prefix) = &binding.prefix
                && prefix != "xml"
            {
                content.push_str(&format!(" xmlns:{}=\"{}\"", prefix, escape(binding.uri.as_str())));
                prefixes.entry(binding.uri.as_str()).or_insert_with(|| prefix.clone());
            }
        }

        let mut generated = 0usize;
        let mut attributes = String::new();
        let mut declarations = String::new();
        for attribute in &element.attributes {
            let namespace = attribute.name.namespace.as_str();
            let value = escape(attribute.value.as_str());
            let name = if namespace.is_empty() {
                attribute.name.local.clone()
            } else if namespace == XML_NAMESPACE {
                format!("xml:{}", attribute.name.local)
            } else {
                let prefix = match prefixes.get(namespace) {
                    Some(prefix) => prefix.clone(),
                    None => {
                        let prefix = loop {
                            let candidate = format!("_a{}", generated);
                            generated += 1;
                            if !prefixes.values().any(|p| *p == candidate) {
                                break candidate;
                            }
                        };
                        declarations.push_str(&format!(
                            " xmlns:{}=\"{}\"",
                            prefix,
                            escape(namespace)
                        ));
                        prefixes.insert(namespace, prefix.clone());
                        prefix
                    }
                };
                format!("{}:{}", prefix, attribute.name.local)
            };
            attributes.push_str(&format!(" {}=\"{}\"", name, value));
        }
        content.push_str(&declarations);
        content.push_str(&attributes);
        content
    }

    fn finish(&mut self) -> Result<()> {
        let document = std::mem::take(self.writer.get_mut());
        self.scanned = 0;
        self.output_line = 1;
        let root = self.root.take().unwrap_or_default();
        let columns = std::mem::take(&mut self.columns);

        let result = self
            .wrapper
            .validate_memory(&self.schema, &document, root.system_id.as_deref())?;
        if let ValidationResult::Invalid { error_count, errors } = result {
            self.valid = false;
            if errors.is_empty() {
                self.sink.report(Diagnostic::error(
                    format!("{} schema validity errors", error_count),
                    Some(&root),
                ))?;
            }
            for error in errors {
                let line = error.line.unwrap_or(root.line);
                let location = Location::new(
                    root.system_id.clone(),
                    line,
                    columns.get(&line).copied().unwrap_or(root.column),
                );
                let diagnostic = if error.warning {
                    Diagnostic::warning(error.message, Some(&location))
                } else {
                    Diagnostic::error(error.message, Some(&location))
                };
                self.sink.report(diagnostic)?;
            }
        }
        Ok(())
    }
}

impl ContentHandler for XsdValidator {
    fn start_document(&mut self) -> Result<()> {
        self.reset();
        Ok(())
    }

    fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        let subtree_root = self.depth == 0;
        if subtree_root {
            self.root = Some(location.clone());
        }
        self.depth += 1;
        self.columns.entry(location.line).or_insert(location.column);
        let content = self.start_tag_content(element, location.line, subtree_root);
        let name_len = element.name.local.len();
        self.write(Event::Start(BytesStart::from_content(content, name_len)))
    }

    fn end_element(&mut self, name: &QName, _location: &Location) -> Result<()> {
        if self.depth == 0 {
            return Ok(());
        }
        self.write(Event::End(BytesEnd::new(name.local.as_str())))?;
        self.depth -= 1;
        if self.depth == 0 {
            self.finish()?;
        }
        Ok(())
    }

    fn characters(&mut self, text: &str, _location: &Location) -> Result<()> {
        if self.depth == 0 {
            return Ok(());
        }
        self.write(Event::Text(BytesText::new(text)))
    }
}

impl Validator for XsdValidator {
    fn is_valid_so_far(&self) -> bool {
        self.valid
    }

    fn reset(&mut self) {
        self.writer.get_mut().clear();
        self.scanned = 0;
        self.output_line = 1;
        self.depth = 0;
        self.root = None;
        self.columns.clear();
        self.valid = true;
    }
}

/// Finds attributes declared with the built-in `ID`, `IDREF` and `IDREFS` types.
///
/// Attributes declared inside an element declaration are keyed to that element; those declared
/// globally, in named types or in attribute groups apply to any element. Included and imported
/// schema documents are not followed.
#[derive(Default)]
struct IdTypeScanner {
    builder: IdTypeMapBuilder,
    target_namespace: String,
    element_form_qualified: bool,
    attribute_form_qualified: bool,
    prefixes: Vec<Vec<(Option<String>, String)>>,
    /// One entry per open XSD element: the element declaration it opens, if any.
    declarations: Vec<Option<QName>>,
    depth: usize,
}

impl IdTypeScanner {
    fn resolve_prefix(&self, prefix: Option<&str>) -> Option<&str> {
        self.prefixes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter())
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn builtin_id_type(&self, type_name: &str) -> Option<IdType> {
        let (prefix, local) = match type_name.trim().split_once(':') {
            Some((prefix, local)) => (Some(prefix), local),
            None => (None, type_name.trim()),
        };
        if self.resolve_prefix(prefix) != Some(XSD_NAMESPACE) {
            return None;
        }
        match local {
            "ID" => Some(IdType::Id),
            "IDREF" => Some(IdType::IdRef),
            "IDREFS" => Some(IdType::IdRefs),
            _ => None,
        }
    }

    fn qualified(&self, local: &str, form: Option<&str>, default_qualified: bool, global: bool) -> QName {
        let qualified = global
            || match form {
                Some(form) => form == "qualified",
                None => default_qualified,
            };
        if qualified {
            QName::new(self.target_namespace.clone(), local)
        } else {
            QName::local(local)
        }
    }

    fn finish(self) -> Option<Arc<IdTypeMap>> {
        let map = self.builder.build();
        (!map.is_empty()).then(|| Arc::new(map))
    }
}

impl ContentHandler for IdTypeScanner {
    fn start_element(&mut self, element: &StartElement, _location: &Location) -> Result<()> {
        self.prefixes.push(
            element
                .namespace_declarations
                .iter()
                .map(|b| (b.prefix.clone(), b.uri.clone()))
                .collect(),
        );
        let global = self.depth == 1;
        self.depth += 1;
        if element.name.namespace != XSD_NAMESPACE {
            self.declarations.push(None);
            return Ok(());
        }

        let mut declaration = None;
        match element.name.local.as_str() {
            "schema" if self.depth == 1 => {
                self.target_namespace = element
                    .attribute("", "targetNamespace")
                    .unwrap_or_default()
                    .to_string();
                self.element_form_qualified =
                    element.attribute("", "elementFormDefault") == Some("qualified");
                self.attribute_form_qualified =
                    element.attribute("", "attributeFormDefault") == Some("qualified");
            }
            "element" => {
                if let Some(name) = element.attribute("", "name") {
                    declaration = Some(self.qualified(
                        name,
                        element.attribute("", "form"),
                        self.element_form_qualified,
                        global,
                    ));
                }
            }
            "attribute" => {
                if let (Some(name), Some(type_name)) =
                    (element.attribute("", "name"), element.attribute("", "type"))
                    && let Some(id_type) = self.builtin_id_type(type_name)
                {
                    let attribute = self.qualified(
                        name,
                        element.attribute("", "form"),
                        self.attribute_form_qualified,
                        global,
                    );
                    let owner = self.declarations.iter().rev().flatten().next().cloned();
                    self.builder.insert(owner, attribute, id_type);
                }
            }
            _ => {}
        }
        self.declarations.push(declaration);
        Ok(())
    }

    fn end_element(&mut self, _name: &QName, _location: &Location) -> Result<()> {
        self.prefixes.pop();
        self.declarations.pop();
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }
}
