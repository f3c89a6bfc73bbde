//! Capabilities every schema backend provides.
//!
//! A [`CompiledSchema`] is immutable and shared across threads; each validation call asks it for
//! a private [`Validator`]. A [`SchemaFactory`] turns a schema document into a compiled schema.

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::error::Result;
use crate::event::ContentHandler;
use crate::id_soundness::IdTypeMap;
use crate::input::InputSource;
use crate::sink::SharedSink;

/// Namespace of the synthesized element that carries a standalone attribute set.
pub const BEARER_NAMESPACE: &str = "http://www.thaiopensource.com/ns/mns/instance";
pub const BEARER_LOCAL_NAME: &str = "attributesBearer";

/// Per-call validation state fed by structural events.
pub trait Validator: ContentHandler + Send {
    /// False once any violation has been reported.
    fn is_valid_so_far(&self) -> bool;

    /// Returns to the state of a freshly created validator so it can take another document.
    fn reset(&mut self);
}

impl<V: Validator + ?Sized> Validator for Box<V> {
    fn is_valid_so_far(&self) -> bool {
        (**self).is_valid_so_far()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

pub trait CompiledSchema: Send + Sync + fmt::Debug {
    /// Creates a validator that reports violations to `sink`.
    fn create_validator(&self, sink: SharedSink) -> Box<dyn Validator>;

    /// Static identifier typing of attributes, when the schema declares any.
    fn id_type_map(&self) -> Option<Arc<IdTypeMap>> {
        None
    }

    fn has_id_types(&self) -> bool {
        self.id_type_map().is_some_and(|map| !map.is_empty())
    }
}

pub trait SchemaFactory: Send + Sync {
    /// Compiles the schema document behind `source`.
    ///
    /// Semantic problems are reported to `sink` and end in
    /// [`ValidationError::IncorrectSchema`](crate::error::ValidationError::IncorrectSchema); I/O
    /// and malformed input come back as the corresponding aborting errors.
    fn create_schema(&self, source: &InputSource, sink: &SharedSink)
    -> Result<Arc<dyn CompiledSchema>>;

    /// A schema document whose single element, [`BEARER_LOCAL_NAME`] in [`BEARER_NAMESPACE`],
    /// accepts exactly the attributes in `namespace` that the schema at `schema_uri` declares.
    fn attributes_wrapper(&self, schema_uri: &Url, namespace: &str) -> Result<InputSource>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Small in-memory backend for unit tests.

    use std::sync::Arc;

    use indexmap::{IndexMap, IndexSet};
    use parking_lot::Mutex;
    use url::Url;

    use super::{BEARER_NAMESPACE, CompiledSchema, SchemaFactory, Validator};
    use crate::error::{Result, ValidationError};
    use crate::event::{ContentHandler, Location, QName, StartElement};
    use crate::id_soundness::IdTypeMap;
    use crate::input::InputSource;
    use crate::sink::{Diagnostic, SharedSink};

    pub type EventLog = Arc<Mutex<Vec<String>>>;

    /// Accepts elements in its own namespaces, rejects everything else and any element named
    /// `bad`. Every event it sees is appended to a shared log as `name:start:{ns}local`.
    #[derive(Debug)]
    pub struct MockSchema {
        pub name: String,
        pub namespaces: IndexSet<String>,
        pub log: EventLog,
        pub id_map: Option<Arc<IdTypeMap>>,
    }

    impl MockSchema {
        pub fn new(name: &str, namespaces: &[&str], log: &EventLog) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
                log: Arc::clone(log),
                id_map: None,
            })
        }
    }

    impl CompiledSchema for MockSchema {
        fn create_validator(&self, sink: SharedSink) -> Box<dyn Validator> {
            Box::new(MockValidator {
                name: self.name.clone(),
                namespaces: self.namespaces.clone(),
                log: Arc::clone(&self.log),
                sink,
                valid: true,
            })
        }

        fn id_type_map(&self) -> Option<Arc<IdTypeMap>> {
            self.id_map.clone()
        }
    }

    pub struct MockValidator {
        name: String,
        namespaces: IndexSet<String>,
        log: EventLog,
        sink: SharedSink,
        valid: bool,
    }

    impl ContentHandler for MockValidator {
        fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()> {
            self.log
                .lock()
                .push(format!("{}:start:{}", self.name, element.name));
            let allowed = (self.namespaces.contains(&element.name.namespace)
                || element.name.namespace == BEARER_NAMESPACE)
                && element.name.local != "bad";
            if !allowed {
                self.valid = false;
                self.sink.report(Diagnostic::error(
                    format!("{} does not allow {}", self.name, element.name),
                    Some(location),
                ))?;
            }
            for attribute in &element.attributes {
                if attribute.value == "bad" {
                    self.valid = false;
                    self.sink.report(Diagnostic::error(
                        format!("{} rejects attribute {}", self.name, attribute.name),
                        Some(location),
                    ))?;
                }
            }
            Ok(())
        }

        fn end_element(&mut self, name: &QName, _location: &Location) -> Result<()> {
            self.log.lock().push(format!("{}:end:{}", self.name, name));
            Ok(())
        }

        fn end_document(&mut self, _location: &Location) -> Result<()> {
            self.log.lock().push(format!("{}:end-document", self.name));
            Ok(())
        }
    }

    impl Validator for MockValidator {
        fn is_valid_so_far(&self) -> bool {
            self.valid
        }

        fn reset(&mut self) {
            self.valid = true;
        }
    }

    /// Resolves schema URIs from a fixed table; unknown URIs are I/O errors, URIs registered as
    /// incorrect fail to compile.
    #[derive(Default)]
    pub struct MockFactory {
        pub schemas: IndexMap<String, Arc<dyn CompiledSchema>>,
        pub incorrect: IndexSet<String>,
        pub compiled: Mutex<Vec<String>>,
    }

    impl MockFactory {
        pub fn with(mut self, uri: &str, schema: Arc<dyn CompiledSchema>) -> Self {
            self.schemas.insert(uri.to_string(), schema);
            self
        }

        pub fn with_attributes(self, uri: &str, ns: &str, schema: Arc<dyn CompiledSchema>) -> Self {
            let key = wrapper_key(uri, ns);
            self.with(&key, schema)
        }

        pub fn with_incorrect(mut self, uri: &str) -> Self {
            self.incorrect.insert(uri.to_string());
            self
        }
    }

    fn wrapper_key(uri: &str, ns: &str) -> String {
        format!("{}#attributes={}", uri, ns)
    }

    impl SchemaFactory for MockFactory {
        fn create_schema(
            &self,
            source: &InputSource,
            sink: &SharedSink,
        ) -> Result<Arc<dyn CompiledSchema>> {
            let uri = source.display_id();
            self.compiled.lock().push(uri.clone());
            if self.incorrect.contains(&uri) {
                sink.report(Diagnostic::error(format!("cannot compile {}", uri), None))?;
                return Err(ValidationError::IncorrectSchema { system_id: uri });
            }
            self.schemas.get(&uri).cloned().ok_or_else(|| {
                ValidationError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such schema: {}", uri),
                ))
            })
        }

        fn attributes_wrapper(&self, schema_uri: &Url, namespace: &str) -> Result<InputSource> {
            let key = wrapper_key(schema_uri.as_str(), namespace);
            Ok(InputSource::from_uri(Url::parse(&key)?))
        }
    }
}
