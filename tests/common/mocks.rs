use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use url::Url;

use validate_ns::error::Result;
use validate_ns::schema::{BEARER_NAMESPACE, CompiledSchema, SchemaFactory, Validator};
use validate_ns::{
    ContentHandler, Diagnostic, IdTypeMap, InputSource, Location, QName, SharedSink, StartElement,
    ValidationError,
};

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Two-phase rendezvous between a validating thread and the test thread.
#[derive(Default)]
pub struct Gate {
    state: Mutex<(bool, bool)>,
    changed: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter_and_wait(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        self.changed.notify_all();
        while !state.1 {
            state = self.changed.wait(state).unwrap();
        }
    }

    /// Blocks until a validator has reached the gate.
    pub fn wait_entered(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.0 {
            state = self.changed.wait(state).unwrap();
        }
    }

    pub fn open(&self) {
        let mut state = self.state.lock().unwrap();
        state.1 = true;
        self.changed.notify_all();
    }
}

/// Accepts elements in its namespaces (and the attribute bearer), rejects everything else,
/// any element named `bad` and any attribute whose value is `bad`. Logs every event as
/// `name:start:{ns}local` / `name:end:{ns}local`.
#[derive(Debug)]
pub struct RecordingSchema {
    pub name: String,
    pub namespaces: Vec<String>,
    pub log: EventLog,
    pub id_map: Option<Arc<IdTypeMap>>,
    pub gate: Option<Arc<Gate>>,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Gate")
    }
}

impl RecordingSchema {
    pub fn new(name: &str, namespaces: &[&str], log: &EventLog) -> Self {
        Self {
            name: name.to_string(),
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            log: Arc::clone(log),
            id_map: None,
            gate: None,
        }
    }

    pub fn with_ids(mut self, map: IdTypeMap) -> Self {
        self.id_map = Some(Arc::new(map));
        self
    }

    /// The first element of every document waits at `gate`.
    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn shared(self) -> Arc<dyn CompiledSchema> {
        Arc::new(self)
    }
}

impl CompiledSchema for RecordingSchema {
    fn create_validator(&self, sink: SharedSink) -> Box<dyn Validator> {
        Box::new(RecordingValidator {
            name: self.name.clone(),
            namespaces: self.namespaces.clone(),
            log: Arc::clone(&self.log),
            gate: self.gate.clone(),
            sink,
            valid: true,
            seen_element: false,
        })
    }

    fn id_type_map(&self) -> Option<Arc<IdTypeMap>> {
        self.id_map.clone()
    }
}

pub struct RecordingValidator {
    name: String,
    namespaces: Vec<String>,
    log: EventLog,
    gate: Option<Arc<Gate>>,
    sink: SharedSink,
    valid: bool,
    seen_element: bool,
}

impl RecordingValidator {
    fn reject(&mut self, message: String, location: &Location) -> Result<()> {
        self.valid = false;
        self.sink.report(Diagnostic::error(message, Some(location)))
    }
}

impl ContentHandler for RecordingValidator {
    fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        if !self.seen_element {
            self.seen_element = true;
            if let Some(gate) = &self.gate {
                gate.enter_and_wait();
            }
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:start:{}", self.name, element.name));

        let known = self.namespaces.contains(&element.name.namespace)
            || element.name.namespace == BEARER_NAMESPACE;
        if !known || element.name.local == "bad" {
            self.reject(
                format!("{} does not allow {}", self.name, element.name),
                location,
            )?;
        }
        for attribute in &element.attributes {
            if attribute.value == "bad" {
                self.reject(
                    format!("{} rejects attribute {}", self.name, attribute.name),
                    location,
                )?;
            }
        }
        Ok(())
    }

    fn end_element(&mut self, name: &QName, _location: &Location) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:end:{}", self.name, name));
        Ok(())
    }
}

impl Validator for RecordingValidator {
    fn is_valid_so_far(&self) -> bool {
        self.valid
    }

    fn reset(&mut self) {
        self.valid = true;
        self.seen_element = false;
    }
}

/// Serves schemas registered by URI. Unknown URIs are I/O errors; URIs registered as broken
/// report one error and fail to compile.
#[derive(Default)]
pub struct MapFactory {
    schemas: HashMap<String, Arc<dyn CompiledSchema>>,
    broken: Vec<String>,
    pub requests: Mutex<Vec<String>>,
}

impl MapFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, uri: &str, schema: Arc<dyn CompiledSchema>) -> Self {
        self.schemas.insert(uri.to_string(), schema);
        self
    }

    pub fn with_attributes(self, uri: &str, namespace: &str, schema: Arc<dyn CompiledSchema>) -> Self {
        let key = attributes_key(uri, namespace);
        self.with(&key, schema)
    }

    pub fn with_broken(mut self, uri: &str) -> Self {
        self.broken.push(uri.to_string());
        self
    }
}

fn attributes_key(uri: &str, namespace: &str) -> String {
    format!("{}#attributes={}", uri, namespace)
}

impl SchemaFactory for MapFactory {
    fn create_schema(
        &self,
        source: &InputSource,
        sink: &SharedSink,
    ) -> Result<Arc<dyn CompiledSchema>> {
        let uri = source.display_id();
        self.requests.lock().unwrap().push(uri.clone());
        if self.broken.contains(&uri) {
            sink.report(Diagnostic::error(format!("broken schema {}", uri), None))?;
            return Err(ValidationError::IncorrectSchema { system_id: uri });
        }
        self.schemas.get(&uri).cloned().ok_or_else(|| {
            ValidationError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no schema registered for {}", uri),
            ))
        })
    }

    fn attributes_wrapper(&self, schema_uri: &Url, namespace: &str) -> Result<InputSource> {
        let key = attributes_key(schema_uri.as_str(), namespace);
        Ok(InputSource::from_uri(Url::parse(&key)?))
    }
}
