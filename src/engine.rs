//! Schema loading and document validation.
//!
//! The engine holds at most one loaded schema. A rules document (recognised by the namespace
//! of its root element) is compiled into a [`ModalSchema`]; anything else goes to the
//! [`SchemaFactory`]. Loading publishes an immutable snapshot, so concurrent validations keep
//! using the schema they started with while a reload is in progress.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Result, ValidationError};
use crate::event::SplitHandler;
use crate::id_soundness::{IdSoundnessChecker, IdTypeMap};
use crate::input::InputSource;
use crate::modal_validator::ModalSchema;
use crate::reader;
use crate::rules_compiler::{RULES_NAMESPACE, RulesCompiler};
use crate::schema::{CompiledSchema, SchemaFactory, Validator};
use crate::sink::{FailFastSink, SharedSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Check ID/IDREF soundness for schemas that declare identifier attributes.
    pub check_id_idref: bool,
    /// Stop each validation at its first error.
    pub fail_fast: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            check_id_idref: true,
            fail_fast: false,
        }
    }
}

/// A successfully loaded schema.
#[derive(Debug)]
pub struct LoadedSchema {
    system_id: String,
    schema: Arc<dyn CompiledSchema>,
    id_type_map: Option<Arc<IdTypeMap>>,
}

impl LoadedSchema {
    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn schema(&self) -> &Arc<dyn CompiledSchema> {
        &self.schema
    }

    /// Present only when ID checking is enabled and the schema declares identifier attributes.
    pub fn id_type_map(&self) -> Option<&Arc<IdTypeMap>> {
        self.id_type_map.as_ref()
    }

    fn checker(&self, sink: &SharedSink) -> Option<IdSoundnessChecker> {
        self.id_type_map
            .as_ref()
            .map(|map| IdSoundnessChecker::new(Arc::clone(map), Arc::clone(sink)))
    }
}

/// Validator kept between calls of [`ValidationEngine::validate`].
struct ReusableValidator {
    loaded: Arc<LoadedSchema>,
    validator: Box<dyn Validator>,
    checker: Option<IdSoundnessChecker>,
}

pub struct ValidationEngine {
    factory: Arc<dyn SchemaFactory>,
    sink: SharedSink,
    options: EngineOptions,
    loaded: ArcSwapOption<LoadedSchema>,
    reusable: Mutex<Option<ReusableValidator>>,
}

impl ValidationEngine {
    /// Creates an engine with nothing loaded. Diagnostics from loading and from
    /// [`validate`](Self::validate) go to `sink`.
    pub fn new(factory: Arc<dyn SchemaFactory>, sink: SharedSink, options: EngineOptions) -> Self {
        Self {
            factory,
            sink,
            options,
            loaded: ArcSwapOption::empty(),
            reusable: Mutex::new(None),
        }
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// The schema currently in use, if any.
    pub fn loaded_schema(&self) -> Option<Arc<LoadedSchema>> {
        self.loaded.load_full()
    }

    /// Compiles the schema behind `source` and makes it the current schema.
    ///
    /// Returns `Ok(false)` when the schema is incorrect; its problems have been reported and the
    /// previously loaded schema stays in place. I/O errors and malformed input are returned as
    /// errors, also without touching the current schema.
    pub fn load_schema(&self, source: &InputSource) -> Result<bool> {
        let system_id = source.display_id();
        let root = reader::root_element_name(source)?;
        let compiled = if root.namespace == RULES_NAMESPACE {
            debug!(rules = %system_id, "compiling namespace dispatch rules");
            RulesCompiler::compile(source, self.factory.as_ref(), Arc::clone(&self.sink))
                .map(|table| Arc::new(ModalSchema::new(table)) as Arc<dyn CompiledSchema>)
        } else {
            debug!(schema = %system_id, root = %root, "compiling schema");
            self.factory.create_schema(source, &self.sink)
        };

        let schema = match compiled {
            Ok(schema) => schema,
            Err(e) if e.is_incorrect_schema() => {
                info!(schema = %system_id, "schema is incorrect, keeping previous schema");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        self.install(system_id, schema);
        Ok(true)
    }

    /// Makes an already compiled schema the current one.
    pub fn install(&self, system_id: impl Into<String>, schema: Arc<dyn CompiledSchema>) {
        let id_type_map = if self.options.check_id_idref {
            schema.id_type_map().filter(|map| !map.is_empty())
        } else {
            None
        };
        let loaded = LoadedSchema {
            system_id: system_id.into(),
            schema,
            id_type_map,
        };
        debug!(
            schema = %loaded.system_id,
            id_check = loaded.id_type_map.is_some(),
            "schema loaded"
        );
        self.loaded.store(Some(Arc::new(loaded)));
    }

    /// Validates one document, reusing the validator of the previous call while the schema is
    /// unchanged. Calls are serialized; use [`validate_concurrent`](Self::validate_concurrent)
    /// from several threads.
    pub fn validate(&self, source: &InputSource) -> Result<bool> {
        let loaded = self.snapshot()?;
        let mut reusable = self.reusable.lock();
        let current = match reusable.take() {
            Some(mut kept) if Arc::ptr_eq(&kept.loaded, &loaded) => {
                kept.validator.reset();
                kept
            }
            _ => {
                let sink = self.call_sink(Arc::clone(&self.sink));
                ReusableValidator {
                    validator: loaded.schema.create_validator(Arc::clone(&sink)),
                    checker: loaded.checker(&sink),
                    loaded,
                }
            }
        };
        let current = reusable.insert(current);
        self.finish(run(
            source,
            current.validator.as_mut(),
            current.checker.as_mut(),
        ))
    }

    /// Validates one document with a private validator, reporting to the engine's sink.
    pub fn validate_concurrent(&self, source: &InputSource) -> Result<bool> {
        self.validate_concurrent_with_sink(source, Arc::clone(&self.sink))
    }

    /// Validates one document with a private validator, reporting to `sink`.
    pub fn validate_concurrent_with_sink(
        &self,
        source: &InputSource,
        sink: SharedSink,
    ) -> Result<bool> {
        let loaded = self.snapshot()?;
        let sink = self.call_sink(sink);
        let mut validator = loaded.schema.create_validator(Arc::clone(&sink));
        let mut checker = loaded.checker(&sink);
        self.finish(run(source, validator.as_mut(), checker.as_mut()))
    }

    fn snapshot(&self) -> Result<Arc<LoadedSchema>> {
        self.loaded.load_full().ok_or(ValidationError::NoSchemaLoaded)
    }

    fn call_sink(&self, sink: SharedSink) -> SharedSink {
        if self.options.fail_fast {
            Arc::new(FailFastSink::new(sink))
        } else {
            sink
        }
    }

    /// A fail-fast stop is an invalid document, not a failed call.
    fn finish(&self, result: Result<bool>) -> Result<bool> {
        match result {
            Err(ValidationError::Aborted { .. }) if self.options.fail_fast => Ok(false),
            other => other,
        }
    }
}

/// Runs one document through `validator`, teeing events into `checker` when ID checking is on.
fn run(
    source: &InputSource,
    validator: &mut dyn Validator,
    checker: Option<&mut IdSoundnessChecker>,
) -> Result<bool> {
    match checker {
        Some(checker) => {
            let mut split = SplitHandler::new(&mut *validator, &mut *checker);
            reader::parse_source(source, &mut split)?;
            Ok(validator.is_valid_so_far() && checker.is_valid_so_far())
        }
        None => {
            reader::parse_source(source, validator)?;
            Ok(validator.is_valid_so_far())
        }
    }
}
