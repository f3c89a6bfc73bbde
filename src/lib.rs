//! # validate-ns
//!
//! Validates XML documents that mix several namespaces. A rules document maps each namespace to
//! the XML Schema that governs it, optionally switching between named modes; documents are
//! split into namespace sections on the fly and every section is checked by its own schema.
//! Plain XSD validation and ID/IDREF soundness checking come along with it.

pub mod batch;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod file_discovery;
pub mod id_soundness;
pub mod input;
pub mod libxml2;
pub mod modal_validator;
pub mod mode_table;
pub mod output;
pub mod reader;
pub mod rules_compiler;
pub mod schema;
pub mod sink;
pub mod xsd;

pub use batch::{
    BatchConfig, BatchValidator, FileValidationResult, ValidationResults, ValidationStatus,
};
pub use engine::{EngineOptions, LoadedSchema, ValidationEngine};
pub use error::{LibXml2Error, ValidationError};
pub use event::{ContentHandler, Location, QName, SplitHandler, StartElement};
pub use id_soundness::{IdSoundnessChecker, IdType, IdTypeMap};
pub use input::InputSource;
pub use modal_validator::{ModalSchema, ModalValidator};
pub use mode_table::{ElementAction, Mode, ModeTable};
pub use rules_compiler::{RULES_NAMESPACE, RulesCompiler};
pub use schema::{CompiledSchema, SchemaFactory, Validator};
pub use sink::{
    CollectingSink, Diagnostic, ErrorSink, FailFastSink, NullSink, SharedSink, Severity,
    TracingSink,
};
pub use xsd::{XsdSchema, XsdSchemaFactory};
