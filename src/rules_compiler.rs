//! Compiles a rules document into a [`ModeTable`].
//!
//! The compiler consumes the rules document as a stream. Problems with the rules themselves are
//! reported to the sink and accumulated, so one pass surfaces all of them; only I/O failures and
//! malformed XML stop the compile early.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;
use url::Url;

use crate::error::{Result, ValidationError};
use crate::event::{ContentHandler, Location, QName, StartElement};
use crate::input::{self, BaseUriStack, InputSource};
use crate::mode_table::{ActionId, DEFAULT_MODE, ModeId, ModeTable, ModeTableBuilder};
use crate::reader::{self, XML_NAMESPACE};
use crate::schema::{CompiledSchema, SchemaFactory};
use crate::sink::{Diagnostic, SharedSink};

pub const RULES_NAMESPACE: &str = "http://www.thaiopensource.com/ns/mns";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleElement {
    Rules,
    Strict,
    Lax,
    ValidateElements,
    ValidateAttributes,
    Cover,
}

impl RuleElement {
    fn from_local_name(local: &str) -> Option<Self> {
        match local {
            "rules" => Some(Self::Rules),
            "strict" => Some(Self::Strict),
            "lax" => Some(Self::Lax),
            "validateElements" => Some(Self::ValidateElements),
            "validateAttributes" => Some(Self::ValidateAttributes),
            "cover" => Some(Self::Cover),
            _ => None,
        }
    }

    fn allowed_under(self, parent: Option<RuleElement>) -> bool {
        match self {
            Self::Rules => parent.is_none(),
            Self::Cover => parent == Some(Self::ValidateElements),
            _ => parent == Some(Self::Rules),
        }
    }
}

/// Child schemas compiled so far in this rules document, keyed by resolved URI and, for
/// attribute rules, by the wrapped namespace.
type SchemaKey = (Url, Option<String>);

pub struct RulesCompiler<'a> {
    factory: &'a dyn SchemaFactory,
    sink: SharedSink,
    builder: ModeTableBuilder,
    base: BaseUriStack,
    foreign_depth: usize,
    open: Vec<RuleElement>,
    current_action: Option<ActionId>,
    schemas: IndexMap<SchemaKey, Arc<dyn CompiledSchema>>,
    incorrect: IndexSet<SchemaKey>,
    had_error: bool,
}

impl<'a> RulesCompiler<'a> {
    pub fn new(factory: &'a dyn SchemaFactory, sink: SharedSink, document_uri: Option<Url>) -> Self {
        Self {
            factory,
            sink,
            builder: ModeTableBuilder::new(),
            base: BaseUriStack::new(document_uri),
            foreign_depth: 0,
            open: Vec::new(),
            current_action: None,
            schemas: IndexMap::new(),
            incorrect: IndexSet::new(),
            had_error: false,
        }
    }

    /// Compiles the rules document behind `source`.
    ///
    /// Returns [`ValidationError::IncorrectSchema`] after reporting every problem found.
    pub fn compile(
        source: &InputSource,
        factory: &dyn SchemaFactory,
        sink: SharedSink,
    ) -> Result<ModeTable> {
        let mut compiler = RulesCompiler::new(factory, sink, source.system_id().cloned());
        reader::parse_source(source, &mut compiler)?;
        compiler.check_valid(&source.display_id())
    }

    /// Reports modes that were used but never defined, then turns the accumulated errors into
    /// the compile result.
    pub fn check_valid(mut self, system_id: &str) -> Result<ModeTable> {
        let undefined: Vec<(String, Option<Location>)> = self
            .builder
            .undefined_modes()
            .map(|mode| (mode.name().to_string(), mode.first_reference().cloned()))
            .collect();
        for (name, location) in undefined {
            self.error(format!("undefined mode: {}", name), location.as_ref())?;
        }
        if self.had_error {
            return Err(ValidationError::IncorrectSchema {
                system_id: system_id.to_string(),
            });
        }
        let table = self.builder.build();
        debug!(
            rules = system_id,
            modes = table.modes().count(),
            schemas = self.schemas.len(),
            "compiled rules document"
        );
        Ok(table)
    }

    fn error(&mut self, message: String, location: Option<&Location>) -> Result<()> {
        self.had_error = true;
        self.sink.report(Diagnostic::error(message, location))
    }

    fn rule_modes(&mut self, element: &StartElement) -> Vec<(ModeId, String)> {
        let names: Vec<String> = match element.attribute("", "modes") {
            Some(value) => value.split_whitespace().map(str::to_string).collect(),
            None => vec![DEFAULT_MODE.to_string()],
        };
        names
            .into_iter()
            .map(|name| {
                let id = self.builder.mode(&name);
                self.builder.define(id);
                (id, name)
            })
            .collect()
    }

    fn required<'e>(
        &mut self,
        element: &'e StartElement,
        name: &str,
        location: &Location,
    ) -> Result<Option<&'e str>> {
        let value = element.attribute("", name);
        if value.is_none() {
            self.error(
                format!(
                    "element \"{}\" is missing required attribute \"{}\"",
                    element.name.local, name
                ),
                Some(location),
            )?;
        }
        Ok(value)
    }

    fn start_rule(
        &mut self,
        rule: RuleElement,
        element: &StartElement,
        location: &Location,
    ) -> Result<()> {
        match rule {
            RuleElement::Rules => {
                if let Some(name) = element.attribute("", "startMode") {
                    let id = self.builder.reference(name, location);
                    self.builder.set_start_mode(id);
                }
                Ok(())
            }
            RuleElement::Strict | RuleElement::Lax => {
                let strict = rule == RuleElement::Strict;
                for (id, name) in self.rule_modes(element) {
                    if !self.builder.set_strict(id, strict) {
                        self.error(
                            format!("strict or lax already specified for mode \"{}\"", name),
                            Some(location),
                        )?;
                    }
                }
                Ok(())
            }
            RuleElement::ValidateElements => self.element_rule(element, location),
            RuleElement::ValidateAttributes => self.attribute_rule(element, location),
            RuleElement::Cover => {
                let Some(ns) = self.required(element, "ns", location)? else {
                    return Ok(());
                };
                if !ns.is_empty() && !input::is_absolute_uri(ns) {
                    self.error(
                        format!("namespace URI \"{}\" must be absolute", ns),
                        Some(location),
                    )?;
                }
                // No action means the enclosing rule already failed.
                if let Some(action) = self.current_action {
                    self.builder.cover(action, ns);
                }
                Ok(())
            }
        }
    }

    fn element_rule(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        let modes = self.rule_modes(element);
        let use_mode = element.attribute("", "useMode").unwrap_or(DEFAULT_MODE);
        let target = self.builder.reference(use_mode, location);
        let prune = element
            .attribute("", "prune")
            .is_some_and(|value| value.trim() == "true");

        let Some(ns) = self.required(element, "ns", location)? else {
            return Ok(());
        };
        if !ns.is_empty() && !input::is_absolute_uri(ns) {
            self.error(
                format!("namespace URI \"{}\" must be absolute", ns),
                Some(location),
            )?;
        }
        let Some(uri) = self.schema_uri(element, location)? else {
            return Ok(());
        };
        let source = InputSource::from_uri(uri.clone());
        let Some(schema) = self.load_schema((uri, None), &source)? else {
            return Ok(());
        };

        let action = self.builder.add_action(ns, schema, target, prune);
        self.current_action = Some(action);
        for (mode, name) in modes {
            if !self.builder.bind_element(mode, ns, action) {
                self.error(
                    format!(
                        "multiple element validation rules for namespace \"{}\" in mode \"{}\"",
                        ns, name
                    ),
                    Some(location),
                )?;
            }
        }
        Ok(())
    }

    fn attribute_rule(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        let modes = self.rule_modes(element);
        let Some(ns) = self.required(element, "ns", location)? else {
            return Ok(());
        };
        if !input::is_absolute_uri(ns) {
            self.error(
                format!("namespace URI \"{}\" must be absolute", ns),
                Some(location),
            )?;
        }
        let Some(uri) = self.schema_uri(element, location)? else {
            return Ok(());
        };
        let source = self.factory.attributes_wrapper(&uri, ns)?;
        let Some(schema) = self.load_schema((uri, Some(ns.to_string())), &source)? else {
            return Ok(());
        };

        for (mode, name) in modes {
            if !self.builder.bind_attributes(mode, ns, Arc::clone(&schema)) {
                self.error(
                    format!(
                        "multiple attribute validation rules for namespace \"{}\" in mode \"{}\"",
                        ns, name
                    ),
                    Some(location),
                )?;
            }
        }
        Ok(())
    }

    /// Resolves the `schema` attribute against the base URI in effect.
    fn schema_uri(&mut self, element: &StartElement, location: &Location) -> Result<Option<Url>> {
        let Some(reference) = self.required(element, "schema", location)? else {
            return Ok(None);
        };
        if input::has_fragment_id(reference) {
            self.error(
                format!(
                    "schema URI \"{}\" must not contain a fragment identifier",
                    reference
                ),
                Some(location),
            )?;
            return Ok(None);
        }
        match input::resolve_reference(self.base.current(), reference) {
            Ok(uri) => Ok(Some(uri)),
            Err(err) => {
                self.error(
                    format!("cannot resolve schema URI \"{}\": {}", reference, err),
                    Some(location),
                )?;
                Ok(None)
            }
        }
    }

    /// Compiles a child schema once per rules document. `None` means it failed to compile;
    /// the factory has already reported why.
    fn load_schema(
        &mut self,
        key: SchemaKey,
        source: &InputSource,
    ) -> Result<Option<Arc<dyn CompiledSchema>>> {
        if let Some(schema) = self.schemas.get(&key) {
            return Ok(Some(Arc::clone(schema)));
        }
        if self.incorrect.contains(&key) {
            self.had_error = true;
            return Ok(None);
        }
        match self.factory.create_schema(source, &self.sink) {
            Ok(schema) => {
                debug!(schema = %key.0, "compiled child schema");
                self.schemas.insert(key, Arc::clone(&schema));
                Ok(Some(schema))
            }
            Err(err) if err.is_incorrect_schema() => {
                debug!(schema = %key.0, "child schema is incorrect");
                self.had_error = true;
                self.incorrect.insert(key);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl ContentHandler for RulesCompiler<'_> {
    fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        self.base
            .start_element(element.attribute(XML_NAMESPACE, "base"));
        if self.foreign_depth > 0 {
            self.foreign_depth += 1;
            return Ok(());
        }
        if element.name.namespace != RULES_NAMESPACE {
            if self.open.is_empty() {
                self.error(
                    format!(
                        "root element must be \"rules\" in namespace \"{}\"",
                        RULES_NAMESPACE
                    ),
                    Some(location),
                )?;
            }
            self.foreign_depth = 1;
            return Ok(());
        }

        let parent = self.open.last().copied();
        let rule = match RuleElement::from_local_name(&element.name.local) {
            Some(rule) if rule.allowed_under(parent) => rule,
            Some(_) => {
                self.error(
                    format!("element \"{}\" not allowed here", element.name.local),
                    Some(location),
                )?;
                self.foreign_depth = 1;
                return Ok(());
            }
            None => {
                self.error(
                    format!("unknown rules element \"{}\"", element.name.local),
                    Some(location),
                )?;
                self.foreign_depth = 1;
                return Ok(());
            }
        };
        self.open.push(rule);
        self.start_rule(rule, element, location)
    }

    fn end_element(&mut self, _name: &QName, _location: &Location) -> Result<()> {
        self.base.end_element();
        if self.foreign_depth > 0 {
            self.foreign_depth -= 1;
            return Ok(());
        }
        if self.open.pop() == Some(RuleElement::ValidateElements) {
            self.current_action = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::mock::{EventLog, MockFactory, MockSchema};
    use crate::sink::CollectingSink;

    fn rules(body: &str) -> InputSource {
        let doc = format!(r#"<rules xmlns="{}">{}</rules>"#, RULES_NAMESPACE, body);
        InputSource::from_bytes(doc.into_bytes(), Url::parse("file:///rules/main.xml").ok())
    }

    fn factory() -> MockFactory {
        let log = EventLog::default();
        MockFactory::default()
            .with("file:///rules/a.xsd", MockSchema::new("A", &["urn:a"], &log))
            .with("file:///rules/b.xsd", MockSchema::new("B", &["urn:b"], &log))
            .with_attributes(
                "file:///rules/x.xsd",
                "urn:x",
                MockSchema::new("X", &[], &log),
            )
    }

    fn compile(body: &str, factory: &MockFactory) -> (Result<ModeTable>, Vec<String>) {
        let sink = Arc::new(CollectingSink::new());
        let result = RulesCompiler::compile(&rules(body), factory, sink.clone());
        (result, sink.messages())
    }

    #[test]
    fn test_compiles_defined_modes() {
        let (result, messages) = compile(
            r#"<strict/>
               <lax modes="inner"/>
               <validateElements ns="urn:a" schema="a.xsd" useMode="inner"/>
               <validateAttributes ns="urn:x" schema="x.xsd" modes="inner"/>"#,
            &factory(),
        );
        let table = result.unwrap();
        assert!(messages.is_empty(), "{:?}", messages);

        let default = table.mode(table.start_mode());
        assert_eq!(default.name(), DEFAULT_MODE);
        assert!(default.is_strict());
        let action = table.element_action(table.start_mode(), "urn:a").unwrap();
        assert_eq!(table.mode(action.mode()).name(), "inner");
        assert!(!action.prune());

        let inner = table.mode(table.mode_id("inner").unwrap());
        assert!(!inner.is_strict());
        assert!(inner.attribute_schema("urn:x").is_some());
    }

    #[test]
    fn test_undefined_mode_is_reported_at_first_use() {
        let (result, messages) = compile(
            r#"<validateElements ns="urn:a" schema="a.xsd" useMode="missing"/>"#,
            &factory(),
        );
        assert!(matches!(result, Err(ValidationError::IncorrectSchema { .. })));
        assert_eq!(messages, vec!["undefined mode: missing"]);
    }

    #[test]
    fn test_start_mode_must_be_defined() {
        let sink = Arc::new(CollectingSink::new());
        let doc = format!(r#"<rules xmlns="{}" startMode="main"/>"#, RULES_NAMESPACE);
        let source = InputSource::from_bytes(doc.into_bytes(), None);
        let result = RulesCompiler::compile(&source, &factory(), sink.clone());
        assert!(result.is_err());
        assert_eq!(sink.messages(), vec!["undefined mode: main"]);

        let doc = format!(
            r#"<rules xmlns="{}" startMode="main"><lax modes="main"/></rules>"#,
            RULES_NAMESPACE
        );
        let source = InputSource::from_bytes(doc.into_bytes(), None);
        let table = RulesCompiler::compile(&source, &factory(), sink.clone()).unwrap();
        assert_eq!(table.mode(table.start_mode()).name(), "main");
    }

    #[test]
    fn test_duplicate_bindings_first_wins() {
        let (result, messages) = compile(
            r#"<validateElements ns="urn:a" schema="a.xsd"/>
               <validateElements ns="urn:a" schema="b.xsd"/>
               <strict/>
               <lax/>"#,
            &factory(),
        );
        assert!(result.is_err());
        assert_eq!(
            messages,
            vec![
                "multiple element validation rules for namespace \"urn:a\" in mode \"#default\"",
                "strict or lax already specified for mode \"#default\"",
            ]
        );
    }

    #[test]
    fn test_namespace_must_be_absolute() {
        let (result, messages) = compile(
            r#"<validateElements ns="" schema="a.xsd"/>
               <validateElements ns="relative" schema="b.xsd" modes="m"/>
               <validateAttributes ns="" schema="x.xsd"/>"#,
            &factory().with_attributes(
                "file:///rules/x.xsd",
                "",
                MockSchema::new("X0", &[], &EventLog::default()),
            ),
        );
        assert!(result.is_err());
        assert_eq!(
            messages,
            vec![
                "namespace URI \"relative\" must be absolute",
                "namespace URI \"\" must be absolute",
            ]
        );
    }

    #[test]
    fn test_schema_fragment_is_rejected() {
        let (result, messages) = compile(
            r#"<validateElements ns="urn:a" schema="a.xsd#frag"/>"#,
            &factory(),
        );
        assert!(result.is_err());
        assert_eq!(
            messages,
            vec!["schema URI \"a.xsd#frag\" must not contain a fragment identifier"]
        );
    }

    #[test]
    fn test_xml_base_and_escaping() {
        let log = EventLog::default();
        let factory = MockFactory::default().with(
            "file:///other/my%20schema.xsd",
            MockSchema::new("S", &["urn:s"], &log),
        );
        let (result, messages) = compile(
            r#"<validateElements xml:base="/other/" ns="urn:s" schema="my schema.xsd"/>"#,
            &factory,
        );
        assert!(result.is_ok(), "{:?}", messages);
    }

    #[test]
    fn test_child_schema_compiled_once() {
        let factory = factory();
        let (result, _) = compile(
            r#"<lax modes="m1 m2"/>
               <validateElements ns="urn:a" schema="a.xsd" modes="m1"/>
               <validateElements ns="urn:a" schema="a.xsd" modes="m2"/>"#,
            &factory,
        );
        let table = result.unwrap();
        assert_eq!(factory.compiled.lock().len(), 1);
        assert_eq!(table.child_schemas().len(), 1);
    }

    #[test]
    fn test_incorrect_child_schema_accumulates() {
        let factory = factory().with_incorrect("file:///rules/broken.xsd");
        let (result, messages) = compile(
            r#"<validateElements ns="urn:a" schema="broken.xsd"/>
               <validateElements ns="urn:b" schema="b.xsd" useMode="nowhere"/>"#,
            &factory,
        );
        assert!(matches!(result, Err(ValidationError::IncorrectSchema { .. })));
        assert_eq!(
            messages,
            vec![
                "cannot compile file:///rules/broken.xsd",
                "undefined mode: nowhere",
            ]
        );
    }

    #[test]
    fn test_missing_child_schema_aborts() {
        let (result, _) = compile(
            r#"<validateElements ns="urn:a" schema="nothere.xsd"/>"#,
            &factory(),
        );
        assert!(matches!(result, Err(ValidationError::Io(_))));
    }

    #[test]
    fn test_cover_and_prune() {
        let (result, messages) = compile(
            r#"<validateElements ns="urn:a" schema="a.xsd" prune=" true ">
                 <cover ns="urn:c"/>
                 <cover ns=""/>
               </validateElements>"#,
            &factory(),
        );
        let table = result.unwrap();
        assert!(messages.is_empty());
        let action = table.element_action(table.start_mode(), "urn:a").unwrap();
        assert!(action.prune());
        assert!(action.owns("urn:c"));
        assert!(action.owns(""));
    }

    #[test]
    fn test_structural_problems_are_reported() {
        let (result, messages) = compile(
            r#"<cover ns="urn:c"/>
               <bogus/>
               <validateElements schema="a.xsd"/>"#,
            &factory(),
        );
        assert!(result.is_err());
        assert_eq!(
            messages,
            vec![
                "element \"cover\" not allowed here",
                "unknown rules element \"bogus\"",
                "element \"validateElements\" is missing required attribute \"ns\"",
            ]
        );
    }

    #[test]
    fn test_foreign_elements_are_skipped() {
        let (result, messages) = compile(
            r#"<doc:notes xmlns:doc="urn:docs">
                 <validateElements xmlns="http://www.thaiopensource.com/ns/mns" ns="urn:z" schema="zzz.xsd"/>
               </doc:notes>
               <validateElements ns="urn:a" schema="a.xsd"/>"#,
            &factory(),
        );
        assert!(result.is_ok(), "{:?}", messages);
    }

    #[test]
    fn test_wrong_root_element() {
        let sink = Arc::new(CollectingSink::new());
        let source = InputSource::from_bytes(b"<rules/>".to_vec(), None);
        let result = RulesCompiler::compile(&source, &factory(), sink.clone());
        assert!(result.is_err());
        assert_eq!(sink.messages().len(), 1);
    }
}
