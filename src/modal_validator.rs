//! Runtime dispatch of a document through a [`ModeTable`].
//!
//! Each element is routed by namespace. An element whose namespace the active mode binds starts
//! a *section*: a fresh validator of the bound schema receives that element and its whole
//! subtree. Sections nest, and every open section keeps receiving events until its root ends.
//!
//! Inside a section:
//! * elements in the section's namespace, in the action's own namespace, or in a covered
//!   namespace stay with the section and are never re-dispatched;
//! * with `prune`, nothing below the section root is re-dispatched at all;
//! * without `prune`, other namespaces are dispatched again under the action's mode, so they
//!   may open nested sections of their own.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::Result;
use crate::event::{Attribute, ContentHandler, Location, QName, StartElement};
use crate::id_soundness::IdTypeMap;
use crate::mode_table::{ActionId, ModeId, ModeTable};
use crate::schema::{BEARER_LOCAL_NAME, BEARER_NAMESPACE, CompiledSchema, Validator};
use crate::sink::{Diagnostic, SharedSink};

/// A [`CompiledSchema`] backed by a compiled rules document.
#[derive(Debug)]
pub struct ModalSchema {
    table: Arc<ModeTable>,
    id_type_map: Option<Arc<IdTypeMap>>,
}

impl ModalSchema {
    pub fn new(table: ModeTable) -> Self {
        let id_type_map = table
            .child_schemas()
            .iter()
            .filter_map(|schema| schema.id_type_map())
            .fold(None::<IdTypeMap>, |merged, map| match merged {
                Some(merged) => Some(merged.merge(&map)),
                None => Some((*map).clone()),
            })
            .filter(|map| !map.is_empty())
            .map(Arc::new);
        Self {
            table: Arc::new(table),
            id_type_map,
        }
    }

    pub fn mode_table(&self) -> &Arc<ModeTable> {
        &self.table
    }
}

impl CompiledSchema for ModalSchema {
    fn create_validator(&self, sink: SharedSink) -> Box<dyn Validator> {
        let start = self.table.start_mode();
        Box::new(ModalValidator::new(Arc::clone(&self.table), start, sink))
    }

    fn id_type_map(&self) -> Option<Arc<IdTypeMap>> {
        self.id_type_map.clone()
    }
}

struct Section {
    validator: Box<dyn Validator>,
    action: ActionId,
}

#[derive(Debug, Clone)]
struct Frame {
    mode: ModeId,
    /// Index of the innermost open section.
    owner: Option<usize>,
    namespace: Option<String>,
    /// This element opened the innermost section.
    section_root: bool,
}

pub struct ModalValidator {
    table: Arc<ModeTable>,
    start_mode: ModeId,
    sink: SharedSink,
    frames: Vec<Frame>,
    sections: Vec<Section>,
    strict_violation: bool,
    attributes_valid: bool,
    closed_sections_valid: bool,
}

impl ModalValidator {
    pub fn new(table: Arc<ModeTable>, start_mode: ModeId, sink: SharedSink) -> Self {
        let mut validator = Self {
            table,
            start_mode,
            sink,
            frames: Vec::new(),
            sections: Vec::new(),
            strict_violation: false,
            attributes_valid: true,
            closed_sections_valid: true,
        };
        validator.reset();
        validator
    }

    fn document_frame(&self) -> Frame {
        Frame {
            mode: self.start_mode,
            owner: None,
            namespace: None,
            section_root: false,
        }
    }

    /// Validates the qualified attributes of `element` whose namespace `mode` binds, one
    /// namespace at a time, on a synthesized bearer element.
    fn validate_attributes(
        &mut self,
        table: &ModeTable,
        mode: ModeId,
        element: &StartElement,
        location: &Location,
    ) -> Result<()> {
        let mode = table.mode(mode);
        let mut groups: IndexMap<&str, Vec<Attribute>> = IndexMap::new();
        for attribute in &element.attributes {
            let namespace = attribute.name.namespace.as_str();
            if attribute.name.has_namespace() && mode.attribute_schema(namespace).is_some() {
                groups.entry(namespace).or_default().push(attribute.clone());
            }
        }
        for (namespace, attributes) in groups {
            let Some(schema) = mode.attribute_schema(namespace) else {
                continue;
            };
            let bearer = StartElement {
                name: QName::new(BEARER_NAMESPACE, BEARER_LOCAL_NAME),
                attributes,
                namespace_declarations: Vec::new(),
                in_scope_namespaces: Arc::clone(&element.in_scope_namespaces),
            };
            let mut validator = schema.create_validator(Arc::clone(&self.sink));
            validator.start_document()?;
            validator.start_element(&bearer, location)?;
            validator.end_element(&bearer.name, location)?;
            validator.end_document(location)?;
            if !validator.is_valid_so_far() {
                self.attributes_valid = false;
            }
        }
        Ok(())
    }

    fn close_section(&mut self, location: &Location) -> Result<()> {
        if let Some(mut section) = self.sections.pop() {
            section.validator.end_document(location)?;
            if !section.validator.is_valid_so_far() {
                self.closed_sections_valid = false;
            }
        }
        Ok(())
    }
}

impl ContentHandler for ModalValidator {
    fn start_document(&mut self) -> Result<()> {
        self.reset();
        Ok(())
    }

    fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        let table = Arc::clone(&self.table);
        let parent = self
            .frames
            .last()
            .cloned()
            .unwrap_or_else(|| self.document_frame());
        let namespace = element.name.namespace.as_str();
        let owner = parent
            .owner
            .map(|index| table.action(self.sections[index].action));
        let pruned = owner.is_some_and(|action| action.prune());

        let mut frame = Frame {
            mode: parent.mode,
            owner: parent.owner,
            namespace: Some(namespace.to_string()),
            section_root: false,
        };
        let stays = parent.namespace.as_deref() == Some(namespace)
            || owner.is_some_and(|action| action.owns(namespace))
            || pruned;
        if !stays {
            let mode = table.mode(parent.mode);
            if let Some(action_id) = mode.element_action(namespace) {
                let action = table.action(action_id);
                debug!(
                    namespace,
                    mode = mode.name(),
                    prune = action.prune(),
                    "opening section"
                );
                let mut validator = action.schema().create_validator(Arc::clone(&self.sink));
                validator.start_document()?;
                self.sections.push(Section {
                    validator,
                    action: action_id,
                });
                frame.mode = action.mode();
                frame.owner = Some(self.sections.len() - 1);
                frame.section_root = true;
            } else if mode.is_strict() {
                self.strict_violation = true;
                self.sink.report(Diagnostic::error(
                    format!(
                        "element \"{}\" in unbound namespace \"{}\" is not allowed in strict mode \"{}\"",
                        element.name.local,
                        namespace,
                        mode.name()
                    ),
                    Some(location),
                ))?;
            }
        }

        for section in &mut self.sections {
            section.validator.start_element(element, location)?;
        }
        if !pruned {
            self.validate_attributes(&table, parent.mode, element, location)?;
        }
        self.frames.push(frame);
        Ok(())
    }

    fn end_element(&mut self, name: &QName, location: &Location) -> Result<()> {
        for section in &mut self.sections {
            section.validator.end_element(name, location)?;
        }
        if let Some(frame) = self.frames.pop()
            && frame.section_root
        {
            self.close_section(location)?;
        }
        Ok(())
    }

    fn characters(&mut self, text: &str, location: &Location) -> Result<()> {
        for section in &mut self.sections {
            section.validator.characters(text, location)?;
        }
        Ok(())
    }

    fn end_document(&mut self, location: &Location) -> Result<()> {
        while !self.sections.is_empty() {
            self.close_section(location)?;
        }
        Ok(())
    }
}

impl Validator for ModalValidator {
    fn is_valid_so_far(&self) -> bool {
        !self.strict_violation
            && self.attributes_valid
            && self.closed_sections_valid
            && self
                .sections
                .iter()
                .all(|section| section.validator.is_valid_so_far())
    }

    fn reset(&mut self) {
        self.frames.clear();
        self.sections.clear();
        self.strict_violation = false;
        self.attributes_valid = true;
        self.closed_sections_valid = true;
    }
}
