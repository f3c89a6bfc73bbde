//! Identifier soundness: unique IDs and references that resolve.
//!
//! Which attributes are identifiers is decided statically by an [`IdTypeMap`], built once per
//! loaded schema. An [`IdSoundnessChecker`] is the per-document half: it watches the same event
//! stream as the structural validator and reports independently of it.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::Result;
use crate::event::{ContentHandler, Location, QName, StartElement};
use crate::schema::Validator;
use crate::sink::{Diagnostic, SharedSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdType {
    Id,
    IdRef,
    IdRefs,
}

/// Attribute typing keyed by (element, attribute), with a fallback for attributes typed the
/// same way on any element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdTypeMap {
    by_element: IndexMap<QName, IndexMap<QName, IdType>>,
    any_element: IndexMap<QName, IdType>,
}

impl IdTypeMap {
    pub fn builder() -> IdTypeMapBuilder {
        IdTypeMapBuilder::default()
    }

    /// Exact element entries win over any-element entries.
    pub fn id_type(&self, element: &QName, attribute: &QName) -> Option<IdType> {
        self.by_element
            .get(element)
            .and_then(|attrs| attrs.get(attribute))
            .or_else(|| self.any_element.get(attribute))
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.any_element.is_empty() && self.by_element.values().all(IndexMap::is_empty)
    }

    pub fn len(&self) -> usize {
        self.any_element.len() + self.by_element.values().map(IndexMap::len).sum::<usize>()
    }

    /// Union of two maps; where both type the same attribute, `self` wins.
    pub fn merge(&self, other: &IdTypeMap) -> IdTypeMap {
        let mut merged = self.clone();
        for (element, attrs) in &other.by_element {
            let target = merged.by_element.entry(element.clone()).or_default();
            for (attribute, id_type) in attrs {
                target.entry(attribute.clone()).or_insert(*id_type);
            }
        }
        for (attribute, id_type) in &other.any_element {
            merged
                .any_element
                .entry(attribute.clone())
                .or_insert(*id_type);
        }
        merged
    }
}

#[derive(Debug, Default)]
pub struct IdTypeMapBuilder {
    map: IdTypeMap,
}

impl IdTypeMapBuilder {
    pub fn element(mut self, element: QName, attribute: QName, id_type: IdType) -> Self {
        self.map
            .by_element
            .entry(element)
            .or_default()
            .entry(attribute)
            .or_insert(id_type);
        self
    }

    pub fn any_element(mut self, attribute: QName, id_type: IdType) -> Self {
        self.map.any_element.entry(attribute).or_insert(id_type);
        self
    }

    pub fn insert(&mut self, element: Option<QName>, attribute: QName, id_type: IdType) {
        match element {
            Some(element) => {
                self.map
                    .by_element
                    .entry(element)
                    .or_default()
                    .entry(attribute)
                    .or_insert(id_type);
            }
            None => {
                self.map.any_element.entry(attribute).or_insert(id_type);
            }
        }
    }

    pub fn build(self) -> IdTypeMap {
        self.map
    }
}

/// Checks one document at a time against a shared [`IdTypeMap`].
pub struct IdSoundnessChecker {
    map: Arc<IdTypeMap>,
    sink: SharedSink,
    ids: HashSet<String>,
    references: Vec<(String, Location)>,
    had_error: bool,
}

impl IdSoundnessChecker {
    pub fn new(map: Arc<IdTypeMap>, sink: SharedSink) -> Self {
        Self {
            map,
            sink,
            ids: HashSet::new(),
            references: Vec::new(),
            had_error: false,
        }
    }

    fn error(&mut self, message: String, location: &Location) -> Result<()> {
        self.had_error = true;
        self.sink.report(Diagnostic::error(message, Some(location)))
    }
}

fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl ContentHandler for IdSoundnessChecker {
    fn start_document(&mut self) -> Result<()> {
        self.reset();
        Ok(())
    }

    fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        for attribute in &element.attributes {
            let Some(id_type) = self.map.id_type(&element.name, &attribute.name) else {
                continue;
            };
            match id_type {
                IdType::Id => {
                    let id = normalize(&attribute.value);
                    if !self.ids.insert(id.clone()) {
                        self.error(format!("duplicate ID \"{}\"", id), location)?;
                    }
                }
                IdType::IdRef => {
                    self.references
                        .push((normalize(&attribute.value), location.clone()));
                }
                IdType::IdRefs => {
                    for token in attribute.value.split_whitespace() {
                        self.references.push((token.to_string(), location.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    fn end_element(&mut self, _name: &QName, _location: &Location) -> Result<()> {
        Ok(())
    }

    fn end_document(&mut self, _location: &Location) -> Result<()> {
        let references = std::mem::take(&mut self.references);
        for (reference, location) in references {
            if !self.ids.contains(&reference) {
                self.error(
                    format!("IDREF \"{}\" without matching ID", reference),
                    &location,
                )?;
            }
        }
        Ok(())
    }
}

impl Validator for IdSoundnessChecker {
    fn is_valid_so_far(&self) -> bool {
        !self.had_error
    }

    fn reset(&mut self) {
        self.ids.clear();
        self.references.clear();
        self.had_error = false;
    }
}
