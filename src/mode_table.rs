//! Compiled dispatch tables: modes, element actions and attribute bindings.
//!
//! Modes and actions live in flat vectors and refer to each other by index. One action can be
//! bound in several modes, and a `cover` added to it later is seen through all of them.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::event::Location;
use crate::schema::CompiledSchema;

pub const DEFAULT_MODE: &str = "#default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(usize);

/// Binding of one namespace to a child schema, the mode for its subtree, and how far the
/// child schema's ownership reaches.
#[derive(Debug)]
pub struct ElementAction {
    namespace: String,
    schema: Arc<dyn CompiledSchema>,
    mode: ModeId,
    prune: bool,
    covered: IndexSet<String>,
}

impl ElementAction {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn schema(&self) -> &Arc<dyn CompiledSchema> {
        &self.schema
    }

    pub fn mode(&self) -> ModeId {
        self.mode
    }

    pub fn prune(&self) -> bool {
        self.prune
    }

    pub fn covered_namespaces(&self) -> &IndexSet<String> {
        &self.covered
    }

    /// True if elements in `namespace` stay with this action's schema without re-dispatch.
    pub fn owns(&self, namespace: &str) -> bool {
        self.namespace == namespace || self.covered.contains(namespace)
    }
}

#[derive(Debug)]
pub struct Mode {
    name: String,
    defined: bool,
    strict: bool,
    strict_defined: bool,
    element_actions: IndexMap<String, ActionId>,
    attribute_schemas: IndexMap<String, Arc<dyn CompiledSchema>>,
    first_reference: Option<Location>,
}

impl Mode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            defined: false,
            strict: false,
            strict_defined: false,
            element_actions: IndexMap::new(),
            attribute_schemas: IndexMap::new(),
            first_reference: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_defined(&self) -> bool {
        self.defined
    }

    /// Modes are lax unless a `strict` rule says otherwise.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn element_action(&self, namespace: &str) -> Option<ActionId> {
        self.element_actions.get(namespace).copied()
    }

    pub fn attribute_schema(&self, namespace: &str) -> Option<&Arc<dyn CompiledSchema>> {
        self.attribute_schemas.get(namespace)
    }

    pub fn attribute_namespaces(&self) -> impl Iterator<Item = &str> {
        self.attribute_schemas.keys().map(String::as_str)
    }

    pub fn first_reference(&self) -> Option<&Location> {
        self.first_reference.as_ref()
    }
}

#[derive(Debug)]
pub struct ModeTable {
    modes: Vec<Mode>,
    names: IndexMap<String, ModeId>,
    actions: Vec<ElementAction>,
    start_mode: ModeId,
}

impl ModeTable {
    pub fn builder() -> ModeTableBuilder {
        ModeTableBuilder::new()
    }

    pub fn start_mode(&self) -> ModeId {
        self.start_mode
    }

    pub fn mode(&self, id: ModeId) -> &Mode {
        &self.modes[id.0]
    }

    pub fn mode_id(&self, name: &str) -> Option<ModeId> {
        self.names.get(name).copied()
    }

    pub fn action(&self, id: ActionId) -> &ElementAction {
        &self.actions[id.0]
    }

    pub fn modes(&self) -> impl Iterator<Item = &Mode> {
        self.modes.iter()
    }

    /// The action bound to `namespace` in `mode`, if any.
    pub fn element_action(&self, mode: ModeId, namespace: &str) -> Option<&ElementAction> {
        self.mode(mode)
            .element_action(namespace)
            .map(|id| self.action(id))
    }

    /// Every child schema the table refers to, each once.
    pub fn child_schemas(&self) -> Vec<Arc<dyn CompiledSchema>> {
        let mut seen: Vec<Arc<dyn CompiledSchema>> = Vec::new();
        let element_schemas = self.actions.iter().map(|a| &a.schema);
        let attribute_schemas = self.modes.iter().flat_map(|m| m.attribute_schemas.values());
        for schema in element_schemas.chain(attribute_schemas) {
            if !seen.iter().any(|s| Arc::ptr_eq(s, schema)) {
                seen.push(Arc::clone(schema));
            }
        }
        seen
    }
}

/// Mutable form of a [`ModeTable`], used only while compiling.
#[derive(Debug)]
pub struct ModeTableBuilder {
    table: ModeTable,
}

impl Default for ModeTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeTableBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            table: ModeTable {
                modes: Vec::new(),
                names: IndexMap::new(),
                actions: Vec::new(),
                start_mode: ModeId(0),
            },
        };
        builder.table.start_mode = builder.mode(DEFAULT_MODE);
        builder
    }

    /// Looks a mode up by name, creating it on first sight.
    pub fn mode(&mut self, name: &str) -> ModeId {
        if let Some(id) = self.table.names.get(name) {
            return *id;
        }
        let id = ModeId(self.table.modes.len());
        self.table.modes.push(Mode::new(name));
        self.table.names.insert(name.to_string(), id);
        id
    }

    /// Like [`mode`](Self::mode), remembering where the mode was first used.
    pub fn reference(&mut self, name: &str, location: &Location) -> ModeId {
        let id = self.mode(name);
        let mode = &mut self.table.modes[id.0];
        if mode.first_reference.is_none() {
            mode.first_reference = Some(location.clone());
        }
        id
    }

    pub fn define(&mut self, id: ModeId) {
        self.table.modes[id.0].defined = true;
    }

    /// Returns false, leaving the first setting, if the mode already had one.
    pub fn set_strict(&mut self, id: ModeId, strict: bool) -> bool {
        let mode = &mut self.table.modes[id.0];
        if mode.strict_defined {
            return false;
        }
        mode.strict = strict;
        mode.strict_defined = true;
        true
    }

    pub fn set_start_mode(&mut self, id: ModeId) {
        self.table.start_mode = id;
    }

    pub fn add_action(
        &mut self,
        namespace: &str,
        schema: Arc<dyn CompiledSchema>,
        mode: ModeId,
        prune: bool,
    ) -> ActionId {
        let id = ActionId(self.table.actions.len());
        self.table.actions.push(ElementAction {
            namespace: namespace.to_string(),
            schema,
            mode,
            prune,
            covered: IndexSet::new(),
        });
        id
    }

    /// Returns false, keeping the existing binding, if `namespace` is already bound in `mode`.
    pub fn bind_element(&mut self, mode: ModeId, namespace: &str, action: ActionId) -> bool {
        let actions = &mut self.table.modes[mode.0].element_actions;
        if actions.contains_key(namespace) {
            return false;
        }
        actions.insert(namespace.to_string(), action);
        true
    }

    pub fn bind_attributes(
        &mut self,
        mode: ModeId,
        namespace: &str,
        schema: Arc<dyn CompiledSchema>,
    ) -> bool {
        let schemas = &mut self.table.modes[mode.0].attribute_schemas;
        if schemas.contains_key(namespace) {
            return false;
        }
        schemas.insert(namespace.to_string(), schema);
        true
    }

    pub fn cover(&mut self, action: ActionId, namespace: &str) {
        self.table.actions[action.0]
            .covered
            .insert(namespace.to_string());
    }

    /// Referenced modes that no rule defined, in order of first sight. `#default` never counts.
    pub fn undefined_modes(&self) -> impl Iterator<Item = &Mode> {
        self.table
            .modes
            .iter()
            .filter(|mode| !mode.defined && mode.name != DEFAULT_MODE)
    }

    pub fn build(self) -> ModeTable {
        self.table
    }
}
