//! Structural events delivered by an event source to validators.
//!
//! Events are pushed in document order. Every callback returns a [`Result`]; an `Err` stops the
//! stream and is handed back to whoever started the parse.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;

/// An expanded name. An empty `namespace` means "no namespace".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QName {
    pub namespace: String,
    pub local: String,
}

impl QName {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
        }
    }

    /// A name in no namespace.
    pub fn local(local: impl Into<String>) -> Self {
        Self::new("", local)
    }

    pub fn has_namespace(&self) -> bool {
        !self.namespace.is_empty()
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

impl Attribute {
    pub fn new(name: QName, value: impl Into<String>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

/// A namespace declaration (`xmlns` or `xmlns:prefix`) made on an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceBinding {
    /// `None` for the default namespace declaration.
    pub prefix: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartElement {
    pub name: QName,
    /// Attributes other than namespace declarations, in document order.
    pub attributes: Vec<Attribute>,
    pub namespace_declarations: Vec<NamespaceBinding>,
    /// Every binding in effect on this element, inherited ones included. A redeclared prefix
    /// appears once, with its innermost value.
    pub in_scope_namespaces: Arc<[NamespaceBinding]>,
}

impl StartElement {
    pub fn new(name: QName) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            namespace_declarations: Vec::new(),
            in_scope_namespaces: Arc::from(Vec::new()),
        }
    }

    pub fn with_in_scope_namespaces(mut self, bindings: Vec<NamespaceBinding>) -> Self {
        self.in_scope_namespaces = Arc::from(bindings);
        self
    }

    pub fn with_attribute(mut self, name: QName, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    /// Value of an attribute by namespace and local name.
    pub fn attribute(&self, namespace: &str, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.namespace == namespace && a.name.local == local)
            .map(|a| a.value.as_str())
    }
}

/// Where an event occurred.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Location {
    pub system_id: Option<Arc<str>>,
    pub line: u64,
    pub column: u64,
}

impl Location {
    pub fn new(system_id: Option<Arc<str>>, line: u64, column: u64) -> Self {
        Self {
            system_id,
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.system_id {
            Some(id) => write!(f, "{}:{}:{}", id, self.line, self.column),
            None => write!(f, "{}:{}", self.line, self.column),
        }
    }
}

/// Push-style consumer of structural events.
pub trait ContentHandler {
    fn start_document(&mut self) -> Result<()> {
        Ok(())
    }

    fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()>;

    fn end_element(&mut self, name: &QName, location: &Location) -> Result<()>;

    fn characters(&mut self, _text: &str, _location: &Location) -> Result<()> {
        Ok(())
    }

    fn end_document(&mut self, _location: &Location) -> Result<()> {
        Ok(())
    }
}

impl<H: ContentHandler + ?Sized> ContentHandler for &mut H {
    fn start_document(&mut self) -> Result<()> {
        (**self).start_document()
    }

    fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        (**self).start_element(element, location)
    }

    fn end_element(&mut self, name: &QName, location: &Location) -> Result<()> {
        (**self).end_element(name, location)
    }

    fn characters(&mut self, text: &str, location: &Location) -> Result<()> {
        (**self).characters(text, location)
    }

    fn end_document(&mut self, location: &Location) -> Result<()> {
        (**self).end_document(location)
    }
}

impl<H: ContentHandler + ?Sized> ContentHandler for Box<H> {
    fn start_document(&mut self) -> Result<()> {
        (**self).start_document()
    }

    fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        (**self).start_element(element, location)
    }

    fn end_element(&mut self, name: &QName, location: &Location) -> Result<()> {
        (**self).end_element(name, location)
    }

    fn characters(&mut self, text: &str, location: &Location) -> Result<()> {
        (**self).characters(text, location)
    }

    fn end_document(&mut self, location: &Location) -> Result<()> {
        (**self).end_document(location)
    }
}

/// Forwards every event to `first`, then to `second`.
///
/// The two consumers never see each other's state; an error from either one stops the stream.
pub struct SplitHandler<A, B> {
    first: A,
    second: B,
}

impl<A, B> SplitHandler<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    pub fn first(&self) -> &A {
        &self.first
    }

    pub fn second(&self) -> &B {
        &self.second
    }

    pub fn into_inner(self) -> (A, B) {
        (self.first, self.second)
    }
}

impl<A: ContentHandler, B: ContentHandler> ContentHandler for SplitHandler<A, B> {
    fn start_document(&mut self) -> Result<()> {
        self.first.start_document()?;
        self.second.start_document()
    }

    fn start_element(&mut self, element: &StartElement, location: &Location) -> Result<()> {
        self.first.start_element(element, location)?;
        self.second.start_element(element, location)
    }

    fn end_element(&mut self, name: &QName, location: &Location) -> Result<()> {
        self.first.end_element(name, location)?;
        self.second.end_element(name, location)
    }

    fn characters(&mut self, text: &str, location: &Location) -> Result<()> {
        self.first.characters(text, location)?;
        self.second.characters(text, location)
    }

    fn end_document(&mut self, location: &Location) -> Result<()> {
        self.first.end_document(location)?;
        self.second.end_document(location)
    }
}
