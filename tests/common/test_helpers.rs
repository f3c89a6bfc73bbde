use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use url::Url;

use validate_ns::{
    CollectingSink, EngineOptions, InputSource, RULES_NAMESPACE, SchemaFactory, ValidationEngine,
};

/// Wraps rule elements in a `rules` document element.
pub fn rules(attributes: &str, body: &str) -> String {
    format!(
        r#"<rules xmlns="{}" {}>
{}
</rules>"#,
        RULES_NAMESPACE, attributes, body
    )
}

pub fn source(uri: &str, text: &str) -> InputSource {
    InputSource::from_bytes(
        text.as_bytes().to_vec(),
        Some(Url::parse(uri).expect("test URI must parse")),
    )
}

pub fn doc(text: &str) -> InputSource {
    source("file:///docs/instance.xml", text)
}

pub fn engine_with(
    factory: impl SchemaFactory + 'static,
    options: EngineOptions,
) -> (ValidationEngine, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let engine = ValidationEngine::new(Arc::new(factory), sink.clone(), options);
    (engine, sink)
}

pub fn engine(factory: impl SchemaFactory + 'static) -> (ValidationEngine, Arc<CollectingSink>) {
    engine_with(factory, EngineOptions::default())
}

/// A scratch directory of schema and instance files.
pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create fixture dir");
        }
        std::fs::write(&path, content).expect("write fixture");
        path
    }

    pub fn source(&self, name: &str) -> InputSource {
        InputSource::from_path(&self.dir.path().join(name)).expect("fixture path")
    }
}

/// `<doc>` in `urn:a` holding `item` elements with an `ID` and an optional `IDREF`. Items
/// accept any element and attribute from other namespaces.
pub const A_XSD: &str = r###"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           targetNamespace="urn:a" elementFormDefault="qualified">
  <xs:element name="doc">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="item" minOccurs="0" maxOccurs="unbounded">
          <xs:complexType>
            <xs:sequence>
              <xs:any namespace="##other" processContents="skip" minOccurs="0" maxOccurs="unbounded"/>
            </xs:sequence>
            <xs:attribute name="id" type="xs:ID" use="required"/>
            <xs:attribute name="ref" type="xs:IDREF"/>
            <xs:anyAttribute namespace="##other" processContents="skip"/>
          </xs:complexType>
        </xs:element>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>
"###;

/// `<note>` in `urn:b` with text content only.
pub const B_XSD: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           targetNamespace="urn:b" elementFormDefault="qualified">
  <xs:element name="note">
    <xs:complexType>
      <xs:simpleContent>
        <xs:extension base="xs:string">
          <xs:attribute name="lang" type="xs:language"/>
        </xs:extension>
      </xs:simpleContent>
    </xs:complexType>
  </xs:element>
</xs:schema>
"#;

/// Global attribute `priority` in `urn:attr`.
pub const ATTR_XSD: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           targetNamespace="urn:attr">
  <xs:attribute name="priority">
    <xs:simpleType>
      <xs:restriction base="xs:integer">
        <xs:minInclusive value="1"/>
        <xs:maxInclusive value="5"/>
      </xs:restriction>
    </xs:simpleType>
  </xs:attribute>
</xs:schema>
"#;
