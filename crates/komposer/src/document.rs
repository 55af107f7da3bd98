//! The in-memory document tree and its YAML boundary.
//!
//! A [`Document`] is a tree of objects (insertion-ordered mappings), arrays
//! and scalars. It is format-agnostic: the YAML helpers here only exist to
//! move documents across the process boundary, the engine itself operates
//! purely on the tree.
use serde::Deserialize;
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::resid::{NamespaceMarker, ResourceId};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse YAML document"))]
    ParseYaml { source: serde_yaml::Error },

    #[snafu(display("failed to serialize document as YAML"))]
    SerializeYaml { source: serde_yaml::Error },

    #[snafu(display("document root must be an object"))]
    RootNotObject,

    #[snafu(display("document is missing the kind field"))]
    MissingKind,

    #[snafu(display("document is missing the metadata.name field"))]
    MissingName,

    #[snafu(display("metadata.namespace must be a string"))]
    InvalidNamespace,
}

/// One structured document, exclusively owned by whoever holds it.
///
/// Patch application mutates the tree in place, one writer at a time; a
/// document is never shared between two registries.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    root: Value,
}

impl Document {
    /// Wraps an already-built tree. The root must be an object.
    pub fn new(root: Value) -> Result<Self> {
        ensure!(root.is_object(), RootNotObjectSnafu);
        Ok(Self { root })
    }

    /// Parses a single YAML document.
    pub fn from_yaml(input: &str) -> Result<Self> {
        let root = serde_yaml::from_str(input).context(ParseYamlSnafu)?;
        Self::new(root)
    }

    /// Parses a YAML stream, which may hold any number of `---`-separated
    /// documents. Empty documents are skipped.
    pub fn from_yaml_stream(input: &str) -> Result<Vec<Self>> {
        let mut documents = Vec::new();

        for deserializer in serde_yaml::Deserializer::from_str(input) {
            let root = Value::deserialize(deserializer).context(ParseYamlSnafu)?;
            if root.is_null() {
                continue;
            }
            documents.push(Self::new(root)?);
        }

        Ok(documents)
    }

    /// Computes the identity of this document from its own identity fields.
    pub fn id(&self) -> Result<ResourceId> {
        let root = self.root.as_object().context(RootNotObjectSnafu)?;

        let api_version = root.get("apiVersion").and_then(Value::as_str);
        let kind = root
            .get("kind")
            .and_then(Value::as_str)
            .context(MissingKindSnafu)?;

        let metadata = root.get("metadata").and_then(Value::as_object);
        let name = metadata
            .and_then(|metadata| metadata.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .context(MissingNameSnafu)?;

        let namespace = match metadata.and_then(|metadata| metadata.get("namespace")) {
            None => NamespaceMarker::Absent,
            Some(Value::Null) => NamespaceMarker::Empty,
            Some(Value::String(namespace)) if namespace.is_empty() => NamespaceMarker::Empty,
            Some(Value::String(namespace)) => NamespaceMarker::Named(namespace.clone()),
            Some(_) => return InvalidNamespaceSnafu.fail(),
        };

        Ok(ResourceId::from_parts(api_version, kind, namespace, name))
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Value {
        &mut self.root
    }

    /// Walks object fields by name. Array elements are not addressable here,
    /// pointer paths are the business of the path-patch engine.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let mut current = &self.root;
        for field in path {
            current = current.as_object()?.get(*field)?;
        }
        Some(current)
    }

    /// Sets the value at an object field path, creating intermediate objects
    /// as needed. An intermediate non-object value is replaced.
    pub fn set_path(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            self.root = value;
            return;
        };

        let mut current = &mut self.root;
        for field in parents {
            if !current.is_object() {
                *current = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(object) = current {
                current = object
                    .entry((*field).to_owned())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
            }
        }

        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        if let Some(object) = current.as_object_mut() {
            object.insert((*last).to_owned(), value);
        }
    }

    /// Serializes this document back to YAML, preserving field order.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.root).context(SerializeYamlSnafu)
    }
}

impl From<Document> for Value {
    fn from(document: Document) -> Self {
        document.root
    }
}
