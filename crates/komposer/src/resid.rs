//! Canonical resource identities and target selectors.
use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::Deserialize;

/// Placeholder for a missing API group in the canonical id form.
const NO_GROUP: &str = "~G";
/// Placeholder for a missing API version in the canonical id form.
const NO_VERSION: &str = "~V";
/// Placeholder for a missing namespace in the canonical id form.
const NO_NAMESPACE: &str = "~X";

/// The state of the `metadata.namespace` field on a document.
///
/// The three states are preserved as parsed, since a composition may want to
/// tell "never namespaced" apart from "namespaced to the empty value". For
/// lookups the distinction does not matter: [`NamespaceMarker::Empty`] and
/// [`NamespaceMarker::Absent`] both mean "no namespace", so a patch which
/// omits the field still matches a target that never had one.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum NamespaceMarker {
    /// The namespace field was not present on the document.
    #[default]
    Absent,

    /// The namespace field was present but empty (or explicitly null).
    Empty,

    /// An explicit, non-empty namespace.
    Named(String),
}

impl NamespaceMarker {
    /// The namespace this marker resolves to for matching purposes.
    pub fn effective(&self) -> Option<&str> {
        match self {
            Self::Absent | Self::Empty => None,
            Self::Named(namespace) => Some(namespace),
        }
    }

    /// Whether two markers address the same namespace.
    pub fn matches(&self, other: &Self) -> bool {
        self.effective() == other.effective()
    }
}

impl fmt::Display for NamespaceMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.effective().unwrap_or(NO_NAMESPACE))
    }
}

/// The canonical identity of one resource document.
///
/// The canonical string form is `group_version_Kind|namespace|name` with
/// `~G`/`~V` for a missing group/version and `~X` for no namespace, for
/// example `apps_v1_StatefulSet|~X|my-sts`. It is used for equality, logging
/// and conflict messages.
///
/// An id is computed once from a document's own identity fields and is never
/// recomputed because the document was patched afterwards.
#[derive(Clone, Debug)]
pub struct ResourceId {
    pub group: Option<String>,
    pub version: Option<String>,
    pub kind: String,
    pub namespace: NamespaceMarker,
    pub name: String,
}

impl ResourceId {
    /// Builds an id from the fields of a document, splitting a combined
    /// `apiVersion` value such as `apps/v1` into group and version.
    pub fn from_parts(
        api_version: Option<&str>,
        kind: impl Into<String>,
        namespace: NamespaceMarker,
        name: impl Into<String>,
    ) -> Self {
        let (group, version) = match api_version {
            Some(api_version) => match api_version.split_once('/') {
                Some((group, version)) => (Some(group.to_owned()), Some(version.to_owned())),
                None => (None, Some(api_version.to_owned())),
            },
            None => (None, None),
        };

        Self {
            group,
            version,
            kind: kind.into(),
            namespace,
            name: name.into(),
        }
    }
}

// Equality and hashing treat `Empty` and `Absent` namespace markers as the
// same namespace, in line with `NamespaceMarker::matches`.
impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group
            && self.version == other.version
            && self.kind == other.kind
            && self.namespace.matches(&other.namespace)
            && self.name == other.name
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.version.hash(state);
        self.kind.hash(state);
        self.namespace.effective().hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{group}_{version}_{kind}|{namespace}|{name}",
            group = self.group.as_deref().unwrap_or(NO_GROUP),
            version = self.version.as_deref().unwrap_or(NO_VERSION),
            kind = self.kind,
            namespace = self.namespace,
            name = self.name,
        )
    }
}

/// A resource target selector with wildcard semantics.
///
/// Every unset field matches anything. A set `group` or `namespace` may be
/// the empty string, which matches resources without that field.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Selector {
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub name: Option<String>,
}

impl Selector {
    /// Whether `id` satisfies every set field of this selector.
    pub fn matches(&self, id: &ResourceId) -> bool {
        let field_matches =
            |wanted: &Option<String>, actual: Option<&str>| match wanted.as_deref() {
                Some(wanted) => wanted == actual.unwrap_or(""),
                None => true,
            };

        field_matches(&self.group, id.group.as_deref())
            && field_matches(&self.version, id.version.as_deref())
            && field_matches(&self.kind, Some(id.kind.as_str()))
            && field_matches(&self.namespace, id.namespace.effective())
            && field_matches(&self.name, Some(id.name.as_str()))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_wildcard(field: &Option<String>) -> &str {
            match field.as_deref() {
                Some("") | None => "*",
                Some(field) => field,
            }
        }

        write!(
            f,
            "{group}_{version}_{kind}|{namespace}|{name}",
            group = or_wildcard(&self.group),
            version = or_wildcard(&self.version),
            kind = or_wildcard(&self.kind),
            namespace = or_wildcard(&self.namespace),
            name = or_wildcard(&self.name),
        )
    }
}
