//! Synthesizes ConfigMap- and Secret-shaped documents from declared literals
//! and file references, with deterministic content-hash name suffixing.
use std::{collections::BTreeMap, fmt::Write as _, sync::LazyLock};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::debug;

use crate::{
    document::{self, Document},
    loader::{self, Loader},
    resid::ResourceId,
};

type Result<T, E = Error> = std::result::Result<T, E>;

const RFC_1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";

static RFC_1123_SUBDOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_LABEL_FMT}(\\.{RFC_1123_LABEL_FMT})*$"))
        .expect("failed to compile RFC 1123 subdomain regex")
});

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("generated name {name:?} is not a valid RFC 1123 subdomain"))]
    InvalidName { name: String },

    #[snafu(display("literal {literal:?} must be of the form key=value"))]
    MalformedLiteral { literal: String },

    #[snafu(display("duplicate data key {key:?} in generator {name:?}"))]
    DuplicateKey { key: String, name: String },

    #[snafu(display("failed to read file {path:?} referenced by generator {name:?}"))]
    ReadFile {
        source: loader::Error,
        path: String,
        name: String,
    },

    #[snafu(display("failed to serialize generator content for hashing"))]
    SerializeContent { source: serde_json::Error },

    #[snafu(display("failed to assemble the generated document"))]
    AssembleDocument { source: document::Error },
}

/// The document shape a generator produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum GeneratorKind {
    ConfigMap,
    Secret,
}

/// One declared generator.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GeneratorSpec {
    pub name: String,

    #[serde(default)]
    pub namespace: Option<String>,

    /// `key=value` entries, in declaration order. The key is everything left
    /// of the first `=`.
    #[serde(default)]
    pub literals: Vec<String>,

    /// File references, either `key=path` or a bare path whose file name
    /// becomes the key.
    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default)]
    pub options: Option<GeneratorOptions>,
}

/// Options applying to one generator, or (at node level) to every generator
/// of that node.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GeneratorOptions {
    #[serde(default)]
    pub disable_name_suffix_hash: bool,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl GeneratorOptions {
    /// Combines node-level defaults with per-generator options. The suffix
    /// hash is disabled if either level disables it; labels and annotations
    /// are unioned with the generator level winning on conflicting keys.
    fn resolved(spec: Option<&Self>, defaults: Option<&Self>) -> Self {
        let mut resolved = defaults.cloned().unwrap_or_default();
        if let Some(spec) = spec {
            resolved.disable_name_suffix_hash |= spec.disable_name_suffix_hash;
            resolved
                .labels
                .extend(spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            resolved
                .annotations
                .extend(spec.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        resolved
    }
}

/// Produces exactly one document from `spec`, returning it together with its
/// identity.
pub fn generate(
    kind: GeneratorKind,
    spec: &GeneratorSpec,
    defaults: Option<&GeneratorOptions>,
    loader: &dyn Loader,
) -> Result<(ResourceId, Document)> {
    ensure!(
        spec.name.len() <= RFC_1123_SUBDOMAIN_MAX_LENGTH
            && RFC_1123_SUBDOMAIN_REGEX.is_match(&spec.name),
        InvalidNameSnafu { name: &spec.name }
    );

    let options = GeneratorOptions::resolved(spec.options.as_ref(), defaults);
    let data = collect_data(spec, loader)?;

    let name = if options.disable_name_suffix_hash {
        spec.name.clone()
    } else {
        let suffix = content_hash(kind, &spec.name, &data)?;
        format!("{name}-{suffix}", name = spec.name)
    };

    let mut root = Map::new();
    root.insert("apiVersion".to_owned(), json!("v1"));
    root.insert("kind".to_owned(), json!(kind.to_string()));
    let mut document = Document::new(Value::Object(root)).context(AssembleDocumentSnafu)?;

    document.set_path(&["metadata", "name"], json!(name));
    if let Some(namespace) = &spec.namespace {
        document.set_path(&["metadata", "namespace"], json!(namespace));
    }
    if !options.labels.is_empty() {
        document.set_path(&["metadata", "labels"], json!(options.labels));
    }
    if !options.annotations.is_empty() {
        document.set_path(&["metadata", "annotations"], json!(options.annotations));
    }

    match kind {
        GeneratorKind::ConfigMap => {
            let entries: Map<String, Value> = data
                .iter()
                .map(|(key, value)| (key.clone(), json!(value)))
                .collect();
            document.set_path(&["data"], Value::Object(entries));
        }
        GeneratorKind::Secret => {
            document.set_path(&["type"], json!("Opaque"));
            let entries: Map<String, Value> = data
                .iter()
                .map(|(key, value)| (key.clone(), json!(BASE64.encode(value))))
                .collect();
            document.set_path(&["data"], Value::Object(entries));
        }
    }

    let id = document.id().context(AssembleDocumentSnafu)?;
    debug!(%id, "generated resource");
    Ok((id, document))
}

/// Gathers the data mapping in declaration order: literals first, then file
/// contents.
fn collect_data(spec: &GeneratorSpec, loader: &dyn Loader) -> Result<IndexMap<String, String>> {
    let mut data = IndexMap::new();

    for literal in &spec.literals {
        let (key, value) = literal
            .split_once('=')
            .context(MalformedLiteralSnafu { literal })?;
        ensure!(
            data.insert(key.to_owned(), value.to_owned()).is_none(),
            DuplicateKeySnafu {
                key,
                name: &spec.name,
            }
        );
    }

    for file in &spec.files {
        let (key, path) = match file.split_once('=') {
            Some((key, path)) => (key.to_owned(), path),
            None => {
                let file_name = file.rsplit('/').next().unwrap_or(file);
                (file_name.to_owned(), file.as_str())
            }
        };
        let contents = loader.load(path).context(ReadFileSnafu {
            path,
            name: &spec.name,
        })?;
        ensure!(
            data.insert(key.clone(), contents).is_none(),
            DuplicateKeySnafu {
                key,
                name: &spec.name,
            }
        );
    }

    Ok(data)
}

/// First 10 hex characters of the SHA-256 over a canonical JSON encoding of
/// the generator content. Data keys are sorted so the hash depends on the
/// content alone, not on declaration order.
fn content_hash(
    kind: GeneratorKind,
    name: &str,
    data: &IndexMap<String, String>,
) -> Result<String> {
    let sorted: BTreeMap<&str, &str> = data
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    let canonical = serde_json::to_vec(&json!({
        "kind": kind.to_string(),
        "name": name,
        "data": sorted,
    }))
    .context(SerializeContentSnafu)?;

    let digest = Sha256::digest(&canonical);
    let mut hex = String::with_capacity(10);
    for byte in digest.iter().take(5) {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}
