//! The overlay node data model: what one node directory declares.
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::{
    generator::{GeneratorOptions, GeneratorSpec},
    resid::Selector,
};

type Result<T, E = Error> = std::result::Result<T, E>;

/// File name the accumulation engine looks for in every node directory.
pub const OVERLAY_FILE_NAME: &str = "overlay.yaml";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse overlay file"))]
    Parse { source: serde_yaml::Error },
}

/// The parsed overlay file of one node.
///
/// All lists are ordered: declaration order is resolution and application
/// order.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct OverlaySpec {
    /// Resource references, either raw document files or nested node
    /// directories.
    pub resources: Vec<String>,

    /// Strategic merge patch files. Each file may hold several documents,
    /// applied in order.
    pub patches_strategic_merge: Vec<String>,

    /// Pointer-addressed patches with explicit target selectors.
    pub patches_json6902: Vec<PathPatchRef>,

    pub config_map_generator: Vec<GeneratorSpec>,

    pub secret_generator: Vec<GeneratorSpec>,

    /// Defaults for every generator declared at this node.
    pub generator_options: Option<GeneratorOptions>,
}

impl OverlaySpec {
    pub fn parse(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).context(ParseSnafu)
    }
}

/// One `patchesJson6902` entry: what the operations target and where they
/// live.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathPatchRef {
    pub target: Selector,
    pub path: String,
}
