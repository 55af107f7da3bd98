//! The recursive accumulation walk.
//!
//! Each node resolves its resource references in declaration order (nested
//! nodes recursively, raw documents directly), runs its generators, then
//! applies its strategic merge patches and pointer patches to what has been
//! gathered so far. The walk is fail-fast: the first error aborts the whole
//! accumulation, and a partial registry is never returned.
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::debug;

use crate::{
    document::{self, Document},
    generator::{self, GeneratorKind},
    loader::{self, Loader},
    overlay::{self, OVERLAY_FILE_NAME, OverlaySpec},
    patch::{
        json6902,
        strategic::{self, MergeKeys},
    },
    registry::{self, Registry},
    resid::{ResourceId, Selector},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load the overlay file of {path:?}"))]
    LoadOverlayFile { source: loader::Error, path: String },

    #[snafu(display("failed to parse the overlay file of {path:?}"))]
    ParseOverlayFile { source: overlay::Error, path: String },

    #[snafu(display("reference cycle: {path:?} is already being accumulated"))]
    ReferenceCycle { path: String },

    #[snafu(display("failed to load resource {reference:?}"))]
    LoadResource {
        source: loader::Error,
        reference: String,
    },

    #[snafu(display("failed to parse resource {reference:?}"))]
    ParseResource {
        source: document::Error,
        reference: String,
    },

    #[snafu(display("failed to register resources from {reference:?}"))]
    Register {
        source: registry::Error,
        reference: String,
    },

    #[snafu(display("failed to run generator {name:?}"))]
    Generate {
        source: generator::Error,
        name: String,
    },

    #[snafu(display("failed to register the output of generator {name:?}"))]
    RegisterGenerated {
        source: registry::Error,
        name: String,
    },

    #[snafu(display("failed to load patch {reference:?}"))]
    LoadPatch {
        source: loader::Error,
        reference: String,
    },

    #[snafu(display("failed to parse patch {reference:?}"))]
    ParsePatch {
        source: document::Error,
        reference: String,
    },

    #[snafu(display("strategic merge patch {reference:?} targets {id}, which is not in the registry"))]
    PatchTargetMissing { reference: String, id: ResourceId },

    #[snafu(display("failed to apply strategic merge patch {reference:?} to {id}"))]
    ApplyStrategicPatch {
        source: strategic::Error,
        reference: String,
        id: ResourceId,
    },

    #[snafu(display("failed to parse patch operations {reference:?}"))]
    ParseOperations {
        source: json6902::Error,
        reference: String,
    },

    #[snafu(display("patch selector {selector} matched {count} resources, expected exactly one"))]
    SelectorCardinality { selector: Selector, count: usize },

    #[snafu(display("failed to apply patch operations {reference:?} to {id}"))]
    ApplyOperations {
        source: json6902::Error,
        reference: String,
        id: ResourceId,
    },
}

/// Accumulates the overlay tree rooted at `loader` with the default merge
/// keys.
pub fn accumulate(loader: &dyn Loader) -> Result<Registry> {
    Accumulator::new().accumulate(loader)
}

/// The composition engine.
///
/// Holds the merge-key table consulted by strategic merge patches;
/// everything else is per-call state. Accumulation is synchronous recursive
/// descent, and every registry it returns was built by exactly one call.
#[derive(Debug, Default)]
pub struct Accumulator {
    merge_keys: MergeKeys,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine with a custom merge-key table.
    pub fn with_merge_keys(merge_keys: MergeKeys) -> Self {
        Self { merge_keys }
    }

    /// Accumulates the overlay tree rooted at `loader` into one registry.
    pub fn accumulate(&self, loader: &dyn Loader) -> Result<Registry> {
        let mut stack = Vec::new();
        self.accumulate_node(loader, &mut stack)
    }

    /// One node of the walk. `stack` holds the canonical paths currently
    /// being accumulated; meeting one of them again means the reference
    /// graph has a cycle, and recursing would never terminate.
    fn accumulate_node(&self, loader: &dyn Loader, stack: &mut Vec<String>) -> Result<Registry> {
        let root = loader.root().to_owned();
        ensure!(!stack.contains(&root), ReferenceCycleSnafu { path: root });

        stack.push(root);
        let registry = self.accumulate_inner(loader, stack);
        stack.pop();
        registry
    }

    fn accumulate_inner(&self, loader: &dyn Loader, stack: &mut Vec<String>) -> Result<Registry> {
        let path = loader.root();
        debug!(path, "accumulating overlay node");

        let raw = loader
            .load(OVERLAY_FILE_NAME)
            .context(LoadOverlayFileSnafu { path })?;
        let spec = OverlaySpec::parse(&raw).context(ParseOverlayFileSnafu { path })?;

        let mut registry = Registry::new();

        for reference in &spec.resources {
            if loader.is_dir(reference) {
                let nested = loader
                    .descend(reference)
                    .context(LoadResourceSnafu { reference })?;
                let nested_registry = self.accumulate_node(nested.as_ref(), stack)?;
                registry
                    .merge_append(nested_registry)
                    .context(RegisterSnafu { reference })?;
            } else {
                let contents = loader
                    .load(reference)
                    .context(LoadResourceSnafu { reference })?;
                let documents = Document::from_yaml_stream(&contents)
                    .context(ParseResourceSnafu { reference })?;
                for document in documents {
                    let id = document.id().context(ParseResourceSnafu { reference })?;
                    debug!(%id, %reference, "registering resource");
                    registry
                        .append(id, document)
                        .context(RegisterSnafu { reference })?;
                }
            }
        }

        let generators = spec
            .config_map_generator
            .iter()
            .map(|generator| (GeneratorKind::ConfigMap, generator))
            .chain(
                spec.secret_generator
                    .iter()
                    .map(|generator| (GeneratorKind::Secret, generator)),
            );
        for (kind, generator_spec) in generators {
            let (id, document) =
                generator::generate(kind, generator_spec, spec.generator_options.as_ref(), loader)
                    .context(GenerateSnafu {
                        name: &generator_spec.name,
                    })?;
            registry
                .append(id, document)
                .context(RegisterGeneratedSnafu {
                    name: &generator_spec.name,
                })?;
        }

        for reference in &spec.patches_strategic_merge {
            let contents = loader.load(reference).context(LoadPatchSnafu { reference })?;
            let patches =
                Document::from_yaml_stream(&contents).context(ParsePatchSnafu { reference })?;
            for patch in patches {
                let id = patch.id().context(ParsePatchSnafu { reference })?;
                let target = registry.find_mut(&id).context(PatchTargetMissingSnafu {
                    reference,
                    id: id.clone(),
                })?;
                debug!(%id, %reference, "applying strategic merge patch");
                strategic::merge(target.root_mut(), patch.root(), &self.merge_keys, &id.kind)
                    .context(ApplyStrategicPatchSnafu {
                        reference,
                        id: id.clone(),
                    })?;
            }
        }

        for patch in &spec.patches_json6902 {
            let reference = &patch.path;
            let contents = loader.load(reference).context(LoadPatchSnafu { reference })?;
            let operations = json6902::parse_operations(&contents)
                .context(ParseOperationsSnafu { reference })?;

            let mut matches = registry.select_mut(&patch.target);
            let count = matches.len();
            match (matches.pop(), count) {
                (Some((id, target)), 1) => {
                    debug!(%id, %reference, "applying pointer patch");
                    json6902::apply(target.root_mut(), &operations).context(
                        ApplyOperationsSnafu {
                            reference,
                            id: id.clone(),
                        },
                    )?;
                }
                _ => {
                    return SelectorCardinalitySnafu {
                        selector: patch.target.clone(),
                        count,
                    }
                    .fail();
                }
            }
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;
    use crate::loader::InMemoryLoader;

    const DEPLOYMENT: &str = indoc! {"
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: my-app
        spec:
          replicas: 1
    "};

    #[test]
    fn single_node_registers_resources_in_order() {
        let loader = InMemoryLoader::builder()
            .overlay("/app", "resources:\n- deployment.yaml\n- services.yaml\n")
            .file("/app/deployment.yaml", DEPLOYMENT)
            .file(
                "/app/services.yaml",
                indoc! {"
                    apiVersion: v1
                    kind: Service
                    metadata:
                      name: first
                    ---
                    apiVersion: v1
                    kind: Service
                    metadata:
                      name: second
                "},
            )
            .build("/app");

        let registry = accumulate(&loader).expect("tree is well-formed");
        let ids: Vec<_> = registry.ids().map(ToString::to_string).collect();
        assert_eq!(
            ids,
            [
                "apps_v1_Deployment|~X|my-app",
                "~G_v1_Service|~X|first",
                "~G_v1_Service|~X|second",
            ]
        );
    }

    #[test]
    fn nested_nodes_merge_in_declaration_order() {
        let loader = InMemoryLoader::builder()
            .overlay("/app/base", "resources:\n- deployment.yaml\n")
            .file("/app/base/deployment.yaml", DEPLOYMENT)
            .overlay("/app/dev", "resources:\n- ../base\n- extra.yaml\n")
            .file(
                "/app/dev/extra.yaml",
                "apiVersion: v1\nkind: Service\nmetadata:\n  name: extra\n",
            )
            .build("/app/dev");

        let registry = accumulate(&loader).expect("tree is well-formed");
        let ids: Vec<_> = registry.ids().map(ToString::to_string).collect();
        assert_eq!(
            ids,
            ["apps_v1_Deployment|~X|my-app", "~G_v1_Service|~X|extra"]
        );
    }

    #[test]
    fn diamond_references_conflict_on_the_shared_id() {
        let loader = InMemoryLoader::builder()
            .overlay("/app/base", "resources:\n- deployment.yaml\n")
            .file("/app/base/deployment.yaml", DEPLOYMENT)
            .overlay("/app/left", "resources:\n- ../base\n")
            .overlay("/app/right", "resources:\n- ../base\n")
            .overlay("/app/top", "resources:\n- ../left\n- ../right\n")
            .build("/app/top");

        let err = accumulate(&loader).expect_err("the same base is reachable twice");
        assert!(matches!(
            err,
            Error::Register {
                source: registry::Error::AlreadyRegistered { ref id },
                ref reference,
            } if id.to_string() == "apps_v1_Deployment|~X|my-app" && reference == "../right"
        ));
    }

    #[test]
    fn reference_cycles_are_detected() {
        let loader = InMemoryLoader::builder()
            .overlay("/app/a", "resources:\n- ../b\n")
            .overlay("/app/b", "resources:\n- ../a\n")
            .build("/app/a");

        let err = accumulate(&loader).expect_err("the reference graph has a cycle");
        assert!(matches!(
            err,
            Error::ReferenceCycle { ref path } if path == "/app/a"
        ));
    }

    #[test]
    fn strategic_patch_requires_its_target() {
        let loader = InMemoryLoader::builder()
            .overlay(
                "/app",
                "resources:\n- deployment.yaml\npatchesStrategicMerge:\n- patch.yaml\n",
            )
            .file("/app/deployment.yaml", DEPLOYMENT)
            .file(
                "/app/patch.yaml",
                indoc! {"
                    apiVersion: apps/v1
                    kind: Deployment
                    metadata:
                      name: someone-else
                    spec:
                      replicas: 3
                "},
            )
            .build("/app");

        let err = accumulate(&loader).expect_err("patch target is absent");
        assert!(matches!(
            err,
            Error::PatchTargetMissing { ref id, .. }
                if id.to_string() == "apps_v1_Deployment|~X|someone-else"
        ));
    }

    #[test]
    fn strategic_patch_mutates_the_registered_document() {
        let loader = InMemoryLoader::builder()
            .overlay(
                "/app",
                "resources:\n- deployment.yaml\npatchesStrategicMerge:\n- patch.yaml\n",
            )
            .file("/app/deployment.yaml", DEPLOYMENT)
            .file(
                "/app/patch.yaml",
                indoc! {"
                    apiVersion: apps/v1
                    kind: Deployment
                    metadata:
                      name: my-app
                    spec:
                      replicas: 3
                "},
            )
            .build("/app");

        let registry = accumulate(&loader).expect("tree is well-formed");
        let document = registry
            .iter()
            .map(|(_, document)| document)
            .next()
            .expect("one resource accumulated");
        assert_eq!(document.get_path(&["spec", "replicas"]), Some(&json!(3)));
    }

    #[test]
    fn pointer_patch_selector_must_match_exactly_one() {
        let tree = InMemoryLoader::builder()
            .overlay(
                "/app",
                indoc! {"
                    resources:
                    - deployment.yaml
                    patchesJson6902:
                    - target:
                        kind: StatefulSet
                      path: patch.json
                "},
            )
            .file("/app/deployment.yaml", DEPLOYMENT)
            .file(
                "/app/patch.json",
                r#"[{"op": "replace", "path": "/spec/replicas", "value": 3}]"#,
            );

        let err = accumulate(&tree.build("/app")).expect_err("nothing matches the selector");
        assert!(matches!(err, Error::SelectorCardinality { count: 0, .. }));
    }

    #[test]
    fn pointer_patch_rejects_ambiguous_selectors() {
        let loader = InMemoryLoader::builder()
            .overlay(
                "/app",
                indoc! {"
                    resources:
                    - services.yaml
                    patchesJson6902:
                    - target:
                        kind: Service
                      path: patch.json
                "},
            )
            .file(
                "/app/services.yaml",
                indoc! {"
                    apiVersion: v1
                    kind: Service
                    metadata:
                      name: first
                    ---
                    apiVersion: v1
                    kind: Service
                    metadata:
                      name: second
                "},
            )
            .file(
                "/app/patch.json",
                r#"[{"op": "add", "path": "/spec", "value": {}}]"#,
            )
            .build("/app");

        let err = accumulate(&loader).expect_err("two resources match the selector");
        assert!(matches!(err, Error::SelectorCardinality { count: 2, .. }));
    }

    #[test]
    fn generated_names_conflict_like_any_other_id() {
        let loader = InMemoryLoader::builder()
            .overlay(
                "/app",
                indoc! {"
                    configMapGenerator:
                    - name: my-config
                      literals:
                      - A=1
                    - name: my-config
                      literals:
                      - A=1
                    generatorOptions:
                      disableNameSuffixHash: true
                "},
            )
            .build("/app");

        let err = accumulate(&loader).expect_err("both generators produce the same id");
        assert!(matches!(
            err,
            Error::RegisterGenerated {
                source: registry::Error::AlreadyRegistered { .. },
                ..
            }
        ));
    }

    #[test]
    fn missing_overlay_file_is_a_load_error() {
        let loader = InMemoryLoader::builder().build("/app");
        let err = accumulate(&loader).expect_err("the node has no overlay file");
        assert!(matches!(err, Error::LoadOverlayFile { .. }));
    }
}
