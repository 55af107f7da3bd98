//! Strategic merge patching: a partial document is merged into a target
//! document recursively, with merge behavior decided per field shape.
//!
//! Objects merge field by field, scalar fields are replaced, and arrays
//! either merge element-wise by a declared merge key or replace the target
//! array wholesale. An explicit `null` value deletes the field, and the
//! `$patch: delete` / `$patch: replace` directives remove or overwrite whole
//! subtrees. Fields the patch does not mention are never touched.
use serde_json::{Map, Value};
use snafu::Snafu;

type Result<T, E = Error> = std::result::Result<T, E>;

/// Key carrying a patch directive inside a patch object.
pub const DIRECTIVE_KEY: &str = "$patch";

const DIRECTIVE_DELETE: &str = "delete";
const DIRECTIVE_REPLACE: &str = "replace";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("$patch: delete targets field {field:?} which is not present"))]
    DeleteFieldMissing { field: String },

    #[snafu(display(
        "$patch: delete matches no element of {field:?} with {key} = {value}",
    ))]
    DeleteElementMissing {
        field: String,
        key: String,
        value: String,
    },

    #[snafu(display("unsupported $patch directive {directive:?} at field {field:?}"))]
    UnsupportedDirective { directive: String, field: String },
}

/// The static merge-key table.
///
/// Maps an object kind (or a wildcard) plus a field path to the element field
/// that identifies elements of an object array. Paths are the slash-joined
/// object field names from the document root; array traversal is implicit and
/// indices never appear (`spec/template/spec/containers/env`). Field paths
/// without an entry fall back to wholesale array replacement.
#[derive(Clone, Debug)]
pub struct MergeKeys {
    rules: Vec<MergeKeyRule>,
}

#[derive(Clone, Debug)]
struct MergeKeyRule {
    /// `None` matches any kind.
    kind: Option<String>,
    path: String,
    key: String,
}

/// Merge keys for the workload and service shapes the engine is expected to
/// handle out of the box.
const DEFAULT_RULES: &[(&str, &str, &str)] = &[
    // Pod templates embedded in workload controllers.
    ("", "spec/template/spec/containers", "name"),
    ("", "spec/template/spec/initContainers", "name"),
    ("", "spec/template/spec/volumes", "name"),
    ("", "spec/template/spec/imagePullSecrets", "name"),
    ("", "spec/template/spec/containers/env", "name"),
    ("", "spec/template/spec/containers/ports", "containerPort"),
    ("", "spec/template/spec/containers/volumeMounts", "mountPath"),
    ("", "spec/template/spec/initContainers/env", "name"),
    ("", "spec/template/spec/initContainers/ports", "containerPort"),
    ("", "spec/template/spec/initContainers/volumeMounts", "mountPath"),
    // Bare pods.
    ("Pod", "spec/containers", "name"),
    ("Pod", "spec/initContainers", "name"),
    ("Pod", "spec/volumes", "name"),
    ("Pod", "spec/containers/env", "name"),
    ("Pod", "spec/containers/ports", "containerPort"),
    ("Pod", "spec/containers/volumeMounts", "mountPath"),
    ("Service", "spec/ports", "port"),
];

impl MergeKeys {
    /// A table with no rules: every array replaces wholesale.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Adds a rule. `kind: None` applies to every object kind; a rule for a
    /// specific kind takes precedence over a wildcard rule on the same path.
    pub fn insert(&mut self, kind: Option<&str>, path: &str, key: &str) {
        self.rules.push(MergeKeyRule {
            kind: kind.map(str::to_owned),
            path: path.to_owned(),
            key: key.to_owned(),
        });
    }

    fn lookup(&self, kind: &str, path: &str) -> Option<&str> {
        let mut wildcard = None;
        for rule in &self.rules {
            if rule.path != path {
                continue;
            }
            match rule.kind.as_deref() {
                Some(rule_kind) if rule_kind == kind => return Some(&rule.key),
                Some(_) => {}
                None => wildcard = Some(rule.key.as_str()),
            }
        }
        wildcard
    }
}

impl Default for MergeKeys {
    fn default() -> Self {
        let mut keys = Self::empty();
        for (kind, path, key) in DEFAULT_RULES {
            let kind = (!kind.is_empty()).then_some(*kind);
            keys.insert(kind, path, key);
        }
        keys
    }
}

/// Merges `patch` into `target` in place.
///
/// `kind` is the object kind of the target, consulted together with the
/// field path when looking up merge keys.
pub fn merge(target: &mut Value, patch: &Value, keys: &MergeKeys, kind: &str) -> Result<()> {
    let mut merger = Merger {
        keys,
        kind,
        path: Vec::new(),
    };
    merger.merge_field(target, patch)
}

struct Merger<'a> {
    keys: &'a MergeKeys,
    kind: &'a str,
    /// Object field names on the path from the document root to the field
    /// currently being merged.
    path: Vec<String>,
}

impl Merger<'_> {
    fn merge_field(&mut self, target: &mut Value, patch: &Value) -> Result<()> {
        match (target, patch) {
            (Value::Object(target), Value::Object(patch)) => self.merge_objects(target, patch),
            (Value::Array(target), Value::Array(patch)) => self.merge_arrays(target, patch),
            // Irreconcilable shapes are resolved by replacement, not failure.
            (target, patch) => {
                *target = cleaned(patch);
                Ok(())
            }
        }
    }

    fn merge_objects(&mut self, target: &mut Map<String, Value>, patch: &Map<String, Value>) -> Result<()> {
        for (field, patch_value) in patch {
            // A directive at this level was consumed by the level above.
            if field == DIRECTIVE_KEY {
                continue;
            }

            // An explicit null deletes the field; deleting an absent field is
            // a no-op, unlike the delete directive below.
            if patch_value.is_null() {
                target.shift_remove(field);
                continue;
            }

            if let Some(directive) = directive_of(patch_value) {
                match directive {
                    DIRECTIVE_DELETE => {
                        if target.shift_remove(field).is_none() {
                            return DeleteFieldMissingSnafu {
                                field: self.path_to(field),
                            }
                            .fail();
                        }
                    }
                    DIRECTIVE_REPLACE => {
                        target.insert(field.clone(), cleaned(patch_value));
                    }
                    directive => {
                        return UnsupportedDirectiveSnafu {
                            directive,
                            field: self.path_to(field),
                        }
                        .fail();
                    }
                }
                continue;
            }

            match target.get_mut(field) {
                None => {
                    target.insert(field.clone(), cleaned(patch_value));
                }
                Some(target_value) => {
                    self.path.push(field.clone());
                    let merged = self.merge_field(target_value, patch_value);
                    self.path.pop();
                    merged?;
                }
            }
        }

        Ok(())
    }

    fn merge_arrays(&mut self, target: &mut Vec<Value>, patch: &[Value]) -> Result<()> {
        let path = self.path.join("/");
        let merge_key = self.keys.lookup(self.kind, &path).filter(|_| {
            target.iter().all(Value::is_object) && patch.iter().all(Value::is_object)
        });

        let Some(merge_key) = merge_key else {
            // Scalar arrays carry no element identity, and object arrays
            // without a declared key behave the same: wholesale replacement.
            *target = patch.iter().map(cleaned).collect();
            return Ok(());
        };
        let merge_key = merge_key.to_owned();

        for patch_element in patch {
            let key_value = patch_element.get(&merge_key);

            if directive_of(patch_element) == Some(DIRECTIVE_DELETE) {
                let position = key_value.and_then(|key_value| {
                    target
                        .iter()
                        .position(|element| element.get(&merge_key) == Some(key_value))
                });
                match position {
                    Some(position) => {
                        target.remove(position);
                    }
                    None => {
                        return DeleteElementMissingSnafu {
                            field: path,
                            key: merge_key,
                            value: key_value.cloned().unwrap_or(Value::Null).to_string(),
                        }
                        .fail();
                    }
                }
                continue;
            }

            let position = key_value.and_then(|key_value| {
                target
                    .iter()
                    .position(|element| element.get(&merge_key) == Some(key_value))
            });
            match position {
                // The element fields continue the field path, the array
                // itself adds no segment.
                Some(position) => self.merge_field(&mut target[position], patch_element)?,
                None => target.push(cleaned(patch_element)),
            }
        }

        Ok(())
    }

    fn path_to(&self, field: &str) -> String {
        let mut path = self.path.join("/");
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(field);
        path
    }
}

fn directive_of(value: &Value) -> Option<&str> {
    value.as_object()?.get(DIRECTIVE_KEY)?.as_str()
}

/// Clones a patch value for insertion into the target, dropping everything
/// that only has meaning inside a patch: directive keys, elements marked for
/// deletion, and null-valued object fields.
fn cleaned(value: &Value) -> Value {
    let mut value = value.clone();
    strip_patch_markup(&mut value);
    value
}

fn strip_patch_markup(value: &mut Value) {
    match value {
        Value::Object(object) => {
            object.shift_remove(DIRECTIVE_KEY);
            object.retain(|_, field_value| !field_value.is_null());
            for field_value in object.values_mut() {
                strip_patch_markup(field_value);
            }
        }
        Value::Array(items) => {
            items.retain(|item| directive_of(item) != Some(DIRECTIVE_DELETE));
            for item in items {
                strip_patch_markup(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    fn value(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).expect("fixture YAML is valid")
    }

    fn merge_for_kind(kind: &str, target: &str, patch: &str) -> Result<Value> {
        let mut target = value(target);
        merge(&mut target, &value(patch), &MergeKeys::default(), kind)?;
        Ok(target)
    }

    #[test]
    fn untouched_fields_survive() {
        let merged = merge_for_kind(
            "StatefulSet",
            indoc! {"
                spec:
                  serviceName: my-svc
                  replicas: 3
            "},
            indoc! {"
                spec:
                  serviceName: my-https-svc
            "},
        )
        .expect("merge succeeds");

        assert_eq!(
            merged,
            value(indoc! {"
                spec:
                  serviceName: my-https-svc
                  replicas: 3
            "})
        );
    }

    #[test]
    fn absent_fields_are_added() {
        let merged = merge_for_kind(
            "StatefulSet",
            "spec: {replicas: 1}",
            "spec: {revisionHistoryLimit: 5}",
        )
        .expect("merge succeeds");

        assert_eq!(merged, value("spec: {replicas: 1, revisionHistoryLimit: 5}"));
    }

    #[test]
    fn explicit_null_deletes_a_field() {
        let merged = merge_for_kind(
            "StatefulSet",
            "spec: {replicas: 3, serviceName: my-svc}",
            "spec: {replicas: null}",
        )
        .expect("merge succeeds");

        assert_eq!(merged, value("spec: {serviceName: my-svc}"));
    }

    #[test]
    fn scalar_arrays_replace_wholesale() {
        let merged = merge_for_kind(
            "ConfigMap",
            "data: {items: [a, b, c]}",
            "data: {items: [d]}",
        )
        .expect("merge succeeds");

        assert_eq!(merged, value("data: {items: [d]}"));
    }

    #[test]
    fn keyed_list_merges_matching_element_only() {
        let merged = merge_for_kind(
            "StatefulSet",
            indoc! {"
                spec:
                  template:
                    spec:
                      containers:
                      - name: app
                        image: my-image
                      - name: sidecar
                        image: sidecar-image
            "},
            indoc! {"
                spec:
                  template:
                    spec:
                      containers:
                      - name: app
                        envFrom:
                        - configMapRef:
                            name: my-config
            "},
        )
        .expect("merge succeeds");

        assert_eq!(
            merged,
            value(indoc! {"
                spec:
                  template:
                    spec:
                      containers:
                      - name: app
                        image: my-image
                        envFrom:
                        - configMapRef:
                            name: my-config
                      - name: sidecar
                        image: sidecar-image
            "})
        );
    }

    #[test]
    fn keyed_list_appends_unmatched_element() {
        let merged = merge_for_kind(
            "StatefulSet",
            indoc! {"
                spec:
                  template:
                    spec:
                      containers:
                      - name: app
                        image: my-image
            "},
            indoc! {"
                spec:
                  template:
                    spec:
                      containers:
                      - name: sidecar
                        image: sidecar-image
            "},
        )
        .expect("merge succeeds");

        let containers = merged
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array)
            .expect("containers survive the merge");
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].get("name"), Some(&Value::from("sidecar")));
    }

    #[test]
    fn keyed_list_delete_directive_removes_element() {
        let merged = merge_for_kind(
            "StatefulSet",
            indoc! {"
                spec:
                  template:
                    spec:
                      containers:
                      - name: app
                        image: my-image
                      - name: sidecar
                        image: sidecar-image
            "},
            indoc! {"
                spec:
                  template:
                    spec:
                      containers:
                      - name: sidecar
                        $patch: delete
            "},
        )
        .expect("merge succeeds");

        let containers = merged
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array)
            .expect("containers survive the merge");
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].get("name"), Some(&Value::from("app")));
    }

    #[test]
    fn delete_directive_without_match_fails() {
        let err = merge_for_kind(
            "StatefulSet",
            indoc! {"
                spec:
                  template:
                    spec:
                      containers:
                      - name: app
            "},
            indoc! {"
                spec:
                  template:
                    spec:
                      containers:
                      - name: ghost
                        $patch: delete
            "},
        )
        .expect_err("no element to delete");

        assert!(matches!(err, Error::DeleteElementMissing { ref key, .. } if key == "name"));
    }

    #[test]
    fn object_delete_directive_removes_field() {
        let merged = merge_for_kind(
            "StatefulSet",
            "spec: {updateStrategy: {type: OnDelete}, replicas: 1}",
            "spec: {updateStrategy: {$patch: delete}}",
        )
        .expect("merge succeeds");

        assert_eq!(merged, value("spec: {replicas: 1}"));
    }

    #[test]
    fn object_delete_directive_requires_the_field() {
        let err = merge_for_kind(
            "StatefulSet",
            "spec: {replicas: 1}",
            "spec: {updateStrategy: {$patch: delete}}",
        )
        .expect_err("field is absent");

        assert!(
            matches!(err, Error::DeleteFieldMissing { ref field } if field == "spec/updateStrategy")
        );
    }

    #[test]
    fn replace_directive_overwrites_wholesale() {
        let merged = merge_for_kind(
            "StatefulSet",
            "spec: {selector: {matchLabels: {app: old, tier: web}}}",
            "spec: {selector: {matchLabels: {app: new}, $patch: replace}}",
        )
        .expect("merge succeeds");

        assert_eq!(merged, value("spec: {selector: {matchLabels: {app: new}}}"));
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let err = merge_for_kind(
            "StatefulSet",
            "spec: {a: {b: 1}}",
            "spec: {a: {$patch: reticulate}}",
        )
        .expect_err("directive is unknown");

        assert!(
            matches!(err, Error::UnsupportedDirective { ref directive, .. } if directive == "reticulate")
        );
    }

    #[rstest]
    // Service ports merge by port number, not by name.
    #[case("Service", "spec: {ports: [{port: 443, name: https}, {port: 80, name: http}]}",
           "spec: {ports: [{port: 443, protocol: TCP}]}", 2)]
    // No merge key is declared for StatefulSet spec/ports, so the patch array wins.
    #[case("StatefulSet", "spec: {ports: [{port: 443}, {port: 80}]}",
           "spec: {ports: [{port: 9090}]}", 1)]
    fn merge_keys_are_kind_aware(
        #[case] kind: &str,
        #[case] target: &str,
        #[case] patch: &str,
        #[case] expected_ports: usize,
    ) {
        let merged = merge_for_kind(kind, target, patch).expect("merge succeeds");
        let ports = merged
            .pointer("/spec/ports")
            .and_then(Value::as_array)
            .expect("ports survive the merge");
        assert_eq!(ports.len(), expected_ports);
    }

    #[test]
    fn shape_disagreement_replaces_instead_of_failing() {
        let merged = merge_for_kind(
            "StatefulSet",
            "spec: {replicas: 3}",
            "spec: {replicas: {min: 1, max: 5}}",
        )
        .expect("merge succeeds");

        assert_eq!(merged, value("spec: {replicas: {min: 1, max: 5}}"));
    }

    #[test]
    fn inserted_subtrees_are_stripped_of_patch_markup() {
        let merged = merge_for_kind(
            "StatefulSet",
            "spec: {}",
            indoc! {"
                spec:
                  template:
                    metadata:
                      labels: null
                    spec:
                      containers:
                      - name: gone
                        $patch: delete
                      - name: kept
            "},
        )
        .expect("merge succeeds");

        assert_eq!(
            merged,
            value(indoc! {"
                spec:
                  template:
                    metadata: {}
                    spec:
                      containers:
                      - name: kept
            "})
        );
    }
}
