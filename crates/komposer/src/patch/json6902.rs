//! Pointer-addressed patching in the RFC 6902 dialect.
//!
//! A patch is an ordered list of operations, each addressing a location with
//! an RFC 6901 pointer. Application is all-or-nothing per patch: operations
//! run in order against a working copy, and the target only sees the result
//! once every operation succeeded.
use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse patch operations"))]
    ParseOperations { source: serde_yaml::Error },

    #[snafu(display("pointer {pointer:?} must be empty or start with '/'"))]
    MalformedPointer { pointer: String },

    #[snafu(display("pointer {pointer:?} does not resolve to an existing location"))]
    UnresolvedPointer { pointer: String },

    #[snafu(display("array index {token:?} in pointer {pointer:?} is not valid"))]
    InvalidIndex { token: String, pointer: String },

    #[snafu(display("cannot move {from:?} into its own child {path:?}"))]
    MoveIntoSelf { from: String, path: String },

    #[snafu(display("test at {pointer:?} failed: value does not match the expected value"))]
    TestFailed { pointer: String },
}

/// An RFC 6901 pointer, kept in its escaped string form until resolution.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Pointer(String);

impl Pointer {
    pub fn new(pointer: impl Into<String>) -> Self {
        Self(pointer.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits into unescaped reference tokens. The empty pointer addresses
    /// the whole document and has no tokens.
    fn tokens(&self) -> Result<Vec<String>> {
        if self.0.is_empty() {
            return Ok(Vec::new());
        }
        ensure!(
            self.0.starts_with('/'),
            MalformedPointerSnafu { pointer: &self.0 }
        );

        // `~1` must be unescaped before `~0`, otherwise `~01` would turn
        // into `/` instead of the literal `~1`.
        Ok(self.0[1..]
            .split('/')
            .map(|token| token.replace("~1", "/").replace("~0", "~"))
            .collect())
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One patch operation. The serialized form is the standard
/// `{"op": ..., "path": ..., ...}` object.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Add { path: Pointer, value: Value },
    Remove { path: Pointer },
    Replace { path: Pointer, value: Value },
    Move { from: Pointer, path: Pointer },
    Copy { from: Pointer, path: Pointer },
    Test { path: Pointer, value: Value },
}

/// Parses an operation list from its serialized form. JSON and YAML are both
/// accepted, since patch files come in either.
pub fn parse_operations(input: &str) -> Result<Vec<Operation>> {
    serde_yaml::from_str(input).context(ParseOperationsSnafu)
}

/// Applies `operations` to `target`, atomically.
///
/// Operations run in order against one working copy. If any operation fails
/// the copy is discarded and `target` is left exactly as it was.
pub fn apply(target: &mut Value, operations: &[Operation]) -> Result<()> {
    let mut staged = target.clone();
    for operation in operations {
        apply_one(&mut staged, operation)?;
    }
    *target = staged;
    Ok(())
}

fn apply_one(document: &mut Value, operation: &Operation) -> Result<()> {
    match operation {
        Operation::Add { path, value } => add(document, path, value.clone()),
        Operation::Remove { path } => remove(document, path).map(|_| ()),
        Operation::Replace { path, value } => {
            let target = resolve_mut(document, path)?;
            *target = value.clone();
            Ok(())
        }
        Operation::Move { from, path } => {
            let from_tokens = from.tokens()?;
            let path_tokens = path.tokens()?;
            ensure!(
                path_tokens.len() <= from_tokens.len()
                    || path_tokens[..from_tokens.len()] != from_tokens[..],
                MoveIntoSelfSnafu {
                    from: from.as_str(),
                    path: path.as_str(),
                }
            );

            let value = remove(document, from)?;
            add(document, path, value)
        }
        Operation::Copy { from, path } => {
            let value = resolve(document, from)?.clone();
            add(document, path, value)
        }
        Operation::Test { path, value } => {
            let actual = resolve(document, path)?;
            ensure!(
                actual == value,
                TestFailedSnafu {
                    pointer: path.as_str(),
                }
            );
            Ok(())
        }
    }
}

/// `add` creates-or-overwrites an object key, inserts into an array (`-`
/// appends), or replaces the whole document for the empty pointer.
fn add(document: &mut Value, path: &Pointer, value: Value) -> Result<()> {
    let tokens = path.tokens()?;
    let Some((last, parents)) = tokens.split_last() else {
        *document = value;
        return Ok(());
    };

    let parent = resolve_slice_mut(document, parents, path)?;
    match parent {
        Value::Object(object) => {
            object.insert(last.clone(), value);
        }
        Value::Array(items) => {
            if last.as_str() == "-" {
                items.push(value);
            } else {
                let index = parse_index(last, items.len(), path, IndexBound::Inclusive)?;
                items.insert(index, value);
            }
        }
        _ => {
            return UnresolvedPointerSnafu {
                pointer: path.as_str(),
            }
            .fail();
        }
    }
    Ok(())
}

fn remove(document: &mut Value, path: &Pointer) -> Result<Value> {
    let tokens = path.tokens()?;
    let Some((last, parents)) = tokens.split_last() else {
        // The whole document cannot be removed.
        return UnresolvedPointerSnafu {
            pointer: path.as_str(),
        }
        .fail();
    };

    let parent = resolve_slice_mut(document, parents, path)?;
    match parent {
        Value::Object(object) => {
            object
                .shift_remove(last.as_str())
                .context(UnresolvedPointerSnafu {
                    pointer: path.as_str(),
                })
        }
        Value::Array(items) => {
            let index = parse_index(last, items.len(), path, IndexBound::Exclusive)?;
            Ok(items.remove(index))
        }
        _ => UnresolvedPointerSnafu {
            pointer: path.as_str(),
        }
        .fail(),
    }
}

fn resolve<'a>(document: &'a Value, path: &Pointer) -> Result<&'a Value> {
    let mut current = document;
    for token in path.tokens()? {
        current = match current {
            Value::Object(object) => object.get(&token).context(UnresolvedPointerSnafu {
                pointer: path.as_str(),
            })?,
            Value::Array(items) => {
                let index = parse_index(&token, items.len(), path, IndexBound::Exclusive)?;
                &items[index]
            }
            _ => {
                return UnresolvedPointerSnafu {
                    pointer: path.as_str(),
                }
                .fail();
            }
        };
    }
    Ok(current)
}

fn resolve_mut<'a>(document: &'a mut Value, path: &Pointer) -> Result<&'a mut Value> {
    let tokens = path.tokens()?;
    resolve_slice_mut(document, &tokens, path)
}

fn resolve_slice_mut<'a>(
    document: &'a mut Value,
    tokens: &[String],
    pointer: &Pointer,
) -> Result<&'a mut Value> {
    let mut current = document;
    for token in tokens {
        current = match current {
            Value::Object(object) => object.get_mut(token).context(UnresolvedPointerSnafu {
                pointer: pointer.as_str(),
            })?,
            Value::Array(items) => {
                let index = parse_index(token, items.len(), pointer, IndexBound::Exclusive)?;
                &mut items[index]
            }
            _ => {
                return UnresolvedPointerSnafu {
                    pointer: pointer.as_str(),
                }
                .fail();
            }
        };
    }
    Ok(current)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum IndexBound {
    /// The index may equal the array length (`add` appends there).
    Inclusive,
    /// The index must address an existing element.
    Exclusive,
}

fn parse_index(token: &str, len: usize, pointer: &Pointer, bound: IndexBound) -> Result<usize> {
    // RFC 6901: decimal digits only, no leading zeros.
    let well_formed = !token.is_empty()
        && token.chars().all(|c| c.is_ascii_digit())
        && !(token.len() > 1 && token.starts_with('0'));
    let index = well_formed.then(|| token.parse::<usize>().ok()).flatten();

    match index {
        Some(index) if index < len || (bound == IndexBound::Inclusive && index == len) => Ok(index),
        _ => InvalidIndexSnafu {
            token,
            pointer: pointer.as_str(),
        }
        .fail(),
    }
}
