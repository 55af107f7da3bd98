//! Loading of overlay trees from a backing store.
//!
//! The accumulation engine is agnostic about where overlay nodes live, it
//! only ever talks to the [`Loader`] interface. Two implementations ship with
//! the crate: [`FsLoader`] for real directory trees and [`InMemoryLoader`]
//! for tests and tools that assemble trees programmatically.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::overlay::OVERLAY_FILE_NAME;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{path:?} was not found under {root:?}"))]
    NotFound { path: String, root: String },

    #[snafu(display("failed to read {path:?}"))]
    Read {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("reference {path:?} is not a directory"))]
    NotADirectory { path: String },

    #[snafu(display("reference {path:?} escapes the filesystem root"))]
    Escape { path: String },

    #[snafu(display("root {path:?} is not representable as UTF-8"))]
    NonUtf8Root { path: PathBuf },
}

/// The interface the accumulation engine loads overlay nodes through.
pub trait Loader {
    /// Canonical path of the directory this loader is rooted at. Cycle
    /// detection relies on two loaders for the same node reporting the same
    /// root.
    fn root(&self) -> &str;

    /// Whether `reference` names a directory, i.e. a nested overlay node.
    fn is_dir(&self, reference: &str) -> bool;

    /// The contents of the file at `reference`, relative to the root.
    fn load(&self, reference: &str) -> Result<String>;

    /// A loader rooted at the referenced directory.
    fn descend(&self, reference: &str) -> Result<Box<dyn Loader>>;
}

/// Resolves `reference` against `base`, folding `.` and `..` segments into
/// an absolute slash-separated path. Walking above the root is an error.
pub(crate) fn normalize(base: &str, reference: &str) -> Result<String> {
    let joined = if reference.starts_with('/') {
        reference.to_owned()
    } else {
        format!("{base}/{reference}")
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                ensure!(segments.pop().is_some(), EscapeSnafu { path: reference });
            }
            segment => segments.push(segment),
        }
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Loads overlay nodes from the filesystem.
#[derive(Clone, Debug)]
pub struct FsLoader {
    root: String,
}

impl FsLoader {
    /// Roots a loader at `root`, which must be an existing directory. The
    /// path is canonicalized so symlinked aliases of the same node compare
    /// equal during cycle detection.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref();
        let canonical = path.canonicalize().with_context(|_| ReadSnafu {
            path: path.display().to_string(),
        })?;
        ensure!(canonical.is_dir(), NotADirectorySnafu {
            path: canonical.display().to_string(),
        });

        let root = canonical
            .into_os_string()
            .into_string()
            .map_err(|path| Error::NonUtf8Root {
                path: PathBuf::from(path),
            })?;
        Ok(Self { root })
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        Path::new(&self.root).join(reference)
    }
}

impl Loader for FsLoader {
    fn root(&self) -> &str {
        &self.root
    }

    fn is_dir(&self, reference: &str) -> bool {
        self.resolve(reference).is_dir()
    }

    fn load(&self, reference: &str) -> Result<String> {
        let path = self.resolve(reference);
        fs::read_to_string(&path).with_context(|_| ReadSnafu {
            path: path.display().to_string(),
        })
    }

    fn descend(&self, reference: &str) -> Result<Box<dyn Loader>> {
        let descended = Self::new(self.resolve(reference))?;
        Ok(Box::new(descended))
    }
}

/// Loads overlay nodes from an in-memory file map.
#[derive(Clone, Debug)]
pub struct InMemoryLoader {
    files: Arc<BTreeMap<String, String>>,
    root: String,
}

impl InMemoryLoader {
    pub fn builder() -> InMemoryBuilder {
        InMemoryBuilder::default()
    }
}

/// Assembles the file map for an [`InMemoryLoader`]. Paths are absolute and
/// slash-separated.
#[derive(Debug, Default)]
pub struct InMemoryBuilder {
    files: BTreeMap<String, String>,
}

impl InMemoryBuilder {
    /// Adds a file.
    pub fn file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_owned(), contents.to_owned());
        self
    }

    /// Adds the overlay file for the node directory `dir`.
    pub fn overlay(self, dir: &str, contents: &str) -> Self {
        let path = format!("{dir}/{OVERLAY_FILE_NAME}", dir = dir.trim_end_matches('/'));
        self.file(&path, contents)
    }

    /// Finishes the tree and roots a loader at `root`.
    pub fn build(self, root: &str) -> InMemoryLoader {
        InMemoryLoader {
            files: Arc::new(self.files),
            root: root.trim_end_matches('/').to_owned(),
        }
    }
}

impl Loader for InMemoryLoader {
    fn root(&self) -> &str {
        &self.root
    }

    fn is_dir(&self, reference: &str) -> bool {
        let Ok(path) = normalize(&self.root, reference) else {
            return false;
        };
        let prefix = format!("{path}/");
        self.files.keys().any(|key| key.starts_with(&prefix))
    }

    fn load(&self, reference: &str) -> Result<String> {
        let path = normalize(&self.root, reference)?;
        self.files.get(&path).cloned().context(NotFoundSnafu {
            path,
            root: &self.root,
        })
    }

    fn descend(&self, reference: &str) -> Result<Box<dyn Loader>> {
        ensure!(self.is_dir(reference), NotADirectorySnafu {
            path: reference,
        });

        let root = normalize(&self.root, reference)?;
        Ok(Box::new(Self {
            files: Arc::clone(&self.files),
            root,
        }))
    }
}
