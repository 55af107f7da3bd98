//! Komposer composes hierarchical overlays of structured configuration
//! documents into a single deterministic output set.
//!
//! An overlay tree consists of node directories, each declaring (in its
//! overlay file) the resources it builds on, the documents it generates and
//! the patches it applies. Accumulating the tree from its root yields an
//! ordered [`Registry`] of identified documents, ready for external
//! transformation and serialization.
//!
//! Composition is a strict tree merge: the same resource id arriving twice
//! at one node is a hard conflict, never a silent overwrite. There is no
//! attempt to reconcile two independently patched copies of the same
//! logical resource; restructure the tree so each base is reachable along
//! exactly one path.

pub mod accumulate;
pub mod document;
pub mod generator;
pub mod loader;
pub mod overlay;
pub mod patch;
pub mod registry;
pub mod resid;

pub use accumulate::{Accumulator, accumulate};
pub use document::Document;
pub use loader::{FsLoader, InMemoryLoader, Loader};
pub use overlay::{OVERLAY_FILE_NAME, OverlaySpec};
pub use registry::Registry;
pub use resid::{NamespaceMarker, ResourceId, Selector};
