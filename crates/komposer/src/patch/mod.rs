//! The two patch dialects applied during accumulation: shape-aware strategic
//! merge and pointer-addressed operation lists.
pub mod json6902;
pub mod strategic;
