//! Database branches
//!
//! Named, isolated copies of the database that migrations can be applied to
//! without touching the default namespace.

pub mod manager;
pub mod metadata;

pub use manager::BranchManager;
pub use metadata::{BranchMetadata, BranchStore, MetadataManager};
