//! Filesystem helpers shared by the dump, archive and retention stages.

pub mod metadata;
pub mod walker;
