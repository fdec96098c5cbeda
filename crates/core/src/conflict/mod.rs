//! Three-way merging and conflict resolution.
//!
//! 1. **Merging** -- line-based three-way merges with conflict markers.
//! 2. **Resolution** -- applying a yours/theirs policy to an unmerged path.

pub mod merger;
pub mod resolver;

pub use merger::{MarkerLabels, MergeResult, Merger};
pub use resolver::{ConflictResolver, ResolvePolicy};
