//! Collection aliases shared across the skiff crates.
//!
//! Session, transfer and forward tables are keyed by short string ids, so
//! they use `FxHashMap`. Forwards keep creation order for listing, which is
//! what the Fx-hashed `IndexMap` is for.

pub use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
pub use std::collections::*;

/// Insertion-ordered map with FxHash.
pub type IndexMap<K, V> = indexmap::IndexMap<K, V, FxBuildHasher>;
