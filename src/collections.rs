//! Hash collection aliases.
//!
//! With the `gxhash` feature (default) sets and `DashMap` caches hash with
//! gxhash, which needs AES-NI/SSE2 intrinsics. Without it the std hasher is
//! used so the crate still builds on any target.

#[cfg(feature = "gxhash")]
pub use gxhash::{GxBuildHasher, HashSet, HashSetExt};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::HashSet;

/// Hasher for `DashMap` caches
#[cfg(not(feature = "gxhash"))]
pub type GxBuildHasher = std::hash::RandomState;

/// `HashSet::new` for the std fallback
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Creates an empty set
    fn new() -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for HashSet<T> {
    fn new() -> Self {
        HashSet::default()
    }
}
