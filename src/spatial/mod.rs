//! # Spatial Module
//!
//! The lane-by-cell grid that keeps neighbor queries O(N) per tick
//! instead of O(N²). The index is a derived view over vehicle state:
//! vehicle positions are the source of truth, and the engine refreshes
//! the index after every per-vehicle update so mid-tick lane changes are
//! visible to the vehicles updated later in the same tick.
//!
//! ## Key Components
//!
//! - [`spatial_index::SpatialIndex`] - The grid plus a reverse map for
//!   O(1) removal and cheap incremental updates
pub mod spatial_index;

pub use self::spatial_index::*;
