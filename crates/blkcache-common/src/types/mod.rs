//! Type definitions shared across the cache crates.

mod ids;

pub use ids::{BlockNo, ObjectId};
