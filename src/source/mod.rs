//! Image sources.
//!
//! A spool materializes an app image as a stack of engine-imported
//! layers. Two sources can produce that stack: an OCI/Docker registry
//! and an external content-addressed download helper. Both import
//! through the same engine connection and return the ordered engine
//! layer ids, base first.

pub mod helper;
pub mod registry;

pub use self::helper::HelperSource;
pub use self::registry::RegistrySource;

/// Engine layer id for a blob digest.
pub(crate) fn engine_layer_id(digest: &str) -> String {
    digest.replace(':', "_")
}
