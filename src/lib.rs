//! Bulk NDJSON client for dependency-ordered REST APIs.

pub mod program;
pub mod uplink;

// Flatten the core modules to the crate root
pub use self::uplink::*;
