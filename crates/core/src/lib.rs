//! e2build-core: primitives shared by the whole tool
//!
//! This crate provides the leaf building blocks everything else is defined
//! in terms of:
//! - `Hasher`: the streaming content hash that produces every identifier
//! - `Environment`: ordered key/value sets with an order-independent id
//! - `ProjectVersion`: the `e2version` file grammar
//! - server/location string handling

pub mod env;
pub mod hash;
pub mod location;
pub mod version;

pub use env::Environment;
pub use hash::Hasher;
pub use version::ProjectVersion;
