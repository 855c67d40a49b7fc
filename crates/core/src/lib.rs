//! Core domain types for the depot image store.
//!
//! This crate defines the data model shared by the storage driver and CLI:
//! - Swift location URIs and auth endpoint normalization
//! - Store configuration
//! - MD5 checksums

pub mod config;
pub mod error;
pub mod hash;
pub mod location;

pub use config::SwiftStoreConfig;
pub use error::{Error, Result};
pub use hash::{Checksum, ChecksumHasher};
pub use location::{AuthEndpoint, LocationCredentials, Scheme, SwiftLocation};
