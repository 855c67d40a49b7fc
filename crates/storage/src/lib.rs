//! Swift-backed image storage for depot.
//!
//! This crate provides:
//! - A Swift client capability with HTTP and in-memory implementations
//! - A streaming MD5 pipeline for uploads and download verification
//! - The store driver, with large-object segmentation for big images
//! - Mapping of backend failures onto storage errors

pub mod backends;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod traits;

pub use backends::{HttpSwiftClient, MemorySwift, RequestCounts};
pub use error::{ClientError, ClientResult, StorageError, StorageResult, map_client_error};
pub use pipeline::{ByteSource, ChecksumReader, DigestHandle, UploadDigest, verify_stream};
pub use store::{ImageStat, StoreMode, SwiftStore};
pub use traits::{
    AuthToken, ByteStream, Credentials, ImageData, ImageStore, ObjectBody, ObjectEntry,
    ObjectHeaders, PutOptions, StoredImage, SwiftClient,
};

use depot_core::SwiftStoreConfig;
use std::sync::Arc;

/// Create an image store from configuration, talking to Swift over HTTP.
pub fn from_config(config: &SwiftStoreConfig) -> StorageResult<Arc<dyn ImageStore>> {
    let store = SwiftStore::new(config, Arc::new(HttpSwiftClient::new()))?;
    Ok(Arc::new(store))
}
