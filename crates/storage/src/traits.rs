//! Storage trait definitions.
//!
//! [`SwiftClient`] is the object-store capability the driver consumes: the
//! handful of Swift verbs needed to authenticate, manage a container and
//! move objects. [`ImageStore`] is the URI-addressed contract the driver
//! offers to callers.

use crate::error::{ClientResult, StorageResult};
use crate::pipeline::ByteSource;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use depot_core::{Checksum, SwiftLocation};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::pin::Pin;
use url::Url;

/// A boxed stream of bytes for streaming reads and uploads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Credentials presented to the Swift auth endpoint.
#[derive(Clone)]
pub struct Credentials {
    pub auth_url: Url,
    pub user: String,
    pub key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_url", &self.auth_url.as_str())
            .field("user", &self.user)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// The result of a successful authentication.
#[derive(Clone)]
pub struct AuthToken {
    /// Base URL of the account, e.g. `https://swift/v1/AUTH_acct`.
    pub storage_url: String,
    pub token: String,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("storage_url", &self.storage_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Request body for an object PUT.
pub enum ObjectBody {
    /// A fully buffered body.
    Bytes(Bytes),
    /// A body pulled from a stream while the request is in flight.
    Stream(ByteStream),
}

impl ObjectBody {
    pub fn empty() -> Self {
        Self::Bytes(Bytes::new())
    }

    /// Read the whole body into memory.
    pub async fn collect(self) -> StorageResult<Bytes> {
        match self {
            Self::Bytes(data) => Ok(data),
            Self::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(piece) = stream.next().await {
                    buf.extend_from_slice(&piece?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl From<Bytes> for ObjectBody {
    fn from(data: Bytes) -> Self {
        Self::Bytes(data)
    }
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Options for an object PUT.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Expected MD5 of the body; the server rejects the upload on mismatch.
    pub etag: Option<String>,
    /// `X-Object-Manifest` value (`<container>/<prefix>`) for a manifest object.
    pub manifest: Option<String>,
    /// Send `If-None-Match: *` so an existing object is never overwritten.
    pub if_none_match: bool,
    /// User metadata, sent as `X-Object-Meta-<name>`.
    pub metadata: BTreeMap<String, String>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_manifest(mut self, manifest: impl Into<String>) -> Self {
        self.manifest = Some(manifest.into());
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Fail with a conflict instead of overwriting an existing object.
    pub fn create_only(mut self) -> Self {
        self.if_none_match = true;
        self
    }
}

/// Object headers returned by HEAD and GET.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectHeaders {
    pub content_length: u64,
    pub etag: Option<String>,
    /// `X-Object-Manifest` value if the object is a large-object manifest.
    pub manifest: Option<String>,
    /// User metadata with the `X-Object-Meta-` prefix removed, lowercase names.
    pub metadata: BTreeMap<String, String>,
}

impl ObjectHeaders {
    pub fn is_manifest(&self) -> bool {
        self.manifest.is_some()
    }

    /// The container and segment prefix a manifest points at.
    pub fn manifest_target(&self) -> Option<ManifestTarget> {
        let (container, prefix) = self.manifest.as_deref()?.split_once('/')?;
        if container.is_empty() {
            return None;
        }
        Some(ManifestTarget {
            container: container.to_string(),
            prefix: prefix.to_string(),
        })
    }
}

/// Where the segments of a large object live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestTarget {
    pub container: String,
    pub prefix: String,
}

/// One entry of a container listing.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    pub bytes: u64,
    /// MD5 of the object contents.
    #[serde(default)]
    pub hash: Option<String>,
}

/// Swift object-store capability.
///
/// Implementations report failures as [`crate::error::ClientError`]; the
/// driver maps them onto storage errors.
#[async_trait]
pub trait SwiftClient: Send + Sync + 'static {
    /// Exchange credentials for a token and storage URL.
    async fn authenticate(&self, credentials: &Credentials) -> ClientResult<AuthToken>;

    /// Check that a container exists.
    async fn head_container(&self, auth: &AuthToken, container: &str) -> ClientResult<()>;

    /// Create a container.
    async fn put_container(&self, auth: &AuthToken, container: &str) -> ClientResult<()>;

    /// Upload an object and return the etag the server computed.
    async fn put_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
        body: ObjectBody,
        options: PutOptions,
    ) -> ClientResult<String>;

    /// Fetch an object's headers and a stream of its contents.
    async fn get_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
    ) -> ClientResult<(ObjectHeaders, ByteStream)>;

    /// Fetch an object's headers.
    async fn head_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
    ) -> ClientResult<ObjectHeaders>;

    /// Delete an object.
    async fn delete_object(&self, auth: &AuthToken, container: &str, name: &str)
    -> ClientResult<()>;

    /// List objects whose names start with `prefix`, in name order.
    async fn list_objects(
        &self,
        auth: &AuthToken,
        container: &str,
        prefix: &str,
    ) -> ClientResult<Vec<ObjectEntry>>;

    /// Get the name of this client implementation.
    ///
    /// Used for logging.
    fn backend_name(&self) -> &'static str;
}

/// Image data returned by a read.
pub struct ImageData {
    /// Lazily fetched contents.
    pub stream: ByteStream,
    /// Total size in bytes.
    pub size: u64,
}

impl ImageData {
    /// Read the whole image into memory.
    pub async fn into_bytes(self) -> StorageResult<Bytes> {
        ObjectBody::Stream(self.stream).collect().await
    }
}

impl std::fmt::Debug for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageData")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// The outcome of storing an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredImage {
    pub location: SwiftLocation,
    /// Bytes actually written.
    pub size: u64,
    /// MD5 of the bytes written.
    pub checksum: Checksum,
}

/// A storage backend addressed by location URIs.
#[async_trait]
pub trait ImageStore: Send + Sync + 'static {
    /// URI schemes this store resolves.
    fn schemes(&self) -> &'static [&'static str];

    /// Open an image for reading.
    async fn get(&self, uri: &str) -> StorageResult<ImageData>;

    /// Store an image read from `source`.
    ///
    /// `declared_size` is a hint; pass 0 when the size is unknown.
    async fn add(
        &self,
        image_id: &str,
        source: ByteSource,
        declared_size: u64,
    ) -> StorageResult<StoredImage>;

    /// Delete an image and any segments backing it.
    async fn delete(&self, uri: &str) -> StorageResult<()>;

    /// Get the name of this storage backend.
    fn backend_name(&self) -> &'static str;
}
