//! Swift image store driver.

use crate::error::{StorageError, StorageResult, map_client_error};
use crate::pipeline::{ByteSource, ChecksumReader, UploadDigest, verify_stream};
use crate::traits::{
    AuthToken, ByteStream, Credentials, ImageData, ImageStore, ManifestTarget, ObjectBody,
    ObjectEntry, ObjectHeaders, PutOptions, StoredImage, SwiftClient,
};
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use depot_core::{
    AuthEndpoint, Checksum, LocationCredentials, Scheme, SwiftLocation, SwiftStoreConfig,
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::instrument;

/// Piece size for streaming single-object uploads (64 KiB).
pub const STREAM_PIECE_SIZE: usize = 64 * 1024;

/// Segment ordinals are written as five digits.
const MAX_SEGMENTS: u64 = 99_999;

/// Metadata name carrying the checksum of a segmented image.
pub const CHECKSUM_METADATA: &str = "checksum";

/// Whether the store accepts new images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreMode {
    Enabled,
    /// Credentials are incomplete; reads and deletes still work with
    /// credentials carried by locations.
    Disabled { missing: Vec<&'static str> },
}

/// Size and layout of a stored image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageStat {
    pub size: u64,
    /// `None` when the backend did not report a usable checksum.
    pub checksum: Option<Checksum>,
    /// Number of segment objects; 0 for a single object.
    pub segments: usize,
}

/// Credentials used for writes.
#[derive(Clone)]
struct WriteAccess {
    endpoint: AuthEndpoint,
    user: String,
    key: String,
}

impl std::fmt::Debug for WriteAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAccess")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
enum Access {
    Enabled(WriteAccess),
    Disabled(Vec<&'static str>),
}

/// Stores images as objects in a Swift container.
///
/// Payloads below the large-object threshold become a single object.
/// Larger ones are split into `<id>/<ordinal>` segments plus a manifest
/// object at `<id>`.
pub struct SwiftStore {
    client: Arc<dyn SwiftClient>,
    container: String,
    create_container_on_put: bool,
    large_object_size: u64,
    chunk_size: usize,
    // Fallback for locations without embedded credentials.
    user: Option<String>,
    key: Option<String>,
    access: Access,
}

impl SwiftStore {
    /// Create a store over `client`.
    ///
    /// Incomplete credentials are not an error: the store comes up with
    /// adding disabled.
    pub fn new(config: &SwiftStoreConfig, client: Arc<dyn SwiftClient>) -> StorageResult<Self> {
        config.validate().map_err(StorageError::Config)?;
        let chunk_size = usize::try_from(config.large_object_chunk_size).map_err(|_| {
            StorageError::Config(format!(
                "large_object_chunk_size {} is too large",
                config.large_object_chunk_size
            ))
        })?;

        let missing = config.missing_credentials();
        let access = match (&config.user, &config.key, &config.auth_address) {
            (Some(user), Some(key), Some(address)) if missing.is_empty() => {
                Access::Enabled(WriteAccess {
                    endpoint: AuthEndpoint::from_config(address)?,
                    user: user.trim().to_string(),
                    key: key.trim().to_string(),
                })
            }
            _ => {
                tracing::warn!(
                    missing = %missing.join(", "),
                    "Swift store credentials are incomplete, adding images is disabled"
                );
                Access::Disabled(missing)
            }
        };

        Ok(Self {
            client,
            container: config.container.clone(),
            create_container_on_put: config.create_container_on_put,
            large_object_size: config.large_object_size,
            chunk_size,
            user: config.user.clone().filter(|u| !u.trim().is_empty()),
            key: config.key.clone().filter(|k| !k.trim().is_empty()),
            access,
        })
    }

    pub fn mode(&self) -> StoreMode {
        match &self.access {
            Access::Enabled(_) => StoreMode::Enabled,
            Access::Disabled(missing) => StoreMode::Disabled {
                missing: missing.clone(),
            },
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Open the image at `location` for reading.
    ///
    /// Segmented images are fetched one segment at a time as the stream is
    /// consumed.
    #[instrument(skip(self), fields(backend = "swift"))]
    pub async fn get_location(&self, location: &SwiftLocation) -> StorageResult<ImageData> {
        let key = object_key(location);
        let auth = self.connect(&self.read_credentials(location)?).await?;
        let headers = self.head(&auth, location).await?;

        if let Some(target) = headers.manifest_target() {
            let segments = self.list_segments(&auth, &target).await?;
            let size = segments.iter().map(|s| s.bytes).sum();
            tracing::debug!(
                key = %key,
                segments = segments.len(),
                size,
                "Reading segmented image"
            );
            // Segments are verified one by one; the image checksum also
            // catches segments missing from the listing.
            let expected = headers
                .metadata
                .get(CHECKSUM_METADATA)
                .and_then(|v| parse_etag(v));
            let stream = segment_stream(self.client.clone(), auth, target.container, segments);
            return Ok(ImageData {
                stream: verify_stream(stream, key, expected),
                size,
            });
        }

        let (headers, body) = self
            .client
            .get_object(&auth, location.container(), location.object())
            .await
            .map_err(|e| map_client_error(e, &key))?;
        let expected = headers.etag.as_deref().and_then(parse_etag);
        Ok(ImageData {
            stream: verify_stream(body, key, expected),
            size: headers.content_length,
        })
    }

    /// Delete the image at `location`, including its segments.
    #[instrument(skip(self), fields(backend = "swift"))]
    pub async fn delete_location(&self, location: &SwiftLocation) -> StorageResult<()> {
        let key = object_key(location);
        let auth = self.connect(&self.read_credentials(location)?).await?;
        let headers = self.head(&auth, location).await?;

        let mut segments_deleted = 0;
        if let Some(target) = headers.manifest_target() {
            for segment in self.list_segments(&auth, &target).await? {
                match self
                    .client
                    .delete_object(&auth, &target.container, &segment.name)
                    .await
                {
                    Ok(()) => segments_deleted += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        return Err(map_client_error(
                            e,
                            &format!("{}/{}", target.container, segment.name),
                        ));
                    }
                }
            }
        }

        self.client
            .delete_object(&auth, location.container(), location.object())
            .await
            .map_err(|e| map_client_error(e, &key))?;

        tracing::info!(key = %key, segments = segments_deleted, "Deleted image");
        Ok(())
    }

    /// Whether an image exists at `location`.
    #[instrument(skip(self), fields(backend = "swift"))]
    pub async fn exists(&self, location: &SwiftLocation) -> StorageResult<bool> {
        match self.stat(location).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Size, checksum and segment count of the image at `location`.
    #[instrument(skip(self), fields(backend = "swift"))]
    pub async fn stat(&self, location: &SwiftLocation) -> StorageResult<ImageStat> {
        let auth = self.connect(&self.read_credentials(location)?).await?;
        let headers = self.head(&auth, location).await?;

        match headers.manifest_target() {
            Some(target) => {
                let segments = self.list_segments(&auth, &target).await?;
                Ok(ImageStat {
                    size: segments.iter().map(|s| s.bytes).sum(),
                    checksum: headers
                        .metadata
                        .get(CHECKSUM_METADATA)
                        .and_then(|v| parse_etag(v)),
                    segments: segments.len(),
                })
            }
            None => Ok(ImageStat {
                size: headers.content_length,
                checksum: headers.etag.as_deref().and_then(parse_etag),
                segments: 0,
            }),
        }
    }

    /// Credentials for reading `location`: its own if it carries any, the
    /// configured user and key otherwise.
    fn read_credentials(&self, location: &SwiftLocation) -> StorageResult<Credentials> {
        let auth_url = location.auth_url().map_err(invalid_auth_address)?;
        let (user, key) = match (location.credentials(), &self.user, &self.key) {
            (Some(LocationCredentials { user, key }), _, _) => (user.clone(), key.clone()),
            (None, Some(user), Some(key)) => (user.clone(), key.clone()),
            _ => {
                return Err(StorageError::Backend(format!(
                    "no credentials available for {}",
                    object_key(location)
                )));
            }
        };
        Ok(Credentials {
            auth_url,
            user,
            key,
        })
    }

    async fn connect(&self, credentials: &Credentials) -> StorageResult<AuthToken> {
        self.client
            .authenticate(credentials)
            .await
            .map_err(|e| {
                StorageError::Backend(format!(
                    "authentication against {} failed: {e}",
                    credentials.auth_url
                ))
            })
    }

    async fn head(&self, auth: &AuthToken, location: &SwiftLocation) -> StorageResult<ObjectHeaders> {
        self.client
            .head_object(auth, location.container(), location.object())
            .await
            .map_err(|e| map_client_error(e, &object_key(location)))
    }

    /// Segments under a manifest prefix, in ascending name order.
    async fn list_segments(
        &self,
        auth: &AuthToken,
        target: &ManifestTarget,
    ) -> StorageResult<Vec<ObjectEntry>> {
        let mut segments = self
            .client
            .list_objects(auth, &target.container, &target.prefix)
            .await
            .map_err(|e| map_client_error(e, &format!("{}/{}", target.container, target.prefix)))?;
        segments.retain(|s| s.name != target.prefix);
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    async fn ensure_container(&self, auth: &AuthToken) -> StorageResult<()> {
        match self.client.head_container(auth, &self.container).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                if !self.create_container_on_put {
                    return Err(StorageError::Backend(format!(
                        "container {} does not exist in Swift",
                        self.container
                    )));
                }
                tracing::info!(container = %self.container, "Creating container");
                self.client
                    .put_container(auth, &self.container)
                    .await
                    .map_err(|e| {
                        StorageError::Backend(format!(
                            "failed to create container {}: {e}",
                            self.container
                        ))
                    })
            }
            Err(e) => Err(map_client_error(e, &self.container)),
        }
    }

    /// Stream the rest of `reader` into a single object.
    async fn put_streaming(
        &self,
        auth: &AuthToken,
        image_id: &str,
        reader: ChecksumReader,
    ) -> StorageResult<UploadDigest> {
        let key = format!("{}/{image_id}", self.container);
        let (stream, handle) = reader.into_stream(STREAM_PIECE_SIZE);
        let etag = self
            .client
            .put_object(
                auth,
                &self.container,
                image_id,
                ObjectBody::Stream(stream),
                PutOptions::new().create_only(),
            )
            .await
            .map_err(|e| map_client_error(e, &key))?;

        let Some(digest) = handle.get() else {
            self.remove_quietly(auth, &self.container, image_id).await;
            return Err(StorageError::Backend(format!(
                "upload of {key} ended before the source was drained"
            )));
        };
        if let Err(e) = check_etag(&key, &digest.checksum, &etag) {
            self.remove_quietly(auth, &self.container, image_id).await;
            return Err(e);
        }
        Ok(digest)
    }

    /// Store an already buffered payload as a single object.
    async fn put_buffered(
        &self,
        auth: &AuthToken,
        image_id: &str,
        data: Bytes,
        digest: UploadDigest,
    ) -> StorageResult<UploadDigest> {
        let key = format!("{}/{image_id}", self.container);
        let etag = self
            .client
            .put_object(
                auth,
                &self.container,
                image_id,
                ObjectBody::Bytes(data),
                PutOptions::new()
                    .with_etag(digest.checksum.to_hex())
                    .create_only(),
            )
            .await
            .map_err(|e| map_client_error(e, &key))?;
        if let Err(e) = check_etag(&key, &digest.checksum, &etag) {
            self.remove_quietly(auth, &self.container, image_id).await;
            return Err(e);
        }
        Ok(digest)
    }

    /// Upload `first` and the rest of `reader` as segments, then write the
    /// manifest. Segments written before a failure are removed.
    async fn put_segmented(
        &self,
        auth: &AuthToken,
        image_id: &str,
        first: Bytes,
        mut reader: ChecksumReader,
    ) -> StorageResult<(UploadDigest, usize)> {
        let mut uploaded: Vec<String> = Vec::new();
        let result = self
            .write_segments(auth, image_id, first, &mut reader, &mut uploaded)
            .await;

        if result.is_err() {
            for name in &uploaded {
                self.remove_quietly(auth, &self.container, name).await;
            }
        }
        result.map(|digest| (digest, uploaded.len()))
    }

    async fn write_segments(
        &self,
        auth: &AuthToken,
        image_id: &str,
        first: Bytes,
        reader: &mut ChecksumReader,
        uploaded: &mut Vec<String>,
    ) -> StorageResult<UploadDigest> {
        let mut chunk = first;
        let mut ordinal: u64 = 0;
        while !chunk.is_empty() {
            ordinal += 1;
            if ordinal > MAX_SEGMENTS {
                return Err(StorageError::Backend(format!(
                    "image {image_id} needs more than {MAX_SEGMENTS} segments, raise large_object_chunk_size"
                )));
            }

            let name = segment_name(image_id, ordinal);
            let segment_key = format!("{}/{name}", self.container);
            let checksum = Checksum::compute(&chunk);
            tracing::debug!(
                segment = ordinal,
                bytes = chunk.len(),
                "Uploading segment"
            );
            let etag = self
                .client
                .put_object(
                    auth,
                    &self.container,
                    &name,
                    ObjectBody::Bytes(chunk),
                    PutOptions::new().with_etag(checksum.to_hex()).create_only(),
                )
                .await
                .map_err(|e| map_client_error(e, &segment_key))?;
            uploaded.push(name);
            check_etag(&segment_key, &checksum, &etag)?;

            chunk = reader.read_chunk(self.chunk_size).await?;
        }

        let digest = reader.digest();
        let key = format!("{}/{image_id}", self.container);
        self.client
            .put_object(
                auth,
                &self.container,
                image_id,
                ObjectBody::empty(),
                PutOptions::new()
                    .with_manifest(format!("{}/{image_id}/", self.container))
                    .with_metadata(CHECKSUM_METADATA, digest.checksum.to_hex())
                    .create_only(),
            )
            .await
            .map_err(|e| map_client_error(e, &key))?;
        Ok(digest)
    }

    /// Best-effort delete used to clean up after a failed upload.
    async fn remove_quietly(&self, auth: &AuthToken, container: &str, name: &str) {
        match self.client.delete_object(auth, container, name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(
                    key = %format!("{container}/{name}"),
                    error = %e,
                    "Failed to remove object after aborted upload, it may be orphaned"
                );
            }
        }
    }
}

#[async_trait]
impl ImageStore for SwiftStore {
    fn schemes(&self) -> &'static [&'static str] {
        &Scheme::ALL
    }

    async fn get(&self, uri: &str) -> StorageResult<ImageData> {
        let location = SwiftLocation::parse(uri)?;
        self.get_location(&location).await
    }

    #[instrument(skip(self, source), fields(backend = "swift", container = %self.container))]
    async fn add(
        &self,
        image_id: &str,
        source: ByteSource,
        declared_size: u64,
    ) -> StorageResult<StoredImage> {
        let access = match &self.access {
            Access::Enabled(access) => access,
            Access::Disabled(missing) => {
                return Err(StorageError::BackendDisabled(missing.join(", ")));
            }
        };
        if image_id.is_empty() || image_id.contains('/') {
            return Err(StorageError::InvalidKey(format!(
                "image id '{image_id}' must be non-empty and must not contain '/'"
            )));
        }

        let credentials = Credentials {
            auth_url: access.endpoint.auth_url().map_err(invalid_auth_address)?,
            user: access.user.clone(),
            key: access.key.clone(),
        };
        let auth = self.connect(&credentials).await?;
        self.ensure_container(&auth).await?;

        let key = format!("{}/{image_id}", self.container);
        match self.client.head_object(&auth, &self.container, image_id).await {
            Ok(_) => return Err(StorageError::Duplicate(key)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(map_client_error(e, &key)),
        }

        let mut reader = ChecksumReader::new(source);
        let (digest, segments) = if declared_size > 0 && declared_size < self.large_object_size {
            (self.put_streaming(&auth, image_id, reader).await?, 0)
        } else {
            let first = reader.read_chunk(self.chunk_size).await?;
            if reader.is_at_end().await? && reader.bytes_read() < self.large_object_size {
                let digest = reader.digest();
                (self.put_buffered(&auth, image_id, first, digest).await?, 0)
            } else {
                self.put_segmented(&auth, image_id, first, reader).await?
            }
        };

        if declared_size > 0 && digest.size != declared_size {
            tracing::warn!(
                key = %key,
                declared_size,
                actual_size = digest.size,
                "Image size differs from the declared size"
            );
        }
        tracing::info!(
            key = %key,
            size = digest.size,
            segments,
            checksum = %digest.checksum,
            "Stored image"
        );

        let location = SwiftLocation::new(
            access.endpoint.clone(),
            Some(LocationCredentials {
                user: access.user.clone(),
                key: access.key.clone(),
            }),
            self.container.clone(),
            image_id,
        );
        Ok(StoredImage {
            location,
            size: digest.size,
            checksum: digest.checksum,
        })
    }

    async fn delete(&self, uri: &str) -> StorageResult<()> {
        let location = SwiftLocation::parse(uri)?;
        self.delete_location(&location).await
    }

    fn backend_name(&self) -> &'static str {
        "swift"
    }
}

impl std::fmt::Debug for SwiftStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwiftStore")
            .field("client", &self.client.backend_name())
            .field("container", &self.container)
            .field("large_object_size", &self.large_object_size)
            .field("chunk_size", &self.chunk_size)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

/// Fetch segments in order, one request at a time, as the stream is read.
fn segment_stream(
    client: Arc<dyn SwiftClient>,
    auth: AuthToken,
    container: String,
    segments: Vec<ObjectEntry>,
) -> ByteStream {
    Box::pin(try_stream! {
        for segment in segments {
            let key = format!("{container}/{}", segment.name);
            tracing::debug!(key = %key, bytes = segment.bytes, "Fetching segment");
            let (headers, body) = client
                .get_object(&auth, &container, &segment.name)
                .await
                .map_err(|e| map_client_error(e, &key))?;
            let expected = headers
                .etag
                .as_deref()
                .or(segment.hash.as_deref())
                .and_then(parse_etag);
            let mut body = verify_stream(body, key, expected);
            while let Some(piece) = body.next().await {
                yield piece?;
            }
        }
    })
}

fn segment_name(image_id: &str, ordinal: u64) -> String {
    format!("{image_id}/{ordinal:05}")
}

fn object_key(location: &SwiftLocation) -> String {
    format!("{}/{}", location.container(), location.object())
}

fn parse_etag(etag: &str) -> Option<Checksum> {
    Checksum::from_etag(etag).ok()
}

fn check_etag(key: &str, expected: &Checksum, etag: &str) -> StorageResult<()> {
    if expected.matches_etag(etag) {
        return Ok(());
    }
    Err(StorageError::HashMismatch {
        key: key.to_string(),
        expected: expected.to_hex(),
        actual: etag.trim_matches('"').to_string(),
    })
}

fn invalid_auth_address(err: depot_core::Error) -> StorageError {
    match err {
        depot_core::Error::InvalidUri(msg) | depot_core::Error::Config(msg) => {
            StorageError::Backend(msg)
        }
        other => other.into(),
    }
}
