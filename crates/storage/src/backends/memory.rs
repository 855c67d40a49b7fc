//! In-memory Swift object store.
//!
//! Behaves like a single Swift account: containers, objects with MD5 etags,
//! `If-None-Match: *`, dynamic large-object manifests and prefix listings.
//! Request counters make it useful as a test double; failure injection is
//! available with the `testing` feature.

use crate::error::{ClientError, ClientResult, StorageResult};
use crate::traits::{
    AuthToken, ByteStream, Credentials, ObjectBody, ObjectEntry, ObjectHeaders, PutOptions,
    SwiftClient,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use depot_core::Checksum;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const STORAGE_URL: &str = "memory://swift/v1/AUTH_depot";
const TOKEN: &str = "memory-token";

/// Pieces handed out by GET streams.
const READ_PIECE_SIZE: usize = 1024;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    etag: String,
    manifest: Option<String>,
    metadata: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, BTreeMap<String, StoredObject>>,
    put_log: Vec<String>,
    auth_urls: Vec<String>,
    // Object PUTs allowed before every further PUT fails with 500.
    put_budget: Option<usize>,
    report_bad_etags: bool,
}

#[derive(Default)]
struct Counters {
    authenticate: AtomicUsize,
    head_container: AtomicUsize,
    put_container: AtomicUsize,
    put_object: AtomicUsize,
    get_object: AtomicUsize,
    head_object: AtomicUsize,
    delete_object: AtomicUsize,
    list_objects: AtomicUsize,
}

/// Snapshot of the requests a [`MemorySwift`] has served.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub authenticate: usize,
    pub head_container: usize,
    pub put_container: usize,
    pub put_object: usize,
    pub get_object: usize,
    pub head_object: usize,
    pub delete_object: usize,
    pub list_objects: usize,
}

impl RequestCounts {
    pub fn total(&self) -> usize {
        self.authenticate
            + self.head_container
            + self.put_container
            + self.put_object
            + self.get_object
            + self.head_object
            + self.delete_object
            + self.list_objects
    }
}

/// A Swift account held in memory.
#[derive(Default)]
pub struct MemorySwift {
    state: Mutex<State>,
    counters: Counters,
    credentials: Option<(String, String)>,
}

impl MemorySwift {
    /// An account that accepts any credentials.
    pub fn new() -> Self {
        Self::default()
    }

    /// An account that only accepts `user` / `key`.
    pub fn with_credentials(user: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            credentials: Some((user.into(), key.into())),
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_container(&self, container: &str) {
        self.state()
            .containers
            .entry(container.to_string())
            .or_default();
    }

    pub fn has_container(&self, container: &str) -> bool {
        self.state().containers.contains_key(container)
    }

    /// Store an object directly, bypassing request accounting.
    pub fn insert_object(&self, container: &str, name: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let object = StoredObject {
            etag: Checksum::compute(&data).to_hex(),
            data,
            manifest: None,
            metadata: BTreeMap::new(),
        };
        self.state()
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), object);
    }

    /// Overwrite an object's contents but keep its recorded etag.
    #[cfg(any(test, feature = "testing"))]
    pub fn corrupt_object(&self, container: &str, name: &str, data: impl Into<Bytes>) -> bool {
        let mut state = self.state();
        match state
            .containers
            .get_mut(container)
            .and_then(|objects| objects.get_mut(name))
        {
            Some(object) => {
                object.data = data.into();
                true
            }
            None => false,
        }
    }

    /// Names of all objects in `container`, sorted.
    pub fn object_names(&self, container: &str) -> Vec<String> {
        self.state()
            .containers
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Raw contents of an object; empty for a manifest.
    pub fn object_data(&self, container: &str, name: &str) -> Option<Bytes> {
        self.state()
            .containers
            .get(container)?
            .get(name)
            .map(|o| o.data.clone())
    }

    /// `X-Object-Manifest` of an object, if it is a manifest.
    pub fn object_manifest(&self, container: &str, name: &str) -> Option<String> {
        self.state()
            .containers
            .get(container)?
            .get(name)?
            .manifest
            .clone()
    }

    /// Names of objects successfully written, in write order.
    pub fn put_log(&self) -> Vec<String> {
        self.state().put_log.clone()
    }

    /// Auth URLs presented to `authenticate`, in call order.
    pub fn auth_urls(&self) -> Vec<String> {
        self.state().auth_urls.clone()
    }

    /// Allow `n` more object PUTs, then fail every further one with 500.
    #[cfg(any(test, feature = "testing"))]
    pub fn fail_object_puts_after(&self, n: usize) {
        self.state().put_budget = Some(n);
    }

    /// Report a wrong etag for every successful object PUT.
    #[cfg(any(test, feature = "testing"))]
    pub fn report_bad_etags(&self, enabled: bool) {
        self.state().report_bad_etags = enabled;
    }

    pub fn counts(&self) -> RequestCounts {
        let c = &self.counters;
        RequestCounts {
            authenticate: c.authenticate.load(Ordering::SeqCst),
            head_container: c.head_container.load(Ordering::SeqCst),
            put_container: c.put_container.load(Ordering::SeqCst),
            put_object: c.put_object.load(Ordering::SeqCst),
            get_object: c.get_object.load(Ordering::SeqCst),
            head_object: c.head_object.load(Ordering::SeqCst),
            delete_object: c.delete_object.load(Ordering::SeqCst),
            list_objects: c.list_objects.load(Ordering::SeqCst),
        }
    }

    fn check_token(auth: &AuthToken) -> ClientResult<()> {
        if auth.token != TOKEN {
            return Err(ClientError::http(401, "401 Unauthorized"));
        }
        Ok(())
    }

    /// Headers and contents of an object, with manifests resolved to the
    /// concatenation of their segments.
    fn read_object(
        &self,
        container: &str,
        name: &str,
        verb: &str,
    ) -> ClientResult<(ObjectHeaders, Bytes)> {
        let state = self.state();
        let objects = state
            .containers
            .get(container)
            .ok_or_else(|| ClientError::http(404, format!("Object {verb} failed: 404 Not Found")))?;
        let object = objects
            .get(name)
            .ok_or_else(|| ClientError::http(404, format!("Object {verb} failed: 404 Not Found")))?;

        let Some(manifest) = &object.manifest else {
            let headers = ObjectHeaders {
                content_length: object.data.len() as u64,
                etag: Some(object.etag.clone()),
                manifest: None,
                metadata: object.metadata.clone(),
            };
            return Ok((headers, object.data.clone()));
        };

        // Dynamic large object: segments are every object under the prefix.
        let (segment_container, prefix) = manifest.split_once('/').unwrap_or((manifest, ""));
        let mut data = BytesMut::new();
        let mut etags = String::new();
        if let Some(segments) = state.containers.get(segment_container) {
            for (_, segment) in segments
                .range(prefix.to_string()..)
                .take_while(|(n, _)| n.starts_with(prefix))
            {
                data.extend_from_slice(&segment.data);
                etags.push_str(&segment.etag);
            }
        }
        let headers = ObjectHeaders {
            content_length: data.len() as u64,
            etag: Some(format!("\"{}\"", Checksum::compute(etags.as_bytes()).to_hex())),
            manifest: Some(manifest.clone()),
            metadata: object.metadata.clone(),
        };
        Ok((headers, data.freeze()))
    }
}

#[async_trait]
impl SwiftClient for MemorySwift {
    async fn authenticate(&self, credentials: &Credentials) -> ClientResult<AuthToken> {
        self.counters.authenticate.fetch_add(1, Ordering::SeqCst);
        self.state()
            .auth_urls
            .push(credentials.auth_url.as_str().to_string());

        if let Some((user, key)) = &self.credentials
            && (credentials.user != *user || credentials.key != *key)
        {
            return Err(ClientError::http(401, "Auth GET failed: 401 Unauthorized"));
        }
        Ok(AuthToken {
            storage_url: STORAGE_URL.to_string(),
            token: TOKEN.to_string(),
        })
    }

    async fn head_container(&self, auth: &AuthToken, container: &str) -> ClientResult<()> {
        self.counters.head_container.fetch_add(1, Ordering::SeqCst);
        Self::check_token(auth)?;
        if self.has_container(container) {
            Ok(())
        } else {
            Err(ClientError::http(404, "Container HEAD failed: 404 Not Found"))
        }
    }

    async fn put_container(&self, auth: &AuthToken, container: &str) -> ClientResult<()> {
        self.counters.put_container.fetch_add(1, Ordering::SeqCst);
        Self::check_token(auth)?;
        self.create_container(container);
        Ok(())
    }

    async fn put_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
        body: ObjectBody,
        options: PutOptions,
    ) -> ClientResult<String> {
        self.counters.put_object.fetch_add(1, Ordering::SeqCst);
        Self::check_token(auth)?;
        let data = body
            .collect()
            .await
            .map_err(|e| ClientError::transport(format!("failed to read request body: {e}")))?;

        let mut state = self.state();
        if let Some(budget) = state.put_budget.as_mut() {
            if *budget == 0 {
                return Err(ClientError::http(500, "Object PUT failed: 500 Internal Error"));
            }
            *budget -= 1;
        }
        let report_bad_etags = state.report_bad_etags;

        let objects = state
            .containers
            .get_mut(container)
            .ok_or_else(|| ClientError::http(404, "Object PUT failed: 404 Not Found"))?;
        if options.if_none_match && objects.contains_key(name) {
            return Err(ClientError::http(412, "Object PUT failed: 412 Precondition Failed"));
        }

        let etag = Checksum::compute(&data).to_hex();
        if let Some(expected) = &options.etag
            && !report_bad_etags
            && !expected.trim_matches('"').eq_ignore_ascii_case(&etag)
        {
            return Err(ClientError::http(422, "Object PUT failed: 422 Unprocessable Entity"));
        }

        objects.insert(
            name.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
                manifest: options.manifest,
                metadata: options
                    .metadata
                    .into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v))
                    .collect(),
            },
        );
        state.put_log.push(name.to_string());

        if report_bad_etags {
            return Ok(Checksum::compute(b"corrupted").to_hex());
        }
        Ok(etag)
    }

    async fn get_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
    ) -> ClientResult<(ObjectHeaders, ByteStream)> {
        self.counters.get_object.fetch_add(1, Ordering::SeqCst);
        Self::check_token(auth)?;
        let (headers, data) = self.read_object(container, name, "GET")?;

        let pieces: Vec<StorageResult<Bytes>> = (0..data.len())
            .step_by(READ_PIECE_SIZE)
            .map(|start| Ok(data.slice(start..data.len().min(start + READ_PIECE_SIZE))))
            .collect();
        Ok((headers, Box::pin(futures::stream::iter(pieces))))
    }

    async fn head_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
    ) -> ClientResult<ObjectHeaders> {
        self.counters.head_object.fetch_add(1, Ordering::SeqCst);
        Self::check_token(auth)?;
        self.read_object(container, name, "HEAD")
            .map(|(headers, _)| headers)
    }

    async fn delete_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
    ) -> ClientResult<()> {
        self.counters.delete_object.fetch_add(1, Ordering::SeqCst);
        Self::check_token(auth)?;
        self.state()
            .containers
            .get_mut(container)
            .and_then(|objects| objects.remove(name))
            .map(|_| ())
            .ok_or_else(|| ClientError::http(404, "Object DELETE failed: 404 Not Found"))
    }

    async fn list_objects(
        &self,
        auth: &AuthToken,
        container: &str,
        prefix: &str,
    ) -> ClientResult<Vec<ObjectEntry>> {
        self.counters.list_objects.fetch_add(1, Ordering::SeqCst);
        Self::check_token(auth)?;
        let state = self.state();
        let objects = state
            .containers
            .get(container)
            .ok_or_else(|| ClientError::http(404, "Container GET failed: 404 Not Found"))?;
        Ok(objects
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, object)| ObjectEntry {
                name: name.clone(),
                bytes: object.data.len() as u64,
                hash: Some(object.etag.clone()),
            })
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

impl std::fmt::Debug for MemorySwift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySwift")
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use url::Url;

    async fn login(swift: &MemorySwift) -> AuthToken {
        let creds = Credentials {
            auth_url: Url::parse("https://localhost:8080").unwrap(),
            user: "user".to_string(),
            key: "key".to_string(),
        };
        swift.authenticate(&creds).await.unwrap()
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(piece) = stream.next().await {
            out.extend_from_slice(&piece.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let swift = MemorySwift::new();
        swift.create_container("glance");
        let auth = login(&swift).await;

        let data = Bytes::from(vec![7u8; 3000]);
        let etag = swift
            .put_object(&auth, "glance", "img", data.clone().into(), PutOptions::new())
            .await
            .unwrap();
        assert_eq!(etag, Checksum::compute(&data).to_hex());

        let (headers, stream) = swift.get_object(&auth, "glance", "img").await.unwrap();
        assert_eq!(headers.content_length, 3000);
        assert_eq!(read_all(stream).await, data.to_vec());
    }

    #[tokio::test]
    async fn test_if_none_match_and_etag_checks() {
        let swift = MemorySwift::new();
        swift.create_container("glance");
        let auth = login(&swift).await;

        swift
            .put_object(&auth, "glance", "img", Bytes::from_static(b"a").into(), PutOptions::new())
            .await
            .unwrap();
        let err = swift
            .put_object(
                &auth,
                "glance",
                "img",
                Bytes::from_static(b"b").into(),
                PutOptions::new().create_only(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(412));

        let err = swift
            .put_object(
                &auth,
                "glance",
                "other",
                Bytes::from_static(b"b").into(),
                PutOptions::new().with_etag(Checksum::compute(b"a").to_hex()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(422));
    }

    #[tokio::test]
    async fn test_manifest_concatenates_segments() {
        let swift = MemorySwift::new();
        swift.create_container("glance");
        swift.insert_object("glance", "img/00002", Bytes::from_static(b"world"));
        swift.insert_object("glance", "img/00001", Bytes::from_static(b"hello "));
        let auth = login(&swift).await;

        swift
            .put_object(
                &auth,
                "glance",
                "img",
                ObjectBody::empty(),
                PutOptions::new().with_manifest("glance/img/"),
            )
            .await
            .unwrap();

        let headers = swift.head_object(&auth, "glance", "img").await.unwrap();
        assert!(headers.is_manifest());
        assert_eq!(headers.content_length, 11);

        let (_, stream) = swift.get_object(&auth, "glance", "img").await.unwrap();
        assert_eq!(read_all(stream).await, b"hello world");

        let listed = swift.list_objects(&auth, "glance", "img/").await.unwrap();
        let names: Vec<_> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["img/00001", "img/00002"]);
    }

    #[tokio::test]
    async fn test_missing_objects_and_containers() {
        let swift = MemorySwift::new();
        let auth = login(&swift).await;

        assert_eq!(
            swift.head_container(&auth, "glance").await.unwrap_err().status,
            Some(404)
        );
        swift.put_container(&auth, "glance").await.unwrap();
        assert!(swift.head_container(&auth, "glance").await.is_ok());
        assert!(
            swift
                .head_object(&auth, "glance", "missing")
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            swift
                .delete_object(&auth, "glance", "missing")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_credentials_and_failure_injection() {
        let swift = MemorySwift::with_credentials("user", "key");
        swift.create_container("glance");
        let bad = Credentials {
            auth_url: Url::parse("https://localhost").unwrap(),
            user: "user".to_string(),
            key: "wrong".to_string(),
        };
        assert_eq!(swift.authenticate(&bad).await.unwrap_err().status, Some(401));

        let auth = login(&swift).await;
        swift.fail_object_puts_after(1);
        assert!(
            swift
                .put_object(&auth, "glance", "a", Bytes::from_static(b"a").into(), PutOptions::new())
                .await
                .is_ok()
        );
        let err = swift
            .put_object(&auth, "glance", "b", Bytes::from_static(b"b").into(), PutOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(500));
        assert_eq!(swift.put_log(), vec!["a".to_string()]);
        assert_eq!(swift.counts().put_object, 2);
        assert_eq!(swift.counts().authenticate, 2);
    }
}
