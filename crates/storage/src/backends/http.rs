//! Swift client speaking the HTTP object-store API via reqwest.

use crate::error::{ClientError, ClientResult, StorageError};
use crate::traits::{
    AuthToken, ByteStream, Credentials, ObjectBody, ObjectEntry, ObjectHeaders, PutOptions,
    SwiftClient,
};
use async_trait::async_trait;
use futures::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap, IF_NONE_MATCH};
use reqwest::{Body, Response};
use std::collections::BTreeMap;
use tracing::instrument;
use url::Url;

const AUTH_USER: &str = "X-Auth-User";
const AUTH_KEY: &str = "X-Auth-Key";
const AUTH_TOKEN: &str = "X-Auth-Token";
const STORAGE_URL: &str = "X-Storage-Url";
const OBJECT_MANIFEST: &str = "X-Object-Manifest";
const OBJECT_META_PREFIX: &str = "x-object-meta-";

/// Characters escaped in a single path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Swift client over HTTP.
///
/// Uses v1 authentication: a GET against the auth URL with `X-Auth-User` and
/// `X-Auth-Key` returns the storage URL and token for later requests.
#[derive(Clone, Debug, Default)]
pub struct HttpSwiftClient {
    http: reqwest::Client,
}

impl HttpSwiftClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured reqwest client (timeouts, proxies, TLS roots).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn container_url(auth: &AuthToken, container: &str) -> ClientResult<Url> {
        let raw = format!(
            "{}/{}",
            auth.storage_url.trim_end_matches('/'),
            utf8_percent_encode(container, PATH_SEGMENT)
        );
        Url::parse(&raw).map_err(|e| ClientError::transport(format!("invalid storage URL {raw}: {e}")))
    }

    fn object_url(auth: &AuthToken, container: &str, name: &str) -> ClientResult<Url> {
        let encoded: Vec<String> = name
            .split('/')
            .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
            .collect();
        let raw = format!(
            "{}/{}",
            Self::container_url(auth, container)?,
            encoded.join("/")
        );
        Url::parse(&raw).map_err(|e| ClientError::transport(format!("invalid object URL {raw}: {e}")))
    }
}

async fn send(request: reqwest::RequestBuilder, what: &str) -> ClientResult<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| ClientError::transport(format!("{what} request failed: {e}")))?;
    check(response, what).await
}

/// Turn a non-2xx response into a [`ClientError`] carrying its status.
async fn check(response: Response, what: &str) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    let message = if body.is_empty() {
        format!("{what} failed: {status}")
    } else {
        format!("{what} failed: {status}: {body}")
    };
    Err(ClientError::http(status.as_u16(), message))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn object_headers(headers: &HeaderMap) -> ObjectHeaders {
    let metadata: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            let meta = name.as_str().strip_prefix(OBJECT_META_PREFIX)?;
            Some((meta.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    ObjectHeaders {
        content_length: header_str(headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        etag: header_str(headers, ETAG.as_str()).map(|v| v.trim_matches('"').to_string()),
        manifest: header_str(headers, OBJECT_MANIFEST).map(str::to_string),
        metadata,
    }
}

#[async_trait]
impl SwiftClient for HttpSwiftClient {
    #[instrument(skip(self, credentials), fields(backend = "swift", auth_url = %credentials.auth_url))]
    async fn authenticate(&self, credentials: &Credentials) -> ClientResult<AuthToken> {
        let response = send(
            self.http
                .get(credentials.auth_url.clone())
                .header(AUTH_USER, &credentials.user)
                .header(AUTH_KEY, &credentials.key),
            "Auth GET",
        )
        .await?;

        let headers = response.headers();
        let storage_url = header_str(headers, STORAGE_URL)
            .ok_or_else(|| ClientError::transport("auth response carried no X-Storage-Url"))?;
        let token = header_str(headers, AUTH_TOKEN)
            .ok_or_else(|| ClientError::transport("auth response carried no X-Auth-Token"))?;
        Ok(AuthToken {
            storage_url: storage_url.to_string(),
            token: token.to_string(),
        })
    }

    #[instrument(skip(self, auth), fields(backend = "swift"))]
    async fn head_container(&self, auth: &AuthToken, container: &str) -> ClientResult<()> {
        let url = Self::container_url(auth, container)?;
        send(
            self.http.head(url).header(AUTH_TOKEN, &auth.token),
            "Container HEAD",
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, auth), fields(backend = "swift"))]
    async fn put_container(&self, auth: &AuthToken, container: &str) -> ClientResult<()> {
        let url = Self::container_url(auth, container)?;
        send(
            self.http
                .put(url)
                .header(AUTH_TOKEN, &auth.token)
                .header(CONTENT_LENGTH, 0),
            "Container PUT",
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, auth, body), fields(backend = "swift"))]
    async fn put_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
        body: ObjectBody,
        options: PutOptions,
    ) -> ClientResult<String> {
        let url = Self::object_url(auth, container, name)?;
        let mut request = self.http.put(url).header(AUTH_TOKEN, &auth.token);
        if let Some(etag) = &options.etag {
            request = request.header(ETAG, etag);
        }
        if let Some(manifest) = &options.manifest {
            request = request.header(OBJECT_MANIFEST, manifest);
        }
        if options.if_none_match {
            request = request.header(IF_NONE_MATCH, "*");
        }
        for (name, value) in &options.metadata {
            request = request.header(format!("X-Object-Meta-{name}"), value);
        }
        request = match body {
            ObjectBody::Bytes(data) => request.body(data),
            ObjectBody::Stream(stream) => request.body(Body::wrap_stream(stream)),
        };

        let response = send(request, "Object PUT").await?;
        header_str(response.headers(), ETAG.as_str())
            .map(|v| v.trim_matches('"').to_string())
            .ok_or_else(|| ClientError::transport("object PUT response carried no ETag"))
    }

    #[instrument(skip(self, auth), fields(backend = "swift"))]
    async fn get_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
    ) -> ClientResult<(ObjectHeaders, ByteStream)> {
        let url = Self::object_url(auth, container, name)?;
        let response = send(
            self.http.get(url).header(AUTH_TOKEN, &auth.token),
            "Object GET",
        )
        .await?;
        let headers = object_headers(response.headers());
        let stream = response
            .bytes_stream()
            .map(|piece| piece.map_err(|e| StorageError::Backend(format!("Object GET body failed: {e}"))));
        Ok((headers, Box::pin(stream)))
    }

    #[instrument(skip(self, auth), fields(backend = "swift"))]
    async fn head_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
    ) -> ClientResult<ObjectHeaders> {
        let url = Self::object_url(auth, container, name)?;
        let response = send(
            self.http.head(url).header(AUTH_TOKEN, &auth.token),
            "Object HEAD",
        )
        .await?;
        Ok(object_headers(response.headers()))
    }

    #[instrument(skip(self, auth), fields(backend = "swift"))]
    async fn delete_object(
        &self,
        auth: &AuthToken,
        container: &str,
        name: &str,
    ) -> ClientResult<()> {
        let url = Self::object_url(auth, container, name)?;
        send(
            self.http.delete(url).header(AUTH_TOKEN, &auth.token),
            "Object DELETE",
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, auth), fields(backend = "swift"))]
    async fn list_objects(
        &self,
        auth: &AuthToken,
        container: &str,
        prefix: &str,
    ) -> ClientResult<Vec<ObjectEntry>> {
        let mut entries: Vec<ObjectEntry> = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = Self::container_url(auth, container)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("format", "json");
                query.append_pair("prefix", prefix);
                if let Some(marker) = &marker {
                    query.append_pair("marker", marker);
                }
            }

            let response = send(
                self.http.get(url).header(AUTH_TOKEN, &auth.token),
                "Container GET",
            )
            .await?;
            let body = response
                .bytes()
                .await
                .map_err(|e| ClientError::transport(format!("Container GET body failed: {e}")))?;
            if body.iter().all(u8::is_ascii_whitespace) {
                break;
            }
            let page: Vec<ObjectEntry> = serde_json::from_slice(&body).map_err(|e| {
                ClientError::transport(format!("invalid container listing: {e}"))
            })?;
            let Some(last) = page.last() else {
                break;
            };
            marker = Some(last.name.clone());
            entries.extend(page);
        }
        Ok(entries)
    }

    fn backend_name(&self) -> &'static str {
        "swift"
    }
}
