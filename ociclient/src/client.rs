use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::{header, Client as ReqwestClient, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::digest::OciDigest;
use crate::error::{RegistryError, Result};
use crate::manifest::{Manifest, ACCEPT_MANIFEST};

/// Blobs up to this size go up in a single PUT.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Username and password for a registry
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings used to build a [`Client`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the registry, e.g. `https://registry-1.docker.io`
    pub registry_url: String,
    pub credentials: Option<Credentials>,
    /// SOCKS5 proxy address (`host:port`)
    pub proxy: Option<String>,
    pub chunk_size: usize,
}

impl ClientConfig {
    pub fn new(registry_url: impl Into<String>) -> Self {
        Self {
            registry_url: registry_url.into(),
            credentials: None,
            proxy: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Result of [`Client::upload_blob`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    AlreadyPresent,
}

/// Token scope requested from the registry's auth service
#[derive(Debug, Clone)]
enum Scope<'a> {
    Registry,
    Pull(&'a str),
    Push(&'a str),
}

impl fmt::Display for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Registry => Ok(()),
            Scope::Pull(repository) => write!(f, "repository:{}:pull", repository),
            Scope::Push(repository) => write!(f, "repository:{}:pull,push", repository),
        }
    }
}

/// Parsed `WWW-Authenticate` header
#[derive(Debug, PartialEq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = parse_auth_params(params);
        let realm = params.get("realm")?.clone();
        Some(Challenge::Bearer {
            realm,
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

/// Split `key="value", key=value` pairs. Quoted values may contain commas.
fn parse_auth_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    params
}

// Token authentication response from the auth service
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

enum Authorization {
    Anonymous,
    Basic,
    Bearer(String),
}

/// A client for interacting with a Docker/OCI registry.
///
/// Cloning is cheap; clones share the connection pool and token cache.
#[derive(Debug, Clone)]
pub struct Client {
    registry_url: String,
    credentials: Option<Credentials>,
    client: ReqwestClient,
    tokens: Arc<RwLock<HashMap<String, String>>>,
    chunk_size: usize,
}

impl Client {
    /// Create a new client for the given registry URL.
    pub fn new(registry_url: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            registry_url: registry_url.into().trim_end_matches('/').to_string(),
            credentials,
            client: ReqwestClient::new(),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Create a client from a full configuration, including proxy settings.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let mut builder =
            ReqwestClient::builder().user_agent(concat!("ociclient/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = &config.proxy {
            let proxy_url = if proxy.contains("://") {
                proxy.clone()
            } else {
                format!("socks5://{}", proxy)
            };
            builder = builder.proxy(reqwest::Proxy::all(&proxy_url)?);
        }

        Ok(Self {
            registry_url: config.registry_url.trim_end_matches('/').to_string(),
            credentials: config.credentials.clone(),
            client: builder.build()?,
            tokens: Arc::new(RwLock::new(HashMap::new())),
            chunk_size: config.chunk_size.max(1),
        })
    }

    /// Override the PATCH chunk size used for large uploads.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    /// Check that the registry speaks the v2 API and accepts our credentials.
    #[instrument(skip(self), fields(registry = %self.registry_url))]
    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/v2/", self.registry_url);
        let response = self
            .send(Method::GET, &url, &Scope::Registry, |r| r)
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RegistryError::Unreachable(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    /// Fetch and decode a manifest by tag or digest.
    #[instrument(skip(self))]
    pub async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let url = self.manifest_url(repository, reference);
        let response = self
            .send(Method::GET, &url, &Scope::Pull(repository), |r| {
                r.header(header::ACCEPT, ACCEPT_MANIFEST)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(format!("manifest {}:{}", repository, reference)));
        }
        if !status.is_success() {
            return Err(unexpected(response).await);
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        trace!(content_type = ?content_type, body_len = body.len(), "received manifest");

        Ok(Manifest::decode(content_type.as_deref(), body)?)
    }

    /// Resolve a reference to the digest the registry reports for it.
    #[instrument(skip(self))]
    pub async fn manifest_digest(&self, repository: &str, reference: &str) -> Result<OciDigest> {
        let url = self.manifest_url(repository, reference);
        let response = self
            .send(Method::HEAD, &url, &Scope::Pull(repository), |r| {
                r.header(header::ACCEPT, ACCEPT_MANIFEST)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(format!("manifest {}:{}", repository, reference)));
        }
        if !status.is_success() {
            return Err(unexpected(response).await);
        }

        let digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                RegistryError::Decode(format!("missing {} header", DOCKER_CONTENT_DIGEST))
            })?;
        Ok(OciDigest::from_str(digest)?)
    }

    /// Store a manifest under `reference`, sending its payload verbatim.
    #[instrument(skip(self, manifest), fields(media_type = %manifest.media_type()))]
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        let url = self.manifest_url(repository, reference);
        let (media_type, payload) = manifest.payload();
        let response = self
            .send(Method::PUT, &url, &Scope::Push(repository), |r| {
                r.header(header::CONTENT_TYPE, media_type).body(payload.clone())
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected { status, message });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_manifest(&self, repository: &str, digest: &OciDigest) -> Result<()> {
        let url = self.manifest_url(repository, &digest.to_string());
        let response = self.send(Method::DELETE, &url, &Scope::Push(repository), |r| r).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(format!("manifest {}@{}", repository, digest)));
        }
        if !status.is_success() {
            return Err(unexpected(response).await);
        }
        Ok(())
    }

    /// Check if a blob with the given digest exists.
    #[instrument(skip(self))]
    pub async fn has_blob(&self, repository: &str, digest: &OciDigest) -> Result<bool> {
        let url = self.blob_url(repository, digest);
        let response = self.send(Method::HEAD, &url, &Scope::Pull(repository), |r| r).await?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            Err(unexpected(response).await)
        }
    }

    /// Upload a blob read from `reader`, unless the registry already has it.
    ///
    /// Blobs whose size is known and fits in one chunk are sent with a single
    /// PUT; everything else is sent as PATCH chunks followed by a closing PUT.
    /// A failed or cancelled transfer deletes its upload session.
    #[instrument(skip(self, reader, cancel))]
    pub async fn upload_blob<R: Read>(
        &self,
        repository: &str,
        digest: &OciDigest,
        reader: R,
        size: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        match self.has_blob(repository, digest).await {
            Ok(true) => return Ok(UploadOutcome::AlreadyPresent),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "blob existence check failed, uploading anyway"),
        }

        let mut location = self.start_upload(repository).await?;
        match self
            .transfer(repository, digest, reader, size, &mut location, cancel)
            .await
        {
            Ok(()) => Ok(UploadOutcome::Uploaded),
            Err(e) => {
                if let Err(cleanup) = self.cancel_upload(repository, &location).await {
                    debug!(error = %cleanup, "failed to delete upload session");
                }
                Err(e)
            }
        }
    }

    /// Mount a blob from another repository on the same registry.
    ///
    /// Returns `false` when the registry declines and offers a plain upload
    /// session instead; that session is discarded.
    #[instrument(skip(self))]
    pub async fn mount_blob(
        &self,
        repository: &str,
        digest: &OciDigest,
        from: &str,
    ) -> Result<bool> {
        let mut url =
            self.parse_url(&format!("{}/v2/{}/blobs/uploads/", self.registry_url, repository))?;
        url.query_pairs_mut()
            .append_pair("mount", &digest.to_string())
            .append_pair("from", from);

        let response = self
            .send(Method::POST, url.as_str(), &Scope::Push(repository), |r| {
                r.header(header::CONTENT_LENGTH, 0)
            })
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::ACCEPTED => {
                if let Some(location) = location_header(&response) {
                    let location = self.resolve_location(&location)?;
                    if let Err(e) = self.cancel_upload(repository, &location).await {
                        debug!(error = %e, "failed to delete upload session");
                    }
                }
                Ok(false)
            }
            _ => Err(unexpected(response).await),
        }
    }

    /// Start downloading a blob. The caller drains and verifies the stream.
    #[instrument(skip(self))]
    pub async fn download_blob(&self, repository: &str, digest: &OciDigest) -> Result<BlobStream> {
        let url = self.blob_url(repository, digest);
        let response = self.send(Method::GET, &url, &Scope::Pull(repository), |r| r).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(format!("blob {}", digest)));
        }
        if !status.is_success() {
            return Err(unexpected(response).await);
        }

        Ok(BlobStream { response })
    }

    async fn start_upload(&self, repository: &str) -> Result<String> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.registry_url, repository);
        let response = self
            .send(Method::POST, &url, &Scope::Push(repository), |r| {
                r.header(header::CONTENT_LENGTH, 0)
            })
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(RegistryError::UploadRejected { status, message });
        }

        let location = location_header(&response).ok_or_else(|| RegistryError::UploadRejected {
            status: StatusCode::ACCEPTED,
            message: "no location header in response".to_string(),
        })?;
        self.resolve_location(&location)
    }

    async fn transfer<R: Read>(
        &self,
        repository: &str,
        digest: &OciDigest,
        mut reader: R,
        size: Option<u64>,
        location: &mut String,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut verifier = digest.verifier();

        let monolithic = matches!(size, Some(size) if size <= self.chunk_size as u64);
        let body = if monolithic {
            let expected = size.unwrap_or_default();
            // Read one byte past the declared size to catch overlong streams
            let content = read_chunk(&mut reader, expected as usize + 1)?;
            if content.len() as u64 != expected {
                return Err(RegistryError::SizeMismatch {
                    expected,
                    actual: content.len() as u64,
                });
            }
            verifier.update(&content);
            content
        } else {
            let mut offset: u64 = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(RegistryError::Cancelled);
                }
                let chunk = read_chunk(&mut reader, self.chunk_size)?;
                if chunk.is_empty() {
                    break;
                }
                verifier.update(&chunk);

                let len = chunk.len() as u64;
                let range = format!("{}-{}", offset, offset + len - 1);
                trace!(range = %range, "uploading chunk");
                let response = cancellable(
                    cancel,
                    self.send(Method::PATCH, location, &Scope::Push(repository), |r| {
                        r.header(header::CONTENT_TYPE, "application/octet-stream")
                            .header(header::CONTENT_RANGE, range.as_str())
                            .header(header::CONTENT_LENGTH, len)
                            .body(chunk.clone())
                    }),
                )
                .await?;

                if response.status() != StatusCode::ACCEPTED {
                    let status = response.status();
                    let message = response.text().await.unwrap_or_default();
                    return Err(RegistryError::UploadRejected { status, message });
                }
                if let Some(next) = location_header(&response) {
                    *location = self.resolve_location(&next)?;
                }

                offset += len;
                if (len as usize) < self.chunk_size {
                    break;
                }
            }

            if let Some(expected) = size {
                if offset != expected {
                    return Err(RegistryError::SizeMismatch {
                        expected,
                        actual: offset,
                    });
                }
            }
            Bytes::new()
        };

        let actual = verifier.finish();
        if &actual != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        let mut url = self.parse_url(location)?;
        url.query_pairs_mut().append_pair("digest", &digest.to_string());
        let len = body.len();
        let response = cancellable(
            cancel,
            self.send(Method::PUT, url.as_str(), &Scope::Push(repository), |r| {
                r.header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(header::CONTENT_LENGTH, len)
                    .body(body.clone())
            }),
        )
        .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(RegistryError::UploadRejected { status, message });
        }
        Ok(())
    }

    async fn cancel_upload(&self, repository: &str, location: &str) -> Result<()> {
        let response = self.send(Method::DELETE, location, &Scope::Push(repository), |r| r).await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(unexpected(response).await);
        }
        Ok(())
    }

    /// Send a request, answering one authentication challenge if needed.
    ///
    /// `build` may be called twice, so bodies must be cheap to clone.
    async fn send<F>(
        &self,
        method: Method,
        url: &str,
        scope: &Scope<'_>,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let key = scope.to_string();
        let cached = self.tokens.read().await.get(&key).cloned();
        let authorization = match cached {
            Some(token) => Authorization::Bearer(token),
            None if self.credentials.is_some() => Authorization::Basic,
            None => Authorization::Anonymous,
        };

        let response = self.dispatch(method.clone(), url, &authorization, &build).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse);

        match challenge {
            Some(Challenge::Basic) if self.credentials.is_some() => {
                if matches!(authorization, Authorization::Basic) {
                    return Ok(response);
                }
                self.dispatch(method, url, &Authorization::Basic, &build).await
            }
            Some(Challenge::Bearer { realm, service, scope: challenged }) => {
                let requested = challenged.or_else(|| (!key.is_empty()).then(|| key.clone()));
                let token = self
                    .fetch_token(&realm, service.as_deref(), requested.as_deref())
                    .await?;
                self.tokens.write().await.insert(key, token.clone());
                self.dispatch(method, url, &Authorization::Bearer(token), &build).await
            }
            _ => Ok(response),
        }
    }

    async fn dispatch<F>(
        &self,
        method: Method,
        url: &str,
        authorization: &Authorization,
        build: &F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let mut request = build(self.client.request(method, url));
        match authorization {
            Authorization::Anonymous => {}
            Authorization::Basic => {
                if let Some(credentials) = &self.credentials {
                    request =
                        request.basic_auth(&credentials.username, Some(&credentials.password));
                }
            }
            Authorization::Bearer(token) => request = request.bearer_auth(token),
        }
        Ok(request.send().await?)
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> Result<String> {
        let mut token_url = Url::parse(realm)
            .map_err(|e| RegistryError::Auth(format!("invalid realm {}: {}", realm, e)))?;
        if let Some(service) = service {
            token_url.query_pairs_mut().append_pair("service", service);
        }
        if let Some(scope) = scope {
            token_url.query_pairs_mut().append_pair("scope", scope);
        }
        debug!(url = %token_url, "requesting token");

        let mut request = self.client.get(token_url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Auth(format!("token request failed: {} {}", status, body)));
        }

        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| RegistryError::Auth("token response carried no token".to_string()))
    }

    fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.registry_url, repository, reference)
    }

    fn blob_url(&self, repository: &str, digest: &OciDigest) -> String {
        format!("{}/v2/{}/blobs/{}", self.registry_url, repository, digest)
    }

    fn parse_url(&self, url: &str) -> Result<Url> {
        Url::parse(url).map_err(|e| RegistryError::InvalidUrl(format!("{}: {}", url, e)))
    }

    /// Upload locations may be relative to the registry root.
    fn resolve_location(&self, location: &str) -> Result<String> {
        let base = self.parse_url(&format!("{}/", self.registry_url))?;
        base.join(location)
            .map(String::from)
            .map_err(|e| RegistryError::InvalidUrl(format!("{}: {}", location, e)))
    }
}

/// A blob body being streamed from the registry
#[derive(Debug)]
pub struct BlobStream {
    response: Response,
}

impl BlobStream {
    /// Size announced by the registry, if any
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// Next piece of the body, `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.response.chunk().await?)
    }
}

fn location_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn read_chunk<R: Read>(reader: &mut R, limit: usize) -> Result<Bytes> {
    let mut buffer = Vec::with_capacity(limit.min(DEFAULT_CHUNK_SIZE));
    reader.by_ref().take(limit as u64).read_to_end(&mut buffer)?;
    Ok(Bytes::from(buffer))
}

async fn unexpected(response: Response) -> RegistryError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    RegistryError::UnexpectedStatus { status, message }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RegistryError::Cancelled),
        result = fut => result,
    }
}
