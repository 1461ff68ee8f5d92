//! HTTP connection to an OpenStack Swift endpoint.
//!
//! Authentication (Swift v1, Keystone v2 and v3) happens on first use and is
//! renewed once whenever the cluster answers `401`. Requests with an
//! in-memory body are retried on transient failures; streaming uploads are
//! sent exactly once.

use super::{Connection, ListOpts, ObjectBody};
use crate::{
    checksum::normalize_etag,
    errors::{Error, Result},
    models::{ByteRange, Manifest, ObjectInfo, manifest::ManifestGetEntry},
    payload::ByteStream,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{
    Client, RequestBuilder, Response, StatusCode, Url,
    header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED, RANGE},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{fmt, io, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const AUTH_TOKEN: &str = "X-Auth-Token";
const STATIC_LARGE_OBJECT: &str = "X-Static-Large-Object";
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Identity parameters and transport limits for [`SwiftConnection`].
///
/// Empty strings mean "not set".
#[derive(Clone)]
pub struct ConnectOptions {
    /// 1, 2 or 3; 0 detects the version from `auth_url`.
    pub auth_version: u8,
    pub auth_url: String,
    pub username: String,
    pub user_id: String,
    pub user_domain_name: String,
    pub user_domain_id: String,
    /// Password, or API key for v1.
    pub password: String,
    pub domain_id: String,
    pub domain_name: String,
    pub project_id: String,
    pub project_name: String,
    pub project_domain_id: String,
    pub project_domain_name: String,
    pub region_name: String,
    pub retries: u32,
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auth_version: 0,
            auth_url: String::new(),
            username: String::new(),
            user_id: String::new(),
            user_domain_name: String::new(),
            user_domain_id: String::new(),
            password: String::new(),
            domain_id: String::new(),
            domain_name: String::new(),
            project_id: String::new(),
            project_name: String::new(),
            project_domain_id: String::new(),
            project_domain_name: String::new(),
            region_name: String::new(),
            retries: 3,
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("auth_version", &self.auth_version)
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("user_id", &self.user_id)
            .field("password", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("project_name", &self.project_name)
            .field("region_name", &self.region_name)
            .field("retries", &self.retries)
            .field("connect_timeout", &self.connect_timeout)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectOptions {
    /// The explicit version, or the one named in the auth URL path.
    pub fn resolved_auth_version(&self) -> Result<u8> {
        match self.auth_version {
            0 => {
                let url = self.auth_url.to_ascii_lowercase();
                if url.contains("v3") {
                    Ok(3)
                } else if url.contains("v2") {
                    Ok(2)
                } else if url.contains("v1") {
                    Ok(1)
                } else {
                    Err(Error::Config(format!(
                        "cannot detect auth version from `{}`; set auth_version",
                        self.auth_url
                    )))
                }
            }
            v @ 1..=3 => Ok(v),
            v => Err(Error::Config(format!("unsupported auth version {v}"))),
        }
    }
}

/// Storage endpoint and token obtained from the identity service.
#[derive(Debug)]
struct Session {
    storage_url: Url,
    token: String,
}

#[derive(Deserialize)]
struct V2Response {
    access: V2Access,
}

#[derive(Deserialize)]
struct V2Access {
    token: V2Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<V2Service>,
}

#[derive(Deserialize)]
struct V2Token {
    id: String,
}

#[derive(Deserialize)]
struct V2Service {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<V2Endpoint>,
}

#[derive(Deserialize)]
struct V2Endpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: String,
}

#[derive(Deserialize)]
struct V3Response {
    token: V3Token,
}

#[derive(Deserialize)]
struct V3Token {
    #[serde(default)]
    catalog: Vec<V3Service>,
}

#[derive(Deserialize)]
struct V3Service {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<V3Endpoint>,
}

#[derive(Deserialize)]
struct V3Endpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

/// One entry of a JSON container listing.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
enum ListEntry {
    Subdir { subdir: String },
    Object { name: String },
}

impl ListEntry {
    fn into_name(self) -> String {
        match self {
            ListEntry::Subdir { subdir } => subdir,
            ListEntry::Object { name } => name,
        }
    }
}

fn region_matches(wanted: &str, candidates: &[Option<&str>]) -> bool {
    wanted.is_empty() || candidates.iter().flatten().any(|r| *r == wanted)
}

fn v2_storage_url(access: &V2Access, region: &str) -> Option<String> {
    access
        .service_catalog
        .iter()
        .filter(|s| s.kind == "object-store")
        .flat_map(|s| &s.endpoints)
        .find(|e| region_matches(region, &[e.region.as_deref()]))
        .map(|e| e.public_url.clone())
}

fn v3_storage_url(token: &V3Token, region: &str) -> Option<String> {
    token
        .catalog
        .iter()
        .filter(|s| s.kind == "object-store")
        .flat_map(|s| &s.endpoints)
        .find(|e| {
            e.interface == "public"
                && region_matches(region, &[e.region.as_deref(), e.region_id.as_deref()])
        })
        .map(|e| e.url.clone())
}

fn domain_ref(id: &str, name: &str) -> Option<Value> {
    if !id.is_empty() {
        Some(json!({ "id": id }))
    } else if !name.is_empty() {
        Some(json!({ "name": name }))
    } else {
        None
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn is_static_large_object(headers: &HeaderMap) -> bool {
    header_str(headers, STATIC_LARGE_OBJECT).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Map a transport-level failure.
fn transport_err(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::DeadlineExceeded
    } else {
        Error::backend(format!("swift request: {err}"))
    }
}

/// Turn a non-success response into an [`Error`]; 404 becomes `not_found()`.
async fn check(resp: Response, not_found: impl FnOnce() -> Error) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body = body.trim();
    Err(match status {
        StatusCode::NOT_FOUND => not_found(),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Auth(format!("{status}: {body}"))
        }
        _ => Error::backend_status(status.as_u16(), body),
    })
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(100u64.saturating_mul(1 << attempt.min(16))).min(MAX_BACKOFF)
}

pub struct SwiftConnection {
    client: Client,
    opts: ConnectOptions,
    session: RwLock<Option<Arc<Session>>>,
}

impl SwiftConnection {
    /// Build the HTTP client and authenticate.
    pub async fn connect(opts: ConnectOptions) -> Result<Self> {
        opts.resolved_auth_version()?;
        let client = Client::builder()
            .connect_timeout(opts.connect_timeout)
            .timeout(opts.timeout)
            .build()
            .map_err(|err| Error::Config(format!("http client: {err}")))?;
        let conn = Self {
            client,
            opts,
            session: RwLock::new(None),
        };
        conn.session().await?;
        Ok(conn)
    }

    async fn session(&self) -> Result<Arc<Session>> {
        let current = self.session.read().await.clone();
        if let Some(session) = current {
            return Ok(session);
        }
        let mut slot = self.session.write().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = Arc::new(self.authenticate().await?);
        info!(storage_url = %session.storage_url, "authenticated with swift");
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Forget `stale` so the next request re-authenticates.
    async fn invalidate(&self, stale: &Arc<Session>) {
        let mut slot = self.session.write().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, stale)) {
            *slot = None;
        }
    }

    async fn authenticate(&self) -> Result<Session> {
        let (storage_url, token) = match self.opts.resolved_auth_version()? {
            1 => self.auth_v1().await?,
            2 => self.auth_v2().await?,
            _ => self.auth_v3().await?,
        };
        let storage_url = Url::parse(&storage_url)
            .map_err(|err| Error::Auth(format!("invalid storage url `{storage_url}`: {err}")))?;
        Ok(Session { storage_url, token })
    }

    async fn auth_v1(&self) -> Result<(String, String)> {
        let resp = self
            .client
            .get(&self.opts.auth_url)
            .header("X-Auth-User", &self.opts.username)
            .header("X-Auth-Key", &self.opts.password)
            .send()
            .await
            .map_err(transport_err)?;
        let resp = check(resp, || Error::Auth("auth endpoint not found".into())).await?;
        let headers = resp.headers();
        let url = header_str(headers, "X-Storage-Url");
        let token = header_str(headers, AUTH_TOKEN);
        match (url, token) {
            (Some(url), Some(token)) => Ok((url.to_string(), token.to_string())),
            _ => Err(Error::Auth(
                "v1 response lacks X-Storage-Url or X-Auth-Token".into(),
            )),
        }
    }

    async fn auth_v2(&self) -> Result<(String, String)> {
        let o = &self.opts;
        let mut auth = json!({
            "passwordCredentials": { "username": o.username, "password": o.password }
        });
        if !o.project_id.is_empty() {
            auth["tenantId"] = json!(o.project_id);
        } else if !o.project_name.is_empty() {
            auth["tenantName"] = json!(o.project_name);
        }
        let url = format!("{}/tokens", o.auth_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .json(&json!({ "auth": auth }))
            .send()
            .await
            .map_err(transport_err)?;
        let resp = check(resp, || Error::Auth("v2 tokens endpoint not found".into())).await?;
        let body: V2Response = resp
            .json()
            .await
            .map_err(|err| Error::Auth(format!("decode v2 token response: {err}")))?;
        let storage_url = v2_storage_url(&body.access, &o.region_name).ok_or_else(|| {
            Error::Auth(format!(
                "no object-store endpoint in catalog for region `{}`",
                o.region_name
            ))
        })?;
        Ok((storage_url, body.access.token.id))
    }

    fn v3_request(&self) -> Value {
        let o = &self.opts;
        let mut user = json!({ "password": o.password });
        if !o.user_id.is_empty() {
            user["id"] = json!(o.user_id);
        } else {
            user["name"] = json!(o.username);
            if let Some(domain) = domain_ref(&o.user_domain_id, &o.user_domain_name)
                .or_else(|| domain_ref(&o.domain_id, &o.domain_name))
            {
                user["domain"] = domain;
            }
        }

        let mut auth = json!({
            "identity": { "methods": ["password"], "password": { "user": user } }
        });
        if !o.project_id.is_empty() {
            auth["scope"] = json!({ "project": { "id": o.project_id } });
        } else if !o.project_name.is_empty() {
            let mut project = json!({ "name": o.project_name });
            if let Some(domain) = domain_ref(&o.project_domain_id, &o.project_domain_name)
                .or_else(|| domain_ref(&o.domain_id, &o.domain_name))
            {
                project["domain"] = domain;
            }
            auth["scope"] = json!({ "project": project });
        } else if let Some(domain) = domain_ref(&o.domain_id, &o.domain_name) {
            auth["scope"] = json!({ "domain": domain });
        }
        json!({ "auth": auth })
    }

    async fn auth_v3(&self) -> Result<(String, String)> {
        let url = format!("{}/auth/tokens", self.opts.auth_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .json(&self.v3_request())
            .send()
            .await
            .map_err(transport_err)?;
        let resp = check(resp, || Error::Auth("v3 tokens endpoint not found".into())).await?;
        let token = header_str(resp.headers(), "X-Subject-Token")
            .map(str::to_string)
            .ok_or_else(|| Error::Auth("v3 response lacks X-Subject-Token".into()))?;
        let body: V3Response = resp
            .json()
            .await
            .map_err(|err| Error::Auth(format!("decode v3 token response: {err}")))?;
        let storage_url = v3_storage_url(&body.token, &self.opts.region_name).ok_or_else(|| {
            Error::Auth(format!(
                "no public object-store endpoint in catalog for region `{}`",
                self.opts.region_name
            ))
        })?;
        Ok((storage_url, token))
    }

    fn url(session: &Session, container: Option<&str>, object: Option<&str>) -> Result<Url> {
        let mut url = session.storage_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Config("storage url cannot be a base".into()))?;
            segments.pop_if_empty();
            if let Some(container) = container {
                segments.push(container);
            }
            if let Some(object) = object {
                segments.extend(object.split('/'));
            }
        }
        Ok(url)
    }

    /// Send a request that can be rebuilt at will: replayed once after a
    /// `401` and retried with backoff on connect errors and `5xx`.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client, &Session) -> Result<RequestBuilder> + Send + Sync,
    {
        let mut attempt = 0u32;
        let mut reauthenticated = false;
        loop {
            let session = self.session().await?;
            let result = build(&self.client, &session)?
                .header(AUTH_TOKEN, &session.token)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED && !reauthenticated => {
                    debug!("token rejected, re-authenticating");
                    reauthenticated = true;
                    self.invalidate(&session).await;
                }
                Ok(resp) if resp.status().is_server_error() && attempt < self.opts.retries => {
                    warn!(status = %resp.status(), attempt, "transient swift failure, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt += 1;
                }
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_connect() && attempt < self.opts.retries => {
                    warn!(error = %err, attempt, "swift connect failed, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(transport_err(err)),
            }
        }
    }

    /// Send a request whose body can only be consumed once.
    async fn send_once<F>(&self, build: F) -> Result<Response>
    where
        F: FnOnce(&Client, &Session) -> Result<RequestBuilder>,
    {
        let session = self.session().await?;
        let resp = build(&self.client, &session)?
            .header(AUTH_TOKEN, &session.token)
            .send()
            .await
            .map_err(transport_err)?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.invalidate(&session).await;
        }
        Ok(resp)
    }
}

#[async_trait]
impl Connection for SwiftConnection {
    async fn container_exists(&self, container: &str) -> Result<bool> {
        let resp = self
            .send(|client, s| Ok(client.head(Self::url(s, Some(container), None)?)))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp, || Error::ContainerNotFound(container.to_string())).await?;
        Ok(true)
    }

    async fn container_create(&self, container: &str) -> Result<()> {
        let resp = self
            .send(|client, s| {
                Ok(client
                    .put(Self::url(s, Some(container), None)?)
                    .header(CONTENT_LENGTH, 0))
            })
            .await?;
        check(resp, || Error::ContainerNotFound(container.to_string())).await?;
        info!(container, "created swift container");
        Ok(())
    }

    async fn container_delete(&self, container: &str) -> Result<()> {
        let resp = self
            .send(|client, s| Ok(client.delete(Self::url(s, Some(container), None)?)))
            .await?;
        check(resp, || Error::ContainerNotFound(container.to_string())).await?;
        Ok(())
    }

    async fn object_open(
        &self,
        container: &str,
        name: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectBody> {
        let resp = self
            .send(|client, s| {
                let mut req = client.get(Self::url(s, Some(container), Some(name))?);
                if let Some(range) = range {
                    req = req.header(RANGE, range.header_value());
                }
                Ok(req)
            })
            .await?;
        let resp = check(resp, || Error::object_not_found(container, name)).await?;
        let etag = header_str(resp.headers(), ETAG.as_str()).map(normalize_etag);
        let static_large_object = is_static_large_object(resp.headers());
        let stream = resp.bytes_stream().map_err(io::Error::other).boxed();
        Ok(ObjectBody {
            stream,
            etag,
            static_large_object,
        })
    }

    async fn object_stat(&self, container: &str, name: &str) -> Result<ObjectInfo> {
        let resp = self
            .send(|client, s| Ok(client.head(Self::url(s, Some(container), Some(name))?)))
            .await?;
        let resp = check(resp, || Error::object_not_found(container, name)).await?;
        let headers = resp.headers();
        let bytes = header_str(headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::backend(format!("HEAD {name}: missing Content-Length")))?;
        let last_modified = header_str(headers, LAST_MODIFIED.as_str())
            .and_then(parse_http_date)
            .ok_or_else(|| Error::backend(format!("HEAD {name}: missing Last-Modified")))?;
        Ok(ObjectInfo {
            name: name.to_string(),
            bytes,
            etag: header_str(headers, ETAG.as_str())
                .map(normalize_etag)
                .unwrap_or_default(),
            last_modified,
            static_large_object: is_static_large_object(headers),
        })
    }

    async fn object_put(
        &self,
        container: &str,
        name: &str,
        body: ByteStream,
        content_length: Option<u64>,
    ) -> Result<String> {
        let resp = self
            .send_once(|client, s| {
                let mut req = client
                    .put(Self::url(s, Some(container), Some(name))?)
                    .body(reqwest::Body::wrap_stream(body));
                if let Some(len) = content_length {
                    req = req.header(CONTENT_LENGTH, len);
                }
                Ok(req)
            })
            .await?;
        let resp = check(resp, || Error::ContainerNotFound(container.to_string())).await?;
        header_str(resp.headers(), ETAG.as_str())
            .map(normalize_etag)
            .ok_or_else(|| Error::backend(format!("PUT {name}: response carries no ETag")))
    }

    async fn manifest_put(&self, container: &str, name: &str, manifest: &Manifest) -> Result<()> {
        let body = Bytes::from(
            serde_json::to_vec(&manifest.to_put_entries())
                .map_err(|err| Error::backend(format!("encode manifest: {err}")))?,
        );
        let resp = self
            .send(|client, s| {
                let mut url = Self::url(s, Some(container), Some(name))?;
                url.query_pairs_mut().append_pair("multipart-manifest", "put");
                Ok(client
                    .put(url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone()))
            })
            .await?;
        check(resp, || Error::ContainerNotFound(container.to_string())).await?;
        Ok(())
    }

    async fn manifest_get(&self, container: &str, name: &str) -> Result<Option<Manifest>> {
        let resp = self
            .send(|client, s| {
                let mut url = Self::url(s, Some(container), Some(name))?;
                url.query_pairs_mut().append_pair("multipart-manifest", "get");
                Ok(client.get(url))
            })
            .await?;
        let resp = check(resp, || Error::object_not_found(container, name)).await?;
        if !is_static_large_object(resp.headers()) {
            return Ok(None);
        }
        let entries: Vec<ManifestGetEntry> = resp
            .json()
            .await
            .map_err(|err| Error::backend(format!("decode manifest of {name}: {err}")))?;
        Manifest::from_get_entries(entries)
            .map(Some)
            .ok_or_else(|| Error::backend(format!("manifest of {name} has malformed segment paths")))
    }

    async fn object_delete(&self, container: &str, name: &str) -> Result<()> {
        let resp = self
            .send(|client, s| Ok(client.delete(Self::url(s, Some(container), Some(name))?)))
            .await?;
        check(resp, || Error::object_not_found(container, name)).await?;
        Ok(())
    }

    async fn object_names(&self, container: &str, opts: &ListOpts) -> Result<Vec<String>> {
        let resp = self
            .send(|client, s| {
                let mut url = Self::url(s, Some(container), None)?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("format", "json");
                    if !opts.prefix.is_empty() {
                        query.append_pair("prefix", &opts.prefix);
                    }
                    if let Some(delim) = opts.delimiter {
                        query.append_pair("delimiter", delim.encode_utf8(&mut [0; 4]));
                    }
                    if let Some(marker) = &opts.marker {
                        query.append_pair("marker", marker);
                    }
                    if let Some(limit) = opts.limit {
                        query.append_pair("limit", &limit.to_string());
                    }
                }
                Ok(client.get(url))
            })
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let resp = check(resp, || Error::ContainerNotFound(container.to_string())).await?;
        let entries: Vec<ListEntry> = resp
            .json()
            .await
            .map_err(|err| Error::backend(format!("decode listing of {container}: {err}")))?;
        Ok(entries.into_iter().map(ListEntry::into_name).collect())
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .send(|client, s| Ok(client.head(Self::url(s, None, None)?)))
            .await?;
        check(resp, || Error::backend_status(404, "account not found")).await?;
        Ok(())
    }
}
