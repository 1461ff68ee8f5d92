//! HTTP handlers for the Swift auth, container and object APIs.
//! Object bodies are streamed in both directions; storage concerns are
//! delegated to the backend [`Connection`](crate::connection::Connection).

use super::{EmulatorState, error::ApiError};
use crate::{
    connection::ListOpts,
    models::{
        ByteRange, Manifest, ObjectInfo,
        manifest::{ManifestGetEntry, ManifestPutEntry},
    },
};
use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::io;
use tracing::debug;

const MAX_MANIFEST_BODY: usize = 2 << 20;
const REGION: &str = "RegionOne";

/// Query params accepted by container listings.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub format: Option<String>,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub marker: Option<String>,
    pub limit: Option<usize>,
}

/// Query params accepted by object routes.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    #[serde(rename = "multipart-manifest")]
    pub multipart_manifest: Option<String>,
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn storage_url(state: &EmulatorState, headers: &HeaderMap) -> String {
    let host = header_str(headers, header::HOST.as_str()).unwrap_or("localhost");
    format!("http://{}/v1/{}", host, state.account)
}

/// Reject requests without a valid token or for another account.
fn authorize(state: &EmulatorState, headers: &HeaderMap, account: &str) -> Result<(), ApiError> {
    let token = header_str(headers, "X-Auth-Token").ok_or_else(ApiError::unauthorized)?;
    if !state.token_valid(token) {
        return Err(ApiError::unauthorized());
    }
    if account != state.account {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "wrong account"));
    }
    Ok(())
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn set_object_headers(headers: &mut HeaderMap, info: &ObjectInfo, length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    insert_header(headers, "etag", &format!("\"{}\"", info.etag));
    insert_header(
        headers,
        "last-modified",
        &info
            .last_modified
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string(),
    );
    if info.static_large_object {
        headers.insert("x-static-large-object", HeaderValue::from_static("True"));
    }
}

/// `GET /auth/v1.0` - Swift v1 auth with `X-Auth-User` / `X-Auth-Key`.
pub async fn auth_v1(
    State(state): State<EmulatorState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = header_str(&headers, "X-Auth-User").unwrap_or_default();
    let key = header_str(&headers, "X-Auth-Key").unwrap_or_default();
    if !state.credentials_match(user, key) {
        return Err(ApiError::unauthorized());
    }
    let token = state.issue_token();
    let mut response = Response::new(Body::empty());
    let out = response.headers_mut();
    insert_header(out, "x-storage-url", &storage_url(&state, &headers));
    insert_header(out, "x-auth-token", &token);
    insert_header(out, "x-storage-token", &token);
    Ok(response)
}

/// `POST /v2.0/tokens` - Keystone v2 password credentials.
pub async fn auth_v2(
    State(state): State<EmulatorState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let user = body
        .pointer("/auth/passwordCredentials/username")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let key = body
        .pointer("/auth/passwordCredentials/password")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !state.credentials_match(user, key) {
        return Err(ApiError::unauthorized());
    }
    let token = state.issue_token();
    let body = json!({
        "access": {
            "token": { "id": token },
            "serviceCatalog": [{
                "type": "object-store",
                "name": "swift",
                "endpoints": [{
                    "region": REGION,
                    "publicURL": storage_url(&state, &headers),
                }]
            }]
        }
    });
    Ok(Json(body).into_response())
}

/// `POST /v3/auth/tokens` - Keystone v3 password method; the token is
/// returned in `X-Subject-Token`.
pub async fn auth_v3(
    State(state): State<EmulatorState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let user = body
        .pointer("/auth/identity/password/user")
        .ok_or_else(|| ApiError::bad_request("missing password user"))?;
    let name = user
        .get("name")
        .or_else(|| user.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let key = user
        .get("password")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !state.credentials_match(name, key) {
        return Err(ApiError::unauthorized());
    }
    let token = state.issue_token();
    let body = json!({
        "token": {
            "methods": ["password"],
            "catalog": [{
                "type": "object-store",
                "name": "swift",
                "endpoints": [{
                    "interface": "public",
                    "region": REGION,
                    "region_id": REGION,
                    "url": storage_url(&state, &headers),
                }]
            }]
        }
    });
    let mut response = (StatusCode::CREATED, Json(body)).into_response();
    insert_header(response.headers_mut(), "x-subject-token", &token);
    Ok(response)
}

/// `HEAD /v1/{account}` - account probe.
pub async fn head_account(
    State(state): State<EmulatorState>,
    Path(account): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers, &account)?;
    state.backend.health_check().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `HEAD /v1/{account}/{container}`
pub async fn head_container(
    State(state): State<EmulatorState>,
    Path((account, container)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers, &account)?;
    if state.backend.container_exists(&container).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "container not found"))
    }
}

/// `PUT /v1/{account}/{container}` - 201 when created, 202 when present.
pub async fn create_container(
    State(state): State<EmulatorState>,
    Path((account, container)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers, &account)?;
    if state.backend.container_exists(&container).await? {
        return Ok(StatusCode::ACCEPTED);
    }
    state.backend.container_create(&container).await?;
    Ok(StatusCode::CREATED)
}

/// `DELETE /v1/{account}/{container}` - 409 unless empty.
pub async fn delete_container(
    State(state): State<EmulatorState>,
    Path((account, container)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers, &account)?;
    state.backend.container_delete(&container).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/{account}/{container}` - one listing page, JSON or plain text.
pub async fn list_container(
    State(state): State<EmulatorState>,
    Path((account, container)): Path<(String, String)>,
    Query(q): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, &account)?;
    let delimiter = match q.delimiter.as_deref() {
        None | Some("") => None,
        Some(d) => {
            let mut chars = d.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(c),
                _ => return Err(ApiError::bad_request("delimiter must be one character")),
            }
        }
    };
    let opts = ListOpts {
        prefix: q.prefix.unwrap_or_default(),
        delimiter,
        marker: q.marker.filter(|m| !m.is_empty()),
        limit: q.limit,
    };
    let names = state.backend.object_names(&container, &opts).await?;
    debug!(%container, entries = names.len(), "listed container");

    if q.format.as_deref() == Some("json") {
        let entries: Vec<Value> = names
            .iter()
            .map(|name| {
                let is_dir = delimiter.is_some_and(|d| {
                    name.ends_with(d)
                        && name.strip_prefix(&opts.prefix).unwrap_or(name).contains(d)
                });
                if is_dir {
                    json!({ "subdir": name })
                } else {
                    json!({ "name": name })
                }
            })
            .collect();
        return Ok(Json(entries).into_response());
    }
    if names.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let mut text = names.join("\n");
    text.push('\n');
    Ok(text.into_response())
}

/// `PUT /v1/{account}/{container}/{*object}` - stream an object, or commit a
/// static large object manifest with `?multipart-manifest=put`.
pub async fn put_object(
    State(state): State<EmulatorState>,
    Path((account, container, object)): Path<(String, String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, &account)?;

    if q.multipart_manifest.as_deref() == Some("put") {
        let raw = to_bytes(body, MAX_MANIFEST_BODY)
            .await
            .map_err(|err| ApiError::bad_request(format!("reading manifest: {err}")))?;
        let entries: Vec<ManifestPutEntry> = serde_json::from_slice(&raw)
            .map_err(|err| ApiError::bad_request(format!("invalid manifest: {err}")))?;
        let manifest = Manifest::from_put_entries(entries)
            .ok_or_else(|| ApiError::bad_request("manifest segment paths must be /container/object"))?;
        state
            .backend
            .manifest_put(&container, &object, &manifest)
            .await?;
        let mut response = StatusCode::CREATED.into_response();
        insert_header(
            response.headers_mut(),
            "etag",
            &format!("\"{}\"", manifest.etag()),
        );
        return Ok(response);
    }

    let content_length = header_str(&headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse::<u64>().ok());
    let stream = body.into_data_stream().map_err(io::Error::other);
    let etag = state
        .backend
        .object_put(&container, &object, Box::pin(stream), content_length)
        .await?;

    let mut response = StatusCode::CREATED.into_response();
    insert_header(response.headers_mut(), "etag", &format!("\"{etag}\""));
    Ok(response)
}

/// `GET /v1/{account}/{container}/{*object}` - streaming download honoring
/// `Range`; `?multipart-manifest=get` returns a manifest's segment list.
pub async fn get_object(
    State(state): State<EmulatorState>,
    Path((account, container, object)): Path<(String, String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, &account)?;

    if q.multipart_manifest.as_deref() == Some("get") {
        if let Some(manifest) = state.backend.manifest_get(&container, &object).await? {
            let entries: Vec<ManifestGetEntry> = manifest.to_get_entries();
            let mut response = Json(entries).into_response();
            response
                .headers_mut()
                .insert("x-static-large-object", HeaderValue::from_static("True"));
            return Ok(response);
        }
    }

    let info = state.backend.object_stat(&container, &object).await?;
    let range = header_str(&headers, header::RANGE.as_str()).and_then(ByteRange::parse_header);
    let span = match range {
        Some(range) => Some(range.resolve(info.bytes).ok_or_else(|| {
            ApiError::new(StatusCode::RANGE_NOT_SATISFIABLE, "range not satisfiable")
        })?),
        None => None,
    };
    let body = state.backend.object_open(&container, &object, range).await?;

    let mut response = Response::new(Body::from_stream(body.stream));
    match span {
        Some((start, end)) => {
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            set_object_headers(response.headers_mut(), &info, end - start);
            insert_header(
                response.headers_mut(),
                "content-range",
                &format!("bytes {}-{}/{}", start, end - 1, info.bytes),
            );
        }
        None => set_object_headers(response.headers_mut(), &info, info.bytes),
    }
    Ok(response)
}

/// `HEAD /v1/{account}/{container}/{*object}` - same headers as GET, no body.
pub async fn head_object(
    State(state): State<EmulatorState>,
    Path((account, container, object)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, &account)?;
    let info = state.backend.object_stat(&container, &object).await?;
    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &info, info.bytes);
    Ok(response)
}

/// `DELETE /v1/{account}/{container}/{*object}`; with
/// `?multipart-manifest=delete` the referenced segments go too.
pub async fn delete_object(
    State(state): State<EmulatorState>,
    Path((account, container, object)): Path<(String, String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers, &account)?;
    let manifest = if q.multipart_manifest.as_deref() == Some("delete") {
        state.backend.manifest_get(&container, &object).await?
    } else {
        None
    };
    state.backend.object_delete(&container, &object).await?;
    for segment in manifest.iter().flat_map(|m| &m.segments) {
        match state
            .backend
            .object_delete(&segment.container, &segment.name)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(StatusCode::NO_CONTENT)
}
