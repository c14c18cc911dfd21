//! Registry routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{
        HeaderMap, Method, Uri,
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, COOKIE, IF_NONE_MATCH},
    },
    middleware::from_fn,
    routing::{delete, get, put},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    application::{
        error::RegistryError,
        private::PublishOutcome,
        proxy::{ReadRequest, RegistryProxy, created},
        reply::Reply,
        search::parse_startkey,
        upstream::UpstreamRequest,
    },
    domain::request::RouteParams,
};

use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct RegistryState {
    pub proxy: Arc<RegistryProxy>,
}

impl RegistryState {
    pub fn new(proxy: Arc<RegistryProxy>) -> Self {
        Self { proxy }
    }
}

pub fn build_router(state: RegistryState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/-/all", get(search))
        .route("/-/all/{extra}", get(search))
        .route("/-/user/{user}", get(user).put(user))
        .route("/-/user/{user}/{*extra}", get(user).put(user))
        .route("/_private/{package}", put(publish_private))
        .route("/{package}", get(package).put(publish_public))
        .route("/{package}/{version}", get(package_version))
        .route("/{package}/-/{tarball}", get(tarball))
        .route("/{package}/-rev/{revid}", put(put_revision))
        .route(
            "/{package}/-/{tarball}/-rev/{version}",
            delete(delete_private),
        )
        .with_state(state)
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    startkey: Option<String>,
}

fn read_request(method: Method, uri: &Uri, headers: &HeaderMap, params: RouteParams) -> ReadRequest {
    ReadRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        params,
        if_none_match: headers
            .get(IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        startkey: None,
    }
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

async fn index(
    State(state): State<RegistryState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Reply, RegistryError> {
    let request = read_request(method, &uri, &headers, RouteParams::default());
    state.proxy.read(request).await
}

async fn search(
    State(state): State<RegistryState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Reply, RegistryError> {
    let startkey = query.startkey.as_deref().and_then(parse_startkey);
    let request =
        read_request(method, &uri, &headers, RouteParams::default()).with_startkey(startkey);
    state.proxy.read(request).await
}

async fn package(
    State(state): State<RegistryState>,
    Path(package): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Reply, RegistryError> {
    let request = read_request(method, &uri, &headers, RouteParams::package(package));
    state.proxy.package(request).await
}

async fn package_version(
    State(state): State<RegistryState>,
    Path((package, version)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Reply, RegistryError> {
    let params = RouteParams::package(package).with_version(version);
    let request = read_request(method, &uri, &headers, params);
    state.proxy.package(request).await
}

async fn tarball(
    State(state): State<RegistryState>,
    Path((package, tarball)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Reply, RegistryError> {
    let params = RouteParams::package(package).with_tarball(tarball);
    let request = read_request(method, &uri, &headers, params);
    state.proxy.tarball(request).await
}

async fn publish_private(
    State(state): State<RegistryState>,
    Path(package): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Reply, RegistryError> {
    match state
        .proxy
        .private_packages()
        .publish(&package, &payload)
        .await?
    {
        PublishOutcome::Created | PublishOutcome::AlreadyPublished => Ok(created()),
    }
}

async fn publish_public(
    State(state): State<RegistryState>,
    uri: Uri,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Reply, RegistryError> {
    state
        .proxy
        .publish_public(&path_and_query(&uri), payload, &headers)
        .await
}

async fn put_revision(
    State(state): State<RegistryState>,
    Path((package, _revid)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Reply, RegistryError> {
    state
        .proxy
        .put_revision(&package, &path_and_query(&uri), body, &headers)
        .await
}

async fn delete_private(
    State(state): State<RegistryState>,
    Path((package, tarball, version)): Path<(String, String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Reply, RegistryError> {
    state
        .proxy
        .remove(&package, &tarball, &version, &path_and_query(&uri), &headers)
        .await
}

/// Login and user creation go straight to the public registry.
async fn user(
    State(state): State<RegistryState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Reply, RegistryError> {
    let mut request = UpstreamRequest::new(method, path_and_query(&uri)).with_forwarded(
        &headers,
        &[CONTENT_TYPE, ACCEPT, COOKIE, AUTHORIZATION],
    );
    if !body.is_empty() {
        request = request.with_body(body);
    }
    state.proxy.relay(request).await
}
