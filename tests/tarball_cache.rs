mod common;

use axum::http::StatusCode;
use bytes::Bytes;

use common::{Harness, Scripted, bytes_of};
use regcache::{
    application::{
        error::RegistryError,
        proxy::ReadRequest,
        repos::{BlobStore, KeyValueStore},
    },
    domain::request::RouteParams,
};

const FILENAME: &str = "left-pad-1.3.0.tgz";

fn tarball_request() -> ReadRequest {
    ReadRequest::get(
        format!("/left-pad/-/{FILENAME}"),
        RouteParams::package("left-pad").with_tarball(FILENAME),
    )
}

#[tokio::test]
async fn fetched_tarballs_land_in_the_blob_store() {
    let harness = Harness::new();
    harness
        .upstream
        .push(Scripted::raw(StatusCode::OK, "tarball-bytes").with_etag("\"t1\""));

    let reply = harness.proxy.tarball(tarball_request()).await.expect("reply");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.etag.as_deref(), Some("\"t1\""));
    assert_eq!(bytes_of(reply).await, Bytes::from_static(b"tarball-bytes"));

    harness.settle().await;
    assert_eq!(
        harness.blob(FILENAME).await,
        Some(Bytes::from_static(b"tarball-bytes"))
    );
    let key = format!("tarball:left-pad:{FILENAME}");
    assert_eq!(
        harness.store.get(&key).await.expect("store read"),
        Some(Bytes::from(FILENAME))
    );
    assert_eq!(
        harness
            .store
            .get(&format!("{key}:etag"))
            .await
            .expect("store read"),
        Some(Bytes::from_static(b"\"t1\""))
    );
}

#[tokio::test]
async fn unreachable_upstream_streams_the_cached_blob() {
    let harness = Harness::new();
    harness
        .upstream
        .push(Scripted::raw(StatusCode::OK, "tarball-bytes").with_etag("\"t1\""));
    harness
        .proxy
        .tarball(tarball_request())
        .await
        .expect("prime cache");
    harness.settle().await;

    let fallback = harness
        .proxy
        .tarball(tarball_request())
        .await
        .expect("fallback");
    assert_eq!(fallback.status, StatusCode::OK);
    assert_eq!(fallback.etag.as_deref(), Some("\"t1\""));
    assert_eq!(bytes_of(fallback).await, Bytes::from_static(b"tarball-bytes"));

    let conditional = harness
        .proxy
        .tarball(tarball_request().with_if_none_match("\"t1\""))
        .await
        .expect("conditional fallback");
    assert_eq!(conditional.status, StatusCode::NOT_MODIFIED);
    assert!(conditional.is_empty());
}

#[tokio::test]
async fn missing_blob_with_dangling_record_is_not_found() {
    let harness = Harness::new();
    harness
        .upstream
        .push(Scripted::raw(StatusCode::OK, "tarball-bytes").with_etag("\"t1\""));
    harness
        .proxy
        .tarball(tarball_request())
        .await
        .expect("prime cache");
    harness.settle().await;

    std::fs::remove_file(harness.blobs.root().join(FILENAME)).expect("remove blob");

    let err = harness
        .proxy
        .tarball(tarball_request())
        .await
        .expect_err("blob gone");
    assert!(matches!(err, RegistryError::NotFound));
}

#[tokio::test]
async fn uncached_tarball_with_upstream_down_is_not_found() {
    let harness = Harness::new();

    let err = harness
        .proxy
        .tarball(tarball_request())
        .await
        .expect_err("double miss");
    assert!(matches!(err, RegistryError::NotFound));
    assert_eq!(err.body().reason, "document not found");
}

#[tokio::test]
async fn unchanged_etag_does_not_rewrite() {
    let harness = Harness::new();
    harness
        .upstream
        .push(Scripted::raw(StatusCode::OK, "tarball-bytes").with_etag("\"t1\""));
    harness
        .proxy
        .tarball(tarball_request())
        .await
        .expect("prime cache");
    harness.settle().await;

    harness
        .upstream
        .push(Scripted::raw(StatusCode::OK, "tarball-bytes").with_etag("\"t1\""));
    let reply = harness.proxy.tarball(tarball_request()).await.expect("reply");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(harness.proxy.write_behind().pending(), 0);
}

#[tokio::test]
async fn unchanged_etag_restores_a_missing_blob() {
    let harness = Harness::new();
    harness
        .upstream
        .push(Scripted::raw(StatusCode::OK, "tarball-bytes").with_etag("\"t1\""));
    harness
        .proxy
        .tarball(tarball_request())
        .await
        .expect("prime cache");
    harness.settle().await;

    harness.blobs.remove(FILENAME).await.expect("remove blob");
    assert_eq!(harness.blob(FILENAME).await, None);

    harness
        .upstream
        .push(Scripted::raw(StatusCode::OK, "tarball-bytes").with_etag("\"t1\""));
    let reply = harness.proxy.tarball(tarball_request()).await.expect("reply");
    assert_eq!(reply.status, StatusCode::OK);
    harness.settle().await;

    assert_eq!(
        harness.blob(FILENAME).await,
        Some(Bytes::from_static(b"tarball-bytes"))
    );
    let fallback = harness
        .proxy
        .tarball(tarball_request())
        .await
        .expect("fallback");
    assert_eq!(fallback.status, StatusCode::OK);
}

#[tokio::test]
async fn blobs_without_an_etag_record_are_still_served() {
    let harness = Harness::new();
    let key = format!("left-pad:{FILENAME}");
    harness
        .store
        .set(&format!("tarball:{key}"), Bytes::from(FILENAME))
        .await
        .expect("seed filename");
    harness
        .blobs
        .write(FILENAME, Bytes::from_static(b"tarball-bytes"))
        .await
        .expect("seed blob");

    let served = harness
        .proxy
        .tarballs()
        .serve_tarball(&key, None)
        .await
        .expect("served");
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.etag, None);
    assert_eq!(bytes_of(served).await, Bytes::from_static(b"tarball-bytes"));

    let fallback = harness
        .proxy
        .tarball(tarball_request().with_if_none_match("\"t1\""))
        .await
        .expect("fallback");
    assert_eq!(fallback.status, StatusCode::OK);
    assert_eq!(fallback.etag, None);
    assert_eq!(bytes_of(fallback).await, Bytes::from_static(b"tarball-bytes"));
}

#[tokio::test]
async fn upstream_not_modified_is_relayed_without_caching() {
    let harness = Harness::new();
    harness
        .upstream
        .push(Scripted::raw(StatusCode::NOT_MODIFIED, Bytes::new()).with_etag("\"t1\""));

    let reply = harness
        .proxy
        .tarball(tarball_request().with_if_none_match("\"t1\""))
        .await
        .expect("reply");
    assert_eq!(reply.status, StatusCode::NOT_MODIFIED);
    assert_eq!(reply.etag.as_deref(), Some("\"t1\""));
    assert!(reply.is_empty());

    assert_eq!(harness.proxy.write_behind().pending(), 0);
    assert_eq!(harness.blob(FILENAME).await, None);
    assert!(
        !harness
            .store
            .exists(&format!("tarball:left-pad:{FILENAME}"))
            .await
            .expect("exists")
    );
}

#[tokio::test]
async fn upstream_errors_are_relayed_without_caching() {
    let harness = Harness::new();
    harness
        .upstream
        .push(Scripted::raw(StatusCode::NOT_FOUND, "{\"error\":\"not_found\"}"));

    let reply = harness.proxy.tarball(tarball_request()).await.expect("reply");
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    harness.settle().await;
    assert_eq!(harness.blob(FILENAME).await, None);
    assert!(
        !harness
            .store
            .exists(&format!("tarball:left-pad:{FILENAME}"))
            .await
            .expect("exists")
    );
}
