mod common;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde_json::{Value, json};

use common::{Harness, PRIVATE, Scripted, bytes_of, json_of, package_document, publish_payload};
use regcache::{
    application::{
        error::RegistryError,
        private::{ALL_FIELD, LATEST_FIELD, PublishOutcome, RemoveOutcome},
        proxy::{ReadRequest, content_etag, document_etag},
        repos::{BlobStore, KeyValueStore},
    },
    domain::request::RouteParams,
};

const TARBALL: &[u8] = b"secret tarball contents";

async fn snapshot(harness: &Harness) -> (Option<Bytes>, Option<Bytes>, Option<Bytes>) {
    let version = harness
        .store
        .hget("private:secret", "1.0.0")
        .await
        .expect("hget");
    let latest = harness
        .store
        .hget("private:secret", LATEST_FIELD)
        .await
        .expect("hget");
    (version, latest, harness.blob("secret-1.0.0.tgz").await)
}

#[tokio::test]
async fn publishing_twice_changes_nothing() {
    let harness = Harness::new();
    let private = harness.proxy.private_packages();
    let payload = publish_payload("secret", "1.0.0", TARBALL);

    let first = private.publish("secret", &payload).await.expect("publish");
    assert_eq!(first, PublishOutcome::Created);
    let after_first = snapshot(&harness).await;

    let mut again = payload.clone();
    again["versions"]["1.0.0"]["description"] = json!("changed");
    let second = private.publish("secret", &again).await.expect("republish");
    assert_eq!(second, PublishOutcome::AlreadyPublished);

    assert_eq!(snapshot(&harness).await, after_first);
    assert_eq!(after_first.2, Some(Bytes::from_static(TARBALL)));
}

#[tokio::test]
async fn published_tarball_urls_lose_the_private_segment() {
    let harness = Harness::new();
    let private = harness.proxy.private_packages();
    private
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish");

    let version = private
        .lookup("secret", Some("1.0.0"))
        .await
        .expect("lookup")
        .expect("version");
    assert_eq!(
        version["dist"]["tarball"],
        format!("{PRIVATE}/secret/-/secret-1.0.0.tgz")
    );
}

#[tokio::test]
async fn package_lookup_aggregates_versions() {
    let harness = Harness::new();
    let private = harness.proxy.private_packages();
    private
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish 1.0.0");
    private
        .publish("secret", &publish_payload("secret", "1.1.0", b"newer"))
        .await
        .expect("publish 1.1.0");

    let document = private
        .lookup("secret", None)
        .await
        .expect("lookup")
        .expect("package");

    assert_eq!(document["_id"], "secret");
    assert_eq!(document["name"], "secret");
    assert_eq!(document["description"], "internal package");
    assert_eq!(document["dist-tags"]["latest"], "1.1.0");
    assert_eq!(document["_rev"], "1.1.0");
    let versions = document["versions"].as_object().expect("versions");
    assert_eq!(versions.len(), 2);
    assert!(versions.contains_key("1.0.0"));
    assert!(versions.contains_key("1.1.0"));
}

#[tokio::test]
async fn unknown_packages_and_versions_are_absent() {
    let harness = Harness::new();
    let private = harness.proxy.private_packages();
    assert_eq!(private.lookup("nobody", None).await.expect("lookup"), None);

    private
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish");
    assert_eq!(
        private.lookup("secret", Some("9.9.9")).await.expect("lookup"),
        None
    );
}

#[tokio::test]
async fn removed_versions_fall_through_to_the_mirror() {
    let harness = Harness::new();
    let private = harness.proxy.private_packages();
    private
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish");

    let outcome = private
        .remove("secret", "1.0.0", "secret-1.0.0.tgz")
        .await
        .expect("remove");
    assert_eq!(outcome, RemoveOutcome::Removed);

    assert!(
        !harness
            .store
            .hexists("private:secret", "1.0.0")
            .await
            .expect("hexists")
    );
    assert!(!harness.blobs.exists("secret-1.0.0.tgz").await.expect("exists"));
    // `latest` still names the removed version.
    assert!(
        harness
            .store
            .hexists("private:secret", LATEST_FIELD)
            .await
            .expect("hexists")
    );

    assert_eq!(
        private.lookup("secret", Some("1.0.0")).await.expect("lookup"),
        None
    );

    let public = json!({
        "name": "secret",
        "version": "1.0.0",
        "dist": { "tarball": "https://registry.npmjs.org/secret/-/secret-1.0.0.tgz" }
    });
    harness.upstream.push(Scripted::ok_json(&public));
    let request = ReadRequest::get(
        "/secret/1.0.0",
        RouteParams::package("secret").with_version("1.0.0"),
    );
    let reply = harness.proxy.package(request).await.expect("mirror reply");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(harness.upstream.calls(), 1);
    assert_eq!(harness.upstream.last_request().path, "/secret/1.0.0");
}

#[tokio::test]
async fn removing_public_packages_is_delegated() {
    let harness = Harness::new();
    let outcome = harness
        .proxy
        .private_packages()
        .remove("left-pad", "1.3.0", "left-pad-1.3.0.tgz")
        .await
        .expect("remove");
    assert_eq!(outcome, RemoveOutcome::Delegate);
}

#[tokio::test]
async fn removing_a_missing_private_tarball_is_not_found() {
    let harness = Harness::new();
    let private = harness.proxy.private_packages();
    private
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish");

    let err = private
        .remove("secret", "2.0.0", "secret-2.0.0.tgz")
        .await
        .expect_err("no such tarball");
    assert!(matches!(err, RegistryError::NotFound));
}

#[tokio::test]
async fn private_documents_skip_the_upstream() {
    let harness = Harness::new();
    harness
        .proxy
        .private_packages()
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish");

    let request = ReadRequest::get("/secret", RouteParams::package("secret"));
    let reply = harness.proxy.package(request.clone()).await.expect("reply");
    assert_eq!(reply.status, StatusCode::OK);
    let document: Value = json_of(&reply);
    assert_eq!(reply.etag, Some(document_etag(&document)));
    assert_eq!(harness.upstream.calls(), 0);

    let etag = reply.etag.clone().expect("etag");
    let conditional = harness
        .proxy
        .package(request.with_if_none_match(etag))
        .await
        .expect("conditional");
    assert_eq!(conditional.status, StatusCode::NOT_MODIFIED);
    assert_eq!(harness.upstream.calls(), 0);
}

#[tokio::test]
async fn private_tarballs_are_served_from_disk() {
    let harness = Harness::new();
    harness
        .proxy
        .private_packages()
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish");

    let request = ReadRequest::get(
        "/secret/-/secret-1.0.0.tgz",
        RouteParams::package("secret").with_tarball("secret-1.0.0.tgz"),
    );
    let reply = harness.proxy.tarball(request.clone()).await.expect("reply");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.etag, Some(content_etag(TARBALL)));
    assert_eq!(bytes_of(reply).await, Bytes::from_static(TARBALL));

    let conditional = harness
        .proxy
        .tarball(request.with_if_none_match(content_etag(TARBALL)))
        .await
        .expect("conditional");
    assert_eq!(conditional.status, StatusCode::NOT_MODIFIED);
    assert_eq!(conditional.etag, Some(content_etag(TARBALL)));
    assert!(conditional.is_empty());
    assert_eq!(harness.upstream.calls(), 0);
}

#[tokio::test]
async fn sentinel_fields_cannot_be_removed() {
    let harness = Harness::new();
    let private = harness.proxy.private_packages();
    private
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish");
    let before = private.lookup("secret", None).await.expect("lookup");

    for sentinel in [ALL_FIELD, LATEST_FIELD] {
        let err = private
            .remove("secret", sentinel, "secret-1.0.0.tgz")
            .await
            .expect_err("sentinel is not a version");
        assert!(matches!(err, RegistryError::BadRequest(_)));
    }

    assert_eq!(private.lookup("secret", None).await.expect("lookup"), before);
    assert_eq!(harness.blob("secret-1.0.0.tgz").await, Some(Bytes::from_static(TARBALL)));
    assert!(
        harness
            .store
            .hexists("private:secret", ALL_FIELD)
            .await
            .expect("hexists")
    );
}

#[tokio::test]
async fn the_all_sentinel_is_not_a_version() {
    let harness = Harness::new();
    let private = harness.proxy.private_packages();
    private
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish");

    assert_eq!(private.lookup("secret", Some(ALL_FIELD)).await.expect("lookup"), None);

    let latest = private
        .lookup("secret", Some(LATEST_FIELD))
        .await
        .expect("lookup")
        .expect("latest version");
    assert_eq!(latest["version"], "1.0.0");
}

#[tokio::test]
async fn malformed_publishes_are_rejected() {
    let harness = Harness::new();
    let private = harness.proxy.private_packages();

    let err = private
        .publish("secret", &json!({ "name": "secret" }))
        .await
        .expect_err("no versions");
    assert!(matches!(err, RegistryError::BadRequest(_)));

    let mut payload = publish_payload("secret", "1.0.0", TARBALL);
    payload["_attachments"]["secret-1.0.0.tgz"]["data"] = json!("%%% not base64 %%%");
    let err = private
        .publish("secret", &payload)
        .await
        .expect_err("bad attachment");
    assert!(matches!(err, RegistryError::BadRequest(_)));
    assert_eq!(private.lookup("secret", None).await.expect("lookup"), None);
}

#[tokio::test]
async fn revisions_of_private_packages_are_acknowledged_locally() {
    let harness = Harness::new();
    harness
        .proxy
        .private_packages()
        .publish("secret", &publish_payload("secret", "1.0.0", TARBALL))
        .await
        .expect("publish");

    let reply = harness
        .proxy
        .put_revision(
            "secret",
            "/secret/-rev/1-abc",
            Bytes::from(package_document("secret", &["1.0.0"]).to_string()),
            &HeaderMap::new(),
        )
        .await
        .expect("revision");
    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(json_of(&reply), json!({ "ok": true }));
    assert_eq!(harness.upstream.calls(), 0);
}
