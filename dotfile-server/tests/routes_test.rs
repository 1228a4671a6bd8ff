//! HTTP surface tests against a temporary database

use bytes::Bytes;
use dotfile_core::{Fingerprint, SqliteBackend};
use dotfile_server::{Config, Service, HASH_HEADER, MESSAGE_HEADER, PATH_HEADER};
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Method, StatusCode, Uri};
use serde_json::Value;
use tempfile::TempDir;

const CONTENT: &str = "Testing content. Stored as a blob.";
const UPDATED: &str = "Testing content. Stored as a blob.\n New content!\n";

struct Harness {
    _tmp: TempDir,
    service: Service,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn text(&self) -> String {
        String::from_utf8(self.body.to_vec()).unwrap()
    }
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let database = tmp.path().join("dotfilehub.db");
        let backend = SqliteBackend::open(&database).unwrap();
        let config = Config {
            database,
            ..Config::default()
        };
        let service = Service::with_backend(backend, config).unwrap();
        Self { _tmp: tmp, service }
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&'static str, &str)],
        body: &str,
    ) -> Reply {
        let uri: Uri = uri.parse().unwrap();
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        let response = self
            .service
            .dispatch(&method, &uri, &map, Bytes::from(body.to_string()))
            .await;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        Reply { status, headers, body }
    }

    async fn signup(&self, username: &str) -> Reply {
        let body = serde_json::json!({ "username": username }).to_string();
        self.send(Method::POST, "/signup", &[], &body).await
    }

    async fn upload(&self, content: &str) -> Reply {
        self.send(
            Method::PUT,
            "/genericusername/testalias",
            &[(PATH_HEADER, "~/dotfile/test-file.txt"), (MESSAGE_HEADER, "test commit")],
            content,
        )
        .await
    }
}

#[tokio::test]
async fn test_signup_rejects_reserved_and_taken_names() {
    let h = Harness::new();
    assert_eq!(h.signup("genericusername").await.status, StatusCode::CREATED);

    let taken = h.signup("genericusername").await;
    assert_eq!(taken.status, StatusCode::BAD_REQUEST);
    assert!(taken.json()["error"].as_str().unwrap().contains("taken"));

    assert_eq!(h.signup("about").await.status, StatusCode::BAD_REQUEST);
    assert_eq!(h.signup("").await.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        h.send(Method::POST, "/signup", &[], "not json").await.status,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn test_upload_commit_and_read() {
    let h = Harness::new();
    h.signup("genericusername").await;

    let created = h.upload(CONTENT).await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.json()["hash"], Fingerprint::of(CONTENT.as_bytes()).to_hex());

    let committed = h.upload(UPDATED).await;
    assert_eq!(committed.status, StatusCode::OK);
    assert_eq!(committed.json()["message"], "test commit");

    let unchanged = h.upload(UPDATED).await;
    assert_eq!(unchanged.status, StatusCode::CONFLICT);

    let raw = h.send(Method::GET, "/genericusername/testalias", &[], "").await;
    assert_eq!(raw.status, StatusCode::OK);
    assert_eq!(raw.text(), UPDATED);
    assert_eq!(
        raw.headers.get(HASH_HEADER).unwrap(),
        Fingerprint::of(UPDATED.as_bytes()).to_hex().as_str()
    );

    let snapshot = h
        .send(Method::GET, "/genericusername/testalias?format=json", &[], "")
        .await
        .json();
    assert_eq!(snapshot["owner"], "genericusername");
    assert_eq!(snapshot["path"], "~/dotfile/test-file.txt");
    assert_eq!(snapshot["content"], UPDATED);

    let commits = h
        .send(Method::GET, "/genericusername/testalias/commits", &[], "")
        .await
        .json();
    let list = commits["commits"].as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["message"], "test commit");
    assert_eq!(list[1]["message"], "Initial commit");
}

#[tokio::test]
async fn test_first_upload_requires_path() {
    let h = Harness::new();
    h.signup("genericusername").await;
    let reply = h
        .send(Method::PUT, "/genericusername/testalias", &[], CONTENT)
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert!(reply.json()["error"].as_str().unwrap().contains(PATH_HEADER));
}

#[tokio::test]
async fn test_revision_and_checkout() {
    let h = Harness::new();
    h.signup("genericusername").await;
    h.upload(CONTENT).await;
    h.upload(UPDATED).await;

    let original = Fingerprint::of(CONTENT.as_bytes()).to_hex();
    let revision = h
        .send(Method::GET, &format!("/genericusername/testalias/{}", original), &[], "")
        .await;
    assert_eq!(revision.status, StatusCode::OK);
    assert_eq!(revision.text(), CONTENT);

    let checkout = h
        .send(
            Method::POST,
            &format!("/genericusername/testalias/{}/checkout", original),
            &[],
            "",
        )
        .await;
    assert_eq!(checkout.status, StatusCode::OK);
    assert_eq!(checkout.json()["hash"], original);

    let raw = h.send(Method::GET, "/genericusername/testalias", &[], "").await;
    assert_eq!(raw.text(), CONTENT);

    let unknown = Fingerprint::of(b"never committed").to_hex();
    let missing = h
        .send(Method::POST, &format!("/genericusername/testalias/{}/checkout", unknown), &[], "")
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let bad = h.send(Method::GET, "/genericusername/testalias/nothex", &[], "").await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_listing_and_delete() {
    let h = Harness::new();
    h.signup("genericusername").await;
    h.upload(CONTENT).await;

    let listing = h.send(Method::GET, "/genericusername", &[], "").await;
    assert_eq!(listing.status, StatusCode::OK);
    let files = listing.json();
    assert_eq!(files[0]["owner"], "genericusername");
    assert_eq!(files[0]["alias"], "testalias");
    assert_eq!(files[0]["num_commits"], 1);

    let deleted = h.send(Method::DELETE, "/genericusername/testalias", &[], "").await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);
    let gone = h.send(Method::GET, "/genericusername/testalias", &[], "").await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);
    let listing = h.send(Method::GET, "/genericusername", &[], "").await;
    assert_eq!(listing.json(), serde_json::json!([]));
}

#[tokio::test]
async fn test_unknown_owner_and_reserved_paths() {
    let h = Harness::new();
    assert_eq!(h.send(Method::GET, "/nobody", &[], "").await.status, StatusCode::NOT_FOUND);
    assert_eq!(
        h.send(Method::PUT, "/nobody/bashrc", &[(PATH_HEADER, "~/.bashrc")], "ls").await.status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(h.send(Method::GET, "/explore", &[], "").await.status, StatusCode::NOT_FOUND);
    assert_eq!(
        h.send(Method::POST, "/genericusername", &[], "").await.status,
        StatusCode::METHOD_NOT_ALLOWED
    );
}
