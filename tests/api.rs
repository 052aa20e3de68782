//! API tests over the router with in-memory adapters.
//!
//! These exercise the HTTP contract end to end: auth scoping, clone
//! creation, claims and destroys, without a real filesystem or container
//! engine.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use std::sync::Arc;
use tower::ServiceExt;

use zdap::storage::Storage;
use zdap::{names, Config, MemEngine, MemStorage, Resource, Service};

fn test_resource(name: &str, min: usize, max: usize) -> Resource {
    let mut r: Resource = serde_yaml::from_str(&format!(
        r#"
name: {name}
alias: {name}-alias
retrieval: retrieve.sh
creation: create.sh
docker:
  image: postgres:14
  port: 5432
  volume: /var/lib/postgresql/data
  healthcheck: pg_isready -U postgres
"#
    ))
    .unwrap();
    r.clone_pool.min_clones = min;
    r.clone_pool.max_clones = max;
    r.clone_pool.claim_max_ttl_s = 60;
    r.clone_pool.default_ttl_s = 10;
    r
}

fn ts(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

async fn seed_snap(storage: &MemStorage, resource: &str, hour: u32) {
    let base = names::base_name(resource, ts(hour));
    storage
        .create_dataset(&base, resource, ts(hour), &Default::default())
        .await
        .unwrap();
    storage
        .snap_dataset(&base, resource, ts(hour))
        .await
        .unwrap();
}

async fn test_service(resources: Vec<Resource>) -> (Arc<MemStorage>, Arc<Service>) {
    let storage = Arc::new(MemStorage::new());
    let engine = Arc::new(MemEngine::new());
    let service = Service::with_resources(
        Config {
            network_address: "zdap1.example.com".to_string(),
            ..Config::default()
        },
        storage.clone(),
        engine,
        resources,
    )
    .unwrap();
    (storage, service)
}

fn request(method: &str, uri: &str, owner: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(owner) = owner {
        builder = builder.header("auth", owner);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn api_requires_auth_header() {
    let (_storage, service) = test_service(vec![test_resource("postgres-1", 0, 0)]).await;
    let router = zdap::build_router(service);

    let resp = router
        .clone()
        .oneshot(request("GET", "/status", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = router
        .oneshot(request("GET", "/status", Some("alice")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_status_reports_counts_and_address() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 0, 0)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    let router = zdap::build_router(service);

    let resp = router
        .oneshot(request("GET", "/status", Some("alice")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let status = body_json(resp).await;
    assert_eq!(status["address"], "zdap1.example.com");
    assert_eq!(status["snaps"], 1);
    assert_eq!(status["clones"], 0);
    assert_eq!(status["resources"][0], "postgres-1");
    assert_eq!(
        status["resource_details"]["postgres-1"]["pooled_clones_available"],
        0
    );
}

#[tokio::test]
async fn api_clone_from_latest_snap() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 0, 0)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    let router = zdap::build_router(service);

    let resp = router
        .oneshot(request("POST", "/resources/postgres-1/snaps", Some("alice")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let clone = body_json(resp).await;

    let name = clone["name"].as_str().unwrap();
    assert!(name.starts_with("zdap-postgres-1-base-2024-01-02T03.00.00-clone-"));
    assert_eq!(clone["owner"], "alice");
    assert!(clone["port"].as_u64().unwrap() > 0);
    assert_eq!(clone["server"], "zdap1.example.com");
    assert_eq!(clone["api_port"], 43210);
    assert_eq!(clone["snapped_at"], "2024-01-02T03:00:00Z");
}

#[tokio::test]
async fn api_clone_from_pinned_snap() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 0, 0)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    seed_snap(&storage, "postgres-1", 5).await;
    let router = zdap::build_router(service);

    let resp = router
        .clone()
        .oneshot(request(
            "POST",
            "/resources/postgres-1/snaps/2024-01-02T03:00:00Z",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let clone = body_json(resp).await;
    assert_eq!(clone["snapped_at"], "2024-01-02T03:00:00Z");

    // A snapshot that never existed is a 404.
    let resp = router
        .oneshot(request(
            "POST",
            "/resources/postgres-1/snaps/2030-01-01T00:00:00Z",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_owner_isolation_on_clone_listing() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 0, 0)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    let router = zdap::build_router(service);

    for owner in ["alice", "bob"] {
        let resp = router
            .clone()
            .oneshot(request("POST", "/resources/postgres-1/snaps", Some(owner)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    for owner in ["alice", "bob"] {
        let resp = router
            .clone()
            .oneshot(request("GET", "/resources/postgres-1/clones", Some(owner)))
            .await
            .unwrap();
        let clones = body_json(resp).await;
        let clones = clones.as_array().unwrap();
        assert_eq!(clones.len(), 1, "{owner} should see exactly one clone");
        assert_eq!(clones[0]["owner"], owner);
    }
}

#[tokio::test]
async fn api_destroy_clone_by_timestamp() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 0, 0)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    let router = zdap::build_router(service);

    let resp = router
        .clone()
        .oneshot(request("POST", "/resources/postgres-1/snaps", Some("alice")))
        .await
        .unwrap();
    let clone = body_json(resp).await;
    let created_at = clone["created_at"].as_str().unwrap().to_string();

    // Another owner cannot destroy it.
    let resp = router
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/resources/postgres-1/clones/{created_at}"),
            Some("bob"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = router
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/resources/postgres-1/clones/{created_at}"),
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(request("GET", "/resources/postgres-1/clones", Some("alice")))
        .await
        .unwrap();
    let clones = body_json(resp).await;
    assert!(clones.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn api_destroy_all_owned_clones() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 0, 0)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    let router = zdap::build_router(service);

    for _ in 0..2 {
        router
            .clone()
            .oneshot(request("POST", "/resources/postgres-1/snaps", Some("alice")))
            .await
            .unwrap();
    }
    router
        .clone()
        .oneshot(request("POST", "/resources/postgres-1/snaps", Some("bob")))
        .await
        .unwrap();

    let resp = router
        .clone()
        .oneshot(request("DELETE", "/resources/postgres-1/clones", Some("alice")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let destroyed = body_json(resp).await;
    assert_eq!(destroyed["destroyed"].as_array().unwrap().len(), 2);

    // Bob's clone is untouched.
    let resp = router
        .oneshot(request("GET", "/resources/postgres-1/clones", Some("bob")))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn api_claim_sets_ttl_and_owner() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 1, 2)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    service.pool("postgres-1").unwrap().reconcile().await;
    let router = zdap::build_router(service);

    let before = Utc::now().naive_utc();
    let resp = router
        .oneshot(request(
            "POST",
            "/resources/postgres-1/claim?ttl=5",
            Some("bob"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let claim = body_json(resp).await;
    assert_eq!(claim["owner"], "bob");
    assert_eq!(claim["server"], "zdap1.example.com");
    assert_eq!(claim["api_port"], 43210);

    let expires = names::parse_wire_ts(claim["expires_at"].as_str().unwrap()).unwrap();
    let delta = expires - (before + chrono::Duration::seconds(5));
    assert!(delta.num_seconds().abs() <= 1);
}

#[tokio::test]
async fn api_claim_ttl_clamped_to_resource_max() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 1, 2)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    service.pool("postgres-1").unwrap().reconcile().await;
    let router = zdap::build_router(service);

    let before = Utc::now().naive_utc();
    let resp = router
        .oneshot(request(
            "POST",
            "/resources/postgres-1/claim?ttl=999999",
            Some("bob"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let claim = body_json(resp).await;
    let expires = names::parse_wire_ts(claim["expires_at"].as_str().unwrap()).unwrap();
    // claim_max_ttl_s is 60 in the test resource.
    let delta = expires - (before + chrono::Duration::seconds(60));
    assert!(delta.num_seconds().abs() <= 1);
}

#[tokio::test]
async fn api_claim_exhausted_pool_is_503() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 1, 1)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    service.pool("postgres-1").unwrap().reconcile().await;
    let router = zdap::build_router(service);

    let resp = router
        .clone()
        .oneshot(request("POST", "/resources/postgres-1/claim", Some("bob")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(request("POST", "/resources/postgres-1/claim", Some("carol")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn api_expire_claim_and_backfill() {
    let (storage, service) = test_service(vec![test_resource("postgres-1", 1, 2)]).await;
    seed_snap(&storage, "postgres-1", 3).await;
    let pool = service.pool("postgres-1").unwrap().clone();
    pool.reconcile().await;
    let router = zdap::build_router(service.clone());

    let resp = router
        .clone()
        .oneshot(request("POST", "/resources/postgres-1/claim", Some("bob")))
        .await
        .unwrap();
    let claim = body_json(resp).await;
    let claim_id = claim["name"].as_str().unwrap().to_string();

    let resp = router
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/resources/postgres-1/claims/{claim_id}"),
            Some("bob"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // The sweep destroys the expired clone and tops the pool back up.
    pool.reconcile().await;
    let tree = storage.open().await.unwrap();
    assert!(tree.get(&claim_id).is_none());

    let resp = router
        .oneshot(request("GET", "/status", Some("bob")))
        .await
        .unwrap();
    let status = body_json(resp).await;
    assert_eq!(
        status["resource_details"]["postgres-1"]["pooled_clones_available"],
        1
    );
}

#[tokio::test]
async fn api_unknown_resource_is_404() {
    let (_storage, service) = test_service(vec![test_resource("postgres-1", 0, 0)]).await;
    let router = zdap::build_router(service);

    let resp = router
        .clone()
        .oneshot(request("GET", "/resources/mysql-9", Some("alice")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = router
        .oneshot(request("POST", "/resources/mysql-9/snaps", Some("alice")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_bad_timestamp_is_400() {
    let (_storage, service) = test_service(vec![test_resource("postgres-1", 0, 0)]).await;
    let router = zdap::build_router(service);

    let resp = router
        .oneshot(request(
            "DELETE",
            "/resources/postgres-1/clones/not-a-timestamp",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_resources_listing_includes_alias_and_snaps() {
    let (storage, service) = test_service(vec![
        test_resource("postgres-1", 0, 0),
        test_resource("redis-1", 0, 0),
    ])
    .await;
    seed_snap(&storage, "postgres-1", 3).await;
    let router = zdap::build_router(service);

    let resp = router
        .oneshot(request("GET", "/resources", Some("alice")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resources = body_json(resp).await;
    let resources = resources.as_array().unwrap();
    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0]["name"], "postgres-1");
    assert_eq!(resources[0]["alias"], "postgres-1-alias");
    assert_eq!(resources[0]["snaps"].as_array().unwrap().len(), 1);
    assert_eq!(
        resources[0]["snaps"][0]["created_at"],
        "2024-01-02T03:00:00Z"
    );
    assert_eq!(resources[1]["name"], "redis-1");
}
