//! Integration tests for the response cache
//!
//! Record mode persists responses next to their request fingerprint; replay
//! mode serves them back byte-identical without touching the network.

use std::collections::BTreeMap;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use page_harvest::engine::{
    CacheConfig, FetchError, FetchMode, FetchOutcome, FetchRequest, HttpEngine, ResponseCache,
};

fn engine_with_cache(dir: &TempDir, replay: bool) -> HttpEngine {
    let cache = ResponseCache::new(&CacheConfig {
        dir: Some(dir.path().to_path_buf()),
        replay,
        store_statuses: None,
    });
    HttpEngine::new(reqwest::Client::new()).with_cache(cache)
}

fn request(url: String) -> FetchRequest {
    let mut params = serde_json::Map::new();
    params.insert("page".to_string(), json!(1));
    FetchRequest {
        url,
        method: "GET".to_string(),
        params,
        headers: BTreeMap::new(),
        body: None,
        timeout: None,
        expect: FetchMode::Json,
    }
}

#[tokio::test]
async fn record_then_replay_byte_identical() {
    let server = MockServer::start().await;
    let body = json!({"items": [{"id": 1, "name": "käse"}], "next_cursor": "abc"});

    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
        .expect(1) // replay must not produce a second hit
        .mount(&server)
        .await;

    let cache_dir = TempDir::new().unwrap();
    let url = format!("{}/api/items", server.uri());

    let recorder = engine_with_cache(&cache_dir, false);
    let recorded = match recorder.fetch(&request(url.clone())).await {
        FetchOutcome::Success(resp) => resp,
        other => panic!("expected success, got {other:?}"),
    };

    let replayer = engine_with_cache(&cache_dir, true);
    let replayed = match replayer.fetch(&request(url)).await {
        FetchOutcome::Success(resp) => resp,
        other => panic!("expected replay hit, got {other:?}"),
    };

    assert_eq!(replayed.body, recorded.body);
    assert_eq!(replayed.status, recorded.status);
    assert_eq!(replayed.final_url, recorded.final_url);
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&replayed.body).unwrap(),
        body
    );
}

#[tokio::test]
async fn replay_of_unknown_key_is_a_cache_miss_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let cache_dir = TempDir::new().unwrap();
    let engine = engine_with_cache(&cache_dir, true);

    match engine.fetch(&request(format!("{}/api/items", server.uri()))).await {
        FetchOutcome::Failed { response, error } => {
            assert!(response.is_none());
            assert!(matches!(error, FetchError::CacheMiss));
        }
        other => panic!("expected cache miss, got {other:?}"),
    }
}

#[tokio::test]
async fn differing_params_map_to_different_cache_entries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"page": 1})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"page": 2})))
        .mount(&server)
        .await;

    let cache_dir = TempDir::new().unwrap();
    let url = format!("{}/api/items", server.uri());

    let recorder = engine_with_cache(&cache_dir, false);
    let mut req1 = request(url.clone());
    req1.params.insert("page".to_string(), json!(1));
    let mut req2 = request(url);
    req2.params.insert("page".to_string(), json!(2));

    assert!(matches!(recorder.fetch(&req1).await, FetchOutcome::Success(_)));
    assert!(matches!(recorder.fetch(&req2).await, FetchOutcome::Success(_)));

    let replayer = engine_with_cache(&cache_dir, true);
    let first = match replayer.fetch(&req1).await {
        FetchOutcome::Success(resp) => resp,
        other => panic!("expected replay hit, got {other:?}"),
    };
    let second = match replayer.fetch(&req2).await {
        FetchOutcome::Success(resp) => resp,
        other => panic!("expected replay hit, got {other:?}"),
    };

    assert_eq!(serde_json::from_slice::<serde_json::Value>(&first.body).unwrap()["page"], json!(1));
    assert_eq!(serde_json::from_slice::<serde_json::Value>(&second.body).unwrap()["page"], json!(2));
}
