//! Live-server tests for `takeout-ingest serve`.
//!
//! Each test starts a real server on a free port and talks to it over HTTP:
//! the JSON tool API, its error envelope, and the MCP endpoint the
//! `mcp-remote` bridge connects to.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use std::time::Duration;
use takeout_ingestor::config::Config;
use takeout_ingestor::models::MediaKind;
use takeout_ingestor::server::run_server;
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.store.home = tmp.path().join("home");
    config.media.api_key_env = "TAKEOUT_SERVER_IT_KEY_UNSET".into();
    config
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

fn start_documents_server(cfg: Config, port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_server(&cfg, MediaKind::Document, Some("127.0.0.1"), Some(port))
            .await
            .ok();
    })
}

/// Read a streamed MCP response until it contains `needle`.
async fn read_until(mut resp: reqwest::Response, needle: &str) -> String {
    let mut body = String::new();
    let read = async {
        while let Some(chunk) = resp.chunk().await.unwrap() {
            body.push_str(&String::from_utf8_lossy(&chunk));
            if body.contains(needle) {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .unwrap_or_else(|_| panic!("no '{}' in MCP response within 5 seconds", needle));
    body
}

fn mcp_headers(session: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(id) = session {
        headers.insert("mcp-session-id", HeaderValue::from_str(id).unwrap());
    }
    headers
}

#[tokio::test]
async fn test_tool_api_and_error_envelope() {
    let port = find_free_port();
    let tmp = TempDir::new().unwrap();
    let note = tmp.path().join("lighthouse.md");
    std::fs::write(&note, "# Trip notes\n\nThe red lighthouse opens at nine.").unwrap();

    let server_handle = start_documents_server(test_config(&tmp), port);
    wait_for_server(port).await;
    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", port);

    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["media"], "documents");

    let resp = client.get(format!("{}/tools/list", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let mut names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["get_item", "insert_document", "list_document", "query_document"]
    );

    let resp = client
        .post(format!("{}/tools/insert_document", base))
        .json(&json!({ "path": note }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let id = body["result"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["result"]["unchanged"], false);

    let resp = client
        .post(format!("{}/tools/query_document", base))
        .json(&json!({ "query": "lighthouse" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["results"][0]["id"], id.as_str());

    // missing required parameter
    let resp = client
        .post(format!("{}/tools/query_document", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"].as_str().unwrap().contains("query"));

    // out of range
    let resp = client
        .post(format!("{}/tools/query_document", base))
        .json(&json!({ "query": "lighthouse", "top_k": 500 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/tools/get_item", base))
        .json(&json!({ "id": "no-such-id" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("{}/tools/nonexistent", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    // an empty body counts as {}
    let resp = client
        .post(format!("{}/tools/list_document", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["items"].as_array().unwrap().len(), 1);

    server_handle.abort();
}

#[tokio::test]
async fn test_mcp_endpoint_lists_and_calls_tools() {
    let port = find_free_port();
    let tmp = TempDir::new().unwrap();

    let server_handle = start_documents_server(test_config(&tmp), port);
    wait_for_server(port).await;
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/sse", port);

    let resp = client
        .post(&url)
        .headers(mcp_headers(None))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "it", "version": "0.0.0" }
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let session = resp
        .headers()
        .get("mcp-session-id")
        .expect("initialize returns a session id")
        .to_str()
        .unwrap()
        .to_string();
    let body = read_until(resp, "takeout-documents").await;
    assert!(body.contains("\"tools\""), "capabilities missing: {}", body);

    let resp = client
        .post(&url)
        .headers(mcp_headers(Some(&session)))
        .json(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let resp = client
        .post(&url)
        .headers(mcp_headers(Some(&session)))
        .json(&json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = read_until(resp, "get_item").await;
    assert!(body.contains("query_document"), "tools/list: {}", body);
    assert!(body.contains("insert_document"), "tools/list: {}", body);

    let resp = client
        .post(&url)
        .headers(mcp_headers(Some(&session)))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": { "name": "get_item", "arguments": { "id": "no-such-id" } }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = read_until(resp, "document not found").await;
    assert!(body.contains("\"isError\":true"), "tools/call: {}", body);

    server_handle.abort();
}
