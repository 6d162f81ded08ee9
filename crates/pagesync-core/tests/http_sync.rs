#![allow(clippy::unwrap_used, clippy::panic)]

use pagesync_core::{Config, FetchOptions, SyncClient, SyncStatus};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rows(range: std::ops::Range<u64>) -> Vec<Value> {
    range.map(|i| json!({ "id": i, "name": format!("row-{i}") })).collect()
}

fn config(data_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.data_dir = data_dir.path().to_path_buf();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.http.timeout_secs = 5;
    config
}

/// Serves `total` rows from `/odata/Items`, 100 per page, with a count probe.
async fn mount_dataset(server: &MockServer, total: u64) {
    Mock::given(method("GET"))
        .and(path("/odata/Items"))
        .and(query_param("$top", "1"))
        .and(query_param("$count", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "@odata.count": total,
            "value": rows(0..1),
        })))
        .mount(server)
        .await;

    let mut offset = 0;
    while offset < total {
        let end = (offset + 100).min(total);
        Mock::given(method("GET"))
            .and(path("/odata/Items"))
            .and(query_param("$skip", offset.to_string()))
            .and(query_param("$top", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": rows(offset..end),
            })))
            .expect(1)
            .mount(server)
            .await;
        offset += 100;
    }
}

#[tokio::test]
async fn test_fetch_all_over_http() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_dataset(&server, 250).await;
    let data_dir = TempDir::new()?;
    let client = SyncClient::new(config(&data_dir))?;
    let spec = client
        .query(format!("{}/odata/Items", server.uri()))
        .build(client.page_cap())?;

    let report = client.fetch_all(&spec, FetchOptions::default()).await?;

    assert!(report.is_complete(), "{report}");
    assert_eq!(report.records.len(), 250);
    assert_eq!(report.records[249].get("id"), Some(&json!(249)));
    assert_eq!(report.stats.requests, 4);
    Ok(())
}

#[tokio::test]
async fn test_server_errors_become_page_failures() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/odata/Items"))
        .and(query_param("$top", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "@odata.count": 200,
            "value": rows(0..1),
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/odata/Items"))
        .and(query_param("$skip", "0"))
        .and(query_param("$top", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": rows(0..100) })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/odata/Items"))
        .and(query_param("$skip", "100"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;

    let data_dir = TempDir::new()?;
    let client = SyncClient::new(config(&data_dir))?;
    let spec = client
        .query(format!("{}/odata/Items", server.uri()))
        .job_key("items")
        .build(client.page_cap())?;
    let options = FetchOptions {
        resumable: true,
        ..FetchOptions::default()
    };

    let report = client.fetch_all(&spec, options).await?;

    assert_eq!(report.status, SyncStatus::PartialFailure { aborted: false });
    assert_eq!(report.records.len(), 100);
    assert_eq!(report.failed_offsets(), vec![100]);
    assert_eq!(report.failures[0].attempts, 4);

    // The checkpoint survives on disk for the next run.
    let reopened = SyncClient::new(config(&data_dir))?;
    let checkpoint = reopened.checkpoint("items")?.unwrap();
    assert_eq!(checkpoint.last_completed_offset, 100);
    assert_eq!(checkpoint.query_signature, spec.signature());
    Ok(())
}

#[tokio::test]
async fn test_file_cache_serves_second_run() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    // Change probe: newest marker first.
    Mock::given(method("GET"))
        .and(path("/odata/Items"))
        .and(query_param("$orderby", "modifiedAt desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{ "modifiedAt": "2024-05-01T12:00:00Z" }],
        })))
        .expect(2)
        .mount(&server)
        .await;
    mount_dataset(&server, 150).await;

    let data_dir = TempDir::new()?;
    let options = FetchOptions {
        cache_enabled: true,
        ..FetchOptions::default()
    };

    let client = SyncClient::new(config(&data_dir))?;
    let spec = client
        .query(format!("{}/odata/Items", server.uri()))
        .build(client.page_cap())?;
    let first = client.fetch_all(&spec, options.clone()).await?;
    assert!(first.is_complete());
    assert_eq!(first.stats.cache_hits, 0);

    let client = SyncClient::new(config(&data_dir))?;
    let second = client.fetch_all(&spec, options).await?;
    assert_eq!(second.stats.cache_hits, 1);
    assert_eq!(second.records.len(), 150);
    // Page mocks expect exactly one hit each; verified when the server drops.
    Ok(())
}
