#![allow(clippy::expect_used, clippy::unwrap_used)]

use assert_cmd::Command;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a `pagesync` command isolated to `dir` for config and data.
pub fn pagesync_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("pagesync"));
    cmd.timeout(CMD_TIMEOUT);
    cmd.env("PAGESYNC_CONFIG_DIR", dir);
    cmd.env("PAGESYNC_DATA_DIR", dir.join("data"));
    cmd.env_remove("PAGESYNC_CONFIG");
    cmd.env("NO_COLOR", "1");
    cmd
}

/// Config file with millisecond backoff so failing runs finish quickly.
#[allow(dead_code)]
pub fn write_fast_config(dir: &Path) {
    std::fs::write(
        dir.join("config.toml"),
        "[retry]\nmax_retries = 1\nbase_delay_ms = 1\nmax_delay_ms = 2\n",
    )
    .unwrap();
}

#[allow(dead_code)]
pub fn rows(start: u64, end: u64) -> Vec<Value> {
    (start..end).map(|i| json!({ "id": i, "name": format!("row-{i}") })).collect()
}

/// Serve `total` rows from `/odata/Items` in pages of 100 with a count probe.
#[allow(dead_code)]
pub async fn mount_items(server: &MockServer, total: u64) {
    Mock::given(method("GET"))
        .and(path("/odata/Items"))
        .and(query_param("$top", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "@odata.count": total,
            "value": rows(0, total.min(1)),
        })))
        .mount(server)
        .await;

    let mut offset = 0;
    while offset < total {
        Mock::given(method("GET"))
            .and(path("/odata/Items"))
            .and(query_param("$skip", offset.to_string()))
            .and(query_param("$top", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": rows(offset, (offset + 100).min(total)),
            })))
            .mount(server)
            .await;
        offset += 100;
    }
}
