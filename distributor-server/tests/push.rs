use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;

use crate::common::*;
mod common;

#[tokio::test]
async fn it_accepts_a_push() -> Result<()> {
    setup_tracing();
    let tenant = random_string("tenant", 8);
    let server = ServerConfig::default().start();

    let body = json!({
        "streams": [{
            "labels": r#"{app="api", env="prod"}"#,
            "entries": [{"timestamp": now_ns(), "line": "hello world"}]
        }]
    });
    let res = server.push(Some(&tenant), body.to_string()).await;
    assert_eq!(StatusCode::OK, res.status());
    Ok(())
}

#[tokio::test]
async fn it_accepts_an_empty_push() -> Result<()> {
    setup_tracing();
    let tenant = random_string("tenant", 8);
    let server = ServerConfig::default().start();

    let res = server
        .push(Some(&tenant), json!({"streams": []}).to_string())
        .await;
    assert_eq!(StatusCode::OK, res.status());
    Ok(())
}

#[tokio::test]
async fn it_rejects_pushes_without_a_tenant() -> Result<()> {
    setup_tracing();
    let server = ServerConfig::default().start();

    let body = json!({
        "streams": [{
            "labels": r#"{app="api"}"#,
            "entries": [{"timestamp": now_ns(), "line": "hello"}]
        }]
    });
    let res = server.push(None, body.to_string()).await;
    assert_eq!(StatusCode::UNAUTHORIZED, res.status());
    Ok(())
}

#[tokio::test]
async fn it_rejects_invalid_labels() -> Result<()> {
    setup_tracing();
    let tenant = random_string("tenant", 8);
    let server = ServerConfig::default().start();

    let body = json!({
        "streams": [{
            "labels": "not_a_labelset",
            "entries": [{"timestamp": now_ns(), "line": "hello"}]
        }]
    });
    let res = server.push(Some(&tenant), body.to_string()).await;
    assert_eq!(StatusCode::BAD_REQUEST, res.status());
    Ok(())
}

#[tokio::test]
async fn it_rejects_malformed_bodies() -> Result<()> {
    setup_tracing();
    let tenant = random_string("tenant", 8);
    let server = ServerConfig::default().start();

    let res = server.push(Some(&tenant), "{not json".to_string()).await;
    assert_eq!(StatusCode::BAD_REQUEST, res.status());
    Ok(())
}

#[tokio::test]
async fn it_rate_limits_per_tenant() -> Result<()> {
    setup_tracing();
    let limited = random_string("tenant", 8);
    let unlimited = random_string("tenant", 8);
    let server = ServerConfig::new(|config| {
        config.ingestion_rate_bytes = 100;
        config.ingestion_burst_bytes = 100;
    })
    .start();

    let body = json!({
        "streams": [{
            "labels": r#"{app="api"}"#,
            "entries": [{"timestamp": now_ns(), "line": "x".repeat(500)}]
        }]
    });

    let res = server.push(Some(&limited), body.to_string()).await;
    assert_eq!(StatusCode::TOO_MANY_REQUESTS, res.status());
    let message = res.text().await?;
    assert!(message.contains(&limited));
    assert!(message.contains("100"));
    assert!(message.contains("500"));

    // a different tenant is not debited by the first one's rejection
    let small = json!({
        "streams": [{
            "labels": r#"{app="api"}"#,
            "entries": [{"timestamp": now_ns(), "line": "tiny"}]
        }]
    });
    let res = server.push(Some(&unlimited), small.to_string()).await;
    assert_eq!(StatusCode::OK, res.status());
    Ok(())
}

#[tokio::test]
async fn it_reports_readiness() -> Result<()> {
    setup_tracing();
    let server = ServerConfig::default().start();

    let res = server.get("/ready").await;
    assert_eq!(StatusCode::OK, res.status());
    assert_eq!(res.text().await?, "ready");
    Ok(())
}

fn now_ns() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}
