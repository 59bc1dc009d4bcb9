//! # Health Checks
//!
//! `tcp` and `http` checks declared on the object, run after an apply.
//! `{{.output_name}}` placeholders in the target are filled from the outputs.

use crate::crd::HealthCheck;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z0-9_\-]+)\s*\}\}").expect("Failed to compile placeholder regex")
});

/// Replace `{{.name}}` with the matching output; unknown names are an error
pub fn render_target(template: &str, outputs: &BTreeMap<String, String>) -> Result<String, String> {
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER_REGEX.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match outputs.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(format!("unknown outputs in '{}': {}", template, missing.join(", ")))
    }
}

async fn check_tcp(address: &str, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("failed to connect to {address}: {e}")),
        Err(_elapsed) => Err(format!("timed out connecting to {address} after {timeout:?}")),
    }
}

async fn check_http(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<(), String> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| format!("failed to get {url}: {e}"))?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("{url} returned status {}", response.status()))
    }
}

/// Run every check in order; the first failure is returned as a message
pub async fn run_health_checks(
    checks: &[HealthCheck],
    outputs: &BTreeMap<String, String>,
) -> Result<(), String> {
    let client = reqwest::Client::new();
    for check in checks {
        let timeout = check.timeout();
        let result = match check.check_type.as_str() {
            "tcp" => {
                let address = render_target(&check.address, outputs)?;
                debug!("Health check {}: tcp {}", check.name, address);
                check_tcp(&address, timeout).await
            }
            "http" => {
                let url = render_target(&check.url, outputs)?;
                debug!("Health check {}: http {}", check.name, url);
                check_http(&client, &url, timeout).await
            }
            other => Err(format!("unsupported health check type '{other}'")),
        };
        result.map_err(|e| format!("health check '{}' failed: {}", check.name, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn outputs() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("host".to_string(), "127.0.0.1".to_string()),
            ("port".to_string(), "8080".to_string()),
        ])
    }

    #[test]
    fn test_render_target() {
        assert_eq!(
            render_target("{{.host}}:{{ .port }}", &outputs()).unwrap(),
            "127.0.0.1:8080"
        );
        assert_eq!(render_target("example.com:443", &outputs()).unwrap(), "example.com:443");
        assert!(render_target("{{.missing}}", &outputs()).is_err());
    }

    #[tokio::test]
    async fn test_tcp_check_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let checks = vec![HealthCheck {
            name: "db".to_string(),
            check_type: "tcp".to_string(),
            address: format!("{{{{.host}}}}:{port}"),
            ..Default::default()
        }];
        run_health_checks(&checks, &outputs()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_fails() {
        let checks = vec![HealthCheck {
            name: "grpc".to_string(),
            check_type: "grpc".to_string(),
            ..Default::default()
        }];
        let err = run_health_checks(&checks, &outputs()).await.unwrap_err();
        assert!(err.contains("unsupported health check type 'grpc'"));
    }
}
