//! Per-worker HTTP client.

use std::time::Duration;

use rand::seq::SliceRandom;

use crate::config::ClientConfig;
use crate::error::ClientError;

/// Desktop user agents picked from when none is configured.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Build a fresh client. Each worker gets its own connection pool.
pub fn build(config: &ClientConfig) -> Result<reqwest::Client, ClientError> {
    let user_agent = config
        .user_agent
        .clone()
        .unwrap_or_else(|| random_user_agent().to_string());

    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(config.timeout)
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| ClientError::Build(e.to_string()))
}

/// GET `url` and return the body. Non-2xx responses are errors.
pub async fn get_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, ClientError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ClientError::RequestFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| ClientError::RequestFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_agent_comes_from_pool() {
        for _ in 0..10 {
            assert!(USER_AGENTS.contains(&random_user_agent()));
        }
    }

    #[test]
    fn builds_with_defaults() {
        assert!(build(&ClientConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn unreachable_host_is_request_failed() {
        let client = build(&ClientConfig {
            timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        })
        .unwrap();

        let err = get_bytes(&client, "http://127.0.0.1:9/").await.unwrap_err();
        assert!(matches!(err, ClientError::RequestFailed { .. }));
    }
}
