//! Shared HTTP plumbing for the provider API and the in-instance agent.

use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

pub fn http_client() -> Result<&'static Client> {
    HTTP_CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .map_err(|err| OrchestratorError::Http(format!("Failed to build HTTP client: {err}")))
    })
}

pub fn build_url(base: &str, path: &str) -> Result<Url> {
    let base_url = Url::parse(base)
        .map_err(|err| OrchestratorError::Http(format!("Invalid base URL: {err}")))?;
    base_url
        .join(path)
        .map_err(|err| OrchestratorError::Http(format!("Invalid path '{path}': {err}")))
}

pub fn auth_headers(token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| OrchestratorError::Validation("Invalid provider API token".into()))?;
    headers.insert(AUTHORIZATION, value);

    Ok(headers)
}

/// Send a JSON request and return the raw status and body.
///
/// Transport failures map to `Http`. Non-success statuses are returned
/// to the caller, not turned into errors here: the provider client and
/// the agent client surface them as different variants.
pub async fn send_json(
    method: Method,
    url: Url,
    body: Option<Value>,
    headers: HeaderMap,
) -> Result<(StatusCode, String)> {
    let client = http_client()?;
    let mut request = client.request(method, url).headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request
        .send()
        .await
        .map_err(|err| OrchestratorError::Http(format!("HTTP request failed: {err}")))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| OrchestratorError::Http(format!("Failed to read response body: {err}")))?;

    Ok((status, text))
}

/// POST a JSON payload to the in-instance agent and parse the reply.
///
/// The agent listens on the sandbox's private address and is reachable
/// only inside the VPC, so requests carry no credentials. Non-2xx
/// replies and transport failures both surface as `ConfigApply`.
pub async fn agent_post_json(
    agent_base: &str,
    path: &str,
    payload: Value,
    timeout: Duration,
) -> Result<Value> {
    let url = build_url(agent_base, path)?;
    let client = http_client()?;

    let response = client
        .post(url)
        .timeout(timeout)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .json(&payload)
        .send()
        .await
        .map_err(|err| OrchestratorError::ConfigApply(format!("agent unreachable: {err}")))?;
    let status = response.status();
    let text = response.text().await.map_err(|err| {
        OrchestratorError::ConfigApply(format!("failed to read agent response: {err}"))
    })?;

    if !status.is_success() {
        return Err(OrchestratorError::ConfigApply(format!("HTTP {status}: {text}")));
    }

    serde_json::from_str(&text)
        .map_err(|err| OrchestratorError::ConfigApply(format!("invalid agent response JSON: {err}")))
}
