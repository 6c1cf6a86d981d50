use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::backends::{BackendError, BackendFuture, GenerationBackend};
use crate::config::BackendConfig;

/// Generic JSON-over-HTTP backend.
///
/// Posts `{"tool", "model", "payload"}` to a single URL and treats any 2xx
/// JSON body as the unit's output.
pub struct HttpBackend {
    id: String,
    url: String,
    api_key: Option<String>,
    headers: Vec<(String, String)>,
    http: Client,
}

#[derive(Serialize)]
struct AttemptBody<'a> {
    tool: &'a str,
    model: &'a str,
    payload: &'a Value,
}

impl HttpBackend {
    pub fn from_config(cfg: &BackendConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()?;
        let mut headers: Vec<(String, String)> = cfg
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();
        Ok(Self {
            id: cfg.id.clone(),
            url: cfg.url.clone(),
            api_key: cfg.api_key.clone(),
            headers,
            http,
        })
    }
}

impl GenerationBackend for HttpBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn attempt<'a>(&'a self, tool: &'a str, model: &'a str, payload: &'a Value) -> BackendFuture<'a> {
        Box::pin(async move {
            let mut req = self
                .http
                .post(&self.url)
                .json(&AttemptBody { tool, model, payload });
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            for (name, value) in &self.headers {
                req = req.header(name, value);
            }

            let resp = req.send().await.map_err(classify_transport)?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                debug!(backend = %self.id, status = status.as_u16(), "Backend returned error status");
                return Err(classify_status(status, &text));
            }

            resp.json::<Value>().await.map_err(classify_transport)
        })
    }
}

/// Map a non-success HTTP status onto the retry taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status.as_u16() {
        408 | 429 | 500..=599 => BackendError::Transient(message),
        400 | 422 => BackendError::Invalid(message),
        _ => BackendError::Rejected(message),
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        BackendError::Transient(err.to_string())
    } else {
        BackendError::Rejected(err.to_string())
    }
}
