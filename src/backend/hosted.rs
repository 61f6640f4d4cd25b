//! A backend talking to a real experiment-tracking server over HTTP.
//!
//! Uses `reqwest::blocking::Client` rather than the async client, since
//! every backend call runs from a synchronous consumer thread, not an
//! async runtime.

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;

use super::{ApiExperiment, Backend, CreateRunRequest, ExecuteOperationsOutcome, SearchResult};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::operation::Operation;

pub struct HostedBackend {
    client: Client,
    config: BackendConfig,
}

impl HostedBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(config.request_timeout);

        if let Some(proxies) = &config.proxies {
            for (scheme, proxy_url) in proxies {
                let proxy = match scheme.as_str() {
                    "http" => reqwest::Proxy::http(proxy_url),
                    "https" => reqwest::Proxy::https(proxy_url),
                    other => {
                        return Err(Error::Configuration(format!(
                            "unsupported proxy scheme \"{other}\""
                        )))
                    }
                }
                .map_err(|e| Error::Configuration(format!("invalid proxy url: {e}")))?;
                builder = builder.proxy(proxy);
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(HostedBackend { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        builder.bearer_auth(&self.config.api_token)
    }

    /// Send a request and map the response into this crate's error model.
    /// A connection-level failure or a 5xx/408/timeout response becomes
    /// [`Error::ConnectionLost`] so the daemon's retry wrapper backs off and
    /// retries it; 429 becomes [`Error::RateLimit`]; 403 becomes
    /// [`Error::WriteDenied`]; anything else is classified by
    /// [`Error::classify_operation_error`] against the configured benign
    /// substrings.
    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<serde_json::Value> {
        let response = request.send().map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                Error::ConnectionLost { cause: e.to_string() }
            } else {
                Error::Request(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<serde_json::Value>().map_err(Error::from);
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().unwrap_or_default();

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => Error::RateLimit {
                message: retry_after
                    .map(|d| format!("{body} (retry after {}s)", d.as_secs()))
                    .unwrap_or(body),
            },
            StatusCode::FORBIDDEN => Error::WriteDenied { message: body },
            s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => Error::ConnectionLost {
                cause: format!("HTTP {s}: {body}"),
            },
            _ => Error::classify_operation_error(body, &self.config.benign_substrings()),
        })
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

impl Backend for HostedBackend {
    fn create_run(&self, request: &CreateRunRequest) -> Result<ApiExperiment> {
        let body = serde_json::json!({
            "custom_id": request.custom_id,
            "external_id": request.external_id,
            "external_sys_id": request.external_sys_id,
        });
        let value = self.send(self.authorized(self.client.post(self.url("/api/runs")).json(&body)))?;
        experiment_from_value(value)
    }

    fn create_model(&self, request: &CreateRunRequest) -> Result<ApiExperiment> {
        let body = serde_json::json!({
            "custom_id": request.custom_id,
            "external_id": request.external_id,
            "external_sys_id": request.external_sys_id,
        });
        let value = self.send(self.authorized(self.client.post(self.url("/api/models")).json(&body)))?;
        experiment_from_value(value)
    }

    fn get_project(&self, project: &str) -> Result<serde_json::Value> {
        self.send(self.authorized(self.client.get(self.url(&format!("/api/projects/{project}")))))
    }

    fn get_attributes(&self, run_id: &str) -> Result<serde_json::Value> {
        self.send(self.authorized(self.client.get(self.url(&format!("/api/runs/{run_id}/attributes")))))
    }

    fn execute_operations(
        &self,
        run_id: &str,
        operations: &[Operation],
    ) -> Result<ExecuteOperationsOutcome> {
        let dicts = operations
            .iter()
            .map(Operation::to_dict)
            .collect::<Result<Vec<_>>>()?;
        let body = serde_json::json!({ "operations": dicts });
        let value = self.send(self.authorized(
            self.client.post(self.url(&format!("/api/runs/{run_id}/operations"))).json(&body),
        ))?;

        let errors: Vec<(usize, String)> = value
            .get("errors")
            .and_then(|e| e.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let index = entry.get("index")?.as_u64()? as usize;
                        let message = entry.get("message")?.as_str()?.to_string();
                        Some((index, message))
                    })
                    .collect()
            })
            .unwrap_or_default();

        // Servers that don't report `processed_count` are assumed to have
        // applied everything they didn't list in `errors`.
        let processed_count = value
            .get("processed_count")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(dicts.len());

        Ok(ExecuteOperationsOutcome { processed_count, errors })
    }

    fn download_file(&self, run_id: &str, attribute_path: &str, destination: &Path) -> Result<()> {
        let response = self
            .authorized(
                self.client
                    .get(self.url(&format!("/api/runs/{run_id}/files/{attribute_path}"))),
            )
            .send()
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    Error::ConnectionLost { cause: e.to_string() }
                } else {
                    Error::Request(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::classify_operation_error(
                format!("download failed with HTTP {}", response.status()),
                &self.config.benign_substrings(),
            ));
        }

        let bytes = response.bytes().map_err(Error::from)?;
        std::fs::write(destination, bytes)?;
        Ok(())
    }

    fn search(&self, project: &str, query: &str) -> Result<Vec<SearchResult>> {
        let value = self.send(self.authorized(
            self.client
                .get(self.url(&format!("/api/projects/{project}/search")))
                .query(&[("query", query)]),
        ))?;

        let rows = value
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        rows.into_iter()
            .map(|row| {
                let run_id = row
                    .get("run_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::MetadataInconsistency {
                        message: "search result missing run_id".to_string(),
                    })?
                    .to_string();
                Ok(SearchResult { run_id, fields: row })
            })
            .collect()
    }

    fn get_run_url(&self, run_id: &str) -> Result<String> {
        let value = self.send(self.authorized(self.client.get(self.url(&format!("/api/runs/{run_id}/url")))))?;
        value
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::MetadataInconsistency {
                message: "response missing \"url\"".to_string(),
            })
    }

    fn health_ping(&self) -> Result<()> {
        self.send(self.authorized(self.client.get(self.url("/api/health")))).map(|_| ())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn display_address(&self) -> &str {
        &self.config.display_address
    }
}

fn experiment_from_value(value: serde_json::Value) -> Result<ApiExperiment> {
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::MetadataInconsistency {
            message: "response missing \"id\"".to_string(),
        })?
        .to_string();
    let sys_id = value
        .get("sys_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::MetadataInconsistency {
            message: "response missing \"sys_id\"".to_string(),
        })?
        .to_string();
    Ok(ApiExperiment { id, sys_id, fields: value })
}
