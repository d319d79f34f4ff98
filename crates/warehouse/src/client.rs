//! REST client for a BigQuery-style v2 API.
//!
//! - Credentials come from `WAREHOUSE_ACCESS_TOKEN` (an OAuth bearer token).
//! - The base URL comes from `WAREHOUSE_API_BASE` and is validated for safety.
//! - Short statements go through the synchronous `queries` endpoint and are paged
//!   to completion; model training is inserted as a job and polled by the caller.

use std::{env, time::Duration};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use propensity_types::{DatasetRef, JobHandle, JobState, RemoteError, ResourceKind, StatementRequest, Submission};
use propensity_util::{redact_sensitive, truncate_for_log};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url, header};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    Warehouse,
    rows::{FieldSchema, TableRow, decode_rows},
};

const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const TOKEN_ENV_VAR: &str = "WAREHOUSE_ACCESS_TOKEN";
const BASE_ENV_VAR: &str = "WAREHOUSE_API_BASE";
/// Hostnames allowed for local development regardless of scheme.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];
/// Server-side wait per `queries` call before the API returns `jobComplete: false`.
const QUERY_TIMEOUT_MS: u64 = 10_000;
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Warehouse client backed by the REST jobs API.
#[derive(Debug, Clone)]
pub struct RestWarehouse {
    base_url: String,
    project: String,
    location: Option<String>,
    http: Client,
    user_agent: String,
}

impl RestWarehouse {
    /// Build a client from `WAREHOUSE_ACCESS_TOKEN` and `WAREHOUSE_API_BASE`.
    pub fn new_from_env(project: &str, location: Option<String>) -> Result<Self> {
        let token = env::var(TOKEN_ENV_VAR).ok().filter(|token| !token.trim().is_empty());
        if token.is_none() {
            warn!("{TOKEN_ENV_VAR} is not set; requests will be sent without credentials");
        }
        let base_url = env::var(BASE_ENV_VAR).unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        Self::new(&base_url, project, location, token)
    }

    /// Build a client against an explicit base URL.
    pub fn new(base_url: &str, project: &str, location: Option<String>, token: Option<String>) -> Result<Self> {
        validate_base_url(base_url)?;
        if project.trim().is_empty() {
            return Err(anyhow!("a project id is required to talk to the warehouse"));
        }

        let mut default_headers = header::HeaderMap::new();
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}")).context("access token contains invalid header characters")?;
            default_headers.insert(header::AUTHORIZATION, value);
        }
        default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(QUERY_TIMEOUT_MS / 1_000 + 30))
            .build()
            .context("build http client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            location,
            http,
            user_agent: format!("propensity/{}; {}", env!("CARGO_PKG_VERSION"), env::consts::OS),
        })
    }

    /// Build a request for an API-relative path under the configured project.
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/projects/{}{}", self.base_url, encode_segment(&self.project), path);
        debug!(%url, "building warehouse request");
        let builder = self.http.request(method, url).header(header::USER_AGENT, &self.user_agent);
        match &self.location {
            Some(location) => builder.query(&[("location", location.as_str())]),
            None => builder,
        }
    }

    async fn run_query(&self, sql: &str) -> Result<QueryResponse, RemoteError> {
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        if let Some(location) = &self.location {
            body["location"] = Value::String(location.clone());
        }

        let mut response: QueryResponse = send_json(self.request(Method::POST, "/queries").json(&body)).await?;
        surface_errors(&response.errors)?;

        let mut all_rows = std::mem::take(&mut response.rows);
        let known_job_id = response.job_reference.as_ref().map(|reference| reference.job_id.clone());
        loop {
            let pending_page = response.page_token.clone();
            if response.job_complete && pending_page.is_none() {
                break;
            }
            let job_id = known_job_id
                .clone()
                .ok_or_else(|| RemoteError::new("query response is incomplete and carries no job reference"))?;

            let mut page_request = self
                .request(Method::GET, &format!("/queries/{}", encode_segment(&job_id)))
                .query(&[("timeoutMs", QUERY_TIMEOUT_MS.to_string())]);
            if let Some(page_token) = &pending_page {
                page_request = page_request.query(&[("pageToken", page_token.as_str())]);
            }

            let page: QueryResponse = send_json(page_request).await?;
            surface_errors(&page.errors)?;
            // A page served while the job is still running carries no rows and no token.
            let schema = page.schema.clone().or(response.schema.take());
            all_rows.extend(page.rows.iter().cloned());
            response = QueryResponse {
                schema,
                rows: Vec::new(),
                ..page
            };
            debug!(job_id = %job_id, rows = all_rows.len(), complete = response.job_complete, "paged query results");
        }

        response.rows = all_rows;
        Ok(response)
    }

    async fn insert_job(&self, sql: &str) -> Result<JobHandle, RemoteError> {
        let mut job_reference = json!({ "projectId": self.project });
        if let Some(location) = &self.location {
            job_reference["location"] = Value::String(location.clone());
        }
        let body = json!({
            "jobReference": job_reference,
            "configuration": { "query": { "query": sql, "useLegacySql": false } },
        });

        let job: JobResource = send_json(self.request(Method::POST, "/jobs").json(&body)).await?;
        if let Some(error) = job.status.as_ref().and_then(|status| status.error_result.as_ref()) {
            return Err(RemoteError::new(error.message.clone()));
        }
        Ok(JobHandle {
            job_id: job.job_reference.job_id,
            location: job.job_reference.location.or_else(|| self.location.clone()),
        })
    }
}

#[async_trait]
impl Warehouse for RestWarehouse {
    async fn ensure_dataset(&self, dataset: &DatasetRef) -> Result<(), RemoteError> {
        let project = dataset.project.clone().unwrap_or_else(|| self.project.clone());
        let mut body = json!({
            "datasetReference": { "projectId": project, "datasetId": dataset.dataset },
        });
        if let Some(location) = dataset.location.as_ref().or(self.location.as_ref()) {
            body["location"] = Value::String(location.clone());
        }

        let response = self
            .request(Method::POST, "/datasets")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::CONFLICT {
            debug!(dataset = %dataset.dataset, "dataset already exists");
            return Ok(());
        }
        check_status(response).await.map(|_| ())
    }

    async fn execute(&self, request: &StatementRequest) -> Result<Submission, RemoteError> {
        debug!(sql = %truncate_for_log(&redact_sensitive(&request.sql), 512), "submitting statement");
        match &request.resource {
            Some(resource) if matches!(resource.kind, ResourceKind::Model(_)) => self.insert_job(&request.sql).await.map(Submission::Job),
            Some(resource) => {
                self.run_query(&request.sql).await?;
                Ok(Submission::Resource(resource.clone()))
            }
            None => {
                let response = self.run_query(&request.sql).await?;
                let fields = response.schema.map(|schema| schema.fields).unwrap_or_default();
                Ok(Submission::Rows(decode_rows(&fields, &response.rows)))
            }
        }
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobState, RemoteError> {
        let mut request = self.request(Method::GET, &format!("/jobs/{}", encode_segment(&job.job_id)));
        if self.location.is_none()
            && let Some(location) = &job.location
        {
            request = request.query(&[("location", location.as_str())]);
        }
        let resource: JobResource = send_json(request).await?;
        Ok(job_state_from_status(resource.status.as_ref()))
    }

    async fn cancel_job(&self, job: &JobHandle) -> Result<(), RemoteError> {
        let response = self
            .request(Method::POST, &format!("/jobs/{}/cancel", encode_segment(&job.job_id)))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatusResource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResource {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

fn job_state_from_status(status: Option<&JobStatusResource>) -> JobState {
    let Some(status) = status else {
        return JobState::Pending;
    };
    match status.state.to_ascii_uppercase().as_str() {
        "DONE" => match &status.error_result {
            Some(error) => JobState::Failed {
                message: error.message.clone(),
            },
            None => JobState::Succeeded,
        },
        "RUNNING" => JobState::Running,
        _ => JobState::Pending,
    }
}

fn surface_errors(errors: &[ErrorProto]) -> Result<(), RemoteError> {
    match errors.first() {
        Some(error) => Err(RemoteError {
            message: error.message.clone(),
            retryable: is_retryable_reason(error.reason.as_deref()),
        }),
        None => Ok(()),
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, RemoteError> {
    let response = request.send().await.map_err(transport_error)?;
    let response = check_status(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|error| RemoteError::new(format!("could not decode warehouse response: {error}")))
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(%status, body = %truncate_for_log(&redact_sensitive(&body), 1_024), "warehouse request failed");
    Err(remote_error_from_response(status, &body))
}

fn remote_error_from_response(status: StatusCode, body: &str) -> RemoteError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let reason = parsed
        .as_ref()
        .and_then(|envelope| envelope.error.errors.first())
        .and_then(|error| error.reason.clone());
    let message = parsed
        .map(|envelope| envelope.error.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| format!("warehouse returned HTTP {status}"));

    RemoteError {
        message,
        retryable: is_retryable_status(status) || is_retryable_reason(reason.as_deref()),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_reason(reason: Option<&str>) -> bool {
    matches!(reason, Some("backendError" | "rateLimitExceeded" | "internalError"))
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    RemoteError {
        message: format!("network error talking to the warehouse: {error}"),
        retryable: error.is_timeout() || error.is_connect(),
    }
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

/// Validate that a base URL is acceptable.
///
/// `localhost`/`127.0.0.1` may use any scheme (emulators); every other host must use HTTPS.
fn validate_base_url(base: &str) -> Result<()> {
    let parsed = Url::parse(base).map_err(|error| anyhow!("invalid {BASE_ENV_VAR} URL '{base}': {error}"))?;
    let host_name = parsed.host_str().ok_or_else(|| anyhow!("{BASE_ENV_VAR} must include a host"))?;

    if LOCALHOST_DOMAINS.iter().any(|&allowed| host_name.eq_ignore_ascii_case(allowed)) {
        return Ok(());
    }
    if parsed.scheme() != "https" {
        return Err(anyhow!(
            "{BASE_ENV_VAR} must use https for non-localhost hosts; got '{}://'",
            parsed.scheme()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_rules_allow_https_and_local_emulators() {
        assert!(validate_base_url("https://bigquery.googleapis.com/bigquery/v2").is_ok());
        assert!(validate_base_url("http://localhost:9050").is_ok());
        assert!(validate_base_url("http://warehouse.internal").is_err());
        assert!(validate_base_url("not a url").is_err());
    }

    #[test]
    fn job_state_maps_done_with_error_to_failed() {
        let failed = JobStatusResource {
            state: "DONE".into(),
            error_result: Some(ErrorProto {
                reason: Some("invalidQuery".into()),
                message: "Column label not found".into(),
            }),
        };
        assert_eq!(
            job_state_from_status(Some(&failed)),
            JobState::Failed {
                message: "Column label not found".into()
            }
        );

        let running = JobStatusResource {
            state: "RUNNING".into(),
            error_result: None,
        };
        assert_eq!(job_state_from_status(Some(&running)), JobState::Running);
        assert_eq!(job_state_from_status(None), JobState::Pending);
    }

    #[test]
    fn error_bodies_keep_remote_message_and_flag_transient_failures() {
        let body = r#"{"error": {"code": 503, "message": "Backend unavailable", "errors": [{"reason": "backendError", "message": "x"}]}}"#;
        let error = remote_error_from_response(StatusCode::SERVICE_UNAVAILABLE, body);
        assert_eq!(error.message, "Backend unavailable");
        assert!(error.retryable);

        let error = remote_error_from_response(StatusCode::BAD_REQUEST, r#"{"error": {"message": "Syntax error: Unexpected keyword FROM at [3:1]"}}"#);
        assert_eq!(error.message, "Syntax error: Unexpected keyword FROM at [3:1]");
        assert!(!error.retryable);

        let error = remote_error_from_response(StatusCode::FORBIDDEN, "<html>denied</html>");
        assert!(error.message.contains("403"));
    }

    #[test]
    fn path_segments_are_percent_encoded() {
        assert_eq!(encode_segment("job_abc-123.x"), "job_abc-123.x");
        assert_eq!(encode_segment("a/b c"), "a%2Fb%20c");
    }

    #[test]
    fn constructor_rejects_missing_project() {
        let error = RestWarehouse::new("https://bigquery.googleapis.com/bigquery/v2", " ", None, None).expect_err("project required");
        assert!(error.to_string().contains("project id"));
    }
}
