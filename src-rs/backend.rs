use std::future::Future;

use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::BackendSettings;
use crate::error::PipelineError;
use crate::request::AnalysisRequest;

/// A hosted multimodal completion service. Returns the raw text of the answer;
/// an empty string means the service produced nothing usable.
pub trait InferenceBackend {
    fn generate(
        &self,
        request: &AnalysisRequest,
    ) -> impl Future<Output = Result<String, PipelineError>> + Send;
}

/// Google Generative Language `generateContent` client.
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl GeminiBackend {
    pub fn new(settings: &BackendSettings, api_key: &str) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| PipelineError::BackendUnavailable(format!("http client: {err}")))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: api_key.to_string(),
        })
    }

    pub fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl InferenceBackend for GeminiBackend {
    async fn generate(&self, request: &AnalysisRequest) -> Result<String, PipelineError> {
        let url = self.url();
        info!(model = %self.model, images = request.images().len(), "sending analysis request");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request.to_body())
            .send()
            .await
            .map_err(|err| PipelineError::BackendUnavailable(describe_transport_error(&err)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| PipelineError::BackendUnavailable(describe_transport_error(&err)))?;
        debug!(%status, bytes = body.len(), "analysis response received");

        read_reply(status, &body)
    }
}

fn read_reply(status: StatusCode, body: &str) -> Result<String, PipelineError> {
    if !status.is_success() {
        return Err(PipelineError::BackendUnavailable(format!(
            "HTTP {status}: {}",
            truncate_text(body, 400)
        )));
    }

    let envelope: Value = serde_json::from_str(body).map_err(|err| {
        PipelineError::MalformedResponse(format!("response envelope is not JSON: {err}"))
    })?;
    Ok(extract_candidate_text(&envelope))
}

/// Concatenates the text parts of the first candidate. Blocked or empty
/// candidates produce an empty string.
pub fn extract_candidate_text(envelope: &Value) -> String {
    if let Some(reason) = envelope
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        warn!(reason, "prompt was blocked by the backend");
    }

    let candidate = envelope
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|items| items.first());
    let Some(candidate) = candidate else {
        return String::new();
    };
    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        if reason != "STOP" {
            warn!(reason, "candidate finished abnormally");
        }
    }

    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect::<String>() + "...<truncated>"
}
