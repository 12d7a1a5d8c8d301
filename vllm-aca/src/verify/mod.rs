//! Smoke verification of a deployed endpoint.
//!
//! Two requests, one attempt each: list the models, then ask for a tiny chat
//! completion. The outcome is advisory and never triggers a retry or a
//! rollback.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::openai::{CHAT_COMPLETIONS_PATH, MODELS_PATH};
use common::{ChatCompletionRequest, ChatCompletionResponse, ModelList, OpError};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

/// Outcome of one verification run.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub endpoint: String,
    pub models_status: Option<u16>,
    pub chat_status: Option<u16>,
    pub models: Vec<String>,
    pub choices: usize,
    pub reply: Option<String>,
    pub passed: bool,
    pub failures: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl VerificationReport {
    /// Turns a failed report into a verification error.
    pub fn into_result(self) -> Result<Self> {
        if self.passed {
            Ok(self)
        } else {
            Err(OpError::Verification(self.failures.join("; ")).into())
        }
    }
}

pub struct Verifier {
    client: Client,
    base: Url,
}

impl Verifier {
    /// `timeout` of `None` keeps the HTTP client's defaults.
    pub fn new(endpoint: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut base = Url::parse(endpoint)
            .map_err(|e| OpError::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
        // A trailing `/v1` is accepted for convenience. Any other prefix is
        // kept so routes resolve below it.
        let mut path = base.path().trim_end_matches('/').to_string();
        if path.ends_with("/v1") {
            path.truncate(path.len() - "/v1".len());
        }
        path.push('/');
        base.set_path(&path);

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to create HTTP client")?;
        Ok(Self { client, base })
    }

    pub fn endpoint(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Failed to build URL for {}", path))
    }

    /// The status is reported as received. A 2xx body that is not a model
    /// list is logged and yields `None`.
    pub async fn list_models(&self) -> Result<(StatusCode, Option<ModelList>)> {
        let response = self.client.get(self.url(MODELS_PATH)?).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Ok((status, None));
        }
        let body = response.text().await?;
        match serde_json::from_str::<ModelList>(&body) {
            Ok(list) => Ok((status, Some(list))),
            Err(e) => {
                warn!("{} returned {} with an unexpected body: {}", MODELS_PATH, status, e);
                Ok((status, None))
            }
        }
    }

    pub async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<(StatusCode, Option<ChatCompletionResponse>)> {
        let response = self
            .client
            .post(self.url(CHAT_COMPLETIONS_PATH)?)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!("Chat completion returned {}: {}", status, body);
            return Ok((status, None));
        }
        match serde_json::from_str::<ChatCompletionResponse>(&body) {
            Ok(completion) => Ok((status, Some(completion))),
            Err(e) => {
                warn!("{} returned {} with an unexpected body: {}", CHAT_COMPLETIONS_PATH, status, e);
                Ok((status, None))
            }
        }
    }

    /// Runs both checks against `model`. Transport failures are folded into
    /// the report rather than returned.
    pub async fn verify(&self, model: &str) -> VerificationReport {
        let mut report = VerificationReport {
            endpoint: self.endpoint().to_string(),
            models_status: None,
            chat_status: None,
            models: Vec::new(),
            choices: 0,
            reply: None,
            passed: false,
            failures: Vec::new(),
            checked_at: Utc::now(),
        };

        info!("GET {}{}", report.endpoint, MODELS_PATH);
        match self.list_models().await {
            Ok((status, list)) => {
                report.models_status = Some(status.as_u16());
                if !status.is_success() {
                    report.failures.push(format!("{} returned {}", MODELS_PATH, status));
                }
                if let Some(list) = list {
                    report.models = list.data.into_iter().map(|m| m.id).collect();
                }
            }
            Err(e) => report.failures.push(format!("{} failed: {}", MODELS_PATH, e)),
        }

        info!("POST {}{}", report.endpoint, CHAT_COMPLETIONS_PATH);
        match self.chat(&ChatCompletionRequest::ping(model)).await {
            Ok((status, completion)) => {
                report.chat_status = Some(status.as_u16());
                if let Some(completion) = &completion {
                    report.choices = completion.choices.len();
                    report.reply = completion.first_content().map(str::to_string);
                }
                if !status.is_success() {
                    report
                        .failures
                        .push(format!("{} returned {}", CHAT_COMPLETIONS_PATH, status));
                } else if report.choices == 0 {
                    report
                        .failures
                        .push(format!("{} returned no choices", CHAT_COMPLETIONS_PATH));
                }
            }
            Err(e) => report
                .failures
                .push(format!("{} failed: {}", CHAT_COMPLETIONS_PATH, e)),
        }

        report.passed = report.failures.is_empty();
        if report.passed {
            info!("Smoke verification passed ({} model(s) listed)", report.models.len());
        } else {
            error!("Smoke verification failed: {}", report.failures.join("; "));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::{get, post}, Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    /// Serves `app` on an ephemeral port and returns its base URL.
    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn healthy_engine(seen: Arc<Mutex<Option<Value>>>) -> Router {
        Router::new()
            .route(
                "/v1/models",
                get(|| async {
                    Json(json!({"object": "list", "data": [{"id": "LangAGI-Lab/camel", "object": "model", "owned_by": "vllm"}]}))
                }),
            )
            .route(
                "/v1/chat/completions",
                post(move |Json(body): Json<Value>| {
                    let seen = seen.clone();
                    async move {
                        *seen.lock().unwrap() = Some(body);
                        Json(json!({
                            "id": "chatcmpl-1",
                            "model": "LangAGI-Lab/camel",
                            "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}]
                        }))
                    }
                }),
            )
    }

    #[tokio::test]
    async fn test_verify_passes_against_healthy_engine() {
        let seen = Arc::new(Mutex::new(None));
        let base = serve(healthy_engine(seen.clone())).await;

        let verifier = Verifier::new(&base, Some(Duration::from_secs(5))).unwrap();
        let report = verifier.verify("LangAGI-Lab/camel").await;

        assert!(report.passed, "{:?}", report.failures);
        assert_eq!(report.models_status, Some(200));
        assert_eq!(report.chat_status, Some(200));
        assert_eq!(report.models, vec!["LangAGI-Lab/camel"]);
        assert_eq!(report.choices, 1);
        assert_eq!(report.reply.as_deref(), Some("pong"));

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(
            body,
            json!({"model": "LangAGI-Lab/camel", "messages": [{"role": "user", "content": "ping"}], "max_tokens": 16})
        );
    }

    #[tokio::test]
    async fn test_verify_fails_on_non_success_chat() {
        let app = Router::new()
            .route("/v1/models", get(|| async { Json(json!({"object": "list", "data": []})) }))
            .route(
                "/v1/chat/completions",
                post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "model loading") }),
            );
        let base = serve(app).await;

        let report = Verifier::new(&base, None).unwrap().verify("LangAGI-Lab/camel").await;
        assert!(!report.passed);
        assert_eq!(report.models_status, Some(200));
        assert_eq!(report.chat_status, Some(503));

        let err = report.into_result().unwrap_err();
        assert!(matches!(err.downcast_ref::<OpError>(), Some(OpError::Verification(_))));
    }

    #[tokio::test]
    async fn test_verify_fails_on_empty_choices() {
        let app = Router::new()
            .route("/v1/models", get(|| async { Json(json!({"data": [{"id": "m"}]})) }))
            .route("/v1/chat/completions", post(|| async { Json(json!({"choices": []})) }));
        let base = serve(app).await;

        let report = Verifier::new(&base, None).unwrap().verify("m").await;
        assert!(!report.passed);
        assert_eq!(report.choices, 0);
    }

    #[tokio::test]
    async fn test_verify_reports_unreachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let verifier = Verifier::new(&format!("http://{}", addr), Some(Duration::from_secs(2))).unwrap();
        let report = verifier.verify("m").await;
        assert!(!report.passed);
        assert_eq!(report.models_status, None);
        assert_eq!(report.failures.len(), 2);
    }

    #[test]
    fn test_endpoint_accepts_v1_suffix() {
        let verifier = Verifier::new("https://app.eastus.azurecontainerapps.io/v1", None).unwrap();
        assert_eq!(
            verifier.url(MODELS_PATH).unwrap().as_str(),
            "https://app.eastus.azurecontainerapps.io/v1/models"
        );
        assert!(Verifier::new("not a url", None).is_err());
    }

    #[test]
    fn test_endpoint_keeps_gateway_prefix() {
        let verifier = Verifier::new("https://gw.example.com/llm/v1", None).unwrap();
        assert_eq!(verifier.endpoint(), "https://gw.example.com/llm");
        assert_eq!(
            verifier.url(MODELS_PATH).unwrap().as_str(),
            "https://gw.example.com/llm/v1/models"
        );
        assert_eq!(
            verifier.url(CHAT_COMPLETIONS_PATH).unwrap().as_str(),
            "https://gw.example.com/llm/v1/chat/completions"
        );

        let verifier = Verifier::new("https://gw.example.com/llm/", None).unwrap();
        assert_eq!(
            verifier.url(MODELS_PATH).unwrap().as_str(),
            "https://gw.example.com/llm/v1/models"
        );
    }

    #[tokio::test]
    async fn test_models_check_passes_on_success_status_alone() {
        let app = Router::new()
            .route("/v1/models", get(|| async { Json(json!({"object": "list", "models": ["m"]})) }))
            .route(
                "/v1/chat/completions",
                post(|| async {
                    Json(json!({"choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}}]}))
                }),
            );
        let base = serve(app).await;

        let report = Verifier::new(&base, None).unwrap().verify("m").await;
        assert!(report.passed, "{:?}", report.failures);
        assert_eq!(report.models_status, Some(200));
        assert!(report.models.is_empty());
        assert_eq!(report.chat_status, Some(200));
    }

    #[tokio::test]
    async fn test_chat_status_kept_when_body_is_unexpected() {
        let app = Router::new()
            .route("/v1/models", get(|| async { Json(json!({"data": [{"id": "m"}]})) }))
            .route("/v1/chat/completions", post(|| async { "pong" }));
        let base = serve(app).await;

        let report = Verifier::new(&base, None).unwrap().verify("m").await;
        assert!(!report.passed);
        assert_eq!(report.chat_status, Some(200));
        assert_eq!(report.choices, 0);
    }
}
