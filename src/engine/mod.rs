//! Request entry point: encode, balance, then stream through the failover
//! loop.

mod failover;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{
    AccountDirectory, CredentialProvider, ModelCatalog, StaticAccountDirectory, StaticCredentials,
    StaticModelCatalog,
};
use crate::clock::{Scheduler, TokioScheduler};
use crate::config::validation::validate_config;
use crate::config::AppConfig;
use crate::error::RelayError;
use crate::observability::token_counter::{check_input_budget, log_stream_usage};
use crate::protocol::balancer::balance_parts;
use crate::protocol::conversation::ChatRequest;
use crate::protocol::encoder::{encode_request, EncodeOptions};
use crate::protocol::wire::CloudCodeEnvelope;
use crate::state::RelayState;
use crate::stream::{StreamEvent, StreamSummary};
use crate::transport::{HttpTransport, UpstreamTransport};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A configured relay. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Relay {
    config: Arc<AppConfig>,
    transport: Arc<dyn UpstreamTransport>,
    credentials: Arc<dyn CredentialProvider>,
    directory: Arc<dyn AccountDirectory>,
    catalog: Arc<dyn ModelCatalog>,
    scheduler: Arc<dyn Scheduler>,
    state: Arc<RelayState>,
}

impl Relay {
    #[must_use]
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn UpstreamTransport>,
        credentials: Arc<dyn CredentialProvider>,
        directory: Arc<dyn AccountDirectory>,
        catalog: Arc<dyn ModelCatalog>,
    ) -> Self {
        let state = Arc::new(RelayState::new(&config));
        Self {
            config: Arc::new(config),
            transport,
            credentials,
            directory,
            catalog,
            scheduler: Arc::new(TokioScheduler),
            state,
        }
    }

    /// Relay over HTTP with the config-backed accounts and model catalog.
    ///
    /// # Errors
    ///
    /// Returns an error when the config is invalid or the HTTP client cannot
    /// be built.
    pub fn from_config(config: AppConfig) -> Result<Self, RelayError> {
        validate_config(&config).map_err(|err| RelayError::Config(err.to_string()))?;
        let transport = Arc::new(HttpTransport::new(&config.transport)?);
        let credentials = Arc::new(StaticCredentials::from_config(&config));
        let directory = Arc::new(StaticAccountDirectory::from_config(&config));
        let catalog = Arc::new(StaticModelCatalog::from_config(&config));
        Ok(Self::new(config, transport, credentials, directory, catalog))
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Stream one chat request, delivering events to `sink` in order.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidRequest`] for requests that cannot be
    /// encoded, [`RelayError::Cancelled`] when `cancel` fires or `sink` is
    /// closed, and the surfaced upstream failure once retries and rotation
    /// are exhausted.
    pub async fn stream_chat(
        &self,
        request: &ChatRequest,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, RelayError> {
        let started = Instant::now();
        let mut payload = self.prepare(request)?;

        let provider_key = self.config.features.provider_key.as_str();
        let accounts = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RelayError::Cancelled),
            accounts = self.directory.accounts(provider_key) => accounts,
        };
        let ordered = self.state.router.order(
            provider_key,
            &request.model,
            accounts,
            &self.state.quota,
            self.scheduler.now(),
        );
        if ordered.is_empty() {
            return Err(RelayError::CandidatesExhausted {
                last_status: None,
                last_message: format!("no accounts available for provider '{provider_key}'"),
            });
        }

        let summary = failover::run_failover(failover::FailoverInput {
            relay: self,
            model: &request.model,
            session_id: request.session_id.as_deref(),
            payload: &mut payload,
            accounts: &ordered,
            sink,
            cancel,
        })
        .await?;

        log_stream_usage(
            &request.model,
            summary.usage.as_ref(),
            payload.estimated_input_tokens,
            started.elapsed(),
        );
        Ok(summary)
    }

    /// Run [`Relay::stream_chat`] on a spawned task. Dropping the receiver
    /// cancels the stream.
    #[must_use]
    pub fn spawn_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<StreamEvent>,
        JoinHandle<Result<StreamSummary, RelayError>>,
    ) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let relay = self.clone();
        let handle = tokio::spawn(async move { relay.stream_chat(&request, &tx, &cancel).await });
        (rx, handle)
    }

    fn prepare(&self, request: &ChatRequest) -> Result<PreparedPayload, RelayError> {
        let limits = self.catalog.limits(&request.model);
        let estimated_input_tokens =
            check_input_budget(request, limits.and_then(|limits| limits.max_input_tokens));

        let mut wire = encode_request(
            request,
            &EncodeOptions {
                filler_thinking: self.config.features.filler_thinking,
                limits,
                signatures: self.state.signatures.as_ref(),
            },
        )?;
        let report = balance_parts(&mut wire.contents);
        if !report.is_noop() {
            tracing::debug!(
                model = %request.model,
                synthesized = report.synthesized_responses,
                converted = report.converted_responses,
                removed = report.removed_responses,
                reattached_signatures = report.reattached_signatures,
                dropped_signatures = report.dropped_signatures,
                "balanced function call parts"
            );
        }

        Ok(PreparedPayload {
            envelope: CloudCodeEnvelope {
                model: request.model.clone(),
                project: None,
                user_prompt_id: uuid::Uuid::from_u128(fastrand::u128(..)).to_string(),
                request: wire,
            },
            encoded: None,
            estimated_input_tokens,
        })
    }
}

/// Encoded request, re-serialized only when the account project changes.
pub(crate) struct PreparedPayload {
    envelope: CloudCodeEnvelope,
    encoded: Option<Bytes>,
    estimated_input_tokens: u64,
}

impl PreparedPayload {
    pub(crate) fn body_for(&mut self, project: Option<&str>) -> Result<Bytes, RelayError> {
        if let Some(encoded) = &self.encoded {
            if self.envelope.project.as_deref() == project {
                return Ok(encoded.clone());
            }
        }
        self.envelope.project = project.map(str::to_string);
        let encoded = Bytes::from(
            serde_json::to_vec(&self.envelope)
                .map_err(|err| RelayError::Internal(format!("request serialization failed: {err}")))?,
        );
        self.encoded = Some(encoded.clone());
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::conversation::ConversationTurn;

    fn relay() -> Relay {
        let config = crate::config::parse_config(
            "endpoints: [\"https://example.com/v1internal:\"]\naccounts:\n  - id: a\n    token: t\n",
        )
        .unwrap();
        Relay::from_config(config).unwrap()
    }

    #[test]
    fn test_body_carries_project_and_prompt_id() {
        let relay = relay();
        let request = ChatRequest::new("gemini-2.5-pro", vec![ConversationTurn::user_text("hi")]);
        let mut payload = relay.prepare(&request).unwrap();

        let body = payload.body_for(Some("proj-1")).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["model"], "gemini-2.5-pro");
        assert_eq!(json["project"], "proj-1");
        assert_eq!(json["user_prompt_id"].as_str().unwrap().len(), 36);
        assert_eq!(json["request"]["contents"][0]["role"], "user");

        let again = payload.body_for(Some("proj-1")).unwrap();
        assert_eq!(body.as_ptr(), again.as_ptr());

        let no_project = payload.body_for(None).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&no_project).unwrap();
        assert!(json.get("project").is_none());
    }

    #[test]
    fn test_from_config_rejects_missing_endpoints() {
        let mut config = relay().config().clone();
        config.endpoints.clear();
        assert!(matches!(
            Relay::from_config(config),
            Err(RelayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_without_endpoints_is_config_error() {
        let mut config = relay().config().clone();
        config.endpoints.clear();
        let relay = Relay::new(
            config.clone(),
            Arc::new(HttpTransport::new(&config.transport).unwrap()),
            Arc::new(StaticCredentials::from_config(&config)),
            Arc::new(StaticAccountDirectory::from_config(&config)),
            Arc::new(StaticModelCatalog::from_config(&config)),
        );
        let request = ChatRequest::new("gemini-2.5-pro", vec![ConversationTurn::user_text("hi")]);
        let (tx, _rx) = mpsc::channel(4);
        let result = relay
            .stream_chat(&request, &tx, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[test]
    fn test_prepare_rejects_empty_conversation() {
        let relay = relay();
        let request = ChatRequest::new("gemini-2.5-pro", Vec::new());
        assert!(matches!(
            relay.prepare(&request),
            Err(RelayError::InvalidRequest(_))
        ));
    }
}
