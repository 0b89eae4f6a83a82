use std::future::Future;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::AccountCandidate;
use crate::error::{is_permission_denied, ErrorCategory, RelayError};
use crate::fc::tracker::ToolCallTracker;
use crate::stream::driver::{drive_stream, StreamFailure};
use crate::stream::{StreamDecoder, StreamEvent, StreamSummary};
use crate::transport::retry_policy::{backoff_delay, server_retry_delay};
use crate::transport::{read_body_text, stream_url, UpstreamRequest};
use crate::util::truncate_utf8;

use super::{PreparedPayload, Relay};

const ERROR_MESSAGE_MAX_BYTES: usize = 4096;

pub(super) struct FailoverInput<'a> {
    pub(super) relay: &'a Relay,
    pub(super) model: &'a str,
    pub(super) session_id: Option<&'a str>,
    pub(super) payload: &'a mut PreparedPayload,
    pub(super) accounts: &'a [AccountCandidate],
    pub(super) sink: &'a mpsc::Sender<StreamEvent>,
    pub(super) cancel: &'a CancellationToken,
}

/// A failed attempt plus what the retry rules need to know about it.
struct AttemptFailure {
    error: RelayError,
    server_delay: Option<Duration>,
    delivered: usize,
    permission_denied: bool,
}

impl AttemptFailure {
    fn before_response(error: RelayError) -> Self {
        Self {
            error,
            server_delay: None,
            delivered: 0,
            permission_denied: false,
        }
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, RelayError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(RelayError::Cancelled),
        value = fut => Ok(value),
    }
}

/// Try accounts in order, rotating endpoints inside each account, until one
/// attempt streams to completion or a failure must be surfaced.
pub(super) async fn run_failover(input: FailoverInput<'_>) -> Result<StreamSummary, RelayError> {
    let FailoverInput {
        relay,
        model,
        session_id,
        payload,
        accounts,
        sink,
        cancel,
    } = input;
    let endpoints = &relay.config.endpoints;
    if endpoints.is_empty() {
        return Err(RelayError::Config("no upstream endpoints configured".into()));
    }
    let retry = &relay.config.retry;
    let quota_ceiling = Duration::from_millis(retry.quota_wait_ceiling_ms);
    let mut attempts = 0u32;
    let mut last_status: Option<u16> = None;
    let mut last_message = String::from("no attempt was made");

    'accounts: for (account_index, account) in accounts.iter().enumerate() {
        let last_account = account_index + 1 == accounts.len();
        let mut token = match acquire_token(relay, account, cancel).await {
            Ok(token) => token,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                tracing::warn!(account = %account.id, error = %err, "no usable token for account");
                relay.directory.record_outcome(&account.id, false).await;
                if last_account {
                    return Err(err);
                }
                last_message = err.to_string();
                continue;
            }
        };
        let body = payload.body_for(account.project.as_deref())?;

        let mut endpoint_index = 0usize;
        let mut transient_failures = 0u32;
        let mut same_endpoint_retries = 0u32;
        let mut refreshed = false;
        let mut quota_waited = false;

        loop {
            let endpoint = &endpoints[endpoint_index];
            attempts += 1;
            let failure = match attempt(
                relay,
                endpoint,
                &token,
                body.clone(),
                session_id,
                sink,
                cancel,
            )
            .await
            {
                Ok(mut summary) => {
                    relay.state.quota.record_success(&account.id, model);
                    relay.directory.record_outcome(&account.id, true).await;
                    relay
                        .state
                        .router
                        .remember_success(&relay.config.features.provider_key, &account.id);
                    summary.account_id.clone_from(&account.id);
                    summary.endpoint.clone_from(endpoint);
                    summary.attempts = attempts;
                    return Ok(summary);
                }
                Err(failure) => failure,
            };

            if failure.error.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            if failure.delivered > 0 {
                tracing::warn!(
                    account = %account.id,
                    endpoint = %endpoint,
                    delivered = failure.delivered,
                    error = %failure.error,
                    "stream failed after events were delivered"
                );
                relay.directory.record_outcome(&account.id, false).await;
                return Err(failure.error);
            }

            let category = failure.error.category();
            last_status = failure.error.status();
            last_message = failure.error.to_string();
            let last_endpoint = endpoint_index + 1 == endpoints.len();
            tracing::warn!(
                account = %account.id,
                endpoint = %endpoint,
                attempt = attempts,
                category = ?category,
                status = ?last_status,
                "upstream attempt failed"
            );

            if failure.permission_denied {
                relay.directory.record_outcome(&account.id, false).await;
                return Err(failure.error);
            }

            match category {
                ErrorCategory::UserError | ErrorCategory::Unknown => {
                    return Err(failure.error);
                }
                ErrorCategory::AuthError => {
                    if refreshed {
                        relay.directory.record_outcome(&account.id, false).await;
                        return Err(failure.error);
                    }
                    refreshed = true;
                    relay.credentials.invalidate(account);
                    match cancellable(cancel, relay.credentials.refresh(account)).await?? {
                        Some(fresh) => {
                            tracing::info!(account = %account.id, "token refreshed after auth failure");
                            token = fresh;
                        }
                        None => {
                            relay.directory.record_outcome(&account.id, false).await;
                            return Err(failure.error);
                        }
                    }
                }
                ErrorCategory::NotFound => {
                    if last_endpoint {
                        return Err(failure.error);
                    }
                    endpoint_index += 1;
                }
                ErrorCategory::Transient => {
                    transient_failures += 1;
                    if transient_failures >= retry.transient_max_attempts {
                        return Err(failure.error);
                    }
                    if !last_endpoint {
                        endpoint_index += 1;
                        continue;
                    }
                    let delay = failure.server_delay.unwrap_or_else(|| {
                        backoff_delay(
                            Duration::from_millis(retry.transient_backoff_base_ms),
                            Duration::from_millis(retry.transient_backoff_max_ms),
                            same_endpoint_retries,
                        )
                    });
                    same_endpoint_retries += 1;
                    tracing::info!(
                        endpoint = %endpoint,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retrying after transient failure"
                    );
                    cancellable(cancel, relay.scheduler.sleep(delay)).await?;
                }
                ErrorCategory::QuotaError => {
                    let cooldown = relay.state.quota.record_failure(
                        &account.id,
                        model,
                        relay.scheduler.now(),
                        failure.server_delay,
                    );
                    if cooldown > quota_ceiling {
                        relay
                            .directory
                            .mark_quota_limited(&account.id, model, SystemTime::now() + cooldown)
                            .await;
                    }
                    if !last_endpoint {
                        endpoint_index += 1;
                        continue;
                    }
                    if !last_account {
                        relay.directory.record_outcome(&account.id, false).await;
                        continue 'accounts;
                    }
                    if cooldown > quota_ceiling {
                        return Err(RelayError::QuotaExhausted {
                            account: account.id.clone(),
                            model: model.to_string(),
                            retry_after: cooldown,
                            message: failure.error.to_string(),
                        });
                    }
                    if relay.config.features.load_distribution || quota_waited {
                        return Err(RelayError::CandidatesExhausted {
                            last_status,
                            last_message,
                        });
                    }
                    quota_waited = true;
                    tracing::info!(
                        account = %account.id,
                        model = %model,
                        cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
                        "waiting out quota cooldown before one more attempt"
                    );
                    cancellable(cancel, relay.scheduler.sleep(cooldown)).await?;
                }
            }
        }
    }

    Err(RelayError::CandidatesExhausted {
        last_status,
        last_message,
    })
}

/// Token for `account`, refreshed first when the cached one has expired.
async fn acquire_token(
    relay: &Relay,
    account: &AccountCandidate,
    cancel: &CancellationToken,
) -> Result<String, RelayError> {
    let token = cancellable(cancel, relay.credentials.get_token(account)).await??;
    if !token.is_expired_at(SystemTime::now()) {
        return Ok(token.token);
    }
    tracing::debug!(account = %account.id, "access token expired; refreshing");
    relay.credentials.invalidate(account);
    cancellable(cancel, relay.credentials.refresh(account))
        .await??
        .ok_or_else(|| {
            RelayError::Auth(format!(
                "token for account '{}' expired and cannot be refreshed",
                account.id
            ))
        })
}

async fn attempt(
    relay: &Relay,
    endpoint: &str,
    token: &str,
    body: Bytes,
    session_id: Option<&str>,
    sink: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<StreamSummary, AttemptFailure> {
    let request = UpstreamRequest {
        url: stream_url(endpoint),
        bearer: token.to_string(),
        body,
    };
    let response = cancellable(cancel, relay.transport.send(request))
        .await
        .and_then(|sent| sent)
        .map_err(AttemptFailure::before_response)?;

    if !(200..300).contains(&response.status) {
        let status = response.status;
        let text = cancellable(cancel, read_body_text(response.body))
            .await
            .map_err(AttemptFailure::before_response)?;
        let server_delay = server_retry_delay(
            &response.headers,
            &text,
            Duration::from_millis(relay.config.retry.server_delay_max_ms),
        );
        return Err(AttemptFailure {
            permission_denied: is_permission_denied(status, &text),
            server_delay,
            delivered: 0,
            error: RelayError::Upstream {
                status,
                message: truncate_utf8(&text, ERROR_MESSAGE_MAX_BYTES).to_string(),
            },
        });
    }

    let stream_config = &relay.config.stream;
    let tracker = ToolCallTracker::new(
        relay.state.signatures.clone(),
        session_id.map(str::to_string),
    );
    let mut decoder = StreamDecoder::new(stream_config, tracker);
    let tick_every = Duration::from_millis(
        stream_config
            .text_max_latency_ms
            .min(stream_config.liveness_interval_ms),
    );

    match drive_stream(response.body, &mut decoder, sink, cancel, tick_every).await {
        Ok(_) => Ok(decoder.summary()),
        Err(StreamFailure { delivered, error }) => {
            let error = if delivered == 0 && !error.is_cancelled() {
                match error {
                    RelayError::Transport(_) => error,
                    other => RelayError::Transport(other.to_string()),
                }
            } else {
                error
            };
            Err(AttemptFailure {
                error,
                server_delay: None,
                delivered,
                permission_denied: false,
            })
        }
    }
}
