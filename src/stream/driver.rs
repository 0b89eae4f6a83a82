use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::stream::{StreamDecoder, StreamEvent};
use crate::transport::ByteStream;

const MIN_TICK: Duration = Duration::from_millis(10);

/// A stream that ended in failure, with the number of events the consumer
/// had already received.
#[derive(Debug)]
pub struct StreamFailure {
    pub delivered: usize,
    pub error: RelayError,
}

/// Read `body` to completion through `decoder`, delivering events to `sink`.
///
/// The reader, the buffering timer and cancellation share one `select!`
/// loop. Returns the number of events delivered.
///
/// # Errors
///
/// Returns [`StreamFailure`] when the body errors, the consumer goes away, or
/// `cancel` fires.
pub async fn drive_stream(
    mut body: ByteStream,
    decoder: &mut StreamDecoder,
    sink: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    tick_every: Duration,
) -> Result<usize, StreamFailure> {
    let started = Instant::now();
    let tick_every = tick_every.max(MIN_TICK);
    let mut ticker = tokio::time::interval_at(started + tick_every, tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending = Vec::with_capacity(8);
    let mut delivered = 0usize;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(StreamFailure { delivered, error: RelayError::Cancelled });
            }
            next = body.next() => match next {
                Some(Ok(bytes)) => decoder.feed(&bytes, started.elapsed(), &mut pending),
                Some(Err(body_error)) => {
                    if delivered > 0 {
                        decoder.finish(started.elapsed(), &mut pending);
                        delivered += deliver_or_fail(&mut pending, sink, cancel, delivered).await?;
                    }
                    tracing::debug!(delivered, error = %body_error, "upstream body failed mid-stream");
                    return Err(StreamFailure { delivered, error: body_error });
                }
                None => {
                    decoder.finish(started.elapsed(), &mut pending);
                    delivered += deliver_or_fail(&mut pending, sink, cancel, delivered).await?;
                    return Ok(delivered);
                }
            },
            _ = ticker.tick() => decoder.tick(started.elapsed(), &mut pending),
        }

        delivered += deliver_or_fail(&mut pending, sink, cancel, delivered).await?;

        if decoder.is_done() {
            decoder.finish(started.elapsed(), &mut pending);
            delivered += deliver_or_fail(&mut pending, sink, cancel, delivered).await?;
            return Ok(delivered);
        }
    }
}

async fn deliver_or_fail(
    pending: &mut Vec<StreamEvent>,
    sink: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    delivered: usize,
) -> Result<usize, StreamFailure> {
    deliver(pending, sink, cancel)
        .await
        .map_err(|error| StreamFailure { delivered, error })
}

async fn deliver(
    pending: &mut Vec<StreamEvent>,
    sink: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<usize, RelayError> {
    let mut sent = 0usize;
    for event in pending.drain(..) {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RelayError::Cancelled),
            result = sink.send(event) => {
                if result.is_err() {
                    tracing::debug!("event consumer dropped; stopping stream");
                    return Err(RelayError::Cancelled);
                }
                sent += 1;
            }
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::fc::signature_cache::SignatureCache;
    use crate::fc::tracker::ToolCallTracker;
    use bytes::Bytes;
    use std::sync::Arc;

    fn decoder() -> StreamDecoder {
        let tracker = ToolCallTracker::new(Arc::new(SignatureCache::new()), None);
        StreamDecoder::new(&StreamConfig::default(), tracker)
    }

    fn body(chunks: Vec<Result<Bytes, RelayError>>) -> ByteStream {
        Box::pin(futures_util::stream::iter(chunks))
    }

    const CHUNK: &str = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}\n\n";

    #[tokio::test]
    async fn test_drives_body_to_completion() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let mut decoder = decoder();
        let delivered = drive_stream(
            body(vec![Ok(Bytes::from_static(CHUNK.as_bytes()))]),
            &mut decoder,
            &tx,
            &cancel,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await, Some(StreamEvent::TextDelta { text: "hi".into() }));
    }

    #[tokio::test]
    async fn test_error_before_delivery_reports_zero() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let mut decoder = decoder();
        let failure = drive_stream(
            body(vec![
                Ok(Bytes::from_static(CHUNK.as_bytes())),
                Err(RelayError::Transport("reset".into())),
            ]),
            &mut decoder,
            &tx,
            &cancel,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(failure.delivered, 0);
        assert!(matches!(failure.error, RelayError::Transport(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_body() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut decoder = decoder();
        let failure = drive_stream(
            Box::pin(futures_util::stream::pending::<Result<Bytes, RelayError>>()),
            &mut decoder,
            &tx,
            &cancel,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(failure.error.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_consumer_is_cancellation() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let cancel = CancellationToken::new();
        let mut decoder = decoder();
        let long = format!(
            "data: {{\"candidates\":[{{\"content\":{{\"parts\":[{{\"text\":\"{}\"}}]}}}}]}}\n\n",
            "x".repeat(64)
        );
        let failure = drive_stream(
            body(vec![Ok(Bytes::from(long))]),
            &mut decoder,
            &tx,
            &cancel,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(failure.error.is_cancelled());
    }
}
