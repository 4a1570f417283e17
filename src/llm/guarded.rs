use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;

use super::{ChatTurn, LlmClient, StreamError, StreamHandle};

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// Open a streaming generation guarded by the turn token and a wall-clock
/// bound on the provider's first response.
///
/// The caller's wait resolves in the same scheduling quantum as
/// `token.cancel()`, whether or not the provider can abort the underlying
/// request. An orphaned in-flight response is harmless: history is only
/// committed after a clean drain, so its output is discarded by rollback.
pub async fn open_stream(
    llm: &dyn LlmClient,
    history: &[ChatTurn],
    token: &CancellationToken,
    timeout: Duration,
) -> Result<StreamHandle, StreamError> {
    if token.is_cancelled() {
        return Err(StreamError::Cancelled);
    }
    select! {
        biased;
        _ = token.cancelled() => Err(StreamError::Cancelled),
        _ = tokio::time::sleep(timeout) => Err(StreamError::TimedOut(timeout)),
        result = llm.generate_stream(history) => result.map_err(StreamError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmChunk;
    use anyhow::Result;
    use async_trait::async_trait;

    struct StallingLlm;

    #[async_trait]
    impl LlmClient for StallingLlm {
        async fn generate_stream(&self, _history: &[ChatTurn]) -> Result<StreamHandle> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct ReadyLlm;

    #[async_trait]
    impl LlmClient for ReadyLlm {
        async fn generate_stream(&self, _history: &[ChatTurn]) -> Result<StreamHandle> {
            Ok(StreamHandle::new(Box::pin(futures::stream::iter(vec![
                Ok(LlmChunk {
                    parts: vec![crate::llm::Part::Text {
                        text: "hello".to_string(),
                    }],
                }),
            ]))))
        }
    }

    struct PanickingLlm;

    #[async_trait]
    impl LlmClient for PanickingLlm {
        async fn generate_stream(&self, _history: &[ChatTurn]) -> Result<StreamHandle> {
            panic!("must not be called for a pre-cancelled token");
        }
    }

    #[tokio::test]
    async fn pre_cancelled_token_fails_fast() {
        let token = CancellationToken::new();
        token.cancel();
        let err = open_stream(&PanickingLlm, &[], &token, DEFAULT_STREAM_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_unblocks_the_initial_wait() {
        let token = CancellationToken::new();
        let trip = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.cancel();
        });
        let err = open_stream(&StallingLlm, &[], &token, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(matches!(err, StreamError::Cancelled));
    }

    #[tokio::test]
    async fn stalled_provider_times_out() {
        let token = CancellationToken::new();
        let err = open_stream(&StallingLlm, &[], &token, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::TimedOut(_)));
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn ready_provider_returns_a_handle() {
        let token = CancellationToken::new();
        let handle = open_stream(&ReadyLlm, &[], &token, DEFAULT_STREAM_TIMEOUT)
            .await
            .unwrap();
        let terminal = handle.drain().await.unwrap();
        assert_eq!(terminal.text, "hello");
    }
}
