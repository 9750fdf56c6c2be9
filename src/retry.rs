//! Retry-with-backoff decorator for any [`ChatTransport`].

use crate::api::{ByteStream, ChatTransport};
use crate::error::ChatError;
use crate::models::WireMessage;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base, 2*base, 4*base ... capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Wraps a transport and re-issues failed calls whose error
/// [`is_retryable`](ChatError::is_retryable). Only the opening of a stream is
/// retried; once bytes flow the stream is handed over as-is.
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: ChatTransport> RetryingTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<R, F, Fut>(&self, cancel: &CancellationToken, mut call: F) -> Result<R, ChatError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, ChatError>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry + 1 < attempts => {
                    let delay = self.policy.delay_for(retry);
                    log::warn!(
                        "Chat API attempt {}/{} failed: {}. Retrying in {:?}.",
                        retry + 1,
                        attempts,
                        e,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<T: ChatTransport> ChatTransport for RetryingTransport<T> {
    async fn complete(
        &self,
        messages: &[WireMessage],
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        self.run(cancel, || self.inner.complete(messages, cancel)).await
    }

    async fn open_stream(
        &self,
        messages: &[WireMessage],
        cancel: &CancellationToken,
    ) -> Result<ByteStream, ChatError> {
        self.run(cancel, || self.inner.open_stream(messages, cancel)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        calls: AtomicU32,
        results: Mutex<Vec<Result<String, ChatError>>>,
    }

    impl Scripted {
        fn new(mut results: Vec<Result<String, ChatError>>) -> Self {
            results.reverse();
            Self {
                calls: AtomicU32::new(0),
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for Scripted {
        async fn complete(
            &self,
            _messages: &[WireMessage],
            _cancel: &CancellationToken,
        ) -> Result<String, ChatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop().unwrap_or(Err(ChatError::EmptyResponse))
        }

        async fn open_stream(
            &self,
            _messages: &[WireMessage],
            _cancel: &CancellationToken,
        ) -> Result<ByteStream, ChatError> {
            unimplemented!()
        }
    }

    fn hello() -> Vec<WireMessage> {
        vec![WireMessage {
            role: Role::User,
            content: "Hello".into(),
        }]
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let transport = RetryingTransport::new(
            Scripted::new(vec![
                Err(ChatError::Upstream { status: 503, body: "busy".into() }),
                Err(ChatError::Transport("reset".into())),
                Ok("done".into()),
            ]),
            RetryPolicy::default(),
        );
        let out = transport.complete(&hello(), &CancellationToken::new()).await;
        assert_eq!(out.unwrap(), "done");
        assert_eq!(transport.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let transport = RetryingTransport::new(
            Scripted::new(vec![
                Err(ChatError::Timeout(Duration::from_secs(30))),
                Err(ChatError::Timeout(Duration::from_secs(30))),
                Err(ChatError::Timeout(Duration::from_secs(30))),
                Ok("late".into()),
            ]),
            RetryPolicy::default(),
        );
        let out = transport.complete(&hello(), &CancellationToken::new()).await;
        assert!(matches!(out, Err(ChatError::Timeout(d)) if d == Duration::from_secs(30)));
        assert_eq!(transport.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let transport = RetryingTransport::new(
            Scripted::new(vec![Err(ChatError::Upstream { status: 401, body: "nope".into() })]),
            RetryPolicy::default(),
        );
        let out = transport.complete(&hello(), &CancellationToken::new()).await;
        assert!(matches!(out, Err(ChatError::Upstream { status: 401, .. })));
        assert_eq!(transport.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let transport = RetryingTransport::new(
            Scripted::new(vec![Err(ChatError::Transport("reset".into())), Ok("x".into())]),
            RetryPolicy {
                base_delay: Duration::from_secs(3600),
                ..RetryPolicy::default()
            },
        );
        cancel.cancel();
        let out = transport.complete(&hello(), &cancel).await;
        assert!(matches!(out, Err(ChatError::Cancelled)));
    }
}
