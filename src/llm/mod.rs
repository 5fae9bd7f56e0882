//! Chat-completion providers.

pub mod ollama;
pub mod openai;
pub mod provider;
pub mod service;

pub use provider::{ChatChunkStream, ChatMessage, ChatProvider, LlmParams};
pub use service::LlmService;

use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry a transient upstream call with jittered exponential backoff.
///
/// Only `UpstreamUnavailable` is retried; every other error kind is
/// returned immediately. At most `max_retries` re-attempts.
pub async fn retry_transient<T, F, Fut>(max_retries: u32, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let base_ms = 250u64;
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(Error::UpstreamUnavailable(msg)) if attempt < max_retries => {
                let backoff = base_ms * 2u64.pow(attempt);
                let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                tracing::warn!(attempt, backoff_ms = backoff + jitter, "upstream retry: {msg}");
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_up_to_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::UpstreamUnavailable("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Validation("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(2, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::UpstreamUnavailable("blip".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
