use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Generation, GenerationRequest, Generator};
use crate::errors::GenerationError;

/// Retries rate-limited calls with linearly growing backoff.
///
/// Attempt `n` (1-based) that hits a rate limit sleeps `n * backoff` before
/// the next one. Any other error is returned immediately.
pub struct Retrying<G> {
    inner: G,
    max_retries: u32,
    backoff: Duration,
}

impl<G: Generator> Retrying<G> {
    pub fn new(inner: G, max_retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_retries,
            backoff,
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

#[async_trait]
impl<G: Generator> Generator for Retrying<G> {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, GenerationError> {
        let mut attempt = 0;
        loop {
            match self.inner.generate(request.clone()).await {
                Err(e) if e.is_rate_limited() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay(attempt);
                    warn!(attempt, max = self.max_retries, delay_ms = delay.as_millis() as u64, "Rate limited, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<Generation, GenerationError> {
        let mut attempt = 0;
        loop {
            match self.inner.generate_stream(request.clone(), chunks.clone()).await {
                Err(e) if e.is_rate_limited() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay(attempt);
                    warn!(attempt, max = self.max_retries, delay_ms = delay.as_millis() as u64, "Rate limited, retrying stream");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ScriptedGenerator;

    fn req() -> GenerationRequest {
        GenerationRequest::new("sys", vec![])
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retried_then_succeeds() {
        let scripted = ScriptedGenerator::new();
        scripted
            .push_error(GenerationError::RateLimited("429".into()))
            .push_error(GenerationError::RateLimited("429".into()))
            .push_text("ok");
        let retrying = Retrying::new(scripted, 3, Duration::from_millis(1000));

        let started = tokio::time::Instant::now();
        let out = retrying.generate(req()).await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(retrying.inner().requests().len(), 3);
        // 1s + 2s of linear backoff
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let scripted = ScriptedGenerator::new();
        for _ in 0..4 {
            scripted.push_error(GenerationError::RateLimited("429".into()));
        }
        let retrying = Retrying::new(scripted, 3, Duration::from_millis(10));
        let err = retrying.generate(req()).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(retrying.inner().requests().len(), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let scripted = ScriptedGenerator::new();
        scripted
            .push_error(GenerationError::Provider("bad request".into()))
            .push_text("never reached");
        let retrying = Retrying::new(scripted, 3, Duration::from_millis(10));
        let err = retrying.generate(req()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Provider(_)));
        assert_eq!(retrying.inner().requests().len(), 1);
    }
}
