use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{HistoryItem, ModelError, ModelProvider, ModelReply};

/// Bounded retry with random exponential backoff for transient model
/// failures.
///
/// The wait before retry `n` (1-based) is drawn uniformly from
/// `[min, clamp(multiplier * 2^(n-1), min, max)]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub min_backoff_secs: f64,
    pub max_backoff_secs: f64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            min_backoff_secs: 60.0,
            max_backoff_secs: 180.0,
            multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            min_backoff_secs: 0.0,
            max_backoff_secs: 0.0,
            multiplier: 0.0,
        }
    }

    /// Saturates at `Duration::MAX`; NaN bounds count as zero.
    pub fn backoff(&self, retry: u32) -> Duration {
        let min = finite_or(self.min_backoff_secs, 0.0).clamp(0.0, SATURATED_SECS);
        let max = finite_or(self.max_backoff_secs, SATURATED_SECS).clamp(min, SATURATED_SECS);
        let exp = finite_or(self.multiplier * 2f64.powi(retry.saturating_sub(1).min(62) as i32), max);
        let high = exp.clamp(min, max);
        let secs = if high > min {
            rand::thread_rng().gen_range(min..=high)
        } else {
            min
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Past `Duration::MAX` in seconds.
const SATURATED_SECS: f64 = u64::MAX as f64;

fn finite_or(value: f64, fallback: f64) -> f64 {
    match value {
        v if v.is_nan() => 0.0,
        v if v.is_infinite() => fallback,
        v => v,
    }
}

/// Call `model`, retrying transient failures under `policy`.
///
/// Returns the reply and the number of attempts used. Fatal and
/// context-window errors surface immediately; a transient error is
/// returned only once attempts are exhausted.
pub async fn call_with_retry(
    model: &dyn ModelProvider,
    history: &[HistoryItem],
    policy: &RetryPolicy,
) -> Result<(ModelReply, u32), ModelError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match model.send(history).await {
            Ok(reply) => return Ok((reply, attempt)),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let wait = policy.backoff(attempt);
                tracing::warn!(
                    model = model.name(),
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "transient model error, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => {
                tracing::error!(model = model.name(), attempt, error = %err, "model call failed");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Flaky {
        script: Mutex<Vec<Result<ModelReply, ModelError>>>,
        calls: Mutex<u32>,
    }

    impl Flaky {
        fn new(mut script: Vec<Result<ModelReply, ModelError>>) -> Self {
            script.reverse();
            Self { script: Mutex::new(script), calls: Mutex::new(0) }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ModelProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _history: &[HistoryItem]) -> Result<ModelReply, ModelError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ModelError::Fatal("script exhausted".into())))
        }
    }

    fn ok() -> Result<ModelReply, ModelError> {
        Ok(ModelReply { text: "submit".into(), cost: Some(0.01), input_tokens: 1, output_tokens: 1 })
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_backoff_secs: 0.001,
            max_backoff_secs: 0.005,
            multiplier: 0.001,
        }
    }

    #[test]
    fn default_backoff_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for retry in 1..10 {
            let wait = policy.backoff(retry);
            assert!(wait >= Duration::from_secs(60));
            assert!(wait <= Duration::from_secs(180));
        }
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let policy = RetryPolicy {
            max_attempts: 10,
            min_backoff_secs: 1.0,
            max_backoff_secs: 1000.0,
            multiplier: 1.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        let wait = policy.backoff(5);
        assert!(wait >= Duration::from_secs(1) && wait <= Duration::from_secs(16));
    }

    #[test]
    fn backoff_saturates_on_unbounded_policy() {
        let policy = RetryPolicy {
            max_attempts: 3,
            min_backoff_secs: 0.0,
            max_backoff_secs: f64::INFINITY,
            multiplier: 1e300,
        };
        assert!(policy.backoff(2) > Duration::from_secs(1));
        assert_eq!(RetryPolicy { min_backoff_secs: 1e300, ..policy.clone() }.backoff(1), Duration::MAX);

        let nan = RetryPolicy { multiplier: f64::NAN, max_backoff_secs: f64::NAN, ..policy };
        assert_eq!(nan.backoff(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let model = Flaky::new(vec![
            Err(ModelError::Transient("429".into())),
            Err(ModelError::Transient("503".into())),
            ok(),
        ]);
        let (reply, attempts) = call_with_retry(&model, &[], &fast(5)).await.unwrap();
        assert_eq!(reply.text, "submit");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_transient() {
        let model = Flaky::new(vec![
            Err(ModelError::Transient("a".into())),
            Err(ModelError::Transient("b".into())),
            ok(),
        ]);
        let err = call_with_retry(&model, &[], &fast(2)).await.unwrap_err();
        assert!(matches!(err, ModelError::Transient(ref m) if m == "b"));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let model = Flaky::new(vec![Err(ModelError::ContextWindowExceeded("too long".into())), ok()]);
        let err = call_with_retry(&model, &[], &fast(5)).await.unwrap_err();
        assert!(matches!(err, ModelError::ContextWindowExceeded(_)));
        assert_eq!(model.calls(), 1);
    }
}
