//! External toxicity scoring collaborator
//!
//! The pipeline only needs a score in [0, 1] for a piece of text. The HTTP
//! implementation posts to a configured endpoint; tests swap in a static
//! scorer. Failures are surfaced to the caller so the circuit breaker can
//! count them.

use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use std::time::Duration;

/// Scoring collaborator. Object-safe so `AppState` can hold any impl.
pub trait ToxicityScorer: Send + Sync {
    fn score<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<f64>>;
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: f64,
}

/// Scores text against a remote HTTP endpoint.
pub struct HttpScorer {
    client: reqwest::Client,
    url: String,
}

impl HttpScorer {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

impl ToxicityScorer for HttpScorer {
    fn score<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(&self.url)
                .json(&serde_json::json!({ "text": text }))
                .timeout(Duration::from_secs(10))
                .send()
                .await?;

            if !resp.status().is_success() {
                return Err(anyhow!("scorer returned status {}", resp.status()));
            }

            let body: ScoreResponse = resp.json().await?;
            Ok(body.score.clamp(0.0, 1.0))
        })
    }
}

/// Fixed-score scorer for tests; can also simulate outages.
pub struct StaticScorer {
    pub score: f64,
    pub failing: std::sync::atomic::AtomicBool,
}

impl StaticScorer {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            failing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

impl ToxicityScorer for StaticScorer {
    fn score<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                Err(anyhow!("scorer unavailable"))
            } else {
                Ok(self.score)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_scorer() {
        let scorer = StaticScorer::new(0.7);
        assert_eq!(scorer.score("anything").await.unwrap(), 0.7);

        scorer.set_failing(true);
        assert!(scorer.score("anything").await.is_err());
    }
}
