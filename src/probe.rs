//! Reachability and latency measurement of a single candidate.

use crate::types::{Candidate, ProbeResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_TARGET_URL: &str = "http://www.gstatic.com/generate_204";

/// Measures one candidate. Never fails: every failure mode is a `Failure` result.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, candidate: &Candidate) -> ProbeResult;
}

/// Fetches a fixed no-content endpoint through the candidate acting as a proxy.
///
/// The probe succeeds only on `204 No Content` with an empty body.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    target: String,
    timeout: Duration,
    max_delay_ms: u64,
}

impl HttpProbe {
    pub fn new(target: impl Into<String>, timeout: Duration, max_delay_ms: u64) -> Self {
        Self {
            target: target.into(),
            timeout,
            max_delay_ms,
        }
    }

    fn client_for(&self, candidate: &Candidate) -> Result<reqwest::Client, reqwest::Error> {
        let proxy = reqwest::Proxy::all(candidate.as_str())?;
        reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
    }

    /// Elapsed time worth recording on a failure; dropped past the delay ceiling.
    fn bounded_delay(&self, delay_ms: u64) -> Option<u64> {
        (delay_ms <= self.max_delay_ms).then_some(delay_ms)
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, candidate: &Candidate) -> ProbeResult {
        let client = match self.client_for(candidate) {
            Ok(client) => client,
            Err(e) => {
                return ProbeResult::failure(
                    candidate.clone(),
                    None,
                    format!("invalid proxy address: {}", describe(&e)),
                )
            }
        };

        let started = Instant::now();
        let response = match client.get(&self.target).send().await {
            Ok(response) => response,
            Err(e) => {
                let delay_ms = elapsed_ms(started);
                debug!("Probe through {} failed after {}ms: {}", candidate, delay_ms, e);
                return ProbeResult::failure(candidate.clone(), self.bounded_delay(delay_ms), describe(&e));
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let delay_ms = elapsed_ms(started);
                return ProbeResult::failure(candidate.clone(), self.bounded_delay(delay_ms), describe(&e));
            }
        };
        let delay_ms = elapsed_ms(started);

        if status == StatusCode::NO_CONTENT && body.is_empty() {
            debug!("Probe through {} succeeded in {}ms", candidate, delay_ms);
            ProbeResult::success(candidate.clone(), delay_ms)
        } else {
            ProbeResult::failure(
                candidate.clone(),
                None,
                format!(
                    "unexpected response: status {}, body length {}",
                    status.as_u16(),
                    body.len()
                ),
            )
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Render an error with its chain of causes, e.g. "error sending request: connection refused".
fn describe(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
