use chrono::{DateTime, Local, NaiveDateTime, SubsecRound, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

/// A relay address under evaluation, e.g. `http://10.0.0.1:8080`.
///
/// Kept opaque: nothing is validated until the address is used for a probe.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Candidate(String);

impl Candidate {
    pub fn new(address: impl Into<String>) -> Self {
        Candidate(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Candidate {
    fn from(address: &str) -> Self {
        Candidate::new(address)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failure,
}

/// The result of probing one candidate in one cycle.
///
/// Construct through [`ProbeResult::success`] and [`ProbeResult::failure`]: a
/// success always carries a delay and never an error, a failure always carries
/// an error. Records read back from disk are held to the same rule.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(try_from = "RawProbeResult")]
pub struct ProbeResult {
    #[serde(rename = "url")]
    pub candidate: Candidate,
    #[serde(rename = "status")]
    pub outcome: Outcome,
    #[serde(rename = "delay")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "timestamp", with = "epoch_seconds")]
    pub observed_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn success(candidate: Candidate, delay_ms: u64) -> Self {
        ProbeResult {
            candidate,
            outcome: Outcome::Success,
            delay_ms: Some(delay_ms),
            error: None,
            observed_at: now_millis(),
        }
    }

    pub fn failure(candidate: Candidate, delay_ms: Option<u64>, error: impl Into<String>) -> Self {
        ProbeResult {
            candidate,
            outcome: Outcome::Failure,
            delay_ms,
            error: Some(error.into()),
            observed_at: now_millis(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// A result as found on disk, before the outcome rules are checked.
#[derive(Deserialize)]
struct RawProbeResult {
    url: Candidate,
    status: Outcome,
    #[serde(default)]
    delay: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(with = "epoch_seconds")]
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawProbeResult> for ProbeResult {
    type Error = String;

    fn try_from(raw: RawProbeResult) -> Result<Self, Self::Error> {
        match (raw.status, raw.delay, &raw.error) {
            (Outcome::Success, None, _) => {
                return Err(format!("successful result for {} has no delay", raw.url))
            }
            (Outcome::Success, _, Some(_)) => {
                return Err(format!("successful result for {} carries an error", raw.url))
            }
            (Outcome::Failure, _, None) => {
                return Err(format!("failed result for {} has no error", raw.url))
            }
            _ => {}
        }
        Ok(ProbeResult {
            candidate: raw.url,
            outcome: raw.status,
            delay_ms: raw.delay,
            error: raw.error,
            observed_at: raw.timestamp,
        })
    }
}

/// Everything published for one scheduler cycle. Replaces the previous one whole.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Snapshot {
    #[serde(with = "wall_clock")]
    pub last_update: NaiveDateTime,
    #[serde(rename = "best_proxy")]
    pub best: Option<ProbeResult>,
    #[serde(rename = "all_results")]
    pub results: Vec<ProbeResult>,
}

impl Snapshot {
    pub fn new(results: Vec<ProbeResult>, best: Option<ProbeResult>, now: DateTime<Local>) -> Self {
        Snapshot {
            last_update: now.naive_local().trunc_subsecs(0),
            best,
            results,
        }
    }
}

pub type GenericBoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

// The record stores epoch seconds with a millisecond fraction, so anything
// finer would not survive a publish/read round trip.
fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

mod epoch_seconds {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(at.timestamp_millis() as f64 / 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        let millis = (seconds * 1000.0).round() as i64;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", seconds)))
    }
}

mod wall_clock {
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(at: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&at.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(de::Error::custom)
    }
}
