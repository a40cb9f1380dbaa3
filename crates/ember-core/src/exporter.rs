//! Exporter snapshot sources.
//!
//! A snapshot maps every reporting container to one reading plus a unit
//! tag. The sampler does not care how the snapshot was produced.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use ember_types::ContainerKey;

use crate::error::ExporterError;

/// Metric name prefix of Kepler's per-container energy counters.
const KEPLER_METRIC_PREFIX: &str = "kepler_container_joules";

/// What a reading's value measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingUnit {
    /// Instantaneous power in watts.
    JoulesPerSecond,
    /// Monotonic energy counter in joules.
    CumulativeJoules,
}

/// One container's value in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Raw value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: ReadingUnit,
}

impl Reading {
    /// A power reading in watts.
    pub const fn rate(value: f64) -> Self {
        Self {
            value,
            unit: ReadingUnit::JoulesPerSecond,
        }
    }

    /// A cumulative energy counter reading in joules.
    pub const fn counter(value: f64) -> Self {
        Self {
            value,
            unit: ReadingUnit::CumulativeJoules,
        }
    }
}

/// Point-in-time readings for every reporting container.
#[derive(Debug, Clone, PartialEq)]
pub struct ExporterSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Readings by container.
    pub readings: BTreeMap<ContainerKey, Reading>,
}

// ---------------------------------------------------------------------------
// Source enum
// ---------------------------------------------------------------------------

/// A source of exporter snapshots.
///
/// Uses enum dispatch instead of trait objects because async methods
/// are not dyn-compatible.
#[derive(Debug)]
pub enum ExporterSource {
    /// Kepler's Prometheus endpoint.
    Kepler(KeplerExporter),
    /// Pre-recorded snapshots, for dry runs and tests.
    Scripted(ScriptedExporter),
}

impl ExporterSource {
    /// Pull one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError`] if the exporter is unreachable or its
    /// response cannot be read.
    pub async fn snapshot(&self) -> Result<ExporterSnapshot, ExporterError> {
        match self {
            Self::Kepler(exporter) => exporter.snapshot().await,
            Self::Scripted(exporter) => exporter.snapshot(),
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Kepler(_) => "kepler",
            Self::Scripted(_) => "scripted",
        }
    }
}

// ---------------------------------------------------------------------------
// Kepler
// ---------------------------------------------------------------------------

/// Scrapes Kepler's Prometheus text endpoint.
///
/// Samples of `kepler_container_joules*` with `mode="dynamic"` are summed
/// per `(pod_name, container_name, container_namespace)` into a
/// cumulative-joules reading.
#[derive(Debug)]
pub struct KeplerExporter {
    client: reqwest::Client,
    url: String,
}

impl KeplerExporter {
    /// Create a client for the given metrics URL.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::Unavailable`] if the HTTP client cannot be
    /// built.
    pub fn new(url: &str, timeout: std::time::Duration) -> Result<Self, ExporterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExporterError::Unavailable(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }

    async fn snapshot(&self) -> Result<ExporterSnapshot, ExporterError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ExporterError::Unavailable(format!("request to {} failed: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExporterError::Unavailable(format!(
                "{} returned {status}",
                self.url
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ExporterError::Parse(format!("body read failed: {e}")))?;
        let taken_at = Utc::now();

        let readings = parse_kepler_metrics(&body)
            .into_iter()
            .map(|(key, joules)| (key, Reading::counter(joules)))
            .collect();
        Ok(ExporterSnapshot { taken_at, readings })
    }
}

/// Sum Kepler dynamic-energy counters per container.
///
/// Lines that are comments, other metrics, non-dynamic modes, or lack a
/// pod or container label are skipped.
pub fn parse_kepler_metrics(body: &str) -> BTreeMap<ContainerKey, f64> {
    let mut totals: BTreeMap<ContainerKey, f64> = BTreeMap::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(sample) = parse_sample(line) else {
            continue;
        };
        if !sample.name.starts_with(KEPLER_METRIC_PREFIX) {
            continue;
        }
        if sample.label("mode") != Some("dynamic") {
            continue;
        }
        let (Some(pod), Some(container)) =
            (sample.label("pod_name"), sample.label("container_name"))
        else {
            continue;
        };
        if pod.is_empty() || container.is_empty() || !sample.value.is_finite() {
            continue;
        }
        let namespace = sample.label("container_namespace").unwrap_or_default();
        let entry = totals
            .entry(ContainerKey::new(pod, container, namespace))
            .or_insert(0.0);
        *entry += sample.value;
    }
    totals
}

/// One parsed exposition-format sample.
#[derive(Debug)]
struct Sample<'a> {
    name: &'a str,
    labels: Vec<(&'a str, String)>,
    value: f64,
}

impl Sample<'_> {
    fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse `name{k="v",...} value [timestamp]`.
fn parse_sample(line: &str) -> Option<Sample<'_>> {
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace())?;
    let (name, rest) = line.split_at(name_end);
    let (labels, rest) = match rest.strip_prefix('{') {
        Some(inner) => parse_labels(inner)?,
        None => (Vec::new(), rest),
    };
    let value = rest.split_whitespace().next()?.parse().ok()?;
    Some(Sample {
        name,
        labels,
        value,
    })
}

/// Parse a label set after the opening brace; returns labels and the text
/// following the closing brace.
fn parse_labels(mut input: &str) -> Option<(Vec<(&str, String)>, &str)> {
    let mut labels = Vec::new();
    loop {
        input = input.trim_start_matches([' ', ',']);
        if let Some(rest) = input.strip_prefix('}') {
            return Some((labels, rest));
        }
        let eq = input.find('=')?;
        let (key, rest) = input.split_at(eq);
        let rest = rest.strip_prefix("=\"")?;

        let mut value = String::new();
        let mut chars = rest.char_indices();
        let consumed = loop {
            let (idx, c) = chars.next()?;
            match c {
                '"' => break idx,
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                other => value.push(other),
            }
        };
        labels.push((key.trim(), value));
        input = rest.get(consumed.checked_add(1)?..)?;
    }
}

// ---------------------------------------------------------------------------
// Scripted
// ---------------------------------------------------------------------------

/// Replays queued snapshots, then optionally a fixed set of readings.
///
/// Queued frames are returned in order. Once they run out, the fallback
/// readings (if any) are returned stamped with the current time;
/// otherwise the exporter reports itself unavailable.
#[derive(Debug, Default)]
pub struct ScriptedExporter {
    frames: Mutex<VecDeque<Result<ExporterSnapshot, String>>>,
    fallback: Option<BTreeMap<ContainerKey, Reading>>,
}

impl ScriptedExporter {
    /// An exporter with nothing queued and no fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// An exporter that always reports the given readings.
    pub fn constant(readings: BTreeMap<ContainerKey, Reading>) -> Self {
        Self {
            frames: Mutex::default(),
            fallback: Some(readings),
        }
    }

    /// Queue a snapshot.
    pub fn push(&self, snapshot: ExporterSnapshot) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(snapshot));
    }

    /// Queue a failed poll.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(message.into()));
    }

    fn snapshot(&self) -> Result<ExporterSnapshot, ExporterError> {
        let next = self
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match (next, &self.fallback) {
            (Some(frame), _) => frame.map_err(ExporterError::Unavailable),
            (None, Some(readings)) => Ok(ExporterSnapshot {
                taken_at: Utc::now(),
                readings: readings.clone(),
            }),
            (None, None) => Err(ExporterError::Unavailable(String::from(
                "scripted exporter has no frames left",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::float_cmp)]

    use super::*;

    const KEPLER_BODY: &str = r#"
# HELP kepler_container_joules_total Aggregated RAPL value in joules
# TYPE kepler_container_joules_total counter
kepler_container_joules_total{container_id="a1",container_name="server",container_namespace="prod",mode="dynamic",pod_name="api-0"} 1500.5
kepler_container_joules_total{container_id="a1",container_name="server",container_namespace="prod",mode="idle",pod_name="api-0"} 9999
kepler_container_joules_total{container_id="a2",container_name="server",container_namespace="prod",mode="dynamic",pod_name="api-0"} 499.5
kepler_container_joules_total{container_id="b1",container_name="",container_namespace="prod",mode="dynamic",pod_name="api-0"} 10
kepler_container_core_joules_total{container_name="server",container_namespace="prod",mode="dynamic",pod_name="api-0"} 77
kepler_container_joules_total{container_name="worker",container_namespace="batch",mode="dynamic",pod_name="job-\"x\""} 42 1700000000000
"#;

    #[test]
    fn kepler_dynamic_samples_are_summed_per_container() {
        let totals = parse_kepler_metrics(KEPLER_BODY);
        assert_eq!(totals.len(), 2);
        assert_eq!(
            totals.get(&ContainerKey::new("api-0", "server", "prod")),
            Some(&2000.0)
        );
        assert_eq!(
            totals.get(&ContainerKey::new("job-\"x\"", "worker", "batch")),
            Some(&42.0)
        );
    }

    #[test]
    fn unparseable_lines_are_skipped() {
        let totals = parse_kepler_metrics("kepler_container_joules_total{pod_name=\"p\" 12\ngarbage\n");
        assert!(totals.is_empty());
    }

    #[tokio::test]
    async fn scripted_exporter_replays_then_fails() {
        let scripted = ScriptedExporter::new();
        scripted.push(ExporterSnapshot {
            taken_at: Utc::now(),
            readings: BTreeMap::new(),
        });
        scripted.push_failure("connection refused");
        let source = ExporterSource::Scripted(scripted);

        assert!(source.snapshot().await.is_ok());
        assert!(matches!(
            source.snapshot().await,
            Err(ExporterError::Unavailable(msg)) if msg == "connection refused"
        ));
        assert!(source.snapshot().await.is_err());
    }
}
