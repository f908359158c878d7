//! Vitals computation and the availability verdict for one poll result.
//!
//! Everything here is pure: callers pass in the previous sample and the
//! thresholds of the target's profile.

pub mod threshold;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::fetch::SystemStats;
use crate::topology::ServerStatus;

pub use threshold::{Comparator, Threshold};

const AVAILABLE: &str = "available";
const UNAVAILABLE: &str = "unavailable";

/// Health metrics derived from a poll and its predecessor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Vitals {
    /// One-minute load average.
    pub load_average: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub kbps_out: u64,
    pub max_kbps_out: u64,
}

/// A previous vitals computation, with the time its poll was taken.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VitalsSample {
    pub time: DateTime<Utc>,
    pub vitals: Vitals,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VitalsError {
    #[error("cannot read a load average from {0:?}")]
    LoadAverage(String),
    #[error("cannot read interface counters from {0:?}")]
    NetDev(String),
}

/// Compute vitals from the system section of a poll payload.
///
/// `kbps_out` is only computed when a previous sample with nonzero
/// `bytes_out` exists and was taken strictly earlier.
pub fn compute_vitals(
    system: &SystemStats,
    time: DateTime<Utc>,
    previous: Option<&VitalsSample>,
) -> Result<Vitals, VitalsError> {
    let load_average = parse_load_average(&system.proc_loadavg)?;
    let (bytes_in, bytes_out) = parse_net_dev(&system.proc_net_dev)?;

    let mut vitals = Vitals {
        load_average,
        bytes_in,
        bytes_out,
        kbps_out: 0,
        // inf.speed is in Mbps.
        max_kbps_out: system.inf_speed.saturating_mul(1000),
    };

    if let Some(prev) = previous.filter(|p| p.vitals.bytes_out != 0) {
        let elapsed = (time - prev.time).num_milliseconds();
        if elapsed > 0 {
            match bytes_out.checked_sub(prev.vitals.bytes_out) {
                Some(delta) => {
                    let kbits = (delta.saturating_mul(8) / 1000) as f64;
                    vitals.kbps_out = (kbits / (elapsed as f64 / 1000.0)) as u64;
                }
                None => {
                    debug!(
                        bytes_out,
                        previous = prev.vitals.bytes_out,
                        "interface counter went backwards, skipping kbps"
                    );
                }
            }
        }
    }

    Ok(vitals)
}

/// The first field of a `/proc/loadavg` line, e.g. "0.20 0.07 0.07 1/967 29536".
fn parse_load_average(raw: &str) -> Result<f64, VitalsError> {
    raw.split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| VitalsError::LoadAverage(raw.to_string()))
}

/// Bytes in and out from one `/proc/net/dev` interface line, e.g.
/// "bond0: 8495786321839 31960528603 0 0 0 0 0 2349716 143283576747316 ...".
fn parse_net_dev(raw: &str) -> Result<(u64, u64), VitalsError> {
    let err = || VitalsError::NetDev(raw.to_string());

    let (_, counters) = raw.split_once(':').ok_or_else(err)?;
    let fields: Vec<&str> = counters.split_whitespace().collect();
    if fields.len() < 9 {
        return Err(err());
    }

    let bytes_in = fields[0].parse::<u64>().map_err(|_| err())?;
    let bytes_out = fields[8].parse::<u64>().map_err(|_| err())?;
    Ok((bytes_in, bytes_out))
}

/// Everything the evaluator looks at for one result.
#[derive(Debug, Clone, Copy)]
pub struct EvalInput<'a> {
    pub status: ServerStatus,
    /// Poll, decode, or vitals error, if any.
    pub error: Option<&'a str>,
    /// Raw availability flag reported by the payload.
    pub available: bool,
    pub vitals: &'a Vitals,
    /// Raw stats from the payload, consulted for thresholds on stats that
    /// are not computed from vitals.
    pub stats: &'a BTreeMap<String, serde_json::Value>,
}

/// The outcome of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub available: bool,
    /// "STATUS - message", used for events and status records.
    pub reason: String,
}

impl Verdict {
    fn new(available: bool, status: ServerStatus, message: impl AsRef<str>) -> Self {
        Self {
            available,
            reason: format!("{} - {}", status, message.as_ref()),
        }
    }
}

/// Decide whether a cache is available. First match wins:
/// administrative status, poll error, load average threshold, bandwidth
/// above the interface maximum, remaining profile thresholds, then the raw
/// availability flag from the payload.
pub fn evaluate(input: &EvalInput<'_>, thresholds: &BTreeMap<String, Threshold>) -> Verdict {
    let raw = if input.available { AVAILABLE } else { UNAVAILABLE };

    match input.status {
        ServerStatus::AdminDown | ServerStatus::Offline => {
            return Verdict::new(false, input.status, raw);
        }
        ServerStatus::Online => return Verdict::new(true, input.status, raw),
        ServerStatus::Reported => {}
    }

    if let Some(err) = input.error {
        return Verdict::new(false, input.status, err);
    }

    if let Some(threshold) = thresholds.get(LOAD_AVERAGE) {
        let load = input.vitals.load_average;
        if !threshold.holds(load) {
            return Verdict::new(false, input.status, threshold.violation(LOAD_AVERAGE, load));
        }
    }

    let vitals = input.vitals;
    if vitals.max_kbps_out > 0 && vitals.kbps_out > vitals.max_kbps_out {
        return Verdict::new(
            false,
            input.status,
            format!(
                "bandwidth too high ({} > {} kbps)",
                vitals.kbps_out, vitals.max_kbps_out
            ),
        );
    }

    for (name, threshold) in thresholds.iter().filter(|(n, _)| *n != LOAD_AVERAGE) {
        let Some(value) = stat_value(name, input) else {
            debug!(stat = %name, "threshold stat not present in result, skipping");
            continue;
        };
        if !threshold.holds(value) {
            return Verdict::new(false, input.status, threshold.violation(name, value));
        }
    }

    Verdict::new(input.available, input.status, raw)
}

const LOAD_AVERAGE: &str = "loadavg";

/// Value of a threshold stat: computed from vitals where the name is one
/// of the computed stats, otherwise a numeric raw stat.
fn stat_value(name: &str, input: &EvalInput<'_>) -> Option<f64> {
    let v = input.vitals;
    match name {
        LOAD_AVERAGE => Some(v.load_average),
        "bandwidth" | "kbps" => Some(v.kbps_out as f64),
        "maxKbps" => Some(v.max_kbps_out as f64),
        "availableBandwidthInKbps" => Some(v.max_kbps_out.saturating_sub(v.kbps_out) as f64),
        _ => input.stats.get(name).and_then(|raw| match raw {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn system(bytes_out: u64) -> SystemStats {
        SystemStats {
            proc_loadavg: "0.30 0.12 0.21 1/863 1234".to_string(),
            proc_net_dev: format!(
                "eth0: 47907832129 14601260 0 0 0 0 0 790726 {bytes_out} 10210700052 0 0 0 0 0 0"
            ),
            inf_name: "eth0".to_string(),
            inf_speed: 10_000,
            not_available: false,
        }
    }

    fn reported<'a>(
        vitals: &'a Vitals,
        stats: &'a BTreeMap<String, serde_json::Value>,
    ) -> EvalInput<'a> {
        EvalInput {
            status: ServerStatus::Reported,
            error: None,
            available: true,
            vitals,
            stats,
        }
    }

    #[test]
    fn test_compute_vitals_first_sample() {
        let now = Utc::now();
        let vitals = compute_vitals(&system(1_000_000), now, None).expect("should compute");
        assert_eq!(vitals.load_average, 0.30);
        assert_eq!(vitals.bytes_in, 47_907_832_129);
        assert_eq!(vitals.bytes_out, 1_000_000);
        assert_eq!(vitals.kbps_out, 0);
        assert_eq!(vitals.max_kbps_out, 10_000_000);
    }

    #[test]
    fn test_compute_vitals_kbps_from_previous() {
        let t0 = Utc::now();
        let first = compute_vitals(&system(1_000_000), t0, None).expect("should compute");
        let prev = VitalsSample {
            time: t0,
            vitals: first,
        };

        // 2,000,000 bytes in 2 seconds = 16,000 kbits / 2s = 8,000 kbps.
        let t1 = t0 + Duration::seconds(2);
        let second = compute_vitals(&system(3_000_000), t1, Some(&prev)).expect("should compute");
        assert_eq!(second.kbps_out, 8_000);
    }

    #[test]
    fn test_compute_vitals_skips_kbps_without_usable_previous() {
        let t0 = Utc::now();
        let zero = VitalsSample {
            time: t0,
            vitals: Vitals::default(),
        };
        let v = compute_vitals(&system(5_000), t0 + Duration::seconds(1), Some(&zero))
            .expect("should compute");
        assert_eq!(v.kbps_out, 0);

        // Same timestamp.
        let same = VitalsSample {
            time: t0,
            vitals: Vitals {
                bytes_out: 1,
                ..Vitals::default()
            },
        };
        let v = compute_vitals(&system(5_000), t0, Some(&same)).expect("should compute");
        assert_eq!(v.kbps_out, 0);

        // Counter reset.
        let higher = VitalsSample {
            time: t0,
            vitals: Vitals {
                bytes_out: 10_000,
                ..Vitals::default()
            },
        };
        let v = compute_vitals(&system(5_000), t0 + Duration::seconds(1), Some(&higher))
            .expect("should compute");
        assert_eq!(v.kbps_out, 0);
    }

    #[test]
    fn test_compute_vitals_malformed_fields() {
        let now = Utc::now();

        let mut bad_load = system(1);
        bad_load.proc_loadavg = "abc 0.1".to_string();
        assert!(matches!(
            compute_vitals(&bad_load, now, None),
            Err(VitalsError::LoadAverage(_))
        ));

        let mut empty_load = system(1);
        empty_load.proc_loadavg = String::new();
        assert!(matches!(
            compute_vitals(&empty_load, now, None),
            Err(VitalsError::LoadAverage(_))
        ));

        let mut no_colon = system(1);
        no_colon.proc_net_dev = "eth0 1 2 3".to_string();
        assert!(matches!(
            compute_vitals(&no_colon, now, None),
            Err(VitalsError::NetDev(_))
        ));

        let mut short = system(1);
        short.proc_net_dev = "eth0: 1 2 3".to_string();
        assert!(matches!(
            compute_vitals(&short, now, None),
            Err(VitalsError::NetDev(_))
        ));
    }

    #[test]
    fn test_evaluate_status_overrides() {
        let vitals = Vitals::default();
        let stats = BTreeMap::new();
        let mut input = reported(&vitals, &stats);
        input.error = Some("connection refused");

        input.status = ServerStatus::AdminDown;
        assert!(!evaluate(&input, &BTreeMap::new()).available);

        input.status = ServerStatus::Offline;
        assert!(!evaluate(&input, &BTreeMap::new()).available);

        input.status = ServerStatus::Online;
        let verdict = evaluate(&input, &BTreeMap::new());
        assert!(verdict.available);
        assert_eq!(verdict.reason, "ONLINE - available");
    }

    #[test]
    fn test_evaluate_error_before_thresholds() {
        let vitals = Vitals {
            load_average: 99.0,
            ..Vitals::default()
        };
        let stats = BTreeMap::new();
        let mut input = reported(&vitals, &stats);
        input.error = Some("request timed out");

        let thresholds = BTreeMap::from([(
            "loadavg".to_string(),
            Threshold {
                comparator: Comparator::Lt,
                value: 25.0,
            },
        )]);
        let verdict = evaluate(&input, &thresholds);
        assert!(!verdict.available);
        assert_eq!(verdict.reason, "REPORTED - request timed out");
    }

    #[test]
    fn test_evaluate_load_average_threshold() {
        let vitals = Vitals {
            load_average: 30.0,
            ..Vitals::default()
        };
        let stats = BTreeMap::new();
        let input = reported(&vitals, &stats);
        let thresholds = BTreeMap::from([(
            "loadavg".to_string(),
            Threshold {
                comparator: Comparator::Lt,
                value: 25.0,
            },
        )]);

        let verdict = evaluate(&input, &thresholds);
        assert!(!verdict.available);
        assert_eq!(verdict.reason, "REPORTED - loadavg too high (30.00 > 25.00)");
    }

    #[test]
    fn test_evaluate_bandwidth_over_max() {
        let vitals = Vitals {
            kbps_out: 2_000,
            max_kbps_out: 1_000,
            ..Vitals::default()
        };
        let stats = BTreeMap::new();
        let verdict = evaluate(&reported(&vitals, &stats), &BTreeMap::new());
        assert!(!verdict.available);
        assert!(verdict.reason.contains("bandwidth too high"));
    }

    #[test]
    fn test_evaluate_other_thresholds() {
        let vitals = Vitals {
            kbps_out: 900,
            max_kbps_out: 1_000,
            ..Vitals::default()
        };
        let stats = BTreeMap::from([(
            "proxy.process.http.current_client_connections".to_string(),
            serde_json::json!(5000),
        )]);
        let input = reported(&vitals, &stats);

        let thresholds = BTreeMap::from([(
            "availableBandwidthInKbps".to_string(),
            Threshold {
                comparator: Comparator::Gt,
                value: 500.0,
            },
        )]);
        let verdict = evaluate(&input, &thresholds);
        assert!(!verdict.available);
        assert!(verdict.reason.contains("availableBandwidthInKbps too low"));

        let thresholds = BTreeMap::from([(
            "proxy.process.http.current_client_connections".to_string(),
            Threshold {
                comparator: Comparator::Lt,
                value: 10_000.0,
            },
        )]);
        assert!(evaluate(&input, &thresholds).available);
    }

    #[test]
    fn test_evaluate_falls_back_to_raw_flag() {
        let vitals = Vitals::default();
        let stats = BTreeMap::new();
        let mut input = reported(&vitals, &stats);

        let verdict = evaluate(&input, &BTreeMap::new());
        assert!(verdict.available);
        assert_eq!(verdict.reason, "REPORTED - available");

        input.available = false;
        let verdict = evaluate(&input, &BTreeMap::new());
        assert!(!verdict.available);
        assert_eq!(verdict.reason, "REPORTED - unavailable");
    }
}
