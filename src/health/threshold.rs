use std::fmt;

use serde::{Deserialize, Serialize};

/// How a stat value is compared against a threshold value. The threshold
/// holds when `stat <comparator> value` is true.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
}

impl Comparator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A health threshold from a server profile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub comparator: Comparator,
    pub value: f64,
}

impl Threshold {
    /// Whether `stat` satisfies the threshold.
    pub fn holds(&self, stat: f64) -> bool {
        match self.comparator {
            Comparator::Eq => (stat - self.value).abs() < f64::EPSILON,
            Comparator::Gt => stat > self.value,
            Comparator::Lt => stat < self.value,
            Comparator::Ge => stat >= self.value,
            Comparator::Le => stat <= self.value,
        }
    }

    /// Human readable description of a violation, e.g.
    /// `loadavg too high (30.00 > 25.00)`.
    pub fn violation(&self, name: &str, stat: f64) -> String {
        let (what, op) = match self.comparator {
            Comparator::Eq => ("not equal", "!="),
            Comparator::Gt => ("too low", "<"),
            Comparator::Lt => ("too high", ">"),
            Comparator::Ge => ("too low", "<="),
            Comparator::Le => ("too high", ">="),
        };
        format!("{name} {what} ({stat:.2} {op} {:.2})", self.value)
    }
}
