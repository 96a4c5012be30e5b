//! Threshold rules for sensor readings.
//!
//! The catalog is a fixed, ordered table. [`evaluate`] filters it by sensor
//! type and predicate, then orders the matches most severe first; the head
//! of that list is the effective rule that drives alert creation.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::messages::SensorType;

// ---

/// Severity of a rule. Ordering follows severity: `Critical > Warning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Critical,
}

/// Category of alert a rule raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    DroughtAlert,
    HighTemperature,
    LowTemperature,
    HeavyRain,
}

impl AlertType {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::DroughtAlert => "DroughtAlert",
            AlertType::HighTemperature => "HighTemperature",
            AlertType::LowTemperature => "LowTemperature",
            AlertType::HeavyRain => "HeavyRain",
        }
    }

    pub fn parse(s: &str) -> Option<AlertType> {
        // ---
        [
            AlertType::DroughtAlert,
            AlertType::HighTemperature,
            AlertType::LowTemperature,
            AlertType::HeavyRain,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strict comparison of a reading against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Below(Decimal),
    Above(Decimal),
}

impl Bound {
    // ---
    pub fn threshold(&self) -> Decimal {
        match *self {
            Bound::Below(t) | Bound::Above(t) => t,
        }
    }

    pub fn matches(&self, value: Decimal) -> bool {
        match *self {
            Bound::Below(t) => value < t,
            Bound::Above(t) => value > t,
        }
    }
}

/// One entry of the rule catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    // ---
    pub sensor_type: SensorType,
    pub bound: Bound,
    pub severity: Severity,
    pub alert_type: AlertType,
    pub message: &'static str,
}

impl Rule {
    // ---
    pub fn triggers(&self, value: Decimal) -> bool {
        self.bound.matches(value)
    }

    pub fn threshold(&self) -> Decimal {
        self.bound.threshold()
    }
}

const fn whole(n: u32) -> Decimal {
    Decimal::from_parts(n, 0, 0, false, 0)
}

/// The full rule catalog, grouped by sensor and listed critical first.
pub static RULES: [Rule; 7] = [
    Rule {
        sensor_type: SensorType::Humidity,
        bound: Bound::Below(whole(20)),
        severity: Severity::Critical,
        alert_type: AlertType::DroughtAlert,
        message: "Critical drought alert",
    },
    Rule {
        sensor_type: SensorType::Humidity,
        bound: Bound::Below(whole(30)),
        severity: Severity::Warning,
        alert_type: AlertType::DroughtAlert,
        message: "Drought alert",
    },
    Rule {
        sensor_type: SensorType::Temperature,
        bound: Bound::Above(whole(40)),
        severity: Severity::Critical,
        alert_type: AlertType::HighTemperature,
        message: "Critical temperature",
    },
    Rule {
        sensor_type: SensorType::Temperature,
        bound: Bound::Above(whole(35)),
        severity: Severity::Warning,
        alert_type: AlertType::HighTemperature,
        message: "High temperature",
    },
    Rule {
        sensor_type: SensorType::Temperature,
        bound: Bound::Below(whole(5)),
        severity: Severity::Warning,
        alert_type: AlertType::LowTemperature,
        message: "Low temperature",
    },
    Rule {
        sensor_type: SensorType::Rainfall,
        bound: Bound::Above(whole(100)),
        severity: Severity::Critical,
        alert_type: AlertType::HeavyRain,
        message: "Very heavy rain",
    },
    Rule {
        sensor_type: SensorType::Rainfall,
        bound: Bound::Above(whole(50)),
        severity: Severity::Warning,
        alert_type: AlertType::HeavyRain,
        message: "Heavy rain",
    },
];

/// Every rule of `sensor_type` that `value` triggers, most severe first.
///
/// Rules of equal severity keep their catalog order. Pure and deterministic.
pub fn evaluate(sensor_type: SensorType, value: Decimal) -> Vec<&'static Rule> {
    // ---
    let mut triggered: Vec<&'static Rule> = RULES
        .iter()
        .filter(|r| r.sensor_type == sensor_type && r.triggers(value))
        .collect();

    triggered.sort_by(|a, b| b.severity.cmp(&a.severity));
    triggered
}

/// The single rule that drives alert creation, if any rule triggers.
pub fn effective_rule(sensor_type: SensorType, value: Decimal) -> Option<&'static Rule> {
    evaluate(sensor_type, value).into_iter().next()
}
