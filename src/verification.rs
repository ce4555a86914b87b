//! Cross-source verification.
//!
//! Compares two canonical records for the same place, counts material
//! discrepancies and picks the more trustworthy record.

use serde::Serialize;
use std::fmt;

use crate::location::is_domestic_country;
use crate::types::{CanonicalWeatherRecord, ProviderId};

/// Temperature difference that counts as a discrepancy (°C).
pub const TEMPERATURE_TOLERANCE: f64 = 5.0;
/// Humidity difference that counts as a discrepancy (percentage points).
pub const HUMIDITY_TOLERANCE: f64 = 20.0;
/// Pressure difference that counts as a discrepancy (hPa).
pub const PRESSURE_TOLERANCE: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    fn from_discrepancies(count: usize) -> Self {
        match count {
            0 => Confidence::High,
            1 | 2 => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub confidence: Confidence,
    pub sources: Vec<ProviderId>,
    pub discrepancies: Vec<String>,
    pub recommendation: String,
}

/// Compare two records field by field.
pub fn verify(a: &CanonicalWeatherRecord, b: &CanonicalWeatherRecord) -> VerificationResult {
    let mut discrepancies = Vec::new();
    let (ca, cb) = (&a.current, &b.current);

    let dt = (ca.temperature - cb.temperature).abs();
    if dt > TEMPERATURE_TOLERANCE {
        discrepancies.push(format!(
            "temperature differs by {dt:.1}°C ({}: {:.1}, {}: {:.1})",
            a.source, ca.temperature, b.source, cb.temperature
        ));
    }

    let dh = (ca.humidity - cb.humidity).abs();
    if dh > HUMIDITY_TOLERANCE {
        discrepancies.push(format!(
            "humidity differs by {dh:.0}% ({}: {:.0}, {}: {:.0})",
            a.source, ca.humidity, b.source, cb.humidity
        ));
    }

    if let (Some(pa), Some(pb)) = (ca.pressure, cb.pressure) {
        let dp = (pa - pb).abs();
        if dp > PRESSURE_TOLERANCE {
            discrepancies.push(format!("pressure differs by {dp:.0} hPa ({}: {pa:.0}, {}: {pb:.0})", a.source, b.source));
        }
    }

    if ca.condition != cb.condition {
        discrepancies.push(format!(
            "condition mismatch ({}: {}, {}: {})",
            a.source, ca.condition, b.source, cb.condition
        ));
    }

    let confidence = Confidence::from_discrepancies(discrepancies.len());
    let recommendation = match confidence {
        Confidence::High => "Sources agree".to_string(),
        Confidence::Medium => format!("Minor disagreement; prefer {}", select_best(a, b).source),
        Confidence::Low => "Sources disagree materially; treat data with caution".to_string(),
    };

    VerificationResult {
        verified: discrepancies.len() <= 2,
        confidence,
        sources: vec![a.source, b.source],
        discrepancies,
        recommendation,
    }
}

/// Result for a record no second source could confirm.
pub fn single_source(record: &CanonicalWeatherRecord) -> VerificationResult {
    VerificationResult {
        verified: false,
        confidence: Confidence::Low,
        sources: vec![record.source],
        discrepancies: Vec::new(),
        recommendation: "Only one source available; unable to cross-check".to_string(),
    }
}

/// Pick the more trustworthy of two records. A domestic record from the
/// domestic specialist always wins; otherwise the reliability ranking
/// decides and ties keep `a`.
pub fn select_best<'a>(a: &'a CanonicalWeatherRecord, b: &'a CanonicalWeatherRecord) -> &'a CanonicalWeatherRecord {
    let domestic_specialist =
        |r: &CanonicalWeatherRecord| r.source == ProviderId::Kma && r.location.country.as_deref().is_some_and(is_domestic_country);
    if domestic_specialist(a) {
        return a;
    }
    if domestic_specialist(b) {
        return b;
    }
    if b.source.reliability() > a.source.reliability() {
        b
    } else {
        a
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
