//! Location classification.
//!
//! Decides whether a query is domestic (Korea) or international and, for
//! domestic queries, resolves it to a canonical English name and a
//! coordinate pair from a static gazetteer. Domestic providers work on
//! precise coordinates and simple international geocoding is unreliable for
//! Hangul names, so an unmatched Hangul query is reported as unresolved
//! instead of being sent down the international route.

use serde::Serialize;
use tracing::debug;

use crate::types::{Coordinates, WeatherQuery};

// ---------------------------------------------------------------------------
// Gazetteer
// ---------------------------------------------------------------------------

/// A domestic place we can resolve without a geocoder.
#[derive(Debug)]
pub struct GazetteerEntry {
    /// Korean name without administrative suffix.
    pub korean: &'static str,
    /// Extra accepted spellings (English, romanisation variants, full
    /// administrative names).
    pub aliases: &'static [&'static str],
    pub english: &'static str,
    pub lat: f64,
    pub lon: f64,
}

impl GazetteerEntry {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lon)
    }

    fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.korean)
            .chain(std::iter::once(self.english))
            .chain(self.aliases.iter().copied())
    }
}

pub const GAZETTEER: &[GazetteerEntry] = &[
    GazetteerEntry { korean: "서울", aliases: &["서울특별시", "seoul"], english: "Seoul", lat: 37.5665, lon: 126.9780 },
    GazetteerEntry { korean: "부산", aliases: &["부산광역시", "busan", "pusan"], english: "Busan", lat: 35.1796, lon: 129.0756 },
    GazetteerEntry { korean: "인천", aliases: &["인천광역시", "incheon"], english: "Incheon", lat: 37.4563, lon: 126.7052 },
    GazetteerEntry { korean: "대구", aliases: &["대구광역시", "daegu", "taegu"], english: "Daegu", lat: 35.8714, lon: 128.6014 },
    GazetteerEntry { korean: "대전", aliases: &["대전광역시", "daejeon"], english: "Daejeon", lat: 36.3504, lon: 127.3845 },
    GazetteerEntry { korean: "광주", aliases: &["광주광역시", "gwangju"], english: "Gwangju", lat: 35.1595, lon: 126.8526 },
    GazetteerEntry { korean: "울산", aliases: &["울산광역시", "ulsan"], english: "Ulsan", lat: 35.5384, lon: 129.3114 },
    GazetteerEntry { korean: "세종", aliases: &["세종특별자치시", "sejong"], english: "Sejong", lat: 36.4800, lon: 127.2890 },
    GazetteerEntry { korean: "수원", aliases: &["수원시", "suwon"], english: "Suwon", lat: 37.2636, lon: 127.0286 },
    GazetteerEntry { korean: "고양", aliases: &["고양시", "goyang"], english: "Goyang", lat: 37.6584, lon: 126.8320 },
    GazetteerEntry { korean: "용인", aliases: &["용인시", "yongin"], english: "Yongin", lat: 37.2411, lon: 127.1776 },
    GazetteerEntry { korean: "성남", aliases: &["성남시", "seongnam"], english: "Seongnam", lat: 37.4200, lon: 127.1265 },
    GazetteerEntry { korean: "청주", aliases: &["청주시", "cheongju"], english: "Cheongju", lat: 36.6424, lon: 127.4890 },
    GazetteerEntry { korean: "천안", aliases: &["천안시", "cheonan"], english: "Cheonan", lat: 36.8151, lon: 127.1139 },
    GazetteerEntry { korean: "전주", aliases: &["전주시", "jeonju"], english: "Jeonju", lat: 35.8242, lon: 127.1480 },
    GazetteerEntry { korean: "창원", aliases: &["창원시", "changwon"], english: "Changwon", lat: 35.2280, lon: 128.6811 },
    GazetteerEntry { korean: "김해", aliases: &["김해시", "gimhae"], english: "Gimhae", lat: 35.2285, lon: 128.8894 },
    GazetteerEntry { korean: "포항", aliases: &["포항시", "pohang"], english: "Pohang", lat: 36.0190, lon: 129.3435 },
    GazetteerEntry { korean: "경주", aliases: &["경주시", "gyeongju"], english: "Gyeongju", lat: 35.8562, lon: 129.2247 },
    GazetteerEntry { korean: "안동", aliases: &["안동시", "andong"], english: "Andong", lat: 36.5684, lon: 128.7294 },
    GazetteerEntry { korean: "강릉", aliases: &["강릉시", "gangneung"], english: "Gangneung", lat: 37.7519, lon: 128.8761 },
    GazetteerEntry { korean: "속초", aliases: &["속초시", "sokcho"], english: "Sokcho", lat: 38.2070, lon: 128.5918 },
    GazetteerEntry { korean: "춘천", aliases: &["춘천시", "chuncheon"], english: "Chuncheon", lat: 37.8813, lon: 127.7298 },
    GazetteerEntry { korean: "원주", aliases: &["원주시", "wonju"], english: "Wonju", lat: 37.3422, lon: 127.9202 },
    GazetteerEntry { korean: "여수", aliases: &["여수시", "yeosu"], english: "Yeosu", lat: 34.7604, lon: 127.6622 },
    GazetteerEntry { korean: "목포", aliases: &["목포시", "mokpo"], english: "Mokpo", lat: 34.8118, lon: 126.3922 },
    GazetteerEntry { korean: "순천", aliases: &["순천시", "suncheon"], english: "Suncheon", lat: 34.9506, lon: 127.4872 },
    GazetteerEntry { korean: "제주", aliases: &["제주시", "제주특별자치도", "jeju", "jeju city"], english: "Jeju", lat: 33.4996, lon: 126.5312 },
    GazetteerEntry { korean: "서귀포", aliases: &["서귀포시", "seogwipo"], english: "Seogwipo", lat: 33.2541, lon: 126.5600 },
];

/// Korean administrative suffixes, longest first so "광역시" is stripped
/// before "시".
const ADMIN_SUFFIXES: &[&str] = &["특별자치시", "특별자치도", "특별시", "광역시", "시", "군", "구", "도"];

/// Nearest-entry radius for naming domestic coordinate queries.
const NEAREST_NAME_RADIUS_KM: f64 = 30.0;

// Rough domestic bounding box (mainland, Jeju and Ulleungdo).
const DOMESTIC_LAT: (f64, f64) = (33.0, 38.7);
const DOMESTIC_LON: (f64, f64) = (124.5, 131.9);

/// ISO code used for domestic records.
pub const DOMESTIC_COUNTRY: &str = "KR";

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// A domestic location resolved to a canonical name and coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedLocation {
    pub name: String,
    pub coordinates: Coordinates,
}

/// Outcome of classifying a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum Classification {
    /// Domestic and resolved to precise coordinates.
    Domestic(ResolvedLocation),
    /// Looks domestic (Hangul text) but is not in the gazetteer.
    UnresolvedDomestic { text: String },
    /// Anything else; coordinates are present for coordinate queries.
    International { text: Option<String>, coordinates: Option<Coordinates> },
}

impl Classification {
    pub fn is_domestic(&self) -> bool {
        matches!(self, Classification::Domestic(_) | Classification::UnresolvedDomestic { .. })
    }

    /// Coordinates a provider can use directly, if any.
    pub fn coordinates(&self) -> Option<Coordinates> {
        match self {
            Classification::Domestic(r) => Some(r.coordinates),
            Classification::International { coordinates, .. } => *coordinates,
            Classification::UnresolvedDomestic { .. } => None,
        }
    }

    /// Free text a geocoding provider can use, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Classification::Domestic(r) => Some(&r.name),
            Classification::International { text, .. } => text.as_deref(),
            Classification::UnresolvedDomestic { text } => Some(text),
        }
    }

    /// Display name for records produced from this classification.
    pub fn display_name(&self) -> String {
        match self {
            Classification::Domestic(r) => r.name.clone(),
            Classification::UnresolvedDomestic { text } => text.clone(),
            Classification::International { text: Some(t), .. } => t.clone(),
            Classification::International { coordinates: Some(c), .. } => c.to_string(),
            Classification::International { .. } => String::new(),
        }
    }
}

/// Stateless classifier over the static gazetteer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocationClassifier;

impl LocationClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, query: &WeatherQuery) -> Classification {
        let classification = match query {
            WeatherQuery::Text(text) => Self::classify_text(text),
            WeatherQuery::Coordinates(c) => Self::classify_coordinates(*c),
        };
        debug!(query = %query, ?classification, "Classified query");
        classification
    }

    fn classify_text(text: &str) -> Classification {
        let trimmed = text.trim();
        if let Some(entry) = Self::resolve(trimmed) {
            return Classification::Domestic(ResolvedLocation {
                name: entry.english.to_string(),
                coordinates: entry.coordinates(),
            });
        }
        if contains_hangul(trimmed) {
            return Classification::UnresolvedDomestic { text: trimmed.to_string() };
        }
        Classification::International { text: Some(trimmed.to_string()), coordinates: None }
    }

    fn classify_coordinates(c: Coordinates) -> Classification {
        if !is_domestic_coordinate(c) {
            return Classification::International { text: None, coordinates: Some(c) };
        }
        let name = GAZETTEER
            .iter()
            .map(|e| (e, e.coordinates().distance_km(&c)))
            .filter(|(_, d)| *d <= NEAREST_NAME_RADIUS_KM)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(e, _)| e.english.to_string())
            .unwrap_or_else(|| c.to_string());
        Classification::Domestic(ResolvedLocation { name, coordinates: c })
    }

    /// Look a free-text name up in the gazetteer: exact alias match, then
    /// per-token match with administrative suffixes stripped, then
    /// substring/suffix match on multi-word input.
    pub fn resolve(text: &str) -> Option<&'static GazetteerEntry> {
        let q = text.trim().to_lowercase();
        if q.is_empty() {
            return None;
        }

        if let Some(e) = GAZETTEER.iter().find(|e| e.names().any(|n| n.to_lowercase() == q)) {
            return Some(e);
        }

        let tokens: Vec<&str> = q
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();
        for token in &tokens {
            let stem = strip_admin_suffix(token);
            if let Some(e) = GAZETTEER.iter().find(|e| e.korean == stem || e.english.to_lowercase() == stem) {
                return Some(e);
            }
        }

        if tokens.len() > 1 || q.chars().count() > 3 {
            // Prefer the longest matching name so "서귀포" beats "서".
            return GAZETTEER
                .iter()
                .flat_map(|e| e.names().map(move |n| (e, n.to_lowercase())))
                .filter(|(_, n)| n.chars().count() >= 2 && (q.contains(n.as_str()) || q.ends_with(n.as_str())))
                .max_by_key(|(_, n)| n.chars().count())
                .map(|(e, _)| e);
        }

        None
    }
}

fn strip_admin_suffix(token: &str) -> &str {
    for suffix in ADMIN_SUFFIXES {
        if let Some(stem) = token.strip_suffix(suffix) {
            if stem.chars().count() >= 2 {
                return stem;
            }
        }
    }
    token
}

/// Whether the text contains any Hangul syllable or jamo.
pub fn contains_hangul(text: &str) -> bool {
    text.chars().any(|c| matches!(c, '\u{AC00}'..='\u{D7A3}' | '\u{1100}'..='\u{11FF}' | '\u{3130}'..='\u{318F}'))
}

pub fn is_domestic_coordinate(c: Coordinates) -> bool {
    (DOMESTIC_LAT.0..=DOMESTIC_LAT.1).contains(&c.lat) && (DOMESTIC_LON.0..=DOMESTIC_LON.1).contains(&c.lon)
}

/// Whether a vendor's country field denotes the domestic country.
pub fn is_domestic_country(country: &str) -> bool {
    matches!(
        country.trim().to_lowercase().as_str(),
        "kr" | "kor" | "south korea" | "korea, republic of" | "republic of korea" | "korea" | "대한민국"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
