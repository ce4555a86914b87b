//! KMA (Korea Meteorological Administration) adapter.
//!
//! Combines the ultra-short-term nowcast with the village forecast, both
//! addressed by a cell on the DFS Lambert-conformal 5 km grid. Only
//! domestic coordinates make sense here.
//!
//! API: `https://apis.data.go.kr/1360000/VilageFcstInfoService_2.0/`
//! Auth: `serviceKey` query parameter (decoded data.go.kr key).

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use super::{build_client, decode, get_json, local_to_utc, ProviderRequest, WeatherProvider};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::location::DOMESTIC_COUNTRY;
use crate::types::{
    CanonicalWeatherRecord, Condition, CurrentConditions, DailyForecast, Freshness, HourlyPoint, Location,
    ProviderId,
};

const BASE_URL: &str = "https://apis.data.go.kr/1360000/VilageFcstInfoService_2.0";
const KST_OFFSET_SECS: i64 = 9 * 3600;
const HOURLY_POINTS: usize = 8;

// ---------------------------------------------------------------------------
// DFS grid
// ---------------------------------------------------------------------------

const RE: f64 = 6371.00877; // earth radius (km)
const GRID: f64 = 5.0; // grid spacing (km)
const SLAT1: f64 = 30.0; // standard parallel 1
const SLAT2: f64 = 60.0; // standard parallel 2
const OLON: f64 = 126.0; // origin longitude
const OLAT: f64 = 38.0; // origin latitude
const XO: f64 = 43.0; // origin x
const YO: f64 = 136.0; // origin y

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridPoint {
    pub nx: i32,
    pub ny: i32,
}

/// Project a coordinate pair onto the forecast grid.
pub fn to_grid(lat: f64, lon: f64) -> GridPoint {
    use std::f64::consts::PI;
    let degrad = PI / 180.0;

    let re = RE / GRID;
    let slat1 = SLAT1 * degrad;
    let slat2 = SLAT2 * degrad;
    let olon = OLON * degrad;
    let olat = OLAT * degrad;

    let sn = (PI * 0.25 + slat2 * 0.5).tan() / (PI * 0.25 + slat1 * 0.5).tan();
    let sn = (slat1.cos() / slat2.cos()).ln() / sn.ln();
    let sf = (PI * 0.25 + slat1 * 0.5).tan().powf(sn) * slat1.cos() / sn;
    let ro = re * sf / (PI * 0.25 + olat * 0.5).tan().powf(sn);

    let ra = re * sf / (PI * 0.25 + lat * degrad * 0.5).tan().powf(sn);
    let mut theta = lon * degrad - olon;
    if theta > PI {
        theta -= 2.0 * PI;
    }
    if theta < -PI {
        theta += 2.0 * PI;
    }
    theta *= sn;

    GridPoint {
        nx: (ra * theta.sin() + XO + 0.5).floor() as i32,
        ny: (ro - ra * theta.cos() + YO + 0.5).floor() as i32,
    }
}

// ---------------------------------------------------------------------------
// Base time selection (KST wall clock)
// ---------------------------------------------------------------------------

/// Village forecast issue hours; each is published ten minutes later.
const VILLAGE_BASE_HOURS: [u32; 8] = [2, 5, 8, 11, 14, 17, 20, 23];

/// Latest nowcast: the current hour is available from minute 40.
pub(crate) fn nowcast_base(now_kst: NaiveDateTime) -> (String, String) {
    let t = if now_kst.minute() < 40 { now_kst - Duration::hours(1) } else { now_kst };
    (t.format("%Y%m%d").to_string(), t.format("%H00").to_string())
}

/// Latest published village forecast run.
pub(crate) fn village_base(now_kst: NaiveDateTime) -> (String, String) {
    let published = now_kst - Duration::minutes(10);
    match VILLAGE_BASE_HOURS.iter().rev().find(|h| **h <= published.hour()) {
        Some(h) => (published.format("%Y%m%d").to_string(), format!("{h:02}00")),
        None => {
            let previous = published - Duration::days(1);
            (previous.format("%Y%m%d").to_string(), "2300".to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    response: EnvelopeResponse,
}

#[derive(Debug, Deserialize)]
struct EnvelopeResponse {
    header: Header,
    #[serde(default)]
    body: Option<Body>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(rename = "resultCode")]
    result_code: String,
    #[serde(rename = "resultMsg", default)]
    result_msg: String,
}

#[derive(Debug, Deserialize)]
struct Body {
    items: Items,
}

#[derive(Debug, Deserialize)]
struct Items {
    #[serde(default)]
    item: Vec<KmaItem>,
}

/// One category/value row. Nowcast rows carry `obsrValue`, forecast rows
/// carry `fcstDate`/`fcstTime`/`fcstValue`. Values arrive as strings.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KmaItem {
    category: String,
    #[serde(rename = "fcstDate", default)]
    fcst_date: Option<String>,
    #[serde(rename = "fcstTime", default)]
    fcst_time: Option<String>,
    #[serde(rename = "obsrValue", default)]
    obsr_value: Option<Value>,
    #[serde(rename = "fcstValue", default)]
    fcst_value: Option<Value>,
}

impl KmaItem {
    fn value(&self) -> Option<f64> {
        self.obsr_value.as_ref().or(self.fcst_value.as_ref()).and_then(number)
    }

    fn slot(&self) -> Option<NaiveDateTime> {
        let date = self.fcst_date.as_deref()?;
        let time = self.fcst_time.as_deref()?;
        NaiveDateTime::parse_from_str(&format!("{date}{time}"), "%Y%m%d%H%M").ok()
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Unwrap the data.go.kr envelope, mapping non-zero result codes.
pub(crate) fn parse_items(value: Value) -> Result<Vec<KmaItem>, ProviderError> {
    let envelope: Envelope = decode(ProviderId::Kma, "envelope", value)?;
    let header = envelope.response.header;
    if header.result_code != "00" {
        let kind = match header.result_code.as_str() {
            "03" => ProviderErrorKind::NotFound,
            "20" | "30" | "31" | "32" | "33" => ProviderErrorKind::Auth,
            "22" => ProviderErrorKind::RateLimited,
            _ => ProviderErrorKind::Network,
        };
        return Err(ProviderError::new(
            ProviderId::Kma,
            kind,
            format!("result {}: {}", header.result_code, header.result_msg),
        ));
    }
    Ok(envelope.response.body.map(|b| b.items.item).unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Code mapping
// ---------------------------------------------------------------------------

/// Precipitation type (PTY) codes.
pub(crate) fn pty_condition(code: i64) -> (Condition, &'static str) {
    match code {
        1 => (Condition::Rain, "rain"),
        2 => (Condition::Rain, "rain and snow"),
        3 => (Condition::Snow, "snow"),
        4 => (Condition::Rain, "shower"),
        5 => (Condition::Drizzle, "drizzle"),
        6 => (Condition::Drizzle, "drizzle and snow flurries"),
        7 => (Condition::Snow, "snow flurries"),
        _ => (Condition::Other, "precipitation"),
    }
}

/// Sky state (SKY) codes.
pub(crate) fn sky_condition(code: i64) -> (Condition, &'static str) {
    match code {
        1 => (Condition::Clear, "clear"),
        3 => (Condition::Clouds, "mostly cloudy"),
        4 => (Condition::Clouds, "overcast"),
        _ => (Condition::Other, "unknown sky state"),
    }
}

/// Precipitation wins over sky state.
fn slot_condition(values: &HashMap<String, f64>) -> Option<(Condition, &'static str)> {
    match values.get("PTY").map(|p| *p as i64).unwrap_or(0) {
        0 => values.get("SKY").map(|s| sky_condition(*s as i64)),
        p => Some(pty_condition(p)),
    }
}

/// Apparent temperature: wind chill in the cold, heat index in humid heat,
/// otherwise the air temperature.
pub(crate) fn feels_like(temp_c: f64, humidity: f64, wind_ms: f64) -> f64 {
    let wind_kmh = wind_ms * 3.6;
    if temp_c <= 10.0 && wind_kmh >= 4.8 {
        let v = wind_kmh.powf(0.16);
        13.12 + 0.6215 * temp_c - 11.37 * v + 0.3965 * temp_c * v
    } else if temp_c >= 27.0 && humidity >= 40.0 {
        let t = temp_c * 1.8 + 32.0;
        let rh = humidity;
        let hi = -42.379 + 2.049_015_23 * t + 10.143_331_27 * rh
            - 0.224_755_41 * t * rh
            - 0.006_837_83 * t * t
            - 0.054_817_17 * rh * rh
            + 0.001_228_74 * t * t * rh
            + 0.000_852_82 * t * rh * rh
            - 0.000_001_99 * t * t * rh * rh;
        (hi - 32.0) / 1.8
    } else {
        temp_c
    }
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Build the canonical record from nowcast and village forecast rows.
/// T1H, REH and WSD are required.
pub(crate) fn normalize(
    nowcast: &[KmaItem],
    village: &[KmaItem],
    location: Location,
    observed_at: DateTime<Utc>,
    forecast_days: usize,
) -> Result<CanonicalWeatherRecord, ProviderError> {
    let obs: HashMap<&str, f64> = nowcast
        .iter()
        .filter_map(|i| i.value().map(|v| (i.category.as_str(), v)))
        .collect();
    let require = |cat: &str| {
        obs.get(cat)
            .copied()
            .ok_or_else(|| ProviderError::parse(ProviderId::Kma, format!("nowcast missing {cat}")))
    };
    let temperature = require("T1H")?;
    let humidity = require("REH")?;
    let wind_speed = require("WSD")?;

    let mut slots: BTreeMap<NaiveDateTime, HashMap<String, f64>> = BTreeMap::new();
    let mut extremes: BTreeMap<NaiveDate, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for item in village {
        let (Some(slot), Some(v)) = (item.slot(), item.value()) else {
            continue;
        };
        match item.category.as_str() {
            "TMN" => extremes.entry(slot.date()).or_default().0 = Some(v),
            "TMX" => extremes.entry(slot.date()).or_default().1 = Some(v),
            _ => {}
        }
        slots.entry(slot).or_default().insert(item.category.clone(), v);
    }

    let observed_local = observed_at.naive_utc() + Duration::seconds(KST_OFFSET_SECS);
    let (condition, description) = match obs.get("PTY").map(|p| *p as i64).unwrap_or(0) {
        0 => slots
            .range(observed_local..)
            .chain(slots.iter())
            .find_map(|(_, values)| values.get("SKY").map(|s| sky_condition(*s as i64)))
            .unwrap_or((Condition::Clear, "clear")),
        p => pty_condition(p),
    };

    let hourly: Vec<HourlyPoint> = slots
        .range(observed_local..)
        .filter_map(|(slot, values)| {
            let temperature = *values.get("TMP")?;
            let (condition, _) = slot_condition(values).unwrap_or((Condition::Other, ""));
            Some(HourlyPoint {
                time: local_to_utc(*slot, KST_OFFSET_SECS),
                temperature,
                condition,
                precipitation_chance: values.get("POP").copied(),
            })
        })
        .take(HOURLY_POINTS)
        .collect();

    let mut days: BTreeMap<NaiveDate, Vec<(&NaiveDateTime, &HashMap<String, f64>)>> = BTreeMap::new();
    for (slot, values) in &slots {
        days.entry(slot.date()).or_default().push((slot, values));
    }
    let forecast: Vec<DailyForecast> = days
        .into_iter()
        .filter_map(|(date, day_slots)| {
            let temps: Vec<f64> = day_slots.iter().filter_map(|(_, v)| v.get("TMP").copied()).collect();
            let (tmn, tmx) = extremes.get(&date).copied().unwrap_or_default();
            let min = tmn.or_else(|| temps.iter().copied().reduce(f64::min))?;
            let max = tmx.or_else(|| temps.iter().copied().reduce(f64::max))?;
            let wet = day_slots
                .iter()
                .find_map(|(_, v)| v.get("PTY").filter(|p| **p as i64 != 0).map(|p| pty_condition(*p as i64)));
            let (condition, description) = wet
                .or_else(|| {
                    day_slots
                        .iter()
                        .find(|(s, _)| s.hour() == 12)
                        .and_then(|(_, v)| slot_condition(v))
                })
                .or_else(|| day_slots.iter().find_map(|(_, v)| slot_condition(v)))
                .unwrap_or((Condition::Other, "unknown"));
            Some(DailyForecast { date, min, max, condition, description: description.to_string() })
        })
        .take(forecast_days)
        .collect();

    Ok(CanonicalWeatherRecord {
        location,
        current: CurrentConditions {
            temperature,
            feels_like: feels_like(temperature, humidity, wind_speed),
            humidity,
            pressure: None,
            visibility: None,
            uv_index: None,
            wind_speed,
            wind_direction: obs.get("VEC").copied(),
            condition,
            description: description.to_string(),
        },
        forecast,
        hourly: if hourly.is_empty() { None } else { Some(hourly) },
        sunrise: None,
        sunset: None,
        source: ProviderId::Kma,
        freshness: Freshness::Fresh,
        observed_at,
        cached_at: None,
    })
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct KmaProvider {
    http: Client,
    service_key: SecretString,
}

impl KmaProvider {
    pub fn new(service_key: SecretString, timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self { http: build_client(ProviderId::Kma, timeout)?, service_key })
    }

    fn url(&self, operation: &str, base: &(String, String), grid: GridPoint, rows: u32) -> String {
        format!(
            "{BASE_URL}/{operation}?serviceKey={key}&pageNo=1&numOfRows={rows}&dataType=JSON\
             &base_date={date}&base_time={time}&nx={nx}&ny={ny}",
            key = urlencoding::encode(self.service_key.expose_secret()),
            date = base.0,
            time = base.1,
            nx = grid.nx,
            ny = grid.ny,
        )
    }
}

#[async_trait]
impl WeatherProvider for KmaProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Kma
    }

    async fn fetch(&self, req: &ProviderRequest) -> Result<CanonicalWeatherRecord, ProviderError> {
        let coords = req
            .location
            .coordinates()
            .ok_or_else(|| ProviderError::not_found(ProviderId::Kma, "query has no coordinates"))?;
        let grid = to_grid(coords.lat, coords.lon);

        let now_kst = Utc::now().naive_utc() + Duration::seconds(KST_OFFSET_SECS);
        let nowcast_at = nowcast_base(now_kst);
        let village_at = village_base(now_kst);
        debug!(nx = grid.nx, ny = grid.ny, nowcast = ?nowcast_at, village = ?village_at, "KMA request");

        let nowcast_url = self.url("getUltraSrtNcst", &nowcast_at, grid, 100);
        let village_url = self.url("getVilageFcst", &village_at, grid, 1000);
        let (nowcast_json, village_json) = futures::try_join!(
            get_json(&self.http, ProviderId::Kma, "getUltraSrtNcst", &nowcast_url),
            get_json(&self.http, ProviderId::Kma, "getVilageFcst", &village_url),
        )?;
        let nowcast = parse_items(nowcast_json)?;
        let village = parse_items(village_json)?;

        let base = format!("{}{}", nowcast_at.0, nowcast_at.1);
        let observed_at = NaiveDateTime::parse_from_str(&base, "%Y%m%d%H%M")
            .map(|naive| local_to_utc(naive, KST_OFFSET_SECS))
            .map_err(|e| ProviderError::parse(ProviderId::Kma, format!("base time {base}: {e}")))?;

        let location = Location {
            name: req.location.display_name(),
            country: Some(DOMESTIC_COUNTRY.to_string()),
            lat: coords.lat,
            lon: coords.lon,
        };
        let days = if req.wants_extended() { 4 } else { 3 };
        normalize(&nowcast, &village, location, observed_at, days)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn kst(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, 0).unwrap()
    }

    fn seoul() -> Location {
        Location { name: "Seoul".into(), country: Some("KR".into()), lat: 37.5665, lon: 126.9780 }
    }

    fn nowcast_fixture() -> Value {
        json!({
            "response": {
                "header": { "resultCode": "00", "resultMsg": "NORMAL_SERVICE" },
                "body": { "items": { "item": [
                    { "baseDate": "20261016", "baseTime": "1400", "category": "T1H", "obsrValue": "18.2" },
                    { "baseDate": "20261016", "baseTime": "1400", "category": "REH", "obsrValue": "55" },
                    { "baseDate": "20261016", "baseTime": "1400", "category": "WSD", "obsrValue": "2.1" },
                    { "baseDate": "20261016", "baseTime": "1400", "category": "VEC", "obsrValue": "270" },
                    { "baseDate": "20261016", "baseTime": "1400", "category": "PTY", "obsrValue": "0" }
                ]}}
            }
        })
    }

    fn fcst(date: &str, time: &str, category: &str, value: &str) -> Value {
        json!({ "fcstDate": date, "fcstTime": time, "category": category, "fcstValue": value })
    }

    fn village_fixture() -> Value {
        let items = vec![
            fcst("20261016", "1500", "TMP", "19"),
            fcst("20261016", "1500", "SKY", "3"),
            fcst("20261016", "1500", "PTY", "0"),
            fcst("20261016", "1500", "POP", "20"),
            fcst("20261016", "1600", "TMP", "18"),
            fcst("20261016", "1600", "SKY", "4"),
            fcst("20261016", "1600", "PTY", "0"),
            fcst("20261017", "0600", "TMN", "9.0"),
            fcst("20261017", "0600", "TMP", "9"),
            fcst("20261017", "0600", "PTY", "1"),
            fcst("20261017", "1200", "TMP", "15"),
            fcst("20261017", "1200", "SKY", "4"),
            fcst("20261017", "1500", "TMX", "16.0"),
        ];
        json!({
            "response": {
                "header": { "resultCode": "00", "resultMsg": "NORMAL_SERVICE" },
                "body": { "items": { "item": items } }
            }
        })
    }

    // ---- Grid ----

    #[test]
    fn test_grid_seoul() {
        assert_eq!(to_grid(37.5665, 126.9780), GridPoint { nx: 60, ny: 127 });
    }

    #[test]
    fn test_grid_origin() {
        assert_eq!(to_grid(OLAT, OLON), GridPoint { nx: 43, ny: 136 });
    }

    // ---- Base times ----

    #[test]
    fn test_nowcast_base_before_and_after_publication() {
        assert_eq!(nowcast_base(kst(2026, 10, 16, 14, 39)), ("20261016".into(), "1300".into()));
        assert_eq!(nowcast_base(kst(2026, 10, 16, 14, 40)), ("20261016".into(), "1400".into()));
        assert_eq!(nowcast_base(kst(2026, 10, 16, 0, 10)), ("20261015".into(), "2300".into()));
    }

    #[test]
    fn test_village_base() {
        assert_eq!(village_base(kst(2026, 10, 16, 5, 9)), ("20261016".into(), "0200".into()));
        assert_eq!(village_base(kst(2026, 10, 16, 5, 10)), ("20261016".into(), "0500".into()));
        assert_eq!(village_base(kst(2026, 10, 16, 23, 59)), ("20261016".into(), "2300".into()));
        assert_eq!(village_base(kst(2026, 10, 16, 2, 5)), ("20261015".into(), "2300".into()));
    }

    // ---- Mapping ----

    #[test]
    fn test_condition_codes() {
        assert_eq!(sky_condition(1).0, Condition::Clear);
        assert_eq!(sky_condition(4).0, Condition::Clouds);
        assert_eq!(pty_condition(3).0, Condition::Snow);
        assert_eq!(pty_condition(5).0, Condition::Drizzle);
        assert_eq!(pty_condition(99).0, Condition::Other);
    }

    #[test]
    fn test_feels_like_regimes() {
        let chill = feels_like(0.0, 50.0, 20.0 / 3.6);
        assert!(chill < -4.5 && chill > -6.0, "got {chill}");
        let heat = feels_like(32.0, 70.0, 1.0);
        assert!(heat > 36.0, "got {heat}");
        assert_eq!(feels_like(18.0, 55.0, 2.0), 18.0);
    }

    // ---- Normalisation ----

    #[test]
    fn test_parse_items_error_code() {
        let err = parse_items(json!({
            "response": { "header": { "resultCode": "30", "resultMsg": "SERVICE_KEY_IS_NOT_REGISTERED_ERROR" } }
        }))
        .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Auth);
    }

    #[test]
    fn test_normalize_full_record() {
        let nowcast = parse_items(nowcast_fixture()).unwrap();
        let village = parse_items(village_fixture()).unwrap();
        let observed = Utc.with_ymd_and_hms(2026, 10, 16, 5, 0, 0).unwrap(); // 14:00 KST
        let rec = normalize(&nowcast, &village, seoul(), observed, 3).unwrap();

        assert_eq!(rec.source, ProviderId::Kma);
        assert_eq!(rec.current.temperature, 18.2);
        assert_eq!(rec.current.humidity, 55.0);
        assert_eq!(rec.current.wind_direction, Some(270.0));
        assert_eq!(rec.current.pressure, None);
        // no precipitation now: sky of the next slot
        assert_eq!(rec.current.condition, Condition::Clouds);

        let hourly = rec.hourly.unwrap();
        assert_eq!(hourly.len(), 4);
        assert_eq!(hourly[0].time, Utc.with_ymd_and_hms(2026, 10, 16, 6, 0, 0).unwrap());
        assert_eq!(hourly[0].precipitation_chance, Some(20.0));
        assert_eq!(hourly[2].condition, Condition::Rain);

        assert_eq!(rec.forecast.len(), 2);
        assert_eq!(rec.forecast[0].min, 18.0);
        assert_eq!(rec.forecast[0].max, 19.0);
        assert_eq!(rec.forecast[1].min, 9.0);
        assert_eq!(rec.forecast[1].max, 16.0);
        assert_eq!(rec.forecast[1].condition, Condition::Rain);
    }

    #[test]
    fn test_normalize_missing_temperature_fails() {
        let nowcast = parse_items(json!({
            "response": {
                "header": { "resultCode": "00", "resultMsg": "NORMAL_SERVICE" },
                "body": { "items": { "item": [
                    { "category": "REH", "obsrValue": "55" },
                    { "category": "WSD", "obsrValue": "2.1" }
                ]}}
            }
        }))
        .unwrap();
        let err = normalize(&nowcast, &[], seoul(), Utc::now(), 3).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Parse);
        assert!(err.message.contains("T1H"));
    }

    #[test]
    fn test_precipitation_now_overrides_sky() {
        let mut nowcast = parse_items(nowcast_fixture()).unwrap();
        for item in nowcast.iter_mut().filter(|i| i.category == "PTY") {
            item.obsr_value = Some(json!("3"));
        }
        let rec = normalize(&nowcast, &[], seoul(), Utc::now(), 3).unwrap();
        assert_eq!(rec.current.condition, Condition::Snow);
        assert!(rec.hourly.is_none());
        assert!(rec.forecast.is_empty());
    }
}
