//! Timestamp helpers shared across the pipeline: numeric epoch seconds on
//! the wire, ISO 8601 (and optionally Julian) strings at the edges.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// ISO 8601 with millisecond fraction and `Z` suffix, the default record
/// envelope timestamp format.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// ISO 8601 date, used for logfile suffixes.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Julian day format as used on some vessels, e.g. `21+195:13:55:02.123`.
pub const JULIAN_TIME_FORMAT: &str = "%y+%j:%H:%M:%S%.3f";

#[derive(Debug, thiserror::Error)]
pub enum TimeError {
	#[error("unable to parse time string {0:?} with format {1:?}")]
	UnparseableTime(String, String),
	#[error("invalid strftime format string {0:?}")]
	BadFormat(String),
}

/// Current system time as float seconds since the Unix epoch.
pub fn now() -> f64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs_f64())
		.unwrap_or(0.0)
}

fn epoch_seconds(dt: &DateTime<Utc>) -> f64 {
	dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
}

pub fn datetime_from_timestamp(ts: f64) -> DateTime<Utc> {
	let secs = ts.floor() as i64;
	let nanos = (((ts - secs as f64) * 1e9).round() as u32).min(999_999_999);
	Utc.timestamp_opt(secs, nanos)
		.single()
		.unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

/// Parse a time string with the given strftime format into epoch seconds.
///
/// Falls back through progressively looser variants: a format whose
/// fractional-seconds specifier is absent from the input, a bare date, and
/// a raw numeric epoch value.
pub fn timestamp(time_str: &str, time_format: &str) -> Result<f64, TimeError> {
	let time_str = time_str.trim();

	if let Ok(dt) = NaiveDateTime::parse_from_str(time_str, time_format) {
		return Ok(epoch_seconds(&Utc.from_utc_datetime(&dt)));
	}

	// The `%.3f`/`%.6f` specifiers demand an exact digit count; retry with
	// the flexible-width form so `.0` and `.832875` both parse.
	for (from, to) in &[("%.3f", "%.f"), ("%.6f", "%.f"), (".%f", "%.f")] {
		if time_format.contains(from) {
			let loose = time_format.replace(from, to);
			if let Ok(dt) = NaiveDateTime::parse_from_str(time_str, &loose) {
				return Ok(epoch_seconds(&Utc.from_utc_datetime(&dt)));
			}
		}
	}

	// A date-only format has no time component for NaiveDateTime to find.
	if let Ok(date) = NaiveDate::parse_from_str(time_str, time_format) {
		let dt = date.and_hms_opt(0, 0, 0).unwrap_or_else(|| {
			NaiveDate::from_ymd_opt(1970, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
		});
		return Ok(Utc.from_utc_datetime(&dt).timestamp() as f64);
	}

	if let Ok(epoch) = time_str.parse::<f64>() {
		return Ok(epoch);
	}

	Err(TimeError::UnparseableTime(
		time_str.to_owned(),
		time_format.to_owned(),
	))
}

/// Format epoch seconds with a runtime-supplied strftime format.
///
/// chrono surfaces bad specifiers only at write time, so collect through a
/// fallible write instead of `to_string()`.
pub fn time_str(ts: f64, time_format: &str) -> Result<String, TimeError> {
	let dt = datetime_from_timestamp(ts);
	let mut out = String::new();
	write!(&mut out, "{}", dt.format(time_format))
		.map_err(|_| TimeError::BadFormat(time_format.to_owned()))?;
	Ok(out)
}

/// Format epoch seconds with the default full-resolution time format.
pub fn time_str_default(ts: f64) -> String {
	time_str(ts, TIME_FORMAT).expect("default time format is valid")
}

/// Format epoch seconds as a date string.
pub fn date_str(ts: f64) -> String {
	time_str(ts, DATE_FORMAT).expect("default date format is valid")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_iso_with_fraction() {
		let ts = timestamp("1970-01-01T00:00:10.0Z", "%Y-%m-%dT%H:%M:%S%.fZ").unwrap();
		assert!((ts - 10.0).abs() < 1e-9);

		let ts = timestamp("2023-01-01T00:00:00.000Z", TIME_FORMAT).unwrap();
		assert!((ts - 1672531200.0).abs() < 1e-6);
	}

	#[test]
	fn parses_flexible_fraction_width() {
		let ts = timestamp("2017-11-03T17:23:04.832875Z", TIME_FORMAT).unwrap();
		assert!((ts - 1509729784.832875).abs() < 1e-5);
	}

	#[test]
	fn parses_date_only() {
		let ts = timestamp("2020-08-11", DATE_FORMAT).unwrap();
		assert!((ts - 1597104000.0).abs() < 1e-6);
	}

	#[test]
	fn parses_numeric_epoch() {
		let ts = timestamp("1597150898.5", TIME_FORMAT).unwrap();
		assert!((ts - 1597150898.5).abs() < 1e-9);
	}

	#[test]
	fn parses_julian() {
		let ts = timestamp("21+001:00:00:10.0", JULIAN_TIME_FORMAT).unwrap();
		// 2021-01-01T00:00:10Z
		assert!((ts - 1609459210.0).abs() < 1e-6);
	}

	#[test]
	fn round_trips_formatting() {
		let ts = 1597150898.0;
		let s = time_str(ts, TIME_FORMAT).unwrap();
		let back = timestamp(&s, TIME_FORMAT).unwrap();
		assert!((back - ts).abs() < 1e-3);
	}

	#[test]
	fn date_suffixes_for_daily_buckets() {
		assert_eq!(date_str(1597150898.0), "2020-08-11");
		assert_eq!(date_str(1597237298.0), "2020-08-12");
		assert_eq!(date_str(1597323698.0), "2020-08-13");
	}

	#[test]
	fn rejects_garbage() {
		assert!(timestamp("there is no timestamp here", TIME_FORMAT).is_err());
	}
}
