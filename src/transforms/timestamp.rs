//! Prepend a formatted timestamp to text records. Normally stamps with
//! system time; with `use_nmea_timestamp` the time of day is lifted from
//! recognized NMEA sentences, falling back to the most recent NMEA time
//! while it stays fresh.

use super::Transform;
use crate::record::Payload;
use crate::timeutil;
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use tracing::*;

const DEFAULT_NMEA_TIMEOUT: f64 = 60.0;

/// Extracts UTC timestamps from NMEA sentences. Sentences carrying only a
/// time of day are combined with the current UTC date.
#[derive(Debug, Default)]
pub struct NmeaTimeExtractor {
	pub last_nmea_timestamp: Option<f64>,
	pub last_nmea_system_time: f64,
}

impl NmeaTimeExtractor {
	/// Parse `hhmmss.ss` into seconds past midnight.
	fn time_of_day(field: &str) -> Option<f64> {
		let field = field.split('*').next().unwrap_or("");
		if field.len() < 6 {
			return None;
		}
		let hours: f64 = field.get(0..2)?.parse().ok()?;
		let minutes: f64 = field.get(2..4)?.parse().ok()?;
		let seconds: f64 = field.get(4..)?.parse().ok()?;
		Some(hours * 3600.0 + minutes * 60.0 + seconds)
	}

	fn clean(field: &str) -> &str {
		field.split('*').next().unwrap_or("")
	}

	fn with_date(year: i32, month: u32, day: u32, seconds_past_midnight: f64) -> Option<f64> {
		let date = NaiveDate::from_ymd_opt(year, month, day)?;
		let midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
		Some(midnight.timestamp() as f64 + seconds_past_midnight)
	}

	fn with_today(seconds_past_midnight: f64) -> Option<f64> {
		let today = Utc::now().date_naive();
		Self::with_date(today.year(), today.month(), today.day(), seconds_past_midnight)
	}

	/// Try to extract a timestamp from a single NMEA sentence.
	pub fn extract(&mut self, record: &str) -> Option<f64> {
		let body = record.trim().strip_prefix('$')?;
		let fields: Vec<&str> = body.split(',').collect();
		let header = fields.first()?;

		let timestamp = if *header == "PSXN" {
			// $PSXN,26,yyyy,mm,dd,hh,mm,ss.ss
			if fields.get(1) != Some(&"26") || fields.len() < 8 {
				return None;
			}
			let year: i32 = Self::clean(fields[2]).parse().ok()?;
			let month: u32 = Self::clean(fields[3]).parse().ok()?;
			let day: u32 = Self::clean(fields[4]).parse().ok()?;
			let hours: f64 = Self::clean(fields[5]).parse().ok()?;
			let minutes: f64 = Self::clean(fields[6]).parse().ok()?;
			let seconds: f64 = Self::clean(fields[7]).parse().ok()?;
			Self::with_date(
				year,
				month,
				day,
				hours * 3600.0 + minutes * 60.0 + seconds,
			)?
		} else if *header == "PASHR" {
			Self::with_today(Self::time_of_day(fields.get(1)?)?)?
		} else if header.len() == 5 {
			// Standard talker+sentence, e.g. GPGGA.
			match &header[2..] {
				"GGA" | "GBS" => Self::with_today(Self::time_of_day(fields.get(1)?)?)?,
				"GLL" => Self::with_today(Self::time_of_day(fields.get(5)?)?)?,
				"RMC" => {
					let tod = Self::time_of_day(fields.get(1)?)?;
					// Date is ddmmyy at field 9 when present.
					let date = fields.get(9).map(|f| Self::clean(f)).filter(|f| f.len() == 6);
					match date {
						Some(date) => {
							let day: u32 = date[0..2].parse().ok()?;
							let month: u32 = date[2..4].parse().ok()?;
							let year: i32 = date[4..6].parse::<i32>().ok()? + 2000;
							Self::with_date(year, month, day, tod)?
						}
						None => Self::with_today(tod)?,
					}
				}
				"ZDA" => {
					let tod = Self::time_of_day(fields.get(1)?)?;
					let day: u32 = Self::clean(fields.get(2)?).parse().ok()?;
					let month: u32 = Self::clean(fields.get(3)?).parse().ok()?;
					let year: i32 = Self::clean(fields.get(4)?).parse().ok()?;
					Self::with_date(year, month, day, tod)?
				}
				_ => return None,
			}
		} else {
			return None;
		};

		self.last_nmea_timestamp = Some(timestamp);
		self.last_nmea_system_time = timeutil::now();
		Some(timestamp)
	}
}

/// Prepend a formatted timestamp to a text record.
pub struct TimestampTransform {
	time_format: String,
	use_nmea_timestamp: bool,
	nmea_timestamp_timeout: f64,
	pub nmea_extractor: NmeaTimeExtractor,
}

#[derive(serde::Deserialize)]
#[serde(default)]
struct TimestampConfig {
	time_format: String,
	use_nmea_timestamp: bool,
	nmea_timestamp_timeout: f64,
}

impl Default for TimestampConfig {
	fn default() -> Self {
		TimestampConfig {
			time_format: timeutil::TIME_FORMAT.to_owned(),
			use_nmea_timestamp: false,
			nmea_timestamp_timeout: DEFAULT_NMEA_TIMEOUT,
		}
	}
}

impl TimestampTransform {
	pub fn new() -> Self {
		Self::with_format(timeutil::TIME_FORMAT)
	}

	pub fn with_format(time_format: &str) -> Self {
		TimestampTransform {
			time_format: time_format.to_owned(),
			use_nmea_timestamp: false,
			nmea_timestamp_timeout: DEFAULT_NMEA_TIMEOUT,
			nmea_extractor: NmeaTimeExtractor::default(),
		}
	}

	pub fn with_nmea(timeout: f64) -> Self {
		TimestampTransform {
			time_format: timeutil::TIME_FORMAT.to_owned(),
			use_nmea_timestamp: true,
			nmea_timestamp_timeout: timeout,
			nmea_extractor: NmeaTimeExtractor::default(),
		}
	}

	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: TimestampConfig = serde_json::from_value(kwargs.clone())?;
		Ok(TimestampTransform {
			time_format: config.time_format,
			use_nmea_timestamp: config.use_nmea_timestamp,
			nmea_timestamp_timeout: config.nmea_timestamp_timeout,
			nmea_extractor: NmeaTimeExtractor::default(),
		})
	}

	fn pick_timestamp(&mut self, text: &str) -> f64 {
		if !self.use_nmea_timestamp {
			return timeutil::now();
		}
		if let Some(ts) = self.nmea_extractor.extract(text) {
			return ts;
		}
		let age = timeutil::now() - self.nmea_extractor.last_nmea_system_time;
		match self.nmea_extractor.last_nmea_timestamp {
			Some(last) if age <= self.nmea_timestamp_timeout => last,
			_ => timeutil::now(),
		}
	}
}

impl Transform for TimestampTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let text = match payload {
			Payload::Text(text) => text,
			other => {
				warn!(
					"TimestampTransform received non-text input: {}",
					other.describe()
				);
				return None;
			}
		};
		let timestamp = self.pick_timestamp(&text);
		let stamp = match timeutil::time_str(timestamp, &self.time_format) {
			Ok(stamp) => stamp,
			Err(e) => {
				warn!("TimestampTransform could not format timestamp: {}", e);
				return None;
			}
		};
		Some(Payload::Text(format!("{} {}", stamp, text)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn text(s: &str) -> Payload {
		Payload::Text(s.to_owned())
	}

	fn output_of(result: Option<Payload>) -> String {
		match result {
			Some(Payload::Text(s)) => s,
			other => panic!("expected text, got {:?}", other),
		}
	}

	#[test]
	fn default_stamps_with_system_time() {
		let mut t = TimestampTransform::new();
		let out = output_of(t.transform(text("blah")));
		let stamp = out.split(' ').next().unwrap();
		let then = timeutil::timestamp(stamp, timeutil::TIME_FORMAT).unwrap();
		assert!((then - timeutil::now()).abs() < 5.0);
		assert!(out.ends_with(" blah"));
	}

	#[test]
	fn list_members_share_a_stamp_shape() {
		let mut t = TimestampTransform::new();
		let result = t.transform(Payload::Batch(vec![text("foo"), text("bar")]));
		match result.unwrap() {
			Payload::Batch(items) => assert_eq!(items.len(), 2),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn custom_date_format() {
		let mut t = TimestampTransform::with_format(timeutil::DATE_FORMAT);
		let out = output_of(t.transform(text("blah")));
		assert_eq!(out.split(' ').next().unwrap(), timeutil::date_str(timeutil::now()));
	}

	#[test]
	fn gga_time_is_extracted() {
		let mut t = TimestampTransform::with_nmea(DEFAULT_NMEA_TIMEOUT);
		let record = "$GPGGA,123456.00,4807.038,N,01131.000,E,1,08,0.9,545.4,M,,,,*47";
		let out = output_of(t.transform(text(record)));
		assert!(out.contains("12:34:56"), "got {}", out);
		assert!(out.ends_with(record));
	}

	#[test]
	fn rmc_carries_its_own_date() {
		let mut t = TimestampTransform::with_nmea(DEFAULT_NMEA_TIMEOUT);
		let record = "$GPRMC,083559.00,A,4717.115,N,00833.912,E,0.0,0.0,130723,,,A*xx";
		let out = output_of(t.transform(text(record)));
		assert!(out.contains("2023-07-13"), "got {}", out);
		assert!(out.contains("08:35:59"), "got {}", out);
	}

	#[test]
	fn zda_carries_its_own_date() {
		let mut t = TimestampTransform::with_nmea(DEFAULT_NMEA_TIMEOUT);
		let out = output_of(t.transform(text("$GPZDA,160012.71,11,03,2025,00,00*6C")));
		assert!(out.contains("2025-03-11"), "got {}", out);
		assert!(out.contains("16:00:12"), "got {}", out);
	}

	#[test]
	fn gll_time_is_extracted() {
		let mut t = TimestampTransform::with_nmea(DEFAULT_NMEA_TIMEOUT);
		let out = output_of(t.transform(text("$GPGLL,4916.45,N,12311.12,W,225444.00,A,*xx")));
		assert!(out.contains("22:54:44"), "got {}", out);
	}

	#[test]
	fn psxn26_full_datetime() {
		let mut t = TimestampTransform::with_nmea(DEFAULT_NMEA_TIMEOUT);
		let out = output_of(t.transform(text("$PSXN,26,2025,03,15,09,15,00.50*xx")));
		assert!(out.contains("2025-03-15"), "got {}", out);
		assert!(out.contains("09:15:00"), "got {}", out);
	}

	#[test]
	fn pashr_time_is_extracted() {
		let mut t = TimestampTransform::with_nmea(DEFAULT_NMEA_TIMEOUT);
		let record = "$PASHR,113000.00,123.4,T,1.2,-0.5,0.3,0.1,0.1,0.2,1,0*xx";
		let out = output_of(t.transform(text(record)));
		assert!(out.contains("11:30:00"), "got {}", out);
	}

	#[test]
	fn timeless_sentence_falls_back_to_last_nmea() {
		let mut t = TimestampTransform::with_nmea(DEFAULT_NMEA_TIMEOUT);
		t.transform(text("$GPGGA,140000.00,,,,,,,,,,,,,*xx"));
		let vtg = "$GPVTG,054.7,T,034.4,M,005.5,N,010.2,K*xx";
		let out = output_of(t.transform(text(vtg)));
		assert!(out.contains("14:00:00"), "got {}", out);
		assert!(out.ends_with(vtg));
	}

	#[test]
	fn stale_nmea_falls_back_to_system_time() {
		let mut t = TimestampTransform::with_nmea(2.0);
		t.transform(text("$GPGGA,140000.00,,,,,,,,,,,,,*xx"));
		t.nmea_extractor.last_nmea_system_time = timeutil::now() - 10.0;

		let out = output_of(t.transform(text("$GPVTG,054.7,T,034.4,M,005.5,N,010.2,K*xx")));
		let stamp = out.split(' ').next().unwrap();
		let ts = timeutil::timestamp(stamp, timeutil::TIME_FORMAT).unwrap();
		assert!((ts - timeutil::now()).abs() < 5.0);
	}

	#[test]
	fn nmea_disabled_by_default() {
		let mut t = TimestampTransform::new();
		let out = output_of(t.transform(text("$GPGGA,000000.00,,,,,,,,,,,,,*xx")));
		let stamp = out.split(' ').next().unwrap();
		let ts = timeutil::timestamp(stamp, timeutil::TIME_FORMAT).unwrap();
		assert!((ts - timeutil::now()).abs() < 5.0);
	}
}
