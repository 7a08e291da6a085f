//! NMEA sentence emitters: MWD (true wind direction and speed) and XDR
//! (transducer measurements), with standard XOR checksums.

use super::Transform;
use crate::record::{Payload, Record, Value};
use tracing::*;

/// Hex checksum for the body of an NMEA sentence.
pub fn nmea_checksum(body: &str) -> String {
	let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
	format!("{:02X}", checksum)
}

fn wrap_sentence(body: String) -> String {
	let checksum = nmea_checksum(&body);
	format!("${}*{}\r\n", body, checksum)
}

////////////////////////////////////////////////////////////////////////////
/// Emit a `$--MWD` sentence from true wind values, with the magnetic
/// direction filled in only once a magnetic variation has been seen.
pub struct MwdTransform {
	config: MwdConfig,
	true_wind_dir: Option<f64>,
	true_wind_speed_kt: Option<f64>,
	true_wind_speed_ms: Option<f64>,
	magnetic_variation: Option<f64>,
}

#[derive(serde::Deserialize)]
pub struct MwdConfig {
	pub true_wind_dir_field: String,
	#[serde(default)]
	pub true_wind_speed_kt_field: Option<String>,
	#[serde(default)]
	pub true_wind_speed_ms_field: Option<String>,
	#[serde(default)]
	pub magnetic_variation_field: Option<String>,
	#[serde(default = "default_mwd_talker")]
	pub talker_id: String,
}

fn default_mwd_talker() -> String {
	"ALMWD".to_owned()
}

const KNOTS_TO_MS: f64 = 0.514444;
const MS_TO_KNOTS: f64 = 1.94384;

impl MwdTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: MwdConfig = serde_json::from_value(kwargs.clone())?;
		if config.true_wind_speed_kt_field.is_none() && config.true_wind_speed_ms_field.is_none()
		{
			anyhow::bail!(
				"MWDTransform: must specify either true_wind_speed_kt_field \
				 or true_wind_speed_ms_field"
			);
		}
		Ok(MwdTransform {
			config,
			true_wind_dir: None,
			true_wind_speed_kt: None,
			true_wind_speed_ms: None,
			magnetic_variation: None,
		})
	}

	fn absorb(&mut self, record: &Record) {
		let get = |name: &Option<String>| {
			name.as_ref()
				.and_then(|n| record.fields.get(n))
				.and_then(Value::as_number)
		};
		if let Some(dir) = record
			.fields
			.get(&self.config.true_wind_dir_field)
			.and_then(Value::as_number)
		{
			self.true_wind_dir = Some(dir);
		}
		if let Some(kt) = get(&self.config.true_wind_speed_kt_field) {
			self.true_wind_speed_kt = Some(kt);
		}
		if let Some(ms) = get(&self.config.true_wind_speed_ms_field) {
			self.true_wind_speed_ms = Some(ms);
		}
		if let Some(var) = get(&self.config.magnetic_variation_field) {
			self.magnetic_variation = Some(var);
		}
	}
}

impl Transform for MwdTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		for record in crate::record::to_record_list(payload) {
			self.absorb(&record);
		}

		let dir = self.true_wind_dir?;
		if self.true_wind_speed_kt.is_none() && self.true_wind_speed_ms.is_none() {
			debug!("MWDTransform does not yet have a wind speed - skipping");
			return None;
		}
		let kt = self
			.true_wind_speed_kt
			.or_else(|| self.true_wind_speed_ms.map(|ms| ms * MS_TO_KNOTS))?;
		let ms = self
			.true_wind_speed_ms
			.or_else(|| self.true_wind_speed_kt.map(|kt| kt * KNOTS_TO_MS))?;

		let mag = match self.magnetic_variation {
			Some(variation) => format!("{:.1}", dir - variation),
			None => String::new(),
		};

		let body = format!(
			"{},{:.1},T,{},M,{:.1},N,{:.1},M",
			self.config.talker_id, dir, mag, kt, ms
		);
		Some(Payload::Text(wrap_sentence(body)))
	}
}

////////////////////////////////////////////////////////////////////////////
/// Emit `$--XDR` sentences for whichever transducer values are present:
/// barometric pressure, air temperature and water temperature. Multiple
/// sentences are concatenated into a single record.
pub struct XdrTransform {
	config: XdrConfig,
}

#[derive(serde::Deserialize)]
pub struct XdrConfig {
	#[serde(default)]
	pub barometer_field: Option<String>,
	#[serde(default)]
	pub barometer_output_field: Option<String>,
	#[serde(default)]
	pub air_temp_field: Option<String>,
	#[serde(default)]
	pub air_temp_output_field: Option<String>,
	#[serde(default)]
	pub sea_temp_field: Option<String>,
	#[serde(default)]
	pub sea_temp_output_field: Option<String>,
	#[serde(default = "default_xdr_talker")]
	pub talker_id: String,
}

fn default_xdr_talker() -> String {
	"ALXDR".to_owned()
}

impl XdrTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: XdrConfig = serde_json::from_value(kwargs.clone())?;
		Ok(XdrTransform { config })
	}
}

impl Transform for XdrTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let records = crate::record::to_record_list(payload);
		let mut result = String::new();

		for record in &records {
			let lookup = |field: &Option<String>| {
				field
					.as_ref()
					.and_then(|name| record.fields.get(name))
					.and_then(Value::as_number)
			};
			if let Some(pressure) = lookup(&self.config.barometer_field) {
				let name = self
					.config
					.barometer_output_field
					.as_ref()
					.or_else(|| self.config.barometer_field.as_ref())
					.cloned()
					.unwrap_or_default();
				result.push_str(&wrap_sentence(format!(
					"{},P,{},B,{}",
					self.config.talker_id, pressure, name
				)));
			}
			if let Some(temp) = lookup(&self.config.air_temp_field) {
				let name = self
					.config
					.air_temp_output_field
					.as_ref()
					.or_else(|| self.config.air_temp_field.as_ref())
					.cloned()
					.unwrap_or_default();
				result.push_str(&wrap_sentence(format!(
					"{},C,{:.2},C,{}",
					self.config.talker_id, temp, name
				)));
			}
			if let Some(temp) = lookup(&self.config.sea_temp_field) {
				let name = self
					.config
					.sea_temp_output_field
					.as_ref()
					.or_else(|| self.config.sea_temp_field.as_ref())
					.cloned()
					.unwrap_or_default();
				result.push_str(&wrap_sentence(format!(
					"{},C,{:.2},C,{}",
					self.config.talker_id, temp, name
				)));
			}
		}

		if result.is_empty() {
			None
		} else {
			Some(Payload::Text(result))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::record::Fields;

	fn record(fields: &[(&str, f64)]) -> Payload {
		let mut map = Fields::new();
		for (name, value) in fields {
			map.insert((*name).to_owned(), Value::Float(*value));
		}
		Payload::Record(Record::with_fields(100.0, map))
	}

	fn text_of(result: Option<Payload>) -> String {
		match result {
			Some(Payload::Text(s)) => s,
			other => panic!("expected text, got {:?}", other),
		}
	}

	#[test]
	fn checksum_matches_known_sentence() {
		// $IIXDR,C,19.52,C,TempAir*19
		assert_eq!(nmea_checksum("IIXDR,C,19.52,C,TempAir"), "19");
	}

	#[test]
	fn mwd_emits_true_only_without_variation() {
		let mut t = MwdTransform::from_config(&serde_json::json!({
			"true_wind_dir_field": "TrueWindDir",
			"true_wind_speed_kt_field": "TrueWindSpeedKt"
		}))
		.unwrap();
		assert!(t.transform(record(&[("TrueWindDir", 45.0)])).is_none());

		let out = text_of(t.transform(record(&[("TrueWindSpeedKt", 10.0)])));
		assert!(out.starts_with("$ALMWD,45.0,T,,M,10.0,N,5.1,M*"), "got {}", out);
		assert!(out.ends_with("\r\n"));
	}

	#[test]
	fn mwd_includes_magnetic_direction_when_known() {
		let mut t = MwdTransform::from_config(&serde_json::json!({
			"true_wind_dir_field": "TrueWindDir",
			"true_wind_speed_ms_field": "TrueWindSpeedMs",
			"magnetic_variation_field": "MagVar"
		}))
		.unwrap();
		let out = text_of(t.transform(record(&[
			("TrueWindDir", 100.0),
			("TrueWindSpeedMs", 5.0),
			("MagVar", 10.0),
		])));
		assert!(out.contains(",90.0,M,"), "got {}", out);
		// m/s converted to knots for the N field.
		assert!(out.contains(",9.7,N,"), "got {}", out);
	}

	#[test]
	fn xdr_emits_one_sentence_per_value() {
		let mut t = XdrTransform::from_config(&serde_json::json!({
			"barometer_field": "Pressure",
			"air_temp_field": "AirTemp",
			"sea_temp_field": "SeaTemp"
		}))
		.unwrap();
		let out = text_of(t.transform(record(&[("AirTemp", 19.52), ("SeaTemp", 12.0)])));
		let lines: Vec<&str> = out.split("\r\n").filter(|l| !l.is_empty()).collect();
		assert_eq!(lines.len(), 2);
		assert!(lines[0].contains("C,19.52,C,AirTemp"), "got {}", lines[0]);
		assert!(lines[1].contains("C,12.00,C,SeaTemp"), "got {}", lines[1]);

		assert!(t.transform(record(&[("Other", 1.0)])).is_none());
	}
}
