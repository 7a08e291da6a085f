//! True-wind computation from vessel course/speed/heading and relative
//! wind direction/speed, after the COAPS/WOCE-MET reference algorithm:
//! vessel and apparent-wind vectors are composed in math coordinates and
//! the result converted back to meteorological convention.

use super::{LatestValue, Transform};
use crate::record::{FieldMetadata, Fields, Payload, Record, Value};
use tracing::*;

pub struct TrueWindResult {
	pub true_dir: f64,
	pub true_speed: f64,
	pub apparent_dir: f64,
}

/// Calculate true winds. `crse`/`hd`/`wdir` are degrees, `zlr` is the
/// clockwise angle between bow and anemometer zero line. Inputs outside
/// their physical ranges yield None with a warning.
pub fn truew(
	crse: f64,
	cspd: f64,
	hd: f64,
	wdir: f64,
	wspd: f64,
	zlr: f64,
) -> Option<TrueWindResult> {
	let mut errors: Vec<String> = Vec::new();
	if !(0.0..=360.0).contains(&crse) {
		errors.push(format!("Bad course: {}", crse));
	}
	if cspd < 0.0 {
		errors.push(format!("Bad speed over ground: {}", cspd));
	}
	if !(0.0..=360.0).contains(&wdir) {
		errors.push(format!("Bad wind dir: {}", wdir));
	}
	if wspd < 0.0 {
		errors.push(format!("Bad wind speed: {}", wspd));
	}
	if !(0.0..=360.0).contains(&hd) {
		errors.push(format!("Bad heading: {}", hd));
	}
	if !(0.0..=360.0).contains(&zlr) {
		errors.push(format!("Bad zero line reference: {}", zlr));
	}
	if !errors.is_empty() {
		warn!("TrueWinds: {}", errors.join("; "));
		return None;
	}

	let dtor = std::f64::consts::PI / 180.0;

	// Navigational to math coordinates.
	let mut mcrse = 90.0 - crse;
	if mcrse <= 0.0 {
		mcrse += 360.0;
	}

	// Apparent wind direction referenced to true north.
	let mut adir = hd + wdir + zlr;
	while adir >= 360.0 {
		adir -= 360.0;
	}

	// Meteorological to math coordinates.
	let mut mwdir = 270.0 - adir;
	if mwdir <= 0.0 {
		mwdir += 360.0;
	}
	if mwdir > 360.0 {
		mwdir -= 360.0;
	}

	let x = wspd * (mwdir * dtor).cos() + cspd * (mcrse * dtor).cos();
	let y = wspd * (mwdir * dtor).sin() + cspd * (mcrse * dtor).sin();
	let tspd = (x * x + y * y).sqrt();

	let mut calm = true;
	let mtdir = if x.abs() > 1e-5 {
		y.atan2(x) / dtor
	} else if y.abs() > 1e-5 {
		180.0 - (90.0 * y) / y.abs()
	} else {
		// Winds are essentially calm; direction is not well defined.
		calm = false;
		270.0
	};

	let mut tdir = 270.0 - mtdir;
	let calm_factor = if calm { 1.0 } else { 0.0 };
	while tdir < 0.0 {
		tdir = (tdir + 360.0) * calm_factor;
	}
	while tdir > 360.0 {
		tdir = (tdir - 360.0) * calm_factor;
	}

	// WMO convention: wind from north with speed is 360, not 0.
	if calm && tdir < 1e-4 {
		tdir = 360.0;
	}

	Some(TrueWindResult {
		true_dir: tdir,
		true_speed: tspd,
		apparent_dir: adir,
	})
}

/// Stateful transform caching the latest course, speed over ground,
/// heading, relative wind dir and relative wind speed, each with its own
/// timestamp; strictly older updates are dropped. Emits derived true-wind
/// records when a field named in `update_on_fields` (default: any)
/// refreshes.
pub struct TrueWindsTransform {
	config: TrueWindsConfig,
	course: LatestValue,
	speed: LatestValue,
	heading: LatestValue,
	wind_dir: LatestValue,
	wind_speed: LatestValue,
	last_metadata_send: f64,
}

#[derive(serde::Deserialize)]
pub struct TrueWindsConfig {
	pub course_field: String,
	pub speed_field: String,
	pub heading_field: String,
	pub wind_dir_field: String,
	pub wind_speed_field: String,
	pub true_dir_name: String,
	pub true_speed_name: String,
	pub apparent_dir_name: String,
	#[serde(default)]
	pub update_on_fields: Vec<String>,
	#[serde(default)]
	pub zero_line_reference: f64,
	#[serde(default = "one")]
	pub convert_wind_factor: f64,
	#[serde(default = "one")]
	pub convert_speed_factor: f64,
	#[serde(default)]
	pub metadata_interval: Option<f64>,
}

fn one() -> f64 {
	1.0
}

impl TrueWindsTransform {
	pub fn new(config: TrueWindsConfig) -> Self {
		TrueWindsTransform {
			config,
			course: LatestValue::default(),
			speed: LatestValue::default(),
			heading: LatestValue::default(),
			wind_dir: LatestValue::default(),
			wind_speed: LatestValue::default(),
			last_metadata_send: 0.0,
		}
	}

	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		Ok(Self::new(serde_json::from_value(kwargs.clone())?))
	}

	fn metadata_fields(&self) -> Vec<(String, FieldMetadata)> {
		let sources = format!(
			"{}, {}, {}, {}, {}",
			self.config.course_field,
			self.config.speed_field,
			self.config.heading_field,
			self.config.wind_dir_field,
			self.config.wind_speed_field
		);
		let entry = |name: &str, description: String, units: &str| {
			let mut meta = FieldMetadata::new();
			meta.insert("description".to_owned(), description);
			meta.insert("units".to_owned(), units.to_owned());
			meta.insert("device".to_owned(), "TrueWindsTransform".to_owned());
			meta.insert("device_type".to_owned(), "DerivedTrueWindsTransform".to_owned());
			meta.insert("device_type_field".to_owned(), name.to_owned());
			(name.to_owned(), meta)
		};
		vec![
			entry(
				&self.config.true_dir_name,
				format!("Derived true wind direction from {}", sources),
				"degrees",
			),
			entry(
				&self.config.true_speed_name,
				format!("Derived true wind speed from {}", sources),
				"depends on speed conversion factors",
			),
			entry(
				&self.config.apparent_dir_name,
				format!("Derived apparent wind direction from {}", sources),
				"degrees",
			),
		]
	}

	fn handle(&mut self, record: Record) -> Option<Record> {
		let timestamp = record.timestamp;
		if timestamp <= 0.0 {
			info!("Record is missing timestamp - skipping");
			return None;
		}

		let mut update = self.config.update_on_fields.is_empty();
		let config = &self.config;
		let mut take = |field_name: &str, cache: &mut LatestValue, factor: f64| {
			if let Some(value) = record.fields.get(field_name).and_then(Value::as_number) {
				if cache.update(timestamp, value * factor)
					&& config.update_on_fields.iter().any(|f| f == field_name)
				{
					update = true;
				}
			}
		};
		let mut course = self.course;
		let mut speed = self.speed;
		let mut heading = self.heading;
		let mut wind_dir = self.wind_dir;
		let mut wind_speed = self.wind_speed;
		take(&config.course_field, &mut course, 1.0);
		take(&config.speed_field, &mut speed, config.convert_speed_factor);
		take(&config.heading_field, &mut heading, 1.0);
		take(&config.wind_dir_field, &mut wind_dir, 1.0);
		take(
			&config.wind_speed_field,
			&mut wind_speed,
			config.convert_wind_factor,
		);
		self.course = course;
		self.speed = speed;
		self.heading = heading;
		self.wind_dir = wind_dir;
		self.wind_speed = wind_speed;

		let (crse, cspd, hd, wdir, wspd) = match (
			self.course.value,
			self.speed.value,
			self.heading.value,
			self.wind_dir.value,
			self.wind_speed.value,
		) {
			(Some(c), Some(s), Some(h), Some(wd), Some(ws)) => (c, s, h, wd, ws),
			_ => {
				debug!("Not all required values for true winds are present");
				return None;
			}
		};

		if !update {
			debug!("No update triggered by record fields");
			return None;
		}

		let result = truew(crse, cspd, hd, wdir, wspd, self.config.zero_line_reference)?;

		let mut fields = Fields::new();
		fields.insert(
			self.config.true_dir_name.clone(),
			Value::Float(result.true_dir),
		);
		fields.insert(
			self.config.true_speed_name.clone(),
			Value::Float(result.true_speed),
		);
		fields.insert(
			self.config.apparent_dir_name.clone(),
			Value::Float(result.apparent_dir),
		);
		let mut output = Record::with_fields(timestamp, fields);

		if let Some(interval) = self.config.metadata_interval {
			if timestamp - interval > self.last_metadata_send {
				for (name, meta) in self.metadata_fields() {
					output.metadata.insert(name, meta);
				}
				self.last_metadata_send = timestamp;
			}
		}
		Some(output)
	}
}

impl Transform for TrueWindsTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let records = crate::record::to_record_list(payload);
		let results: Vec<Record> = records
			.into_iter()
			.filter_map(|record| self.handle(record))
			.collect();
		Payload::from_records(results)
	}
}
