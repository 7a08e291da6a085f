//! Multi-field interpolation: cache timestamped source values and emit
//! interpolated output fields on a fixed interval, each computed over a
//! symmetric window around the emission timestamp.

use super::Transform;
use crate::record::{Fields, Payload, Record, Value};
use std::collections::HashMap;
use tracing::*;

const DEFAULT_ALGORITHM_WINDOW: f64 = 10.0;

#[derive(Clone, Debug)]
pub enum Algorithm {
	/// Arithmetic mean of everything inside the window.
	BoxcarAverage { window: f64 },
	/// Value of the nearest timestamp; ties go to the earlier one.
	Nearest,
	/// Mean on the unit circle, continuous across the 0/360 wraparound.
	PolarAverage { window: f64 },
}

/// Compute an interpolated value at `timestamp` from `(ts, value)` pairs.
/// Returns None when there is no data in the window; non-numeric values
/// where numbers are required log an error and return None.
pub fn interpolate(algorithm: &Algorithm, values: &[(f64, Value)], timestamp: f64) -> Option<Value> {
	if values.is_empty() {
		debug!("interpolate() handed empty values list");
		return None;
	}
	match algorithm {
		Algorithm::BoxcarAverage { window } => {
			let in_window = window_values(values, timestamp, *window)?;
			Some(Value::Float(in_window.iter().sum::<f64>() / in_window.len() as f64))
		}
		Algorithm::Nearest => {
			let mut best_distance = f64::INFINITY;
			let mut best = None;
			for (ts, value) in values {
				let distance = (ts - timestamp).abs();
				if distance <= best_distance {
					best_distance = distance;
					best = Some(value.clone());
				} else {
					// Timestamps are ordered; once distance grows, stop.
					break;
				}
			}
			best
		}
		Algorithm::PolarAverage { window } => {
			let in_window = window_values(values, timestamp, *window)?;
			let count = in_window.len() as f64;
			let sin_mean = in_window.iter().map(|v| v.to_radians().sin()).sum::<f64>() / count;
			let cos_mean = in_window.iter().map(|v| v.to_radians().cos()).sum::<f64>() / count;
			let mut angle = sin_mean.atan2(cos_mean).to_degrees();
			if angle < 0.0 {
				angle += 360.0;
			}
			Some(Value::Float(angle))
		}
	}
}

fn window_values(values: &[(f64, Value)], timestamp: f64, window: f64) -> Option<Vec<f64>> {
	let lower = timestamp - window / 2.0;
	let upper = timestamp + window / 2.0;
	let mut result = Vec::new();
	for (ts, value) in values {
		if *ts < lower || *ts > upper {
			continue;
		}
		match value.as_number() {
			Some(number) => result.push(number),
			None => {
				error!("Non-numeric value in interpolation list: {:?}", value.to_string());
				return None;
			}
		}
	}
	if result.is_empty() {
		None
	} else {
		Some(result)
	}
}

#[derive(Clone, Debug)]
struct OutputSpec {
	source: String,
	algorithm: Algorithm,
}

#[derive(Clone, Debug, serde::Deserialize)]
struct AlgorithmConfig {
	#[serde(rename = "type")]
	type_name: String,
	#[serde(default)]
	window: Option<f64>,
}

#[derive(Clone, Debug, serde::Deserialize)]
struct FieldSpecEntry {
	source: String,
	algorithm: AlgorithmConfig,
}

#[derive(Clone, Debug, serde::Deserialize)]
struct FieldSpecListEntry {
	sources: Vec<String>,
	algorithm: String,
	#[serde(default)]
	window: Option<f64>,
	result_prefix: String,
}

/// Field specs come in a mapping form (`output: {source, algorithm}`) and
/// a templating-friendly list form expanding `result_prefix` + source.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(untagged)]
enum FieldSpecConfig {
	Map(std::collections::BTreeMap<String, FieldSpecEntry>),
	List(Vec<FieldSpecListEntry>),
}

#[derive(serde::Deserialize)]
struct InterpolationConfig {
	field_spec: FieldSpecConfig,
	interval: f64,
	window: f64,
	#[serde(default)]
	data_id: Option<String>,
}

pub struct InterpolationTransform {
	field_spec: Vec<(String, OutputSpec)>,
	interval: f64,
	window: f64,
	data_id: Option<String>,
	cached_values: HashMap<String, Vec<(f64, Value)>>,
	next_timestamp: f64,
	latest_timestamp: f64,
}

fn parse_algorithm(config: &AlgorithmConfig) -> anyhow::Result<Algorithm> {
	let window = config.window.unwrap_or(DEFAULT_ALGORITHM_WINDOW);
	match config.type_name.as_str() {
		"boxcar_average" => Ok(Algorithm::BoxcarAverage { window }),
		"nearest" => Ok(Algorithm::Nearest),
		"polar_average" => Ok(Algorithm::PolarAverage { window }),
		other => anyhow::bail!("unrecognized interpolation algorithm type {:?}", other),
	}
}

impl InterpolationTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: InterpolationConfig = serde_json::from_value(kwargs.clone())?;
		let mut field_spec: Vec<(String, OutputSpec)> = Vec::new();
		match &config.field_spec {
			FieldSpecConfig::Map(map) => {
				for (result_field, entry) in map {
					field_spec.push((
						result_field.clone(),
						OutputSpec {
							source: entry.source.clone(),
							algorithm: parse_algorithm(&entry.algorithm)?,
						},
					));
				}
			}
			FieldSpecConfig::List(list) => {
				for entry in list {
					let algorithm = parse_algorithm(&AlgorithmConfig {
						type_name: entry.algorithm.clone(),
						window: entry.window,
					})?;
					for source in &entry.sources {
						field_spec.push((
							format!("{}{}", entry.result_prefix, source),
							OutputSpec {
								source: source.clone(),
								algorithm: algorithm.clone(),
							},
						));
					}
				}
			}
		}
		let cached_values = field_spec
			.iter()
			.map(|(_, spec)| (spec.source.clone(), Vec::new()))
			.collect();
		Ok(InterpolationTransform {
			field_spec,
			interval: config.interval,
			window: config.window,
			data_id: config.data_id,
			cached_values,
			next_timestamp: 0.0,
			latest_timestamp: 0.0,
		})
	}

	fn add_record(&mut self, record: &Record) {
		for (field, value) in &record.fields {
			if let Some(cache) = self.cached_values.get_mut(field) {
				cache.push((record.timestamp, value.clone()));
			}
		}
		self.latest_timestamp = self.latest_timestamp.max(record.timestamp);
	}

	fn oldest_cached(&self) -> Option<f64> {
		self.cached_values
			.values()
			.filter_map(|cache| cache.first().map(|(ts, _)| *ts))
			.fold(None, |acc, ts| Some(acc.map_or(ts, |a: f64| a.min(ts))))
	}

	fn clean_cache(&mut self) {
		let lower_limit = self.next_timestamp - self.window / 2.0;
		for cache in self.cached_values.values_mut() {
			let keep_from = cache
				.iter()
				.position(|(ts, _)| *ts >= lower_limit)
				.unwrap_or(cache.len());
			cache.drain(..keep_from);
		}
	}

	/// Emit every interpolation timestamp that now has a full half-window
	/// of data behind the latest cached value.
	fn emit_ready(&mut self) -> Vec<Record> {
		let mut results = Vec::new();
		loop {
			let oldest = match self.oldest_cached() {
				Some(oldest) => oldest,
				None => break,
			};
			let candidate =
				(self.next_timestamp + self.interval).max(oldest + self.window / 2.0);
			if candidate > self.latest_timestamp - self.window / 2.0 {
				break;
			}
			self.next_timestamp = candidate;
			self.clean_cache();

			let mut fields = Fields::new();
			for (result_field, spec) in &self.field_spec {
				let values = match self.cached_values.get(&spec.source) {
					Some(values) => values,
					None => continue,
				};
				if let Some(value) =
					interpolate(&spec.algorithm, values, self.next_timestamp)
				{
					fields.insert(result_field.clone(), value);
				}
			}
			if !fields.is_empty() {
				let mut record = Record::with_fields(self.next_timestamp, fields);
				record.data_id = self.data_id.clone();
				results.push(record);
			}
		}
		results
	}
}

impl Transform for InterpolationTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		for record in crate::record::to_record_list(payload) {
			self.add_record(&record);
		}
		Payload::from_records(self.emit_ready())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pairs(values: &[(f64, f64)]) -> Vec<(f64, Value)> {
		values.iter().map(|(ts, v)| (*ts, Value::Float(*v))).collect()
	}

	#[test]
	fn boxcar_empty_window_is_none() {
		let algorithm = Algorithm::BoxcarAverage { window: 10.0 };
		let values = pairs(&[(0.0, 1.0), (1.0, 2.0)]);
		assert!(interpolate(&algorithm, &values, 100.0).is_none());
	}

	#[test]
	fn boxcar_averages_window() {
		let algorithm = Algorithm::BoxcarAverage { window: 10.0 };
		let values = pairs(&[(0.0, 1.0), (5.0, 2.0), (10.0, 3.0), (100.0, 50.0)]);
		assert_eq!(
			interpolate(&algorithm, &values, 5.0),
			Some(Value::Float(2.0))
		);
	}

	#[test]
	fn boxcar_rejects_non_numeric() {
		let algorithm = Algorithm::BoxcarAverage { window: 10.0 };
		let values = vec![(0.0, Value::from("abc"))];
		assert!(interpolate(&algorithm, &values, 0.0).is_none());
	}

	#[test]
	fn nearest_ties_go_to_earlier() {
		let algorithm = Algorithm::Nearest;
		let values = pairs(&[(0.0, 10.0), (2.0, 20.0)]);
		assert_eq!(interpolate(&algorithm, &values, 1.0), Some(Value::Float(10.0)));
		assert_eq!(interpolate(&algorithm, &values, 1.9), Some(Value::Float(20.0)));
	}

	#[test]
	fn polar_average_handles_wraparound() {
		let algorithm = Algorithm::PolarAverage { window: 100.0 };
		let degrees = [345.0, 350.0, 355.0, 0.0, 5.0, 10.0, 15.0];
		let values: Vec<(f64, Value)> = degrees
			.iter()
			.enumerate()
			.map(|(i, d)| (i as f64, Value::Float(*d)))
			.collect();
		let result = interpolate(&algorithm, &values, 3.0).unwrap();
		let angle = result.as_number().unwrap();
		let distance = (angle - 360.0).abs().min(angle);
		assert!(distance < 3.0, "angle {} too far from 0/360", angle);
		assert!((0.0..=360.0).contains(&angle));
	}

	#[test]
	fn emission_starts_half_a_window_in() {
		let mut t = InterpolationTransform::from_config(&serde_json::json!({
			"field_spec": {
				"AvgSpeed": {
					"source": "Speed",
					"algorithm": {"type": "boxcar_average", "window": 30}
				}
			},
			"interval": 10,
			"window": 30,
			"data_id": "avg"
		}))
		.unwrap();

		let t0 = 1000.0;
		let mut emitted: Vec<Record> = Vec::new();
		for i in 0..20 {
			let ts = t0 + 5.0 * i as f64;
			let mut fields = Fields::new();
			fields.insert("Speed".to_owned(), Value::Float(i as f64));
			let result = t.transform(Payload::Record(Record::with_fields(ts, fields)));
			if let Some(payload) = result {
				emitted.extend(crate::record::to_record_list(payload));
			}
		}

		assert!(!emitted.is_empty());
		let first = emitted.first().unwrap();
		let last = emitted.last().unwrap();
		let t_last = t0 + 5.0 * 19.0;
		assert!((first.timestamp - (t0 + 15.0)).abs() < 1e-6, "first at {}", first.timestamp);
		assert!(last.timestamp <= t_last - 15.0, "last at {}", last.timestamp);
		for record in &emitted {
			assert!(record.fields.contains_key("AvgSpeed"));
			assert_eq!(record.data_id.as_deref(), Some("avg"));
		}
	}

	#[test]
	fn list_form_expands_prefixes() {
		let t = InterpolationTransform::from_config(&serde_json::json!({
			"field_spec": [
				{
					"sources": ["PortWindDir", "StbdWindDir"],
					"algorithm": "polar_average",
					"window": 10,
					"result_prefix": "Avg"
				}
			],
			"interval": 10,
			"window": 30
		}))
		.unwrap();
		let outputs: Vec<&String> = t.field_spec.iter().map(|(name, _)| name).collect();
		assert!(outputs.contains(&&"AvgPortWindDir".to_owned()));
		assert!(outputs.contains(&&"AvgStbdWindDir".to_owned()));
	}

	#[test]
	fn unknown_algorithm_is_an_error() {
		let result = InterpolationTransform::from_config(&serde_json::json!({
			"field_spec": {
				"Out": {"source": "In", "algorithm": {"type": "spline"}}
			},
			"interval": 10,
			"window": 30
		}));
		assert!(result.is_err());
	}
}
