//! Subsampling: like interpolation, but each output field advances on its
//! own last-emitted watermark instead of a transform-wide next timestamp.

use super::Transform;
use crate::record::{Fields, Payload, Record, Value};
use std::collections::HashMap;
use tracing::*;

#[derive(Clone, Debug)]
pub struct SubsampleAlgorithm {
	pub interval: f64,
	pub window: f64,
}

/// Omnibus subsampling routine: given `(ts, value)` pairs, the timestamp
/// last emitted for this field, and the present data horizon, return the
/// list of `(ts, value)` averages ready for emission.
pub fn subsample(
	algorithm: &SubsampleAlgorithm,
	values: &[(f64, Value)],
	last_emitted: f64,
	now: f64,
) -> Vec<(f64, f64)> {
	if values.is_empty() {
		debug!("subsample() handed empty values list");
		return vec![];
	}

	// Start an interval past the last emission (or half a window past the
	// oldest data) and stop half a window short of now, so every point
	// gets a full window.
	let mut ts = (last_emitted + algorithm.interval).max(values[0].0 + algorithm.window / 2.0);
	let mut ts_list = Vec::new();
	while ts <= now - algorithm.window / 2.0 {
		ts_list.push(ts);
		ts += algorithm.interval;
	}
	if ts_list.is_empty() {
		debug!("No timestamps to emit this time");
		return vec![];
	}

	let mut results = Vec::new();
	for ts in ts_list {
		let start = ts - algorithm.window / 2.0;
		let end = ts + algorithm.window / 2.0;
		let mut sum = 0.0;
		let mut count = 0usize;
		for (value_ts, value) in values {
			if *value_ts <= start || *value_ts >= end {
				continue;
			}
			match value.as_number() {
				Some(number) => {
					sum += number;
					count += 1;
				}
				None => {
					warn!("Non-numeric input in subsample: {:?}", value.to_string());
				}
			}
		}
		if count > 0 {
			results.push((ts, sum / count as f64));
		}
	}
	results
}

#[derive(Clone, Debug, serde::Deserialize)]
struct SubsampleAlgorithmConfig {
	#[serde(rename = "type")]
	type_name: String,
	#[serde(default = "default_interval")]
	interval: f64,
	#[serde(default = "default_window")]
	window: f64,
}

fn default_interval() -> f64 {
	10.0
}

fn default_window() -> f64 {
	10.0
}

#[derive(Clone, Debug, serde::Deserialize)]
struct SubsampleFieldSpec {
	source: String,
	algorithm: SubsampleAlgorithmConfig,
}

#[derive(serde::Deserialize)]
struct SubsampleConfig {
	field_spec: std::collections::BTreeMap<String, SubsampleFieldSpec>,
	#[serde(default)]
	data_id: Option<String>,
}

struct SubsampleOutput {
	source: String,
	algorithm: SubsampleAlgorithm,
	last_emitted: f64,
}

pub struct SubsampleTransform {
	outputs: Vec<(String, SubsampleOutput)>,
	data_id: Option<String>,
	cached_values: HashMap<String, Vec<(f64, Value)>>,
	latest_timestamp: f64,
}

impl SubsampleTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: SubsampleConfig = serde_json::from_value(kwargs.clone())?;
		let mut outputs = Vec::new();
		for (result_field, spec) in &config.field_spec {
			if spec.algorithm.type_name != "boxcar_average" {
				anyhow::bail!(
					"unrecognized subsample algorithm type {:?}",
					spec.algorithm.type_name
				);
			}
			outputs.push((
				result_field.clone(),
				SubsampleOutput {
					source: spec.source.clone(),
					algorithm: SubsampleAlgorithm {
						interval: spec.algorithm.interval,
						window: spec.algorithm.window,
					},
					last_emitted: 0.0,
				},
			));
		}
		let cached_values = outputs
			.iter()
			.map(|(_, output)| (output.source.clone(), Vec::new()))
			.collect();
		Ok(SubsampleTransform {
			outputs,
			data_id: config.data_id,
			cached_values,
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
}

impl Transform for SubsampleTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		for record in crate::record::to_record_list(payload) {
			self.add_record(&record);
		}

		let now = self.latest_timestamp;
		let mut emissions: Vec<(f64, String, f64)> = Vec::new();
		for (result_field, output) in &mut self.outputs {
			let cache = match self.cached_values.get_mut(&output.source) {
				Some(cache) => cache,
				None => continue,
			};
			let pairs = subsample(&output.algorithm, cache, output.last_emitted, now);
			if let Some((last_ts, _)) = pairs.last() {
				output.last_emitted = *last_ts;
				// Values too old to matter for the next emission can go.
				let lower_limit = output.last_emitted - output.algorithm.window / 2.0;
				let keep_from = cache
					.iter()
					.position(|(ts, _)| *ts >= lower_limit)
					.unwrap_or(cache.len());
				cache.drain(..keep_from);
			}
			for (ts, value) in pairs {
				emissions.push((ts, result_field.clone(), value));
			}
		}
		if emissions.is_empty() {
			return None;
		}

		emissions.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
		let mut records: Vec<Record> = Vec::new();
		for (ts, field, value) in emissions {
			match records.last_mut() {
				Some(last) if last.timestamp == ts => {
					last.fields.insert(field, Value::Float(value));
				}
				_ => {
					let mut fields = Fields::new();
					fields.insert(field, Value::Float(value));
					let mut record = Record::with_fields(ts, fields);
					record.data_id = self.data_id.clone();
					records.push(record);
				}
			}
		}
		Payload::from_records(records)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pairs(values: &[(f64, f64)]) -> Vec<(f64, Value)> {
		values.iter().map(|(ts, v)| (*ts, Value::Float(*v))).collect()
	}

	#[test]
	fn emits_windowed_averages() {
		let algorithm = SubsampleAlgorithm {
			interval: 10.0,
			window: 10.0,
		};
		let values = pairs(&[
			(0.0, 1.0),
			(2.0, 3.0),
			(8.0, 5.0),
			(12.0, 7.0),
			(18.0, 9.0),
			(22.0, 11.0),
		]);
		let result = subsample(&algorithm, &values, 0.0, 30.0);
		assert!(!result.is_empty());
		// First emission an interval past last_emitted, at ts=10:
		// window (5, 15) holds values 5 and 7.
		assert_eq!(result[0].0, 10.0);
		assert!((result[0].1 - 6.0).abs() < 1e-9);
	}

	#[test]
	fn nothing_to_emit_returns_empty() {
		let algorithm = SubsampleAlgorithm {
			interval: 10.0,
			window: 10.0,
		};
		let values = pairs(&[(0.0, 1.0)]);
		assert!(subsample(&algorithm, &values, 0.0, 5.0).is_empty());
		assert!(subsample(&algorithm, &[], 0.0, 100.0).is_empty());
	}

	#[test]
	fn per_field_watermarks_advance_independently() {
		let mut t = SubsampleTransform::from_config(&serde_json::json!({
			"field_spec": {
				"AvgTemp": {
					"source": "Temp",
					"algorithm": {"type": "boxcar_average", "interval": 10, "window": 10}
				},
				"AvgSpeed": {
					"source": "Speed",
					"algorithm": {"type": "boxcar_average", "interval": 20, "window": 10}
				}
			}
		}))
		.unwrap();

		let mut emitted: Vec<Record> = Vec::new();
		for i in 0..20 {
			let ts = 1000.0 + 5.0 * i as f64;
			let mut fields = Fields::new();
			fields.insert("Temp".to_owned(), Value::Float(20.0 + i as f64));
			fields.insert("Speed".to_owned(), Value::Float(10.0));
			if let Some(payload) = t.transform(Payload::Record(Record::with_fields(ts, fields))) {
				emitted.extend(crate::record::to_record_list(payload));
			}
		}
		let temp_count = emitted.iter().filter(|r| r.fields.contains_key("AvgTemp")).count();
		let speed_count = emitted
			.iter()
			.filter(|r| r.fields.contains_key("AvgSpeed"))
			.count();
		assert!(temp_count > 0);
		assert!(speed_count > 0);
		// Twice the interval means roughly half the emissions.
		assert!(temp_count > speed_count, "{} vs {}", temp_count, speed_count);
	}

	#[test]
	fn unknown_algorithm_is_an_error() {
		let result = SubsampleTransform::from_config(&serde_json::json!({
			"field_spec": {
				"Out": {"source": "In", "algorithm": {"type": "median"}}
			}
		}));
		assert!(result.is_err());
	}
}
