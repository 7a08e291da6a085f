//! Per-field deltas between consecutive observations, with optional
//! polar wraparound handling and delta-per-second rates.

use super::Transform;
use crate::record::{Fields, Payload, Record, Value};
use std::collections::HashMap;
use tracing::*;

/// Signed minimal angle from `last_value` to `value` in degrees.
pub fn polar_diff(last_value: f64, value: f64) -> f64 {
	((value - last_value) + 180.0).rem_euclid(360.0) - 180.0
}

/// Which fields should be emitted as rates instead of raw deltas.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(untagged)]
pub enum RateSpec {
	All(bool),
	Fields(Vec<String>),
}

impl Default for RateSpec {
	fn default() -> Self {
		RateSpec::All(false)
	}
}

#[derive(Default, serde::Deserialize)]
#[serde(default)]
struct DeltaConfig {
	rate: RateSpec,
	field_type: Option<HashMap<String, String>>,
}

pub struct DeltaTransform {
	rate: RateSpec,
	field_type: HashMap<String, String>,
	/// field name → (previous timestamp, previous value)
	last_value: HashMap<String, (f64, Value)>,
}

impl DeltaTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: DeltaConfig = serde_json::from_value(kwargs.clone())?;
		Ok(DeltaTransform {
			rate: config.rate,
			field_type: config.field_type.unwrap_or_default(),
			last_value: HashMap::new(),
		})
	}

	fn handle(&mut self, record: Record) -> Option<Record> {
		if record.fields.is_empty() {
			info!("Record passed to DeltaTransform has no fields");
			return None;
		}
		let timestamp = record.timestamp;

		let mut delta_values = Fields::new();
		let mut rate_values = Fields::new();

		for (key, value) in &record.fields {
			match self.last_value.get(key) {
				Some((last_timestamp, last_value)) => {
					let numeric = value.as_number();
					let last_numeric = last_value.as_number();
					let delta = match (numeric, last_numeric) {
						(Some(now), Some(last)) => {
							if self.field_type.get(key).map(String::as_str) == Some("polar") {
								Some(polar_diff(last, now))
							} else {
								Some(now - last)
							}
						}
						_ => {
							info!(
								"DeltaTransform can not difference non-numeric field {:?}",
								key
							);
							None
						}
					};
					match delta {
						Some(delta) => {
							delta_values.insert(key.clone(), Value::Float(delta));
							let dt = timestamp - last_timestamp;
							if dt > 0.0 {
								rate_values.insert(key.clone(), Value::Float(delta / dt));
							}
						}
						None => {
							delta_values.insert(key.clone(), Value::Null);
						}
					}
					self.last_value
						.insert(key.clone(), (timestamp, value.clone()));
				}
				None => {
					// First observation of this field: nothing to delta.
					self.last_value
						.insert(key.clone(), (timestamp, value.clone()));
					delta_values.insert(key.clone(), Value::Null);
				}
			}
		}

		let fields = match &self.rate {
			RateSpec::All(true) => rate_values,
			RateSpec::All(false) => delta_values,
			RateSpec::Fields(rate_fields) => {
				let mut selected = Fields::new();
				for field in rate_fields {
					if let Some(value) = rate_values.get(field) {
						selected.insert(field.clone(), value.clone());
					}
				}
				selected
			}
		};
		Some(Record::with_fields(timestamp, fields))
	}
}

impl Transform for DeltaTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let records = crate::record::to_record_list(payload);
		let results: Vec<Record> = records
			.into_iter()
			.filter_map(|record| self.handle(record))
			.collect();
		Payload::from_records(results)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(ts: f64, fields: &[(&str, f64)]) -> Payload {
		let mut map = Fields::new();
		for (name, value) in fields {
			map.insert((*name).to_owned(), Value::Float(*value));
		}
		Payload::Record(Record::with_fields(ts, map))
	}

	fn fields_of(result: Option<Payload>) -> Fields {
		match result {
			Some(Payload::Record(record)) => record.fields,
			other => panic!("expected record, got {:?}", other),
		}
	}

	#[test]
	fn polar_diff_identities() {
		assert_eq!(polar_diff(5.0, 10.0), 5.0);
		assert_eq!(polar_diff(10.0, 5.0), -5.0);
		assert_eq!(polar_diff(5.0, 359.0), -6.0);
		assert_eq!(polar_diff(359.0, 5.0), 6.0);
		assert_eq!(polar_diff(90.0, 269.0), 179.0);
		assert_eq!(polar_diff(90.0, 271.0), -179.0);
	}

	#[test]
	fn first_observation_yields_null() {
		let mut t = DeltaTransform::from_config(&serde_json::json!({})).unwrap();
		let fields = fields_of(t.transform(record(1.0, &[("variable", 15.0)])));
		assert_eq!(fields.get("variable"), Some(&Value::Null));

		let fields =
			fields_of(t.transform(record(2.0, &[("variable", 20.0), ("variable2", 10.0)])));
		assert_eq!(fields.get("variable"), Some(&Value::Float(5.0)));
		assert_eq!(fields.get("variable2"), Some(&Value::Null));

		let fields =
			fields_of(t.transform(record(10.0, &[("variable", -10.0), ("variable2", 15.0)])));
		assert_eq!(fields.get("variable"), Some(&Value::Float(-30.0)));
		assert_eq!(fields.get("variable2"), Some(&Value::Float(5.0)));
	}

	#[test]
	fn rate_divides_by_time_delta() {
		let mut t = DeltaTransform::from_config(&serde_json::json!({"rate": true})).unwrap();
		t.transform(record(1.0, &[("variable", 15.0)]));

		let fields = fields_of(t.transform(record(3.0, &[("variable", 20.0)])));
		assert_eq!(fields.get("variable"), Some(&Value::Float(2.5)));

		let fields = fields_of(t.transform(record(13.0, &[("variable", -10.0)])));
		assert_eq!(fields.get("variable"), Some(&Value::Float(-3.0)));
	}

	#[test]
	fn rate_field_list_selects_outputs() {
		let mut t = DeltaTransform::from_config(
			&serde_json::json!({"rate": ["gyroheading"], "field_type": {"gyroheading": "polar"}}),
		)
		.unwrap();
		t.transform(record(1.0, &[("gyroheading", 15.0), ("seatemp", 20.0)]));
		let fields =
			fields_of(t.transform(record(3.0, &[("gyroheading", 359.0), ("seatemp", 21.0)])));
		// polar_diff(15, 359) = -16, over 2 seconds.
		assert_eq!(fields.get("gyroheading"), Some(&Value::Float(-8.0)));
		assert!(!fields.contains_key("seatemp"));
	}

	#[test]
	fn polar_fields_wrap() {
		let mut t = DeltaTransform::from_config(
			&serde_json::json!({"field_type": {"heading": "polar"}}),
		)
		.unwrap();
		t.transform(record(1.0, &[("heading", 359.0)]));
		let fields = fields_of(t.transform(record(2.0, &[("heading", 5.0)])));
		assert_eq!(fields.get("heading"), Some(&Value::Float(6.0)));
	}
}
