//! Record-to-record operators. A transform consumes one payload and
//! returns nothing (drop), one payload, or a batch (fan-out). Batches fan
//! out element-wise through the default `transform` entry point, with None
//! results removed, so concrete transforms only handle single payloads.

pub mod basic;
pub mod convert_fields;
pub mod delta;
pub mod geofence;
pub mod interpolation;
pub mod nmea_out;
pub mod parse;
pub mod subsample;
pub mod timestamp;
pub mod true_winds;
pub mod value_filter;
pub mod xml_aggregator;

use crate::record::Payload;
use anyhow::bail;

pub trait Transform: Send + Sync {
	/// Transform a single (non-batch) payload.
	fn process(&mut self, payload: Payload) -> Option<Payload>;

	/// Entry point: applies element-wise to batches, dropping Nones.
	fn transform(&mut self, payload: Payload) -> Option<Payload> {
		match payload {
			Payload::Batch(items) => {
				let results: Vec<Payload> = items
					.into_iter()
					.filter_map(|item| self.transform(item))
					.collect();
				if results.is_empty() {
					None
				} else {
					Some(Payload::Batch(results))
				}
			}
			other => self.process(other),
		}
	}
}

/// Latest-value cache for one input of a stateful multi-input transform.
/// A newer-or-equal timestamp wins; strictly older updates are dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct LatestValue {
	pub value: Option<f64>,
	pub timestamp: f64,
}

impl LatestValue {
	/// Returns true if the update was accepted.
	pub fn update(&mut self, timestamp: f64, value: f64) -> bool {
		if timestamp >= self.timestamp {
			self.value = Some(value);
			self.timestamp = timestamp;
			true
		} else {
			false
		}
	}
}

/// Instantiate a transform from a `{class, kwargs}` spec. Unknown class
/// names are a configuration error at load time.
pub fn build(spec: &serde_json::Value) -> anyhow::Result<Box<dyn Transform>> {
	let class = match spec.get("class").and_then(|v| v.as_str()) {
		Some(class) => class,
		None => bail!("transform spec is missing a \"class\" name: {}", spec),
	};
	let kwargs = match spec.get("kwargs") {
		None | Some(serde_json::Value::Null) => serde_json::json!({}),
		Some(kwargs) => kwargs.clone(),
	};

	let transform: Box<dyn Transform> = match class {
		"PrefixTransform" => Box::new(basic::PrefixTransform::from_config(&kwargs)?),
		"StripTransform" => Box::new(basic::StripTransform::from_config(&kwargs)?),
		"SplitTransform" => Box::new(basic::SplitTransform::from_config(&kwargs)?),
		"SelectFieldsTransform" => Box::new(basic::SelectFieldsTransform::from_config(&kwargs)?),
		"RenameFieldsTransform" => Box::new(basic::RenameFieldsTransform::from_config(&kwargs)?),
		"ExtractFieldTransform" => Box::new(basic::ExtractFieldTransform::from_config(&kwargs)?),
		"FormatTransform" => Box::new(basic::FormatTransform::from_config(&kwargs)?),
		"ToJSONTransform" => Box::new(basic::ToJsonTransform::from_config(&kwargs)?),
		"FromJSONTransform" => Box::new(basic::FromJsonTransform::from_config(&kwargs)?),
		"RegexFilterTransform" => Box::new(basic::RegexFilterTransform::from_config(&kwargs)?),
		"QCFilterTransform" => Box::new(basic::QcFilterTransform::from_config(&kwargs)?),
		"CountTransform" => Box::new(basic::CountTransform::new()),
		"MaxMinTransform" => Box::new(basic::MaxMinTransform::new()),
		"ValueFilterTransform" => {
			Box::new(value_filter::ValueFilterTransform::from_config(&kwargs)?)
		}
		"ValueFilterIgnoreTransform" => {
			Box::new(value_filter::ValueFilterIgnoreTransform::from_config(&kwargs)?)
		}
		"ConvertFieldsTransform" => {
			Box::new(convert_fields::ConvertFieldsTransform::from_config(&kwargs)?)
		}
		"TimestampTransform" => Box::new(timestamp::TimestampTransform::from_config(&kwargs)?),
		"ParseTransform" | "RegexParseTransform" => {
			Box::new(parse::ParseTransform::from_config(&kwargs)?)
		}
		"TrueWindsTransform" => Box::new(true_winds::TrueWindsTransform::from_config(&kwargs)?),
		"MWDTransform" => Box::new(nmea_out::MwdTransform::from_config(&kwargs)?),
		"XDRTransform" => Box::new(nmea_out::XdrTransform::from_config(&kwargs)?),
		"InterpolationTransform" => {
			Box::new(interpolation::InterpolationTransform::from_config(&kwargs)?)
		}
		"SubsampleTransform" => Box::new(subsample::SubsampleTransform::from_config(&kwargs)?),
		"DeltaTransform" => Box::new(delta::DeltaTransform::from_config(&kwargs)?),
		"GeofenceTransform" => Box::new(geofence::GeofenceTransform::from_config(&kwargs)?),
		"XMLAggregatorTransform" => {
			Box::new(xml_aggregator::XmlAggregatorTransform::from_config(&kwargs)?)
		}
		unknown => bail!("unknown transform class {:?}", unknown),
	};
	Ok(transform)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::record::{Fields, Payload, Record, Value};

	struct AddOne;
	impl Transform for AddOne {
		fn process(&mut self, payload: Payload) -> Option<Payload> {
			match payload {
				Payload::Record(mut record) => {
					let value = record.fields.get("n").and_then(Value::as_number)?;
					if value < 0.0 {
						return None;
					}
					record.fields.insert("n".to_owned(), Value::Float(value + 1.0));
					Some(Payload::Record(record))
				}
				_ => None,
			}
		}
	}

	fn record_with_n(n: f64) -> Payload {
		let mut fields = Fields::new();
		fields.insert("n".to_owned(), Value::Float(n));
		Payload::Record(Record::with_fields(1.0, fields))
	}

	#[test]
	fn batches_fan_out_and_drop_nones() {
		let mut transform = AddOne;
		let batch = Payload::Batch(vec![record_with_n(1.0), record_with_n(-5.0), record_with_n(2.0)]);
		let result = transform.transform(batch).unwrap();
		match result {
			Payload::Batch(items) => assert_eq!(items.len(), 2),
			other => panic!("expected batch, got {:?}", other),
		}
	}

	#[test]
	fn all_dropped_batch_is_none() {
		let mut transform = AddOne;
		let batch = Payload::Batch(vec![record_with_n(-1.0), record_with_n(-2.0)]);
		assert!(transform.transform(batch).is_none());
	}

	#[test]
	fn latest_value_rejects_older_updates() {
		let mut latest = LatestValue::default();
		assert!(latest.update(10.0, 1.0));
		assert!(latest.update(10.0, 2.0));
		assert!(!latest.update(9.0, 3.0));
		assert_eq!(latest.value, Some(2.0));
	}

	#[test]
	fn factory_rejects_unknown_class() {
		assert!(build(&serde_json::json!({"class": "NoSuchTransform"})).is_err());
		assert!(build(&serde_json::json!({"kwargs": {}})).is_err());
	}
}
