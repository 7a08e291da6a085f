//! The universal data envelope flowing through the pipeline, plus the
//! `Payload` sum type that lets text and structured records share one
//! dataflow.

use crate::timeutil;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::*;

/// Scalar field value. Deserialization order matters: integers must be
/// tried before floats so `42` stays an `Int`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Value {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Str(String),
}

impl Value {
	/// Numeric view including bools, for watermark-style transforms.
	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Value::Int(i) => Some(*i as f64),
			Value::Float(f) => Some(*f),
			Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
			_ => None,
		}
	}

	/// Strictly numeric view, the one bounds filters use.
	pub fn as_number(&self) -> Option<f64> {
		match self {
			Value::Int(i) => Some(*i as f64),
			Value::Float(f) => Some(*f),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::Str(s) => Some(s),
			_ => None,
		}
	}

	/// Scalar view of a JSON value; arrays and objects have no place in a
	/// record's field map.
	pub fn from_json(value: &serde_json::Value) -> Option<Value> {
		match value {
			serde_json::Value::Null => Some(Value::Null),
			serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
			serde_json::Value::Number(n) => {
				if let Some(i) = n.as_i64() {
					Some(Value::Int(i))
				} else {
					n.as_f64().map(Value::Float)
				}
			}
			serde_json::Value::String(s) => Some(Value::Str(s.clone())),
			_ => None,
		}
	}

	pub fn to_json(&self) -> serde_json::Value {
		match self {
			Value::Null => serde_json::Value::Null,
			Value::Bool(b) => serde_json::Value::Bool(*b),
			Value::Int(i) => serde_json::Value::from(*i),
			Value::Float(f) => serde_json::Value::from(*f),
			Value::Str(s) => serde_json::Value::from(s.clone()),
		}
	}

	pub fn type_name(&self) -> &'static str {
		match self {
			Value::Null => "null",
			Value::Bool(_) => "bool",
			Value::Int(_) => "int",
			Value::Float(_) => "float",
			Value::Str(_) => "str",
		}
	}
}

impl std::fmt::Display for Value {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Value::Null => f.write_str(""),
			Value::Bool(b) => write!(f, "{}", b),
			Value::Int(i) => write!(f, "{}", i),
			Value::Float(v) => write!(f, "{}", v),
			Value::Str(s) => f.write_str(s),
		}
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Int(v)
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Value::Float(v)
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Bool(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::Str(v.to_owned())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::Str(v)
	}
}

pub type Fields = BTreeMap<String, Value>;
pub type FieldMetadata = BTreeMap<String, String>;

/// Structured representation of the field names, values and metadata
/// contained in a sensor record. Canonical JSON keeps exactly these five
/// keys in this order.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Record {
	pub data_id: Option<String>,
	pub message_type: Option<String>,
	#[serde(default)]
	pub timestamp: f64,
	#[serde(default)]
	pub fields: Fields,
	#[serde(default)]
	pub metadata: BTreeMap<String, FieldMetadata>,
}

impl Record {
	/// Build a record; a zero timestamp is replaced with the current time.
	pub fn new(
		data_id: Option<String>,
		message_type: Option<String>,
		timestamp: f64,
		fields: Fields,
	) -> Self {
		let timestamp = if timestamp == 0.0 {
			timeutil::now()
		} else {
			timestamp
		};
		Record {
			data_id,
			message_type,
			timestamp,
			fields,
			metadata: BTreeMap::new(),
		}
	}

	pub fn with_fields(timestamp: f64, fields: Fields) -> Self {
		Self::new(None, None, timestamp, fields)
	}

	pub fn from_json(json_str: &str) -> Result<Record, serde_json::Error> {
		serde_json::from_str(json_str)
	}

	pub fn as_json(&self) -> String {
		serde_json::to_string(self).expect("record serialization cannot fail")
	}
}

/// What flows along a dataflow edge: a raw text record, a structured
/// record, or a batch to be fanned out element-wise.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
	Text(String),
	Record(Record),
	Batch(Vec<Payload>),
}

impl Payload {
	pub fn from_records(records: Vec<Record>) -> Option<Payload> {
		let mut payloads: Vec<Payload> = records.into_iter().map(Payload::Record).collect();
		match payloads.len() {
			0 => None,
			1 => payloads.pop(),
			_ => Some(Payload::Batch(payloads)),
		}
	}

	/// A short rendering for diagnostics; batches show their length only.
	pub fn describe(&self) -> String {
		match self {
			Payload::Text(s) => {
				let mut s = s.clone();
				s.truncate(80);
				s
			}
			Payload::Record(r) => format!("record from {:?}", r.data_id),
			Payload::Batch(items) => format!("batch of {}", items.len()),
		}
	}
}

/// Normalize a payload into a list of `Record`s.
///
/// Accepts a single record, a batch, or text holding JSON in either the
/// canonical record shape, a `{timestamp, fields}` dict, or a field dict of
/// `{field_name: [(ts, value), ...]}` pairs which is re-sorted into
/// per-timestamp records.
pub fn to_record_list(payload: Payload) -> Vec<Record> {
	match payload {
		Payload::Record(r) => vec![r],
		Payload::Batch(items) => items.into_iter().flat_map(to_record_list).collect(),
		Payload::Text(text) => match serde_json::from_str::<serde_json::Value>(&text) {
			Ok(value) => records_from_json(&value),
			Err(_) => {
				error!("Unable to normalize text into records: {:?}", text);
				vec![]
			}
		},
	}
}

/// Normalize a parsed JSON value into a list of `Record`s; see
/// [`to_record_list`] for the accepted shapes.
pub fn records_from_json(value: &serde_json::Value) -> Vec<Record> {
	let map = match value {
		serde_json::Value::Object(map) => map,
		serde_json::Value::Array(items) => {
			return items.iter().flat_map(records_from_json).collect();
		}
		other => {
			error!("Unknown type of input passed to records_from_json: {}", other);
			return vec![];
		}
	};

	// A single record dict is easy.
	if map.contains_key("timestamp") && map.contains_key("fields") {
		match serde_json::from_value::<Record>(value.clone()) {
			Ok(record) => return vec![record],
			Err(e) => {
				error!("Badly-structured record dict: {}: {}", e, value);
				return vec![];
			}
		}
	}

	// Otherwise assume a field dict: each field carries its own
	// (timestamp, value) pairs. Regroup by timestamp, oldest first.
	let mut pairs: Vec<(f64, String, Value)> = Vec::new();
	for (field, ts_value_list) in map {
		let list = match ts_value_list.as_array() {
			Some(list) => list,
			None => {
				warn!(
					"Expected field_name: [(timestamp, value),...] pairs, found {}: {}",
					field, ts_value_list
				);
				continue;
			}
		};
		for entry in list {
			let pair = entry.as_array().filter(|p| p.len() == 2);
			let (ts, val) = match pair {
				Some(p) => (p[0].as_f64(), Value::from_json(&p[1])),
				None => (None, None),
			};
			match (ts, val) {
				(Some(ts), Some(val)) => pairs.push((ts, field.clone(), val)),
				_ => {
					error!("Badly-structured field dictionary entry: {}: {}", field, entry);
					return vec![];
				}
			}
		}
	}

	pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

	let mut results: Vec<Record> = Vec::new();
	for (ts, field, val) in pairs {
		match results.last_mut() {
			Some(last) if last.timestamp == ts => {
				last.fields.insert(field, val);
			}
			_ => {
				let mut fields = Fields::new();
				fields.insert(field, val);
				results.push(Record::with_fields(ts, fields));
			}
		}
	}
	results
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_record() -> Record {
		let mut fields = Fields::new();
		fields.insert("F1".to_owned(), Value::Float(4.26));
		fields.insert("F2".to_owned(), Value::Int(42));
		fields.insert("F3".to_owned(), Value::Str("knots".to_owned()));
		fields.insert("F4".to_owned(), Value::Bool(true));
		let mut record = Record::new(Some("gyr1".to_owned()), None, 1691410658.0, fields);
		let mut meta = FieldMetadata::new();
		meta.insert("units".to_owned(), "degrees".to_owned());
		record.metadata.insert("F1".to_owned(), meta);
		record
	}

	#[test]
	fn json_round_trip_is_identity() {
		let record = sample_record();
		let back = Record::from_json(&record.as_json()).unwrap();
		assert_eq!(record, back);
	}

	#[test]
	fn canonical_json_has_all_keys() {
		let record = sample_record();
		let value: serde_json::Value = serde_json::from_str(&record.as_json()).unwrap();
		for key in &["data_id", "message_type", "timestamp", "fields", "metadata"] {
			assert!(value.get(*key).is_some(), "missing key {}", key);
		}
		assert!(value["message_type"].is_null());
	}

	#[test]
	fn zero_timestamp_becomes_now() {
		let record = Record::new(None, None, 0.0, Fields::new());
		assert!((record.timestamp - crate::timeutil::now()).abs() < 5.0);
	}

	#[test]
	fn normalizes_single_record_dict() {
		let records = records_from_json(&serde_json::json!({
			"timestamp": 10.0,
			"fields": {"speed": 12.5}
		}));
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].timestamp, 10.0);
		assert_eq!(records[0].fields.get("speed"), Some(&Value::Float(12.5)));
	}

	#[test]
	fn normalizes_field_dict_sorted_by_timestamp() {
		let records = records_from_json(&serde_json::json!({
			"temp": [[3.0, 21.5], [1.0, 20.0]],
			"speed": [[1.0, 9.0], [2.0, 9.5]]
		}));
		let timestamps: Vec<f64> = records.iter().map(|r| r.timestamp).collect();
		assert_eq!(timestamps, vec![1.0, 2.0, 3.0]);
		// Both fields observed at t=1 share one record.
		assert_eq!(records[0].fields.len(), 2);
	}

	#[test]
	fn int_values_stay_ints_through_json() {
		let record = Record::from_json(
			r#"{"data_id": null, "message_type": null, "timestamp": 1.0,
			    "fields": {"n": 7, "x": 7.5}, "metadata": {}}"#,
		)
		.unwrap();
		assert_eq!(record.fields.get("n"), Some(&Value::Int(7)));
		assert_eq!(record.fields.get("x"), Some(&Value::Float(7.5)));
	}
}
