//! Bounds-based filtering: ValueFilter drops offending field values,
//! ValueFilterIgnore drops the whole record (and supports exact string
//! matching, warning only on the first record it filters).

use super::Transform;
use crate::record::{Payload, Value};
use std::collections::HashMap;
use tracing::*;

/// Parsed `field:lower:upper` triples, in declaration order; either bound
/// may be absent.
pub type Bounds = Vec<(String, (Option<f64>, Option<f64>))>;

/// Parse a comma-separated list of `field:lower:upper` conditions.
pub fn parse_bounds(bounds: &str) -> anyhow::Result<Bounds> {
	let mut parsed = Bounds::new();
	for condition in bounds.split(',') {
		let parts: Vec<&str> = condition.split(':').collect();
		let (field, lower, upper) = match parts.as_slice() {
			[field, lower, upper] => (*field, *lower, *upper),
			_ => anyhow::bail!(
				"bounds must be colon-separated triples of \
				 field_name:lower_bound:upper_bound; found {:?}",
				condition
			),
		};
		let parse_bound = |s: &str| -> anyhow::Result<Option<f64>> {
			if s.is_empty() {
				Ok(None)
			} else {
				Ok(Some(s.parse::<f64>().map_err(|_| {
					anyhow::anyhow!("invalid numeric bound {:?} in {:?}", s, condition)
				})?))
			}
		};
		parsed.push((field.to_owned(), (parse_bound(lower)?, parse_bound(upper)?)));
	}
	Ok(parsed)
}

////////////////////////////////////////////////////////////////////////////
/// Remove out-of-bounds (or non-numeric) field values from records.
pub struct ValueFilterTransform {
	bounds: Bounds,
}

#[derive(serde::Deserialize)]
struct ValueFilterConfig {
	bounds: String,
}

impl ValueFilterTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: ValueFilterConfig = serde_json::from_value(kwargs.clone())?;
		Ok(ValueFilterTransform {
			bounds: parse_bounds(&config.bounds)?,
		})
	}
}

impl Transform for ValueFilterTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let mut record = match payload {
			Payload::Record(record) => record,
			other => {
				info!(
					"ValueFilterTransform received non-record input: {}",
					other.describe()
				);
				return None;
			}
		};
		for (field, (lower, upper)) in &self.bounds {
			let value = match record.fields.get(field) {
				Some(value) => value,
				None => continue,
			};
			let numeric = match value.as_number() {
				Some(numeric) => numeric,
				None => {
					info!(
						"ValueFilterTransform found non-numeric value for {}: {:?}",
						field,
						value.to_string()
					);
					record.fields.remove(field);
					continue;
				}
			};
			if let Some(lower) = lower {
				if numeric < *lower {
					info!("Value for {}: {} less than lower bound {}", field, numeric, lower);
					record.fields.remove(field);
					continue;
				}
			}
			if let Some(upper) = upper {
				if numeric > *upper {
					info!(
						"Value for {}: {} greater than upper bound {}",
						field, numeric, upper
					);
					record.fields.remove(field);
				}
			}
		}
		Some(Payload::Record(record))
	}
}

////////////////////////////////////////////////////////////////////////////
/// Drop whole records whose values fall outside their bounds (or fail an
/// exact string match). The record itself is left untouched; a single
/// warning is emitted the first time anything is filtered.
pub struct ValueFilterIgnoreTransform {
	bounds: Bounds,
	exact: HashMap<String, String>,
	has_filtered: bool,
}

#[derive(serde::Deserialize)]
struct ValueFilterIgnoreConfig {
	bounds: String,
	#[serde(default)]
	exact_match: bool,
}

impl ValueFilterIgnoreTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: ValueFilterIgnoreConfig = serde_json::from_value(kwargs.clone())?;
		let mut bounds = Bounds::new();
		let mut exact = HashMap::new();
		if config.exact_match {
			for condition in config.bounds.split(',') {
				let parts: Vec<&str> = condition.split(':').collect();
				match parts.as_slice() {
					[field, expected] => {
						exact.insert((*field).to_owned(), (*expected).to_owned());
					}
					_ => anyhow::bail!(
						"exact-match bounds must be colon-separated pairs of \
						 field_name:match; found {:?}",
						condition
					),
				}
			}
		} else {
			bounds = parse_bounds(&config.bounds)?;
		}
		Ok(ValueFilterIgnoreTransform {
			bounds,
			exact,
			has_filtered: false,
		})
	}

	fn note_filtered(&mut self, message: &str) {
		if !self.has_filtered {
			warn!("This logger is filtering out records: {}", message);
			self.has_filtered = true;
		}
	}
}

impl Transform for ValueFilterIgnoreTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let record = match &payload {
			Payload::Record(record) => record,
			other => {
				info!(
					"ValueFilterIgnoreTransform received non-record input: {}",
					other.describe()
				);
				return None;
			}
		};

		for (field, expected) in &self.exact.clone() {
			if let Some(value) = record.fields.get(field) {
				if &value.to_string() != expected {
					self.note_filtered(&format!("{} != {:?}", field, expected));
					return None;
				}
			}
		}

		for (field, (lower, upper)) in &self.bounds.clone() {
			let value = match record.fields.get(field) {
				Some(value) => value,
				None => continue,
			};
			// Try to coerce strings before giving up on them.
			let numeric = value
				.as_number()
				.or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()));
			let numeric = match numeric {
				Some(numeric) => numeric,
				None => {
					self.note_filtered(&format!(
						"non-numeric value for {}: {:?}",
						field,
						value.to_string()
					));
					return None;
				}
			};
			if let Some(lower) = lower {
				if numeric < *lower {
					self.note_filtered(&format!("{} less than {}", field, lower));
					return None;
				}
			}
			if let Some(upper) = upper {
				if numeric > *upper {
					self.note_filtered(&format!("{} greater than {}", field, upper));
					return None;
				}
			}
		}
		Some(payload)
	}
}
