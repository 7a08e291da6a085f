//! The small stateless and lightly-stateful transforms: text munging,
//! field selection, formatting, JSON conversion, pattern filtering and
//! running count/max/min watermarks.

use super::Transform;
use crate::record::{Fields, Payload, Record, Value};
use crate::timeutil;
use crate::transforms::value_filter::{parse_bounds, Bounds};
use regex::Regex;
use std::collections::HashMap;
use tracing::*;

////////////////////////////////////////////////////////////////////////////
/// Prepend a fixed data-id prefix to text records.
pub struct PrefixTransform {
	prefix: String,
}

#[derive(serde::Deserialize)]
struct PrefixConfig {
	prefix: String,
}

impl PrefixTransform {
	pub fn new(prefix: impl Into<String>) -> Self {
		PrefixTransform { prefix: prefix.into() }
	}

	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: PrefixConfig = serde_json::from_value(kwargs.clone())?;
		Ok(Self::new(config.prefix))
	}
}

impl Transform for PrefixTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		match payload {
			Payload::Text(text) => Some(Payload::Text(format!("{} {}", self.prefix, text))),
			other => {
				warn!("PrefixTransform received non-text input: {}", other.describe());
				None
			}
		}
	}
}

////////////////////////////////////////////////////////////////////////////
/// Strip undesired characters out of a text record.
pub struct StripTransform {
	chars: Vec<char>,
	unprintable: bool,
	strip_prefix: bool,
	strip_suffix: bool,
}

#[derive(Default, serde::Deserialize)]
#[serde(default)]
struct StripConfig {
	chars: Option<String>,
	unprintable: bool,
	strip_prefix: bool,
	strip_suffix: bool,
}

impl StripTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: StripConfig = serde_json::from_value(kwargs.clone())?;
		if config.chars.is_some() && config.unprintable {
			anyhow::bail!("StripTransform: can not specify both \"chars\" and \"unprintable\"");
		}
		Ok(StripTransform {
			chars: config
				.chars
				.unwrap_or_else(|| " \t\x0b\r\n\x0c".to_owned())
				.chars()
				.collect(),
			unprintable: config.unprintable,
			strip_prefix: config.strip_prefix,
			strip_suffix: config.strip_suffix,
		})
	}

	fn keep(&self, c: char) -> bool {
		if self.unprintable {
			!c.is_control()
		} else {
			!self.chars.contains(&c)
		}
	}
}

impl Transform for StripTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let text = match payload {
			Payload::Text(text) => text,
			other => {
				warn!("StripTransform received non-text input: {}", other.describe());
				return None;
			}
		};
		let stripped = if !self.strip_prefix && !self.strip_suffix {
			text.chars().filter(|c| self.keep(*c)).collect()
		} else {
			let mut s = text.as_str();
			if self.strip_prefix {
				s = s.trim_start_matches(|c| !self.keep(c));
			}
			if self.strip_suffix {
				s = s.trim_end_matches(|c| !self.keep(c));
			}
			s.to_owned()
		};
		Some(Payload::Text(stripped))
	}
}

////////////////////////////////////////////////////////////////////////////
/// Split a single text record at a separator into a batch of records.
pub struct SplitTransform {
	sep: String,
}

#[derive(serde::Deserialize)]
#[serde(default)]
struct SplitConfig {
	sep: String,
}

impl Default for SplitConfig {
	fn default() -> Self {
		SplitConfig { sep: "\n".to_owned() }
	}
}

impl SplitTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: SplitConfig = serde_json::from_value(kwargs.clone())?;
		Ok(SplitTransform { sep: config.sep })
	}
}

impl Transform for SplitTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let text = match payload {
			Payload::Text(text) => text,
			other => {
				warn!("SplitTransform received non-text input: {}", other.describe());
				return None;
			}
		};
		let parts: Vec<Payload> = text
			.split(self.sep.as_str())
			.filter(|part| !part.is_empty())
			.map(|part| Payload::Text(part.to_owned()))
			.collect();
		if parts.is_empty() {
			None
		} else {
			Some(Payload::Batch(parts))
		}
	}
}

////////////////////////////////////////////////////////////////////////////
/// Cull key:value pairs from a record's field map.
pub struct SelectFieldsTransform {
	keep: Vec<String>,
	delete: Vec<String>,
}

#[derive(Default, serde::Deserialize)]
#[serde(default)]
struct SelectFieldsConfig {
	keep: Vec<String>,
	delete: Vec<String>,
}

impl SelectFieldsTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: SelectFieldsConfig = serde_json::from_value(kwargs.clone())?;
		if config.keep.is_empty() && config.delete.is_empty() {
			warn!(
				"SelectFieldsTransform has empty \"keep\" and \"delete\" arguments; \
				 records will pass unmodified"
			);
		}
		if !config.keep.is_empty() && !config.delete.is_empty() {
			warn!(
				"SelectFieldsTransform has both \"keep\" and \"delete\" arguments; \
				 \"delete\" will be ignored"
			);
		}
		Ok(SelectFieldsTransform {
			keep: config.keep,
			delete: config.delete,
		})
	}
}

impl Transform for SelectFieldsTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let mut record = match payload {
			Payload::Record(record) => record,
			other => {
				warn!(
					"SelectFieldsTransform received non-record input: {}",
					other.describe()
				);
				return None;
			}
		};
		if !self.keep.is_empty() {
			record.fields.retain(|key, _| self.keep.contains(key));
		} else {
			for key in &self.delete {
				record.fields.remove(key);
			}
		}
		if record.fields.is_empty() {
			None
		} else {
			Some(Payload::Record(record))
		}
	}
}

////////////////////////////////////////////////////////////////////////////
/// Rename fields of a record; fields not named in the map pass through.
pub struct RenameFieldsTransform {
	fields: HashMap<String, String>,
}

#[derive(serde::Deserialize)]
struct RenameFieldsConfig {
	fields: HashMap<String, String>,
}

impl RenameFieldsTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: RenameFieldsConfig = serde_json::from_value(kwargs.clone())?;
		Ok(RenameFieldsTransform { fields: config.fields })
	}
}

impl Transform for RenameFieldsTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let mut record = match payload {
			Payload::Record(record) => record,
			other => {
				warn!(
					"RenameFieldsTransform received non-record input: {}",
					other.describe()
				);
				return None;
			}
		};
		let mut renamed = Fields::new();
		for (name, value) in std::mem::take(&mut record.fields) {
			let new_name = self.fields.get(&name).cloned().unwrap_or(name);
			renamed.insert(new_name, value);
		}
		record.fields = renamed;
		Some(Payload::Record(record))
	}
}

////////////////////////////////////////////////////////////////////////////
/// Extract a single field's value from a record.
pub struct ExtractFieldTransform {
	field_name: String,
}

#[derive(serde::Deserialize)]
struct ExtractFieldConfig {
	field_name: String,
}

impl ExtractFieldTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: ExtractFieldConfig = serde_json::from_value(kwargs.clone())?;
		Ok(ExtractFieldTransform {
			field_name: config.field_name,
		})
	}
}

impl Transform for ExtractFieldTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let record = match payload {
			Payload::Record(record) => record,
			other => {
				warn!(
					"ExtractFieldTransform received non-record input: {}",
					other.describe()
				);
				return None;
			}
		};
		record
			.fields
			.get(&self.field_name)
			.map(|value| Payload::Text(value.to_string()))
	}
}

////////////////////////////////////////////////////////////////////////////
/// Substitute field values into a `{field}` template. A field with no
/// value and no default drops the record.
pub struct FormatTransform {
	format_str: String,
	defaults: HashMap<String, String>,
	use_iso_timestamp: bool,
}

#[derive(serde::Deserialize)]
struct FormatConfig {
	format_str: String,
	#[serde(default)]
	defaults: HashMap<String, String>,
	#[serde(default)]
	use_iso_timestamp: bool,
}

lazy_static::lazy_static! {
	static ref TEMPLATE_FIELD: Regex = Regex::new(r"\{(\w+)\}").expect("static regex");
}

impl FormatTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: FormatConfig = serde_json::from_value(kwargs.clone())?;
		Ok(FormatTransform {
			format_str: config.format_str,
			defaults: config.defaults,
			use_iso_timestamp: config.use_iso_timestamp,
		})
	}
}

impl Transform for FormatTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let record = match payload {
			Payload::Record(record) => record,
			other => {
				warn!("FormatTransform received non-record input: {}", other.describe());
				return None;
			}
		};
		let mut output = String::new();
		let mut last_end = 0;
		for captures in TEMPLATE_FIELD.captures_iter(&self.format_str) {
			let whole = captures.get(0).expect("capture 0 always present");
			let name = &captures[1];
			output.push_str(&self.format_str[last_end..whole.start()]);
			let substituted = if name == "timestamp" {
				Some(if self.use_iso_timestamp {
					timeutil::time_str_default(record.timestamp)
				} else {
					record.timestamp.to_string()
				})
			} else {
				record
					.fields
					.get(name)
					.map(Value::to_string)
					.or_else(|| self.defaults.get(name).cloned())
			};
			output.push_str(&substituted?);
			last_end = whole.end();
		}
		output.push_str(&self.format_str[last_end..]);
		Some(Payload::Text(output))
	}
}

////////////////////////////////////////////////////////////////////////////
/// Serialize records to their canonical JSON form.
pub struct ToJsonTransform {
	pretty: bool,
}

#[derive(Default, serde::Deserialize)]
#[serde(default)]
struct ToJsonConfig {
	pretty: bool,
}

impl ToJsonTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: ToJsonConfig = serde_json::from_value(kwargs.clone())?;
		Ok(ToJsonTransform { pretty: config.pretty })
	}
}

impl Transform for ToJsonTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let encoded = match payload {
			Payload::Record(record) => {
				if self.pretty {
					serde_json::to_string_pretty(&record).ok()?
				} else {
					record.as_json()
				}
			}
			Payload::Text(text) => serde_json::to_string(&text).ok()?,
			Payload::Batch(_) => unreachable!("batches are fanned out by transform()"),
		};
		Some(Payload::Text(encoded))
	}
}

////////////////////////////////////////////////////////////////////////////
/// Parse JSON text into records. With `das_record` set, a flat object of
/// field:value pairs is wrapped into a new record stamped with now.
pub struct FromJsonTransform {
	das_record: bool,
}

#[derive(Default, serde::Deserialize)]
#[serde(default)]
struct FromJsonConfig {
	das_record: bool,
}

impl FromJsonTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: FromJsonConfig = serde_json::from_value(kwargs.clone())?;
		Ok(FromJsonTransform {
			das_record: config.das_record,
		})
	}
}

impl Transform for FromJsonTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let text = match payload {
			Payload::Text(text) => text,
			other => {
				warn!("FromJSONTransform received non-text input: {}", other.describe());
				return None;
			}
		};
		let value: serde_json::Value = match serde_json::from_str(&text) {
			Ok(value) => value,
			Err(_) => {
				warn!("Failed to parse JSON string: {:?}", text);
				return None;
			}
		};
		if self.das_record {
			let map = match value.as_object() {
				Some(map) => map,
				None => {
					warn!("FromJSONTransform asked to build record from non-object JSON");
					return None;
				}
			};
			let mut fields = Fields::new();
			for (name, field_value) in map {
				match Value::from_json(field_value) {
					Some(value) => {
						fields.insert(name.clone(), value);
					}
					None => {
						warn!("Skipping non-scalar field {:?} in JSON record", name);
					}
				}
			}
			return Some(Payload::Record(Record::new(None, None, 0.0, fields)));
		}
		Payload::from_records(crate::record::records_from_json(&value))
	}
}

////////////////////////////////////////////////////////////////////////////
/// Only pass text records matching (or, negated, not matching) a pattern.
pub struct RegexFilterTransform {
	pattern: Regex,
	negate: bool,
}

#[derive(serde::Deserialize)]
struct RegexFilterConfig {
	pattern: String,
	#[serde(default)]
	negate: bool,
}

impl RegexFilterTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: RegexFilterConfig = serde_json::from_value(kwargs.clone())?;
		Ok(RegexFilterTransform {
			pattern: Regex::new(&config.pattern)?,
			negate: config.negate,
		})
	}
}

impl Transform for RegexFilterTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let text = match &payload {
			Payload::Text(text) => text,
			other => {
				warn!(
					"RegexFilterTransform received non-text input: {}",
					other.describe()
				);
				return None;
			}
		};
		if self.pattern.is_match(text) != self.negate {
			Some(payload)
		} else {
			None
		}
	}
}

////////////////////////////////////////////////////////////////////////////
/// Return None unless a record violates its bounds, in which case return a
/// diagnostic message naming every violation.
pub struct QcFilterTransform {
	bounds: Bounds,
}

#[derive(serde::Deserialize)]
struct QcFilterConfig {
	bounds: String,
}

impl QcFilterTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: QcFilterConfig = serde_json::from_value(kwargs.clone())?;
		Ok(QcFilterTransform {
			bounds: parse_bounds(&config.bounds)?,
		})
	}
}

impl Transform for QcFilterTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let record = match payload {
			Payload::Record(record) => record,
			other => {
				return Some(Payload::Text(format!(
					"Improper format record: {}",
					other.describe()
				)));
			}
		};
		let mut errors: Vec<String> = Vec::new();
		for (field, (lower, upper)) in &self.bounds {
			let value = match record.fields.get(field) {
				Some(value) => value,
				None => continue,
			};
			let value = match value.as_number() {
				Some(value) => value,
				None => {
					errors.push(format!("{}: non-numeric value: {:?}", field, value.to_string()));
					continue;
				}
			};
			if let Some(lower) = lower {
				if value < *lower {
					errors.push(format!("{}: {} < lower bound {}", field, value, lower));
				}
			}
			if let Some(upper) = upper {
				if value > *upper {
					errors.push(format!("{}: {} > upper bound {}", field, value, upper));
				}
			}
		}
		if errors.is_empty() {
			None
		} else {
			Some(Payload::Text(errors.join("; ")))
		}
	}
}

////////////////////////////////////////////////////////////////////////////
/// Emit the number of times each field name has been seen, as
/// `field:count` fields.
pub struct CountTransform {
	counts: HashMap<String, i64>,
}

impl CountTransform {
	pub fn new() -> Self {
		CountTransform { counts: HashMap::new() }
	}
}

impl Transform for CountTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let record = match payload {
			Payload::Record(record) => record,
			other => {
				warn!("CountTransform received non-record input: {}", other.describe());
				return None;
			}
		};
		let mut new_counts = Fields::new();
		for field in record.fields.keys() {
			let count = self.counts.entry(field.clone()).or_insert(0);
			*count += 1;
			new_counts.insert(format!("{}:count", field), Value::Int(*count));
		}
		if new_counts.is_empty() {
			return None;
		}
		let data_id = record
			.data_id
			.as_ref()
			.map(|id| format!("{}_counts", id))
			.or_else(|| Some("counts".to_owned()));
		Some(Payload::Record(Record::new(
			data_id,
			record.message_type.clone(),
			record.timestamp,
			new_counts,
		)))
	}
}

////////////////////////////////////////////////////////////////////////////
/// Emit `field:max`/`field:min` fields whenever a value exceeds its
/// previously-observed extremes. Non-numeric fields are ignored.
pub struct MaxMinTransform {
	max: HashMap<String, f64>,
	min: HashMap<String, f64>,
}

impl MaxMinTransform {
	pub fn new() -> Self {
		MaxMinTransform {
			max: HashMap::new(),
			min: HashMap::new(),
		}
	}
}

impl Transform for MaxMinTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let record = match payload {
			Payload::Record(record) => record,
			other => {
				warn!("MaxMinTransform received non-record input: {}", other.describe());
				return None;
			}
		};
		let mut new_limits = Fields::new();
		for (field, value) in &record.fields {
			let value = match value.as_f64() {
				Some(value) => value,
				None => continue,
			};
			match self.max.get(field) {
				Some(max) if value <= *max => {}
				_ => {
					self.max.insert(field.clone(), value);
					new_limits.insert(format!("{}:max", field), Value::Float(value));
				}
			}
			match self.min.get(field) {
				Some(min) if value >= *min => {}
				_ => {
					self.min.insert(field.clone(), value);
					new_limits.insert(format!("{}:min", field), Value::Float(value));
				}
			}
		}
		if new_limits.is_empty() {
			return None;
		}
		let data_id = record
			.data_id
			.as_ref()
			.map(|id| format!("{}_limits", id))
			.or_else(|| Some("limits".to_owned()));
		Some(Payload::Record(Record::new(
			data_id,
			record.message_type.clone(),
			record.timestamp,
			new_limits,
		)))
	}
}
