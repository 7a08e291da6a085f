//! Parsing of raw text records into structured `Record`s using regex
//! patterns, device-type field conversion and device rename maps.

use crate::config::ConfigError;
use crate::convert::{self, ConvertOptions};
use crate::devices::DeviceRegistry;
use crate::record::{FieldMetadata, Fields, Record, Value};
use crate::timeutil;
use regex::Regex;
use std::collections::HashMap;
use tracing::*;

/// Permissive envelope: looks for `data_id timestamp field_string`, but
/// still yields the field string when the prefix is absent.
pub const DEFAULT_RECORD_FORMAT: &str =
	r"^(?:(?P<data_id>\w+)\s+(?P<timestamp>[0-9TZ:\-\.]*)\s+)?(?P<field_string>(?s:.)*)";

lazy_static::lazy_static! {
	static ref DEFAULT_RECORD_REGEX: Regex =
		Regex::new(DEFAULT_RECORD_FORMAT).expect("default record format is valid");
}

/// Field patterns as they appear in a pipeline spec: either an anonymous
/// list tried in order, or a `message_type`-keyed mapping whose first
/// matching key names the record's message type.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(untagged)]
pub enum FieldPatternSpec {
	Single(String),
	List(Vec<String>),
	ByMessageType(std::collections::BTreeMap<String, String>),
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct ParserOptions {
	pub record_format: Option<String>,
	pub field_patterns: Option<FieldPatternSpec>,
	pub data_id: Option<String>,
	pub definition_path: Option<String>,
	pub metadata_interval: Option<f64>,
	pub time_format: Option<String>,
	pub quiet: bool,
}

pub struct RecordParser {
	record_format: Regex,
	data_id: Option<String>,
	patterns: Vec<(Option<String>, Regex)>,
	registry: DeviceRegistry,
	type_specs: HashMap<String, HashMap<String, convert::FieldType>>,
	metadata: HashMap<String, FieldMetadata>,
	metadata_interval: Option<f64>,
	metadata_last_sent: HashMap<String, f64>,
	time_format: String,
	quiet: bool,
}

impl RecordParser {
	pub fn new(options: ParserOptions) -> Result<RecordParser, ConfigError> {
		if options.field_patterns.is_some() && options.definition_path.is_some() {
			return Err(ConfigError::Invalid(
				"both field_patterns and definition_path specified; use only one".to_owned(),
			));
		}

		let record_format = match &options.record_format {
			Some(format) => Regex::new(format).map_err(|e| {
				ConfigError::Invalid(format!("invalid record_format {:?}: {}", format, e))
			})?,
			None => DEFAULT_RECORD_REGEX.clone(),
		};

		let mut registry = DeviceRegistry::default();
		let mut patterns = Vec::new();
		match &options.field_patterns {
			Some(FieldPatternSpec::Single(pattern)) => {
				patterns.push((None, compile(pattern)?));
			}
			Some(FieldPatternSpec::List(list)) => {
				for pattern in list {
					patterns.push((None, compile(pattern)?));
				}
			}
			Some(FieldPatternSpec::ByMessageType(map)) => {
				for (message_type, pattern) in map {
					patterns.push((Some(message_type.clone()), compile(pattern)?));
				}
			}
			None => {
				if let Some(path) = &options.definition_path {
					registry = DeviceRegistry::load(path)?;
					patterns = registry.field_patterns();
				}
			}
		}

		let mut parser = RecordParser {
			record_format,
			data_id: options.data_id,
			patterns,
			registry,
			type_specs: HashMap::new(),
			metadata: HashMap::new(),
			metadata_interval: options.metadata_interval,
			metadata_last_sent: HashMap::new(),
			time_format: options
				.time_format
				.unwrap_or_else(|| timeutil::TIME_FORMAT.to_owned()),
			quiet: options.quiet,
		};
		parser.index_registry();
		Ok(parser)
	}

	/// Build a parser directly over an in-memory registry (tests and
	/// embedded device definitions).
	pub fn with_registry(
		registry: DeviceRegistry,
		metadata_interval: Option<f64>,
		quiet: bool,
	) -> RecordParser {
		let patterns = registry.field_patterns();
		let mut parser = RecordParser {
			record_format: DEFAULT_RECORD_REGEX.clone(),
			data_id: None,
			patterns,
			registry,
			type_specs: HashMap::new(),
			metadata: HashMap::new(),
			metadata_interval,
			metadata_last_sent: HashMap::new(),
			time_format: timeutil::TIME_FORMAT.to_owned(),
			quiet,
		};
		parser.index_registry();
		parser
	}

	// Cache per-device-type conversion specs; compile metadata only when
	// it will actually be attached to records.
	fn index_registry(&mut self) {
		self.type_specs = self
			.registry
			.iter_device_types()
			.map(|(name, device_type)| (name.clone(), device_type.type_specs()))
			.collect();
		if self.metadata_interval.is_some() && !self.registry.is_empty() {
			self.metadata = self.registry.compile_metadata();
		}
	}

	/// Parse an id-prefixed text record into a `Record`, or None if the
	/// envelope or field patterns fail to match.
	pub fn parse_record(&mut self, record: &str) -> Option<Record> {
		if record.is_empty() {
			return None;
		}
		let captures = match self.record_format.captures(record) {
			Some(captures) => captures,
			None => {
				if !self.quiet {
					warn!("Unable to parse record into {:?}", self.record_format.as_str());
					warn!("Record: {:?}", record);
				}
				return None;
			}
		};

		let data_id = match &self.data_id {
			Some(data_id) => data_id.clone(),
			None => {
				let extracted = captures
					.name("data_id")
					.map(|m| m.as_str())
					.filter(|s| !s.is_empty());
				match extracted {
					Some(data_id) => data_id.to_owned(),
					None => {
						if !self.quiet {
							warn!(
								"No data_id found in record and none specified; \
								 defaulting to \"unknown\""
							);
						}
						"unknown".to_owned()
					}
				}
			}
		};

		let timestamp = captures
			.name("timestamp")
			.map(|m| m.as_str())
			.filter(|s| !s.is_empty())
			.and_then(|text| match timeutil::timestamp(text, &self.time_format) {
				Ok(ts) => Some(ts),
				Err(_) => {
					debug!("Incorrect datetime format: {:?}", text);
					None
				}
			})
			.unwrap_or_else(timeutil::now);

		let field_string = captures
			.name("field_string")
			.map(|m| m.as_str().trim_end())
			.filter(|s| !s.is_empty())?;

		let mut message_type = None;
		let mut fields = Fields::new();
		if !self.patterns.is_empty() {
			let mut matched = false;
			for (pattern_type, pattern) in &self.patterns {
				if let Some(captures) = pattern.captures(field_string) {
					for name in pattern.capture_names().flatten() {
						if let Some(m) = captures.name(name) {
							fields.insert(name.to_owned(), Value::Str(m.as_str().to_owned()));
						}
					}
					message_type = pattern_type.clone();
					matched = true;
					break;
				}
			}
			if !matched {
				if !self.quiet {
					info!("No field pattern matched record: {:?}", field_string);
				}
				return None;
			}
		}

		let mut record = Record::new(Some(data_id.clone()), message_type, timestamp, fields);

		// Device-specific processing: type conversion, then renaming.
		if let Some((device, device_type)) = self.registry.lookup(&data_id) {
			if let Some(specs) = self.type_specs.get(&device_type.name) {
				let survived = convert::convert_fields(
					&mut record.fields,
					specs,
					&HashMap::new(),
					&ConvertOptions {
						quiet: self.quiet,
						..Default::default()
					},
				);
				if !survived {
					return None;
				}
			}
			if !device.fields.is_empty() {
				let mut renamed = Fields::new();
				for (raw_name, canonical_name) in &device.fields {
					if let Some(value) = record.fields.remove(raw_name) {
						renamed.insert(canonical_name.clone(), value);
					}
				}
				record.fields = renamed;
			}
		}

		self.inject_metadata(&mut record);
		Some(record)
	}

	/// Attach field metadata when the per-field interval has elapsed,
	/// measured against the wall clock.
	fn inject_metadata(&mut self, record: &mut Record) {
		let interval = match self.metadata_interval {
			Some(interval) => interval,
			None => return,
		};
		let now = timeutil::now();
		let field_names: Vec<String> = record.fields.keys().cloned().collect();
		for field in field_names {
			let entry = match self.metadata.get(&field) {
				Some(entry) => entry,
				None => continue,
			};
			let last_sent = self.metadata_last_sent.get(&field).copied().unwrap_or(0.0);
			if now - last_sent >= interval {
				record.metadata.insert(field.clone(), entry.clone());
				self.metadata_last_sent.insert(field, now);
			}
		}
	}
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
	Regex::new(pattern)
		.map_err(|e| ConfigError::Invalid(format!("invalid field pattern {:?}: {}", pattern, e)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::devices::DeviceRegistry;

	fn device_parser(metadata_interval: Option<f64>) -> RecordParser {
		let registry = DeviceRegistry::from_value(&serde_json::json!({
			"devices": {
				"sensor1": {
					"device_type": "MsgSensor",
					"fields": {"Val": "Value", "Header": "Head"}
				}
			},
			"device_types": {
				"MsgSensor": {
					"format": {
						"MSG": r"\$(?P<Header>\w+),val=(?P<Val>\d+),rem=(?P<Rem>\w+)"
					},
					"fields": {
						"Val": "int",
						"Header": {"data_type": "str", "units": "", "description": "tag"}
					}
				}
			}
		}))
		.unwrap();
		RecordParser::with_registry(registry, metadata_interval, false)
	}

	#[test]
	fn parses_with_device_conversion_and_renaming() {
		let mut parser = device_parser(None);
		let record = parser
			.parse_record("sensor1 2023-01-01T00:00:00.000Z $MSG,val=42,rem=FOO")
			.unwrap();
		assert_eq!(record.data_id.as_deref(), Some("sensor1"));
		assert_eq!(record.message_type.as_deref(), Some("MSG"));
		assert!((record.timestamp - 1672531200.0).abs() < 1e-6);
		assert_eq!(record.fields.get("Value"), Some(&Value::Int(42)));
		assert_eq!(record.fields.get("Head"), Some(&Value::from("MSG")));
		// Rem is not in the device's rename map, so it is filtered out.
		assert!(record.fields.get("Rem").is_none());
		assert_eq!(record.fields.len(), 2);
	}

	#[test]
	fn no_pattern_match_returns_none() {
		let mut parser = device_parser(None);
		assert!(parser
			.parse_record("sensor1 2023-01-01T00:00:00.000Z something else entirely")
			.is_none());
	}

	#[test]
	fn data_id_override_beats_envelope() {
		let mut parser = RecordParser::new(ParserOptions {
			data_id: Some("override".to_owned()),
			field_patterns: Some(FieldPatternSpec::Single(r"(?P<payload>.+)".to_owned())),
			..Default::default()
		})
		.unwrap();
		let record = parser
			.parse_record("sensor1 2023-01-01T00:00:00.000Z hello")
			.unwrap();
		assert_eq!(record.data_id.as_deref(), Some("override"));
	}

	#[test]
	fn missing_data_id_defaults_to_unknown() {
		let mut parser = RecordParser::new(ParserOptions {
			field_patterns: Some(FieldPatternSpec::Single(r"(?P<payload>\$.+)".to_owned())),
			quiet: true,
			..Default::default()
		})
		.unwrap();
		let record = parser.parse_record("$GPGGA,123519,4807.038,N").unwrap();
		assert_eq!(record.data_id.as_deref(), Some("unknown"));
	}

	#[test]
	fn unparseable_timestamp_falls_back_to_now() {
		let mut parser = device_parser(None);
		let record = parser.parse_record("sensor1 2023-13-99 $MSG,val=1,rem=X");
		// "2023-13-99" doesn't match the envelope's timestamp charset as a
		// full prefix token, so the whole prefix lands in field_string and
		// fails to parse; either way we never produce a bogus timestamp.
		if let Some(record) = record {
			assert!((record.timestamp - timeutil::now()).abs() < 5.0);
		}
	}

	#[test]
	fn first_matching_pattern_wins_for_lists() {
		let mut parser = RecordParser::new(ParserOptions {
			field_patterns: Some(FieldPatternSpec::List(vec![
				r"^A,(?P<a>\d+)$".to_owned(),
				r"^A,(?P<b>\d+)$".to_owned(),
			])),
			quiet: true,
			..Default::default()
		})
		.unwrap();
		let record = parser.parse_record("x 2023-01-01T00:00:00.000Z A,7").unwrap();
		assert!(record.fields.contains_key("a"));
		assert!(!record.fields.contains_key("b"));
	}

	#[test]
	fn metadata_injected_on_interval() {
		let mut parser = device_parser(Some(10.0));
		let first = parser
			.parse_record("sensor1 2023-01-01T00:00:00.000Z $MSG,val=1,rem=X")
			.unwrap();
		let head_meta = first.metadata.get("Head").unwrap();
		assert_eq!(head_meta.get("device").map(String::as_str), Some("sensor1"));
		assert_eq!(
			head_meta.get("device_type_field").map(String::as_str),
			Some("Header")
		);

		// Second record inside the interval carries no metadata.
		let second = parser
			.parse_record("sensor1 2023-01-01T00:00:01.000Z $MSG,val=2,rem=X")
			.unwrap();
		assert!(second.metadata.is_empty());
	}

	#[test]
	fn empty_field_string_returns_none() {
		let mut parser = device_parser(None);
		assert!(parser.parse_record("").is_none());
		assert!(parser.parse_record("sensor1 2023-01-01T00:00:00.000Z ").is_none());
	}

	#[test]
	fn conflicting_pattern_sources_rejected() {
		let result = RecordParser::new(ParserOptions {
			field_patterns: Some(FieldPatternSpec::Single(r".*".to_owned())),
			definition_path: Some("devices/*.yaml".to_owned()),
			..Default::default()
		});
		assert!(result.is_err());
	}
}
