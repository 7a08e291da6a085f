//! Transform wrapper around `RecordParser`: parse an id-prefixed text
//! record into a structured record (or its canonical JSON).

use super::Transform;
use crate::parser::{ParserOptions, RecordParser};
use crate::record::Payload;
use tracing::*;

pub struct ParseTransform {
	parser: RecordParser,
	return_json: bool,
}

#[derive(serde::Deserialize)]
struct ParseConfig {
	#[serde(flatten)]
	parser: ParserOptions,
	#[serde(default)]
	return_json: bool,
}

impl ParseTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: ParseConfig = serde_json::from_value(kwargs.clone())?;
		Ok(ParseTransform {
			parser: RecordParser::new(config.parser)?,
			return_json: config.return_json,
		})
	}

	pub fn new(parser: RecordParser) -> Self {
		ParseTransform {
			parser,
			return_json: false,
		}
	}
}

impl Transform for ParseTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let text = match payload {
			Payload::Text(text) => text,
			other => {
				info!("ParseTransform received non-text input: {}", other.describe());
				return None;
			}
		};
		let record = self.parser.parse_record(&text)?;
		if self.return_json {
			Some(Payload::Text(record.as_json()))
		} else {
			Some(Payload::Record(record))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::record::Value;

	#[test]
	fn parses_with_inline_patterns() {
		let mut t = ParseTransform::from_config(&serde_json::json!({
			"data_id": "gyr1",
			"field_patterns": {
				"HDT": r"\$HEHDT,(?P<Heading>[\d.]+),T\*\w+"
			}
		}))
		.unwrap();
		let result = t.transform(Payload::Text(
			"gyr1 2023-01-01T00:00:00.000Z $HEHDT,235.9,T*1b".to_owned(),
		));
		match result.unwrap() {
			Payload::Record(record) => {
				assert_eq!(record.message_type.as_deref(), Some("HDT"));
				assert_eq!(record.fields.get("Heading"), Some(&Value::from("235.9")));
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn return_json_yields_canonical_text() {
		let mut t = ParseTransform::from_config(&serde_json::json!({
			"field_patterns": [r"v=(?P<v>\d+)"],
			"return_json": true,
			"quiet": true
		}))
		.unwrap();
		let result = t.transform(Payload::Text("id 2023-01-01T00:00:00.000Z v=5".to_owned()));
		match result.unwrap() {
			Payload::Text(json) => {
				let value: serde_json::Value = serde_json::from_str(&json).unwrap();
				assert_eq!(value["data_id"], "id");
				assert_eq!(value["fields"]["v"], "5");
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn unparseable_records_are_dropped() {
		let mut t = ParseTransform::from_config(&serde_json::json!({
			"field_patterns": [r"v=(?P<v>\d+)"],
			"quiet": true
		}))
		.unwrap();
		assert!(t
			.transform(Payload::Text("id 2023-01-01T00:00:00.000Z nope".to_owned()))
			.is_none());
	}
}
