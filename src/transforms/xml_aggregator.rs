//! Aggregate streamed lines of XML until the named outermost element
//! closes, then emit the accumulated buffer as a single record.

use super::Transform;
use crate::record::Payload;
use tracing::*;

pub struct XmlAggregatorTransform {
	closing_tag: String,
	buffer: String,
}

#[derive(serde::Deserialize)]
struct XmlAggregatorConfig {
	tag: String,
}

impl XmlAggregatorTransform {
	pub fn new(tag: &str) -> Self {
		XmlAggregatorTransform {
			closing_tag: format!("</{}>", tag),
			buffer: String::new(),
		}
	}

	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: XmlAggregatorConfig = serde_json::from_value(kwargs.clone())?;
		Ok(Self::new(&config.tag))
	}
}

impl Transform for XmlAggregatorTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let line = match payload {
			Payload::Text(line) => line,
			other => {
				warn!(
					"XMLAggregatorTransform received non-text input: {}",
					other.describe()
				);
				return None;
			}
		};
		self.buffer.push_str(&line);
		self.buffer.push('\n');

		if line.contains(&self.closing_tag) {
			let complete = std::mem::take(&mut self.buffer);
			debug!("XMLAggregatorTransform got closing tag; emitting record");
			return Some(Payload::Text(complete));
		}
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn text(s: &str) -> Payload {
		Payload::Text(s.to_owned())
	}

	#[test]
	fn aggregates_until_closing_tag() {
		let mut t = XmlAggregatorTransform::new("OSU_DAS_Record");
		assert!(t.transform(text("<OSU_DAS_Record>")).is_none());
		assert!(t.transform(text("  <Temp>12.5</Temp>")).is_none());
		let result = t.transform(text("</OSU_DAS_Record>")).unwrap();
		match result {
			Payload::Text(s) => {
				assert!(s.starts_with("<OSU_DAS_Record>"));
				assert!(s.contains("<Temp>12.5</Temp>"));
				assert!(s.trim_end().ends_with("</OSU_DAS_Record>"));
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn state_resets_after_emission() {
		let mut t = XmlAggregatorTransform::new("r");
		t.transform(text("<r>one</r>"));
		let second = t.transform(text("<r>two</r>")).unwrap();
		match second {
			Payload::Text(s) => {
				assert!(!s.contains("one"));
				assert!(s.contains("two"));
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn inner_matching_tags_of_other_names_are_ignored() {
		let mut t = XmlAggregatorTransform::new("outer");
		assert!(t.transform(text("<outer><inner>x</inner>")).is_none());
		assert!(t.transform(text("</outer>")).is_some());
	}
}
