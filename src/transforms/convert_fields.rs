//! Transform wrapper over the shared field-conversion utilities.

use super::Transform;
use crate::convert::{self, ConvertOptions, FieldType};
use crate::record::Payload;
use std::collections::HashMap;
use tracing::*;

/// Convert record fields to declared types and compose NMEA lat/lon
/// pairs into signed decimal degrees.
pub struct ConvertFieldsTransform {
	field_specs: HashMap<String, FieldType>,
	lat_lon_specs: HashMap<String, (String, String)>,
	options: ConvertOptions,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum FieldSpecConfig {
	TypeName(String),
	Detailed {
		data_type: Option<String>,
		direction_field: Option<String>,
	},
}

#[derive(Default, serde::Deserialize)]
#[serde(default)]
struct ConvertFieldsConfig {
	fields: HashMap<String, FieldSpecConfig>,
	/// `target: [value_field, direction_field]` pairs.
	lat_lon_fields: HashMap<String, (String, String)>,
	delete_source_fields: bool,
	delete_unconverted_fields: bool,
	quiet: bool,
}

impl ConvertFieldsTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: ConvertFieldsConfig = serde_json::from_value(kwargs.clone())?;
		let mut field_specs = HashMap::new();
		let mut lat_lon_specs = config.lat_lon_fields.clone();

		for (field_name, spec) in config.fields {
			let (type_name, direction_field) = match spec {
				FieldSpecConfig::TypeName(name) => (Some(name), None),
				FieldSpecConfig::Detailed {
					data_type,
					direction_field,
				} => (data_type, direction_field),
			};
			let type_name = match type_name {
				Some(type_name) => type_name,
				None => continue,
			};
			match FieldType::from_name(&type_name) {
				Some(FieldType::NmeaLat) | Some(FieldType::NmeaLon) => {
					match direction_field {
						Some(direction_field) => {
							lat_lon_specs
								.insert(field_name.clone(), (field_name, direction_field));
						}
						None => {
							warn!(
								"Field {:?} has type {:?} but no direction_field; ignoring",
								field_name, type_name
							);
						}
					}
				}
				Some(field_type) => {
					field_specs.insert(field_name, field_type);
				}
				None => {
					if !config.quiet {
						warn!(
							"Unknown type {:?} requested for field {:?}",
							type_name, field_name
						);
					}
				}
			}
		}

		Ok(ConvertFieldsTransform {
			field_specs,
			lat_lon_specs,
			options: ConvertOptions {
				delete_source_fields: config.delete_source_fields,
				delete_unconverted_fields: config.delete_unconverted_fields,
				quiet: config.quiet,
			},
		})
	}
}

impl Transform for ConvertFieldsTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		let mut record = match payload {
			Payload::Record(record) => record,
			other => {
				warn!(
					"ConvertFieldsTransform received non-record input: {}",
					other.describe()
				);
				return None;
			}
		};
		let survived = convert::convert_fields(
			&mut record.fields,
			&self.field_specs,
			&self.lat_lon_specs,
			&self.options,
		);
		if survived {
			Some(Payload::Record(record))
		} else {
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::record::{Fields, Record, Value};

	fn record(fields: &[(&str, &str)]) -> Payload {
		let mut map = Fields::new();
		for (name, value) in fields {
			map.insert((*name).to_owned(), Value::from(*value));
		}
		Payload::Record(Record::with_fields(100.0, map))
	}

	fn fields_of(payload: Payload) -> Fields {
		match payload {
			Payload::Record(record) => record.fields,
			other => panic!("expected record, got {:?}", other),
		}
	}

	#[test]
	fn declarative_nmea_lat() {
		let mut t = ConvertFieldsTransform::from_config(&serde_json::json!({
			"fields": {
				"Latitude": {"data_type": "nmea_lat", "direction_field": "NorS"}
			}
		}))
		.unwrap();
		let fields = fields_of(
			t.transform(record(&[("Latitude", "4530.00"), ("NorS", "N")])).unwrap(),
		);
		assert_eq!(fields.get("Latitude"), Some(&Value::Float(45.5)));
		// Source fields are left in place by default.
		assert!(fields.contains_key("NorS"));
	}

	#[test]
	fn lat_lon_fields_form() {
		let mut t = ConvertFieldsTransform::from_config(&serde_json::json!({
			"lat_lon_fields": {
				"latitude": ["raw_lat", "lat_dir"],
				"longitude": ["raw_lon", "lon_dir"]
			},
			"delete_source_fields": true
		}))
		.unwrap();
		let fields = fields_of(
			t.transform(record(&[
				("raw_lat", "3000.00"),
				("lat_dir", "S"),
				("raw_lon", "4530.00"),
				("lon_dir", "W"),
			]))
			.unwrap(),
		);
		assert_eq!(fields.get("latitude"), Some(&Value::Float(-30.0)));
		assert_eq!(fields.get("longitude"), Some(&Value::Float(-45.5)));
		assert!(!fields.contains_key("raw_lat"));
		assert!(!fields.contains_key("lon_dir"));
	}

	#[test]
	fn simple_type_conversion_and_cleanup() {
		let mut t = ConvertFieldsTransform::from_config(&serde_json::json!({
			"fields": {"heave": "float", "count": "int"},
			"delete_unconverted_fields": true
		}))
		.unwrap();
		let fields = fields_of(
			t.transform(record(&[("heave", "1.25"), ("count", "3"), ("junk", "x")])).unwrap(),
		);
		assert_eq!(fields.get("heave"), Some(&Value::Float(1.25)));
		assert_eq!(fields.get("count"), Some(&Value::Int(3)));
		assert!(!fields.contains_key("junk"));
	}

	#[test]
	fn empty_result_drops_record() {
		let mut t = ConvertFieldsTransform::from_config(&serde_json::json!({
			"fields": {},
			"delete_unconverted_fields": true
		}))
		.unwrap();
		assert!(t.transform(record(&[("junk", "x")])).is_none());
	}
}
