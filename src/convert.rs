//! Field type conversion shared by the record parser and the
//! ConvertFields transform: named scalar types with the aliases device
//! definitions actually use, plus NMEA DDMM.MMMM lat/lon composition.

use crate::record::{Fields, Value};
use std::collections::HashMap;
use tracing::*;

/// Target type for a raw (string-valued) field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
	Float,
	Int,
	Str,
	Bool,
	HexInt,
	NmeaLat,
	NmeaLon,
}

impl FieldType {
	/// Map a type name from a device definition to a `FieldType`.
	/// Unknown names return None and are reported by the caller.
	pub fn from_name(name: &str) -> Option<FieldType> {
		match name {
			"float" | "double" => Some(FieldType::Float),
			"int" | "short" | "ushort" | "uint" | "long" | "ubyte" | "byte" => {
				Some(FieldType::Int)
			}
			"str" | "char" | "string" | "text" => Some(FieldType::Str),
			"bool" | "boolean" => Some(FieldType::Bool),
			"hex" | "hex_int" => Some(FieldType::HexInt),
			"nmea_lat" => Some(FieldType::NmeaLat),
			"nmea_lon" => Some(FieldType::NmeaLon),
			_ => None,
		}
	}
}

/// Convert a single value to the target type. Returns None (leaving the
/// caller to keep the original) when the value doesn't parse.
pub fn convert_value(value: &Value, target: FieldType) -> Option<Value> {
	match target {
		FieldType::Float => match value {
			Value::Float(_) => Some(value.clone()),
			Value::Int(i) => Some(Value::Float(*i as f64)),
			Value::Str(s) => s.trim().parse::<f64>().ok().map(Value::Float),
			Value::Bool(b) => Some(Value::Float(if *b { 1.0 } else { 0.0 })),
			Value::Null => None,
		},
		FieldType::Int => match value {
			Value::Int(_) => Some(value.clone()),
			Value::Float(f) => Some(Value::Int(*f as i64)),
			// Parse through float first so "123.0" is accepted.
			Value::Str(s) => s.trim().parse::<f64>().ok().map(|f| Value::Int(f as i64)),
			Value::Bool(b) => Some(Value::Int(if *b { 1 } else { 0 })),
			Value::Null => None,
		},
		FieldType::Str => Some(Value::Str(value.to_string())),
		FieldType::Bool => match value {
			Value::Bool(_) => Some(value.clone()),
			Value::Int(i) => Some(Value::Bool(*i != 0)),
			Value::Float(f) => Some(Value::Bool(*f != 0.0)),
			Value::Str(s) => Some(Value::Bool(!s.is_empty())),
			Value::Null => None,
		},
		FieldType::HexInt => match value {
			Value::Int(_) => Some(value.clone()),
			Value::Str(s) => {
				let s = s.trim();
				let digits = s
					.strip_prefix("0x")
					.or_else(|| s.strip_prefix("0X"))
					.unwrap_or(s);
				i64::from_str_radix(digits, 16).ok().map(Value::Int)
			}
			_ => None,
		},
		// Composed from a (value, direction) pair; meaningless alone.
		FieldType::NmeaLat | FieldType::NmeaLon => None,
	}
}

/// Convert NMEA-style DDMM.MMMM plus a cardinal direction into signed
/// decimal degrees, rounded to five decimals; S and W are negative.
pub fn convert_lat_lon(value: &Value, direction: &str) -> Option<f64> {
	let raw = match value {
		Value::Str(s) => s.trim().parse::<f64>().ok()?,
		other => other.as_number()?,
	};
	let degrees = (raw / 100.0).trunc();
	let minutes = raw - degrees * 100.0;
	let mut decimal = degrees + minutes / 60.0;
	if matches!(direction.trim().to_ascii_uppercase().as_str(), "S" | "W") {
		decimal = -decimal;
	}
	Some((decimal * 1e5).round() / 1e5)
}

/// Options governing `convert_fields`.
#[derive(Clone, Debug, Default)]
pub struct ConvertOptions {
	pub delete_source_fields: bool,
	pub delete_unconverted_fields: bool,
	pub quiet: bool,
}

/// Apply type conversion and lat/lon composition to a field map in place.
///
/// `field_specs` maps field names to plain target types; `lat_lon_specs`
/// maps a target name to its `(value_field, direction_field)` inputs.
/// Returns false if no fields remain afterwards.
pub fn convert_fields(
	fields: &mut Fields,
	field_specs: &HashMap<String, FieldType>,
	lat_lon_specs: &HashMap<String, (String, String)>,
	options: &ConvertOptions,
) -> bool {
	if fields.is_empty() {
		return false;
	}

	let mut processed: Vec<String> = Vec::new();

	for (field_name, target) in field_specs {
		let value = match fields.get(field_name) {
			Some(value) => value.clone(),
			None => continue,
		};
		match convert_value(&value, *target) {
			Some(converted) => {
				fields.insert(field_name.clone(), converted);
				processed.push(field_name.clone());
			}
			None => {
				if !options.quiet {
					warn!(
						"Failed to convert field {:?}: value {:?} ({}) to {:?}",
						field_name,
						value.to_string(),
						value.type_name(),
						target
					);
				}
			}
		}
	}

	for (target_field, (val_field, dir_field)) in lat_lon_specs {
		let value = match fields.get(val_field) {
			Some(value) => value.clone(),
			None => continue,
		};
		let direction = match fields.get(dir_field).and_then(|v| v.as_str().map(String::from)) {
			Some(direction) => direction,
			None => continue,
		};
		match convert_lat_lon(&value, &direction) {
			Some(decimal) => {
				fields.insert(target_field.clone(), Value::Float(decimal));
				processed.push(target_field.clone());
				if options.delete_source_fields {
					processed.push(val_field.clone());
					processed.push(dir_field.clone());
					// Remove composed inputs, but never the target itself.
					if val_field != target_field {
						fields.remove(val_field);
					}
					if dir_field != target_field {
						fields.remove(dir_field);
					}
				}
			}
			None => {
				if !options.quiet {
					warn!(
						"Failed to convert lat/lon: value={:?}, direction={:?}",
						value.to_string(),
						direction
					);
				}
			}
		}
	}

	if options.delete_unconverted_fields {
		let keep: std::collections::HashSet<&String> = processed.iter().collect();
		let unconverted: Vec<String> = fields
			.keys()
			.filter(|k| !keep.contains(k))
			.cloned()
			.collect();
		for field in unconverted {
			fields.remove(&field);
		}
	}

	!fields.is_empty()
}
