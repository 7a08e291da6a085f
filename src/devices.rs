//! Device and device-type definitions: the static descriptors that let the
//! record parser map raw wire formats into canonical, typed field names.

use crate::config::{self, ConfigError};
use crate::convert::FieldType;
use crate::record::FieldMetadata;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use tracing::*;

/// Declaration of one raw field within a device type.
#[derive(Clone, Debug, Default)]
pub struct FieldDef {
	pub field_type: Option<FieldType>,
	pub units: Option<String>,
	pub description: Option<String>,
}

/// A wire format: named regex patterns (one per message type, or an
/// anonymous list) and the raw fields they capture.
#[derive(Clone, Debug)]
pub struct DeviceType {
	pub name: String,
	pub patterns: Vec<(Option<String>, Regex)>,
	pub fields: HashMap<String, FieldDef>,
}

impl DeviceType {
	/// Raw field name → target type, for the conversion pass.
	pub fn type_specs(&self) -> HashMap<String, FieldType> {
		self.fields
			.iter()
			.filter_map(|(name, def)| def.field_type.map(|t| (name.clone(), t)))
			.collect()
	}
}

/// A concrete instrument: a device type binding plus the raw→canonical
/// field rename map. The device's name is the `data_id` it reports under.
#[derive(Clone, Debug)]
pub struct Device {
	pub name: String,
	pub device_type: String,
	pub fields: HashMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
	devices: HashMap<String, Device>,
	device_types: HashMap<String, DeviceType>,
}

impl DeviceRegistry {
	/// Load definitions from one or more comma-separated path specs, each
	/// possibly containing glob wildcards. Later definitions of the same
	/// name win, with a warning.
	pub fn load(definition_path: &str) -> Result<DeviceRegistry, ConfigError> {
		let mut registry = DeviceRegistry::default();
		let cwd = std::path::PathBuf::from(".");
		for spec in definition_path.split(',').map(str::trim).filter(|s| !s.is_empty()) {
			for path in config::expand_wildcards(spec, &cwd)? {
				let value = config::read_config(&path)?;
				registry.merge_definitions(&value, &path)?;
			}
		}
		Ok(registry)
	}

	/// Build a registry from an already-parsed definition tree.
	pub fn from_value(value: &serde_json::Value) -> Result<DeviceRegistry, ConfigError> {
		let mut registry = DeviceRegistry::default();
		registry.merge_definitions(value, Path::new("<inline>"))?;
		Ok(registry)
	}

	fn merge_definitions(
		&mut self,
		value: &serde_json::Value,
		path: &Path,
	) -> Result<(), ConfigError> {
		if let Some(devices) = value.get("devices") {
			let map = devices
				.as_object()
				.ok_or_else(|| ConfigError::NotAMapping("devices", path.to_owned()))?;
			for (name, def) in map {
				if self.devices.contains_key(name) {
					warn!("Duplicate device definition {:?}; last definition wins", name);
				}
				self.devices.insert(name.clone(), parse_device(name, def)?);
			}
		}
		if let Some(device_types) = value.get("device_types") {
			let map = device_types
				.as_object()
				.ok_or_else(|| ConfigError::NotAMapping("device_types", path.to_owned()))?;
			for (name, def) in map {
				if self.device_types.contains_key(name) {
					warn!(
						"Duplicate device_type definition {:?}; last definition wins",
						name
					);
				}
				self.device_types
					.insert(name.clone(), parse_device_type(name, def)?);
			}
		}
		Ok(())
	}

	pub fn device(&self, data_id: &str) -> Option<&Device> {
		self.devices.get(data_id)
	}

	pub fn device_type(&self, name: &str) -> Option<&DeviceType> {
		self.device_types.get(name)
	}

	/// The device (and its type) a `data_id` resolves to, if registered.
	pub fn lookup(&self, data_id: &str) -> Option<(&Device, &DeviceType)> {
		let device = self.devices.get(data_id)?;
		let device_type = self.device_types.get(&device.device_type)?;
		Some((device, device_type))
	}

	/// All patterns from all device types, message-type keyed entries
	/// first so parsing can tag records with the matching type.
	pub fn field_patterns(&self) -> Vec<(Option<String>, Regex)> {
		let mut names: Vec<&String> = self.device_types.keys().collect();
		names.sort();
		let mut patterns = Vec::new();
		for name in names {
			patterns.extend(self.device_types[name].patterns.iter().cloned());
		}
		patterns
	}

	/// Canonical-field metadata compiled from the definitions: which
	/// device and device-type field each canonical name came from, plus
	/// units and description when declared.
	pub fn compile_metadata(&self) -> HashMap<String, FieldMetadata> {
		let mut metadata = HashMap::new();
		for (device_name, device) in &self.devices {
			let device_type = match self.device_types.get(&device.device_type) {
				Some(device_type) => device_type,
				None => continue,
			};
			for (raw_name, canonical_name) in &device.fields {
				let def = match device_type.fields.get(raw_name) {
					Some(def) => def,
					None => continue,
				};
				let mut entry = FieldMetadata::new();
				entry.insert("device".to_owned(), device_name.clone());
				entry.insert("device_type".to_owned(), device.device_type.clone());
				entry.insert("device_type_field".to_owned(), raw_name.clone());
				if let Some(units) = &def.units {
					entry.insert("units".to_owned(), units.clone());
				}
				if let Some(description) = &def.description {
					entry.insert("description".to_owned(), description.clone());
				}
				metadata.insert(canonical_name.clone(), entry);
			}
		}
		metadata
	}

	pub fn iter_device_types(&self) -> impl Iterator<Item = (&String, &DeviceType)> {
		self.device_types.iter()
	}

	pub fn is_empty(&self) -> bool {
		self.devices.is_empty() && self.device_types.is_empty()
	}
}

fn parse_device(name: &str, def: &serde_json::Value) -> Result<Device, ConfigError> {
	let map = def.as_object().ok_or_else(|| {
		ConfigError::Invalid(format!("device {:?} definition must be a mapping", name))
	})?;
	let device_type = map
		.get("device_type")
		.and_then(|v| v.as_str())
		.ok_or_else(|| {
			ConfigError::Invalid(format!("device {:?} is missing a device_type", name))
		})?
		.to_owned();
	let mut fields = HashMap::new();
	if let Some(field_map) = map.get("fields") {
		let field_map = field_map.as_object().ok_or_else(|| {
			ConfigError::Invalid(format!("device {:?} fields must be a mapping", name))
		})?;
		for (raw, canonical) in field_map {
			let canonical = canonical.as_str().ok_or_else(|| {
				ConfigError::Invalid(format!(
					"device {:?} field {:?} rename target must be a string",
					name, raw
				))
			})?;
			fields.insert(raw.clone(), canonical.to_owned());
		}
	}
	Ok(Device {
		name: name.to_owned(),
		device_type,
		fields,
	})
}

fn parse_device_type(name: &str, def: &serde_json::Value) -> Result<DeviceType, ConfigError> {
	let map = def.as_object().ok_or_else(|| {
		ConfigError::Invalid(format!("device_type {:?} definition must be a mapping", name))
	})?;

	let mut patterns = Vec::new();
	match map.get("format") {
		Some(serde_json::Value::String(pattern)) => {
			patterns.push((None, compile_pattern(name, pattern)?));
		}
		Some(serde_json::Value::Array(list)) => {
			for entry in list {
				let pattern = entry.as_str().ok_or_else(|| {
					ConfigError::Invalid(format!(
						"device_type {:?} format list entries must be strings",
						name
					))
				})?;
				patterns.push((None, compile_pattern(name, pattern)?));
			}
		}
		Some(serde_json::Value::Object(by_type)) => {
			for (message_type, pattern) in by_type {
				let pattern = pattern.as_str().ok_or_else(|| {
					ConfigError::Invalid(format!(
						"device_type {:?} format {:?} must be a string",
						name, message_type
					))
				})?;
				patterns.push((Some(message_type.clone()), compile_pattern(name, pattern)?));
			}
		}
		Some(other) => {
			return Err(ConfigError::Invalid(format!(
				"device_type {:?} format must be a string, list or mapping; found {}",
				name, other
			)));
		}
		None => {}
	}

	let mut fields = HashMap::new();
	if let Some(field_map) = map.get("fields") {
		let field_map = field_map.as_object().ok_or_else(|| {
			ConfigError::Invalid(format!("device_type {:?} fields must be a mapping", name))
		})?;
		for (field_name, field_def) in field_map {
			fields.insert(field_name.clone(), parse_field_def(name, field_name, field_def));
		}
	}

	if patterns.is_empty() && fields.is_empty() {
		return Err(ConfigError::Invalid(format!(
			"device_type {:?} declares neither format nor fields",
			name
		)));
	}

	Ok(DeviceType {
		name: name.to_owned(),
		patterns,
		fields,
	})
}

fn parse_field_def(
	type_name: &str,
	field_name: &str,
	def: &serde_json::Value,
) -> FieldDef {
	match def {
		serde_json::Value::String(type_str) => {
			let field_type = FieldType::from_name(type_str);
			if field_type.is_none() {
				warn!(
					"Unknown field type {:?} for {}.{}",
					type_str, type_name, field_name
				);
			}
			FieldDef {
				field_type,
				..Default::default()
			}
		}
		serde_json::Value::Object(map) => {
			let field_type = map
				.get("data_type")
				.and_then(|v| v.as_str())
				.and_then(FieldType::from_name);
			FieldDef {
				field_type,
				units: map.get("units").and_then(|v| v.as_str()).map(String::from),
				description: map
					.get("description")
					.and_then(|v| v.as_str())
					.map(String::from),
			}
		}
		_ => FieldDef::default(),
	}
}

fn compile_pattern(type_name: &str, pattern: &str) -> Result<Regex, ConfigError> {
	Regex::new(pattern).map_err(|e| {
		ConfigError::Invalid(format!(
			"device_type {:?} has an invalid pattern {:?}: {}",
			type_name, pattern, e
		))
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_registry() -> DeviceRegistry {
		DeviceRegistry::from_value(&serde_json::json!({
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
						"Header": {"data_type": "str", "units": "", "description": "header tag"}
					}
				}
			}
		}))
		.unwrap()
	}

	#[test]
	fn lookup_resolves_device_and_type() {
		let registry = sample_registry();
		let (device, device_type) = registry.lookup("sensor1").unwrap();
		assert_eq!(device.device_type, "MsgSensor");
		assert_eq!(device_type.patterns.len(), 1);
		assert_eq!(device.fields.get("Val").map(String::as_str), Some("Value"));
	}

	#[test]
	fn type_specs_skip_untyped_fields() {
		let registry = sample_registry();
		let specs = registry.device_type("MsgSensor").unwrap().type_specs();
		assert_eq!(specs.get("Val"), Some(&FieldType::Int));
		assert_eq!(specs.get("Header"), Some(&FieldType::Str));
	}

	#[test]
	fn metadata_names_device_and_field() {
		let registry = sample_registry();
		let metadata = registry.compile_metadata();
		let head = metadata.get("Head").unwrap();
		assert_eq!(head.get("device").map(String::as_str), Some("sensor1"));
		assert_eq!(head.get("device_type_field").map(String::as_str), Some("Header"));
		assert_eq!(head.get("description").map(String::as_str), Some("header tag"));
	}

	#[test]
	fn non_mapping_devices_is_an_error() {
		let result = DeviceRegistry::from_value(&serde_json::json!({"devices": [1, 2]}));
		assert!(matches!(result, Err(ConfigError::NotAMapping("devices", _))));
	}

	#[test]
	fn device_type_without_format_or_fields_is_an_error() {
		let result =
			DeviceRegistry::from_value(&serde_json::json!({"device_types": {"Empty": {}}}));
		assert!(result.is_err());
	}
}
