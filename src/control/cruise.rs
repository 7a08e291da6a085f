//! Cruise definition files: deserialization and the referential
//! invariants enforced before anything touches the store.

use crate::config::{self, ConfigError};
use crate::timeutil;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct CruiseDef {
	pub id: Option<String>,
	pub start: Option<String>,
	pub end: Option<String>,
	pub config_filename: Option<String>,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct LoggerDef {
	pub configs: Vec<String>,
}

/// A complete cruise definition: loggers, modes (each naming one config
/// per logger) and the config specs themselves.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct CruiseConfig {
	#[serde(default)]
	pub cruise: CruiseDef,
	pub loggers: BTreeMap<String, LoggerDef>,
	pub modes: BTreeMap<String, BTreeMap<String, String>>,
	#[serde(default)]
	pub default_mode: Option<String>,
	pub configs: BTreeMap<String, serde_json::Value>,
}

impl CruiseConfig {
	/// Parse a definition out of an already-loaded configuration tree.
	pub fn from_value(value: &serde_json::Value) -> Result<CruiseConfig, ConfigError> {
		for required in &["loggers", "modes", "configs"] {
			if value.get(*required).is_none() {
				return Err(ConfigError::Invalid(format!(
					"cruise definition has no {}",
					required
				)));
			}
		}
		let config: CruiseConfig = serde_json::from_value(value.clone())
			.map_err(|e| ConfigError::Invalid(format!("bad cruise definition: {}", e)))?;
		config.validate()?;
		Ok(config)
	}

	/// Load a definition file, resolving includes, then validate.
	pub fn from_file(path: &Path) -> Result<CruiseConfig, ConfigError> {
		let value = config::read_config(path)?;
		Self::from_value(&value)
	}

	/// Enforce: every mode's logger exists, every mode's config exists,
	/// every logger's declared config exists, and the default mode (if
	/// named) is a real mode.
	pub fn validate(&self) -> Result<(), ConfigError> {
		for (mode_name, mode_loggers) in &self.modes {
			for (logger_name, config_name) in mode_loggers {
				if !self.loggers.contains_key(logger_name) {
					return Err(ConfigError::Invalid(format!(
						"in mode {:?}, logger {:?} is undefined",
						mode_name, logger_name
					)));
				}
				if !self.configs.contains_key(config_name) {
					return Err(ConfigError::Invalid(format!(
						"in mode {:?}, logger {:?}, config {:?} is undefined",
						mode_name, logger_name, config_name
					)));
				}
			}
		}
		for (logger_name, logger_def) in &self.loggers {
			for config_name in &logger_def.configs {
				if !self.configs.contains_key(config_name) {
					return Err(ConfigError::Invalid(format!(
						"config {:?} (declared by logger {:?}) not found",
						config_name, logger_name
					)));
				}
			}
		}
		if let Some(default_mode) = &self.default_mode {
			if !self.modes.contains_key(default_mode) {
				return Err(ConfigError::Invalid(format!(
					"default mode {:?} is not in the list of valid modes: {:?}",
					default_mode,
					self.modes.keys().collect::<Vec<_>>()
				)));
			}
		}
		Ok(())
	}

	pub fn cruise_id(&self) -> String {
		self.cruise
			.id
			.clone()
			.unwrap_or_else(|| "Cruise".to_owned())
	}

	/// Start/end parsed as dates; None when absent or unparseable.
	pub fn start_timestamp(&self) -> Option<f64> {
		self.cruise
			.start
			.as_ref()
			.and_then(|s| timeutil::timestamp(s, timeutil::DATE_FORMAT).ok())
	}

	pub fn end_timestamp(&self) -> Option<f64> {
		self.cruise
			.end
			.as_ref()
			.and_then(|s| timeutil::timestamp(s, timeutil::DATE_FORMAT).ok())
	}
}

#[cfg(test)]
pub(crate) fn sample_cruise_value() -> serde_json::Value {
	serde_json::json!({
		"cruise": {"id": "NBP1406", "start": "2014-06-01", "end": "2014-07-01"},
		"loggers": {
			"gyr1": {"configs": ["gyr1->off", "gyr1->file"]},
			"s330": {"configs": ["s330->off", "s330->file"]}
		},
		"modes": {
			"off": {"gyr1": "gyr1->off", "s330": "s330->off"},
			"port": {"gyr1": "gyr1->file", "s330": "s330->file"}
		},
		"default_mode": "off",
		"configs": {
			"gyr1->off": {},
			"gyr1->file": {"readers": {"class": "UDPReader", "kwargs": {"port": 6224}}},
			"s330->off": {},
			"s330->file": {"readers": {"class": "UDPReader", "kwargs": {"port": 6225}}}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn valid_definition_parses() {
		let config = CruiseConfig::from_value(&sample_cruise_value()).unwrap();
		assert_eq!(config.cruise_id(), "NBP1406");
		assert_eq!(config.default_mode.as_deref(), Some("off"));
		assert_eq!(config.loggers.len(), 2);
		assert!(config.start_timestamp().is_some());
	}

	#[test]
	fn missing_top_level_keys_are_errors() {
		for key in &["loggers", "modes", "configs"] {
			let mut value = sample_cruise_value();
			value.as_object_mut().unwrap().remove(*key);
			let result = CruiseConfig::from_value(&value);
			assert!(result.is_err(), "expected error when {} missing", key);
		}
	}

	#[test]
	fn mode_referencing_unknown_logger_is_an_error() {
		let mut value = sample_cruise_value();
		value["modes"]["off"]
			.as_object_mut()
			.unwrap()
			.insert("ghost".to_owned(), serde_json::json!("gyr1->off"));
		assert!(CruiseConfig::from_value(&value).is_err());
	}

	#[test]
	fn mode_referencing_unknown_config_is_an_error() {
		let mut value = sample_cruise_value();
		value["modes"]["off"]
			.as_object_mut()
			.unwrap()
			.insert("gyr1".to_owned(), serde_json::json!("missing->config"));
		assert!(CruiseConfig::from_value(&value).is_err());
	}

	#[test]
	fn unknown_default_mode_is_an_error() {
		let mut value = sample_cruise_value();
		value["default_mode"] = serde_json::json!("underway");
		assert!(CruiseConfig::from_value(&value).is_err());
	}

	#[test]
	fn logger_declaring_unknown_config_is_an_error() {
		let mut value = sample_cruise_value();
		value["loggers"]["gyr1"]["configs"]
			.as_array_mut()
			.unwrap()
			.push(serde_json::json!("gyr1->nowhere"));
		assert!(CruiseConfig::from_value(&value).is_err());
	}
}
