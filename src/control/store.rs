//! The authoritative configuration and state store: cruise, modes,
//! loggers, logger configs and their observed run-state history, plus the
//! LastUpdate beacon used for cache validation and the server message log.
//!
//! Entities live in arena-style tables addressed by integer ids, which
//! breaks the Logger ↔ LoggerConfig reference cycle: a logger's current
//! config is a nullable id, cleared explicitly on delete.

use crate::timeutil;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub type ModeId = u64;
pub type LoggerId = u64;
pub type ConfigId = u64;

#[derive(Clone, Debug)]
pub struct Cruise {
	pub id: String,
	pub start: Option<f64>,
	pub end: Option<f64>,
	pub config_filename: Option<String>,
	pub loaded_time: f64,
	pub active_mode: Option<ModeId>,
	pub default_mode: Option<ModeId>,
}

#[derive(Clone, Debug)]
pub struct Mode {
	pub id: ModeId,
	pub name: String,
}

#[derive(Clone, Debug)]
pub struct Logger {
	pub id: LoggerId,
	pub name: String,
	/// The currently-selected config, if any.
	pub config: Option<ConfigId>,
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
	pub id: ConfigId,
	pub name: String,
	pub logger: LoggerId,
	/// The serialized pipeline spec.
	pub spec: serde_json::Value,
	/// Modes this config belongs to.
	pub modes: HashSet<ModeId>,
	pub current_config: bool,
	pub enabled: bool,
}

/// Append-only history of observed run-state for a logger. The latest
/// row per logger is authoritative.
#[derive(Clone, Debug)]
pub struct LoggerConfigState {
	pub logger: LoggerId,
	pub config: Option<ConfigId>,
	pub timestamp: f64,
	pub last_checked: f64,
	pub running: Option<bool>,
	pub failed: Option<bool>,
	pub pid: Option<i64>,
	pub errors: String,
}

#[derive(Clone, Debug)]
pub struct LogMessage {
	pub timestamp: f64,
	pub source: String,
	pub user: String,
	pub log_level: i32,
	pub cruise_id: Option<String>,
	pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("control store busy; could not acquire table lock")]
	Busy,
}

/// All tables plus the id counter. Only reachable through a transaction.
#[derive(Default)]
pub struct Tables {
	pub cruise: Option<Cruise>,
	pub modes: HashMap<ModeId, Mode>,
	pub loggers: HashMap<LoggerId, Logger>,
	pub configs: HashMap<ConfigId, LoggerConfig>,
	pub config_states: Vec<LoggerConfigState>,
	pub messages: Vec<LogMessage>,
	last_update: f64,
	next_id: u64,
}

impl Tables {
	fn next_id(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}

	/// Timestamp of the last mutating operation; cache-validation beacon.
	pub fn last_update(&self) -> f64 {
		self.last_update
	}

	/// Every mutator that changes configuration calls this inside its
	/// transaction.
	pub fn touch_last_update(&mut self) {
		self.last_update = timeutil::now();
	}

	pub fn insert_cruise(&mut self, cruise: Cruise) {
		self.cruise = Some(cruise);
	}

	/// Drop the cruise and everything owned by it. Config states go too;
	/// log messages survive, as does the LastUpdate beacon.
	pub fn delete_cruise(&mut self) {
		self.cruise = None;
		self.modes.clear();
		self.loggers.clear();
		self.configs.clear();
		self.config_states.clear();
	}

	pub fn insert_mode(&mut self, name: &str) -> ModeId {
		let id = self.next_id();
		self.modes.insert(
			id,
			Mode {
				id,
				name: name.to_owned(),
			},
		);
		id
	}

	pub fn insert_logger(&mut self, name: &str) -> LoggerId {
		let id = self.next_id();
		self.loggers.insert(
			id,
			Logger {
				id,
				name: name.to_owned(),
				config: None,
			},
		);
		id
	}

	pub fn insert_config(
		&mut self,
		name: &str,
		logger: LoggerId,
		spec: serde_json::Value,
	) -> ConfigId {
		let id = self.next_id();
		self.configs.insert(
			id,
			LoggerConfig {
				id,
				name: name.to_owned(),
				logger,
				spec,
				modes: HashSet::new(),
				current_config: false,
				enabled: true,
			},
		);
		id
	}

	pub fn mode_by_name(&self, name: &str) -> Option<&Mode> {
		self.modes.values().find(|mode| mode.name == name)
	}

	pub fn logger_by_name(&self, name: &str) -> Option<&Logger> {
		self.loggers.values().find(|logger| logger.name == name)
	}

	pub fn config_by_name(&self, name: &str) -> Option<&LoggerConfig> {
		self.configs.values().find(|config| config.name == name)
	}

	/// The config associated with both the logger and the mode, honoring
	/// the invariant that at most one exists.
	pub fn config_for_logger_mode(
		&self,
		logger: LoggerId,
		mode: ModeId,
	) -> Option<&LoggerConfig> {
		self.configs
			.values()
			.find(|config| config.logger == logger && config.modes.contains(&mode))
	}

	pub fn configs_for_logger(&self, logger: LoggerId) -> Vec<&LoggerConfig> {
		let mut configs: Vec<&LoggerConfig> = self
			.configs
			.values()
			.filter(|config| config.logger == logger)
			.collect();
		configs.sort_by_key(|config| config.id);
		configs
	}

	pub fn logger_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.loggers.values().map(|l| l.name.clone()).collect();
		names.sort();
		names
	}

	pub fn mode_names(&self) -> Vec<String> {
		let mut modes: Vec<&Mode> = self.modes.values().collect();
		modes.sort_by_key(|mode| mode.id);
		modes.iter().map(|mode| mode.name.clone()).collect()
	}

	/// Latest observed state row for a logger, by insertion order.
	pub fn latest_state(&self, logger: LoggerId) -> Option<&LoggerConfigState> {
		self.config_states
			.iter()
			.rev()
			.find(|state| state.logger == logger)
	}

	pub fn latest_state_mut(&mut self, logger: LoggerId) -> Option<&mut LoggerConfigState> {
		self.config_states
			.iter_mut()
			.rev()
			.find(|state| state.logger == logger)
	}

	pub fn append_state(&mut self, state: LoggerConfigState) {
		self.config_states.push(state);
	}

	pub fn append_message(&mut self, message: LogMessage) {
		self.messages.push(message);
	}
}

/// Transactional store over the tables: all access happens under an
/// exclusive table-level lock with a bounded acquisition wait, so callers
/// can treat a `Busy` failure as transient and retry.
#[derive(Default)]
pub struct ControlStore {
	tables: Mutex<Tables>,
}

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

impl ControlStore {
	pub fn new() -> Self {
		Default::default()
	}

	/// Run a closure under the exclusive write lock.
	pub fn transaction<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> Result<R, StoreError> {
		let mut tables = self
			.tables
			.try_lock_for(LOCK_TIMEOUT)
			.ok_or(StoreError::Busy)?;
		Ok(f(&mut tables))
	}

	/// Run a read-only closure under the same lock.
	pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, StoreError> {
		let tables = self
			.tables
			.try_lock_for(LOCK_TIMEOUT)
			.ok_or(StoreError::Busy)?;
		Ok(f(&tables))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_are_unique_across_tables() {
		let store = ControlStore::new();
		let (m, l, c) = store
			.transaction(|tables| {
				let m = tables.insert_mode("off");
				let l = tables.insert_logger("gyr1");
				let c = tables.insert_config("gyr1->off", l, serde_json::json!({}));
				(m, l, c)
			})
			.unwrap();
		assert_ne!(m, l);
		assert_ne!(l, c);
	}

	#[test]
	fn cascade_delete_clears_owned_tables_only() {
		let store = ControlStore::new();
		store
			.transaction(|tables| {
				tables.insert_cruise(Cruise {
					id: "NBP1406".to_owned(),
					start: None,
					end: None,
					config_filename: None,
					loaded_time: 100.0,
					active_mode: None,
					default_mode: None,
				});
				let logger = tables.insert_logger("gyr1");
				tables.insert_config("gyr1->off", logger, serde_json::json!({}));
				tables.append_state(LoggerConfigState {
					logger,
					config: None,
					timestamp: 1.0,
					last_checked: 1.0,
					running: Some(false),
					failed: Some(false),
					pid: Some(0),
					errors: String::new(),
				});
				tables.append_message(LogMessage {
					timestamp: 1.0,
					source: "test".to_owned(),
					user: "".to_owned(),
					log_level: 20,
					cruise_id: None,
					message: "loaded".to_owned(),
				});
				tables.delete_cruise();
				assert!(tables.cruise.is_none());
				assert!(tables.loggers.is_empty());
				assert!(tables.configs.is_empty());
				assert!(tables.config_states.is_empty());
				// Log messages outlive the cruise.
				assert_eq!(tables.messages.len(), 1);
			})
			.unwrap();
	}

	#[test]
	fn latest_state_is_last_appended() {
		let store = ControlStore::new();
		store
			.transaction(|tables| {
				let logger = tables.insert_logger("gyr1");
				for i in 0..3 {
					tables.append_state(LoggerConfigState {
						logger,
						config: None,
						timestamp: i as f64,
						last_checked: i as f64,
						running: Some(i == 2),
						failed: Some(false),
						pid: Some(i),
						errors: String::new(),
					});
				}
				let latest = tables.latest_state(logger).unwrap();
				assert_eq!(latest.pid, Some(2));
				assert_eq!(latest.running, Some(true));
			})
			.unwrap();
	}

	#[test]
	fn last_update_advances_monotonically() {
		let store = ControlStore::new();
		let before = store.read(|tables| tables.last_update()).unwrap();
		assert_eq!(before, 0.0);
		store.transaction(|tables| tables.touch_last_update()).unwrap();
		let after = store.read(|tables| tables.last_update()).unwrap();
		assert!(after > 0.0);
	}
}
