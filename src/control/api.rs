//! The only supported interface for reading and mutating the control
//! store. Readers consult per-method caches validated against the
//! LastUpdate beacon; mutators run in store transactions, advance the
//! beacon, and wake subscribers through the update/load signals.

use super::cruise::CruiseConfig;
use super::store::{
	ControlStore, Cruise, LogMessage, LoggerConfigState, StoreError, Tables,
};
use crate::timeutil;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::*;

const DEFAULT_MAX_TRIES: usize = 3;
const RETRY_SLEEP: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
	#[error("no cruise defined")]
	NoCruise,
	#[error("cruise has no mode {0:?}")]
	NoSuchMode(String),
	#[error("no logger {0:?} defined")]
	NoSuchLogger(String),
	#[error("no config {0:?} in cruise")]
	NoSuchConfig(String),
	#[error("config {0:?} is not compatible with logger {1:?}")]
	IncompatibleConfig(String, String),
	#[error(transparent)]
	Config(#[from] crate::config::ConfigError),
	#[error("control store error: {0}")]
	Store(#[from] StoreError),
}

/// Top-level cruise information, as returned by `get_configuration`.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct CruiseInfo {
	pub id: String,
	pub start: Option<f64>,
	pub end: Option<f64>,
	pub config_filename: Option<String>,
	pub loaded_time: f64,
	pub active_mode: Option<String>,
	pub default_mode: Option<String>,
	pub modes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct LoggerInfo {
	pub configs: Vec<String>,
	pub active: Option<String>,
}

/// One logger's status as reported by its runner.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggerStatus {
	pub config: Option<String>,
	#[serde(default)]
	pub errors: Vec<String>,
	pub pid: Option<i64>,
	pub failed: Option<bool>,
	pub running: Option<bool>,
}

pub type StatusMap = HashMap<String, LoggerStatus>;

/// One logger's most recent observed state, as stored.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct LoggerStateReport {
	pub config: Option<String>,
	pub running: Option<bool>,
	pub failed: Option<bool>,
	pub pid: Option<i64>,
	pub errors: Vec<String>,
	pub last_checked: f64,
}

#[derive(Default)]
struct Caches {
	active_mode: Option<Option<String>>,
	active_mode_time: f64,
	logger_configs: Option<HashMap<String, serde_json::Value>>,
	logger_configs_time: f64,
	/// Last ingested status map, for the update_status short-circuit.
	ingested_status: Option<StatusMap>,
	retrieved_status: Option<HashMap<String, LoggerStateReport>>,
	retrieved_status_time: f64,
}

pub struct ControlApi {
	store: Arc<ControlStore>,
	// Re-entrant: high-level methods may call lower-level methods that
	// also take it; other threads serialize at the outer boundary.
	config_rlock: ReentrantMutex<()>,
	caches: Mutex<Caches>,
	update_tx: broadcast::Sender<()>,
	load_tx: broadcast::Sender<()>,
}

impl Default for ControlApi {
	fn default() -> Self {
		Self::new(Arc::new(ControlStore::new()))
	}
}

impl ControlApi {
	pub fn new(store: Arc<ControlStore>) -> Self {
		let (update_tx, _) = broadcast::channel(16);
		let (load_tx, _) = broadcast::channel(16);
		ControlApi {
			store,
			config_rlock: ReentrantMutex::new(()),
			caches: Mutex::new(Caches::default()),
			update_tx,
			load_tx,
		}
	}

	/// Wake anyone blocked waiting for configuration changes.
	pub fn signal_update(&self) {
		info!("Signaling update");
		let _ = self.update_tx.send(());
	}

	/// Wake anyone blocked waiting for a fresh cruise load.
	pub fn signal_load(&self) {
		info!("Signaling load");
		let _ = self.load_tx.send(());
	}

	pub fn on_update(&self) -> broadcast::Receiver<()> {
		self.update_tx.subscribe()
	}

	pub fn on_load(&self) -> broadcast::Receiver<()> {
		self.load_tx.subscribe()
	}

	/// Run a store transaction, retrying on transient lock contention
	/// with small bounded sleeps.
	fn transaction<R>(&self, mut f: impl FnMut(&mut Tables) -> R) -> Result<R, StoreError> {
		let mut tries = 0;
		loop {
			match self.store.transaction(&mut f) {
				Ok(result) => return Ok(result),
				Err(StoreError::Busy) => {
					tries += 1;
					if tries >= DEFAULT_MAX_TRIES {
						return Err(StoreError::Busy);
					}
					warn!("Failed control store access - trying again");
					std::thread::sleep(RETRY_SLEEP);
				}
			}
		}
	}

	fn read_tables<R>(&self, mut f: impl FnMut(&Tables) -> R) -> Result<R, StoreError> {
		let mut tries = 0;
		loop {
			match self.store.read(&mut f) {
				Ok(result) => return Ok(result),
				Err(StoreError::Busy) => {
					tries += 1;
					if tries >= DEFAULT_MAX_TRIES {
						return Err(StoreError::Busy);
					}
					warn!("Failed control store read - trying again");
					std::thread::sleep(RETRY_SLEEP);
				}
			}
		}
	}

	fn last_config_update_time(&self) -> f64 {
		self.read_tables(|tables| tables.last_update()).unwrap_or(0.0)
	}

	////////////////////////////////////////////////////////////////////
	// Readers. Readers never raise on missing data; they return
	// None/empty and log.

	pub fn get_configuration(&self) -> Option<CruiseInfo> {
		let _guard = self.config_rlock.lock();
		self.read_tables(|tables| {
			tables.cruise.as_ref().map(|cruise| CruiseInfo {
				id: cruise.id.clone(),
				start: cruise.start,
				end: cruise.end,
				config_filename: cruise.config_filename.clone(),
				loaded_time: cruise.loaded_time,
				active_mode: cruise
					.active_mode
					.and_then(|id| tables.modes.get(&id))
					.map(|mode| mode.name.clone()),
				default_mode: cruise
					.default_mode
					.and_then(|id| tables.modes.get(&id))
					.map(|mode| mode.name.clone()),
				modes: tables.mode_names(),
			})
		})
		.ok()
		.flatten()
	}

	pub fn get_modes(&self) -> Option<Vec<String>> {
		let _guard = self.config_rlock.lock();
		self.read_tables(|tables| {
			tables.cruise.as_ref().map(|_| tables.mode_names())
		})
		.ok()
		.flatten()
	}

	/// Active mode, through the cache when it is still valid.
	pub fn get_active_mode(&self) -> Option<String> {
		let _guard = self.config_rlock.lock();
		let last_update = self.last_config_update_time();
		{
			let caches = self.caches.lock();
			if let Some(active_mode) = &caches.active_mode {
				if caches.active_mode_time >= last_update {
					return active_mode.clone();
				}
			}
		}

		let active_mode = self
			.read_tables(|tables| {
				tables.cruise.as_ref().and_then(|cruise| {
					cruise
						.active_mode
						.and_then(|id| tables.modes.get(&id))
						.map(|mode| mode.name.clone())
				})
			})
			.ok()
			.flatten();

		let mut caches = self.caches.lock();
		caches.active_mode = Some(active_mode.clone());
		caches.active_mode_time = timeutil::now();
		active_mode
	}

	pub fn get_default_mode(&self) -> Option<String> {
		let _guard = self.config_rlock.lock();
		self.read_tables(|tables| {
			tables.cruise.as_ref().and_then(|cruise| {
				cruise
					.default_mode
					.and_then(|id| tables.modes.get(&id))
					.map(|mode| mode.name.clone())
			})
		})
		.ok()
		.flatten()
	}

	/// All loggers with their available config names and active config.
	pub fn get_loggers(&self) -> HashMap<String, LoggerInfo> {
		let _guard = self.config_rlock.lock();
		self.read_tables(|tables| {
			let mut result = HashMap::new();
			for logger in tables.loggers.values() {
				let configs = tables
					.configs_for_logger(logger.id)
					.iter()
					.map(|config| config.name.clone())
					.collect();
				let active = logger
					.config
					.and_then(|id| tables.configs.get(&id))
					.map(|config| config.name.clone());
				result.insert(logger.name.clone(), LoggerInfo { configs, active });
			}
			result
		})
		.unwrap_or_default()
	}

	pub fn get_logger(&self, logger: &str) -> Option<LoggerInfo> {
		self.get_loggers().remove(logger)
	}

	/// The pipeline spec stored under a config name.
	pub fn get_logger_config(&self, config_name: &str) -> Option<serde_json::Value> {
		let _guard = self.config_rlock.lock();
		self.read_tables(|tables| {
			tables
				.config_by_name(config_name)
				.map(|config| config.spec.clone())
		})
		.ok()
		.flatten()
	}

	/// Configs per logger: for a named mode, that mode's bundle; with no
	/// mode, every logger's current config, served from cache while the
	/// beacon says it is fresh.
	pub fn get_logger_configs(&self, mode: Option<&str>) -> HashMap<String, serde_json::Value> {
		let _guard = self.config_rlock.lock();
		match mode {
			None => {
				let last_update = self.last_config_update_time();
				{
					let caches = self.caches.lock();
					if let Some(configs) = &caches.logger_configs {
						if caches.logger_configs_time >= last_update {
							return configs.clone();
						}
					}
				}
				let configs = self
					.read_tables(|tables| {
						let mut result = HashMap::new();
						for config in tables.configs.values() {
							if !config.current_config {
								continue;
							}
							if let Some(logger) = tables.loggers.get(&config.logger) {
								result.insert(logger.name.clone(), config.spec.clone());
							}
						}
						result
					})
					.unwrap_or_default();
				let mut caches = self.caches.lock();
				caches.logger_configs = Some(configs.clone());
				caches.logger_configs_time = timeutil::now();
				configs
			}
			Some(mode) => self
				.read_tables(|tables| {
					let mode_id = match tables.mode_by_name(mode) {
						Some(mode) => mode.id,
						None => {
							warn!("Cruise has no mode {:?}", mode);
							return HashMap::new();
						}
					};
					let mut result = HashMap::new();
					for config in tables.configs.values() {
						if !config.modes.contains(&mode_id) {
							continue;
						}
						if let Some(logger) = tables.loggers.get(&config.logger) {
							result.insert(logger.name.clone(), config.spec.clone());
						}
					}
					result
				})
				.unwrap_or_default(),
		}
	}

	/// Name of the config for a logger: its config in `mode`, or its
	/// current config when `mode` is None.
	pub fn get_logger_config_name(&self, logger: &str, mode: Option<&str>) -> Option<String> {
		let _guard = self.config_rlock.lock();
		self.read_tables(|tables| {
			let logger_row = match tables.logger_by_name(logger) {
				Some(logger_row) => logger_row,
				None => {
					warn!("No logger {:?} defined", logger);
					return None;
				}
			};
			match mode {
				None => logger_row
					.config
					.and_then(|id| tables.configs.get(&id))
					.map(|config| config.name.clone()),
				Some(mode) => {
					let mode_id = match tables.mode_by_name(mode) {
						Some(mode) => mode.id,
						None => {
							warn!("No such mode {:?} defined", mode);
							return None;
						}
					};
					match tables.config_for_logger_mode(logger_row.id, mode_id) {
						Some(config) => Some(config.name.clone()),
						None => {
							warn!("No such logger/mode ({}/{})", logger, mode);
							None
						}
					}
				}
			}
		})
		.ok()
		.flatten()
	}

	/// All config names valid for a logger.
	pub fn get_logger_config_names(&self, logger: &str) -> Vec<String> {
		let _guard = self.config_rlock.lock();
		self.read_tables(|tables| {
			tables
				.logger_by_name(logger)
				.map(|logger_row| {
					tables
						.configs_for_logger(logger_row.id)
						.iter()
						.map(|config| config.name.clone())
						.collect()
				})
				.unwrap_or_default()
		})
		.unwrap_or_default()
	}

	////////////////////////////////////////////////////////////////////
	// Mutators. These raise precisely on bad requests.

	/// Load a complete cruise configuration, replacing any existing
	/// cruise. Validation happens before anything is touched.
	pub fn load_configuration(&self, config: &CruiseConfig) -> Result<(), ApiError> {
		let _guard = self.config_rlock.lock();
		config.validate()?;

		self.transaction(|tables| {
			if let Some(old_cruise) = &tables.cruise {
				info!("Deleting old cruise {:?}", old_cruise.id);
			}
			tables.delete_cruise();

			tables.insert_cruise(Cruise {
				id: config.cruise_id(),
				start: config.start_timestamp(),
				end: config.end_timestamp(),
				config_filename: config.cruise.config_filename.clone(),
				loaded_time: timeutil::now(),
				active_mode: None,
				default_mode: None,
			});

			// Modes first, so configs and the cruise can reference them.
			let mut mode_ids = HashMap::new();
			for mode_name in config.modes.keys() {
				info!("  Creating mode {} (cruise {})", mode_name, config.cruise_id());
				let mode_id = tables.insert_mode(mode_name);
				mode_ids.insert(mode_name.clone(), mode_id);
				if Some(mode_name) == config.default_mode.as_ref() {
					info!("    Setting {} as default mode", mode_name);
					if let Some(cruise) = &mut tables.cruise {
						cruise.default_mode = Some(mode_id);
					}
				}
			}

			for (logger_name, logger_def) in &config.loggers {
				info!(
					"Creating logger {} (cruise {})",
					logger_name,
					config.cruise_id()
				);
				let logger_id = tables.insert_logger(logger_name);

				for config_name in &logger_def.configs {
					// Fold the config's name into its spec.
					let mut spec = config.configs[config_name].clone();
					if let Some(map) = spec.as_object_mut() {
						map.entry("name".to_owned())
							.or_insert_with(|| serde_json::json!(config_name));
					}
					let config_id = tables.insert_config(config_name, logger_id, spec);

					for (mode_name, mode_loggers) in &config.modes {
						if mode_loggers.get(logger_name) != Some(config_name) {
							continue;
						}
						let mode_id = mode_ids[mode_name];
						if let Some(config_row) = tables.configs.get_mut(&config_id) {
							config_row.modes.insert(mode_id);
						}
						// A config in the default mode becomes the
						// logger's starting config.
						if Some(mode_name) == config.default_mode.as_ref() {
							if let Some(logger_row) = tables.loggers.get_mut(&logger_id) {
								logger_row.config = Some(config_id);
							}
						}
					}
				}
			}

			tables.touch_last_update();
			info!("Cruise loaded");
		})?;

		self.signal_load();
		Ok(())
	}

	/// Remove the current cruise from the store.
	pub fn delete_configuration(&self) -> Result<(), ApiError> {
		let _guard = self.config_rlock.lock();
		self.transaction(|tables| {
			tables.delete_cruise();
			tables.touch_last_update();
		})?;
		Ok(())
	}

	/// Atomically repoint every logger at its config for `mode`, falling
	/// back to its "off" config, skipping (with a warning) loggers that
	/// have neither.
	pub fn set_active_mode(&self, mode: &str) -> Result<(), ApiError> {
		let _guard = self.config_rlock.lock();
		self.transaction(|tables| {
			if tables.cruise.is_none() {
				warn!("Can not set active mode - no cruise found");
				return Err(ApiError::NoCruise);
			}
			let mode_id = tables
				.mode_by_name(mode)
				.map(|m| m.id)
				.ok_or_else(|| ApiError::NoSuchMode(mode.to_owned()))?;
			let off_mode_id = tables.mode_by_name("off").map(|m| m.id);

			if let Some(cruise) = &mut tables.cruise {
				cruise.active_mode = Some(mode_id);
			}

			let logger_ids: Vec<u64> = {
				let mut ids: Vec<u64> = tables.loggers.keys().copied().collect();
				ids.sort_unstable();
				ids
			};
			for logger_id in logger_ids {
				let logger_name = tables.loggers[&logger_id].name.clone();

				// Old config is no longer current.
				if let Some(old_config_id) = tables.loggers[&logger_id].config {
					if let Some(old_config) = tables.configs.get_mut(&old_config_id) {
						old_config.current_config = false;
					}
				}

				let mut new_config_id = tables
					.config_for_logger_mode(logger_id, mode_id)
					.map(|config| config.id);
				if new_config_id.is_none() {
					warn!(
						"Logger {} has no configuration defined for mode {}; \
						 setting to \"off\"",
						logger_name, mode
					);
					new_config_id = off_mode_id
						.and_then(|off| tables.config_for_logger_mode(logger_id, off))
						.map(|config| config.id);
				}
				let new_config_id = match new_config_id {
					Some(id) => id,
					None => {
						warn!(
							"Logger {} has no configuration defined for mode \
							 \"off\" either; skipping it",
							logger_name
						);
						continue;
					}
				};

				if let Some(logger_row) = tables.loggers.get_mut(&logger_id) {
					logger_row.config = Some(new_config_id);
				}
				if let Some(config_row) = tables.configs.get_mut(&new_config_id) {
					config_row.current_config = true;
				}
				let now = timeutil::now();
				tables.append_state(LoggerConfigState {
					logger: logger_id,
					config: Some(new_config_id),
					timestamp: now,
					last_checked: now,
					running: Some(false),
					failed: Some(false),
					pid: Some(0),
					errors: String::new(),
				});
			}

			tables.touch_last_update();
			Ok(())
		})??;

		self.signal_update();
		Ok(())
	}

	/// Point one logger at a new config; the config must belong to it.
	pub fn set_active_logger_config(
		&self,
		logger: &str,
		config_name: &str,
	) -> Result<(), ApiError> {
		let _guard = self.config_rlock.lock();
		self.transaction(|tables| {
			let logger_id = tables
				.logger_by_name(logger)
				.map(|l| l.id)
				.ok_or_else(|| ApiError::NoSuchLogger(logger.to_owned()))?;
			let new_config = tables
				.config_by_name(config_name)
				.ok_or_else(|| ApiError::NoSuchConfig(config_name.to_owned()))?;
			if new_config.logger != logger_id {
				return Err(ApiError::IncompatibleConfig(
					config_name.to_owned(),
					logger.to_owned(),
				));
			}
			let new_config_id = new_config.id;

			if let Some(old_config_id) = tables.loggers[&logger_id].config {
				if let Some(old_config) = tables.configs.get_mut(&old_config_id) {
					old_config.current_config = false;
				}
			}
			if let Some(logger_row) = tables.loggers.get_mut(&logger_id) {
				logger_row.config = Some(new_config_id);
			}
			if let Some(config_row) = tables.configs.get_mut(&new_config_id) {
				config_row.current_config = true;
			}
			let now = timeutil::now();
			tables.append_state(LoggerConfigState {
				logger: logger_id,
				config: Some(new_config_id),
				timestamp: now,
				last_checked: now,
				running: Some(false),
				failed: Some(false),
				pid: Some(0),
				errors: String::new(),
			});
			tables.touch_last_update();
			Ok(())
		})??;

		self.signal_update();
		Ok(())
	}

	////////////////////////////////////////////////////////////////////
	// Status ingestion and retrieval.

	/// Register the loggers' retrieved status reports. A report
	/// identical to the previous one is a no-op; otherwise each logger's
	/// state history is appended to when anything material changed, and
	/// its `last_checked` refreshed regardless.
	pub fn update_status(&self, status: &StatusMap) -> Result<(), ApiError> {
		let _guard = self.config_rlock.lock();
		{
			let mut caches = self.caches.lock();
			if caches.ingested_status.as_ref() == Some(status) {
				debug!("No status change detected - not updating store");
				return Ok(());
			}
			caches.ingested_status = Some(status.clone());
		}

		self.transaction(|tables| {
			for (logger_name, report) in status {
				let logger_id = match tables.logger_by_name(logger_name) {
					Some(logger) => logger.id,
					None => continue,
				};
				let now = timeutil::now();

				let stored = tables
					.latest_state(logger_id)
					.map(|state| (state.running, state.failed, state.pid, state.config));
				match stored {
					None => {
						// No prior state: create one if the reported
						// config resolves, else skip this logger.
						let config_id = report.config.as_ref().and_then(|name| {
							tables
								.config_by_name(name)
								.filter(|config| config.logger == logger_id)
								.map(|config| config.id)
						});
						if report.config.is_some() && config_id.is_none() {
							continue;
						}
						tables.append_state(LoggerConfigState {
							logger: logger_id,
							config: config_id,
							timestamp: now,
							last_checked: now,
							running: report.running,
							failed: report.failed,
							pid: report.pid,
							errors: report.errors.join("\n"),
						});
					}
					Some((running, failed, pid, config_id)) => {
						let changed = running != report.running
							|| failed != report.failed
							|| pid != report.pid
							|| !report.errors.is_empty();
						if changed {
							tables.append_state(LoggerConfigState {
								logger: logger_id,
								config: config_id,
								timestamp: now,
								last_checked: now,
								running: report.running,
								failed: report.failed,
								pid: report.pid,
								errors: report.errors.join("\n"),
							});
						} else if let Some(latest) = tables.latest_state_mut(logger_id) {
							// Unchanged: just note that we checked.
							latest.last_checked = now;
						}
					}
				}
			}
			tables.touch_last_update();
		})?;
		Ok(())
	}

	/// Most recent status per logger. With `since_timestamp`, only
	/// loggers checked after that time; without it, the cached snapshot
	/// while the beacon says it is fresh.
	pub fn get_status(&self, since_timestamp: Option<f64>) -> HashMap<String, LoggerStateReport> {
		let _guard = self.config_rlock.lock();

		if since_timestamp.is_none() {
			let last_update = self.last_config_update_time();
			let caches = self.caches.lock();
			if let Some(status) = &caches.retrieved_status {
				if caches.retrieved_status_time >= last_update {
					debug!("Returning cached status");
					return status.clone();
				}
			}
		}

		let status = self
			.read_tables(|tables| {
				let mut result = HashMap::new();
				for logger in tables.loggers.values() {
					let state = match tables.latest_state(logger.id) {
						Some(state) => state,
						None => continue,
					};
					if let Some(since) = since_timestamp {
						if state.last_checked <= since {
							continue;
						}
					}
					let config_name = state
						.config
						.and_then(|id| tables.configs.get(&id))
						.map(|config| config.name.clone());
					let errors = if state.errors.is_empty() {
						vec![]
					} else {
						state.errors.split('\n').map(String::from).collect()
					};
					result.insert(
						logger.name.clone(),
						LoggerStateReport {
							config: config_name,
							running: state.running,
							failed: state.failed,
							pid: state.pid,
							errors,
							last_checked: state.last_checked,
						},
					);
				}
				result
			})
			.unwrap_or_default();

		if since_timestamp.is_none() {
			let mut caches = self.caches.lock();
			caches.retrieved_status = Some(status.clone());
			caches.retrieved_status_time = timeutil::now();
		}
		status
	}

	////////////////////////////////////////////////////////////////////
	// Message log.

	/// Timestamp and store a message from a server or logger.
	pub fn message_log(&self, source: &str, user: &str, log_level: i32, message: &str) {
		let _guard = self.config_rlock.lock();
		let result = self.transaction(|tables| {
			let cruise_id = tables.cruise.as_ref().map(|cruise| cruise.id.clone());
			tables.append_message(LogMessage {
				timestamp: timeutil::now(),
				source: source.to_owned(),
				user: user.to_owned(),
				log_level,
				cruise_id,
				message: message.to_owned(),
			});
		});
		if let Err(e) = result {
			warn!("Unable to store log message: {}", e);
		}
	}

	/// Messages at or above `log_level`, optionally filtered by source
	/// and user. Without `since_timestamp` only the most recent message
	/// is returned; with it, everything newer, in timestamp order.
	pub fn get_message_log(
		&self,
		source: Option<&str>,
		user: Option<&str>,
		log_level: i32,
		since_timestamp: Option<f64>,
	) -> Vec<LogMessage> {
		let _guard = self.config_rlock.lock();
		self.read_tables(|tables| {
			let matching: Vec<&LogMessage> = tables
				.messages
				.iter()
				.filter(|m| m.log_level >= log_level)
				.filter(|m| source.map_or(true, |s| m.source == s))
				.filter(|m| user.map_or(true, |u| m.user == u))
				.collect();
			match since_timestamp {
				None => matching.last().map(|m| vec![(*m).clone()]).unwrap_or_default(),
				Some(since) => {
					let mut newer: Vec<LogMessage> = matching
						.into_iter()
						.filter(|m| m.timestamp > since)
						.cloned()
						.collect();
					newer.sort_by(|a, b| {
						a.timestamp
							.partial_cmp(&b.timestamp)
							.unwrap_or(std::cmp::Ordering::Equal)
					});
					newer
				}
			}
		})
		.unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::control::cruise::sample_cruise_value;

	fn loaded_api() -> ControlApi {
		let api = ControlApi::default();
		let config = CruiseConfig::from_value(&sample_cruise_value()).unwrap();
		api.load_configuration(&config).unwrap();
		api
	}

	#[test]
	fn load_populates_cruise_and_loggers() {
		let api = loaded_api();
		let info = api.get_configuration().unwrap();
		assert_eq!(info.id, "NBP1406");
		assert_eq!(info.default_mode.as_deref(), Some("off"));
		assert_eq!(info.modes.len(), 2);

		let loggers = api.get_loggers();
		assert_eq!(loggers.len(), 2);
		assert_eq!(
			loggers["gyr1"].configs,
			vec!["gyr1->off".to_owned(), "gyr1->file".to_owned()]
		);
		// Default mode config is the starting config.
		assert_eq!(loggers["gyr1"].active.as_deref(), Some("gyr1->off"));
	}

	#[test]
	fn reload_replaces_previous_cruise() {
		let api = loaded_api();
		let mut value = sample_cruise_value();
		value["cruise"]["id"] = serde_json::json!("NBP1407");
		let config = CruiseConfig::from_value(&value).unwrap();
		api.load_configuration(&config).unwrap();
		assert_eq!(api.get_configuration().unwrap().id, "NBP1407");
		assert_eq!(api.get_loggers().len(), 2);
	}

	#[test]
	fn mode_switch_repoints_every_logger() {
		let api = loaded_api();
		api.set_active_mode("port").unwrap();
		assert_eq!(api.get_active_mode().as_deref(), Some("port"));
		assert_eq!(
			api.get_logger_config_name("gyr1", None).as_deref(),
			Some("gyr1->file")
		);
		assert_eq!(
			api.get_logger_config_name("s330", None).as_deref(),
			Some("s330->file")
		);
		assert_eq!(
			api.get_logger_config_name("gyr1", Some("port")).as_deref(),
			Some("gyr1->file")
		);

		api.set_active_mode("off").unwrap();
		assert_eq!(api.get_active_mode().as_deref(), Some("off"));
		for (_, info) in api.get_loggers() {
			assert!(info.active.unwrap().ends_with("off"));
		}
	}

	#[test]
	fn mode_switch_to_unknown_mode_is_rejected() {
		let api = loaded_api();
		assert!(matches!(
			api.set_active_mode("underway"),
			Err(ApiError::NoSuchMode(_))
		));
	}

	#[test]
	fn mode_switch_without_cruise_is_rejected() {
		let api = ControlApi::default();
		assert!(matches!(api.set_active_mode("off"), Err(ApiError::NoCruise)));
	}

	#[test]
	fn missing_mode_config_falls_back_to_off() {
		let mut value = sample_cruise_value();
		// Remove s330 from port mode; on switch it should land on off.
		value["modes"]["port"].as_object_mut().unwrap().remove("s330");
		let api = ControlApi::default();
		api.load_configuration(&CruiseConfig::from_value(&value).unwrap())
			.unwrap();
		api.set_active_mode("port").unwrap();
		assert_eq!(
			api.get_logger_config_name("s330", None).as_deref(),
			Some("s330->off")
		);
		assert_eq!(
			api.get_logger_config_name("gyr1", None).as_deref(),
			Some("gyr1->file")
		);
	}

	#[test]
	fn set_active_logger_config_validates_ownership() {
		let api = loaded_api();
		api.set_active_logger_config("gyr1", "gyr1->file").unwrap();
		assert_eq!(
			api.get_logger_config_name("gyr1", None).as_deref(),
			Some("gyr1->file")
		);
		assert!(matches!(
			api.set_active_logger_config("gyr1", "s330->file"),
			Err(ApiError::IncompatibleConfig(_, _))
		));
		assert!(matches!(
			api.set_active_logger_config("ghost", "gyr1->file"),
			Err(ApiError::NoSuchLogger(_))
		));
	}

	#[test]
	fn read_your_writes_through_the_cache() {
		let api = loaded_api();
		// Prime the caches. No mode has been activated yet, so no config
		// is current and the bundle is empty.
		assert_eq!(api.get_active_mode(), None);
		assert!(api.get_logger_configs(None).is_empty());

		api.set_active_mode("port").unwrap();
		// Cached values must reflect the mutation immediately.
		assert_eq!(api.get_active_mode().as_deref(), Some("port"));
		let configs = api.get_logger_configs(None);
		assert_eq!(configs["gyr1"]["name"], "gyr1->file");
	}

	#[test]
	fn logger_configs_by_mode() {
		let api = loaded_api();
		let configs = api.get_logger_configs(Some("port"));
		assert_eq!(configs.len(), 2);
		assert_eq!(configs["s330"]["name"], "s330->file");
		assert!(api.get_logger_configs(Some("underway")).is_empty());
	}

	#[test]
	fn update_status_appends_only_on_change() {
		let api = loaded_api();
		api.set_active_mode("port").unwrap();

		let mut status = StatusMap::new();
		status.insert(
			"gyr1".to_owned(),
			LoggerStatus {
				config: Some("gyr1->file".to_owned()),
				errors: vec![],
				pid: Some(1234),
				failed: Some(false),
				running: Some(true),
			},
		);
		api.update_status(&status).unwrap();

		let reports = api.get_status(None);
		assert_eq!(reports["gyr1"].running, Some(true));
		assert_eq!(reports["gyr1"].pid, Some(1234));

		// Same status again: short-circuit, state rows unchanged.
		api.update_status(&status).unwrap();

		// Changed pid forces a new state row.
		status.get_mut("gyr1").unwrap().pid = Some(4321);
		api.update_status(&status).unwrap();
		let reports = api.get_status(None);
		assert_eq!(reports["gyr1"].pid, Some(4321));
	}

	#[test]
	fn get_status_since_filters_by_last_checked() {
		let api = loaded_api();
		api.set_active_mode("off").unwrap();
		let all = api.get_status(None);
		assert_eq!(all.len(), 2);
		let future = timeutil::now() + 1000.0;
		assert!(api.get_status(Some(future)).is_empty());
		assert_eq!(api.get_status(Some(0.0)).len(), 2);
	}

	#[test]
	fn message_log_filters_and_orders() {
		let api = loaded_api();
		api.message_log("logger_manager", "", 20, "first");
		api.message_log("logger_manager", "", 30, "second");
		api.message_log("other", "", 40, "third");

		// Most recent matching message only.
		let latest = api.get_message_log(Some("logger_manager"), None, 20, None);
		assert_eq!(latest.len(), 1);
		assert_eq!(latest[0].message, "second");

		// Everything above level 25 since the epoch, in order.
		let all = api.get_message_log(None, None, 25, Some(0.0));
		assert_eq!(all.len(), 2);
		assert_eq!(all[0].message, "second");
		assert_eq!(all[1].message, "third");

		// Cruise id is stamped onto messages.
		assert_eq!(latest[0].cruise_id.as_deref(), Some("NBP1406"));
	}

	#[test]
	fn delete_configuration_empties_the_store() {
		let api = loaded_api();
		api.delete_configuration().unwrap();
		assert!(api.get_configuration().is_none());
		assert!(api.get_loggers().is_empty());
		assert_eq!(api.get_active_mode(), None);
	}

	#[test]
	fn update_signal_fires_on_mode_switch() {
		let api = loaded_api();
		let mut rx = api.on_update();
		api.set_active_mode("port").unwrap();
		assert!(rx.try_recv().is_ok());
	}

	#[test]
	fn load_signal_fires_on_configuration_load() {
		let api = ControlApi::default();
		let mut rx = api.on_load();
		let config = CruiseConfig::from_value(&sample_cruise_value()).unwrap();
		api.load_configuration(&config).unwrap();
		assert!(rx.try_recv().is_ok());
	}
}
