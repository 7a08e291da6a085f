//! Logging initialization: a log4rs configuration read from a RON file
//! (written out with defaults on first launch), with a custom
//! `message_cache` appender that the control plane drains into its
//! message log.

pub mod message_cache_appender;

use log4rs::config::runtime::ConfigErrors;
use log4rs::config::{Config, Deserializers, RawConfig};
use std::path::{Path, PathBuf};
use tracing::log::SetLoggerError;

/// Name of the cache ring the control plane ingests from.
pub const CONTROL_MESSAGE_CACHE: &str = "control_message_log";

const DEFAULT_LOGGING_DEFINITION_RON: &str = r#"(
	// Default log filter level and appenders; per-module overrides go in
	// the loggers section below.
	root: Root(
		level: Info,
		appenders: ["console", "log_file", "control_message_log"],
	),

	appenders: {
		"console": {
			"kind": "console",
			"target": Some("stderr"),
			"encoder": Some({
				"kind": "pattern",
				"pattern": "{d} [{t}] {h({l})} {M}: {m}{n}",
			}),
		},
		"log_file": {
			"kind": "file",
			"path": "log/shipdaq.log",
			"encoder": {
				"kind": "pattern",
				"pattern": "{d} [{t}] {l} {M}: {m}{n}",
			},
		},
		// Recent messages cached for ingestion into the control store's
		// message log.
		"control_message_log": {
			"kind": "message_cache",
			"name": "control_message_log",
			"count": 1024,
			"encoder": Some({
				"kind": "pattern",
				"pattern": "{m}",
			}),
		},
	},

	loggers: {
		"mio::poll": ( level: Warn ),
		"hyper": ( level: Warn ),
	},
)
"#;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("Unable to create configuration directory at: {0:?}")]
	CreateDirError(PathBuf, #[source] std::io::Error),
	#[error("Unable to write missing default `logging.ron` file at: {0:?}")]
	UnableToWriteDefaultConfig(PathBuf, #[source] std::io::Error),
	#[error("Unable to initialize logging system from configuration file")]
	UnableToInitializeLoggingSystem(#[from] anyhow::Error),
	#[error("Unable to configure logging system")]
	ConfigFailure(#[from] ConfigErrors),
	#[error("Unable to initialize logging system from configuration")]
	ConfigurationInit(#[from] SetLoggerError),
	#[error("failed parsing configuration file in ron format")]
	RonParseFailure(#[from] ron::Error),
	#[error("failed reading file")]
	FileReadFailure(#[from] std::io::Error),
}

/// Initialize the logging system, writing out the default configuration
/// file if none exists yet.
pub fn init_logging(config_dir: Option<&Path>) -> Result<(), Error> {
	match config_dir {
		Some(path) => {
			if !path.is_dir() {
				std::fs::create_dir_all(&path)
					.map_err(|e| Error::CreateDirError(path.into(), e))?;
			}
			let logger_config_path = {
				let mut path: PathBuf = path.into();
				path.push("logging.ron");
				if !path.is_file() {
					std::fs::write(&path, DEFAULT_LOGGING_DEFINITION_RON)
						.map_err(|e| Error::UnableToWriteDefaultConfig(path.clone(), e))?;
				}
				path
			};
			let config = config_from_ron_file(&logger_config_path, &deserializers())?;
			log4rs::init_config(config)?;
		}
		None => {
			let config = config_from_ron_string(DEFAULT_LOGGING_DEFINITION_RON, &deserializers())?;
			log4rs::init_config(config)?;
		}
	};
	Ok(())
}

fn deserializers() -> Deserializers {
	let mut deserializers = Deserializers::new();
	deserializers.insert(
		"message_cache",
		message_cache_appender::MessageCacheAppenderDeserializer,
	);
	deserializers
}

fn config_from_ron_file(
	ron_path: impl AsRef<Path>,
	deserializers: &Deserializers,
) -> Result<Config, Error> {
	let ron = std::fs::read_to_string(ron_path)?;
	config_from_ron_string(&ron, deserializers).map_err(Into::into)
}

fn config_from_ron_string(ron: &str, deserializers: &Deserializers) -> Result<Config, ron::Error> {
	let raw_config: RawConfig = ron::from_str(ron)?;

	let (appenders, mut errors) = raw_config.appenders_lossy(&deserializers);
	errors.handle();

	let (config, mut errors) = Config::builder()
		.appenders(appenders)
		.loggers(raw_config.loggers())
		.build_lossy(raw_config.root());

	errors.handle();

	Ok(config)
}
