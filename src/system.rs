use crate::control::{ControlApi, CruiseConfig};
use crate::listen::{self, RunnerRegistry};
use ron::extensions::Extensions;
use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::*;

pub trait QuitOnError {
	fn quit_on_err(self, quit: &broadcast::Sender<()>) -> Self;
}

impl<S, E> QuitOnError for Result<S, E> {
	fn quit_on_err(self, quit: &broadcast::Sender<()>) -> Self {
		if self.is_err() {
			error!("Error occurred, sending quit signal");
			let _ = quit.send(());
		}
		self
	}
}

#[derive(Clone, Debug, StructOpt)]
#[structopt()]
pub struct SystemArgs {
	#[structopt(long, short = "m")]
	/// Override the run mode from the configuration file
	run_mode: Option<RunMode>,

	#[structopt(long, short, default_value = ".")]
	/// Path to the configuration files and every related external file
	root_dir: PathBuf,

	#[structopt(long)]
	/// Cruise definition file to load at startup, overriding the one
	/// named in the configuration file
	cruise: Option<PathBuf>,

	#[structopt(long)]
	/// Run a single listener pipeline from the given spec file instead
	/// of the full control plane
	listen: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub enum RunMode {
	Foreground,
	Daemon,
}

impl FromStr for RunMode {
	type Err = &'static str;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_lowercase().as_str() {
			"foreground" => Ok(RunMode::Foreground),
			"daemon" => Ok(RunMode::Daemon),
			_ => Err("unsupported run-mode, valid values:  Foreground, Daemon"),
		}
	}
}

#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
	run_mode: RunMode,
	/// Cruise definition loaded at startup, relative to the root dir.
	cruise_file: Option<PathBuf>,
	/// Seconds between supervisor reconciliation passes.
	status_interval: f64,
	/// Seconds between message-log ingestion sweeps.
	message_log_interval: f64,
}

impl Default for SystemConfig {
	fn default() -> Self {
		Self {
			run_mode: RunMode::Foreground,
			cruise_file: None,
			status_interval: 5.0,
			message_log_interval: 10.0,
		}
	}
}

impl SystemConfig {
	fn get_or_create(path: &Path) -> anyhow::Result<Option<Self>> {
		if path.is_file() {
			let ron = std::fs::read_to_string(path)?;
			let config = ron::from_str(&ron)?;
			Ok(Some(config))
		} else {
			let config = SystemConfig::default();
			let ron = ron::ser::to_string_pretty(
				&config,
				PrettyConfig::new()
					.with_new_line("\n".to_owned())
					.with_enumerate_arrays(true)
					.with_indentor("\t".to_owned())
					.with_extensions(Extensions::all()),
			)?;
			let mut file = std::fs::File::create(path)?;
			file.write_all(ron.as_bytes())?;
			file.write_all("\n".as_bytes())?;
			file.flush()?;
			drop(file);
			Ok(None)
		}
	}
}

pub struct System {
	config: SystemConfig,
	pub root_path: PathBuf,
	pub api: Arc<ControlApi>,
	pub runners: Arc<RunnerRegistry>,
	/// These tasks keep the system running. They should *ALWAYS* quit
	/// when `quit` is broadcast on or the system may not ever die.
	pub system_tasks: Arc<crossbeam::queue::SegQueue<JoinHandle<anyhow::Result<()>>>>,
	pub quit: broadcast::Sender<()>,
}

impl System {
	pub async fn run() -> anyhow::Result<()> {
		Self::run_with_args(SystemArgs::from_args()).await
	}

	pub async fn run_with_args(args: SystemArgs) -> anyhow::Result<()> {
		if let Some(listen_path) = &args.listen {
			return Self::run_listener(listen_path).await;
		}
		let config_path = args.root_dir.join("shipdaq.ron");
		if let Some(mut config) = SystemConfig::get_or_create(&config_path)? {
			if let Some(run_mode) = args.run_mode {
				config.run_mode = run_mode;
			}
			if let Some(cruise) = args.cruise {
				config.cruise_file = Some(cruise);
			}
			Self::run_with_config(args.root_dir.clone(), config).await
		} else {
			println!(
				"No configuration found, wrote out new configuration file at: {:?}, please make edits as necessary and launch again",
				config_path
			);
			Ok(())
		}
	}

	/// One-shot listener mode: build a single pipeline from a spec file
	/// and run it until its sources drain or the process is interrupted.
	pub async fn run_listener(spec_path: &Path) -> anyhow::Result<()> {
		crate::logging::init_logging(None)?;
		let spec = crate::config::read_config(spec_path)?;
		let runner = listen::build_pipeline(&spec)?;
		let (quit, _keep_quit_alive) = broadcast::channel(1);
		crate::system_tasks::daemon::spawn_signal_watcher(false, quit.clone());
		info!("Running listener from {:?}", spec_path);
		runner.run(&quit).await
	}

	pub async fn run_with_config(root_path: PathBuf, config: SystemConfig) -> anyhow::Result<()> {
		crate::logging::init_logging(Some(&root_path))?;
		info!("Initialized logging system");
		let (quit, _recv_quit) = broadcast::channel(1);
		let api = Arc::new(ControlApi::default());

		if let Some(cruise_file) = &config.cruise_file {
			let path = if cruise_file.is_absolute() {
				cruise_file.clone()
			} else {
				root_path.join(cruise_file)
			};
			info!("Loading cruise definition from {:?}", path);
			let cruise = CruiseConfig::from_file(&path)?;
			api.load_configuration(&cruise)?;
			if let Some(default_mode) = api.get_default_mode() {
				info!("Activating default mode {:?}", default_mode);
				api.set_active_mode(&default_mode)?;
			}
		}

		let mut system = System {
			root_path,
			config,
			api,
			runners: Arc::new(RunnerRegistry::new()),
			system_tasks: Default::default(),
			quit,
		};
		system.startup_systems().await?;
		info!(
			"Running system, {} system tasks upon startup",
			system.system_tasks.len()
		);
		system.run_loop().await?;
		info!("System running completed, no system tasks remaining, exiting");
		Ok(())
	}

	pub async fn startup_systems(&mut self) -> anyhow::Result<()> {
		anyhow::ensure!(self.system_tasks.is_empty(), "systems already exist");

		let daemon = matches!(self.config.run_mode, RunMode::Daemon);
		self.system_tasks
			.push(crate::system_tasks::daemon::spawn_signal_watcher(
				daemon,
				self.quit.clone(),
			));

		self.system_tasks.push(tokio::spawn(listen::supervise(
			self.api.clone(),
			self.runners.clone(),
			Duration::from_secs_f64(self.config.status_interval),
			self.quit.clone(),
		)));

		self.system_tasks
			.push(crate::system_tasks::message_log::spawn_message_log_pump(
				self.api.clone(),
				Duration::from_secs_f64(self.config.message_log_interval),
				self.quit.clone(),
			));

		info!("System startup complete");
		Ok(())
	}

	#[tracing::instrument(name = "System RunLoop", skip(self))]
	pub async fn run_loop(&mut self) -> anyhow::Result<()> {
		while let Some(task) = self.system_tasks.pop() {
			match task.await {
				Ok(Ok(())) => (),
				Ok(Err(e)) => {
					error!("System Task returned an error result: {}", e);
				}
				Err(e) => {
					error!("System Task Join Error: {}", e);
				}
			}
		}
		Ok(())
	}
}
