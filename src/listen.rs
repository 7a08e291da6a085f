//! The listener factory: turn a logger config spec into a runnable
//! dataflow, plus the runner/supervisor machinery that keeps each
//! logger's pipeline matched to its currently-selected config and feeds
//! observed run-state back into the control API.

use crate::control::{ControlApi, LoggerStatus, StatusMap};
use crate::dataflow::{build_processor, DataflowRunner, Node, NodeConfig, QueuePolicy};
use crate::system::QuitOnError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::*;

/// Build a pipeline from a config spec. Accepts either an explicit
/// `nodes` DAG or the `readers`/`transforms`/`writers` shorthand, where
/// readers feed a linear transform chain that fans out to every writer.
pub fn build_pipeline(spec: &serde_json::Value) -> anyhow::Result<DataflowRunner> {
	if let Some(nodes) = spec.get("nodes") {
		return DataflowRunner::from_config(nodes);
	}

	let readers = component_list(spec.get("readers"));
	let transforms = component_list(spec.get("transforms"));
	let writers = component_list(spec.get("writers"));

	let mut nodes: Vec<Node> = Vec::new();
	let mut reader_names: Vec<String> = Vec::new();
	for (i, reader_spec) in readers.iter().enumerate() {
		let name = format!("reader_{}", i);
		nodes.push(instantiate(&name, reader_spec, vec![])?);
		reader_names.push(name);
	}

	let mut upstream = reader_names;
	for (i, transform_spec) in transforms.iter().enumerate() {
		let name = format!("transform_{}", i);
		nodes.push(instantiate(&name, transform_spec, upstream.clone())?);
		upstream = vec![name];
	}

	for (i, writer_spec) in writers.iter().enumerate() {
		let name = format!("writer_{}", i);
		nodes.push(instantiate(&name, writer_spec, upstream.clone())?);
	}

	DataflowRunner::new(nodes)
}

fn instantiate(
	name: &str,
	spec: &serde_json::Value,
	subscription_list: Vec<String>,
) -> anyhow::Result<Node> {
	let class = spec
		.get("class")
		.and_then(|v| v.as_str())
		.ok_or_else(|| anyhow::anyhow!("component spec is missing a \"class\" name: {}", spec))?;
	let queue: Option<QueuePolicy> = match spec.get("queue") {
		Some(value) => Some(serde_json::from_value(value.clone())?),
		None => None,
	};
	// NodeConfig is the same shape; reuse its processor construction.
	let node_config = NodeConfig {
		class: class.to_owned(),
		kwargs: spec.get("kwargs").cloned().unwrap_or_default(),
		subscription_list,
		queue,
	};
	let spec = serde_json::json!({
		"class": node_config.class,
		"kwargs": node_config.kwargs,
	});
	let processor = build_processor(&node_config.class, &spec)?;
	Ok(Node::new(
		name,
		processor,
		node_config.subscription_list,
		node_config.queue.unwrap_or_default(),
	))
}

fn component_list(value: Option<&serde_json::Value>) -> Vec<serde_json::Value> {
	match value {
		None => vec![],
		Some(serde_json::Value::Array(items)) => items.clone(),
		Some(single) => vec![single.clone()],
	}
}

/// Does this spec describe a runnable pipeline at all? "off" configs are
/// typically empty.
pub fn is_runnable(spec: &serde_json::Value) -> bool {
	spec.get("nodes").is_some() || spec.get("readers").is_some()
}

////////////////////////////////////////////////////////////////////////////

struct RunnerState {
	running: AtomicBool,
	failed: AtomicBool,
	errors: Mutex<Vec<String>>,
}

/// One logger's pipeline, running as a task, reporting observed state.
pub struct LoggerRunner {
	pub logger_name: String,
	pub config_name: Option<String>,
	quit: broadcast::Sender<()>,
	state: Arc<RunnerState>,
}

impl LoggerRunner {
	pub fn launch(logger_name: &str, spec: &serde_json::Value) -> anyhow::Result<LoggerRunner> {
		let config_name = spec
			.get("name")
			.and_then(|v| v.as_str())
			.map(String::from);
		let runner = build_pipeline(spec)?;
		let (quit, _keep) = broadcast::channel(1);
		let state = Arc::new(RunnerState {
			running: AtomicBool::new(true),
			failed: AtomicBool::new(false),
			errors: Mutex::new(Vec::new()),
		});

		info!("Launching logger {:?} with config {:?}", logger_name, config_name);
		// Nodes subscribe to quit inside start(), so a stop() issued any
		// time after this call is guaranteed to reach them.
		let handles = runner.start(&quit);
		let task_state = state.clone();
		let task_name = logger_name.to_owned();
		tokio::spawn(async move {
			for handle in handles {
				match handle.await {
					Ok(Ok(())) => {}
					Ok(Err(e)) => {
						error!("Logger {:?} pipeline failed: {}", task_name, e);
						task_state.failed.store(true, Ordering::SeqCst);
						task_state.errors.lock().push(e.to_string());
					}
					Err(e) => {
						error!("Logger {:?} pipeline join error: {}", task_name, e);
						task_state.failed.store(true, Ordering::SeqCst);
						task_state.errors.lock().push(e.to_string());
					}
				}
			}
			task_state.running.store(false, Ordering::SeqCst);
		});

		Ok(LoggerRunner {
			logger_name: logger_name.to_owned(),
			config_name,
			quit,
			state,
		})
	}

	pub fn stop(&self) {
		info!("Stopping logger {:?}", self.logger_name);
		let _ = self.quit.send(());
	}

	pub fn is_running(&self) -> bool {
		self.state.running.load(Ordering::SeqCst)
	}

	/// Current observed state, in the shape `update_status` ingests.
	pub fn status(&self) -> LoggerStatus {
		LoggerStatus {
			config: self.config_name.clone(),
			errors: self.state.errors.lock().clone(),
			pid: Some(std::process::id() as i64),
			failed: Some(self.state.failed.load(Ordering::SeqCst)),
			running: Some(self.is_running()),
		}
	}
}

pub type RunnerRegistry = DashMap<String, LoggerRunner>;

/// Reconcile the set of running pipelines with the active configs: stop
/// runners whose config went away or changed, launch runners for configs
/// that have none, and report everyone's state.
pub fn reconcile_runners(api: &ControlApi, runners: &RunnerRegistry) -> StatusMap {
	let desired = api.get_logger_configs(None);

	// Stop anything no longer wanted or pointed at a different config.
	let stale: Vec<String> = runners
		.iter()
		.filter(|entry| {
			let wanted = desired
				.get(entry.key())
				.and_then(|spec| spec.get("name"))
				.and_then(|v| v.as_str());
			wanted != entry.value().config_name.as_deref()
		})
		.map(|entry| entry.key().clone())
		.collect();
	for logger_name in stale {
		if let Some((_, runner)) = runners.remove(&logger_name) {
			runner.stop();
		}
	}

	// Launch what's missing.
	for (logger_name, spec) in &desired {
		if runners.contains_key(logger_name) || !is_runnable(spec) {
			continue;
		}
		match LoggerRunner::launch(logger_name, spec) {
			Ok(runner) => {
				runners.insert(logger_name.clone(), runner);
			}
			Err(e) => {
				error!("Unable to launch logger {:?}: {}", logger_name, e);
				api.message_log(
					"supervisor",
					"",
					40,
					&format!("unable to launch logger {:?}: {}", logger_name, e),
				);
			}
		}
	}

	// Report on every desired logger, running or not.
	let mut status = StatusMap::new();
	for (logger_name, spec) in &desired {
		match runners.get(logger_name) {
			Some(runner) => {
				status.insert(logger_name.clone(), runner.status());
			}
			None => {
				status.insert(
					logger_name.clone(),
					LoggerStatus {
						config: spec.get("name").and_then(|v| v.as_str()).map(String::from),
						errors: vec![],
						pid: None,
						failed: Some(false),
						running: Some(false),
					},
				);
			}
		}
	}
	status
}

/// The orchestrator loop: poll the control API for the active config of
/// every logger, keep pipelines matched to it, and feed status reports
/// back through `update_status`. Wakes early on the update signal.
pub async fn supervise(
	api: Arc<ControlApi>,
	runners: Arc<RunnerRegistry>,
	poll_interval: Duration,
	quit: broadcast::Sender<()>,
) -> anyhow::Result<()> {
	let mut on_quit = quit.subscribe();
	let mut on_update = api.on_update();
	info!("Logger supervisor started");
	loop {
		let status = reconcile_runners(&api, &runners);
		api.update_status(&status).quit_on_err(&quit)?;

		tokio::select! {
			_ = on_quit.recv() => break,
			_ = on_update.recv() => {
				debug!("Supervisor woken by update signal");
			}
			_ = tokio::time::sleep(poll_interval) => {}
		}
	}

	info!("Logger supervisor stopping all runners");
	let names: Vec<String> = runners.iter().map(|entry| entry.key().clone()).collect();
	for name in names {
		if let Some((_, runner)) = runners.remove(&name) {
			runner.stop();
		}
	}
	Ok(())
}
