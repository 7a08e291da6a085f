use crate::control::ControlApi;
use crate::logging::message_cache_appender::Cache;
use crate::logging::CONTROL_MESSAGE_CACHE;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::*;

/// Periodically drain the cached console output into the control
/// store's message log, so `get_message_log` also covers what the
/// servers printed.
pub fn spawn_message_log_pump(
	api: Arc<ControlApi>,
	interval: Duration,
	quit: broadcast::Sender<()>,
) -> JoinHandle<anyhow::Result<()>> {
	let mut on_quit = quit.subscribe();
	tokio::task::spawn(async move {
		info!("Message log pump has launched");
		loop {
			for record in Cache::drain(CONTROL_MESSAGE_CACHE) {
				api.message_log(
					&record.target,
					"",
					record.numeric_level(),
					&record.message,
				);
			}
			tokio::select! {
				_ = on_quit.recv() => break,
				_ = tokio::time::sleep(interval) => {}
			}
		}
		// One final sweep so shutdown messages are not lost.
		for record in Cache::drain(CONTROL_MESSAGE_CACHE) {
			api.message_log(&record.target, "", record.numeric_level(), &record.message);
		}
		Ok(())
	})
}
