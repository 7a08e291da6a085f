use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::*;

/// Watch process signals and broadcast quit on any terminating one. In
/// daemon mode a hangup is ignored instead of ending the process.
pub fn spawn_signal_watcher(
	daemon: bool,
	do_quit: broadcast::Sender<()>,
) -> JoinHandle<anyhow::Result<()>> {
	let mut on_quit = do_quit.subscribe();
	tokio::task::spawn(async move {
		info!("Signal watcher task has launched");
		loop {
			#[cfg(target_os = "linux")]
			let do_break = {
				let mut hangup =
					tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
						.expect("failed registering hangup signal stream");
				let mut interrupt =
					tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
						.expect("failed registering interrupt signal stream");
				let mut quit =
					tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())
						.expect("failed registering quit signal stream");
				let mut terminate =
					tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
						.expect("failed registering terminate signal stream");
				tokio::select! {
					_ = hangup.recv() => {
						if daemon {
							info!("Hangup requested, daemon mode ignores it");
							false
						} else {
							info!("Hangup received, cleanly exiting...");
							let _ = do_quit.send(());
							true
						}
					}
					_ = interrupt.recv() => {
						info!("Interrupt signal received, cleanly exiting...");
						let _ = do_quit.send(());
						true
					}
					_ = quit.recv() => {
						info!("Quit signal received, cleanly exiting...");
						let _ = do_quit.send(());
						true
					}
					_ = terminate.recv() => {
						info!("Terminate signal received, cleanly exiting...");
						let _ = do_quit.send(());
						true
					}
					_ = on_quit.recv() => {
						info!("Signal watcher received a quit request, exiting");
						true
					}
				}
			};

			#[cfg(not(target_os = "linux"))]
			let do_break = tokio::select! {
				_ = tokio::signal::ctrl_c() => {
					info!("Ctrl+C signal received, cleanly exiting...");
					let _ = do_quit.send(());
					true
				}
				_ = on_quit.recv() => {
					info!("Signal watcher received a quit request, exiting");
					true
				}
			};

			if do_break {
				break;
			}
		}
		Ok(())
	})
}
