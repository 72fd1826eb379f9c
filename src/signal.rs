use tokio::sync::mpsc;
use tracing::info;

/// Process shutdown coordination. `wait` completes on SIGINT/SIGTERM or on an
/// explicit trigger; a second SIGINT exits immediately.
pub struct Shutdown {
	tx: mpsc::Sender<()>,
	rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Shutdown { tx, rx }
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			tx: self.tx.clone(),
		}
	}

	pub async fn wait(mut self) {
		tokio::select! {
			_ = interrupt() => {
				tokio::spawn(async move {
					interrupt().await;
					info!("second interrupt, exiting immediately");
					std::process::exit(0);
				});
			}
			_ = terminate() => {}
			_ = self.rx.recv() => {
				info!("received explicit shutdown request");
			}
		}
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(()).await;
	}
}

#[cfg(unix)]
async fn interrupt() {
	use tokio::signal::unix::{SignalKind, signal};
	signal(SignalKind::interrupt())
		.expect("failed to register SIGINT handler")
		.recv()
		.await;
	info!("received SIGINT, starting shutdown");
}

#[cfg(unix)]
async fn terminate() {
	use tokio::signal::unix::{SignalKind, signal};
	signal(SignalKind::terminate())
		.expect("failed to register SIGTERM handler")
		.recv()
		.await;
	info!("received SIGTERM, starting shutdown");
}

#[cfg(not(unix))]
async fn interrupt() {
	let _ = tokio::signal::ctrl_c().await;
	info!("received interrupt, starting shutdown");
}

#[cfg(not(unix))]
async fn terminate() {
	std::future::pending::<()>().await;
}
