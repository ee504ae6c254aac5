//! Supervision of the embedded Kubernetes control-plane child process.
//!
//! The child is spawned with `kill_on_drop`, so no exit path of the master
//! leaks it. An unexpected child exit fails the supervisor task, which
//! takes the whole master down; the host is expected to relaunch us.

use std::{
	future::Future,
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, OnceLock,
	},
	time::Duration,
};

use anyhow::{bail, Context, Result};
use tokio::{process::Command, sync::watch};
use tracing::{info, warn};

use crate::constants::{GRACEFUL_SHUTDOWN_TIMEOUT, READINESS_POLL_INTERVAL};

/// The control plane has not produced its join credential yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("control plane is not ready")]
pub struct NotReady;

/// What the rest of the master needs from the supervisor. The gateway and
/// the event bridge depend on this trait, not on the concrete handle, so
/// tests can stub readiness and credentials.
pub trait ControlPlaneApi: Send + Sync {
	fn is_ready(&self) -> bool;
	fn join_credential(&self) -> Result<String, NotReady>;
}

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
	pub binary: PathBuf,
	pub data_dir: PathBuf,
	pub node_name: String,
	pub https_port: u16,
	pub readiness_timeout: Duration,
}

pub struct ControlPlaneHandle {
	config: ControlPlaneConfig,
	ready: AtomicBool,
	stopping: AtomicBool,
	stop_sender: watch::Sender<bool>,
	join_credential: OnceLock<String>,
}

/// Spawn the control-plane child. Returns the shared handle and the
/// supervising future to run on the task scope.
pub fn start(
	config: ControlPlaneConfig,
) -> Result<(Arc<ControlPlaneHandle>, impl Future<Output = Result<()>> + Send)> {
	let mut child = Command::new(&config.binary)
		.arg("server")
		.arg("--data-dir")
		.arg(&config.data_dir)
		.arg("--bind-address")
		.arg("0.0.0.0")
		.arg("--https-listen-port")
		.arg(config.https_port.to_string())
		.arg("--write-kubeconfig")
		.arg(config.data_dir.join("kubeconfig.yaml"))
		.arg("--node-name")
		.arg(&config.node_name)
		.kill_on_drop(true)
		.spawn()
		.with_context(|| {
			format!("Failed to spawn control plane binary {}", config.binary.display())
		})?;

	let (stop_sender, mut stop_receiver) = watch::channel(false);
	let handle = Arc::new(ControlPlaneHandle {
		config,
		ready: AtomicBool::new(false),
		stopping: AtomicBool::new(false),
		stop_sender,
		join_credential: OnceLock::new(),
	});

	let supervisor_handle = handle.clone();
	let task = async move {
		tokio::select! {
			status = child.wait() => {
				supervisor_handle.ready.store(false, Ordering::SeqCst);
				let status = status.context("Failed to wait on control plane child")?;
				if supervisor_handle.stopping.load(Ordering::SeqCst) {
					Ok(())
				} else {
					bail!("Control plane exited unexpectedly with {status}")
				}
			},
			result = async {
				while !*stop_receiver.borrow() {
					stop_receiver.changed().await?;
				}
				Ok::<(), watch::error::RecvError>(())
			} => {
				result.context("stop channel closed")?;
				supervisor_handle.ready.store(false, Ordering::SeqCst);
				terminate(&mut child).await;
				Ok(())
			},
		}
	};

	Ok((handle, task))
}

/// SIGTERM first, SIGKILL when the grace period runs out.
async fn terminate(child: &mut tokio::process::Child) {
	if let Some(pid) = child.id() {
		// SAFETY: sending a signal to our own child process.
		unsafe {
			libc::kill(pid as i32, libc::SIGTERM);
		}
		match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, child.wait()).await {
			Ok(_) => return,
			Err(_) => warn!("Control plane ignored SIGTERM, killing"),
		}
	}
	let _ = child.kill().await;
	let _ = child.wait().await;
}

impl ControlPlaneHandle {
	/// Poll the child's readiness endpoint until it answers or the startup
	/// budget is exhausted. Exit code 3 territory on failure.
	#[tracing::instrument(name = "control-plane-readiness", skip_all)]
	pub async fn wait_ready(&self) -> Result<()> {
		let url =
			format!("https://127.0.0.1:{}/readyz", self.config.https_port);
		// The embedded control plane serves a self-signed certificate on
		// loopback inside the enclave.
		let client = reqwest::Client::builder()
			.danger_accept_invalid_certs(true)
			.timeout(READINESS_POLL_INTERVAL)
			.build()
			.context("Failed to build readiness probe client")?;

		let deadline = tokio::time::Instant::now() + self.config.readiness_timeout;
		loop {
			match client.get(&url).send().await {
				Ok(response) if response.status().is_success() => {
					self.ready.store(true, Ordering::SeqCst);
					info!("Control plane is ready");
					return Ok(());
				},
				Ok(response) => {
					tracing::debug!(status = %response.status(), "Control plane not ready yet")
				},
				Err(error) => tracing::debug!("Readiness probe failed: {error}"),
			}
			if tokio::time::Instant::now() + READINESS_POLL_INTERVAL > deadline {
				bail!(
					"Control plane did not become ready within {:?}",
					self.config.readiness_timeout
				);
			}
			tokio::time::sleep(READINESS_POLL_INTERVAL).await;
		}
	}

	/// Graceful-then-forceful shutdown of the child.
	pub fn stop(&self) {
		self.stopping.store(true, Ordering::SeqCst);
		let _ = self.stop_sender.send(true);
	}

	#[cfg(test)]
	pub fn set_ready_for_test(&self, ready: bool) {
		self.ready.store(ready, Ordering::SeqCst);
	}
}

impl ControlPlaneApi for ControlPlaneHandle {
	fn is_ready(&self) -> bool {
		self.ready.load(Ordering::SeqCst)
	}

	/// The join credential the child writes next to its data dir. Cached
	/// after the first successful read; the file never changes within one
	/// child lifetime.
	fn join_credential(&self) -> Result<String, NotReady> {
		if !self.is_ready() {
			return Err(NotReady);
		}
		if let Some(credential) = self.join_credential.get() {
			return Ok(credential.clone());
		}
		let token_path = self.config.data_dir.join("server").join("node-token");
		match std::fs::read_to_string(&token_path) {
			Ok(contents) => {
				let credential = contents.trim().to_string();
				let _ = self.join_credential.set(credential.clone());
				Ok(credential)
			},
			Err(error) => {
				warn!(path = %token_path.display(), "Join credential not readable yet: {error}");
				Err(NotReady)
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{io::Write, os::unix::fs::PermissionsExt};

	// A stand-in control plane that ignores its arguments and sleeps.
	fn fake_binary(dir: &std::path::Path, script: &str) -> PathBuf {
		let path = dir.join("fake-control-plane");
		let mut file = std::fs::File::create(&path).unwrap();
		writeln!(file, "#!/bin/sh\n{script}").unwrap();
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	fn config(dir: &tempfile::TempDir, script: &str) -> ControlPlaneConfig {
		ControlPlaneConfig {
			binary: fake_binary(dir.path(), script),
			data_dir: dir.path().to_path_buf(),
			node_name: "master-0".to_string(),
			https_port: 16443,
			readiness_timeout: Duration::from_secs(1),
		}
	}

	#[tokio::test]
	async fn stop_terminates_the_child_cleanly() {
		let dir = tempfile::tempdir().unwrap();
		let (handle, task) = start(config(&dir, "sleep 60")).unwrap();
		let supervisor = tokio::spawn(task);

		handle.stop();
		tokio::time::timeout(Duration::from_secs(5), supervisor)
			.await
			.expect("supervisor should finish after stop")
			.unwrap()
			.unwrap();
	}

	#[tokio::test]
	async fn unexpected_child_exit_fails_the_supervisor() {
		let dir = tempfile::tempdir().unwrap();
		let (_handle, task) = start(config(&dir, "exit 0")).unwrap();
		let result = tokio::time::timeout(Duration::from_secs(5), task)
			.await
			.expect("child exits immediately");
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn join_credential_flows_from_the_node_token_file() {
		let dir = tempfile::tempdir().unwrap();
		let (handle, task) = start(config(&dir, "sleep 60")).unwrap();
		let _supervisor = tokio::spawn(task);

		assert_eq!(handle.join_credential(), Err(NotReady));

		handle.set_ready_for_test(true);
		// Ready but no token file written yet.
		assert_eq!(handle.join_credential(), Err(NotReady));

		let server_dir = dir.path().join("server");
		std::fs::create_dir_all(&server_dir).unwrap();
		std::fs::write(server_dir.join("node-token"), "K10abc::server:token\n").unwrap();
		assert_eq!(handle.join_credential().unwrap(), "K10abc::server:token");

		handle.stop();
	}
}
