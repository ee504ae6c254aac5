//! Supervision of the embedded Kubernetes node-agent child process.

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use tokio::{
	process::{Child, Command},
	sync::mpsc,
};
use tracing::{info, warn};

/// Restart budget before the supervisor gives up on the child.
const MAX_RESTARTS: u32 = 3;

const RESTART_BACKOFF: Duration = Duration::from_secs(5);

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Instructions from the heartbeat loop.
#[derive(Debug, PartialEq, Eq)]
pub enum SupervisorCommand {
	/// Kill and respawn the child (degraded heartbeats).
	Restart,
	/// Stop the child and return; the agent is terminating.
	Shutdown,
}

pub struct NodeAgentSupervisor {
	binary: PathBuf,
	server_url: String,
	node_name: String,
}

impl NodeAgentSupervisor {
	pub fn new(binary: PathBuf, server_url: String, node_name: String) -> Self {
		Self { binary, server_url, node_name }
	}

	fn spawn_child(&self, join_credential: &str) -> Result<Child> {
		Command::new(&self.binary)
			.arg("--server")
			.arg(&self.server_url)
			.arg("--token")
			.arg(join_credential)
			.arg("--node-name")
			.arg(&self.node_name)
			.kill_on_drop(true)
			.spawn()
			.with_context(|| {
				format!("Failed to spawn node agent binary {}", self.binary.display())
			})
	}

	/// Run the child until a shutdown command arrives, restarting on
	/// unexpected exits (and on explicit restart commands) up to the
	/// restart budget.
	#[tracing::instrument(name = "node-agent", skip_all)]
	pub async fn run(
		self,
		join_credential: String,
		mut command_receiver: mpsc::Receiver<SupervisorCommand>,
	) -> Result<()> {
		let mut restarts: u32 = 0;
		let mut child = self.spawn_child(&join_credential)?;
		info!(node_name = %self.node_name, "Node agent started");

		loop {
			tokio::select! {
				status = child.wait() => {
					let status = status.context("Failed to wait on node agent child")?;
					if restarts >= MAX_RESTARTS {
						bail!("Node agent exited with {status} and the restart budget is spent");
					}
					restarts += 1;
					warn!(%status, restarts, "Node agent exited, restarting");
					tokio::time::sleep(RESTART_BACKOFF).await;
					child = self.spawn_child(&join_credential)?;
				},
				command = command_receiver.recv() => match command {
					Some(SupervisorCommand::Restart) => {
						if restarts >= MAX_RESTARTS {
							bail!("Node agent restart requested but the budget is spent");
						}
						restarts += 1;
						warn!(restarts, "Restarting node agent on request");
						terminate(&mut child).await;
						tokio::time::sleep(RESTART_BACKOFF).await;
						child = self.spawn_child(&join_credential)?;
					},
					// Channel closed counts as shutdown: the agent is gone.
					Some(SupervisorCommand::Shutdown) | None => {
						info!("Stopping node agent");
						terminate(&mut child).await;
						return Ok(());
					},
				},
			}
		}
	}
}

async fn terminate(child: &mut Child) {
	if let Some(pid) = child.id() {
		// SAFETY: signalling our own child process.
		unsafe {
			libc::kill(pid as i32, libc::SIGTERM);
		}
		if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_ok() {
			return;
		}
		warn!("Node agent ignored SIGTERM, killing");
	}
	let _ = child.kill().await;
	let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::os::unix::fs::PermissionsExt;

	fn fake_binary(dir: &std::path::Path, script: &str) -> PathBuf {
		let path = dir.join("fake-node-agent");
		std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	fn supervisor(dir: &tempfile::TempDir, script: &str) -> NodeAgentSupervisor {
		NodeAgentSupervisor::new(
			fake_binary(dir.path(), script),
			"https://master:8443".to_string(),
			"w1".to_string(),
		)
	}

	#[tokio::test]
	async fn shutdown_stops_the_child() {
		utilities::testing::init_test_logger();
		let dir = tempfile::tempdir().unwrap();
		let (sender, receiver) = mpsc::channel(1);
		let task =
			tokio::spawn(supervisor(&dir, "sleep 60").run("K10abc".to_string(), receiver));

		tokio::time::sleep(Duration::from_millis(100)).await;
		sender.send(SupervisorCommand::Shutdown).await.unwrap();
		tokio::time::timeout(Duration::from_secs(5), task)
			.await
			.expect("supervisor should stop promptly")
			.unwrap()
			.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn crash_looping_child_exhausts_the_restart_budget() {
		let dir = tempfile::tempdir().unwrap();
		let (_sender, receiver) = mpsc::channel(1);
		// Exits immediately every time; 1 start + 3 restarts then give up.
		let result = supervisor(&dir, "exit 1").run("K10abc".to_string(), receiver).await;
		assert!(result.unwrap_err().to_string().contains("restart budget"));
	}

	#[tokio::test]
	async fn dropped_command_channel_counts_as_shutdown() {
		let dir = tempfile::tempdir().unwrap();
		let (sender, receiver) = mpsc::channel(1);
		let task =
			tokio::spawn(supervisor(&dir, "sleep 60").run("K10abc".to_string(), receiver));
		tokio::time::sleep(Duration::from_millis(100)).await;
		drop(sender);
		tokio::time::timeout(Duration::from_secs(5), task)
			.await
			.expect("supervisor should stop when the agent goes away")
			.unwrap()
			.unwrap();
	}
}
