//! Structured task scoping on top of tokio.
//!
//! A scope owns every task spawned inside it. The scope's future resolves
//! once the scoped closure and all strongly spawned tasks have finished. The
//! first task to fail cancels the whole scope and its error is returned.
//! Weakly spawned tasks are aborted when the scope ends; their errors are
//! still fatal to the scope, but the scope never waits for them to finish.
//!
//! Panics in scoped tasks are resumed on the scope's caller, so a panicking
//! background task takes the process down instead of dying silently.

use std::{future::Future, panic::resume_unwind, pin::pin};

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use tokio::{
	sync::mpsc,
	task::{AbortHandle, JoinHandle},
};

enum ScopedTask<Error> {
	Strong(JoinHandle<Result<(), Error>>),
	Weak(JoinHandle<Result<(), Error>>),
}

pub struct Scope<Error> {
	task_sender: mpsc::UnboundedSender<ScopedTask<Error>>,
}

impl<Error: Send + 'static> Scope<Error> {
	/// Spawn a task the scope will wait for. If it returns an error, the
	/// scope is cancelled and the error propagates out of [`task_scope`].
	pub fn spawn<F>(&self, future: F)
	where
		F: Future<Output = Result<(), Error>> + Send + 'static,
	{
		let handle = tokio::spawn(future);
		let abort_handle = handle.abort_handle();
		if self.task_sender.send(ScopedTask::Strong(handle)).is_err() {
			abort_handle.abort();
		}
	}

	/// Spawn a task that is aborted once the scope ends. Use for servers and
	/// sweepers that have no natural completion of their own.
	pub fn spawn_weak<F>(&self, future: F)
	where
		F: Future<Output = Result<(), Error>> + Send + 'static,
	{
		let handle = tokio::spawn(future);
		let abort_handle = handle.abort_handle();
		if self.task_sender.send(ScopedTask::Weak(handle)).is_err() {
			abort_handle.abort();
		}
	}
}

/// Run `scope_fn` inside a new task scope.
pub async fn task_scope<T, Error, C>(scope_fn: C) -> Result<T, Error>
where
	Error: Send + 'static,
	C: for<'a> FnOnce(&'a Scope<Error>) -> BoxFuture<'a, Result<T, Error>>,
{
	let (task_sender, mut task_receiver) = mpsc::unbounded_channel();
	let scope = Scope { task_sender };

	let mut strong_tasks: FuturesUnordered<JoinHandle<Result<(), Error>>> =
		FuturesUnordered::new();
	let mut weak_tasks: FuturesUnordered<JoinHandle<Result<(), Error>>> =
		FuturesUnordered::new();
	let mut abort_handles: Vec<AbortHandle> = Vec::new();

	let mut main_future = pin!(scope_fn(&scope));
	let mut main_result: Option<Result<T, Error>> = None;
	let error = loop {
		if main_result.is_some() && strong_tasks.is_empty() && task_receiver.is_empty() {
			break None;
		}
		tokio::select! {
			result = &mut main_future, if main_result.is_none() => {
				match result {
					Ok(t) => main_result = Some(Ok(t)),
					Err(error) => break Some(error),
				}
			},
			Some(task) = task_receiver.recv() => {
				let (handle, tasks) = match task {
					ScopedTask::Strong(handle) => (handle, &mut strong_tasks),
					ScopedTask::Weak(handle) => (handle, &mut weak_tasks),
				};
				abort_handles.push(handle.abort_handle());
				tasks.push(handle);
			},
			Some(joined) = strong_tasks.next(), if !strong_tasks.is_empty() => {
				match flatten_join(joined, &abort_handles) {
					Ok(()) => {},
					Err(error) => break Some(error),
				}
			},
			Some(joined) = weak_tasks.next(), if !weak_tasks.is_empty() => {
				match flatten_join(joined, &abort_handles) {
					Ok(()) => {},
					Err(error) => break Some(error),
				}
			},
		}
	};

	for abort_handle in &abort_handles {
		abort_handle.abort();
	}

	match error {
		Some(error) => Err(error),
		None => main_result.expect("loop only exits cleanly after the main future resolved"),
	}
}

fn flatten_join<Error>(
	joined: Result<Result<(), Error>, tokio::task::JoinError>,
	abort_handles: &[AbortHandle],
) -> Result<(), Error> {
	match joined {
		Ok(result) => result,
		Err(join_error) => {
			if join_error.is_panic() {
				for abort_handle in abort_handles {
					abort_handle.abort();
				}
				resume_unwind(join_error.into_panic());
			}
			// Cancelled tasks have nothing to report.
			Ok(())
		},
	}
}
