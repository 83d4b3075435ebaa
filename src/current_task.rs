//! Introspection and suspension primitives for code running inside a task.
//!
//! Collaborators performing long operations on behalf of a task are expected
//! to hit [`cancellation_point`] (or any other suspension point) periodically
//! and abort early once a cancellation reason is set, to keep the
//! cooperative model's latency guarantees meaningful.

use std::{
	future::Future,
	pin::Pin,
	sync::{Arc, Weak},
	task::{Context, Poll},
	time::Duration,
};

use pin_project_lite::pin_project;

use super::{
	cancel::{CancellationReason, CancellationToken},
	context::{TaskContext, TaskId},
	deadline::Deadline,
	error::WaitInterrupted,
	processor::{Dispatcher, ProcessorInner},
};

tokio::task_local! {
	static CURRENT: CurrentTask;
}

/// Execution context threaded through every payload poll.
#[derive(Clone)]
pub(crate) struct CurrentTask {
	pub(crate) ctx: Arc<TaskContext>,
	pub(crate) processor: Weak<ProcessorInner>,
	pub(crate) stack_size: usize,
}

/// Installs `current` as the ambient task for every poll of `f`.
pub(crate) fn scope<F: Future>(current: CurrentTask, f: F) -> impl Future<Output = F::Output> {
	CURRENT.scope(current, f)
}

pub(crate) fn try_current_context() -> Option<Arc<TaskContext>> {
	CURRENT.try_with(|current| Arc::clone(&current.ctx)).ok()
}

fn expect_current<R>(f: impl FnOnce(&CurrentTask) -> R) -> R {
	CURRENT
		.try_with(f)
		.expect("current_task accessor called outside of a task processor task")
}

/// True only when the caller runs inside a task managed by a
/// [`Processor`](crate::Processor).
#[must_use]
pub fn is_engine_task() -> bool {
	CURRENT.try_with(|_| ()).is_ok()
}

/// The id of the task executing the caller.
///
/// # Panics
///
/// Panics outside of an engine task; check [`is_engine_task`] first.
#[must_use]
pub fn task_id() -> TaskId {
	expect_current(|current| current.ctx.id())
}

/// The submission surface of the processor executing the caller.
///
/// # Panics
///
/// Panics outside of an engine task or when the processor was dropped.
#[must_use]
pub fn dispatcher() -> Dispatcher {
	expect_current(|current| current.processor.upgrade())
		.map(Dispatcher::from_inner)
		.expect("the task processor of the current task was dropped")
}

/// The advisory per-task stack budget configured on the processor, for
/// collaborators deciding whether to offload stack-hungry or blocking work.
///
/// # Panics
///
/// Panics outside of an engine task; check [`is_engine_task`] first.
#[must_use]
pub fn stack_size() -> usize {
	expect_current(|current| current.stack_size)
}

/// Whether a cancellation reason is set on the current task. False outside
/// of an engine task.
#[must_use]
pub fn is_cancellation_requested() -> bool {
	CURRENT
		.try_with(|current| current.ctx.is_cancellation_requested())
		.unwrap_or(false)
}

/// The cancellation reason of the current task, if any. `None` outside of an
/// engine task.
#[must_use]
pub fn cancellation_reason() -> Option<CancellationReason> {
	CURRENT
		.try_with(|current| current.ctx.cancellation_reason())
		.ok()
		.flatten()
}

/// A [`CancellationToken`] for the current task, e.g. to hand to a
/// collaborator that should be able to observe this task's cancellation.
///
/// # Panics
///
/// Panics outside of an engine task; check [`is_engine_task`] first.
#[must_use]
pub fn cancellation_token() -> CancellationToken {
	CancellationToken::new(expect_current(|current| Arc::clone(&current.ctx)))
}

/// Explicit cancellation check: fails fast when the current task has a
/// pending cancellation and no [`CancellationBlocker`](crate::CancellationBlocker)
/// is active. Always succeeds outside of an engine task.
pub fn cancellation_point() -> Result<(), WaitInterrupted> {
	match CURRENT.try_with(|current| current.ctx.cancellation_pending()) {
		Ok(true) => Err(WaitInterrupted),
		_ => Ok(()),
	}
}

pin_project! {
	#[must_use = "futures do nothing unless polled"]
	struct YieldNow {
		yielded: bool,
	}
}

impl Future for YieldNow {
	type Output = ();

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();

		if *this.yielded {
			Poll::Ready(())
		} else {
			*this.yielded = true;
			cx.waker().wake_by_ref();
			Poll::Pending
		}
	}
}

/// An explicit suspension point: returns control to the worker and requeues
/// the task immediately, letting other ready work run.
pub async fn yield_now() {
	YieldNow { yielded: false }.await;
}

/// Suspends the current task until `deadline`.
///
/// An unreachable deadline sleeps until the task is cancelled. Fails fast
/// with [`WaitInterrupted`] when entered with an unblocked pending
/// cancellation; a cancellation arriving mid-sleep terminates the task at
/// the resumption point instead, unless a blocker scope is active.
pub async fn sleep_until(deadline: Deadline) -> Result<(), WaitInterrupted> {
	cancellation_point()?;

	match deadline.instant() {
		Some(instant) => tokio::time::sleep_until(instant).await,
		None => futures::future::pending::<()>().await,
	}

	Ok(())
}

/// [`sleep_until`] with a deadline the given duration from now.
pub async fn sleep_for(duration: Duration) -> Result<(), WaitInterrupted> {
	sleep_until(Deadline::after(duration)).await
}
