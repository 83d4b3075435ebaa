use std::{fmt, marker::PhantomData, sync::Arc, time::Duration};

use tracing::{instrument, trace};

use super::{
	cancel::{CancellationBlocker, CancellationReason, CancellationToken},
	context::{TaskContext, TaskId, TaskState, TaskValue, WaitMode},
	current_task,
	deadline::Deadline,
	error::{TaskError, WaitInterrupted},
};

/// How a bounded wait on a task ended.
///
/// Timing out is not cancellation: the waiting caller simply resumes and the
/// target task is unaffected and keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
	/// The target reached a terminal state.
	Finished,
	/// The deadline elapsed first; the target has not finished yet.
	TimedOut,
}

const INVALID_HANDLE: &str = "operation on an invalid task handle";

/// Suspends until the context reaches a terminal state or the deadline
/// elapses.
///
/// When called from inside an engine task, fails fast with
/// [`WaitInterrupted`] if the caller already has an unblocked pending
/// cancellation; a cancellation arriving mid-wait terminates the caller at
/// its resumption point instead (cancellation wins over a bare wake). A
/// terminal transition racing the deadline at the same instant resolves as
/// `Finished`.
async fn wait_until_terminal(
	ctx: &Arc<TaskContext>,
	deadline: Deadline,
) -> Result<WaitOutcome, WaitInterrupted> {
	if let Some(caller) = current_task::try_current_context() {
		assert!(
			!Arc::ptr_eq(&caller, ctx),
			"a task must not wait on itself"
		);

		if caller.cancellation_pending() {
			return Err(WaitInterrupted);
		}
	}

	let mut finished = ctx.subscribe_finished();

	match deadline.instant() {
		None => {
			finished
				.wait_for(|done| *done)
				.await
				.expect("terminal signal dropped while its context is alive");

			Ok(WaitOutcome::Finished)
		}

		Some(expires_at) => tokio::select! {
			biased;

			res = finished.wait_for(|done| *done) => {
				res.expect("terminal signal dropped while its context is alive");

				Ok(WaitOutcome::Finished)
			}

			() = tokio::time::sleep_until(expires_at) => Ok(WaitOutcome::TimedOut),
		},
	}
}

/// `request_cancel` + wait until terminal, shielded from the caller's own
/// cancellation so the target is always terminal on return.
async fn sync_cancel_inner(ctx: &Arc<TaskContext>) {
	ctx.request_cancel(CancellationReason::UserRequest);

	// Self-cancel short-circuits: suspending here would deadlock on our own
	// terminal transition.
	if current_task::try_current_context()
		.is_some_and(|caller| Arc::ptr_eq(&caller, ctx))
	{
		trace!(task_id = %ctx.id(), "sync cancel of the current task short-circuited");
		return;
	}

	let _shield = CancellationBlocker::new();
	let mut finished = ctx.subscribe_finished();

	finished
		.wait_for(|done| *done)
		.await
		.expect("terminal signal dropped while its context is alive");
}

fn blocking_wait_inner(ctx: &Arc<TaskContext>) {
	assert!(
		!current_task::is_engine_task(),
		"blocking_wait called from inside a task processor task; use wait instead"
	);

	let mut finished = ctx.subscribe_finished();

	futures::executor::block_on(finished.wait_for(|done| *done))
		.expect("terminal signal dropped while its context is alive");
}

fn downcast_value<T: Send + 'static>(value: Box<dyn TaskValue>) -> T {
	*value
		.downcast::<T>()
		.unwrap_or_else(|_| panic!("task result slot holds a value of an unexpected type"))
}

/// The exclusive, move-only handle to one dispatched task.
///
/// Created by [`Dispatcher::dispatch`](crate::Dispatcher::dispatch); records
/// [`WaitMode::SingleWaiter`] on its context. Extracting the result with
/// [`get`](Self::get) or releasing the task with [`detach`](Self::detach)
/// invalidates the handle: an invalid handle answers only
/// [`is_valid`](Self::is_valid) and [`state`](Self::state) and panics on
/// everything else, so misuse fails loudly during development.
#[must_use]
pub struct TaskHandle<T> {
	ctx: Option<Arc<TaskContext>>,
	_output: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for TaskHandle<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TaskHandle")
			.field("ctx", &self.ctx)
			.finish()
	}
}

impl<T: Send + 'static> TaskHandle<T> {
	pub(crate) fn new(ctx: Arc<TaskContext>) -> Self {
		Self {
			ctx: Some(ctx),
			_output: PhantomData,
		}
	}

	fn ctx(&self) -> &Arc<TaskContext> {
		self.ctx.as_ref().expect(INVALID_HANDLE)
	}

	/// Whether this handle still references a context.
	#[must_use]
	pub fn is_valid(&self) -> bool {
		self.ctx.is_some()
	}

	/// Current lifecycle state; [`TaskState::Invalid`] for an invalidated
	/// handle. Never blocks, safe from any thread.
	#[must_use]
	pub fn state(&self) -> TaskState {
		self.ctx.as_ref().map_or(TaskState::Invalid, |ctx| ctx.state())
	}

	#[must_use]
	pub fn id(&self) -> TaskId {
		self.ctx().id()
	}

	/// Whether the task reached `Completed` or `Cancelled`. Sticky once
	/// true.
	#[must_use]
	pub fn is_finished(&self) -> bool {
		self.ctx().is_finished()
	}

	#[must_use]
	pub fn wait_mode(&self) -> WaitMode {
		self.ctx().wait_mode()
	}

	#[must_use]
	pub fn cancellation_reason(&self) -> Option<CancellationReason> {
		self.ctx().cancellation_reason()
	}

	#[must_use]
	pub fn cancellation_token(&self) -> CancellationToken {
		CancellationToken::new(Arc::clone(self.ctx()))
	}

	/// Suspends the caller until the task finishes.
	pub async fn wait(&self) -> Result<(), WaitInterrupted> {
		wait_until_terminal(self.ctx(), Deadline::unreachable())
			.await
			.map(|_| ())
	}

	/// As [`wait`](Self::wait), returning [`WaitOutcome::TimedOut`] once the
	/// duration elapses with the task still unfinished.
	pub async fn wait_for(&self, timeout: Duration) -> Result<WaitOutcome, WaitInterrupted> {
		self.wait_until(Deadline::after(timeout)).await
	}

	pub async fn wait_until(&self, deadline: Deadline) -> Result<WaitOutcome, WaitInterrupted> {
		wait_until_terminal(self.ctx(), deadline).await
	}

	/// Queues a cancellation request with reason `UserRequest` unless a more
	/// specific reason is already set. Idempotent, non-blocking, never
	/// preemptive.
	pub fn request_cancel(&self) {
		self.ctx().request_cancel(CancellationReason::UserRequest);
	}

	/// Cancels the task and suspends until it is terminal; shielded from the
	/// caller's own cancellation, so it never fails. Cancelling the current
	/// task from within itself short-circuits after the request.
	pub async fn sync_cancel(&self) {
		sync_cancel_inner(self.ctx()).await;
	}

	/// Waits for the task from a thread *not* managed by any processor,
	/// e.g. a process's main thread.
	///
	/// # Panics
	///
	/// Panics when called from inside an engine task, which would wedge the
	/// worker.
	pub fn blocking_wait(&self) {
		blocking_wait_inner(self.ctx());
	}

	/// Waits for the task and extracts its value or stored failure,
	/// invalidating the handle.
	///
	/// The handle is invalidated only by the extraction itself: a wait
	/// interrupted by the caller's own pending cancellation leaves it valid,
	/// so extraction can be retried, e.g. under a
	/// [`CancellationBlocker`](crate::CancellationBlocker).
	#[instrument(skip(self), fields(task_id = %self.id()))]
	pub async fn get(&mut self) -> Result<T, TaskError> {
		wait_until_terminal(self.ctx(), Deadline::unreachable()).await?;

		let ctx = self.ctx.take().expect(INVALID_HANDLE);

		ctx.take_result().map(downcast_value)
	}

	/// [`get`](Self::get) for non-engine threads, built on
	/// [`blocking_wait`](Self::blocking_wait).
	pub fn blocking_get(mut self) -> Result<T, TaskError> {
		let ctx = self.ctx.take().expect(INVALID_HANDLE);

		blocking_wait_inner(&ctx);

		ctx.take_result().map(downcast_value)
	}

	/// Releases the task to run to completion on its own (fire-and-forget),
	/// invalidating the handle. The returned token still allows observing
	/// and cancelling it.
	pub fn detach(mut self) -> CancellationToken {
		let ctx = self.ctx.take().expect(INVALID_HANDLE);

		trace!(task_id = %ctx.id(), "task detached");

		CancellationToken::new(ctx)
	}
}

impl<T> Default for TaskHandle<T> {
	/// An invalid handle referencing no task.
	fn default() -> Self {
		Self {
			ctx: None,
			_output: PhantomData,
		}
	}
}

/// The cloneable, shareable handle flavor: any number of clones may inspect,
/// wait on and cancel the same task concurrently.
///
/// Created by [`Dispatcher::dispatch_shared`](crate::Dispatcher::dispatch_shared);
/// records [`WaitMode::MultipleWaiters`] on its context. The terminal
/// transition wakes every concurrent waiter exactly once; there is no
/// partial wake-up. [`get`](Self::get) clones the stored value and never
/// invalidates the handle.
#[must_use]
pub struct SharedTaskHandle<T> {
	ctx: Arc<TaskContext>,
	_output: PhantomData<fn() -> T>,
}

impl<T> Clone for SharedTaskHandle<T> {
	fn clone(&self) -> Self {
		Self {
			ctx: Arc::clone(&self.ctx),
			_output: PhantomData,
		}
	}
}

impl<T> fmt::Debug for SharedTaskHandle<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SharedTaskHandle")
			.field("ctx", &self.ctx)
			.finish()
	}
}

impl<T: Send + 'static> SharedTaskHandle<T> {
	pub(crate) fn new(ctx: Arc<TaskContext>) -> Self {
		Self {
			ctx,
			_output: PhantomData,
		}
	}

	#[must_use]
	pub fn id(&self) -> TaskId {
		self.ctx.id()
	}

	#[must_use]
	pub fn state(&self) -> TaskState {
		self.ctx.state()
	}

	#[must_use]
	pub fn is_finished(&self) -> bool {
		self.ctx.is_finished()
	}

	#[must_use]
	pub fn wait_mode(&self) -> WaitMode {
		self.ctx.wait_mode()
	}

	#[must_use]
	pub fn cancellation_reason(&self) -> Option<CancellationReason> {
		self.ctx.cancellation_reason()
	}

	#[must_use]
	pub fn cancellation_token(&self) -> CancellationToken {
		CancellationToken::new(Arc::clone(&self.ctx))
	}

	pub async fn wait(&self) -> Result<(), WaitInterrupted> {
		wait_until_terminal(&self.ctx, Deadline::unreachable())
			.await
			.map(|_| ())
	}

	pub async fn wait_for(&self, timeout: Duration) -> Result<WaitOutcome, WaitInterrupted> {
		self.wait_until(Deadline::after(timeout)).await
	}

	pub async fn wait_until(&self, deadline: Deadline) -> Result<WaitOutcome, WaitInterrupted> {
		wait_until_terminal(&self.ctx, deadline).await
	}

	pub fn request_cancel(&self) {
		self.ctx.request_cancel(CancellationReason::UserRequest);
	}

	pub async fn sync_cancel(&self) {
		sync_cancel_inner(&self.ctx).await;
	}

	pub fn blocking_wait(&self) {
		blocking_wait_inner(&self.ctx);
	}
}

impl<T: Clone + Send + 'static> SharedTaskHandle<T> {
	/// Waits for the task and clones out its value or stored failure. The
	/// handle stays valid, so every sharing party can retrieve the result.
	pub async fn get(&self) -> Result<T, TaskError> {
		wait_until_terminal(&self.ctx, Deadline::unreachable()).await?;

		self.ctx.with_result(|result| match result {
			Ok(value) => Ok(value
				.downcast_ref::<T>()
				.unwrap_or_else(|| panic!("task result slot holds a value of an unexpected type"))
				.clone()),
			Err(e) => Err(e.clone()),
		})
	}
}
