use std::{fmt, sync::Arc};

use tracing::trace;

use super::{
	context::{TaskContext, TaskId},
	current_task,
};

/// Why a task was asked to stop.
///
/// The reason recorded on a task context is sticky: the first request wins
/// and later requests with any reason are no-ops, so the observed reason
/// never regresses and never resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancellationReason {
	/// Explicit request through a handle or token.
	UserRequest = 1,
	/// The deadline registered for the whole task expired first.
	Deadline = 2,
	/// Admission was rejected because the processor's run queue was full.
	Overload = 3,
	/// Admission was rejected or the task was swept during processor
	/// shutdown.
	Shutdown = 4,
}

impl CancellationReason {
	pub(crate) const fn from_u8(value: u8) -> Option<Self> {
		match value {
			1 => Some(Self::UserRequest),
			2 => Some(Self::Deadline),
			3 => Some(Self::Overload),
			4 => Some(Self::Shutdown),
			_ => None,
		}
	}
}

impl fmt::Display for CancellationReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::UserRequest => "user request",
			Self::Deadline => "deadline expired",
			Self::Overload => "task processor overload",
			Self::Shutdown => "task processor shutdown",
		})
	}
}

/// A capability object that lets an unrelated holder observe and request
/// cancellation of a specific task without owning its handle.
///
/// Obtained from a handle, from [`TaskHandle::detach`](crate::TaskHandle::detach)
/// or from [`current_task::cancellation_token`](crate::current_task::cancellation_token).
/// Cloning is cheap and all clones refer to the same task.
#[derive(Clone)]
pub struct CancellationToken {
	ctx: Arc<TaskContext>,
}

impl fmt::Debug for CancellationToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CancellationToken")
			.field("task_id", &self.ctx.id())
			.field("state", &self.ctx.state())
			.finish()
	}
}

impl CancellationToken {
	pub(crate) fn new(ctx: Arc<TaskContext>) -> Self {
		Self { ctx }
	}

	#[must_use]
	pub fn task_id(&self) -> TaskId {
		self.ctx.id()
	}

	/// Queues a cancellation request with reason
	/// [`CancellationReason::UserRequest`]. Idempotent and non-blocking;
	/// never preempts running code.
	pub fn request_cancel(&self) {
		self.ctx.request_cancel(CancellationReason::UserRequest);
	}

	#[must_use]
	pub fn is_cancellation_requested(&self) -> bool {
		self.ctx.is_cancellation_requested()
	}

	#[must_use]
	pub fn cancellation_reason(&self) -> Option<CancellationReason> {
		self.ctx.cancellation_reason()
	}

	/// Whether the task already reached a terminal state.
	#[must_use]
	pub fn is_finished(&self) -> bool {
		self.ctx.is_finished()
	}
}

/// RAII scope suppressing cancellation delivery on the current task.
///
/// While at least one blocker is alive, suspension points of the current
/// task neither fail fast with [`WaitInterrupted`](crate::WaitInterrupted)
/// nor terminate the task when a cancellation request is pending; the sticky
/// reason stays recorded and takes effect at the first suspension point
/// after the last blocker is dropped.
///
/// Constructed outside of an engine task, the blocker is a no-op.
#[derive(Debug)]
pub struct CancellationBlocker {
	ctx: Option<Arc<TaskContext>>,
}

impl CancellationBlocker {
	#[must_use]
	pub fn new() -> Self {
		let ctx = current_task::try_current_context();

		if let Some(ctx) = &ctx {
			ctx.enter_cancellation_block();
			trace!(task_id = %ctx.id(), "cancellation blocked");
		}

		Self { ctx }
	}
}

impl Default for CancellationBlocker {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for CancellationBlocker {
	fn drop(&mut self) {
		if let Some(ctx) = self.ctx.take() {
			ctx.exit_cancellation_block();
			trace!(task_id = %ctx.id(), "cancellation unblocked");
		}
	}
}
