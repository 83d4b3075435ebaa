use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
		Arc, Mutex, Weak,
	},
};

use async_channel as chan;
use downcast_rs::{impl_downcast, Downcast};
use futures::{future::BoxFuture, task::ArcWake};
use tokio::sync::watch;
use tracing::trace;
use uuid::Uuid;

use super::{cancel::CancellationReason, error::TaskError};

/// A unique identifier for a task using the [`uuid`](https://docs.rs/uuid) crate.
pub type TaskId = Uuid;

/// Observable lifecycle state of a task.
///
/// `Completed` and `Cancelled` are terminal and reached exactly once;
/// `Invalid` is only ever reported by handles that no longer reference a
/// context (after `detach` or result extraction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
	/// Unusable handle, no context attached.
	Invalid = 0,
	/// Created, not yet accepted by a task processor.
	New = 1,
	/// Awaiting execution in a run queue.
	Queued = 2,
	/// Executing payload code on a worker.
	Running = 3,
	/// Parked at a suspension point, waiting for its wake condition.
	Suspended = 4,
	/// Exited because of a cancellation request. Terminal.
	Cancelled = 5,
	/// Exited payload code with a value or a captured panic. Terminal.
	Completed = 6,
}

impl TaskState {
	const fn from_u8(value: u8) -> Self {
		match value {
			1 => Self::New,
			2 => Self::Queued,
			3 => Self::Running,
			4 => Self::Suspended,
			5 => Self::Cancelled,
			6 => Self::Completed,
			_ => Self::Invalid,
		}
	}

	#[must_use]
	pub const fn name(&self) -> &'static str {
		match self {
			Self::Invalid => "Invalid",
			Self::New => "New",
			Self::Queued => "Queued",
			Self::Running => "Running",
			Self::Suspended => "Suspended",
			Self::Cancelled => "Cancelled",
			Self::Completed => "Completed",
		}
	}

	#[must_use]
	pub const fn is_terminal(&self) -> bool {
		matches!(self, Self::Cancelled | Self::Completed)
	}
}

impl fmt::Display for TaskState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Whether a task must start even when a cancellation request arrived before
/// it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Importance {
	#[default]
	Normal,
	/// Started regardless of cancellation requests and admission-queue
	/// overload; becomes cancellable only after its first suspension point.
	Critical,
}

/// How many parties may wait on a context's completion at once.
///
/// Recorded from the handle flavor that created the context. The terminal
/// signal itself wakes every registered waiter in both modes; the mode is
/// descriptive and correctness never depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
	/// An exclusive handle: at most one party ever waits.
	SingleWaiter,
	/// Cloneable handles: any number of concurrent waiters.
	MultipleWaiters,
}

/// A type-erased task return value.
///
/// The user downcasts it back to the concrete type the payload returned;
/// only a heap allocation is paid for the erasure.
pub trait TaskValue: Send + Downcast {}

impl_downcast!(TaskValue);

/// Blanket implementation for all types that implement `Send + 'static`
impl<T: Send + 'static> TaskValue for T {}

impl fmt::Debug for Box<dyn TaskValue> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<TaskValue>")
	}
}

pub(crate) type TaskResult = Result<Box<dyn TaskValue>, TaskError>;
pub(crate) type TaskPayload = BoxFuture<'static, TaskResult>;

const NO_REASON: u8 = 0;

/// The heap-resident control block for one unit of work.
///
/// Owned by the scheduler while queued or running and referenced, never
/// owned, by every outstanding handle, token and waker. All lifecycle state
/// is updated through atomic transitions so any thread may inspect it.
pub(crate) struct TaskContext {
	id: TaskId,
	importance: Importance,
	wait_mode: WaitMode,
	state: AtomicU8,
	started: AtomicBool,
	/// Wake request received while not suspended; consumed at the next
	/// suspension attempt.
	notified: AtomicBool,
	cancellation_reason: AtomicU8,
	cancellation_block_depth: AtomicUsize,
	payload: Mutex<Option<TaskPayload>>,
	result: Mutex<Option<TaskResult>>,
	finished_tx: watch::Sender<bool>,
	resume_tx: chan::Sender<Arc<TaskContext>>,
	self_ref: Weak<TaskContext>,
}

impl fmt::Debug for TaskContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TaskContext")
			.field("id", &self.id)
			.field("importance", &self.importance)
			.field("wait_mode", &self.wait_mode)
			.field("state", &self.state())
			.field("cancellation_reason", &self.cancellation_reason())
			.finish()
	}
}

impl TaskContext {
	pub(crate) fn new(
		importance: Importance,
		wait_mode: WaitMode,
		resume_tx: chan::Sender<Arc<TaskContext>>,
	) -> Arc<Self> {
		let (finished_tx, _) = watch::channel(false);

		Arc::new_cyclic(|self_ref| Self {
			id: TaskId::new_v4(),
			importance,
			wait_mode,
			state: AtomicU8::new(TaskState::New as u8),
			started: AtomicBool::new(false),
			notified: AtomicBool::new(false),
			cancellation_reason: AtomicU8::new(NO_REASON),
			cancellation_block_depth: AtomicUsize::new(0),
			payload: Mutex::new(None),
			result: Mutex::new(None),
			finished_tx,
			resume_tx,
			self_ref: Weak::clone(self_ref),
		})
	}

	#[inline]
	pub(crate) fn id(&self) -> TaskId {
		self.id
	}

	#[inline]
	pub(crate) fn importance(&self) -> Importance {
		self.importance
	}

	#[inline]
	pub(crate) fn wait_mode(&self) -> WaitMode {
		self.wait_mode
	}

	pub(crate) fn state(&self) -> TaskState {
		TaskState::from_u8(self.state.load(Ordering::Acquire))
	}

	pub(crate) fn is_finished(&self) -> bool {
		self.state().is_terminal()
	}

	pub(crate) fn has_started(&self) -> bool {
		self.started.load(Ordering::Acquire)
	}

	pub(crate) fn mark_started(&self) {
		self.started.store(true, Ordering::Release);
	}

	pub(crate) fn clear_notified(&self) {
		self.notified.store(false, Ordering::SeqCst);
	}

	pub(crate) fn install_payload(&self, payload: TaskPayload) {
		let previous = self
			.payload
			.lock()
			.expect("task payload lock poisoned")
			.replace(payload);
		assert!(previous.is_none(), "task payload installed twice");
	}

	pub(crate) fn take_payload(&self) -> Option<TaskPayload> {
		self.payload.lock().expect("task payload lock poisoned").take()
	}

	pub(crate) fn store_payload(&self, payload: TaskPayload) {
		*self.payload.lock().expect("task payload lock poisoned") = Some(payload);
	}

	/// `New → Queued`, on submission to a processor.
	pub(crate) fn mark_queued(&self) {
		self.state
			.compare_exchange(
				TaskState::New as u8,
				TaskState::Queued as u8,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.expect("a task can only be submitted once");
	}

	/// `Queued → Running`, claimed by a worker. False when the context is no
	/// longer queued (e.g. a stale wake-up raced a terminal transition).
	pub(crate) fn try_begin_running(&self) -> bool {
		self.state
			.compare_exchange(
				TaskState::Queued as u8,
				TaskState::Running as u8,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.is_ok()
	}

	/// `Running → Suspended` after the payload returned `Pending`; requeues
	/// right away when a wake request arrived during the poll.
	pub(crate) fn suspend_or_requeue(&self) {
		self.state
			.compare_exchange(
				TaskState::Running as u8,
				TaskState::Suspended as u8,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.expect("only a running task can suspend");

		if self.notified.swap(false, Ordering::SeqCst) {
			self.requeue();
		}
	}

	/// Wake condition fired: move a suspended context back to the run queue.
	/// Wake-ups in any other state are coalesced into `notified` and
	/// consumed at the next suspension attempt.
	pub(crate) fn notify(&self) {
		self.notified.store(true, Ordering::SeqCst);
		self.requeue();
	}

	fn requeue(&self) {
		if self
			.state
			.compare_exchange(
				TaskState::Suspended as u8,
				TaskState::Queued as u8,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.is_ok()
		{
			self.clear_notified();

			if let Some(this) = self.self_ref.upgrade() {
				// Only fails when the processor is already shutting down, in
				// which case the shutdown sweep finalizes this context.
				if self.resume_tx.try_send(this).is_err() {
					trace!(task_id = %self.id, "resume queue closed, dropping wake-up");
				}
			}
		}
	}

	/// Queues a cancellation request. The first reason sticks; the context
	/// is woken so a suspended task observes the request promptly. Never
	/// preemptive.
	pub(crate) fn request_cancel(&self, reason: CancellationReason) {
		if self.is_finished() {
			return;
		}

		if self
			.cancellation_reason
			.compare_exchange(
				NO_REASON,
				reason as u8,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.is_ok()
		{
			trace!(task_id = %self.id, %reason, "cancellation requested");
		}

		self.notify();
	}

	pub(crate) fn is_cancellation_requested(&self) -> bool {
		self.cancellation_reason.load(Ordering::Acquire) != NO_REASON
	}

	pub(crate) fn cancellation_reason(&self) -> Option<CancellationReason> {
		CancellationReason::from_u8(self.cancellation_reason.load(Ordering::Acquire))
	}

	/// Whether cancellation must be delivered at the next suspension point:
	/// a reason is set and no blocker scope is active.
	pub(crate) fn cancellation_pending(&self) -> bool {
		self.is_cancellation_requested()
			&& self.cancellation_block_depth.load(Ordering::Acquire) == 0
	}

	pub(crate) fn enter_cancellation_block(&self) {
		self.cancellation_block_depth
			.fetch_add(1, Ordering::AcqRel);
	}

	pub(crate) fn exit_cancellation_block(&self) {
		let previous = self.cancellation_block_depth.fetch_sub(1, Ordering::AcqRel);
		assert!(previous > 0, "unbalanced cancellation blocker release");
	}

	/// Terminal transition: stores the result, drops any leftover payload
	/// and wakes every waiter exactly once. Finalizing twice is an engine
	/// bug and aborts loudly.
	pub(crate) fn finalize(&self, terminal: TaskState, result: TaskResult) {
		assert!(terminal.is_terminal(), "finalize requires a terminal state");

		drop(self.take_payload());

		{
			let mut slot = self.result.lock().expect("task result lock poisoned");
			assert!(slot.is_none(), "task result stored twice");
			*slot = Some(result);
		}

		let previous = TaskState::from_u8(self.state.swap(terminal as u8, Ordering::AcqRel));
		assert!(
			!previous.is_terminal(),
			"task <id='{}'> finalized twice ({previous} -> {terminal})",
			self.id
		);

		trace!(task_id = %self.id, %terminal, "task finished");

		self.finished_tx.send_replace(true);
	}

	/// A fresh subscription to the terminal signal. The current value is
	/// observed at subscription time, so registering after the terminal
	/// transition sees it immediately; there is no missed-wake-up window.
	pub(crate) fn subscribe_finished(&self) -> watch::Receiver<bool> {
		self.finished_tx.subscribe()
	}

	/// Moves the stored result out. Exclusive handles only.
	pub(crate) fn take_result(&self) -> TaskResult {
		self.result
			.lock()
			.expect("task result lock poisoned")
			.take()
			.expect("task result extracted twice")
	}

	/// Reads the stored result in place. Shared handles clone out of it.
	pub(crate) fn with_result<R>(&self, f: impl FnOnce(&TaskResult) -> R) -> R {
		f(self
			.result
			.lock()
			.expect("task result lock poisoned")
			.as_ref()
			.expect("task result accessed before the terminal transition"))
	}
}

impl ArcWake for TaskContext {
	fn wake_by_ref(arc_self: &Arc<Self>) {
		arc_self.notify();
	}
}
