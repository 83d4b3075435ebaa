use std::{
	cell::RefCell,
	cmp::{Ordering as CmpOrdering, Reverse},
	collections::{BinaryHeap, HashMap},
	future::Future,
	panic::AssertUnwindSafe,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Mutex, Weak,
	},
};

use async_channel as chan;
use futures::FutureExt;
use tokio::{spawn, task::JoinHandle, time::Instant};
use tracing::{error, info_span, instrument, trace, trace_span, warn, Instrument};

use super::{
	cancel::CancellationReason,
	context::{Importance, TaskContext, TaskId, TaskPayload, TaskState, TaskValue, WaitMode},
	current_task::{self, CurrentTask},
	deadline::Deadline,
	error::{panic_message, TaskError},
	task::{SharedTaskHandle, TaskHandle},
	worker,
};

/// Immutable processor configuration, consumed once at [`Processor::new`].
/// Reconfiguring means creating a new processor.
#[derive(Debug, Clone)]
pub struct Config {
	/// Name used in tracing spans of the workers and the deadline monitor.
	pub name: String,
	/// Number of worker run loops. Zero is clamped to one.
	pub worker_count: usize,
	/// Admission bound of the run queue; dispatching a normal task beyond it
	/// is rejected with [`CancellationReason::Overload`].
	pub queue_depth: usize,
	/// Advisory per-task stack budget surfaced through
	/// [`current_task::stack_size`](crate::current_task::stack_size).
	pub stack_size: usize,
}

impl Default for Config {
	fn default() -> Self {
		let worker_count = std::thread::available_parallelism().map_or_else(
			|e| {
				error!("failed to get available parallelism for the task processor: {e:#?}");
				1
			},
			std::num::NonZeroUsize::get,
		);

		Self {
			name: "task-processor".to_owned(),
			worker_count,
			queue_depth: 1024,
			stack_size: 256 * 1024,
		}
	}
}

/// Per-dispatch options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
	pub importance: Importance,
	/// Overall deadline for the task; on expiry the task is cancelled with
	/// reason [`CancellationReason::Deadline`] unless it already finished.
	pub deadline: Deadline,
}

impl TaskOptions {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub const fn critical(mut self) -> Self {
		self.importance = Importance::Critical;
		self
	}

	#[must_use]
	pub const fn with_deadline(mut self, deadline: Deadline) -> Self {
		self.deadline = deadline;
		self
	}
}

#[derive(Debug)]
pub(crate) struct ProcessorInner {
	config: Config,
	run_tx: chan::Sender<Arc<TaskContext>>,
	resume_tx: chan::Sender<Arc<TaskContext>>,
	deadline_tx: chan::Sender<DeadlineEntry>,
	live_tasks: Mutex<HashMap<TaskId, Weak<TaskContext>>>,
	is_shutdown: AtomicBool,
	created_task_count: AtomicU64,
}

impl ProcessorInner {
	pub(crate) fn unregister(&self, task_id: TaskId) {
		self.live_tasks
			.lock()
			.expect("live task registry lock poisoned")
			.remove(&task_id);
	}

	fn live_snapshot(&self) -> Vec<Arc<TaskContext>> {
		self.live_tasks
			.lock()
			.expect("live task registry lock poisoned")
			.values()
			.filter_map(Weak::upgrade)
			.collect()
	}
}

/// Builds the type-erasing payload wrapper and runs admission for one task.
///
/// The context is returned in `Queued` state on success, or already
/// finalized as `Cancelled` when admission was rejected; either way the
/// caller gets a context whose handle operations behave per contract, and
/// rejection is surfaced synchronously, never silently dropped.
fn submit<F, Fut, T>(
	inner: &Arc<ProcessorInner>,
	options: TaskOptions,
	wait_mode: WaitMode,
	make_payload: F,
) -> Arc<TaskContext>
where
	F: FnOnce() -> Fut + Send + 'static,
	Fut: Future<Output = T> + Send + 'static,
	T: Send + 'static,
{
	let ctx = TaskContext::new(options.importance, wait_mode, inner.resume_tx.clone());

	inner.created_task_count.fetch_add(1, Ordering::Relaxed);

	let current = CurrentTask {
		ctx: Arc::clone(&ctx),
		processor: Arc::downgrade(inner),
		stack_size: inner.config.stack_size,
	};

	let payload: TaskPayload = Box::pin(
		current_task::scope(current, async move {
			AssertUnwindSafe(async move { make_payload().await })
				.catch_unwind()
				.await
				.map(|value| -> Box<dyn TaskValue> { Box::new(value) })
				.map_err(|panic| TaskError::Panicked(panic_message(&*panic)))
		})
		.instrument(trace_span!("task", task_id = %ctx.id())),
	);

	ctx.install_payload(payload);

	if inner.is_shutdown.load(Ordering::Acquire) {
		return reject(ctx, CancellationReason::Shutdown);
	}

	if let Some(expires_at) = options.deadline.instant() {
		// Only fails during shutdown, when the sweep cancels this context
		// anyway.
		let _ = inner.deadline_tx.try_send(DeadlineEntry {
			expires_at,
			ctx: Arc::downgrade(&ctx),
		});
	}

	inner
		.live_tasks
		.lock()
		.expect("live task registry lock poisoned")
		.insert(ctx.id(), Arc::downgrade(&ctx));

	ctx.mark_queued();

	let enqueued = match options.importance {
		// Critical tasks bypass the bounded admission queue.
		Importance::Critical => inner
			.resume_tx
			.try_send(Arc::clone(&ctx))
			.map_err(|e| matches!(e, chan::TrySendError::Closed(_))),
		Importance::Normal => inner
			.run_tx
			.try_send(Arc::clone(&ctx))
			.map_err(|e| matches!(e, chan::TrySendError::Closed(_))),
	};

	if let Err(closed) = enqueued {
		inner.unregister(ctx.id());

		return reject(
			ctx,
			if closed {
				CancellationReason::Shutdown
			} else {
				CancellationReason::Overload
			},
		);
	}

	ctx
}

/// Admission rejection: the context is born `Cancelled` with the given
/// reason and every wait on it completes immediately.
fn reject(ctx: Arc<TaskContext>, reason: CancellationReason) -> Arc<TaskContext> {
	warn!(task_id = %ctx.id(), %reason, "task admission rejected");

	ctx.request_cancel(reason);
	ctx.finalize(TaskState::Cancelled, Err(TaskError::Cancelled(reason)));

	ctx
}

#[derive(Debug)]
struct DeadlineEntry {
	expires_at: Instant,
	ctx: Weak<TaskContext>,
}

impl PartialEq for DeadlineEntry {
	fn eq(&self, other: &Self) -> bool {
		self.expires_at == other.expires_at
	}
}

impl Eq for DeadlineEntry {}

impl PartialOrd for DeadlineEntry {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}

impl Ord for DeadlineEntry {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		self.expires_at.cmp(&other.expires_at)
	}
}

/// Time-ordered wake structure for whole-task deadlines: sleeps until the
/// earliest registered deadline and requests cancellation with reason
/// `Deadline` for every expired context that has not already finished, so a
/// task whose completion raced its deadline keeps its completion.
async fn deadline_monitor(entries_rx: chan::Receiver<DeadlineEntry>) {
	let mut queue: BinaryHeap<Reverse<DeadlineEntry>> = BinaryHeap::new();

	loop {
		let next_expiry = queue.peek().map(|Reverse(entry)| entry.expires_at);

		tokio::select! {
			entry = entries_rx.recv() => match entry {
				Ok(entry) => queue.push(Reverse(entry)),
				Err(chan::RecvError) => break,
			},

			() = expiry_wait(next_expiry) => {
				let now = Instant::now();

				while queue
					.peek()
					.is_some_and(|Reverse(entry)| entry.expires_at <= now)
				{
					let Reverse(entry) = queue.pop().expect("peeked entry must pop");

					if let Some(ctx) = entry.ctx.upgrade() {
						if !ctx.is_finished() {
							trace!(task_id = %ctx.id(), "task deadline expired");
							ctx.request_cancel(CancellationReason::Deadline);
						}
					}
				}
			}
		}
	}

	trace!("deadline monitor exiting");
}

async fn expiry_wait(next_expiry: Option<Instant>) {
	match next_expiry {
		Some(at) => tokio::time::sleep_until(at).await,
		None => futures::future::pending().await,
	}
}

/// The cheap, cloneable submission surface of a [`Processor`], for handing
/// to collaborators that dispatch work but never shut the processor down.
/// Also available from inside a task via
/// [`current_task::dispatcher`](crate::current_task::dispatcher).
#[derive(Debug, Clone)]
pub struct Dispatcher {
	inner: Arc<ProcessorInner>,
}

impl Dispatcher {
	pub(crate) fn from_inner(inner: Arc<ProcessorInner>) -> Self {
		Self { inner }
	}

	/// Dispatches a task with default options, returning its exclusive
	/// handle. The closure is invoked on a worker, not on the caller.
	///
	/// Never blocks: under shutdown or overload the returned handle refers
	/// to a context that is already `Cancelled` with the matching reason.
	pub fn dispatch<F, Fut, T>(&self, make_payload: F) -> TaskHandle<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		self.dispatch_with(TaskOptions::default(), make_payload)
	}

	pub fn dispatch_with<F, Fut, T>(&self, options: TaskOptions, make_payload: F) -> TaskHandle<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		TaskHandle::new(submit(
			&self.inner,
			options,
			WaitMode::SingleWaiter,
			make_payload,
		))
	}

	/// As [`dispatch`](Self::dispatch), returning a cloneable handle that
	/// any number of parties may wait on concurrently.
	pub fn dispatch_shared<F, Fut, T>(&self, make_payload: F) -> SharedTaskHandle<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		self.dispatch_shared_with(TaskOptions::default(), make_payload)
	}

	pub fn dispatch_shared_with<F, Fut, T>(
		&self,
		options: TaskOptions,
		make_payload: F,
	) -> SharedTaskHandle<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		SharedTaskHandle::new(submit(
			&self.inner,
			options,
			WaitMode::MultipleWaiters,
			make_payload,
		))
	}
}

/// The scheduler: owns a fixed set of worker run loops, the run queue and
/// the deadline monitor, multiplexing many logical tasks onto them.
///
/// Workers never preempt a task; a task keeps its worker until it suspends
/// or finishes, so long CPU-bound stretches without suspension points starve
/// the processor by design and are a caller error.
pub struct Processor {
	inner: Arc<ProcessorInner>,
	dispatcher: Dispatcher,
	handles: RefCell<Option<Vec<JoinHandle<()>>>>,
}

impl Processor {
	/// Spawns the worker run loops and the deadline monitor on the ambient
	/// tokio runtime.
	#[must_use]
	pub fn new(mut config: Config) -> Self {
		config.worker_count = config.worker_count.max(1);
		config.queue_depth = config.queue_depth.max(1);

		let (run_tx, run_rx) = chan::bounded(config.queue_depth);
		let (resume_tx, resume_rx) = chan::unbounded();
		let (deadline_tx, deadline_rx) = chan::unbounded();

		let inner = Arc::new(ProcessorInner {
			config,
			run_tx,
			resume_tx,
			deadline_tx,
			live_tasks: Mutex::new(HashMap::new()),
			is_shutdown: AtomicBool::new(false),
			created_task_count: AtomicU64::new(0),
		});

		let mut handles = (0..inner.config.worker_count)
			.map(|worker_id| {
				spawn(
					worker::run(
						worker_id,
						Arc::clone(&inner),
						run_rx.clone(),
						resume_rx.clone(),
					)
					.instrument(info_span!(
						"task_worker",
						processor = %inner.config.name,
						worker_id,
					)),
				)
			})
			.collect::<Vec<_>>();

		handles.push(spawn(deadline_monitor(deadline_rx).instrument(info_span!(
			"deadline_monitor",
			processor = %inner.config.name,
		))));

		Self {
			dispatcher: Dispatcher {
				inner: Arc::clone(&inner),
			},
			inner,
			handles: RefCell::new(Some(handles)),
		}
	}

	#[must_use]
	pub fn dispatcher(&self) -> Dispatcher {
		self.dispatcher.clone()
	}

	pub fn dispatch<F, Fut, T>(&self, make_payload: F) -> TaskHandle<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		self.dispatcher.dispatch(make_payload)
	}

	pub fn dispatch_with<F, Fut, T>(&self, options: TaskOptions, make_payload: F) -> TaskHandle<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		self.dispatcher.dispatch_with(options, make_payload)
	}

	pub fn dispatch_shared<F, Fut, T>(&self, make_payload: F) -> SharedTaskHandle<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		self.dispatcher.dispatch_shared(make_payload)
	}

	pub fn dispatch_shared_with<F, Fut, T>(
		&self,
		options: TaskOptions,
		make_payload: F,
	) -> SharedTaskHandle<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		self.dispatcher.dispatch_shared_with(options, make_payload)
	}

	#[must_use]
	pub fn worker_count(&self) -> usize {
		self.inner.config.worker_count
	}

	/// Total number of contexts ever created through this processor,
	/// including rejected ones.
	#[must_use]
	pub fn created_task_count(&self) -> u64 {
		self.inner.created_task_count.load(Ordering::Relaxed)
	}

	/// Stops accepting work, sweeps every live task with a `Shutdown`
	/// cancellation, waits for all of them to reach a terminal state and
	/// joins the workers. Cooperative: a task that never suspends nor
	/// finishes delays shutdown indefinitely.
	#[instrument(skip(self), fields(processor = %self.inner.config.name))]
	pub async fn shutdown(&self) {
		if let Some(handles) = self
			.handles
			.try_borrow_mut()
			.ok()
			.and_then(|mut maybe_handles| maybe_handles.take())
		{
			self.inner.is_shutdown.store(true, Ordering::Release);
			self.inner.run_tx.close();

			// Loop until no live context remains: tasks observed mid-sweep
			// unregister themselves as they finalize.
			loop {
				let live = self.inner.live_snapshot();

				if live.is_empty() {
					break;
				}

				trace!(live_tasks = live.len(), "sweeping live tasks");

				for ctx in &live {
					ctx.request_cancel(CancellationReason::Shutdown);
				}

				for ctx in live {
					let mut finished = ctx.subscribe_finished();

					finished
						.wait_for(|done| *done)
						.await
						.expect("terminal signal dropped while its context is alive");
				}
			}

			self.inner.resume_tx.close();
			self.inner.deadline_tx.close();

			for handle in handles {
				if let Err(e) = handle.await {
					error!("task processor worker failed to shut down: {e:#?}");
				}
			}

			trace!("task processor gracefully shutdown");
		} else {
			warn!("trying to shutdown a task processor that was already shutdown");
		}
	}
}

/// SAFETY: Due to usage of refcell we lost `Sync` impl, but we only use it to
/// have a shutdown method receiving `&self` which is called once, and we also
/// use `try_borrow_mut` so we never panic
unsafe impl Sync for Processor {}
