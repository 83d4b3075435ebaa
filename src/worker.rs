use std::{
	pin::pin,
	sync::Arc,
	task::{Context, Poll},
};

use async_channel as chan;
use futures::{task::waker_ref, FutureExt, StreamExt};
use futures_concurrency::stream::Merge;
use tracing::{instrument, trace};

use super::{
	context::{Importance, TaskContext, TaskState},
	error::TaskError,
	processor::ProcessorInner,
};

pub(crate) type WorkerId = usize;

/// The per-worker scheduler loop: pops the next ready context from the
/// merged admission and resume queues and drives it for one scheduling
/// slice. Exits once both queues are closed and drained, which only happens
/// during processor shutdown.
pub(crate) async fn run(
	worker_id: WorkerId,
	processor: Arc<ProcessorInner>,
	run_rx: chan::Receiver<Arc<TaskContext>>,
	resume_rx: chan::Receiver<Arc<TaskContext>>,
) {
	trace!("worker run loop starting");

	let mut ready_stream = pin!((run_rx, resume_rx).merge());

	while let Some(ctx) = ready_stream.next().await {
		poll_task(worker_id, &processor, &ctx);
	}

	trace!("worker run loop drained, exiting");
}

/// Runs one scheduling slice of a queued context: delivers pending
/// cancellation, or resumes the payload until it completes or suspends.
///
/// Cooperative by construction: the context keeps this worker until its
/// payload returns, and the cancellation check runs before the payload is
/// resumed, so a cancellation racing any wake condition always wins.
#[instrument(skip_all, fields(%worker_id, task_id = %ctx.id()))]
fn poll_task(worker_id: WorkerId, processor: &Arc<ProcessorInner>, ctx: &Arc<TaskContext>) {
	if !ctx.try_begin_running() {
		// Stale wake-up; the context was already claimed or finalized.
		trace!(state = %ctx.state(), "skipping context that is no longer queued");
		return;
	}

	if ctx.cancellation_pending()
		&& (ctx.has_started() || ctx.importance() == Importance::Normal)
	{
		let reason = ctx
			.cancellation_reason()
			.expect("a pending cancellation always carries a reason");

		trace!(%reason, started = ctx.has_started(), "delivering cancellation");

		ctx.finalize(TaskState::Cancelled, Err(TaskError::Cancelled(reason)));
		processor.unregister(ctx.id());

		return;
	}

	ctx.mark_started();
	ctx.clear_notified();

	let mut payload = ctx
		.take_payload()
		.expect("a queued context always holds its payload");

	let waker = waker_ref(ctx);
	let mut poll_cx = Context::from_waker(&waker);

	match payload.poll_unpin(&mut poll_cx) {
		Poll::Ready(result) => {
			ctx.finalize(TaskState::Completed, result);
			processor.unregister(ctx.id());
		}
		Poll::Pending => {
			ctx.store_payload(payload);
			ctx.suspend_or_requeue();
		}
	}
}
