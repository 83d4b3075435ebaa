use std::any::Any;

use thiserror::Error;

use super::cancel::CancellationReason;

/// A wait primitive bailed out because the *calling* task has a pending
/// cancellation and no [`CancellationBlocker`](crate::CancellationBlocker)
/// scope is active.
///
/// Recoverable: the caller decides whether to retry (typically under a
/// blocker) or to give up and let its own cancellation take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait interrupted: the calling task has a pending cancellation")]
pub struct WaitInterrupted;

/// The stored failure of a task, surfaced when its result is extracted.
///
/// Failures raised inside payload code are captured on the worker, never
/// rethrown there, and re-raised only by [`TaskHandle::get`] or
/// [`SharedTaskHandle::get`].
///
/// [`TaskHandle::get`]: crate::TaskHandle::get
/// [`SharedTaskHandle::get`]: crate::SharedTaskHandle::get
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
	/// The task reached the `Cancelled` terminal state before producing a
	/// value.
	#[error("task was cancelled ({0})")]
	Cancelled(CancellationReason),

	/// The payload panicked; the panic message is captured verbatim.
	#[error("task panicked: {0}")]
	Panicked(String),

	/// The wait for the task was interrupted by the caller's own
	/// cancellation; the target task itself is unaffected.
	#[error(transparent)]
	Interrupted(#[from] WaitInterrupted),
}

/// Renders a captured panic payload as a message string.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	payload.downcast_ref::<&'static str>().map_or_else(
		|| {
			payload
				.downcast_ref::<String>()
				.cloned()
				.unwrap_or_else(|| "<non-string panic payload>".to_owned())
		},
		ToString::to_string,
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn panic_message_handles_common_payloads() {
		assert_eq!(panic_message(&"boom"), "boom");
		assert_eq!(panic_message(&"boom".to_owned()), "boom");
		assert_eq!(panic_message(&42_u32), "<non-string panic payload>");
	}
}
