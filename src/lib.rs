//!
//! # Task Engine
//!
//! A cooperative task engine: the scheduler multiplexes many logical units of
//! work, each a cancellable task with its own identity and lifecycle, onto a
//! fixed pool of workers.
//!
//! Dispatch a closure and get a handle back; the engine handles enqueueing,
//! parallel execution, deadline-based suspension and cooperative cancellation
//! for you. Aside from some niceties like:
//! - Deadlines for whole tasks and for individual waits, with timed-out waits
//!   leaving the target untouched;
//! - Cancellation that is advisory and cooperative, with sticky reasons,
//!   capability tokens for unrelated holders, and blocker scopes to shield
//!   critical sections;
//! - Critical tasks that start even under overload or a pending cancellation;
//! - Multiple handle flavors over the same context: exclusive with result
//!   extraction, shareable with any number of concurrent waiters, and
//!   fire-and-forget via detach;
//! - Admission control that rejects new work synchronously under shutdown or
//!   overload instead of blocking the submitter.
//!
//!
//! ## Basic example
//!
//! ```
//! use task_engine::{Config, Processor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let processor = Processor::new(Config::default());
//!
//!     let mut handle = processor.dispatch(|| async { 6 * 7 });
//!
//!     assert_eq!(handle.get().await.unwrap(), 42);
//!
//!     processor.shutdown().await;
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod cancel;
mod context;
pub mod current_task;
mod deadline;
mod error;
mod processor;
mod task;
mod worker;

pub use cancel::{CancellationBlocker, CancellationReason, CancellationToken};
pub use context::{Importance, TaskId, TaskState, TaskValue, WaitMode};
pub use deadline::Deadline;
pub use error::{TaskError, WaitInterrupted};
pub use processor::{Config, Dispatcher, Processor, TaskOptions};
pub use task::{SharedTaskHandle, TaskHandle, WaitOutcome};
