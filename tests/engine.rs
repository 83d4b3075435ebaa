use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use futures_concurrency::future::Join;
use tokio::sync::oneshot;

use task_engine::{
	current_task, CancellationBlocker, CancellationReason, Config, Deadline, Importance,
	Processor, SharedTaskHandle, TaskError, TaskHandle, TaskOptions, TaskState, WaitMode,
	WaitOutcome,
};

fn init_logging() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.try_init();
}

fn default_processor() -> Processor {
	init_logging();
	Processor::new(Config::default())
}

fn small_processor(worker_count: usize, queue_depth: usize) -> Processor {
	init_logging();
	Processor::new(Config {
		name: "test-processor".to_owned(),
		worker_count,
		queue_depth,
		..Config::default()
	})
}

/// Keeps a worker busy without suspending, so queued tasks stay queued.
fn occupy_worker(processor: &Processor) -> (Arc<AtomicBool>, TaskHandle<()>) {
	let release = Arc::new(AtomicBool::new(false));
	let started = Arc::new(AtomicBool::new(false));

	let handle = processor.dispatch({
		let release = Arc::clone(&release);
		let started = Arc::clone(&started);

		|| async move {
			started.store(true, Ordering::Release);
			while !release.load(Ordering::Acquire) {
				std::thread::yield_now();
			}
		}
	});

	while !started.load(Ordering::Acquire) {
		std::thread::yield_now();
	}

	(release, handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn collects_results_regardless_of_completion_order() {
	let processor = default_processor();

	let handles = (0..5_u64)
		.map(|i| processor.dispatch(move || async move { i * i }))
		.collect::<Vec<_>>();

	let mut results = Vec::new();

	for mut handle in handles {
		results.push(handle.get().await.unwrap());
	}

	assert_eq!(results, vec![0, 1, 4, 9, 16]);

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_state_is_terminal_and_sticky() {
	let processor = default_processor();

	let mut handle = processor.dispatch(|| async { "done" });

	handle.wait().await.unwrap();

	assert!(handle.is_finished());
	assert_eq!(handle.state(), TaskState::Completed);

	// Cancellation after the terminal transition is a no-op.
	handle.request_cancel();
	handle.request_cancel();
	assert_eq!(handle.state(), TaskState::Completed);
	assert_eq!(handle.cancellation_reason(), None);

	assert_eq!(handle.get().await.unwrap(), "done");

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_reason_never_regresses() {
	let processor = small_processor(1, 64);
	let (release, mut occupier) = occupy_worker(&processor);

	let mut handle: TaskHandle<()> = processor.dispatch(|| async {
		loop {
			current_task::yield_now().await;
		}
	});

	let token = handle.cancellation_token();
	token.request_cancel();
	token.request_cancel();
	handle.request_cancel();

	assert_eq!(
		handle.cancellation_reason(),
		Some(CancellationReason::UserRequest)
	);

	release.store(true, Ordering::Release);
	occupier.get().await.unwrap();

	assert!(matches!(
		handle.get().await,
		Err(TaskError::Cancelled(CancellationReason::UserRequest))
	));

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_task_starts_despite_pending_cancellation() {
	let processor = small_processor(1, 64);
	let (release, mut occupier) = occupy_worker(&processor);

	let critical_ran = Arc::new(AtomicBool::new(false));
	let normal_ran = Arc::new(AtomicBool::new(false));

	let mut critical: TaskHandle<()> = processor.dispatch_with(TaskOptions::new().critical(), {
		let critical_ran = Arc::clone(&critical_ran);

		|| async move {
			critical_ran.store(true, Ordering::Release);
			// First suspension point: the pending cancellation is delivered
			// here.
			loop {
				current_task::yield_now().await;
			}
		}
	});

	let mut normal: TaskHandle<()> = processor.dispatch({
		let normal_ran = Arc::clone(&normal_ran);

		|| async move {
			normal_ran.store(true, Ordering::Release);
			loop {
				current_task::yield_now().await;
			}
		}
	});

	critical.request_cancel();
	normal.request_cancel();

	release.store(true, Ordering::Release);
	occupier.get().await.unwrap();

	assert!(matches!(
		critical.get().await,
		Err(TaskError::Cancelled(CancellationReason::UserRequest))
	));
	assert!(matches!(
		normal.get().await,
		Err(TaskError::Cancelled(CancellationReason::UserRequest))
	));

	assert!(critical_ran.load(Ordering::Acquire));
	assert!(!normal_ran.load(Ordering::Acquire));

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bounded_wait_discriminates_timeout_from_completion() {
	let processor = default_processor();

	let (done_tx, done_rx) = oneshot::channel::<()>();

	let mut handle = processor.dispatch(|| async move {
		done_rx.await.ok();
		42
	});

	// Deadline elapses first: not an interruption, and the target keeps
	// running.
	assert_eq!(
		handle.wait_for(Duration::from_millis(50)).await.unwrap(),
		WaitOutcome::TimedOut
	);
	assert!(!handle.is_finished());

	done_tx.send(()).unwrap();

	assert_eq!(
		handle.wait_until(Deadline::after(Duration::from_secs(10)))
			.await
			.unwrap(),
		WaitOutcome::Finished
	);
	assert_eq!(handle.get().await.unwrap(), 42);

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fan_out_wakes_every_waiter() {
	let processor = default_processor();

	for waiters in [2_usize, 10, 100] {
		let (done_tx, done_rx) = oneshot::channel::<()>();

		let shared = processor.dispatch_shared(|| async move {
			done_rx.await.ok();
			42
		});

		assert_eq!(shared.wait_mode(), WaitMode::MultipleWaiters);

		let waiting = (0..waiters)
			.map(|_| {
				let shared = shared.clone();

				tokio::spawn(async move {
					shared.wait().await.unwrap();
					shared.get().await.unwrap()
				})
			})
			.collect::<Vec<_>>();

		// Let the waiters park before the terminal transition.
		tokio::time::sleep(Duration::from_millis(50)).await;
		done_tx.send(()).unwrap();

		for waiter in waiting {
			assert_eq!(waiter.await.unwrap(), 42);
		}
	}

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_task_stores_a_cancellation_failure() {
	let processor = default_processor();

	let handle: TaskHandle<()> = processor.dispatch(|| async {
		loop {
			current_task::yield_now().await;
		}
	});

	handle.request_cancel();

	let result = tokio::task::spawn_blocking(move || handle.blocking_get())
		.await
		.unwrap();

	assert!(matches!(
		result,
		Err(TaskError::Cancelled(CancellationReason::UserRequest))
	));

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_after_shutdown_is_rejected_synchronously() {
	let processor = default_processor();

	processor.shutdown().await;

	let mut handle = processor.dispatch(|| async { 1 });

	assert_eq!(handle.state(), TaskState::Cancelled);
	assert_eq!(
		handle.cancellation_reason(),
		Some(CancellationReason::Shutdown)
	);

	// Completes immediately, no blocking.
	assert!(matches!(
		handle.get().await,
		Err(TaskError::Cancelled(CancellationReason::Shutdown))
	));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overload_rejects_normal_but_admits_critical() {
	let processor = small_processor(1, 1);
	let (release, mut occupier) = occupy_worker(&processor);

	// Fills the single admission slot while the only worker is busy.
	let mut queued = processor.dispatch(|| async { "queued" });

	let mut rejected = processor.dispatch(|| async { "rejected" });
	assert_eq!(rejected.state(), TaskState::Cancelled);
	assert_eq!(
		rejected.cancellation_reason(),
		Some(CancellationReason::Overload)
	);

	// Critical tasks bypass the admission bound.
	let mut critical =
		processor.dispatch_with(TaskOptions::new().critical(), || async { "critical" });

	release.store(true, Ordering::Release);
	occupier.get().await.unwrap();

	assert_eq!(queued.get().await.unwrap(), "queued");
	assert_eq!(critical.get().await.unwrap(), "critical");
	assert!(matches!(
		rejected.get().await,
		Err(TaskError::Cancelled(CancellationReason::Overload))
	));

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn task_deadline_expiry_cancels_with_deadline_reason() {
	let processor = default_processor();

	let mut handle = processor.dispatch_with(
		TaskOptions::new().with_deadline(Deadline::after(Duration::from_millis(50))),
		|| async {
			current_task::sleep_for(Duration::from_secs(30)).await.ok();
		},
	);

	assert!(matches!(
		handle.get().await,
		Err(TaskError::Cancelled(CancellationReason::Deadline))
	));

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn blocker_scope_shields_a_critical_section() {
	let processor = default_processor();

	let section_entered = Arc::new(AtomicBool::new(false));
	let section_finished = Arc::new(AtomicBool::new(false));

	let mut handle: TaskHandle<()> = processor.dispatch({
		let section_entered = Arc::clone(&section_entered);
		let section_finished = Arc::clone(&section_finished);

		|| async move {
			let shield = CancellationBlocker::new();
			section_entered.store(true, Ordering::Release);

			current_task::sleep_for(Duration::from_millis(100))
				.await
				.unwrap();
			section_finished.store(true, Ordering::Release);

			drop(shield);

			loop {
				current_task::yield_now().await;
			}
		}
	});

	while !section_entered.load(Ordering::Acquire) {
		tokio::time::sleep(Duration::from_millis(1)).await;
	}

	// Lands while the blocker is alive; delivered only after it drops.
	handle.request_cancel();

	assert!(matches!(
		handle.get().await,
		Err(TaskError::Cancelled(CancellationReason::UserRequest))
	));
	assert!(section_finished.load(Ordering::Acquire));

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_entered_with_pending_cancellation_is_interrupted() {
	let processor = default_processor();

	let (never_tx, never_rx) = oneshot::channel::<()>();

	let target = processor.dispatch_shared(|| async move {
		never_rx.await.ok();
	});

	let observer_started = Arc::new(AtomicBool::new(false));

	let mut observer = processor.dispatch({
		let target = target.clone();
		let observer_started = Arc::clone(&observer_started);

		|| async move {
			observer_started.store(true, Ordering::Release);

			while !current_task::is_cancellation_requested() {
				std::thread::yield_now();
			}

			// Entered with a pending cancellation: fails fast, recoverably.
			let interrupted = target.wait().await.is_err();

			// Running to completion despite the pending cancellation still
			// completes.
			interrupted
		}
	});

	// Cancelling before the observer starts would kill it at dequeue.
	while !observer_started.load(Ordering::Acquire) {
		tokio::time::sleep(Duration::from_millis(1)).await;
	}

	observer.request_cancel();

	assert_eq!(observer.get().await.unwrap(), true);

	drop(never_tx);
	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_get_leaves_the_handle_retryable() {
	let processor = default_processor();

	let (done_tx, done_rx) = oneshot::channel::<()>();

	let target = processor.dispatch(|| async move {
		done_rx.await.ok();
		7
	});

	let retrier_started = Arc::new(AtomicBool::new(false));

	let mut retrier = processor.dispatch({
		let retrier_started = Arc::clone(&retrier_started);
		let mut target = target;

		|| async move {
			retrier_started.store(true, Ordering::Release);

			while !current_task::is_cancellation_requested() {
				std::thread::yield_now();
			}

			// An interrupted extraction must not lose the target's result.
			let interrupted = matches!(target.get().await, Err(TaskError::Interrupted(_)));
			assert!(target.is_valid());

			// Shielded, the retry rides out the pending cancellation.
			let _shield = CancellationBlocker::new();
			let value = target.get().await.unwrap();

			(interrupted, value)
		}
	});

	while !retrier_started.load(Ordering::Acquire) {
		tokio::time::sleep(Duration::from_millis(1)).await;
	}

	retrier.request_cancel();
	done_tx.send(()).unwrap();

	assert_eq!(retrier.get().await.unwrap(), (true, 7));

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_cancel_leaves_the_target_terminal() {
	let processor = default_processor();

	let handle: TaskHandle<()> = processor.dispatch(|| async {
		current_task::sleep_until(Deadline::unreachable()).await.ok();
	});

	handle.sync_cancel().await;

	assert!(handle.is_finished());
	assert_eq!(handle.state(), TaskState::Cancelled);

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn task_sync_cancelling_itself_returns_without_deadlock() {
	let processor = default_processor();

	let (handle_tx, handle_rx) = oneshot::channel::<SharedTaskHandle<()>>();

	let shared: SharedTaskHandle<()> = processor.dispatch_shared(|| async move {
		let own_handle = handle_rx.await.expect("own handle must arrive");

		// Short-circuits after the request instead of waiting on itself.
		own_handle.sync_cancel().await;

		assert!(current_task::is_cancellation_requested());

		loop {
			current_task::yield_now().await;
		}
	});

	handle_tx.send(shared.clone()).unwrap();

	shared.wait().await.unwrap();
	assert_eq!(shared.state(), TaskState::Cancelled);
	assert_eq!(
		shared.cancellation_reason(),
		Some(CancellationReason::UserRequest)
	);

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn detached_task_runs_to_completion_under_its_token() {
	let processor = default_processor();

	let (done_tx, done_rx) = oneshot::channel::<()>();
	let ran = Arc::new(AtomicBool::new(false));

	let handle = processor.dispatch({
		let ran = Arc::clone(&ran);

		|| async move {
			done_rx.await.ok();
			ran.store(true, Ordering::Release);
		}
	});

	let token = handle.detach();
	assert!(!token.is_finished());

	done_tx.send(()).unwrap();

	while !token.is_finished() {
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	assert!(ran.load(Ordering::Acquire));
	assert_eq!(token.cancellation_reason(), None);

	// A detached task is still cancellable through its token.
	let endless: TaskHandle<()> = processor.dispatch(|| async {
		loop {
			current_task::yield_now().await;
		}
	});

	let token = endless.detach();
	token.request_cancel();

	while !token.is_finished() {
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	assert_eq!(
		token.cancellation_reason(),
		Some(CancellationReason::UserRequest)
	);

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tasks_wait_on_each_other_across_workers() {
	let processor = default_processor();

	let mut inner = processor.dispatch(|| async {
		current_task::sleep_for(Duration::from_millis(50)).await.ok();
		7
	});

	let mut outer = processor.dispatch(|| async move { inner.get().await.unwrap() * 6 });

	assert_eq!(outer.get().await.unwrap(), 42);

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn payload_panic_is_captured_and_reraised_at_extraction() {
	let processor = default_processor();

	let mut handle: TaskHandle<()> = processor.dispatch(|| async {
		panic!("boom");
	});

	handle.wait().await.unwrap();
	assert_eq!(handle.state(), TaskState::Completed);

	match handle.get().await {
		Err(TaskError::Panicked(message)) => assert!(message.contains("boom")),
		other => panic!("expected a captured panic, got {other:?}"),
	}

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn current_task_introspection_matches_processor_config() {
	let config = Config {
		name: "introspection".to_owned(),
		stack_size: 512 * 1024,
		..Config::default()
	};
	let stack_size = config.stack_size;
	let processor = Processor::new(config);

	assert!(!current_task::is_engine_task());

	let mut handle = processor.dispatch(move || async move {
		assert!(current_task::is_engine_task());
		assert_eq!(current_task::stack_size(), stack_size);
		assert!(!current_task::is_cancellation_requested());

		// Collaborators dispatch nested work through their own processor.
		let mut nested = current_task::dispatcher().dispatch(|| async { 2 + 2 });

		(current_task::task_id(), nested.get().await.unwrap())
	});

	let task_id = handle.id();
	let (reported_id, nested_result) = handle.get().await.unwrap();

	assert_eq!(reported_id, task_id);
	assert_eq!(nested_result, 4);

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_handle_clones_results_for_every_party() {
	let processor = default_processor();

	let shared = processor.dispatch_shared(|| async { "shared".to_owned() });
	let other = shared.clone();

	(
		async {
			assert_eq!(shared.get().await.unwrap(), "shared");
			assert_eq!(shared.get().await.unwrap(), "shared");
		},
		async {
			assert_eq!(other.get().await.unwrap(), "shared");
		},
	)
		.join()
		.await;

	processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_handle_answers_validity_and_state_only() {
	let processor = default_processor();

	let handle = processor.dispatch(|| async { 1 });
	assert!(handle.is_valid());

	let importance_default = Importance::default();
	assert_eq!(importance_default, Importance::Normal);

	let _token = handle.detach();

	let invalid: TaskHandle<u32> = TaskHandle::default();
	assert!(!invalid.is_valid());
	assert_eq!(invalid.state(), TaskState::Invalid);

	processor.shutdown().await;
}
