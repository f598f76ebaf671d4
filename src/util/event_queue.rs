//! Bounded single-consumer event queue used by the scheduler

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use opentelemetry::{global, metrics::Counter, Context};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::time::now_msec;

const DROP_WARNING_INTERVAL: Duration = Duration::from_secs(60);

/// Receives every event posted to the queue it is registered on,
/// in posting order
pub trait EventListener<E>: Send + Sync {
	fn on_event(&self, event: &E);
}

enum QueueMessage<E> {
	Event(E),
	// Stop sentinel; the consumer exits when it dequeues it
	PoisonPill,
}

/// An asynchronous queue dispatching events to registered listeners from
/// a dedicated consumer task.
///
/// Lifecycle is created -> started -> stopped. Posting never blocks:
/// when the queue is full the event is counted as dropped and a
/// rate-limited warning is emitted; after `stop` events are silently
/// discarded.
pub struct AsyncEventQueue<E> {
	name: String,

	tx: mpsc::Sender<QueueMessage<E>>,
	receiver: Mutex<Option<mpsc::Receiver<QueueMessage<E>>>>,
	consumer: Mutex<Option<JoinHandle<()>>>,

	listeners: Arc<RwLock<Vec<Arc<dyn EventListener<E>>>>>,

	started: AtomicBool,
	stopped: AtomicBool,

	// Events posted but not yet dispatched to every listener
	event_count: Arc<AtomicI64>,
	empty_notify: Arc<Notify>,

	dropped_events: AtomicU64,
	dropped_at_last_report: AtomicU64,
	last_drop_report_msec: AtomicU64,
	logged_first_drop: AtomicBool,

	dropped_events_counter: Counter<u64>,
}

impl<E: Send + 'static> AsyncEventQueue<E> {
	pub fn new(name: &str, capacity: usize) -> Self {
		let (tx, rx) = mpsc::channel(capacity);

		let meter = global::meter("tempest_util/event_queue");
		let dropped_events_counter = meter
			.u64_counter("event_queue.dropped_events")
			.with_description("Number of events dropped because the queue was full")
			.init();

		Self {
			name: name.to_string(),
			tx,
			receiver: Mutex::new(Some(rx)),
			consumer: Mutex::new(None),
			listeners: Arc::new(RwLock::new(Vec::new())),
			started: AtomicBool::new(false),
			stopped: AtomicBool::new(false),
			event_count: Arc::new(AtomicI64::new(0)),
			empty_notify: Arc::new(Notify::new()),
			dropped_events: AtomicU64::new(0),
			dropped_at_last_report: AtomicU64::new(0),
			last_drop_report_msec: AtomicU64::new(0),
			logged_first_drop: AtomicBool::new(false),
			dropped_events_counter,
		}
	}

	pub fn add_listener(&self, listener: Arc<dyn EventListener<E>>) {
		self.listeners.write().unwrap().push(listener);
	}

	/// Spawn the consumer task. Events posted before `start` are
	/// dispatched once it runs.
	pub fn start(&self) -> Result<(), Error> {
		if self.started.swap(true, Ordering::SeqCst) {
			return Err(Error::Message(format!(
				"Event queue {} already started",
				self.name
			)));
		}

		let mut rx = self
			.receiver
			.lock()
			.unwrap()
			.take()
			.expect("receiver taken before start");
		let listeners = self.listeners.clone();
		let event_count = self.event_count.clone();
		let empty_notify = self.empty_notify.clone();
		let name = self.name.clone();

		let handle = tokio::spawn(async move {
			while let Some(message) = rx.recv().await {
				let event = match message {
					QueueMessage::Event(event) => event,
					QueueMessage::PoisonPill => break,
				};
				for listener in listeners.read().unwrap().iter() {
					if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
						error!("Listener on event queue {} panicked", name);
					}
				}
				if event_count.fetch_sub(1, Ordering::SeqCst) == 1 {
					empty_notify.notify_waiters();
				}
			}
		});
		*self.consumer.lock().unwrap() = Some(handle);

		Ok(())
	}

	/// Post an event without blocking. Returns whether it was enqueued.
	pub fn post(&self, event: E) -> bool {
		if self.stopped.load(Ordering::SeqCst) {
			return false;
		}

		self.event_count.fetch_add(1, Ordering::SeqCst);
		match self.tx.try_send(QueueMessage::Event(event)) {
			Ok(()) => true,
			Err(_) => {
				if self.event_count.fetch_sub(1, Ordering::SeqCst) == 1 {
					self.empty_notify.notify_waiters();
				}
				self.on_dropped_event();
				false
			}
		}
	}

	fn on_dropped_event(&self) {
		self.dropped_events.fetch_add(1, Ordering::SeqCst);
		self.dropped_events_counter.add(&Context::current(), 1, &[]);

		if !self.logged_first_drop.swap(true, Ordering::SeqCst) {
			error!(
				"Dropping event from queue {}. This likely means one of the listeners is too slow \
				 and cannot keep up with the rate at which events are being posted.",
				self.name
			);
			self.last_drop_report_msec.store(now_msec(), Ordering::SeqCst);
			return;
		}

		let last = self.last_drop_report_msec.load(Ordering::SeqCst);
		let now = now_msec();
		if now.saturating_sub(last) >= DROP_WARNING_INTERVAL.as_millis() as u64
			&& self
				.last_drop_report_msec
				.compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
				.is_ok()
		{
			let total = self.dropped_events.load(Ordering::SeqCst);
			let since = total - self.dropped_at_last_report.swap(total, Ordering::SeqCst);
			warn!(
				"Dropped {} events from queue {} since last report",
				since, self.name
			);
		}
	}

	/// Stop the consumer once the events already enqueued are dispatched.
	/// Duplicate stops are tolerated and do nothing.
	pub async fn stop(&self) -> Result<(), Error> {
		if !self.started.load(Ordering::SeqCst) {
			return Err(Error::Message(format!(
				"Event queue {} stopped before it started",
				self.name
			)));
		}
		if self.stopped.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		// The pill must reach the queue even if it is full
		if self.tx.send(QueueMessage::PoisonPill).await.is_err() {
			return Ok(());
		}

		let handle = self.consumer.lock().unwrap().take();
		if let Some(handle) = handle {
			handle.await?;
		}
		Ok(())
	}

	/// Wait until every posted event was dispatched, up to `timeout`
	pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		loop {
			let notified = self.empty_notify.notified();
			tokio::pin!(notified);
			// Register interest before checking, so a notification
			// arriving in between is not lost
			notified.as_mut().enable();
			if self.event_count.load(Ordering::SeqCst) <= 0 {
				return true;
			}
			match tokio::time::timeout(
				deadline.saturating_duration_since(Instant::now()),
				notified,
			)
			.await
			{
				Ok(()) => continue,
				Err(_) => return self.event_count.load(Ordering::SeqCst) <= 0,
			}
		}
	}

	pub fn dropped_events(&self) -> u64 {
		self.dropped_events.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Recorder {
		seen: Mutex<Vec<u32>>,
	}

	impl EventListener<u32> for Recorder {
		fn on_event(&self, event: &u32) {
			self.seen.lock().unwrap().push(*event);
		}
	}

	#[tokio::test]
	async fn test_fifo_delivery() {
		let queue = AsyncEventQueue::new("fifo", 100);
		let recorder = Arc::new(Recorder {
			seen: Mutex::new(Vec::new()),
		});
		queue.add_listener(recorder.clone());
		queue.start().unwrap();

		for i in 0..50u32 {
			assert!(queue.post(i));
		}
		assert!(queue.wait_until_empty(Duration::from_secs(5)).await);
		assert_eq!(*recorder.seen.lock().unwrap(), (0..50).collect::<Vec<_>>());

		queue.stop().await.unwrap();
	}

	#[tokio::test]
	async fn test_overflow_drops_and_counts() {
		// Post 5 events into a capacity-2 queue before the consumer starts
		let queue = AsyncEventQueue::new("overflow", 2);
		let recorder = Arc::new(Recorder {
			seen: Mutex::new(Vec::new()),
		});
		queue.add_listener(recorder.clone());

		let mut accepted = 0;
		for i in 0..5u32 {
			if queue.post(i) {
				accepted += 1;
			}
		}
		assert_eq!(accepted, 2);
		assert_eq!(queue.dropped_events(), 3);

		queue.start().unwrap();
		assert!(queue.wait_until_empty(Duration::from_secs(5)).await);
		assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1]);

		queue.stop().await.unwrap();
	}

	#[tokio::test]
	async fn test_stop_is_idempotent_and_discards_later_posts() {
		let queue = AsyncEventQueue::new("stop", 10);
		let recorder = Arc::new(Recorder {
			seen: Mutex::new(Vec::new()),
		});
		queue.add_listener(recorder.clone());
		queue.start().unwrap();

		assert!(queue.post(1));
		queue.stop().await.unwrap();
		queue.stop().await.unwrap();

		assert!(!queue.post(2));
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(*recorder.seen.lock().unwrap(), vec![1]);
	}

	#[tokio::test]
	async fn test_stop_before_start_is_an_error() {
		let queue: AsyncEventQueue<u32> = AsyncEventQueue::new("early", 10);
		assert!(queue.stop().await.is_err());
	}
}
