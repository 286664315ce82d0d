//! Worker-loop helper shared by every topic consumer. Generalizes the
//! teacher's `sync_loop` (poll on an interval, exponential backoff with
//! jitter on failure, atomic counters) from a peer-to-peer sync cycle to a
//! generic message handler.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Counters tracked per consumer loop, exposed through the metrics registry.
#[derive(Default)]
pub struct ConsumerMetrics {
	pub messages_processed: AtomicU64,
	pub messages_failed: AtomicU64,
	pub reconnections: AtomicU64,
}

impl ConsumerMetrics {
	pub fn to_prometheus_text(&self, topic: &str) -> String {
		format!(
			"bus_consumer_messages_processed_total{{topic=\"{topic}\"}} {}\n\
			 bus_consumer_messages_failed_total{{topic=\"{topic}\"}} {}\n\
			 bus_consumer_reconnections_total{{topic=\"{topic}\"}} {}\n",
			self.messages_processed.load(Ordering::Relaxed),
			self.messages_failed.load(Ordering::Relaxed),
			self.reconnections.load(Ordering::Relaxed),
		)
	}
}

/// Poll `poll_fn` for a batch of raw messages, push them onto a bounded
/// in-process channel, and let a pool of `pool_size` worker tasks drain it
/// concurrently (SPEC_FULL.md §4.8). `handle` is responsible for committing
/// its own message's offset only after its downstream transaction commits
/// (SPEC_FULL.md §5 "At-least-once processing"); a handler error here only
/// updates metrics; it does not retry the individual message, since the
/// message stays uncommitted on the broker and will be redelivered on the
/// next poll. Transient failures in `poll_fn` itself retry with jittered
/// exponential backoff, matching the teacher's `sync_loop` shape. The poll
/// loop backpressures on a full channel rather than growing it unboundedly.
pub async fn run_consumer_loop<M, PollFut, HandleFut>(
	topic: &str,
	metrics: Arc<ConsumerMetrics>,
	mut poll_fn: impl FnMut() -> PollFut,
	handle: impl Fn(M) -> HandleFut + Send + Sync + 'static,
	pool_size: usize,
	channel_capacity: usize,
	shutdown: tokio::sync::watch::Receiver<bool>,
) where
	M: Send + 'static,
	PollFut: Future<Output = anyhow::Result<Vec<M>>>,
	HandleFut: Future<Output = anyhow::Result<()>> + Send,
{
	let handle = Arc::new(handle);
	let (tx, rx) = tokio::sync::mpsc::channel::<M>(channel_capacity.max(1));
	let rx = Arc::new(Mutex::new(rx));

	let mut workers = Vec::with_capacity(pool_size.max(1));
	for _ in 0..pool_size.max(1) {
		let rx = rx.clone();
		let handle = handle.clone();
		let metrics = metrics.clone();
		let topic = topic.to_string();
		workers.push(tokio::spawn(async move {
			loop {
				let message = rx.lock().await.recv().await;
				let Some(message) = message else {
					return;
				};
				match handle(message).await {
					Ok(()) => {
						metrics.messages_processed.fetch_add(1, Ordering::Relaxed);
					}
					Err(e) => {
						metrics.messages_failed.fetch_add(1, Ordering::Relaxed);
						warn!(topic, error = %e, "message handler failed; offset not committed");
					}
				}
			}
		}));
	}

	let mut shutdown = shutdown;
	let mut backoff = Duration::from_secs(1);

	loop {
		if *shutdown.borrow() {
			debug!(topic, "consumer loop shutting down");
			break;
		}

		tokio::select! {
			_ = shutdown.changed() => continue,
			batch = poll_fn() => {
				match batch {
					Ok(messages) => {
						backoff = Duration::from_secs(1);
						for message in messages {
							if tx.send(message).await.is_err() {
								break;
							}
						}
					}
					Err(e) => {
						error!(topic, error = %e, "poll failed, backing off");
						metrics.reconnections.fetch_add(1, Ordering::Relaxed);
						let jitter_ms = (std::time::SystemTime::now()
							.duration_since(std::time::UNIX_EPOCH)
							.unwrap()
							.as_millis()
							% 1000) as u64;
						sleep(backoff + Duration::from_millis(jitter_ms)).await;
						backoff = (backoff * 2).min(Duration::from_secs(30));
					}
				}
			}
		}
	}

	drop(tx);
	for worker in workers {
		let _ = worker.await;
	}
}
