//! Adaptive micro-batching.
//!
//! Callers push items into a bounded channel; a dedicated flusher drains it
//! and hands slices of up to `batch_size` items to a callback. A flush fires
//! when the buffer fills or when an adaptive timer elapses. The timer starts
//! at one millisecond and tightens toward the observed arrival rate: after a
//! tick that saw more than one batch worth of items, the interval is divided
//! by the number of batches observed, clamped to `[1 ns, 1 s]`.
//!
//! Dropping every sender is the only shutdown signal. The flusher drains the
//! remainder, flushes once more, and exits.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::trace;

const INITIAL_FLUSH_INTERVAL: Duration = Duration::from_millis(1);
const MIN_FLUSH_INTERVAL: Duration = Duration::from_nanos(1);
const MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Start a batcher task and return the channel feeding it.
///
/// `on_flush` is awaited on the flusher task with batches of 1..=`batch_size`
/// items; it is never called with an empty batch.
pub fn run<T, F, Fut>(batch_size: usize, on_flush: F) -> mpsc::Sender<T>
where
    T: Send + 'static,
    F: FnMut(Vec<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let capacity = batch_size.max(1);
    let (sender, receiver) = mpsc::channel(capacity);
    tokio::spawn(flush_loop(receiver, capacity, on_flush));
    sender
}

async fn flush_loop<T, F, Fut>(mut receiver: mpsc::Receiver<T>, batch_size: usize, mut on_flush: F)
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut flush_interval = INITIAL_FLUSH_INTERVAL;
    let mut buffer: Vec<T> = Vec::with_capacity(batch_size);
    let mut items_since_tick: usize = 0;
    let mut open = true;

    let timer = sleep(flush_interval);
    tokio::pin!(timer);

    while open {
        let mut flush = false;

        tokio::select! {
            received = receiver.recv() => match received {
                Some(item) => {
                    buffer.push(item);
                    items_since_tick += 1;
                    if buffer.len() >= batch_size {
                        flush = true;
                    }
                }
                None => {
                    // All senders dropped: flush the remainder and exit.
                    open = false;
                    flush = true;
                }
            },
            () = &mut timer => {
                if items_since_tick > 0 {
                    flush_interval = next_interval(flush_interval, items_since_tick, batch_size);
                    trace!(?flush_interval, items_since_tick, "adjusted flush interval");
                    items_since_tick = 0;
                    flush = true;
                }
                timer.as_mut().reset(Instant::now() + flush_interval);
            }
        }

        if flush && !buffer.is_empty() {
            let batch = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
            on_flush(batch).await;
            timer.as_mut().reset(Instant::now() + flush_interval);
        }
    }
}

/// Divide the interval by the number of batches seen since the last tick.
///
/// Fewer than one batch per tick snaps down to the floor; the result is
/// always within `[MIN_FLUSH_INTERVAL, MAX_FLUSH_INTERVAL]`.
fn next_interval(current: Duration, items: usize, batch_size: usize) -> Duration {
    let batches = items as f64 / batch_size as f64;
    if batches <= 1.0 {
        return MIN_FLUSH_INTERVAL;
    }

    let nanos = (current.as_nanos() as f64 / batches)
        .clamp(1.0, MAX_FLUSH_INTERVAL.as_nanos() as f64);
    Duration::from_nanos(nanos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn flushes_every_item() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let sender = run(10, move |batch: Vec<u64>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(batch.len(), Ordering::SeqCst);
            }
        });

        for value in 0..1000u64 {
            sender.send(value).await.unwrap();
        }
        drop(sender);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) < 1000 {
            assert!(tokio::time::Instant::now() < deadline, "batches never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1000);
    }

    #[tokio::test]
    async fn batches_never_exceed_batch_size() {
        let oversized = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let oversized_count = oversized.clone();
        let seen_count = seen.clone();

        let sender = run(8, move |batch: Vec<u64>| {
            let oversized_count = oversized_count.clone();
            let seen_count = seen_count.clone();
            async move {
                assert!(!batch.is_empty());
                if batch.len() > 8 {
                    oversized_count.fetch_add(1, Ordering::SeqCst);
                }
                seen_count.fetch_add(batch.len(), Ordering::SeqCst);
            }
        });

        for value in 0..64u64 {
            sender.send(value).await.unwrap();
        }
        drop(sender);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) < 64 {
            assert!(tokio::time::Instant::now() < deadline, "batches never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(oversized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timer_flushes_partial_batch() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        // Batch size large enough that the size trigger never fires.
        let sender = run(1000, move |batch: Vec<u64>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(batch.len(), Ordering::SeqCst);
            }
        });

        sender.send(7).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "timer never flushed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        drop(sender);
    }

    #[test]
    fn interval_tightens_under_load_and_stays_clamped() {
        // Ten batches observed in one tick divides the interval by ten.
        let next = next_interval(Duration::from_millis(1), 1000, 100);
        assert_eq!(next, Duration::from_micros(100));

        // At or below one batch per tick the interval snaps to the floor.
        assert_eq!(
            next_interval(Duration::from_millis(1), 50, 100),
            MIN_FLUSH_INTERVAL
        );

        // The ceiling holds no matter the inputs.
        assert!(next_interval(Duration::from_secs(5), 101, 100) <= MAX_FLUSH_INTERVAL);
    }
}
