//! Bounded fan-out over scoped threads.
//!
//! Every item gets its own scoped thread, and a [`Semaphore`] admits at most
//! `max_workers` of them into `task` at once.

use std::thread;

use anyhow::{Result, anyhow};
use futures::executor::block_on;
use tokio::sync::Semaphore;

/// Run `task` over `items` with at most `max_workers` running at once.
///
/// Results come back in input order regardless of completion order. The
/// task receives each item's zero-based index.
pub fn run_bounded<T, R, F>(items: Vec<T>, max_workers: usize, task: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> R + Sync,
{
    let total = items.len();
    let workers = max_workers.clamp(1, total.max(1));
    if workers == 1 {
        return Ok(items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| task(idx, item))
            .collect());
    }

    let admission = Semaphore::new(workers);
    thread::scope(|scope| {
        let handles: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| {
                let admission = &admission;
                let task = &task;
                scope.spawn(move || -> Result<R> {
                    // Held until the task returns.
                    let _permit = block_on(admission.acquire())
                        .map_err(|_| anyhow!("admission semaphore closed"))?;
                    Ok(task(idx, item))
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(idx, handle)| {
                handle
                    .join()
                    .map_err(|_| anyhow!("pooled task {idx} panicked"))?
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn preserves_input_order() {
        let out = run_bounded((0..8u64).collect(), 3, |idx, value| {
            thread::sleep(Duration::from_millis(8 - value));
            (idx, value * 10)
        })
        .expect("run");
        assert_eq!(out, (0..8).map(|v| (v as usize, v * 10)).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_max_workers() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        run_bounded((0..12).collect::<Vec<u32>>(), 2, |_, _| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
        })
        .expect("run");
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn zero_workers_runs_sequentially() {
        let out = run_bounded(vec![1, 2, 3], 0, |_, v| v * 2).expect("run");
        assert_eq!(out, vec![2, 4, 6]);
    }

    #[test]
    fn empty_input_is_empty_output() {
        let out: Vec<u8> = run_bounded(Vec::<u8>::new(), 4, |_, v| v).expect("run");
        assert!(out.is_empty());
    }

    #[test]
    fn panicking_task_is_an_error() {
        let result = run_bounded(vec![0, 1, 2], 2, |_, v: u32| {
            assert_ne!(v, 1, "boom");
            v
        });
        let err = result.expect_err("panic surfaces");
        assert!(err.to_string().contains("pooled task 1 panicked"));
    }
}
