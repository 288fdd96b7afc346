//! Bounded parallel fan-out
//!
//! Workers are long-running threads draining a shared input channel
//! until it closes; the scope join is the single termination barrier.
//! Output order is unspecified, which is fine for a content-addressed
//! store where blob writes commute.

use crossbeam_channel::unbounded;
use std::thread;

/// Default worker count: the CPU count, minus roughly a third on
/// machines with more than three cores to leave headroom for the
/// cipher-stream producer threads.
pub fn default_parallelism() -> usize {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    if cpus > 3 {
        cpus - cpus / 3
    } else {
        cpus
    }
}

/// Run `job` over `items` on up to `parallelism` threads, returning the
/// outputs in completion order.
pub fn map_unordered<I, O, F>(parallelism: usize, items: Vec<I>, job: F) -> Vec<O>
where
    I: Send,
    O: Send,
    F: Fn(I) -> O + Sync,
{
    let count = items.len();
    let workers = parallelism.max(1).min(count.max(1));

    // Enqueue everything up front and close the channel; workers exit
    // when the queue drains.
    let (in_tx, in_rx) = unbounded::<I>();
    for item in items {
        let _ = in_tx.send(item);
    }
    drop(in_tx);

    let (out_tx, out_rx) = unbounded::<O>();
    thread::scope(|s| {
        for _ in 0..workers {
            let in_rx = in_rx.clone();
            let out_tx = out_tx.clone();
            let job = &job;
            s.spawn(move || {
                for item in in_rx.iter() {
                    if out_tx.send(job(item)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(out_tx);
        out_rx.iter().collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_all_items_processed() {
        let items: Vec<u64> = (0..100).collect();
        let mut out = map_unordered(4, items, |n| n * 2);
        out.sort_unstable();
        let expected: Vec<u64> = (0..100).map(|n| n * 2).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_empty_input() {
        let out: Vec<u64> = map_unordered(4, Vec::<u64>::new(), |n| n);
        assert!(out.is_empty());
    }

    #[test]
    fn test_zero_parallelism_clamped() {
        let out = map_unordered(0, vec![1, 2, 3], |n| n + 1);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_errors_pass_through_as_values() {
        let out: Vec<Result<u32, String>> =
            map_unordered(2, vec![1u32, 2, 3, 4], |n| {
                if n % 2 == 0 {
                    Err(format!("even: {n}"))
                } else {
                    Ok(n)
                }
            });
        assert_eq!(out.iter().filter(|r| r.is_err()).count(), 2);
        assert_eq!(out.iter().filter(|r| r.is_ok()).count(), 2);
    }

    #[test]
    fn test_runs_concurrently() {
        static PEAK: AtomicUsize = AtomicUsize::new(0);
        static ACTIVE: AtomicUsize = AtomicUsize::new(0);

        map_unordered(4, (0..16).collect(), |_| {
            let now = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
            PEAK.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(10));
            ACTIVE.fetch_sub(1, Ordering::SeqCst);
        });

        assert!(PEAK.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_default_parallelism_is_positive() {
        assert!(default_parallelism() >= 1);
    }
}
