//! Sequential execution domain.
//!
//! A [`Strand`] owns a piece of state on a dedicated thread and executes
//! submitted tasks against it one at a time, in submission order, with no
//! overlap. Submission never blocks and may come from arbitrary concurrent
//! callers; this is the sole concurrency-safety mechanism for state the
//! strand owns — no per-field locking exists elsewhere.
//!
//! A task must not submit to its own strand and then wait for that
//! submission to complete: the nested task cannot run until the current one
//! returns.

use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use crate::trace::{debug, error};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

/// A single logical thread of control owning state `S`.
///
/// Dropping the strand finishes already-queued tasks, then joins the
/// worker thread.
pub struct Strand<S> {
    tx: Option<Sender<Task<S>>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> Strand<S> {
    /// Spawns the strand's worker thread, moving `state` onto it.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    #[must_use]
    pub fn spawn(name: &str, mut state: S) -> Self {
        let (tx, rx) = mpsc::channel::<Task<S>>();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                debug!("strand started");
                while let Ok(task) = rx.recv() {
                    task(&mut state);
                }
                debug!("strand exiting");
            })
            .expect("failed to spawn strand thread");

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Enqueues `task` for serialized execution. Never blocks.
    ///
    /// Tasks run in the order they were submitted, one at a time. A task
    /// submitted after the strand began shutting down is discarded.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let Some(tx) = &self.tx else { return };
        if tx.send(Box::new(task)).is_err() {
            error!("strand thread is gone, task discarded");
        }
    }
}

impl<S> Drop for Strand<S> {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tasks_run_in_submission_order() {
        let strand = Strand::spawn("test-strand", Vec::<usize>::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..100 {
            let log = Arc::clone(&log);
            strand.submit(move |state| {
                state.push(i);
                log.lock().unwrap().push(i);
            });
        }
        drop(strand); // joins after draining the queue

        let log = log.lock().unwrap();
        assert_eq!(*log, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_submitters_never_overlap() {
        // Each task increments a non-atomic counter; lost updates would
        // show up if two tasks ever ran concurrently.
        let strand = Arc::new(Strand::spawn("test-strand", 0u64));
        let done = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..8 {
            let strand = Arc::clone(&strand);
            let done = Arc::clone(&done);
            threads.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let done = Arc::clone(&done);
                    strand.submit(move |count| {
                        *count += 1;
                        done.fetch_add(1, Ordering::Relaxed);
                    });
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        let total = Arc::new(std::sync::Mutex::new(0u64));
        let total_out = Arc::clone(&total);
        strand.submit(move |count| {
            *total_out.lock().unwrap() = *count;
        });
        drop(Arc::try_unwrap(strand).ok().expect("sole owner"));

        assert_eq!(*total.lock().unwrap(), 8 * 1000);
        assert_eq!(done.load(Ordering::Relaxed), 8 * 1000);
    }

    #[test]
    fn drop_drains_pending_tasks() {
        let ran = Arc::new(AtomicUsize::new(0));
        let strand = Strand::spawn("test-strand", ());
        for _ in 0..50 {
            let ran = Arc::clone(&ran);
            strand.submit(move |()| {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }
        drop(strand);
        assert_eq!(ran.load(Ordering::Relaxed), 50);
    }
}
