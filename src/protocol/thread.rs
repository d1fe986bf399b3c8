use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

use log::{debug, error};
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("all {0} workers are busy")]
    Full(usize),
    #[error("thread pool is shut down")]
    Closed,
}

/// Fixed set of workers, each running one job (a session) at a time.
///
/// Jobs are only accepted while a worker is free, so a queued job never
/// waits behind a long-lived session.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
    active: Arc<AtomicUsize>,
}

/// Decrements the active count when a job finishes, even by panicking.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(i, Arc::clone(&receiver)));
        }

        Self {
            workers,
            sender,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs accepted and not yet finished.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn execute<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = self.capacity();
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < size).then_some(n + 1)
            })
            .map_err(|_| PoolError::Full(size))?;

        let slot = Slot(Arc::clone(&self.active));
        let job: Job = Box::new(move || {
            let _slot = slot;
            f();
        });

        // The slot travels with the job; if sending fails it is dropped
        // here and the count is restored.
        self.sender
            .as_ref()
            .ok_or(PoolError::Closed)?
            .send(job)
            .map_err(|_| PoolError::Closed)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                error!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Self {
        let thread = thread::spawn(move || {
            loop {
                let msg = receiver
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recv();
                match msg {
                    Ok(job) => {
                        debug!("worker {id} handling a connection");
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("worker {id}: session panicked");
                        }
                    }
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc::channel, time::Duration};

    use super::*;

    #[test]
    fn runs_jobs() {
        let pool = ThreadPool::new(2);
        let (tx, rx) = channel();
        for i in 0..2 {
            let tx = tx.clone();
            pool.execute(move || tx.send(i).unwrap()).unwrap();
        }
        let mut got: Vec<i32> = rx.iter().take(2).collect();
        got.sort();
        assert_eq!(got, vec![0, 1]);
    }

    #[test]
    fn refuses_when_every_worker_is_busy() {
        let pool = ThreadPool::new(1);
        let (release, wait) = channel::<()>();
        pool.execute(move || {
            let _ = wait.recv();
        })
        .unwrap();

        assert_eq!(pool.execute(|| {}), Err(PoolError::Full(1)));
        assert_eq!(pool.active(), 1);

        release.send(()).unwrap();
        while pool.active() > 0 {
            thread::sleep(Duration::from_millis(5));
        }
        pool.execute(|| {}).unwrap();
    }

    #[test]
    fn panicking_job_frees_its_slot() {
        let pool = ThreadPool::new(1);
        pool.execute(|| panic!("session blew up")).unwrap();
        while pool.active() > 0 {
            thread::sleep(Duration::from_millis(5));
        }

        let (tx, rx) = channel();
        pool.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    #[should_panic]
    fn zero_workers() {
        ThreadPool::new(0);
    }
}
