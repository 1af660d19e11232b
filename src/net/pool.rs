// CLASSIFICATION: COMMUNITY
// Filename: pool.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-27

//! Small blocking-I/O thread pool for outbound HTTP.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use log::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named threads draining one job channel. Threads are not
/// joined on drop: a blocked request must not stall the caller.
pub struct IoPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    size: usize,
}

impl IoPool {
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let size = size.max(1);
        for idx in 0..size {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || job_loop(rx))?;
        }
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Returns `false` once the pool is shut down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs. Threads exit once the queue drains.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn job_loop(rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap_or_else(|e| e.into_inner());
            rx.recv()
        };
        match job {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("network job panicked");
                }
            }
            Err(_) => break,
        }
    }
    debug!("{} exiting", thread::current().name().unwrap_or("io thread"));
}
