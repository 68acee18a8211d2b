// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serial executors for deferred per-member work.
//!
//! Member streams post flush requests to an [`Executor`] rather than
//! running them in the caller's context; the contract is FIFO,
//! single-threaded execution per executor instance. Any event loop or
//! thread pool with a serialising wrapper satisfies it.

use crossbeam::channel::{self, Sender};
use std::io;
use std::thread::{self, JoinHandle};

/// A task posted to an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Deferred-work contract: posted tasks run later, one at a time, in
/// posting order.
pub trait Executor: Send + Sync {
    fn post(&self, task: Task);
}

/// Executor that runs tasks immediately on the posting thread.
///
/// Trivially FIFO and serial; suited to tests and single-threaded
/// embeddings. Tasks posted from a task run nested.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn post(&self, task: Task) {
        task();
    }
}

/// Executor backed by one dedicated worker thread.
///
/// Dropping the executor closes the queue, lets the worker drain what was
/// already posted, and joins it.
pub struct ThreadExecutor {
    sender: Option<Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadExecutor {
    /// Spawn the worker thread.
    ///
    /// # Errors
    /// Propagates the OS error if the thread cannot be spawned.
    pub fn new() -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<Task>();
        let worker = thread::Builder::new()
            .name("spead-executor".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

impl Executor for ThreadExecutor {
    fn post(&self, task: Task) {
        if let Some(sender) = &self.sender {
            // Send fails only after drop has closed the channel.
            let _ = sender.send(task);
        }
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_inline_runs_immediately() {
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        InlineExecutor.post(Box::new(move || {
            *flag.lock().expect("flag lock") = true;
        }));
        assert!(*ran.lock().expect("flag lock"));
    }

    #[test]
    fn test_thread_executor_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let executor = ThreadExecutor::new().expect("spawn worker");
            for i in 0..100 {
                let order = Arc::clone(&order);
                executor.post(Box::new(move || {
                    order.lock().expect("order lock").push(i);
                }));
            }
            // Drop joins the worker after the queue drains.
        }
        let order = order.lock().expect("order lock");
        assert_eq!(*order, (0..100).collect::<Vec<_>>());
    }
}
