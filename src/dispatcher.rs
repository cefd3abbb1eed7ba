// Copyright 2020 Joyent, Inc.

//! Worker pool for asynchronous and bounded-wait calls.
//!
//! Calls are blocking, so they run on the blocking pool of a tokio runtime
//! that is built the first time something is dispatched. Every task gets
//! its own thread; there is no queueing below `max_threads`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use slog::{debug, o, Logger};
use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_WORKER_THREADS: usize = 512;

pub(crate) struct Dispatcher {
    max_threads: usize,
    runtime: Mutex<Option<Runtime>>,
    shut_down: AtomicBool,
    log: Logger,
}

impl Dispatcher {
    pub(crate) fn new(max_threads: usize, log: &Logger) -> Dispatcher {
        Dispatcher {
            max_threads: max_threads.max(1),
            runtime: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            log: log.new(o!("component" => "dispatcher")),
        }
    }

    fn handle(&self) -> Result<Handle> {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::IllegalState("client is shut down"));
        }
        if let Some(rt) = runtime.as_ref() {
            return Ok(rt.handle().clone());
        }
        let rt = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.max_threads)
            .thread_name("binrpc-worker")
            .enable_time()
            .build()?;
        debug!(self.log, "started worker pool"; "max_threads" => self.max_threads);
        let handle = rt.handle().clone();
        *runtime = Some(rt);
        Ok(handle)
    }

    /// Runs `task` on a worker thread and returns right away.
    pub(crate) fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.handle()?;
        drop(handle.spawn_blocking(task));
        Ok(())
    }

    /// Runs `task` on a worker thread and waits at most `timeout` for it.
    /// On timeout `on_timeout` is called and the task is left to finish on
    /// its own; whatever it returns then is dropped.
    pub(crate) fn run_with_timeout<T, F, C>(
        &self,
        timeout: Duration,
        task: F,
        on_timeout: C,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(),
    {
        let handle = self.handle()?;
        let join = handle.spawn_blocking(task);
        match handle.block_on(tokio::time::timeout(timeout, join)) {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("worker task failed: {}", join_err),
            ))),
            Err(_) => {
                on_timeout();
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Stops the worker pool. Running tasks are not waited for; later
    /// dispatches fail.
    pub(crate) fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rt) = runtime {
            rt.shutdown_background();
            debug!(self.log, "stopped worker pool");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // The last reference may go away on a worker thread, where dropping
        // a runtime the blocking way would panic.
        if let Some(rt) = self
            .runtime
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            rt.shutdown_background();
        }
    }
}
