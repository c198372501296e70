// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Thread- or task-local context for where a task's stdout/stderr writes should go. This service
//! is headless (no attached interactive console), so the only real `Destination` is `Logging`:
//! writes fall through to the `log` crate. The propagation mechanism itself (thread-local default,
//! task-local override threaded through `task_executor::Executor::spawn`) is what's load-bearing
//! here, not a particular sink.

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task_local;

#[derive(Debug)]
enum InnerDestination {
    Logging,
}

#[derive(Debug)]
pub struct Destination(Mutex<InnerDestination>);

impl Destination {
    fn new() -> Arc<Destination> {
        Arc::new(Destination(Mutex::new(InnerDestination::Logging)))
    }

    /// Write the given content to the current stdout destination.
    pub fn write_stdout(&self, content: &[u8]) {
        let InnerDestination::Logging = *self.0.lock();
        log::info!("stdout: {:?}", String::from_utf8_lossy(content));
    }

    /// Write the given content to the current stderr destination.
    pub fn write_stderr(&self, content: &[u8]) {
        let InnerDestination::Logging = *self.0.lock();
        log::info!("stderr: {:?}", String::from_utf8_lossy(content));
    }
}

thread_local! {
    /// See set_thread_destination.
    static THREAD_DESTINATION: RefCell<Arc<Destination>> = RefCell::new(Destination::new());
}

// Note: the behavior of this task_local! invocation can be affected by a `tokio_no_const_thread_local`
// cfg; without it this item triggers the `clippy::declare_interior_mutable_const` lint.
task_local! {
    static TASK_DESTINATION: Arc<Destination>;
}

/// Set the stdio Destination for the current Thread (which will propagate to spawned Tasks via
/// `scope_task_destination`).
pub fn set_thread_destination(destination: Arc<Destination>) {
    THREAD_DESTINATION.with(|thread_destination| {
        thread_destination.replace(destination);
    })
}

/// Propagate the current stdio Destination to a Future representing a newly spawned Task. Usage
/// of this method should mostly be contained to `task_executor::Executor`.
pub async fn scope_task_destination<F>(destination: Arc<Destination>, f: F) -> F::Output
where
    F: Future,
{
    TASK_DESTINATION.scope(destination, f).await
}

/// Get the current stdio Destination.
pub fn get_destination() -> Arc<Destination> {
    if let Ok(destination) = TASK_DESTINATION.try_with(|destination| destination.clone()) {
        destination
    } else {
        THREAD_DESTINATION.with(|destination| destination.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_logging_and_is_thread_local() {
        let destination = get_destination();
        destination.write_stdout(b"hello");

        let other = Destination::new();
        set_thread_destination(other.clone());
        assert!(Arc::ptr_eq(&get_destination(), &other));
    }
}
