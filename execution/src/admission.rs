// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Admission Queue (C2): bounds concurrent executions to `maxConcurrent`, in strict FIFO
//! order, with cooperative cancellation. Built directly on `tokio::sync::Semaphore`, whose waiter
//! list is already FIFO and whose acquire future is cancel-safe (dropping it removes the waiter
//! without disturbing anyone else) — exactly the two properties this queue needs, so there is no
//! reason to hand-roll one on top of it.

use std::sync::Arc;

use telemetry::{Counter, TelemetryRecorder};
use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::{PipelineError, RejectionKind};

/// The held right to run one job. Dropping it (including via panic unwind) releases the permit,
/// which is how lease-style "always released" guarantees compose with `?`-based early returns.
pub struct AdmissionTicket {
    _permit: tokio::sync::OwnedSemaphorePermit,
    telemetry: TelemetryRecorder,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.telemetry.dec_active();
    }
}

pub struct AdmissionQueue {
    semaphore: Arc<Semaphore>,
    telemetry: TelemetryRecorder,
    max_concurrent: usize,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize, telemetry: TelemetryRecorder) -> Self {
        AdmissionQueue {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            telemetry,
            max_concurrent,
        }
    }

    /// Waits for a slot, or returns `Err(Cancelled)` if `cancel` resolves first. `maxConcurrent =
    /// 0` is rejected immediately rather than parked, since a zero-permit semaphore would never
    /// wake its waiters.
    pub async fn admit(
        &self,
        cancel: impl std::future::Future<Output = ()>,
    ) -> Result<AdmissionTicket, PipelineError> {
        if self.max_concurrent == 0 {
            self.telemetry
                .increment_counter(Counter::AdmissionRejectedServiceUnavailable, 1);
            return Err(PipelineError::Rejected(RejectionKind::ServiceUnavailable));
        }

        self.telemetry.increment_counter(Counter::AdmissionEnqueued, 1);
        self.telemetry.inc_queued();

        let acquired = tokio::select! {
            biased;
            permit = self.semaphore.clone().acquire_owned() => Some(permit),
            _ = cancel => None,
        };

        self.telemetry.dec_queued();

        match acquired {
            Some(Ok(permit)) => {
                self.telemetry.increment_counter(Counter::AdmissionGranted, 1);
                self.telemetry.inc_active();
                Ok(AdmissionTicket {
                    _permit: permit,
                    telemetry: self.telemetry.clone(),
                })
            }
            Some(Err(_)) => unreachable!("semaphore is never closed"),
            None => {
                self.telemetry.increment_counter(Counter::AdmissionCancelled, 1);
                Err(PipelineError::Cancelled)
            }
        }
    }

    /// Non-blocking admit used only by tests asserting `I1` without needing a real waiter.
    pub fn try_admit(&self) -> Result<AdmissionTicket, PipelineError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.telemetry.increment_counter(Counter::AdmissionGranted, 1);
                self.telemetry.inc_active();
                Ok(AdmissionTicket {
                    _permit: permit,
                    telemetry: self.telemetry.clone(),
                })
            }
            Err(TryAcquireError::NoPermits) => Err(PipelineError::Infrastructure(
                "admission queue at capacity".to_string(),
            )),
            Err(TryAcquireError::Closed) => unreachable!("semaphore is never closed"),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn never() -> impl std::future::Future<Output = ()> {
        std::future::pending()
    }

    #[tokio::test]
    async fn zero_max_concurrent_rejects_immediately() {
        let queue = AdmissionQueue::new(0, TelemetryRecorder::new(10));
        let result = queue.admit(never()).await;
        assert!(matches!(
            result,
            Err(PipelineError::Rejected(RejectionKind::ServiceUnavailable))
        ));
    }

    #[tokio::test]
    async fn second_admit_blocks_until_first_is_released() {
        let queue = Arc::new(AdmissionQueue::new(1, TelemetryRecorder::new(10)));
        let ticket = queue.admit(never()).await.unwrap();
        assert_eq!(queue.available_permits(), 0);

        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move { queue2.admit(never()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(ticket);
        let second = waiter.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn cancel_future_unparks_waiter_without_granting() {
        let queue = AdmissionQueue::new(1, TelemetryRecorder::new(10));
        let _held = queue.admit(never()).await.unwrap();

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
        let cancel = async move {
            let _ = cancel_rx.await;
        };
        cancel_tx.send(()).unwrap();
        let result = queue.admit(cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_across_waiters() {
        let queue = Arc::new(AdmissionQueue::new(1, TelemetryRecorder::new(10)));
        let ticket = queue.admit(never()).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3u32 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                // Stagger spawn so waiters reliably enqueue in index order.
                tokio::time::sleep(Duration::from_millis(5 * i as u64)).await;
                let ticket = queue.admit(never()).await.unwrap();
                order.lock().push(i);
                ticket
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(ticket);

        let mut released = Vec::new();
        for handle in handles {
            let ticket = handle.await.unwrap();
            released.push(ticket);
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
