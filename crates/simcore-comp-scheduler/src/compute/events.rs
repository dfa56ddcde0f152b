// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery of backend push events to the registered handlers.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{TaskEvent, TaskHandlers};

/// Events buffered per client before producers are slowed down.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Start a consumer task that forwards events to `handlers`.
///
/// Producers only wait when [`EVENT_QUEUE_CAPACITY`] events are queued. The
/// consumer stops once every sender is dropped.
pub fn spawn_event_consumer(handlers: TaskHandlers) -> (mpsc::Sender<TaskEvent>, JoinHandle<()>) {
    spawn_event_consumer_with_capacity(handlers, EVENT_QUEUE_CAPACITY)
}

/// [`spawn_event_consumer`] with an explicit queue size.
pub fn spawn_event_consumer_with_capacity(
    handlers: TaskHandlers,
    capacity: usize,
) -> (mpsc::Sender<TaskEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<TaskEvent>(capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let job_id = event.job_id().to_string();
            let result = match event {
                TaskEvent::State(e) => handlers.on_task_state(e).await,
                TaskEvent::Progress(e) => handlers.on_task_progress(e).await,
                TaskEvent::Log(e) => handlers.on_task_log(e).await,
            };
            if let Err(e) = result {
                warn!(job_id = %job_id, error = %e, "Task event handler failed");
            }
        }
        debug!("Task event consumer stopped");
    });

    (tx, handle)
}

/// Queue `event`, waiting for room when the consumer lags behind.
///
/// Returns `false` once the consumer has stopped.
pub async fn forward_event(tx: &mpsc::Sender<TaskEvent>, event: TaskEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            warn!(
                job_id = %event.job_id(),
                capacity = tx.max_capacity(),
                "Task event queue is full, waiting for handlers"
            );
            tx.send(event).await.is_ok()
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{TaskEventHandler, TaskLogEvent, TaskProgressEvent, TaskStateEvent};
    use async_trait::async_trait;
    use simcore_comp_core::{Result, RunningState, SchedulerError};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskEventHandler for Collecting {
        async fn on_task_state(&self, event: TaskStateEvent) -> Result<()> {
            self.seen.lock().await.push(format!("state:{}", event.state));
            Err(SchedulerError::Backend {
                details: "handler failure must not stop the consumer".to_string(),
            })
        }

        async fn on_task_progress(&self, event: TaskProgressEvent) -> Result<()> {
            self.seen.lock().await.push(format!("progress:{}", event.progress));
            Ok(())
        }

        async fn on_task_log(&self, event: TaskLogEvent) -> Result<()> {
            self.seen.lock().await.push(format!("log:{}", event.log));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let handler = Arc::new(Collecting::default());
        let (tx, consumer) = spawn_event_consumer(handler.clone());

        tx.send(TaskEvent::State(TaskStateEvent {
            job_id: "job".to_string(),
            state: RunningState::Started,
            msg: None,
        }))
        .await
        .unwrap();
        tx.send(TaskEvent::Progress(TaskProgressEvent {
            job_id: "job".to_string(),
            progress: 0.5,
        }))
        .await
        .unwrap();
        tx.send(TaskEvent::Log(TaskLogEvent {
            job_id: "job".to_string(),
            log: "hello".to_string(),
            log_level: 20,
        }))
        .await
        .unwrap();
        drop(tx);
        consumer.await.unwrap();

        let seen = handler.seen.lock().await;
        assert_eq!(
            *seen,
            vec![
                "state:STARTED".to_string(),
                "progress:0.5".to_string(),
                "log:hello".to_string()
            ]
        );
    }

    struct Slow {
        seen: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl TaskEventHandler for Slow {
        async fn on_task_state(&self, _event: TaskStateEvent) -> Result<()> {
            Ok(())
        }

        async fn on_task_progress(&self, event: TaskProgressEvent) -> Result<()> {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.seen.lock().await.push(event.progress);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_queue_waits_instead_of_growing() {
        let handler = Arc::new(Slow {
            seen: Mutex::new(Vec::new()),
        });
        let (tx, consumer) = spawn_event_consumer_with_capacity(handler.clone(), 1);

        for i in 0..10 {
            let event = TaskEvent::Progress(TaskProgressEvent {
                job_id: "job".to_string(),
                progress: f64::from(i) / 10.0,
            });
            assert!(forward_event(&tx, event).await);
            assert!(tx.max_capacity() - tx.capacity() <= 1);
        }
        drop(tx);
        consumer.await.unwrap();

        let seen = handler.seen.lock().await;
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_forward_after_consumer_stopped() {
        let handler = Arc::new(Collecting::default());
        let (tx, consumer) = spawn_event_consumer(handler);
        consumer.abort();
        let _ = consumer.await;

        let event = TaskEvent::Progress(TaskProgressEvent {
            job_id: "job".to_string(),
            progress: 0.1,
        });
        assert!(!forward_event(&tx, event).await);
    }
}
