// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock compute backend for testing.
//!
//! An in-memory cluster that accepts submissions, keeps job states and pushes
//! events, without any network. A [`MockBackend`] is shared by every client a
//! [`MockClientFactory`] creates, so tests can change the cluster under the
//! clients' feet (disconnect it, restart its scheduler, finish jobs).

use async_trait::async_trait;
use serde_json::{Map, Value};
use simcore_comp_core::{ClusterId, Result, RunningState, SchedulerError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

use super::events::spawn_event_consumer;
use super::traits::*;
use super::utils::{check_before_submit, generate_job_id, node_requirements_to_resources};

/// A job known to the mock backend.
#[derive(Debug, Clone)]
pub struct MockJob {
    /// Submitted task.
    pub task: TaskDefinition,
    /// Current state.
    pub state: RunningState,
    /// Outputs once the job succeeded.
    pub outputs: Map<String, Value>,
    /// Error text once the job failed.
    pub error: Option<String>,
    /// Whether the result was released.
    pub released: bool,
}

struct BackendState {
    jobs: HashMap<String, MockJob>,
    scheduler_id: String,
    connected: bool,
    status: SchedulerStatus,
    workers: BTreeMap<String, WorkerInfo>,
    subscribers: HashMap<usize, mpsc::Sender<TaskEvent>>,
    next_subscriber: usize,
}

/// Shared state of a simulated cluster.
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// A running cluster with one worker of 4 CPUs and 16 GiB RAM.
    pub fn new() -> Self {
        let worker = WorkerInfo {
            id: "tcp://mock-worker-1:8786".to_string(),
            resources: BTreeMap::from([
                ("CPU".to_string(), 4.0),
                ("RAM".to_string(), 16.0 * 1024.0 * 1024.0 * 1024.0),
            ]),
        };
        Self {
            state: Arc::new(Mutex::new(BackendState {
                jobs: HashMap::new(),
                scheduler_id: "mock-scheduler-1".to_string(),
                connected: true,
                status: SchedulerStatus::Running,
                workers: BTreeMap::from([(worker.id.clone(), worker)]),
                subscribers: HashMap::new(),
                next_subscriber: 0,
            })),
        }
    }

    /// Simulate the cluster going away or coming back.
    pub async fn set_connected(&self, connected: bool) {
        self.state.lock().await.connected = connected;
    }

    /// Simulate a scheduler restart.
    pub async fn change_scheduler_id(&self, scheduler_id: &str) {
        self.state.lock().await.scheduler_id = scheduler_id.to_string();
    }

    /// Set the scheduler status.
    pub async fn set_status(&self, status: SchedulerStatus) {
        self.state.lock().await.status = status;
    }

    /// Replace the workers of the cluster.
    pub async fn set_workers(&self, workers: Vec<WorkerInfo>) {
        self.state.lock().await.workers =
            workers.into_iter().map(|w| (w.id.clone(), w)).collect();
    }

    /// Current scheduler snapshot.
    pub async fn scheduler_info(&self) -> SchedulerInfo {
        let state = self.state.lock().await;
        SchedulerInfo {
            scheduler_id: state.scheduler_id.clone(),
            status: state.status,
            workers: state.workers.clone(),
        }
    }

    /// A job by id.
    pub async fn job(&self, job_id: &str) -> Option<MockJob> {
        self.state.lock().await.jobs.get(job_id).cloned()
    }

    /// Ids of all submitted jobs.
    pub async fn job_ids(&self) -> Vec<String> {
        self.state.lock().await.jobs.keys().cloned().collect()
    }

    /// Move a job to `state` and notify subscribers.
    pub async fn set_job_state(&self, job_id: &str, state: RunningState, msg: Option<String>) {
        let mut backend = self.state.lock().await;
        if let Some(job) = backend.jobs.get_mut(job_id) {
            job.state = state;
            if state == RunningState::Failed {
                job.error = msg.clone();
            }
        }
        Self::broadcast(
            &mut backend,
            TaskEvent::State(TaskStateEvent {
                job_id: job_id.to_string(),
                state,
                msg,
            }),
        );
    }

    /// Finish a job successfully with `outputs`.
    pub async fn complete_job(&self, job_id: &str, outputs: Map<String, Value>) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(job_id) {
            job.outputs = outputs;
        }
        self.set_job_state(job_id, RunningState::Success, None).await;
    }

    /// Finish a job with an error.
    pub async fn fail_job(&self, job_id: &str, error: &str) {
        self.set_job_state(job_id, RunningState::Failed, Some(error.to_string()))
            .await;
    }

    /// Push an arbitrary event to every subscribed client.
    pub async fn push_event(&self, event: TaskEvent) {
        Self::broadcast(&mut *self.state.lock().await, event);
    }

    // Runs under the state lock: a subscriber with a full queue loses the event.
    fn broadcast(state: &mut BackendState, event: TaskEvent) {
        state
            .subscribers
            .retain(|key, tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(event)) => {
                    warn!(
                        subscriber = key,
                        job_id = %event.job_id(),
                        "Task event queue is full, dropping event"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }

    async fn subscribe(&self, tx: mpsc::Sender<TaskEvent>) -> usize {
        let mut state = self.state.lock().await;
        let key = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(key, tx);
        key
    }

    async fn unsubscribe(&self, key: usize) {
        self.state.lock().await.subscribers.remove(&key);
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.state.lock().await.connected {
            Ok(())
        } else {
            Err(SchedulerError::ComputationalBackendNotConnected {
                msg: "mock cluster is disconnected".to_string(),
            })
        }
    }
}

/// Compute client over a [`MockBackend`].
pub struct MockComputeClient {
    cluster_id: ClusterId,
    file_link_type: FileLinkType,
    backend: MockBackend,
    scheduler_id: String,
    check_resources: bool,
    subscription: Option<usize>,
    closed: AtomicBool,
}

impl MockComputeClient {
    /// Whether [`ComputeClient::delete`] was called.
    pub fn is_deleted(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn ensure_open(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(SchedulerError::ComputationalBackendNotConnected {
                msg: format!("client of cluster {} was deleted", self.cluster_id),
            });
        }
        self.backend.ensure_connected().await
    }
}

#[async_trait]
impl ComputeClient for MockComputeClient {
    fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    fn file_link_type(&self) -> FileLinkType {
        self.file_link_type
    }

    fn client_type(&self) -> &'static str {
        "mock"
    }

    async fn submit(&self, cluster_id: ClusterId, task: &TaskDefinition) -> Result<String> {
        self.ensure_open().await?;
        let resources = task
            .image
            .node_requirements
            .as_ref()
            .map(node_requirements_to_resources)
            .unwrap_or_default();
        let info = self.backend.scheduler_info().await;
        check_before_submit(
            &self.scheduler_id,
            &info,
            cluster_id,
            task.node_id,
            &resources,
            self.check_resources,
        )?;

        let job_id = generate_job_id(
            &task.image.name,
            &task.image.tag,
            task.user_id,
            task.project_id,
            task.node_id,
        );
        self.backend.state.lock().await.jobs.insert(
            job_id.clone(),
            MockJob {
                task: task.clone(),
                state: RunningState::Pending,
                outputs: Map::new(),
                error: None,
                released: false,
            },
        );
        Ok(job_id)
    }

    async fn get_tasks_status(&self, job_ids: &[String]) -> Result<Vec<RunningState>> {
        self.ensure_open().await?;
        let state = self.backend.state.lock().await;
        Ok(job_ids
            .iter()
            .map(|id| {
                state
                    .jobs
                    .get(id)
                    .map(|j| j.state)
                    .unwrap_or(RunningState::Unknown)
            })
            .collect())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        self.ensure_open().await?;
        let known = self
            .backend
            .job(job_id)
            .await
            .map(|job| job.state.is_terminal());
        match known {
            None => {
                warn!(job_id, "Cancelling unknown job, ignoring");
                Ok(())
            }
            Some(true) => Ok(()),
            Some(false) => {
                self.backend
                    .set_job_state(job_id, RunningState::Aborted, None)
                    .await;
                Ok(())
            }
        }
    }

    async fn get_task_result(&self, job_id: &str) -> Result<Map<String, Value>> {
        self.ensure_open().await?;
        let Some(job) = self.backend.job(job_id).await.filter(|j| !j.released) else {
            return Err(SchedulerError::ComputationalBackendTaskNotFound {
                job_id: job_id.to_string(),
            });
        };
        match job.state {
            RunningState::Success => Ok(job.outputs),
            RunningState::Failed | RunningState::Aborted => Err(SchedulerError::Backend {
                details: job
                    .error
                    .unwrap_or_else(|| format!("job '{}' was {}", job_id, job.state)),
            }),
            _ => Err(SchedulerError::ComputationalBackendTaskResultsNotReady {
                job_id: job_id.to_string(),
            }),
        }
    }

    async fn release_task_result(&self, job_id: &str) -> Result<()> {
        self.ensure_open().await?;
        let mut state = self.backend.state.lock().await;
        match state.jobs.get_mut(job_id) {
            Some(job) if !job.released => {
                job.released = true;
                Ok(())
            }
            _ => Err(SchedulerError::ComputationalBackendTaskNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    fn dashboard_link(&self) -> Option<String> {
        Some(format!("http://mock-cluster-{}/status", self.cluster_id))
    }

    async fn scheduler_info(&self) -> Result<SchedulerInfo> {
        self.ensure_open().await?;
        Ok(self.backend.scheduler_info().await)
    }

    async fn status(&self) -> Result<SchedulerStatus> {
        Ok(self.scheduler_info().await?.status)
    }

    async fn delete(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(key) = self.subscription {
            self.backend.unsubscribe(key).await;
        }
        Ok(())
    }
}

/// Factory of [`MockComputeClient`]s sharing one [`MockBackend`].
pub struct MockClientFactory {
    backend: MockBackend,
    created: AtomicUsize,
    fail_creation: AtomicBool,
    clients: Mutex<Vec<Arc<MockComputeClient>>>,
    /// Delay applied to every creation.
    pub creation_delay: Duration,
}

impl Default for MockClientFactory {
    fn default() -> Self {
        Self::new(MockBackend::new())
    }
}

impl MockClientFactory {
    /// Create a factory over `backend`.
    pub fn new(backend: MockBackend) -> Self {
        Self {
            backend,
            created: AtomicUsize::new(0),
            fail_creation: AtomicBool::new(false),
            clients: Mutex::new(Vec::new()),
            creation_delay: Duration::ZERO,
        }
    }

    /// Delay every creation by `delay`.
    pub fn with_creation_delay(mut self, delay: Duration) -> Self {
        self.creation_delay = delay;
        self
    }

    /// Shared backend.
    pub fn backend(&self) -> &MockBackend {
        &self.backend
    }

    /// Number of creation attempts so far.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Make subsequent creations fail.
    pub fn set_fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Every client created so far, oldest first.
    pub async fn clients(&self) -> Vec<Arc<MockComputeClient>> {
        self.clients.lock().await.clone()
    }
}

#[async_trait]
impl ComputeClientFactory for MockClientFactory {
    async fn create(
        &self,
        cluster: &Cluster,
        file_link_type: FileLinkType,
        handlers: Option<TaskHandlers>,
    ) -> Result<Arc<dyn ComputeClient>> {
        if !self.creation_delay.is_zero() {
            tokio::time::sleep(self.creation_delay).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);

        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(SchedulerError::ComputationalBackendNotConnected {
                msg: format!("mock cluster {} refused the connection", cluster.id),
            });
        }
        self.backend.ensure_connected().await?;

        let subscription = match handlers {
            Some(handlers) => {
                let (tx, _consumer) = spawn_event_consumer(handlers);
                Some(self.backend.subscribe(tx).await)
            }
            None => None,
        };

        let client = Arc::new(MockComputeClient {
            cluster_id: cluster.id,
            file_link_type,
            backend: self.backend.clone(),
            scheduler_id: self.backend.scheduler_info().await.scheduler_id,
            check_resources: !cluster.authentication.is_gateway(),
            subscription,
            closed: AtomicBool::new(false),
        });
        self.clients.lock().await.push(client.clone());
        Ok(client)
    }
}
