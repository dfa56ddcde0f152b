// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP cluster gateway client.
//!
//! Talks JSON to a cluster gateway:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | health | `GET /v1/health` |
//! | scheduler info | `GET /v1/info` |
//! | submit | `POST /v1/tasks` |
//! | batch status | `GET /v1/tasks/status?job_id=..` |
//! | cancel | `POST /v1/tasks/{job_id}/cancel` |
//! | result | `GET /v1/tasks/{job_id}/result` |
//! | release result | `DELETE /v1/tasks/{job_id}/result` |
//! | push events | `GET /v1/events?after={cursor}` |
//!
//! Push events are polled by a background task and forwarded to the
//! registered handlers through [`spawn_event_consumer`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use simcore_comp_core::models::Image;
use simcore_comp_core::{ClusterId, NodeId, ProjectId, Result, RunningState, SchedulerError, UserId};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::events::{forward_event, spawn_event_consumer};
use super::traits::*;
use super::utils::{
    backend_state_to_running_state, check_before_submit, generate_job_id,
    node_requirements_to_resources,
};

/// Connection settings shared by all gateway clients.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Timeout of a single HTTP request.
    pub http_timeout: Duration,
    /// Interval between two event polls.
    pub event_poll_interval: Duration,
    /// Health-check attempts when connecting.
    pub connect_retries: u32,
    /// Wait between two health-check attempts.
    pub connect_retry_wait: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            event_poll_interval: Duration::from_millis(1000),
            connect_retries: 3,
            connect_retry_wait: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GatewayInfo {
    #[serde(flatten)]
    scheduler: SchedulerInfo,
    #[serde(default)]
    dashboard_link: Option<String>,
}

#[derive(Serialize)]
struct SubmitTaskRequest<'a> {
    job_id: &'a str,
    user_id: UserId,
    project_id: ProjectId,
    node_id: NodeId,
    image: &'a Image,
    resources: &'a BTreeMap<String, f64>,
    inputs: &'a Map<String, Value>,
    output_schema: &'a Map<String, Value>,
    log_file_url: Option<&'a str>,
    file_link_type: FileLinkType,
}

#[derive(Deserialize)]
struct TasksStatusResponse {
    #[serde(default)]
    states: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct TaskResultResponse {
    #[serde(default)]
    outputs: Map<String, Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct EventsResponse {
    #[serde(default)]
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    cursor: u64,
    #[serde(flatten)]
    payload: WirePayload,
}

fn default_log_level() -> i32 {
    20
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WirePayload {
    State {
        job_id: String,
        state: String,
        #[serde(default)]
        msg: Option<String>,
    },
    Progress {
        job_id: String,
        progress: f64,
    },
    Log {
        job_id: String,
        log: String,
        #[serde(default = "default_log_level")]
        log_level: i32,
    },
}

impl From<WirePayload> for TaskEvent {
    fn from(payload: WirePayload) -> Self {
        match payload {
            WirePayload::State { job_id, state, msg } => TaskEvent::State(TaskStateEvent {
                job_id,
                state: backend_state_to_running_state(&state),
                msg,
            }),
            WirePayload::Progress { job_id, progress } => {
                TaskEvent::Progress(TaskProgressEvent { job_id, progress })
            }
            WirePayload::Log {
                job_id,
                log,
                log_level,
            } => TaskEvent::Log(TaskLogEvent {
                job_id,
                log,
                log_level,
            }),
        }
    }
}

fn transport_error(err: reqwest::Error) -> SchedulerError {
    if err.is_decode() {
        SchedulerError::Serialization {
            details: err.to_string(),
        }
    } else {
        SchedulerError::ComputationalBackendNotConnected {
            msg: err.to_string(),
        }
    }
}

async fn status_error(operation: &str, response: Response) -> SchedulerError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            SchedulerError::ComputationalBackendNotConnected {
                msg: format!("{} returned {}: {}", operation, status, body),
            }
        }
        _ => SchedulerError::Backend {
            details: format!("{} returned {}: {}", operation, status, body),
        },
    }
}

/// HTTP plumbing shared with the event poller.
struct Transport {
    http: reqwest::Client,
    base_url: Url,
    authentication: ClusterAuthentication,
}

impl Transport {
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SchedulerError::Configuration {
                msg: format!("cluster endpoint '{}' cannot be a base URL", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let builder = self.http.request(method, self.url(segments)?);
        Ok(match &self.authentication {
            ClusterAuthentication::Simple { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            ClusterAuthentication::Jupyterhub { api_token } => builder.bearer_auth(api_token),
            ClusterAuthentication::None | ClusterAuthentication::Kerberos => builder,
        })
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .request(Method::GET, &["v1", "health"])?
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error("health", response).await)
        }
    }

    async fn info(&self) -> Result<GatewayInfo> {
        let response = self
            .request(Method::GET, &["v1", "info"])?
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("info", response).await);
        }
        response.json().await.map_err(transport_error)
    }

    async fn events(&self, after: u64) -> Result<Vec<WireEvent>> {
        let response = self
            .request(Method::GET, &["v1", "events"])?
            .query(&[("after", after)])
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("events", response).await);
        }
        let body: EventsResponse = response.json().await.map_err(transport_error)?;
        Ok(body.events)
    }
}

async fn poll_events(
    transport: Arc<Transport>,
    tx: mpsc::Sender<TaskEvent>,
    shutdown: Arc<Notify>,
    interval: Duration,
    cluster_id: ClusterId,
) {
    debug!(cluster_id, "Event poller started");
    let mut cursor = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            _ = tokio::time::sleep(interval) => {
                match transport.events(cursor).await {
                    Ok(events) => {
                        for event in events {
                            cursor = cursor.max(event.cursor);
                            if !forward_event(&tx, event.payload.into()).await {
                                return;
                            }
                        }
                    }
                    Err(e) => debug!(cluster_id, error = %e, "Failed to poll task events"),
                }
            }
        }
    }

    debug!(cluster_id, "Event poller stopped");
}

/// Compute client backed by an HTTP cluster gateway.
pub struct GatewayClient {
    cluster_id: ClusterId,
    file_link_type: FileLinkType,
    transport: Arc<Transport>,
    scheduler_id: String,
    dashboard_link: Option<String>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayClient {
    /// Connect to `cluster`, retrying the health check as configured.
    #[instrument(skip(cluster, handlers, settings), fields(cluster_id = cluster.id))]
    pub async fn connect(
        cluster: &Cluster,
        file_link_type: FileLinkType,
        handlers: Option<TaskHandlers>,
        settings: &GatewaySettings,
    ) -> Result<Self> {
        if matches!(cluster.authentication, ClusterAuthentication::Kerberos) {
            return Err(SchedulerError::Configuration {
                msg: format!(
                    "authentication '{}' of cluster {} is not supported",
                    cluster.authentication.kind(),
                    cluster.id
                ),
            });
        }

        let base_url = Url::parse(&cluster.endpoint).map_err(|e| SchedulerError::Configuration {
            msg: format!(
                "invalid endpoint '{}' for cluster {}: {}",
                cluster.endpoint, cluster.id, e
            ),
        })?;
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .map_err(|e| SchedulerError::Configuration {
                msg: format!("failed to build HTTP client: {}", e),
            })?;
        let transport = Arc::new(Transport {
            http,
            base_url,
            authentication: cluster.authentication.clone(),
        });

        let attempts = settings.connect_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match transport.health().await {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "Cluster not reachable, retrying");
                    tokio::time::sleep(settings.connect_retry_wait).await;
                }
                Err(e) => return Err(e),
            }
        }

        let info = transport.info().await?;
        if info.scheduler.status != SchedulerStatus::Running {
            return Err(SchedulerError::ComputationalBackendNotConnected {
                msg: format!(
                    "scheduler of cluster {} is {:?}",
                    cluster.id, info.scheduler.status
                ),
            });
        }

        let shutdown = Arc::new(Notify::new());
        let poller = handlers.map(|handlers| {
            let (tx, _consumer) = spawn_event_consumer(handlers);
            tokio::spawn(poll_events(
                transport.clone(),
                tx,
                shutdown.clone(),
                settings.event_poll_interval,
                cluster.id,
            ))
        });

        info!(
            endpoint = %cluster.endpoint,
            auth = cluster.authentication.kind(),
            scheduler_id = %info.scheduler.scheduler_id,
            workers = info.scheduler.workers.len(),
            "Connected to cluster"
        );

        Ok(Self {
            cluster_id: cluster.id,
            file_link_type,
            transport,
            scheduler_id: info.scheduler.scheduler_id,
            dashboard_link: info.dashboard_link,
            closed: AtomicBool::new(false),
            shutdown,
            poller: Mutex::new(poller),
        })
    }

    /// Scheduler identity observed when connecting.
    pub fn scheduler_id(&self) -> &str {
        &self.scheduler_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::ComputationalBackendNotConnected {
                msg: format!("client of cluster {} was deleted", self.cluster_id),
            });
        }
        Ok(())
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

#[async_trait]
impl ComputeClient for GatewayClient {
    fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    fn file_link_type(&self) -> FileLinkType {
        self.file_link_type
    }

    fn client_type(&self) -> &'static str {
        "gateway"
    }

    #[instrument(skip(self, task), fields(node_id = %task.node_id))]
    async fn submit(&self, cluster_id: ClusterId, task: &TaskDefinition) -> Result<String> {
        self.ensure_open()?;
        if cluster_id != self.cluster_id {
            return Err(SchedulerError::Configuration {
                msg: format!(
                    "client of cluster {} cannot submit to cluster {}",
                    self.cluster_id, cluster_id
                ),
            });
        }

        let resources = task
            .image
            .node_requirements
            .as_ref()
            .map(node_requirements_to_resources)
            .unwrap_or_default();
        let info = self.transport.info().await?;
        check_before_submit(
            &self.scheduler_id,
            &info.scheduler,
            cluster_id,
            task.node_id,
            &resources,
            !self.transport.authentication.is_gateway(),
        )?;

        let job_id = generate_job_id(
            &task.image.name,
            &task.image.tag,
            task.user_id,
            task.project_id,
            task.node_id,
        );
        let body = SubmitTaskRequest {
            job_id: &job_id,
            user_id: task.user_id,
            project_id: task.project_id,
            node_id: task.node_id,
            image: &task.image,
            resources: &resources,
            inputs: &task.inputs,
            output_schema: &task.output_schema,
            log_file_url: task.log_file_url.as_deref(),
            file_link_type: self.file_link_type,
        };
        let response = self
            .transport
            .request(Method::POST, &["v1", "tasks"])?
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("submit", response).await);
        }

        info!(job_id = %job_id, image = %task.image.name, "Task submitted");
        Ok(job_id)
    }

    async fn get_tasks_status(&self, job_ids: &[String]) -> Result<Vec<RunningState>> {
        self.ensure_open()?;
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query: Vec<(&str, &str)> = job_ids.iter().map(|id| ("job_id", id.as_str())).collect();
        let response = self
            .transport
            .request(Method::GET, &["v1", "tasks", "status"])?
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("tasks status", response).await);
        }
        let body: TasksStatusResponse = response.json().await.map_err(transport_error)?;

        Ok(job_ids
            .iter()
            .map(|id| {
                body.states
                    .get(id)
                    .map(|s| backend_state_to_running_state(s))
                    .unwrap_or(RunningState::Unknown)
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn cancel(&self, job_id: &str) -> Result<()> {
        self.ensure_open()?;
        let response = self
            .transport
            .request(Method::POST, &["v1", "tasks", job_id, "cancel"])?
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            s if s.is_success() => {
                debug!("Task cancelled");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                warn!("Cancelling unknown job, ignoring");
                Ok(())
            }
            _ => Err(status_error("cancel", response).await),
        }
    }

    async fn get_task_result(&self, job_id: &str) -> Result<Map<String, Value>> {
        self.ensure_open()?;
        let response = self
            .transport
            .request(Method::GET, &["v1", "tasks", job_id, "result"])?
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(SchedulerError::ComputationalBackendTaskNotFound {
                job_id: job_id.to_string(),
            }),
            StatusCode::ACCEPTED | StatusCode::CONFLICT => {
                Err(SchedulerError::ComputationalBackendTaskResultsNotReady {
                    job_id: job_id.to_string(),
                })
            }
            s if s.is_success() => {
                let body: TaskResultResponse = response.json().await.map_err(transport_error)?;
                match body.error {
                    Some(error) => Err(SchedulerError::Backend { details: error }),
                    None => Ok(body.outputs),
                }
            }
            _ => Err(status_error("result", response).await),
        }
    }

    async fn release_task_result(&self, job_id: &str) -> Result<()> {
        self.ensure_open()?;
        let response = self
            .transport
            .request(Method::DELETE, &["v1", "tasks", job_id, "result"])?
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(SchedulerError::ComputationalBackendTaskNotFound {
                job_id: job_id.to_string(),
            }),
            s if s.is_success() => Ok(()),
            _ => Err(status_error("release result", response).await),
        }
    }

    fn dashboard_link(&self) -> Option<String> {
        self.dashboard_link.clone()
    }

    async fn scheduler_info(&self) -> Result<SchedulerInfo> {
        self.ensure_open()?;
        Ok(self.transport.info().await?.scheduler)
    }

    async fn status(&self) -> Result<SchedulerStatus> {
        Ok(self.scheduler_info().await?.status)
    }

    async fn delete(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.notify_one();
        if let Some(poller) = self.poller.lock().await.take()
            && let Err(e) = poller.await
        {
            warn!(cluster_id = self.cluster_id, error = %e, "Event poller ended abnormally");
        }
        info!(cluster_id = self.cluster_id, "Disconnected from cluster");
        Ok(())
    }
}

/// Creates [`GatewayClient`]s.
#[derive(Debug, Clone, Default)]
pub struct GatewayClientFactory {
    settings: GatewaySettings,
}

impl GatewayClientFactory {
    /// Create a factory using `settings` for every client.
    pub fn new(settings: GatewaySettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ComputeClientFactory for GatewayClientFactory {
    async fn create(
        &self,
        cluster: &Cluster,
        file_link_type: FileLinkType,
        handlers: Option<TaskHandlers>,
    ) -> Result<Arc<dyn ComputeClient>> {
        let client = GatewayClient::connect(cluster, file_link_type, handlers, &self.settings).await?;
        Ok(Arc::new(client))
    }
}
