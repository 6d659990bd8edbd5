//! HTTP client for one container-daemon endpoint
//!
//! A `DockerService` talks to exactly one endpoint: a single node's daemon
//! or a cluster's aggregate orchestrator, never both. Unary calls carry a
//! class-dependent timeout and resolve to the `ServiceCallResult` taxonomy;
//! streaming calls run until the daemon closes the response or the caller's
//! cancel token fires. Availability is tracked per endpoint so a dead
//! daemon fails fast instead of tying up callers.

use std::time::{Duration, Instant};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{service_topic, BusEvent, EventBus, ServiceEvent, ServiceEventKind};
use crate::node::NodeRegistry;

use super::offline::{AvailabilityTracker, OfflineCause, INITIAL_OFFLINE_COOLDOWN};
use super::result::{CallError, CallResult, ResultCode};
use super::stream::{JsonLineDecoder, LogFrameDecoder, StreamEnd};
use super::types::{
    ContainerDetails, ContainerSpec, ContainerSummary, CreateContainerResponse,
    CreateNetworkRequest, CreateNetworkResponse, DockerEvent, EndpointInfo, ImageDetails,
    ImageRef, ImageSummary, LogOptions, NetworkResource, NodeInfoRow, ProcessEvent, PullProgress,
    StatsFrame, StatsOptions, StdStream, SystemInfo, UpdateContainerRequest,
};

/// Base timeout for fast, idempotent reads.
const FAST_BASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Aggregate endpoints fan a read out to many nodes.
const CLUSTER_TIMEOUT_FACTOR: u32 = 3;

/// Floor of the slow-call ceiling, regardless of configuration.
const MIN_SLOW_TIMEOUT: Duration = Duration::from_secs(100);

/// What a `DockerService` fronts: one node's daemon or one cluster's
/// aggregate orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddress {
    Cluster(String),
    Node(String),
}

impl EndpointAddress {
    pub fn id(&self) -> &str {
        match self {
            EndpointAddress::Cluster(name) | EndpointAddress::Node(name) => name,
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, EndpointAddress::Cluster(_))
    }
}

impl std::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointAddress::Cluster(name) => write!(f, "cluster:{}", name),
            EndpointAddress::Node(name) => write!(f, "node:{}", name),
        }
    }
}

/// Per-endpoint client configuration, resolved from the owning cluster's
/// configuration by discovery storage.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Daemon addresses. The first is used; extras are logged and ignored.
    pub hosts: Vec<String>,
    /// Ceiling for slow (mutating) calls.
    pub docker_timeout: Duration,
    /// TTL of the cached `/info` result.
    pub cache_ttl: Duration,
    /// First-failure cooldown before the doubling starts.
    pub offline_cooldown: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            docker_timeout: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(30),
            offline_cooldown: INITIAL_OFFLINE_COOLDOWN,
        }
    }
}

enum TimeoutClass {
    /// Idempotent reads: list, inspect, info.
    Fast,
    /// Mutations and anything that may pull blobs.
    Slow,
}

pub struct DockerService {
    address: EndpointAddress,
    base_url: String,
    client: Client,
    availability: AvailabilityTracker,
    events: Arc<EventBus>,
    nodes: Option<Arc<NodeRegistry>>,
    fast_timeout: Duration,
    slow_timeout: Duration,
    cache_ttl: Duration,
    info_cache: Mutex<Option<(Instant, EndpointInfo)>>,
}

impl DockerService {
    pub fn new(
        address: EndpointAddress,
        config: EndpointConfig,
        events: Arc<EventBus>,
        nodes: Option<Arc<NodeRegistry>>,
    ) -> CallResult<Self> {
        let mut hosts = config.hosts.iter();
        let host = hosts
            .next()
            .ok_or_else(|| CallError::error(format!("no hosts configured for {}", address)))?;
        for ignored in hosts {
            warn!("{}: ignoring extra host {}", address, ignored);
        }

        let base_url = normalize_host(host);
        url::Url::parse(&base_url)
            .map_err(|e| CallError::error(format!("invalid endpoint {}: {}", base_url, e)))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| CallError::error(format!("http client init: {}", e)))?;

        let slow_timeout = config.docker_timeout.max(MIN_SLOW_TIMEOUT);
        let fast_base = if address.is_cluster() {
            FAST_BASE_TIMEOUT * CLUSTER_TIMEOUT_FACTOR
        } else {
            FAST_BASE_TIMEOUT
        };

        Ok(Self {
            address,
            base_url,
            client,
            availability: AvailabilityTracker::with_initial(config.offline_cooldown, slow_timeout),
            events,
            nodes,
            fast_timeout: fast_base.min(slow_timeout),
            slow_timeout,
            cache_ttl: config.cache_ttl,
            info_cache: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_offline(&self) -> bool {
        self.availability.is_offline()
    }

    pub fn offline_cause(&self) -> Option<OfflineCause> {
        self.availability.current()
    }

    // ========================================================================
    // Request plumbing
    // ========================================================================

    fn timeout(&self, class: &TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Fast => self.fast_timeout,
            TimeoutClass::Slow => self.slow_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn publish_service_event(&self, kind: ServiceEventKind, message: Option<String>) {
        let topic = service_topic(self.address.id());
        let mut event = ServiceEvent::new(self.address.id(), kind);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.events.publish(&topic, BusEvent::Service(event));
    }

    fn mark_success(&self) {
        if self.availability.on_success() {
            debug!("{}: back online", self.address);
            self.publish_service_event(ServiceEventKind::Online, None);
        }
    }

    fn transport_failure(&self, context: &str, err: &reqwest::Error) -> CallError {
        let message = format!("{} {}: {}", self.address, context, err);
        let outcome = self.availability.on_failure(&message);
        if outcome.became_offline {
            warn!(
                "{}: offline ({}), cooldown {:?}",
                self.address, err, outcome.cooldown
            );
            self.publish_service_event(ServiceEventKind::Offline, Some(err.to_string()));
        }
        let code = if err.is_timeout() {
            ResultCode::Timeout
        } else {
            ResultCode::Error
        };
        CallError::new(code, message)
    }

    /// One unary round-trip: offline gate, class timeout, full body read.
    /// Returns the raw status and body; status mapping is the caller's.
    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
        class: TimeoutClass,
    ) -> CallResult<(StatusCode, String)> {
        if let Some(err) = self.availability.check() {
            return Err(err);
        }

        let mut request = self
            .client
            .request(method, self.url(path))
            .timeout(self.timeout(&class));
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return Err(self.transport_failure(path, &e)),
        };
        let status = response.status();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => return Err(self.transport_failure(path, &e)),
        };

        // Any decoded response, error or not, proves the endpoint reachable.
        self.mark_success();
        Ok((status, text))
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
        class: TimeoutClass,
    ) -> CallResult<T> {
        let (status, text) = self.call(method, path, query, body, class).await?;
        if !status.is_success() {
            return Err(CallError::from_status(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| CallError::error(format!("{}: decode failed: {} (body: {})", path, e, text)))
    }

    async fn call_unit<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> CallResult<()> {
        let (status, text) = self
            .call(method, path, query, body, TimeoutClass::Slow)
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(CallError::from_status(status, &text))
        }
    }

    /// Open a streaming response. No class timeout applies; the offline
    /// gate and transport accounting do.
    async fn open_stream(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> CallResult<reqwest::Response> {
        if let Some(err) = self.availability.check() {
            return Err(err);
        }
        let mut request = self.client.request(method, self.url(path));
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return Err(self.transport_failure(path, &e)),
        };
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            self.mark_success();
            return Err(CallError::from_status(status, &text));
        }
        self.mark_success();
        Ok(response)
    }

    // ========================================================================
    // Containers
    // ========================================================================

    pub async fn list_containers(&self, all: bool) -> CallResult<Vec<ContainerSummary>> {
        let query = [("all", if all { "1" } else { "0" }.to_string())];
        self.call_json(
            Method::GET,
            "/containers/json",
            &query,
            None,
            TimeoutClass::Fast,
        )
        .await
    }

    /// Inspect a container. Returns `Ok(None)` both on 404 and when the
    /// daemon answers 200 with malformed JSON, which it does when the
    /// container is being deleted under us; callers treat both as "gone".
    pub async fn inspect_container(&self, id: &str) -> CallResult<Option<ContainerDetails>> {
        let path = format!("/containers/{}/json", id);
        let (status, text) = self
            .call::<()>(Method::GET, &path, &[], None, TimeoutClass::Fast)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CallError::from_status(status, &text));
        }
        match serde_json::from_str(&text) {
            Ok(details) => Ok(Some(details)),
            Err(e) => {
                debug!("{}: inspect {} returned malformed JSON ({})", self.address, id, e);
                Ok(None)
            }
        }
    }

    pub async fn create_container(
        &self,
        spec: &ContainerSpec,
        name: Option<&str>,
    ) -> CallResult<CreateContainerResponse> {
        let mut query = Vec::new();
        if let Some(name) = name {
            query.push(("name", name.to_string()));
        }
        let body = serde_json::to_value(spec)
            .map_err(|e| CallError::error(format!("encode create spec: {}", e)))?;
        self.call_json(
            Method::POST,
            "/containers/create",
            &query,
            Some(&body),
            TimeoutClass::Slow,
        )
        .await
    }

    pub async fn start_container(&self, id: &str) -> CallResult<()> {
        self.call_unit::<()>(
            Method::POST,
            &format!("/containers/{}/start", id),
            &[],
            None,
        )
        .await
    }

    pub async fn stop_container(&self, id: &str, time_before_kill: Option<u64>) -> CallResult<()> {
        let mut query = Vec::new();
        if let Some(t) = time_before_kill {
            query.push(("t", t.to_string()));
        }
        self.call_unit::<()>(
            Method::POST,
            &format!("/containers/{}/stop", id),
            &query,
            None,
        )
        .await
    }

    pub async fn restart_container(
        &self,
        id: &str,
        time_before_kill: Option<u64>,
    ) -> CallResult<()> {
        let mut query = Vec::new();
        if let Some(t) = time_before_kill {
            query.push(("t", t.to_string()));
        }
        self.call_unit::<()>(
            Method::POST,
            &format!("/containers/{}/restart", id),
            &query,
            None,
        )
        .await
    }

    pub async fn kill_container(&self, id: &str, signal: Option<&str>) -> CallResult<()> {
        let mut query = Vec::new();
        if let Some(signal) = signal {
            query.push(("signal", signal.to_string()));
        }
        self.call_unit::<()>(
            Method::POST,
            &format!("/containers/{}/kill", id),
            &query,
            None,
        )
        .await
    }

    pub async fn rename_container(&self, id: &str, new_name: &str) -> CallResult<()> {
        let query = [("name", new_name.to_string())];
        self.call_unit::<()>(
            Method::POST,
            &format!("/containers/{}/rename", id),
            &query,
            None,
        )
        .await
    }

    pub async fn update_container(
        &self,
        id: &str,
        update: &UpdateContainerRequest,
    ) -> CallResult<()> {
        self.call_unit(
            Method::POST,
            &format!("/containers/{}/update", id),
            &[],
            Some(update),
        )
        .await
    }

    pub async fn delete_container(&self, id: &str, force: bool, volumes: bool) -> CallResult<()> {
        let query = [
            ("force", if force { "1" } else { "0" }.to_string()),
            ("v", if volumes { "1" } else { "0" }.to_string()),
        ];
        self.call_unit::<()>(Method::DELETE, &format!("/containers/{}", id), &query, None)
            .await
    }

    // ========================================================================
    // Images
    // ========================================================================

    pub async fn list_images(&self, reference_filter: Option<&str>) -> CallResult<Vec<ImageSummary>> {
        let mut query = Vec::new();
        if let Some(filter) = reference_filter {
            let filters = serde_json::json!({ "reference": [filter] });
            query.push(("filters", filters.to_string()));
        }
        self.call_json(Method::GET, "/images/json", &query, None, TimeoutClass::Fast)
            .await
    }

    /// Pull an image, forwarding daemon progress lines to the sink when one
    /// is given. Completes when the daemon finishes or reports an in-stream
    /// error; the cancel token aborts the transfer.
    pub async fn pull_image(
        &self,
        reference: &ImageRef,
        progress: Option<mpsc::Sender<PullProgress>>,
        cancel: &CancellationToken,
    ) -> CallResult<()> {
        let mut query = vec![("fromImage", reference.repository())];
        if let Some(tag) = &reference.tag {
            query.push(("tag", tag.clone()));
        }
        let response = self
            .open_stream(Method::POST, "/images/create", &query)
            .await?;

        let mut body = response.bytes_stream();
        let mut decoder: JsonLineDecoder<PullProgress> = JsonLineDecoder::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = body.next() => match chunk {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(self.transport_failure("/images/create", &e)),
                    Some(Ok(bytes)) => {
                        decoder.feed(&bytes);
                        while let Some(item) = decoder.next_item() {
                            let line = item.map_err(|e| {
                                CallError::error(format!("pull progress decode: {}", e))
                            })?;
                            if let Some(error) = &line.error {
                                return Err(CallError::error(format!(
                                    "pull {} failed: {}",
                                    reference, error
                                )));
                            }
                            if let Some(progress) = &progress {
                                let _ = progress.send(line).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Inspect an image. `Ok(None)` when the daemon does not know it.
    pub async fn get_image_info(&self, reference: &str) -> CallResult<Option<ImageDetails>> {
        let path = format!("/images/{}/json", reference);
        let (status, text) = self
            .call::<()>(Method::GET, &path, &[], None, TimeoutClass::Fast)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CallError::from_status(status, &text));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| CallError::error(format!("{}: decode failed: {}", path, e)))
    }

    pub async fn tag_image(&self, reference: &str, repo: &str, tag: &str) -> CallResult<()> {
        let query = [("repo", repo.to_string()), ("tag", tag.to_string())];
        self.call_unit::<()>(Method::POST, &format!("/images/{}/tag", reference), &query, None)
            .await
    }

    pub async fn remove_image(&self, reference: &str, force: bool) -> CallResult<()> {
        let query = [("force", if force { "1" } else { "0" }.to_string())];
        self.call_unit::<()>(Method::DELETE, &format!("/images/{}", reference), &query, None)
            .await
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub async fn list_networks(&self) -> CallResult<Vec<NetworkResource>> {
        self.call_json(Method::GET, "/networks", &[], None, TimeoutClass::Fast)
            .await
    }

    pub async fn create_network(
        &self,
        request: &CreateNetworkRequest,
    ) -> CallResult<CreateNetworkResponse> {
        let body = serde_json::to_value(request)
            .map_err(|e| CallError::error(format!("encode network spec: {}", e)))?;
        self.call_json(
            Method::POST,
            "/networks/create",
            &[],
            Some(&body),
            TimeoutClass::Slow,
        )
        .await
    }

    // ========================================================================
    // Info
    // ========================================================================

    /// Endpoint info, cached for the configured TTL. A refresh that differs
    /// from the cached value emits an `InfoChanged` event.
    pub async fn get_info(&self) -> CallResult<EndpointInfo> {
        if let Some((at, cached)) = self.info_cache.lock().clone() {
            if at.elapsed() < self.cache_ttl {
                return Ok(cached);
            }
        }

        let raw: SystemInfo = self
            .call_json(Method::GET, "/info", &[], None, TimeoutClass::Fast)
            .await?;
        let fresh = self.merge_info(raw);

        let changed = {
            let mut cache = self.info_cache.lock();
            let changed = cache
                .as_ref()
                .map(|(_, old)| old != &fresh)
                .unwrap_or(false);
            *cache = Some((Instant::now(), fresh.clone()));
            changed
        };
        if changed {
            self.publish_service_event(ServiceEventKind::InfoChanged, None);
        }
        Ok(fresh)
    }

    /// Merge daemon-reported data with node-registry health. Agent-side
    /// metrics win where non-null; the daemon fills the gaps.
    fn merge_info(&self, raw: SystemInfo) -> EndpointInfo {
        let records = match (&self.address, &self.nodes) {
            (EndpointAddress::Cluster(name), Some(registry)) => registry.list_by_cluster(name),
            (EndpointAddress::Node(name), Some(registry)) => {
                registry.get(name).into_iter().collect()
            }
            _ => Vec::new(),
        };

        let daemon_mem = raw.mem_total.and_then(|m| u64::try_from(m).ok());
        let nodes = records
            .into_iter()
            .map(|record| NodeInfoRow {
                name: record.name.clone(),
                address: Some(record.address.clone()),
                healthy: record.health.healthy,
                sys_cpu_jiffies: record.health.sys_cpu_jiffies,
                memory_total: record.health.memory_total.or(daemon_mem),
                health_time: record.health.time,
            })
            .collect();

        EndpointInfo {
            endpoint: self.address.id().to_string(),
            containers: raw.containers.unwrap_or(0),
            containers_running: raw.containers_running.unwrap_or(0),
            images: raw.images.unwrap_or(0),
            ncpu: raw.ncpu.unwrap_or(0),
            mem_total: raw.mem_total.unwrap_or(0),
            server_version: raw.server_version,
            nodes,
        }
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Subscribe to the daemon event stream, feeding decoded events into
    /// the sink until the daemon closes the stream or the token fires.
    pub async fn subscribe_events(
        &self,
        since: Option<i64>,
        until: Option<i64>,
        sink: mpsc::Sender<DockerEvent>,
        cancel: &CancellationToken,
    ) -> CallResult<StreamEnd> {
        let mut query = Vec::new();
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        if let Some(until) = until {
            query.push(("until", until.to_string()));
        }
        let response = self.open_stream(Method::GET, "/events", &query).await?;

        let mut body = response.bytes_stream();
        let mut decoder: JsonLineDecoder<DockerEvent> = JsonLineDecoder::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                chunk = body.next() => match chunk {
                    None => return Ok(StreamEnd::Closed),
                    Some(Err(e)) => return Ok(StreamEnd::Error(e.to_string())),
                    Some(Ok(bytes)) => {
                        decoder.feed(&bytes);
                        while let Some(item) = decoder.next_item() {
                            match item {
                                Ok(event) => {
                                    if sink.send(event).await.is_err() {
                                        return Ok(StreamEnd::Closed);
                                    }
                                }
                                Err(e) => {
                                    return Ok(StreamEnd::Error(format!("event decode: {}", e)))
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stream container logs as decoded multiplexed frames.
    pub async fn get_logs(
        &self,
        id: &str,
        options: &LogOptions,
        sink: mpsc::Sender<ProcessEvent>,
        cancel: &CancellationToken,
    ) -> CallResult<StreamEnd> {
        let mut query = vec![
            ("follow", bool_flag(options.follow)),
            ("stdout", bool_flag(options.stdout)),
            ("stderr", bool_flag(options.stderr)),
            ("timestamps", bool_flag(options.timestamps)),
        ];
        if let Some(tail) = &options.tail {
            query.push(("tail", tail.clone()));
        }
        if let Some(since) = options.since {
            query.push(("since", since.to_string()));
        }
        let response = self
            .open_stream(Method::GET, &format!("/containers/{}/logs", id), &query)
            .await?;

        let mut body = response.bytes_stream();
        let mut decoder = LogFrameDecoder::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                chunk = body.next() => match chunk {
                    None => return Ok(StreamEnd::Closed),
                    Some(Err(e)) => return Ok(StreamEnd::Error(e.to_string())),
                    Some(Ok(bytes)) => {
                        decoder.feed(&bytes);
                        while let Some(frame) = decoder.next_frame() {
                            if sink.send(frame).await.is_err() {
                                return Ok(StreamEnd::Closed);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stream container statistics snapshots.
    pub async fn get_stats(
        &self,
        id: &str,
        options: &StatsOptions,
        sink: mpsc::Sender<StatsFrame>,
        cancel: &CancellationToken,
    ) -> CallResult<StreamEnd> {
        let query = [("stream", bool_flag(options.stream))];
        let response = self
            .open_stream(Method::GET, &format!("/containers/{}/stats", id), &query)
            .await?;

        let mut body = response.bytes_stream();
        let mut decoder: JsonLineDecoder<StatsFrame> = JsonLineDecoder::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                chunk = body.next() => match chunk {
                    None => return Ok(StreamEnd::Closed),
                    Some(Err(e)) => return Ok(StreamEnd::Error(e.to_string())),
                    Some(Ok(bytes)) => {
                        decoder.feed(&bytes);
                        while let Some(item) = decoder.next_item() {
                            match item {
                                Ok(frame) => {
                                    if sink.send(frame).await.is_err() {
                                        return Ok(StreamEnd::Closed);
                                    }
                                }
                                Err(e) => {
                                    return Ok(StreamEnd::Error(format!("stats decode: {}", e)))
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn bool_flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn normalize_host(host: &str) -> String {
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };
    with_scheme.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Path;
    use axum::routing::{get, post};
    use axum::Router;
    use std::net::SocketAddr;
    use tokio_stream::wrappers::ReceiverStream;

    fn service_for(addr: SocketAddr, events: Arc<EventBus>) -> DockerService {
        let config = EndpointConfig {
            hosts: vec![format!("http://{}", addr)],
            offline_cooldown: Duration::from_millis(50),
            ..Default::default()
        };
        DockerService::new(EndpointAddress::Node("n1".into()), config, events, None).unwrap()
    }

    async fn spawn_daemon(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn containers_json() -> &'static str {
        r#"[{"Id":"abc123","Names":["/web-1"],"Image":"nginx:1.9","ImageID":"sha256:aaa","State":"running","Status":"Up"}]"#
    }

    #[test]
    fn test_requires_a_host() {
        let result = DockerService::new(
            EndpointAddress::Node("n1".into()),
            EndpointConfig::default(),
            Arc::new(EventBus::new()),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_timeout_classes() {
        let events = Arc::new(EventBus::new());
        let node = DockerService::new(
            EndpointAddress::Node("n1".into()),
            EndpointConfig {
                hosts: vec!["127.0.0.1:1".into()],
                docker_timeout: Duration::from_secs(30),
                ..Default::default()
            },
            events.clone(),
            None,
        )
        .unwrap();
        assert_eq!(node.fast_timeout, Duration::from_secs(10));
        // Ceiling is max(docker_timeout, 100s).
        assert_eq!(node.slow_timeout, Duration::from_secs(100));

        let cluster = DockerService::new(
            EndpointAddress::Cluster("c1".into()),
            EndpointConfig {
                hosts: vec!["127.0.0.1:1".into()],
                docker_timeout: Duration::from_secs(600),
                ..Default::default()
            },
            events,
            None,
        )
        .unwrap();
        assert_eq!(cluster.fast_timeout, Duration::from_secs(30));
        assert_eq!(cluster.slow_timeout, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_list_containers() {
        let router = Router::new().route("/containers/json", get(|| async { containers_json() }));
        let addr = spawn_daemon(router).await;
        let service = service_for(addr, Arc::new(EventBus::new()));

        let containers = service.list_containers(true).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name(), "web-1");
    }

    #[tokio::test]
    async fn test_protocol_error_does_not_flip_offline() {
        let router = Router::new().route(
            "/containers/:id/json",
            get(|Path(id): Path<String>| async move {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    format!("server error for {}", id),
                )
            }),
        );
        let addr = spawn_daemon(router).await;
        let service = service_for(addr, Arc::new(EventBus::new()));

        let err = service.inspect_container("x").await.unwrap_err();
        assert_eq!(err.code, ResultCode::Error);
        assert!(err.message.contains("server error for x"));
        assert!(!service.is_offline());
    }

    #[tokio::test]
    async fn test_inspect_malformed_json_means_gone() {
        let router = Router::new().route(
            "/containers/:id/json",
            get(|| async { "{\"Id\": \"half" }),
        );
        let addr = spawn_daemon(router).await;
        let service = service_for(addr, Arc::new(EventBus::new()));

        assert!(service.inspect_container("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_fail_fast_and_recovery() {
        // Reserve a port with nothing listening on it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let events = Arc::new(EventBus::new());
        let mut bus_rx = events.subscribe(&service_topic("n1"));
        let service = service_for(addr, events);

        // First call hits the network and fails.
        let err = service.list_containers(false).await.unwrap_err();
        assert_ne!(err.code, ResultCode::Offline);
        assert!(service.is_offline());

        // Calls inside the cooldown fail fast with OFFLINE.
        for _ in 0..10 {
            let err = service.list_containers(false).await.unwrap_err();
            assert_eq!(err.code, ResultCode::Offline);
        }

        match bus_rx.recv().await.unwrap() {
            BusEvent::Service(ev) => assert_eq!(ev.kind, ServiceEventKind::Offline),
            other => panic!("unexpected event: {:?}", other),
        }

        // Daemon comes back on the same port; after the cooldown the next
        // probe succeeds and an Online event fires.
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let router = Router::new().route("/containers/json", get(|| async { containers_json() }));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(80)).await;

        let containers = service.list_containers(false).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert!(!service.is_offline());

        match bus_rx.recv().await.unwrap() {
            BusEvent::Service(ev) => assert_eq!(ev.kind, ServiceEventKind::Online),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_info_cache_and_change_event() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static HITS: AtomicU32 = AtomicU32::new(0);

        let router = Router::new().route(
            "/info",
            get(|| async {
                let n = HITS.fetch_add(1, Ordering::SeqCst);
                format!(
                    r#"{{"ID":"d1","Containers":{},"Images":3,"NCPU":4,"MemTotal":1024}}"#,
                    n
                )
            }),
        );
        let addr = spawn_daemon(router).await;

        let events = Arc::new(EventBus::new());
        let mut bus_rx = events.subscribe(&service_topic("n1"));
        let config = EndpointConfig {
            hosts: vec![format!("{}", addr)],
            cache_ttl: Duration::from_millis(30),
            ..Default::default()
        };
        let service = DockerService::new(
            EndpointAddress::Node("n1".into()),
            config,
            events,
            None,
        )
        .unwrap();

        let first = service.get_info().await.unwrap();
        // Within the TTL the cache answers; the daemon sees one request.
        let cached = service.get_info().await.unwrap();
        assert_eq!(first, cached);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let refreshed = service.get_info().await.unwrap();
        assert_ne!(first.containers, refreshed.containers);

        match bus_rx.recv().await.unwrap() {
            BusEvent::Service(ev) => assert_eq!(ev.kind, ServiceEventKind::InfoChanged),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_stream_cancel() {
        let router = Router::new().route(
            "/events",
            get(|| async {
                let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(8);
                tokio::spawn(async move {
                    let _ = tx
                        .send(Ok(bytes::Bytes::from(
                            "{\"status\":\"start\",\"id\":\"abc\"}\n",
                        )))
                        .await;
                    // Keep the stream open; nothing else arrives.
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(tx);
                });
                Body::from_stream(ReceiverStream::new(rx))
            }),
        );
        let addr = spawn_daemon(router).await;
        let service = service_for(addr, Arc::new(EventBus::new()));

        let (sink, mut received) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let end = service
            .subscribe_events(None, None, sink, &cancel)
            .await
            .unwrap();
        assert!(end.is_cancelled());
        assert_eq!(end.message(), "interrupted");

        let event = received.recv().await.unwrap();
        assert_eq!(event.action_name(), Some("start"));
        // The sink sees nothing after cancellation.
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_log_stream_decoding() {
        let router = Router::new().route(
            "/containers/:id/logs",
            get(|| async {
                let mut frame = vec![1u8, 0, 0, 0];
                frame.extend_from_slice(&6u32.to_be_bytes());
                frame.extend_from_slice(b"hello\n");
                frame.extend_from_slice(&[2u8, 0, 0, 0]);
                frame.extend_from_slice(&4u32.to_be_bytes());
                frame.extend_from_slice(b"err\n");
                frame
            }),
        );
        let addr = spawn_daemon(router).await;
        let service = service_for(addr, Arc::new(EventBus::new()));

        let (sink, mut received) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let end = service
            .get_logs("abc", &LogOptions::default(), sink, &cancel)
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Closed);

        let first = received.recv().await.unwrap();
        assert_eq!(first.stream, StdStream::Stdout);
        assert_eq!(&first.data[..], b"hello\n");
        let second = received.recv().await.unwrap();
        assert_eq!(second.stream, StdStream::Stderr);
    }

    #[tokio::test]
    async fn test_create_conflict_maps_to_conflict_code() {
        let router = Router::new().route(
            "/containers/create",
            post(|| async {
                (
                    axum::http::StatusCode::CONFLICT,
                    r#"{"message":"Conflict. The name \"/web-1\" is already in use"}"#,
                )
            }),
        );
        let addr = spawn_daemon(router).await;
        let service = service_for(addr, Arc::new(EventBus::new()));

        let spec = ContainerSpec {
            image: "nginx:1.9".into(),
            ..Default::default()
        };
        let err = service
            .create_container(&spec, Some("web-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ResultCode::Conflict);
        assert!(err.message.contains("already in use"));
    }
}
