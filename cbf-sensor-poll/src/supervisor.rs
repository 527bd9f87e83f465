//! Poll loop supervisor
//!
//! Drives the poller through `Idle -> Connecting -> Discovering -> Polling`:
//! - Connecting: primary KATCP session, retried with the configured policy
//! - Discovering: running arrays, opened concurrently, one `ArrayMonitor` each
//! - Polling: every monitor fetches, normalizes and writes once per interval
//!
//! A monitor that loses its sessions reconnects on its next poll; if that
//! reconnect is exhausted the supervisor drops every array and rediscovers.
//! An array whose maps cannot be resolved stays monitored and is skipped
//! until a later cycle resolves them.
//! The supervisor owns all sessions and closes them when `run` returns.

use crate::config::PollerConfig;
use crate::discovery::{discover_arrays, open_array, ArrayDescriptor, ArraySessions};
use crate::error::{PollError, Result};
use crate::health::HealthTracker;
use crate::katcp::{Endpoint, KatcpSession};
use crate::mapping::{resolve_mappings, Mappings};
use crate::normalize::{fetch_raw_sensors, non_nominal_index, normalize_array};
use crate::retry::RetryPolicy;
use crate::snapshot::{SnapshotPaths, SnapshotWriter};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Discovering,
    Polling,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Discovering => "discovering",
            SupervisorState::Polling => "polling",
        };
        f.write_str(name)
    }
}

/// Result of one successful poll of one array
#[derive(Debug, Clone)]
pub struct PollReport {
    pub array_name: String,
    pub hosts: usize,
    pub non_nominal_hosts: usize,
    pub paths: SnapshotPaths,
}

/// One running array: its sessions, resolved maps and snapshot files
pub struct ArrayMonitor {
    descriptor: ArrayDescriptor,
    primary: Endpoint,
    sessions: Option<ArraySessions>,
    mappings: Option<Mappings>,
    writer: SnapshotWriter,
    retry: RetryPolicy,
    connect_timeout: Duration,
    request_timeout: Duration,
    lost: bool,
    span: Span,
}

impl ArrayMonitor {
    pub fn new(descriptor: ArrayDescriptor, primary: Endpoint, writer: SnapshotWriter, config: &PollerConfig) -> Self {
        let span = info_span!("array", array = %descriptor.array_name);
        Self {
            descriptor,
            primary,
            sessions: None,
            mappings: None,
            writer,
            retry: config.connect_retry,
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            lost: false,
            span,
        }
    }

    pub fn array_name(&self) -> &str {
        &self.descriptor.array_name
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Reconnect attempts were exhausted; only rediscovery can recover
    pub fn needs_rediscovery(&self) -> bool {
        self.lost
    }

    pub fn is_connected(&self) -> bool {
        self.sessions.as_ref().map(ArraySessions::is_connected).unwrap_or(false)
    }

    /// Open sessions (with retry) unless both are still connected
    async fn ensure_sessions(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = self.sessions.take() {
            warn!("Sessions for {} dropped, reconnecting", self.descriptor.array_name);
            stale.close().await;
            self.mappings = None;
        }

        let primary = &self.primary;
        let descriptor = &self.descriptor;
        let timeout = self.connect_timeout;
        let what = format!("connect to array {}", descriptor.array_name);
        match self.retry.run(&what, || open_array(primary, descriptor, timeout)).await {
            Ok(sessions) => {
                self.sessions = Some(sessions);
                Ok(())
            }
            Err(e) => {
                self.lost = true;
                Err(e)
            }
        }
    }

    /// Connect and resolve the maps
    pub async fn prepare(&mut self) -> Result<()> {
        self.ensure_sessions().await?;
        self.ensure_mappings().await
    }

    async fn ensure_mappings(&mut self) -> Result<()> {
        if self.mappings.is_some() {
            return Ok(());
        }
        let sessions = self
            .sessions
            .as_ref()
            .ok_or_else(|| PollError::Disconnected(self.primary.with_port(self.descriptor.data_port)))?;
        let resolved = resolve_mappings(&sessions.data, &sessions.sensors, self.request_timeout).await;
        match resolved {
            Ok(mappings) => {
                info!(
                    "Resolved {} hostnames and {} input labels",
                    mappings.hostnames.len(),
                    mappings.input_labels.len()
                );
                self.mappings = Some(mappings);
                Ok(())
            }
            Err(e) => Err(self.note_error(e).await),
        }
    }

    /// Drop the sessions when the error says the connection is gone
    async fn note_error(&mut self, error: PollError) -> PollError {
        if error.is_connection_lost() {
            if let Some(sessions) = self.sessions.take() {
                sessions.close().await;
            }
            self.mappings = None;
        }
        error
    }

    /// One cycle: fetch the sensor table, normalize, write both snapshots
    pub async fn poll_once(&mut self) -> Result<PollReport> {
        self.ensure_sessions().await?;
        self.ensure_mappings().await?;

        let (Some(sessions), Some(mappings)) = (self.sessions.as_ref(), self.mappings.as_ref()) else {
            return Err(PollError::Disconnected(self.primary.with_port(self.descriptor.sensor_port)));
        };

        let table = match fetch_raw_sensors(&sessions.sensors, self.request_timeout).await {
            Ok(table) => table,
            Err(e) => return Err(self.note_error(e).await),
        };

        let normalized = normalize_array(&table, mappings);
        let non_nominal = non_nominal_index(&table);
        let (hosts, non_nominal_hosts) = (normalized.len(), non_nominal.len());

        let writer = self.writer.clone();
        let paths = tokio::task::spawn_blocking(move || writer.write(&normalized, &non_nominal))
            .await
            .map_err(|e| PollError::Io(std::io::Error::other(e)))??;

        debug!("Wrote snapshot for {} hosts ({} with non-nominal sensors)", hosts, non_nominal_hosts);
        Ok(PollReport {
            array_name: self.descriptor.array_name.clone(),
            hosts,
            non_nominal_hosts,
            paths,
        })
    }

    pub async fn close(&mut self) {
        if let Some(sessions) = self.sessions.take() {
            sessions.close().await;
        }
        self.mappings = None;
    }
}

pub struct Supervisor {
    config: PollerConfig,
    health: HealthTracker,
    state: SupervisorState,
    primary: Option<KatcpSession>,
    monitors: Vec<ArrayMonitor>,
}

impl Supervisor {
    pub fn new(config: PollerConfig, health: HealthTracker) -> Self {
        Self {
            config,
            health,
            state: SupervisorState::Idle,
            primary: None,
            monitors: Vec::new(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn monitors(&self) -> &[ArrayMonitor] {
        &self.monitors
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            debug!("Supervisor {} -> {}", self.state, state);
        }
        self.state = state;
        self.health.set_state(state);
    }

    /// Run until `shutdown` turns true or its sender is dropped. Every
    /// session is closed before this returns.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.config.validate()?;
        info!("Polling {} every {:?}", self.config.katcp, self.config.poll_interval());

        loop {
            let pause = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                pause = self.step() => pause,
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!("Shutdown requested, closing KATCP sessions");
        self.release_all().await;
        self.set_state(SupervisorState::Idle);
        Ok(())
    }

    /// Advance the state machine once; returns how long to wait before the
    /// next step
    pub async fn step(&mut self) -> Option<Duration> {
        match self.state {
            SupervisorState::Idle | SupervisorState::Connecting => self.connect_primary().await,
            SupervisorState::Discovering => self.discover().await,
            SupervisorState::Polling => self.poll_cycle().await,
        }
    }

    async fn connect_primary(&mut self) -> Option<Duration> {
        self.set_state(SupervisorState::Connecting);
        if let Some(stale) = self.primary.take() {
            stale.close().await;
        }

        let endpoint = self.config.katcp.clone();
        let timeout = self.config.connect_timeout();
        let result = self
            .config
            .connect_retry
            .run("primary KATCP connect", || KatcpSession::connect(&endpoint, timeout))
            .await;

        match result {
            Ok(session) => {
                self.primary = Some(session);
                self.set_state(SupervisorState::Discovering);
                None
            }
            Err(e) => {
                error!("Could not connect to {}: {}", endpoint, e);
                self.health.record_failure();
                Some(self.config.discovery_backoff())
            }
        }
    }

    async fn discover(&mut self) -> Option<Duration> {
        let Some(primary) = self.primary.as_ref().filter(|p| p.is_connected()) else {
            self.set_state(SupervisorState::Connecting);
            return None;
        };

        let arrays = match discover_arrays(primary, self.config.array_filter.as_deref(), self.config.request_timeout()).await
        {
            Ok(arrays) => arrays,
            Err(e) if e.is_connection_lost() => {
                warn!("Primary session lost during discovery: {}", e);
                self.set_state(SupervisorState::Connecting);
                return None;
            }
            Err(e) => {
                warn!("{}; retrying in {:?}", e, self.config.discovery_backoff());
                self.health.record_failure();
                self.release_all().await;
                self.set_state(SupervisorState::Connecting);
                return Some(self.config.discovery_backoff());
            }
        };

        let config = &self.config;
        let primary_endpoint = config.katcp.clone();
        let array_count = arrays.len();
        let prepared: Vec<ArrayMonitor> = stream::iter(arrays.into_values())
            .map(|descriptor| {
                let writer = config.snapshot_writer(&descriptor.array_name, array_count);
                let mut monitor = ArrayMonitor::new(descriptor, primary_endpoint.clone(), writer, config);
                let span = monitor.span().clone();
                async move {
                    match monitor.prepare().await {
                        Ok(()) => Some(monitor),
                        Err(e) if monitor.needs_rediscovery() => {
                            error!("Could not connect to array {}: {}", monitor.array_name(), e);
                            monitor.close().await;
                            None
                        }
                        Err(e) => {
                            warn!("Array {} not ready, retrying next cycle: {}", monitor.array_name(), e);
                            Some(monitor)
                        }
                    }
                }
                .instrument(span)
            })
            .buffer_unordered(config.discovery_workers.max(1))
            .filter_map(|monitor| async move { monitor })
            .collect()
            .await;

        if prepared.is_empty() {
            warn!("No array could be connected; retrying in {:?}", self.config.discovery_backoff());
            self.health.record_failure();
            self.release_all().await;
            self.set_state(SupervisorState::Connecting);
            return Some(self.config.discovery_backoff());
        }

        info!("Monitoring {} array(s)", prepared.len());
        self.monitors = prepared;
        self.set_state(SupervisorState::Polling);
        None
    }

    async fn poll_cycle(&mut self) -> Option<Duration> {
        self.health.record_cycle();
        let results = join_all(self.monitors.iter_mut().map(|monitor| {
            let span = monitor.span().clone();
            monitor.poll_once().instrument(span)
        }))
        .await;

        for result in results {
            match result {
                Ok(report) => {
                    self.health.mark_write();
                    info!(
                        array = %report.array_name,
                        "Updated {} ({} hosts, {} with faults)",
                        report.paths.sensor_values.display(),
                        report.hosts,
                        report.non_nominal_hosts
                    );
                }
                Err(e) => {
                    self.health.record_failure();
                    error!("Poll failed: {}", e);
                }
            }
        }

        if self.monitors.iter().any(ArrayMonitor::needs_rediscovery) {
            warn!("Array reconnect exhausted, rediscovering");
            self.health.increment_reconnects();
            self.release_all().await;
            self.set_state(SupervisorState::Connecting);
            return None;
        }
        Some(self.config.poll_interval())
    }

    /// Close every array session and the primary session
    pub async fn release_all(&mut self) {
        for mut monitor in self.monitors.drain(..) {
            monitor.close().await;
        }
        if let Some(primary) = self.primary.take() {
            primary.close().await;
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
