//! Mount, refresh and data sync cycles.

use super::machine;
use crate::bus::{MessageBus, WidgetEvent, WidgetEventKind};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::host::{DataFetcher, HostError, WidgetDriver};
use crate::instance::{InstanceFilter, InstanceStore};
use crate::registry::WidgetRegistry;
use crate::schema::merge_objects;
use crate::telemetry::{performance, ErrorCategory, ErrorRecord, ErrorReport, Telemetry};
use crate::widget::{InstanceId, LoadPriority, WidgetInstance, WidgetStatus, WidgetType};
use chrono::Utc;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// A loading cycle: `loading` followed by `ready` or `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    Mount,
    Refresh,
    Sync,
}

impl CycleKind {
    fn can_start_from(self, status: WidgetStatus) -> bool {
        match self {
            Self::Mount => matches!(status, WidgetStatus::Initializing | WidgetStatus::Error),
            Self::Refresh | Self::Sync => {
                matches!(status, WidgetStatus::Ready | WidgetStatus::Error)
            }
        }
    }

    fn started_event(self) -> WidgetEventKind {
        match self {
            Self::Mount => WidgetEventKind::Mounting,
            Self::Refresh => WidgetEventKind::Refreshing,
            Self::Sync => WidgetEventKind::Syncing,
        }
    }

    fn succeeded_event(self) -> WidgetEventKind {
        match self {
            Self::Mount => WidgetEventKind::Mounted,
            Self::Refresh => WidgetEventKind::Refreshed,
            Self::Sync => WidgetEventKind::DataSynced,
        }
    }

    fn failed_event(self) -> WidgetEventKind {
        match self {
            Self::Mount => WidgetEventKind::MountFailed,
            Self::Refresh => WidgetEventKind::RefreshFailed,
            Self::Sync => WidgetEventKind::SyncFailed,
        }
    }

    fn metric(self) -> &'static str {
        match self {
            Self::Mount => performance::LOAD_TIME,
            Self::Refresh => performance::REFRESH_TIME,
            Self::Sync => performance::SYNC_TIME,
        }
    }

    fn error_category(self) -> ErrorCategory {
        match self {
            Self::Mount => ErrorCategory::Render,
            Self::Refresh => ErrorCategory::Data,
            Self::Sync => ErrorCategory::Network,
        }
    }
}

impl std::fmt::Display for CycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mount => "mount",
            Self::Refresh => "refresh",
            Self::Sync => "sync",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one instance in a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub instance_id: InstanceId,
    /// Status after the cycle; `None` if the cycle was refused
    pub status: Option<WidgetStatus>,
    /// Why the cycle was refused
    pub error: Option<String>,
}

impl CycleResult {
    fn finished(instance_id: InstanceId, status: WidgetStatus) -> Self {
        Self {
            instance_id,
            status: Some(status),
            error: None,
        }
    }

    fn refused(instance_id: InstanceId, error: String) -> Self {
        Self {
            instance_id,
            status: None,
            error: Some(error),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == Some(WidgetStatus::Ready)
    }
}

/// Results of `refresh_all` / `mount_all`, in dispatch order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub results: Vec<CycleResult>,
    /// Instances that ended `ready`
    pub ready_count: usize,
    /// Instances that ended anywhere else, or were refused
    pub failed_count: usize,
}

impl CycleSummary {
    fn from_results(results: Vec<CycleResult>) -> Self {
        let ready_count = results.iter().filter(|r| r.is_ready()).count();
        let failed_count = results.len() - ready_count;
        Self {
            results,
            ready_count,
            failed_count,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_count == 0
    }

    /// Ids that did not end `ready`.
    pub fn failed(&self) -> Vec<&InstanceId> {
        self.results
            .iter()
            .filter(|r| !r.is_ready())
            .map(|r| &r.instance_id)
            .collect()
    }

    pub fn status_of(&self, instance_id: &InstanceId) -> Option<WidgetStatus> {
        self.results
            .iter()
            .find(|r| &r.instance_id == instance_id)
            .and_then(|r| r.status)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Resolves to the final status, or `None` if the instance was deleted mid-cycle.
type CycleFuture = Shared<BoxFuture<'static, Option<WidgetStatus>>>;

/// What a successful cycle produced.
enum CycleOutput {
    Done,
    Fetched(Map<String, Value>),
}

struct ManagerInner {
    registry: Arc<WidgetRegistry>,
    store: Arc<InstanceStore>,
    bus: MessageBus,
    telemetry: Arc<Telemetry>,
    driver: Arc<dyn WidgetDriver>,
    fetcher: Option<Arc<dyn DataFetcher>>,
    cycle_timeout: Option<Duration>,
    max_parallel: usize,
    /// One running cycle per instance
    in_flight: Mutex<HashMap<InstanceId, CycleFuture>>,
}

/// Drives instances through the status state machine.
///
/// Only one loading cycle runs per instance. A mount, refresh or sync
/// requested while another cycle is running awaits that cycle and returns
/// its outcome instead of starting a second one.
///
/// Inside a tokio runtime each cycle runs on its own task, so it finishes
/// even if every caller stops waiting for it.
///
/// Runtime failures are not returned as errors: they are recorded in
/// telemetry, the instance moves to `error` and the call returns
/// `Ok(WidgetStatus::Error)`. `Err` is reserved for unknown ids, refused
/// transitions and instances deleted while their cycle ran.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<ManagerInner>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<WidgetRegistry>,
        store: Arc<InstanceStore>,
        bus: MessageBus,
        telemetry: Arc<Telemetry>,
        driver: Arc<dyn WidgetDriver>,
        fetcher: Option<Arc<dyn DataFetcher>>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                store,
                bus,
                telemetry,
                driver,
                fetcher,
                cycle_timeout: config.mount_timeout(),
                max_parallel: config.max_parallel_refresh.max(1),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Mount an `initializing` or `error` instance.
    pub async fn mount(&self, id: &InstanceId) -> Result<WidgetStatus> {
        self.run_cycle(id, CycleKind::Mount).await
    }

    /// Refresh a `ready` or `error` instance.
    ///
    /// Instances of non-refreshable types are left alone and their current
    /// status is returned.
    pub async fn refresh(&self, id: &InstanceId) -> Result<WidgetStatus> {
        self.run_cycle(id, CycleKind::Refresh).await
    }

    /// Fetch every data source of the instance's type into its data.
    ///
    /// Each body is stored under the source name. A failed fetch or a
    /// non-2xx response fails the whole cycle with a `network` error.
    pub async fn sync_instance_data(&self, id: &InstanceId) -> Result<WidgetStatus> {
        self.run_cycle(id, CycleKind::Sync).await
    }

    /// Whether a cycle is running for the instance.
    pub fn is_cycle_running(&self, id: &InstanceId) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    async fn run_cycle(&self, id: &InstanceId, kind: CycleKind) -> Result<WidgetStatus> {
        let cycle = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            match in_flight.get(id) {
                Some(running) => {
                    debug!(instance_id = %id, cycle = %kind, "Joining running cycle");
                    running.clone()
                }
                None => {
                    let Some((widget, snapshot)) = self.begin_cycle(id, kind)? else {
                        return self.inner.store.require(id).map(|i| i.status());
                    };
                    let cycle = self.spawn_cycle(id, kind, widget, snapshot);
                    in_flight.insert(id.clone(), cycle.clone());
                    cycle
                }
            }
        };
        cycle.await.ok_or_else(|| Error::instance_not_found(id))
    }

    fn spawn_cycle(
        &self,
        id: &InstanceId,
        kind: CycleKind,
        widget: Arc<WidgetType>,
        snapshot: WidgetInstance,
    ) -> CycleFuture {
        let this = self.clone();
        let cycle_id = id.clone();
        let work = async move { this.drive(cycle_id, kind, widget, snapshot).await };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(work);
                let this = self.clone();
                let task_id = id.clone();
                async move {
                    match task.await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(instance_id = %task_id, cycle = %kind, error = %e, "Cycle task aborted");
                            this.inner
                                .in_flight
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&task_id);
                            Some(WidgetStatus::Error)
                        }
                    }
                }
                .boxed()
                .shared()
            }
            Err(_) => work.boxed().shared(),
        }
    }

    /// Move the instance to `loading`. `None` means there is nothing to do.
    fn begin_cycle(
        &self,
        id: &InstanceId,
        kind: CycleKind,
    ) -> Result<Option<(Arc<WidgetType>, WidgetInstance)>> {
        let instance = self.inner.store.require(id)?;
        let widget = self.inner.registry.require(&instance.type_id)?;

        if kind == CycleKind::Refresh && !widget.capabilities.refreshable {
            debug!(instance_id = %id, type_id = %widget.id, "Type is not refreshable, refresh skipped");
            return Ok(None);
        }
        if kind == CycleKind::Sync && self.inner.fetcher.is_none() {
            return Err(Error::Config("no data fetcher configured".to_string()));
        }

        let snapshot = self.inner.store.modify(id, |instance| -> Result<WidgetInstance> {
            let from = instance.status();
            if !kind.can_start_from(from) {
                return Err(Error::invalid_transition(id, from, WidgetStatus::Loading));
            }
            if from == WidgetStatus::Error
                && instance.last_error().is_some_and(|e| !e.recoverable)
            {
                return Err(Error::Unrecoverable {
                    instance_id: id.clone(),
                });
            }
            machine::check_transition(id, from, WidgetStatus::Loading)?;

            instance.state.status = WidgetStatus::Loading;
            instance.state.progress = Some(0.0);
            instance.loading = true;
            if kind == CycleKind::Refresh {
                instance.refresh_count += 1;
            }
            Ok(instance.clone())
        })??;

        debug!(instance_id = %id, cycle = %kind, "Instance loading");
        Ok(Some((widget, snapshot)))
    }

    async fn drive(
        &self,
        id: InstanceId,
        kind: CycleKind,
        widget: Arc<WidgetType>,
        snapshot: WidgetInstance,
    ) -> Option<WidgetStatus> {
        self.inner
            .bus
            .broadcast_event(WidgetEvent::bare(kind.started_event(), &id));

        let started = Instant::now();
        let outcome = self.perform(kind, &widget, &snapshot).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let status = match outcome {
            Ok(output) => self.complete(&id, kind, &widget, output, elapsed_ms),
            Err(error) => self.fail(&id, kind, error, elapsed_ms),
        };

        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        status
    }

    async fn perform(
        &self,
        kind: CycleKind,
        widget: &WidgetType,
        instance: &WidgetInstance,
    ) -> std::result::Result<CycleOutput, HostError> {
        let driver = widget
            .driver
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.inner.driver));

        let work = async {
            match kind {
                CycleKind::Mount => driver.mount(instance, widget).await.map(|()| CycleOutput::Done),
                CycleKind::Refresh => driver
                    .refresh(instance, widget)
                    .await
                    .map(|()| CycleOutput::Done),
                CycleKind::Sync => self.fetch_sources(widget).await.map(CycleOutput::Fetched),
            }
        };
        let work = AssertUnwindSafe(work).catch_unwind();

        let result = match self.inner.cycle_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(HostError::new(format!(
                        "{} timed out after {}ms",
                        kind,
                        limit.as_millis()
                    )))
                }
            },
            None => work.await,
        };
        result.unwrap_or_else(|_| Err(HostError::new(format!("{} panicked", kind))))
    }

    async fn fetch_sources(
        &self,
        widget: &WidgetType,
    ) -> std::result::Result<Map<String, Value>, HostError> {
        let fetcher = self
            .inner
            .fetcher
            .as_ref()
            .ok_or_else(|| HostError::fatal("no data fetcher configured"))?;

        let mut bodies = Map::new();
        for source in &widget.data_sources {
            let response = fetcher.fetch(source).await?;
            if !response.is_success() {
                return Err(HostError::new(format!(
                    "Fetching '{}' from {} returned status {}",
                    source.name, source.url, response.status
                )));
            }
            bodies.insert(source.name.clone(), response.body);
        }
        Ok(bodies)
    }

    fn complete(
        &self,
        id: &InstanceId,
        kind: CycleKind,
        widget: &WidgetType,
        output: CycleOutput,
        elapsed_ms: f64,
    ) -> Option<WidgetStatus> {
        let performance = self.inner.telemetry.performance();
        performance.track(id, kind.metric(), elapsed_ms);
        performance.record_cycle(id, false);

        let now = Utc::now();
        let finished = self.inner.store.modify(id, |instance| {
            instance.loading = false;
            if instance.status() == WidgetStatus::Disabled {
                return (WidgetStatus::Disabled, instance.refresh_count);
            }
            instance.state.status = WidgetStatus::Ready;
            instance.state.progress = Some(1.0);
            match (&output, kind) {
                (CycleOutput::Fetched(bodies), _) => {
                    let base = instance.data.as_object().cloned().unwrap_or_default();
                    instance.data = merge_objects(&base, &Value::Object(bodies.clone()));
                    instance.state.last_fetch = Some(now);
                    instance.state.cache_expiry = widget.cache_strategy.ttl().map(|ttl| now + ttl);
                }
                (CycleOutput::Done, CycleKind::Mount) => instance.mounted_at = Some(now),
                (CycleOutput::Done, _) => {}
            }
            (WidgetStatus::Ready, instance.refresh_count)
        });

        match finished {
            Ok((WidgetStatus::Ready, refresh_count)) => {
                info!(instance_id = %id, cycle = %kind, elapsed_ms, "Instance ready");
                self.inner.bus.broadcast_event(WidgetEvent::new(
                    kind.succeeded_event(),
                    id,
                    json!({
                        "duration_ms": elapsed_ms,
                        "refresh_count": refresh_count,
                    }),
                ));
                Some(WidgetStatus::Ready)
            }
            Ok((status, _)) => {
                debug!(instance_id = %id, cycle = %kind, "Instance disabled during cycle");
                Some(status)
            }
            Err(_) => {
                debug!(instance_id = %id, cycle = %kind, "Instance removed during cycle");
                None
            }
        }
    }

    fn fail(
        &self,
        id: &InstanceId,
        kind: CycleKind,
        error: HostError,
        elapsed_ms: f64,
    ) -> Option<WidgetStatus> {
        warn!(instance_id = %id, cycle = %kind, error = %error, "Cycle failed");

        let performance = self.inner.telemetry.performance();
        performance.track(id, kind.metric(), elapsed_ms);
        performance.record_cycle(id, true);

        let mut report = ErrorReport::new(id, kind.error_category(), error.message);
        report.stack = error.stack;
        report.recoverable = error.recoverable;
        let record = self.record_error(report);

        let finished = self.inner.store.modify(id, |instance| {
            instance.loading = false;
            instance.state.progress = None;
            if instance.status() != WidgetStatus::Disabled {
                instance.state.status = WidgetStatus::Error;
            }
            instance.status()
        });

        match finished {
            Ok(WidgetStatus::Error) => {
                self.inner.bus.broadcast_event(WidgetEvent::new(
                    kind.failed_event(),
                    id,
                    json!({
                        "error_id": record.id,
                        "category": record.category,
                        "message": record.message,
                        "recoverable": record.recoverable,
                    }),
                ));
                Some(WidgetStatus::Error)
            }
            Ok(status) => Some(status),
            Err(_) => {
                debug!(instance_id = %id, cycle = %kind, "Instance removed during cycle");
                None
            }
        }
    }

    /// Log an error globally and on its instance, if the instance exists.
    fn record_error(&self, report: ErrorReport) -> ErrorRecord {
        let record = self.inner.telemetry.report_error(report);
        if let Err(e) = self
            .inner
            .store
            .push_error(&record.instance_id, record.clone())
        {
            debug!(error = %e, "Error not attached to an instance");
        }
        record
    }

    /// Report a host-side error for an instance.
    ///
    /// The record goes to the global log and the instance's own list, and an
    /// `error` event is broadcast. Status is left alone.
    pub fn capture_error(&self, report: ErrorReport) -> ErrorRecord {
        let record = self.record_error(report);
        self.inner.bus.broadcast_event(WidgetEvent::new(
            WidgetEventKind::Error,
            &record.instance_id,
            json!({
                "error_id": record.id,
                "category": record.category,
                "message": record.message,
                "recoverable": record.recoverable,
            }),
        ));
        record
    }

    /// Tear down an instance without deleting it.
    ///
    /// Works from any status and leaves the status unchanged. Clears the
    /// instance's error history and drops its bus subscriptions.
    pub async fn unmount(&self, id: &InstanceId) -> Result<()> {
        let instance = self.inner.store.require(id)?;
        self.inner
            .bus
            .broadcast_event(WidgetEvent::bare(WidgetEventKind::Unmounting, id));

        let driver = self
            .inner
            .registry
            .get(&instance.type_id)
            .and_then(|w| w.driver.clone())
            .unwrap_or_else(|| Arc::clone(&self.inner.driver));
        driver.unmount(&instance).await;

        let cleared = self.inner.store.clear_errors(id).unwrap_or(0);
        self.inner.telemetry.errors().clear(Some(id));
        if let Err(e) = self.inner.store.modify(id, |instance| {
            instance.mounted_at = None;
        }) {
            debug!(instance_id = %id, error = %e, "Instance removed during unmount");
        }
        let handlers = self.inner.bus.unsubscribe_all(id);

        info!(instance_id = %id, cleared, handlers, "Instance unmounted");
        Ok(())
    }

    /// Disable an instance from any status.
    pub fn disable(&self, id: &InstanceId) -> Result<WidgetStatus> {
        let from = self.inner.store.modify(id, |instance| -> Result<WidgetStatus> {
            let from = instance.status();
            machine::check_transition(id, from, WidgetStatus::Disabled)?;
            instance.state.status = WidgetStatus::Disabled;
            instance.loading = false;
            Ok(from)
        })??;

        if from != WidgetStatus::Disabled {
            info!(instance_id = %id, from = %from, "Instance disabled");
            self.inner.bus.broadcast_event(WidgetEvent::new(
                WidgetEventKind::Disabled,
                id,
                json!({ "from": from }),
            ));
        }
        Ok(WidgetStatus::Disabled)
    }

    /// Refresh every matching `ready` or `error` instance of a refreshable type.
    ///
    /// Cycles run concurrently, bounded by `max_parallel_refresh`. A failing
    /// instance never stops the others.
    pub async fn refresh_all(&self, filter: &InstanceFilter) -> CycleSummary {
        let ids: Vec<InstanceId> = self
            .inner
            .store
            .list(filter)
            .into_iter()
            .filter(|i| matches!(i.status(), WidgetStatus::Ready | WidgetStatus::Error))
            .filter(|i| {
                self.inner
                    .registry
                    .get(&i.type_id)
                    .is_some_and(|w| w.capabilities.refreshable)
            })
            .map(|i| i.id)
            .collect();

        debug!(count = ids.len(), "Refreshing instances");
        self.fan_out(ids, CycleKind::Refresh).await
    }

    /// Mount every matching `initializing` instance, highest load priority first.
    pub async fn mount_all(&self, filter: &InstanceFilter) -> CycleSummary {
        let mut instances: Vec<(LoadPriority, InstanceId)> = self
            .inner
            .store
            .list(filter)
            .into_iter()
            .filter(|i| i.status() == WidgetStatus::Initializing)
            .map(|i| {
                let priority = self
                    .inner
                    .registry
                    .get(&i.type_id)
                    .map_or(LoadPriority::Lazy, |w| w.load_priority);
                (priority, i.id)
            })
            .collect();
        instances.sort_by_key(|(priority, _)| *priority);

        debug!(count = instances.len(), "Mounting instances");
        self.fan_out(
            instances.into_iter().map(|(_, id)| id).collect(),
            CycleKind::Mount,
        )
        .await
    }

    async fn fan_out(&self, ids: Vec<InstanceId>, kind: CycleKind) -> CycleSummary {
        if ids.is_empty() {
            return CycleSummary::default();
        }

        let semaphore = Arc::new(Semaphore::new(self.inner.max_parallel));
        let tasks = ids.into_iter().map(|id| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.ok();
                match self.run_cycle(&id, kind).await {
                    Ok(status) => CycleResult::finished(id, status),
                    Err(e) => {
                        warn!(instance_id = %id, cycle = %kind, error = %e, "Cycle refused");
                        CycleResult::refused(id, e.to_string())
                    }
                }
            }
        });

        let summary = CycleSummary::from_results(join_all(tasks).await);
        info!(
            cycle = %kind,
            ready = summary.ready_count,
            failed = summary.failed_count,
            "Fan-out finished"
        );
        summary
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("cycle_timeout", &self.inner.cycle_timeout)
            .field("max_parallel", &self.inner.max_parallel)
            .field("has_fetcher", &self.inner.fetcher.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FetchResponse, NoopDriver};
    use crate::widget::{CacheStrategy, DataSource, Placement, WidgetCategory};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver that counts calls and fails on demand.
    #[derive(Default)]
    struct ScriptedDriver {
        mounts: AtomicUsize,
        fail_mount: Option<HostError>,
        fail_refresh: Option<HostError>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl WidgetDriver for ScriptedDriver {
        async fn mount(
            &self,
            _instance: &WidgetInstance,
            _widget_type: &WidgetType,
        ) -> std::result::Result<(), HostError> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.fail_mount {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn refresh(
            &self,
            _instance: &WidgetInstance,
            _widget_type: &WidgetType,
        ) -> std::result::Result<(), HostError> {
            match &self.fail_refresh {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    struct StaticFetcher {
        status: u16,
    }

    #[async_trait]
    impl DataFetcher for StaticFetcher {
        async fn fetch(&self, source: &DataSource) -> std::result::Result<FetchResponse, HostError> {
            Ok(FetchResponse::with_status(
                self.status,
                json!({ "from": source.url }),
            ))
        }
    }

    struct Harness {
        manager: LifecycleManager,
        store: Arc<InstanceStore>,
        telemetry: Arc<Telemetry>,
        bus: MessageBus,
    }

    fn harness_with(
        driver: Arc<dyn WidgetDriver>,
        fetcher: Option<Arc<dyn DataFetcher>>,
        config: OrchestratorConfig,
    ) -> Harness {
        let registry = Arc::new(WidgetRegistry::new());
        registry
            .register(WidgetType::new("counter", "Counter", WidgetCategory::Display).refreshable(true))
            .unwrap();
        registry
            .register(WidgetType::new("banner", "Banner", WidgetCategory::Display))
            .unwrap();
        registry
            .register(
                WidgetType::new("rsvp", "RSVP", WidgetCategory::Data)
                    .with_data_source(DataSource::new("guests", "/api/guests"))
                    .with_cache_strategy(CacheStrategy::Memory { ttl_secs: 60 }),
            )
            .unwrap();
        let bus = MessageBus::new(100);
        let store = InstanceStore::new(Arc::clone(&registry), bus.clone(), 5, 20);
        let telemetry = Arc::new(Telemetry::new(50));
        let manager = LifecycleManager::new(
            registry,
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&telemetry),
            driver,
            fetcher,
            &config,
        );
        Harness {
            manager,
            store,
            telemetry,
            bus,
        }
    }

    fn harness(driver: Arc<dyn WidgetDriver>) -> Harness {
        harness_with(driver, None, OrchestratorConfig::default())
    }

    fn create(h: &Harness, type_id: &str) -> InstanceId {
        h.store
            .create(&type_id.into(), Placement::section("hero"), Value::Null)
            .unwrap()
    }

    #[tokio::test]
    async fn test_mount_and_refresh() {
        let h = harness(Arc::new(NoopDriver));
        let id = create(&h, "counter");

        assert_eq!(h.manager.mount(&id).await.unwrap(), WidgetStatus::Ready);
        let instance = h.store.get(&id).unwrap();
        assert!(instance.mounted_at.is_some());
        assert!(!instance.loading);
        assert!(h.telemetry.performance().get(&id, performance::LOAD_TIME).is_some());

        assert_eq!(h.manager.refresh(&id).await.unwrap(), WidgetStatus::Ready);
        assert_eq!(h.store.get(&id).unwrap().refresh_count, 1);
        assert_eq!(
            h.telemetry.performance().get(&id, performance::ERROR_RATE),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_mount_requires_initializing_or_error() {
        let h = harness(Arc::new(NoopDriver));
        let id = create(&h, "counter");
        h.manager.mount(&id).await.unwrap();

        let err = h.manager.mount(&id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: WidgetStatus::Ready,
                to: WidgetStatus::Loading,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_refresh_before_mount_is_refused() {
        let h = harness(Arc::new(NoopDriver));
        let id = create(&h, "counter");
        assert!(matches!(
            h.manager.refresh(&id).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_of_non_refreshable_type_is_noop() {
        let h = harness(Arc::new(NoopDriver));
        let id = create(&h, "banner");
        h.manager.mount(&id).await.unwrap();

        assert_eq!(h.manager.refresh(&id).await.unwrap(), WidgetStatus::Ready);
        assert_eq!(h.store.get(&id).unwrap().refresh_count, 0);
        assert_eq!(h.telemetry.performance().sample_count(performance::REFRESH_TIME), 0);
    }

    #[tokio::test]
    async fn test_failed_mount_is_captured() {
        let driver = ScriptedDriver {
            fail_mount: Some(HostError::new("template missing")),
            ..ScriptedDriver::default()
        };
        let h = harness(Arc::new(driver));
        let id = create(&h, "counter");

        assert_eq!(h.manager.mount(&id).await.unwrap(), WidgetStatus::Error);

        let instance = h.store.get(&id).unwrap();
        let error = instance.last_error().unwrap();
        assert_eq!(error.category, ErrorCategory::Render);
        assert_eq!(error.message, "template missing");
        assert_eq!(h.telemetry.errors().for_instance(&id).len(), 1);
        assert_eq!(
            h.telemetry.performance().get(&id, performance::ERROR_RATE),
            Some(1.0)
        );
        assert!(h
            .bus
            .history()
            .iter()
            .any(|m| m.action == "widget.mount_failed"));
    }

    #[tokio::test]
    async fn test_recoverable_error_allows_retry() {
        let h = harness(Arc::new(ScriptedDriver {
            fail_mount: Some(HostError::new("flaky")),
            ..ScriptedDriver::default()
        }));
        let id = create(&h, "counter");
        h.manager.mount(&id).await.unwrap();

        // Still failing, but the retry itself is allowed.
        assert_eq!(h.manager.mount(&id).await.unwrap(), WidgetStatus::Error);
        assert_eq!(h.store.get(&id).unwrap().errors.len(), 2);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_blocks_retry() {
        let h = harness(Arc::new(ScriptedDriver {
            fail_mount: Some(HostError::fatal("permission revoked")),
            ..ScriptedDriver::default()
        }));
        let id = create(&h, "counter");
        h.manager.mount(&id).await.unwrap();

        assert!(matches!(
            h.manager.mount(&id).await,
            Err(Error::Unrecoverable { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_mounts_share_one_cycle() {
        let driver = Arc::new(ScriptedDriver {
            delay: Some(Duration::from_millis(20)),
            ..ScriptedDriver::default()
        });
        let h = harness(Arc::clone(&driver) as Arc<dyn WidgetDriver>);
        let id = create(&h, "counter");

        let (a, b) = tokio::join!(h.manager.mount(&id), h.manager.mount(&id));

        assert_eq!(a.unwrap(), WidgetStatus::Ready);
        assert_eq!(b.unwrap(), WidgetStatus::Ready);
        assert_eq!(driver.mounts.load(Ordering::SeqCst), 1);
        assert_eq!(h.telemetry.performance().sample_count(performance::LOAD_TIME), 1);
        assert!(!h.manager.is_cycle_running(&id));
    }

    #[tokio::test]
    async fn test_cycle_timeout() {
        let driver = ScriptedDriver {
            delay: Some(Duration::from_millis(200)),
            ..ScriptedDriver::default()
        };
        let h = harness_with(
            Arc::new(driver),
            None,
            OrchestratorConfig::default().with_mount_timeout_ms(10),
        );
        let id = create(&h, "counter");

        assert_eq!(h.manager.mount(&id).await.unwrap(), WidgetStatus::Error);
        let instance = h.store.get(&id).unwrap();
        assert!(instance.last_error().unwrap().message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_mount_still_finishes() {
        let driver = Arc::new(ScriptedDriver {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedDriver::default()
        });
        let h = harness(Arc::clone(&driver) as Arc<dyn WidgetDriver>);
        let id = create(&h, "counter");

        let abandoned = tokio::time::timeout(Duration::from_millis(5), h.manager.mount(&id)).await;
        assert!(abandoned.is_err());
        assert!(h.manager.is_cycle_running(&id));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.store.get(&id).unwrap().status(), WidgetStatus::Ready);
        assert!(!h.manager.is_cycle_running(&id));
        assert_eq!(driver.mounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_deleted_during_cycle() {
        let driver = ScriptedDriver {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedDriver::default()
        };
        let h = harness(Arc::new(driver));
        let id = create(&h, "counter");

        let manager = h.manager.clone();
        let mount_id = id.clone();
        let mount = tokio::spawn(async move { manager.mount(&mount_id).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.store.delete(&id));

        let outcome = mount.await.unwrap();
        assert!(matches!(outcome, Err(Error::InstanceNotFound { .. })));
        assert!(!h.manager.is_cycle_running(&id));
    }

    #[tokio::test]
    async fn test_refresh_all_partial_failure() {
        let h = harness(Arc::new(NoopDriver));
        let ids: Vec<_> = (0..3).map(|_| create(&h, "counter")).collect();
        for id in &ids {
            h.manager.mount(id).await.unwrap();
        }
        let skipped = create(&h, "banner");
        h.manager.mount(&skipped).await.unwrap();

        let summary = h.manager.refresh_all(&InstanceFilter::new()).await;

        assert_eq!(summary.len(), 3);
        assert!(summary.all_succeeded());
        assert!(summary.status_of(&skipped).is_none());
    }

    #[tokio::test]
    async fn test_mount_all_mounts_initializing_only() {
        let h = harness(Arc::new(NoopDriver));
        let mounted = create(&h, "counter");
        h.manager.mount(&mounted).await.unwrap();
        let fresh = create(&h, "banner");

        let summary = h.manager.mount_all(&InstanceFilter::new()).await;

        assert_eq!(summary.len(), 1);
        assert_eq!(summary.status_of(&fresh), Some(WidgetStatus::Ready));
    }

    #[tokio::test]
    async fn test_sync_stores_bodies_and_cache_expiry() {
        let h = harness_with(
            Arc::new(NoopDriver),
            Some(Arc::new(StaticFetcher { status: 200 })),
            OrchestratorConfig::default(),
        );
        let id = create(&h, "rsvp");
        h.manager.mount(&id).await.unwrap();

        assert_eq!(
            h.manager.sync_instance_data(&id).await.unwrap(),
            WidgetStatus::Ready
        );
        let instance = h.store.get(&id).unwrap();
        assert_eq!(instance.data, json!({"guests": {"from": "/api/guests"}}));
        assert!(instance.state.last_fetch.is_some());
        assert!(instance.state.is_cache_fresh());
    }

    #[tokio::test]
    async fn test_sync_non_success_is_network_error() {
        let h = harness_with(
            Arc::new(NoopDriver),
            Some(Arc::new(StaticFetcher { status: 503 })),
            OrchestratorConfig::default(),
        );
        let id = create(&h, "rsvp");
        h.manager.mount(&id).await.unwrap();

        assert_eq!(
            h.manager.sync_instance_data(&id).await.unwrap(),
            WidgetStatus::Error
        );
        let instance = h.store.get(&id).unwrap();
        assert_eq!(instance.last_error().unwrap().category, ErrorCategory::Network);
        assert!(instance.last_error().unwrap().message.contains("503"));
    }

    #[tokio::test]
    async fn test_sync_without_fetcher_is_config_error() {
        let h = harness(Arc::new(NoopDriver));
        let id = create(&h, "rsvp");
        h.manager.mount(&id).await.unwrap();
        assert!(matches!(
            h.manager.sync_instance_data(&id).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unmount_clears_errors_and_subscriptions() {
        let h = harness(Arc::new(ScriptedDriver {
            fail_mount: Some(HostError::new("boom")),
            ..ScriptedDriver::default()
        }));
        let id = create(&h, "counter");
        let _sub = h.bus.subscribe(&id, |_: &crate::bus::Message| Ok(()));
        h.manager.mount(&id).await.unwrap();

        h.manager.unmount(&id).await.unwrap();

        let instance = h.store.get(&id).unwrap();
        assert!(instance.errors.is_empty());
        assert_eq!(instance.status(), WidgetStatus::Error);
        assert!(h.telemetry.errors().for_instance(&id).is_empty());
        assert_eq!(h.bus.handler_count(&id), 0);
    }

    #[tokio::test]
    async fn test_disable_from_any_status() {
        let h = harness(Arc::new(NoopDriver));
        let id = create(&h, "counter");

        assert_eq!(h.manager.disable(&id).unwrap(), WidgetStatus::Disabled);
        assert_eq!(h.manager.disable(&id).unwrap(), WidgetStatus::Disabled);
        assert!(matches!(
            h.manager.mount(&id).await,
            Err(Error::InvalidTransition { .. })
        ));
        let disabled_events = h
            .bus
            .history()
            .iter()
            .filter(|m| m.action == "widget.disabled")
            .count();
        assert_eq!(disabled_events, 1);
    }

    #[tokio::test]
    async fn test_capture_error_keeps_status() {
        let h = harness(Arc::new(NoopDriver));
        let id = create(&h, "counter");
        h.manager.mount(&id).await.unwrap();

        let record = h
            .manager
            .capture_error(ErrorReport::new(&id, ErrorCategory::Validation, "bad date"));

        let instance = h.store.get(&id).unwrap();
        assert_eq!(instance.status(), WidgetStatus::Ready);
        assert_eq!(instance.last_error().unwrap().id, record.id);
    }
}
