//! The orchestrator facade.
//!
//! [`WidgetOrchestrator`] owns the registry, instance store, message bus,
//! telemetry and lifecycle manager, and wires them together so that every
//! state change emits the matching bus events. Hosts talk only to the facade.
//!
//! ```rust,ignore
//! use widget_core::{Placement, WidgetCategory, WidgetOrchestrator, WidgetType};
//! use serde_json::json;
//!
//! let orchestrator = WidgetOrchestrator::new();
//! orchestrator.register_widget_type(
//!     WidgetType::new("counter", "Counter", WidgetCategory::Display).refreshable(true),
//! )?;
//! let id = orchestrator.create_instance(
//!     &"counter".into(),
//!     Placement::section("hero"),
//!     json!({"title": "Count"}),
//! )?;
//! orchestrator.mount(&id).await?;
//! ```

use crate::bus::{Message, MessageBus, Subscription};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::host::{DataFetcher, NoopDriver, Notifier, WidgetDriver};
use crate::instance::{InstanceFilter, InstanceStore, InstanceUpdate};
use crate::lifecycle::{CycleSummary, LifecycleManager};
use crate::registry::{WidgetFilter, WidgetRegistry};
use crate::schema::merge_objects;
use crate::telemetry::{performance, ErrorRecord, ErrorReport, PerformanceReport, Telemetry};
use crate::widget::{
    InstanceId, Placement, Size, WidgetInstance, WidgetStatus, WidgetType, WidgetTypeId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// What the host can offer a widget type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequirementContext {
    /// Permissions the current user holds
    pub granted_permissions: Vec<String>,
    /// Capabilities the placement expects the type to declare
    pub required_capabilities: Vec<String>,
    /// Space available in the target section
    pub available_size: Option<Size>,
}

impl RequirementContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, permission: impl Into<String>) -> Self {
        self.granted_permissions.push(permission.into());
        self
    }

    pub fn require_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn with_available_size(mut self, size: Size) -> Self {
        self.available_size = Some(size);
        self
    }
}

/// Unmet requirements of a widget type. Empty lists mean satisfied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequirementReport {
    pub type_id: WidgetTypeId,
    pub missing_permissions: Vec<String>,
    /// Dependency types that are not registered
    pub missing_dependencies: Vec<WidgetTypeId>,
    pub missing_capabilities: Vec<String>,
    pub size_violations: Vec<String>,
}

impl RequirementReport {
    pub fn is_satisfied(&self) -> bool {
        self.missing_permissions.is_empty()
            && self.missing_dependencies.is_empty()
            && self.missing_capabilities.is_empty()
            && self.size_violations.is_empty()
    }
}

/// Builder for [`WidgetOrchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    driver: Option<Arc<dyn WidgetDriver>>,
    fetcher: Option<Arc<dyn DataFetcher>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Default driver for types that do not carry their own.
    pub fn driver(mut self, driver: Arc<dyn WidgetDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Fetcher used by `sync_instance_data`.
    pub fn fetcher(mut self, fetcher: Arc<dyn DataFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Receiver of non-recoverable errors.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> WidgetOrchestrator {
        let config = self.config.normalized();

        let registry = Arc::new(WidgetRegistry::new());
        let bus = MessageBus::new(config.message_history_limit);
        let store = InstanceStore::new(
            Arc::clone(&registry),
            bus.clone(),
            config.instance_error_limit,
            config.instance_event_limit,
        );
        let mut telemetry = Telemetry::new(config.error_log_limit);
        if let Some(notifier) = self.notifier {
            telemetry = telemetry.with_notifier(notifier);
        }
        let telemetry = Arc::new(telemetry);
        let lifecycle = LifecycleManager::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&telemetry),
            self.driver.unwrap_or_else(|| Arc::new(NoopDriver)),
            self.fetcher,
            &config,
        );

        debug!(?config, "Widget orchestrator built");
        WidgetOrchestrator {
            config,
            registry,
            store,
            bus,
            telemetry,
            lifecycle,
        }
    }
}

/// Single entry point composing registry, store, lifecycle, bus and telemetry.
pub struct WidgetOrchestrator {
    config: OrchestratorConfig,
    registry: Arc<WidgetRegistry>,
    store: Arc<InstanceStore>,
    bus: MessageBus,
    telemetry: Arc<Telemetry>,
    lifecycle: LifecycleManager,
}

impl WidgetOrchestrator {
    /// Orchestrator with default configuration and a no-op driver.
    pub fn new() -> Self {
        OrchestratorBuilder::new().build()
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // Registry

    /// Register a widget type. Fails if the id is taken.
    pub fn register_widget_type(&self, widget: WidgetType) -> Result<Arc<WidgetType>> {
        self.registry.register(widget)
    }

    /// Unregister a type and delete every instance of it.
    ///
    /// Each instance gets its `unmount` event before removal. Returns the
    /// number of instances deleted.
    pub fn unregister_widget_type(&self, type_id: &WidgetTypeId) -> Result<usize> {
        if !self.registry.contains(type_id) {
            return Err(Error::type_not_found(type_id));
        }

        let mut removed = 0;
        for id in self.store.ids_of_type(type_id) {
            if self.delete_instance(&id) {
                removed += 1;
            }
        }
        self.registry.unregister(type_id);

        info!(type_id = %type_id, removed, "Widget type unregistered with its instances");
        Ok(removed)
    }

    pub fn get_widget_type(&self, type_id: &WidgetTypeId) -> Option<Arc<WidgetType>> {
        self.registry.get(type_id)
    }

    pub fn list_widget_types(&self, filter: &WidgetFilter) -> Vec<Arc<WidgetType>> {
        self.registry.list(filter)
    }

    // Instances

    /// Create an instance; returns its id. The instance starts `initializing`.
    pub fn create_instance(
        &self,
        type_id: &WidgetTypeId,
        placement: Placement,
        config: Value,
    ) -> Result<InstanceId> {
        self.store.create(type_id, placement, config)
    }

    /// Snapshot of an instance, including any events still queued.
    pub fn get_instance(&self, id: &InstanceId) -> Option<WidgetInstance> {
        self.bus.flush_events();
        self.store.get(id)
    }

    pub fn list_instances(&self, filter: &InstanceFilter) -> Vec<WidgetInstance> {
        self.bus.flush_events();
        self.store.list(filter)
    }

    pub fn update_instance(&self, id: &InstanceId, update: InstanceUpdate) -> Result<WidgetInstance> {
        self.store.update(id, update)
    }

    /// Delete an instance. Unknown ids are ignored.
    pub fn delete_instance(&self, id: &InstanceId) -> bool {
        let removed = self.store.delete(id);
        if removed {
            self.telemetry.performance().remove_instance(id);
        }
        removed
    }

    /// Unmount then delete.
    pub async fn remove_instance(&self, id: &InstanceId) -> Result<bool> {
        self.lifecycle.unmount(id).await?;
        Ok(self.delete_instance(id))
    }

    // Lifecycle

    pub async fn mount(&self, id: &InstanceId) -> Result<WidgetStatus> {
        self.lifecycle.mount(id).await
    }

    pub async fn unmount(&self, id: &InstanceId) -> Result<()> {
        self.lifecycle.unmount(id).await
    }

    pub async fn refresh(&self, id: &InstanceId) -> Result<WidgetStatus> {
        self.lifecycle.refresh(id).await
    }

    pub async fn refresh_all(&self, filter: &InstanceFilter) -> CycleSummary {
        self.lifecycle.refresh_all(filter).await
    }

    pub async fn mount_all(&self, filter: &InstanceFilter) -> CycleSummary {
        self.lifecycle.mount_all(filter).await
    }

    pub async fn sync_instance_data(&self, id: &InstanceId) -> Result<WidgetStatus> {
        self.lifecycle.sync_instance_data(id).await
    }

    pub fn disable(&self, id: &InstanceId) -> Result<WidgetStatus> {
        self.lifecycle.disable(id)
    }

    /// Render a ready instance through its type's renderer.
    pub fn render(&self, id: &InstanceId) -> Result<Value> {
        let instance = self.store.require(id)?;
        if instance.status() != WidgetStatus::Ready {
            return Err(Error::NotReady {
                instance_id: id.clone(),
                status: instance.status(),
            });
        }
        let widget = self.registry.require(&instance.type_id)?;
        let renderer = widget.renderer.as_ref().ok_or_else(|| {
            Error::Config(format!("widget type '{}' has no renderer", widget.id))
        })?;

        let started = Instant::now();
        let element = renderer.render(&instance);
        self.telemetry.performance().track(
            id,
            performance::RENDER_TIME,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(element)
    }

    // Messaging

    pub fn subscribe<F>(&self, instance_id: impl Into<InstanceId>, handler: F) -> Subscription
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(instance_id, handler)
    }

    /// Send a message; returns how many handlers accepted it.
    pub fn send_message(&self, message: Message) -> usize {
        self.bus.send(message)
    }

    pub fn broadcast(
        &self,
        sender: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> usize {
        self.bus.send(Message::broadcast(sender, action, payload))
    }

    pub fn send_direct(
        &self,
        sender: impl Into<String>,
        recipient: impl Into<InstanceId>,
        action: impl Into<String>,
        payload: Value,
    ) -> usize {
        self.bus
            .send(Message::direct(sender, recipient, action, payload))
    }

    pub fn message_history(&self) -> Vec<Message> {
        self.bus.history()
    }

    /// Write queued lifecycle events into instance histories now.
    pub fn flush_events(&self) -> usize {
        self.bus.flush_events()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    // Telemetry

    /// Report a host-side error for an instance.
    pub fn report_error(&self, report: ErrorReport) -> ErrorRecord {
        self.lifecycle.capture_error(report)
    }

    /// Errors for one instance, or the whole global log.
    pub fn get_errors(&self, instance_id: Option<&InstanceId>) -> Vec<ErrorRecord> {
        match instance_id {
            Some(id) => self.telemetry.errors().for_instance(id),
            None => self.telemetry.errors().all(),
        }
    }

    /// Clear errors for one instance or everywhere. Returns how many global
    /// log entries were removed.
    pub fn clear_errors(&self, instance_id: Option<&InstanceId>) -> usize {
        let ids = match instance_id {
            Some(id) => vec![id.clone()],
            None => self
                .store
                .list(&InstanceFilter::new())
                .into_iter()
                .map(|i| i.id)
                .collect(),
        };
        for id in &ids {
            if let Err(e) = self.store.clear_errors(id) {
                debug!(instance_id = %id, error = %e, "No instance errors to clear");
            }
        }
        self.telemetry.errors().clear(instance_id)
    }

    pub fn track_performance(&self, instance_id: &InstanceId, metric: &str, value: f64) {
        self.telemetry.performance().track(instance_id, metric, value);
    }

    pub fn performance_metrics(&self, instance_id: Option<&InstanceId>) -> PerformanceReport {
        self.telemetry.performance_report(instance_id)
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    // Validation

    /// Check a configuration the way `create_instance` would.
    pub fn validate_configuration(&self, type_id: &WidgetTypeId, config: &Value) -> Result<()> {
        let widget = self.registry.require(type_id)?;
        let merged = merge_objects(&widget.merged_defaults(), config);
        widget
            .schema
            .validate(&merged)
            .map_err(|violations| Error::invalid_configuration(type_id, violations))
    }

    /// Check permissions, dependencies, capabilities and size of a type.
    pub fn validate_requirements(
        &self,
        type_id: &WidgetTypeId,
        context: &RequirementContext,
    ) -> Result<RequirementReport> {
        let widget = self.registry.require(type_id)?;

        let missing_permissions = widget
            .permissions
            .iter()
            .filter(|p| !context.granted_permissions.contains(p))
            .cloned()
            .collect();
        let missing_dependencies = widget
            .dependencies
            .iter()
            .filter(|d| !self.registry.contains(d))
            .cloned()
            .collect();
        let missing_capabilities = context
            .required_capabilities
            .iter()
            .filter(|c| !widget.capabilities.has(c))
            .cloned()
            .collect();

        let requirements = &widget.requirements;
        let mut size_violations = Vec::new();
        if let Some(max) = requirements.max_size {
            if !requirements.min_size.fits_within(&max) {
                size_violations.push(format!(
                    "minimum size {}x{} exceeds maximum size {}x{}",
                    requirements.min_size.width,
                    requirements.min_size.height,
                    max.width,
                    max.height
                ));
            }
        }
        if let Some(available) = context.available_size {
            if !requirements.min_size.fits_within(&available) {
                size_violations.push(format!(
                    "minimum size {}x{} does not fit available {}x{}",
                    requirements.min_size.width,
                    requirements.min_size.height,
                    available.width,
                    available.height
                ));
            }
        }

        Ok(RequirementReport {
            type_id: type_id.clone(),
            missing_permissions,
            missing_dependencies,
            missing_capabilities,
            size_violations,
        })
    }
}

impl Default for WidgetOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WidgetOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetOrchestrator")
            .field("types", &self.registry.len())
            .field("instances", &self.store.len())
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}
