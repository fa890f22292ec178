//! In-memory instance store.

use crate::bus::{EventSink, MessageBus, WidgetEvent, WidgetEventKind};
use crate::error::{Error, Result};
use crate::registry::WidgetRegistry;
use crate::schema::merge_objects;
use crate::telemetry::ErrorRecord;
use crate::widget::{
    push_bounded, Geometry, InstanceId, Placement, Position, WidgetInstance, WidgetState,
    WidgetStatus, WidgetTypeId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, info};

/// How an update treats the existing data payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "lowercase")]
pub enum DataUpdate {
    /// Replace the payload wholesale
    Replace(Value),
    /// Shallow-merge object keys into the existing payload
    Merge(Value),
}

/// Partial update applied by [`InstanceStore::update`].
///
/// Unset fields are left alone. `config` is merged into the current
/// configuration and revalidated; `state` is replaced wholesale but must
/// keep the current status, which only the lifecycle manager changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<WidgetState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive: Option<bool>,
}

impl InstanceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn replace_data(mut self, data: Value) -> Self {
        self.data = Some(DataUpdate::Replace(data));
        self
    }

    pub fn merge_data(mut self, data: Value) -> Self {
        self.data = Some(DataUpdate::Merge(data));
        self
    }

    pub fn state(mut self, state: WidgetState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = Some(visible);
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = Some(interactive);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Filter for instance listings. Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceFilter {
    pub template_id: Option<String>,
    pub section_id: Option<String>,
    pub type_id: Option<WidgetTypeId>,
    pub status: Option<WidgetStatus>,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn section(mut self, section_id: impl Into<String>) -> Self {
        self.section_id = Some(section_id.into());
        self
    }

    pub fn type_id(mut self, type_id: impl Into<WidgetTypeId>) -> Self {
        self.type_id = Some(type_id.into());
        self
    }

    pub fn status(mut self, status: WidgetStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, instance: &WidgetInstance) -> bool {
        self.template_id
            .as_ref()
            .map_or(true, |t| instance.placement.template_id.as_ref() == Some(t))
            && self
                .section_id
                .as_ref()
                .map_or(true, |s| &instance.placement.section_id == s)
            && self
                .type_id
                .as_ref()
                .map_or(true, |t| &instance.type_id == t)
            && self.status.map_or(true, |s| instance.status() == s)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    instances: HashMap<InstanceId, WidgetInstance>,
    /// Creation order
    order: Vec<InstanceId>,
}

/// Owns every widget instance.
///
/// Creation validates against the registry; every mutation is announced on
/// the bus. Lifecycle events broadcast on the bus come back through
/// [`EventSink`] and land in each instance's bounded event history.
pub struct InstanceStore {
    registry: Arc<WidgetRegistry>,
    bus: MessageBus,
    state: RwLock<StoreState>,
    sequence: AtomicU64,
    error_limit: usize,
    event_limit: usize,
}

impl InstanceStore {
    /// Create a store and attach it to the bus as the event sink.
    pub fn new(
        registry: Arc<WidgetRegistry>,
        bus: MessageBus,
        error_limit: usize,
        event_limit: usize,
    ) -> Arc<Self> {
        let store = Arc::new(Self {
            registry,
            bus,
            state: RwLock::new(StoreState::default()),
            sequence: AtomicU64::new(0),
            error_limit: error_limit.max(1),
            event_limit: event_limit.max(1),
        });
        let sink: Weak<dyn EventSink> = Arc::downgrade(&store) as Weak<dyn EventSink>;
        store.bus.attach_event_sink(sink);
        store
    }

    /// Create an instance of a registered type.
    ///
    /// `overrides` is layered over the type's defaults and the merged
    /// configuration must pass the type's schema. Every violation is reported.
    pub fn create(
        &self,
        type_id: &WidgetTypeId,
        placement: Placement,
        overrides: Value,
    ) -> Result<InstanceId> {
        let widget = self.registry.require(type_id)?;

        let config = merge_objects(&widget.merged_defaults(), &overrides);
        widget
            .schema
            .validate(&config)
            .map_err(|violations| Error::invalid_configuration(type_id, violations))?;

        let id = InstanceId::generate(self.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let z_index = state
                .instances
                .values()
                .filter(|i| i.placement.section_id == placement.section_id)
                .count() as i32;
            let geometry = Geometry {
                position: Position::default(),
                size: widget.requirements.clamp(widget.requirements.min_size),
                z_index,
            };
            let instance = WidgetInstance::new(
                id.clone(),
                type_id.clone(),
                placement.clone(),
                geometry,
                config,
            );
            state.instances.insert(id.clone(), instance);
            state.order.push(id.clone());
        }

        info!(instance_id = %id, type_id = %type_id, section = %placement.section_id, "Widget instance created");
        self.bus.broadcast_event(WidgetEvent::new(
            WidgetEventKind::Created,
            &id,
            json!({
                "type_id": type_id,
                "placement": placement,
            }),
        ));
        Ok(id)
    }

    /// Apply a partial update and announce the delta.
    pub fn update(&self, id: &InstanceId, update: InstanceUpdate) -> Result<WidgetInstance> {
        let delta = serde_json::to_value(&update)?;

        let updated = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let instance = state
                .instances
                .get_mut(id)
                .ok_or_else(|| Error::instance_not_found(id))?;

            // Validate everything before touching the instance.
            let config = match &update.config {
                Some(overrides) => Some(self.revalidate_config(instance, overrides)?),
                None => None,
            };
            if let Some(new_state) = &update.state {
                if new_state.status != instance.state.status {
                    return Err(Error::StatusLocked {
                        instance_id: id.clone(),
                        status: instance.state.status,
                    });
                }
            }

            if let Some(config) = config {
                instance.config = config;
            }
            if let Some(data) = update.data {
                instance.data = apply_data_update(&instance.data, data);
            }
            if let Some(new_state) = update.state {
                instance.state = new_state;
            }
            if let Some(geometry) = update.geometry {
                instance.geometry = geometry;
            }
            if let Some(visible) = update.visible {
                instance.visible = visible;
            }
            if let Some(interactive) = update.interactive {
                instance.interactive = interactive;
            }
            instance.touch();
            instance.clone()
        };

        debug!(instance_id = %id, "Widget instance updated");
        self.bus
            .broadcast_event(WidgetEvent::new(WidgetEventKind::Updated, id, delta));
        Ok(updated)
    }

    fn revalidate_config(&self, instance: &WidgetInstance, overrides: &Value) -> Result<Value> {
        let current = instance.config.as_object().cloned().unwrap_or_default();
        let merged = merge_objects(&current, overrides);
        // A type unregistered after creation can no longer validate; keep the merge.
        if let Some(widget) = self.registry.get(&instance.type_id) {
            widget
                .schema
                .validate(&merged)
                .map_err(|violations| Error::invalid_configuration(&instance.type_id, violations))?;
        }
        Ok(merged)
    }

    /// Remove an instance. Missing ids are a no-op.
    ///
    /// The `unmount` event goes out before removal and the instance's bus
    /// subscriptions are dropped afterwards.
    pub fn delete(&self, id: &InstanceId) -> bool {
        if !self.contains(id) {
            debug!(instance_id = %id, "Delete of unknown instance ignored");
            return false;
        }

        self.bus
            .broadcast_event(WidgetEvent::bare(WidgetEventKind::Unmount, id));

        let removed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.order.retain(|i| i != id);
            state.instances.remove(id).is_some()
        };
        let handlers = self.bus.unsubscribe_all(id);
        info!(instance_id = %id, handlers, "Widget instance deleted");
        removed
    }

    /// Snapshot of one instance.
    pub fn get(&self, id: &InstanceId) -> Option<WidgetInstance> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .get(id)
            .cloned()
    }

    /// Like [`get`](Self::get) but fails with `InstanceNotFound`.
    pub fn require(&self, id: &InstanceId) -> Result<WidgetInstance> {
        self.get(id).ok_or_else(|| Error::instance_not_found(id))
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .contains_key(id)
    }

    /// Snapshots of matching instances in creation order.
    pub fn list(&self, filter: &InstanceFilter) -> Vec<WidgetInstance> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .order
            .iter()
            .filter_map(|id| state.instances.get(id))
            .filter(|i| filter.matches(i))
            .cloned()
            .collect()
    }

    /// Ids of every instance of a type.
    pub fn ids_of_type(&self, type_id: &WidgetTypeId) -> Vec<InstanceId> {
        self.list(&InstanceFilter::new().type_id(type_id))
            .into_iter()
            .map(|i| i.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the live instance and bump `updated_at`.
    ///
    /// Status changes made here bypass [`update`](Self::update) and emit no
    /// event; callers own both.
    pub(crate) fn modify<R>(
        &self,
        id: &InstanceId,
        f: impl FnOnce(&mut WidgetInstance) -> R,
    ) -> Result<R> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::instance_not_found(id))?;
        let result = f(instance);
        instance.touch();
        Ok(result)
    }

    /// Append to the instance's bounded error list.
    pub(crate) fn push_error(&self, id: &InstanceId, record: ErrorRecord) -> Result<()> {
        let limit = self.error_limit;
        self.modify(id, |instance| push_bounded(&mut instance.errors, record, limit))
    }

    /// Drop the instance's error list. Returns how many were removed.
    pub(crate) fn clear_errors(&self, id: &InstanceId) -> Result<usize> {
        self.modify(id, |instance| {
            let count = instance.errors.len();
            instance.errors.clear();
            count
        })
    }
}

impl EventSink for InstanceStore {
    fn append_events(&self, events: Vec<WidgetEvent>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            // Events for deleted instances have nowhere to go.
            if let Some(instance) = state.instances.get_mut(&event.instance_id) {
                push_bounded(&mut instance.events, event, self.event_limit);
            }
        }
    }
}

impl std::fmt::Debug for InstanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceStore")
            .field("instances", &self.len())
            .field("error_limit", &self.error_limit)
            .field("event_limit", &self.event_limit)
            .finish_non_exhaustive()
    }
}

fn apply_data_update(current: &Value, update: DataUpdate) -> Value {
    match update {
        DataUpdate::Replace(value) => value,
        DataUpdate::Merge(value) => {
            let base: Map<String, Value> = current.as_object().cloned().unwrap_or_default();
            merge_objects(&base, &value)
        }
    }
}
