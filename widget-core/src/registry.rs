//! Registry of widget type definitions.

use crate::error::{Error, Result};
use crate::widget::{WidgetCategory, WidgetType, WidgetTypeId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Filter for [`WidgetRegistry::list`].
///
/// Every set criterion must match. Tags are compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WidgetFilter {
    pub category: Option<WidgetCategory>,
    pub capabilities: Vec<String>,
    pub wedding_stages: Vec<String>,
    pub client_types: Vec<String>,
    /// Case-insensitive substring over name, description and tags
    pub search: Option<String>,
    /// Sort by load priority (stable) instead of insertion order
    pub rank_by_priority: bool,
}

impl WidgetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: WidgetCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn wedding_stage(mut self, stage: impl Into<String>) -> Self {
        self.wedding_stages.push(stage.into());
        self
    }

    pub fn client_type(mut self, client_type: impl Into<String>) -> Self {
        self.client_types.push(client_type.into());
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn rank_by_priority(mut self) -> Self {
        self.rank_by_priority = true;
        self
    }

    /// Whether a type satisfies every criterion.
    pub fn matches(&self, widget: &WidgetType) -> bool {
        if self.category.is_some_and(|c| c != widget.category) {
            return false;
        }
        if !self.capabilities.iter().all(|c| widget.capabilities.has(c)) {
            return false;
        }
        if !contains_all(&widget.metadata.wedding_stages, &self.wedding_stages) {
            return false;
        }
        if !contains_all(&widget.metadata.client_types, &self.client_types) {
            return false;
        }
        match &self.search {
            Some(text) => matches_text(widget, text),
            None => true,
        }
    }
}

fn contains_all(declared: &[String], wanted: &[String]) -> bool {
    wanted
        .iter()
        .all(|w| declared.iter().any(|d| d.eq_ignore_ascii_case(w)))
}

fn matches_text(widget: &WidgetType, text: &str) -> bool {
    let needle = text.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    let meta = &widget.metadata;
    meta.name.to_lowercase().contains(&needle)
        || meta.description.to_lowercase().contains(&needle)
        || meta
            .tags
            .iter()
            .any(|t| t.to_lowercase().contains(&needle))
}

#[derive(Debug, Default)]
struct RegistryState {
    types: HashMap<WidgetTypeId, Arc<WidgetType>>,
    /// Registration order
    order: Vec<WidgetTypeId>,
}

/// Widget type definitions, keyed by id.
///
/// Registering an id twice is an error; unregister first to replace a type.
/// Removing a type does not touch instances. The orchestrator handles the
/// cascade.
#[derive(Debug, Default)]
pub struct WidgetRegistry {
    state: RwLock<RegistryState>,
}

impl WidgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type.
    pub fn register(&self, widget: WidgetType) -> Result<Arc<WidgetType>> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.types.contains_key(&widget.id) {
            return Err(Error::duplicate_type(&widget.id));
        }

        let id = widget.id.clone();
        let widget = Arc::new(widget);
        state.types.insert(id.clone(), Arc::clone(&widget));
        state.order.push(id.clone());
        debug!(type_id = %id, category = %widget.category, "Widget type registered");
        Ok(widget)
    }

    /// Remove a type, returning it if it was registered.
    pub fn unregister(&self, id: &WidgetTypeId) -> Option<Arc<WidgetType>> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let removed = state.types.remove(id)?;
        state.order.retain(|t| t != id);
        debug!(type_id = %id, "Widget type unregistered");
        Some(removed)
    }

    pub fn get(&self, id: &WidgetTypeId) -> Option<Arc<WidgetType>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .types
            .get(id)
            .cloned()
    }

    /// Like [`get`](Self::get) but fails with `TypeNotFound`.
    pub fn require(&self, id: &WidgetTypeId) -> Result<Arc<WidgetType>> {
        self.get(id).ok_or_else(|| Error::type_not_found(id))
    }

    pub fn contains(&self, id: &WidgetTypeId) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .types
            .contains_key(id)
    }

    /// Types matching the filter, in registration order unless ranked.
    pub fn list(&self, filter: &WidgetFilter) -> Vec<Arc<WidgetType>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<_> = state
            .order
            .iter()
            .filter_map(|id| state.types.get(id))
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();

        if filter.rank_by_priority {
            matches.sort_by_key(|w| w.load_priority);
        }
        matches
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<WidgetTypeId> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
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
}
