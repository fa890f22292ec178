//! Core data model: widget types, instances and lifecycle state.

use crate::bus::WidgetEvent;
use crate::host::{Renderer, WidgetDriver};
use crate::schema::{ConfigSchema, WidgetConfig};
use crate::telemetry::ErrorRecord;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Identifier of a registered widget type (e.g. `"countdown"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetTypeId(pub String);

impl WidgetTypeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WidgetTypeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WidgetTypeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&WidgetTypeId> for WidgetTypeId {
    fn from(id: &WidgetTypeId) -> Self {
        id.clone()
    }
}

impl std::fmt::Display for WidgetTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a widget instance.
///
/// Generated ids look like `widget_42_1f3a9c2e`: a process-wide counter
/// followed by a random suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a fresh id from a sequence number.
    pub(crate) fn generate(sequence: u64) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("widget_{}_{}", sequence, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&InstanceId> for InstanceId {
    fn from(id: &InstanceId) -> Self {
        id.clone()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Functional category of a widget type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetCategory {
    Data,
    Display,
    Input,
    Navigation,
    Media,
    Communication,
    Analytics,
}

impl std::fmt::Display for WidgetCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Data => "data",
            Self::Display => "display",
            Self::Input => "input",
            Self::Navigation => "navigation",
            Self::Media => "media",
            Self::Communication => "communication",
            Self::Analytics => "analytics",
        };
        write!(f, "{}", s)
    }
}

/// Descriptive metadata used for discovery in the template builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetMetadata {
    /// Display name
    pub name: String,
    /// Short description
    #[serde(default)]
    pub description: String,
    /// Semantic version of the widget implementation
    #[serde(default)]
    pub version: String,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Wedding stages the widget is relevant for (e.g. "planning", "day-of")
    #[serde(default)]
    pub wedding_stages: Vec<String>,
    /// Client types the widget is meant for (e.g. "couple", "vendor")
    #[serde(default)]
    pub client_types: Vec<String>,
}

/// Capabilities a widget type declares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetCapabilities {
    /// Supports refresh cycles
    pub refreshable: bool,
    /// Exposes a user-editable configuration
    pub configurable: bool,
    /// Can be resized by the layout
    pub resizable: bool,
    /// Can export its data
    pub exportable: bool,
    /// Additional capability tags
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WidgetCapabilities {
    /// Whether the named capability is declared, either as a flag or a tag.
    pub fn has(&self, capability: &str) -> bool {
        match capability {
            "refreshable" => self.refreshable,
            "configurable" => self.configurable,
            "resizable" => self.resizable,
            "exportable" => self.exportable,
            other => self.tags.iter().any(|t| t.eq_ignore_ascii_case(other)),
        }
    }
}

/// Width and height in layout units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether this size fits inside `other` in both dimensions.
    pub fn fits_within(&self, other: &Size) -> bool {
        self.width <= other.width && self.height <= other.height
    }
}

/// Grid position of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

/// Placement geometry of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub position: Position,
    pub size: Size,
    /// Stacking order within the section
    pub z_index: i32,
}

/// Structural requirements of a widget type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetRequirements {
    /// Smallest usable size; new instances start here
    pub min_size: Size,
    /// Largest allowed size
    pub max_size: Option<Size>,
    /// Adapts to its container width
    pub responsive: bool,
}

impl Default for WidgetRequirements {
    fn default() -> Self {
        Self {
            min_size: Size::new(1, 1),
            max_size: None,
            responsive: true,
        }
    }
}

impl WidgetRequirements {
    /// Clamp a requested size into the allowed range.
    pub fn clamp(&self, size: Size) -> Size {
        let mut clamped = Size::new(
            size.width.max(self.min_size.width),
            size.height.max(self.min_size.height),
        );
        if let Some(max) = self.max_size {
            clamped.width = clamped.width.min(max.width);
            clamped.height = clamped.height.min(max.height);
        }
        clamped
    }
}

/// Load priority hint. Lower variants load first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LoadPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Lazy,
}

/// Cache strategy hint for fetched widget data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Always refetch
    #[default]
    None,
    /// Keep fetched data in memory for `ttl_secs`
    Memory { ttl_secs: u64 },
    /// Host may persist fetched data for `ttl_secs`
    Persistent { ttl_secs: u64 },
}

impl CacheStrategy {
    /// Lifetime of fetched data, if it may be cached at all.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Memory { ttl_secs } | Self::Persistent { ttl_secs } => {
                Some(Duration::seconds(*ttl_secs as i64))
            }
        }
    }
}

/// A named remote data source the data fetcher resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    /// Key under which the fetched body is stored in instance data
    pub name: String,
    /// Endpoint, interpreted by the host's fetcher
    pub url: String,
}

impl DataSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// A registered widget type definition.
///
/// Immutable once registered; the registry hands out `Arc<WidgetType>`.
#[derive(Clone, Serialize, Deserialize)]
pub struct WidgetType {
    /// Unique id
    pub id: WidgetTypeId,
    /// Functional category
    pub category: WidgetCategory,
    /// Discovery metadata
    pub metadata: WidgetMetadata,
    /// Declared capabilities
    pub capabilities: WidgetCapabilities,
    /// Configuration validator
    pub schema: ConfigSchema,
    /// Default configuration, layered on top of schema defaults
    #[serde(default)]
    pub default_config: Map<String, Value>,
    /// Size and responsiveness requirements
    #[serde(default)]
    pub requirements: WidgetRequirements,
    /// Permissions the host must grant
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Widget types that must be registered alongside this one
    #[serde(default)]
    pub dependencies: Vec<WidgetTypeId>,
    #[serde(default)]
    pub load_priority: LoadPriority,
    #[serde(default)]
    pub cache_strategy: CacheStrategy,
    /// Remote data consumed by `sync_instance_data`
    #[serde(default)]
    pub data_sources: Vec<DataSource>,
    /// Type-specific lifecycle driver; falls back to the orchestrator default
    #[serde(skip)]
    pub driver: Option<Arc<dyn WidgetDriver>>,
    /// Render callback
    #[serde(skip)]
    pub renderer: Option<Arc<dyn Renderer>>,
}

impl WidgetType {
    /// Create a new widget type with an empty, permissive schema.
    pub fn new(
        id: impl Into<WidgetTypeId>,
        name: impl Into<String>,
        category: WidgetCategory,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            metadata: WidgetMetadata {
                name: name.into(),
                ..WidgetMetadata::default()
            },
            capabilities: WidgetCapabilities::default(),
            schema: ConfigSchema::permissive(),
            default_config: Map::new(),
            requirements: WidgetRequirements::default(),
            permissions: Vec::new(),
            dependencies: Vec::new(),
            load_priority: LoadPriority::default(),
            cache_strategy: CacheStrategy::default(),
            data_sources: Vec::new(),
            driver: None,
            renderer: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.metadata.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_wedding_stages(
        mut self,
        stages: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.metadata.wedding_stages = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_client_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.metadata.client_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities(mut self, capabilities: WidgetCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Shorthand for toggling the `refreshable` capability.
    pub fn refreshable(mut self, refreshable: bool) -> Self {
        self.capabilities.refreshable = refreshable;
        self
    }

    pub fn with_schema(mut self, schema: ConfigSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Use the schema of a `WidgetConfig` type.
    pub fn with_config<C: WidgetConfig>(self) -> Self {
        self.with_schema(C::schema())
    }

    pub fn with_default_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_config.insert(key.into(), value.into());
        self
    }

    pub fn with_requirements(mut self, requirements: WidgetRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies(
        mut self,
        dependencies: impl IntoIterator<Item = impl Into<WidgetTypeId>>,
    ) -> Self {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_load_priority(mut self, priority: LoadPriority) -> Self {
        self.load_priority = priority;
        self
    }

    pub fn with_cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    pub fn with_data_source(mut self, source: DataSource) -> Self {
        self.data_sources.push(source);
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn WidgetDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Schema defaults overlaid with the type's default configuration.
    pub fn merged_defaults(&self) -> Map<String, Value> {
        let mut defaults = self.schema.defaults();
        for (key, value) in &self.default_config {
            defaults.insert(key.clone(), value.clone());
        }
        defaults
    }
}

impl std::fmt::Debug for WidgetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetType")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("name", &self.metadata.name)
            .field("capabilities", &self.capabilities)
            .field("load_priority", &self.load_priority)
            .field("has_driver", &self.driver.is_some())
            .field("has_renderer", &self.renderer.is_some())
            .finish_non_exhaustive()
    }
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetStatus {
    Initializing,
    Loading,
    Ready,
    Error,
    Disabled,
}

impl std::fmt::Display for WidgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state value object.
///
/// Only the lifecycle manager changes `status`; everything else requests a
/// transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetState {
    pub status: WidgetStatus,
    /// Progress of the current loading cycle, 0.0 to 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetch: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WidgetState {
    pub fn new(status: WidgetStatus) -> Self {
        Self {
            status,
            progress: None,
            last_fetch: None,
            cache_expiry: None,
            metadata: HashMap::new(),
        }
    }

    /// Whether fetched data is still within its cache lifetime.
    pub fn is_cache_fresh(&self) -> bool {
        self.cache_expiry.map_or(false, |expiry| expiry > Utc::now())
    }
}

impl Default for WidgetState {
    fn default() -> Self {
        Self::new(WidgetStatus::Initializing)
    }
}

/// Where an instance lives in a template.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Placement {
    /// Owning template, if the host tracks several
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Section (container) id
    pub section_id: String,
}

impl Placement {
    pub fn section(section_id: impl Into<String>) -> Self {
        Self {
            template_id: None,
            section_id: section_id.into(),
        }
    }

    pub fn in_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }
}

/// A placement of a widget type with its own configuration, data and state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetInstance {
    pub id: InstanceId,
    pub type_id: WidgetTypeId,
    pub placement: Placement,
    pub geometry: Geometry,
    /// Schema defaults merged with caller overrides
    pub config: Value,
    /// Opaque payload, usually filled by data sync
    pub data: Value,
    pub state: WidgetState,
    /// Most recent errors, oldest first
    pub errors: VecDeque<ErrorRecord>,
    /// Most recent lifecycle events, oldest first
    pub events: VecDeque<WidgetEvent>,
    pub visible: bool,
    pub interactive: bool,
    /// True while a loading cycle is running
    pub loading: bool,
    /// Number of refresh cycles started
    pub refresh_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounted_at: Option<DateTime<Utc>>,
}

impl WidgetInstance {
    pub(crate) fn new(
        id: InstanceId,
        type_id: WidgetTypeId,
        placement: Placement,
        geometry: Geometry,
        config: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            type_id,
            placement,
            geometry,
            config,
            data: Value::Null,
            state: WidgetState::default(),
            errors: VecDeque::new(),
            events: VecDeque::new(),
            visible: true,
            interactive: true,
            loading: false,
            refresh_count: 0,
            created_at: now,
            updated_at: now,
            mounted_at: None,
        }
    }

    pub fn status(&self) -> WidgetStatus {
        self.state.status
    }

    /// Most recent error, if any.
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.back()
    }

    /// Bump `updated_at`.
    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Push onto a bounded deque, dropping the oldest entries past `limit`.
pub(crate) fn push_bounded<T>(deque: &mut VecDeque<T>, item: T, limit: usize) {
    deque.push_back(item);
    while deque.len() > limit {
        deque.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};
    use serde_json::json;

    #[test]
    fn test_generated_instance_ids_are_unique() {
        let a = InstanceId::generate(1);
        let b = InstanceId::generate(1);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("widget_1_"));
        assert_eq!(a.as_str().len(), "widget_1_".len() + 8);
    }

    #[test]
    fn test_capabilities_lookup() {
        let caps = WidgetCapabilities {
            refreshable: true,
            tags: vec!["Realtime".into()],
            ..Default::default()
        };
        assert!(caps.has("refreshable"));
        assert!(!caps.has("exportable"));
        assert!(caps.has("realtime"));
        assert!(!caps.has("offline"));
    }

    #[test]
    fn test_requirements_clamp() {
        let req = WidgetRequirements {
            min_size: Size::new(2, 2),
            max_size: Some(Size::new(6, 4)),
            responsive: false,
        };
        assert_eq!(req.clamp(Size::new(1, 10)), Size::new(2, 4));
        assert_eq!(req.clamp(Size::new(3, 3)), Size::new(3, 3));
    }

    #[test]
    fn test_cache_ttl() {
        assert!(CacheStrategy::None.ttl().is_none());
        assert_eq!(
            CacheStrategy::Memory { ttl_secs: 60 }.ttl(),
            Some(Duration::seconds(60))
        );
    }

    #[test]
    fn test_merged_defaults_prefer_type_defaults() {
        let widget = WidgetType::new("gallery", "Gallery", WidgetCategory::Media)
            .with_schema(crate::schema::ConfigSchema::new(vec![
                FieldSpec::new("columns", FieldType::Integer).with_default(3),
                FieldSpec::new("layout", FieldType::String).with_default("grid"),
            ]))
            .with_default_config("columns", 4);

        let defaults = widget.merged_defaults();
        assert_eq!(defaults["columns"], json!(4));
        assert_eq!(defaults["layout"], json!("grid"));
    }

    #[test]
    fn test_load_priority_ordering() {
        let mut priorities = vec![LoadPriority::Lazy, LoadPriority::Critical, LoadPriority::Normal];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![LoadPriority::Critical, LoadPriority::Normal, LoadPriority::Lazy]
        );
    }

    #[test]
    fn test_push_bounded() {
        let mut deque = VecDeque::new();
        for i in 0..8 {
            push_bounded(&mut deque, i, 5);
        }
        assert_eq!(deque, VecDeque::from(vec![3, 4, 5, 6, 7]));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_value(WidgetStatus::Ready).unwrap(), json!("ready"));
        assert_eq!(WidgetStatus::Initializing.to_string(), "initializing");
    }

    #[test]
    fn test_widget_type_round_trip_skips_callbacks() {
        let widget = WidgetType::new("rsvp", "RSVP", WidgetCategory::Input)
            .with_dependencies(["guest-list"])
            .with_data_source(DataSource::new("guests", "/api/guests"));

        let json = serde_json::to_string(&widget).unwrap();
        let back: WidgetType = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, widget.id);
        assert_eq!(back.dependencies, vec![WidgetTypeId::from("guest-list")]);
        assert_eq!(back.data_sources.len(), 1);
        assert!(back.driver.is_none());
    }
}
