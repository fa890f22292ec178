//! # widget-core
//!
//! An embeddable orchestration engine for pluggable widgets: a registry of
//! widget types, a store of placed instances, a lifecycle state machine, an
//! in-process message bus and error/performance telemetry.
//!
//! ## Core Components
//!
//! - **Registry**: Widget type definitions with schemas and capabilities
//! - **Instances**: Placements of a type with their own config, data and state
//! - **Lifecycle**: `initializing -> loading -> ready/error` cycles, serialized per instance
//! - **Bus**: Broadcast and direct messages between instances
//! - **Telemetry**: Bounded error logs and last-write-wins performance metrics
//! - **Orchestrator**: The facade hosts talk to
//!
//! ## Example
//!
//! ```rust,ignore
//! use widget_core::{InstanceFilter, Placement, WidgetCategory, WidgetOrchestrator, WidgetType};
//! use serde_json::json;
//!
//! let orchestrator = WidgetOrchestrator::new();
//! orchestrator.register_widget_type(
//!     WidgetType::new("counter", "Counter", WidgetCategory::Display).refreshable(true),
//! )?;
//!
//! let id = orchestrator.create_instance(
//!     &"counter".into(),
//!     Placement::section("hero"),
//!     json!({"title": "Count"}),
//! )?;
//! orchestrator.mount(&id).await?;
//! orchestrator.refresh_all(&InstanceFilter::new().section("hero")).await;
//! ```

// Self-alias for derive macro support within the crate
extern crate self as widget_core;

pub mod bus;
pub mod config;
pub mod error;
pub mod host;
pub mod instance;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod schema;
pub mod telemetry;
pub mod widget;

// Re-exports for convenience
pub use bus::{
    Delivery, EventSink, Message, MessageBus, MessageId, MessageKind, Subscription, WidgetEvent,
    WidgetEventKind, ORCHESTRATOR_SENDER,
};
pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use host::{
    DataFetcher, FetchResponse, HostError, NoopDriver, Notifier, Renderer, TracingNotifier,
    WidgetDriver,
};
pub use instance::{DataUpdate, InstanceFilter, InstanceStore, InstanceUpdate};
pub use lifecycle::{CycleKind, CycleResult, CycleSummary, LifecycleManager};
pub use orchestrator::{
    OrchestratorBuilder, RequirementContext, RequirementReport, WidgetOrchestrator,
};
pub use registry::{WidgetFilter, WidgetRegistry};
pub use schema::{
    ConfigSchema, FieldConstraint, FieldSpec, FieldType, ValidationError, ValidationResult,
    WidgetConfig,
};
pub use telemetry::{
    ErrorCategory, ErrorRecord, ErrorReport, InstancePerformance, PerformanceReport, Telemetry,
};
pub use widget::{
    CacheStrategy, DataSource, Geometry, InstanceId, LoadPriority, Placement, Position, Size,
    WidgetCapabilities, WidgetCategory, WidgetInstance, WidgetMetadata, WidgetRequirements,
    WidgetState, WidgetStatus, WidgetType, WidgetTypeId,
};
