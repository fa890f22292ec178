//! Widget types, instances and lifecycle state.

mod types;

pub(crate) use types::push_bounded;
pub use types::{
    CacheStrategy, DataSource, Geometry, InstanceId, LoadPriority, Placement, Position, Size,
    WidgetCapabilities, WidgetCategory, WidgetInstance, WidgetMetadata, WidgetRequirements,
    WidgetState, WidgetStatus, WidgetType, WidgetTypeId,
};
