//! Instance status transitions.

use crate::error::{Error, Result};
use crate::widget::{InstanceId, WidgetStatus};

/// Whether `from -> to` is an allowed status transition.
///
/// ```text
/// initializing -> loading -> ready
///                 loading -> error -> loading
///                 ready   -> loading
/// any          -> disabled
/// ```
pub fn can_transition(from: WidgetStatus, to: WidgetStatus) -> bool {
    use WidgetStatus::*;
    matches!(
        (from, to),
        (Initializing, Loading)
            | (Loading, Ready)
            | (Loading, Error)
            | (Error, Loading)
            | (Ready, Loading)
            | (_, Disabled)
    )
}

/// Fail with `InvalidTransition` unless `from -> to` is allowed.
pub fn check_transition(
    instance_id: &InstanceId,
    from: WidgetStatus,
    to: WidgetStatus,
) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::invalid_transition(instance_id, from, to))
    }
}
