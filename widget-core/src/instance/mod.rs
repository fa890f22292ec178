//! Widget instance storage.

mod store;

pub use store::{DataUpdate, InstanceFilter, InstanceStore, InstanceUpdate};
