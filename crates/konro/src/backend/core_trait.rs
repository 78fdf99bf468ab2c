use std::any::Any;

use crate::error::CoreError;
use crate::instance::ModelInstance;

use super::request::BackendRequest;

/// Opaque per-instance state owned by the backend.
///
/// The core stores it in a set-once slot on the instance and never interprets
/// its contents; the backend reads it back on every call. The execution
/// thread guarantees at most one concurrent call into a given instance's
/// state, so backends need no internal synchronization against re-entrancy
/// from this crate.
pub type InstanceState = Box<dyn Any + Send + Sync>;

/// The boundary to backend-specific computation.
///
/// Implementations perform the actual tensor work on whatever device the
/// instance is bound to; the core only sequences calls and routes requests
/// and responses.
pub trait Backend: Send + Sync + 'static {
    /// Initialize one instance.
    ///
    /// Called exactly once per instance, on that instance's execution thread,
    /// before any warmup or live traffic. The backend may stash its state via
    /// [`ModelInstance::set_state`]. A reported failure is fatal to the
    /// owning model's load.
    fn initialize(&self, instance: &ModelInstance) -> Result<(), CoreError>;

    /// Execute one dequeued batch on behalf of `instance`.
    ///
    /// The backend must release every request exactly once, with outputs or
    /// with an error; an unreleased request is failed automatically when its
    /// handle drops. Per-request failures are delivered on that request's
    /// response channel and do not affect the rest of the batch.
    fn execute(&self, instance: &ModelInstance, requests: Vec<BackendRequest>);
}
