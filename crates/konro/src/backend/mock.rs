use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::CoreError;
use crate::instance::ModelInstance;

use super::core_trait::{Backend, InstanceState};
use super::request::BackendRequest;

/// A recording backend for tests.
///
/// Records every executed batch as `(instance name, batch size)` in arrival
/// order, and releases each request successfully unless configured to fail.
pub(crate) struct MockBackend {
    pub executed: Mutex<Vec<(String, usize)>>,
    pub init_count: AtomicUsize,
    pub fail_init: bool,
    pub fail_execute: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            init_count: AtomicUsize::new(0),
            fail_init: false,
            fail_execute: false,
        }
    }

    pub fn failing_init() -> Self {
        Self {
            fail_init: true,
            ..Self::new()
        }
    }

    pub fn failing_execute() -> Self {
        Self {
            fail_execute: true,
            ..Self::new()
        }
    }

    pub fn executions(&self) -> Vec<(String, usize)> {
        self.executed.lock().unwrap().clone()
    }
}

impl Backend for MockBackend {
    fn initialize(&self, instance: &ModelInstance) -> Result<(), CoreError> {
        if self.fail_init {
            return Err(CoreError::backend_init(
                instance.name(),
                "mock backend configured to fail initialization",
            ));
        }
        self.init_count.fetch_add(1, Ordering::SeqCst);
        let state: InstanceState = Box::new(format!("state-{}", instance.name()));
        instance.set_state(state);
        Ok(())
    }

    fn execute(&self, instance: &ModelInstance, requests: Vec<BackendRequest>) {
        self.executed
            .lock()
            .unwrap()
            .push((instance.name().to_string(), requests.len()));
        for request in requests {
            if self.fail_execute {
                request.release_with_error(CoreError::execution(
                    instance.name(),
                    "mock backend configured to fail execution",
                ));
            } else {
                request.release_with_outputs(vec![]);
            }
        }
    }
}
