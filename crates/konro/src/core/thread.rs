//! # Backend Thread
//!
//! A [`BackendThread`] is a dedicated OS worker thread bound to a device. It
//! serializes *all* work for its assigned instances: at most one execution
//! (or initialization/warmup step) runs on a given device-bound thread at
//! any time, which is what prevents oversubscription of a device when
//! multiple instances share it.
//!
//! Work arrives on a multi-producer queue and is processed strictly in
//! enqueue order across all assigned instances. Stopping is idempotent and
//! joins the worker; anything still queued when the thread stops is failed
//! back to its requester rather than silently dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::communication::Payload;
use crate::error::CoreError;
use crate::instance::ModelInstance;
use crate::model::ModelShared;

/// Niceness applied to backend threads when the backend command-line
/// configuration does not override it.
pub(crate) const DEFAULT_BACKEND_THREAD_NICE: i32 = 5;

/// A device-bound worker thread serializing execution for one or more
/// instances.
pub struct BackendThread {
    name: String,
    nice: i32,
    device_id: i32,

    /// The model whose instances this thread serves
    model: Arc<ModelShared>,

    /// Instances assigned to this thread, in assignment order. Weak so the
    /// model remains the sole owner of its instances.
    instances: Mutex<Vec<Weak<ModelInstance>>>,

    /// Producer side of the work queue
    queue: mpsc::UnboundedSender<Payload>,

    /// Handle to the worker, taken on the first stop
    worker: Mutex<Option<thread::JoinHandle<()>>>,

    /// Flag indicating whether the worker should continue running
    running: Arc<AtomicBool>,
}

impl BackendThread {
    /// Allocates the OS thread, applies its scheduling niceness, and binds
    /// it logically to `device_id`. The thread starts in the running state,
    /// waiting for work.
    pub(crate) fn create(
        name: String,
        model: Arc<ModelShared>,
        nice: i32,
        device_id: i32,
    ) -> Result<Arc<Self>, CoreError> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn({
                let running = running.clone();
                let thread_name = name.clone();
                move || backend_thread(queue_rx, running, thread_name, nice, device_id)
            })
            .map_err(|source| CoreError::Thread {
                name: name.clone(),
                source,
            })?;

        Ok(Arc::new(Self {
            name,
            nice,
            device_id,
            model,
            instances: Mutex::new(Vec::new()),
            queue: queue_tx,
            worker: Mutex::new(Some(worker)),
            running,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nice(&self) -> i32 {
        self.nice
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Registers an additional instance to be served by this thread.
    ///
    /// Used when signature matching assigns an instance to an existing
    /// thread. Must happen before the instance has live traffic in flight.
    pub(crate) fn add_model_instance(&self, instance: &Arc<ModelInstance>) {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(instance));
    }

    /// The instances currently assigned to this thread, in assignment order.
    pub fn instances(&self) -> Vec<Arc<ModelInstance>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Runs initialization and warmup for `instance` on this thread,
    /// preserving device affinity for any device-bound setup work. Blocks
    /// the calling (loader) thread until both complete, returning the first
    /// failure encountered.
    pub(crate) fn init_and_warm_up(&self, instance: &Arc<ModelInstance>) -> Result<(), CoreError> {
        let (done, done_rx) = oneshot::channel();
        if self
            .queue
            .send(Payload::InitAndWarmUp {
                instance: instance.clone(),
                done,
            })
            .is_err()
        {
            return Err(CoreError::backend_init(
                instance.name(),
                "backend thread is not running",
            ));
        }

        match done_rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(CoreError::backend_init(
                instance.name(),
                "backend thread exited before initialization completed",
            )),
        }
    }

    /// Enqueues a payload for the worker. If the thread has already stopped,
    /// the payload is failed back to its requester immediately so no request
    /// is lost and the completion continuation still fires.
    pub(crate) fn enqueue(&self, payload: Payload) {
        if let Err(mpsc::error::SendError(payload)) = self.queue.send(payload) {
            warn!(thread = %self.name, "work submitted to a stopped backend thread");
            reject_payload(payload);
        }
    }

    /// Signals the worker to exit and joins it. Idempotent: a second call
    /// observes the flag already cleared and only waits for the join to have
    /// happened.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            // Wake the worker so it can observe the flag.
            let _ = self.queue.send(Payload::Stop);
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(thread = %self.name, model = %self.model.name(), "backend thread panicked");
            }
        }
    }
}

impl Drop for BackendThread {
    /// Ensures the worker is properly terminated when the thread handle is
    /// dropped.
    fn drop(&mut self) {
        self.stop();
    }
}

/// The worker loop.
///
/// Repeatedly waits for enqueued work, dequeues one payload, and services it
/// on behalf of the matching instance. Exits once a stop is requested, after
/// which it drains no further work; whatever is still queued is failed back
/// to its requesters.
fn backend_thread(
    mut queue: mpsc::UnboundedReceiver<Payload>,
    running: Arc<AtomicBool>,
    name: String,
    nice: i32,
    device_id: i32,
) {
    apply_nice(nice);
    info!(thread = %name, nice, device = device_id, "starting backend thread");

    while running.load(Ordering::SeqCst) {
        let Some(payload) = queue.blocking_recv() else {
            break;
        };
        if !running.load(Ordering::SeqCst) {
            // Stop was requested while waiting; this payload is no longer
            // consumed.
            reject_payload(payload);
            break;
        }
        match payload {
            Payload::Stop => break,
            Payload::InitAndWarmUp { instance, done } => {
                let result = instance.initialize().and_then(|()| instance.warm_up());
                let _ = done.send(result);
            }
            Payload::Execute {
                instance,
                requests,
                on_completion,
            } => {
                instance.execute(requests);
                on_completion();
            }
        }
    }

    // Fail anything still queued so no request is silently lost.
    queue.close();
    while let Ok(payload) = queue.try_recv() {
        reject_payload(payload);
    }

    info!(thread = %name, "stopping backend thread");
}

/// Fails a payload that will never be executed, delivering an error response
/// to every request and still firing the batch's completion continuation
/// exactly once.
fn reject_payload(payload: Payload) {
    match payload {
        Payload::Stop => {}
        Payload::InitAndWarmUp { instance, done } => {
            let _ = done.send(Err(CoreError::backend_init(
                instance.name(),
                "backend thread stopped before initialization",
            )));
        }
        Payload::Execute {
            instance,
            requests,
            on_completion,
        } => {
            for request in requests {
                request.into_failed(CoreError::execution(
                    instance.name(),
                    "backend thread stopped before the batch was executed",
                ));
            }
            on_completion();
        }
    }
}

#[cfg(unix)]
fn apply_nice(nice: i32) {
    let _ = unsafe { libc::nice(nice) };
}

#[cfg(not(unix))]
fn apply_nice(_nice: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::config::ModelConfig;

    fn shared() -> Arc<ModelShared> {
        let config = ModelConfig {
            name: "m".to_string(),
            backend: "mock".to_string(),
            max_batch_size: 1,
            instance_group: vec![],
            model_warmup: vec![],
            warmup_best_effort: false,
            metrics: false,
        };
        Arc::new(ModelShared::new(config, Arc::new(MockBackend::new())))
    }

    #[test]
    fn test_stop_twice_has_same_effect_as_once() {
        let thread = BackendThread::create("worker".to_string(), shared(), 0, 0).unwrap();
        thread.stop();
        thread.stop();
    }

    #[test]
    fn test_drop_without_explicit_stop_joins_worker() {
        let thread = BackendThread::create("worker".to_string(), shared(), 0, 0).unwrap();
        assert_eq!(thread.device_id(), 0);
        drop(thread);
    }

    #[test]
    fn test_fresh_thread_has_no_instances() {
        let thread = BackendThread::create("worker".to_string(), shared(), 5, 1).unwrap();
        assert!(thread.instances().is_empty());
        assert_eq!(thread.nice(), 5);
        assert_eq!(thread.name(), "worker");
        thread.stop();
    }
}
