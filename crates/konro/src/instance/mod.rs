//! # Model Instance
//!
//! A [`ModelInstance`] is the unit of deployment: one runtime replica of a
//! served model, bound to a device and owned by its model for the model's
//! whole lifetime. It binds the instance's signature, host-policy metadata,
//! optional metric reporter, opaque backend state slot, and a reference to
//! the execution thread that serializes its work.
//!
//! Lifecycle: an instance is created by the set builder, then initialized
//! and warmed up on its execution thread before the model is exposed to
//! traffic. [`ModelInstance::schedule`] is the sole live-serving entry
//! point. Passive instances stop after warmup and are never scheduled
//! directly.

mod builder;
mod signature;

pub use signature::Signature;

pub(crate) use builder::set_instances;

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use tracing::{info, warn};

use crate::backend::{BackendRequest, InstanceState};
use crate::communication::{CompletionCallback, InferenceRequest, Payload};
use crate::config::{HostPolicyCmdlineConfig, InstanceGroupKind};
use crate::core::thread::BackendThread;
use crate::core::warmup::WarmupData;
use crate::error::CoreError;
use crate::metrics::MetricReporter;
use crate::model::ModelShared;

/// An auxiliary device associated with an instance beyond its primary
/// device binding. Set at construction, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryDevice {
    kind: String,
    id: i64,
}

impl SecondaryDevice {
    pub fn new(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

/// One runtime replica of a served model, bound to a device.
pub struct ModelInstance {
    /// The model that owns this instance. The model's lifetime strictly
    /// exceeds every instance it owns; instances and threads only share the
    /// immutable part.
    model: Arc<ModelShared>,

    name: String,
    signature: Signature,
    kind: InstanceGroupKind,
    /// For CPU-kind instances the device id is always 0; for GPU-kind
    /// instances it names the GPU the instance is bound to.
    device_id: i32,
    host_policy_name: String,
    host_policy: HostPolicyCmdlineConfig,
    /// The host policy serialized once at construction, for handing across
    /// the backend boundary.
    host_policy_message: serde_json::Value,
    profiles: Vec<String>,
    passive: bool,
    secondary_devices: Vec<SecondaryDevice>,

    /// Reporter for metrics; unset if no metrics should be reported
    reporter: OnceLock<Arc<MetricReporter>>,

    /// Opaque state associated with this instance, owned by the backend
    state: OnceLock<InstanceState>,

    /// The execution thread serializing this instance's work
    thread: Arc<BackendThread>,

    /// Synthesized warmup samples; populated just before warmup and drained
    /// by it, so nothing is retained in steady state
    warmup_samples: Mutex<Vec<WarmupData>>,
}

impl ModelInstance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        model: Arc<ModelShared>,
        name: String,
        signature: Signature,
        kind: InstanceGroupKind,
        device_id: i32,
        host_policy_name: String,
        host_policy: HostPolicyCmdlineConfig,
        host_policy_message: serde_json::Value,
        profiles: Vec<String>,
        passive: bool,
        secondary_devices: Vec<SecondaryDevice>,
        thread: Arc<BackendThread>,
    ) -> Self {
        Self {
            model,
            name,
            signature,
            kind,
            device_id,
            host_policy_name,
            host_policy,
            host_policy_message,
            profiles,
            passive,
            secondary_devices,
            reporter: OnceLock::new(),
            state: OnceLock::new(),
            thread,
            warmup_samples: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The signature this instance was grouped under. Retained for
    /// introspection; it is not re-matched after set construction.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn kind(&self) -> InstanceGroupKind {
        self.kind
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn host_policy_name(&self) -> &str {
        &self.host_policy_name
    }

    pub fn host_policy(&self) -> &HostPolicyCmdlineConfig {
        &self.host_policy
    }

    pub fn host_policy_message(&self) -> &serde_json::Value {
        &self.host_policy_message
    }

    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    /// Whether this instance participates in grouping but never receives
    /// direct traffic.
    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn secondary_devices(&self) -> &[SecondaryDevice] {
        &self.secondary_devices
    }

    pub fn model(&self) -> &ModelShared {
        &self.model
    }

    pub fn metric_reporter(&self) -> Option<&Arc<MetricReporter>> {
        self.reporter.get()
    }

    pub fn backend_thread(&self) -> &Arc<BackendThread> {
        &self.thread
    }

    /// The opaque state the backend stored for this instance, if any.
    pub fn state(&self) -> Option<&(dyn std::any::Any + Send + Sync)> {
        self.state.get().map(|state| state.as_ref())
    }

    /// Stores the backend's opaque state for this instance. The slot is
    /// written once; a second call is ignored.
    pub fn set_state(&self, state: InstanceState) {
        if self.state.set(state).is_err() {
            warn!(instance = %self.name, "instance state already set; ignoring");
        }
    }

    /// Invokes the backend initialization entry point for this instance and
    /// constructs the metric reporter if metrics are enabled. Runs on the
    /// instance's execution thread; failure is fatal to the model load.
    pub(crate) fn initialize(&self) -> Result<(), CoreError> {
        info!(
            instance = %self.name,
            model = %self.model.name(),
            kind = %self.kind,
            device = self.device_id,
            "initializing instance"
        );
        if self.model.config().metrics {
            let _ = self.reporter.set(Arc::new(MetricReporter::new(
                self.model.name(),
                &self.name,
                self.device_id,
            )));
        }
        self.model.backend().initialize(self)
    }

    /// Synthesizes the declared warmup samples for this instance.
    pub(crate) fn generate_warmup_data(&self) -> Result<(), CoreError> {
        let specs = &self.model.config().model_warmup;
        let mut samples = Vec::with_capacity(specs.len());
        for spec in specs {
            samples.push(WarmupData::generate(spec, &self.name)?);
        }
        *self
            .warmup_samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = samples;
        Ok(())
    }

    /// Runs every declared warmup sample through the live execution path,
    /// then discards the synthesized data.
    ///
    /// A failing sample aborts the load unless the model marks warmup
    /// best-effort, in which case the failure is logged and remaining
    /// samples still run.
    pub(crate) fn warm_up(&self) -> Result<(), CoreError> {
        self.generate_warmup_data()?;
        let samples = std::mem::take(
            &mut *self
                .warmup_samples
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for sample in samples {
            let sample_name = sample.sample_name.clone();
            if let Err(err) = sample.run(self) {
                if self.model.config().warmup_best_effort {
                    warn!(
                        instance = %self.name,
                        sample = %sample_name,
                        error = %err,
                        "warmup sample failed; continuing because warmup is best-effort"
                    );
                } else {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// The sole live-serving entry point.
    ///
    /// Takes ownership of a non-empty ordered batch of requests and a
    /// completion continuation, enqueues the batch on this instance's
    /// execution thread, and returns immediately. Safe to call from many
    /// threads at once. The continuation is invoked exactly once, after the
    /// backend execution call for this batch has returned control to the
    /// core.
    pub fn schedule(self: &Arc<Self>, requests: Vec<InferenceRequest>, on_completion: CompletionCallback) {
        debug_assert!(!requests.is_empty(), "scheduled batches must be non-empty");
        if requests.is_empty() {
            on_completion();
            return;
        }
        self.thread.enqueue(Payload::Execute {
            instance: self.clone(),
            requests,
            on_completion,
        });
    }

    /// Converts a dequeued batch into backend-facing handles and invokes the
    /// backend execution entry point once for it. Runs on the execution
    /// thread.
    pub(crate) fn execute(&self, requests: Vec<InferenceRequest>) {
        let batch_size = requests.len();
        let start = Instant::now();
        let batch: Vec<BackendRequest> = requests
            .into_iter()
            .map(|request| BackendRequest::new(&self.name, request))
            .collect();
        self.model.backend().execute(self, batch);
        if let Some(reporter) = self.reporter.get() {
            reporter.observe_execution(batch_size, start.elapsed());
        }
    }
}
