//! # Model
//!
//! A [`Model`] owns every runtime instance created for it and the backend
//! threads those instances execute on. Instances and threads hold only the
//! shared immutable part ([`ModelShared`]); the model's lifetime strictly
//! exceeds theirs, and unloading the model stops and joins every thread.

use std::sync::Arc;

use tracing::info;

use crate::backend::Backend;
use crate::config::{
    BackendCmdlineConfigMap, HostPolicyCmdlineConfigMap, ModelConfig, RateLimiterPolicy,
};
use crate::core::thread::BackendThread;
use crate::error::CoreError;
use crate::instance::{self, ModelInstance};

/// The part of a model shared with its instances and threads: the validated
/// configuration and the backend serving it.
pub struct ModelShared {
    config: ModelConfig,
    backend: Arc<dyn Backend>,
}

impl ModelShared {
    pub(crate) fn new(config: ModelConfig, backend: Arc<dyn Backend>) -> Self {
        Self { config, backend }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The batch size warmup requests are aligned to. A model that does not
    /// support batching executes one request at a time.
    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size.max(1) as usize
    }
}

/// A loaded model: its instances, ready for traffic, and the threads that
/// serve them.
pub struct Model {
    shared: Arc<ModelShared>,
    instances: Vec<Arc<ModelInstance>>,
    threads: Vec<Arc<BackendThread>>,
}

impl Model {
    /// Builds, initializes, and warms up every declared instance of
    /// `config`, synchronously.
    ///
    /// Initialization and warmup run on each instance's execution thread to
    /// preserve device affinity; this call blocks until every instance has
    /// completed both. Any failure aborts the load: no instance of a failed
    /// model is ever schedulable.
    pub fn load(
        config: ModelConfig,
        backend: Arc<dyn Backend>,
        backend_config_map: &BackendCmdlineConfigMap,
        host_policy_map: &HostPolicyCmdlineConfigMap,
        policy: RateLimiterPolicy,
    ) -> Result<Self, CoreError> {
        let shared = Arc::new(ModelShared::new(config, backend));
        let (instances, threads) =
            instance::set_instances(&shared, backend_config_map, host_policy_map, policy)?;

        for instance in &instances {
            if let Err(err) = instance.backend_thread().init_and_warm_up(instance) {
                for thread in &threads {
                    thread.stop();
                }
                return Err(err);
            }
        }

        info!(
            model = %shared.name(),
            instances = instances.len(),
            threads = threads.len(),
            "model loaded"
        );
        Ok(Self {
            shared,
            instances,
            threads,
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn shared(&self) -> &Arc<ModelShared> {
        &self.shared
    }

    /// Every instance of the model, in declaration order.
    pub fn instances(&self) -> &[Arc<ModelInstance>] {
        &self.instances
    }

    /// The distinct execution threads serving this model.
    pub fn execution_threads(&self) -> &[Arc<BackendThread>] {
        &self.threads
    }

    /// Stops and joins every execution thread, letting in-flight work finish
    /// naturally. Equivalent to dropping the model.
    pub fn unload(self) {}
}

impl Drop for Model {
    fn drop(&mut self) {
        for thread in &self.threads {
            thread.stop();
        }
        info!(model = %self.shared.name(), "model unloaded");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::mpsc;

    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::communication::{InferenceRequest, ResponseStream, Tensor};
    use crate::config::{
        DataType, InstanceGroup, InstanceGroupKind, WarmupInput, WarmupInputSource,
        WarmupSampleConfig,
    };

    fn gpu_group(name: &str, passive: bool) -> InstanceGroup {
        InstanceGroup {
            name: name.to_string(),
            kind: InstanceGroupKind::Gpu,
            count: 1,
            gpus: vec![0],
            profile: vec![],
            passive,
            host_policy: String::new(),
            rate_limiter: None,
            secondary_devices: vec![],
        }
    }

    fn warmup_sample(count: u32) -> WarmupSampleConfig {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "input0".to_string(),
            WarmupInput {
                data_type: DataType::Fp32,
                dims: vec![4],
                source: WarmupInputSource::ZeroData,
            },
        );
        WarmupSampleConfig {
            name: "sample".to_string(),
            count,
            inputs,
        }
    }

    fn config(groups: Vec<InstanceGroup>) -> ModelConfig {
        ModelConfig {
            name: "resnet".to_string(),
            backend: "onnx".to_string(),
            max_batch_size: 2,
            instance_group: groups,
            model_warmup: vec![],
            warmup_best_effort: false,
            metrics: true,
        }
    }

    fn load(config: ModelConfig, backend: Arc<MockBackend>) -> Result<Model, CoreError> {
        Model::load(
            config,
            backend,
            &BackendCmdlineConfigMap::new(),
            &HostPolicyCmdlineConfigMap::new(),
            RateLimiterPolicy {
                device_blocking: true,
            },
        )
    }

    fn request() -> (InferenceRequest, ResponseStream) {
        let tensor = Tensor::new("input0", DataType::Fp32, vec![4], Arc::new(vec![0u8; 16]));
        InferenceRequest::new(vec![tensor])
    }

    #[test]
    fn test_load_two_blocking_groups_on_one_device() {
        let backend = Arc::new(MockBackend::new());
        let model = load(
            config(vec![gpu_group("a", false), gpu_group("b", false)]),
            backend.clone(),
        )
        .unwrap();

        assert_eq!(model.execution_threads().len(), 1);
        assert_eq!(model.instances().len(), 2);
        assert!(model.instances().iter().all(|i| !i.is_passive()));
        assert_eq!(backend.init_count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_passive_instance_is_exposed_as_passive() {
        let backend = Arc::new(MockBackend::new());
        let model = load(config(vec![gpu_group("p", true)]), backend.clone()).unwrap();

        assert!(model.instances()[0].is_passive());
        // Passive instances still initialize and warm up; they are only
        // excluded from direct scheduling by the pipeline.
        assert_eq!(backend.init_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backend_state_round_trip() {
        let backend = Arc::new(MockBackend::new());
        let model = load(config(vec![gpu_group("g", false)]), backend).unwrap();

        let state = model.instances()[0]
            .state()
            .and_then(|s| s.downcast_ref::<String>())
            .cloned();
        assert_eq!(state.as_deref(), Some("state-g_0"));
    }

    #[test]
    fn test_init_failure_aborts_load() {
        let backend = Arc::new(MockBackend::failing_init());
        let result = load(config(vec![gpu_group("g", false)]), backend);
        assert!(matches!(result, Err(CoreError::BackendInit { .. })));
    }

    #[test]
    fn test_warmup_expands_sample_into_aligned_batches() {
        let backend = Arc::new(MockBackend::new());
        let mut cfg = config(vec![gpu_group("g", false)]);
        cfg.model_warmup = vec![warmup_sample(5)];
        let _model = load(cfg, backend.clone()).unwrap();

        let executions = backend.executions();
        let sizes: Vec<usize> = executions.iter().map(|(_, size)| *size).collect();
        assert_eq!(sizes, vec![2, 2, 1], "count=5 at batch size 2");
        assert_eq!(sizes.iter().sum::<usize>(), 5);
        assert!(executions.iter().all(|(name, _)| name == "g_0"));
    }

    #[test]
    fn test_warmup_failure_is_fatal_by_default() {
        let backend = Arc::new(MockBackend::failing_execute());
        let mut cfg = config(vec![gpu_group("g", false)]);
        cfg.model_warmup = vec![warmup_sample(1)];
        let result = load(cfg, backend);
        assert!(matches!(result, Err(CoreError::Warmup { .. })));
    }

    #[test]
    fn test_best_effort_warmup_failure_continues_load() {
        let backend = Arc::new(MockBackend::failing_execute());
        let mut cfg = config(vec![gpu_group("g", false)]);
        cfg.model_warmup = vec![warmup_sample(1)];
        cfg.warmup_best_effort = true;
        assert!(load(cfg, backend).is_ok());
    }

    #[test]
    fn test_scheduled_batches_execute_and_complete_in_fifo_order() {
        let backend = Arc::new(MockBackend::new());
        let model = load(config(vec![gpu_group("g", false)]), backend.clone()).unwrap();
        let instance = &model.instances()[0];

        let (completion_tx, completion_rx) = mpsc::channel();
        let mut streams = Vec::new();
        for tag in 1..=3 {
            let (req, stream) = request();
            streams.push(stream);
            let tx = completion_tx.clone();
            instance.schedule(
                vec![req],
                Box::new(move || {
                    let _ = tx.send(tag);
                }),
            );
        }

        let order: Vec<i32> = (0..3).map(|_| completion_rx.recv().unwrap()).collect();
        assert_eq!(order, vec![1, 2, 3], "completions fire in enqueue order");

        for mut stream in streams {
            let response = stream.blocking_recv().expect("each request gets a response");
            assert!(response.result().is_ok());
        }
        assert_eq!(backend.executions().len(), 3);
    }

    #[test]
    fn test_fifo_order_across_instances_sharing_a_thread() {
        let backend = Arc::new(MockBackend::new());
        let model = load(
            config(vec![gpu_group("a", false), gpu_group("b", false)]),
            backend.clone(),
        )
        .unwrap();

        let (completion_tx, completion_rx) = mpsc::channel();
        let mut streams = Vec::new();
        for (tag, instance) in [&model.instances()[0], &model.instances()[1], &model.instances()[0]]
            .iter()
            .enumerate()
        {
            let (req, stream) = request();
            streams.push(stream);
            let tx = completion_tx.clone();
            instance.schedule(
                vec![req],
                Box::new(move || {
                    let _ = tx.send(tag);
                }),
            );
        }

        let order: Vec<usize> = (0..3).map(|_| completion_rx.recv().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);

        let executed: Vec<String> = backend
            .executions()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(executed, vec!["a_0", "b_0", "a_0"]);
        for mut stream in streams {
            assert!(stream.blocking_recv().is_some());
        }
    }

    #[test]
    fn test_execution_failure_surfaces_on_response_path_only() {
        let backend = Arc::new(MockBackend::failing_execute());
        // No warmup samples, so the load itself succeeds.
        let model = load(config(vec![gpu_group("g", false)]), backend).unwrap();
        let instance = &model.instances()[0];

        let (completion_tx, completion_rx) = mpsc::channel();
        let (req, mut stream) = request();
        instance.schedule(
            vec![req],
            Box::new(move || {
                let _ = completion_tx.send(());
            }),
        );

        completion_rx.recv().unwrap();
        let response = stream.blocking_recv().expect("failed requests still respond");
        assert!(matches!(
            response.result(),
            Err(CoreError::Execution { .. })
        ));

        // The thread survives the failure and keeps serving.
        let (completion_tx, completion_rx) = mpsc::channel();
        let (req, _stream) = request();
        instance.schedule(
            vec![req],
            Box::new(move || {
                let _ = completion_tx.send(());
            }),
        );
        completion_rx.recv().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let backend = Arc::new(MockBackend::new());
        let model = load(config(vec![gpu_group("g", false)]), backend).unwrap();
        let thread = model.execution_threads()[0].clone();

        thread.stop();
        thread.stop();
    }

    #[test]
    fn test_schedule_after_stop_fails_requests_but_still_completes() {
        let backend = Arc::new(MockBackend::new());
        let model = load(config(vec![gpu_group("g", false)]), backend.clone()).unwrap();
        let instance = model.instances()[0].clone();
        model.execution_threads()[0].stop();

        let executed_before = backend.executions().len();
        let (completion_tx, completion_rx) = mpsc::channel();
        let (req, mut stream) = request();
        instance.schedule(
            vec![req],
            Box::new(move || {
                let _ = completion_tx.send(());
            }),
        );

        completion_rx
            .recv()
            .expect("completion fires even when the thread is stopped");
        let response = stream.blocking_recv().expect("request is failed, not lost");
        assert!(response.result().is_err());
        assert_eq!(backend.executions().len(), executed_before, "nothing executed");
    }

    #[test]
    fn test_metric_reporter_observes_warmup_executions() {
        let backend = Arc::new(MockBackend::new());
        let mut cfg = config(vec![gpu_group("g", false)]);
        cfg.model_warmup = vec![warmup_sample(4)];
        let model = load(cfg, backend).unwrap();

        let reporter = model.instances()[0]
            .metric_reporter()
            .expect("metrics are enabled");
        assert_eq!(reporter.execution_count(), 2, "4 requests in batches of 2");
        assert_eq!(reporter.inference_count(), 4);
    }

    #[test]
    fn test_metrics_disabled_leaves_reporter_unset() {
        let backend = Arc::new(MockBackend::new());
        let mut cfg = config(vec![gpu_group("g", false)]);
        cfg.metrics = false;
        let model = load(cfg, backend).unwrap();
        assert!(model.instances()[0].metric_reporter().is_none());
    }

    #[test]
    fn test_unload_joins_threads() {
        let backend = Arc::new(MockBackend::new());
        let model = load(config(vec![gpu_group("g", false)]), backend).unwrap();
        model.unload();
    }
}
