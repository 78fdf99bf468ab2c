//! # Instance Set Construction
//!
//! Builds all instances for a model from its configuration: one instance per
//! declared replica per device, each assigned either a fresh backend thread
//! or, for device-blocking configurations, an existing thread founded by a
//! signature-matching instance.
//!
//! Matching is a greedy pairing pass over a working set of thread keys. The
//! first replica carrying a given signature founds a thread and contributes
//! an enabled key; every later equivalent replica joins that thread, and the
//! pairing consumes the instance-retained signatures on both sides so
//! neither can be reused by a later pass. A signature that never matches
//! simply identifies a singleton thread and stays enabled.
//!
//! Construction is synchronous and runs during model load; any failure
//! aborts the load, leaving no partial instance set servable.

use std::sync::Arc;

use tracing::info;

use crate::config::{
    BackendCmdlineConfigMap, HostPolicyCmdlineConfig, HostPolicyCmdlineConfigMap, InstanceGroup,
    InstanceGroupKind, ModelConfig, RateLimiterPolicy,
};
use crate::core::thread::{BackendThread, DEFAULT_BACKEND_THREAD_NICE};
use crate::error::CoreError;
use crate::model::ModelShared;

use super::signature::Signature;
use super::{ModelInstance, SecondaryDevice};

/// One existing thread a later replica may join: the thread, the grouping
/// key it was founded under (kept enabled), and the founding instance whose
/// retained signature is consumed on the first pairing.
struct ThreadSlot {
    key: Signature,
    thread: Arc<BackendThread>,
    founder: Arc<ModelInstance>,
}

/// Constructs the model's instances and their backend threads.
pub(crate) fn set_instances(
    model: &Arc<ModelShared>,
    backend_config_map: &BackendCmdlineConfigMap,
    host_policy_map: &HostPolicyCmdlineConfigMap,
    policy: RateLimiterPolicy,
) -> Result<(Vec<Arc<ModelInstance>>, Vec<Arc<BackendThread>>), CoreError> {
    let config = model.config();
    let nice = backend_thread_nice(config, backend_config_map)?;

    let mut instances = Vec::new();
    let mut threads = Vec::new();
    let mut slots: Vec<ThreadSlot> = Vec::new();

    for (group_index, group) in config.instance_group.iter().enumerate() {
        let group_name = if group.name.is_empty() {
            format!("{}_{}", config.name, group_index)
        } else {
            group.name.clone()
        };
        if group.count < 1 {
            return Err(CoreError::config(
                &config.name,
                format!(
                    "instance group '{group_name}' must have count >= 1, got {}",
                    group.count
                ),
            ));
        }
        let devices = devices_for_group(&config.name, &group_name, group)?;

        let mut replica = 0;
        for _ in 0..group.count {
            for &device_id in &devices {
                let name = format!("{group_name}_{replica}");
                replica += 1;

                let host_policy_name = if group.host_policy.is_empty() {
                    default_host_policy_name(group.kind, device_id)
                } else {
                    group.host_policy.clone()
                };
                let host_policy = match host_policy_map.get(&host_policy_name) {
                    Some(settings) => settings.clone(),
                    None => {
                        if !group.host_policy.is_empty() {
                            return Err(CoreError::config(
                                &config.name,
                                format!(
                                    "instance group '{group_name}' references unknown host policy '{host_policy_name}'"
                                ),
                            ));
                        }
                        HostPolicyCmdlineConfig::new()
                    }
                };
                let host_policy_message =
                    host_policy_message(&config.name, &host_policy_name, &host_policy)?;

                let secondary_devices: Vec<SecondaryDevice> = group
                    .secondary_devices
                    .iter()
                    .map(|device| SecondaryDevice::new(device.kind.clone(), device.id))
                    .collect();

                let signature = Signature::new(group.clone(), device_id);

                // Only device-blocking configurations may share a thread.
                let matched = if policy.device_blocking {
                    slots
                        .iter()
                        .find(|slot| slot.key == signature)
                        .map(|slot| (slot.thread.clone(), slot.founder.clone()))
                } else {
                    None
                };

                match matched {
                    Some((thread, founder)) => {
                        // The pairing consumes both retained signatures.
                        signature.disable_matching();
                        founder.signature().disable_matching();
                        info!(
                            model = %config.name,
                            instance = %name,
                            thread = %thread.name(),
                            "assigning instance to matching backend thread"
                        );
                        let instance = Arc::new(ModelInstance::new(
                            model.clone(),
                            name,
                            signature,
                            group.kind,
                            device_id,
                            host_policy_name,
                            host_policy,
                            host_policy_message,
                            group.profile.clone(),
                            group.passive,
                            secondary_devices,
                            thread.clone(),
                        ));
                        thread.add_model_instance(&instance);
                        instances.push(instance);
                    }
                    None => {
                        let thread =
                            BackendThread::create(name.clone(), model.clone(), nice, device_id)?;
                        let key = signature.clone();
                        let instance = Arc::new(ModelInstance::new(
                            model.clone(),
                            name,
                            signature,
                            group.kind,
                            device_id,
                            host_policy_name,
                            host_policy,
                            host_policy_message,
                            group.profile.clone(),
                            group.passive,
                            secondary_devices,
                            thread.clone(),
                        ));
                        thread.add_model_instance(&instance);
                        if policy.device_blocking {
                            slots.push(ThreadSlot {
                                key,
                                thread: thread.clone(),
                                founder: instance.clone(),
                            });
                        }
                        threads.push(thread);
                        instances.push(instance);
                    }
                }
            }
        }
    }

    Ok((instances, threads))
}

/// Resolves the devices a group's replicas are created on, validating the
/// count/kind/device combination.
fn devices_for_group(
    model: &str,
    group_name: &str,
    group: &InstanceGroup,
) -> Result<Vec<i32>, CoreError> {
    match group.kind {
        InstanceGroupKind::Auto => Err(CoreError::config(
            model,
            format!("instance group '{group_name}' has unresolved kind 'auto'"),
        )),
        InstanceGroupKind::Cpu | InstanceGroupKind::Model => {
            if !group.gpus.is_empty() {
                return Err(CoreError::config(
                    model,
                    format!(
                        "instance group '{group_name}' of kind '{}' must not declare gpus",
                        group.kind
                    ),
                ));
            }
            Ok(vec![0])
        }
        InstanceGroupKind::Gpu => {
            if group.gpus.is_empty() {
                return Err(CoreError::config(
                    model,
                    format!("instance group '{group_name}' of kind 'gpu' declares no devices"),
                ));
            }
            if let Some(&bad) = group.gpus.iter().find(|&&gpu| gpu < 0) {
                return Err(CoreError::config(
                    model,
                    format!("instance group '{group_name}' declares invalid device id {bad}"),
                ));
            }
            Ok(group.gpus.clone())
        }
    }
}

fn default_host_policy_name(kind: InstanceGroupKind, device_id: i32) -> String {
    match kind {
        InstanceGroupKind::Gpu => format!("gpu_{device_id}"),
        InstanceGroupKind::Model => "model".to_string(),
        _ => "cpu".to_string(),
    }
}

/// Serializes a host policy into the message handed across the backend
/// boundary, keyed by policy name.
fn host_policy_message(
    model: &str,
    policy_name: &str,
    policy: &HostPolicyCmdlineConfig,
) -> Result<serde_json::Value, CoreError> {
    let mut message = serde_json::Map::new();
    message.insert(
        policy_name.to_string(),
        serde_json::to_value(policy).map_err(|err| {
            CoreError::config(
                model,
                format!("failed to serialize host policy '{policy_name}': {err}"),
            )
        })?,
    );
    Ok(serde_json::Value::Object(message))
}

/// The niceness for this model's backend threads, from the backend's
/// command-line configuration when present.
fn backend_thread_nice(
    config: &ModelConfig,
    backend_config_map: &BackendCmdlineConfigMap,
) -> Result<i32, CoreError> {
    if let Some(settings) = backend_config_map.get(&config.backend) {
        if let Some(raw) = settings.get("thread-nice") {
            return raw.parse().map_err(|_| {
                CoreError::config(
                    &config.name,
                    format!("invalid thread-nice value '{raw}' for backend '{}'", config.backend),
                )
            });
        }
    }
    Ok(DEFAULT_BACKEND_THREAD_NICE)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::config::RateLimiterConfig;

    fn gpu_group(name: &str, count: i32, gpus: Vec<i32>) -> InstanceGroup {
        InstanceGroup {
            name: name.to_string(),
            kind: InstanceGroupKind::Gpu,
            count,
            gpus,
            profile: vec![],
            passive: false,
            host_policy: String::new(),
            rate_limiter: None,
            secondary_devices: vec![],
        }
    }

    fn config(groups: Vec<InstanceGroup>) -> ModelConfig {
        ModelConfig {
            name: "resnet".to_string(),
            backend: "onnx".to_string(),
            max_batch_size: 4,
            instance_group: groups,
            model_warmup: vec![],
            warmup_best_effort: false,
            metrics: true,
        }
    }

    fn shared(config: ModelConfig) -> Arc<ModelShared> {
        Arc::new(ModelShared::new(config, Arc::new(MockBackend::new())))
    }

    fn blocking() -> RateLimiterPolicy {
        RateLimiterPolicy {
            device_blocking: true,
        }
    }

    fn build(
        config: ModelConfig,
        policy: RateLimiterPolicy,
    ) -> Result<(Vec<Arc<ModelInstance>>, Vec<Arc<BackendThread>>), CoreError> {
        set_instances(
            &shared(config),
            &BackendCmdlineConfigMap::new(),
            &HostPolicyCmdlineConfigMap::new(),
            policy,
        )
    }

    #[test]
    fn test_identical_blocking_groups_share_one_thread() {
        let groups = vec![gpu_group("a", 1, vec![0]), gpu_group("b", 1, vec![0])];
        let (instances, threads) = build(config(groups), blocking()).unwrap();

        assert_eq!(instances.len(), 2);
        assert_eq!(threads.len(), 1, "matching groups must share one thread");
        assert_eq!(threads[0].instances().len(), 2);
        assert!(instances.iter().all(|i| !i.is_passive()));
        assert!(
            instances.iter().all(|i| !i.signature().can_match()),
            "both sides of the pairing must be consumed"
        );
    }

    #[test]
    fn test_all_identical_blocking_groups_collapse_onto_one_thread() {
        let groups = vec![
            gpu_group("a", 1, vec![0]),
            gpu_group("b", 1, vec![0]),
            gpu_group("c", 1, vec![0]),
        ];
        let (instances, threads) = build(config(groups), blocking()).unwrap();

        assert_eq!(instances.len(), 3);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].instances().len(), 3);
    }

    #[test]
    fn test_replicas_within_a_group_share_under_blocking() {
        let (instances, threads) = build(config(vec![gpu_group("g", 3, vec![0])]), blocking()).unwrap();

        assert_eq!(instances.len(), 3);
        assert_eq!(threads.len(), 1);
        let names: Vec<&str> = instances.iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["g_0", "g_1", "g_2"]);
    }

    #[test]
    fn test_nonblocking_groups_get_distinct_threads() {
        let groups = vec![
            gpu_group("a", 1, vec![0]),
            gpu_group("b", 1, vec![0]),
            gpu_group("c", 1, vec![0]),
        ];
        let (instances, threads) =
            build(config(groups), RateLimiterPolicy::default()).unwrap();

        assert_eq!(threads.len(), 3, "non-blocking instances never share");
        assert!(
            instances.iter().all(|i| i.signature().can_match()),
            "no pairing happened, so no signature was consumed"
        );
    }

    #[test]
    fn test_unmatched_signature_identifies_singleton_thread() {
        let (instances, threads) = build(config(vec![gpu_group("g", 1, vec![0])]), blocking()).unwrap();

        assert_eq!(threads.len(), 1);
        assert!(instances[0].signature().can_match());
    }

    #[test]
    fn test_differing_device_ids_never_share() {
        let (instances, threads) = build(config(vec![gpu_group("g", 1, vec![0, 1])]), blocking()).unwrap();

        assert_eq!(instances.len(), 2);
        assert_eq!(threads.len(), 2, "device id is always part of the key");
        let devices: Vec<i32> = instances.iter().map(|i| i.device_id()).collect();
        assert_eq!(devices, vec![0, 1]);
    }

    #[test]
    fn test_differing_rate_limiter_resources_never_share() {
        let mut a = gpu_group("a", 1, vec![0]);
        a.rate_limiter = Some(RateLimiterConfig::default());
        let b = gpu_group("b", 1, vec![0]);
        let (_, threads) = build(config(vec![a, b]), blocking()).unwrap();

        assert_eq!(threads.len(), 2);
    }

    #[test]
    fn test_passive_groups_participate_in_matching() {
        let mut a = gpu_group("a", 1, vec![0]);
        a.passive = true;
        let mut b = gpu_group("b", 1, vec![0]);
        b.passive = true;
        let (instances, threads) = build(config(vec![a, b]), blocking()).unwrap();

        assert_eq!(threads.len(), 1);
        assert!(instances.iter().all(|i| i.is_passive()));
    }

    #[test]
    fn test_cpu_group_device_is_zero() {
        let group = InstanceGroup {
            kind: InstanceGroupKind::Cpu,
            ..gpu_group("cpu", 1, vec![])
        };
        let (instances, _) = build(config(vec![group]), blocking()).unwrap();
        assert_eq!(instances[0].device_id(), 0);
        assert_eq!(instances[0].kind(), InstanceGroupKind::Cpu);
    }

    #[test]
    fn test_unknown_host_policy_aborts_load() {
        let mut group = gpu_group("g", 1, vec![0]);
        group.host_policy = "numa_9".to_string();
        let result = build(config(vec![group]), blocking());
        match result {
            Err(CoreError::Config { reason, .. }) => assert!(reason.contains("numa_9")),
            _ => panic!("expected a configuration error for the unknown host policy"),
        }
    }

    #[test]
    fn test_default_host_policy_resolution() {
        let mut policies = HostPolicyCmdlineConfigMap::new();
        let mut settings = HostPolicyCmdlineConfig::new();
        settings.insert("numa-node".to_string(), "1".to_string());
        policies.insert("gpu_0".to_string(), settings);

        let (instances, _) = set_instances(
            &shared(config(vec![gpu_group("g", 1, vec![0])])),
            &BackendCmdlineConfigMap::new(),
            &policies,
            blocking(),
        )
        .unwrap();

        let instance = &instances[0];
        assert_eq!(instance.host_policy_name(), "gpu_0");
        assert_eq!(
            instance.host_policy().get("numa-node").map(String::as_str),
            Some("1")
        );
        assert_eq!(
            instance.host_policy_message()["gpu_0"]["numa-node"],
            serde_json::json!("1")
        );
    }

    #[test]
    fn test_secondary_devices_recorded_verbatim() {
        let mut group = gpu_group("g", 1, vec![0]);
        group.secondary_devices = vec![crate::config::SecondaryDeviceConfig {
            kind: "dla".to_string(),
            id: 3,
        }];
        let (instances, _) = build(config(vec![group]), blocking()).unwrap();

        let devices = instances[0].secondary_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kind(), "dla");
        assert_eq!(devices[0].id(), 3);
    }

    #[test]
    fn test_invalid_group_declarations_rejected() {
        assert!(build(config(vec![gpu_group("g", 0, vec![0])]), blocking()).is_err());
        assert!(build(config(vec![gpu_group("g", 1, vec![])]), blocking()).is_err());
        assert!(build(config(vec![gpu_group("g", 1, vec![-1])]), blocking()).is_err());

        let cpu_with_gpus = InstanceGroup {
            kind: InstanceGroupKind::Cpu,
            ..gpu_group("g", 1, vec![0])
        };
        assert!(build(config(vec![cpu_with_gpus]), blocking()).is_err());

        let auto = InstanceGroup {
            kind: InstanceGroupKind::Auto,
            ..gpu_group("g", 1, vec![0])
        };
        assert!(build(config(vec![auto]), blocking()).is_err());
    }

    #[test]
    fn test_group_names_defaulted_from_model() {
        let mut group = gpu_group("", 1, vec![0]);
        group.name = String::new();
        let (instances, _) = build(config(vec![group]), blocking()).unwrap();
        assert_eq!(instances[0].name(), "resnet_0_0");
    }

    #[test]
    fn test_backend_thread_nice_override() {
        let mut backend_settings = BTreeMap::new();
        backend_settings.insert("thread-nice".to_string(), "10".to_string());
        let mut backend_map = BackendCmdlineConfigMap::new();
        backend_map.insert("onnx".to_string(), backend_settings);

        let (_, threads) = set_instances(
            &shared(config(vec![gpu_group("g", 1, vec![0])])),
            &backend_map,
            &HostPolicyCmdlineConfigMap::new(),
            blocking(),
        )
        .unwrap();
        assert_eq!(threads[0].nice(), 10);

        let mut bad = BackendCmdlineConfigMap::new();
        bad.insert("onnx".to_string(), {
            let mut s = BTreeMap::new();
            s.insert("thread-nice".to_string(), "loud".to_string());
            s
        });
        assert!(
            set_instances(
                &shared(config(vec![gpu_group("g", 1, vec![0])])),
                &bad,
                &HostPolicyCmdlineConfigMap::new(),
                blocking(),
            )
            .is_err()
        );
    }
}
