//! # Model Configuration
//!
//! The validated configuration document consumed when a model's instance set
//! is constructed. Parsing and validation of the document against a schema is
//! the host process's responsibility; the types here are the already-parsed
//! form handed to [`Model::load`](crate::Model::load).
//!
//! The document declares instance groups (device kind, device ids, replica
//! count, profiles, passive flag, secondary devices, host policy name,
//! rate-limiter resource declarations) and warmup sample specifications.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Command-line settings for a single backend, keyed by setting name.
pub type BackendCmdlineConfig = BTreeMap<String, String>;

/// Backend command-line settings keyed by backend name.
pub type BackendCmdlineConfigMap = BTreeMap<String, BackendCmdlineConfig>;

/// Command-line settings for a single host policy, keyed by setting name.
pub type HostPolicyCmdlineConfig = BTreeMap<String, String>;

/// Host policy command-line settings keyed by policy name.
pub type HostPolicyCmdlineConfigMap = BTreeMap<String, HostPolicyCmdlineConfig>;

/// Device category an instance group is bound to.
///
/// `Auto` must be resolved to a concrete kind by configuration validation
/// before the instance set is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceGroupKind {
    Auto,
    Cpu,
    Gpu,
    Model,
}

impl std::fmt::Display for InstanceGroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
            Self::Model => write!(f, "model"),
        }
    }
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
    /// Variable-length byte strings. Elements are serialized with a 4-byte
    /// length prefix, so the placeholder size of an element is the prefix of
    /// an empty string.
    Bytes,
}

impl DataType {
    /// Size in bytes of one element when synthesizing placeholder buffers.
    pub fn element_size(&self) -> usize {
        match self {
            Self::Bool | Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 | Self::Fp16 => 2,
            Self::Uint32 | Self::Int32 | Self::Fp32 => 4,
            Self::Uint64 | Self::Int64 | Self::Fp64 => 8,
            Self::Bytes => 4,
        }
    }
}

/// An auxiliary device associated with an instance in addition to its primary
/// device binding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecondaryDeviceConfig {
    pub kind: String,
    pub id: i64,
}

/// A resource demand declared against the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimiterResource {
    pub name: String,
    /// Whether the resource is shared process-wide rather than per device.
    #[serde(default)]
    pub global: bool,
    pub count: u32,
}

/// Rate-limiter resource declarations for one instance group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub resources: Vec<RateLimiterResource>,
    #[serde(default)]
    pub priority: u32,
}

/// Resource-allocation policy supplied by the rate limiter when the instance
/// set is constructed.
///
/// `device_blocking` declares that instances take exclusive access to their
/// device while executing; only such instances are eligible to share an
/// execution thread with a signature-matching instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RateLimiterPolicy {
    #[serde(default)]
    pub device_blocking: bool,
}

/// One declared group of model instances.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstanceGroup {
    /// Group name; defaulted to `<model>_<index>` when empty.
    #[serde(default)]
    pub name: String,
    pub kind: InstanceGroupKind,
    /// Number of replicas to create per device.
    pub count: i32,
    /// GPU device ids for `Gpu` groups; must be empty otherwise.
    #[serde(default)]
    pub gpus: Vec<i32>,
    /// Serving profiles enabled for instances of this group.
    #[serde(default)]
    pub profile: Vec<String>,
    /// Passive instances participate in grouping but never receive direct
    /// traffic.
    #[serde(default)]
    pub passive: bool,
    /// Host policy name; defaulted from the kind and device when empty.
    #[serde(default)]
    pub host_policy: String,
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
    #[serde(default)]
    pub secondary_devices: Vec<SecondaryDeviceConfig>,
}

/// Backing source for one synthesized warmup input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupInputSource {
    /// Zero-filled placeholder buffer.
    ZeroData,
    /// Random-filled placeholder buffer. Falls back to zero fill for
    /// `Bytes` inputs, where random bytes would not form valid elements.
    RandomData,
    /// Explicitly provided raw bytes.
    ProvidedData(Vec<u8>),
}

/// One declared warmup input tensor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WarmupInput {
    pub data_type: DataType,
    /// Concrete dims; dynamic dimensions are not allowed in warmup inputs.
    pub dims: Vec<i64>,
    pub source: WarmupInputSource,
}

/// A declared warmup sample.
///
/// `count` is the total number of requests to synthesize for the sample; it
/// is clamped to a minimum of 1. Requests are grouped to match the
/// instance's expected batch size, since partial batches can change model
/// behavior for stateful or sequence models.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WarmupSampleConfig {
    pub name: String,
    pub count: u32,
    /// Input tensors keyed by name.
    pub inputs: BTreeMap<String, WarmupInput>,
}

/// The validated configuration of one served model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Name of the backend serving this model; used to look up backend
    /// command-line settings.
    pub backend: String,
    /// Maximum batch size; 0 means the model does not support batching and
    /// warmup batches are built with a single request each.
    #[serde(default)]
    pub max_batch_size: i32,
    pub instance_group: Vec<InstanceGroup>,
    #[serde(default)]
    pub model_warmup: Vec<WarmupSampleConfig>,
    /// When true, warmup failures are logged and the load continues rather
    /// than aborting.
    #[serde(default)]
    pub warmup_best_effort: bool,
    /// Whether per-instance metric reporters are constructed.
    #[serde(default = "default_metrics")]
    pub metrics: bool,
}

fn default_metrics() -> bool {
    true
}
