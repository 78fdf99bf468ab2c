use thiserror::Error;

/// Errors produced while building, initializing, warming up, or executing
/// model instances.
///
/// Load-time variants (`Config`, `BackendInit`, `Warmup`, `Thread`) abort the
/// owning model's load entirely; no instance from a failed model is ever
/// scheduled. `Execution` is delivered per request through its response
/// channel and never takes down the execution thread.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid or unresolvable instance-group declaration.
    #[error("invalid configuration for model '{model}': {reason}")]
    Config { model: String, reason: String },

    /// The backend reported failure while initializing an instance.
    #[error("failed to initialize instance '{instance}': {reason}")]
    BackendInit { instance: String, reason: String },

    /// A synthesized warmup batch failed to execute.
    #[error("warmup of instance '{instance}' failed on sample '{sample}': {reason}")]
    Warmup {
        instance: String,
        sample: String,
        reason: String,
    },

    /// The backend reported failure for a specific request.
    #[error("execution failed on instance '{instance}': {reason}")]
    Execution { instance: String, reason: String },

    /// The OS refused to start a backend thread.
    #[error("failed to start backend thread '{name}'")]
    Thread {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    pub(crate) fn config(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            model: model.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn backend_init(instance: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendInit {
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn warmup(
        instance: impl Into<String>,
        sample: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Warmup {
            instance: instance.into(),
            sample: sample.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn execution(instance: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution {
            instance: instance.into(),
            reason: reason.into(),
        }
    }
}
