use crate::ledger::FailureStage;

/// A classified failure of one sweep point. Never aborts the sweep; it is recorded in the
/// ledger and the controller moves on.
#[derive(Debug, thiserror::Error)]
pub enum PointFailure {
    #[error("source injection failed: {0}")]
    SourceInjection(String),

    #[error("point setup failed: {0}")]
    PointSetup(String),

    /// The base configuration no longer contains the expected placeholder (version skew).
    #[error("config template mismatch: {0}")]
    ConfigTemplateMismatch(String),

    #[error("entrypoint template mismatch: {0}")]
    EntrypointTemplateMismatch(String),

    #[error("build failed: {0}")]
    BuildFailure(String),

    /// Software drops exceeded epsilon; the run was interrupted.
    #[error("runtime overload: {0}")]
    RuntimeOverload(String),

    #[error("runtime failure: {0}")]
    RuntimeFailure(String),
}

impl PointFailure {
    pub fn stage(&self) -> FailureStage {
        match self {
            PointFailure::SourceInjection(_) => FailureStage::SourceInjection,
            PointFailure::PointSetup(_) => FailureStage::PointSetup,
            PointFailure::ConfigTemplateMismatch(_) => FailureStage::ConfigTemplateMismatch,
            PointFailure::EntrypointTemplateMismatch(_) => FailureStage::EntrypointTemplateMismatch,
            PointFailure::BuildFailure(_) => FailureStage::BuildFailure,
            PointFailure::RuntimeOverload(_) => FailureStage::RuntimeOverload,
            PointFailure::RuntimeFailure(_) => FailureStage::RuntimeFailure,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            PointFailure::SourceInjection(d)
            | PointFailure::PointSetup(d)
            | PointFailure::ConfigTemplateMismatch(d)
            | PointFailure::EntrypointTemplateMismatch(d)
            | PointFailure::BuildFailure(d)
            | PointFailure::RuntimeOverload(d)
            | PointFailure::RuntimeFailure(d) => d.clone(),
        }
    }
}

/// Problems found while validating a sweep plan; all of them are reported together.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("sweep plan is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("sweep plan is invalid: {0}")]
    Invalid(String),
}
