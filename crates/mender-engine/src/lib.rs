//! Remediation engine for Mender: the Reasoning Client, source context, the
//! flaky-test fallback, the Remediation Orchestrator and its report.

pub mod context;
pub mod flaky;
pub mod orchestrator;
pub mod reasoning;
pub mod report;

pub use context::SourceContext;
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use reasoning::{
    ChatCompletionsService, DiagnosisError, ReasoningClient, ReasoningRequest, ReasoningService,
    ServiceError,
};
