//! Reasoning Client: turns a failure record and its source context into a
//! validated `FixProposal`.

pub mod parse;
pub mod prompts;
pub mod service;

pub use parse::{parse_fix_proposal, InvalidProposal};
pub use service::{ChatCompletionsService, ReasoningRequest, ReasoningService, ServiceError};

use crate::context::SourceContext;
use mender_adapters::Config;
use mender_core::{retry, BackoffPolicy, DiagnosisReason, FailureRecord, FixProposal, StageCounter};

/// Diagnosis gave up after the retry budget or on a fatal error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("diagnosis failed ({reason}) after {attempts} attempt(s): {detail}")]
pub struct DiagnosisError {
    pub reason: DiagnosisReason,
    pub detail: String,
    pub attempts: u32,
}

pub struct ReasoningClient {
    service: Box<dyn ReasoningService>,
    policy: BackoffPolicy,
    max_response_tokens: u32,
}

impl ReasoningClient {
    pub fn new(
        service: Box<dyn ReasoningService>,
        policy: BackoffPolicy,
        max_response_tokens: u32,
    ) -> Self {
        Self {
            service,
            policy,
            max_response_tokens,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let service = ChatCompletionsService::new(&config.reasoning)?;
        Ok(Self::new(
            Box::new(service),
            config.retry.clone(),
            config.reasoning.max_response_tokens,
        ))
    }

    /// Ask the service for a fix. Invalid answers count as failed attempts
    /// and are retried under the same budget as transport errors.
    pub async fn diagnose_and_fix(
        &self,
        record: &FailureRecord,
        context: &SourceContext,
        counter: &mut StageCounter,
    ) -> Result<FixProposal, DiagnosisError> {
        let request = ReasoningRequest {
            system: prompts::fix_system(),
            user: prompts::fix_user(record, context),
            max_tokens: self.max_response_tokens,
        };
        tracing::info!(
            test = %record.test_identifier,
            kind = %record.error_kind,
            context_file = ?context.path,
            context_truncated = context.truncated,
            "requesting fix proposal"
        );

        let calls_before = counter.calls;
        let service = self.service.as_ref();
        let result = retry(
            &self.policy,
            counter,
            "diagnose",
            ServiceError::retry_decision,
            |attempt| {
                let request = &request;
                async move {
                    let content = service.complete(request).await?;
                    parse_fix_proposal(&content, context).map_err(|err| {
                        tracing::debug!(attempt, error = %err, "rejected fix proposal");
                        ServiceError::Malformed(err.to_string())
                    })
                }
            },
        )
        .await;

        match result {
            Ok(proposal) => {
                tracing::info!(
                    target_file = %proposal.target_file.display(),
                    format = proposal.patch.label(),
                    "fix proposal accepted"
                );
                Ok(proposal)
            }
            Err(err) => Err(DiagnosisError {
                reason: err.reason(),
                detail: err.to_string(),
                attempts: counter.calls - calls_before,
            }),
        }
    }
}
