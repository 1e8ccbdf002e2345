//! Running tally of how each SMTP transaction ended.

use acton_reactive::prelude::*;

use crate::error::PipelineError;
use crate::pipeline::{ProcessingReport, TerminalAction};

// --- Message types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Forwarded,
    Dropped,
    Rejected,
    /// Refused before any side effect (validation, decode).
    Refused,
    /// Failed on a transient cause (configuration, notification, relay).
    Failed,
}

impl OutcomeKind {
    pub fn of(result: &Result<ProcessingReport, PipelineError>) -> Self {
        match result {
            Ok(report) => match report.action {
                TerminalAction::Forwarded(_) => OutcomeKind::Forwarded,
                TerminalAction::Dropped => OutcomeKind::Dropped,
                TerminalAction::Rejected(_) => OutcomeKind::Rejected,
            },
            Err(e) if e.is_transient() => OutcomeKind::Failed,
            Err(_) => OutcomeKind::Refused,
        }
    }
}

#[acton_message]
pub struct InvocationFinished {
    pub outcome: OutcomeKind,
}

// --- Actor ---

#[acton_actor]
pub struct LedgerState {
    forwarded: u64,
    dropped: u64,
    rejected: u64,
    refused: u64,
    failed: u64,
}

impl LedgerState {
    pub async fn create(runtime: &mut ActorRuntime) -> anyhow::Result<ActorHandle> {
        let actor_config = ActorConfig::new(Ern::with_root("outcome-ledger")?, None, None)?
            .with_restart_policy(RestartPolicy::Permanent);

        let mut builder = runtime.new_actor_with_config::<Self>(actor_config);

        builder.mutate_on::<InvocationFinished>(|actor, ctx| {
            match ctx.message().outcome {
                OutcomeKind::Forwarded => actor.model.forwarded += 1,
                OutcomeKind::Dropped => actor.model.dropped += 1,
                OutcomeKind::Rejected => actor.model.rejected += 1,
                OutcomeKind::Refused => actor.model.refused += 1,
                OutcomeKind::Failed => {
                    actor.model.failed += 1;
                    tracing::warn!("Invocation failures so far: {}", actor.model.failed);
                }
            }
            Reply::ready()
        });

        builder.after_stop(|actor| {
            tracing::info!(
                "Ledger stopped. Forwarded: {}, Dropped: {}, Rejected: {}, Refused: {}, Failed: {}",
                actor.model.forwarded,
                actor.model.dropped,
                actor.model.rejected,
                actor.model.refused,
                actor.model.failed
            );
            Reply::ready()
        });

        Ok(builder.start().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::pipeline::StepOutcome;

    fn report(action: TerminalAction) -> Result<ProcessingReport, PipelineError> {
        Ok(ProcessingReport {
            action,
            archival: StepOutcome::Skipped,
            classification: StepOutcome::Skipped,
        })
    }

    #[test]
    fn test_outcome_of_reports() {
        assert_eq!(
            OutcomeKind::of(&report(TerminalAction::Forwarded("d@y.com".into()))),
            OutcomeKind::Forwarded
        );
        assert_eq!(OutcomeKind::of(&report(TerminalAction::Dropped)), OutcomeKind::Dropped);
        assert_eq!(
            OutcomeKind::of(&report(TerminalAction::Rejected("blocked sender".into()))),
            OutcomeKind::Rejected
        );
    }

    #[test]
    fn test_outcome_of_errors() {
        let validation = Err(PipelineError::Validation("no attachments".into()));
        assert_eq!(OutcomeKind::of(&validation), OutcomeKind::Refused);

        let config = Err(PipelineError::Configuration(ConfigError::Missing("routing table")));
        assert_eq!(OutcomeKind::of(&config), OutcomeKind::Failed);

        let relay = Err(PipelineError::Forward {
            destination: "d@y.com".into(),
            reason: "timeout".into(),
        });
        assert_eq!(OutcomeKind::of(&relay), OutcomeKind::Failed);
    }

    #[tokio::test]
    async fn test_ledger_accepts_outcomes() {
        let mut runtime = ActonApp::launch_async().await;
        let ledger = LedgerState::create(&mut runtime).await.unwrap();

        ledger
            .send(InvocationFinished {
                outcome: OutcomeKind::Forwarded,
            })
            .await;
        ledger
            .send(InvocationFinished {
                outcome: OutcomeKind::Failed,
            })
            .await;

        runtime.shutdown_all().await.ok();
    }
}
