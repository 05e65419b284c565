/// Recovery paths for worker error strings.
///
/// The worker reports recoverable conditions only through its error
/// messages, so classification is by substring, kept in one table so
/// there is a single authoritative matcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryAction {
    /// `thread/resume` once, then retry the original call.
    ResumeAndRetry,
    /// Retry the read with `includeTurns=false`.
    RetryWithoutTurns,
    /// Serve the projection instead of the worker.
    ProjectionFallback,
    /// `collaborationMode/list` is not implemented by this worker.
    CollabModeUnsupported,
}

const PREDICATES: &[(fn(&str) -> bool, RecoveryAction)] = &[
    (needs_resume, RecoveryAction::ResumeAndRetry),
    (not_materialized, RecoveryAction::RetryWithoutTurns),
    (no_rollout, RecoveryAction::ProjectionFallback),
    (collab_mode_unsupported, RecoveryAction::CollabModeUnsupported),
];

pub fn classify_worker_error(message: &str) -> Option<RecoveryAction> {
    let lowered = message.to_lowercase();
    PREDICATES
        .iter()
        .find(|(matches, _)| matches(&lowered))
        .map(|(_, action)| *action)
}

fn needs_resume(lowered: &str) -> bool {
    lowered.contains("thread not loaded") || lowered.contains("thread not found")
}

fn not_materialized(lowered: &str) -> bool {
    lowered.contains("not materialized yet")
}

fn no_rollout(lowered: &str) -> bool {
    lowered.contains("no rollout found")
}

fn collab_mode_unsupported(lowered: &str) -> bool {
    let Some(method_at) = lowered.find("collaborationmode/list") else {
        return false;
    };
    ["unsupported", "unhandled", "method not found"]
        .iter()
        .any(|marker| lowered.find(marker).is_some_and(|at| at < method_at))
}
