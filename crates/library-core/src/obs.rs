//! Structured lifecycle events for chain executions.
//!
//! Every chain run gets a span tagged with its ledger run id; the `emit_*`
//! functions log one `event=` line per lifecycle transition.

use tracing::{info, warn};

/// Span tagging everything a chain logs with its run id.
///
/// Attach with `tracing::Instrument::instrument` so it survives `.await`.
pub fn chain_span(chain: &str, run_id: &str) -> tracing::Span {
    tracing::info_span!("library.chain", chain = %chain, run_id = %run_id)
}

pub fn emit_chain_started(chain: &str, run_id: &str, subject: &str) {
    info!(event = "chain.started", chain = %chain, run_id = %run_id, subject = %subject);
}

pub fn emit_step_finished(run_id: &str, step: &str, attempts: u32, skipped: bool) {
    info!(
        event = "chain.step_finished",
        run_id = %run_id,
        step = %step,
        attempts = attempts,
        skipped = skipped,
    );
}

/// A step hit a transient failure and will run again after `delay_ms`.
pub fn emit_step_retry(run_id: &str, step: &str, attempt: u32, delay_ms: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "chain.step_retry",
        run_id = %run_id,
        step = %step,
        attempt = attempt,
        delay_ms = delay_ms,
        error = %error,
    );
}

pub fn emit_chain_finished(chain: &str, run_id: &str, duration_ms: u64) {
    info!(event = "chain.finished", chain = %chain, run_id = %run_id, duration_ms = duration_ms);
}

pub fn emit_chain_failed(chain: &str, run_id: &str, step: &str, error: &dyn std::fmt::Display) {
    warn!(event = "chain.failed", chain = %chain, run_id = %run_id, step = %step, error = %error);
}

/// The ledger could not record a chain outcome.
pub fn emit_ledger_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "chain.ledger_error", run_id = %run_id, error = %error);
}
