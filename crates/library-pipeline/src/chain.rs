//! Steps and chains.
//!
//! A chain is an ordered list of steps. Each step receives the context the
//! previous one returned plus the chain's immutable config. Step N+1 starts
//! only after step N's outcome is in the [`TaskLedger`]. Steps marked
//! `gated` pass the context through untouched once it reports missing
//! architectures, so an incomplete build still finishes its chain.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use library_core::{obs, BuildContext, Classify, SweepContext};
use library_state::{StepEvent, StepOutcome, TaskLedger, TaskRunId};
use serde::Serialize;
use serde_json::json;
use tracing::Instrument;

use crate::error::{PipelineError, Result};
use crate::queue::{Queue, WorkerPool};
use crate::retry::RetryPolicy;

/// State threaded through a chain.
pub trait ChainContext: Clone + Serialize + Send + Sync + 'static {
    /// Gated steps become passthroughs while this is true.
    fn architectures_missing(&self) -> bool {
        false
    }
}

impl ChainContext for BuildContext {
    fn architectures_missing(&self) -> bool {
        self.missing_architectures
    }
}

impl ChainContext for SweepContext {}

impl ChainContext for () {}

/// One unit of work in a chain.
#[async_trait]
pub trait Step<C, X>: Send + Sync
where
    C: Send + Sync,
    X: ChainContext,
{
    /// Stable task name recorded in the ledger (e.g. `db.mark_distro_gate`).
    fn name(&self) -> &'static str;

    fn queue(&self) -> Queue;

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    fn gated(&self) -> bool {
        false
    }

    async fn run(&self, ctx: X, config: &C) -> Result<X>;
}

/// An ordered list of steps sharing one config and context type.
pub struct Chain<C, X> {
    name: &'static str,
    steps: Vec<Arc<dyn Step<C, X>>>,
}

impl<C, X> Chain<C, X>
where
    C: Send + Sync,
    X: ChainContext,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    pub fn then(mut self, step: impl Step<C, X> + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

/// A chain that ran to the end.
#[derive(Debug, Clone)]
pub struct Completed<X> {
    pub run_id: TaskRunId,
    pub context: X,
}

/// Executes chains against a ledger and a worker pool.
#[derive(Clone)]
pub struct ChainRunner {
    ledger: Arc<dyn TaskLedger>,
    pool: WorkerPool,
}

impl ChainRunner {
    pub fn new(ledger: Arc<dyn TaskLedger>, pool: WorkerPool) -> Self {
        Self { ledger, pool }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn ledger(&self) -> &Arc<dyn TaskLedger> {
        &self.ledger
    }

    /// Run `chain` from `ctx` to completion or first fatal error.
    pub async fn run<C, X>(
        &self,
        chain: &Chain<C, X>,
        subject: &str,
        config: &C,
        ctx: X,
    ) -> Result<Completed<X>>
    where
        C: Send + Sync,
        X: ChainContext,
    {
        let run_id = self.ledger.create_run(chain.name, subject).await?;
        let span = obs::chain_span(chain.name, &run_id.0);
        self.drive(chain, run_id, subject, config, ctx)
            .instrument(span)
            .await
    }

    async fn drive<C, X>(
        &self,
        chain: &Chain<C, X>,
        run_id: TaskRunId,
        subject: &str,
        config: &C,
        mut ctx: X,
    ) -> Result<Completed<X>>
    where
        C: Send + Sync,
        X: ChainContext,
    {
        let start = Instant::now();
        obs::emit_chain_started(chain.name, &run_id.0, subject);

        for (index, step) in chain.steps.iter().enumerate() {
            let seq = index as u64 + 1;

            if step.gated() && ctx.architectures_missing() {
                if let Err(e) = self
                    .record(&run_id, seq, step.name(), StepOutcome::Skipped, 0, payload(&ctx))
                    .await
                {
                    return Err(self.abort(chain.name, &run_id, step.name(), e).await);
                }
                obs::emit_step_finished(&run_id.0, step.name(), 0, true);
                continue;
            }

            let policy = step.retry();
            let mut attempt = 1u32;
            loop {
                let outcome = match self.pool.acquire(step.queue()).await {
                    Ok(_worker) => step.run(ctx.clone(), config).await,
                    Err(e) => return Err(self.abort(chain.name, &run_id, step.name(), e).await),
                };

                match outcome {
                    Ok(next) => {
                        ctx = next;
                        if let Err(e) = self
                            .record(&run_id, seq, step.name(), StepOutcome::Succeeded, attempt, payload(&ctx))
                            .await
                        {
                            return Err(self.abort(chain.name, &run_id, step.name(), e).await);
                        }
                        obs::emit_step_finished(&run_id.0, step.name(), attempt, false);
                        break;
                    }
                    Err(e) if policy.should_retry(e.class(), attempt) => {
                        let delay = policy.delay(attempt);
                        obs::emit_step_retry(
                            &run_id.0,
                            step.name(),
                            attempt,
                            delay.as_millis() as u64,
                            &e,
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        let error = json!({ "error": e.to_string(), "class": e.class() });
                        if let Err(ledger_err) = self
                            .record(&run_id, seq, step.name(), StepOutcome::Failed, attempt, error)
                            .await
                        {
                            obs::emit_ledger_error(&run_id.0, &ledger_err);
                        }
                        return Err(self.abort(chain.name, &run_id, step.name(), e).await);
                    }
                }
            }
        }

        self.ledger.complete_run(&run_id).await?;
        obs::emit_chain_finished(chain.name, &run_id.0, start.elapsed().as_millis() as u64);
        Ok(Completed {
            run_id,
            context: ctx,
        })
    }

    async fn record(
        &self,
        run_id: &TaskRunId,
        seq: u64,
        step: &str,
        outcome: StepOutcome,
        attempts: u32,
        payload: serde_json::Value,
    ) -> Result<()> {
        let event = StepEvent {
            seq,
            step: step.to_string(),
            outcome,
            attempts,
            payload,
            timestamp: Utc::now(),
        };
        self.ledger.append_step(run_id, event).await?;
        Ok(())
    }

    /// Mark the run failed and wrap `error` with where it happened.
    async fn abort(
        &self,
        chain: &'static str,
        run_id: &TaskRunId,
        step: &'static str,
        error: PipelineError,
    ) -> PipelineError {
        obs::emit_chain_failed(chain, &run_id.0, step, &error);
        if let Err(e) = self.ledger.fail_run(run_id, &error.to_string()).await {
            obs::emit_ledger_error(&run_id.0, &e);
        }
        PipelineError::ChainFailed {
            chain,
            run_id: run_id.clone(),
            step,
            source: Box::new(error),
        }
    }
}

fn payload<X: Serialize>(ctx: &X) -> serde_json::Value {
    serde_json::to_value(ctx).unwrap_or(serde_json::Value::Null)
}
