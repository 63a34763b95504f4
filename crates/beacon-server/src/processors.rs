//! Built-in processors.

use beacon_jobs::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Payload of a `demo` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoPayload {
    /// Number of progress steps.
    pub steps: u32,
    /// Pause between steps in milliseconds.
    pub step_delay_ms: u64,
    /// Attempts that end in a transient failure before one succeeds.
    pub fail_attempts: u32,
    /// End every attempt with a terminal failure.
    pub reject: bool,
}

impl Default for DemoPayload {
    fn default() -> Self {
        Self {
            steps: 5,
            step_delay_ms: 200,
            fail_attempts: 0,
            reject: false,
        }
    }
}

/// Result of a `demo` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoOutput {
    pub steps: u32,
    pub attempt: u32,
}

/// Steps through a fixed amount of simulated work, reporting progress.
///
/// Useful for exercising retries, cancellation and the health report
/// without any downstream service.
#[derive(Debug, Default, Clone, Copy)]
pub struct DemoProcessor;

impl DemoProcessor {
    const MAX_STEPS: u32 = 100;
    const MAX_STEP_DELAY_MS: u64 = 60_000;
}

#[async_trait]
impl Processor for DemoProcessor {
    type Payload = DemoPayload;
    type Output = DemoOutput;
    const JOB_TYPE: JobType = JobType::Demo;

    fn validate(&self, payload: &DemoPayload) -> JobResult<()> {
        if payload.steps == 0 || payload.steps > Self::MAX_STEPS {
            return Err(JobError::Validation(format!(
                "steps must be between 1 and {}, got {}",
                Self::MAX_STEPS,
                payload.steps
            )));
        }
        if payload.step_delay_ms > Self::MAX_STEP_DELAY_MS {
            return Err(JobError::Validation(format!(
                "step_delay_ms must be at most {}",
                Self::MAX_STEP_DELAY_MS
            )));
        }
        Ok(())
    }

    async fn process(&self, payload: DemoPayload, ctx: JobContext) -> JobResult<DemoOutput> {
        let delay = Duration::from_millis(payload.step_delay_ms);

        for step in 1..=payload.steps {
            tokio::select! {
                _ = ctx.cancellation_token.cancelled() => return Err(JobError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            let percent = (step * 100 / payload.steps) as i32;
            ctx.update_progress(percent, Some(format!("step {}/{}", step, payload.steps)))
                .await?;
            debug!(job_id = %ctx.job_id, step, "Demo step done");
        }

        if payload.reject {
            return Err(JobError::rejected("demo job asked to be rejected"));
        }
        if ctx.attempt <= payload.fail_attempts {
            return Err(JobError::transient(format!(
                "simulated failure on attempt {}",
                ctx.attempt
            )));
        }

        Ok(DemoOutput {
            steps: payload.steps,
            attempt: ctx.attempt,
        })
    }
}
