//! Named pipeline tasks with spans, timing and retry policies.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl TaskPolicy {
    pub fn retrying(retries: u32, retry_delay: Duration) -> Self {
        Self {
            retries,
            retry_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTiming {
    pub name: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub succeeded: bool,
}

/// Runs the tasks of one pipeline run and records how each went.
#[derive(Debug)]
pub struct TaskRunner {
    run_id: Uuid,
    timings: Vec<TaskTiming>,
}

impl TaskRunner {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            timings: Vec::new(),
        }
    }

    pub fn timings(&self) -> &[TaskTiming] {
        &self.timings
    }

    /// Run `op` until it succeeds or the policy's retries are spent.
    pub async fn run<T, F, Fut>(&mut self, name: &'static str, policy: TaskPolicy, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = info_span!("task", run_id = %self.run_id, task = name);
        let started = Instant::now();
        let mut attempts = 0u32;

        let result = async {
            info!("task started");
            loop {
                attempts += 1;
                match op().await {
                    Ok(value) => return Ok(value),
                    Err(err) if attempts <= policy.retries => {
                        warn!(attempt = attempts, error = %format!("{err:#}"), "task failed; retrying");
                        if !policy.retry_delay.is_zero() {
                            tokio::time::sleep(policy.retry_delay).await;
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span.clone())
        .await;

        self.finish(name, attempts, started, result, span)
    }

    /// Run a task that is never retried.
    pub async fn run_once<T, Fut>(&mut self, name: &'static str, task: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let span = info_span!("task", run_id = %self.run_id, task = name);
        let started = Instant::now();
        let result = async {
            info!("task started");
            task.await
        }
        .instrument(span.clone())
        .await;

        self.finish(name, 1, started, result, span)
    }

    fn finish<T>(
        &mut self,
        name: &'static str,
        attempts: u32,
        started: Instant,
        result: Result<T>,
        span: tracing::Span,
    ) -> Result<T> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let _entered = span.enter();
        match &result {
            Ok(_) => info!(elapsed_ms, attempts, "task finished"),
            Err(err) => error!(elapsed_ms, attempts, error = %format!("{err:#}"), "task failed"),
        }
        self.timings.push(TaskTiming {
            name: name.to_string(),
            attempts,
            elapsed_ms,
            succeeded: result.is_ok(),
        });
        result.map_err(|err| err.context(format!("task `{name}` failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[tokio::test]
    async fn retries_until_success() {
        let mut runner = TaskRunner::new(Uuid::new_v4());
        let mut calls = 0;
        let value = runner
            .run("extract", TaskPolicy::retrying(2, Duration::ZERO), || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 3 {
                        Err(anyhow!("flaky download"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(runner.timings()[0].attempts, 3);
        assert!(runner.timings()[0].succeeded);
    }

    #[tokio::test]
    async fn gives_up_after_retries_are_spent() {
        let mut runner = TaskRunner::new(Uuid::new_v4());
        let mut calls = 0;
        let err = runner
            .run("extract", TaskPolicy::retrying(1, Duration::ZERO), || {
                calls += 1;
                async { Err::<(), _>(anyhow!("archive unreachable")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls, 2);
        assert!(format!("{err:#}").contains("task `extract` failed: archive unreachable"));
        assert!(!runner.timings()[0].succeeded);
    }

    #[tokio::test]
    async fn single_shot_tasks_are_recorded() {
        let mut runner = TaskRunner::new(Uuid::new_v4());
        let total = runner
            .run_once("label", async { Ok(41 + 1) })
            .await
            .unwrap();
        assert_eq!(total, 42);
        assert_eq!(runner.timings()[0].name, "label");
        assert_eq!(runner.timings()[0].attempts, 1);
    }
}
