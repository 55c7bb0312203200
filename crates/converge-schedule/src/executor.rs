use anyhow::Context;
use tokio::task::JoinSet;

use crate::context::ScheduleContext;
use crate::enumerate::{EnumerationStrategy, Schedule};
use crate::graph::TaskGraph;
use crate::task::{ScheduleTask, TaskRef};

/// Runs every enumerated schedule against the graph's tasks.
///
/// Schedules are independent experiments: each gets a fresh
/// [`ScheduleContext`] and runs its tasks strictly sequentially, while up
/// to `batch_size` schedules execute concurrently. A failure in one
/// schedule does not cancel its batch siblings; the first failure is
/// surfaced once its batch has drained and no further batch is started.
pub struct Executor {
    graph: TaskGraph,
    strategy: Box<dyn EnumerationStrategy>,
    batch_size: usize,
}

#[derive(Copy, Clone, Debug)]
pub struct RunReport {
    pub schedules_run: usize,
}

impl Executor {
    pub fn new(graph: TaskGraph, strategy: Box<dyn EnumerationStrategy>) -> Self {
        Self {
            graph,
            strategy,
            // Bounds subprocess fan-out to something machine-reasonable
            // without serialising the whole run.
            batch_size: 16,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn run(&self) -> anyhow::Result<RunReport> {
        self.strategy.preflight(&self.graph)?;

        let mut inflight: JoinSet<anyhow::Result<()>> = JoinSet::new();
        let mut failure: Option<anyhow::Error> = None;
        let mut ran = 0usize;

        for schedule in self.strategy.schedules(&self.graph) {
            inflight.spawn(run_schedule(schedule?));
            ran += 1;
            if inflight.len() >= self.batch_size {
                drain(&mut inflight, &mut failure).await?;
                if failure.is_some() {
                    break;
                }
            }
        }
        drain(&mut inflight, &mut failure).await?;

        if let Some(err) = failure {
            return Err(err);
        }
        tracing::info!("ran {ran} schedules, all passed expectation checks");
        Ok(RunReport { schedules_run: ran })
    }
}

async fn drain(
    inflight: &mut JoinSet<anyhow::Result<()>>,
    failure: &mut Option<anyhow::Error>,
) -> anyhow::Result<()> {
    while let Some(joined) = inflight.join_next().await {
        match joined.context("schedule task panicked or was aborted")? {
            Ok(()) => {}
            Err(err) => {
                if failure.is_none() {
                    *failure = Some(err);
                }
            }
        }
    }
    Ok(())
}

async fn run_schedule(schedule: Schedule) -> anyhow::Result<()> {
    let ctx = ScheduleContext::new(schedule.clone());

    let mut started: Vec<TaskRef> = Vec::with_capacity(schedule.len());
    let mut failure = None;
    for task in schedule.tasks() {
        started.push(task.clone());
        if let Err(err) = task.run(ctx.clone()).await {
            failure = Some(err);
            break;
        }
    }

    // Every task that started gets finalised, in reverse schedule order.
    // A finaliser failure is logged and never masks the run failure.
    for task in started.iter().rev() {
        if let Err(err) = task.finalise(ctx.clone()).await {
            tracing::error!("finaliser for `{}` failed: {err:#}", task.describe());
        }
    }

    match failure {
        Some(err) => {
            tracing::error!("check failed running {schedule}");
            Err(err.context(format!("failed running {schedule}")))
        }
        None => Ok(()),
    }
}
