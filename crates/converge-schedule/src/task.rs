use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::context::ScheduleContext;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Monotonically assigned task identity.
///
/// Task equality and hashing go through this id, never through labels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

type TaskAction = Box<dyn Fn(Arc<ScheduleContext>) -> TaskFuture + Send + Sync>;

/// A schedulable unit of work.
///
/// `run` performs the work; `finalise` releases whatever the run phase
/// acquired. The executor invokes `finalise` for every task that started,
/// on every exit path.
pub trait ScheduleTask: Send + Sync {
    fn id(&self) -> TaskId;

    /// Human-readable rendering used in schedule dumps and diagnostics.
    fn describe(&self) -> String;

    fn run(&self, ctx: Arc<ScheduleContext>) -> TaskFuture;

    fn finalise(&self, ctx: Arc<ScheduleContext>) -> TaskFuture;
}

pub type TaskRef = Arc<dyn ScheduleTask>;

/// A leaf task built from a run closure and an optional finaliser.
pub struct Task {
    id: TaskId,
    label: String,
    run: TaskAction,
    finalise: Option<TaskAction>,
}

impl Task {
    pub fn new<F, Fut>(label: impl Into<String>, run: F) -> Arc<Self>
    where
        F: Fn(Arc<ScheduleContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(Self {
            id: TaskId::next(),
            label: label.into(),
            run: Box::new(move |ctx| Box::pin(run(ctx))),
            finalise: None,
        })
    }

    /// A task whose finaliser undoes what the run phase set up.
    pub fn with_finaliser<F, FFut, G, GFut>(
        label: impl Into<String>,
        run: F,
        finalise: G,
    ) -> Arc<Self>
    where
        F: Fn(Arc<ScheduleContext>) -> FFut + Send + Sync + 'static,
        FFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        G: Fn(Arc<ScheduleContext>) -> GFut + Send + Sync + 'static,
        GFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(Self {
            id: TaskId::next(),
            label: label.into(),
            run: Box::new(move |ctx| Box::pin(run(ctx))),
            finalise: Some(Box::new(move |ctx| Box::pin(finalise(ctx)))),
        })
    }
}

impl ScheduleTask for Task {
    fn id(&self) -> TaskId {
        self.id
    }

    fn describe(&self) -> String {
        self.label.clone()
    }

    fn run(&self, ctx: Arc<ScheduleContext>) -> TaskFuture {
        (self.run)(ctx)
    }

    fn finalise(&self, ctx: Arc<ScheduleContext>) -> TaskFuture {
        match &self.finalise {
            Some(finalise) => finalise(ctx),
            None => Box::pin(std::future::ready(Ok(()))),
        }
    }
}

/// An ordered group of tasks presented to the graph as a single node.
///
/// Children run in insertion order and finalise in reverse order.
/// Grouping a produce/consume pair this way keeps the two halves ordered
/// without multiplying the number of schedules.
pub struct CompositeTask {
    id: TaskId,
    children: Mutex<Vec<TaskRef>>,
}

impl CompositeTask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Append a child. Composites stay open while the topology is still
    /// being declared.
    pub fn add(&self, task: TaskRef) {
        self.children.lock().push(task);
    }

    pub fn children(&self) -> Vec<TaskRef> {
        self.children.lock().clone()
    }
}

impl ScheduleTask for CompositeTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn describe(&self) -> String {
        self.children
            .lock()
            .iter()
            .map(|t| t.describe())
            .collect::<Vec<_>>()
            .join(" then ")
    }

    fn run(&self, ctx: Arc<ScheduleContext>) -> TaskFuture {
        let children = self.children();
        Box::pin(async move {
            for child in children {
                child.run(ctx.clone()).await?;
            }
            Ok(())
        })
    }

    fn finalise(&self, ctx: Arc<ScheduleContext>) -> TaskFuture {
        let children = self.children();
        Box::pin(async move {
            for child in children.iter().rev() {
                child.finalise(ctx.clone()).await?;
            }
            Ok(())
        })
    }
}
