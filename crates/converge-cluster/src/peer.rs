use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use converge_schedule::{ScheduleContext, ScheduleTask, StateKey, Task, TaskId, TaskRef};
use parking_lot::Mutex;

use crate::channel::HalfStream;
use crate::topology::ClusterShared;
use crate::{db, next_entity_id, Config};

/// Whether a peer plays the server or the client side of its mirrors.
///
/// Behaviourally identical today; the distinction is kept for policy that
/// may diverge later (auth, direction restrictions).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerRole {
    Server,
    Client,
}

/// Identity of a peer, as captured by task closures and streams.
#[derive(Clone)]
pub(crate) struct PeerInfo {
    pub(crate) id: u64,
    pub(crate) name: String,
}

/// Schedule-local key of a peer's database path.
pub(crate) fn db_key(peer_id: u64) -> StateKey {
    StateKey::scoped(peer_id, "db")
}

/// A literal in a generated SQL statement.
///
/// Strings are single-quoted verbatim; embedded quote characters are not
/// escaped, so test data must avoid them. Integers and booleans use their
/// natural textual form.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Text(s) => serde_json::Value::from(s.clone()),
            Self::Bool(b) => serde_json::Value::from(*b),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

fn render_row(row: &[SqlValue]) -> String {
    row.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A named database instance in the topology.
///
/// Cheap to clone; all handles refer to the same peer. Mutating operations
/// register tasks ordered after this peer's previous operation and fan
/// replication steps out to every reachable mirror of the affected table.
#[derive(Clone)]
pub struct Peer {
    core: Arc<PeerCore>,
}

struct PeerCore {
    info: PeerInfo,
    role: PeerRole,
    config: Arc<Config>,
    schema: Arc<Mutex<Vec<String>>>,
    shared: Arc<ClusterShared>,
    last_task: Mutex<Option<TaskId>>,
}

impl Peer {
    pub(crate) fn new(
        name: &str,
        role: PeerRole,
        config: Arc<Config>,
        schema: Arc<Mutex<Vec<String>>>,
        shared: Arc<ClusterShared>,
    ) -> Self {
        Self {
            core: Arc::new(PeerCore {
                info: PeerInfo {
                    id: next_entity_id(),
                    name: name.to_string(),
                },
                role,
                config,
                schema,
                shared,
                last_task: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.info.name
    }

    pub fn role(&self) -> PeerRole {
        self.core.role
    }

    pub(crate) fn info(&self) -> PeerInfo {
        self.core.info.clone()
    }

    pub(crate) fn set_last_task(&self, task: TaskId) {
        *self.core.last_task.lock() = Some(task);
    }

    /// Record that this peer feeds `stream` with changes to `table`.
    pub(crate) fn notify_connection(&self, table: &str, stream: HalfStream) {
        self.core
            .shared
            .outgoing
            .lock()
            .entry((self.core.info.id, table.to_string()))
            .or_default()
            .push(stream);
    }

    /// Insert a row, returning the DML task's id for use in
    /// schedule-dependent expectations.
    pub fn insert_into(&self, table: &str, row: Vec<SqlValue>) -> TaskId {
        let values = render_row(&row);
        let sql = format!("INSERT INTO {table} VALUES ({values});");
        let label = format!("insert ({values}) into '{table}' on {}", self.name());
        let dml = self.dml_task(sql, label);
        self.fan_out(table, dml);
        dml
    }

    /// Delete the rows matching `predicate`.
    pub fn delete_from_where(&self, table: &str, predicate: &str) -> TaskId {
        let sql = format!("DELETE FROM {table} WHERE {predicate};");
        let label = format!("delete where {predicate} from '{table}' on {}", self.name());
        let dml = self.dml_task(sql, label);
        self.fan_out(table, dml);
        dml
    }

    /// Run a read against this peer's database, one JSON object per row.
    pub async fn query(
        &self,
        ctx: &ScheduleContext,
        sql: &str,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        query_peer(&self.core.config, &self.core.info, ctx, sql).await
    }

    /// The task that creates this peer's database, applies the bootstrap
    /// SQL and the user schema; its finaliser deletes the database file.
    pub(crate) fn init_task(&self) -> TaskRef {
        let label = match self.core.role {
            PeerRole::Server => format!("create server {}", self.name()),
            PeerRole::Client => format!("create client {}", self.name()),
        };

        let config = self.core.config.clone();
        let schema = self.core.schema.clone();
        let key = db_key(self.core.info.id);
        let name = self.core.info.name.clone();
        Task::with_finaliser(
            label,
            move |ctx| {
                let config = config.clone();
                let schema = schema.clone();
                async move {
                    let path = config
                        .data_dir
                        .join(format!("{}.db", uuid::Uuid::new_v4()));
                    ctx.store(key, path.clone());

                    db::init(&config, &path).await?;
                    if let Some(bootstrap) = &config.bootstrap_sql {
                        db::apply_sql_file(&config, &path, bootstrap).await?;
                    }
                    let ddl = schema.lock().join("\n");
                    if !ddl.is_empty() {
                        db::run_sql(&config, &path, &ddl).await?;
                    }
                    Ok(())
                }
            },
            move |ctx| {
                let name = name.clone();
                async move {
                    let path: PathBuf = ctx
                        .get(key)
                        .with_context(|| format!("no database for {name}"))?;
                    tokio::fs::remove_file(&path)
                        .await
                        .with_context(|| format!("failed to remove {}", path.display()))
                }
            },
        )
    }

    fn dml_task(&self, sql: String, label: String) -> TaskId {
        let config = self.core.config.clone();
        let key = db_key(self.core.info.id);
        let name = self.core.info.name.clone();
        let task = Task::new(label, move |ctx| {
            let config = config.clone();
            let sql = sql.clone();
            let name = name.clone();
            async move {
                let path: PathBuf = ctx
                    .get(key)
                    .with_context(|| format!("no database for {name}"))?;
                db::run_sql(&config, &path, &sql).await
            }
        });

        let id = task.id();
        let mut graph = self.core.shared.graph.lock();
        graph.add_task(task);
        let mut last = self.core.last_task.lock();
        graph.happens_before(*last, id);
        *last = Some(id);
        id
    }

    /// Fan a mutation out into the replication graph: a breadth-first walk
    /// over the streams carrying `table`, visiting each peer at most once.
    /// Every hop's step is ordered after the step (or DML) that made the
    /// change visible on its sender.
    fn fan_out(&self, table: &str, dml: TaskId) {
        let mut visited: HashSet<u64> = HashSet::from([self.core.info.id]);
        let mut frontier = vec![(self.core.info.id, dml)];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (peer, after) in frontier {
                let streams: Vec<HalfStream> = self
                    .core
                    .shared
                    .outgoing
                    .lock()
                    .get(&(peer, table.to_string()))
                    .cloned()
                    .unwrap_or_default();

                for stream in streams {
                    let dest = stream.receiver_id();
                    if !visited.insert(dest) {
                        continue;
                    }
                    let step = stream.step_composite();
                    let step_id = step.id();
                    let mut graph = self.core.shared.graph.lock();
                    graph.add_task(step);
                    graph.happens_before(Some(after), step_id);
                    drop(graph);
                    next.push((dest, step_id));
                }
            }
            frontier = next;
        }
    }
}

pub(crate) async fn query_peer(
    config: &Config,
    info: &PeerInfo,
    ctx: &ScheduleContext,
    sql: &str,
) -> anyhow::Result<Vec<serde_json::Value>> {
    let path: PathBuf = ctx
        .get(db_key(info.id))
        .with_context(|| format!("no database for {}", info.name))?;
    db::query_json(config, &path, sql).await
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.core.info.name)
    }
}
