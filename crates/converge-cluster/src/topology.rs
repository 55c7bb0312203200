use std::collections::HashMap;
use std::sync::Arc;

use converge_schedule::{
    CompositeTask, EnumerationStrategy, Executor, RunReport, ScheduleTask, Task, TaskGraph, TaskId,
};
use futures_util::future::try_join_all;
use parking_lot::Mutex;

use crate::channel::HalfStream;
use crate::expect::Expectation;
use crate::peer::{query_peer, Peer, PeerInfo, PeerRole};
use crate::Config;

/// State shared between the topology and its peer handles: the
/// happens-before graph under construction and the stream registry used
/// for multi-hop fan-out.
pub(crate) struct ClusterShared {
    pub(crate) graph: Mutex<TaskGraph>,
    /// Outgoing streams per (peer id, table).
    pub(crate) outgoing: Mutex<HashMap<(u64, String), Vec<HalfStream>>>,
    /// Every stream in declaration order, for quiescence checks.
    pub(crate) streams: Mutex<Vec<HalfStream>>,
}

/// Declarative description of a cluster and its workload.
///
/// Declaring peers, mirrors, and operations accumulates tasks and
/// happens-before edges; [`run`](Topology::run) then explores every legal
/// interleaving.
pub struct Topology {
    config: Arc<Config>,
    strategy: Box<dyn EnumerationStrategy>,
    shared: Arc<ClusterShared>,
    schema: Arc<Mutex<Vec<String>>>,
    peers: Vec<Peer>,
    init: Arc<CompositeTask>,
    next_replication_id: u32,
}

impl Topology {
    pub fn new(strategy: impl EnumerationStrategy + 'static, config: Config) -> Self {
        let shared = Arc::new(ClusterShared {
            graph: Mutex::new(TaskGraph::new()),
            outgoing: Mutex::new(HashMap::new()),
            streams: Mutex::new(Vec::new()),
        });

        // The shared init composite is the root every peer's first
        // operation is ordered after. It grows as peers and mirrors are
        // declared.
        let init = CompositeTask::new();
        shared.graph.lock().add_task(init.clone());

        Self {
            config: Arc::new(config),
            strategy: Box::new(strategy),
            shared,
            schema: Arc::new(Mutex::new(Vec::new())),
            peers: Vec::new(),
            init,
            next_replication_id: 0,
        }
    }

    /// Append DDL applied to every peer at init.
    pub fn schema(&mut self, ddl: &str) -> &mut Self {
        self.schema.lock().push(ddl.to_string());
        self
    }

    pub fn add_server(&mut self, name: &str) -> Peer {
        self.add_peer(name, PeerRole::Server)
    }

    pub fn add_client(&mut self, name: &str) -> Peer {
        self.add_peer(name, PeerRole::Client)
    }

    fn add_peer(&mut self, name: &str, role: PeerRole) -> Peer {
        let peer = Peer::new(
            name,
            role,
            self.config.clone(),
            self.schema.clone(),
            self.shared.clone(),
        );
        self.init.add(peer.init_task());
        peer.set_last_task(self.init.id());
        self.peers.push(peer.clone());
        peer
    }

    fn gen_replication_id(&mut self) -> String {
        self.next_replication_id += 1;
        self.next_replication_id.to_string()
    }

    /// Mirror `table` between `a` and `b`: one half-stream per direction,
    /// each with a fresh replication id so the binary can filter out its
    /// own payloads.
    pub fn mirror(&mut self, table: &str, a: &Peer, b: &Peer) -> &mut Self {
        let atob = HalfStream::new(
            table,
            a.info(),
            b.info(),
            self.gen_replication_id(),
            self.config.clone(),
        );
        let btoa = HalfStream::new(
            table,
            b.info(),
            a.info(),
            self.gen_replication_id(),
            self.config.clone(),
        );

        self.init.add(atob.init_composite());
        self.init.add(btoa.init_composite());
        a.notify_connection(table, atob.clone());
        b.notify_connection(table, btoa.clone());

        {
            let mut streams = self.shared.streams.lock();
            streams.push(atob);
            streams.push(btoa);
        }
        self
    }

    /// Register a convergence-and-content check over `query`, ordered
    /// after every task declared so far, and return the [`Expectation`]
    /// to populate with expected result sets.
    ///
    /// This is the terminal checkpoint of a workload; the task set it is
    /// ordered after is captured at call time.
    pub fn state(&mut self, query: &str) -> Expectation {
        self.check(query)
    }

    /// Same as [`state`](Topology::state), for checkpoints placed
    /// mid-workload.
    pub fn now(&mut self, query: &str) -> Expectation {
        self.check(query)
    }

    fn check(&mut self, query: &str) -> Expectation {
        let expectation = Expectation::new();

        let peers: Vec<PeerInfo> = self.peers.iter().map(|p| p.info()).collect();
        let config = self.config.clone();
        let checks = expectation.clone();
        let sql = query.to_string();
        let task = Task::new(format!("check expectations on {query}"), move |ctx| {
            let peers = peers.clone();
            let config = config.clone();
            let checks = checks.clone();
            let sql = sql.clone();
            async move {
                let queries = peers.iter().map(|info| {
                    let config = &config;
                    let ctx = &ctx;
                    let sql = &sql;
                    async move {
                        let rows = query_peer(config, info, ctx, sql).await?;
                        Ok::<_, anyhow::Error>((info.name.clone(), rows))
                    }
                });
                let results = try_join_all(queries).await?;
                checks.verify(&results, ctx.schedule())
            }
        });

        self.append_check(task);
        expectation
    }

    /// Register a quiescence check: once every task has run, no channel
    /// may still hold an undelivered payload.
    pub fn is_silent(&mut self) -> &mut Self {
        let streams: Vec<HalfStream> = self.shared.streams.lock().clone();
        let task = Task::new("check all channels are silent", move |ctx| {
            let streams = streams.clone();
            async move {
                for stream in &streams {
                    let pending = stream.pending(&ctx)?;
                    anyhow::ensure!(
                        pending == 0,
                        "channel {stream} still holds {pending} undelivered payloads"
                    );
                }
                Ok(())
            }
        });
        self.append_check(task);
        self
    }

    /// Order `task` after every task registered so far, then register it.
    fn append_check(&mut self, task: Arc<Task>) {
        let mut graph = self.shared.graph.lock();
        let existing: Vec<TaskId> = graph.tasks().iter().map(|t| t.id()).collect();
        let id = task.id();
        for before in existing {
            graph.happens_before(Some(before), id);
        }
        graph.add_task(task);
    }

    /// A snapshot of the happens-before graph built so far.
    pub fn graph(&self) -> TaskGraph {
        self.shared.graph.lock().clone()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Explore every schedule the strategy produces and verify the
    /// registered expectations under each of them.
    pub async fn run(self) -> anyhow::Result<RunReport> {
        let graph = self.graph();
        Executor::new(graph, self.strategy)
            .batch_size(self.config.batch_size)
            .run()
            .await
    }
}
