use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use converge_schedule::{CompositeTask, ScheduleContext, StateKey, Task, TaskRef};

use crate::db::{self, CsvWriter};
use crate::peer::{db_key, PeerInfo};
use crate::{next_entity_id, Config};

/// A single-direction replication conduit between two peers for one
/// mirrored table.
///
/// The stream's payload buffer lives in the schedule context, keyed by the
/// stream's identity, so concurrent schedules never share a buffer. The
/// replication id identifies this hop to the database binary, which uses
/// it to filter out payloads it originated.
#[derive(Clone)]
pub struct HalfStream(Arc<StreamCore>);

struct StreamCore {
    id: u64,
    table: String,
    replication_id: String,
    sender: PeerInfo,
    receiver: PeerInfo,
    config: Arc<Config>,
}

impl HalfStream {
    pub(crate) fn new(
        table: &str,
        sender: PeerInfo,
        receiver: PeerInfo,
        replication_id: String,
        config: Arc<Config>,
    ) -> Self {
        Self(Arc::new(StreamCore {
            id: next_entity_id(),
            table: table.to_string(),
            replication_id,
            sender,
            receiver,
            config,
        }))
    }

    pub(crate) fn receiver_id(&self) -> u64 {
        self.0.receiver.id
    }

    fn buffer_key(&self) -> StateKey {
        StateKey::scoped(self.0.id, "buffer")
    }

    fn subscription_key(&self) -> StateKey {
        StateKey::paired(self.0.sender.id, self.0.id, "subscription")
    }

    fn since_key(&self) -> StateKey {
        StateKey::paired(self.0.sender.id, self.0.id, "since")
    }

    fn writer_key(&self) -> StateKey {
        StateKey::paired(self.0.receiver.id, self.0.id, "writer")
    }

    fn send(&self, ctx: &ScheduleContext, payload: Vec<u8>) -> anyhow::Result<()> {
        self.0
            .with_buffer(ctx, self.buffer_key(), |buffer| buffer.push_back(payload))
    }

    fn recv(&self, ctx: &ScheduleContext) -> anyhow::Result<Vec<u8>> {
        self.0
            .with_buffer(ctx, self.buffer_key(), |buffer| buffer.pop_back())?
            .with_context(|| format!("channel {self} buffer is empty"))
    }

    /// Number of undelivered payloads, for quiescence checks.
    pub(crate) fn pending(&self, ctx: &ScheduleContext) -> anyhow::Result<usize> {
        self.0
            .with_buffer(ctx, self.buffer_key(), |buffer| buffer.len())
    }

    /// The sender-side task factory: with `init` the returned task
    /// subscribes the mirrored table under this stream's replication id;
    /// otherwise it pulls one payload from the database tail, appends it
    /// to the buffer, and advances the `since` checkpoint.
    pub(crate) fn send_task(&self, init: bool) -> TaskRef {
        let stream = self.clone();
        if init {
            return Task::new(
                format!(
                    "create subscription for {} {} {}",
                    self.0.sender.name, self.0.table, self
                ),
                move |ctx| {
                    let stream = stream.clone();
                    async move {
                        let core = &*stream.0;
                        let path: PathBuf = ctx
                            .get(db_key(core.sender.id))
                            .with_context(|| format!("no database for {}", core.sender.name))?;
                        let session =
                            db::subscribe(&core.config, &path, &core.table, &core.replication_id)
                                .await?;
                        ctx.store(stream.subscription_key(), session);
                        Ok(())
                    }
                },
            );
        }

        Task::new(
            format!(
                "read {} tail from {} and send to {}",
                self.0.table, self.0.sender.name, self
            ),
            move |ctx| {
                let stream = stream.clone();
                async move {
                    let core = &*stream.0;
                    let path: PathBuf = ctx
                        .get(db_key(core.sender.id))
                        .with_context(|| format!("no database for {}", core.sender.name))?;
                    let session: String = ctx
                        .get(stream.subscription_key())
                        .with_context(|| format!("no subscription for {stream}"))?;
                    let since: u64 = ctx.get(stream.since_key()).unwrap_or(0);

                    let payload = db::tail(&core.config, &path, &session, since).await?;
                    let checkpoint =
                        db::last_checkpoint(since, &String::from_utf8_lossy(&payload))?;
                    stream.send(&ctx, payload)?;
                    ctx.store(stream.since_key(), checkpoint);
                    Ok(())
                }
            },
        )
    }

    /// The receiver-side task factory: with `init` the returned task
    /// starts the streaming writer subprocess (its finaliser terminates
    /// it); otherwise it pops one payload from the buffer and writes it to
    /// the subprocess.
    pub(crate) fn recv_task(&self, init: bool) -> TaskRef {
        let stream = self.clone();
        if init {
            let finalise_stream = self.clone();
            return Task::with_finaliser(
                format!(
                    "start write-csv for {} {} {}",
                    self.0.receiver.name, self.0.table, self
                ),
                move |ctx| {
                    let stream = stream.clone();
                    async move {
                        let core = &*stream.0;
                        let path: PathBuf = ctx
                            .get(db_key(core.receiver.id))
                            .with_context(|| format!("no database for {}", core.receiver.name))?;
                        let writer = db::spawn_csv_writer(
                            &core.config,
                            &path,
                            &core.table,
                            &core.replication_id,
                        )
                        .await?;
                        ctx.store(stream.writer_key(), writer);
                        Ok(())
                    }
                },
                move |ctx| {
                    let stream = finalise_stream.clone();
                    async move {
                        if let Some(writer) = ctx.take::<CsvWriter>(stream.writer_key()) {
                            writer.terminate().await;
                        }
                        Ok(())
                    }
                },
            );
        }

        Task::new(
            format!(
                "read from {} and write to {} {}",
                self, self.0.receiver.name, self.0.table
            ),
            move |ctx| {
                let stream = stream.clone();
                async move {
                    let payload = stream.recv(&ctx)?;
                    let mut writer: CsvWriter = ctx
                        .take(stream.writer_key())
                        .with_context(|| format!("no streaming writer for {stream}"))?;
                    let result = writer.write(&payload).await;
                    ctx.store(stream.writer_key(), writer);
                    result
                }
            },
        )
    }

    /// Everything needed before the stream can carry payloads, as one
    /// graph node: subscribe the sender, start the receiver's writer,
    /// create the buffer.
    pub(crate) fn init_composite(&self) -> TaskRef {
        let composite = CompositeTask::new();
        composite.add(self.send_task(true));
        composite.add(self.recv_task(true));

        let stream = self.clone();
        composite.add(Task::new(
            format!("create {self} channel buffer"),
            move |ctx| {
                let key = stream.buffer_key();
                async move {
                    ctx.store(key, VecDeque::<Vec<u8>>::new());
                    Ok(())
                }
            },
        ));
        composite
    }

    /// One replication hop as one graph node. The tail and write halves
    /// were once separate tasks with a happens-before edge, but that blows
    /// up the number of schedules without adding coverage.
    pub(crate) fn step_composite(&self) -> TaskRef {
        let composite = CompositeTask::new();
        composite.add(self.send_task(false));
        composite.add(self.recv_task(false));
        composite
    }
}

impl StreamCore {
    fn with_buffer<R>(
        &self,
        ctx: &ScheduleContext,
        key: StateKey,
        f: impl FnOnce(&mut VecDeque<Vec<u8>>) -> R,
    ) -> anyhow::Result<R> {
        ctx.with_mut(key, f)
            .with_context(|| format!("no channel buffer for <{} -> {}>", self.sender.name, self.receiver.name))
    }
}

impl fmt::Display for HalfStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} -> {}>", self.0.sender.name, self.0.receiver.name)
    }
}
