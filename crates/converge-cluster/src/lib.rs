//! Replicated-database topology DSL and convergence checking.
//!
//! A [`Topology`] describes a cluster of database peers with mirrored
//! tables. Declaring peers, mirrors, and workload operations accumulates
//! tasks and happens-before edges in a `converge-schedule` graph; calling
//! [`Topology::run`] then executes every legal interleaving of the
//! replication steps and verifies that all peers converge to the expected
//! state under each one.

use std::sync::atomic::{AtomicU64, Ordering};

mod channel;
mod config;
mod db;
mod expect;
mod peer;
mod topology;

pub use self::channel::HalfStream;
pub use self::config::Config;
pub use self::expect::{Expectation, MatchBuilder};
pub use self::peer::{Peer, PeerRole, SqlValue};
pub use self::topology::Topology;

/// Identity for peers and streams. Schedule-local state is keyed by these
/// ids, so two entities never collide even when their contents are equal.
pub(crate) fn next_entity_id() -> u64 {
    static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed)
}

/// A row of SQL literals: `row![0, "foo"]`.
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::SqlValue::from($value)),*]
    };
}

/// A list of rows: `rows![[0, "foo"], [1, "bar"]]`.
#[macro_export]
macro_rules! rows {
    ($([$($value:expr),* $(,)?]),* $(,)?) => {
        vec![$($crate::row![$($value),*]),*]
    };
}
