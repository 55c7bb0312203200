//! Structural tests over the happens-before graph a topology builds.
//!
//! Nothing here runs a schedule, so no database binary is needed: the
//! tests enumerate schedules and assert ordering properties of the DAG
//! itself.

use converge_cluster::{row, Config, Topology};
use converge_schedule::{AllTopoSorts, EnumerationStrategy, Schedule, TaskGraph, TaskId};

const TABLE: &str = "test_without_pk";

fn cluster() -> Topology {
    let mut cluster = Topology::new(AllTopoSorts::new(), Config::default());
    cluster.schema("CREATE TABLE test_without_pk (id INTEGER, note STRING);");
    cluster
}

fn schedules(graph: &TaskGraph) -> Vec<Schedule> {
    AllTopoSorts::new()
        .run_all(true)
        .schedules(graph)
        .collect::<anyhow::Result<Vec<_>>>()
        .unwrap()
}

/// The single registered task whose description satisfies `pred`.
fn find_task(graph: &TaskGraph, pred: impl Fn(&str) -> bool) -> TaskId {
    let matches: Vec<TaskId> = graph
        .tasks()
        .iter()
        .filter(|t| pred(&t.describe()))
        .map(|t| t.id())
        .collect();
    assert_eq!(matches.len(), 1, "expected exactly one matching task");
    matches[0]
}

#[test]
fn per_peer_operations_stay_ordered() {
    let mut cluster = cluster();
    let server = cluster.add_server("s1");
    let client1 = cluster.add_client("c1");
    cluster.mirror(TABLE, &client1, &server);

    let first = client1.insert_into(TABLE, row![0, "foo"]);
    let second = client1.insert_into(TABLE, row![1, "bar"]);

    for schedule in schedules(&cluster.graph()) {
        let first_pos = schedule.position(first).unwrap();
        let second_pos = schedule.position(second).unwrap();
        assert!(first_pos < second_pos, "bad order in {schedule}");
    }
}

#[test]
fn init_runs_first_in_every_schedule() {
    let mut cluster = cluster();
    let server = cluster.add_server("s1");
    let client1 = cluster.add_client("c1");
    cluster.mirror(TABLE, &client1, &server);
    client1.insert_into(TABLE, row![0, "foo"]);

    for schedule in schedules(&cluster.graph()) {
        let head = schedule.tasks()[0].describe();
        assert!(head.contains("create server s1"), "got: {head}");
        assert!(head.contains("create client c1"), "got: {head}");
    }
}

#[test]
fn checks_are_ordered_after_everything_registered_before_them() {
    let mut cluster = cluster();
    let server = cluster.add_server("s1");
    let client1 = cluster.add_client("c1");
    cluster.mirror(TABLE, &client1, &server);
    client1.insert_into(TABLE, row![0, "foo"]);
    cluster.is_silent();
    cluster.state("SELECT id, note FROM test_without_pk;");

    let graph = cluster.graph();
    let silent = find_task(&graph, |d| d == "check all channels are silent");
    let check = find_task(&graph, |d| d.starts_with("check expectations"));

    for schedule in schedules(&graph) {
        let len = schedule.len();
        assert_eq!(schedule.position(silent), Some(len - 2));
        assert_eq!(schedule.position(check), Some(len - 1));
    }
}

#[test]
fn insert_fans_out_one_step_per_outgoing_mirror() {
    let mut cluster = cluster();
    let server = cluster.add_server("s1");
    let client1 = cluster.add_client("c1");
    cluster.mirror(TABLE, &client1, &server);

    client1.insert_into(TABLE, row![0, "foo"]);
    server.insert_into(TABLE, row![1, "bar"]);

    let graph = cluster.graph();
    let steps: Vec<String> = graph
        .tasks()
        .iter()
        .map(|t| t.describe())
        .filter(|d| d.starts_with("read"))
        .collect();
    assert_eq!(steps.len(), 2, "one hop per direction: {steps:?}");
    assert!(steps.iter().any(|d| d.contains("<c1 -> s1>")));
    assert!(steps.iter().any(|d| d.contains("<s1 -> c1>")));
}

#[test]
fn insert_propagates_through_intermediate_peers() {
    // c1 and c2 are only connected through s1; a write on c1 must still
    // reach c2, one hop after the payload lands on s1.
    let mut cluster = cluster();
    let server = cluster.add_server("s1");
    let client1 = cluster.add_client("c1");
    let client2 = cluster.add_client("c2");
    cluster.mirror(TABLE, &client1, &server);
    cluster.mirror(TABLE, &client2, &server);

    let insert = client1.insert_into(TABLE, row![0, "foo"]);

    let graph = cluster.graph();
    let hop1 = find_task(&graph, |d| d.starts_with("read") && d.contains("<c1 -> s1>"));
    let hop2 = find_task(&graph, |d| d.starts_with("read") && d.contains("<s1 -> c2>"));

    for schedule in schedules(&graph) {
        let insert_pos = schedule.position(insert).unwrap();
        let hop1_pos = schedule.position(hop1).unwrap();
        let hop2_pos = schedule.position(hop2).unwrap();
        assert!(insert_pos < hop1_pos, "bad order in {schedule}");
        assert!(hop1_pos < hop2_pos, "bad order in {schedule}");
    }
}

#[test]
fn fan_out_visits_each_peer_once_in_a_mesh() {
    let mut cluster = cluster();
    let server = cluster.add_server("s1");
    let client1 = cluster.add_client("c1");
    let client2 = cluster.add_client("c2");
    cluster.mirror(TABLE, &client1, &server);
    cluster.mirror(TABLE, &client2, &server);
    cluster.mirror(TABLE, &client1, &client2);

    client1.insert_into(TABLE, row![0, "foo"]);

    // Both of c1's direct streams step; no second hop re-delivers to an
    // already-reached peer.
    let graph = cluster.graph();
    let steps: Vec<String> = graph
        .tasks()
        .iter()
        .map(|t| t.describe())
        .filter(|d| d.starts_with("read"))
        .collect();
    assert_eq!(steps.len(), 2, "got: {steps:?}");
    assert!(steps.iter().any(|d| d.contains("<c1 -> s1>")));
    assert!(steps.iter().any(|d| d.contains("<c1 -> c2>")));
}

#[test]
fn replication_step_sends_before_it_receives() {
    let mut cluster = cluster();
    let server = cluster.add_server("s1");
    let client1 = cluster.add_client("c1");
    cluster.mirror(TABLE, &client1, &server);
    client1.insert_into(TABLE, row![0, "foo"]);

    let graph = cluster.graph();
    let step = graph
        .tasks()
        .iter()
        .map(|t| t.describe())
        .find(|d| d.starts_with("read") && d.contains("<c1 -> s1>"))
        .unwrap();

    // The step is one node; within it the tail half runs strictly before
    // the write half.
    let (send, recv) = step.split_once(" then ").unwrap();
    assert!(send.contains("tail from c1"), "got: {send}");
    assert!(recv.contains("write to s1"), "got: {recv}");
}

#[test]
fn two_independent_insert_chains_interleave_exhaustively() {
    let mut cluster = cluster();
    let server = cluster.add_server("s1");
    let client1 = cluster.add_client("c1");
    cluster.mirror(TABLE, &client1, &server);

    client1.insert_into(TABLE, row![0, "foo"]);
    server.insert_into(TABLE, row![1, "bar"]);
    cluster.is_silent();
    cluster.state("SELECT id, note FROM test_without_pk;");

    // Two chains of two tasks each (insert then step) after the shared
    // init, followed by the two fixed checks: C(4, 2) = 6 interleavings.
    assert_eq!(schedules(&cluster.graph()).len(), 6);
}
