use std::sync::Arc;

use converge_schedule::Schedule;
use parking_lot::Mutex;
use serde_json::Value;

use crate::SqlValue;

type SchedulePred = Box<dyn Fn(&Schedule) -> bool + Send + Sync>;

/// Expected result sets for one checkpoint.
///
/// Returned by the topology's `now`/`state` calls and populated
/// afterwards; the registered check task reads whatever checks have been
/// added by the time it runs.
///
/// Verification is two-phase: first every peer's result set must equal
/// the first peer's (convergence), then each configured check runs
/// against the first peer's — now canonical — result set.
#[derive(Clone)]
pub struct Expectation(Arc<ExpectCore>);

struct ExpectCore {
    checks: Mutex<Vec<Check>>,
}

enum Check {
    Equals {
        expected: Vec<Value>,
    },
    IsOneOf {
        candidates: Vec<Vec<Value>>,
    },
    Match(Arc<MatchCore>),
}

struct MatchCore {
    colnames: Vec<String>,
    clauses: Mutex<Vec<Clause>>,
}

struct Clause {
    pred: SchedulePred,
    expected: Vec<Value>,
}

impl Expectation {
    pub(crate) fn new() -> Self {
        Self(Arc::new(ExpectCore {
            checks: Mutex::new(Vec::new()),
        }))
    }

    /// The result set must equal `rows` exactly and in order.
    pub fn equals(&self, rows: Vec<Vec<SqlValue>>, colnames: &[&str]) -> &Self {
        self.0.checks.lock().push(Check::Equals {
            expected: expected_rows(colnames, &rows),
        });
        self
    }

    /// The result set must equal one of `candidates` (or be empty, when
    /// allowed).
    pub fn is_one_of(
        &self,
        candidates: Vec<Vec<Vec<SqlValue>>>,
        colnames: &[&str],
        allow_empty: bool,
    ) -> &Self {
        let mut candidates: Vec<Vec<Value>> = candidates
            .iter()
            .map(|rows| expected_rows(colnames, rows))
            .collect();
        if allow_empty {
            candidates.push(Vec::new());
        }
        self.0.checks.lock().push(Check::IsOneOf { candidates });
        self
    }

    /// Schedule-dependent expected output: the first clause whose
    /// predicate matches the current schedule dictates the expected rows.
    pub fn match_on(&self, colnames: &[&str]) -> MatchBuilder {
        let core = Arc::new(MatchCore {
            colnames: colnames.iter().map(|c| c.to_string()).collect(),
            clauses: Mutex::new(Vec::new()),
        });
        self.0.checks.lock().push(Check::Match(core.clone()));
        MatchBuilder { core }
    }

    pub(crate) fn verify(
        &self,
        results: &[(String, Vec<Value>)],
        schedule: &Schedule,
    ) -> anyhow::Result<()> {
        let Some((first, rest)) = results.split_first() else {
            anyhow::bail!("no peers to check");
        };
        let (first_peer, first_set) = first;

        for (peer, set) in rest {
            anyhow::ensure!(
                set == first_set,
                "{first_peer}: {} != {} from {peer}",
                render(first_set),
                render(set)
            );
        }

        for check in self.0.checks.lock().iter() {
            if let Err(err) = check.verify(first_set, schedule) {
                anyhow::bail!("{first_peer}: {err:#}");
            }
        }
        Ok(())
    }
}

impl Check {
    fn verify(&self, result: &[Value], schedule: &Schedule) -> anyhow::Result<()> {
        match self {
            Check::Equals { expected } => {
                anyhow::ensure!(
                    result == expected.as_slice(),
                    "{} did not match expected: {}",
                    render(result),
                    render(expected)
                );
            }
            Check::IsOneOf { candidates } => {
                if !candidates.iter().any(|c| result == c.as_slice()) {
                    let rendered = candidates
                        .iter()
                        .map(|c| render(c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    anyhow::bail!("{} did not match any of: {rendered}", render(result));
                }
            }
            Check::Match(core) => {
                for clause in core.clauses.lock().iter() {
                    if (clause.pred)(schedule) {
                        anyhow::ensure!(
                            result == clause.expected.as_slice(),
                            "{} did not match expected: {}",
                            render(result),
                            render(&clause.expected)
                        );
                        return Ok(());
                    }
                }
                anyhow::bail!("no clauses matched schedule");
            }
        }
        Ok(())
    }
}

/// Builder for schedule-dependent expected outputs.
pub struct MatchBuilder {
    core: Arc<MatchCore>,
}

impl MatchBuilder {
    pub fn clause(
        self,
        pred: impl Fn(&Schedule) -> bool + Send + Sync + 'static,
        rows: Vec<Vec<SqlValue>>,
    ) -> Self {
        let colnames: Vec<&str> = self.core.colnames.iter().map(String::as_str).collect();
        let expected = expected_rows(&colnames, &rows);
        self.core.clauses.lock().push(Clause {
            pred: Box::new(pred),
            expected,
        });
        self
    }

    /// Catch-all clause used when no earlier predicate matched.
    pub fn otherwise(self, rows: Vec<Vec<SqlValue>>) -> Self {
        self.clause(|_| true, rows)
    }
}

/// Expected rows as JSON objects, zipping column names with values the
/// same way the binary's `--format=json` output names its columns.
fn expected_rows(colnames: &[&str], rows: &[Vec<SqlValue>]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for (name, value) in colnames.iter().zip(row) {
                object.insert((*name).to_string(), value.to_json());
            }
            Value::Object(object)
        })
        .collect()
}

fn render(set: &[Value]) -> String {
    Value::Array(set.to_vec()).to_string()
}
