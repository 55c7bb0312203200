//! Invocations of the database binary.
//!
//! One async function per command shape from the binary's interface. All
//! of them report a non-zero exit as an error naming the operation.

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use crate::Config;

fn data_command(config: &Config, db: &Path) -> Command {
    let mut command = Command::new(&config.db_binary);
    command.arg("--data").arg(db);
    command
}

/// Create a fresh database file.
pub(crate) async fn init(config: &Config, db: &Path) -> anyhow::Result<()> {
    let status = Command::new(&config.db_binary)
        .arg("--init")
        .arg(db)
        .status()
        .await
        .with_context(|| format!("failed to spawn {}", config.db_binary.display()))?;
    anyhow::ensure!(status.success(), "init exited non-zero ({status})");
    Ok(())
}

/// Pipe the contents of a SQL file into the database.
pub(crate) async fn apply_sql_file(config: &Config, db: &Path, sql: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(sql)
        .with_context(|| format!("failed to open {}", sql.display()))?;
    let status = data_command(config, db)
        .stdin(Stdio::from(file))
        .status()
        .await?;
    anyhow::ensure!(
        status.success(),
        "applying {} exited non-zero ({status})",
        sql.display()
    );
    Ok(())
}

/// Run SQL with no interesting output (DDL and DML).
pub(crate) async fn run_sql(config: &Config, db: &Path, sql: &str) -> anyhow::Result<()> {
    let mut child = data_command(config, db)
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {}", config.db_binary.display()))?;
    write_stdin(&mut child, sql.as_bytes()).await?;
    let status = child.wait().await?;
    anyhow::ensure!(status.success(), "running {sql:?} exited non-zero ({status})");
    Ok(())
}

/// Run a read query and parse its newline-delimited JSON output, one
/// object per row.
pub(crate) async fn query_json(
    config: &Config,
    db: &Path,
    sql: &str,
) -> anyhow::Result<Vec<serde_json::Value>> {
    let mut child = data_command(config, db)
        .arg("--format=json")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {}", config.db_binary.display()))?;
    write_stdin(&mut child, sql.as_bytes()).await?;
    let output = child.wait_with_output().await?;
    anyhow::ensure!(
        output.status.success(),
        "running {sql:?} exited non-zero ({})",
        output.status
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).with_context(|| format!("unparseable result row {line:?}"))
        })
        .collect()
}

/// Subscribe the given table for replication, returning the session
/// handle printed by the binary.
pub(crate) async fn subscribe(
    config: &Config,
    db: &Path,
    table: &str,
    replication_id: &str,
) -> anyhow::Result<String> {
    let output = data_command(config, db)
        .arg("subscribe")
        .arg(table)
        .arg("--connect")
        // The binary also takes --user; identity is not modelled here yet.
        .arg("--ignore-source")
        .arg(replication_id)
        .stdout(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn {}", config.db_binary.display()))?;
    anyhow::ensure!(
        output.status.success(),
        "subscribe for {table} exited non-zero ({})",
        output.status
    );
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Pull one replication payload from the tail of a subscribed session.
pub(crate) async fn tail(
    config: &Config,
    db: &Path,
    session: &str,
    since: u64,
) -> anyhow::Result<Vec<u8>> {
    let output = data_command(config, db)
        .arg("tail")
        .arg("--format=csv")
        .arg(session)
        .arg("--since")
        .arg(since.to_string())
        .stdout(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn {}", config.db_binary.display()))?;
    anyhow::ensure!(
        output.status.success(),
        "tail of session {session} exited non-zero ({})",
        output.status
    );
    Ok(output.stdout)
}

/// A long-lived `write-csv` subprocess accepting replication payloads on
/// stdin.
pub(crate) struct CsvWriter {
    child: Child,
    stdin: ChildStdin,
}

impl CsvWriter {
    pub(crate) async fn write(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        self.stdin.write_all(payload).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Terminate the subprocess and reap it.
    pub(crate) async fn terminate(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Start a streaming writer bound to the target table.
pub(crate) async fn spawn_csv_writer(
    config: &Config,
    db: &Path,
    table: &str,
    replication_id: &str,
) -> anyhow::Result<CsvWriter> {
    let mut child = data_command(config, db)
        .arg("write-csv")
        .arg(table)
        .arg("--source")
        .arg(replication_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {}", config.db_binary.display()))?;
    let stdin = child.stdin.take().context("write-csv stdin unavailable")?;
    tracing::debug!("started write-csv for {table} against {}", db.display());
    Ok(CsvWriter { child, stdin })
}

/// The new `since` value after a tail: the maximum of the current value,
/// every `:N` checkpoint marker in the payload, and 0.
pub(crate) fn last_checkpoint(current: u64, payload: &str) -> anyhow::Result<u64> {
    let mut checkpoint = current;
    for line in payload.lines() {
        if let Some(marker) = line.strip_prefix(':') {
            let value: u64 = marker
                .trim_end()
                .parse()
                .with_context(|| format!("malformed checkpoint marker {line:?}"))?;
            checkpoint = checkpoint.max(value);
        }
    }
    Ok(checkpoint)
}

async fn write_stdin(child: &mut Child, bytes: &[u8]) -> anyhow::Result<()> {
    let mut stdin = child.stdin.take().context("child stdin unavailable")?;
    stdin.write_all(bytes).await?;
    stdin.flush().await?;
    // Dropping stdin closes the pipe so the child sees EOF.
    Ok(())
}
