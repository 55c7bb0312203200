use std::env;
use std::path::PathBuf;

/// Where to find the database binary under test and where to keep
/// per-schedule state.
pub struct Config {
    /// The database binary. Every peer operation shells out to it with the
    /// database file selected via `--data`.
    pub db_binary: PathBuf,

    /// Bootstrap SQL applied right after `--init`, before the user schema.
    ///
    /// Not every build of the binary ships one, so this is optional.
    pub bootstrap_sql: Option<PathBuf>,

    /// Directory that receives one freshly named database file per peer
    /// per schedule. Files are removed by the peer finalisers.
    pub data_dir: PathBuf,

    /// How many schedules execute concurrently. Each schedule spawns its
    /// own subprocesses, so this bounds process fan-out.
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_binary: PathBuf::from("skdb"),
            bootstrap_sql: None,
            data_dir: env::temp_dir(),
            batch_size: 16,
        }
    }
}

impl Config {
    /// Build a configuration from the environment:
    /// `CONVERGE_DB_BINARY`, `CONVERGE_BOOTSTRAP_SQL`, `CONVERGE_DATA_DIR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(binary) = env::var_os("CONVERGE_DB_BINARY") {
            config.db_binary = PathBuf::from(binary);
        }
        if let Some(bootstrap) = env::var_os("CONVERGE_BOOTSTRAP_SQL") {
            config.bootstrap_sql = Some(PathBuf::from(bootstrap));
        }
        if let Some(dir) = env::var_os("CONVERGE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }
}
