use std::env;
use std::path::{Path, PathBuf};

/// Resolves the root of all persisted state (`APP_HOME`, §6).
///
/// Defaults to `~/.gator`. Everything the rest of the system writes to
/// disk -- the sqlite file, per-process logs, worktrees -- is rooted here.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Root directory under which `db.sqlite` and `logs/` live.
    pub app_home: PathBuf,
}

impl DbConfig {
    pub const DEFAULT_DIR_NAME: &str = ".gator";

    /// Build a config from the environment.
    ///
    /// Priority: `APP_HOME` env var, then `~/.gator`, falling back to
    /// `./.gator` if the home directory cannot be resolved.
    pub fn from_env() -> Self {
        let app_home = env::var_os("APP_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(Self::DEFAULT_DIR_NAME)))
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_DIR_NAME));
        Self { app_home }
    }

    /// Build a config rooted at an explicit directory (tests, CLI flags).
    pub fn new(app_home: impl Into<PathBuf>) -> Self {
        Self {
            app_home: app_home.into(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.app_home.join("db.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.app_home.join("logs").join("missions")
    }

    pub fn mission_log_dir(&self, mission_id: &str) -> PathBuf {
        self.logs_dir().join(mission_id)
    }

    pub fn process_log_path(&self, mission_id: &str, process_id: &str) -> PathBuf {
        self.mission_log_dir(mission_id)
            .join(format!("{process_id}.log"))
    }

    /// `sqlite://<path>?mode=rwc`, creating the file on first connect.
    pub fn connect_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path().display())
    }

    pub fn migrations_path() -> &'static Path {
        Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
