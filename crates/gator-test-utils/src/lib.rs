//! Shared test utilities for gator integration tests.
//!
//! Every test gets its own on-disk sqlite database inside a fresh
//! [`tempfile::TempDir`] -- no shared server, no testcontainers overhead,
//! since sqlite needs nothing external to run.

use std::path::PathBuf;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

use gator_db::config::DbConfig;
use gator_db::pool;

/// An ephemeral `APP_HOME` plus its sqlite pool, migrated and ready to use.
///
/// Keeps the [`TempDir`] alive for as long as the struct is alive; the
/// directory (and its `db.sqlite`, `logs/`, etc.) is removed on drop.
pub struct TestDb {
    pub pool: SqlitePool,
    pub app_home: PathBuf,
    _dir: TempDir,
}

impl TestDb {
    pub fn config(&self) -> DbConfig {
        DbConfig::new(&self.app_home)
    }
}

/// Create a fresh, migrated sqlite database under a new temp directory.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir");
    let app_home = dir.path().to_path_buf();
    let db_path = app_home.join("db.sqlite");

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let test_pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap_or_else(|e| panic!("failed to open sqlite db at {}: {e}", db_path.display()));

    pool::run_migrations(&test_pool, DbConfig::migrations_path())
        .await
        .expect("migrations should succeed");

    TestDb {
        pool: test_pool,
        app_home,
        _dir: dir,
    }
}

/// Write an executable shell script to `dir` that behaves as described by
/// `body`, returning its path. Used in place of a real agent CLI in process
/// supervision tests, matching the fixture-script idiom used for harness
/// tests elsewhere in this codebase.
#[cfg(unix)]
pub fn write_fake_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write fake script");
    let mut perms = fs::metadata(&path)
        .expect("failed to stat fake script")
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("failed to chmod fake script");
    path
}
