//! Database backups.
//!
//! Two kinds of copies are kept next to the live file:
//!
//! - **Snapshots** (`main.db.gz`, `main.db.gz.1`): gzip copies of the
//!   closed database file, taken at startup. A WAL left behind by an
//!   unclean shutdown is checkpointed into the file first. Streaming in
//!   fixed-size chunks keeps memory flat regardless of database size. At
//!   most two generations exist.
//! - **Online backup** (`main.db.backup`): a plain SQLite copy taken with
//!   the backup API while the bot runs, throttled by [`OnlineBackup`].

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rusqlite::{Connection, DatabaseName};
use tracing::{debug, error, info, warn};

use crate::config::append_extension;
use crate::error::{StoreError, StoreResult};

/// Read/write granularity for snapshot and restore.
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// `main.db.gz` -> `main.db.gz.1`.
pub fn previous_generation(snapshot: &Path) -> PathBuf {
    append_extension(snapshot, "1")
}

// ── snapshots ────────────────────────────────────────────────────────

/// `main.db` -> `main.db-wal`.
fn sidecar(db: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}-{suffix}", db.display()))
}

/// Fold a leftover write-ahead log into the database file.
///
/// Committed transactions can still live only in `-wal` after a crash, and
/// a snapshot of the bare file would miss them. No-op when there is no
/// WAL. Returns `true` when a checkpoint ran to completion.
pub fn checkpoint_wal(db: &Path) -> StoreResult<bool> {
    let wal = sidecar(db, "wal");
    if !wal.exists() {
        return Ok(false);
    }

    let conn = Connection::open(db)?;
    let (busy, frames): (i64, i64) =
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| Ok((row.get(0)?, row.get(1)?)))?;
    conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;

    if busy != 0 {
        return Err(StoreError::Io(std::io::Error::other(format!(
            "WAL of {} is in use, checkpoint incomplete",
            db.display()
        ))));
    }
    debug!(path = %db.display(), frames, "leftover WAL checkpointed");
    Ok(true)
}

/// Compress `source` into `dest`, keeping the old `dest` as `dest.1`.
///
/// Any WAL next to `source` is checkpointed first. The new snapshot is
/// written to a temporary sibling, so a failed run leaves both generations
/// untouched. Returns the compressed size.
pub fn snapshot(source: &Path, dest: &Path) -> StoreResult<u64> {
    let started = Instant::now();
    let tmp = append_extension(dest, "tmp");

    checkpoint_wal(source)?;

    let written = match write_gzip(source, &tmp) {
        Ok(n) => n,
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
    };

    if dest.exists() {
        fs::rename(dest, previous_generation(dest))?;
    }
    fs::rename(&tmp, dest)?;

    info!(
        source = %source.display(),
        dest = %dest.display(),
        bytes = written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "database snapshot taken"
    );
    Ok(written)
}

fn write_gzip(source: &Path, dest: &Path) -> StoreResult<u64> {
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, File::open(source)?);
    let out = BufWriter::new(File::create(dest)?);
    // Level 1: snapshots run on every start, speed matters more than size.
    let mut encoder = GzEncoder::new(out, Compression::fast());

    copy_chunked(&mut reader, &mut encoder)?;

    let mut out = encoder.finish()?;
    out.flush()?;
    let file = out
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Decompress the snapshot at `source` onto `dest`.
///
/// Decompresses into a temporary sibling and renames it into place, then
/// removes any WAL or shared-memory file belonging to the replaced
/// database. Returns the restored size.
pub fn restore(source: &Path, dest: &Path) -> StoreResult<u64> {
    let tmp = append_extension(dest, "restore");

    let result = (|| -> StoreResult<u64> {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(source)?));
        let mut out = BufWriter::with_capacity(CHUNK_SIZE, File::create(&tmp)?);
        let n = copy_chunked(&mut decoder, &mut out)?;
        out.flush()?;
        Ok(n)
    })();

    let restored = match result {
        Ok(n) => n,
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
    };

    fs::rename(&tmp, dest)?;
    for suffix in ["wal", "shm"] {
        let path = sidecar(dest, suffix);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "stale sidecar removed");
        }
    }

    info!(source = %source.display(), dest = %dest.display(), bytes = restored, "database restored");
    Ok(restored)
}

/// Restore `dest` from the newest usable snapshot: `snapshot`, then its
/// previous generation. Returns the snapshot used, or `None` if neither
/// exists or both fail.
pub fn restore_latest(snapshot: &Path, dest: &Path) -> Option<PathBuf> {
    for candidate in [snapshot.to_path_buf(), previous_generation(snapshot)] {
        if !candidate.exists() {
            continue;
        }
        match restore(&candidate, dest) {
            Ok(_) => return Some(candidate),
            Err(err) => error!(snapshot = %candidate.display(), %err, "restore failed, trying older snapshot"),
        }
    }
    warn!(snapshot = %snapshot.display(), "no usable snapshot found");
    None
}

fn copy_chunked<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> StoreResult<u64> {
    let mut buf = vec![0_u8; CHUNK_SIZE];
    let mut total = 0_u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

// ── online backup ────────────────────────────────────────────────────

/// Throttled online backups of the live connection.
#[derive(Debug)]
pub struct OnlineBackup {
    dest: PathBuf,
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl OnlineBackup {
    /// Back up to `dest` at most once per `interval`. The first call is
    /// always due.
    pub fn new(dest: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dest: dest.into(),
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Whether enough time has passed since the last successful backup.
    pub fn is_due(&self) -> bool {
        match self.last.lock() {
            Ok(last) => last.is_none_or(|t| t.elapsed() >= self.interval),
            Err(_) => false,
        }
    }

    /// Back up if due. Must be called with the database lock held.
    ///
    /// Returns `true` when a backup was written.
    pub fn run_if_due(&self, conn: &Connection) -> StoreResult<bool> {
        if !self.is_due() {
            return Ok(false);
        }
        self.run(conn)?;
        Ok(true)
    }

    /// Back up unconditionally and restart the interval.
    pub fn run(&self, conn: &Connection) -> StoreResult<()> {
        let started = Instant::now();
        if let Some(parent) = self.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = append_extension(&self.dest, "tmp");
        if let Err(err) = conn.backup(DatabaseName::Main, &tmp, None) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        fs::rename(&tmp, &self.dest)?;

        if let Ok(mut last) = self.last.lock() {
            *last = Some(Instant::now());
        }
        info!(
            dest = %self.dest.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "online backup written"
        );
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, content: &[u8]) {
        fs::write(path, content).unwrap();
    }

    #[test]
    fn snapshot_then_restore_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("main.db");
        let gz = dir.path().join("main.db.gz");

        let content: Vec<u8> = (0..300_000_u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
        write_file(&db, &content);

        let compressed = snapshot(&db, &gz).unwrap();
        assert!(compressed > 0);
        assert!(compressed < content.len() as u64);

        fs::remove_file(&db).unwrap();
        let restored = restore(&gz, &db).unwrap();
        assert_eq!(restored, content.len() as u64);
        assert_eq!(fs::read(&db).unwrap(), content);
        assert!(!append_extension(&db, "restore").exists());
    }

    #[test]
    fn rotation_keeps_two_generations() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("main.db");
        let gz = dir.path().join("main.db.gz");
        let restored = dir.path().join("check.db");

        for generation in [&b"first"[..], &b"second"[..], &b"third"[..]] {
            write_file(&db, generation);
            snapshot(&db, &gz).unwrap();
        }

        assert!(gz.exists());
        assert!(previous_generation(&gz).exists());
        assert!(!append_extension(&previous_generation(&gz), "1").exists());

        restore(&gz, &restored).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), fs::read(&db).unwrap());
        restore(&previous_generation(&gz), &restored).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), b"second");
    }

    #[test]
    fn failed_snapshot_keeps_existing_generations() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("main.db");
        let gz = dir.path().join("main.db.gz");
        write_file(&db, b"data");
        snapshot(&db, &gz).unwrap();

        let err = snapshot(&dir.path().join("missing.db"), &gz).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(gz.exists());
        assert!(!previous_generation(&gz).exists());
    }

    #[test]
    fn restore_latest_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("main.db");
        let gz = dir.path().join("main.db.gz");

        write_file(&db, b"older");
        snapshot(&db, &gz).unwrap();
        write_file(&db, b"newer");
        snapshot(&db, &gz).unwrap();

        // Corrupt the newest generation.
        write_file(&gz, b"not gzip at all");
        fs::remove_file(&db).unwrap();

        let used = restore_latest(&gz, &db).unwrap();
        assert_eq!(used, previous_generation(&gz));
        assert_eq!(fs::read(&db).unwrap(), b"older");
    }

    #[test]
    fn restore_latest_without_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("main.db");
        assert!(restore_latest(&dir.path().join("main.db.gz"), &db).is_none());
        assert!(!db.exists());
    }

    #[test]
    fn restore_removes_stale_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("main.db");
        let gz = dir.path().join("main.db.gz");
        write_file(&db, b"payload");
        snapshot(&db, &gz).unwrap();

        let wal = dir.path().join("main.db-wal");
        write_file(&wal, b"old wal frames");
        restore(&gz, &db).unwrap();
        assert!(!wal.exists());
    }

    #[test]
    fn snapshot_includes_uncheckpointed_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("main.db");
        let gz = dir.path().join("main.db.gz");
        let restored = dir.path().join("restored.db");

        // The writer stays open, so its commit is only in the WAL.
        let live = Connection::open(&db).unwrap();
        live.pragma_update(None, "journal_mode", "WAL").unwrap();
        live.execute_batch("CREATE TABLE t (x TEXT); INSERT INTO t VALUES ('kept');")
            .unwrap();
        assert!(sidecar(&db, "wal").exists());

        snapshot(&db, &gz).unwrap();
        restore(&gz, &restored).unwrap();

        let copy = Connection::open(&restored).unwrap();
        let x: String = copy.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(x, "kept");
        drop(live);
    }

    #[test]
    fn checkpoint_without_wal_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("main.db");
        write_file(&db, b"not even sqlite");
        assert!(!checkpoint_wal(&db).unwrap());
    }

    #[test]
    fn online_backup_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("main.db.backup");
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();

        let backup = OnlineBackup::new(&dest, Duration::from_secs(3600));
        assert!(backup.is_due());
        assert!(backup.run_if_due(&conn).unwrap());
        assert!(!backup.run_if_due(&conn).unwrap());

        let copy = Connection::open(&dest).unwrap();
        let x: i64 = copy.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(x, 7);
    }

    #[test]
    fn zero_interval_is_always_due() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        let backup = OnlineBackup::new(dir.path().join("b.db"), Duration::ZERO);
        assert!(backup.run_if_due(&conn).unwrap());
        assert!(backup.run_if_due(&conn).unwrap());
    }
}
