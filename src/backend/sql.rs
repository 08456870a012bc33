//! The embedded-SQL backend, gated behind the `sql-backend` feature.
//!
//! The teacher has no analogue for this: its own cache is the in-memory,
//! whole-blob kind that [`super::snapshot`] models. `rusqlite` (bundling
//! its own SQLite, so no system library dependency) is pulled in from
//! outside the teacher's own dependency set specifically to give large
//! databases a backend that doesn't require deserializing the entire
//! history on every run, per `spec.md` §4.B's requirement for a second,
//! pluggable storage engine.
//!
//! Each logical table from `spec.md` §4.B gets one SQL table. Call results
//! and bound-argument representations are stored as JSON text (via
//! `serde_json`), for the same reason [`super::snapshot`] uses
//! `serde_json::Value`: it lets `--config-dump`/`--config-query` walk the
//! database without knowing the concrete type of anything stored in it.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use super::{Backend, CallId, CallRecord, ExternalFiles};
use crate::digest::{digest_of_file_public as digest_of_file, Digest, Observation, MTIME_TRUST_WINDOW_SECS};
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS functions (
    name   TEXT PRIMARY KEY,
    digest BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS calls (
    id           INTEGER PRIMARY KEY,
    name         TEXT NOT NULL,
    bound_digest BLOB NOT NULL,
    bound_repr   TEXT NOT NULL,
    result       TEXT NOT NULL,
    UNIQUE(name, bound_digest)
);

CREATE TABLE IF NOT EXISTS call_files (
    call_id INTEGER NOT NULL,
    role    TEXT NOT NULL,
    path    TEXT NOT NULL,
    digest  BLOB NOT NULL,
    PRIMARY KEY (call_id, role, path)
);

CREATE TABLE IF NOT EXISTS external_files (
    call_id INTEGER NOT NULL,
    kind    TEXT NOT NULL CHECK (kind IN ('src', 'dst')),
    path    TEXT NOT NULL,
    PRIMARY KEY (call_id, kind, path)
);

CREATE TABLE IF NOT EXISTS file_digests (
    path        TEXT PRIMARY KEY,
    mtime_secs  INTEGER NOT NULL,
    mtime_nanos INTEGER NOT NULL,
    digest      BLOB NOT NULL
);
"#;

fn digest_to_blob(d: Digest) -> Vec<u8> {
    d.as_bytes().to_vec()
}

fn blob_to_digest(b: Vec<u8>) -> Result<Digest> {
    let arr: [u8; 32] = b
        .try_into()
        .map_err(|_| Error::database("corrupt digest column"))?;
    Ok(Digest::from_bytes(arr))
}

fn system_time_to_parts(t: SystemTime) -> (i64, i64) {
    let dur = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    (dur.as_secs() as i64, dur.subsec_nanos() as i64)
}

fn parts_to_system_time(secs: i64, nanos: i64) -> SystemTime {
    UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
}

/// A SQLite-backed storage engine. `connect` opens (and migrates) the
/// database file in place; there is no separate in-memory staging area,
/// so every `save_*` call is durable as soon as SQLite's own journal
/// fsyncs it.
pub struct SqlBackend {
    conn: Option<Connection>,
}

impl Default for SqlBackend {
    fn default() -> Self {
        SqlBackend { conn: None }
    }
}

impl SqlBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or_else(|| Error::database("backend not connected"))
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or_else(|| Error::database("backend not connected"))
    }
}

impl Backend for SqlBackend {
    fn connect(&mut self, path: &Path) -> Result<()> {
        let conn = Connection::open(path).map_err(Error::Sqlite)?;
        conn.execute_batch(SCHEMA).map_err(Error::Sqlite)?;
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self, _path: &Path) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);").ok();
        }
        Ok(())
    }

    fn find_function(&self, name: &str) -> Result<Option<Digest>> {
        self.conn()?
            .query_row("SELECT digest FROM functions WHERE name = ?1", params![name], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
            .map_err(Error::Sqlite)?
            .map(blob_to_digest)
            .transpose()
    }

    fn save_function(&mut self, name: &str, digest: Digest) -> Result<()> {
        let changed = self.find_function(name)?.map(|d| d != digest).unwrap_or(false);

        self.conn_mut()?
            .execute(
                "INSERT INTO functions (name, digest) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET digest = excluded.digest",
                params![name, digest_to_blob(digest)],
            )
            .map_err(Error::Sqlite)?;

        if changed {
            self.clear_calls(name)?;
        }
        Ok(())
    }

    fn clear_calls(&mut self, name: &str) -> Result<()> {
        let conn = self.conn_mut()?;
        let call_ids: Vec<CallId> = conn
            .prepare("SELECT id FROM calls WHERE name = ?1")
            .map_err(Error::Sqlite)?
            .query_map(params![name], |row| row.get(0))
            .map_err(Error::Sqlite)?
            .collect::<std::result::Result<_, _>>()
            .map_err(Error::Sqlite)?;

        for call_id in call_ids {
            conn.execute("DELETE FROM call_files WHERE call_id = ?1", params![call_id])
                .map_err(Error::Sqlite)?;
            conn.execute("DELETE FROM external_files WHERE call_id = ?1", params![call_id])
                .map_err(Error::Sqlite)?;
        }
        conn.execute("DELETE FROM calls WHERE name = ?1", params![name])
            .map_err(Error::Sqlite)?;
        Ok(())
    }

    fn find_call(&self, name: &str, bound_digest: Digest) -> Result<Option<CallRecord>> {
        self.conn()?
            .query_row(
                "SELECT id, bound_repr, result FROM calls WHERE name = ?1 AND bound_digest = ?2",
                params![name, digest_to_blob(bound_digest)],
                |row| {
                    Ok((
                        row.get::<_, CallId>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(Error::Sqlite)?
            .map(|(call_id, bound_repr, result)| {
                Ok(CallRecord {
                    call_id,
                    bound_digest,
                    bound_repr: serde_json::from_str(&bound_repr)?,
                    result: serde_json::from_str(&result)?,
                })
            })
            .transpose()
    }

    fn save_call(
        &mut self,
        name: &str,
        bound_digest: Digest,
        bound_repr: serde_json::Value,
        result: serde_json::Value,
    ) -> Result<CallId> {
        let bound_text = serde_json::to_string(&bound_repr)?;
        let result_text = serde_json::to_string(&result)?;
        let conn = self.conn_mut()?;
        conn.execute(
            "INSERT INTO calls (name, bound_digest, bound_repr, result) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name, bound_digest) DO UPDATE SET bound_repr = excluded.bound_repr, result = excluded.result",
            params![name, digest_to_blob(bound_digest), bound_text, result_text],
        )
        .map_err(Error::Sqlite)?;

        conn.query_row(
            "SELECT id FROM calls WHERE name = ?1 AND bound_digest = ?2",
            params![name, digest_to_blob(bound_digest)],
            |row| row.get(0),
        )
        .map_err(Error::Sqlite)
    }

    fn find_call_file(&self, call_id: CallId, name: &str, path: &Path) -> Result<Option<Digest>> {
        self.conn()?
            .query_row(
                "SELECT digest FROM call_files WHERE call_id = ?1 AND role = ?2 AND path = ?3",
                params![call_id, name, path.to_string_lossy()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(Error::Sqlite)?
            .map(blob_to_digest)
            .transpose()
    }

    fn save_call_file(&mut self, call_id: CallId, name: &str, path: &Path, digest: Digest) -> Result<()> {
        self.conn_mut()?
            .execute(
                "INSERT INTO call_files (call_id, role, path, digest) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(call_id, role, path) DO UPDATE SET digest = excluded.digest",
                params![call_id, name, path.to_string_lossy(), digest_to_blob(digest)],
            )
            .map_err(Error::Sqlite)?;
        Ok(())
    }

    fn find_external_files(&self, call_id: CallId) -> Result<ExternalFiles> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT kind, path FROM external_files WHERE call_id = ?1")
            .map_err(Error::Sqlite)?;
        let rows = stmt
            .query_map(params![call_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(Error::Sqlite)?;

        let mut out = ExternalFiles::default();
        for row in rows {
            let (kind, path) = row.map_err(Error::Sqlite)?;
            let path = PathBuf::from(path);
            match kind.as_str() {
                "src" => out.srcs.push(path),
                "dst" => out.dsts.push(path),
                _ => {}
            }
        }
        Ok(out)
    }

    fn save_external_files(
        &mut self,
        call_id: CallId,
        srcs: &[(PathBuf, Digest)],
        dsts: &[(PathBuf, Digest)],
    ) -> Result<()> {
        {
            let conn = self.conn_mut()?;
            conn.execute("DELETE FROM external_files WHERE call_id = ?1", params![call_id])
                .map_err(Error::Sqlite)?;
            for (path, _) in srcs {
                conn.execute(
                    "INSERT INTO external_files (call_id, kind, path) VALUES (?1, 'src', ?2)",
                    params![call_id, path.to_string_lossy()],
                )
                .map_err(Error::Sqlite)?;
            }
            for (path, _) in dsts {
                conn.execute(
                    "INSERT INTO external_files (call_id, kind, path) VALUES (?1, 'dst', ?2)",
                    params![call_id, path.to_string_lossy()],
                )
                .map_err(Error::Sqlite)?;
            }
        }
        for (path, digest) in srcs {
            self.save_call_file(call_id, "ext-src", path, *digest)?;
        }
        for (path, digest) in dsts {
            self.save_call_file(call_id, "ext-dst", path, *digest)?;
        }
        Ok(())
    }

    fn observe_file(&mut self, path: &Path) -> Result<Observation> {
        let conn = self.conn_mut()?;
        let mtime = crate::digest::read_mtime_public(path)?;

        let previous: Option<(i64, i64, Vec<u8>)> = conn
            .query_row(
                "SELECT mtime_secs, mtime_nanos, digest FROM file_digests WHERE path = ?1",
                params![path.to_string_lossy()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(Error::Sqlite)?;

        let (prev_mtime, prev_digest) = match previous {
            Some((secs, nanos, blob)) => (Some(parts_to_system_time(secs, nanos)), Some(blob_to_digest(blob)?)),
            None => (None, None),
        };

        if let (Some(prev_mtime), Some(prev_digest)) = (prev_mtime, prev_digest) {
            if prev_mtime == mtime {
                let elapsed = SystemTime::now()
                    .duration_since(mtime)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                if elapsed > MTIME_TRUST_WINDOW_SECS {
                    return Ok(Observation { changed: false, mtime, digest: prev_digest });
                }
            }
        }

        let digest = digest_of_file(path)?;
        let changed = prev_digest.map(|p| p != digest).unwrap_or(true);

        let (secs, nanos) = system_time_to_parts(mtime);
        conn.execute(
            "INSERT INTO file_digests (path, mtime_secs, mtime_nanos, digest) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET mtime_secs = excluded.mtime_secs, mtime_nanos = excluded.mtime_nanos, digest = excluded.digest",
            params![path.to_string_lossy(), secs, nanos, digest_to_blob(digest)],
        )
        .map_err(Error::Sqlite)?;

        Ok(Observation { changed, mtime, digest })
    }

    fn dump(&self) -> Result<serde_json::Value> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, bound_repr, result FROM calls")
            .map_err(Error::Sqlite)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, CallId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(Error::Sqlite)?;

        let mut functions = serde_json::Map::new();
        for row in rows {
            let (call_id, name, bound_repr, result) = row.map_err(Error::Sqlite)?;
            let entry = functions
                .entry(name)
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if let serde_json::Value::Object(map) = entry {
                map.insert(
                    call_id.to_string(),
                    serde_json::json!({
                        "bound": serde_json::from_str::<serde_json::Value>(&bound_repr)?,
                        "result": serde_json::from_str::<serde_json::Value>(&result)?,
                    }),
                );
            }
        }
        Ok(serde_json::Value::Object(functions))
    }

    fn remove_path(&mut self, path: &[String]) -> Result<bool> {
        let conn = self.conn_mut()?;
        match path {
            [] => Ok(false),
            [name] => {
                let n = conn
                    .execute("DELETE FROM calls WHERE name = ?1", params![name])
                    .map_err(Error::Sqlite)?;
                Ok(n > 0)
            }
            [name, call_id] => {
                let n = conn
                    .execute(
                        "DELETE FROM calls WHERE name = ?1 AND id = ?2",
                        params![name, call_id.parse::<CallId>().unwrap_or(CallId::MAX)],
                    )
                    .map_err(Error::Sqlite)?;
                Ok(n > 0)
            }
            _ => Ok(false),
        }
    }
}
