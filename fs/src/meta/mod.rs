//! Metadata Index
//!
//! A single transactional store holding the inode tree, version chains,
//! object reference counts, and snapshots. Write-ahead journaling is
//! enabled so the engine can read while the handler writes. Every
//! multi-row state change runs inside one transaction, and every write
//! operation returns the post-state its caller needs so no second lookup
//! is required.

pub mod rows;

pub use rows::{FileKind, InodeRow, ObjectRow, SnapshotEntryRow, SnapshotRow, VersionRow};

use std::path::Path;
use std::time::Duration;

use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::error::{CowError, CowResult};
use crate::store::Digest;

// ============================================================================
// Constants
// ============================================================================

/// Root directory inode id.
pub const ROOT_INO: i64 = 1;

/// Parent id recorded for the root inode.
pub const NO_PARENT: i64 = 0;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS inodes (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    parent          INTEGER NOT NULL,
    name            TEXT    NOT NULL,
    path            TEXT    NOT NULL,
    kind            TEXT    NOT NULL CHECK (kind IN ('dir', 'file')),
    current_version INTEGER,
    deleted         INTEGER NOT NULL DEFAULT 0,
    mode            INTEGER NOT NULL,
    uid             INTEGER NOT NULL,
    gid             INTEGER NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_inodes_parent_name ON inodes (parent, name);
CREATE INDEX IF NOT EXISTS idx_inodes_path ON inodes (path);
CREATE UNIQUE INDEX IF NOT EXISTS idx_inodes_live_sibling
    ON inodes (parent, name) WHERE deleted = 0;

CREATE TABLE IF NOT EXISTS objects (
    digest     TEXT    PRIMARY KEY,
    size       INTEGER NOT NULL,
    refcount   INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS versions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id    INTEGER NOT NULL REFERENCES inodes (id),
    digest     TEXT    NOT NULL REFERENCES objects (digest),
    size       INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    deleted    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_versions_file ON versions (file_id);
CREATE INDEX IF NOT EXISTS idx_versions_digest ON versions (digest);

CREATE TABLE IF NOT EXISTS snapshots (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT    NOT NULL UNIQUE,
    description TEXT,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshot_entries (
    snapshot_id INTEGER NOT NULL REFERENCES snapshots (id) ON DELETE CASCADE,
    file_id     INTEGER NOT NULL REFERENCES inodes (id),
    version_id  INTEGER REFERENCES versions (id),
    PRIMARY KEY (snapshot_id, file_id)
);
";

// ============================================================================
// Time
// ============================================================================

/// Current time as unix nanoseconds, the at-rest timestamp format.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of a snapshot restore.
#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct SnapshotRestoreReport {
    /// Files reset to their snapshot-time version
    pub files_restored: u64,
    /// Soft-deleted entries brought back
    pub resurrected: u64,
    /// Post-snapshot entries soft-deleted
    pub removed: u64,
    /// Post-snapshot entries left in place (`--keep-new`)
    pub kept_new: u64,
}

/// Aggregate counters for the stats surface.
#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct IndexStats {
    /// Non-deleted regular files
    pub total_files: u64,
    /// Non-deleted directories (root included)
    pub total_dirs: u64,
    /// Non-soft-deleted versions
    pub total_versions: u64,
    /// Object rows
    pub total_objects: u64,
    /// Object rows with reference count zero
    pub orphan_objects: u64,
    /// Sum of non-soft-deleted version sizes
    pub logical_bytes: u64,
    /// Sum of object sizes
    pub actual_bytes: u64,
}

// ============================================================================
// Metadata Index
// ============================================================================

/// Handle to the metadata database.
pub struct MetaIndex {
    conn: Connection,
}

impl std::fmt::Debug for MetaIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaIndex").finish_non_exhaustive()
    }
}

impl MetaIndex {
    /// Open (and if needed create) the index at `path`.
    ///
    /// Ensures the schema and the root inode exist.
    pub fn open(path: impl AsRef<Path>) -> CowResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        let index = Self { conn };
        index.ensure_root()?;
        Ok(index)
    }

    fn ensure_root(&self) -> CowResult<()> {
        let now = now_nanos();
        self.conn.execute(
            "INSERT OR IGNORE INTO inodes
                 (id, parent, name, path, kind, current_version, deleted,
                  mode, uid, gid, created_at, updated_at)
             VALUES (?1, ?2, '', '/', 'dir', NULL, 0, ?3, 0, 0, ?4, ?4)",
            params![ROOT_INO, NO_PARENT, 0o755, now],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// Look up the non-deleted child `name` of `parent`.
    pub fn resolve(&self, parent: i64, name: &str) -> CowResult<Option<InodeRow>> {
        self.conn
            .query_row(
                &format!("{INODE_SELECT} WHERE parent = ?1 AND name = ?2 AND deleted = 0"),
                params![parent, name],
                inode_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Fetch an inode by id, deleted or not.
    pub fn inode(&self, id: i64) -> CowResult<Option<InodeRow>> {
        self.conn
            .query_row(
                &format!("{INODE_SELECT} WHERE id = ?1"),
                params![id],
                inode_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Resolve a path, preferring a live row over soft-deleted ones.
    ///
    /// Soft-deleted rows keep their path, so history and restore can still
    /// reach a file after `unlink`.
    pub fn inode_by_path(&self, path: &str) -> CowResult<Option<InodeRow>> {
        self.conn
            .query_row(
                &format!("{INODE_SELECT} WHERE path = ?1 ORDER BY deleted ASC, id DESC LIMIT 1"),
                params![path],
                inode_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Non-deleted children of `parent`, ordered by name for stable
    /// readdir offsets.
    pub fn list_children(&self, parent: i64) -> CowResult<Vec<InodeRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{INODE_SELECT} WHERE parent = ?1 AND deleted = 0 AND id != ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![parent], inode_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// Every inode row, including soft-deleted ones.
    pub fn all_inodes(&self) -> CowResult<Vec<InodeRow>> {
        let mut stmt = self.conn.prepare(&format!("{INODE_SELECT} ORDER BY id"))?;
        let rows = stmt.query_map([], inode_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// A file's current version.
    pub fn current_version(&self, file_id: i64) -> CowResult<Option<VersionRow>> {
        self.conn
            .query_row(
                &format!(
                    "{VERSION_SELECT} WHERE id =
                         (SELECT current_version FROM inodes WHERE id = ?1)"
                ),
                params![file_id],
                version_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Fetch a version row by id.
    pub fn version(&self, id: i64) -> CowResult<Option<VersionRow>> {
        self.conn
            .query_row(
                &format!("{VERSION_SELECT} WHERE id = ?1"),
                params![id],
                version_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// A file's non-soft-deleted versions in chronological order.
    pub fn version_chain(&self, file_id: i64) -> CowResult<Vec<VersionRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{VERSION_SELECT} WHERE file_id = ?1 AND deleted = 0 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![file_id], version_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// Fetch an object row.
    pub fn object(&self, digest: &Digest) -> CowResult<Option<ObjectRow>> {
        self.conn
            .query_row(
                "SELECT digest, size, refcount, created_at FROM objects WHERE digest = ?1",
                params![digest],
                object_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------------
    // Inode mutations
    // ------------------------------------------------------------------------

    /// Create a regular file with its initial empty version.
    ///
    /// The caller guarantees the empty-bytes blob exists in the object
    /// store. A live `(parent, name)` collision surfaces as `Exists`.
    pub fn create_file(
        &mut self,
        parent: i64,
        name: &str,
        path: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        empty: &Digest,
    ) -> CowResult<InodeRow> {
        let now = now_nanos();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO inodes
                 (parent, name, path, kind, current_version, deleted,
                  mode, uid, gid, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'file', NULL, 0, ?4, ?5, ?6, ?7, ?7)",
            params![parent, name, path, mode, uid, gid, now],
        )?;
        let id = tx.last_insert_rowid();
        bump_ref_tx(&tx, empty, 0, now)?;
        let version_id = insert_version_tx(&tx, id, empty, 0, now)?;
        tx.execute(
            "UPDATE inodes SET current_version = ?1 WHERE id = ?2",
            params![version_id, id],
        )?;
        tx.commit()?;
        debug!("create file ino={id} path={path}");
        self.inode(id)?.ok_or(CowError::StaleHandle)
    }

    /// Create a directory.
    pub fn create_dir(
        &mut self,
        parent: i64,
        name: &str,
        path: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> CowResult<InodeRow> {
        let now = now_nanos();
        self.conn.execute(
            "INSERT INTO inodes
                 (parent, name, path, kind, current_version, deleted,
                  mode, uid, gid, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'dir', NULL, 0, ?4, ?5, ?6, ?7, ?7)",
            params![parent, name, path, mode, uid, gid, now],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("mkdir ino={id} path={path}");
        self.inode(id)?.ok_or(CowError::StaleHandle)
    }

    /// Append a version for `file_id`: upsert the object (bumping its
    /// reference count), insert the version row, and move the current
    /// pointer — all in one transaction. This is the flush commit.
    pub fn append_version(
        &mut self,
        file_id: i64,
        digest: &Digest,
        size: u64,
    ) -> CowResult<VersionRow> {
        let now = now_nanos();
        let tx = self.conn.transaction()?;
        bump_ref_tx(&tx, digest, size, now)?;
        let version_id = insert_version_tx(&tx, file_id, digest, size, now)?;
        tx.execute(
            "UPDATE inodes SET current_version = ?1, updated_at = ?2 WHERE id = ?3",
            params![version_id, now, file_id],
        )?;
        tx.commit()?;
        self.version(version_id)?
            .ok_or_else(|| CowError::Corruption("version row vanished after insert".into()))
    }

    /// Append a version that restores prior content: same commit as
    /// [`Self::append_version`] plus clearing the deleted flag on the
    /// inode and every ancestor, so the restored file is reachable.
    pub fn restore_version(
        &mut self,
        file_id: i64,
        digest: &Digest,
        size: u64,
    ) -> CowResult<VersionRow> {
        let now = now_nanos();
        let tx = self.conn.transaction()?;
        bump_ref_tx(&tx, digest, size, now)?;
        let version_id = insert_version_tx(&tx, file_id, digest, size, now)?;
        tx.execute(
            "UPDATE inodes SET current_version = ?1, updated_at = ?2, deleted = 0 WHERE id = ?3",
            params![version_id, now, file_id],
        )?;
        undelete_ancestors_tx(&tx, file_id)?;
        tx.commit()?;
        self.version(version_id)?
            .ok_or_else(|| CowError::Corruption("version row vanished after insert".into()))
    }

    /// Update attribute columns; `None` leaves a column untouched.
    pub fn set_attr(
        &mut self,
        id: i64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        mtime: Option<i64>,
    ) -> CowResult<InodeRow> {
        let now = now_nanos();
        self.conn.execute(
            "UPDATE inodes SET
                 mode = COALESCE(?1, mode),
                 uid = COALESCE(?2, uid),
                 gid = COALESCE(?3, gid),
                 updated_at = COALESCE(?4, ?5)
             WHERE id = ?6",
            params![mode, uid, gid, mtime, now, id],
        )?;
        self.inode(id)?.ok_or(CowError::StaleHandle)
    }

    /// Soft-delete an inode. For a file, the current version's object
    /// loses one reference; history stays queryable by file id.
    pub fn soft_delete(&mut self, id: i64) -> CowResult<()> {
        let tx = self.conn.transaction()?;
        soft_delete_tx(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    /// Move `src` under `(new_parent, new_name)`, rewriting the
    /// denormalized path of the whole moved subtree. If `replace` names
    /// an existing destination it is soft-deleted in the same
    /// transaction.
    pub fn rename(
        &mut self,
        src: i64,
        new_parent: i64,
        new_name: &str,
        new_path: &str,
        replace: Option<i64>,
    ) -> CowResult<()> {
        let now = now_nanos();
        let tx = self.conn.transaction()?;

        if let Some(victim) = replace {
            soft_delete_tx(&tx, victim)?;
        }

        let old_path: String = tx.query_row(
            "SELECT path FROM inodes WHERE id = ?1",
            params![src],
            |row| row.get(0),
        )?;

        tx.execute(
            "UPDATE inodes SET parent = ?1, name = ?2, path = ?3, updated_at = ?4
             WHERE id = ?5",
            params![new_parent, new_name, new_path, now, src],
        )?;

        // Rewrite descendants: every row whose path starts with
        // "<old_path>/" gets the new prefix spliced in.
        let old_prefix = format!("{old_path}/");
        tx.execute(
            "UPDATE inodes SET path = ?1 || substr(path, ?2)
             WHERE substr(path, 1, ?3) = ?4",
            params![
                format!("{new_path}/"),
                old_prefix.len() as i64 + 1,
                old_prefix.len() as i64,
                old_prefix
            ],
        )?;

        tx.commit()?;
        debug!("rename {old_path} -> {new_path}");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reference counts
    // ------------------------------------------------------------------------

    /// Add one reference to an object, creating its row on first use.
    pub fn bump_ref(&mut self, digest: &Digest, size: u64) -> CowResult<i64> {
        let tx = self.conn.transaction()?;
        bump_ref_tx(&tx, digest, size, now_nanos())?;
        let count = ref_count_tx(&tx, digest)?;
        tx.commit()?;
        Ok(count)
    }

    /// Drop one reference, returning the new count.
    pub fn decrement_ref(&mut self, digest: &Digest) -> CowResult<i64> {
        let tx = self.conn.transaction()?;
        decrement_ref_tx(&tx, digest)?;
        let count = ref_count_tx(&tx, digest)?;
        tx.commit()?;
        Ok(count)
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Create a snapshot: one row plus one entry per non-deleted inode,
    /// each file entry holding a reference to its current object.
    pub fn snapshot_create(
        &mut self,
        name: &str,
        description: Option<&str>,
    ) -> CowResult<SnapshotRow> {
        let now = now_nanos();
        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO snapshots (name, description, created_at)
             VALUES (?1, ?2, ?3)",
            params![name, description, now],
        )?;
        if inserted == 0 {
            return Err(CowError::SnapshotExists(name.to_owned()));
        }
        let snap_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO snapshot_entries (snapshot_id, file_id, version_id)
             SELECT ?1, id, current_version FROM inodes WHERE deleted = 0",
            params![snap_id],
        )?;

        adjust_snapshot_refs_tx(&tx, snap_id, 1)?;
        tx.commit()?;
        debug!("snapshot '{name}' created (id={snap_id})");
        self.snapshot_by_name(name)?
            .ok_or_else(|| CowError::Corruption("snapshot row vanished after insert".into()))
    }

    /// Fetch a snapshot by name.
    pub fn snapshot_by_name(&self, name: &str) -> CowResult<Option<SnapshotRow>> {
        self.conn
            .query_row(
                "SELECT id, name, description, created_at FROM snapshots WHERE name = ?1",
                params![name],
                snapshot_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// All snapshots, oldest first.
    pub fn snapshot_list(&self) -> CowResult<Vec<SnapshotRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description, created_at FROM snapshots ORDER BY id")?;
        let rows = stmt.query_map([], snapshot_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// Entries of one snapshot.
    pub fn snapshot_entries(&self, snapshot_id: i64) -> CowResult<Vec<SnapshotEntryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_id, file_id, version_id FROM snapshot_entries
             WHERE snapshot_id = ?1 ORDER BY file_id",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| {
            Ok(SnapshotEntryRow {
                snapshot_id: row.get(0)?,
                file_id: row.get(1)?,
                version_id: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// Delete a snapshot and its entries, releasing their object
    /// references. Objects themselves remain until GC.
    pub fn snapshot_delete(&mut self, name: &str) -> CowResult<()> {
        let tx = self.conn.transaction()?;
        let snap_id: i64 = tx
            .query_row(
                "SELECT id FROM snapshots WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CowError::SnapshotNotFound(name.to_owned()))?;

        adjust_snapshot_refs_tx(&tx, snap_id, -1)?;
        tx.execute(
            "DELETE FROM snapshot_entries WHERE snapshot_id = ?1",
            params![snap_id],
        )?;
        tx.execute("DELETE FROM snapshots WHERE id = ?1", params![snap_id])?;
        tx.commit()?;
        debug!("snapshot '{name}' deleted");
        Ok(())
    }

    /// Restore the tree to a snapshot's state in one transaction.
    ///
    /// Every entry's inode is brought back (deleted flag cleared) and, for
    /// files, reset to the snapshot-recorded content by appending a new
    /// version — never by rewriting history. Inodes created after the
    /// snapshot are soft-deleted unless `keep_new`.
    pub fn snapshot_restore(
        &mut self,
        name: &str,
        keep_new: bool,
    ) -> CowResult<SnapshotRestoreReport> {
        let now = now_nanos();
        let tx = self.conn.transaction()?;
        let snap_id: i64 = tx
            .query_row(
                "SELECT id FROM snapshots WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CowError::SnapshotNotFound(name.to_owned()))?;

        let mut report = SnapshotRestoreReport::default();

        // Step 1: reset covered inodes to their recorded state.
        let entries: Vec<(i64, Option<i64>)> = {
            let mut stmt = tx.prepare(
                "SELECT file_id, version_id FROM snapshot_entries WHERE snapshot_id = ?1",
            )?;
            let rows = stmt.query_map(params![snap_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for (file_id, version_id) in &entries {
            let was_deleted: Option<bool> = tx
                .query_row(
                    "SELECT deleted FROM inodes WHERE id = ?1",
                    params![file_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(was_deleted) = was_deleted else {
                // Snapshots bind to inode ids; the handler never
                // hard-deletes rows, so a missing one is corruption.
                return Err(CowError::Corruption(format!(
                    "snapshot entry cites unknown inode {file_id}"
                )));
            };
            if was_deleted {
                report.resurrected += 1;
            }

            match version_id {
                Some(vid) => {
                    let (digest, size): (Digest, i64) = tx.query_row(
                        "SELECT digest, size FROM versions WHERE id = ?1",
                        params![vid],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?;
                    bump_ref_tx(&tx, &digest, size as u64, now)?;
                    let new_version = insert_version_tx(&tx, *file_id, &digest, size as u64, now)?;
                    tx.execute(
                        "UPDATE inodes SET current_version = ?1, updated_at = ?2, deleted = 0
                         WHERE id = ?3",
                        params![new_version, now, file_id],
                    )?;
                    report.files_restored += 1;
                }
                None => {
                    tx.execute(
                        "UPDATE inodes SET deleted = 0, updated_at = ?1 WHERE id = ?2",
                        params![now, file_id],
                    )?;
                }
            }
        }

        // Step 2: inodes with no entry were created after the snapshot.
        let newcomers: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM inodes WHERE deleted = 0 AND id NOT IN
                     (SELECT file_id FROM snapshot_entries WHERE snapshot_id = ?1)",
            )?;
            let rows = stmt.query_map(params![snap_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for id in newcomers {
            if keep_new {
                report.kept_new += 1;
            } else {
                soft_delete_tx(&tx, id)?;
                report.removed += 1;
            }
        }

        tx.commit()?;
        debug!(
            "snapshot '{name}' restored: {} files, {} removed, {} kept",
            report.files_restored, report.removed, report.kept_new
        );
        Ok(report)
    }

    /// (path, digest) of every file entry in a snapshot, using the
    /// inodes' current paths.
    pub fn snapshot_file_digests(&self, snapshot_id: i64) -> CowResult<Vec<(String, Digest)>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.path, v.digest
             FROM snapshot_entries se
             JOIN inodes i ON i.id = se.file_id
             JOIN versions v ON v.id = se.version_id
             WHERE se.snapshot_id = ?1",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// (path, digest) of every live file's current version.
    pub fn current_file_digests(&self) -> CowResult<Vec<(String, Digest)>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.path, v.digest
             FROM inodes i JOIN versions v ON v.id = i.current_version
             WHERE i.deleted = 0 AND i.kind = 'file'",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// Most recent versions across all files, newest first, with the
    /// owning file's path.
    pub fn recent_versions(&self, limit: u32) -> CowResult<Vec<(String, VersionRow)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT i.path, {VERSION_COLS_V}
             FROM versions v JOIN inodes i ON i.id = v.file_id
             WHERE v.deleted = 0 ORDER BY v.id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                VersionRow {
                    id: row.get(1)?,
                    file_id: row.get(2)?,
                    digest: row.get(3)?,
                    size: row.get::<_, i64>(4)? as u64,
                    created_at: row.get(5)?,
                    deleted: row.get(6)?,
                },
            ))
        })?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    // ------------------------------------------------------------------------
    // Garbage collection support
    // ------------------------------------------------------------------------

    /// Soft-delete all but the newest `n` live versions of every file,
    /// releasing one object reference per pruned version.
    pub fn prune_keep_last(&mut self, n: u32) -> CowResult<u64> {
        if n == 0 {
            return Err(CowError::InvalidArgument);
        }
        let tx = self.conn.transaction()?;
        let victims: Vec<(i64, Digest)> = {
            let mut stmt = tx.prepare(
                "SELECT id, digest FROM versions v
                 WHERE deleted = 0 AND
                       (SELECT COUNT(*) FROM versions v2
                        WHERE v2.file_id = v.file_id AND v2.deleted = 0 AND v2.id > v.id) >= ?1",
            )?;
            let rows = stmt.query_map(params![n], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let pruned = victims.len() as u64;
        for (id, digest) in victims {
            tx.execute("UPDATE versions SET deleted = 1 WHERE id = ?1", params![id])?;
            decrement_ref_tx(&tx, &digest)?;
        }
        tx.commit()?;
        Ok(pruned)
    }

    /// Soft-delete live versions created before `cutoff`, keeping every
    /// live file's current version so reads keep working.
    pub fn prune_before(&mut self, cutoff: i64) -> CowResult<u64> {
        let tx = self.conn.transaction()?;
        let victims: Vec<(i64, Digest)> = {
            let mut stmt = tx.prepare(
                "SELECT v.id, v.digest FROM versions v
                 JOIN inodes i ON i.id = v.file_id
                 WHERE v.deleted = 0 AND v.created_at < ?1
                   AND NOT (i.deleted = 0 AND i.current_version = v.id)",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let pruned = victims.len() as u64;
        for (id, digest) in victims {
            tx.execute("UPDATE versions SET deleted = 1 WHERE id = ?1", params![id])?;
            decrement_ref_tx(&tx, &digest)?;
        }
        tx.commit()?;
        Ok(pruned)
    }

    /// Objects eligible for reclamation: reference count zero, created
    /// before `cutoff`, and cited by no live version or snapshot entry.
    pub fn reclaimable_objects(&self, cutoff: i64) -> CowResult<Vec<ObjectRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT digest, size, refcount, created_at FROM objects o
             WHERE refcount <= 0 AND created_at < ?1
               AND NOT EXISTS
                   (SELECT 1 FROM versions v WHERE v.digest = o.digest AND v.deleted = 0)
               AND NOT EXISTS
                   (SELECT 1 FROM snapshot_entries se
                    JOIN versions v2 ON v2.id = se.version_id
                    WHERE v2.digest = o.digest)",
        )?;
        let rows = stmt.query_map(params![cutoff], object_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// Remove an object row, guarded against a reference appearing since
    /// the candidate scan. Returns whether the row was removed.
    pub fn remove_object(&mut self, digest: &Digest) -> CowResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM objects WHERE digest = ?1 AND refcount <= 0",
            params![digest],
        )?;
        Ok(n > 0)
    }

    // ------------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------------

    /// Aggregate counters for `statfs` and the stats command.
    pub fn stats(&self) -> CowResult<IndexStats> {
        let one = |sql: &str| -> CowResult<i64> {
            self.conn
                .query_row(sql, [], |row| row.get::<_, Option<i64>>(0))
                .map(|v| v.unwrap_or(0))
                .map_err(Into::into)
        };
        Ok(IndexStats {
            total_files: one(
                "SELECT COUNT(*) FROM inodes WHERE deleted = 0 AND kind = 'file'",
            )? as u64,
            total_dirs: one("SELECT COUNT(*) FROM inodes WHERE deleted = 0 AND kind = 'dir'")?
                as u64,
            total_versions: one("SELECT COUNT(*) FROM versions WHERE deleted = 0")? as u64,
            total_objects: one("SELECT COUNT(*) FROM objects")? as u64,
            orphan_objects: one("SELECT COUNT(*) FROM objects WHERE refcount <= 0")? as u64,
            logical_bytes: one("SELECT SUM(size) FROM versions WHERE deleted = 0")? as u64,
            actual_bytes: one("SELECT SUM(size) FROM objects")? as u64,
        })
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

const INODE_SELECT: &str = "SELECT id, parent, name, path, kind, current_version, deleted, \
                            mode, uid, gid, created_at, updated_at FROM inodes";

const VERSION_SELECT: &str =
    "SELECT id, file_id, digest, size, created_at, deleted FROM versions";

const VERSION_COLS_V: &str = "v.id, v.file_id, v.digest, v.size, v.created_at, v.deleted";

fn inode_from_row(row: &Row<'_>) -> rusqlite::Result<InodeRow> {
    Ok(InodeRow {
        id: row.get(0)?,
        parent: row.get(1)?,
        name: row.get(2)?,
        path: row.get(3)?,
        kind: row.get(4)?,
        current_version: row.get(5)?,
        deleted: row.get(6)?,
        mode: row.get(7)?,
        uid: row.get(8)?,
        gid: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        id: row.get(0)?,
        file_id: row.get(1)?,
        digest: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        created_at: row.get(4)?,
        deleted: row.get(5)?,
    })
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectRow> {
    Ok(ObjectRow {
        digest: row.get(0)?,
        size: row.get::<_, i64>(1)? as u64,
        refcount: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
    })
}

// ============================================================================
// Transaction Helpers
// ============================================================================

fn bump_ref_tx(tx: &Transaction<'_>, digest: &Digest, size: u64, now: i64) -> CowResult<()> {
    tx.execute(
        "INSERT INTO objects (digest, size, refcount, created_at)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT (digest) DO UPDATE SET refcount = refcount + 1",
        params![digest, size as i64, now],
    )?;
    Ok(())
}

fn decrement_ref_tx(tx: &Transaction<'_>, digest: &Digest) -> CowResult<()> {
    tx.execute(
        "UPDATE objects SET refcount = refcount - 1 WHERE digest = ?1 AND refcount > 0",
        params![digest],
    )?;
    Ok(())
}

fn ref_count_tx(tx: &Transaction<'_>, digest: &Digest) -> CowResult<i64> {
    tx.query_row(
        "SELECT refcount FROM objects WHERE digest = ?1",
        params![digest],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| CowError::Corruption(format!("no object row for {}", digest.short())))
}

fn insert_version_tx(
    tx: &Transaction<'_>,
    file_id: i64,
    digest: &Digest,
    size: u64,
    now: i64,
) -> CowResult<i64> {
    tx.execute(
        "INSERT INTO versions (file_id, digest, size, created_at, deleted)
         VALUES (?1, ?2, ?3, ?4, 0)",
        params![file_id, digest, size as i64, now],
    )?;
    Ok(tx.last_insert_rowid())
}

fn soft_delete_tx(tx: &Transaction<'_>, id: i64) -> CowResult<()> {
    let now = now_nanos();
    let current: Option<i64> = tx.query_row(
        "SELECT current_version FROM inodes WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    tx.execute(
        "UPDATE inodes SET deleted = 1, updated_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    if let Some(version_id) = current {
        let digest: Digest = tx.query_row(
            "SELECT digest FROM versions WHERE id = ?1",
            params![version_id],
            |row| row.get(0),
        )?;
        decrement_ref_tx(tx, &digest)?;
    }
    Ok(())
}

fn undelete_ancestors_tx(tx: &Transaction<'_>, id: i64) -> CowResult<()> {
    let mut cursor = id;
    loop {
        let parent: Option<i64> = tx
            .query_row(
                "SELECT parent FROM inodes WHERE id = ?1",
                params![cursor],
                |row| row.get(0),
            )
            .optional()?;
        let Some(parent) = parent else { break };
        if parent == NO_PARENT {
            break;
        }
        tx.execute(
            "UPDATE inodes SET deleted = 0 WHERE id = ?1 AND deleted = 1",
            params![parent],
        )?;
        cursor = parent;
    }
    Ok(())
}

/// Shift object reference counts for every file entry of a snapshot by
/// `delta`, counting duplicates per digest.
fn adjust_snapshot_refs_tx(tx: &Transaction<'_>, snap_id: i64, delta: i64) -> CowResult<()> {
    tx.execute(
        "UPDATE objects SET refcount = MAX(0, refcount + ?2 *
             (SELECT COUNT(*) FROM snapshot_entries se
              JOIN versions v ON v.id = se.version_id
              WHERE se.snapshot_id = ?1 AND v.digest = objects.digest))
         WHERE digest IN
             (SELECT v.digest FROM snapshot_entries se
              JOIN versions v ON v.id = se.version_id
              WHERE se.snapshot_id = ?1)",
        params![snap_id, delta],
    )?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DigestAlgo;

    fn index() -> (tempfile::TempDir, MetaIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = MetaIndex::open(dir.path().join("metadata.db")).unwrap();
        (dir, index)
    }

    fn empty_digest() -> Digest {
        DigestAlgo::Sha256.empty()
    }

    #[test]
    fn test_root_exists() {
        let (_dir, index) = index();
        let root = index.inode(ROOT_INO).unwrap().unwrap();
        assert_eq!(root.path, "/");
        assert!(root.is_dir());
        assert!(!root.deleted);
    }

    #[test]
    fn test_create_and_resolve_file() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let inode = index
            .create_file(ROOT_INO, "a.txt", "/a.txt", 0o644, 1000, 1000, &empty)
            .unwrap();
        assert_eq!(inode.kind, FileKind::RegularFile);
        assert!(inode.current_version.is_some());

        let found = index.resolve(ROOT_INO, "a.txt").unwrap().unwrap();
        assert_eq!(found.id, inode.id);

        // A fresh file has exactly one (empty) version.
        let chain = index.version_chain(inode.id).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].size, 0);
        assert_eq!(chain[0].digest, empty);
    }

    #[test]
    fn test_duplicate_name_is_exists() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        index
            .create_file(ROOT_INO, "dup", "/dup", 0o644, 0, 0, &empty)
            .unwrap();
        let err = index
            .create_file(ROOT_INO, "dup", "/dup", 0o644, 0, 0, &empty)
            .unwrap_err();
        assert!(matches!(err, CowError::Exists));
    }

    #[test]
    fn test_append_version_moves_current_and_refcounts() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let inode = index
            .create_file(ROOT_INO, "f", "/f", 0o644, 0, 0, &empty)
            .unwrap();

        let d1 = DigestAlgo::Sha256.hash(b"v1");
        let v1 = index.append_version(inode.id, &d1, 2).unwrap();
        let cur = index.current_version(inode.id).unwrap().unwrap();
        assert_eq!(cur.id, v1.id);
        assert_eq!(index.object(&d1).unwrap().unwrap().refcount, 1);

        // Same content again: one object row, two references.
        let v2 = index.append_version(inode.id, &d1, 2).unwrap();
        assert!(v2.id > v1.id);
        assert_eq!(index.object(&d1).unwrap().unwrap().refcount, 2);
    }

    #[test]
    fn test_soft_delete_releases_current_ref() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let inode = index
            .create_file(ROOT_INO, "gone", "/gone", 0o644, 0, 0, &empty)
            .unwrap();
        let d = DigestAlgo::Sha256.hash(b"data");
        index.append_version(inode.id, &d, 4).unwrap();

        index.soft_delete(inode.id).unwrap();
        assert!(index.resolve(ROOT_INO, "gone").unwrap().is_none());
        // History stays queryable by id.
        assert_eq!(index.version_chain(inode.id).unwrap().len(), 2);
        assert_eq!(index.object(&d).unwrap().unwrap().refcount, 0);

        // The path can be taken again by a fresh inode with a new chain.
        let again = index
            .create_file(ROOT_INO, "gone", "/gone", 0o644, 0, 0, &empty)
            .unwrap();
        assert_ne!(again.id, inode.id);
        assert_eq!(index.version_chain(again.id).unwrap().len(), 1);
    }

    #[test]
    fn test_rename_rewrites_subtree_paths() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let dir = index
            .create_dir(ROOT_INO, "a", "/a", 0o755, 0, 0)
            .unwrap();
        let sub = index.create_dir(dir.id, "b", "/a/b", 0o755, 0, 0).unwrap();
        let file = index
            .create_file(sub.id, "f", "/a/b/f", 0o644, 0, 0, &empty)
            .unwrap();

        index.rename(dir.id, ROOT_INO, "z", "/z", None).unwrap();

        assert_eq!(index.inode(dir.id).unwrap().unwrap().path, "/z");
        assert_eq!(index.inode(sub.id).unwrap().unwrap().path, "/z/b");
        assert_eq!(index.inode(file.id).unwrap().unwrap().path, "/z/b/f");
        assert!(index.inode_by_path("/z/b/f").unwrap().is_some());
    }

    #[test]
    fn test_rename_replace_soft_deletes_destination() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let src = index
            .create_file(ROOT_INO, "src", "/src", 0o644, 0, 0, &empty)
            .unwrap();
        let dst = index
            .create_file(ROOT_INO, "dst", "/dst", 0o644, 0, 0, &empty)
            .unwrap();

        index
            .rename(src.id, ROOT_INO, "dst", "/dst", Some(dst.id))
            .unwrap();

        let moved = index.resolve(ROOT_INO, "dst").unwrap().unwrap();
        assert_eq!(moved.id, src.id);
        assert!(index.inode(dst.id).unwrap().unwrap().deleted);
    }

    #[test]
    fn test_snapshot_create_holds_references() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let inode = index
            .create_file(ROOT_INO, "f", "/f", 0o644, 0, 0, &empty)
            .unwrap();
        let d = DigestAlgo::Sha256.hash(b"content");
        index.append_version(inode.id, &d, 7).unwrap();

        let snap = index.snapshot_create("base", None).unwrap();
        assert_eq!(snap.name, "base");
        // Version ref + snapshot ref.
        assert_eq!(index.object(&d).unwrap().unwrap().refcount, 2);

        // Entries cover the root dir and the file.
        let entries = index.snapshot_entries(snap.id).unwrap();
        assert_eq!(entries.len(), 2);

        index.snapshot_delete("base").unwrap();
        assert_eq!(index.object(&d).unwrap().unwrap().refcount, 1);
        assert!(index.snapshot_by_name("base").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_name_collision() {
        let (_dir, mut index) = index();
        index.snapshot_create("s", None).unwrap();
        let err = index.snapshot_create("s", None).unwrap_err();
        assert!(matches!(err, CowError::SnapshotExists(_)));
    }

    #[test]
    fn test_snapshot_restore_resets_and_removes() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let c = index
            .create_file(ROOT_INO, "c", "/c", 0o644, 0, 0, &empty)
            .unwrap();
        let d_orig = DigestAlgo::Sha256.hash(b"original");
        index.append_version(c.id, &d_orig, 8).unwrap();

        index.snapshot_create("baseline", None).unwrap();

        let d_mod = DigestAlgo::Sha256.hash(b"modified");
        index.append_version(c.id, &d_mod, 8).unwrap();
        index
            .create_file(ROOT_INO, "new", "/new", 0o644, 0, 0, &empty)
            .unwrap();

        let report = index.snapshot_restore("baseline", false).unwrap();
        assert_eq!(report.files_restored, 1);
        assert_eq!(report.removed, 1);

        let cur = index.current_version(c.id).unwrap().unwrap();
        assert_eq!(cur.digest, d_orig);
        assert!(index.resolve(ROOT_INO, "new").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_restore_keep_new() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        index.snapshot_create("s", None).unwrap();
        index
            .create_file(ROOT_INO, "kept", "/kept", 0o644, 0, 0, &empty)
            .unwrap();

        let report = index.snapshot_restore("s", true).unwrap();
        assert_eq!(report.kept_new, 1);
        assert!(index.resolve(ROOT_INO, "kept").unwrap().is_some());
    }

    #[test]
    fn test_prune_keep_last() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let inode = index
            .create_file(ROOT_INO, "t", "/t", 0o644, 0, 0, &empty)
            .unwrap();
        let d_old = DigestAlgo::Sha256.hash(b"old");
        let d_new = DigestAlgo::Sha256.hash(b"new");
        index.append_version(inode.id, &d_old, 3).unwrap();
        index.append_version(inode.id, &d_new, 3).unwrap();

        // 3 live versions (empty, old, new); keep only the newest.
        let pruned = index.prune_keep_last(1).unwrap();
        assert_eq!(pruned, 2);

        let chain = index.version_chain(inode.id).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].digest, d_new);
        assert_eq!(index.object(&d_old).unwrap().unwrap().refcount, 0);
        assert_eq!(index.object(&d_new).unwrap().unwrap().refcount, 1);
    }

    #[test]
    fn test_reclaimable_respects_live_citations() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let inode = index
            .create_file(ROOT_INO, "f", "/f", 0o644, 0, 0, &empty)
            .unwrap();
        let d = DigestAlgo::Sha256.hash(b"x");
        index.append_version(inode.id, &d, 1).unwrap();

        // Unlink drops the current ref but the live version row still
        // cites the digest, so it must not be reclaimable.
        index.soft_delete(inode.id).unwrap();
        assert_eq!(index.object(&d).unwrap().unwrap().refcount, 0);
        let candidates = index.reclaimable_objects(now_nanos() + 1).unwrap();
        assert!(candidates.iter().all(|o| o.digest != d));

        // Once the version is pruned the object becomes reclaimable.
        index.prune_before(now_nanos() + 1).unwrap();
        let candidates = index.reclaimable_objects(now_nanos() + 1).unwrap();
        assert!(candidates.iter().any(|o| o.digest == d));
    }

    #[test]
    fn test_stats_counters() {
        let (_dir, mut index) = index();
        let empty = empty_digest();
        let a = index
            .create_file(ROOT_INO, "a", "/a", 0o644, 0, 0, &empty)
            .unwrap();
        let d = DigestAlgo::Sha256.hash(b"XX");
        index.append_version(a.id, &d, 2).unwrap();

        let stats = index.stats().unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.total_dirs, 1);
        assert_eq!(stats.total_versions, 2);
        assert_eq!(stats.total_objects, 2);
        assert_eq!(stats.logical_bytes, 2);
        assert_eq!(stats.actual_bytes, 2);
    }
}
