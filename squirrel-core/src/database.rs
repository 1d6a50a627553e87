//! Shared meta-information database: files, nuts, the kind-codes
//! dictionary, and the trigger-maintained population counts.

use crate::model::{split_codes, Content, Kind, Nut};
use crate::selection::Selection;
use once_cell::sync::Lazy;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Process-wide registry: repeated opens of the same absolute path share
/// one handle. In-memory databases are never registered.
static DATABASES: Lazy<Mutex<HashMap<PathBuf, Arc<Database>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Get a shared database handle.
///
/// `None` resolves to the user's default cache database
/// (`$SQUIRREL_CACHE_DIR` or the platform cache directory).
pub fn get_database(path: Option<&Path>) -> crate::Result<Arc<Database>> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_database_path(),
    };
    let path = std::path::absolute(&path)?;

    let mut registry = DATABASES.lock().expect("database registry poisoned");
    if let Some(database) = registry.get(&path) {
        return Ok(database.clone());
    }

    let database = Arc::new(Database::open(&path)?);
    registry.insert(path, database.clone());
    Ok(database)
}

fn default_database_path() -> PathBuf {
    let base = match std::env::var_os("SQUIRREL_CACHE_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("squirrel"),
    };
    base.join("nuts.sqlite")
}

/// Statistics about contents cached in the meta-information database.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub nfiles: i64,
    pub nnuts: i64,
    pub kinds: Vec<Kind>,
    pub codes: Vec<Vec<String>>,
    pub total_size: Option<i64>,
    pub counts: Vec<CountEntry>,
}

/// Number of live nuts for one `(kind, codes)` combination.
#[derive(Debug, Clone, Serialize)]
pub struct CountEntry {
    pub kind: Kind,
    pub codes: Vec<String>,
    pub count: i64,
}

/// Meta-information index over files and the nuts they expose.
///
/// All operations on one database are serialized through one connection;
/// writes between `dig`/`remove`/`reset` and `commit` stay in an open
/// transaction so a consumer abandoning an ingest keeps the store at the
/// last commit boundary.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    conn: Mutex<Connection>,
    need_commit: AtomicBool,
}

impl Database {
    /// Open or create the database at `path`. Prefer [`get_database`],
    /// which shares handles per path.
    pub fn open(path: &Path) -> crate::Result<Database> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Database {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            need_commit: AtomicBool::new(false),
        })
    }

    /// Ephemeral in-memory database, private to this handle.
    pub fn new_in_memory() -> crate::Result<Arc<Database>> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Arc::new(Database {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
            need_commit: AtomicBool::new(false),
        }))
    }

    fn init_schema(conn: &Connection) -> crate::Result<()> {
        // The file -> nuts -> population count cascade needs nested
        // trigger execution.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA recursive_triggers = ON;

            CREATE TABLE IF NOT EXISTS files (
                file_id INTEGER PRIMARY KEY,
                path TEXT,
                format TEXT,
                mtime FLOAT,
                size INTEGER
            );

            CREATE UNIQUE INDEX IF NOT EXISTS index_files_path
                ON files (path);

            CREATE TABLE IF NOT EXISTS nuts (
                nut_id INTEGER PRIMARY KEY,
                file_id INTEGER,
                file_segment INTEGER,
                file_element INTEGER,
                kind_codes_id INTEGER,
                tmin_seconds INTEGER,
                tmin_offset FLOAT,
                tmax_seconds INTEGER,
                tmax_offset FLOAT,
                deltat FLOAT,
                kscale INTEGER
            );

            CREATE UNIQUE INDEX IF NOT EXISTS index_nuts_file_element
                ON nuts (file_id, file_segment, file_element);

            CREATE INDEX IF NOT EXISTS index_nuts_file_id
                ON nuts (file_id);

            CREATE TABLE IF NOT EXISTS kind_codes (
                kind_codes_id INTEGER PRIMARY KEY,
                kind TEXT,
                codes TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS index_kind_codes
                ON kind_codes (kind, codes);

            CREATE TABLE IF NOT EXISTS kind_codes_count (
                kind_codes_id INTEGER PRIMARY KEY,
                count INTEGER
            );

            CREATE TRIGGER IF NOT EXISTS delete_nuts_on_delete_file
            BEFORE DELETE ON files FOR EACH ROW
            BEGIN
                DELETE FROM nuts WHERE file_id == old.file_id;
            END;

            CREATE TRIGGER IF NOT EXISTS delete_nuts_on_update_file
            BEFORE UPDATE ON files FOR EACH ROW
            BEGIN
                DELETE FROM nuts WHERE file_id == old.file_id;
            END;

            CREATE TRIGGER IF NOT EXISTS increment_kind_codes
            BEFORE INSERT ON nuts FOR EACH ROW
            BEGIN
                INSERT OR IGNORE INTO kind_codes_count
                VALUES (new.kind_codes_id, 0);
                UPDATE kind_codes_count
                SET count = count + 1
                WHERE kind_codes_id == new.kind_codes_id;
            END;

            CREATE TRIGGER IF NOT EXISTS decrement_kind_codes
            BEFORE DELETE ON nuts FOR EACH ROW
            BEGIN
                UPDATE kind_codes_count
                SET count = count - 1
                WHERE kind_codes_id == old.kind_codes_id;
            END;
            ",
        )?;
        Ok(())
    }

    /// Path this database was opened at (`:memory:` for ephemeral ones).
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database connection poisoned")
    }

    /// Open the deferred-commit transaction if none is pending.
    fn begin_write(&self, conn: &Connection) -> crate::Result<()> {
        if !self.need_commit.load(Ordering::Acquire) {
            conn.execute_batch("BEGIN")?;
            self.need_commit.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Flush pending writes. Idempotent when clean.
    pub fn commit(&self) -> crate::Result<()> {
        let conn = self.conn();
        if self.need_commit.load(Ordering::Acquire) {
            conn.execute_batch("COMMIT")?;
            self.need_commit.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Bulk-insert nuts into the index.
    ///
    /// For each owning file the row is inserted-or-ignored and its
    /// `(format, mtime, size)` updated; the update trigger drops any
    /// previously indexed nuts of that file, so a re-dig replaces the
    /// file's inventory. Commit is deferred.
    pub fn dig(&self, nuts: &[Nut]) -> crate::Result<()> {
        if nuts.is_empty() {
            return Ok(());
        }

        let mut files: HashMap<&str, (Option<&str>, Option<f64>, Option<i64>)> = HashMap::new();
        let mut kind_codes: HashSet<(&'static str, &str)> = HashSet::new();
        for nut in nuts {
            files.insert(
                nut.file_path.as_deref().unwrap_or(""),
                (nut.file_format.as_deref(), nut.file_mtime, nut.file_size),
            );
            kind_codes.insert((nut.kind.as_str(), nut.codes.as_str()));
        }

        let conn = self.conn();
        self.begin_write(&conn)?;

        {
            let mut insert_file =
                conn.prepare_cached("INSERT OR IGNORE INTO files VALUES (NULL, ?1, ?2, ?3, ?4)")?;
            let mut update_file = conn.prepare_cached(
                "UPDATE files SET format = ?1, mtime = ?2, size = ?3 WHERE path == ?4",
            )?;
            for (path, (format, mtime, size)) in &files {
                insert_file.execute(params![path, format, mtime, size])?;
                update_file.execute(params![format, mtime, size, path])?;
            }

            let mut insert_kind_codes =
                conn.prepare_cached("INSERT OR IGNORE INTO kind_codes VALUES (NULL, ?1, ?2)")?;
            for (kind, codes) in &kind_codes {
                insert_kind_codes.execute(params![kind, codes])?;
            }

            let mut insert_nut = conn.prepare_cached(
                "INSERT INTO nuts VALUES (
                    NULL,
                    (SELECT file_id FROM files WHERE path == ?1),
                    ?2, ?3,
                    (SELECT kind_codes_id FROM kind_codes
                     WHERE kind == ?4 AND codes == ?5),
                    ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for nut in nuts {
                insert_nut.execute(params![
                    nut.file_path.as_deref().unwrap_or(""),
                    nut.file_segment,
                    nut.file_element,
                    nut.kind.as_str(),
                    nut.codes,
                    nut.tmin_seconds,
                    nut.tmin_offset,
                    nut.tmax_seconds,
                    nut.tmax_offset,
                    nut.deltat,
                    nut.kscale(),
                ])?;
            }
        }

        Ok(())
    }

    /// All nuts currently indexed for a single path.
    pub fn undig(&self, path: &str) -> crate::Result<Vec<Nut>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT
                files.path,
                files.format,
                files.mtime,
                files.size,
                nuts.file_segment,
                nuts.file_element,
                kind_codes.kind,
                kind_codes.codes,
                nuts.tmin_seconds,
                nuts.tmin_offset,
                nuts.tmax_seconds,
                nuts.tmax_offset,
                nuts.deltat
            FROM files
            INNER JOIN nuts
                ON files.file_id == nuts.file_id
            INNER JOIN kind_codes
                ON nuts.kind_codes_id == kind_codes.kind_codes_id
            WHERE files.path == ?1",
        )?;

        let nuts = stmt
            .query_map(params![path], Nut::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nuts)
    }

    /// Content inventory of every indexed file, grouped by file, in
    /// file-id order.
    pub fn undig_all(&self) -> crate::Result<Vec<(String, Vec<Nut>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT
                files.path,
                files.format,
                files.mtime,
                files.size,
                nuts.file_segment,
                nuts.file_element,
                kind_codes.kind,
                kind_codes.codes,
                nuts.tmin_seconds,
                nuts.tmin_offset,
                nuts.tmax_seconds,
                nuts.tmax_offset,
                nuts.deltat
            FROM files
            INNER JOIN nuts
                ON files.file_id == nuts.file_id
            INNER JOIN kind_codes
                ON nuts.kind_codes_id == kind_codes.kind_codes_id
            ORDER BY files.file_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let path: String = row.get(0)?;
                Ok((path, Nut::from_row(row)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(group_by_path(rows))
    }

    /// Like [`Database::undig_all`], restricted to the given paths.
    pub fn undig_many<S: AsRef<str>>(
        self: &Arc<Self>,
        paths: &[S],
    ) -> crate::Result<Vec<(String, Vec<Nut>)>> {
        let selection = self.new_selection(paths, 0)?;
        selection.undig_grouped(false)
    }

    /// New transient selection on this database, pre-filled with `paths`.
    pub fn new_selection<S: AsRef<str>>(
        self: &Arc<Self>,
        paths: &[S],
        state: i64,
    ) -> crate::Result<Selection> {
        let selection = Selection::new(Some(self.clone()), None)?;
        if !paths.is_empty() {
            selection.add(paths, state)?;
        }
        Ok(selection)
    }

    /// Delete the file row; triggers cascade to its nuts and the counts.
    pub fn remove(&self, path: &str) -> crate::Result<()> {
        let conn = self.conn();
        self.begin_write(&conn)?;
        conn.execute("DELETE FROM files WHERE path == ?1", params![path])?;
        Ok(())
    }

    /// Null the file's `(format, mtime, size)` without removing the row;
    /// the update trigger drops its nuts. Signals "previously known, now
    /// stale".
    pub fn reset(&self, path: &str) -> crate::Result<()> {
        let conn = self.conn();
        self.begin_write(&conn)?;
        conn.execute(
            "UPDATE files SET format = NULL, mtime = NULL, size = NULL WHERE path == ?1",
            params![path],
        )?;
        Ok(())
    }

    /// Resolve a nut's payload from the database alone. Payloads are not
    /// stored in the current schema, so this always comes back empty.
    pub fn undig_content(&self, _nut: &Nut) -> Option<Content> {
        None
    }

    pub(crate) fn counts_for_table(
        &self,
        kind: Option<Kind>,
        table: &str,
    ) -> crate::Result<Vec<((Kind, Vec<String>), i64)>> {
        let filter = if kind.is_some() {
            "AND kind_codes.kind == ?1"
        } else {
            ""
        };
        let sql = format!(
            "SELECT kind_codes.kind, kind_codes.codes, {table}.count
             FROM {table}
             INNER JOIN kind_codes
                 ON {table}.kind_codes_id == kind_codes.kind_codes_id
             WHERE {table}.count > 0 {filter}"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            let kind_str: String = row.get(0)?;
            let codes: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok((kind_str, codes, count))
        };
        let rows = match kind {
            Some(kind) => stmt
                .query_map(params![kind.as_str()], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        Ok(rows
            .into_iter()
            .filter_map(|(kind_str, codes, count)| {
                Kind::parse(&kind_str).map(|kind| ((kind, split_codes(&codes)), count))
            })
            .collect())
    }

    pub(crate) fn codes_for_table(
        &self,
        kind: Option<Kind>,
        table: &str,
    ) -> crate::Result<Vec<Vec<String>>> {
        let filter = if kind.is_some() {
            "AND kind_codes.kind == ?1"
        } else {
            ""
        };
        let sql = format!(
            "SELECT DISTINCT kind_codes.codes
             FROM {table}
             INNER JOIN kind_codes
                 ON {table}.kind_codes_id == kind_codes.kind_codes_id
             WHERE {table}.count > 0 {filter}
             ORDER BY kind_codes.codes"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| row.get::<_, String>(0);
        let rows = match kind {
            Some(kind) => stmt
                .query_map(params![kind.as_str()], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        Ok(rows.iter().map(|codes| split_codes(codes)).collect())
    }

    pub(crate) fn kinds_for_table(
        &self,
        codes: Option<&[String]>,
        table: &str,
    ) -> crate::Result<Vec<Kind>> {
        let filter = if codes.is_some() {
            "AND kind_codes.codes == ?1"
        } else {
            ""
        };
        let sql = format!(
            "SELECT DISTINCT kind_codes.kind
             FROM {table}
             INNER JOIN kind_codes
                 ON {table}.kind_codes_id == kind_codes.kind_codes_id
             WHERE {table}.count > 0 {filter}
             ORDER BY kind_codes.kind"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| row.get::<_, String>(0);
        let rows = match codes {
            Some(codes) => stmt
                .query_map(params![crate::model::join_codes(codes)], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        Ok(rows.iter().filter_map(|s| Kind::parse(s)).collect())
    }

    /// Content types with live nuts in the whole index.
    pub fn iter_kinds(
        &self,
        codes: Option<&[String]>,
    ) -> crate::Result<impl Iterator<Item = Kind>> {
        Ok(self
            .kinds_for_table(codes, "kind_codes_count")?
            .into_iter())
    }

    /// Identifier code tuples with live nuts in the whole index.
    pub fn iter_codes(
        &self,
        kind: Option<Kind>,
    ) -> crate::Result<impl Iterator<Item = Vec<String>>> {
        Ok(self.codes_for_table(kind, "kind_codes_count")?.into_iter())
    }

    /// `((kind, codes), count)` for every live combination in the index.
    pub fn iter_counts(
        &self,
        kind: Option<Kind>,
    ) -> crate::Result<impl Iterator<Item = ((Kind, Vec<String>), i64)>> {
        Ok(self.counts_for_table(kind, "kind_codes_count")?.into_iter())
    }

    pub fn get_kinds(&self, codes: Option<&[String]>) -> crate::Result<Vec<Kind>> {
        self.kinds_for_table(codes, "kind_codes_count")
    }

    pub fn get_codes(&self, kind: Option<Kind>) -> crate::Result<Vec<Vec<String>>> {
        self.codes_for_table(kind, "kind_codes_count")
    }

    pub fn get_counts(
        &self,
        kind: Option<Kind>,
    ) -> crate::Result<BTreeMap<Kind, BTreeMap<Vec<String>, i64>>> {
        let mut by_kind: BTreeMap<Kind, BTreeMap<Vec<String>, i64>> = BTreeMap::new();
        for ((k, codes), count) in self.counts_for_table(kind, "kind_codes_count")? {
            by_kind.entry(k).or_default().insert(codes, count);
        }
        Ok(by_kind)
    }

    pub fn get_nfiles(&self) -> crate::Result<i64> {
        let conn = self.conn();
        let n = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn get_nnuts(&self) -> crate::Result<i64> {
        let conn = self.conn();
        let n = conn.query_row("SELECT COUNT(*) FROM nuts", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn get_total_size(&self) -> crate::Result<Option<i64>> {
        let conn = self.conn();
        let total = conn.query_row("SELECT SUM(files.size) FROM files", [], |row| row.get(0))?;
        Ok(total)
    }

    pub fn get_stats(&self) -> crate::Result<DatabaseStats> {
        Ok(DatabaseStats {
            nfiles: self.get_nfiles()?,
            nnuts: self.get_nnuts()?,
            kinds: self.get_kinds(None)?,
            codes: self.get_codes(None)?,
            total_size: self.get_total_size()?,
            counts: self
                .counts_for_table(None, "kind_codes_count")?
                .into_iter()
                .map(|((kind, codes), count)| CountEntry { kind, codes, count })
                .collect(),
        })
    }

}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(error) = self.commit() {
            tracing::warn!(path = %self.path.display(), %error, "commit on close failed");
        }
    }
}

/// Group `(path, nut)` rows, already ordered by file, into
/// `(path, nuts)` tuples.
pub(crate) fn group_by_path(rows: Vec<(String, Nut)>) -> Vec<(String, Vec<Nut>)> {
    let mut groups: Vec<(String, Vec<Nut>)> = Vec::new();
    for (path, nut) in rows {
        match groups.last_mut() {
            Some((last_path, nuts)) if *last_path == path => nuts.push(nut),
            _ => groups.push((path, vec![nut])),
        }
    }
    groups
}
