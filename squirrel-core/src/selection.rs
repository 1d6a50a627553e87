//! Database backed file selections with per-file state.

use crate::database::{get_database, Database};
use crate::model::Nut;
use once_cell::sync::Lazy;
use rusqlite::params;
use std::sync::{Arc, Mutex};

static NAME_COUNTER: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

/// Unique transient table name stem of the form `pid_counter`.
fn make_unique_name() -> String {
    let mut counter = NAME_COUNTER.lock().expect("name counter poisoned");
    let name = format!("{}_{}", std::process::id(), *counter);
    *counter += 1;
    name
}

fn is_valid_selection_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Named subset of files known to a database, with per-file state.
///
/// Transient selections keep their state map in the connection-local
/// `temp` schema and drop it when the selection goes away. Persistent
/// selections live in the durable schema, survive the process, and are
/// visible to other openers of the same database.
#[derive(Debug)]
pub struct Selection {
    database: Arc<Database>,
    name: String,
    schema: &'static str,
    persistent: bool,
    file_states: String,
    bulkinsert: String,
}

impl Selection {
    /// Create a selection.
    ///
    /// `database` of `None` resolves to the user's shared default
    /// database; persistent selections must name their database
    /// explicitly and their name must match `[A-Za-z_][A-Za-z0-9_]*`.
    pub fn new(database: Option<Arc<Database>>, persistent: Option<&str>) -> crate::Result<Self> {
        if database.is_none() && persistent.is_some() {
            return Err(crate::SquirrelError::PersistentRequiresDatabase);
        }

        let database = match database {
            Some(database) => database,
            None => get_database(None)?,
        };

        let (name, is_persistent) = match persistent {
            Some(persistent) => {
                if !is_valid_selection_name(persistent) {
                    return Err(crate::SquirrelError::InvalidSelectionName(
                        persistent.to_string(),
                    ));
                }
                (format!("psel_{persistent}"), true)
            }
            None => (format!("sel_{}", make_unique_name()), false),
        };

        let schema = if is_persistent { "main" } else { "temp" };
        let selection = Selection {
            file_states: format!("{schema}.{name}_file_states"),
            bulkinsert: format!("temp.{name}_bulkinsert"),
            database,
            name,
            schema,
            persistent: is_persistent,
        };

        let conn = selection.database.conn();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                file_id INTEGER PRIMARY KEY,
                file_state INTEGER
            )",
            selection.file_states
        ))?;
        drop(conn);

        Ok(selection)
    }

    /// Database this selection belongs to.
    pub fn get_database(&self) -> &Arc<Database> {
        &self.database
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn schema(&self) -> &'static str {
        self.schema
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub(crate) fn file_states_table(&self) -> &str {
        &self.file_states
    }

    /// Add files to the selection with the given initial state.
    ///
    /// Unknown paths are registered in the global `files` table with null
    /// content fields; paths already present in the selection keep their
    /// state. The bulk insert goes through a scratch temp table to keep
    /// the join cheap.
    pub fn add<S: AsRef<str>>(&self, paths: &[S], state: i64) -> crate::Result<()> {
        let conn = self.database.conn();

        conn.execute_batch(&format!("CREATE TEMP TABLE {} (path TEXT)", self.bulkinsert))?;

        let result = (|| -> crate::Result<()> {
            {
                let mut insert =
                    conn.prepare(&format!("INSERT INTO {} VALUES (?1)", self.bulkinsert))?;
                for path in paths {
                    insert.execute(params![path.as_ref()])?;
                }
            }

            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO files
                     SELECT NULL, path, NULL, NULL, NULL FROM {}",
                    self.bulkinsert
                ),
                [],
            )?;

            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {file_states}
                     SELECT files.file_id, ?1 FROM {bulkinsert}
                     INNER JOIN files ON {bulkinsert}.path == files.path",
                    file_states = self.file_states,
                    bulkinsert = self.bulkinsert,
                ),
                params![state],
            )?;

            Ok(())
        })();

        conn.execute_batch(&format!("DROP TABLE {}", self.bulkinsert))?;
        result
    }

    /// Remove files from the selection.
    pub fn remove<S: AsRef<str>>(&self, paths: &[S]) -> crate::Result<()> {
        let conn = self.database.conn();
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM {file_states}
             WHERE {file_states}.file_id ==
                 (SELECT files.file_id FROM files WHERE files.path == ?1)",
            file_states = self.file_states,
        ))?;
        for path in paths {
            stmt.execute(params![path.as_ref()])?;
        }
        Ok(())
    }

    /// Content inventory of the files in this selection, grouped by file
    /// in file-id order.
    ///
    /// With `skip_unchanged`, only state-0 groups are yielded, i.e. the
    /// files [`Selection::flag_unchanged`] marked as needing a (re)read.
    pub fn undig_grouped(&self, skip_unchanged: bool) -> crate::Result<Vec<(String, Vec<Nut>)>> {
        let filter = if skip_unchanged {
            format!("WHERE {}.file_state == 0", self.file_states)
        } else {
            String::new()
        };

        let sql = format!(
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
            FROM {file_states}
            LEFT OUTER JOIN files
                ON {file_states}.file_id == files.file_id
            LEFT OUTER JOIN nuts
                ON files.file_id == nuts.file_id
            LEFT OUTER JOIN kind_codes
                ON nuts.kind_codes_id == kind_codes.kind_codes_id
            {filter}
            ORDER BY {file_states}.file_id",
            file_states = self.file_states,
        );

        let conn = self.database.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let path: Option<String> = row.get(0)?;
                let format: Option<String> = row.get(1)?;
                let segment: Option<i64> = row.get(4)?;
                let nut = if format.is_some() && segment.is_some() {
                    Some(Nut::from_row(row)?)
                } else {
                    None
                };
                Ok((path, nut))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);

        let mut groups: Vec<(String, Vec<Nut>)> = Vec::new();
        for (path, nut) in rows {
            // a file row deleted from the index while still referenced
            // here has no usable path
            let Some(path) = path else { continue };
            match groups.last_mut() {
                Some((last_path, nuts)) if *last_path == path => {
                    if let Some(nut) = nut {
                        nuts.push(nut);
                    }
                }
                _ => groups.push((path, nut.into_iter().collect())),
            }
        }
        Ok(groups)
    }

    /// Demote to state 0 every file that needs a (re)read: files the
    /// index has no content for (`files.mtime IS NULL`) and, when `check`
    /// is on, files whose current on-disk stats disagree with the stored
    /// pair or whose backend fails to stat them. Files with an
    /// unrecognized format are skipped silently. Everything else keeps
    /// its state, so a subsequent `skip_unchanged` pass ignores it.
    pub fn flag_unchanged(&self, check: bool) -> crate::Result<()> {
        {
            let conn = self.database.conn();
            conn.execute(
                &format!(
                    "UPDATE {file_states}
                     SET file_state = 0
                     WHERE (
                         SELECT mtime FROM files
                         WHERE files.file_id == {file_states}.file_id) IS NULL",
                    file_states = self.file_states,
                ),
                [],
            )?;
        }

        if !check {
            return Ok(());
        }

        type FileRow = (i64, String, Option<String>, Option<f64>, Option<i64>);
        let candidates: Vec<FileRow> = {
            let conn = self.database.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT
                    files.file_id,
                    files.path,
                    files.format,
                    files.mtime,
                    files.size
                FROM {file_states}
                INNER JOIN files
                    ON {file_states}.file_id == files.file_id
                WHERE {file_states}.file_state != 0
                ORDER BY {file_states}.file_id",
                file_states = self.file_states,
            ))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut demote = Vec::new();
        for (file_id, path, format, mtime, size) in candidates {
            let Some(format) = format else { continue };
            let backend = match crate::io::get_backend(&format) {
                Ok(backend) => backend,
                Err(crate::SquirrelError::UnknownFormat(_)) => continue,
                Err(error) => return Err(error),
            };
            match backend.get_stats(&path) {
                Ok(stats) => {
                    if (mtime, size) != (Some(stats.mtime), Some(stats.size)) {
                        demote.push(file_id);
                    }
                }
                Err(error) if error.is_file_load() => demote.push(file_id),
                Err(error) => return Err(error),
            }
        }

        let conn = self.database.conn();
        let mut stmt = conn.prepare(&format!(
            "UPDATE {} SET file_state = 0 WHERE file_id == ?1",
            self.file_states
        ))?;
        for file_id in demote {
            stmt.execute(params![file_id])?;
        }

        Ok(())
    }

    pub(crate) fn delete_tables(&self) -> crate::Result<()> {
        let conn = self.database.conn();
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.file_states))?;
        Ok(())
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        let result = if self.persistent {
            self.database.commit()
        } else {
            self.delete_tables()
        };
        if let Err(error) = result {
            tracing::warn!(name = %self.name, %error, "selection teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn test_add_is_idempotent() {
        let database = Database::new_in_memory().unwrap();
        let selection = Selection::new(Some(database.clone()), None).unwrap();

        selection.add(&["x", "y"], 0).unwrap();
        selection.add(&["y", "z"], 1).unwrap();

        let groups = selection.undig_grouped(false).unwrap();
        let paths: Vec<&str> = groups.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(paths, vec!["x", "y", "z"]);

        // y kept its original state 0 and is still iterated with
        // skip_unchanged
        let groups = selection.undig_grouped(true).unwrap();
        let paths: Vec<&str> = groups.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(paths, vec!["x", "y"]);
    }

    #[test]
    fn test_remove() {
        let database = Database::new_in_memory().unwrap();
        let selection = Selection::new(Some(database.clone()), None).unwrap();
        selection.add(&["x", "y"], 0).unwrap();
        selection.remove(&["x"]).unwrap();

        let groups = selection.undig_grouped(false).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, "y");
    }

    #[test]
    fn test_flag_unchanged_demotes_unknown_files() {
        let database = Database::new_in_memory().unwrap();
        let selection = Selection::new(Some(database.clone()), None).unwrap();
        selection.add(&["nowhere/unknown"], 1).unwrap();

        // never ingested: mtime is NULL, so the file must be read
        selection.flag_unchanged(true).unwrap();
        let groups = selection.undig_grouped(true).unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_persistent_requires_database() {
        let error = Selection::new(None, Some("my_selection")).unwrap_err();
        assert!(matches!(
            error,
            crate::SquirrelError::PersistentRequiresDatabase
        ));
    }

    #[test]
    fn test_persistent_name_validation() {
        let database = Database::new_in_memory().unwrap();
        for bad in ["", "1abc", "with space", "dash-ed", "dot.ted"] {
            let error = Selection::new(Some(database.clone()), Some(bad)).unwrap_err();
            assert!(
                matches!(error, crate::SquirrelError::InvalidSelectionName(_)),
                "{bad:?} should be rejected"
            );
        }
        for good in ["my_selection", "_x", "Sel99"] {
            Selection::new(Some(database.clone()), Some(good)).unwrap();
        }
    }

    #[test]
    fn test_transient_tables_dropped() {
        let database = Database::new_in_memory().unwrap();
        let name;
        {
            let selection = Selection::new(Some(database.clone()), None).unwrap();
            selection.add(&["x"], 0).unwrap();
            name = selection.file_states.clone();
        }
        let conn = database.conn();
        let result: rusqlite::Result<i64> =
            conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |row| {
                row.get(0)
            });
        assert!(result.is_err());
    }
}
