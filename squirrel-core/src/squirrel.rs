//! Prompt, lazy, indexing, caching, dynamic dataset access: a selection
//! extended with its own nut projection and population counts.

use crate::client::{Constraint, Source};
use crate::database::{CountEntry, Database};
use crate::io::{iload_selection, LoadOptions};
use crate::model::{time_lt, tsplit, Kind, Nut, TSCALE_EDGES};
use crate::selection::Selection;
use rusqlite::{params_from_iter, types::Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Options for [`Squirrel::add_with`].
#[derive(Debug, Clone)]
pub struct AddOptions {
    /// Restrict the content kinds made available through this selection.
    pub kinds: Option<Vec<Kind>>,
    /// Format tag, or `None` for autodetection.
    pub format: Option<String>,
    /// Pessimistic revalidation of known files against their on-disk
    /// stats.
    pub check: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            kinds: None,
            format: None,
            check: true,
        }
    }
}

/// Statistics about contents available through a squirrel selection.
#[derive(Debug, Clone, Serialize)]
pub struct SquirrelStats {
    pub nfiles: i64,
    pub nnuts: i64,
    pub kinds: Vec<Kind>,
    pub codes: Vec<Vec<String>>,
    pub total_size: Option<i64>,
    pub counts: Vec<CountEntry>,
    pub tmin: Option<f64>,
    pub tmax: Option<f64>,
}

/// A [`Selection`] with a per-selection copy of the indexed nuts and a
/// trigger-maintained per-selection population count, answering
/// time-range and identifier questions in O(log N).
pub struct Squirrel {
    selection: Selection,
    nuts: String,
    kind_codes_count: String,
    sources: Vec<Box<dyn Source>>,
}

impl std::fmt::Debug for Squirrel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Squirrel")
            .field("selection", &self.selection)
            .field("nuts", &self.nuts)
            .field("kind_codes_count", &self.kind_codes_count)
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl Squirrel {
    /// Create a squirrel on the given database (`None` for the user's
    /// shared default database), optionally persistent under a name.
    pub fn new(database: Option<Arc<Database>>, persistent: Option<&str>) -> crate::Result<Self> {
        let selection = Selection::new(database, persistent)?;
        let schema = selection.schema();
        let name = selection.name().to_string();

        let squirrel = Squirrel {
            nuts: format!("{schema}.{name}_nuts"),
            kind_codes_count: format!("{schema}.{name}_kind_codes_count"),
            selection,
            sources: Vec::new(),
        };
        squirrel.init_tables(&name)?;
        Ok(squirrel)
    }

    fn init_tables(&self, name: &str) -> crate::Result<()> {
        let schema = self.selection.schema();
        // Trigger bodies use unqualified names; they resolve within the
        // schema the trigger was created in.
        let sql = format!(
            "
            CREATE TABLE IF NOT EXISTS {schema}.{name}_nuts (
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

            CREATE UNIQUE INDEX IF NOT EXISTS {schema}.{name}_nuts_file_element
                ON {name}_nuts (file_id, file_segment, file_element);

            CREATE TABLE IF NOT EXISTS {schema}.{name}_kind_codes_count (
                kind_codes_id INTEGER PRIMARY KEY,
                count INTEGER
            );

            CREATE INDEX IF NOT EXISTS {schema}.{name}_nuts_index_file_id
                ON {name}_nuts (file_id);

            CREATE INDEX IF NOT EXISTS {schema}.{name}_nuts_index_tmin_seconds
                ON {name}_nuts (tmin_seconds);

            CREATE INDEX IF NOT EXISTS {schema}.{name}_nuts_index_tmax_seconds
                ON {name}_nuts (tmax_seconds);

            CREATE INDEX IF NOT EXISTS {schema}.{name}_nuts_index_kscale
                ON {name}_nuts (kscale, tmin_seconds);

            CREATE TRIGGER IF NOT EXISTS {schema}.{name}_nuts_delete_nuts
            BEFORE DELETE ON main.files FOR EACH ROW
            BEGIN
                DELETE FROM {name}_nuts WHERE file_id == old.file_id;
            END;

            CREATE TRIGGER IF NOT EXISTS {schema}.{name}_nuts_delete_nuts2
            BEFORE UPDATE ON main.files FOR EACH ROW
            BEGIN
                DELETE FROM {name}_nuts WHERE file_id == old.file_id;
            END;

            CREATE TRIGGER IF NOT EXISTS {schema}.{name}_file_states_delete_files
            BEFORE DELETE ON {name}_file_states FOR EACH ROW
            BEGIN
                DELETE FROM {name}_nuts WHERE file_id == old.file_id;
            END;

            CREATE TRIGGER IF NOT EXISTS {schema}.{name}_nuts_inc_kind_codes
            BEFORE INSERT ON {name}_nuts FOR EACH ROW
            BEGIN
                INSERT OR IGNORE INTO {name}_kind_codes_count
                VALUES (new.kind_codes_id, 0);
                UPDATE {name}_kind_codes_count
                SET count = count + 1
                WHERE kind_codes_id == new.kind_codes_id;
            END;

            CREATE TRIGGER IF NOT EXISTS {schema}.{name}_nuts_dec_kind_codes
            BEFORE DELETE ON {name}_nuts FOR EACH ROW
            BEGIN
                UPDATE {name}_kind_codes_count
                SET count = count - 1
                WHERE kind_codes_id == old.kind_codes_id;
            END;
            "
        );

        let conn = self.selection.get_database().conn();
        conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Underlying selection.
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Database this squirrel works against.
    pub fn get_database(&self) -> &Arc<Database> {
        self.selection.get_database()
    }

    /// Add files to the selection with default options (autodetect,
    /// pessimistic revalidation, all kinds).
    pub fn add<S: AsRef<str>>(&self, paths: &[S]) -> crate::Result<()> {
        self.add_with(paths, AddOptions::default())
    }

    /// Add files: register them, bring the global index up to date for
    /// the new or modified ones, then mirror their nuts into this
    /// selection's projection.
    pub fn add_with<S: AsRef<str>>(&self, paths: &[S], options: AddOptions) -> crate::Result<()> {
        self.selection.add(paths, 0)?;
        self.load(options.format, options.check)?;
        self.update_nuts(options.kinds.as_deref())
    }

    fn load(&self, format: Option<String>, check: bool) -> crate::Result<()> {
        let options = LoadOptions {
            format,
            check,
            skip_unchanged: true,
            content: Vec::new(),
            ..LoadOptions::default()
        };
        for nut in iload_selection(&self.selection, options)? {
            nut?;
        }
        Ok(())
    }

    /// Mirror globally indexed nuts into this selection's projection for
    /// every file whose state is not yet 2, then mark all files as
    /// projected. Idempotent: a second call adds nothing.
    fn update_nuts(&self, kinds: Option<&[Kind]>) -> crate::Result<()> {
        let file_states = self.selection.file_states_table();
        let mut args: Vec<Value> = Vec::new();
        let kinds_filter = match kinds {
            Some(kinds) if !kinds.is_empty() => {
                args.extend(
                    kinds
                        .iter()
                        .map(|kind| Value::Text(kind.as_str().to_string())),
                );
                format!(
                    "AND kind_codes.kind IN ({})",
                    vec!["?"; kinds.len()].join(", ")
                )
            }
            _ => String::new(),
        };

        let conn = self.get_database().conn();
        conn.execute(
            &format!(
                "INSERT INTO {nuts}
                 SELECT nuts.* FROM {file_states}
                 INNER JOIN nuts
                     ON {file_states}.file_id == nuts.file_id
                 INNER JOIN kind_codes
                     ON nuts.kind_codes_id == kind_codes.kind_codes_id
                 WHERE {file_states}.file_state != 2
                 {kinds_filter}",
                nuts = self.nuts,
            ),
            params_from_iter(args),
        )?;

        conn.execute(
            &format!("UPDATE {file_states} SET file_state = 2"),
            [],
        )?;
        Ok(())
    }

    /// Remove files from the selection; triggers cascade to the
    /// projected nuts and the per-selection counts.
    pub fn remove<S: AsRef<str>>(&self, paths: &[S]) -> crate::Result<()> {
        self.selection.remove(paths)
    }

    /// Register a remote source feeding local files into this selection.
    pub fn add_source(&mut self, source: Box<dyn Source>) {
        self.sources.push(source);
    }

    /// Let every registered source bring its local channel inventory up
    /// to date for `constraint`, then add the resulting files.
    pub fn update_channel_inventory(&mut self, constraint: &Constraint) -> crate::Result<()> {
        let mut sources = std::mem::take(&mut self.sources);
        let result = (|| {
            for source in &mut sources {
                source.update_channel_inventory(constraint)?;
                for path in source.channel_file_paths(constraint) {
                    self.add(&[path.to_string_lossy().into_owned()])?;
                }
            }
            Ok(())
        })();
        self.sources = sources;
        result
    }

    const NUT_COLUMNS: &'static str = "files.path, files.format, files.mtime, files.size";

    fn span_sql(&self, where_clause: &str) -> String {
        format!(
            "SELECT
                {columns},
                {nuts}.file_segment,
                {nuts}.file_element,
                kind_codes.kind,
                kind_codes.codes,
                {nuts}.tmin_seconds,
                {nuts}.tmin_offset,
                {nuts}.tmax_seconds,
                {nuts}.tmax_offset,
                {nuts}.deltat
            FROM files
            INNER JOIN {nuts}
                ON files.file_id == {nuts}.file_id
            INNER JOIN kind_codes
                ON {nuts}.kind_codes_id == kind_codes.kind_codes_id
            WHERE {where_clause}",
            columns = Self::NUT_COLUMNS,
            nuts = self.nuts,
        )
    }

    /// Nuts intersecting the half-open interval `[tmin, tmax)`.
    ///
    /// Each duration class is probed through the `(kscale, tmin_seconds)`
    /// index: a class-k nut can only intersect when its start lies in
    /// `[T0 - E[k] - 1, T1 + 1]`; the overflow class is bounded above
    /// only. The exact half-open check runs on the split timestamps of
    /// the returned candidates. Output order follows the class
    /// disjunction, not time.
    pub fn undig_span(&self, tmin: f64, tmax: f64) -> crate::Result<Vec<Nut>> {
        let (tmin_seconds, tmin_offset) = tsplit(tmin);
        let (tmax_seconds, tmax_offset) = tsplit(tmax);

        let mut conditions = Vec::new();
        let mut args: Vec<i64> = Vec::new();
        for kscale in 0..=TSCALE_EDGES.len() {
            if kscale < TSCALE_EDGES.len() {
                let tscale = TSCALE_EDGES[kscale];
                conditions.push(format!(
                    "({nuts}.kscale == ?
                        AND {nuts}.tmin_seconds BETWEEN ? AND ?)",
                    nuts = self.nuts
                ));
                args.extend([kscale as i64, tmin_seconds - tscale - 1, tmax_seconds + 1]);
            } else {
                conditions.push(format!(
                    "({nuts}.kscale == ?
                        AND {nuts}.tmin_seconds <= ?)",
                    nuts = self.nuts
                ));
                args.extend([kscale as i64, tmax_seconds + 1]);
            }
        }

        let sql = self.span_sql(&format!(
            "({}) AND {nuts}.tmax_seconds >= ?",
            conditions.join(" OR "),
            nuts = self.nuts,
        ));
        args.push(tmin_seconds);

        let conn = self.get_database().conn();
        let mut stmt = conn.prepare(&sql)?;
        let nuts = stmt
            .query_map(params_from_iter(args), Nut::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(nuts
            .into_iter()
            .filter(|nut| {
                time_lt(nut.tmin_seconds, nut.tmin_offset, tmax_seconds, tmax_offset)
                    && time_lt(tmin_seconds, tmin_offset, nut.tmax_seconds, nut.tmax_offset)
            })
            .collect())
    }

    /// Reference implementation of [`Squirrel::undig_span`] scanning both
    /// interval endpoints; kept for equivalence testing.
    pub fn undig_span_naive(&self, tmin: f64, tmax: f64) -> crate::Result<Vec<Nut>> {
        let (tmin_seconds, tmin_offset) = tsplit(tmin);
        let (tmax_seconds, tmax_offset) = tsplit(tmax);

        let sql = self.span_sql(&format!(
            "{nuts}.tmax_seconds >= ? AND {nuts}.tmin_seconds <= ?",
            nuts = self.nuts
        ));

        let conn = self.get_database().conn();
        let mut stmt = conn.prepare(&sql)?;
        let nuts = stmt
            .query_map(
                params_from_iter([tmin_seconds, tmax_seconds + 1]),
                Nut::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(nuts
            .into_iter()
            .filter(|nut| {
                time_lt(nut.tmin_seconds, nut.tmin_offset, tmax_seconds, tmax_offset)
                    && time_lt(tmin_seconds, tmin_offset, nut.tmax_seconds, nut.tmax_offset)
            })
            .collect())
    }

    /// Time interval over all content in the selection. O(1) in the
    /// number of nuts.
    pub fn time_span(&self) -> crate::Result<(Option<f64>, Option<f64>)> {
        let conn = self.get_database().conn();
        let tmin: Option<f64> = conn.query_row(
            &format!(
                "SELECT MIN(tmin_seconds + tmin_offset)
                 FROM {nuts} WHERE
                 tmin_seconds == (SELECT MIN(tmin_seconds) FROM {nuts})",
                nuts = self.nuts
            ),
            [],
            |row| row.get(0),
        )?;
        let tmax: Option<f64> = conn.query_row(
            &format!(
                "SELECT MAX(tmax_seconds + tmax_offset)
                 FROM {nuts} WHERE
                 tmax_seconds == (SELECT MAX(tmax_seconds) FROM {nuts})",
                nuts = self.nuts
            ),
            [],
            |row| row.get(0),
        )?;
        Ok((tmin, tmax))
    }

    /// Content types available in the selection. O(1) in the number of
    /// nuts.
    pub fn iter_kinds(
        &self,
        codes: Option<&[String]>,
    ) -> crate::Result<impl Iterator<Item = Kind>> {
        Ok(self
            .get_database()
            .kinds_for_table(codes, &self.kind_codes_count)?
            .into_iter())
    }

    /// Identifier code tuples available in the selection. O(1) in the
    /// number of nuts.
    pub fn iter_codes(
        &self,
        kind: Option<Kind>,
    ) -> crate::Result<impl Iterator<Item = Vec<String>>> {
        Ok(self
            .get_database()
            .codes_for_table(kind, &self.kind_codes_count)?
            .into_iter())
    }

    /// Occurrence counts for every `(kind, codes)` combination in the
    /// selection. O(1) in the number of nuts.
    pub fn iter_counts(
        &self,
        kind: Option<Kind>,
    ) -> crate::Result<impl Iterator<Item = ((Kind, Vec<String>), i64)>> {
        Ok(self
            .get_database()
            .counts_for_table(kind, &self.kind_codes_count)?
            .into_iter())
    }

    pub fn get_kinds(&self, codes: Option<&[String]>) -> crate::Result<Vec<Kind>> {
        self.get_database()
            .kinds_for_table(codes, &self.kind_codes_count)
    }

    pub fn get_codes(&self, kind: Option<Kind>) -> crate::Result<Vec<Vec<String>>> {
        self.get_database()
            .codes_for_table(kind, &self.kind_codes_count)
    }

    pub fn get_counts(
        &self,
        kind: Option<Kind>,
    ) -> crate::Result<BTreeMap<Kind, BTreeMap<Vec<String>, i64>>> {
        let mut by_kind: BTreeMap<Kind, BTreeMap<Vec<String>, i64>> = BTreeMap::new();
        for ((k, codes), count) in self
            .get_database()
            .counts_for_table(kind, &self.kind_codes_count)?
        {
            by_kind.entry(k).or_default().insert(codes, count);
        }
        Ok(by_kind)
    }

    /// Number of files in the selection.
    pub fn get_nfiles(&self) -> crate::Result<i64> {
        let conn = self.get_database().conn();
        let n = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.selection.file_states_table()),
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Number of nuts in the selection.
    pub fn get_nnuts(&self) -> crate::Result<i64> {
        let conn = self.get_database().conn();
        let n = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.nuts),
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Aggregated size of the files in the selection.
    pub fn get_total_size(&self) -> crate::Result<Option<i64>> {
        let conn = self.get_database().conn();
        let total = conn.query_row(
            &format!(
                "SELECT SUM(files.size) FROM {file_states}
                 INNER JOIN files
                     ON {file_states}.file_id == files.file_id",
                file_states = self.selection.file_states_table(),
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn get_stats(&self) -> crate::Result<SquirrelStats> {
        let (tmin, tmax) = self.time_span()?;
        Ok(SquirrelStats {
            nfiles: self.get_nfiles()?,
            nnuts: self.get_nnuts()?,
            kinds: self.get_kinds(None)?,
            codes: self.get_codes(None)?,
            total_size: self.get_total_size()?,
            counts: self
                .get_database()
                .counts_for_table(None, &self.kind_codes_count)?
                .into_iter()
                .map(|((kind, codes), count)| CountEntry { kind, codes, count })
                .collect(),
            tmin,
            tmax,
        })
    }

    fn drop_tables(&self) -> crate::Result<()> {
        let schema = self.selection.schema();
        let name = self.selection.name();
        let conn = self.get_database().conn();
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS {schema}.{name}_nuts_delete_nuts;
             DROP TRIGGER IF EXISTS {schema}.{name}_nuts_delete_nuts2;
             DROP TRIGGER IF EXISTS {schema}.{name}_file_states_delete_files;
             DROP TRIGGER IF EXISTS {schema}.{name}_nuts_inc_kind_codes;
             DROP TRIGGER IF EXISTS {schema}.{name}_nuts_dec_kind_codes;
             DROP TABLE IF EXISTS {schema}.{name}_nuts;
             DROP TABLE IF EXISTS {schema}.{name}_kind_codes_count;"
        ))?;
        Ok(())
    }
}

impl Drop for Squirrel {
    fn drop(&mut self) {
        if !self.selection.is_persistent() {
            if let Err(error) = self.drop_tables() {
                tracing::warn!(%error, "squirrel teardown failed");
            }
        }
    }
}
