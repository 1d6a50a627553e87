//! File ingest: format detection, the backend registry, and the `iload`
//! pipeline feeding nuts into the meta-information index.

pub mod backends;

use crate::database::Database;
use crate::error::SquirrelError;
use crate::model::{Kind, Nut};
use crate::selection::Selection;
use backends::Backend;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Modification time and size of a file as seen by a backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileStats {
    pub mtime: f64,
    pub size: i64,
}

/// Stat a regular file on disk.
pub fn get_stats(path: &str) -> crate::Result<FileStats> {
    let meta = std::fs::metadata(path).map_err(|e| SquirrelError::file_load(path, e))?;
    let mtime = meta
        .modified()
        .map_err(|e| SquirrelError::file_load(path, e))?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(FileStats {
        mtime,
        size: meta.len() as i64,
    })
}

/// All backends in registration order. Detection asks each in turn; a
/// format tag is served by its earliest-registered provider.
static BACKENDS: Lazy<Vec<Box<dyn Backend>>> = Lazy::new(|| {
    vec![
        Box::new(backends::mseed::Mseed),
        Box::new(backends::sac::Sac),
        Box::new(backends::stationxml::StationXml),
        Box::new(backends::textfiles::TextStations),
        Box::new(backends::virt::Virtual),
    ]
});

static FORMAT_PROVIDERS: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    let mut providers = HashMap::new();
    for (index, backend) in BACKENDS.iter().enumerate() {
        for format in backend.provided_formats() {
            providers.entry(*format).or_insert(index);
        }
    }
    providers
});

/// Backend serving the given format tag.
pub fn get_backend(format: &str) -> crate::Result<&'static dyn Backend> {
    FORMAT_PROVIDERS
        .get(format)
        .map(|&index| BACKENDS[index].as_ref())
        .ok_or_else(|| SquirrelError::UnknownFormat(format.to_string()))
}

/// Determine the file format from the first 512 bytes.
///
/// Paths with the `virtual:` prefix short-circuit to the virtual backend.
pub fn detect_format(path: &str) -> crate::Result<&'static str> {
    if path.starts_with("virtual:") {
        return Ok("virtual");
    }

    let mut first512 = Vec::with_capacity(512);
    std::fs::File::open(path)
        .and_then(|file| file.take(512).read_to_end(&mut first512))
        .map_err(|_| SquirrelError::FormatDetectionFailed(path.into()))?;

    for backend in BACKENDS.iter() {
        if let Some(format) = backend.detect(&first512) {
            return Ok(format);
        }
    }

    Err(SquirrelError::FormatDetectionFailed(path.into()))
}

/// Whether the backend's current stats for the nut's file disagree with
/// the stats recorded at ingest.
pub fn file_modified(nut: &Nut) -> crate::Result<bool> {
    let (Some(format), Some(path)) = (nut.file_format.as_deref(), nut.file_path.as_deref()) else {
        return Ok(true);
    };
    let stats = get_backend(format)?.get_stats(path)?;
    Ok(nut.file_mtime != Some(stats.mtime) || nut.file_size != Some(stats.size))
}

/// Options for the ingest pipeline.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Restrict to one segment; only legal when loading a single file.
    pub segment: Option<i64>,
    /// Format tag, or `None` for autodetection.
    pub format: Option<String>,
    /// Pessimistic revalidation: distrust cached nuts whose file stats
    /// changed.
    pub check: bool,
    /// Flush the store periodically and once at the end.
    pub commit: bool,
    /// Only yield nuts from files newly ingested or re-ingested in this
    /// call. Requires a database.
    pub skip_unchanged: bool,
    /// Content kinds to materialize payloads for.
    pub content: Vec<Kind>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            segment: None,
            format: None,
            check: true,
            commit: true,
            skip_unchanged: false,
            content: Kind::ALL.to_vec(),
        }
    }
}

/// Iteratively load content or index/reindex meta-information from files.
///
/// Yields one nut per piece of information found in the given files,
/// serving from the database cache where the cached inventory is still
/// valid. Per-file load errors do not poison the batch: the affected file
/// is reset in the store, a warning is logged and iteration continues.
pub fn iload<S: AsRef<str>>(
    paths: &[S],
    database: Option<Arc<Database>>,
    options: LoadOptions,
) -> crate::Result<Loader> {
    if options.segment.is_some() && paths.len() != 1 {
        return Err(SquirrelError::SegmentRequiresSingleFile);
    }

    match database {
        Some(database) => {
            let selection = database.new_selection(paths, 1)?;
            let groups = grouped(&selection, &options)?;
            Ok(Loader::new(Some(database), Some(selection), groups, options))
        }
        None => {
            if options.skip_unchanged {
                return Err(SquirrelError::SkipUnchangedRequiresDatabase);
            }
            let groups = paths
                .iter()
                .map(|path| (path.as_ref().to_string(), Vec::new()))
                .collect();
            Ok(Loader::new(None, None, groups, options))
        }
    }
}

/// Like [`iload`], over an existing selection and its database.
pub fn iload_selection(selection: &Selection, options: LoadOptions) -> crate::Result<Loader> {
    if options.segment.is_some() {
        return Err(SquirrelError::SegmentRequiresSingleFile);
    }
    let database = selection.get_database().clone();
    let groups = grouped(selection, &options)?;
    Ok(Loader::new(Some(database), None, groups, options))
}

fn grouped(
    selection: &Selection,
    options: &LoadOptions,
) -> crate::Result<Vec<(String, Vec<Nut>)>> {
    if options.skip_unchanged {
        selection.flag_unchanged(options.check)?;
        selection.undig_grouped(true)
    } else {
        selection.undig_grouped(false)
    }
}

/// Lazy ingest iterator; see [`iload`].
///
/// Yields `Result<Nut>` and fuses after the first fatal error. Abandoning
/// it mid-iteration is safe: the store keeps whatever was committed up to
/// the last periodic-commit boundary, and files are dug only after their
/// full inventory was read.
#[derive(Debug)]
pub struct Loader {
    database: Option<Arc<Database>>,
    temp_selection: Option<Selection>,
    options: LoadOptions,
    groups: std::vec::IntoIter<(String, Vec<Nut>)>,
    pending: std::vec::IntoIter<Nut>,
    n_files: usize,
    n_db: usize,
    n_load: usize,
    finished: bool,
}

impl Loader {
    fn new(
        database: Option<Arc<Database>>,
        temp_selection: Option<Selection>,
        groups: Vec<(String, Vec<Nut>)>,
        options: LoadOptions,
    ) -> Self {
        Loader {
            database,
            temp_selection,
            options,
            groups: groups.into_iter(),
            pending: Vec::new().into_iter(),
            n_files: 0,
            n_db: 0,
            n_load: 0,
            finished: false,
        }
    }

    fn finalize(&mut self) -> Option<crate::Result<Nut>> {
        self.finished = true;
        tracing::debug!(
            from_db = self.n_db,
            from_files = self.n_load,
            files = self.n_files,
            "iload finished"
        );
        if let Some(database) = &self.database {
            if self.options.commit {
                if let Err(error) = database.commit() {
                    return Some(Err(error));
                }
            }
        }
        if let Some(selection) = self.temp_selection.take() {
            drop(selection);
        }
        None
    }

    /// Per-file work with the containment rule of batch ingest: load
    /// errors reset the file and yield nothing, everything else is fatal.
    fn process_file(&mut self, path: &str, old_nuts: Vec<Nut>) -> crate::Result<Vec<Nut>> {
        match self.read_file(path, old_nuts) {
            Ok(nuts) => Ok(nuts),
            Err(error) if error.is_file_load() => {
                tracing::warn!(path, %error, "error while reading file, skipping");
                if let Some(database) = &self.database {
                    database.reset(path)?;
                }
                Ok(Vec::new())
            }
            Err(error) => Err(error),
        }
    }

    fn read_file(&mut self, path: &str, mut old_nuts: Vec<Nut>) -> crate::Result<Vec<Nut>> {
        if self.options.check && !old_nuts.is_empty() && file_modified(&old_nuts[0])? {
            old_nuts.clear();
        }

        if let Some(segment) = self.options.segment {
            old_nuts.retain(|nut| nut.file_segment == Some(segment));
        }

        if !old_nuts.is_empty() {
            // with no payloads requested, or with every payload servable
            // from the store, the cached inventory is the answer
            let db_only = self.options.content.is_empty()
                || old_nuts
                    .iter()
                    .all(|nut| self.options.content.contains(&nut.kind) && nut.content_in_db());
            if db_only {
                tracing::debug!(path, "using cached inventory");
                if let Some(database) = &self.database {
                    for nut in &mut old_nuts {
                        if self.options.content.contains(&nut.kind) {
                            nut.content = database.undig_content(nut);
                        }
                    }
                }
                self.n_db += old_nuts.len();
                return Ok(old_nuts);
            }
        }

        let format_this: String = if let Some(format) = &self.options.format {
            format.clone()
        } else {
            let mut cached = old_nuts.first().and_then(|nut| nut.file_format.clone());
            if cached.is_some() && file_modified(&old_nuts[0])? {
                cached = None;
            }
            match cached {
                Some(format) => format,
                None => detect_format(path)?.to_string(),
            }
        };

        let backend = get_backend(&format_this)?;
        let stats = backend.get_stats(path)?;

        tracing::debug!(path, format = %format_this, "reading file");
        let mut nuts = backend.iload(&format_this, path, self.options.segment, &self.options.content)?;
        for nut in &mut nuts {
            attach_file_identity(nut, path, &format_this, stats);
        }
        self.n_load += nuts.len();

        if let Some(database) = &self.database {
            if nuts != old_nuts {
                if self.options.segment.is_some() {
                    // the store must see the complete file
                    let mut full = backend.iload(&format_this, path, None, &[])?;
                    for nut in &mut full {
                        attach_file_identity(nut, path, &format_this, stats);
                    }
                    database.dig(&full)?;
                } else {
                    database.dig(&nuts)?;
                }
            }
        }

        Ok(nuts)
    }
}

fn attach_file_identity(nut: &mut Nut, path: &str, format: &str, stats: FileStats) {
    nut.file_path = Some(path.to_string());
    nut.file_format = Some(format.to_string());
    nut.file_mtime = Some(stats.mtime);
    nut.file_size = Some(stats.size);
}

impl Iterator for Loader {
    type Item = crate::Result<Nut>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(nut) = self.pending.next() {
                return Some(Ok(nut));
            }

            let Some((path, old_nuts)) = self.groups.next() else {
                return self.finalize();
            };

            self.n_files += 1;
            if let Some(database) = &self.database {
                if self.options.commit && self.n_files % 1000 == 0 {
                    if let Err(error) = database.commit() {
                        self.finished = true;
                        return Some(Err(error));
                    }
                }
            }

            match self.process_file(&path, old_nuts) {
                Ok(nuts) => self.pending = nuts.into_iter(),
                Err(error) => {
                    self.finished = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_detect_format_virtual_prefix() {
        assert_eq!(detect_format("virtual:whatever").unwrap(), "virtual");
    }

    #[test]
    fn test_detect_format_failures() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("emptyfile");
        std::fs::File::create(&empty).unwrap();
        let empty = empty.to_string_lossy().into_owned();

        assert!(matches!(
            detect_format(&empty).unwrap_err(),
            SquirrelError::FormatDetectionFailed(_)
        ));
        assert!(matches!(
            detect_format("nonexist").unwrap_err(),
            SquirrelError::FormatDetectionFailed(_)
        ));
    }

    #[test]
    fn test_unknown_format_propagates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("some.file");
        writeln!(std::fs::File::create(&path).unwrap(), "data").unwrap();
        let path = path.to_string_lossy().into_owned();

        let mut loader = iload(
            &[path],
            None,
            LoadOptions {
                format: Some("nonexist".to_string()),
                ..LoadOptions::default()
            },
        )
        .unwrap();

        let result = loader.next().unwrap();
        assert!(matches!(result, Err(SquirrelError::UnknownFormat(_))));
        assert!(loader.next().is_none());
    }

    #[test]
    fn test_segment_requires_single_file() {
        let options = LoadOptions {
            segment: Some(0),
            ..LoadOptions::default()
        };
        assert!(matches!(
            iload(&["a", "b"], None, options).unwrap_err(),
            SquirrelError::SegmentRequiresSingleFile
        ));
    }

    #[test]
    fn test_skip_unchanged_requires_database() {
        let options = LoadOptions {
            skip_unchanged: true,
            ..LoadOptions::default()
        };
        assert!(matches!(
            iload(&["a"], None, options).unwrap_err(),
            SquirrelError::SkipUnchangedRequiresDatabase
        ));
    }
}
