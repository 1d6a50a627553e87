//! Virtual backend: synthetic `virtual:` paths served from an in-memory
//! store, for tests and for injecting synthetic content.

use super::Backend;
use crate::error::SquirrelError;
use crate::io::FileStats;
use crate::model::{Kind, Nut};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub struct Virtual;

#[derive(Default)]
struct Store {
    nuts: HashMap<String, Vec<Nut>>,
    mtimes: HashMap<String, f64>,
}

static STORE: Lazy<Mutex<Store>> = Lazy::new(|| Mutex::new(Store::default()));

/// Register nuts under their `virtual:` file paths.
///
/// Nuts are kept sorted by `(segment, element)`; a duplicate pair within
/// one path is a programmer error. Every call bumps the synthetic mtime
/// of the touched paths, so revalidation notices the change.
pub fn add_nuts(nuts: Vec<Nut>) -> crate::Result<()> {
    let mut store = STORE.lock().expect("virtual store poisoned");
    let Store { nuts: by_path, mtimes } = &mut *store;

    let mut touched = HashSet::new();
    for nut in nuts {
        let path = nut.file_path.clone().unwrap_or_default();
        touched.insert(path.clone());
        by_path.entry(path).or_default().push(nut);
    }

    for path in touched {
        let entries = by_path.entry(path.clone()).or_default();
        entries.sort_by_key(|nut| (nut.file_segment, nut.file_element));

        let mut seen = HashSet::new();
        for nut in entries.iter() {
            if !seen.insert((nut.file_segment, nut.file_element)) {
                return Err(SquirrelError::UniqueKeyRequired(path));
            }
        }

        *mtimes.entry(path).or_insert(0.0) += 1.0;
    }

    Ok(())
}

/// Forget a virtual path entirely.
pub fn remove(path: &str) {
    let mut store = STORE.lock().expect("virtual store poisoned");
    store.nuts.remove(path);
    store.mtimes.remove(path);
}

impl Backend for Virtual {
    fn provided_formats(&self) -> &'static [&'static str] {
        &["virtual"]
    }

    fn detect(&self, _first512: &[u8]) -> Option<&'static str> {
        // virtual paths are recognized by their prefix, never by content
        None
    }

    fn get_stats(&self, path: &str) -> crate::Result<FileStats> {
        let store = STORE.lock().expect("virtual store poisoned");
        match store.mtimes.get(path) {
            Some(&mtime) => Ok(FileStats { mtime, size: 0 }),
            None => Err(SquirrelError::file_load(path, "unknown virtual path")),
        }
    }

    fn iload(
        &self,
        _format: &str,
        path: &str,
        _segment: Option<i64>,
        _content: &[Kind],
    ) -> crate::Result<Vec<Nut>> {
        let store = STORE.lock().expect("virtual store poisoned");
        Ok(store.nuts.get(path).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::join_codes;

    fn virtual_nut(path: &str, segment: i64, element: i64) -> Nut {
        let mut nut = Nut::new(
            Kind::Waveform,
            join_codes(&["", "", "STA", "", "", ""]),
            segment,
            element,
            Some(0.0),
            Some(1.0),
            Some(1.0),
        );
        nut.file_path = Some(path.to_string());
        nut.file_format = Some("virtual".to_string());
        nut
    }

    #[test]
    fn test_add_and_iload() {
        let path = "virtual:backend_add_iload";
        add_nuts(vec![virtual_nut(path, 0, 1), virtual_nut(path, 0, 0)]).unwrap();

        let nuts = Virtual.iload("virtual", path, None, &[]).unwrap();
        assert_eq!(nuts.len(), 2);
        // sorted by (segment, element)
        assert_eq!(nuts[0].file_element, Some(0));
        assert_eq!(nuts[1].file_element, Some(1));

        let stats = Virtual.get_stats(path).unwrap();
        assert_eq!(stats.mtime, 1.0);

        add_nuts(vec![virtual_nut(path, 0, 2)]).unwrap();
        assert_eq!(Virtual.get_stats(path).unwrap().mtime, 2.0);

        remove(path);
    }

    #[test]
    fn test_unique_key_required() {
        let path = "virtual:backend_unique_key";
        let error =
            add_nuts(vec![virtual_nut(path, 0, 0), virtual_nut(path, 0, 0)]).unwrap_err();
        assert!(matches!(error, SquirrelError::UniqueKeyRequired(_)));
        remove(path);
    }

    #[test]
    fn test_unknown_path_fails_stats() {
        let error = Virtual.get_stats("virtual:backend_nowhere").unwrap_err();
        assert!(error.is_file_load());
    }
}
