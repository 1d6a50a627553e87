//! Interfaces to remote data providers.
//!
//! A source is a passive collaborator: it deposits files in a local cache
//! and hands their paths to the squirrel, which ingests them like any
//! other file. Sources hold no back-references.

use std::path::PathBuf;

/// Time constraint handed to a source; missing ends count as unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Constraint {
    pub tmin: Option<f64>,
    pub tmax: Option<f64>,
}

impl Constraint {
    pub fn new(tmin: Option<f64>, tmax: Option<f64>) -> Self {
        Self { tmin, tmax }
    }

    /// Whether `other` lies fully inside this constraint.
    pub fn contains(&self, other: &Constraint) -> bool {
        let lower_ok = match (self.tmin, other.tmin) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a <= b,
        };
        let upper_ok = match (self.tmax, other.tmax) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => b <= a,
        };
        lower_ok && upper_ok
    }

    /// Widen this constraint to also cover `other`.
    pub fn expand(&mut self, other: &Constraint) {
        self.tmin = match (self.tmin, other.tmin) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        };
        self.tmax = match (self.tmax, other.tmax) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
    }
}

/// Remote provider of channel inventories, cached as local files.
pub trait Source {
    /// Ensure the locally cached inventory is up to date for the given
    /// constraint.
    fn update_channel_inventory(&mut self, constraint: &Constraint) -> crate::Result<()>;

    /// Paths of the locally cached files covering the constraint.
    fn channel_file_paths(&self, constraint: &Constraint) -> Vec<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let everything = Constraint::default();
        let day = Constraint::new(Some(0.0), Some(86400.0));
        let hour = Constraint::new(Some(3600.0), Some(7200.0));

        assert!(everything.contains(&day));
        assert!(day.contains(&hour));
        assert!(!hour.contains(&day));
        assert!(!day.contains(&everything));
    }

    #[test]
    fn test_expand() {
        let mut constraint = Constraint::new(Some(100.0), Some(200.0));
        constraint.expand(&Constraint::new(Some(50.0), Some(150.0)));
        assert_eq!(constraint, Constraint::new(Some(50.0), Some(200.0)));

        constraint.expand(&Constraint::new(None, Some(300.0)));
        assert_eq!(constraint, Constraint::new(None, Some(300.0)));
    }
}
