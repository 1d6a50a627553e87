//! Squirrel Core - prompt, lazy, indexing, caching access to large
//! seismological datasets.
//!
//! Files are registered once and indexed into an embedded
//! meta-information database; afterwards, time-range and identifier
//! queries answer from the index without touching the files again.
//! Modified files are recognized and reindexed as needed.

pub mod client;
pub mod database;
pub mod error;
pub mod io;
pub mod model;
pub mod selection;
pub mod squirrel;

pub use client::{Constraint, Source};
pub use database::{get_database, CountEntry, Database, DatabaseStats};
pub use error::SquirrelError;
pub use io::{detect_format, iload, iload_selection, FileStats, LoadOptions, Loader};
pub use model::{
    join_codes, split_codes, tjoin, tscale_to_kscale, tsplit, Content, Kind, Nut,
};
pub use selection::Selection;
pub use squirrel::{AddOptions, Squirrel, SquirrelStats};

/// Result type alias for squirrel operations
pub type Result<T> = std::result::Result<T, SquirrelError>;
