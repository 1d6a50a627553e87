//! Value types for indexed content: split timestamps, duration classes,
//! kinds, codes, and the nut itself.

use once_cell::sync::Lazy;
use rusqlite::Row;
use serde::Serialize;

/// Smallest duration edge, in seconds.
pub const TSCALE_MIN: i64 = 1;
/// Edge construction stops once an edge reaches one year.
pub const TSCALE_MAX: i64 = 365 * 24 * 3600;
/// Ratio between consecutive duration edges.
pub const TSCALE_LOGBASE: i64 = 20;

/// Substituted start for open-ended epochs: 1900-01-01 as epoch seconds.
pub const TMIN_OPEN: i64 = -2_208_988_800;
/// Substituted end for open-ended epochs: 2100-01-01 as epoch seconds.
pub const TMAX_OPEN: i64 = 4_102_444_800;

/// Upper edges of the duration classes: 1 s, 20 s, 400 s, ...
pub static TSCALE_EDGES: Lazy<Vec<i64>> = Lazy::new(|| {
    let mut edges = vec![TSCALE_MIN];
    loop {
        let last = edges[edges.len() - 1];
        if last >= TSCALE_MAX {
            break;
        }
        edges.push(last * TSCALE_LOGBASE);
    }
    edges
});

/// Map a duration in seconds to its duration class.
///
/// Class `k` holds durations in `(E[k-1], E[k]]` (upper edge inclusive);
/// durations past the last edge land in the overflow class
/// `TSCALE_EDGES.len()`.
pub fn tscale_to_kscale(tscale: i64) -> i64 {
    TSCALE_EDGES
        .iter()
        .position(|&edge| tscale <= edge)
        .unwrap_or(TSCALE_EDGES.len()) as i64
}

/// Split a float time into integer seconds and a fractional offset in [0, 1).
pub fn tsplit(t: f64) -> (i64, f64) {
    let seconds = t.floor();
    (seconds as i64, t - seconds)
}

/// Join a split timestamp back into a single float time.
///
/// A single `f64` cannot carry sub-millisecond resolution for large epochs;
/// order-sensitive code compares split pairs with [`time_lt`] instead of
/// joined values and only joins at the API edge.
pub fn tjoin(seconds: i64, offset: f64) -> f64 {
    seconds as f64 + offset
}

/// Exact `<` on split timestamps, valid because offsets live in [0, 1).
pub fn time_lt(seconds_a: i64, offset_a: f64, seconds_b: i64, offset_b: f64) -> bool {
    seconds_a < seconds_b || (seconds_a == seconds_b && offset_a < offset_b)
}

/// Serialize a codes tuple into its NUL-joined storage form.
pub fn join_codes<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("\0")
}

/// Split a NUL-joined codes string back into its components.
pub fn split_codes(codes: &str) -> Vec<String> {
    codes.split('\0').map(str::to_owned).collect()
}

/// Semantic category of a nut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Waveform,
    Station,
    Channel,
    Response,
    Event,
}

impl Kind {
    pub const ALL: [Kind; 5] = [
        Kind::Waveform,
        Kind::Station,
        Kind::Channel,
        Kind::Response,
        Kind::Event,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waveform => "waveform",
            Self::Station => "station",
            Self::Channel => "channel",
            Self::Response => "response",
            Self::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waveform" => Some(Self::Waveform),
            "station" => Some(Self::Station),
            "channel" => Some(Self::Channel),
            "response" => Some(Self::Response),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Waveform payload: identifier codes, span, and data samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub agency: String,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub extra: String,
    pub tmin: f64,
    pub tmax: f64,
    pub deltat: Option<f64>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub agency: String,
    pub network: String,
    pub station: String,
    pub location: String,
    pub tmin: Option<f64>,
    pub tmax: Option<f64>,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub depth: Option<f64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub agency: String,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub tmin: Option<f64>,
    pub tmax: Option<f64>,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub depth: Option<f64>,
    pub azimuth: Option<f64>,
    pub dip: Option<f64>,
    pub deltat: Option<f64>,
}

/// Instrument response payload; opaque until a response model lands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: Option<String>,
    pub time: f64,
    pub duration: Option<f64>,
    pub lat: f64,
    pub lon: f64,
    pub depth: Option<f64>,
    pub magnitude: Option<f64>,
}

/// In-memory content payload attached to a nut on request.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Waveform(Waveform),
    Station(Station),
    Channel(Channel),
    Response(Response),
    Event(Event),
}

/// A single indexable item exposed by a file.
///
/// The `(file_segment, file_element)` pair identifies the nut within its
/// file. The time interval is half-open `[tmin, tmax)` and kept as split
/// `(seconds, offset)` pairs; open-ended epochs are substituted with
/// [`TMIN_OPEN`] / [`TMAX_OPEN`] so that every nut carries both endpoints.
#[derive(Debug, Clone)]
pub struct Nut {
    pub file_path: Option<String>,
    pub file_format: Option<String>,
    pub file_mtime: Option<f64>,
    pub file_size: Option<i64>,

    pub file_segment: Option<i64>,
    pub file_element: Option<i64>,

    pub kind: Kind,
    pub codes: String,

    pub tmin_seconds: i64,
    pub tmin_offset: f64,
    pub tmax_seconds: i64,
    pub tmax_offset: f64,

    pub deltat: Option<f64>,

    pub content: Option<Content>,
}

impl Nut {
    pub fn new(
        kind: Kind,
        codes: String,
        file_segment: i64,
        file_element: i64,
        tmin: Option<f64>,
        tmax: Option<f64>,
        deltat: Option<f64>,
    ) -> Self {
        let (tmin_seconds, tmin_offset) = match tmin {
            Some(t) => tsplit(t),
            None => (TMIN_OPEN, 0.0),
        };
        let (tmax_seconds, tmax_offset) = match tmax {
            Some(t) => tsplit(t),
            None => (TMAX_OPEN, 0.0),
        };

        Nut {
            file_path: None,
            file_format: None,
            file_mtime: None,
            file_size: None,
            file_segment: Some(file_segment),
            file_element: Some(file_element),
            kind,
            codes,
            tmin_seconds,
            tmin_offset,
            tmax_seconds,
            tmax_offset,
            deltat,
            content: None,
        }
    }

    /// Decode a nut from the standard 13-column projection
    /// (path, format, mtime, size, segment, element, kind, codes,
    /// tmin_seconds, tmin_offset, tmax_seconds, tmax_offset, deltat),
    /// trusting column order.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Nut> {
        let kind_str: String = row.get(6)?;
        let kind = Kind::parse(&kind_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                format!("unknown content kind: {kind_str}").into(),
            )
        })?;

        Ok(Nut {
            file_path: row.get(0)?,
            file_format: row.get(1)?,
            file_mtime: row.get(2)?,
            file_size: row.get(3)?,
            file_segment: row.get(4)?,
            file_element: row.get(5)?,
            kind,
            codes: row.get(7)?,
            tmin_seconds: row.get(8)?,
            tmin_offset: row.get(9)?,
            tmax_seconds: row.get(10)?,
            tmax_offset: row.get(11)?,
            deltat: row.get(12)?,
            content: None,
        })
    }

    /// Start time as a float.
    pub fn tmin(&self) -> f64 {
        tjoin(self.tmin_seconds, self.tmin_offset)
    }

    /// End time as a float (exclusive).
    pub fn tmax(&self) -> f64 {
        tjoin(self.tmax_seconds, self.tmax_offset)
    }

    /// Duration class derived from the whole seconds of the interval.
    pub fn kscale(&self) -> i64 {
        tscale_to_kscale(self.tmax_seconds - self.tmin_seconds)
    }

    /// Codes tuple components.
    pub fn codes_vec(&self) -> Vec<String> {
        split_codes(&self.codes)
    }

    /// Whether the payload for this nut can be served from the database
    /// alone. Never true in the current schema; the ingest pipeline keeps
    /// the shortcut wired for when payloads move into the store.
    pub fn content_in_db(&self) -> bool {
        false
    }
}

/// Two nuts are equal when they describe the same logical item at the same
/// position inside a file, regardless of where the file lives right now:
/// file path, format, stats, and the in-memory payload are ignored.
impl PartialEq for Nut {
    fn eq(&self, other: &Self) -> bool {
        self.file_segment == other.file_segment
            && self.file_element == other.file_element
            && self.kind == other.kind
            && self.codes == other.codes
            && self.tmin_seconds == other.tmin_seconds
            && self.tmin_offset == other.tmin_offset
            && self.tmax_seconds == other.tmax_seconds
            && self.tmax_offset == other.tmax_offset
            && self.deltat == other.deltat
    }
}
