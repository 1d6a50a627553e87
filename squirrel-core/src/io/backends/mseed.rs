//! miniSEED indexing backend.
//!
//! Walks the fixed record headers (plus blockette 1000 for the record
//! length) and merges contiguous records of one channel into waveform
//! nuts. Sample data is never decoded here.

use super::{epoch_from_year_doy, Backend};
use crate::error::SquirrelError;
use crate::model::{join_codes, Kind, Nut};

pub struct Mseed;

const FIXED_HEADER_LEN: usize = 48;
const DEFAULT_RECLEN: usize = 4096;

impl Backend for Mseed {
    fn provided_formats(&self) -> &'static [&'static str] {
        &["mseed"]
    }

    fn detect(&self, first512: &[u8]) -> Option<&'static str> {
        is_record_header(first512).then_some("mseed")
    }

    fn iload(
        &self,
        _format: &str,
        path: &str,
        _segment: Option<i64>,
        _content: &[Kind],
    ) -> crate::Result<Vec<Nut>> {
        let data = std::fs::read(path).map_err(|e| SquirrelError::file_load(path, e))?;

        let mut spans: Vec<Span> = Vec::new();
        let mut offset = 0;
        while offset + FIXED_HEADER_LEN <= data.len() {
            let record = parse_record(&data[offset..]).map_err(|message| {
                SquirrelError::file_load(path, format!("{message} (record at offset {offset})"))
            })?;

            let tmax = record.tmin + record.nsamples as f64 * record.deltat.unwrap_or(0.0);
            let mut merged = false;
            if let Some(span) = spans.iter_mut().rev().find(|span| {
                span.network == record.network
                    && span.station == record.station
                    && span.location == record.location
                    && span.channel == record.channel
                    && span.deltat == record.deltat
            }) {
                if let Some(deltat) = record.deltat {
                    if (record.tmin - span.tmax).abs() <= 0.5 * deltat {
                        span.tmax = tmax;
                        merged = true;
                    }
                }
            }
            if !merged {
                spans.push(Span {
                    network: record.network,
                    station: record.station,
                    location: record.location,
                    channel: record.channel,
                    deltat: record.deltat,
                    tmin: record.tmin,
                    tmax,
                });
            }

            offset += record.reclen;
        }

        Ok(spans
            .into_iter()
            .enumerate()
            .map(|(element, span)| {
                let agency = if span.network.is_empty() { "" } else { "FDSN" };
                Nut::new(
                    Kind::Waveform,
                    join_codes(&[
                        agency,
                        span.network.as_str(),
                        span.station.as_str(),
                        span.location.as_str(),
                        span.channel.as_str(),
                        "",
                    ]),
                    0,
                    element as i64,
                    Some(span.tmin),
                    Some(span.tmax),
                    span.deltat,
                )
            })
            .collect())
    }
}

struct Span {
    network: String,
    station: String,
    location: String,
    channel: String,
    deltat: Option<f64>,
    tmin: f64,
    tmax: f64,
}

struct Record {
    network: String,
    station: String,
    location: String,
    channel: String,
    tmin: f64,
    deltat: Option<f64>,
    nsamples: u32,
    reclen: usize,
}

fn is_record_header(data: &[u8]) -> bool {
    data.len() >= FIXED_HEADER_LEN
        && data[..6].iter().all(|b| b.is_ascii_digit() || *b == b' ')
        && data[..6].iter().any(u8::is_ascii_digit)
        && matches!(data[6], b'D' | b'R' | b'Q' | b'M')
        && matches!(data[7], b' ' | 0)
}

fn ascii_field(data: &[u8]) -> String {
    data.iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

fn parse_record(data: &[u8]) -> Result<Record, String> {
    if !is_record_header(data) {
        return Err("bad fixed record header".to_string());
    }

    // byte order from start-year plausibility
    let year_be = u16::from_be_bytes([data[20], data[21]]);
    let year_le = u16::from_le_bytes([data[20], data[21]]);
    let big_endian = if (1900..=2100).contains(&year_be) {
        true
    } else if (1900..=2100).contains(&year_le) {
        false
    } else {
        return Err(format!("implausible record start year: {year_be}"));
    };

    let u16_at = |i: usize| {
        let bytes = [data[i], data[i + 1]];
        if big_endian {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        }
    };
    let i16_at = |i: usize| u16_at(i) as i16;
    let i32_at = |i: usize| {
        let bytes = [data[i], data[i + 1], data[i + 2], data[i + 3]];
        if big_endian {
            i32::from_be_bytes(bytes)
        } else {
            i32::from_le_bytes(bytes)
        }
    };

    let station = ascii_field(&data[8..13]);
    let location = ascii_field(&data[13..15]);
    let channel = ascii_field(&data[15..18]);
    let network = ascii_field(&data[18..20]);

    let year = u16_at(20) as i64;
    let doy = u16_at(22) as i64;
    let fract = u16_at(28) as f64 * 1e-4;
    let mut tmin = (epoch_from_year_doy(year, doy)
        + data[24] as i64 * 3600
        + data[25] as i64 * 60
        + data[26] as i64) as f64
        + fract;

    // apply the time correction unless the activity flag says it already
    // is
    if data[36] & 0x02 == 0 {
        tmin += i32_at(40) as f64 * 1e-4;
    }

    let nsamples = u16_at(30) as u32;
    let factor = i16_at(32) as f64;
    let multiplier = i16_at(34) as f64;
    let rate = if factor > 0.0 && multiplier > 0.0 {
        factor * multiplier
    } else if factor > 0.0 && multiplier < 0.0 {
        -factor / multiplier
    } else if factor < 0.0 && multiplier > 0.0 {
        -multiplier / factor
    } else if factor < 0.0 && multiplier < 0.0 {
        1.0 / (factor * multiplier)
    } else {
        0.0
    };
    let deltat = (rate > 0.0).then(|| 1.0 / rate);

    let mut reclen = DEFAULT_RECLEN;
    let nblockettes = data[39];
    let mut boff = u16_at(46) as usize;
    for _ in 0..nblockettes {
        if boff == 0 || boff + 8 > data.len() {
            break;
        }
        let btype = u16_at(boff);
        let next = u16_at(boff + 2) as usize;
        if btype == 1000 {
            let power = data[boff + 6] as u32;
            if !(6..=24).contains(&power) {
                return Err(format!("implausible record length exponent: {power}"));
            }
            reclen = 1 << power;
            break;
        }
        if next == 0 || next <= boff {
            break;
        }
        boff = next;
    }

    Ok(Record {
        network,
        station,
        location,
        channel,
        tmin,
        deltat,
        nsamples,
        reclen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::split_codes;
    use std::io::Write;
    use tempfile::TempDir;

    /// Minimal 512-byte big-endian record with a blockette 1000 and no
    /// decodable payload.
    pub(crate) fn make_record(
        network: &str,
        station: &str,
        channel: &str,
        year: u16,
        doy: u16,
        second_of_day: u32,
        nsamples: u16,
    ) -> Vec<u8> {
        let mut rec = vec![0u8; 512];
        rec[..6].copy_from_slice(b"000001");
        rec[6] = b'D';
        rec[7] = b' ';
        rec[8..13].copy_from_slice(&pad(station, 5));
        rec[13..15].copy_from_slice(&pad("", 2));
        rec[15..18].copy_from_slice(&pad(channel, 3));
        rec[18..20].copy_from_slice(&pad(network, 2));
        rec[20..22].copy_from_slice(&year.to_be_bytes());
        rec[22..24].copy_from_slice(&doy.to_be_bytes());
        rec[24] = (second_of_day / 3600) as u8;
        rec[25] = (second_of_day / 60 % 60) as u8;
        rec[26] = (second_of_day % 60) as u8;
        rec[30..32].copy_from_slice(&nsamples.to_be_bytes());
        rec[32..34].copy_from_slice(&1i16.to_be_bytes()); // 1 Hz
        rec[34..36].copy_from_slice(&1i16.to_be_bytes());
        rec[39] = 1; // one blockette
        rec[44..46].copy_from_slice(&64u16.to_be_bytes()); // data offset
        rec[46..48].copy_from_slice(&48u16.to_be_bytes()); // first blockette
        rec[48..50].copy_from_slice(&1000u16.to_be_bytes());
        rec[54] = 10; // encoding
        rec[55] = 1; // word order
        rec[56] = 9; // 2^9 = 512 byte records
        rec
    }

    fn pad(s: &str, len: usize) -> Vec<u8> {
        let mut field = s.as_bytes().to_vec();
        field.resize(len, b' ');
        field
    }

    #[test]
    fn test_detect() {
        let rec = make_record("GE", "STA01", "BHZ", 2010, 1, 0, 100);
        assert_eq!(Mseed.detect(&rec), Some("mseed"));
        assert_eq!(Mseed.detect(b"not mseed at all, not even close........."), None);
        assert_eq!(Mseed.detect(&[]), None);
    }

    #[test]
    fn test_iload_single_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("one.mseed");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&make_record("GE", "STA01", "BHZ", 1970, 1, 0, 100))
            .unwrap();

        let nuts = Mseed
            .iload("mseed", &path.to_string_lossy(), None, &[])
            .unwrap();
        assert_eq!(nuts.len(), 1);
        let nut = &nuts[0];
        assert_eq!(nut.kind, Kind::Waveform);
        assert_eq!(
            split_codes(&nut.codes),
            vec!["FDSN", "GE", "STA01", "", "BHZ", ""]
        );
        assert_eq!(nut.tmin(), 0.0);
        // 100 samples at 1 Hz: half-open interval [0, 100)
        assert_eq!(nut.tmax(), 100.0);
        assert_eq!(nut.deltat, Some(1.0));
    }

    #[test]
    fn test_iload_merges_contiguous_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("many.mseed");
        let mut file = std::fs::File::create(&path).unwrap();
        // two contiguous records, then a gap, then another channel
        file.write_all(&make_record("GE", "STA01", "BHZ", 1970, 1, 0, 60))
            .unwrap();
        file.write_all(&make_record("GE", "STA01", "BHZ", 1970, 1, 60, 60))
            .unwrap();
        file.write_all(&make_record("GE", "STA01", "BHZ", 1970, 1, 600, 60))
            .unwrap();
        file.write_all(&make_record("GE", "STA02", "BHZ", 1970, 1, 0, 60))
            .unwrap();

        let nuts = Mseed
            .iload("mseed", &path.to_string_lossy(), None, &[])
            .unwrap();
        assert_eq!(nuts.len(), 3);
        assert_eq!(nuts[0].tmin(), 0.0);
        assert_eq!(nuts[0].tmax(), 120.0);
        assert_eq!(
            nuts.iter()
                .map(|nut| nut.file_element.unwrap())
                .collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }
}
