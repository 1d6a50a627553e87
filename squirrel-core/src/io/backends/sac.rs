//! SAC indexing backend: binary header only, either byte order.

use super::{epoch_from_year_doy, Backend};
use crate::error::SquirrelError;
use crate::model::{join_codes, Kind, Nut};

pub struct Sac;

const HEADER_LEN: usize = 632;
const UNDEFINED_F: f32 = -12345.0;
const UNDEFINED_I: i32 = -12345;
const UNDEFINED_K: &str = "-12345";

/// Float header word (4 bytes each, starting at byte 0).
fn float_word(data: &[u8], word: usize, big_endian: bool) -> f32 {
    let i = word * 4;
    let bytes = [data[i], data[i + 1], data[i + 2], data[i + 3]];
    if big_endian {
        f32::from_be_bytes(bytes)
    } else {
        f32::from_le_bytes(bytes)
    }
}

/// Integer header word (the integer block starts at byte 280).
fn int_word(data: &[u8], word: usize, big_endian: bool) -> i32 {
    let i = 280 + word * 4;
    let bytes = [data[i], data[i + 1], data[i + 2], data[i + 3]];
    if big_endian {
        i32::from_be_bytes(bytes)
    } else {
        i32::from_le_bytes(bytes)
    }
}

/// Character header field; undefined markers map to the empty string.
fn k_field(data: &[u8], offset: usize, len: usize) -> String {
    let field: String = data[offset..offset + len]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string();
    if field == UNDEFINED_K {
        String::new()
    } else {
        field
    }
}

fn plausible(data: &[u8], big_endian: bool) -> bool {
    if data.len() < 320 {
        return false;
    }
    let nvhdr = int_word(data, 6, big_endian);
    if !(4..=6).contains(&nvhdr) {
        return false;
    }
    let npts = int_word(data, 9, big_endian);
    if npts < 0 {
        return false;
    }
    let nzjday = int_word(data, 1, big_endian);
    if nzjday != UNDEFINED_I && !(1..=366).contains(&nzjday) {
        return false;
    }
    let delta = float_word(data, 0, big_endian);
    delta == UNDEFINED_F || delta > 0.0
}

impl Backend for Sac {
    fn provided_formats(&self) -> &'static [&'static str] {
        &["sac"]
    }

    fn detect(&self, first512: &[u8]) -> Option<&'static str> {
        (plausible(first512, true) || plausible(first512, false)).then_some("sac")
    }

    fn iload(
        &self,
        _format: &str,
        path: &str,
        _segment: Option<i64>,
        _content: &[Kind],
    ) -> crate::Result<Vec<Nut>> {
        let data = std::fs::read(path).map_err(|e| SquirrelError::file_load(path, e))?;
        if data.len() < HEADER_LEN {
            return Err(SquirrelError::file_load(path, "truncated SAC header"));
        }

        let big_endian = if plausible(&data, true) {
            true
        } else if plausible(&data, false) {
            false
        } else {
            return Err(SquirrelError::file_load(path, "implausible SAC header"));
        };

        let delta = float_word(&data, 0, big_endian);
        let begin = float_word(&data, 5, big_endian);
        let begin = if begin == UNDEFINED_F { 0.0 } else { begin };
        let npts = int_word(&data, 9, big_endian).max(0);

        let nzyear = int_word(&data, 0, big_endian);
        let nzjday = int_word(&data, 1, big_endian);
        let reference = if nzyear == UNDEFINED_I || nzjday == UNDEFINED_I {
            0.0
        } else {
            let defined = |value: i32| if value == UNDEFINED_I { 0 } else { value as i64 };
            (epoch_from_year_doy(nzyear as i64, nzjday as i64)
                + defined(int_word(&data, 2, big_endian)) * 3600
                + defined(int_word(&data, 3, big_endian)) * 60
                + defined(int_word(&data, 4, big_endian))) as f64
                + defined(int_word(&data, 5, big_endian)) as f64 * 1e-3
        };

        let deltat = (delta != UNDEFINED_F && delta > 0.0).then(|| delta as f64);
        let tmin = reference + begin as f64;
        let tmax = tmin + npts as f64 * deltat.unwrap_or(0.0);

        let station = k_field(&data, 440, 8);
        let location = k_field(&data, 464, 8); // KHOLE
        let channel = k_field(&data, 600, 8); // KCMPNM
        let network = k_field(&data, 608, 8); // KNETWK
        let agency = if network.is_empty() { "" } else { "FDSN" };

        Ok(vec![Nut::new(
            Kind::Waveform,
            join_codes(&[
                agency,
                network.as_str(),
                station.as_str(),
                location.as_str(),
                channel.as_str(),
                "",
            ]),
            0,
            0,
            Some(tmin),
            Some(tmax),
            deltat,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::split_codes;
    use std::io::Write;
    use tempfile::TempDir;

    /// Little-endian SAC header with a one-second 1 Hz trace.
    pub(crate) fn make_header(
        network: &str,
        station: &str,
        channel: &str,
        nzyear: i32,
        nzjday: i32,
        npts: i32,
        delta: f32,
    ) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_LEN];
        // float block: everything undefined except delta and b
        for word in 0..70 {
            header[word * 4..word * 4 + 4].copy_from_slice(&UNDEFINED_F.to_le_bytes());
        }
        header[0..4].copy_from_slice(&delta.to_le_bytes());
        header[20..24].copy_from_slice(&0.0f32.to_le_bytes()); // b
        // int block
        for word in 0..40 {
            let i = 280 + word * 4;
            header[i..i + 4].copy_from_slice(&UNDEFINED_I.to_le_bytes());
        }
        let set_int = |header: &mut Vec<u8>, word: usize, value: i32| {
            let i = 280 + word * 4;
            header[i..i + 4].copy_from_slice(&value.to_le_bytes());
        };
        set_int(&mut header, 0, nzyear);
        set_int(&mut header, 1, nzjday);
        set_int(&mut header, 2, 0);
        set_int(&mut header, 3, 0);
        set_int(&mut header, 4, 0);
        set_int(&mut header, 5, 0);
        set_int(&mut header, 6, 6); // NVHDR
        set_int(&mut header, 9, npts);
        // char block: spaces
        for byte in header.iter_mut().skip(440) {
            *byte = b' ';
        }
        header[440..440 + station.len()].copy_from_slice(station.as_bytes());
        header[600..600 + channel.len()].copy_from_slice(channel.as_bytes());
        header[608..608 + network.len()].copy_from_slice(network.as_bytes());
        header
    }

    #[test]
    fn test_detect() {
        let header = make_header("XX", "STA", "BHZ", 1970, 1, 10, 1.0);
        assert_eq!(Sac.detect(&header[..512]), Some("sac"));
        assert_eq!(Sac.detect(&[0u8; 512]), None);
        assert_eq!(Sac.detect(b"short"), None);
    }

    #[test]
    fn test_iload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.sac");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&make_header("XX", "STA", "BHZ", 1970, 2, 10, 0.5))
            .unwrap();

        let nuts = Sac.iload("sac", &path.to_string_lossy(), None, &[]).unwrap();
        assert_eq!(nuts.len(), 1);
        let nut = &nuts[0];
        assert_eq!(nut.kind, Kind::Waveform);
        assert_eq!(
            split_codes(&nut.codes),
            vec!["FDSN", "XX", "STA", "", "BHZ", ""]
        );
        assert_eq!(nut.tmin(), 86400.0);
        assert_eq!(nut.tmax(), 86400.0 + 10.0 * 0.5);
        assert_eq!(nut.deltat, Some(0.5));
    }
}
