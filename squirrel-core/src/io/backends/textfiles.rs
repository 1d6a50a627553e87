//! Pyrocko-style text station files.
//!
//! Station lines `NET.STA.LOC lat lon elevation depth [description]`
//! followed by channel lines `CHA azimuth dip gain` belonging to the
//! station above. Invalid lines are skipped with a warning.

use super::Backend;
use crate::error::SquirrelError;
use crate::model::{join_codes, Channel, Content, Kind, Nut, Station};

pub struct TextStations;

impl Backend for TextStations {
    fn provided_formats(&self) -> &'static [&'static str] {
        &["pyrocko_stations"]
    }

    fn detect(&self, first512: &[u8]) -> Option<&'static str> {
        let text = String::from_utf8_lossy(first512);
        looks_like_stations(&text).then_some("pyrocko_stations")
    }

    fn iload(
        &self,
        _format: &str,
        path: &str,
        _segment: Option<i64>,
        content: &[Kind],
    ) -> crate::Result<Vec<Nut>> {
        let text = std::fs::read_to_string(path).map_err(|e| SquirrelError::file_load(path, e))?;

        let mut nuts = Vec::new();
        let mut element = 0i64;
        let mut current: Option<StationLine> = None;

        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line, &current) {
                Some(Line::Station(station)) => {
                    let mut nut = Nut::new(
                        Kind::Station,
                        join_codes(&[
                            &station.agency,
                            &station.network,
                            &station.station,
                            &station.location,
                        ]),
                        0,
                        element,
                        None,
                        None,
                        None,
                    );
                    if content.contains(&Kind::Station) {
                        nut.content = Some(Content::Station(Station {
                            agency: station.agency.clone(),
                            network: station.network.clone(),
                            station: station.station.clone(),
                            location: station.location.clone(),
                            tmin: None,
                            tmax: None,
                            lat: station.lat,
                            lon: station.lon,
                            elevation: Some(station.elevation),
                            depth: Some(station.depth),
                            description: if station.description.is_empty() {
                                None
                            } else {
                                Some(station.description.clone())
                            },
                        }));
                    }
                    nuts.push(nut);
                    element += 1;
                    current = Some(station);
                }
                Some(Line::Channel(channel)) => {
                    // parse_line only yields channel lines below a station
                    let Some(station) = &current else { continue };
                    if channel.gain != 1.0 {
                        tracing::warn!(
                            "{}.{}.{}.{} gain value from stations file ignored - please check",
                            station.network,
                            station.station,
                            station.location,
                            channel.channel,
                        );
                    }
                    let mut nut = Nut::new(
                        Kind::Channel,
                        join_codes(&[
                            &station.agency,
                            &station.network,
                            &station.station,
                            &station.location,
                            &channel.channel,
                        ]),
                        0,
                        element,
                        None,
                        None,
                        None,
                    );
                    if content.contains(&Kind::Channel) {
                        nut.content = Some(Content::Channel(Channel {
                            agency: station.agency.clone(),
                            network: station.network.clone(),
                            station: station.station.clone(),
                            location: station.location.clone(),
                            channel: channel.channel,
                            tmin: None,
                            tmax: None,
                            lat: station.lat,
                            lon: station.lon,
                            elevation: Some(station.elevation),
                            depth: Some(station.depth),
                            azimuth: channel.azimuth,
                            dip: channel.dip,
                            deltat: None,
                        }));
                    }
                    nuts.push(nut);
                    element += 1;
                }
                None => {
                    tracing::warn!(
                        path,
                        line = index + 1,
                        "skipping invalid station/channel definition"
                    );
                }
            }
        }

        Ok(nuts)
    }
}

struct StationLine {
    agency: String,
    network: String,
    station: String,
    location: String,
    lat: f64,
    lon: f64,
    elevation: f64,
    depth: f64,
    description: String,
}

struct ChannelLine {
    channel: String,
    azimuth: Option<f64>,
    dip: Option<f64>,
    gain: f64,
}

enum Line {
    Station(StationLine),
    Channel(ChannelLine),
}

/// Split like Python's `str.split(None, max_splits)`: at most
/// `max_splits` whitespace splits, the remainder staying intact.
fn split_max(line: &str, max_splits: usize) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = line.trim();
    while tokens.len() < max_splits && !rest.is_empty() {
        match rest.find(char::is_whitespace) {
            Some(i) => {
                tokens.push(&rest[..i]);
                rest = rest[i..].trim_start();
            }
            None => {
                tokens.push(rest);
                rest = "";
            }
        }
    }
    if !rest.is_empty() {
        tokens.push(rest);
    }
    tokens
}

fn float_or_none(token: &str) -> Result<Option<f64>, std::num::ParseFloatError> {
    if token.eq_ignore_ascii_case("nan") {
        Ok(None)
    } else {
        token.parse().map(Some)
    }
}

fn parse_line(line: &str, current: &Option<StationLine>) -> Option<Line> {
    let tokens = split_max(line, 5);
    if tokens.len() == 5 || tokens.len() == 6 {
        let ids: Vec<&str> = tokens[0].split('.').collect();
        let [network, station, location] = ids.as_slice() else {
            return None;
        };
        let mut values = [0.0f64; 4];
        for (value, token) in values.iter_mut().zip(&tokens[1..5]) {
            *value = token.parse().ok()?;
        }
        let [lat, lon, elevation, depth] = values;
        let agency = if network.is_empty() { "" } else { "FDSN" };
        Some(Line::Station(StationLine {
            agency: agency.to_string(),
            network: network.to_string(),
            station: station.to_string(),
            location: location.to_string(),
            lat,
            lon,
            elevation,
            depth,
            description: tokens.get(5).unwrap_or(&"").to_string(),
        }))
    } else if tokens.len() == 4 && current.is_some() {
        Some(Line::Channel(ChannelLine {
            channel: tokens[0].to_string(),
            azimuth: float_or_none(tokens[1]).ok()?,
            dip: float_or_none(tokens[2]).ok()?,
            gain: tokens[3].parse().ok()?,
        }))
    } else {
        None
    }
}

fn looks_like_stations(text: &str) -> bool {
    for line in text.lines() {
        let tokens = split_max(line, 5);
        if tokens.len() == 5 || tokens.len() == 6 {
            if tokens[0].split('.').count() != 3 {
                return false;
            }
            let mut values = [0.0f64; 4];
            for (value, token) in values.iter_mut().zip(&tokens[1..5]) {
                match token.parse() {
                    Ok(parsed) => *value = parsed,
                    Err(_) => return false,
                }
            }
            let [lat, lon, _, _] = values;
            if !(-90.0..=90.0).contains(&lat) {
                return false;
            }
            if !(-180.0..=180.0).contains(&lon) {
                return false;
            }
            return true;
        }
    }
    false
}
