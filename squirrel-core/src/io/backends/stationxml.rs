//! FDSN StationXML indexing backend.

use super::Backend;
use crate::error::SquirrelError;
use crate::model::{join_codes, Channel, Content, Kind, Nut, Station};
use roxmltree::Node;
use std::time::UNIX_EPOCH;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub struct StationXml;

const MARKER: &[u8] = b"<FDSNStationXML";
const YEAR: f64 = 60.0 * 60.0 * 24.0 * 365.0;

impl Backend for StationXml {
    fn provided_formats(&self) -> &'static [&'static str] {
        &["stationxml"]
    }

    fn detect(&self, first512: &[u8]) -> Option<&'static str> {
        first512
            .windows(MARKER.len())
            .any(|window| window == MARKER)
            .then_some("stationxml")
    }

    fn iload(
        &self,
        _format: &str,
        path: &str,
        _segment: Option<i64>,
        content: &[Kind],
    ) -> crate::Result<Vec<Nut>> {
        let text = std::fs::read_to_string(path).map_err(|e| SquirrelError::file_load(path, e))?;
        let doc =
            roxmltree::Document::parse(&text).map_err(|e| SquirrelError::file_load(path, e))?;

        let now = std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let far_future = now + 20.0 * YEAR;

        // end dates pushed into the far future mean "open epoch"
        let clamp_open = |t: Option<f64>| t.filter(|&t| t <= far_future);

        let mut nuts = Vec::new();
        let mut element = 0i64;

        for network in children(doc.root_element(), "Network") {
            let net = network.attribute("code").unwrap_or("");
            let agency = if net.is_empty() { "" } else { "FDSN" };

            for station in children(network, "Station") {
                let sta = station.attribute("code").unwrap_or("");
                let tmin = station.attribute("startDate").and_then(parse_date);
                let tmax = clamp_open(station.attribute("endDate").and_then(parse_date));

                let mut nut = Nut::new(
                    Kind::Station,
                    join_codes(&[agency, net, sta, ""]),
                    0,
                    element,
                    tmin,
                    tmax,
                    None,
                );
                if content.contains(&Kind::Station) {
                    nut.content = Some(Content::Station(Station {
                        agency: agency.to_string(),
                        network: net.to_string(),
                        station: sta.to_string(),
                        location: String::new(),
                        tmin,
                        tmax,
                        lat: required_f64(&station, "Latitude", path)?,
                        lon: required_f64(&station, "Longitude", path)?,
                        elevation: child_f64(&station, "Elevation"),
                        depth: None,
                        description: child_text(&station, "Description"),
                    }));
                }
                nuts.push(nut);
                element += 1;

                for channel in children(station, "Channel") {
                    let cha = channel.attribute("code").unwrap_or("");
                    let loc = channel.attribute("locationCode").unwrap_or("").trim();
                    let tmin = channel.attribute("startDate").and_then(parse_date);
                    let tmax = clamp_open(channel.attribute("endDate").and_then(parse_date));
                    let deltat = child_f64(&channel, "SampleRate")
                        .filter(|&rate| rate > 0.0)
                        .map(|rate| 1.0 / rate);

                    let mut nut = Nut::new(
                        Kind::Channel,
                        join_codes(&[agency, net, sta, loc, cha]),
                        0,
                        element,
                        tmin,
                        tmax,
                        deltat,
                    );
                    if content.contains(&Kind::Channel) {
                        nut.content = Some(Content::Channel(Channel {
                            agency: agency.to_string(),
                            network: net.to_string(),
                            station: sta.to_string(),
                            location: loc.to_string(),
                            channel: cha.to_string(),
                            tmin,
                            tmax,
                            lat: required_f64(&channel, "Latitude", path)?,
                            lon: required_f64(&channel, "Longitude", path)?,
                            elevation: child_f64(&channel, "Elevation"),
                            depth: child_f64(&channel, "Depth"),
                            azimuth: child_f64(&channel, "Azimuth"),
                            dip: child_f64(&channel, "Dip"),
                            deltat,
                        }));
                    }
                    nuts.push(nut);
                    element += 1;
                }
            }
        }

        Ok(nuts)
    }
}

fn children<'a, 'input>(
    node: Node<'a, 'input>,
    tag: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |child| child.has_tag_name(tag))
}

fn child_text<'a>(node: &Node<'a, '_>, tag: &str) -> Option<String> {
    node.children()
        .find(|child| child.has_tag_name(tag))
        .and_then(|child| child.text())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn child_f64(node: &Node<'_, '_>, tag: &str) -> Option<f64> {
    child_text(node, tag).and_then(|text| text.parse().ok())
}

fn required_f64(node: &Node<'_, '_>, tag: &str, path: &str) -> crate::Result<f64> {
    child_f64(node, tag)
        .ok_or_else(|| SquirrelError::file_load(path, format!("missing or bad <{tag}>")))
}

/// StationXML date attribute, with or without timezone suffix.
fn parse_date(s: &str) -> Option<f64> {
    let s = s.trim();
    let parsed = OffsetDateTime::parse(s, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(&format!("{s}Z"), &Rfc3339))
        .ok()?;
    Some(parsed.unix_timestamp() as f64 + f64::from(parsed.time().nanosecond()) * 1e-9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::split_codes;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<FDSNStationXML xmlns="http://www.fdsn.org/xml/station/1" schemaVersion="1.0">
  <Source>test</Source>
  <Network code="GE">
    <Station code="APE" startDate="2000-01-01T00:00:00Z" endDate="2599-01-01T00:00:00Z">
      <Latitude>37.07</Latitude>
      <Longitude>25.53</Longitude>
      <Elevation>620.0</Elevation>
      <Channel code="BHZ" locationCode="" startDate="2000-01-01T00:00:00" endDate="2010-01-01T00:00:00">
        <Latitude>37.07</Latitude>
        <Longitude>25.53</Longitude>
        <Elevation>620.0</Elevation>
        <Depth>0.0</Depth>
        <Azimuth>0.0</Azimuth>
        <Dip>-90.0</Dip>
        <SampleRate>20.0</SampleRate>
      </Channel>
    </Station>
  </Network>
</FDSNStationXML>
"#;

    fn write_sample(dir: &TempDir) -> String {
        let path = dir.path().join("inventory.stationxml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_detect() {
        let first512 = &SAMPLE.as_bytes()[..SAMPLE.len().min(512)];
        assert_eq!(StationXml.detect(first512), Some("stationxml"));
        assert_eq!(StationXml.detect(b"<other xml/>"), None);
    }

    #[test]
    fn test_iload_index_only() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);

        let nuts = StationXml.iload("stationxml", &path, None, &[]).unwrap();
        assert_eq!(nuts.len(), 2);

        let station = &nuts[0];
        assert_eq!(station.kind, Kind::Station);
        assert_eq!(split_codes(&station.codes), vec!["FDSN", "GE", "APE", ""]);
        assert!(station.content.is_none());
        // far-future end date became an open epoch
        assert_eq!(station.tmax_seconds, crate::model::TMAX_OPEN);

        let channel = &nuts[1];
        assert_eq!(channel.kind, Kind::Channel);
        assert_eq!(
            split_codes(&channel.codes),
            vec!["FDSN", "GE", "APE", "", "BHZ"]
        );
        assert_eq!(channel.deltat, Some(0.05));
        assert_eq!(channel.file_element, Some(1));
    }

    #[test]
    fn test_iload_with_content() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);

        let nuts = StationXml
            .iload("stationxml", &path, None, &[Kind::Station, Kind::Channel])
            .unwrap();

        let Some(Content::Station(station)) = &nuts[0].content else {
            panic!("expected station payload");
        };
        assert_eq!(station.lat, 37.07);
        assert_eq!(station.elevation, Some(620.0));

        let Some(Content::Channel(channel)) = &nuts[1].content else {
            panic!("expected channel payload");
        };
        assert_eq!(channel.dip, Some(-90.0));
        assert_eq!(channel.deltat, Some(0.05));
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("1970-01-01T00:00:00Z"), Some(0.0));
        assert_eq!(parse_date("1970-01-01T00:00:01"), Some(1.0));
        assert_eq!(parse_date("garbage"), None);
    }
}
