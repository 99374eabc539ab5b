//! GPX 1.1 export of a decoded track.

use std::io::Write;

use chrono::NaiveDateTime;
use quick_xml::events::{BytesDecl, BytesText, Event};
use quick_xml::Writer;

use crate::error::{Error, Result};
use crate::samples::{GpsPoint, SampleKind, Track};

const GPX_NS: &str = "http://www.topografix.com/GPX/1/1";
const CREATOR: &str = "gpspod";

/// Export options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpxOptions {
    /// Emit a `<wpt>` per lap marker.
    pub lap_waypoints: bool,
    /// Start a new `<trkseg>` at every lap.
    pub lap_segments: bool,
    /// Include GPS samples without a fix instead of dropping them.
    pub all_points: bool,
}

struct TrackPoint {
    time: NaiveDateTime,
    point: GpsPoint,
    /// Elevation from the nearest preceding periodic altitude sample.
    elevation_m: Option<i16>,
}

fn xml_error(e: quick_xml::Error) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

fn iso_time(time: NaiveDateTime) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn collect_points(track: &Track, options: &GpxOptions) -> Vec<TrackPoint> {
    let mut points = Vec::new();
    let mut elevation_m = None;
    for sample in &track.samples {
        match sample.kind {
            SampleKind::Periodic(values) => {
                if values.altitude_m.is_some() {
                    elevation_m = values.altitude_m;
                }
            }
            SampleKind::Gps(point) => {
                if point.fix || options.all_points {
                    points.push(TrackPoint {
                        time: sample.time,
                        point,
                        elevation_m,
                    });
                }
            }
        }
    }
    points
}

/// Split points into one segment per lap interval.
fn segment<'a>(
    points: &'a [TrackPoint],
    track: &Track,
    options: &GpxOptions,
) -> Vec<&'a [TrackPoint]> {
    if !options.lap_segments || track.laps.is_empty() || points.is_empty() {
        return vec![points];
    }

    let mut segments = Vec::new();
    let mut start = 0usize;
    for lap in &track.laps {
        let end = start
            + points[start..]
                .iter()
                .take_while(|p| p.time < lap.time)
                .count();
        if end > start {
            segments.push(&points[start..end]);
        }
        start = end;
    }
    if start < points.len() {
        segments.push(&points[start..]);
    }
    segments
}

/// Write one track as a GPX document.
pub fn write_gpx<W: Write>(track: &Track, options: &GpxOptions, sink: W) -> Result<()> {
    let points = collect_points(track, options);
    let segments = segment(&points, track, options);

    let mut writer = Writer::new_with_indent(sink, b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;

    writer
        .create_element("gpx")
        .with_attribute(("version", "1.1"))
        .with_attribute(("creator", CREATOR))
        .with_attribute(("xmlns", GPX_NS))
        .write_inner_content(|w| {
            w.create_element("metadata").write_inner_content(|w| {
                w.create_element("time")
                    .write_text_content(BytesText::new(&iso_time(track.start_time)))?;
                Ok::<(), quick_xml::Error>(())
            })?;

            if options.lap_waypoints {
                for (number, lap) in track.laps.iter().enumerate() {
                    // Anchor the waypoint at the last point reached before
                    // the lap was marked.
                    let anchor = points
                        .iter()
                        .take_while(|p| p.time <= lap.time)
                        .last()
                        .or_else(|| points.first());
                    let Some(anchor) = anchor else { break };
                    let lat = format!("{:.7}", anchor.point.latitude());
                    let lon = format!("{:.7}", anchor.point.longitude());
                    w.create_element("wpt")
                        .with_attribute(("lat", lat.as_str()))
                        .with_attribute(("lon", lon.as_str()))
                        .write_inner_content(|w| {
                            w.create_element("time")
                                .write_text_content(BytesText::new(&iso_time(lap.time)))?;
                            w.create_element("name")
                                .write_text_content(BytesText::new(&format!("Lap {}", number + 1)))?;
                            Ok::<(), quick_xml::Error>(())
                        })?;
                }
            }

            w.create_element("trk").write_inner_content(|w| {
                w.create_element("name").write_text_content(BytesText::new(
                    &track.start_time.format("Track %Y-%m-%d %H:%M:%S").to_string(),
                ))?;
                for segment in &segments {
                    w.create_element("trkseg").write_inner_content(|w| {
                        for point in *segment {
                            let lat = format!("{:.7}", point.point.latitude());
                            let lon = format!("{:.7}", point.point.longitude());
                            let time = iso_time(point.time);
                            let elevation = point.elevation_m;
                            w.create_element("trkpt")
                                .with_attribute(("lat", lat.as_str()))
                                .with_attribute(("lon", lon.as_str()))
                                .write_inner_content(|w| {
                                    if let Some(ele) = elevation {
                                        w.create_element("ele")
                                            .write_text_content(BytesText::new(&ele.to_string()))?;
                                    }
                                    w.create_element("time")
                                        .write_text_content(BytesText::new(&time))?;
                                    if let Some(satellites) = point.point.satellites {
                                        w.create_element("sat").write_text_content(
                                            BytesText::new(&satellites.to_string()),
                                        )?;
                                    }
                                    // hdop carries the EHPE estimate in meters.
                                    if let Some(ehpe_cm) = point.point.ehpe_cm {
                                        let hdop = format!("{:.1}", ehpe_cm as f64 / 100.0);
                                        w.create_element("hdop")
                                            .write_text_content(BytesText::new(&hdop))?;
                                    }
                                    Ok::<(), quick_xml::Error>(())
                                })?;
                        }
                        Ok::<(), quick_xml::Error>(())
                    })?;
                }
                Ok::<(), quick_xml::Error>(())
            })?;
            Ok::<(), quick_xml::Error>(())
        })
        .map_err(xml_error)?;

    Ok(())
}
