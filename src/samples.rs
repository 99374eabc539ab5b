//! Decoder for the tagged sample records inside the track chain.
//!
//! Records are variable length but not self-delimiting: a one-byte tag picks
//! the record kind and the kind fixes the layout, except for periodic
//! samples whose layout is declared by the preceding periodic header. An
//! unknown tag therefore ends decoding; there is no way to find the next
//! record boundary.

use std::io::{Cursor, Read};

use binrw::{BinRead, BinWrite};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::error::Result;
use crate::pmem::{self, ChainKind};

/// Record tags observed in the track chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    TrackHeader = 0x01,
    PeriodicHeader = 0x02,
    Periodic = 0x03,
    GpsBase = 0x04,
    GpsSmall = 0x05,
    GpsLarge = 0x06,
    TimeReference = 0x07,
    Lap = 0x08,
}

impl RecordTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::TrackHeader),
            0x02 => Some(Self::PeriodicHeader),
            0x03 => Some(Self::Periodic),
            0x04 => Some(Self::GpsBase),
            0x05 => Some(Self::GpsSmall),
            0x06 => Some(Self::GpsLarge),
            0x07 => Some(Self::TimeReference),
            0x08 => Some(Self::Lap),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::TrackHeader => "track header",
            Self::PeriodicHeader => "periodic header",
            Self::Periodic => "periodic sample",
            Self::GpsBase => "GPS base",
            Self::GpsSmall => "GPS small delta",
            Self::GpsLarge => "GPS large delta",
            Self::TimeReference => "time reference",
            Self::Lap => "lap",
        }
    }
}

/// Wall-clock timestamp as the device stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct DateTimeField {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTimeField {
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?
            .and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
    }

    pub fn from_naive(time: NaiveDateTime) -> Self {
        use chrono::{Datelike, Timelike};
        Self {
            year: time.year() as u16,
            month: time.month() as u8,
            day: time.day() as u8,
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
        }
    }
}

/// Announces the start of a new track (tag 0x01, length 21)
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct TrackHeaderRecord {
    pub start: DateTimeField,
    /// Declared sample period in seconds
    pub interval_s: u16,
    pub sample_count: u32,
    pub duration_s: u32,
    pub distance_m: u32,
}

/// Field codes a periodic header may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeriodicField {
    HeartRate = 0x01,
    Cadence = 0x02,
    Speed = 0x03,
    Altitude = 0x04,
    Temperature = 0x05,
    Battery = 0x06,
}

impl PeriodicField {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::HeartRate),
            0x02 => Some(Self::Cadence),
            0x03 => Some(Self::Speed),
            0x04 => Some(Self::Altitude),
            0x05 => Some(Self::Temperature),
            0x06 => Some(Self::Battery),
            _ => None,
        }
    }

    pub fn width(self) -> u8 {
        match self {
            Self::HeartRate | Self::Cadence | Self::Battery => 1,
            Self::Speed | Self::Altitude | Self::Temperature => 2,
        }
    }
}

/// One field slot of a periodic sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct PeriodicFieldDescriptor {
    pub code: u8,
    pub offset: u16,
    pub width: u8,
}

/// Declares the layout of subsequent periodic samples (tag 0x02)
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct PeriodicHeaderRecord {
    /// Declared sample period in seconds
    pub period_s: u16,
    pub field_count: u8,
    #[br(count = field_count)]
    pub fields: Vec<PeriodicFieldDescriptor>,
}

/// Absolute GPS fix (tag 0x04, length 14)
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct GpsBaseRecord {
    /// Latitude in 1e-7 degrees
    pub lat_e7: i32,
    /// Longitude in 1e-7 degrees
    pub lon_e7: i32,
    /// Estimated horizontal position error in cm
    pub ehpe_cm: u16,
    pub satellites: u8,
    /// Ground speed in cm/s
    pub speed_cms: u16,
    pub fix: u8,
}

/// Small position delta (tag 0x05, length 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct GpsSmallRecord {
    pub dlat: i16,
    pub dlon: i16,
}

/// Larger position delta with fix metadata (tag 0x06, length 11)
///
/// The deltas are signed 24-bit fields and must be sign-extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct GpsLargeRecord {
    pub dlat: [u8; 3],
    pub dlon: [u8; 3],
    pub ehpe_cm: u16,
    pub satellites: u8,
    pub speed_cms: u16,
}

/// Wall-clock base subsequent timestamps are relative to (tag 0x07)
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct TimeReferenceRecord {
    pub time: DateTimeField,
}

/// Lap marker (tag 0x08, length 11)
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct LapRecord {
    pub lap_type: u8,
    /// Seconds since the track started
    pub elapsed_s: u32,
    pub distance_m: u32,
    pub speed_cms: u16,
}

pub fn sign_extend_24(bytes: [u8; 3]) -> i32 {
    let raw = (bytes[0] as i32) | (bytes[1] as i32) << 8 | (bytes[2] as i32) << 16;
    (raw << 8) >> 8
}

/// Values of one decoded periodic sample. Fields the layout did not declare
/// stay `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeriodicValues {
    pub heart_rate_bpm: Option<u8>,
    pub cadence_rpm: Option<u8>,
    pub speed_cms: Option<u16>,
    pub altitude_m: Option<i16>,
    pub temperature_dc: Option<i16>,
    pub battery_pct: Option<u8>,
}

/// One decoded GPS position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsPoint {
    pub lat_e7: i32,
    pub lon_e7: i32,
    pub ehpe_cm: Option<u16>,
    pub satellites: Option<u8>,
    pub speed_cms: Option<u16>,
    pub fix: bool,
}

impl GpsPoint {
    pub fn latitude(&self) -> f64 {
        self.lat_e7 as f64 * 1e-7
    }

    pub fn longitude(&self) -> f64 {
        self.lon_e7 as f64 * 1e-7
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleKind {
    Periodic(PeriodicValues),
    Gps(GpsPoint),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: NaiveDateTime,
    pub kind: SampleKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lap {
    pub time: NaiveDateTime,
    pub lap_type: u8,
    pub elapsed_s: u32,
    pub distance_m: u32,
    pub speed_cms: u16,
}

/// One recorded activity, immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub start_time: NaiveDateTime,
    /// Declared sample period, preserved from the last periodic header.
    pub interval_s: u16,
    pub header_sample_count: u32,
    pub duration_s: u32,
    pub distance_m: u32,
    pub samples: Vec<Sample>,
    pub laps: Vec<Lap>,
    pub truncated: bool,
}

impl Track {
    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            start_time: self.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            distance_m: self.distance_m,
            samples: self.header_sample_count,
            interval_s: self.interval_s,
            truncated: self.truncated,
        }
    }
}

/// The line the track listing prints, one per track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackSummary {
    pub start_time: String,
    pub distance_m: u32,
    pub samples: u32,
    pub interval_s: u16,
    pub truncated: bool,
}

/// Where and why decoding stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    /// Offset within the logical chain stream.
    pub offset: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct DecodeOutcome {
    pub tracks: Vec<Track>,
    pub failure: Option<DecodeFailure>,
}

/// Resolved periodic sample layout.
#[derive(Debug, Clone)]
struct PeriodicLayout {
    fields: Vec<(PeriodicField, usize)>,
    len: usize,
}

impl PeriodicLayout {
    fn from_header(header: &PeriodicHeaderRecord) -> std::result::Result<Self, String> {
        let mut fields = Vec::with_capacity(header.fields.len());
        let mut len = 0usize;
        for descriptor in &header.fields {
            let field = PeriodicField::from_u8(descriptor.code).ok_or_else(|| {
                format!(
                    "periodic header declares unknown field code {:#04x}",
                    descriptor.code
                )
            })?;
            if descriptor.width != field.width() {
                return Err(format!(
                    "periodic header declares {}-byte width for field {:?}, expected {}",
                    descriptor.width,
                    field,
                    field.width()
                ));
            }
            let end = descriptor.offset as usize + descriptor.width as usize;
            len = len.max(end);
            fields.push((field, descriptor.offset as usize));
        }
        if len == 0 {
            return Err("periodic header declares no fields".to_string());
        }
        Ok(Self { fields, len })
    }

    fn decode(&self, bytes: &[u8]) -> PeriodicValues {
        let mut values = PeriodicValues::default();
        for &(field, offset) in &self.fields {
            match field {
                PeriodicField::HeartRate => values.heart_rate_bpm = Some(bytes[offset]),
                PeriodicField::Cadence => values.cadence_rpm = Some(bytes[offset]),
                PeriodicField::Battery => values.battery_pct = Some(bytes[offset]),
                PeriodicField::Speed => {
                    values.speed_cms = Some(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]))
                }
                PeriodicField::Altitude => {
                    values.altitude_m = Some(i16::from_le_bytes([bytes[offset], bytes[offset + 1]]))
                }
                PeriodicField::Temperature => {
                    values.temperature_dc =
                        Some(i16::from_le_bytes([bytes[offset], bytes[offset + 1]]))
                }
            }
        }
        values
    }
}

struct TrackBuilder {
    start_time: NaiveDateTime,
    interval_s: u16,
    header: TrackHeaderRecord,
    layout: Option<PeriodicLayout>,
    time_base: NaiveDateTime,
    ticks: i64,
    lat: Option<i32>,
    lon: Option<i32>,
    samples: Vec<Sample>,
    laps: Vec<Lap>,
    truncated: bool,
}

impl TrackBuilder {
    fn new(header: TrackHeaderRecord) -> std::result::Result<Self, String> {
        let start = header
            .start
            .to_naive()
            .ok_or_else(|| "track header carries an invalid date".to_string())?;
        Ok(Self {
            start_time: start,
            interval_s: header.interval_s,
            layout: None,
            time_base: start,
            ticks: 0,
            lat: None,
            lon: None,
            samples: Vec::new(),
            laps: Vec::new(),
            truncated: false,
            header,
        })
    }

    /// Timestamp for the next sample: the time reference plus the
    /// accumulated declared interval.
    fn stamp(&mut self) -> NaiveDateTime {
        let time = self.time_base + Duration::seconds(self.ticks * self.interval_s as i64);
        self.ticks += 1;
        time
    }

    fn push_gps(&mut self, point: GpsPoint) {
        self.lat = Some(point.lat_e7);
        self.lon = Some(point.lon_e7);
        let time = self.stamp();
        self.samples.push(Sample {
            time,
            kind: SampleKind::Gps(point),
        });
    }

    fn finish(self) -> Track {
        let truncated = self.truncated || self.samples.len() != self.header.sample_count as usize;
        Track {
            start_time: self.start_time,
            interval_s: self.interval_s,
            header_sample_count: self.header.sample_count,
            duration_s: self.header.duration_s,
            distance_m: self.header.distance_m,
            samples: self.samples,
            laps: self.laps,
            truncated,
        }
    }
}

/// Decode the track chain's logical byte stream into tracks.
///
/// Consumes the entire input, or stops at the offset reported in
/// `failure`; tracks decoded before a failure remain valid, with the track
/// open at the failure closed as truncated.
pub fn decode_tracks(data: &[u8]) -> DecodeOutcome {
    let mut cursor = Cursor::new(data);
    let mut out = DecodeOutcome::default();
    let mut current: Option<TrackBuilder> = None;

    macro_rules! fail {
        ($offset:expr, $reason:expr) => {{
            out.failure = Some(DecodeFailure {
                offset: $offset,
                reason: $reason.into(),
            });
            if let Some(mut builder) = current.take() {
                builder.truncated = true;
                out.tracks.push(builder.finish());
            }
            break;
        }};
    }

    macro_rules! try_read {
        ($ty:ty, $offset:expr) => {
            match <$ty as BinRead>::read_le(&mut cursor) {
                Ok(value) => value,
                Err(_) => fail!($offset, concat!("partial ", stringify!($ty))),
            }
        };
    }

    while (cursor.position() as usize) < data.len() {
        let record_offset = cursor.position() as usize;
        let mut tag_byte = [0u8; 1];
        cursor
            .read_exact(&mut tag_byte)
            .expect("one byte available inside the stream");

        let tag = match RecordTag::from_u8(tag_byte[0]) {
            Some(tag) => tag,
            None => fail!(
                record_offset,
                format!("unknown sample tag {:#04x}", tag_byte[0])
            ),
        };

        if tag == RecordTag::TrackHeader {
            let header = try_read!(TrackHeaderRecord, record_offset);
            if let Some(builder) = current.take() {
                out.tracks.push(builder.finish());
            }
            match TrackBuilder::new(header) {
                Ok(builder) => current = Some(builder),
                Err(reason) => fail!(record_offset, reason),
            }
            continue;
        }

        let Some(builder) = current.as_mut() else {
            fail!(
                record_offset,
                format!("{} record outside any track", tag.name())
            );
        };

        match tag {
            RecordTag::TrackHeader => unreachable!("handled above"),
            RecordTag::PeriodicHeader => {
                let header = try_read!(PeriodicHeaderRecord, record_offset);
                match PeriodicLayout::from_header(&header) {
                    Ok(layout) => {
                        builder.interval_s = header.period_s;
                        builder.layout = Some(layout);
                    }
                    Err(reason) => fail!(record_offset, reason),
                }
            }
            RecordTag::Periodic => {
                let Some(layout) = builder.layout.clone() else {
                    fail!(record_offset, "periodic sample before any periodic header");
                };
                let mut bytes = vec![0u8; layout.len];
                if cursor.read_exact(&mut bytes).is_err() {
                    fail!(record_offset, "partial periodic sample");
                }
                let values = layout.decode(&bytes);
                let time = builder.stamp();
                builder.samples.push(Sample {
                    time,
                    kind: SampleKind::Periodic(values),
                });
            }
            RecordTag::GpsBase => {
                let record = try_read!(GpsBaseRecord, record_offset);
                builder.push_gps(GpsPoint {
                    lat_e7: record.lat_e7,
                    lon_e7: record.lon_e7,
                    ehpe_cm: Some(record.ehpe_cm),
                    satellites: Some(record.satellites),
                    speed_cms: Some(record.speed_cms),
                    fix: record.fix & 0x01 != 0,
                });
            }
            RecordTag::GpsSmall => {
                let record = try_read!(GpsSmallRecord, record_offset);
                let (Some(lat), Some(lon)) = (builder.lat, builder.lon) else {
                    fail!(record_offset, "GPS delta before any base fix");
                };
                builder.push_gps(GpsPoint {
                    lat_e7: lat.wrapping_add(record.dlat as i32),
                    lon_e7: lon.wrapping_add(record.dlon as i32),
                    ehpe_cm: None,
                    satellites: None,
                    speed_cms: None,
                    fix: true,
                });
            }
            RecordTag::GpsLarge => {
                let record = try_read!(GpsLargeRecord, record_offset);
                let (Some(lat), Some(lon)) = (builder.lat, builder.lon) else {
                    fail!(record_offset, "GPS delta before any base fix");
                };
                builder.push_gps(GpsPoint {
                    lat_e7: lat.wrapping_add(sign_extend_24(record.dlat)),
                    lon_e7: lon.wrapping_add(sign_extend_24(record.dlon)),
                    ehpe_cm: Some(record.ehpe_cm),
                    satellites: Some(record.satellites),
                    speed_cms: Some(record.speed_cms),
                    fix: true,
                });
            }
            RecordTag::TimeReference => {
                let record = try_read!(TimeReferenceRecord, record_offset);
                match record.time.to_naive() {
                    Some(time) => {
                        builder.time_base = time;
                        builder.ticks = 0;
                    }
                    None => fail!(record_offset, "time reference carries an invalid date"),
                }
            }
            RecordTag::Lap => {
                let record = try_read!(LapRecord, record_offset);
                let time = builder.start_time + Duration::seconds(record.elapsed_s as i64);
                builder.laps.push(Lap {
                    time,
                    lap_type: record.lap_type,
                    elapsed_s: record.elapsed_s,
                    distance_m: record.distance_m,
                    speed_cms: record.speed_cms,
                });
            }
        }
    }

    if let Some(builder) = current.take() {
        out.tracks.push(builder.finish());
    }
    out
}

/// The decoded track log plus an optional partial-decode warning.
#[derive(Debug)]
pub struct TrackLog {
    pub tracks: Vec<Track>,
    pub warning: Option<PartialDecode>,
}

/// Warning carried alongside a successfully decoded prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDecode {
    /// Offset within the memory region, when it could be mapped back.
    pub region_offset: Option<u32>,
    pub reason: String,
}

impl std::fmt::Display for PartialDecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.region_offset {
            Some(offset) => write!(f, "partial decode at offset {offset:#010x}: {}", self.reason),
            None => write!(f, "partial decode: {}", self.reason),
        }
    }
}

/// Walk the track chain and decode every track it holds.
///
/// `read` services byte-range reads against the memory region; the chain is
/// only read block by block, never wholesale.
pub fn read_tracks<F>(read: F) -> Result<TrackLog>
where
    F: FnMut(u32, u32) -> Result<Vec<u8>>,
{
    let stream = pmem::chain_stream(ChainKind::Tracks, read)?;
    let outcome = decode_tracks(&stream.bytes);

    let warning = if let Some(at) = stream.truncated_at {
        Some(PartialDecode {
            region_offset: Some(at),
            reason: "entry-block chain broken".to_string(),
        })
    } else {
        outcome.failure.map(|failure| PartialDecode {
            region_offset: stream.region_offset(failure.offset),
            reason: failure.reason,
        })
    };

    Ok(TrackLog {
        tracks: outcome.tracks,
        warning,
    })
}


#[cfg(test)]
pub(crate) mod fixtures {
    //! Canonical synthetic data shared by the decoder and export tests.

    use super::encode;
    use crate::pmem::image::ImageBuilder;
    use crate::pmem::ChainKind;

    pub const HR_FIELD: (u8, u16, u8) = (0x01, 0, 1);

    pub fn hr_sample(bpm: u8) -> Vec<u8> {
        encode::periodic(&[bpm])
    }

    /// The four-track image the README listing comes from. Track 2 is the
    /// ride the reference GPX export was made from.
    pub fn reference_image() -> ImageBuilder {
        let mut records: Vec<Vec<u8>> = Vec::new();

        // 0: short steady-state log, one sample per minute.
        records.push(encode::track_header("2016-10-25T10:35:42", 60, 18, 1080, 0));
        records.push(encode::periodic_header(60, &[HR_FIELD]));
        for i in 0..18 {
            records.push(hr_sample(60 + i as u8));
        }

        // 1: overnight one-second log.
        records.push(encode::track_header(
            "2016-10-25T19:53:35",
            1,
            81889,
            81889,
            373,
        ));
        records.push(encode::periodic_header(1, &[HR_FIELD]));
        for i in 0..81889u32 {
            records.push(hr_sample((50 + i % 40) as u8));
        }

        // 2: a ride, GPS fixes at one second. The pod emits a full-metadata
        // record when the fix quality changes and bare deltas otherwise.
        records.push(encode::track_header(
            "2016-10-26T20:11:06",
            1,
            3427,
            3427,
            36073,
        ));
        records.push(encode::gps_base(520101000, 48101000));
        for i in 0..2883i32 {
            records.push(encode::gps_large((i % 7 - 3) * 10, (i % 5 - 2) * 10));
        }
        for i in 0..543i32 {
            records.push(encode::gps_small(
                (i % 7 - 3) as i16 * 10,
                (i % 5 - 2) as i16 * 10,
            ));
        }

        // 3: second ride.
        records.push(encode::track_header(
            "2016-10-27T06:11:14",
            1,
            3872,
            3872,
            36983,
        ));
        records.push(encode::periodic_header(1, &[HR_FIELD, (0x03, 1, 2)]));
        for i in 0..3872u32 {
            let mut payload = vec![(90 + i % 60) as u8];
            payload.extend(((300 + i % 200) as u16).to_le_bytes());
            records.push(encode::periodic(&payload));
        }

        let mut image = ImageBuilder::new();
        image.write_chain(ChainKind::Tracks, &records);
        image
    }
}
