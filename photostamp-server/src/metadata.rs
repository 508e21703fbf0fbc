use std::io::Cursor;

use chrono::NaiveDateTime;
use exif::{In, Tag, Value};

use crate::error::StampError;

/// Marker used when a capture date is absent or unparsable.
pub const DATE_UNKNOWN: &str = "日付不明";

/// Decimal-degree coordinate, derived once from the EXIF DMS triples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoCoordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Typed, partial view over a photo's EXIF directory. Individual missing
/// tags never fail extraction; only a wholly absent directory does.
#[derive(Debug, Clone)]
pub struct CaptureMetadata {
    pub coordinate: Option<GeoCoordinate>,
    pub capture_date: Option<String>,
    /// EXIF orientation code 1-8; 1 means no transform.
    pub orientation: u16,
}

/// Parse geotag, capture date and orientation out of a raw image buffer.
pub fn extract(image_bytes: &[u8]) -> Result<CaptureMetadata, StampError> {
    let mut cursor = Cursor::new(image_bytes);
    let exif = exif::Reader::new()
        .read_from_container(&mut cursor)
        .map_err(|_| StampError::MetadataMissing)?;

    let latitude = read_gps_coord(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef);
    let longitude = read_gps_coord(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef);
    let coordinate = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoCoordinate {
            latitude,
            longitude,
        }),
        _ => None,
    };

    Ok(CaptureMetadata {
        coordinate,
        capture_date: read_capture_date(&exif),
        orientation: read_orientation(&exif),
    })
}

/// Read one GPS axis; requires both the DMS value and its hemisphere ref.
fn read_gps_coord(exif: &exif::Exif, value_tag: Tag, ref_tag: Tag) -> Option<f64> {
    let value_field = exif.get_field(value_tag, In::PRIMARY)?;
    let ref_field = exif.get_field(ref_tag, In::PRIMARY)?;
    let hemisphere = match &ref_field.value {
        Value::Ascii(v) => v
            .first()
            .and_then(|s| s.first())
            .map(|b| *b as char)?,
        _ => return None,
    };
    let dms: Vec<f64> = match &value_field.value {
        Value::Rational(parts) => parts.iter().map(|r| r.to_f64()).collect(),
        _ => Vec::new(),
    };
    Some(dms_to_decimal(&dms, hemisphere))
}

/// Convert a degrees/minutes/seconds triple plus hemisphere reference to
/// decimal degrees. A malformed (non-3-element) array yields 0 rather than
/// failing the extraction; the condition is logged so it stays observable.
pub fn dms_to_decimal(dms: &[f64], hemisphere: char) -> f64 {
    if dms.len() != 3 {
        tracing::warn!(elements = dms.len(), "malformed GPS DMS array, treating as 0");
        return 0.0;
    }
    let dd = dms[0] + dms[1] / 60.0 + dms[2] / 3600.0;
    if matches!(hemisphere, 'S' | 'W') { -dd } else { dd }
}

fn read_capture_date(exif: &exif::Exif) -> Option<String> {
    let field = exif.get_field(Tag::DateTimeOriginal, In::PRIMARY)?;
    let raw = match &field.value {
        Value::Ascii(v) => String::from_utf8_lossy(v.first()?).into_owned(),
        _ => field.display_value().to_string(),
    };
    Some(format_capture_date(&raw))
}

/// Normalize an EXIF `"YYYY:MM:DD HH:MM:SS"` bytestring into the `YYYY/MM/DD`
/// display form; anything unparsable degrades to [`DATE_UNKNOWN`].
pub fn format_capture_date(raw: &str) -> String {
    // Only the date part uses ':' separators, so replace the first two.
    let cleaned = raw.trim().trim_matches('"').replacen(':', "-", 2);
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return dt.format("%Y/%m/%d").to_string();
        }
    }
    DATE_UNKNOWN.to_string()
}

fn read_orientation(exif: &exif::Exif) -> u16 {
    exif.get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|f| match &f.value {
            Value::Short(v) => v.first().copied(),
            _ => None,
        })
        .filter(|v| (1..=8).contains(v))
        .unwrap_or(1)
}
