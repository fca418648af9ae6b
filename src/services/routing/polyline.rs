//! Encoded polyline codec
//!
//! Valhalla-style encoding at 6 decimal places (Google's classic format uses
//! 5). The encoding is lossless at the chosen precision.

use anyhow::Result;

use crate::types::Coordinates;

/// Encode a coordinate sequence into an ASCII polyline.
pub fn encode(points: &[Coordinates], precision: u32) -> String {
    let factor = 10_f64.powi(precision as i32);
    let mut out = String::new();
    let mut prev_lat = 0i64;
    let mut prev_lng = 0i64;

    for p in points {
        let lat = (p.lat * factor).round() as i64;
        let lng = (p.lng * factor).round() as i64;
        encode_value(lat - prev_lat, &mut out);
        encode_value(lng - prev_lng, &mut out);
        prev_lat = lat;
        prev_lng = lng;
    }

    out
}

fn encode_value(value: i64, out: &mut String) {
    let mut v = if value < 0 { !(value << 1) } else { value << 1 };
    while v >= 0x20 {
        out.push((((0x20 | (v & 0x1f)) + 63) as u8) as char);
        v >>= 5;
    }
    out.push(((v + 63) as u8) as char);
}

/// Decode an encoded polyline into coordinates.
pub fn decode(encoded: &str, precision: u32) -> Result<Vec<Coordinates>> {
    let factor = 10_f64.powi(precision as i32);
    let mut coordinates = Vec::new();
    let mut lat = 0i64;
    let mut lng = 0i64;

    let bytes = encoded.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let dlat = decode_value(bytes, &mut i)?;
        lat += dlat;
        let dlng = decode_value(bytes, &mut i)?;
        lng += dlng;

        coordinates.push(Coordinates {
            lat: lat as f64 / factor,
            lng: lng as f64 / factor,
        });
    }

    Ok(coordinates)
}

fn decode_value(bytes: &[u8], i: &mut usize) -> Result<i64> {
    let mut shift = 0;
    let mut result = 0i64;
    loop {
        if *i >= bytes.len() {
            anyhow::bail!("invalid polyline encoding");
        }
        let byte = bytes[*i] as i64 - 63;
        *i += 1;
        result |= (byte & 0x1f) << shift;
        shift += 5;
        if byte < 0x20 {
            break;
        }
    }
    Ok(if result & 1 != 0 { !(result >> 1) } else { result >> 1 })
}

/// Concatenate leg polylines, skipping the duplicated joint point between
/// consecutive legs, and re-encode as one line.
pub fn join_legs(legs: &[String], precision: u32) -> Result<String> {
    let mut all = Vec::new();
    for (i, leg) in legs.iter().enumerate() {
        let coords = decode(leg, precision)?;
        if i == 0 {
            all.extend(coords);
        } else {
            all.extend(coords.into_iter().skip(1));
        }
    }
    Ok(encode(&all, precision))
}
