//! Fixed-point quantization of continuous values
//!
//! Continuous values travel as integers scaled by a documented factor:
//! `q = round(v * scale)`, decoded as `q / scale`. The round-trip error is at
//! most `0.5 / scale`. Angles use [`ANGLE_SCALE`] (hundredths of a degree)
//! in a `u16`. Headings in `[0, 360]` decode within 0.005° of themselves
//! (360 travels as 36000); anything else is first wrapped into `[0, 360)`,
//! so it decodes to the same heading modulo 360.

use super::CodecError;

/// Scale for angles in degrees (error ≤ 0.005°)
pub const ANGLE_SCALE: f32 = 100.0;

fn out_of_range(value: f32, scale: f32) -> CodecError {
    CodecError::OutOfRange {
        value: value.to_string(),
        scale: scale.to_string(),
    }
}

/// Quantize a non-negative value into a `u16`
pub fn quantize_u16(value: f32, scale: f32) -> Result<u16, CodecError> {
    let q = (value * scale).round();
    if !q.is_finite() || q < 0.0 || q > u16::MAX as f32 {
        return Err(out_of_range(value, scale));
    }
    Ok(q as u16)
}

pub fn dequantize_u16(q: u16, scale: f32) -> f32 {
    q as f32 / scale
}

/// Quantize a signed value into an `i16`
pub fn quantize_i16(value: f32, scale: f32) -> Result<i16, CodecError> {
    let q = (value * scale).round();
    if !q.is_finite() || q < i16::MIN as f32 || q > i16::MAX as f32 {
        return Err(out_of_range(value, scale));
    }
    Ok(q as i16)
}

pub fn dequantize_i16(q: i16, scale: f32) -> f32 {
    q as f32 / scale
}

/// Quantize an angle in degrees into hundredths of a degree
pub fn quantize_angle(degrees: f32) -> Result<u16, CodecError> {
    if !degrees.is_finite() {
        return Err(out_of_range(degrees, ANGLE_SCALE));
    }
    let heading = if (0.0..=360.0).contains(&degrees) {
        degrees
    } else {
        degrees.rem_euclid(360.0)
    };
    quantize_u16(heading, ANGLE_SCALE)
}

pub fn dequantize_angle(q: u16) -> f32 {
    dequantize_u16(q, ANGLE_SCALE)
}
