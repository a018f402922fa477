//! Conversion between protocol variants and typed channel values
//!
//! Server values are converted to whatever [`ValueType`] the channel asks
//! for. Integer targets are range checked, floating point sources only
//! convert to integers when they carry no fraction, and strings are parsed.
//! A failed conversion fails the record it belongs to, never the whole read.

use thiserror::Error;
use uadrv_core::{ChannelRecord, Value, ValueType};

use crate::transport::types::{DataValue, Variant};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConversionError {
    #[error("server returned no value")]
    Empty,

    #[error("cannot convert {from} to {to}")]
    Unsupported { from: &'static str, to: ValueType },

    #[error("value {value} out of range for {to}")]
    OutOfRange { value: String, to: ValueType },

    #[error("cannot parse '{value}' as {to}")]
    Parse { value: String, to: ValueType },
}

/// Convert a server variant to the requested channel type
pub fn to_value(variant: &Variant, target: ValueType) -> Result<Value, ConversionError> {
    if matches!(variant, Variant::Empty) {
        return Err(ConversionError::Empty);
    }

    match target {
        ValueType::Boolean => to_bool(variant).map(Value::Boolean),
        ValueType::Integer => {
            let wide = to_integer(variant, target)?;
            i32::try_from(wide)
                .map(Value::Integer)
                .map_err(|_| out_of_range(variant, target))
        }
        ValueType::Long => {
            let wide = to_integer(variant, target)?;
            i64::try_from(wide)
                .map(Value::Long)
                .map_err(|_| out_of_range(variant, target))
        }
        ValueType::Float => {
            let v = to_double(variant, target)?;
            if v.is_finite() && v.abs() > f32::MAX as f64 {
                return Err(out_of_range(variant, target));
            }
            Ok(Value::Float(v as f32))
        }
        ValueType::Double => to_double(variant, target).map(Value::Double),
        ValueType::String => Ok(Value::String(variant.to_string())),
        ValueType::ByteArray => match variant {
            Variant::ByteString(bytes) => Ok(Value::ByteArray(bytes.clone())),
            Variant::String(s) | Variant::LocalizedText(s) => {
                Ok(Value::ByteArray(s.as_bytes().to_vec()))
            }
            other => Err(unsupported(other, target)),
        },
    }
}

/// Convert a channel value to the variant written to the server
pub fn to_variant(value: &Value) -> Variant {
    match value {
        Value::Boolean(v) => Variant::Boolean(*v),
        Value::Integer(v) => Variant::Int32(*v),
        Value::Long(v) => Variant::Int64(*v),
        Value::Float(v) => Variant::Float(*v),
        Value::Double(v) => Variant::Double(*v),
        Value::String(v) => Variant::String(v.clone()),
        Value::ByteArray(v) => Variant::ByteString(v.clone()),
    }
}

/// Store a server result into a channel record
///
/// Bad status codes and conversion failures mark the record failed.
pub fn fill_record(record: &mut ChannelRecord, data: &DataValue) {
    if data.status.is_bad() {
        record.set_failure(data.status.to_string());
        return;
    }
    match to_value(&data.value, record.value_type) {
        Ok(value) => record.set_value(value),
        Err(e) => record.set_failure(e.to_string()),
    }
}

fn unsupported(variant: &Variant, to: ValueType) -> ConversionError {
    ConversionError::Unsupported {
        from: variant.type_name(),
        to,
    }
}

fn out_of_range(variant: &Variant, to: ValueType) -> ConversionError {
    ConversionError::OutOfRange {
        value: variant.to_string(),
        to,
    }
}

fn integer_of(variant: &Variant) -> Option<i128> {
    let v = match variant {
        Variant::Boolean(v) => *v as i128,
        Variant::SByte(v) => *v as i128,
        Variant::Byte(v) => *v as i128,
        Variant::Int16(v) => *v as i128,
        Variant::UInt16(v) => *v as i128,
        Variant::Int32(v) => *v as i128,
        Variant::UInt32(v) => *v as i128,
        Variant::Int64(v) => *v as i128,
        Variant::UInt64(v) => *v as i128,
        _ => return None,
    };
    Some(v)
}

fn to_bool(variant: &Variant) -> Result<bool, ConversionError> {
    if let Some(v) = integer_of(variant) {
        return Ok(v != 0);
    }
    match variant {
        Variant::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConversionError::Parse {
                value: s.clone(),
                to: ValueType::Boolean,
            }),
        },
        other => Err(unsupported(other, ValueType::Boolean)),
    }
}

fn to_integer(variant: &Variant, target: ValueType) -> Result<i128, ConversionError> {
    if let Some(v) = integer_of(variant) {
        return Ok(v);
    }
    let float = match variant {
        Variant::Float(v) => *v as f64,
        Variant::Double(v) => *v,
        Variant::String(s) => {
            return s.trim().parse::<i128>().map_err(|_| ConversionError::Parse {
                value: s.clone(),
                to: target,
            })
        }
        other => return Err(unsupported(other, target)),
    };
    if !float.is_finite() || float.fract() != 0.0 || float.abs() > i64::MAX as f64 {
        return Err(out_of_range(variant, target));
    }
    Ok(float as i128)
}

fn to_double(variant: &Variant, target: ValueType) -> Result<f64, ConversionError> {
    if let Some(v) = integer_of(variant) {
        return Ok(v as f64);
    }
    match variant {
        Variant::Float(v) => Ok(*v as f64),
        Variant::Double(v) => Ok(*v),
        Variant::String(s) => s.trim().parse::<f64>().map_err(|_| ConversionError::Parse {
            value: s.clone(),
            to: target,
        }),
        other => Err(unsupported(other, target)),
    }
}
