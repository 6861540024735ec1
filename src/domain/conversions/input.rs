use std::str::FromStr;

use super::{unknown_conversion, ByteFormat};
use crate::error::BluetoothError;

/// Decoding of a characteristic payload into experiment values.
///
/// `offset` skips leading bytes, `length` limits one value's slice (0 means
/// up to the end), and `repeating` is the stride to the next value (0 means
/// a single value).
#[derive(Debug, Clone, PartialEq)]
pub enum InputConversion {
    Simple {
        format: ByteFormat,
        offset: usize,
        length: usize,
        repeating: usize,
    },
    /// Payload is a decimal number in text form.
    Text {
        decimal_point: Option<String>,
        offset: usize,
        length: usize,
        repeating: usize,
    },
    /// Payload is a list of fields, picked by position or by label prefix.
    FormattedText {
        separator: String,
        label: Option<String>,
        index: usize,
    },
}

impl InputConversion {
    pub fn simple(format: ByteFormat) -> Self {
        InputConversion::Simple {
            format,
            offset: 0,
            length: 0,
            repeating: 0,
        }
    }

    /// Decodes all values found in `data`. An empty result means the payload
    /// could not be converted.
    pub fn convert(&self, data: &[u8]) -> Vec<f64> {
        match self {
            InputConversion::Simple {
                format,
                offset,
                length,
                repeating,
            } => slices(data, *offset, *length, *repeating)
                .map_while(|slice| format.decode(slice))
                .collect(),
            InputConversion::Text {
                decimal_point,
                offset,
                length,
                repeating,
            } => slices(data, *offset, *length, *repeating)
                .map_while(|slice| parse_text(slice, decimal_point.as_deref()))
                .collect(),
            InputConversion::FormattedText {
                separator,
                label,
                index,
            } => parse_formatted(data, separator, label.as_deref(), *index)
                .into_iter()
                .collect(),
        }
    }
}

impl FromStr for InputConversion {
    type Err = BluetoothError;

    /// Resolves a plain function name. Parameterized conversions are built by
    /// the configuration entry.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(InputConversion::Text {
                decimal_point: None,
                offset: 0,
                length: 0,
                repeating: 0,
            }),
            "formattedString" => Ok(InputConversion::FormattedText {
                separator: String::new(),
                label: None,
                index: 0,
            }),
            other => other
                .parse::<ByteFormat>()
                .map(InputConversion::simple)
                .map_err(|_| unknown_conversion(other)),
        }
    }
}

fn slices(
    data: &[u8],
    offset: usize,
    length: usize,
    repeating: usize,
) -> impl Iterator<Item = &[u8]> {
    let mut index = offset;
    let mut done = false;
    std::iter::from_fn(move || {
        if done || index >= data.len() {
            return None;
        }
        let mut end = data.len();
        if length > 0 && index + length < end {
            end = index + length;
        }
        let slice = &data[index..end];
        if repeating > 0 {
            index += repeating;
        } else {
            done = true;
        }
        Some(slice)
    })
}

fn parse_text(data: &[u8], decimal_point: Option<&str>) -> Option<f64> {
    let text = String::from_utf8_lossy(data);
    let text = match decimal_point {
        Some(point) if !point.is_empty() => text.replace(point, "."),
        _ => text.into_owned(),
    };
    text.trim().parse::<f64>().ok()
}

fn parse_formatted(data: &[u8], separator: &str, label: Option<&str>, index: usize) -> Option<f64> {
    let text = String::from_utf8_lossy(data);
    let fields: Vec<&str> = if separator.is_empty() {
        vec![text.as_ref()]
    } else {
        text.split(separator).collect()
    };

    match label.filter(|l| !l.is_empty()) {
        Some(label) => fields
            .iter()
            .find(|field| field.starts_with(label))
            .and_then(|field| field[label.len()..].trim().parse().ok()),
        None => fields.get(index).and_then(|field| field.trim().parse().ok()),
    }
}
