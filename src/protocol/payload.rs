//! Envelope payload bodies.
//!
//! Name lists travel as JSON arrays of strings and must pass
//! [`is_plausible_text`] before they are decoded. Run values travel as three
//! big-endian sections ordered by the exchanged name lists:
//!
//! ```text
//! u32 n | n x f64 parameters | u32 m | m x f64 observations | f64 run_seconds
//! ```

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Name to value mapping for parameters and observations
pub type NamedValues = BTreeMap<String, f64>;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("payload is not plausible text")]
    NotText,

    #[error("malformed name list: {0}")]
    MalformedNames(#[from] serde_json::Error),

    #[error("payload truncated: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("expected {expected} {what} values, payload carries {actual}")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("no value for {what} '{name}'")]
    MissingValue { what: &'static str, name: String },
}

/// Decoded run values, keyed by name.
#[derive(Debug, Clone, PartialEq)]
pub struct RunValues {
    pub parameters: NamedValues,
    pub observations: NamedValues,
    pub run_seconds: f64,
}

/// True when `bytes` is UTF-8 without control characters other than tab,
/// carriage return and line feed.
pub fn is_plausible_text(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(text) => text
            .chars()
            .all(|c| !c.is_control() || matches!(c, '\t' | '\r' | '\n')),
        Err(_) => false,
    }
}

pub fn encode_names(names: &[String]) -> Result<Vec<u8>, PayloadError> {
    Ok(serde_json::to_vec(names)?)
}

pub fn decode_names(bytes: &[u8]) -> Result<Vec<String>, PayloadError> {
    if !is_plausible_text(bytes) {
        return Err(PayloadError::NotText);
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode raw value sections in wire order.
pub fn encode_values(parameters: &[f64], observations: &[f64], run_seconds: f64) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + 8 * (parameters.len() + observations.len()));
    put_section(&mut buf, parameters);
    put_section(&mut buf, observations);
    buf.put_f64(run_seconds);
    buf.freeze()
}

/// Decode a START_RUN payload against the current parameter-name list.
///
/// The observation section and run time are ignored.
pub fn decode_parameters(bytes: &[u8], names: &[String]) -> Result<NamedValues, PayloadError> {
    let mut buf = bytes;
    let values = get_section(&mut buf)?;
    zip_named("parameter", names, values)
}

/// Encode the RUN_FINISHED payload. Every name in `observation_names` must
/// have a value in `observations`.
pub fn encode_run_output(
    parameters: &NamedValues,
    parameter_names: &[String],
    observations: &NamedValues,
    observation_names: &[String],
    run_seconds: f64,
) -> Result<Bytes, PayloadError> {
    let pars = ordered_values("parameter", parameters, parameter_names)?;
    let obs = ordered_values("observation", observations, observation_names)?;
    Ok(encode_values(&pars, &obs, run_seconds))
}

pub fn decode_run_output(
    bytes: &[u8],
    parameter_names: &[String],
    observation_names: &[String],
) -> Result<RunValues, PayloadError> {
    let mut buf = bytes;
    let pars = get_section(&mut buf)?;
    let obs = get_section(&mut buf)?;
    ensure_remaining(&buf, 8)?;
    let run_seconds = buf.get_f64();
    Ok(RunValues {
        parameters: zip_named("parameter", parameter_names, pars)?,
        observations: zip_named("observation", observation_names, obs)?,
        run_seconds,
    })
}

fn put_section(buf: &mut BytesMut, values: &[f64]) {
    buf.put_u32(values.len() as u32);
    for value in values {
        buf.put_f64(*value);
    }
}

fn get_section(buf: &mut &[u8]) -> Result<Vec<f64>, PayloadError> {
    ensure_remaining(buf, 4)?;
    let count = buf.get_u32() as usize;
    ensure_remaining(buf, count.saturating_mul(8))?;
    Ok((0..count).map(|_| buf.get_f64()).collect())
}

fn ensure_remaining(buf: &&[u8], needed: usize) -> Result<(), PayloadError> {
    if buf.remaining() < needed {
        return Err(PayloadError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn zip_named(
    what: &'static str,
    names: &[String],
    values: Vec<f64>,
) -> Result<NamedValues, PayloadError> {
    if names.len() != values.len() {
        return Err(PayloadError::CountMismatch {
            what,
            expected: names.len(),
            actual: values.len(),
        });
    }
    Ok(names.iter().cloned().zip(values).collect())
}

fn ordered_values(
    what: &'static str,
    values: &NamedValues,
    names: &[String],
) -> Result<Vec<f64>, PayloadError> {
    names
        .iter()
        .map(|name| {
            values
                .get(name)
                .copied()
                .ok_or_else(|| PayloadError::MissingValue {
                    what,
                    name: name.clone(),
                })
        })
        .collect()
}
