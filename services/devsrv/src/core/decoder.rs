//! Register decoder
//!
//! Turns one range's raw word vector into named, typed, scaled readings.
//! Decoding a parameter never fails the tick and never panics: every error
//! path yields a reading with `value: None` and an explanatory error, except
//! a failed scaling equation, which keeps the pre-equation value.
//!
//! Scaling equations are compiled once per device through [`EquationCache`]
//! and reused across ticks; the decoder itself never re-lexes equation text
//! on the polling path.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::trace;

use fieldgw_calc::{CalcError, ScalingEquation};

use crate::core::transport::TransportError;
use crate::model::{DataType, DeviceDefinition, ParameterSpec, Reading, RegisterRange, WordOrder};

static RE_VENDOR_CDAB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)china|energy analyzer").expect("RE_VENDOR_CDAB: invalid regex pattern")
});
static RE_VENDOR_ABCD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)schneider").expect("RE_VENDOR_ABCD: invalid regex pattern"));
static RE_VENDOR_BADC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)siemens").expect("RE_VENDOR_BADC: invalid regex pattern"));

/// Word order assumed for a vendor when the parameter does not specify one
pub fn default_word_order(make: &str) -> WordOrder {
    if RE_VENDOR_CDAB.is_match(make) {
        WordOrder::Cdab
    } else if RE_VENDOR_BADC.is_match(make) {
        WordOrder::Badc
    } else if RE_VENDOR_ABCD.is_match(make) {
        WordOrder::Abcd
    } else {
        WordOrder::Abcd
    }
}

/// Scaling equations compiled ahead of the polling loop
///
/// Built once per device definition; entries are keyed by the equation text
/// so parameters sharing an equation share one operator tree. An equation
/// that fails to compile is kept as its error, which every tick reports as
/// `EQUATION_ERROR` on the affected reading.
#[derive(Debug, Default)]
pub struct EquationCache {
    compiled: HashMap<String, Result<ScalingEquation, CalcError>>,
}

impl EquationCache {
    /// Cache with no precompiled entries; equations are compiled on demand
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile every scaling equation a device definition carries
    pub fn for_device(device: &DeviceDefinition) -> Self {
        let mut compiled = HashMap::new();
        for parameter in device
            .data_points
            .iter()
            .flat_map(|point| point.parser.parameters.iter())
        {
            if let Some(source) = parameter.scaling_equation.as_deref() {
                compiled
                    .entry(source.to_string())
                    .or_insert_with(|| ScalingEquation::parse(source));
            }
        }
        Self { compiled }
    }

    fn apply(&self, source: &str, x: f64) -> Result<f64, CalcError> {
        match self.compiled.get(source) {
            Some(Ok(equation)) => equation.apply(x),
            Some(Err(error)) => Err(error.clone()),
            // Not prebuilt (one-shot callers); compile in place
            None => ScalingEquation::parse(source)?.apply(x),
        }
    }
}

/// Decode every parameter of one successfully read range
pub fn decode_range(
    range: &RegisterRange,
    words: &[u16],
    make: &str,
    parameters: &[ParameterSpec],
    equations: &EquationCache,
) -> Vec<Reading> {
    parameters
        .iter()
        .map(|parameter| decode_parameter(range, words, make, parameter, equations))
        .collect()
}

/// Null readings for a range whose read failed as a whole
pub fn failed_range_readings(
    parameters: &[ParameterSpec],
    error: &TransportError,
) -> Vec<Reading> {
    parameters
        .iter()
        .map(|parameter| Reading {
            name: parameter.name.clone(),
            register_index: parameter.register_index,
            value: None,
            unit: parameter.unit.clone(),
            data_type: parameter.data_type,
            error: Some(format!("RANGE_READ_ERROR: {error}")),
        })
        .collect()
}

/// Decode one parameter out of a word window
pub fn decode_parameter(
    range: &RegisterRange,
    words: &[u16],
    make: &str,
    parameter: &ParameterSpec,
    equations: &EquationCache,
) -> Reading {
    let mut reading = Reading {
        name: parameter.name.clone(),
        register_index: parameter.register_index,
        value: None,
        unit: parameter.unit.clone(),
        data_type: parameter.data_type,
        error: None,
    };

    // 1. Resolve the relative index
    let Some(relative) = range.resolve_index(parameter.register_index) else {
        reading.error = Some(format!(
            "OUT_OF_RANGE: register index {} not addressable in window {}+{}",
            parameter.register_index, range.start_address, range.count
        ));
        return reading;
    };
    let relative = relative as usize;

    // 2. Check the word window
    let word_count = parameter.word_count() as usize;
    if relative + word_count > words.len() {
        reading.error = Some(format!(
            "INSUFFICIENT_WORDS: need {} words at offset {}, have {}",
            word_count,
            relative,
            words.len()
        ));
        return reading;
    }

    let order = parameter
        .byte_order
        .unwrap_or_else(|| default_word_order(make));

    // 3. Interpret the raw words
    let raw = match interpret(parameter, order, &words[relative..relative + word_count]) {
        Ok(value) => value,
        Err(message) => {
            reading.error = Some(message);
            return reading;
        },
    };

    // 4. Scaling factor; a non-finite product reverts to the unscaled value
    let factor = parameter.scaling_factor.unwrap_or(1.0);
    let mut value = if factor != 1.0 {
        let scaled = raw * factor;
        if scaled.is_finite() {
            scaled
        } else {
            raw
        }
    } else {
        raw
    };

    // 5. Scaling equation; failure keeps the pre-equation value
    if let Some(equation) = parameter.scaling_equation.as_deref() {
        match equations.apply(equation, value) {
            Ok(result) => value = result,
            Err(e) => {
                trace!(parameter = %parameter.name, "Scaling equation failed: {e}");
                reading.error = Some(format!("EQUATION_ERROR: {e}"));
            },
        }
    }

    // 6. Round half-to-even to the configured number of digits
    if let Some(digits) = parameter.decimal_point {
        if digits >= 0 {
            let factor = 10f64.powi(digits);
            value = (value * factor).round_ties_even() / factor;
        }
    }

    // 7. Clamp
    if let Some(min) = parameter.min_value {
        value = value.max(min);
    }
    if let Some(max) = parameter.max_value {
        value = value.min(max);
    }

    reading.value = Some(value);
    reading
}

/// Assemble and type-interpret the raw words of one parameter
fn interpret(
    parameter: &ParameterSpec,
    order: WordOrder,
    words: &[u16],
) -> Result<f64, String> {
    match parameter.data_type {
        DataType::Bit => {
            let word = words[0];
            let set = if let Some(mask) = parameter.bitmask {
                word & mask != 0
            } else {
                let position = parameter.bit_position.unwrap_or(0);
                if position > 15 {
                    return Err(format!("OUT_OF_RANGE: bit position {position} exceeds 15"));
                }
                word & (1 << position) != 0
            };
            Ok(if set { 1.0 } else { 0.0 })
        },
        DataType::Uint16 => Ok(f64::from(single_word(words[0], order))),
        DataType::Int16 => Ok(f64::from(single_word(words[0], order) as i16)),
        DataType::Uint32 => Ok(f64::from(u32::from_be_bytes(assemble(order, words)))),
        DataType::Int32 => Ok(f64::from(i32::from_be_bytes(assemble(order, words)))),
        DataType::Float32 => {
            let value = f32::from_be_bytes(assemble(order, words));
            if value.is_finite() {
                Ok(f64::from(value))
            } else {
                Err("NON_FINITE: register pattern is not a finite float".to_string())
            }
        },
    }
}

/// Apply the leading byte pair of the order to a single word
fn single_word(word: u16, order: WordOrder) -> u16 {
    if order.swaps_single_word() {
        word.swap_bytes()
    } else {
        word
    }
}

/// Inverse of [`assemble`]: registers that carry a 32-bit big-endian value
///
/// Used by the control path to lay out FC 6/16 payloads.
pub fn encode_words(order: WordOrder, bytes: [u8; 4]) -> [u16; 2] {
    let [a, b, c, d] = bytes;
    let (first, second) = match order {
        WordOrder::Abcd => ([a, b], [c, d]),
        WordOrder::Cdab => ([c, d], [a, b]),
        WordOrder::Badc => ([b, a], [d, c]),
        WordOrder::Dcba => ([d, c], [b, a]),
    };
    [u16::from_be_bytes(first), u16::from_be_bytes(second)]
}

/// Lay two registers out as the four bytes of a 32-bit big-endian value
fn assemble(order: WordOrder, words: &[u16]) -> [u8; 4] {
    let [a, b] = words[0].to_be_bytes();
    let [c, d] = words[1].to_be_bytes();
    match order {
        WordOrder::Abcd => [a, b, c, d],
        WordOrder::Cdab => [c, d, a, b],
        WordOrder::Badc => [b, a, d, c],
        WordOrder::Dcba => [d, c, b, a],
    }
}
