//! Normalizes Kubernetes resource quantities as reported by the metrics API.
//!
//! CPU usage is reported in cores with an optional SI suffix (`250m`,
//! `250000u`, `250000000n`, `0.25`) and memory usage in bytes with an optional
//! binary or decimal suffix (`200Mi`, `209715200`, `1G`). Both are normalized
//! to a single unit so samples from different pods can be folded together.
use thiserror::Error;

/// Errors produced while parsing a quantity string.
#[derive(Debug, Error, PartialEq)]
pub enum QuantityError {
    /// The quantity was empty or only whitespace.
    #[error("empty quantity")]
    Empty,
    /// The numeric part of the quantity could not be parsed.
    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),
    /// The suffix is not a known SI, binary or exponent suffix.
    #[error("unsupported suffix {suffix:?} in quantity {quantity:?}")]
    UnsupportedSuffix {
        /// Full quantity string
        quantity: String,
        /// Offending suffix
        suffix: String,
    },
}

/// Scale applied to the numeric part of a quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Scale {
    /// Power of ten.
    Decimal(i32),
    /// Power of two.
    Binary(i32),
}

impl Scale {
    fn from_suffix(suffix: &str) -> Option<Self> {
        let scale = match suffix {
            "" => Scale::Decimal(0),
            "n" => Scale::Decimal(-9),
            "u" => Scale::Decimal(-6),
            "m" => Scale::Decimal(-3),
            "k" => Scale::Decimal(3),
            "M" => Scale::Decimal(6),
            "G" => Scale::Decimal(9),
            "T" => Scale::Decimal(12),
            "P" => Scale::Decimal(15),
            "E" => Scale::Decimal(18),
            "Ki" => Scale::Binary(10),
            "Mi" => Scale::Binary(20),
            "Gi" => Scale::Binary(30),
            "Ti" => Scale::Binary(40),
            "Pi" => Scale::Binary(50),
            "Ei" => Scale::Binary(60),
            exp => {
                // Exponent notation, e.g. 1e3 or 12E-2
                let digits = exp.strip_prefix('e').or_else(|| exp.strip_prefix('E'))?;
                Scale::Decimal(digits.parse().ok()?)
            }
        };
        Some(scale)
    }

    /// Apply the scale plus an extra power of ten to value.
    ///
    /// Negative powers divide by an exact power of ten so values such as
    /// `250000000n` normalize without rounding noise.
    fn apply(self, value: f64, extra_decimal: i32) -> f64 {
        match self {
            Scale::Decimal(exp) => shift_decimal(value, exp + extra_decimal),
            Scale::Binary(exp) => shift_decimal(value * 2f64.powi(exp), extra_decimal),
        }
    }
}

fn shift_decimal(value: f64, exp: i32) -> f64 {
    if exp >= 0 {
        value * 10f64.powi(exp)
    } else {
        value / 10f64.powi(-exp)
    }
}

/// Split a quantity into its numeric part and its suffix.
fn split(quantity: &str) -> Result<(f64, Scale), QuantityError> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return Err(QuantityError::Empty);
    }
    let idx = quantity
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(idx);
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::InvalidNumber(quantity.to_owned()))?;
    let scale = Scale::from_suffix(suffix).ok_or_else(|| QuantityError::UnsupportedSuffix {
        quantity: quantity.to_owned(),
        suffix: suffix.to_owned(),
    })?;
    Ok((value, scale))
}

/// Parse a CPU quantity into milli-cores.
pub fn cpu_millicores(quantity: &str) -> Result<f64, QuantityError> {
    let (value, scale) = split(quantity)?;
    Ok(scale.apply(value, 3))
}

/// Parse a memory quantity into bytes.
pub fn memory_bytes(quantity: &str) -> Result<f64, QuantityError> {
    let (value, scale) = split(quantity)?;
    Ok(scale.apply(value, 0))
}
