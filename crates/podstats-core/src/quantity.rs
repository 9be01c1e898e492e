//! Kubernetes resource quantities.
//!
//! A quantity is carried as an arbitrary-precision decimal: an unscaled
//! integer mantissa plus a base-10 scale, so `100m` is `100 × 10⁻³` and
//! `1342177280` with scale `1` is `134217728`. Binary suffixes (`Ki`, `Mi`,
//! …) are folded into the mantissa.

use std::str::FromStr;

use serde::Deserialize;

use crate::error::QuantityError;

/// A resource quantity: `unscaled / 10^scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Quantity {
    unscaled: i128,
    scale: i32,
}

impl Quantity {
    pub const ZERO: Quantity = Quantity {
        unscaled: 0,
        scale: 0,
    };

    /// Build a quantity from its mantissa and base-10 scale.
    pub fn new(unscaled: i128, scale: i32) -> Self {
        Self { unscaled, scale }
    }

    pub fn unscaled(&self) -> i128 {
        self.unscaled
    }

    pub fn scale(&self) -> i32 {
        self.scale
    }

    /// Convert to floating point as `unscaled / 10^scale`.
    ///
    /// Precision is lost for mantissas beyond 2^53, which is acceptable for
    /// monitoring-grade values.
    pub fn as_f64(&self) -> f64 {
        let mantissa = self.unscaled as f64;
        if self.scale >= 0 {
            mantissa / 10f64.powi(self.scale)
        } else {
            mantissa * 10f64.powi(-self.scale)
        }
    }
}

impl Default for Quantity {
    fn default() -> Self {
        Self::ZERO
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }
        let overflow = || QuantityError::Overflow(s.to_string());

        let (negative, rest) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, suffix) = rest.split_at(number_end);
        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if (int_part.is_empty() && frac_part.is_empty()) || frac_part.contains('.') {
            return Err(QuantityError::Malformed(s.to_string()));
        }

        let mut unscaled: i128 = 0;
        for digit in int_part.bytes().chain(frac_part.bytes()) {
            unscaled = unscaled
                .checked_mul(10)
                .and_then(|v| v.checked_add(i128::from(digit - b'0')))
                .ok_or_else(overflow)?;
        }
        let mut scale = i32::try_from(frac_part.len()).map_err(|_| overflow())?;

        if let Some(power) = binary_power(suffix) {
            let factor = 1024i128.checked_pow(power).ok_or_else(overflow)?;
            unscaled = unscaled.checked_mul(factor).ok_or_else(overflow)?;
        } else {
            let exponent = decimal_exponent(suffix).ok_or_else(|| {
                QuantityError::UnknownSuffix {
                    quantity: s.to_string(),
                    suffix: suffix.to_string(),
                }
            })?;
            scale = scale.checked_sub(exponent).ok_or_else(overflow)?;
        }

        if negative {
            unscaled = -unscaled;
        }
        Ok(Self { unscaled, scale })
    }
}

impl TryFrom<String> for Quantity {
    type Error = QuantityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Power of 1024 for binary SI suffixes.
fn binary_power(suffix: &str) -> Option<u32> {
    match suffix {
        "Ki" => Some(1),
        "Mi" => Some(2),
        "Gi" => Some(3),
        "Ti" => Some(4),
        "Pi" => Some(5),
        "Ei" => Some(6),
        _ => None,
    }
}

/// Power of ten for decimal SI suffixes and `e<n>` exponents.
fn decimal_exponent(suffix: &str) -> Option<i32> {
    match suffix {
        "" => Some(0),
        "n" => Some(-9),
        "u" => Some(-6),
        "m" => Some(-3),
        "k" => Some(3),
        "M" => Some(6),
        "G" => Some(9),
        "T" => Some(12),
        "P" => Some(15),
        "E" => Some(18),
        _ => suffix
            .strip_prefix(['e', 'E'])
            .and_then(|exp| exp.parse::<i32>().ok()),
    }
}
