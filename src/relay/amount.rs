//! Fee and ratio conversion between the two legs of a swap

use crate::error::{DeputyError, DeputyResult};

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

/// Exact positive rational parsed from a decimal string such as `"1"` or `"0.995"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionRatio {
    numerator: u128,
    denominator: u128,
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl ConversionRatio {
    pub const ONE: ConversionRatio = ConversionRatio {
        numerator: 1,
        denominator: 1,
    };

    pub fn new(numerator: u128, denominator: u128) -> DeputyResult<Self> {
        if numerator == 0 || denominator == 0 {
            return Err(DeputyError::UnsupportedRatio(format!(
                "{}/{} is not positive",
                numerator, denominator
            )));
        }
        let divisor = gcd(numerator, denominator);
        Ok(Self {
            numerator: numerator / divisor,
            denominator: denominator / divisor,
        })
    }

    pub fn is_one(&self) -> bool {
        *self == Self::ONE
    }

    /// `floor((amount - fee) * ratio)`, rejecting swaps that leave nothing to send
    pub fn convert(&self, amount: u128, fee: u128) -> DeputyResult<u128> {
        if amount <= fee {
            return Err(DeputyError::InvalidSwap(format!(
                "amount {} does not cover fee {}",
                amount, fee
            )));
        }
        let out = (amount - fee)
            .checked_mul(self.numerator)
            .map(|scaled| scaled / self.denominator)
            .ok_or_else(|| DeputyError::InvalidSwap(format!("amount {} overflows", amount)))?;
        if out == 0 {
            return Err(DeputyError::InvalidSwap(format!(
                "amount {} converts to zero at ratio {}",
                amount, self
            )));
        }
        Ok(out)
    }
}

impl Default for ConversionRatio {
    fn default() -> Self {
        Self::ONE
    }
}

impl FromStr for ConversionRatio {
    type Err = DeputyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DeputyError::UnsupportedRatio(format!("cannot parse ratio {:?}", s));
        let s = s.trim();
        let (int_part, frac_part) = s.split_once('.').unwrap_or((s, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let digits = format!("{}{}", int_part, frac_part);
        let numerator: u128 = digits.parse().map_err(|_| invalid())?;
        let denominator = u32::try_from(frac_part.len())
            .ok()
            .and_then(|exp| 10u128.checked_pow(exp))
            .ok_or_else(invalid)?;
        Self::new(numerator, denominator)
    }
}

impl fmt::Display for ConversionRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

impl<'de> Deserialize<'de> for ConversionRatio {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
