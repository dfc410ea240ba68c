//! Fixed-point credit amounts.
//!
//! Credits are stored as signed 64-bit integers of hundredths ("minor
//! units"). Balances are never negative, but ledger entry amounts are
//! signed (DEDUCT is negative), so the type itself allows both. No floats,
//! anywhere. `"1.5"` parses to 150 minor units and displays as `"1.50"`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minor units per whole credit.
pub const MINOR_PER_CREDIT: i64 = 100;

/// Decimal places carried by [`Credits`].
pub const CREDIT_DECIMALS: usize = 2;

/// Errors raised while parsing a credit amount.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCreditsError {
    #[error("empty amount")]
    Empty,

    #[error("invalid amount '{0}'")]
    Invalid(String),

    #[error("amount '{0}' has more than {CREDIT_DECIMALS} decimal places")]
    TooPrecise(String),

    #[error("amount '{0}' is out of range")]
    OutOfRange(String),
}

/// A fixed-point credit amount with two decimal places.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Credits(i64);

impl Credits {
    /// Zero credits.
    pub const ZERO: Credits = Credits(0);

    /// Wraps a raw minor-unit value.
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Whole credits, or `None` on overflow.
    pub fn from_whole(whole: i64) -> Option<Self> {
        whole.checked_mul(MINOR_PER_CREDIT).map(Self)
    }

    /// The raw minor-unit value.
    pub const fn minor(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Credits) -> Option<Credits> {
        self.0.checked_add(other.0).map(Credits)
    }

    pub fn checked_sub(self, other: Credits) -> Option<Credits> {
        self.0.checked_sub(other.0).map(Credits)
    }

    pub fn checked_neg(self) -> Option<Credits> {
        self.0.checked_neg().map(Credits)
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per = MINOR_PER_CREDIT as u64;
        write!(f, "{}{}.{:02}", sign, abs / per, abs % per)
    }
}

impl fmt::Debug for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credits({})", self)
    }
}

impl FromStr for Credits {
    type Err = ParseCreditsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseCreditsError::Empty);
        }

        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };

        let (whole, frac) = match body.split_once('.') {
            Some((w, f)) => (w, f),
            None => (body, ""),
        };

        let digits_only = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (whole.is_empty() && frac.is_empty()) || !digits_only(whole) || !digits_only(frac) {
            return Err(ParseCreditsError::Invalid(s.to_string()));
        }
        if frac.len() > CREDIT_DECIMALS {
            return Err(ParseCreditsError::TooPrecise(s.to_string()));
        }

        let out_of_range = || ParseCreditsError::OutOfRange(s.to_string());
        let whole_value: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| out_of_range())?
        };
        let frac_value: i64 = format!("{:0<width$}", frac, width = CREDIT_DECIMALS)
            .parse()
            .map_err(|_| ParseCreditsError::Invalid(s.to_string()))?;

        let minor = whole_value
            .checked_mul(MINOR_PER_CREDIT)
            .and_then(|w| w.checked_add(frac_value))
            .ok_or_else(out_of_range)?;

        Ok(Credits(if negative { -minor } else { minor }))
    }
}
