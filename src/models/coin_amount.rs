use std::fmt::Display;
use std::iter::Sum;
use std::ops::Add;
use std::ops::AddAssign;
use std::ops::Neg;
use std::ops::Sub;
use std::str::FromStr;

use anyhow::bail;
use anyhow::ensure;
use num_traits::CheckedAdd;
use num_traits::CheckedSub;
use num_traits::Zero;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

/// Records an amount of the ledger's native coin. Amounts are internally
/// represented by atomic units, stored as a signed 64 bit integer.
///
/// 1 coin = 10^8 atomic units.
///
/// All arithmetic is exact and there is no conversion from or to `f64`. Sums
/// over many fees and amounts must reconcile to the atomic unit.
///
/// `-` panics. Use `checked_sub` when the
/// result must stay non-negative, or add a negated amount when a signed
/// delta is wanted.
#[derive(Clone, Debug, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct CoinAmount(i64);

impl CoinAmount {
    /// Number of decimal places a coin amount can carry.
    pub const DECIMALS: usize = 8;

    /// 21 million coins. Anything larger is not a valid amount.
    pub const MAX_UNITS: i64 = 21_000_000 * Self::conversion_factor();

    /// The conversion factor between coins and atomic units, 10^8.
    const fn conversion_factor() -> i64 {
        let mut product = 1i64;
        let mut i = 0;
        while i < Self::DECIMALS {
            product *= 10;
            i += 1;
        }
        product
    }

    /// Create an amount of the given number of whole coins.
    pub const fn coins(num_whole_coins: u32) -> Self {
        assert!(
            num_whole_coins <= 21_000_000,
            "Number of coins must be less than 21000000"
        );
        Self(Self::conversion_factor() * num_whole_coins as i64)
    }

    /// Create an amount of `tenths` tenths of a coin, e.g. `tenths(3)` is 0.3.
    pub const fn tenths(tenths: u32) -> Self {
        Self(Self::conversion_factor() / 10 * tenths as i64)
    }

    /// Convert the number of atomic units to a `CoinAmount`.
    pub const fn from_atomic_units(units: i64) -> Self {
        Self(units)
    }

    /// Convert the amount to atomic units.
    pub const fn to_atomic_units(self) -> i64 {
        self.0
    }

    /// Multiply the amount by a non-negative 32-bit number.
    ///
    /// Returns `None` in the case of overflow.
    pub fn checked_scalar_mul(&self, factor: u32) -> Option<Self> {
        self.0.checked_mul(i64::from(factor)).map(Self)
    }

    /// Multiply the amount by a non-negative 32-bit number.
    ///
    /// Crashes in case of overflow.
    pub fn scalar_mul(&self, factor: u32) -> Self {
        self.checked_scalar_mul(factor)
            .expect("Overflow on scalar multiplication not allowed.")
    }

    /// Right-shift the atomic representation; used for subsidy halvings.
    pub fn halvings(self, num_halvings: u32) -> Self {
        if num_halvings >= i64::BITS {
            return Self::zero();
        }
        Self(self.0 >> num_halvings)
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn is_positive(&self) -> bool {
        self.0.is_positive()
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }
}

impl Add for CoinAmount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for CoinAmount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sum for CoinAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        CoinAmount(iter.map(|a| a.0).sum())
    }
}

impl<'a> Sum<&'a CoinAmount> for CoinAmount {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl Sub for CoinAmount {
    type Output = CoinAmount;

    fn sub(self, _rhs: Self) -> Self::Output {
        panic!("Cannot subtract `CoinAmount`s; use `checked_sub` instead.")
    }
}

impl CheckedSub for CoinAmount {
    /// Return Some(self-other) if the result is positive (or zero); otherwise
    /// return None.
    fn checked_sub(&self, v: &Self) -> Option<Self> {
        if !self.is_negative() && !v.is_negative() && self >= v {
            Some(CoinAmount(self.0 - v.0))
        } else {
            None
        }
    }
}

impl CheckedAdd for CoinAmount {
    /// Return Some(self+other) if (there is no i64-overflow and) the result is
    /// within the range of valid amounts.
    fn checked_add(&self, v: &Self) -> Option<Self> {
        self.0.checked_add(v.0).and_then(|sum| {
            if (-Self::MAX_UNITS..=Self::MAX_UNITS).contains(&sum) {
                Some(Self(sum))
            } else {
                None
            }
        })
    }
}

impl Neg for CoinAmount {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl Ord for CoinAmount {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for CoinAmount {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Zero for CoinAmount {
    fn zero() -> Self {
        CoinAmount(0)
    }

    fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for CoinAmount {
    type Err = anyhow::Error;

    /// Parse a decimal string such as `49.99990000`, `-0.0001` or `50`.
    ///
    /// Digits beyond the eighth decimal place are accepted only if they are
    /// zero, since nodes commonly pad their output.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let re = Regex::new(r#"^(-?)([0-9]*)\.?([0-9]*)$"#)?;
        let Some((_full, [sign, integer, fraction])) = re.captures(s.trim()).map(|c| c.extract::<3>())
        else {
            bail!("invalid amount: unmatched regex");
        };
        ensure!(
            !integer.is_empty() || !fraction.is_empty(),
            "invalid amount: no digits"
        );

        let (significant, padding) = fraction.split_at(fraction.len().min(Self::DECIMALS));
        ensure!(
            padding.chars().all(|c| c == '0'),
            "invalid amount: more than {} decimals",
            Self::DECIMALS
        );

        let integer_units = if integer.is_empty() {
            0
        } else {
            integer
                .parse::<i64>()?
                .checked_mul(Self::conversion_factor())
                .ok_or_else(|| anyhow::anyhow!("invalid amount: too large"))?
        };
        let fraction_units = if significant.is_empty() {
            0
        } else {
            let scale = 10i64.pow((Self::DECIMALS - significant.len()) as u32);
            significant.parse::<i64>()? * scale
        };
        let units = integer_units
            .checked_add(fraction_units)
            .filter(|u| *u <= Self::MAX_UNITS)
            .ok_or_else(|| anyhow::anyhow!("invalid amount: too large"))?;

        Ok(match sign {
            "-" => Self(-units),
            _ => Self(units),
        })
    }
}

impl Display for CoinAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign_symbol = if self.is_negative() { "-" } else { "" };
        let units = self.0.unsigned_abs();
        let factor = Self::conversion_factor().unsigned_abs();
        let int = units / factor;
        let frac = units % factor;
        if frac == 0 {
            write!(f, "{}{}", sign_symbol, int)
        } else {
            let digits = format!("{:0width$}", frac, width = Self::DECIMALS);
            write!(f, "{}{}.{}", sign_symbol, int, digits.trim_end_matches('0'))
        }
    }
}
