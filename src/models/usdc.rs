use std::fmt;

use serde::{Deserialize, Serialize};

/// The stablecoin uses six decimals; amounts are carried in the smallest unit.
pub const USDC_DECIMALS: u32 = 6;

const UNITS_PER_DOLLAR: u128 = 10u128.pow(USDC_DECIMALS);
const UNITS_PER_CENT: u128 = 10u128.pow(USDC_DECIMALS - 2);

/// A USDC amount in the token's smallest unit.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Usdc(pub u128);

impl Usdc {
    pub const ZERO: Usdc = Usdc(0);

    /// Costs are configured in cents of a dollar.
    pub fn from_cents(cents: u64) -> Self {
        Usdc(u128::from(cents) * UNITS_PER_CENT)
    }

    /// Parses the backend's string integers, e.g. `"1500000"`.
    pub fn parse(raw: &str) -> Result<Self, std::num::ParseIntError> {
        raw.trim().parse::<u128>().map(Usdc)
    }

    pub fn checked_mul(self, count: u64) -> Option<Usdc> {
        self.0.checked_mul(u128::from(count)).map(Usdc)
    }

    /// Formats as dollars, flooring to two decimal places and dropping them
    /// entirely when the sub-dollar part rounds to zero cents.
    pub fn to_dollars(self) -> String {
        let dollars = self.0 / UNITS_PER_DOLLAR;
        let cents = (self.0 % UNITS_PER_DOLLAR) / UNITS_PER_CENT;

        if cents == 0 {
            format!("${dollars}")
        } else {
            format!("${dollars}.{cents:02}")
        }
    }
}

impl fmt::Display for Usdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_dollars())
    }
}

/// Signed display used for deltas (refunds, corrections); negatives get a
/// `-$` prefix.
pub fn format_usdc_signed(amount: i128) -> String {
    let formatted = Usdc(amount.unsigned_abs()).to_dollars();
    if amount < 0 {
        format!("-{formatted}")
    } else {
        formatted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_formats_without_decimals() {
        assert_eq!(Usdc(0).to_dollars(), "$0");
    }

    #[test]
    fn whole_dollars_drop_cents() {
        assert_eq!(Usdc(1_000_000).to_dollars(), "$1");
        assert_eq!(Usdc(25_000_000).to_dollars(), "$25");
    }

    #[test]
    fn cents_are_floored_to_two_places() {
        assert_eq!(Usdc(1_500_000).to_dollars(), "$1.50");
        assert_eq!(Usdc(1_509_999).to_dollars(), "$1.50");
        assert_eq!(Usdc(50_000).to_dollars(), "$0.05");
        assert_eq!(Usdc(9_999).to_dollars(), "$0");
    }

    #[test]
    fn negative_amounts_get_a_minus_prefix() {
        assert_eq!(format_usdc_signed(-1_500_000), "-$1.50");
        assert_eq!(format_usdc_signed(-1_000_000), "-$1");
        assert_eq!(format_usdc_signed(1_500_000), "$1.50");
    }

    #[test]
    fn cents_configuration_scales_up() {
        assert_eq!(Usdc::from_cents(100), Usdc(1_000_000));
        assert_eq!(Usdc::from_cents(150), Usdc(1_500_000));
    }

    #[test]
    fn parses_backend_string_integers() {
        assert_eq!(Usdc::parse("1500000").unwrap(), Usdc(1_500_000));
        assert!(Usdc::parse("not-a-number").is_err());
    }

    #[test]
    fn batch_cost_multiplication() {
        assert_eq!(
            Usdc::from_cents(100).checked_mul(3),
            Some(Usdc(3_000_000))
        );
        assert_eq!(Usdc(u128::MAX).checked_mul(2), None);
    }
}
