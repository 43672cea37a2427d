use serde::{Deserialize, Serialize};

use crate::models::usdc::Usdc;

/// Which purchase contract a flow spends against. The backend tracks one
/// allowance per contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseKind {
    DailyHoroscope,
    Zodiac,
}

/// Wallet balance plus the two contract allowances, as of one backend read.
/// The two purchase gates are independent: spending requires both
/// `balance >= cost` and `allowance >= cost` for the relevant contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub usdc_balance: Usdc,
    pub allowance_daily_horoscope: Usdc,
    pub allowance_zodiac: Usdc,
}

impl BalanceSnapshot {
    pub fn allowance_for(&self, kind: PurchaseKind) -> Usdc {
        match kind {
            PurchaseKind::DailyHoroscope => self.allowance_daily_horoscope,
            PurchaseKind::Zodiac => self.allowance_zodiac,
        }
    }

    pub fn covers_balance(&self, cost: Usdc) -> bool {
        self.usdc_balance >= cost
    }

    pub fn covers_allowance(&self, kind: PurchaseKind, cost: Usdc) -> bool {
        self.allowance_for(kind) >= cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(balance: u128, horoscope: u128, zodiac: u128) -> BalanceSnapshot {
        BalanceSnapshot {
            usdc_balance: Usdc(balance),
            allowance_daily_horoscope: Usdc(horoscope),
            allowance_zodiac: Usdc(zodiac),
        }
    }

    #[test]
    fn gates_are_independent_per_contract() {
        let s = snapshot(2_000_000, 1_000_000, 0);
        let cost = Usdc(1_000_000);

        assert!(s.covers_balance(cost));
        assert!(s.covers_allowance(PurchaseKind::DailyHoroscope, cost));
        assert!(!s.covers_allowance(PurchaseKind::Zodiac, cost));
    }

    #[test]
    fn exact_amounts_pass_both_gates() {
        let s = snapshot(1_000_000, 1_000_000, 1_000_000);
        let cost = Usdc(1_000_000);

        assert!(s.covers_balance(cost));
        assert!(s.covers_allowance(PurchaseKind::Zodiac, cost));
        assert!(!s.covers_balance(Usdc(1_000_001)));
    }
}
