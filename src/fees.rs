//! Fee schedule. Pure: the same inputs always yield the same fee.

use crate::model::{round_money, DealType, LoyaltyTier};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct FeeSchedule {
    /// Direct sales below this price pay `flat_fee`.
    pub flat_below: Decimal,
    pub flat_fee: Decimal,
    /// Direct sales at or above this price use `high_band_rate`.
    pub band_split: Decimal,
    pub low_band_rate: Decimal,
    pub high_band_rate: Decimal,
    /// Tier rate for direct sales, indexed by tier level. `None` keeps the band rate.
    pub tier_direct_rates: [Option<Decimal>; 4],
    pub vip_direct_discount: Decimal,
    /// Tier and VIP discounts on percentage fees need at least this price.
    pub discount_min_price: Decimal,
    pub exchange_base: [Decimal; 4],
    pub vip_exchange_base: Decimal,
    pub addon_rates: [Decimal; 4],
    pub vip_addon_rate: Decimal,
    pub installment_rates: [Decimal; 4],
    pub vip_installment_rate: Decimal,
    /// (minimum trust score, rate discount), highest threshold first.
    pub trust_ladder: Vec<(i32, Decimal)>,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            flat_below: dec!(2000),
            flat_fee: dec!(250),
            band_split: dec!(25000),
            low_band_rate: dec!(0.12),
            high_band_rate: dec!(0.10),
            tier_direct_rates: [None, Some(dec!(0.10)), Some(dec!(0.09)), Some(dec!(0.08))],
            vip_direct_discount: dec!(0.01),
            discount_min_price: dec!(2500),
            exchange_base: [dec!(400), dec!(350), dec!(300), dec!(250)],
            vip_exchange_base: dec!(370),
            addon_rates: [dec!(0.10), dec!(0.08), dec!(0.07), dec!(0.05)],
            vip_addon_rate: dec!(0.09),
            installment_rates: [dec!(0.14), dec!(0.14), dec!(0.13), dec!(0.11)],
            vip_installment_rate: dec!(0.12),
            trust_ladder: vec![(70, dec!(0.07)), (40, dec!(0.04)), (20, dec!(0.02))],
        }
    }
}

/// Fee together with the inputs it was computed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeQuote {
    pub deal_type: DealType,
    pub price: Decimal,
    pub addon: Option<Decimal>,
    pub trust_score: i32,
    pub tier: LoyaltyTier,
    pub vip: bool,
    pub fee: Decimal,
}

impl FeeSchedule {
    pub fn trust_discount(&self, trust_score: i32) -> Decimal {
        self.trust_ladder
            .iter()
            .find(|(threshold, _)| trust_score >= *threshold)
            .map(|(_, discount)| *discount)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn fee(
        &self,
        price: Decimal,
        deal_type: DealType,
        addon: Option<Decimal>,
        trust_score: i32,
        tier: LoyaltyTier,
        vip: bool,
    ) -> Decimal {
        let level = tier.level() as usize;
        let discounted = price >= self.discount_min_price;

        let fee = match deal_type {
            DealType::ContactOnly => Decimal::ZERO,
            DealType::Exchange | DealType::ExchangeWithAddon => {
                let mut base = self.exchange_base[level];
                if vip {
                    base = base.min(self.vip_exchange_base);
                }
                if deal_type == DealType::ExchangeWithAddon {
                    let mut rate = self.addon_rates[level];
                    if vip {
                        rate = rate.min(self.vip_addon_rate);
                    }
                    base + addon.unwrap_or(Decimal::ZERO) * rate
                } else {
                    base
                }
            }
            DealType::Installment => {
                let mut rate = if discounted {
                    self.installment_rates[level]
                } else {
                    self.installment_rates[0]
                };
                if vip && discounted {
                    rate = rate.min(self.vip_installment_rate);
                }
                price * self.after_trust(rate, trust_score)
            }
            DealType::DirectSale => {
                if price < self.flat_below {
                    self.flat_fee
                } else {
                    let mut rate = if price < self.band_split {
                        self.low_band_rate
                    } else {
                        self.high_band_rate
                    };
                    if discounted {
                        if let Some(tier_rate) = self.tier_direct_rates[level] {
                            rate = rate.min(tier_rate);
                        }
                        if vip {
                            rate -= self.vip_direct_discount;
                        }
                    }
                    price * self.after_trust(rate, trust_score)
                }
            }
        };

        round_money(fee)
    }

    pub fn quote(
        &self,
        price: Decimal,
        deal_type: DealType,
        addon: Option<Decimal>,
        trust_score: i32,
        tier: LoyaltyTier,
        vip: bool,
    ) -> FeeQuote {
        FeeQuote {
            deal_type,
            price,
            addon,
            trust_score,
            tier,
            vip,
            fee: self.fee(price, deal_type, addon, trust_score, tier, vip),
        }
    }

    fn after_trust(&self, rate: Decimal, trust_score: i32) -> Decimal {
        (rate - self.trust_discount(trust_score)).max(Decimal::ZERO)
    }
}
