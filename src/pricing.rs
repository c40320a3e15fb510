use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::Money;

/// Base prices owned by the pricing service. The engine only looks them up.
#[async_trait]
pub trait PriceBook: Send + Sync {
    async fn base_price(&self, pricing_id: Ulid) -> Option<Money>;
}

/// Unit price for one ticket: base price plus the slot's adjustment, never negative.
pub fn unit_price(base: Money, adjustment: Money) -> Money {
    base.saturating_add(adjustment).max(0)
}

/// In-process price list.
#[derive(Default)]
pub struct PriceTable {
    prices: DashMap<Ulid, Money>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pricing_id: Ulid, amount: Money) {
        self.prices.insert(pricing_id, amount);
    }

    pub fn remove(&self, pricing_id: &Ulid) -> Option<Money> {
        self.prices.remove(pricing_id).map(|(_, amount)| amount)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[async_trait]
impl PriceBook for PriceTable {
    async fn base_price(&self, pricing_id: Ulid) -> Option<Money> {
        self.prices.get(&pricing_id).map(|e| *e.value())
    }
}
