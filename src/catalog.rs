use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::{PolicyId, PolicySnapshot, RatePlanId, RoomId, RoomTypeId};
use crate::pricing::{PriceEntry, PricingTable, RateTierDay};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomType {
    pub id: RoomTypeId,
    pub name: String,
    pub max_occupancy: u32,
    pub default_allotment: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSpec {
    pub id: RoomId,
    pub number: String,
    pub room_type_id: RoomTypeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    pub id: PolicyId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub days_before_check_in: u32,
    pub refund_percentage: Decimal,
}

impl CancellationPolicy {
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            name: self.name.clone(),
            description: self.description.clone(),
            days_before_check_in: self.days_before_check_in,
            refund_percentage: self.refund_percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePlan {
    pub id: RatePlanId,
    pub name: String,
    pub cancellation_policy_id: PolicyId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscountKind {
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub code: String,
    pub kind: DiscountKind,
    pub value: Decimal,
    #[serde(default)]
    pub max_uses: Option<u32>,
    #[serde(default)]
    pub valid_from: Option<NaiveDate>,
    #[serde(default)]
    pub valid_until: Option<NaiveDate>,
}

impl Voucher {
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.valid_from.is_none_or(|from| date >= from)
            && self.valid_until.is_none_or(|until| date <= until)
    }

    pub fn is_exhausted(&self, used_count: u32) -> bool {
        self.max_uses.is_some_and(|max| used_count >= max)
    }

    /// Discount on `subtotal`, never more than the subtotal itself.
    pub fn discount(&self, subtotal: Decimal) -> Decimal {
        let raw = match self.kind {
            DiscountKind::Percentage => (subtotal * self.value / Decimal::ONE_HUNDRED).round_dp(2),
            DiscountKind::Fixed => self.value,
        };
        raw.max(Decimal::ZERO).min(subtotal)
    }
}

/// On-disk catalog shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    pub room_types: Vec<RoomType>,
    #[serde(default)]
    pub rooms: Vec<RoomSpec>,
    pub policies: Vec<CancellationPolicy>,
    pub rate_plans: Vec<RatePlan>,
    #[serde(default)]
    pub vouchers: Vec<Voucher>,
    #[serde(default)]
    pub rate_calendar: Vec<RateTierDay>,
    #[serde(default)]
    pub price_matrix: Vec<PriceEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

/// Read-only reference data: room types, rooms, rate plans, policies,
/// vouchers and pricing.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub room_types: BTreeMap<RoomTypeId, RoomType>,
    pub rooms: BTreeMap<RoomId, RoomSpec>,
    pub policies: HashMap<PolicyId, CancellationPolicy>,
    pub rate_plans: BTreeMap<RatePlanId, RatePlan>,
    pub vouchers: HashMap<String, Voucher>,
    pub pricing: PricingTable,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(raw)?;
        Self::from_file(file)
    }

    pub fn from_file(file: CatalogFile) -> Result<Self, CatalogError> {
        let mut catalog = Catalog {
            pricing: PricingTable::new(&file.rate_calendar, &file.price_matrix),
            ..Default::default()
        };

        for rt in file.room_types {
            if rt.max_occupancy == 0 {
                return Err(CatalogError::Invalid(format!(
                    "room type {} has zero max occupancy",
                    rt.id
                )));
            }
            if catalog.room_types.insert(rt.id, rt.clone()).is_some() {
                return Err(CatalogError::Invalid(format!("duplicate room type {}", rt.id)));
            }
        }
        for room in file.rooms {
            if !catalog.room_types.contains_key(&room.room_type_id) {
                return Err(CatalogError::Invalid(format!(
                    "room {} references unknown room type {}",
                    room.id, room.room_type_id
                )));
            }
            if catalog.rooms.insert(room.id, room.clone()).is_some() {
                return Err(CatalogError::Invalid(format!("duplicate room {}", room.id)));
            }
        }
        for policy in file.policies {
            if policy.refund_percentage < Decimal::ZERO
                || policy.refund_percentage > Decimal::ONE_HUNDRED
            {
                return Err(CatalogError::Invalid(format!(
                    "policy {} refund percentage {} outside 0..=100",
                    policy.id, policy.refund_percentage
                )));
            }
            catalog.policies.insert(policy.id, policy);
        }
        for plan in file.rate_plans {
            if !catalog.policies.contains_key(&plan.cancellation_policy_id) {
                return Err(CatalogError::Invalid(format!(
                    "rate plan {} references unknown policy {}",
                    plan.id, plan.cancellation_policy_id
                )));
            }
            catalog.rate_plans.insert(plan.id, plan);
        }
        for voucher in file.vouchers {
            if voucher.value < Decimal::ZERO {
                return Err(CatalogError::Invalid(format!(
                    "voucher {} has a negative value",
                    voucher.code
                )));
            }
            if voucher.kind == DiscountKind::Percentage && voucher.value > Decimal::ONE_HUNDRED {
                return Err(CatalogError::Invalid(format!(
                    "voucher {} discounts more than 100%",
                    voucher.code
                )));
            }
            catalog.vouchers.insert(voucher.code.clone(), voucher);
        }
        Ok(catalog)
    }

    pub fn room_type(&self, id: RoomTypeId) -> Option<&RoomType> {
        self.room_types.get(&id)
    }

    pub fn rate_plan(&self, id: RatePlanId) -> Option<&RatePlan> {
        self.rate_plans.get(&id)
    }

    pub fn policy_for_rate_plan(&self, id: RatePlanId) -> Option<&CancellationPolicy> {
        self.rate_plan(id)
            .and_then(|plan| self.policies.get(&plan.cancellation_policy_id))
    }

    pub fn voucher(&self, code: &str) -> Option<&Voucher> {
        self.vouchers.get(code)
    }
}
