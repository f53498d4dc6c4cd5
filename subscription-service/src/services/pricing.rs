//! Price calculation engine.
//!
//! Pure functions from a feature's pricing configuration and a
//! quantity to a price. Configurations are a tagged union resolved
//! once at the boundary via [`PricingConfig::from_value`]; malformed
//! configurations fail loudly, never default to zero.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{FeatureType, Money, PlanVersion, PlanVersionFeature};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("pricing tiers must not be empty")]
    EmptyTiers,

    #[error("the first tier must start at unit 1")]
    FirstTierStart,

    #[error("tier {index} does not start where the previous tier ends")]
    NonContiguousTiers { index: usize },

    #[error("tier {index} ends before it starts")]
    InvertedTier { index: usize },

    #[error("only the last tier may be unbounded")]
    UnboundedInnerTier,

    #[error("package size must be greater than zero")]
    ZeroPackageSize,

    #[error("quantity must not be negative")]
    NegativeQuantity,

    #[error("usage unit pricing requires a rate")]
    MissingRate,

    #[error("usage package pricing requires a package block")]
    MissingPackage,

    #[error("feature is {feature} but pricing config is {config}")]
    ConfigMismatch {
        feature: &'static str,
        config: &'static str,
    },

    #[error("malformed pricing config: {0}")]
    InvalidConfig(String),
}

/// Pricing configuration attached to a plan version feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PricingConfig {
    Flat { price: Decimal },
    Tier { mode: TierMode, tiers: Vec<PriceTier> },
    Usage(UsageConfig),
    Package(PackageConfig),
}

impl PricingConfig {
    /// Resolves the stored JSON configuration into the tagged union.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, PricingError> {
        serde_json::from_value(value.clone())
            .map_err(|err| PricingError::InvalidConfig(err.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PricingConfig::Flat { .. } => "flat",
            PricingConfig::Tier { .. } => "tier",
            PricingConfig::Usage(_) => "usage",
            PricingConfig::Package(_) => "package",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMode {
    Volume,
    Graduated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMode {
    Tier,
    Unit,
    Package,
}

/// One contiguous unit range `[first_unit, last_unit]`. The last tier
/// may leave `last_unit` unset to extend without bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTier {
    pub first_unit: Decimal,
    #[serde(default)]
    pub last_unit: Option<Decimal>,
    pub unit_price: Decimal,
    #[serde(default)]
    pub flat_price: Option<Decimal>,
}

/// Metered pricing, discriminated by `mode`: `tier` reuses the tier
/// math, `unit` is a single-rate multiply, `package` charges per block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    pub mode: UsageMode,
    #[serde(default)]
    pub tier_mode: Option<TierMode>,
    #[serde(default)]
    pub tiers: Vec<PriceTier>,
    #[serde(default)]
    pub rate: Option<Decimal>,
    #[serde(default)]
    pub package: Option<PackageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    pub units: Decimal,
    pub price: Decimal,
}

/// Price of one feature at one quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeaturePrice {
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub has_usage: bool,
}

/// Allowance covered at zero cost before charges begin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FreeUnits {
    Unlimited,
    Limited(Decimal),
}

/// Fixed price of a whole plan, summing each non-usage feature at its
/// default quantity. Usage features contribute nothing here and set
/// `has_usage`; their amount is unknowable until consumption is read.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanPrice {
    pub total: Money,
    pub has_usage: bool,
}

/// Prices one feature at `quantity`.
pub fn price_for_feature(
    feature_type: FeatureType,
    config: &PricingConfig,
    quantity: Decimal,
) -> Result<FeaturePrice, PricingError> {
    if quantity < Decimal::ZERO {
        return Err(PricingError::NegativeQuantity);
    }

    let (unit_price, total_price, has_usage) = match (feature_type, config) {
        (FeatureType::Flat, PricingConfig::Flat { price }) => (*price, *price, false),
        (FeatureType::Tier, PricingConfig::Tier { mode, tiers }) => {
            let (unit, total) = tiered_price(*mode, tiers, quantity)?;
            (unit, total, false)
        }
        (FeatureType::Usage, PricingConfig::Usage(usage)) => {
            let (unit, total) = usage_price(usage, quantity)?;
            (unit, total, true)
        }
        (FeatureType::Package, PricingConfig::Package(package)) => {
            let (unit, total) = package_price(package, quantity)?;
            (unit, total, false)
        }
        (feature, config) => {
            return Err(PricingError::ConfigMismatch {
                feature: feature.as_str(),
                config: config.kind(),
            });
        }
    };

    Ok(FeaturePrice {
        unit_price,
        total_price,
        has_usage,
    })
}

/// Allowance available before the first charge: unlimited for flat
/// features, the first tier's upper bound when that tier is free, zero
/// otherwise.
pub fn free_units(feature_type: FeatureType, config: &PricingConfig) -> FreeUnits {
    match (feature_type, config) {
        (FeatureType::Flat, PricingConfig::Flat { .. }) => FreeUnits::Unlimited,
        (FeatureType::Tier, PricingConfig::Tier { tiers, .. }) => free_units_from_tiers(tiers),
        (FeatureType::Usage, PricingConfig::Usage(usage)) => match usage.mode {
            UsageMode::Tier => free_units_from_tiers(&usage.tiers),
            UsageMode::Unit => match usage.rate {
                Some(rate) if rate.is_zero() => FreeUnits::Unlimited,
                _ => FreeUnits::Limited(Decimal::ZERO),
            },
            UsageMode::Package => match &usage.package {
                Some(package) if package.price.is_zero() => FreeUnits::Unlimited,
                _ => FreeUnits::Limited(Decimal::ZERO),
            },
        },
        (FeatureType::Package, PricingConfig::Package(package)) => {
            if package.price.is_zero() {
                FreeUnits::Unlimited
            } else {
                FreeUnits::Limited(Decimal::ZERO)
            }
        }
        _ => FreeUnits::Limited(Decimal::ZERO),
    }
}

/// Quantity provisioned for a feature the subscriber did not size
/// explicitly. A configured plan default wins; without one, a feature
/// whose pricing includes a free allowance starts at that allowance
/// and everything else starts at a single unit.
pub fn default_quantity(feature: &PlanVersionFeature) -> Result<Decimal, PricingError> {
    if let Some(units) = feature.default_units {
        return Ok(units);
    }
    let config = PricingConfig::from_value(&feature.pricing)?;
    Ok(match free_units(feature.feature_type(), &config) {
        FreeUnits::Limited(included) if included > Decimal::ZERO => included,
        _ => Decimal::ONE,
    })
}

/// Fixed price of `plan` with every feature at its default quantity.
pub fn total_price_plan(
    plan: &PlanVersion,
    features: &[PlanVersionFeature],
) -> Result<PlanPrice, PricingError> {
    let mut total = Decimal::ZERO;
    let mut has_usage = false;

    for feature in features {
        let feature_type = feature.feature_type();
        if feature_type.is_usage() {
            has_usage = true;
            continue;
        }
        let config = PricingConfig::from_value(&feature.pricing)?;
        let quantity = feature.default_units.unwrap_or(Decimal::ZERO);
        let priced = price_for_feature(feature_type, &config, quantity)?;
        total += priced.total_price;
    }

    Ok(PlanPrice {
        total: Money::new(total, &plan.currency),
        has_usage,
    })
}

fn tiered_price(
    mode: TierMode,
    tiers: &[PriceTier],
    quantity: Decimal,
) -> Result<(Decimal, Decimal), PricingError> {
    validate_tiers(tiers)?;
    Ok(match mode {
        TierMode::Volume => volume_price(tiers, quantity),
        TierMode::Graduated => graduated_price(tiers, quantity),
    })
}

fn validate_tiers(tiers: &[PriceTier]) -> Result<(), PricingError> {
    if tiers.is_empty() {
        return Err(PricingError::EmptyTiers);
    }
    let mut expected_first = Decimal::ONE;
    for (index, tier) in tiers.iter().enumerate() {
        if tier.first_unit != expected_first {
            return Err(if index == 0 {
                PricingError::FirstTierStart
            } else {
                PricingError::NonContiguousTiers { index }
            });
        }
        match tier.last_unit {
            Some(last) if last < tier.first_unit => {
                return Err(PricingError::InvertedTier { index });
            }
            Some(last) => expected_first = last + Decimal::ONE,
            None if index + 1 < tiers.len() => {
                return Err(PricingError::UnboundedInnerTier);
            }
            None => {}
        }
    }
    Ok(())
}

/// The whole quantity priced at the tier containing the final unit,
/// plus that tier's flat component.
fn volume_price(tiers: &[PriceTier], quantity: Decimal) -> (Decimal, Decimal) {
    let tier = tiers
        .iter()
        .find(|tier| tier.last_unit.is_none_or(|last| quantity <= last))
        .or_else(|| tiers.last());
    let Some(tier) = tier else {
        return (Decimal::ZERO, Decimal::ZERO);
    };
    if quantity.is_zero() {
        return (tier.unit_price, Decimal::ZERO);
    }
    let flat = tier.flat_price.unwrap_or(Decimal::ZERO);
    (tier.unit_price, quantity * tier.unit_price + flat)
}

/// Quantity split across tiers in order; each tier's flat component is
/// added once when the tier is actually touched. The reported unit
/// price is the rate of the last tier touched.
fn graduated_price(tiers: &[PriceTier], quantity: Decimal) -> (Decimal, Decimal) {
    let mut total = Decimal::ZERO;
    let mut unit_price = tiers.first().map_or(Decimal::ZERO, |t| t.unit_price);

    for tier in tiers {
        let below = tier.first_unit - Decimal::ONE;
        if quantity <= below {
            break;
        }
        let in_tier = match tier.last_unit {
            Some(last) => quantity.min(last) - below,
            None => quantity - below,
        };
        total += in_tier * tier.unit_price;
        if let Some(flat) = tier.flat_price {
            total += flat;
        }
        unit_price = tier.unit_price;
    }

    (unit_price, total)
}

fn usage_price(config: &UsageConfig, quantity: Decimal) -> Result<(Decimal, Decimal), PricingError> {
    match config.mode {
        UsageMode::Unit => {
            let rate = config.rate.ok_or(PricingError::MissingRate)?;
            Ok((rate, quantity * rate))
        }
        UsageMode::Tier => {
            let mode = config.tier_mode.unwrap_or(TierMode::Graduated);
            tiered_price(mode, &config.tiers, quantity)
        }
        UsageMode::Package => {
            let package = config.package.as_ref().ok_or(PricingError::MissingPackage)?;
            package_price(package, quantity)
        }
    }
}

/// Fixed price per block of `units`, ceiling-divided.
fn package_price(
    package: &PackageConfig,
    quantity: Decimal,
) -> Result<(Decimal, Decimal), PricingError> {
    if package.units <= Decimal::ZERO {
        return Err(PricingError::ZeroPackageSize);
    }
    if quantity.is_zero() {
        return Ok((package.price, Decimal::ZERO));
    }
    let blocks = (quantity / package.units).ceil();
    Ok((package.price, blocks * package.price))
}

fn free_units_from_tiers(tiers: &[PriceTier]) -> FreeUnits {
    let Some(first) = tiers.first() else {
        return FreeUnits::Limited(Decimal::ZERO);
    };
    let free_of_charge =
        first.unit_price.is_zero() && first.flat_price.unwrap_or(Decimal::ZERO).is_zero();
    if !free_of_charge {
        return FreeUnits::Limited(Decimal::ZERO);
    }
    match first.last_unit {
        Some(last) => FreeUnits::Limited(last),
        None => FreeUnits::Unlimited,
    }
}
