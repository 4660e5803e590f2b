//! Plan catalog.
//!
//! Plans are defined in code and never change at runtime, so every lookup is
//! a plain `match` over a closed [`PlanCode`] and needs no synchronization.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Plan tier a tenant can be on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanCode {
    Starter,
    Solo,
    Team,
    Enterprise,
}

impl PlanCode {
    /// Every plan, cheapest first.
    pub const ALL: [PlanCode; 4] = [Self::Starter, Self::Solo, Self::Team, Self::Enterprise];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "STARTER",
            Self::Solo => "SOLO",
            Self::Team => "TEAM",
            Self::Enterprise => "ENTERPRISE",
        }
    }

    /// Catalog entry for this code.
    #[must_use]
    pub fn plan(&self) -> &'static Plan {
        match self {
            Self::Starter => &STARTER,
            Self::Solo => &SOLO,
            Self::Team => &TEAM,
            Self::Enterprise => &ENTERPRISE,
        }
    }

    /// Cheapest plan that is still paid. Cancelled tenants land here.
    #[must_use]
    pub fn lowest_paid() -> PlanCode {
        Self::ALL
            .into_iter()
            .filter(|code| code.plan().monthly_price > 0)
            .min_by_key(|code| code.plan().monthly_price)
            .unwrap_or(Self::Starter)
    }
}

impl fmt::Display for PlanCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanCode {
    type Err = super::error::BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STARTER" => Ok(Self::Starter),
            "SOLO" => Ok(Self::Solo),
            "TEAM" => Ok(Self::Team),
            "ENTERPRISE" => Ok(Self::Enterprise),
            _ => Err(super::error::BillingError::PlanNotFound {
                plan_code: s.to_string(),
            }),
        }
    }
}

/// How often a tenant is charged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "MONTHLY",
            Self::Annual => "ANNUAL",
        }
    }

    /// Calendar months covered by one payment.
    #[must_use]
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Annual => 12,
        }
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingCycle {
    type Err = ();

    /// Accepts our own names and the provider's price intervals.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(Self::Monthly),
            "annual" | "annually" | "yearly" | "year" => Ok(Self::Annual),
            _ => Err(()),
        }
    }
}

/// A plan-gated capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    PremiumDashboards,
    GpsWalkRoutes,
    Automations,
    ReferralBoost,
    MultiStaff,
    RouteOptimisation,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Self::PremiumDashboards,
        Self::GpsWalkRoutes,
        Self::Automations,
        Self::ReferralBoost,
        Self::MultiStaff,
        Self::RouteOptimisation,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PremiumDashboards => "premiumDashboards",
            Self::GpsWalkRoutes => "gpsWalkRoutes",
            Self::Automations => "automations",
            Self::ReferralBoost => "referralBoost",
            Self::MultiStaff => "multiStaff",
            Self::RouteOptimisation => "routeOptimisation",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|feature| feature.as_str() == s)
            .ok_or(())
    }
}

/// Feature flags mirrored onto the tenant record.
///
/// Only ever produced by [`FeatureFlags::for_plan`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    pub premium_dashboards: bool,
    pub gps_walk_routes: bool,
    pub automations: bool,
    pub referral_boost: bool,
    pub multi_staff: bool,
    pub route_optimisation: bool,
}

impl FeatureFlags {
    #[must_use]
    pub fn for_plan(code: PlanCode) -> Self {
        let plan = code.plan();
        Self {
            premium_dashboards: plan.has_feature(Feature::PremiumDashboards),
            gps_walk_routes: plan.has_feature(Feature::GpsWalkRoutes),
            automations: plan.has_feature(Feature::Automations),
            referral_boost: plan.has_feature(Feature::ReferralBoost),
            multi_staff: plan.has_feature(Feature::MultiStaff),
            route_optimisation: plan.has_feature(Feature::RouteOptimisation),
        }
    }

    #[must_use]
    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::PremiumDashboards => self.premium_dashboards,
            Feature::GpsWalkRoutes => self.gps_walk_routes,
            Feature::Automations => self.automations,
            Feature::ReferralBoost => self.referral_boost,
            Feature::MultiStaff => self.multi_staff,
            Feature::RouteOptimisation => self.route_optimisation,
        }
    }
}

/// Immutable plan definition.
#[derive(Debug, PartialEq, Eq)]
pub struct Plan {
    pub code: PlanCode,
    pub name: &'static str,
    /// Staff and admin seats. `None` means unlimited.
    pub max_seats: Option<u32>,
    /// Client records. `None` means unlimited.
    pub max_clients: Option<u32>,
    pub features: &'static [Feature],
    /// Minor currency units.
    pub monthly_price: u32,
    /// Minor currency units.
    pub annual_price: u32,
}

impl Plan {
    #[must_use]
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    #[must_use]
    pub fn price(&self, cycle: BillingCycle) -> u32 {
        match cycle {
            BillingCycle::Monthly => self.monthly_price,
            BillingCycle::Annual => self.annual_price,
        }
    }
}

static STARTER: Plan = Plan {
    code: PlanCode::Starter,
    name: "Starter",
    max_seats: Some(1),
    max_clients: Some(30),
    features: &[],
    monthly_price: 1200,
    annual_price: 12000,
};

static SOLO: Plan = Plan {
    code: PlanCode::Solo,
    name: "Solo",
    max_seats: Some(3),
    max_clients: Some(150),
    features: &[Feature::PremiumDashboards, Feature::GpsWalkRoutes],
    monthly_price: 2900,
    annual_price: 29000,
};

static TEAM: Plan = Plan {
    code: PlanCode::Team,
    name: "Team",
    max_seats: Some(5),
    max_clients: Some(500),
    features: &[
        Feature::PremiumDashboards,
        Feature::GpsWalkRoutes,
        Feature::Automations,
        Feature::ReferralBoost,
        Feature::MultiStaff,
    ],
    monthly_price: 5900,
    annual_price: 59000,
};

static ENTERPRISE: Plan = Plan {
    code: PlanCode::Enterprise,
    name: "Enterprise",
    max_seats: None,
    max_clients: None,
    features: &Feature::ALL,
    monthly_price: 14900,
    annual_price: 149000,
};

/// Result of checking a capped resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimitCheckResult {
    /// No limit on this resource.
    Unlimited,
    /// Usage is below the limit.
    WithinLimit { current: u32, max: u32 },
    /// Usage has reached or exceeded the limit.
    AtLimit { current: u32, max: u32 },
}

impl LimitCheckResult {
    #[must_use]
    pub fn check(limit: Option<u32>, current: u32) -> Self {
        match limit {
            None => Self::Unlimited,
            Some(max) if current < max => Self::WithinLimit { current, max },
            Some(max) => Self::AtLimit { current, max },
        }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Unlimited | Self::WithinLimit { .. })
    }
}
