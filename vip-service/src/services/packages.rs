//! VIP package catalogue.
//!
//! The package name is free text on the wire and is the contract between
//! payment creation and reconciliation. Only the exact names below are
//! accepted; anything else is rejected with no fallback duration.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VipPackage {
    OneDay,
    ThreeDays,
    SevenDays,
    FifteenDays,
    ThirtyDays,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageError {
    #[error("Package name '{0}' is not recognized. Valid packages: {1}")]
    Unknown(String, String),
}

impl VipPackage {
    pub fn all() -> &'static [VipPackage] {
        &[
            Self::OneDay,
            Self::ThreeDays,
            Self::SevenDays,
            Self::FifteenDays,
            Self::ThirtyDays,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OneDay => "VIP 1 Hari",
            Self::ThreeDays => "VIP 3 Hari",
            Self::SevenDays => "VIP 7 Hari",
            Self::FifteenDays => "VIP 15 Hari",
            Self::ThirtyDays => "VIP 30 Hari",
        }
    }

    pub fn duration_days(&self) -> i32 {
        match self {
            Self::OneDay => 1,
            Self::ThreeDays => 3,
            Self::SevenDays => 7,
            Self::FifteenDays => 15,
            Self::ThirtyDays => 30,
        }
    }

    /// Price in Rupiah.
    pub fn price(&self) -> i64 {
        match self {
            Self::OneDay => 2_000,
            Self::ThreeDays => 5_000,
            Self::SevenDays => 10_000,
            Self::FifteenDays => 30_000,
            Self::ThirtyDays => 150_000,
        }
    }

    /// Parse a package name. Surrounding whitespace is ignored; case and
    /// spelling must match exactly.
    pub fn parse(name: &str) -> Result<Self, PackageError> {
        let trimmed = name.trim();
        Self::all()
            .iter()
            .copied()
            .find(|p| p.name() == trimmed)
            .ok_or_else(|| {
                let valid = Self::all()
                    .iter()
                    .map(|p| p.name())
                    .collect::<Vec<_>>()
                    .join(", ");
                PackageError::Unknown(trimmed.to_string(), valid)
            })
    }
}

/// `(valid, days, error)` triple for callers that want a flat answer.
pub fn validate_package_name(name: &str) -> (bool, Option<i32>, Option<String>) {
    match VipPackage::parse(name) {
        Ok(package) => (true, Some(package.duration_days()), None),
        Err(e) => {
            tracing::error!(package_name = %name, "Rejected unknown VIP package");
            (false, None, Some(e.to_string()))
        }
    }
}

/// Listing entry for `GET /packages`.
#[derive(Debug, Clone, Serialize)]
pub struct PackageInfo {
    pub name: &'static str,
    pub duration_days: i32,
    pub price: i64,
}

pub fn list_packages() -> Vec<PackageInfo> {
    VipPackage::all()
        .iter()
        .map(|p| PackageInfo {
            name: p.name(),
            duration_days: p.duration_days(),
            price: p.price(),
        })
        .collect()
}
