use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::verification::LicenseType;
use crate::{PluginError, PluginResult};

/// Longest accepted license duration (100 years)
pub const MAX_DURATION_DAYS: u32 = 36_500;

/// Pricing and licensing terms a plugin author attaches to a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonetizationPolicy {
    pub license_type: LicenseType,
    /// Price in `currency`; zero for free plugins
    #[serde(default)]
    pub amount: f64,
    /// ISO 4217 code
    #[serde(default)]
    pub currency: String,
    /// License lifetime; `None` means perpetual
    #[serde(default)]
    pub duration_days: Option<u32>,
    /// Offline executions allowed per cached license; `None` uses the host default
    #[serde(default)]
    pub max_offline_usage: Option<u32>,
}

impl MonetizationPolicy {
    pub fn free() -> Self {
        Self {
            license_type: LicenseType::Free,
            amount: 0.0,
            currency: String::new(),
            duration_days: None,
            max_offline_usage: None,
        }
    }

    pub fn paid(amount: f64, currency: impl Into<String>) -> Self {
        Self {
            license_type: LicenseType::Paid,
            amount,
            currency: currency.into(),
            duration_days: None,
            max_offline_usage: None,
        }
    }

    pub fn subscription(amount: f64, currency: impl Into<String>, duration_days: u32) -> Self {
        Self {
            license_type: LicenseType::Subscription,
            amount,
            currency: currency.into(),
            duration_days: Some(duration_days),
            max_offline_usage: None,
        }
    }

    pub fn with_duration_days(mut self, days: u32) -> Self {
        self.duration_days = Some(days);
        self
    }

    pub fn with_max_offline_usage(mut self, max: u32) -> Self {
        self.max_offline_usage = Some(max);
        self
    }

    pub fn requires_payment(&self) -> bool {
        self.license_type != LicenseType::Free && self.amount > 0.0
    }

    /// Expiry of a license issued at `issued_at` under this policy; `None` is perpetual
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> PluginResult<Option<DateTime<Utc>>> {
        let Some(days) = self.duration_days else {
            return Ok(None);
        };
        Duration::try_days(i64::from(days))
            .and_then(|duration| issued_at.checked_add_signed(duration))
            .map(Some)
            .ok_or_else(|| {
                PluginError::Validation(format!("License duration of {days} days is out of range"))
            })
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.amount.is_finite() || self.amount < 0.0 {
            errors.push(format!("Invalid amount {}: must be a non-negative number", self.amount));
        }

        match self.license_type {
            LicenseType::Free => {
                if self.amount > 0.0 {
                    errors.push("Free licenses cannot carry a price".to_string());
                }
            }
            LicenseType::Paid | LicenseType::Subscription => {
                if self.amount == 0.0 {
                    errors.push(format!(
                        "{} licenses require a positive amount",
                        self.license_type.as_str()
                    ));
                }
                if !is_currency_code(&self.currency) {
                    errors.push(format!(
                        "Invalid currency '{}': expected a three-letter ISO 4217 code",
                        self.currency
                    ));
                }
            }
        }

        if self.license_type == LicenseType::Subscription && self.duration_days.is_none() {
            errors.push("Subscriptions require a duration".to_string());
        }
        match self.duration_days {
            Some(0) => errors.push("License duration must be at least one day".to_string()),
            Some(days) if days > MAX_DURATION_DAYS => errors.push(format!(
                "License duration of {days} days exceeds the maximum of {MAX_DURATION_DAYS}"
            )),
            _ => {}
        }
        if self.max_offline_usage == Some(0) {
            errors.push("max_offline_usage must be positive".to_string());
        }

        errors
    }
}

fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}
