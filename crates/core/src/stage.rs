//! Pipeline stages and the external events that start a run.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A named step in the fulfillment pipeline.
///
/// The wire/storage form is kebab-case (`payment-save`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Ingest,
    Booking,
    Payment,
    PaymentSave,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Ingest,
        Stage::Booking,
        Stage::Payment,
        Stage::PaymentSave,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Booking => "booking",
            Stage::Payment => "payment",
            Stage::PaymentSave => "payment-save",
        }
    }

    /// Upper snake-case form, used to build environment variable names.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Stage::Ingest => "INGEST",
            Stage::Booking => "BOOKING",
            Stage::Payment => "PAYMENT",
            Stage::PaymentSave => "PAYMENT_SAVE",
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("stage", s))
    }
}

/// Category of the external event that started a run.
///
/// The enqueue path is external, so names outside the known set are kept
/// verbatim as `Other` rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TriggerType {
    CustomerCreated,
    BookingCreated,
    PaymentCompleted,
    Other(String),
}

impl TriggerType {
    pub const KNOWN: [TriggerType; 3] = [
        TriggerType::CustomerCreated,
        TriggerType::BookingCreated,
        TriggerType::PaymentCompleted,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            TriggerType::CustomerCreated => "customer-created",
            TriggerType::BookingCreated => "booking-created",
            TriggerType::PaymentCompleted => "payment-completed",
            TriggerType::Other(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, TriggerType::Other(_))
    }
}

impl core::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DomainError::validation("trigger type must not be empty"));
        }
        Ok(TriggerType::KNOWN
            .into_iter()
            .find(|t| t.as_str() == s)
            .unwrap_or_else(|| TriggerType::Other(s.to_string())))
    }
}

impl TryFrom<String> for TriggerType {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TriggerType> for String {
    fn from(value: TriggerType) -> Self {
        match value {
            TriggerType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}
