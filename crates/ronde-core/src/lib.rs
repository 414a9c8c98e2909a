//! Core domain model and error taxonomy for Ronde.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ronde-core";

/// Minimum gap between two windows before they are considered in conflict.
pub const SCHEDULE_BUFFER_MINUTES: i64 = 30;

/// Geographic point, WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A tour stop handed to the route builder. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: Uuid,
    pub coordinate: Option<Coordinate>,
    /// On-site service duration in minutes.
    pub service_minutes: i64,
}

/// Result of a tour optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedRoute {
    /// Visiting order. Stops without a resolvable coordinate are excluded
    /// from this sequence; their service durations still count below.
    pub ordered_ids: Vec<Uuid>,
    /// Sum of consecutive-pair great-circle distances, kilometres.
    pub total_km: f64,
    /// Travel time at the assumed average speed plus all service durations.
    pub estimated_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    InProgress,
    Declined,
    Expired,
    CompletedPendingValidation,
    NeedsCorrection,
    CompletedValidated,
}

impl OfferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Declined => "declined",
            Self::Expired => "expired",
            Self::CompletedPendingValidation => "completed_pending_validation",
            Self::NeedsCorrection => "needs_correction",
            Self::CompletedValidated => "completed_validated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "declined" => Some(Self::Declined),
            "expired" => Some(Self::Expired),
            "completed_pending_validation" => Some(Self::CompletedPendingValidation),
            "needs_correction" => Some(Self::NeedsCorrection),
            "completed_validated" => Some(Self::CompletedValidated),
            _ => None,
        }
    }

    /// Statuses that consume a mission position.
    pub fn consumes_position(self) -> bool {
        matches!(
            self,
            Self::InProgress
                | Self::CompletedPendingValidation
                | Self::NeedsCorrection
                | Self::CompletedValidated
        )
    }

    /// Non-terminal, non-pending statuses that block the worker's calendar.
    pub fn blocks_schedule(self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::CompletedPendingValidation | Self::NeedsCorrection
        )
    }
}

/// One company→worker proposed assignment; one slot of a mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub issuer_id: Uuid,
    pub worker_id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
    /// Compensation for the whole window.
    pub amount: f64,
    /// Open positions across the mission this offer belongs to.
    pub positions: u32,
    pub service_kind: String,
    pub notes: Option<String>,
    pub status: OfferStatus,
    pub responded_at: Option<DateTime<Utc>>,
}

/// Identity of the logical mission an offer belongs to: all offers sharing
/// this tuple are sibling slots of one mission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MissionKey {
    pub issuer_id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub address: String,
}

impl Offer {
    pub fn mission_key(&self) -> MissionKey {
        MissionKey {
            issuer_id: self.issuer_id,
            title: self.title.clone(),
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            address: self.address.clone(),
        }
    }

    /// Status as seen by readers: a pending offer whose window has passed
    /// reads as expired. Expiry is never written back by a sweep.
    pub fn effective_status(&self, now: DateTime<Utc>) -> OfferStatus {
        if self.status == OfferStatus::Pending && self.ends_at < now {
            OfferStatus::Expired
        } else {
            self.status
        }
    }

    /// Window length in whole minutes.
    pub fn window_minutes(&self) -> i64 {
        (self.ends_at - self.starts_at).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoursStatus {
    PendingValidation,
    NeedsCorrection,
    Validated,
}

impl HoursStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingValidation => "pending_validation",
            Self::NeedsCorrection => "needs_correction",
            Self::Validated => "validated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_validation" => Some(Self::PendingValidation),
            "needs_correction" => Some(Self::NeedsCorrection),
            "validated" => Some(Self::Validated),
            _ => None,
        }
    }
}

/// A worker's claimed hours against an accepted offer. One row per
/// (offer, worker) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionHours {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub worker_id: Uuid,
    pub hours_worked: f64,
    pub status: HoursStatus,
    /// Required while status is `needs_correction`, cleared on resubmit.
    pub rejection_note: Option<String>,
    pub validated_at: Option<DateTime<Utc>>,
    pub validated_by: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Calendar entry in a worker's planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub client_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub service_kind: String,
    pub notes: Option<String>,
    pub price: f64,
    /// On-site duration in minutes, used by tour optimization.
    pub service_minutes: i64,
}

/// A worker's client record. The coordinate is filled in by geocoding the
/// postal address and may stay empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub email: String,
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
    pub coordinate: Option<Coordinate>,
}

/// Issuing-company profile, source of auto-created client records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
}

/// Worker↔company relationship row, materialized on first acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCompanyLink {
    pub worker_id: Uuid,
    pub issuer_id: Uuid,
    pub linked_at: DateTime<Utc>,
}

/// Padded-window overlap test: two windows conflict unless they are
/// separated by at least the schedule buffer. The comparison is strict, so
/// a gap of exactly the buffer is not a conflict.
pub fn padded_windows_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    let pad = Duration::minutes(SCHEDULE_BUFFER_MINUTES);
    (a_start - pad) < b_end && (a_end + pad) > b_start
}

/// Persistence collaborator failure. Backends map their native errors into
/// this so the domain taxonomy stays free of driver types.
#[derive(Debug, Error)]
#[error("store backend failure: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// Error taxonomy shared by all Ronde operations. Every variant is
/// recoverable by the caller.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("referenced entity not found")]
    NotFound,
    #[error("caller is not authorized for this entity")]
    Forbidden,
    #[error("operation is not valid for the entity's current status")]
    InvalidState,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("all positions for this mission are already filled")]
    PositionsFilled,
    #[error("the offer window has already passed")]
    Expired,
    #[error("the offer window conflicts with the worker's schedule")]
    ScheduleConflict,
    #[error("hours were already submitted for this offer")]
    AlreadySubmitted,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DomainError {
    /// Stable machine-readable kind, used by the web layer's error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::InvalidState => "invalid_state",
            Self::InvalidInput(_) => "invalid_input",
            Self::PositionsFilled => "positions_filled",
            Self::Expired => "expired",
            Self::ScheduleConflict => "schedule_conflict",
            Self::AlreadySubmitted => "already_submitted",
            Self::Store(_) => "store_failure",
        }
    }
}
