//! Mission workflow: offer fan-out, the acceptance guard chain, and the
//! hours submission/validation state machine.

use chrono::{DateTime, Utc};
use ronde_core::{
    padded_windows_overlap, Appointment, AppointmentStatus, Client, DomainError, HoursStatus,
    MissionHours, Offer, OfferStatus, WorkerCompanyLink,
};
use ronde_store::Store;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ronde-missions";

/// Company-side input for a mission: one offer is fanned out per candidate
/// worker, all sharing the mission tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionDraft {
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
    pub amount: f64,
    pub positions: u32,
    pub service_kind: String,
    pub notes: Option<String>,
}

/// Company decision over a submitted hours record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoursAction {
    Validate,
    Reject,
}

/// Fan a mission out to the given candidate workers, one pending offer
/// each.
pub async fn create_mission<S: Store + ?Sized>(
    store: &S,
    issuer_id: Uuid,
    draft: MissionDraft,
    worker_ids: &[Uuid],
) -> Result<Vec<Offer>, DomainError> {
    if draft.ends_at <= draft.starts_at {
        return Err(DomainError::InvalidInput(
            "offer end must be strictly after its start".into(),
        ));
    }
    if draft.positions == 0 {
        return Err(DomainError::InvalidInput(
            "a mission needs at least one position".into(),
        ));
    }
    if worker_ids.is_empty() {
        return Err(DomainError::InvalidInput(
            "a mission needs at least one candidate worker".into(),
        ));
    }
    if store.company(issuer_id).await?.is_none() {
        return Err(DomainError::NotFound);
    }

    let mut offers = Vec::with_capacity(worker_ids.len());
    for worker_id in worker_ids {
        let offer = Offer {
            id: Uuid::new_v4(),
            issuer_id,
            worker_id: *worker_id,
            title: draft.title.clone(),
            starts_at: draft.starts_at,
            ends_at: draft.ends_at,
            address: draft.address.clone(),
            city: draft.city.clone(),
            postal_code: draft.postal_code.clone(),
            country: draft.country.clone(),
            amount: draft.amount,
            positions: draft.positions,
            service_kind: draft.service_kind.clone(),
            notes: draft.notes.clone(),
            status: OfferStatus::Pending,
            responded_at: None,
        };
        store.insert_offer(offer.clone()).await?;
        offers.push(offer);
    }

    info!(
        %issuer_id,
        title = %draft.title,
        candidates = offers.len(),
        positions = draft.positions,
        "mission fanned out"
    );
    Ok(offers)
}

fn count_position_holders(siblings: &[Offer], excluding: Uuid) -> usize {
    siblings
        .iter()
        .filter(|sibling| sibling.id != excluding && sibling.status.consumes_position())
        .count()
}

/// Worker accepts an offer.
///
/// Guards run in order: NotFound, Forbidden, InvalidState, PositionsFilled,
/// Expired, ScheduleConflict. On success the status transition is an atomic
/// compare-and-set; side effects (client, relationship link, calendar
/// appointment) happen only after it lands, and a post-transition recount
/// rolls back the slot if a concurrent accept overshot the position count.
pub async fn accept_offer<S: Store + ?Sized>(
    store: &S,
    offer_id: Uuid,
    worker_id: Uuid,
) -> Result<Offer, DomainError> {
    let now = Utc::now();
    let offer = store.offer(offer_id).await?.ok_or(DomainError::NotFound)?;
    if offer.worker_id != worker_id {
        return Err(DomainError::Forbidden);
    }
    if offer.status != OfferStatus::Pending {
        return Err(DomainError::InvalidState);
    }

    let key = offer.mission_key();
    let siblings = store.mission_siblings(&key).await?;
    if count_position_holders(&siblings, offer.id) >= offer.positions as usize {
        return Err(DomainError::PositionsFilled);
    }

    if offer.ends_at < now {
        return Err(DomainError::Expired);
    }

    for appointment in store
        .worker_appointments_in(worker_id, AppointmentStatus::Scheduled)
        .await?
    {
        if padded_windows_overlap(
            offer.starts_at,
            offer.ends_at,
            appointment.starts_at,
            appointment.ends_at,
        ) {
            return Err(DomainError::ScheduleConflict);
        }
    }
    for other in store.worker_offers(worker_id).await? {
        if other.id != offer.id
            && other.status.blocks_schedule()
            && padded_windows_overlap(offer.starts_at, offer.ends_at, other.starts_at, other.ends_at)
        {
            return Err(DomainError::ScheduleConflict);
        }
    }

    // Read the issuer profile before taking the slot so a missing profile
    // cannot leave a half-applied acceptance behind.
    let company = store
        .company(offer.issuer_id)
        .await?
        .ok_or(DomainError::NotFound)?;

    let taken = store
        .compare_and_set_offer_status(
            offer.id,
            OfferStatus::Pending,
            OfferStatus::InProgress,
            Some(now),
        )
        .await?;
    if !taken {
        // Someone else responded to this offer between our read and the
        // conditional update.
        return Err(DomainError::InvalidState);
    }

    let holders = count_position_holders(&store.mission_siblings(&key).await?, offer.id) + 1;
    if holders > offer.positions as usize {
        store
            .compare_and_set_offer_status(
                offer.id,
                OfferStatus::InProgress,
                OfferStatus::Pending,
                None,
            )
            .await?;
        return Err(DomainError::PositionsFilled);
    }

    let client = match store.client_by_email(worker_id, &company.email).await? {
        Some(existing) => existing,
        None => {
            let created = Client {
                id: Uuid::new_v4(),
                owner_id: worker_id,
                name: company.name.clone(),
                email: company.email.clone(),
                address: company.address.clone(),
                city: company.city.clone(),
                postal_code: company.postal_code.clone(),
                country: company.country.clone(),
                coordinate: None,
            };
            store.insert_client(created.clone()).await?;
            created
        }
    };

    if !store.link_exists(worker_id, offer.issuer_id).await? {
        store
            .insert_link(WorkerCompanyLink {
                worker_id,
                issuer_id: offer.issuer_id,
                linked_at: now,
            })
            .await?;
    }

    store
        .insert_appointment(Appointment {
            id: Uuid::new_v4(),
            worker_id,
            client_id: client.id,
            starts_at: offer.starts_at,
            ends_at: offer.ends_at,
            status: AppointmentStatus::Scheduled,
            service_kind: offer.service_kind.clone(),
            notes: offer.notes.clone(),
            price: offer.amount,
            service_minutes: offer.window_minutes(),
        })
        .await?;

    info!(%offer_id, %worker_id, "offer accepted");
    Ok(Offer {
        status: OfferStatus::InProgress,
        responded_at: Some(now),
        ..offer
    })
}

/// Worker turns a pending offer down.
pub async fn decline_offer<S: Store + ?Sized>(
    store: &S,
    offer_id: Uuid,
    worker_id: Uuid,
) -> Result<Offer, DomainError> {
    let now = Utc::now();
    let offer = store.offer(offer_id).await?.ok_or(DomainError::NotFound)?;
    if offer.worker_id != worker_id {
        return Err(DomainError::Forbidden);
    }
    if offer.effective_status(now) != OfferStatus::Pending {
        return Err(DomainError::InvalidState);
    }

    let declined = store
        .compare_and_set_offer_status(
            offer.id,
            OfferStatus::Pending,
            OfferStatus::Declined,
            Some(now),
        )
        .await?;
    if !declined {
        return Err(DomainError::InvalidState);
    }

    info!(%offer_id, %worker_id, "offer declined");
    Ok(Offer {
        status: OfferStatus::Declined,
        responded_at: Some(now),
        ..offer
    })
}

/// Worker submits, or resubmits after a correction request, the hours
/// worked on an offer.
pub async fn submit_hours<S: Store + ?Sized>(
    store: &S,
    offer_id: Uuid,
    worker_id: Uuid,
    hours_worked: f64,
) -> Result<MissionHours, DomainError> {
    let offer = store.offer(offer_id).await?.ok_or(DomainError::NotFound)?;
    if offer.worker_id != worker_id {
        return Err(DomainError::Forbidden);
    }
    if !hours_worked.is_finite() || hours_worked <= 0.0 {
        return Err(DomainError::InvalidInput(
            "hours worked must be a positive number".into(),
        ));
    }

    match store.hours_for_offer(offer_id, worker_id).await? {
        None => {
            if offer.status != OfferStatus::InProgress {
                return Err(DomainError::InvalidState);
            }
            // Claim the offer transition before inserting, so two racing
            // first submissions cannot both create a record.
            let claimed = store
                .compare_and_set_offer_status(
                    offer_id,
                    OfferStatus::InProgress,
                    OfferStatus::CompletedPendingValidation,
                    offer.responded_at,
                )
                .await?;
            if !claimed {
                return Err(DomainError::InvalidState);
            }
            let record = MissionHours {
                id: Uuid::new_v4(),
                offer_id,
                worker_id,
                hours_worked,
                status: HoursStatus::PendingValidation,
                rejection_note: None,
                validated_at: None,
                validated_by: None,
            };
            store.insert_hours(record.clone()).await?;
            info!(%offer_id, %worker_id, hours_worked, "hours submitted");
            Ok(record)
        }
        Some(record) => match record.status {
            HoursStatus::NeedsCorrection => {
                let resubmitted = MissionHours {
                    hours_worked,
                    status: HoursStatus::PendingValidation,
                    rejection_note: None,
                    ..record
                };
                let applied = store
                    .compare_and_set_hours(resubmitted.clone(), HoursStatus::NeedsCorrection)
                    .await?;
                if !applied {
                    // The record moved on since our read, a concurrent
                    // decision landed first.
                    return Err(DomainError::InvalidState);
                }
                let moved = store
                    .compare_and_set_offer_status(
                        offer_id,
                        OfferStatus::NeedsCorrection,
                        OfferStatus::CompletedPendingValidation,
                        offer.responded_at,
                    )
                    .await?;
                if !moved {
                    return Err(DomainError::InvalidState);
                }
                info!(%offer_id, %worker_id, hours_worked, "hours resubmitted");
                Ok(resubmitted)
            }
            _ => Err(DomainError::AlreadySubmitted),
        },
    }
}

/// Company validates or rejects a submitted hours record.
pub async fn validate_hours<S: Store + ?Sized>(
    store: &S,
    offer_id: Uuid,
    hours_id: Uuid,
    company_id: Uuid,
    action: HoursAction,
    rejection_note: Option<String>,
) -> Result<(), DomainError> {
    let now = Utc::now();
    let offer = store.offer(offer_id).await?.ok_or(DomainError::NotFound)?;
    let mut record = store.hours(hours_id).await?.ok_or(DomainError::NotFound)?;
    if record.offer_id != offer_id {
        // Guards against validating hours for a different offer than the
        // one named in the request path.
        return Err(DomainError::InvalidInput(
            "hours record does not belong to this offer".into(),
        ));
    }
    if offer.issuer_id != company_id {
        return Err(DomainError::Forbidden);
    }
    if !matches!(
        record.status,
        HoursStatus::PendingValidation | HoursStatus::NeedsCorrection
    ) {
        return Err(DomainError::InvalidState);
    }

    // Both writes are conditional on the statuses the decision was read
    // against; a concurrent transition fails the decision instead of
    // silently overwriting it.
    let expected = record.status;
    match action {
        HoursAction::Validate => {
            record.status = HoursStatus::Validated;
            record.validated_at = Some(now);
            record.validated_by = Some(company_id);
            if !store.compare_and_set_hours(record, expected).await? {
                return Err(DomainError::InvalidState);
            }
            let moved = store
                .compare_and_set_offer_status(
                    offer_id,
                    offer.status,
                    OfferStatus::CompletedValidated,
                    offer.responded_at,
                )
                .await?;
            if !moved {
                return Err(DomainError::InvalidState);
            }
            info!(%offer_id, %hours_id, "hours validated");
        }
        HoursAction::Reject => {
            let note = rejection_note
                .map(|note| note.trim().to_string())
                .filter(|note| !note.is_empty())
                .ok_or_else(|| {
                    DomainError::InvalidInput("a rejection note is required".into())
                })?;
            record.status = HoursStatus::NeedsCorrection;
            record.rejection_note = Some(note);
            if !store.compare_and_set_hours(record, expected).await? {
                return Err(DomainError::InvalidState);
            }
            let moved = store
                .compare_and_set_offer_status(
                    offer_id,
                    offer.status,
                    OfferStatus::NeedsCorrection,
                    offer.responded_at,
                )
                .await?;
            if !moved {
                return Err(DomainError::InvalidState);
            }
            info!(%offer_id, %hours_id, "hours rejected, correction requested");
        }
    }
    Ok(())
}
