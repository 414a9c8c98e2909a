//! Persistence collaborator for Ronde: the `Store` trait, an in-process
//! `MemoryStore`, and a Postgres-backed `PgStore`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ronde_core::{
    Appointment, AppointmentStatus, Client, CompanyProfile, HoursStatus, MissionHours, MissionKey,
    Offer, OfferStatus, StoreError, WorkerCompanyLink,
};
use tokio::sync::Mutex;
use uuid::Uuid;

mod pg;

pub use pg::PgStore;

pub const CRATE_NAME: &str = "ronde-store";

/// Persistence seam consumed by the routing and mission services. Backends
/// must make the compare-and-set methods atomic; the accept and hours
/// flows lean on them to close their read-check-write races.
#[async_trait]
pub trait Store: Send + Sync {
    async fn company(&self, id: Uuid) -> Result<Option<CompanyProfile>, StoreError>;
    async fn upsert_company(&self, profile: CompanyProfile) -> Result<(), StoreError>;

    async fn offer(&self, id: Uuid) -> Result<Option<Offer>, StoreError>;
    async fn insert_offer(&self, offer: Offer) -> Result<(), StoreError>;
    /// Atomically transition an offer's status, returning whether the
    /// expected status still held. `responded_at` is stamped on success.
    async fn compare_and_set_offer_status(
        &self,
        id: Uuid,
        expected: OfferStatus,
        next: OfferStatus,
        responded_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;
    /// All offers sharing the mission tuple, the queried one included.
    async fn mission_siblings(&self, key: &MissionKey) -> Result<Vec<Offer>, StoreError>;
    async fn worker_offers(&self, worker_id: Uuid) -> Result<Vec<Offer>, StoreError>;

    async fn hours(&self, id: Uuid) -> Result<Option<MissionHours>, StoreError>;
    async fn hours_for_offer(
        &self,
        offer_id: Uuid,
        worker_id: Uuid,
    ) -> Result<Option<MissionHours>, StoreError>;
    async fn insert_hours(&self, record: MissionHours) -> Result<(), StoreError>;
    /// Atomically replace an hours record, returning whether its stored
    /// status still matched `expected`.
    async fn compare_and_set_hours(
        &self,
        record: MissionHours,
        expected: HoursStatus,
    ) -> Result<bool, StoreError>;

    async fn client(&self, id: Uuid) -> Result<Option<Client>, StoreError>;
    async fn client_by_email(
        &self,
        owner_id: Uuid,
        email: &str,
    ) -> Result<Option<Client>, StoreError>;
    async fn insert_client(&self, client: Client) -> Result<(), StoreError>;
    async fn update_client(&self, client: Client) -> Result<(), StoreError>;

    async fn appointment(&self, id: Uuid) -> Result<Option<Appointment>, StoreError>;
    async fn insert_appointment(&self, appointment: Appointment) -> Result<(), StoreError>;
    async fn worker_appointments_in(
        &self,
        worker_id: Uuid,
        status: AppointmentStatus,
    ) -> Result<Vec<Appointment>, StoreError>;

    async fn link_exists(&self, worker_id: Uuid, issuer_id: Uuid) -> Result<bool, StoreError>;
    async fn insert_link(&self, link: WorkerCompanyLink) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    companies: HashMap<Uuid, CompanyProfile>,
    offers: HashMap<Uuid, Offer>,
    hours: HashMap<Uuid, MissionHours>,
    clients: HashMap<Uuid, Client>,
    appointments: HashMap<Uuid, Appointment>,
    links: Vec<WorkerCompanyLink>,
}

/// In-process store used by tests and the demo CLI. One mutex over the
/// whole dataset, so the status compare-and-set is trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn company(&self, id: Uuid) -> Result<Option<CompanyProfile>, StoreError> {
        Ok(self.inner.lock().await.companies.get(&id).cloned())
    }

    async fn upsert_company(&self, profile: CompanyProfile) -> Result<(), StoreError> {
        self.inner.lock().await.companies.insert(profile.id, profile);
        Ok(())
    }

    async fn offer(&self, id: Uuid) -> Result<Option<Offer>, StoreError> {
        Ok(self.inner.lock().await.offers.get(&id).cloned())
    }

    async fn insert_offer(&self, offer: Offer) -> Result<(), StoreError> {
        self.inner.lock().await.offers.insert(offer.id, offer);
        Ok(())
    }

    async fn compare_and_set_offer_status(
        &self,
        id: Uuid,
        expected: OfferStatus,
        next: OfferStatus,
        responded_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.offers.get_mut(&id) {
            Some(offer) if offer.status == expected => {
                offer.status = next;
                offer.responded_at = responded_at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn mission_siblings(&self, key: &MissionKey) -> Result<Vec<Offer>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .offers
            .values()
            .filter(|offer| offer.mission_key() == *key)
            .cloned()
            .collect())
    }

    async fn worker_offers(&self, worker_id: Uuid) -> Result<Vec<Offer>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .offers
            .values()
            .filter(|offer| offer.worker_id == worker_id)
            .cloned()
            .collect())
    }

    async fn hours(&self, id: Uuid) -> Result<Option<MissionHours>, StoreError> {
        Ok(self.inner.lock().await.hours.get(&id).cloned())
    }

    async fn hours_for_offer(
        &self,
        offer_id: Uuid,
        worker_id: Uuid,
    ) -> Result<Option<MissionHours>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .hours
            .values()
            .find(|record| record.offer_id == offer_id && record.worker_id == worker_id)
            .cloned())
    }

    async fn insert_hours(&self, record: MissionHours) -> Result<(), StoreError> {
        self.inner.lock().await.hours.insert(record.id, record);
        Ok(())
    }

    async fn compare_and_set_hours(
        &self,
        record: MissionHours,
        expected: HoursStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.hours.get_mut(&record.id) {
            Some(stored) if stored.status == expected => {
                *stored = record;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn client(&self, id: Uuid) -> Result<Option<Client>, StoreError> {
        Ok(self.inner.lock().await.clients.get(&id).cloned())
    }

    async fn client_by_email(
        &self,
        owner_id: Uuid,
        email: &str,
    ) -> Result<Option<Client>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .clients
            .values()
            .find(|client| client.owner_id == owner_id && client.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn insert_client(&self, client: Client) -> Result<(), StoreError> {
        self.inner.lock().await.clients.insert(client.id, client);
        Ok(())
    }

    async fn update_client(&self, client: Client) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.clients.contains_key(&client.id) {
            return Err(StoreError(format!("client {} missing on update", client.id)));
        }
        inner.clients.insert(client.id, client);
        Ok(())
    }

    async fn appointment(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.inner.lock().await.appointments.get(&id).cloned())
    }

    async fn insert_appointment(&self, appointment: Appointment) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .appointments
            .insert(appointment.id, appointment);
        Ok(())
    }

    async fn worker_appointments_in(
        &self,
        worker_id: Uuid,
        status: AppointmentStatus,
    ) -> Result<Vec<Appointment>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .appointments
            .values()
            .filter(|appointment| {
                appointment.worker_id == worker_id && appointment.status == status
            })
            .cloned()
            .collect())
    }

    async fn link_exists(&self, worker_id: Uuid, issuer_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .links
            .iter()
            .any(|link| link.worker_id == worker_id && link.issuer_id == issuer_id))
    }

    async fn insert_link(&self, link: WorkerCompanyLink) -> Result<(), StoreError> {
        self.inner.lock().await.links.push(link);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_offer(status: OfferStatus) -> Offer {
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).single().unwrap();
        Offer {
            id: Uuid::new_v4(),
            issuer_id: Uuid::new_v4(),
            worker_id: Uuid::new_v4(),
            title: "Morning round".into(),
            starts_at: start,
            ends_at: start + chrono::Duration::hours(4),
            address: "12 quai de la Loire".into(),
            city: "Nantes".into(),
            postal_code: "44000".into(),
            country: "FR".into(),
            amount: 90.0,
            positions: 2,
            service_kind: "home_care".into(),
            notes: None,
            status,
            responded_at: None,
        }
    }

    #[tokio::test]
    async fn cas_succeeds_once_then_reports_the_lost_race() {
        let store = MemoryStore::new();
        let offer = sample_offer(OfferStatus::Pending);
        let id = offer.id;
        store.insert_offer(offer).await.unwrap();

        let now = Utc::now();
        assert!(store
            .compare_and_set_offer_status(id, OfferStatus::Pending, OfferStatus::InProgress, Some(now))
            .await
            .unwrap());
        // Second caller expecting `pending` loses.
        assert!(!store
            .compare_and_set_offer_status(id, OfferStatus::Pending, OfferStatus::InProgress, Some(now))
            .await
            .unwrap());

        let stored = store.offer(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OfferStatus::InProgress);
        assert_eq!(stored.responded_at, Some(now));
    }

    #[tokio::test]
    async fn hours_cas_rejects_a_stale_expected_status() {
        let store = MemoryStore::new();
        let record = MissionHours {
            id: Uuid::new_v4(),
            offer_id: Uuid::new_v4(),
            worker_id: Uuid::new_v4(),
            hours_worked: 4.0,
            status: HoursStatus::NeedsCorrection,
            rejection_note: Some("wrong total".into()),
            validated_at: None,
            validated_by: None,
        };
        store.insert_hours(record.clone()).await.unwrap();

        let resubmitted = MissionHours {
            hours_worked: 4.5,
            status: HoursStatus::PendingValidation,
            rejection_note: None,
            ..record.clone()
        };
        assert!(store
            .compare_and_set_hours(resubmitted.clone(), HoursStatus::NeedsCorrection)
            .await
            .unwrap());
        // A second writer still expecting `needs_correction` loses.
        assert!(!store
            .compare_and_set_hours(resubmitted, HoursStatus::NeedsCorrection)
            .await
            .unwrap());

        let stored = store.hours(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HoursStatus::PendingValidation);
        assert_eq!(stored.hours_worked, 4.5);
        assert!(stored.rejection_note.is_none());
    }

    #[tokio::test]
    async fn mission_siblings_match_on_the_full_tuple() {
        let store = MemoryStore::new();
        let offer = sample_offer(OfferStatus::Pending);
        let mut sibling = sample_offer(OfferStatus::Pending);
        sibling.issuer_id = offer.issuer_id;
        sibling.title = offer.title.clone();
        sibling.starts_at = offer.starts_at;
        sibling.ends_at = offer.ends_at;
        sibling.address = offer.address.clone();

        let mut stranger = sample_offer(OfferStatus::Pending);
        stranger.issuer_id = offer.issuer_id;
        stranger.title = "Evening round".into();

        let key = offer.mission_key();
        store.insert_offer(offer).await.unwrap();
        store.insert_offer(sibling).await.unwrap();
        store.insert_offer(stranger).await.unwrap();

        assert_eq!(store.mission_siblings(&key).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn client_lookup_by_email_ignores_case_and_scopes_to_owner() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let client = Client {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Aster Services".into(),
            email: "contact@aster.example".into(),
            address: "3 rue Basse".into(),
            city: "Lille".into(),
            postal_code: "59000".into(),
            country: "FR".into(),
            coordinate: None,
        };
        store.insert_client(client.clone()).await.unwrap();

        let found = store
            .client_by_email(owner, "Contact@Aster.example")
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.id), Some(client.id));

        let other_owner = store
            .client_by_email(Uuid::new_v4(), "contact@aster.example")
            .await
            .unwrap();
        assert!(other_owner.is_none());
    }
}
