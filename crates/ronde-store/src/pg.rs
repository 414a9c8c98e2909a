//! Postgres-backed store. Runtime queries only, so no live database is
//! needed at build time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ronde_core::{
    Appointment, AppointmentStatus, Client, CompanyProfile, Coordinate, HoursStatus, MissionHours,
    MissionKey, Offer, OfferStatus, StoreError, WorkerCompanyLink,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info_span;
use uuid::Uuid;

use crate::Store;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS companies (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        address TEXT NOT NULL,
        city TEXT NOT NULL,
        postal_code TEXT NOT NULL,
        country TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS offers (
        id UUID PRIMARY KEY,
        issuer_id UUID NOT NULL,
        worker_id UUID NOT NULL,
        title TEXT NOT NULL,
        starts_at TIMESTAMPTZ NOT NULL,
        ends_at TIMESTAMPTZ NOT NULL,
        address TEXT NOT NULL,
        city TEXT NOT NULL,
        postal_code TEXT NOT NULL,
        country TEXT NOT NULL,
        amount DOUBLE PRECISION NOT NULL,
        positions INT NOT NULL,
        service_kind TEXT NOT NULL,
        notes TEXT,
        status TEXT NOT NULL,
        responded_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS offers_mission_idx
        ON offers (issuer_id, title, starts_at, ends_at, address)",
    "CREATE INDEX IF NOT EXISTS offers_worker_idx ON offers (worker_id)",
    "CREATE TABLE IF NOT EXISTS mission_hours (
        id UUID PRIMARY KEY,
        offer_id UUID NOT NULL REFERENCES offers (id),
        worker_id UUID NOT NULL,
        hours_worked DOUBLE PRECISION NOT NULL,
        status TEXT NOT NULL,
        rejection_note TEXT,
        validated_at TIMESTAMPTZ,
        validated_by UUID,
        UNIQUE (offer_id, worker_id)
    )",
    "CREATE TABLE IF NOT EXISTS clients (
        id UUID PRIMARY KEY,
        owner_id UUID NOT NULL,
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        address TEXT NOT NULL,
        city TEXT NOT NULL,
        postal_code TEXT NOT NULL,
        country TEXT NOT NULL,
        lat DOUBLE PRECISION,
        lon DOUBLE PRECISION
    )",
    "CREATE INDEX IF NOT EXISTS clients_owner_email_idx ON clients (owner_id, email)",
    "CREATE TABLE IF NOT EXISTS appointments (
        id UUID PRIMARY KEY,
        worker_id UUID NOT NULL,
        client_id UUID NOT NULL REFERENCES clients (id),
        starts_at TIMESTAMPTZ NOT NULL,
        ends_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        service_kind TEXT NOT NULL,
        notes TEXT,
        price DOUBLE PRECISION NOT NULL,
        service_minutes BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS appointments_worker_status_idx
        ON appointments (worker_id, status)",
    "CREATE TABLE IF NOT EXISTS worker_company_links (
        worker_id UUID NOT NULL,
        issuer_id UUID NOT NULL,
        linked_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (worker_id, issuer_id)
    )",
];

/// Store backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(StoreError::backend)?;
        Ok(Self::new(pool))
    }

    /// Apply the schema. Statements are idempotent, safe to re-run.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let span = info_span!("pg_migrate");
        let _guard = span.enter();
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
        }
        Ok(())
    }
}

fn offer_from_row(row: &PgRow) -> Result<Offer, StoreError> {
    let status_text: String = row.try_get("status").map_err(StoreError::backend)?;
    let status = OfferStatus::parse(&status_text)
        .ok_or_else(|| StoreError(format!("unknown offer status {status_text:?}")))?;
    let positions: i32 = row.try_get("positions").map_err(StoreError::backend)?;
    Ok(Offer {
        id: row.try_get("id").map_err(StoreError::backend)?,
        issuer_id: row.try_get("issuer_id").map_err(StoreError::backend)?,
        worker_id: row.try_get("worker_id").map_err(StoreError::backend)?,
        title: row.try_get("title").map_err(StoreError::backend)?,
        starts_at: row.try_get("starts_at").map_err(StoreError::backend)?,
        ends_at: row.try_get("ends_at").map_err(StoreError::backend)?,
        address: row.try_get("address").map_err(StoreError::backend)?,
        city: row.try_get("city").map_err(StoreError::backend)?,
        postal_code: row.try_get("postal_code").map_err(StoreError::backend)?,
        country: row.try_get("country").map_err(StoreError::backend)?,
        amount: row.try_get("amount").map_err(StoreError::backend)?,
        positions: positions.max(0) as u32,
        service_kind: row.try_get("service_kind").map_err(StoreError::backend)?,
        notes: row.try_get("notes").map_err(StoreError::backend)?,
        status,
        responded_at: row.try_get("responded_at").map_err(StoreError::backend)?,
    })
}

fn hours_from_row(row: &PgRow) -> Result<MissionHours, StoreError> {
    let status_text: String = row.try_get("status").map_err(StoreError::backend)?;
    let status = HoursStatus::parse(&status_text)
        .ok_or_else(|| StoreError(format!("unknown hours status {status_text:?}")))?;
    Ok(MissionHours {
        id: row.try_get("id").map_err(StoreError::backend)?,
        offer_id: row.try_get("offer_id").map_err(StoreError::backend)?,
        worker_id: row.try_get("worker_id").map_err(StoreError::backend)?,
        hours_worked: row.try_get("hours_worked").map_err(StoreError::backend)?,
        status,
        rejection_note: row.try_get("rejection_note").map_err(StoreError::backend)?,
        validated_at: row.try_get("validated_at").map_err(StoreError::backend)?,
        validated_by: row.try_get("validated_by").map_err(StoreError::backend)?,
    })
}

fn client_from_row(row: &PgRow) -> Result<Client, StoreError> {
    let lat: Option<f64> = row.try_get("lat").map_err(StoreError::backend)?;
    let lon: Option<f64> = row.try_get("lon").map_err(StoreError::backend)?;
    let coordinate = match (lat, lon) {
        (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
        _ => None,
    };
    Ok(Client {
        id: row.try_get("id").map_err(StoreError::backend)?,
        owner_id: row.try_get("owner_id").map_err(StoreError::backend)?,
        name: row.try_get("name").map_err(StoreError::backend)?,
        email: row.try_get("email").map_err(StoreError::backend)?,
        address: row.try_get("address").map_err(StoreError::backend)?,
        city: row.try_get("city").map_err(StoreError::backend)?,
        postal_code: row.try_get("postal_code").map_err(StoreError::backend)?,
        country: row.try_get("country").map_err(StoreError::backend)?,
        coordinate,
    })
}

fn appointment_from_row(row: &PgRow) -> Result<Appointment, StoreError> {
    let status_text: String = row.try_get("status").map_err(StoreError::backend)?;
    let status = AppointmentStatus::parse(&status_text)
        .ok_or_else(|| StoreError(format!("unknown appointment status {status_text:?}")))?;
    Ok(Appointment {
        id: row.try_get("id").map_err(StoreError::backend)?,
        worker_id: row.try_get("worker_id").map_err(StoreError::backend)?,
        client_id: row.try_get("client_id").map_err(StoreError::backend)?,
        starts_at: row.try_get("starts_at").map_err(StoreError::backend)?,
        ends_at: row.try_get("ends_at").map_err(StoreError::backend)?,
        status,
        service_kind: row.try_get("service_kind").map_err(StoreError::backend)?,
        notes: row.try_get("notes").map_err(StoreError::backend)?,
        price: row.try_get("price").map_err(StoreError::backend)?,
        service_minutes: row.try_get("service_minutes").map_err(StoreError::backend)?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn company(&self, id: Uuid) -> Result<Option<CompanyProfile>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, email, address, city, postal_code, country
               FROM companies WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        row.map(|row| {
            Ok(CompanyProfile {
                id: row.try_get("id").map_err(StoreError::backend)?,
                name: row.try_get("name").map_err(StoreError::backend)?,
                email: row.try_get("email").map_err(StoreError::backend)?,
                address: row.try_get("address").map_err(StoreError::backend)?,
                city: row.try_get("city").map_err(StoreError::backend)?,
                postal_code: row.try_get("postal_code").map_err(StoreError::backend)?,
                country: row.try_get("country").map_err(StoreError::backend)?,
            })
        })
        .transpose()
    }

    async fn upsert_company(&self, profile: CompanyProfile) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO companies (id, name, email, address, city, postal_code, country)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
               name = EXCLUDED.name,
               email = EXCLUDED.email,
               address = EXCLUDED.address,
               city = EXCLUDED.city,
               postal_code = EXCLUDED.postal_code,
               country = EXCLUDED.country",
        )
        .bind(profile.id)
        .bind(&profile.name)
        .bind(&profile.email)
        .bind(&profile.address)
        .bind(&profile.city)
        .bind(&profile.postal_code)
        .bind(&profile.country)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn offer(&self, id: Uuid) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query("SELECT * FROM offers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.map(|row| offer_from_row(&row)).transpose()
    }

    async fn insert_offer(&self, offer: Offer) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO offers (id, issuer_id, worker_id, title, starts_at, ends_at,
                                 address, city, postal_code, country, amount, positions,
                                 service_kind, notes, status, responded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(offer.id)
        .bind(offer.issuer_id)
        .bind(offer.worker_id)
        .bind(&offer.title)
        .bind(offer.starts_at)
        .bind(offer.ends_at)
        .bind(&offer.address)
        .bind(&offer.city)
        .bind(&offer.postal_code)
        .bind(&offer.country)
        .bind(offer.amount)
        .bind(offer.positions as i32)
        .bind(&offer.service_kind)
        .bind(&offer.notes)
        .bind(offer.status.as_str())
        .bind(offer.responded_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn compare_and_set_offer_status(
        &self,
        id: Uuid,
        expected: OfferStatus,
        next: OfferStatus,
        responded_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        // Conditional update: the WHERE clause makes the transition atomic.
        let result = sqlx::query(
            "UPDATE offers SET status = $3, responded_at = $4
              WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(responded_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mission_siblings(&self, key: &MissionKey) -> Result<Vec<Offer>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM offers
              WHERE issuer_id = $1 AND title = $2 AND starts_at = $3
                AND ends_at = $4 AND address = $5",
        )
        .bind(key.issuer_id)
        .bind(&key.title)
        .bind(key.starts_at)
        .bind(key.ends_at)
        .bind(&key.address)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        rows.iter().map(offer_from_row).collect()
    }

    async fn worker_offers(&self, worker_id: Uuid) -> Result<Vec<Offer>, StoreError> {
        let rows = sqlx::query("SELECT * FROM offers WHERE worker_id = $1")
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter().map(offer_from_row).collect()
    }

    async fn hours(&self, id: Uuid) -> Result<Option<MissionHours>, StoreError> {
        let row = sqlx::query("SELECT * FROM mission_hours WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.map(|row| hours_from_row(&row)).transpose()
    }

    async fn hours_for_offer(
        &self,
        offer_id: Uuid,
        worker_id: Uuid,
    ) -> Result<Option<MissionHours>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM mission_hours WHERE offer_id = $1 AND worker_id = $2",
        )
        .bind(offer_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        row.map(|row| hours_from_row(&row)).transpose()
    }

    async fn insert_hours(&self, record: MissionHours) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO mission_hours (id, offer_id, worker_id, hours_worked, status,
                                        rejection_note, validated_at, validated_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(record.offer_id)
        .bind(record.worker_id)
        .bind(record.hours_worked)
        .bind(record.status.as_str())
        .bind(&record.rejection_note)
        .bind(record.validated_at)
        .bind(record.validated_by)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn compare_and_set_hours(
        &self,
        record: MissionHours,
        expected: HoursStatus,
    ) -> Result<bool, StoreError> {
        // Conditional update: the WHERE clause makes the replacement atomic.
        let result = sqlx::query(
            "UPDATE mission_hours SET hours_worked = $2, status = $3, rejection_note = $4,
                    validated_at = $5, validated_by = $6
              WHERE id = $1 AND status = $7",
        )
        .bind(record.id)
        .bind(record.hours_worked)
        .bind(record.status.as_str())
        .bind(&record.rejection_note)
        .bind(record.validated_at)
        .bind(record.validated_by)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn client(&self, id: Uuid) -> Result<Option<Client>, StoreError> {
        let row = sqlx::query("SELECT * FROM clients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.map(|row| client_from_row(&row)).transpose()
    }

    async fn client_by_email(
        &self,
        owner_id: Uuid,
        email: &str,
    ) -> Result<Option<Client>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM clients WHERE owner_id = $1 AND lower(email) = lower($2) LIMIT 1",
        )
        .bind(owner_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        row.map(|row| client_from_row(&row)).transpose()
    }

    async fn insert_client(&self, client: Client) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO clients (id, owner_id, name, email, address, city, postal_code,
                                  country, lat, lon)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(client.id)
        .bind(client.owner_id)
        .bind(&client.name)
        .bind(&client.email)
        .bind(&client.address)
        .bind(&client.city)
        .bind(&client.postal_code)
        .bind(&client.country)
        .bind(client.coordinate.map(|c| c.lat))
        .bind(client.coordinate.map(|c| c.lon))
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn update_client(&self, client: Client) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE clients SET name = $2, email = $3, address = $4, city = $5,
                    postal_code = $6, country = $7, lat = $8, lon = $9
              WHERE id = $1",
        )
        .bind(client.id)
        .bind(&client.name)
        .bind(&client.email)
        .bind(&client.address)
        .bind(&client.city)
        .bind(&client.postal_code)
        .bind(&client.country)
        .bind(client.coordinate.map(|c| c.lat))
        .bind(client.coordinate.map(|c| c.lon))
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError(format!("client {} missing on update", client.id)));
        }
        Ok(())
    }

    async fn appointment(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let row = sqlx::query("SELECT * FROM appointments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.map(|row| appointment_from_row(&row)).transpose()
    }

    async fn insert_appointment(&self, appointment: Appointment) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO appointments (id, worker_id, client_id, starts_at, ends_at, status,
                                       service_kind, notes, price, service_minutes)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(appointment.id)
        .bind(appointment.worker_id)
        .bind(appointment.client_id)
        .bind(appointment.starts_at)
        .bind(appointment.ends_at)
        .bind(appointment.status.as_str())
        .bind(&appointment.service_kind)
        .bind(&appointment.notes)
        .bind(appointment.price)
        .bind(appointment.service_minutes)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn worker_appointments_in(
        &self,
        worker_id: Uuid,
        status: AppointmentStatus,
    ) -> Result<Vec<Appointment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM appointments WHERE worker_id = $1 AND status = $2",
        )
        .bind(worker_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        rows.iter().map(appointment_from_row).collect()
    }

    async fn link_exists(&self, worker_id: Uuid, issuer_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM worker_company_links
              WHERE worker_id = $1 AND issuer_id = $2",
        )
        .bind(worker_id)
        .bind(issuer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(row.is_some())
    }

    async fn insert_link(&self, link: WorkerCompanyLink) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO worker_company_links (worker_id, issuer_id, linked_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (worker_id, issuer_id) DO NOTHING",
        )
        .bind(link.worker_id)
        .bind(link.issuer_id)
        .bind(link.linked_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }
}
