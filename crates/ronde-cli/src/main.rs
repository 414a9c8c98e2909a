use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use ronde_core::{Appointment, AppointmentStatus, Client, CompanyProfile, Coordinate};
use ronde_missions::{HoursAction, MissionDraft};
use ronde_store::{MemoryStore, PgStore, Store};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ronde-cli")]
#[command(about = "Ronde command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API server.
    Serve,
    /// Apply the Postgres schema.
    Migrate,
    /// Walk through the mission workflow and a tour optimization in memory.
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => ronde_web::serve_from_env().await?,
        Commands::Migrate => {
            let database_url = std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set for migrate")?;
            let store = PgStore::connect(&database_url).await?;
            store.migrate().await?;
            println!("schema applied");
        }
        Commands::Demo => demo().await?,
    }

    Ok(())
}

async fn demo() -> Result<()> {
    let store = MemoryStore::new();

    let issuer = Uuid::new_v4();
    store
        .upsert_company(CompanyProfile {
            id: issuer,
            name: "Domicare SARL".into(),
            email: "planning@domicare.example".into(),
            address: "7 avenue Foch".into(),
            city: "Angers".into(),
            postal_code: "49100".into(),
            country: "FR".into(),
        })
        .await?;

    let worker = Uuid::new_v4();
    let starts_at = Utc::now() + Duration::days(1);
    let offers = ronde_missions::create_mission(
        &store,
        issuer,
        MissionDraft {
            title: "Day shift".into(),
            starts_at,
            ends_at: starts_at + Duration::hours(4),
            address: "7 avenue Foch".into(),
            city: "Angers".into(),
            postal_code: "49100".into(),
            country: "FR".into(),
            amount: 140.0,
            positions: 1,
            service_kind: "home_care".into(),
            notes: None,
        },
        &[worker],
    )
    .await?;
    let offer = &offers[0];
    println!("mission fanned out: offer={} worker={worker}", offer.id);

    let accepted = ronde_missions::accept_offer(&store, offer.id, worker).await?;
    println!("offer accepted: status={}", accepted.status.as_str());

    let record = ronde_missions::submit_hours(&store, offer.id, worker, 4.0).await?;
    ronde_missions::validate_hours(
        &store,
        offer.id,
        record.id,
        issuer,
        HoursAction::Validate,
        None,
    )
    .await?;
    let validated = store.offer(offer.id).await?.context("offer persists")?;
    println!("hours validated: offer status={}", validated.status.as_str());

    // A small round across Angers for the optimizer.
    let stops = [
        ("Mme Brossard", Coordinate::new(47.4712, -0.5518), 45),
        ("M. Perrin", Coordinate::new(47.4640, -0.5789), 30),
        ("Mme Lelievre", Coordinate::new(47.4855, -0.5561), 60),
    ];
    let mut stop_ids = Vec::new();
    for (name, at, minutes) in stops {
        let client = Client {
            id: Uuid::new_v4(),
            owner_id: worker,
            name: name.into(),
            email: format!("{}@example.net", Uuid::new_v4()),
            address: "rue d'Angers".into(),
            city: "Angers".into(),
            postal_code: "49100".into(),
            country: "FR".into(),
            coordinate: Some(at),
        };
        let appointment = Appointment {
            id: Uuid::new_v4(),
            worker_id: worker,
            client_id: client.id,
            starts_at,
            ends_at: starts_at + Duration::minutes(minutes),
            status: AppointmentStatus::Scheduled,
            service_kind: "home_care".into(),
            notes: None,
            price: 40.0,
            service_minutes: minutes,
        };
        stop_ids.push(appointment.id);
        store.insert_client(client).await?;
        store.insert_appointment(appointment).await?;
    }

    let route = ronde_routing::optimize_route(
        &store,
        &stop_ids,
        Some(Coordinate::new(47.4784, -0.5632)),
    )
    .await?;
    println!(
        "tour optimized: {} stops, {:.1} km, ~{} min",
        route.ordered_ids.len(),
        route.total_km,
        route.estimated_minutes
    );

    Ok(())
}
