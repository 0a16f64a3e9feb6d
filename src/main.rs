// Facility KPIs - command line
//
// Every command opens (and if needed creates) the configured database.
// Reports are printed as JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::PathBuf;

use facility_kpis::{
    facility_report, get_database_path, get_entry, get_events_for_entity, insert_entries,
    kpi_report, load_catalog, load_config, load_entries_csv, load_units, open_month,
    parse_month, query_entries, save_reference_data, setup_database, unit_report,
    upsert_entry, Config, EntryFilter, KpiCatalog, KpiEntry, KpiError, Period, ReferenceData,
    UnitTree,
};

#[derive(Parser)]
#[command(name = "facility-kpis", version, about = "Track and report facility KPIs")]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Name recorded in the audit trail
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and optionally load units and KPIs from JSON
    Init {
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// Load entries from a CSV file (kpi,unit,month,value,comments)
    Load { csv: PathBuf },

    /// Create empty entries for every KPI a unit reports in a month
    OpenMonth {
        #[arg(long)]
        unit: String,
        #[arg(long)]
        month: String,
    },

    /// Set the value and comments of one entry
    Set {
        #[arg(long)]
        kpi: String,
        #[arg(long)]
        unit: String,
        #[arg(long)]
        month: String,
        #[arg(long)]
        value: Option<f64>,
        #[arg(long)]
        comments: Option<String>,
    },

    /// Print a report as JSON
    Report {
        #[arg(long, conflicts_with = "kpi")]
        unit: Option<String>,
        #[arg(long)]
        kpi: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long, requires = "year")]
        quarter: Option<u32>,
        /// month, quarter or year
        #[arg(long)]
        period: Option<Period>,
    },

    /// Print the unit hierarchy
    Tree {
        #[arg(long)]
        unit: Option<String>,
    },

    /// Show the audit trail of one entry
    History {
        #[arg(long)]
        kpi: String,
        #[arg(long)]
        unit: String,
        #[arg(long)]
        month: String,
    },

    /// Import entries from the facility service
    #[cfg(feature = "fetch")]
    Import {
        #[command(subcommand)]
        job: ImportJob,
    },
}

#[cfg(feature = "fetch")]
#[derive(Subcommand)]
enum ImportJob {
    /// Normal and used shifts per beamline (defaults to last month)
    BeamUsage {
        #[arg(long)]
        month: Option<String>,
    },

    /// Monthly publication counts
    Publications,
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Init { seed } => run_init(&config, seed, &cli.actor),
        Command::Load { csv } => run_load(&config, &csv, &cli.actor),
        Command::OpenMonth { unit, month } => run_open_month(&config, &unit, &month, &cli.actor),
        Command::Set { kpi, unit, month, value, comments } => {
            run_set(&config, &kpi, &unit, &month, value, comments, &cli.actor)
        }
        Command::Report { unit, kpi, year, quarter, period } => {
            run_report(&config, unit, kpi, year, quarter, period)
        }
        Command::Tree { unit } => run_tree(&config, unit),
        Command::History { kpi, unit, month } => run_history(&config, &kpi, &unit, &month),
        #[cfg(feature = "fetch")]
        Command::Import { job } => run_import(&config, job, &cli.actor),
    }
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_database(config: &Config) -> Result<Connection> {
    let db_path = get_database_path(config);
    if let Some(dir) = db_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
    }

    let conn = Connection::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    setup_database(&conn)?;
    tracing::debug!("Opened database {}", db_path.display());
    Ok(conn)
}

fn load_reference(conn: &Connection) -> Result<(UnitTree, KpiCatalog)> {
    Ok((load_units(conn)?, load_catalog(conn)?))
}

fn resolve_unit(tree: &UnitTree, acronym: &str) -> Result<i64> {
    let unit = tree
        .find_by_acronym(acronym)
        .ok_or_else(|| KpiError::UnknownUnit(acronym.to_string()))?;
    Ok(unit.id)
}

fn resolve_kpi(catalog: &KpiCatalog, name: &str) -> Result<i64> {
    let kpi = catalog
        .find_kpi_by_name(name)
        .ok_or_else(|| KpiError::UnknownKpi(name.to_string()))?;
    Ok(kpi.id)
}

fn run_init(config: &Config, seed: Option<PathBuf>, actor: &str) -> Result<()> {
    let mut conn = open_database(config)?;
    tracing::info!("Database ready at {}", get_database_path(config).display());

    if let Some(path) = seed {
        let data = ReferenceData::from_json_file(&path)?;
        save_reference_data(&mut conn, &data)?;
        tracing::info!(actor, "Loaded reference data from {}", path.display());
    }
    Ok(())
}

fn run_load(config: &Config, csv: &std::path::Path, actor: &str) -> Result<()> {
    let conn = open_database(config)?;
    let (tree, catalog) = load_reference(&conn)?;

    let entries = load_entries_csv(csv, &catalog, &tree)?;
    tracing::info!("Loaded {} entries from {}", entries.len(), csv.display());

    let written = insert_entries(&conn, &entries, actor)?;
    println!("{} entries stored", written);
    Ok(())
}

fn run_open_month(config: &Config, unit: &str, month: &str, actor: &str) -> Result<()> {
    let conn = open_database(config)?;
    let (tree, catalog) = load_reference(&conn)?;

    let unit_id = resolve_unit(&tree, unit)?;
    let month = parse_month(month)?;
    let created = open_month(&conn, &catalog, &tree, unit_id, month, actor)?;

    println!("{} new entries for {} {}", created, unit, month.format("%Y-%m"));
    Ok(())
}

fn run_set(
    config: &Config,
    kpi: &str,
    unit: &str,
    month: &str,
    value: Option<f64>,
    comments: Option<String>,
    actor: &str,
) -> Result<()> {
    let conn = open_database(config)?;
    let (tree, catalog) = load_reference(&conn)?;

    let unit = resolve_unit(&tree, unit)?;
    tree.require_reporter(unit)?;

    let entry = KpiEntry {
        id: 0,
        kpi: resolve_kpi(&catalog, kpi)?,
        unit,
        month: parse_month(month)?,
        value,
        comments,
    };
    upsert_entry(&conn, &entry, actor)?;

    let stored = get_entry(&conn, entry.kpi, entry.unit, entry.month)?;
    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}

fn run_report(
    config: &Config,
    unit: Option<String>,
    kpi: Option<String>,
    year: Option<i32>,
    quarter: Option<u32>,
    period: Option<Period>,
) -> Result<()> {
    let conn = open_database(config)?;
    let (tree, catalog) = load_reference(&conn)?;
    let entries = query_entries(&conn, &EntryFilter::all())?;

    let report = match (unit, kpi) {
        (Some(acronym), _) => {
            let unit_id = resolve_unit(&tree, &acronym)?;
            unit_report(&catalog, &tree, &entries, unit_id, year, quarter, period)?
        }
        (None, Some(name)) => {
            let kpi_id = resolve_kpi(&catalog, &name)?;
            kpi_report(&catalog, &tree, &entries, kpi_id, year, quarter, period)?
        }
        (None, None) => facility_report(&catalog, &tree, &entries, year, quarter, period)?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_tree(config: &Config, unit: Option<String>) -> Result<()> {
    let conn = open_database(config)?;
    let tree = load_units(&conn)?;

    let roots: Vec<i64> = match unit {
        Some(acronym) => vec![resolve_unit(&tree, &acronym)?],
        None => tree.roots().iter().map(|u| u.id).collect(),
    };

    for root in roots {
        print_subtree(&tree, root);
    }
    Ok(())
}

fn print_subtree(tree: &UnitTree, id: i64) {
    let base = tree.depth(id);
    for (unit, depth) in tree.preorder(id) {
        let marker = if unit.reporter() { "" } else { " (aggregate)" };
        println!("{}{} - {}{}", "  ".repeat(base + depth), unit.acronym, unit.name, marker);
    }
}

fn run_history(config: &Config, kpi: &str, unit: &str, month: &str) -> Result<()> {
    let conn = open_database(config)?;
    let (tree, catalog) = load_reference(&conn)?;

    let entry = KpiEntry::new(resolve_kpi(&catalog, kpi)?, resolve_unit(&tree, unit)?, parse_month(month)?);
    let events = get_events_for_entity(&conn, "kpi_entry", &entry.entity_id())?;
    if events.is_empty() {
        println!("No changes recorded for {} / {} / {}", kpi, unit, month);
        return Ok(());
    }

    for event in events {
        println!(
            "{}  {:<18} {:<12} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.actor,
            event.data
        );
    }
    Ok(())
}

#[cfg(feature = "fetch")]
fn run_import(config: &Config, job: ImportJob, actor: &str) -> Result<()> {
    use anyhow::bail;
    use chrono::Local;
    use facility_kpis::{import_beam_usage, import_publications, UsoClient};

    let conn = open_database(config)?;
    let (tree, catalog) = load_reference(&conn)?;
    let client = UsoClient::new(&config.api.base_url)?;
    let today = Local::now().date_naive();

    let summary = match job {
        ImportJob::BeamUsage { month } => {
            let month = match month {
                Some(raw) => parse_month(&raw)?,
                None => previous_month(today),
            };
            let kpis = config.import.beam_usage_kpis();
            for id in [kpis.normal_shifts, kpis.shifts_used] {
                if catalog.kpi(id).is_none() {
                    bail!("Beam usage KPI {} is not in the catalog", id);
                }
            }
            let offset = config.import.facility_offset()?;
            import_beam_usage(&conn, &client, &tree, kpis, month, offset, actor)?
        }
        ImportJob::Publications => {
            import_publications(&conn, &client, &tree, &catalog, &config.import.publications, today, actor)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// First day of the month before `today`
fn previous_month(today: NaiveDate) -> NaiveDate {
    let (year, month) = if today.month() == 1 {
        (today.year() - 1, 12)
    } else {
        (today.year(), today.month() - 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_month() {
        let jan = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(previous_month(jan), NaiveDate::from_ymd_opt(2023, 12, 1).unwrap());

        let jul = NaiveDate::from_ymd_opt(2024, 7, 31).unwrap();
        assert_eq!(previous_month(jul), NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "facility-kpis", "report", "--unit", "CMCF", "--year", "2024", "--period", "quarter",
        ])
        .unwrap();
        match cli.command {
            Command::Report { unit, period, .. } => {
                assert_eq!(unit.as_deref(), Some("CMCF"));
                assert_eq!(period, Some(Period::Quarter));
            }
            _ => panic!("expected report command"),
        }

        assert!(Cli::try_parse_from(["facility-kpis", "report", "--quarter", "2"]).is_err());
    }
}
