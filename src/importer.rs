// 🔄 Importer - pull shifts and publications from the facility service
//
// Two jobs write entries that nobody types in by hand:
// - beam usage: normal shifts and shifts used per beamline for one month
// - publications: distinct citations per month per beamline
//
// Upstream access goes through the FacilityApi trait so runs can be
// tested against a fake. A failure for one unit is logged and that unit
// is skipped; the run carries on.

use crate::db::{upsert_entry, upsert_entry_value, KpiEntry};
use crate::entities::{KpiCatalog, KpiId, Unit, UnitTree};
use crate::period::{first_of_month, next_month};
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Length of one beam shift
pub const SHIFT_HOURS: i64 = 8;

/// Facility mode kind for normal operations
pub const NORMAL_MODE: &str = "N";

/// How far back publication zero-filling goes
pub const PUBLICATION_YEARS_BACK: i32 = 5;

// ============================================================================
// UPSTREAM RECORDS
// ============================================================================

/// A scheduled interval (facility mode or beamline visit)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBlock {
    #[serde(default)]
    pub kind: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// "YYYY-MM-DD" (only year and month are used)
    pub date: String,
    pub cite: String,
}

impl Publication {
    /// First day of the publication month
    pub fn month(&self) -> Option<NaiveDate> {
        let mut parts = self.date.split('-').filter(|p| !p.is_empty());
        let year: i32 = parts.next()?.trim().parse().ok()?;
        let month: u32 = parts.next()?.trim().parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, 1)
    }
}

pub trait FacilityApi {
    /// Facility mode blocks overlapping [start, end)
    fn normal_shifts(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<ScheduleBlock>>;

    /// Scheduled visits on one beamline acronym
    fn beamtime(&self, acronym: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<ScheduleBlock>>;

    /// Publications of one kind ("article", "phd_thesis", ...) for an acronym
    fn publications(&self, kind: &str, acronym: &str) -> Result<Vec<Publication>>;
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    /// Acronyms of units that were written
    pub updated: Vec<String>,
    /// Acronyms of units skipped after an upstream failure
    pub skipped: Vec<String>,
    pub entries: usize,
}

impl ImportSummary {
    fn merge(&mut self, other: ImportSummary) {
        self.updated.extend(other.updated);
        self.skipped.extend(other.skipped);
        self.entries += other.entries;
    }
}

// ============================================================================
// SHIFTS
// ============================================================================

/// Start times of the 8-hour shifts of a block that begin inside
/// [window_start, window_end)
pub fn shift_starts(block: &ScheduleBlock, window_start: NaiveDateTime, window_end: NaiveDateTime) -> Vec<NaiveDateTime> {
    let mut starts = Vec::new();
    if block.cancelled {
        return starts;
    }

    let end = block.end.naive_utc();
    let mut shift = block.start.naive_utc();
    while shift < end {
        if shift >= window_start && shift < window_end {
            starts.push(shift);
        }
        shift += Duration::hours(SHIFT_HOURS);
    }
    starts
}

/// The month as [start, end) in UTC, bounded by local midnights
fn month_window(month: NaiveDate, offset: FixedOffset) -> (NaiveDateTime, NaiveDateTime) {
    let to_utc = |day: NaiveDate, fallback: NaiveDateTime| {
        day.and_hms_opt(0, 0, 0)
            .and_then(|local| local.checked_sub_signed(Duration::seconds(offset.local_minus_utc().into())))
            .unwrap_or(fallback)
    };
    let start = first_of_month(month);
    (
        to_utc(start, NaiveDateTime::MIN),
        to_utc(next_month(start), NaiveDateTime::MAX),
    )
}

fn shift_set(blocks: &[ScheduleBlock], month: NaiveDate, offset: FixedOffset) -> HashSet<NaiveDateTime> {
    let (start, end) = month_window(month, offset);
    blocks
        .iter()
        .flat_map(|b| shift_starts(b, start, end))
        .collect()
}

/// KPI ids written by the beam usage import
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeamUsageKpis {
    pub normal_shifts: KpiId,
    pub shifts_used: KpiId,
}

/// Count normal and used shifts for every reporting unit in one month.
/// `offset` is the facility's UTC offset; months run from local midnight.
pub fn import_beam_usage(
    conn: &Connection,
    api: &dyn FacilityApi,
    tree: &UnitTree,
    kpis: BeamUsageKpis,
    month: NaiveDate,
    offset: FixedOffset,
    actor: &str,
) -> Result<ImportSummary> {
    let month = first_of_month(month);
    let end = next_month(month);

    let modes = api
        .normal_shifts(month, end)
        .with_context(|| format!("Failed to fetch facility modes for {}", month.format("%Y-%m")))?;
    let normal_blocks: Vec<ScheduleBlock> = modes
        .into_iter()
        .filter(|m| m.kind.as_deref() == Some(NORMAL_MODE))
        .collect();
    let normal = shift_set(&normal_blocks, month, offset);

    tracing::info!(month = %month.format("%Y-%m"), normal_shifts = normal.len(), "fetched facility schedule");

    let mut summary = ImportSummary::default();
    for unit in tree.all().filter(|u| u.reporter()) {
        match unit_usage(api, unit, &normal, month, end, offset) {
            Ok((normal_count, used_count)) => {
                upsert_entry_value(conn, kpis.normal_shifts, unit.id, month, Some(normal_count as f64), actor)?;
                upsert_entry_value(conn, kpis.shifts_used, unit.id, month, Some(used_count as f64), actor)?;
                summary.updated.push(unit.acronym.clone());
                summary.entries += 2;
            }
            Err(e) => {
                tracing::warn!("Schedule not available for {}: {:#}", unit.acronym, e);
                summary.skipped.push(unit.acronym.clone());
            }
        }
    }

    tracing::info!(
        updated = summary.updated.len(),
        skipped = summary.skipped.len(),
        "beam usage import finished"
    );
    Ok(summary)
}

fn unit_usage(
    api: &dyn FacilityApi,
    unit: &Unit,
    normal: &HashSet<NaiveDateTime>,
    month: NaiveDate,
    end: NaiveDate,
    offset: FixedOffset,
) -> Result<(usize, usize)> {
    let mut normal_count = 0;
    let mut used_count = 0;

    for acronym in unit.beamline_acronyms() {
        let visits = api.beamtime(&acronym, month, end)?;
        let used = shift_set(&visits, month, offset);
        normal_count += normal.len();
        used_count += normal.intersection(&used).count();
    }
    Ok((normal_count, used_count))
}

// ============================================================================
// PUBLICATIONS
// ============================================================================

/// Which publication kinds feed which KPI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationMapping {
    pub kpi: KpiId,
    pub kinds: Vec<String>,
}

/// Write monthly publication counts for every unit reporting the mapped
/// KPIs. Months without publications are filled with zero up to `today`.
pub fn import_publications(
    conn: &Connection,
    api: &dyn FacilityApi,
    tree: &UnitTree,
    catalog: &KpiCatalog,
    mapping: &[PublicationMapping],
    today: NaiveDate,
    actor: &str,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    for map in mapping {
        if catalog.kpi(map.kpi).is_none() {
            tracing::warn!("Publication KPI {} is not in the catalog, skipping", map.kpi);
            continue;
        }

        for unit_id in catalog.reporting_units(tree, map.kpi) {
            let Some(unit) = tree.get(unit_id) else {
                continue;
            };
            match unit_publications(api, unit, &map.kinds) {
                Ok(publications) => {
                    let written = write_publications(conn, map.kpi, unit, &publications, today, actor)?;
                    summary.merge(ImportSummary {
                        updated: vec![unit.acronym.clone()],
                        skipped: Vec::new(),
                        entries: written,
                    });
                }
                Err(e) => {
                    tracing::warn!("Publications not available for {}: {:#}", unit.acronym, e);
                    summary.skipped.push(unit.acronym.clone());
                }
            }
        }
    }

    tracing::info!(
        updated = summary.updated.len(),
        skipped = summary.skipped.len(),
        entries = summary.entries,
        "publication import finished"
    );
    Ok(summary)
}

/// Distinct citations per month across all acronyms and kinds
fn unit_publications(
    api: &dyn FacilityApi,
    unit: &Unit,
    kinds: &[String],
) -> Result<BTreeMap<NaiveDate, BTreeSet<String>>> {
    let mut by_month: BTreeMap<NaiveDate, BTreeSet<String>> = BTreeMap::new();

    for acronym in unit.beamline_acronyms() {
        for kind in kinds {
            for publication in api.publications(kind, &acronym)? {
                match publication.month() {
                    Some(month) => {
                        by_month.entry(month).or_default().insert(publication.cite);
                    }
                    None => tracing::debug!("Ignoring publication with date '{}'", publication.date),
                }
            }
        }
    }
    Ok(by_month)
}

fn write_publications(
    conn: &Connection,
    kpi: KpiId,
    unit: &Unit,
    publications: &BTreeMap<NaiveDate, BTreeSet<String>>,
    today: NaiveDate,
    actor: &str,
) -> Result<usize> {
    let this_month = first_of_month(today);
    let horizon = NaiveDate::from_ymd_opt(today.year() - PUBLICATION_YEARS_BACK, 1, 1).unwrap_or(this_month);
    let first_month = match publications.keys().next() {
        Some(&earliest) => earliest.max(horizon),
        None => this_month,
    };

    let mut written = 0;
    for (&month, citations) in publications.range(first_month..) {
        let entry = KpiEntry {
            id: 0,
            kpi,
            unit: unit.id,
            month,
            value: Some(citations.len() as f64),
            comments: Some(citation_list(citations)),
        };
        upsert_entry(conn, &entry, actor)?;
        written += 1;
    }

    let mut month = first_month;
    while month <= this_month {
        if !publications.contains_key(&month) {
            upsert_entry(conn, &KpiEntry::new(kpi, unit.id, month).with_value(0.0), actor)?;
            written += 1;
        }
        month = next_month(month);
    }
    Ok(written)
}

fn citation_list<'a>(citations: impl IntoIterator<Item = &'a String>) -> String {
    let items: String = citations
        .into_iter()
        .map(|c| format!("<li>{}</li>", c))
        .collect();
    format!("<ul>{}</ul>", items)
}

// ============================================================================
// HTTP CLIENT
// ============================================================================

/// FacilityApi over the user-services HTTP API
#[cfg(feature = "fetch")]
pub struct UsoClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "fetch")]
impl UsoClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("facility-kpis/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let mut base_url = base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(UsoClient { base_url, client })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Unexpected status from {}", url))?;

        response
            .json()
            .with_context(|| format!("Invalid JSON from {}", url))
    }
}

#[cfg(feature = "fetch")]
impl FacilityApi for UsoClient {
    fn normal_shifts(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<ScheduleBlock>> {
        self.get_json(&format!(
            "schedule/modes/?start={}&end={}",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        ))
    }

    fn beamtime(&self, acronym: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<ScheduleBlock>> {
        self.get_json(&format!(
            "schedule/beamtime/{}/?start={}&end={}",
            acronym,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        ))
    }

    fn publications(&self, kind: &str, acronym: &str) -> Result<Vec<Publication>> {
        self.get_json(&format!("publications/{}/{}/", kind, acronym))
    }
}
