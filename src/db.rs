use crate::entities::{
    FamilyKind, Kpi, KpiCatalog, KpiCategory, KpiFamily, KpiId, KpiKind, Unit, UnitId, UnitKind,
    UnitTree,
};
use crate::aggregate::EntryFilter;
use crate::error::KpiError;
use crate::period::parse_month;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

const MONTH_FORMAT: &str = "%Y-%m-%d";

/// One value + comment for a (KPI, unit, month) triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiEntry {
    /// Row id (0 before the entry is stored)
    #[serde(default)]
    pub id: i64,
    pub kpi: KpiId,
    pub unit: UnitId,

    /// Always the first day of the month
    pub month: NaiveDate,

    pub value: Option<f64>,
    pub comments: Option<String>,
}

impl KpiEntry {
    pub fn new(kpi: KpiId, unit: UnitId, month: NaiveDate) -> Self {
        KpiEntry {
            id: 0,
            kpi,
            unit,
            month: crate::period::first_of_month(month),
            value: None,
            comments: None,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_comments(mut self, comments: &str) -> Self {
        self.comments = Some(comments.to_string());
        self
    }

    /// Audit-trail key for this triple
    pub fn entity_id(&self) -> String {
        format!("{}:{}:{}", self.kpi, self.unit, self.month.format("%Y-%m"))
    }
}

/// Event for audit trail (every entry write is recorded)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (in-memory databases stay "memory")
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS unit_kinds (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            reporter INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS units (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            acronym TEXT NOT NULL,
            kind_id INTEGER REFERENCES unit_kinds(id),
            parent_id INTEGER REFERENCES units(id),
            acronyms TEXT,
            admin_roles TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS kpi_categories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS kpis (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            category_id INTEGER REFERENCES kpi_categories(id),
            kind INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS kpi_units (
            kpi_id INTEGER NOT NULL REFERENCES kpis(id),
            unit_id INTEGER NOT NULL REFERENCES units(id),
            PRIMARY KEY (kpi_id, unit_id)
        );

        CREATE TABLE IF NOT EXISTS kpi_families (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            kind INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS kpi_family_members (
            family_id INTEGER NOT NULL REFERENCES kpi_families(id),
            kpi_id INTEGER NOT NULL REFERENCES kpis(id),
            position INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (family_id, kpi_id)
        );

        CREATE TABLE IF NOT EXISTS kpi_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kpi_id INTEGER NOT NULL REFERENCES kpis(id),
            unit_id INTEGER NOT NULL REFERENCES units(id),
            month TEXT NOT NULL,
            value REAL,
            comments TEXT,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (kpi_id, unit_id, month)
        );

        -- Audit trail
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_entries_month ON kpi_entries(month);
        CREATE INDEX IF NOT EXISTS idx_entries_unit ON kpi_entries(unit_id);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

// ============================================================================
// Reference data
// ============================================================================

pub fn save_unit_kind(conn: &Connection, kind: &UnitKind) -> Result<()> {
    conn.execute(
        "INSERT INTO unit_kinds (id, name, description, reporter) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name, description = excluded.description, reporter = excluded.reporter",
        params![kind.id, kind.name, kind.description, kind.reporter],
    )?;
    Ok(())
}

pub fn save_unit(conn: &Connection, unit: &Unit) -> Result<()> {
    if let Some(kind) = &unit.kind {
        save_unit_kind(conn, kind)?;
    }
    let roles_json = serde_json::to_string(&unit.admin_roles)?;

    conn.execute(
        "INSERT INTO units (id, name, acronym, kind_id, parent_id, acronyms, admin_roles)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name, acronym = excluded.acronym, kind_id = excluded.kind_id,
            parent_id = excluded.parent_id, acronyms = excluded.acronyms,
            admin_roles = excluded.admin_roles",
        params![
            unit.id,
            unit.name,
            unit.acronym,
            unit.kind.as_ref().map(|k| k.id),
            unit.parent,
            unit.acronyms,
            roles_json,
        ],
    )?;
    Ok(())
}

pub fn save_category(conn: &Connection, category: &KpiCategory) -> Result<()> {
    conn.execute(
        "INSERT INTO kpi_categories (id, name, description, priority) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name, description = excluded.description, priority = excluded.priority",
        params![category.id, category.name, category.description, category.priority],
    )?;
    Ok(())
}

/// Save a KPI and replace its unit assignments
pub fn save_kpi(conn: &Connection, kpi: &Kpi) -> Result<()> {
    conn.execute(
        "INSERT INTO kpis (id, name, description, category_id, kind, priority)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name, description = excluded.description,
            category_id = excluded.category_id, kind = excluded.kind, priority = excluded.priority",
        params![
            kpi.id,
            kpi.name,
            kpi.description,
            kpi.category,
            kpi.kind.code(),
            kpi.priority,
        ],
    )?;

    conn.execute("DELETE FROM kpi_units WHERE kpi_id = ?1", [kpi.id])?;
    for unit in &kpi.units {
        conn.execute(
            "INSERT INTO kpi_units (kpi_id, unit_id) VALUES (?1, ?2)",
            params![kpi.id, unit],
        )?;
    }
    Ok(())
}

pub fn save_family(conn: &Connection, family: &KpiFamily) -> Result<()> {
    conn.execute(
        "INSERT INTO kpi_families (id, name, kind) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, kind = excluded.kind",
        params![family.id, family.name, family.kind.code()],
    )?;

    conn.execute("DELETE FROM kpi_family_members WHERE family_id = ?1", [family.id])?;
    for (position, kpi) in family.kpis.iter().enumerate() {
        conn.execute(
            "INSERT INTO kpi_family_members (family_id, kpi_id, position) VALUES (?1, ?2, ?3)",
            params![family.id, kpi, position as i64],
        )?;
    }
    Ok(())
}

/// Reference data as read from a seed file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReferenceData {
    #[serde(default)]
    pub units: Vec<Unit>,
    #[serde(default)]
    pub categories: Vec<KpiCategory>,
    #[serde(default)]
    pub kpis: Vec<Kpi>,
    #[serde(default)]
    pub families: Vec<KpiFamily>,
}

impl ReferenceData {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let data: ReferenceData = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid reference data in {}", path.display()))?;
        Ok(data)
    }
}

/// Validate and store reference data in one transaction
pub fn save_reference_data(conn: &mut Connection, data: &ReferenceData) -> Result<()> {
    // Reject broken hierarchies before anything is written
    let tree = UnitTree::new(data.units.clone()).context("Seed unit hierarchy is invalid")?;

    let tx = conn.transaction()?;
    // Parents before children so the parent_id foreign key always resolves
    for root in tree.roots() {
        save_unit(&tx, root)?;
        for unit in tree.descendants(root.id) {
            save_unit(&tx, unit)?;
        }
    }
    for category in &data.categories {
        save_category(&tx, category)?;
    }
    for kpi in &data.kpis {
        save_kpi(&tx, kpi)?;
    }
    for family in &data.families {
        save_family(&tx, family)?;
    }
    tx.commit()?;

    tracing::info!(
        units = data.units.len(),
        categories = data.categories.len(),
        kpis = data.kpis.len(),
        families = data.families.len(),
        "saved reference data"
    );
    Ok(())
}

/// Load every unit into a validated tree
pub fn load_units(conn: &Connection) -> Result<UnitTree> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.acronym, u.parent_id, u.acronyms, u.admin_roles,
                k.id, k.name, k.description, k.reporter
         FROM units u
         LEFT JOIN unit_kinds k ON k.id = u.kind_id
         ORDER BY u.id",
    )?;

    let units = stmt
        .query_map([], |row| {
            let kind_id: Option<i64> = row.get(6)?;
            let kind = match kind_id {
                Some(id) => Some(UnitKind {
                    id,
                    name: row.get(7)?,
                    description: row.get(8)?,
                    reporter: row.get(9)?,
                }),
                None => None,
            };

            let roles_json: String = row.get(5)?;
            let admin_roles: Vec<String> = serde_json::from_str(&roles_json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

            Ok(Unit {
                id: row.get(0)?,
                name: row.get(1)?,
                acronym: row.get(2)?,
                kind,
                parent: row.get(3)?,
                acronyms: row.get(4)?,
                admin_roles,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let tree = UnitTree::new(units).context("Stored unit hierarchy is invalid")?;
    Ok(tree)
}

/// Load categories, KPIs (with unit assignments) and families
pub fn load_catalog(conn: &Connection) -> Result<KpiCatalog> {
    let mut stmt = conn.prepare("SELECT id, name, description, priority FROM kpi_categories")?;
    let categories = stmt
        .query_map([], |row| {
            Ok(KpiCategory {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                priority: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut assignments: HashMap<KpiId, BTreeSet<UnitId>> = HashMap::new();
    let mut stmt = conn.prepare("SELECT kpi_id, unit_id FROM kpi_units")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, KpiId>(0)?, row.get::<_, UnitId>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (kpi, unit) in rows {
        assignments.entry(kpi).or_default().insert(unit);
    }

    let mut stmt = conn.prepare(
        "SELECT id, name, description, category_id, kind, priority FROM kpis",
    )?;
    let kpis = stmt
        .query_map([], |row| {
            let code: i64 = row.get(4)?;
            let kind = KpiKind::from_code(code).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    Type::Integer,
                    format!("unknown KPI kind {}", code).into(),
                )
            })?;
            let id: KpiId = row.get(0)?;
            Ok(Kpi {
                id,
                name: row.get(1)?,
                description: row.get(2)?,
                category: row.get(3)?,
                kind,
                priority: row.get(5)?,
                units: assignments.get(&id).cloned().unwrap_or_default(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut members: HashMap<i64, Vec<KpiId>> = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT family_id, kpi_id FROM kpi_family_members ORDER BY family_id, position",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, KpiId>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (family, kpi) in rows {
        members.entry(family).or_default().push(kpi);
    }

    let mut stmt = conn.prepare("SELECT id, name, kind FROM kpi_families ORDER BY id")?;
    let families = stmt
        .query_map([], |row| {
            let code: i64 = row.get(2)?;
            let kind = FamilyKind::from_code(code).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    Type::Integer,
                    format!("unknown family kind {}", code).into(),
                )
            })?;
            let id: i64 = row.get(0)?;
            Ok(KpiFamily {
                id,
                name: row.get(1)?,
                kind,
                kpis: members.remove(&id).unwrap_or_default(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(KpiCatalog::new(categories, kpis, families))
}

// ============================================================================
// Entries
// ============================================================================

fn month_column(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, MONTH_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KpiEntry> {
    let month: String = row.get(3)?;
    Ok(KpiEntry {
        id: row.get(0)?,
        kpi: row.get(1)?,
        unit: row.get(2)?,
        month: month_column(3, &month)?,
        value: row.get(4)?,
        comments: row.get(5)?,
    })
}

fn record_entry_event(conn: &Connection, event_type: &str, entry: &KpiEntry, actor: &str) -> Result<()> {
    let event = Event::new(
        event_type,
        "kpi_entry",
        &entry.entity_id(),
        serde_json::json!({
            "kpi": entry.kpi,
            "unit": entry.unit,
            "month": entry.month.format(MONTH_FORMAT).to_string(),
            "value": entry.value,
            "comments": entry.comments,
        }),
        actor,
    );
    insert_event(conn, &event)
        .with_context(|| format!("Failed to record {} event for {}", event_type, entry.entity_id()))
}

/// Insert or overwrite value + comments for the entry's triple.
/// Concurrent writers resolve to the last write; returns the row id.
pub fn upsert_entry(conn: &Connection, entry: &KpiEntry, actor: &str) -> Result<i64> {
    let month = crate::period::first_of_month(entry.month);
    // The row and its audit event commit together
    let tx = conn.unchecked_transaction()?;
    let id: i64 = tx.query_row(
        "INSERT INTO kpi_entries (kpi_id, unit_id, month, value, comments)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(kpi_id, unit_id, month) DO UPDATE SET
            value = excluded.value,
            comments = excluded.comments,
            updated_at = CURRENT_TIMESTAMP
         RETURNING id",
        params![
            entry.kpi,
            entry.unit,
            month.format(MONTH_FORMAT).to_string(),
            entry.value,
            entry.comments,
        ],
        |row| row.get(0),
    )?;

    record_entry_event(&tx, "entry_saved", entry, actor)?;
    tx.commit()?;
    Ok(id)
}

/// Insert or overwrite only the value; existing comments are kept
pub fn upsert_entry_value(
    conn: &Connection,
    kpi: KpiId,
    unit: UnitId,
    month: NaiveDate,
    value: Option<f64>,
    actor: &str,
) -> Result<i64> {
    let month = crate::period::first_of_month(month);
    let tx = conn.unchecked_transaction()?;
    let id: i64 = tx.query_row(
        "INSERT INTO kpi_entries (kpi_id, unit_id, month, value)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(kpi_id, unit_id, month) DO UPDATE SET
            value = excluded.value,
            updated_at = CURRENT_TIMESTAMP
         RETURNING id",
        params![kpi, unit, month.format(MONTH_FORMAT).to_string(), value],
        |row| row.get(0),
    )?;

    let mut entry = KpiEntry::new(kpi, unit, month);
    entry.value = value;
    record_entry_event(&tx, "entry_value_saved", &entry, actor)?;
    tx.commit()?;
    Ok(id)
}

/// Create one empty entry per KPI the unit reports for that month.
/// Existing triples are left untouched. Returns how many were created.
/// Non-reporting units are rejected with `KpiError::NotReporting`.
pub fn open_month(
    conn: &Connection,
    catalog: &KpiCatalog,
    tree: &UnitTree,
    unit: UnitId,
    month: NaiveDate,
    actor: &str,
) -> Result<usize> {
    tree.require_reporter(unit)?;
    let month = crate::period::first_of_month(month);
    let month_str = month.format(MONTH_FORMAT).to_string();

    let tx = conn.unchecked_transaction()?;
    let mut created = 0;
    for kpi in catalog.indicators(tree, unit) {
        let changed = tx.execute(
            "INSERT OR IGNORE INTO kpi_entries (kpi_id, unit_id, month) VALUES (?1, ?2, ?3)",
            params![kpi.id, unit, month_str],
        )?;
        if changed > 0 {
            created += 1;
            record_entry_event(&tx, "entry_opened", &KpiEntry::new(kpi.id, unit, month), actor)?;
        }
    }
    tx.commit()?;

    tracing::info!(unit, month = %month_str, created, "opened reporting month");
    Ok(created)
}

pub fn get_entry(conn: &Connection, kpi: KpiId, unit: UnitId, month: NaiveDate) -> Result<Option<KpiEntry>> {
    let month = crate::period::first_of_month(month);
    let entry = conn
        .query_row(
            "SELECT id, kpi_id, unit_id, month, value, comments
             FROM kpi_entries
             WHERE kpi_id = ?1 AND unit_id = ?2 AND month = ?3",
            params![kpi, unit, month.format(MONTH_FORMAT).to_string()],
            entry_from_row,
        )
        .optional()?;
    Ok(entry)
}

/// Entries matching the filter, ordered by month
pub fn query_entries(conn: &Connection, filter: &EntryFilter) -> Result<Vec<KpiEntry>> {
    let mut sql = String::from(
        "SELECT id, kpi_id, unit_id, month, value, comments FROM kpi_entries WHERE 1 = 1",
    );
    let mut values: Vec<Value> = Vec::new();

    if let Some(units) = &filter.units {
        if units.is_empty() {
            return Ok(Vec::new());
        }
        sql.push_str(&format!(" AND unit_id IN ({})", placeholders(values.len(), units.len())));
        values.extend(units.iter().map(|u| Value::Integer(*u)));
    }
    if let Some(kpis) = &filter.kpis {
        if kpis.is_empty() {
            return Ok(Vec::new());
        }
        sql.push_str(&format!(" AND kpi_id IN ({})", placeholders(values.len(), kpis.len())));
        values.extend(kpis.iter().map(|k| Value::Integer(*k)));
    }
    if let Some(year) = filter.year {
        sql.push_str(&format!(" AND month >= ?{} AND month < ?{}", values.len() + 1, values.len() + 2));
        values.push(Value::Text(format!("{:04}-01-01", year)));
        values.push(Value::Text(format!("{:04}-01-01", year + 1)));
    }
    sql.push_str(" ORDER BY month, unit_id, kpi_id");

    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params_from_iter(values.iter()), entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    // Quarter narrowing happens here rather than in SQL
    Ok(entries.into_iter().filter(|e| filter.matches(e)).collect())
}

fn placeholders(offset: usize, count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", offset + i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Bulk insert/overwrite entries (returns how many were written)
pub fn insert_entries(conn: &Connection, entries: &[KpiEntry], actor: &str) -> Result<usize> {
    let mut written = 0;
    for entry in entries {
        upsert_entry(conn, entry, actor)
            .with_context(|| format!("Failed to store entry {}", entry.entity_id()))?;
        written += 1;
    }

    tracing::info!("Stored {} entries", written);
    Ok(written)
}

pub fn count_entries(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM kpi_entries", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// CSV loading
// ============================================================================

/// One row of a bulk-entry CSV: `kpi,unit,month,value,comments`
#[derive(Debug, Deserialize)]
pub struct CsvEntryRow {
    pub kpi: String,
    pub unit: String,
    pub month: String,
    pub value: Option<f64>,
    pub comments: Option<String>,
}

/// Read entries from CSV, resolving KPI names and unit acronyms
pub fn load_entries_csv(csv_path: &Path, catalog: &KpiCatalog, tree: &UnitTree) -> Result<Vec<KpiEntry>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut entries = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: CsvEntryRow = result.context("Failed to deserialize entry row")?;
        let entry = resolve_csv_row(&row, catalog, tree)
            .with_context(|| format!("Invalid entry on data row {}", line + 1))?;
        entries.push(entry);
    }

    Ok(entries)
}

fn resolve_csv_row(row: &CsvEntryRow, catalog: &KpiCatalog, tree: &UnitTree) -> Result<KpiEntry, KpiError> {
    let kpi = catalog
        .find_kpi_by_name(row.kpi.trim())
        .ok_or_else(|| KpiError::UnknownKpi(row.kpi.clone()))?;
    let unit = tree
        .find_by_acronym(row.unit.trim())
        .ok_or_else(|| KpiError::UnknownUnit(row.unit.clone()))?;
    tree.require_reporter(unit.id)?;
    let month = parse_month(&row.month)?;

    Ok(KpiEntry {
        id: 0,
        kpi: kpi.id,
        unit: unit.id,
        month,
        value: row.value,
        comments: row.comments.clone().filter(|c| !c.trim().is_empty()),
    })
}

// ============================================================================
// Audit trail
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use std::io::Write;

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    /// Department with two beamlines and three KPIs
    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let department = UnitKind::new(1, "Department", false);
        let beamline = UnitKind::new(2, "Beamline", true);
        save_unit(&conn, &Unit::new(1, "SCI", "Science", Some(department), None)).unwrap();
        save_unit(&conn, &Unit::new(2, "CMCF", "CMCF", Some(beamline.clone()), Some(1))).unwrap();
        save_unit(&conn, &Unit::new(3, "HXMA", "HXMA", Some(beamline), Some(1))).unwrap();

        save_category(&conn, &KpiCategory { id: 1, name: "Ops".into(), description: "Run well".into(), priority: 0 }).unwrap();
        save_kpi(&conn, &Kpi::new(1, "Shifts Used", KpiKind::Sum, Some(1), 0).with_units(&[1])).unwrap();
        save_kpi(&conn, &Kpi::new(2, "Availability", KpiKind::Average, Some(1), 1).with_units(&[2])).unwrap();
        save_kpi(&conn, &Kpi::new(3, "Highlights", KpiKind::Text, None, 0)).unwrap();
        save_family(&conn, &KpiFamily { id: 1, name: "Beam".into(), kind: FamilyKind::Cumulative, kpis: vec![2, 1] }).unwrap();
        conn
    }

    #[test]
    fn test_reference_data_round_trip() {
        let conn = seeded();

        let tree = load_units(&conn).unwrap();
        assert_eq!(tree.len(), 3);
        assert!(!tree.get(1).unwrap().reporter());
        assert_eq!(tree.reporting_scope(1), vec![2, 3]);

        let catalog = load_catalog(&conn).unwrap();
        assert_eq!(catalog.kpis().len(), 3);
        assert_eq!(catalog.kpi(1).unwrap().units, BTreeSet::from([1]));
        assert_eq!(catalog.families()[0].kpis, vec![2, 1]);
        assert_eq!(catalog.families()[0].kind, FamilyKind::Cumulative);
    }

    #[test]
    fn test_upsert_then_read_back() {
        let conn = seeded();
        let entry = KpiEntry::new(1, 2, month(2024, 1)).with_value(10.0).with_comments("Good month");

        let id = upsert_entry(&conn, &entry, "tester").unwrap();
        let stored = get_entry(&conn, 1, 2, month(2024, 1)).unwrap().unwrap();

        assert_eq!(stored.id, id);
        assert_eq!(stored.value, Some(10.0));
        assert_eq!(stored.comments.as_deref(), Some("Good month"));
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let conn = seeded();
        let first = upsert_entry(&conn, &KpiEntry::new(1, 2, month(2024, 1)).with_value(10.0), "a").unwrap();
        let second = upsert_entry(&conn, &KpiEntry::new(1, 2, month(2024, 1)).with_value(12.0), "b").unwrap();

        assert_eq!(first, second);
        assert_eq!(count_entries(&conn).unwrap(), 1);
        assert_eq!(get_entry(&conn, 1, 2, month(2024, 1)).unwrap().unwrap().value, Some(12.0));

        let events = get_events_for_entity(&conn, "kpi_entry", "1:2:2024-01").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].actor, "b");
    }

    #[test]
    fn test_upsert_value_keeps_comments() {
        let conn = seeded();
        upsert_entry(&conn, &KpiEntry::new(1, 2, month(2024, 1)).with_comments("Keep me"), "user").unwrap();
        upsert_entry_value(&conn, 1, 2, month(2024, 1), Some(7.0), "importer").unwrap();

        let stored = get_entry(&conn, 1, 2, month(2024, 1)).unwrap().unwrap();
        assert_eq!(stored.value, Some(7.0));
        assert_eq!(stored.comments.as_deref(), Some("Keep me"));
    }

    #[test]
    fn test_open_month_creates_applicable_entries_once() {
        let conn = seeded();
        let tree = load_units(&conn).unwrap();
        let catalog = load_catalog(&conn).unwrap();

        // CMCF reports KPI 1 (inherited from SCI) and KPI 2 (direct)
        let created = open_month(&conn, &catalog, &tree, 2, month(2024, 3), "tester").unwrap();
        assert_eq!(created, 2);

        let again = open_month(&conn, &catalog, &tree, 2, month(2024, 3), "tester").unwrap();
        assert_eq!(again, 0);

        // HXMA only inherits KPI 1
        assert_eq!(open_month(&conn, &catalog, &tree, 3, month(2024, 3), "tester").unwrap(), 1);
        assert_eq!(count_entries(&conn).unwrap(), 3);

        assert!(open_month(&conn, &catalog, &tree, 99, month(2024, 3), "tester").is_err());
    }

    #[test]
    fn test_open_month_rejects_non_reporting_unit() {
        let conn = seeded();
        let tree = load_units(&conn).unwrap();
        let catalog = load_catalog(&conn).unwrap();

        // SCI only aggregates its beamlines
        let err = open_month(&conn, &catalog, &tree, 1, month(2024, 3), "tester").unwrap_err();
        assert_eq!(err.downcast_ref::<KpiError>(), Some(&KpiError::NotReporting("SCI".into())));
        assert_eq!(count_entries(&conn).unwrap(), 0);
    }

    #[test]
    fn test_entry_write_rolls_back_without_audit_event() {
        let conn = seeded();
        conn.execute_batch("DROP TABLE events").unwrap();

        assert!(upsert_entry(&conn, &KpiEntry::new(1, 2, month(2024, 1)).with_value(5.0), "a").is_err());
        assert!(upsert_entry_value(&conn, 1, 2, month(2024, 1), Some(5.0), "a").is_err());
        assert_eq!(count_entries(&conn).unwrap(), 0);

        let tree = load_units(&conn).unwrap();
        let catalog = load_catalog(&conn).unwrap();
        assert!(open_month(&conn, &catalog, &tree, 2, month(2024, 1), "a").is_err());
        assert_eq!(count_entries(&conn).unwrap(), 0);
    }

    #[test]
    fn test_query_entries_with_filter() {
        let conn = seeded();
        for (kpi, unit, m, v) in [(1, 2, month(2024, 1), 1.0), (1, 3, month(2024, 5), 2.0), (2, 2, month(2023, 2), 3.0)] {
            upsert_entry(&conn, &KpiEntry::new(kpi, unit, m).with_value(v), "seed").unwrap();
        }

        assert_eq!(query_entries(&conn, &EntryFilter::all()).unwrap().len(), 3);
        assert_eq!(query_entries(&conn, &EntryFilter::all().with_year(2024)).unwrap().len(), 2);
        assert_eq!(query_entries(&conn, &EntryFilter::for_kpi(2)).unwrap().len(), 1);

        let filtered = query_entries(&conn, &EntryFilter::all().with_units([3]).with_year(2024).with_quarter(2)).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].value, Some(2.0));

        let empty_units = EntryFilter::all().with_units(Vec::<UnitId>::new());
        assert!(query_entries(&conn, &empty_units).unwrap().is_empty());
    }

    #[test]
    fn test_load_entries_csv() {
        let conn = seeded();
        let tree = load_units(&conn).unwrap();
        let catalog = load_catalog(&conn).unwrap();

        let dir = std::env::temp_dir().join(format!("kpi-csv-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("entries.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "kpi,unit,month,value,comments").unwrap();
        writeln!(file, "Shifts Used,cmcf,2024-02,12,").unwrap();
        writeln!(file, "Highlights,HXMA,2024-02-01,,New optics").unwrap();
        drop(file);

        let entries = load_entries_csv(&path, &catalog, &tree).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kpi, 1);
        assert_eq!(entries[0].unit, 2);
        assert_eq!(entries[0].value, Some(12.0));
        assert_eq!(entries[0].comments, None);
        assert_eq!(entries[1].comments.as_deref(), Some("New optics"));
        assert_eq!(entries[1].month.month(), 2);

        assert_eq!(insert_entries(&conn, &entries, "csv").unwrap(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_csv_unknown_unit_is_rejected() {
        let conn = seeded();
        let tree = load_units(&conn).unwrap();
        let catalog = load_catalog(&conn).unwrap();

        let row = CsvEntryRow {
            kpi: "Shifts Used".into(),
            unit: "NOPE".into(),
            month: "2024-01".into(),
            value: Some(1.0),
            comments: None,
        };
        assert_eq!(
            resolve_csv_row(&row, &catalog, &tree).unwrap_err(),
            KpiError::UnknownUnit("NOPE".into())
        );

        let department = CsvEntryRow { unit: "sci".into(), ..row };
        assert_eq!(
            resolve_csv_row(&department, &catalog, &tree).unwrap_err(),
            KpiError::NotReporting("SCI".into())
        );
    }

    #[test]
    fn test_reference_data_from_json() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let data: ReferenceData = serde_json::from_value(serde_json::json!({
            "units": [
                {"id": 1, "name": "Facility", "acronym": "CLS", "kind": null, "parent": null},
                {"id": 2, "name": "CMCF", "acronym": "CMCF",
                 "kind": {"id": 2, "name": "Beamline", "reporter": true}, "parent": 1,
                 "acronyms": "CMCF-BM,CMCF-ID"}
            ],
            "categories": [{"id": 1, "name": "Operations"}],
            "kpis": [{"id": 8, "name": "Normal Shifts", "category": 1, "kind": "SUM", "units": [2]}]
        }))
        .unwrap();

        save_reference_data(&mut conn, &data).unwrap();

        let tree = load_units(&conn).unwrap();
        assert_eq!(tree.get(2).unwrap().beamline_acronyms(), vec!["CMCF-BM", "CMCF-ID"]);
        let catalog = load_catalog(&conn).unwrap();
        assert_eq!(catalog.kpi(8).unwrap().kind, KpiKind::Sum);
    }

    #[test]
    fn test_reference_data_children_listed_first() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let beamline = UnitKind::new(2, "Beamline", true);
        let data = ReferenceData {
            units: vec![
                Unit::new(3, "HXMA", "HXMA", Some(beamline), Some(2)),
                Unit::new(2, "SCI", "Science", None, Some(1)),
                Unit::new(1, "CLS", "Facility", None, None),
            ],
            ..ReferenceData::default()
        };

        save_reference_data(&mut conn, &data).unwrap();

        let tree = load_units(&conn).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.ancestors(3).iter().map(|u| u.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_reference_data_rejects_cycles() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let a = Unit::new(1, "A", "A", None, Some(2));
        let b = Unit::new(2, "B", "B", None, Some(1));
        let data = ReferenceData { units: vec![a, b], ..ReferenceData::default() };

        assert!(save_reference_data(&mut conn, &data).is_err());
        assert_eq!(load_units(&conn).unwrap().len(), 0);
    }

    #[test]
    fn test_event_log() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let event = Event::new(
            "test_event",
            "kpi_entry",
            "test_id_123",
            serde_json::json!({"test": "data"}),
            "test_actor",
        );

        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "kpi_entry", "test_id_123").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "test_event");
        assert_eq!(events[0].actor, "test_actor");
    }
}
