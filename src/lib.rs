// Facility KPIs - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod roles;
pub mod entities;   // Units and the KPI catalog
pub mod period;     // Month / quarter / year buckets
pub mod db;         // Entry store (SQLite)
pub mod aggregate;  // Period aggregator
pub mod report;     // Report builder
pub mod importer;   // Facility service import jobs
pub mod config;

// Re-export commonly used types
pub use error::KpiError;
pub use entities::{
    default_admin_roles, Dendrogram, Unit, UnitId, UnitKind, UnitTree,
    CategoryId, FamilyKind, Kpi, KpiCatalog, KpiCategory, KpiFamily, KpiId, KpiKind,
};
pub use roles::{AccessPolicy, Principal, Role, RoleKind, RoleSet};
pub use period::{parse_month, Period, PeriodKey};
pub use db::{
    KpiEntry, Event, ReferenceData,
    setup_database, save_reference_data, load_units, load_catalog,
    upsert_entry, upsert_entry_value, open_month, get_entry, query_entries,
    insert_entries, load_entries_csv, count_entries,
    insert_event, get_events_for_entity,
};
pub use aggregate::{aggregate, available_years, Aggregation, EntryFilter, KpiSeries, Note};
pub use report::{
    facility_report, kpi_report, unit_report,
    Cell, ContentBlock, Report, ReportBuilder, ReportRequest, Section,
};
pub use importer::{
    import_beam_usage, import_publications,
    BeamUsageKpis, FacilityApi, ImportSummary, Publication, PublicationMapping, ScheduleBlock,
};
#[cfg(feature = "fetch")]
pub use importer::UsoClient;
pub use config::{load_config, get_database_path, Config};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
