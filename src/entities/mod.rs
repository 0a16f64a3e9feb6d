// Entity Models
//
// Reference data the reports are built over:
// - Units: organizational tree with ancestor/descendant queries
// - KPIs: indicator catalog (categories, kinds, families)

pub mod unit;
pub mod kpi;

pub use unit::{default_admin_roles, Dendrogram, Unit, UnitId, UnitKind, UnitTree};
pub use kpi::{CategoryId, FamilyKind, Kpi, KpiCatalog, KpiCategory, KpiFamily, KpiId, KpiKind};
