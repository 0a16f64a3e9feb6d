// Domain errors for the KPI model
//
// Application paths return anyhow::Result; these are the cases callers
// want to match on (bad references, broken hierarchy, bad period names).

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum KpiError {
    #[error("unit not found: {0}")]
    UnknownUnit(String),

    #[error("KPI not found: {0}")]
    UnknownKpi(String),

    #[error("unit {unit} references missing parent {parent}")]
    MissingParent { unit: i64, parent: i64 },

    #[error("unit {0} does not submit entries of its own")]
    NotReporting(String),

    #[error("unit hierarchy contains a cycle through unit {0}")]
    Cycle(i64),

    #[error("unknown period '{0}' (expected month, quarter or year)")]
    InvalidPeriod(String),

    #[error("invalid month '{0}' (expected YYYY-MM)")]
    InvalidMonth(String),

    #[error("invalid role '{0}'")]
    InvalidRole(String),
}
