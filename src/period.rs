// ⏰ Periods - month / quarter / year buckets
//
// Entries are keyed by month (first day of the month). A PeriodKey is the
// bucket an entry's month falls into for a given granularity; keys order
// chronologically so sorted sets of keys are the report columns.

use crate::error::KpiError;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MONTH_ABBR: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const MONTH_NAME: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];

// ============================================================================
// GRANULARITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Month,
    Quarter,
    Year,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Month => "month",
            Period::Quarter => "quarter",
            Period::Year => "year",
        }
    }

    /// Axis title ("Month", "Quarter", "Year")
    pub fn title(&self) -> &'static str {
        match self {
            Period::Month => "Month",
            Period::Quarter => "Quarter",
            Period::Year => "Year",
        }
    }

    /// strftime pattern for time-scaled chart axes
    pub fn time_format(&self) -> &'static str {
        match self {
            Period::Month | Period::Quarter => "%b",
            Period::Year => "%Y",
        }
    }

    /// Bucket a month falls into
    pub fn key(&self, month: NaiveDate) -> PeriodKey {
        match self {
            Period::Month => PeriodKey::Month {
                year: month.year(),
                month: month.month(),
            },
            Period::Quarter => PeriodKey::Quarter {
                year: month.year(),
                quarter: quarter_of(month.month()),
            },
            Period::Year => PeriodKey::Year(month.year()),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = KpiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "month" => Ok(Period::Month),
            "quarter" => Ok(Period::Quarter),
            "year" => Ok(Period::Year),
            _ => Err(KpiError::InvalidPeriod(s.to_string())),
        }
    }
}

pub fn quarter_of(month: u32) -> u32 {
    (month.clamp(1, 12) - 1) / 3 + 1
}

// ============================================================================
// PERIOD KEY
// ============================================================================

/// One report column. All keys of one report share a granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKey {
    Month { year: i32, month: u32 },
    Quarter { year: i32, quarter: u32 },
    Year(i32),
}

impl PeriodKey {
    pub fn year(&self) -> i32 {
        match self {
            PeriodKey::Month { year, .. } | PeriodKey::Quarter { year, .. } => *year,
            PeriodKey::Year(year) => *year,
        }
    }

    /// First day of the period
    pub fn start_date(&self) -> NaiveDate {
        let (year, month) = match self {
            PeriodKey::Month { year, month } => (*year, *month),
            PeriodKey::Quarter { year, quarter } => (*year, ((*quarter).clamp(1, 4) - 1) * 3 + 1),
            PeriodKey::Year(year) => (*year, 1),
        };
        NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Short column label; `with_year` disambiguates multi-year reports
    pub fn label(&self, with_year: bool) -> String {
        match self {
            PeriodKey::Month { year, month } => {
                let abbr = month_abbr(*month);
                if with_year {
                    format!("{} {}", abbr, year)
                } else {
                    abbr.to_string()
                }
            }
            PeriodKey::Quarter { year, quarter } => {
                if with_year {
                    format!("Q{} {}", quarter, year)
                } else {
                    format!("Q{}", quarter)
                }
            }
            PeriodKey::Year(year) => year.to_string(),
        }
    }
}

/// Labels for a sorted key list, adding years only when needed
pub fn period_labels(keys: &[PeriodKey]) -> Vec<String> {
    let with_year = spans_years(keys);
    keys.iter().map(|k| k.label(with_year)).collect()
}

pub fn spans_years(keys: &[PeriodKey]) -> bool {
    match (keys.first(), keys.last()) {
        (Some(first), Some(last)) => first.year() != last.year(),
        _ => false,
    }
}

pub fn month_abbr(month: u32) -> &'static str {
    MONTH_ABBR[(month.clamp(1, 12) - 1) as usize]
}

pub fn month_name(month: u32) -> &'static str {
    MONTH_NAME[(month.clamp(1, 12) - 1) as usize]
}

// ============================================================================
// MONTH HELPERS
// ============================================================================

/// Normalize any date to the first day of its month
pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the following month
pub fn next_month(month: NaiveDate) -> NaiveDate {
    let (year, m) = if month.month() == 12 {
        (month.year() + 1, 1)
    } else {
        (month.year(), month.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, m, 1).unwrap_or(month)
}

/// Parse "YYYY-MM" or "YYYY-MM-DD" into the first day of that month
pub fn parse_month(raw: &str) -> Result<NaiveDate, KpiError> {
    let raw = raw.trim();
    let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", raw), "%Y-%m-%d"))
        .map_err(|_| KpiError::InvalidMonth(raw.to_string()))?;
    Ok(first_of_month(parsed))
}
