// 📑 Report Builder - renderer-agnostic content tree
//
// A report is a list of sections, each a list of content blocks. The
// builder only shapes data: templates or the JSON API decide how blocks
// look. Layout:
//
//   Summary      one table, every numeric KPI across the report periods
//   <category>   per category in priority order, KPIs in priority order
//   Other        uncategorized KPIs
//   Families     combined charts for KPI families with data

use crate::aggregate::{aggregate, Aggregation, EntryFilter, KpiSeries, Note};
use crate::db::KpiEntry;
use crate::entities::{FamilyKind, Kpi, KpiCatalog, KpiId, KpiKind, UnitId, UnitTree};
use crate::error::KpiError;
use crate::period::{period_labels, spans_years, Period, PeriodKey};
use chrono::Datelike;
use serde::ser::Serializer;
use serde::Serialize;
use std::collections::BTreeSet;

pub const NO_INFORMATION: &str = "No information";
pub const NO_DATA: &str = "No data available";
pub const STRATEGIC_GOAL: &str = "Strategic goal";

// ============================================================================
// CONTENT TREE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub title: String,
    pub period: Period,
    /// Years with data in the report's unit/KPI scope (for navigation)
    pub years: Vec<i32>,
    pub sections: Vec<Section>,
}

impl Report {
    /// Placeholder returned when nothing matches the filter
    pub fn no_information(title: &str, period: Period, years: Vec<i32>) -> Self {
        Report {
            title: title.to_string(),
            period,
            years,
            sections: vec![Section::new(NO_INFORMATION)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.blocks.is_empty())
    }

    pub fn section(&self, title: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.title == title)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub title: String,
    pub blocks: Vec<ContentBlock>,
}

impl Section {
    fn new(title: &str) -> Self {
        Section {
            title: title.to_string(),
            blocks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    Description { title: String, text: String },
    Table(Table),
    ColumnChart(ColumnChart),
    LineChart(LineChart),
    FamilyChart(FamilyChart),
    Notes(Notes),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub title: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    /// Comments attached to the numbers in the table
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
}

/// A table cell; missing values render as "-"
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Missing,
}

impl Cell {
    fn from_value(value: Option<f64>) -> Self {
        value.map_or(Cell::Missing, Cell::Number)
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cell::Text(text) => serializer.serialize_str(text),
            Cell::Number(value) => serializer.serialize_f64(*value),
            Cell::Missing => serializer.serialize_str("-"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnChart {
    pub title: String,
    pub x_label: String,
    pub data: Vec<ChartPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

/// Trend over time; `x` holds ISO period start dates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineChart {
    pub title: String,
    pub x_label: String,
    pub x: Vec<String>,
    pub series: Vec<Series>,
    pub x_scale: String,
    pub time_format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilyChart {
    pub title: String,
    pub x_label: String,
    pub labels: Vec<String>,
    pub series: Vec<Series>,
    pub stacked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notes {
    pub title: String,
    pub notes: Vec<Note>,
    /// Shown instead of notes when there is nothing to list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// REQUEST
// ============================================================================

/// What to report on and at which granularity
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRequest {
    pub title: String,
    pub period: Period,
    pub filter: EntryFilter,
}

impl ReportRequest {
    pub fn new(title: &str, period: Period, filter: EntryFilter) -> Self {
        ReportRequest {
            title: title.to_string(),
            period,
            filter,
        }
    }

    /// Narrow a scope to a year and quarter. Without a year the report is a
    /// yearly overview; with one it is monthly. `period` overrides the
    /// default granularity.
    pub fn scoped(
        title: &str,
        filter: EntryFilter,
        year: Option<i32>,
        quarter: Option<u32>,
        period: Option<Period>,
    ) -> Result<Self, KpiError> {
        let mut filter = filter;
        let mut title = title.to_string();

        if let Some(q) = quarter {
            if !(1..=4).contains(&q) {
                return Err(KpiError::InvalidPeriod(format!("Q{}", q)));
            }
            if year.is_none() {
                return Err(KpiError::InvalidPeriod(format!("Q{} without a year", q)));
            }
        }

        match (year, quarter) {
            (Some(y), Some(q)) => {
                filter = filter.with_year(y).with_quarter(q);
                title = format!("{} Q{} {}", title, q, y);
            }
            (Some(y), None) => {
                filter = filter.with_year(y);
                title = format!("{} {}", title, y);
            }
            _ => {}
        }

        let default_period = if year.is_some() { Period::Month } else { Period::Year };

        Ok(ReportRequest {
            title,
            period: period.unwrap_or(default_period),
            filter,
        })
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct ReportBuilder<'a> {
    catalog: &'a KpiCatalog,
    tree: &'a UnitTree,
}

impl<'a> ReportBuilder<'a> {
    pub fn new(catalog: &'a KpiCatalog, tree: &'a UnitTree) -> Self {
        ReportBuilder { catalog, tree }
    }

    pub fn build(&self, entries: &[KpiEntry], request: &ReportRequest) -> Report {
        let years = self.navigation_years(entries, &request.filter);
        let agg = aggregate(self.catalog, self.tree, entries, &request.filter, request.period);

        if agg.is_empty() {
            tracing::debug!(title = %request.title, "no entries in scope");
            return Report::no_information(&request.title, request.period, years);
        }

        let labels = period_labels(&agg.periods);
        let with_year = spans_years(&agg.periods);
        let mut sections = Vec::new();

        let summary = self.summary_table(&agg, &labels);
        if !summary.rows.is_empty() {
            let mut section = Section::new("Summary");
            section.blocks.push(ContentBlock::Table(summary));
            sections.push(section);
        }

        for category in self.catalog.categories() {
            let kpis = self.catalog.kpis_in_category(Some(category.id));
            let blocks = self.kpi_blocks(&kpis, &agg, with_year);
            if blocks.is_empty() {
                continue;
            }

            let mut section = Section::new(&category.name);
            if !category.description.trim().is_empty() {
                section.blocks.push(ContentBlock::Description {
                    title: STRATEGIC_GOAL.to_string(),
                    text: category.description.clone(),
                });
            }
            section.blocks.extend(blocks);
            sections.push(section);
        }

        let uncategorized = self.catalog.kpis_in_category(None);
        let blocks = self.kpi_blocks(&uncategorized, &agg, with_year);
        if !blocks.is_empty() {
            let mut section = Section::new("Other");
            section.blocks = blocks;
            sections.push(section);
        }

        let families = self.family_charts(&agg, &labels);
        if !families.is_empty() {
            let mut section = Section::new("Families");
            section.blocks = families;
            sections.push(section);
        }

        tracing::debug!(
            title = %request.title,
            sections = sections.len(),
            periods = agg.periods.len(),
            "built report"
        );

        Report {
            title: request.title.clone(),
            period: request.period,
            years,
            sections,
        }
    }

    fn navigation_years(&self, entries: &[KpiEntry], filter: &EntryFilter) -> Vec<i32> {
        let mut scope = filter.clone();
        scope.year = None;
        scope.quarter = None;
        scope
            .apply(entries)
            .iter()
            .map(|e| e.month.year())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn summary_table(&self, agg: &Aggregation, labels: &[String]) -> Table {
        let mut header = vec![String::new()];
        header.extend(labels.iter().cloned());
        header.push("Total / Avg".to_string());

        let rows = agg
            .series
            .iter()
            .filter(|s| s.kind.is_numeric())
            .filter_map(|s| self.catalog.kpi(s.kpi).map(|kpi| (kpi, s)))
            .map(|(kpi, series)| value_row(kpi, series, &agg.periods))
            .collect();

        Table {
            title: "Summary".to_string(),
            header,
            rows,
            notes: Vec::new(),
        }
    }

    fn kpi_blocks(&self, kpis: &[&Kpi], agg: &Aggregation, with_year: bool) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        for kpi in kpis {
            // KPIs with no entries in scope are left out
            let Some(series) = agg.series_for(kpi.id) else {
                continue;
            };

            blocks.push(ContentBlock::Description {
                title: format!("{}. {}", self.catalog.priority_display(kpi), kpi.name),
                text: kpi.description.clone(),
            });

            match kpi.kind {
                KpiKind::Text => blocks.push(ContentBlock::Notes(Notes {
                    title: kpi.name.clone(),
                    message: series.notes.is_empty().then(|| NO_DATA.to_string()),
                    notes: series.notes.clone(),
                })),
                _ if !series.has_values() => blocks.push(ContentBlock::Notes(Notes {
                    title: kpi.name.clone(),
                    notes: series.notes.clone(),
                    message: Some(NO_DATA.to_string()),
                })),
                _ => {
                    blocks.push(ContentBlock::Table(kpi_table(kpi, series, with_year)));
                    blocks.push(ContentBlock::ColumnChart(column_chart(kpi, series, agg.period, with_year)));
                    blocks.push(ContentBlock::LineChart(line_chart(kpi, series, agg.period)));
                }
            }
        }
        blocks
    }

    fn family_charts(&self, agg: &Aggregation, labels: &[String]) -> Vec<ContentBlock> {
        self.catalog
            .families()
            .iter()
            .filter_map(|family| {
                let series: Vec<Series> = family
                    .kpis
                    .iter()
                    .filter_map(|id| {
                        let kpi = self.catalog.kpi(*id)?;
                        let data = agg.series_for(*id).filter(|s| s.has_values())?;
                        Some(Series {
                            name: kpi.name.clone(),
                            values: agg.periods.iter().map(|p| data.value(p)).collect(),
                        })
                    })
                    .collect();

                if series.is_empty() {
                    return None;
                }

                Some(ContentBlock::FamilyChart(FamilyChart {
                    title: family.name.clone(),
                    x_label: agg.period.title().to_string(),
                    labels: labels.to_vec(),
                    series,
                    stacked: family.kind == FamilyKind::Cumulative,
                }))
            })
            .collect()
    }
}

fn value_row(kpi: &Kpi, series: &KpiSeries, periods: &[PeriodKey]) -> Vec<Cell> {
    let mut row = vec![Cell::Text(kpi.name.clone())];
    row.extend(periods.iter().map(|p| Cell::from_value(series.value(p))));
    row.push(Cell::from_value(series.total));
    row
}

fn kpi_table(kpi: &Kpi, series: &KpiSeries, with_year: bool) -> Table {
    let periods = series.periods();

    let mut header = vec![String::new()];
    header.extend(periods.iter().map(|p| p.label(with_year)));
    header.push(kpi.kind.display().to_string());

    Table {
        title: kpi.name.clone(),
        header,
        rows: vec![value_row(kpi, series, &periods)],
        notes: series.notes.clone(),
    }
}

fn column_chart(kpi: &Kpi, series: &KpiSeries, period: Period, with_year: bool) -> ColumnChart {
    ColumnChart {
        title: kpi.name.clone(),
        x_label: period.title().to_string(),
        data: series
            .values
            .iter()
            .map(|(key, value)| ChartPoint {
                label: key.label(with_year),
                value: *value,
            })
            .collect(),
    }
}

fn line_chart(kpi: &Kpi, series: &KpiSeries, period: Period) -> LineChart {
    LineChart {
        title: kpi.name.clone(),
        x_label: period.title().to_string(),
        x: series
            .values
            .keys()
            .map(|k| k.start_date().format("%Y-%m-%d").to_string())
            .collect(),
        series: vec![Series {
            name: kpi.name.clone(),
            values: series.trend.iter().copied().map(Some).collect(),
        }],
        x_scale: "time".to_string(),
        time_format: period.time_format().to_string(),
    }
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Report for one unit: its own entries when it reports, plus every
/// reporting unit below it
pub fn unit_report(
    catalog: &KpiCatalog,
    tree: &UnitTree,
    entries: &[KpiEntry],
    unit: UnitId,
    year: Option<i32>,
    quarter: Option<u32>,
    period: Option<Period>,
) -> Result<Report, KpiError> {
    let target = tree.require(unit)?;
    let request = ReportRequest::scoped(
        &target.name,
        EntryFilter::for_unit(tree, unit),
        year,
        quarter,
        period,
    )?;
    Ok(ReportBuilder::new(catalog, tree).build(entries, &request))
}

/// Report for one KPI across every unit reporting it
pub fn kpi_report(
    catalog: &KpiCatalog,
    tree: &UnitTree,
    entries: &[KpiEntry],
    kpi: KpiId,
    year: Option<i32>,
    quarter: Option<u32>,
    period: Option<Period>,
) -> Result<Report, KpiError> {
    let target = catalog
        .kpi(kpi)
        .ok_or_else(|| KpiError::UnknownKpi(kpi.to_string()))?;
    let request = ReportRequest::scoped(&target.name, EntryFilter::for_kpi(kpi), year, quarter, period)?;
    Ok(ReportBuilder::new(catalog, tree).build(entries, &request))
}

/// Facility-wide report over every entry
pub fn facility_report(
    catalog: &KpiCatalog,
    tree: &UnitTree,
    entries: &[KpiEntry],
    year: Option<i32>,
    quarter: Option<u32>,
    period: Option<Period>,
) -> Result<Report, KpiError> {
    let request = ReportRequest::scoped("Facility", EntryFilter::all(), year, quarter, period)?;
    Ok(ReportBuilder::new(catalog, tree).build(entries, &request))
}

// ============================================================================
// TESTS
// ============================================================================
