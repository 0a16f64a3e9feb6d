// 🧮 Period Aggregator - bucket entries by period and reduce per KPI
//
// Reduction by KPI kind:
//   SUM      sum of non-null values per bucket, trend = running total
//   AVERAGE  mean of non-null values per bucket (1 decimal), trend = series
//   TEXT     no numbers, comments collected newest first
//
// A bucket with no non-null values is absent: it never shows up in
// values, trends or totals.

use crate::db::KpiEntry;
use crate::entities::{Kpi, KpiCatalog, KpiId, KpiKind, UnitId, UnitTree};
use crate::period::{month_name, Period, PeriodKey};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// ENTRY FILTER
// ============================================================================

/// Which entries a report covers. `None` means "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryFilter {
    pub units: Option<BTreeSet<UnitId>>,
    pub kpis: Option<BTreeSet<KpiId>>,
    pub year: Option<i32>,
    pub quarter: Option<u32>,
}

impl EntryFilter {
    pub fn all() -> Self {
        EntryFilter::default()
    }

    /// Entries of the unit's reporting scope (itself if it reports, plus
    /// every reporting descendant)
    pub fn for_unit(tree: &UnitTree, unit: UnitId) -> Self {
        EntryFilter {
            units: Some(tree.reporting_scope(unit).into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn for_kpi(kpi: KpiId) -> Self {
        EntryFilter {
            kpis: Some(BTreeSet::from([kpi])),
            ..Default::default()
        }
    }

    pub fn with_units(mut self, units: impl IntoIterator<Item = UnitId>) -> Self {
        self.units = Some(units.into_iter().collect());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_quarter(mut self, quarter: u32) -> Self {
        self.quarter = Some(quarter);
        self
    }

    pub fn matches(&self, entry: &KpiEntry) -> bool {
        if let Some(units) = &self.units {
            if !units.contains(&entry.unit) {
                return false;
            }
        }
        if let Some(kpis) = &self.kpis {
            if !kpis.contains(&entry.kpi) {
                return false;
            }
        }
        if let Some(year) = self.year {
            if entry.month.year() != year {
                return false;
            }
        }
        if let Some(quarter) = self.quarter {
            if crate::period::quarter_of(entry.month.month()) != quarter {
                return false;
            }
        }
        true
    }

    pub fn apply<'a>(&self, entries: &'a [KpiEntry]) -> Vec<&'a KpiEntry> {
        entries.iter().filter(|e| self.matches(e)).collect()
    }
}

// ============================================================================
// DISTINCT PERIODS
// ============================================================================

/// Sorted, de-duplicated periods present in the entries
pub fn distinct_periods<'a>(entries: impl IntoIterator<Item = &'a KpiEntry>, period: Period) -> Vec<PeriodKey> {
    entries
        .into_iter()
        .map(|e| period.key(e.month))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Years that have any entry
pub fn available_years(entries: &[KpiEntry]) -> Vec<i32> {
    distinct_periods(entries, Period::Year)
        .iter()
        .map(|k| k.year())
        .collect()
}

// ============================================================================
// REDUCTION
// ============================================================================

/// Round half away from zero to one decimal (2.25 → 2.3, unlike
/// banker's rounding which gives 2.2)
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Reduce the non-null values of one bucket. None = empty bucket.
pub fn reduce(kind: KpiKind, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match kind {
        KpiKind::Sum => Some(values.iter().sum()),
        KpiKind::Average => Some(round1(values.iter().sum::<f64>() / values.len() as f64)),
        KpiKind::Text => None,
    }
}

/// Running trend over period values in order
pub fn trend(kind: KpiKind, values: &[f64]) -> Vec<f64> {
    match kind {
        KpiKind::Sum => values
            .iter()
            .scan(0.0, |acc, v| {
                *acc += v;
                Some(*acc)
            })
            .collect(),
        KpiKind::Average => values.to_vec(),
        KpiKind::Text => Vec::new(),
    }
}

/// Grand total over period values
pub fn total(kind: KpiKind, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match kind {
        KpiKind::Sum => Some(values.iter().sum()),
        KpiKind::Average => Some(round1(values.iter().sum::<f64>() / values.len() as f64)),
        KpiKind::Text => None,
    }
}

// ============================================================================
// NOTES
// ============================================================================

/// One labeled comment ("CMCF-BM March: beam dump on the 4th")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub label: String,
    pub text: String,
}

/// Non-empty comments, newest month first, labeled with unit acronym
/// (only when several units contribute) and month name.
pub fn collect_notes(entries: &[&KpiEntry], tree: &UnitTree) -> Vec<Note> {
    let units: BTreeSet<UnitId> = entries.iter().map(|e| e.unit).collect();
    let multi_unit = units.len() > 1;
    let years: BTreeSet<i32> = entries.iter().map(|e| e.month.year()).collect();
    let multi_year = years.len() > 1;

    let acronym = |unit: UnitId| -> String {
        tree.get(unit)
            .map(|u| u.acronym.clone())
            .unwrap_or_else(|| unit.to_string())
    };

    let mut commented: Vec<(NaiveDate, String, &str)> = entries
        .iter()
        .filter_map(|e| {
            let text = e.comments.as_deref()?.trim();
            if text.is_empty() {
                None
            } else {
                Some((e.month, acronym(e.unit), text))
            }
        })
        .collect();

    commented.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    commented
        .into_iter()
        .map(|(month, acr, text)| {
            let mut label = month_name(month.month()).to_string();
            if multi_year {
                label = format!("{} {}", label, month.year());
            }
            if multi_unit {
                label = format!("{} {}", acr, label);
            }
            Note {
                label,
                text: text.to_string(),
            }
        })
        .collect()
}

// ============================================================================
// KPI SERIES
// ============================================================================

/// Aggregated view of one KPI over the report periods
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiSeries {
    pub kpi: KpiId,
    pub kind: KpiKind,
    /// Reduced value per non-empty bucket; JSON is a `[{period, value}]` list
    #[serde(serialize_with = "serialize_period_values")]
    pub values: BTreeMap<PeriodKey, f64>,
    /// Cumulative (SUM) or plain (AVERAGE) series, aligned with `values`
    pub trend: Vec<f64>,
    pub total: Option<f64>,
    pub notes: Vec<Note>,
    pub entry_count: usize,
}

fn serialize_period_values<S: Serializer>(values: &BTreeMap<PeriodKey, f64>, serializer: S) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct PeriodValue<'a> {
        period: &'a PeriodKey,
        value: f64,
    }

    serializer.collect_seq(values.iter().map(|(period, &value)| PeriodValue { period, value }))
}

impl KpiSeries {
    /// Periods with a value, ascending
    pub fn periods(&self) -> Vec<PeriodKey> {
        self.values.keys().copied().collect()
    }

    pub fn value(&self, key: &PeriodKey) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn has_values(&self) -> bool {
        !self.values.is_empty()
    }
}

/// Aggregate the entries of a single KPI
pub fn aggregate_kpi(kpi: &Kpi, entries: &[&KpiEntry], period: Period, tree: &UnitTree) -> KpiSeries {
    let mut buckets: BTreeMap<PeriodKey, Vec<f64>> = BTreeMap::new();
    if kpi.kind.is_numeric() {
        for entry in entries {
            if let Some(value) = entry.value {
                buckets.entry(period.key(entry.month)).or_default().push(value);
            }
        }
    }

    let values: BTreeMap<PeriodKey, f64> = buckets
        .into_iter()
        .filter_map(|(key, bucket)| reduce(kpi.kind, &bucket).map(|v| (key, v)))
        .collect();

    let ordered: Vec<f64> = values.values().copied().collect();

    KpiSeries {
        kpi: kpi.id,
        kind: kpi.kind,
        trend: trend(kpi.kind, &ordered),
        total: total(kpi.kind, &ordered),
        values,
        notes: collect_notes(entries, tree),
        entry_count: entries.len(),
    }
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Everything the report builder needs from one filtered entry set
#[derive(Debug, Clone, Serialize)]
pub struct Aggregation {
    pub period: Period,
    /// Report-wide periods (every entry counts, null values included)
    pub periods: Vec<PeriodKey>,
    /// One series per KPI with entries in scope, catalog order
    pub series: Vec<KpiSeries>,
    pub entry_count: usize,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn series_for(&self, kpi: KpiId) -> Option<&KpiSeries> {
        self.series.iter().find(|s| s.kpi == kpi)
    }
}

/// Filter, bucket and reduce. KPIs without entries in scope are left out;
/// entries of KPIs unknown to the catalog are ignored.
pub fn aggregate(
    catalog: &KpiCatalog,
    tree: &UnitTree,
    entries: &[KpiEntry],
    filter: &EntryFilter,
    period: Period,
) -> Aggregation {
    let scoped: Vec<&KpiEntry> = filter
        .apply(entries)
        .into_iter()
        .filter(|e| catalog.kpi(e.kpi).is_some())
        .collect();

    let mut by_kpi: HashMap<KpiId, Vec<&KpiEntry>> = HashMap::new();
    for &entry in &scoped {
        by_kpi.entry(entry.kpi).or_default().push(entry);
    }

    let series = catalog
        .kpis()
        .iter()
        .filter_map(|kpi| {
            by_kpi
                .get(&kpi.id)
                .map(|kpi_entries| aggregate_kpi(kpi, kpi_entries, period, tree))
        })
        .collect();

    tracing::debug!(
        entries = scoped.len(),
        kpis = by_kpi.len(),
        period = %period,
        "aggregated entries"
    );

    Aggregation {
        period,
        periods: distinct_periods(scoped.iter().copied(), period),
        series,
        entry_count: scoped.len(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{KpiCategory, Unit, UnitKind};

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn entry(kpi: KpiId, unit: UnitId, m: NaiveDate, value: Option<f64>, comments: Option<&str>) -> KpiEntry {
        KpiEntry {
            id: 0,
            kpi,
            unit,
            month: m,
            value,
            comments: comments.map(str::to_string),
        }
    }

    fn tree() -> UnitTree {
        let beamline = UnitKind::new(2, "Beamline", true);
        UnitTree::new(vec![
            Unit::new(1, "SCI", "Science", Some(UnitKind::new(1, "Department", false)), None),
            Unit::new(2, "CMCF", "CMCF", Some(beamline.clone()), Some(1)),
            Unit::new(3, "HXMA", "HXMA", Some(beamline), Some(1)),
        ])
        .unwrap()
    }

    fn catalog() -> KpiCatalog {
        KpiCatalog::new(
            vec![KpiCategory { id: 1, name: "Operations".into(), description: String::new(), priority: 0 }],
            vec![
                Kpi::new(1, "Shifts Used", KpiKind::Sum, Some(1), 0),
                Kpi::new(2, "Availability", KpiKind::Average, Some(1), 1),
                Kpi::new(3, "Highlights", KpiKind::Text, Some(1), 2),
                Kpi::new(4, "Unused", KpiKind::Sum, Some(1), 3),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn test_sum_trend_and_total() {
        let entries = vec![
            entry(1, 2, month(2024, 1), Some(10.0), None),
            entry(1, 2, month(2024, 2), Some(5.0), None),
            entry(1, 2, month(2024, 3), Some(0.0), None),
        ];
        let agg = aggregate(&catalog(), &tree(), &entries, &EntryFilter::all(), Period::Month);
        let series = agg.series_for(1).unwrap();

        assert_eq!(series.trend, vec![10.0, 15.0, 15.0]);
        assert_eq!(series.total, Some(15.0));
    }

    #[test]
    fn test_average_yearly_total() {
        let entries = vec![
            entry(2, 2, month(2024, 1), Some(2.0), None),
            entry(2, 2, month(2024, 2), Some(4.0), None),
        ];
        let agg = aggregate(&catalog(), &tree(), &entries, &EntryFilter::all(), Period::Year);
        let series = agg.series_for(2).unwrap();

        assert_eq!(series.value(&PeriodKey::Year(2024)), Some(3.0));
        assert_eq!(series.total, Some(3.0));
    }

    #[test]
    fn test_average_total_is_mean_of_period_means() {
        let entries = vec![
            entry(2, 2, month(2024, 1), Some(1.0), None),
            entry(2, 3, month(2024, 1), Some(2.0), None),
            entry(2, 2, month(2024, 2), Some(4.0), None),
        ];
        let agg = aggregate(&catalog(), &tree(), &entries, &EntryFilter::all(), Period::Month);
        let series = agg.series_for(2).unwrap();

        // Jan mean 1.5, Feb 4.0 → (1.5 + 4.0) / 2 = 2.75 → 2.8
        assert_eq!(series.trend, vec![1.5, 4.0]);
        assert_eq!(series.total, Some(2.8));
    }

    #[test]
    fn test_null_only_bucket_is_omitted() {
        let entries = vec![
            entry(1, 2, month(2024, 1), Some(3.0), None),
            entry(1, 2, month(2024, 2), None, None),
            entry(1, 2, month(2024, 3), Some(4.0), None),
        ];
        let agg = aggregate(&catalog(), &tree(), &entries, &EntryFilter::all(), Period::Month);
        let series = agg.series_for(1).unwrap();

        assert_eq!(series.periods().len(), 2);
        assert_eq!(series.value(&PeriodKey::Month { year: 2024, month: 2 }), None);
        assert_eq!(series.trend, vec![3.0, 7.0]);

        // The report still has a February column
        assert_eq!(agg.periods.len(), 3);
    }

    #[test]
    fn test_sum_total_matches_displayed_values() {
        let entries: Vec<KpiEntry> = (1..=12)
            .map(|m| entry(1, 2, month(2023, m), Some(m as f64 * 1.5), None))
            .collect();
        let agg = aggregate(&catalog(), &tree(), &entries, &EntryFilter::all(), Period::Quarter);
        let series = agg.series_for(1).unwrap();

        let displayed: f64 = series.values.values().sum();
        assert_eq!(series.total, Some(displayed));
        assert_eq!(series.values.len(), 4);
    }

    #[test]
    fn test_aggregation_serializes_to_json() {
        let entries = vec![
            entry(1, 2, month(2024, 1), Some(10.0), None),
            entry(1, 2, month(2024, 2), Some(5.0), None),
        ];
        let agg = aggregate(&catalog(), &tree(), &entries, &EntryFilter::all(), Period::Month);

        let json = serde_json::to_value(&agg).unwrap();
        assert_eq!(json["period"], "month");
        assert_eq!(
            json["series"][0]["values"],
            serde_json::json!([
                {"period": {"month": {"year": 2024, "month": 1}}, "value": 10.0},
                {"period": {"month": {"year": 2024, "month": 2}}, "value": 5.0}
            ])
        );
    }

    #[test]
    fn test_distinct_periods_sorted_unique() {
        let entries = vec![
            entry(1, 2, month(2024, 3), Some(1.0), None),
            entry(1, 3, month(2023, 11), Some(1.0), None),
            entry(2, 2, month(2024, 3), Some(1.0), None),
            entry(1, 2, month(2024, 1), None, None),
        ];
        let periods = distinct_periods(&entries, Period::Month);
        assert_eq!(
            periods,
            vec![
                PeriodKey::Month { year: 2023, month: 11 },
                PeriodKey::Month { year: 2024, month: 1 },
                PeriodKey::Month { year: 2024, month: 3 },
            ]
        );
        assert!(periods.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(available_years(&entries), vec![2023, 2024]);
    }

    #[test]
    fn test_kpi_without_entries_is_omitted() {
        let entries = vec![entry(1, 2, month(2024, 1), Some(1.0), None)];
        let agg = aggregate(&catalog(), &tree(), &entries, &EntryFilter::all(), Period::Month);
        assert!(agg.series_for(4).is_none());
        assert_eq!(agg.series.len(), 1);
    }

    #[test]
    fn test_text_notes_single_unit() {
        let entries = vec![
            entry(3, 2, month(2024, 1), None, Some("New detector")),
            entry(3, 2, month(2024, 2), None, Some("  ")),
            entry(3, 2, month(2024, 3), None, Some("Record uptime")),
        ];
        let agg = aggregate(&catalog(), &tree(), &entries, &EntryFilter::all(), Period::Month);
        let series = agg.series_for(3).unwrap();

        assert!(series.values.is_empty());
        assert_eq!(series.total, None);
        assert_eq!(
            series.notes,
            vec![
                Note { label: "March".into(), text: "Record uptime".into() },
                Note { label: "January".into(), text: "New detector".into() },
            ]
        );
    }

    #[test]
    fn test_text_notes_label_units_when_several() {
        let entries = vec![
            entry(3, 3, month(2024, 1), None, Some("HXMA note")),
            entry(3, 2, month(2024, 1), None, Some("CMCF note")),
        ];
        let agg = aggregate(&catalog(), &tree(), &entries, &EntryFilter::all(), Period::Month);
        let labels: Vec<String> = agg.series_for(3).unwrap().notes.iter().map(|n| n.label.clone()).collect();
        assert_eq!(labels, vec!["CMCF January", "HXMA January"]);
    }

    #[test]
    fn test_filter_by_unit_scope_year_and_quarter() {
        let tree = tree();
        let entries = vec![
            entry(1, 2, month(2024, 1), Some(1.0), None),
            entry(1, 3, month(2024, 5), Some(2.0), None),
            entry(1, 2, month(2023, 5), Some(4.0), None),
        ];

        let department = EntryFilter::for_unit(&tree, 1);
        assert_eq!(department.apply(&entries).len(), 3);

        let beamline = EntryFilter::for_unit(&tree, 2).with_year(2024);
        assert_eq!(beamline.apply(&entries).len(), 1);

        let q2 = EntryFilter::all().with_year(2024).with_quarter(2);
        let hits = q2.apply(&entries);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].unit, 3);
    }

    #[test]
    fn test_round1() {
        assert_eq!(round1(2.25), 2.3);
        assert_eq!(round1(3.0), 3.0);
        assert_eq!(round1(-1.25), -1.3);
    }
}
