// 📊 KPI Catalog - indicator definitions, categories and families
//
// Categories order the report (priority), KPIs are ordered by priority
// within their category, and KPIs assigned to a unit are inherited by
// every unit below it.

use crate::entities::unit::{UnitId, UnitTree};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub type KpiId = i64;
pub type CategoryId = i64;

// ============================================================================
// KPI KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KpiKind {
    Average,
    Sum,
    Text,
}

impl KpiKind {
    /// Stored code (matches the historical numbering)
    pub fn code(&self) -> i64 {
        match self {
            KpiKind::Average => 0,
            KpiKind::Sum => 1,
            KpiKind::Text => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(KpiKind::Average),
            1 => Some(KpiKind::Sum),
            2 => Some(KpiKind::Text),
            _ => None,
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            KpiKind::Average => "Average",
            KpiKind::Sum => "Total",
            KpiKind::Text => "Text Only",
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, KpiKind::Text)
    }
}

// ============================================================================
// CATEGORY / KPI / FAMILY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiCategory {
    pub id: CategoryId,
    pub name: String,
    /// Strategic goal text
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kpi {
    pub id: KpiId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<CategoryId>,
    pub kind: KpiKind,
    #[serde(default)]
    pub priority: i64,
    /// Units that report this KPI directly (descendants inherit it)
    #[serde(default)]
    pub units: BTreeSet<UnitId>,
}

impl Kpi {
    pub fn new(id: KpiId, name: &str, kind: KpiKind, category: Option<CategoryId>, priority: i64) -> Self {
        Kpi {
            id,
            name: name.to_string(),
            description: String::new(),
            category,
            kind,
            priority,
            units: BTreeSet::new(),
        }
    }

    pub fn with_units(mut self, units: &[UnitId]) -> Self {
        self.units.extend(units.iter().copied());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FamilyKind {
    Related,
    Cumulative,
}

impl FamilyKind {
    pub fn code(&self) -> i64 {
        match self {
            FamilyKind::Related => 0,
            FamilyKind::Cumulative => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(FamilyKind::Related),
            1 => Some(FamilyKind::Cumulative),
            _ => None,
        }
    }
}

/// Named group of KPIs rendered as one combined chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiFamily {
    pub id: i64,
    pub name: String,
    pub kind: FamilyKind,
    pub kpis: Vec<KpiId>,
}

// ============================================================================
// CATALOG
// ============================================================================

/// All reference data the report builder needs about indicators
#[derive(Debug, Clone, Default)]
pub struct KpiCatalog {
    categories: Vec<KpiCategory>,
    kpis: Vec<Kpi>,
    families: Vec<KpiFamily>,
    kpi_index: HashMap<KpiId, usize>,
    category_index: HashMap<CategoryId, usize>,
}

impl KpiCatalog {
    pub fn new(mut categories: Vec<KpiCategory>, kpis: Vec<Kpi>, families: Vec<KpiFamily>) -> Self {
        categories.sort_by_key(|c| (c.priority, c.id));
        let category_index: HashMap<CategoryId, usize> =
            categories.iter().enumerate().map(|(i, c)| (c.id, i)).collect();

        let mut kpis = kpis;
        kpis.sort_by_key(|k| {
            // Uncategorized KPIs go last
            let category_rank = k
                .category
                .and_then(|c| category_index.get(&c).copied())
                .unwrap_or(usize::MAX);
            (category_rank, k.priority, k.id)
        });
        let kpi_index = kpis.iter().enumerate().map(|(i, k)| (k.id, i)).collect();

        KpiCatalog {
            categories,
            kpis,
            families,
            kpi_index,
            category_index,
        }
    }

    /// Categories in priority order
    pub fn categories(&self) -> &[KpiCategory] {
        &self.categories
    }

    /// KPIs in report order (category priority, then KPI priority)
    pub fn kpis(&self) -> &[Kpi] {
        &self.kpis
    }

    pub fn families(&self) -> &[KpiFamily] {
        &self.families
    }

    pub fn kpi(&self, id: KpiId) -> Option<&Kpi> {
        self.kpi_index.get(&id).map(|&i| &self.kpis[i])
    }

    pub fn category(&self, id: CategoryId) -> Option<&KpiCategory> {
        self.category_index.get(&id).map(|&i| &self.categories[i])
    }

    pub fn find_kpi_by_name(&self, name: &str) -> Option<&Kpi> {
        self.kpis.iter().find(|k| k.name.eq_ignore_ascii_case(name))
    }

    /// KPIs of one category (None = uncategorized), in priority order
    pub fn kpis_in_category(&self, category: Option<CategoryId>) -> Vec<&Kpi> {
        self.kpis.iter().filter(|k| k.category == category).collect()
    }

    /// Display rank such as "2b": category position + letter in category
    pub fn priority_display(&self, kpi: &Kpi) -> String {
        let siblings = self.kpis_in_category(kpi.category);
        let position = siblings.iter().position(|k| k.id == kpi.id).unwrap_or(0);
        let letter = letter_for(position);

        match kpi.category.and_then(|c| self.category_index.get(&c)) {
            Some(rank) => format!("{}{}", rank + 1, letter),
            None => format!("-{}", letter),
        }
    }

    /// KPIs assigned to the unit or any of its ancestors
    pub fn indicators(&self, tree: &UnitTree, unit: UnitId) -> Vec<&Kpi> {
        let mut lineage: BTreeSet<UnitId> = tree.ancestors(unit).iter().map(|u| u.id).collect();
        lineage.insert(unit);

        self.kpis
            .iter()
            .filter(|k| !k.units.is_disjoint(&lineage))
            .collect()
    }

    /// Indicators the unit only gets through an ancestor
    pub fn inherited(&self, tree: &UnitTree, unit: UnitId) -> Vec<&Kpi> {
        self.indicators(tree, unit)
            .into_iter()
            .filter(|k| !k.units.contains(&unit))
            .collect()
    }

    /// Reporting units among the KPI's units and their descendants
    pub fn reporting_units(&self, tree: &UnitTree, kpi: KpiId) -> Vec<UnitId> {
        let Some(kpi) = self.kpi(kpi) else {
            return Vec::new();
        };

        let mut units = BTreeSet::new();
        for &unit in &kpi.units {
            units.extend(tree.reporting_scope(unit));
        }
        units.into_iter().collect()
    }
}

fn letter_for(position: usize) -> String {
    // a..z, then aa, ab, ...
    let mut n = position;
    let mut letters = Vec::new();
    loop {
        letters.push((b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters.iter().rev().collect()
}
