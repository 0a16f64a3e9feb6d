// 🏢 Unit Entity - organizational tree (facility → department → beamline)
//
// Units form a forest through `parent`. The tree is held as an explicit
// adjacency list: the children index is built once and every
// ancestor/descendant query is a plain walk over it.

use crate::error::KpiError;
use crate::roles::Role;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

pub type UnitId = i64;

// ============================================================================
// UNIT KIND
// ============================================================================

/// Kind of unit (Beamline, Department, Division, ...)
///
/// Non-reporting kinds aggregate their descendants instead of
/// submitting entries of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitKind {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub reporter: bool,
}

impl UnitKind {
    pub fn new(id: i64, name: &str, reporter: bool) -> Self {
        UnitKind {
            id,
            name: name.to_string(),
            description: String::new(),
            reporter,
        }
    }

    pub fn is_beamline(&self) -> bool {
        self.name.eq_ignore_ascii_case("beamline")
    }
}

// ============================================================================
// UNIT ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub name: String,
    pub acronym: String,

    /// None = kind not assigned yet (treated as reporting)
    pub kind: Option<UnitKind>,

    /// Parent unit (None for roots)
    pub parent: Option<UnitId>,

    /// Facility acronyms used by the scheduling/publication service,
    /// comma separated. Empty means "same as `acronym`".
    #[serde(default)]
    pub acronyms: Option<String>,

    /// Role strings that own this unit (e.g. "beamline-admin:cmcf")
    #[serde(default)]
    pub admin_roles: Vec<String>,
}

impl Unit {
    pub fn new(id: UnitId, acronym: &str, name: &str, kind: Option<UnitKind>, parent: Option<UnitId>) -> Self {
        Unit {
            id,
            name: name.to_string(),
            acronym: acronym.to_string(),
            kind,
            parent,
            acronyms: None,
            admin_roles: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Does this unit submit its own entries?
    pub fn reporter(&self) -> bool {
        self.kind.as_ref().map_or(true, |k| k.reporter)
    }

    /// Acronyms to query on the facility service
    pub fn beamline_acronyms(&self) -> Vec<String> {
        let listed: Vec<String> = self
            .acronyms
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        if listed.is_empty() {
            vec![self.acronym.clone()]
        } else {
            listed
        }
    }

    /// Owner roles: explicit `admin_roles` when set, otherwise the
    /// defaults derived from the acronym (beamline units only).
    pub fn owner_roles(&self) -> Vec<Role> {
        if !self.admin_roles.is_empty() {
            return self
                .admin_roles
                .iter()
                .filter_map(|r| Role::parse(r).ok())
                .collect();
        }

        match &self.kind {
            Some(kind) if kind.is_beamline() => default_admin_roles(&self.acronym)
                .iter()
                .filter_map(|r| Role::parse(r).ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Default owner role strings for a beamline
pub fn default_admin_roles(acronym: &str) -> Vec<String> {
    ["beamline-admin", "beamline-responsible", "beamline-staff"]
        .iter()
        .map(|r| format!("{}:{}", r, acronym.to_lowercase()))
        .collect()
}

/// Nested `{name, id, children}` view of a subtree
#[derive(Debug, Serialize)]
pub struct Dendrogram {
    pub name: String,
    pub id: UnitId,
    pub children: Vec<Dendrogram>,
}

impl Drop for Dendrogram {
    // Flatten before dropping so deep chains don't recurse
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

// ============================================================================
// UNIT TREE
// ============================================================================

/// Validated forest of units with a prebuilt children index
#[derive(Debug, Clone, Default)]
pub struct UnitTree {
    units: BTreeMap<UnitId, Unit>,
    children: HashMap<UnitId, Vec<UnitId>>,
}

impl UnitTree {
    /// Build the tree, rejecting dangling parents and cycles
    pub fn new(units: Vec<Unit>) -> Result<Self, KpiError> {
        let units: BTreeMap<UnitId, Unit> = units.into_iter().map(|u| (u.id, u)).collect();

        let mut children: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
        for unit in units.values() {
            if let Some(parent) = unit.parent {
                if !units.contains_key(&parent) {
                    return Err(KpiError::MissingParent {
                        unit: unit.id,
                        parent,
                    });
                }
                children.entry(parent).or_default().push(unit.id);
            }
        }

        // BTreeMap iteration keeps children sorted by id already

        let tree = UnitTree { units, children };
        tree.check_acyclic()?;
        Ok(tree)
    }

    fn check_acyclic(&self) -> Result<(), KpiError> {
        // Units whose parent chain is known to end at a root
        let mut settled: HashSet<UnitId> = HashSet::with_capacity(self.units.len());

        for unit in self.units.values() {
            let mut path = HashSet::new();
            let mut current = Some(unit.id);
            while let Some(id) = current {
                if settled.contains(&id) {
                    break;
                }
                if !path.insert(id) {
                    return Err(KpiError::Cycle(unit.id));
                }
                current = self.units.get(&id).and_then(|u| u.parent);
            }
            settled.extend(path);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn require(&self, id: UnitId) -> Result<&Unit, KpiError> {
        self.get(id).ok_or_else(|| KpiError::UnknownUnit(id.to_string()))
    }

    /// Like `require`, but only for units that submit their own entries
    pub fn require_reporter(&self, id: UnitId) -> Result<&Unit, KpiError> {
        let unit = self.require(id)?;
        if !unit.reporter() {
            return Err(KpiError::NotReporting(unit.acronym.clone()));
        }
        Ok(unit)
    }

    /// Find unit by acronym (case-insensitive)
    pub fn find_by_acronym(&self, acronym: &str) -> Option<&Unit> {
        self.units
            .values()
            .find(|u| u.acronym.eq_ignore_ascii_case(acronym))
    }

    pub fn all(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn roots(&self) -> Vec<&Unit> {
        self.units.values().filter(|u| u.is_root()).collect()
    }

    pub fn children(&self, id: UnitId) -> Vec<&Unit> {
        self.children
            .get(&id)
            .map(|ids| ids.iter().filter_map(|c| self.units.get(c)).collect())
            .unwrap_or_default()
    }

    pub fn parent(&self, id: UnitId) -> Option<&Unit> {
        self.get(id)
            .and_then(|u| u.parent)
            .and_then(|p| self.units.get(&p))
    }

    /// Ancestors, nearest first (parent, grandparent, ...)
    pub fn ancestors(&self, id: UnitId) -> Vec<&Unit> {
        let mut ancestors = Vec::new();
        let mut current = self.parent(id);
        while let Some(unit) = current {
            ancestors.push(unit);
            current = self.parent(unit.id);
        }
        ancestors
    }

    /// All descendants in breadth-first order (excludes the unit itself)
    pub fn descendants(&self, id: UnitId) -> Vec<&Unit> {
        let mut descendants = Vec::new();
        let mut queue: VecDeque<UnitId> = self.children.get(&id).cloned().unwrap_or_default().into();

        while let Some(next) = queue.pop_front() {
            if let Some(unit) = self.units.get(&next) {
                descendants.push(unit);
            }
            if let Some(grandchildren) = self.children.get(&next) {
                queue.extend(grandchildren.iter().copied());
            }
        }

        descendants
    }

    /// True if `ancestor_id` is `descendant_id` or one of its ancestors
    pub fn is_ancestor(&self, ancestor_id: UnitId, descendant_id: UnitId) -> bool {
        ancestor_id == descendant_id
            || self
                .ancestors(descendant_id)
                .iter()
                .any(|u| u.id == ancestor_id)
    }

    pub fn depth(&self, id: UnitId) -> usize {
        self.ancestors(id).len()
    }

    /// Acronym path root → ... → unit
    pub fn path(&self, id: UnitId) -> Vec<String> {
        let mut path: Vec<String> = self
            .ancestors(id)
            .iter()
            .rev()
            .map(|u| u.acronym.clone())
            .collect();
        if let Some(unit) = self.get(id) {
            path.push(unit.acronym.clone());
        }
        path
    }

    /// Reporting descendants of a unit
    pub fn reporting_subunits(&self, id: UnitId) -> Vec<&Unit> {
        self.descendants(id)
            .into_iter()
            .filter(|u| u.reporter())
            .collect()
    }

    /// Units whose entries make up this unit's report: itself when it
    /// reports, plus every reporting descendant.
    pub fn reporting_scope(&self, id: UnitId) -> Vec<UnitId> {
        let mut scope = Vec::new();
        if let Some(unit) = self.get(id) {
            if unit.reporter() {
                scope.push(unit.id);
            }
        }
        scope.extend(self.reporting_subunits(id).iter().map(|u| u.id));
        scope
    }

    /// Owner roles of the unit and all its ancestors
    pub fn inherited_owner_roles(&self, id: UnitId) -> Vec<Role> {
        let mut roles: Vec<Role> = self.get(id).map(|u| u.owner_roles()).unwrap_or_default();
        for ancestor in self.ancestors(id) {
            roles.extend(ancestor.owner_roles());
        }
        roles
    }

    /// Subtree in depth-first pre-order with each unit's depth below `id`
    pub fn preorder(&self, id: UnitId) -> Vec<(&Unit, usize)> {
        let mut out = Vec::new();
        let mut stack = vec![(id, 0)];
        while let Some((current, depth)) = stack.pop() {
            let Some(unit) = self.units.get(&current) else {
                continue;
            };
            out.push((unit, depth));
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().rev().map(|&c| (c, depth + 1)));
            }
        }
        out
    }

    pub fn dendrogram(&self, id: UnitId) -> Option<Dendrogram> {
        let root = self.get(id)?;

        // Breadth-first order reversed puts every child before its parent
        let order: Vec<&Unit> = std::iter::once(root).chain(self.descendants(id)).collect();
        let mut built: HashMap<UnitId, Dendrogram> = HashMap::with_capacity(order.len());
        for unit in order.into_iter().rev() {
            let children = self
                .children
                .get(&unit.id)
                .map(|ids| ids.iter().filter_map(|c| built.remove(c)).collect())
                .unwrap_or_default();
            built.insert(
                unit.id,
                Dendrogram {
                    name: unit.acronym.clone(),
                    id: unit.id,
                    children,
                },
            );
        }
        built.remove(&id)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn facility() -> UnitTree {
        let division = UnitKind::new(1, "Division", false);
        let department = UnitKind::new(2, "Department", false);
        let beamline = UnitKind::new(3, "Beamline", true);

        let mut cmcf = Unit::new(4, "CMCF-BM", "Macromolecular BM", Some(beamline.clone()), Some(2));
        cmcf.acronyms = Some("08B1-1, 08B1-2".to_string());

        UnitTree::new(vec![
            Unit::new(1, "CLS", "Canadian Light Source", Some(division), None),
            Unit::new(2, "SCI", "Science Department", Some(department.clone()), Some(1)),
            Unit::new(3, "OPS", "Operations", Some(department), Some(1)),
            cmcf,
            Unit::new(5, "CMCF-ID", "Macromolecular ID", Some(beamline.clone()), Some(2)),
            Unit::new(6, "HXMA", "Hard X-ray", Some(beamline), Some(3)),
        ])
        .unwrap()
    }

    #[test]
    fn test_descendants_breadth_first() {
        let tree = facility();
        let ids: Vec<UnitId> = tree.descendants(1).iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);

        assert!(tree.descendants(6).is_empty());
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let tree = facility();
        let ids: Vec<UnitId> = tree.ancestors(5).iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(tree.depth(5), 2);
        assert_eq!(tree.path(5), vec!["CLS", "SCI", "CMCF-ID"]);
    }

    #[test]
    fn test_is_ancestor() {
        let tree = facility();
        assert!(tree.is_ancestor(1, 6));
        assert!(tree.is_ancestor(6, 6));
        assert!(!tree.is_ancestor(2, 6));
        assert!(!tree.is_ancestor(6, 1));
    }

    #[test]
    fn test_reporting_scope_of_non_reporting_parent() {
        let tree = facility();
        // SCI does not report: only its two beamlines
        assert_eq!(tree.reporting_scope(2), vec![4, 5]);
        // A beamline reports for itself
        assert_eq!(tree.reporting_scope(6), vec![6]);
        assert_eq!(tree.reporting_scope(1), vec![4, 5, 6]);
    }

    #[test]
    fn test_require_reporter() {
        let tree = facility();
        assert_eq!(tree.require_reporter(6).unwrap().acronym, "HXMA");
        assert_eq!(tree.require_reporter(2).unwrap_err(), KpiError::NotReporting("SCI".to_string()));
        assert_eq!(tree.require_reporter(99).unwrap_err(), KpiError::UnknownUnit("99".to_string()));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let result = UnitTree::new(vec![Unit::new(1, "A", "A", None, Some(99))]);
        assert_eq!(result.unwrap_err(), KpiError::MissingParent { unit: 1, parent: 99 });
    }

    #[test]
    fn test_cycle_rejected() {
        let result = UnitTree::new(vec![
            Unit::new(1, "A", "A", None, Some(2)),
            Unit::new(2, "B", "B", None, Some(1)),
        ]);
        assert!(matches!(result, Err(KpiError::Cycle(_))));
    }

    #[test]
    fn test_deep_tree() {
        let units: Vec<Unit> = (1..=500)
            .map(|i| Unit::new(i, &format!("U{}", i), "deep", None, if i == 1 { None } else { Some(i - 1) }))
            .collect();
        let tree = UnitTree::new(units).unwrap();

        assert_eq!(tree.descendants(1).len(), 499);
        assert_eq!(tree.ancestors(500).len(), 499);
    }

    fn chain(n: i64) -> UnitTree {
        let units: Vec<Unit> = (1..=n)
            .map(|i| Unit::new(i, &format!("U{}", i), "chain", None, if i == 1 { None } else { Some(i - 1) }))
            .collect();
        UnitTree::new(units).unwrap()
    }

    #[test]
    fn test_long_chain_builds_and_walks() {
        let tree = chain(100_000);
        assert_eq!(tree.len(), 100_000);
        assert_eq!(tree.descendants(1).len(), 99_999);
        assert_eq!(tree.ancestors(100_000).len(), 99_999);

        let walk = tree.preorder(1);
        assert_eq!(walk.len(), 100_000);
        assert_eq!(walk.last().map(|(u, depth)| (u.id, *depth)), Some((100_000, 99_999)));
    }

    #[test]
    fn test_long_chain_dendrogram() {
        let tree = chain(100_000);
        let dendrogram = tree.dendrogram(1).unwrap();

        let mut depth = 0;
        let mut node = &dendrogram;
        while let Some(child) = node.children.first() {
            assert_eq!(node.children.len(), 1);
            node = child;
            depth += 1;
        }
        assert_eq!(depth, 99_999);
        assert_eq!(node.name, "U100000");
    }

    #[test]
    fn test_cycle_below_valid_prefix_rejected() {
        let mut units: Vec<Unit> = (1..=1_000)
            .map(|i| Unit::new(i, &format!("U{}", i), "chain", None, if i == 1 { None } else { Some(i - 1) }))
            .collect();
        units.push(Unit::new(1_001, "X", "X", None, Some(1_002)));
        units.push(Unit::new(1_002, "Y", "Y", None, Some(1_001)));
        assert!(matches!(UnitTree::new(units), Err(KpiError::Cycle(_))));
    }

    #[test]
    fn test_preorder_depths() {
        let tree = facility();
        let walk: Vec<(UnitId, usize)> = tree.preorder(1).iter().map(|(u, d)| (u.id, *d)).collect();
        assert_eq!(walk, vec![(1, 0), (2, 1), (4, 2), (5, 2), (3, 1), (6, 2)]);
    }

    #[test]
    fn test_beamline_acronyms() {
        let tree = facility();
        assert_eq!(tree.get(4).unwrap().beamline_acronyms(), vec!["08B1-1", "08B1-2"]);
        assert_eq!(tree.get(5).unwrap().beamline_acronyms(), vec!["CMCF-ID"]);
    }

    #[test]
    fn test_default_owner_roles_for_beamlines() {
        let tree = facility();
        let roles: Vec<String> = tree.get(6).unwrap().owner_roles().iter().map(|r| r.to_string()).collect();
        assert_eq!(
            roles,
            vec!["beamline-admin:hxma", "beamline-responsible:hxma", "beamline-staff:hxma"]
        );

        // Departments carry no implicit roles
        assert!(tree.get(2).unwrap().owner_roles().is_empty());
    }

    #[test]
    fn test_dendrogram() {
        let tree = facility();
        let dendrogram = tree.dendrogram(3).unwrap();
        assert_eq!(dendrogram.name, "OPS");
        assert_eq!(dendrogram.children.len(), 1);
        assert_eq!(dendrogram.children[0].name, "HXMA");
    }

    #[test]
    fn test_find_by_acronym_case_insensitive() {
        let tree = facility();
        assert_eq!(tree.find_by_acronym("hxma").unwrap().id, 6);
        assert!(tree.find_by_acronym("nope").is_none());
    }
}
