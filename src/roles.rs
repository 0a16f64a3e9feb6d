// 🔐 Roles - typed role membership instead of substring matching
//
// Role strings look like "beamline-admin:cmcf" (kind + scope) or
// "employee" (kind only). They are parsed once into `Role` values and
// access checks are plain set membership.

use crate::entities::unit::{UnitId, UnitTree};
use crate::error::KpiError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    BeamlineAdmin,
    BeamlineResponsible,
    BeamlineStaff,
    Employee,
    /// Any role code the facility directory hands out that we don't model
    Other(String),
}

impl RoleKind {
    pub fn as_str(&self) -> &str {
        match self {
            RoleKind::BeamlineAdmin => "beamline-admin",
            RoleKind::BeamlineResponsible => "beamline-responsible",
            RoleKind::BeamlineStaff => "beamline-staff",
            RoleKind::Employee => "employee",
            RoleKind::Other(code) => code,
        }
    }

    fn from_code(code: &str) -> Self {
        match code {
            "beamline-admin" => RoleKind::BeamlineAdmin,
            "beamline-responsible" => RoleKind::BeamlineResponsible,
            "beamline-staff" => RoleKind::BeamlineStaff,
            "employee" => RoleKind::Employee,
            other => RoleKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role {
    pub kind: RoleKind,
    pub scope: Option<String>,
}

impl Role {
    pub fn new(kind: RoleKind, scope: Option<&str>) -> Self {
        Role {
            kind,
            scope: scope.map(|s| s.to_lowercase()),
        }
    }

    /// Parse "kind:scope" or "kind"; tolerates "<...>" wrappers
    pub fn parse(raw: &str) -> Result<Self, KpiError> {
        let cleaned = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
        if cleaned.is_empty() {
            return Err(KpiError::InvalidRole(raw.to_string()));
        }

        let (code, scope) = match cleaned.split_once(':') {
            Some((code, scope)) => (code.trim(), Some(scope.trim())),
            None => (cleaned, None),
        };

        if code.is_empty() || scope.map_or(false, str::is_empty) {
            return Err(KpiError::InvalidRole(raw.to_string()));
        }

        Ok(Role::new(RoleKind::from_code(&code.to_lowercase()), scope))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}", self.kind.as_str(), scope),
            None => write!(f, "{}", self.kind.as_str()),
        }
    }
}

/// Set of roles held by one user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleSet {
    roles: HashSet<Role>,
}

impl RoleSet {
    /// Parse a comma separated role list; malformed items are dropped
    pub fn parse(raw: &str) -> Self {
        let roles = raw
            .split(',')
            .filter(|item| !item.trim().is_empty())
            .filter_map(|item| match Role::parse(item) {
                Ok(role) => Some(role),
                Err(e) => {
                    tracing::debug!("ignoring role: {}", e);
                    None
                }
            })
            .collect();
        RoleSet { roles }
    }

    pub fn from_roles(roles: impl IntoIterator<Item = Role>) -> Self {
        RoleSet {
            roles: roles.into_iter().collect(),
        }
    }

    pub fn contains(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }

    pub fn contains_any<'a>(&self, roles: impl IntoIterator<Item = &'a Role>) -> bool {
        roles.into_iter().any(|r| self.roles.contains(r))
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// A signed-in user as far as access checks are concerned
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub username: String,
    pub superuser: bool,
    pub roles: RoleSet,
}

impl Principal {
    pub fn new(username: &str, roles: &str) -> Self {
        Principal {
            username: username.to_string(),
            superuser: false,
            roles: RoleSet::parse(roles),
        }
    }
}

/// Site-wide admin configuration
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    pub admin_users: HashSet<String>,
    pub admin_roles: Vec<Role>,
}

impl AccessPolicy {
    pub fn new(admin_users: &[String], admin_roles: &[String]) -> Self {
        AccessPolicy {
            admin_users: admin_users.iter().cloned().collect(),
            admin_roles: admin_roles
                .iter()
                .filter_map(|r| Role::parse(r).ok())
                .collect(),
        }
    }

    pub fn is_admin(&self, who: &Principal) -> bool {
        who.superuser
            || self.admin_users.contains(&who.username)
            || who.roles.contains_any(&self.admin_roles)
    }

    /// Owner of a unit: holds an owner role of the unit or of any
    /// ancestor, or is an admin.
    pub fn is_owner(&self, who: &Principal, tree: &UnitTree, unit: UnitId) -> bool {
        self.is_admin(who) || who.roles.contains_any(&tree.inherited_owner_roles(unit))
    }

    /// Employee: holds the employee role or owns any unit
    pub fn is_employee(&self, who: &Principal, tree: &UnitTree) -> bool {
        who.roles.contains(&Role::new(RoleKind::Employee, None))
            || self.is_admin(who)
            || tree
                .all()
                .any(|u| who.roles.contains_any(&u.owner_roles()))
    }

    pub fn can_edit_entry(&self, who: &Principal, tree: &UnitTree, unit: UnitId) -> bool {
        self.is_owner(who, tree, unit)
    }
}
