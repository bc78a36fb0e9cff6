use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
};

/// The distinguished project whose administrators are elevated to cluster administrators.
pub const SYSTEM_PROJECT: &str = "system";

/// Roles in the system project that confer cluster-wide administration.
pub const ADMIN_ROLES: [&str; 2] = ["admin", "system"];

pub const EXTRA_ROLES: &str = "identity/roles";
pub const EXTRA_PROJECT_ID: &str = "identity/project/id";
pub const EXTRA_PROJECT_NAME: &str = "identity/project/name";

/// Links a user to a role in a project.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    pub user_id: String,
    pub user_name: String,
    pub project_id: String,
    pub project_name: String,
    pub role: String,
    pub domain: String,
}

/// A snapshot of role assignments.
///
/// Tuples without a user id or role name are dropped on construction, as are duplicates. The
/// snapshot is cheap to clone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleAssignments(Arc<[RoleAssignment]>);

/// The identity a token resolves to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub user_name: String,
    pub domain: String,

    /// The project the token is scoped to.
    pub project_id: String,
    pub project_name: String,

    /// Roles held in the scoped project.
    pub roles: Vec<String>,
}

/// An authenticated Kubernetes user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserInfo {
    pub name: String,
    pub uid: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("token is invalid or expired")]
    InvalidToken,

    #[error("identity service request failed: {0}")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("unexpected identity service response: {0}")]
    Response(String),
}

/// The external identity service.
#[async_trait::async_trait]
pub trait IdentityService: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Credential, IdentityError>;

    async fn list_role_assignments(&self) -> Result<Vec<RoleAssignment>, IdentityError>;
}

// === impl IdentityError ===

impl IdentityError {
    /// Indicates whether the identity service failed, as opposed to rejecting the token.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, Self::InvalidToken)
    }
}

// === impl RoleAssignment ===

impl RoleAssignment {
    fn is_valid(&self) -> bool {
        !self.user_id.is_empty() && !self.role.is_empty()
    }

    fn is_user(&self, ident: &str) -> bool {
        self.user_id == ident || self.user_name == ident
    }
}

// === impl RoleAssignments ===

impl RoleAssignments {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RoleAssignment> {
        self.0.iter()
    }

    /// Returns the assignments held by the given user id.
    pub fn for_user(&self, user_id: &str) -> Self {
        self.iter()
            .filter(|ra| ra.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Returns the names of all projects in the snapshot.
    pub fn projects(&self) -> BTreeSet<String> {
        self.iter().map(|ra| ra.project_name.clone()).collect()
    }

    /// Returns the distinct project ids in the snapshot, in order of first appearance.
    pub fn project_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.iter()
            .filter(|ra| seen.insert(ra.project_id.as_str()))
            .map(|ra| ra.project_id.clone())
            .collect()
    }

    /// Returns the distinct roles held in the named project.
    pub fn roles_in_project(&self, project: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.iter()
            .filter(|ra| ra.project_name == project && seen.insert(ra.role.as_str()))
            .map(|ra| ra.role.clone())
            .collect()
    }

    /// Indicates whether the user, identified by name or id, holds an admin role in the system
    /// project.
    pub fn is_admin_user(&self, user_ident: &str) -> bool {
        self.iter().any(|ra| {
            ra.is_user(user_ident)
                && ra.project_name == SYSTEM_PROJECT
                && ADMIN_ROLES.contains(&ra.role.as_str())
        })
    }

    /// Returns the domain of the first assignment held by the user, identified by name or id.
    pub fn user_domain(&self, user_ident: &str) -> String {
        self.iter()
            .find(|ra| ra.is_user(user_ident))
            .map(|ra| ra.domain.clone())
            .unwrap_or_default()
    }
}

impl FromIterator<RoleAssignment> for RoleAssignments {
    fn from_iter<T: IntoIterator<Item = RoleAssignment>>(iter: T) -> Self {
        let mut seen = HashSet::new();
        let assignments = iter
            .into_iter()
            .filter(|ra| ra.is_valid() && seen.insert(ra.clone()))
            .collect::<Vec<_>>();
        Self(assignments.into())
    }
}

impl From<Vec<RoleAssignment>> for RoleAssignments {
    fn from(assignments: Vec<RoleAssignment>) -> Self {
        assignments.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a RoleAssignments {
    type Item = &'a RoleAssignment;
    type IntoIter = std::slice::Iter<'a, RoleAssignment>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// === impl UserInfo ===

impl UserInfo {
    /// Builds the Kubernetes identity for a verified credential.
    ///
    /// The user's groups hold the project the token is scoped to; the extra attributes carry the
    /// token's roles and every project the user belongs to in `assignments`.
    pub fn from_credential(cred: &Credential, assignments: &RoleAssignments) -> Self {
        let mine = assignments.for_user(&cred.user_id);
        let mut extra = BTreeMap::new();
        extra.insert(EXTRA_ROLES.to_string(), cred.roles.clone());
        extra.insert(EXTRA_PROJECT_ID.to_string(), mine.project_ids());
        extra.insert(
            EXTRA_PROJECT_NAME.to_string(),
            mine.projects().into_iter().collect(),
        );

        let groups = if cred.project_name.is_empty() {
            vec![]
        } else {
            vec![cred.project_name.clone()]
        };

        Self {
            name: cred.user_name.clone(),
            uid: cred.user_id.clone(),
            groups,
            extra,
        }
    }
}
