//! Domain types shared by the kubeserver crates.
//!
//! The server reaches worker clusters through agent-initiated tunnels, proxies Kubernetes API
//! requests to them, and keeps in-cluster RBAC in line with the role assignments held by an external
//! identity service. This crate holds the records those pieces exchange and the traits through which
//! they reach the external collaborators:
//!
//! - [`IdentityService`] verifies tokens and lists role assignments.
//! - [`ClusterStore`] resolves cluster records by id or name.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod identity;

pub use self::{
    cluster::{Cluster, ClusterStore},
    identity::{
        Credential, IdentityError, IdentityService, RoleAssignment, RoleAssignments, UserInfo,
        ADMIN_ROLES, EXTRA_PROJECT_ID, EXTRA_PROJECT_NAME, EXTRA_ROLES, SYSTEM_PROJECT,
    },
};
