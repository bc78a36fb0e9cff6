//! Keeps in-cluster RBAC in line with a user's external role assignments.
//!
//! Each project the user belongs to maps to a namespace in which the user is bound to the `admin`
//! cluster role. Administrators of the system project are additionally bound to `cluster-admin`.
//! Objects are only ever created; existing objects are left as they are.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod api;
mod namespace;
mod objects;
mod reconcile;

#[cfg(test)]
mod tests;

pub use self::{
    api::{ApiError, ClusterApi, KubeApi},
    namespace::{namespace_for_project, InvalidName},
    objects::{
        admin_cluster_role_binding, admin_cluster_role_binding_name, limit_range, namespace,
        user_role_binding, user_role_binding_name, Object, LIMIT_RANGE_NAME,
    },
    reconcile::{ensure, EnsureError, Ensured, ReconcileError, Reconciler, DEFAULT_WORKERS},
};
