use crate::{
    api::{ApiError, ClusterApi},
    namespace::namespace_for_project,
    objects::{self, Object},
};
use futures::prelude::*;
use kubeserver_core::RoleAssignments;
use tracing::{debug, info, warn};

pub const DEFAULT_WORKERS: usize = 4;

/// Reconciles a user's role assignments into namespaces and bindings.
#[derive(Clone, Debug)]
pub struct Reconciler {
    workers: usize,
    limit_range_enabled: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to ensure {object}: {source}")]
pub struct EnsureError {
    pub object: String,
    #[source]
    pub source: ApiError,
}

/// The failures from one reconciliation.
#[derive(Debug, thiserror::Error)]
#[error("failed to reconcile RBAC for user {user}: {}", display_failures(.failures))]
pub struct ReconcileError {
    pub user: String,
    pub failures: Vec<EnsureError>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ensured {
    Created,
    Existing,
}

/// Creates `obj` unless it exists.
pub async fn ensure(api: &dyn ClusterApi, obj: Object) -> Result<Ensured, EnsureError> {
    let result = match api.get(&obj).await {
        Ok(()) => Ok(Ensured::Existing),
        Err(ApiError::NotFound) => match api.create(&obj).await {
            Ok(()) => Ok(Ensured::Created),
            Err(ApiError::AlreadyExists) => Ok(Ensured::Existing),
            Err(error) => Err(error),
        },
        Err(error) => Err(error),
    };
    match result {
        Ok(Ensured::Created) => {
            info!(%obj, "Created");
            Ok(Ensured::Created)
        }
        Ok(ensured) => Ok(ensured),
        Err(source) => Err(EnsureError {
            object: obj.to_string(),
            source,
        }),
    }
}

// === impl Reconciler ===

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, false)
    }
}

impl Reconciler {
    pub fn new(workers: usize, limit_range_enabled: bool) -> Self {
        Self {
            workers: workers.max(1),
            limit_range_enabled,
        }
    }

    /// Ensures the user's project namespaces and bindings exist.
    ///
    /// Every namespace is attempted even if others fail; failures are returned together.
    pub async fn reconcile(
        &self,
        api: &dyn ClusterApi,
        user_name: &str,
        user_id: &str,
        assignments: &RoleAssignments,
    ) -> Result<(), ReconcileError> {
        let mine = assignments.for_user(user_id);
        let namespaces = mine
            .projects()
            .into_iter()
            .filter_map(|project| match namespace_for_project(&project) {
                Ok(ns) => Some(ns),
                Err(error) => {
                    warn!(%error, user = %user_name, "Skipping project");
                    None
                }
            })
            .collect::<Vec<_>>();
        debug!(user = %user_name, ?namespaces, "Reconciling");

        let mut failures = stream::iter(namespaces)
            .map(|ns| self.reconcile_namespace(api, ns, user_name, user_id))
            .buffer_unordered(self.workers)
            .filter_map(|res| future::ready(res.err()))
            .collect::<Vec<_>>()
            .await;

        if mine.is_admin_user(user_id) {
            let crb = objects::admin_cluster_role_binding(user_name, user_id);
            if let Err(error) = ensure(api, crb).await {
                failures.push(error);
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        Err(ReconcileError {
            user: user_name.to_string(),
            failures,
        })
    }

    async fn reconcile_namespace(
        &self,
        api: &dyn ClusterApi,
        ns: String,
        user_name: &str,
        user_id: &str,
    ) -> Result<(), EnsureError> {
        ensure(api, objects::namespace(&ns)).await?;
        if self.limit_range_enabled {
            ensure(api, objects::limit_range(&ns)).await?;
        }
        ensure(api, objects::user_role_binding(&ns, user_name, user_id)).await?;
        Ok(())
    }
}

fn display_failures(failures: &[EnsureError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
