use crate::json_response;
use bytes::Bytes;
use http::{Response, StatusCode};
use kubeserver_core::{Cluster, ClusterStore, IdentityService, UserInfo};
use kubeserver_identity::RoleAssignmentCache;
use kubeserver_k8s_api::TokenReview;
use kubeserver_k8s_rbac::{ClusterApi, KubeApi, Reconciler};
use kubeserver_proxy::{error_response, ClientCache, ProxyBody};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Answers `TokenReview` webhook calls and reconciles the reviewed user's RBAC.
#[derive(Clone)]
pub struct Webhook {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<dyn IdentityService>,
    assignments: Arc<RoleAssignmentCache>,
    clusters: Arc<dyn ClusterStore>,
    apis: Arc<dyn ClusterApis>,
    reconciler: Reconciler,
}

/// Provides the Kubernetes API of a worker cluster.
#[async_trait::async_trait]
pub trait ClusterApis: Send + Sync {
    async fn api(&self, cluster: &Cluster) -> anyhow::Result<Arc<dyn ClusterApi>>;
}

// === impl Webhook ===

impl Webhook {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        assignments: Arc<RoleAssignmentCache>,
        clusters: Arc<dyn ClusterStore>,
        apis: Arc<dyn ClusterApis>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                assignments,
                clusters,
                apis,
                reconciler,
            }),
        }
    }

    /// Reviews the token in a serialized `TokenReview`.
    ///
    /// When `cluster` names a cluster, the user's bindings in that cluster are reconciled before
    /// the user is admitted.
    pub async fn review(&self, body: Bytes, cluster: Option<&str>) -> Response<ProxyBody> {
        let review: TokenReview = match serde_json::from_slice(&body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to parse request body");
                return error_response(StatusCode::BAD_REQUEST, "BadRequest", &error.to_string());
            }
        };
        if let Err(error) = review.validate() {
            warn!(%error, "Invalid token review");
            return error_response(StatusCode::BAD_REQUEST, "BadRequest", &error.to_string());
        }

        let cred = match self.inner.identity.verify(&review.spec.token).await {
            Ok(cred) => cred,
            Err(error) if error.is_unavailable() => {
                warn!(%error, "Identity service unavailable");
                return json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &review.unauthenticated(error),
                );
            }
            Err(error) => {
                info!(%error, "Token verification failed");
                return json_response(StatusCode::UNAUTHORIZED, &review.unauthenticated(error));
            }
        };

        let mut assignments = self.inner.assignments.get_role_assignments(&cred.user_id);
        if assignments.is_empty() {
            // The user may have been added since the last refresh.
            match self.inner.assignments.reset().await {
                Ok(_) => assignments = self.inner.assignments.get_role_assignments(&cred.user_id),
                Err(error) => warn!(%error, "Failed to refresh role assignments"),
            }
        }

        if let Some(id) = cluster {
            let cluster = match self
                .inner
                .clusters
                .fetch_cluster_by_id_or_name(&review.spec.token, id)
                .await
            {
                Ok(Some(cluster)) => cluster,
                Ok(None) => {
                    return error_response(
                        StatusCode::NOT_FOUND,
                        "NotFound",
                        &format!("cluster {id} not found"),
                    )
                }
                Err(error) => {
                    warn!(%error, cluster = %id, "Failed to look up cluster");
                    return json_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &review.unauthenticated(error),
                    );
                }
            };

            let reconciled = match self.inner.apis.api(&cluster).await {
                Ok(api) => self
                    .inner
                    .reconciler
                    .reconcile(&*api, &cred.user_name, &cred.user_id, &assignments)
                    .await
                    .map_err(anyhow::Error::from),
                Err(error) => Err(error),
            };
            if let Err(error) = reconciled {
                warn!(%error, user = %cred.user_name, cluster = %cluster.id, "Denied");
                return json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &review.unauthenticated(error),
                );
            }
        } else {
            debug!(user = %cred.user_name, "No cluster context; skipping reconciliation");
        }

        let user = UserInfo::from_credential(&cred, &assignments);
        debug!(user = %user.name, groups = ?user.groups, "Authenticated");
        json_response(StatusCode::OK, &review.authenticated(user))
    }
}

#[async_trait::async_trait]
impl ClusterApis for ClientCache {
    async fn api(&self, cluster: &Cluster) -> anyhow::Result<Arc<dyn ClusterApi>> {
        let client = self.client(cluster).await?;
        Ok(Arc::new(KubeApi::new(client)))
    }
}
