use crate::Object;
use kubeserver_k8s_api::{self as k8s, Api, PostParams};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("kubernetes API request failed: {0}")]
    Kube(#[source] k8s::Error),
}

/// The Kubernetes operations the reconciler needs.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Succeeds if the object exists; fails with [`ApiError::NotFound`] if it does not.
    async fn get(&self, obj: &Object) -> Result<(), ApiError>;

    /// Fails with [`ApiError::AlreadyExists`] if the object exists.
    async fn create(&self, obj: &Object) -> Result<(), ApiError>;
}

/// A [`ClusterApi`] backed by a Kubernetes client.
#[derive(Clone)]
pub struct KubeApi {
    client: k8s::Client,
}

// === impl ApiError ===

impl From<k8s::Error> for ApiError {
    fn from(error: k8s::Error) -> Self {
        if k8s::is_not_found(&error) {
            return Self::NotFound;
        }
        if k8s::is_already_exists(&error) {
            return Self::AlreadyExists;
        }
        Self::Kube(error)
    }
}

// === impl KubeApi ===

impl KubeApi {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, obj: &Object) -> Api<K>
    where
        K: k8s::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeApi {
    async fn get(&self, obj: &Object) -> Result<(), ApiError> {
        let name = obj.name();
        match obj {
            Object::Namespace(_) => get(Api::<k8s::Namespace>::all(self.client.clone()), &name).await,
            Object::ClusterRoleBinding(_) => {
                get(Api::<k8s::ClusterRoleBinding>::all(self.client.clone()), &name).await
            }
            Object::LimitRange(_) => get(self.api::<k8s::LimitRange>(obj), &name).await,
            Object::RoleBinding(_) => get(self.api::<k8s::RoleBinding>(obj), &name).await,
        }
    }

    async fn create(&self, obj: &Object) -> Result<(), ApiError> {
        match obj {
            Object::Namespace(o) => create(Api::all(self.client.clone()), o).await,
            Object::ClusterRoleBinding(o) => create(Api::all(self.client.clone()), o).await,
            Object::LimitRange(o) => create(self.api(obj), o).await,
            Object::RoleBinding(o) => create(self.api(obj), o).await,
        }
    }
}

async fn get<K>(api: Api<K>, name: &str) -> Result<(), ApiError>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.get(name).await?;
    Ok(())
}

async fn create<K>(api: Api<K>, obj: &K) -> Result<(), ApiError>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), obj).await?;
    Ok(())
}
