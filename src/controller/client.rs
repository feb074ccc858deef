//! # Kind Clients
//!
//! Write access to the cluster API for one kind. The reconciler only talks to
//! the API through this trait so passes can be replayed against the fake.

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

use crate::constants::OPERATOR_NAME;

/// Errors from a cluster write
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// The request was refused (used by the in-memory client)
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Patch payload understood by [`KindClient::patch`]
#[derive(Debug, Clone, PartialEq)]
pub enum PatchDocument {
    /// RFC 6902 JSON patch
    Json(json_patch::Patch),
    /// RFC 7386 merge patch
    Merge(Value),
}

impl PatchDocument {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Json(patch) => serde_json::to_value(patch).unwrap_or(Value::Null),
            Self::Merge(value) => value.clone(),
        }
    }
}

/// Create, patch, replace and delete objects of kind `K`
#[async_trait]
pub trait KindClient<K>: Send + Sync {
    async fn create(&self, obj: &K) -> Result<K, ClientError>;
    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &PatchDocument,
    ) -> Result<K, ClientError>;
    /// Replace the whole object; `obj` carries the resourceVersion to guard on
    async fn update(&self, obj: &K) -> Result<K, ClientError>;
    /// Delete with a zero grace period
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClientError>;
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ClientError>;
    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<K, ClientError>;
}

type ApiFactory<K> = Arc<dyn Fn(Option<&str>) -> Api<K> + Send + Sync>;

/// [`KindClient`] backed by a `kube::Api`
pub struct KubeKindClient<K> {
    api: ApiFactory<K>,
}

impl<K> Debug for KubeKindClient<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeKindClient").finish_non_exhaustive()
    }
}

impl<K> KubeKindClient<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + 'static,
{
    pub fn namespaced(client: Client) -> Self {
        Self {
            api: Arc::new(move |namespace| match namespace {
                Some(ns) => Api::namespaced(client.clone(), ns),
                None => Api::all(client.clone()),
            }),
        }
    }
}

impl<K> KubeKindClient<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()> + 'static,
{
    pub fn cluster(client: Client) -> Self {
        Self {
            api: Arc::new(move |_| Api::all(client.clone())),
        }
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(OPERATOR_NAME.to_string()),
        ..PatchParams::default()
    }
}

#[async_trait]
impl<K> KindClient<K> for KubeKindClient<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create(&self, obj: &K) -> Result<K, ClientError> {
        let api = (self.api)(obj.meta().namespace.as_deref());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &PatchDocument,
    ) -> Result<K, ClientError> {
        let api = (self.api)(namespace);
        let result = match patch {
            PatchDocument::Json(p) => {
                api.patch(name, &patch_params(), &Patch::Json::<()>(p.clone()))
                    .await?
            }
            PatchDocument::Merge(v) => api.patch(name, &patch_params(), &Patch::Merge(v)).await?,
        };
        Ok(result)
    }

    async fn update(&self, obj: &K) -> Result<K, ClientError> {
        let api = (self.api)(obj.meta().namespace.as_deref());
        let name = obj.meta().name.clone().unwrap_or_default();
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        let api = (self.api)(namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ClientError> {
        let api = (self.api)(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<K, ClientError> {
        let api = (self.api)(namespace);
        let body = serde_json::json!({ "status": status });
        Ok(api
            .patch_status(name, &patch_params(), &Patch::Merge(&body))
            .await?)
    }
}
