use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, DynamicObject, ListParams};
use serde_json::Value;
use tracing::debug;

use crate::cluster::{ClusterError, ObjectKey, ObjectStore, ResourceKind};

const PAGE_SIZE: u32 = 500;

/// Object store backed by the cluster API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub(crate) const fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<Option<Value>, ClusterError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &key.namespace, &kind.api_resource());
        match api.get_opt(&key.name).await? {
            Some(object) => Ok(Some(serde_json::to_value(object)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: &ResourceKind) -> Result<Vec<Value>, ClusterError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &kind.api_resource());
        let mut params = ListParams::default().limit(PAGE_SIZE);
        let mut objects = Vec::new();

        loop {
            let page = api.list(&params).await?;
            for object in page.items {
                objects.push(serde_json::to_value(object)?);
            }
            match page.metadata.continue_.filter(|token| !token.is_empty()) {
                Some(token) => params = params.continue_token(&token),
                None => break,
            }
        }

        debug!("Listed {} {}", objects.len(), kind.plural);
        Ok(objects)
    }
}
