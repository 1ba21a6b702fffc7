//! ---
//! warden_section: "03-persistence-storage"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Storage contract, permission engine and backends."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Storage backend contract for Warden.
//!
//! Backends supply data (resources, topics, sync bookkeeping). The query
//! side (`check_permissions`, listings) is provided once on top of that data
//! through [`engine`]; a backend may override a query method with a native
//! implementation as long as it returns identical results.

use std::collections::BTreeMap;

use async_trait::async_trait;
use warden_model::{
    AuthzError, PermissionBits, PermissionRequest, Principal, Resource, Result, Topic,
};

pub mod engine;
pub mod memory;

pub use engine::{effective_permissions, is_granted, Page};
pub use memory::MemoryStorage;

/// Persistence of per-resource permission records and per-topic configuration.
///
/// Implementations must make every single-resource mutation atomic so that
/// concurrent writers to one resource never interleave field by field.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Resource by storage id; `NotFound` when absent.
    async fn get_resource(&self, topic_id: &str, id: &str) -> Result<Resource>;

    /// Resources for the given storage ids; absent ids are omitted.
    async fn get_resources(&self, topic_id: &str, ids: &[String]) -> Result<Vec<Resource>>;

    /// All resources of a topic ordered by id ascending.
    async fn scan_resources(&self, topic_id: &str) -> Result<Vec<Resource>>;

    /// Store `resource` stamped with `timestamp`.
    ///
    /// With `prevent_older_updates` the write is skipped when the stored
    /// resource already carries a timestamp greater than or equal to
    /// `timestamp`. Returns `true` when the write was ignored. Writes below
    /// a topic that is not stored fail with `NotFound`, checked atomically
    /// with the write so a concurrent `delete_topic` cannot be undone.
    async fn set_resource(
        &self,
        resource: Resource,
        timestamp: i64,
        prevent_older_updates: bool,
    ) -> Result<bool>;

    /// Remove a resource; removing an absent resource is not an error.
    async fn delete_resource(&self, topic_id: &str, id: &str) -> Result<()>;

    async fn list_topics(&self) -> Result<Vec<Topic>>;

    /// Topic by id; `NotFound` when absent.
    async fn get_topic(&self, topic_id: &str) -> Result<Topic>;

    async fn set_topic(&self, topic: Topic) -> Result<()>;

    /// Remove a topic together with every resource below it.
    async fn delete_topic(&self, topic_id: &str) -> Result<()>;

    /// Unsynced resources whose last write is older than `older_than` (unix nanos).
    async fn list_unsynced_resources(&self, older_than: i64) -> Result<Vec<Resource>>;

    /// Flag a resource as synced if its last write carries exactly `timestamp`.
    /// Returns whether the resource matched.
    async fn mark_resource_as_synced(&self, topic_id: &str, id: &str, timestamp: i64)
        -> Result<bool>;

    /// Whether `principal` holds every requested right; unknown resources yield `false`.
    async fn check_permissions(
        &self,
        topic_id: &str,
        id: &str,
        principal: &Principal,
        request: PermissionRequest,
    ) -> Result<bool> {
        match self.get_resource(topic_id, id).await {
            Ok(resource) => Ok(is_granted(&resource.permissions, principal, request)),
            Err(AuthzError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Per-id check; ids without a stored resource are omitted.
    async fn check_permissions_bulk(
        &self,
        topic_id: &str,
        ids: &[String],
        principal: &Principal,
        request: PermissionRequest,
    ) -> Result<BTreeMap<String, bool>> {
        Ok(self
            .get_resources(topic_id, ids)
            .await?
            .into_iter()
            .map(|resource| {
                let granted = is_granted(&resource.permissions, principal, request);
                (resource.id, granted)
            })
            .collect())
    }

    /// Effective bits per stored id; ids without a stored resource are omitted.
    async fn computed_permissions(
        &self,
        topic_id: &str,
        ids: &[String],
        principal: &Principal,
    ) -> Result<BTreeMap<String, PermissionBits>> {
        Ok(self
            .get_resources(topic_id, ids)
            .await?
            .into_iter()
            .map(|resource| {
                let bits = effective_permissions(&resource.permissions, principal);
                (resource.id, bits)
            })
            .collect())
    }

    /// Resources granting `request` to `principal`, ordered by id.
    async fn list_accessible_resources(
        &self,
        topic_id: &str,
        principal: &Principal,
        request: PermissionRequest,
        page: Page,
    ) -> Result<Vec<Resource>> {
        let resources = self.scan_resources(topic_id).await?;
        Ok(page.apply(
            resources
                .into_iter()
                .filter(|resource| is_granted(&resource.permissions, principal, request)),
        ))
    }

    /// Ids of [`Storage::list_accessible_resources`].
    async fn list_accessible_ids(
        &self,
        topic_id: &str,
        principal: &Principal,
        request: PermissionRequest,
        page: Page,
    ) -> Result<Vec<String>> {
        Ok(self
            .list_accessible_resources(topic_id, principal, request, page)
            .await?
            .into_iter()
            .map(|resource| resource.id)
            .collect())
    }

    async fn list_resources_with_admin_right(
        &self,
        topic_id: &str,
        principal: &Principal,
        page: Page,
    ) -> Result<Vec<Resource>> {
        self.list_accessible_resources(
            topic_id,
            principal,
            PermissionRequest::administrate(),
            page,
        )
        .await
    }
}
