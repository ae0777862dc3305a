//! Location Service coordinator — presence and resolution.
//!
//! Single source of truth for who is where. Owns the `whoswho` queue; no
//! other component writes to it. Node records are keyed by node UUID and
//! replaced in place; after every node publish the owning user's index
//! record is recomputed from the full set of node records.
//!
//! The user record is eventually consistent with the node records: a
//! reader that sees a user record with N entries immediately after a
//! rotation may briefly find one of them missing. Convergence is within
//! one publish cycle; callers must tolerate the gap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use box_core::object::StoredObject;
use box_core::queue::QueuePath;
use box_core::record::{NodeRecord, UserRecord, NODE_SCHEMA, STALE_THRESHOLD, USER_SCHEMA};
use box_store::{QueueStore, StoreError};

/// How often the daemon republishes its own node record.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Staleness report over the current `whoswho` contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationSummary {
    pub total_nodes: usize,
    pub total_users: usize,
    pub active_nodes: usize,
    pub stale_nodes: Vec<Uuid>,
    pub stale_users: Vec<Uuid>,
}

/// Resolution result for a user subject: the index plus the records behind it.
#[derive(Debug, Clone, Serialize)]
pub struct UserResolution {
    pub user_uuid: Uuid,
    pub node_uuids: Vec<Uuid>,
    pub records: Vec<NodeRecord>,
}

pub struct LocationService {
    store: Arc<QueueStore>,
    whoswho: QueuePath,
}

impl LocationService {
    pub fn new(store: Arc<QueueStore>) -> Self {
        Self {
            store,
            whoswho: QueuePath::whoswho(),
        }
    }

    /// Publish a node record, then recompute the owner's user index.
    pub fn publish_node(&self, record: &NodeRecord) -> Result<(), LocationError> {
        let object = self.record_object(
            record.node_uuid,
            record.node_uuid,
            record.user_uuid,
            record,
            NODE_SCHEMA,
        )?;
        self.replace(record.node_uuid, &object)?;
        tracing::debug!(node = %record.node_uuid, user = %record.user_uuid, "node record published");

        self.rebuild_user_index(record.user_uuid)
    }

    /// Recompute and publish the index record for one user.
    fn rebuild_user_index(&self, user_uuid: Uuid) -> Result<(), LocationError> {
        let mut node_uuids: Vec<Uuid> = self
            .snapshot()?
            .into_iter()
            .filter(|r| r.user_uuid == user_uuid)
            .map(|r| r.node_uuid)
            .collect();
        node_uuids.sort();
        node_uuids.dedup();

        let index = UserRecord {
            user_uuid,
            node_uuids,
            generated_at: Utc::now().timestamp_millis(),
        };
        let object = self.record_object(user_uuid, user_uuid, user_uuid, &index, USER_SCHEMA)?;
        self.replace(user_uuid, &object)?;
        tracing::debug!(user = %user_uuid, nodes = index.node_uuids.len(), "user index rebuilt");
        Ok(())
    }

    /// Every node record currently in `whoswho`, sorted by node UUID.
    ///
    /// Entries that fail to decode are skipped with a warning rather than
    /// poisoning the whole snapshot.
    pub fn snapshot(&self) -> Result<Vec<NodeRecord>, LocationError> {
        let mut records = Vec::new();
        for reference in self.store.list(&self.whoswho)? {
            let object = match self.store.read(&reference) {
                Ok(o) => o,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            if object.schema() != Some(NODE_SCHEMA) {
                continue;
            }
            match serde_json::from_slice::<NodeRecord>(&object.data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(id = %object.id, error = %e, "undecodable node record skipped");
                }
            }
        }
        records.sort_by_key(|r| r.node_uuid);
        Ok(records)
    }

    /// Resolve a node subject.
    pub fn resolve_node(&self, node_uuid: Uuid) -> Result<Option<NodeRecord>, LocationError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .find(|r| r.node_uuid == node_uuid))
    }

    /// Resolve a user subject: every node record the user owns.
    pub fn resolve_user(&self, user_uuid: Uuid) -> Result<UserResolution, LocationError> {
        let records: Vec<NodeRecord> = self
            .snapshot()?
            .into_iter()
            .filter(|r| r.user_uuid == user_uuid)
            .collect();
        let node_uuids = records.iter().map(|r| r.node_uuid).collect();
        Ok(UserResolution {
            user_uuid,
            node_uuids,
            records,
        })
    }

    /// True only when a record with this node UUID exists and belongs to
    /// this user. Store failures count as unknown.
    pub fn authorize(&self, node_uuid: Uuid, user_uuid: Uuid) -> bool {
        match self.resolve_node(node_uuid) {
            Ok(Some(record)) => record.user_uuid == user_uuid,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "authorization lookup failed");
                false
            }
        }
    }

    /// Staleness report with the default two-missed-refreshes threshold.
    pub fn summary(&self) -> Result<LocationSummary, LocationError> {
        self.summary_at(Utc::now().timestamp_millis(), STALE_THRESHOLD)
    }

    /// Staleness report against an explicit clock and threshold.
    pub fn summary_at(
        &self,
        now_ms: i64,
        threshold: Duration,
    ) -> Result<LocationSummary, LocationError> {
        let records = self.snapshot()?;

        let mut stale_nodes = Vec::new();
        let mut users: Vec<Uuid> = Vec::new();
        let mut stale_users: Vec<Uuid> = Vec::new();

        for record in &records {
            if !users.contains(&record.user_uuid) {
                users.push(record.user_uuid);
            }
            if record.is_stale(now_ms, threshold) {
                stale_nodes.push(record.node_uuid);
            }
        }
        for user in &users {
            let all_stale = records
                .iter()
                .filter(|r| r.user_uuid == *user)
                .all(|r| r.is_stale(now_ms, threshold));
            if all_stale {
                stale_users.push(*user);
            }
        }
        stale_nodes.sort();
        stale_users.sort();

        Ok(LocationSummary {
            total_nodes: records.len(),
            total_users: users.len(),
            active_nodes: records.len() - stale_nodes.len(),
            stale_nodes,
            stale_users,
        })
    }

    /// Remove the subject's record, if any. Explicit un-publication.
    pub fn forget(&self, subject: Uuid) -> Result<(), LocationError> {
        self.store.remove(&self.whoswho, subject)?;
        Ok(())
    }

    /// Wrap a record into a schema-tagged stored object with sorted-keys
    /// JSON as its payload.
    fn record_object<T: Serialize>(
        &self,
        id: Uuid,
        node_id: Uuid,
        user_id: Uuid,
        record: &T,
        schema: &str,
    ) -> Result<StoredObject, LocationError> {
        // Through Value the map keys come out sorted, which keeps record
        // files byte-comparable across publishes.
        let value = serde_json::to_value(record)?;
        let data = serde_json::to_vec(&value)?;
        let mut object = StoredObject::new("application/json", data, node_id, user_id)
            .with_schema(schema);
        object.id = id;
        Ok(object)
    }

    /// Remove-then-write, tolerating a missing prior entry.
    fn replace(&self, subject: Uuid, object: &StoredObject) -> Result<(), LocationError> {
        match self.store.remove(&self.whoswho, subject) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.store.put(&self.whoswho, object)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("record codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}
