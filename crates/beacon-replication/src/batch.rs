//! Batch replication
//!
//! The request/response sibling of the streaming protocol: a peer submits a
//! list of instance actions and receives one response per item, in the same
//! order. Every peer asserts its copies under one stable replicated source.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use beacon_core::{BeaconResult, InstanceInfo, InstanceStatus, Source};
use beacon_registry::{InstanceRegistry, RegistrationStatus, RegistryReader};

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_CONFLICT: u16 = 409;
pub const STATUS_UNAVAILABLE: u16 = 503;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplicationAction {
    Register,
    Update,
    Heartbeat,
    Cancel,
    StatusUpdate,
    DeleteStatusOverride,
}

/// One item of a batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationInstance {
    pub app_name: String,
    pub id: String,
    pub last_dirty_timestamp: Option<u64>,
    pub overridden_status: Option<InstanceStatus>,
    pub status: Option<InstanceStatus>,
    pub instance_info: Option<InstanceInfo>,
    pub action: ReplicationAction,
}

impl ReplicationInstance {
    pub fn new(action: ReplicationAction, app_name: impl Into<String>, id: impl Into<String>) -> Self {
        ReplicationInstance {
            app_name: app_name.into(),
            id: id.into(),
            last_dirty_timestamp: None,
            overridden_status: None,
            status: None,
            instance_info: None,
            action,
        }
    }

    /// Item carrying `info`, with the identifying fields taken from it
    pub fn for_info(action: ReplicationAction, info: InstanceInfo) -> Self {
        ReplicationInstance {
            app_name: info.app().to_string(),
            id: info.id().to_string(),
            last_dirty_timestamp: Some(info.last_dirty_timestamp()),
            overridden_status: None,
            status: Some(info.status()),
            instance_info: Some(info),
            action,
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_overridden_status(mut self, status: InstanceStatus) -> Self {
        self.overridden_status = Some(status);
        self
    }

    pub fn with_last_dirty_timestamp(mut self, timestamp: u64) -> Self {
        self.last_dirty_timestamp = Some(timestamp);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationList {
    pub items: Vec<ReplicationInstance>,
}

impl ReplicationList {
    pub fn new(items: Vec<ReplicationInstance>) -> Self {
        ReplicationList { items }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationInstanceResponse {
    pub status_code: u16,
    pub response_entity: Option<InstanceInfo>,
}

impl ReplicationInstanceResponse {
    fn status(status_code: u16) -> Self {
        ReplicationInstanceResponse {
            status_code,
            response_entity: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == STATUS_OK
    }
}

/// Responses in the order of the submitted items
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationListResponse {
    pub responses: Vec<ReplicationInstanceResponse>,
}

/// Applies batches from peers to a registry
pub struct BatchReplicationHandler<R: ?Sized> {
    registry: Arc<R>,
    sources: DashMap<String, Source>,
}

impl<R: InstanceRegistry + ?Sized> BatchReplicationHandler<R> {
    pub fn new(registry: Arc<R>) -> Self {
        BatchReplicationHandler {
            registry,
            sources: DashMap::new(),
        }
    }

    /// Stable replicated source for `peer`
    pub fn source_for(&self, peer: &str) -> Source {
        self.sources
            .entry(peer.to_string())
            .or_insert_with(|| Source::replicated(peer))
            .clone()
    }

    pub fn process(&self, peer: &str, list: ReplicationList) -> ReplicationListResponse {
        let source = self.source_for(peer);
        let responses: Vec<ReplicationInstanceResponse> = list
            .items
            .into_iter()
            .map(|item| self.dispatch(&source, item))
            .collect();
        debug!(peer, items = responses.len(), "processed replication batch");
        ReplicationListResponse { responses }
    }

    fn dispatch(&self, source: &Source, item: ReplicationInstance) -> ReplicationInstanceResponse {
        if item.id.is_empty() || item.app_name.is_empty() {
            return ReplicationInstanceResponse::status(STATUS_BAD_REQUEST);
        }
        if item
            .instance_info
            .as_ref()
            .is_some_and(|info| info.id() != item.id)
        {
            return ReplicationInstanceResponse::status(STATUS_BAD_REQUEST);
        }

        let action = item.action;
        match action {
            ReplicationAction::Register => self.register(source, item, false),
            ReplicationAction::Update => self.register(source, item, true),
            ReplicationAction::Heartbeat => self.heartbeat(&item),
            ReplicationAction::Cancel => self.cancel(source, &item),
            ReplicationAction::StatusUpdate => {
                let Some(status) = item.status else {
                    return ReplicationInstanceResponse::status(STATUS_BAD_REQUEST);
                };
                self.restatus(source, &item, status)
            }
            ReplicationAction::DeleteStatusOverride => {
                let status = item.status.unwrap_or(InstanceStatus::Unknown);
                self.restatus(source, &item, status)
            }
        }
    }

    fn register(
        &self,
        source: &Source,
        item: ReplicationInstance,
        must_exist: bool,
    ) -> ReplicationInstanceResponse {
        let Some(mut info) = item.instance_info else {
            return ReplicationInstanceResponse::status(STATUS_BAD_REQUEST);
        };
        if must_exist && self.registry.get(&item.id).is_none() {
            return ReplicationInstanceResponse::status(STATUS_NOT_FOUND);
        }
        if let Some(overridden) = item.overridden_status {
            info = info.with_status(overridden, info.last_dirty_timestamp());
        }
        self.apply(|| self.registry.register(info, source))
    }

    /// Compare dirty timestamps: the peer is ahead (404, it should
    /// re-register) or behind (409, with our copy to catch up from)
    fn heartbeat(&self, item: &ReplicationInstance) -> ReplicationInstanceResponse {
        let Some(local) = self.registry.get(&item.id) else {
            return ReplicationInstanceResponse::status(STATUS_NOT_FOUND);
        };
        match item.last_dirty_timestamp {
            Some(ts) if ts > local.last_dirty_timestamp() => {
                ReplicationInstanceResponse::status(STATUS_NOT_FOUND)
            }
            Some(ts) if ts < local.last_dirty_timestamp() => ReplicationInstanceResponse {
                status_code: STATUS_CONFLICT,
                response_entity: Some(local),
            },
            _ => ReplicationInstanceResponse::status(STATUS_OK),
        }
    }

    /// Remove the peer's own copy; found even when another copy is effective
    fn cancel(&self, source: &Source, item: &ReplicationInstance) -> ReplicationInstanceResponse {
        let Some(copy) = self.registry.copy_of(&item.id, source) else {
            return ReplicationInstanceResponse::status(STATUS_NOT_FOUND);
        };
        match self.registry.unregister(&copy, source) {
            Ok(status) => {
                debug!(id = %item.id, source = %source, ?status, "batch cancel");
                ReplicationInstanceResponse::status(STATUS_OK)
            }
            Err(e) => {
                warn!(id = %item.id, error = %e, "batch cancel failed");
                ReplicationInstanceResponse::status(STATUS_UNAVAILABLE)
            }
        }
    }

    fn restatus(
        &self,
        source: &Source,
        item: &ReplicationInstance,
        status: InstanceStatus,
    ) -> ReplicationInstanceResponse {
        let Some(local) = self.registry.get(&item.id) else {
            return ReplicationInstanceResponse::status(STATUS_NOT_FOUND);
        };
        let timestamp = item
            .last_dirty_timestamp
            .unwrap_or(local.last_dirty_timestamp());
        let restated = local.with_status(status, timestamp);
        self.apply(|| self.registry.register(restated, source))
    }

    fn apply(
        &self,
        op: impl FnOnce() -> BeaconResult<RegistrationStatus>,
    ) -> ReplicationInstanceResponse {
        match op() {
            Ok(_) => ReplicationInstanceResponse::status(STATUS_OK),
            Err(e) => {
                warn!(error = %e, "batch item rejected by registry");
                ReplicationInstanceResponse::status(STATUS_UNAVAILABLE)
            }
        }
    }
}
