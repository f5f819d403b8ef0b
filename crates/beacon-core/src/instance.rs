//! Instance descriptors
//!
//! An [`InstanceInfo`] describes one service endpoint. Values are immutable:
//! an update produces a new value through [`InstanceInfoBuilder`], and
//! [`InstanceInfo::diff_older`] / [`InstanceInfo::apply_delta`] translate between
//! full values and single-field [`Delta`]s.

use std::collections::BTreeMap;
use std::fmt;

use crate::{BeaconError, BeaconResult};

/// Lifecycle status advertised by an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum InstanceStatus {
    Starting,
    Up,
    Down,
    OutOfService,
    #[default]
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }

    /// Parse the upper-case wire name; anything unrecognised is `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STARTING" => Some(InstanceStatus::Starting),
            "UP" => Some(InstanceStatus::Up),
            "DOWN" => Some(InstanceStatus::Down),
            "OUT_OF_SERVICE" => Some(InstanceStatus::OutOfService),
            "UNKNOWN" => Some(InstanceStatus::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A labelled network address (e.g. "public", "private")
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    pub label: String,
    pub ip_address: Option<String>,
    pub host_name: Option<String>,
}

impl NetworkAddress {
    pub fn public_ip(ip: impl Into<String>) -> Self {
        NetworkAddress {
            label: "public".to_string(),
            ip_address: Some(ip.into()),
            host_name: None,
        }
    }

    pub fn private_ip(ip: impl Into<String>) -> Self {
        NetworkAddress {
            label: "private".to_string(),
            ip_address: Some(ip.into()),
            host_name: None,
        }
    }

    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }
}

/// A declared service port
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
    pub secure: bool,
}

impl ServicePort {
    pub fn new(port: u16) -> Self {
        ServicePort {
            name: None,
            port,
            secure: false,
        }
    }

    pub fn secure(port: u16) -> Self {
        ServicePort {
            name: None,
            port,
            secure: true,
        }
    }

    pub fn named(name: impl Into<String>, port: u16) -> Self {
        ServicePort {
            name: Some(name.into()),
            port,
            secure: false,
        }
    }
}

/// Immutable description of one registered service endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    id: String,
    app: String,
    app_group: Option<String>,
    vip_address: Option<String>,
    addresses: Vec<NetworkAddress>,
    ports: Vec<ServicePort>,
    health_check_urls: Vec<String>,
    status_page_url: Option<String>,
    home_page_url: Option<String>,
    metadata: BTreeMap<String, String>,
    status: InstanceStatus,
    /// Conflict-resolution clock, milliseconds
    last_dirty_timestamp: u64,
}

impl InstanceInfo {
    /// Start building an instance with the given id
    pub fn builder(id: impl Into<String>) -> InstanceInfoBuilder {
        InstanceInfoBuilder::new(id)
    }

    /// Builder pre-populated with this instance's fields
    pub fn to_builder(&self) -> InstanceInfoBuilder {
        InstanceInfoBuilder {
            info: self.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn app_group(&self) -> Option<&str> {
        self.app_group.as_deref()
    }

    pub fn vip_address(&self) -> Option<&str> {
        self.vip_address.as_deref()
    }

    pub fn addresses(&self) -> &[NetworkAddress] {
        &self.addresses
    }

    pub fn ports(&self) -> &[ServicePort] {
        &self.ports
    }

    pub fn health_check_urls(&self) -> &[String] {
        &self.health_check_urls
    }

    pub fn status_page_url(&self) -> Option<&str> {
        self.status_page_url.as_deref()
    }

    pub fn home_page_url(&self) -> Option<&str> {
        self.home_page_url.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn last_dirty_timestamp(&self) -> u64 {
        self.last_dirty_timestamp
    }

    /// Copy of this instance with a new status and dirty timestamp
    pub fn with_status(&self, status: InstanceStatus, dirty_timestamp: u64) -> InstanceInfo {
        let mut info = self.clone();
        info.status = status;
        info.last_dirty_timestamp = dirty_timestamp;
        info
    }

    /// Deltas that turn `older` into `self`.
    ///
    /// The dirty timestamp is bookkeeping, not content, and never produces a delta.
    pub fn diff_older(&self, older: &InstanceInfo) -> Vec<Delta> {
        let mut deltas = Vec::new();
        let mut push = |field: DeltaField| {
            deltas.push(Delta {
                id: self.id.clone(),
                field,
            })
        };

        if self.app != older.app {
            push(DeltaField::App(self.app.clone()));
        }
        if self.app_group != older.app_group {
            push(DeltaField::AppGroup(self.app_group.clone()));
        }
        if self.vip_address != older.vip_address {
            push(DeltaField::VipAddress(self.vip_address.clone()));
        }
        if self.addresses != older.addresses {
            push(DeltaField::Addresses(self.addresses.clone()));
        }
        if self.ports != older.ports {
            push(DeltaField::Ports(self.ports.clone()));
        }
        if self.health_check_urls != older.health_check_urls {
            push(DeltaField::HealthCheckUrls(self.health_check_urls.clone()));
        }
        if self.status_page_url != older.status_page_url {
            push(DeltaField::StatusPageUrl(self.status_page_url.clone()));
        }
        if self.home_page_url != older.home_page_url {
            push(DeltaField::HomePageUrl(self.home_page_url.clone()));
        }
        if self.metadata != older.metadata {
            push(DeltaField::Metadata(self.metadata.clone()));
        }
        if self.status != older.status {
            push(DeltaField::Status(self.status));
        }

        deltas
    }

    /// Apply a single-field delta, producing a new value
    pub fn apply_delta(&self, delta: &Delta) -> BeaconResult<InstanceInfo> {
        if delta.id != self.id {
            return Err(BeaconError::InvalidInstance(format!(
                "delta for {} applied to {}",
                delta.id, self.id
            )));
        }

        let mut info = self.clone();
        match &delta.field {
            DeltaField::App(v) => info.app = v.clone(),
            DeltaField::AppGroup(v) => info.app_group = v.clone(),
            DeltaField::VipAddress(v) => info.vip_address = v.clone(),
            DeltaField::Addresses(v) => info.addresses = v.clone(),
            DeltaField::Ports(v) => info.ports = v.clone(),
            DeltaField::HealthCheckUrls(v) => info.health_check_urls = v.clone(),
            DeltaField::StatusPageUrl(v) => info.status_page_url = v.clone(),
            DeltaField::HomePageUrl(v) => info.home_page_url = v.clone(),
            DeltaField::Metadata(v) => info.metadata = v.clone(),
            DeltaField::Status(v) => info.status = *v,
        }
        Ok(info)
    }

    /// Apply a set of deltas in order
    pub fn apply_deltas<'a>(
        &self,
        deltas: impl IntoIterator<Item = &'a Delta>,
    ) -> BeaconResult<InstanceInfo> {
        deltas
            .into_iter()
            .try_fold(self.clone(), |info, delta| info.apply_delta(delta))
    }
}

impl fmt::Display for InstanceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}[{}@{}]",
            self.app, self.id, self.status, self.last_dirty_timestamp
        )
    }
}

/// Builder for [`InstanceInfo`]
#[derive(Clone, Debug)]
pub struct InstanceInfoBuilder {
    info: InstanceInfo,
}

impl InstanceInfoBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        InstanceInfoBuilder {
            info: InstanceInfo {
                id: id.into(),
                app: String::new(),
                app_group: None,
                vip_address: None,
                addresses: Vec::new(),
                ports: Vec::new(),
                health_check_urls: Vec::new(),
                status_page_url: None,
                home_page_url: None,
                metadata: BTreeMap::new(),
                status: InstanceStatus::Unknown,
                last_dirty_timestamp: 0,
            },
        }
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.info.app = app.into();
        self
    }

    pub fn app_group(mut self, group: impl Into<String>) -> Self {
        self.info.app_group = Some(group.into());
        self
    }

    pub fn vip_address(mut self, vip: impl Into<String>) -> Self {
        self.info.vip_address = Some(vip.into());
        self
    }

    pub fn address(mut self, address: NetworkAddress) -> Self {
        self.info.addresses.push(address);
        self
    }

    pub fn port(mut self, port: ServicePort) -> Self {
        self.info.ports.push(port);
        self
    }

    pub fn health_check_url(mut self, url: impl Into<String>) -> Self {
        self.info.health_check_urls.push(url.into());
        self
    }

    pub fn status_page_url(mut self, url: impl Into<String>) -> Self {
        self.info.status_page_url = Some(url.into());
        self
    }

    pub fn home_page_url(mut self, url: impl Into<String>) -> Self {
        self.info.home_page_url = Some(url.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.metadata.insert(key.into(), value.into());
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.info.status = status;
        self
    }

    pub fn last_dirty_timestamp(mut self, timestamp: u64) -> Self {
        self.info.last_dirty_timestamp = timestamp;
        self
    }

    /// Validate and produce the immutable value
    pub fn build(self) -> BeaconResult<InstanceInfo> {
        if self.info.id.is_empty() {
            return Err(BeaconError::InvalidInstance("empty instance id".into()));
        }
        if self.info.app.is_empty() {
            return Err(BeaconError::InvalidInstance(format!(
                "instance {} has no application name",
                self.info.id
            )));
        }
        Ok(self.info)
    }
}

/// A single-field change of one instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    pub id: String,
    pub field: DeltaField,
}

impl Delta {
    pub fn new(id: impl Into<String>, field: DeltaField) -> Self {
        Delta {
            id: id.into(),
            field,
        }
    }

    pub fn field_name(&self) -> &'static str {
        self.field.name()
    }
}

/// The changed field together with its new value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeltaField {
    App(String),
    AppGroup(Option<String>),
    VipAddress(Option<String>),
    Addresses(Vec<NetworkAddress>),
    Ports(Vec<ServicePort>),
    HealthCheckUrls(Vec<String>),
    StatusPageUrl(Option<String>),
    HomePageUrl(Option<String>),
    Metadata(BTreeMap<String, String>),
    Status(InstanceStatus),
}

impl DeltaField {
    pub fn name(&self) -> &'static str {
        match self {
            DeltaField::App(_) => "app",
            DeltaField::AppGroup(_) => "appGroup",
            DeltaField::VipAddress(_) => "vipAddress",
            DeltaField::Addresses(_) => "addresses",
            DeltaField::Ports(_) => "ports",
            DeltaField::HealthCheckUrls(_) => "healthCheckUrls",
            DeltaField::StatusPageUrl(_) => "statusPageUrl",
            DeltaField::HomePageUrl(_) => "homePageUrl",
            DeltaField::Metadata(_) => "metadata",
            DeltaField::Status(_) => "status",
        }
    }
}
