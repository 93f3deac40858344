//! Resource identity and request-side cache keys

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use crate::clock::epoch_millis;

/// Request parameters: name to values, in name order
pub type Params = BTreeMap<String, Vec<String>>;

/// Project context a resource is rendered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Project {
    /// Published content
    Online,
    /// Work in progress
    Offline,
}

impl Project {
    /// Pick the project from an "is online" flag
    pub fn from_online(online: bool) -> Self {
        if online {
            Project::Online
        } else {
            Project::Offline
        }
    }

    /// Suffix appended to resource names of this project
    pub fn suffix(self) -> &'static str {
        match self {
            Project::Online => " [online]",
            Project::Offline => " [offline]",
        }
    }
}

/// Identity of a cached resource: its path plus the project it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    path: String,
    project: Project,
}

impl ResourceName {
    /// Create a resource name
    pub fn new(path: impl Into<String>, project: Project) -> Self {
        Self {
            path: path.into(),
            project,
        }
    }

    /// Online resource name
    pub fn online(path: impl Into<String>) -> Self {
        Self::new(path, Project::Online)
    }

    /// Offline resource name
    pub fn offline(path: impl Into<String>) -> Self {
        Self::new(path, Project::Offline)
    }

    /// Resource path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Project of the resource
    pub fn project(&self) -> Project {
        self.project
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.path, self.project.suffix())
    }
}

/// Values captured from a single request
///
/// Built once through [`RequestKey::builder`] and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    resource: ResourceName,
    uri: String,
    user: u64,
    group: String,
    params: Params,
    scheme: String,
    port: u16,
    timestamp: u64,
}

impl RequestKey {
    /// Start building a request key for the given resource
    pub fn builder(resource: ResourceName) -> RequestKeyBuilder {
        RequestKeyBuilder {
            key: RequestKey {
                resource,
                uri: String::new(),
                user: 0,
                group: String::new(),
                params: Params::new(),
                scheme: String::from("http"),
                port: 80,
                timestamp: 0,
            },
            timestamp: None,
        }
    }

    /// Resource this request renders
    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    /// Top-level URI of the request
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Id of the requesting user
    pub fn user(&self) -> u64 {
        self.user
    }

    /// Current group of the requesting user (lowercase)
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Request parameters
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Request scheme (lowercase)
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Server port the request came in on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Request time in epoch milliseconds
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp
    }
}

/// Builder for [`RequestKey`]
#[derive(Debug, Clone)]
pub struct RequestKeyBuilder {
    key: RequestKey,
    timestamp: Option<u64>,
}

impl RequestKeyBuilder {
    /// Set the top-level URI
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.key.uri = uri.into();
        self
    }

    /// Set the user id
    pub fn user(mut self, user: u64) -> Self {
        self.key.user = user;
        self
    }

    /// Set the current group; group names compare case-insensitively
    pub fn group(mut self, group: &str) -> Self {
        self.key.group = group.to_lowercase();
        self
    }

    /// Append a parameter value
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.key
            .params
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Replace all parameters
    pub fn params(mut self, params: Params) -> Self {
        self.key.params = params;
        self
    }

    /// Set the request scheme
    pub fn scheme(mut self, scheme: &str) -> Self {
        self.key.scheme = scheme.to_lowercase();
        self
    }

    /// Set the server port
    pub fn port(mut self, port: u16) -> Self {
        self.key.port = port;
        self
    }

    /// Set the request time
    pub fn timestamp(self, time: SystemTime) -> Self {
        self.timestamp_millis(epoch_millis(time))
    }

    /// Set the request time in epoch milliseconds
    pub fn timestamp_millis(mut self, millis: u64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Finish the key; an unset timestamp means "now"
    pub fn build(mut self) -> RequestKey {
        self.key.timestamp = self
            .timestamp
            .unwrap_or_else(|| epoch_millis(SystemTime::now()));
        self.key
    }
}
