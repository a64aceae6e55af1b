//! Node, endpoint and lifecycle types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Which kind of backend a node lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A cloud VM instance running a single container.
    ComputeInstance,
    /// A one-replica deployment plus service on a container cluster.
    Cluster,
}

impl BackendKind {
    /// Short system name passed to nodes through their environment.
    #[must_use]
    pub fn system_name(self) -> &'static str {
        match self {
            Self::ComputeInstance => "gce",
            Self::Cluster => "k8s",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.system_name())
    }
}

/// Lifecycle of a node from request to reachable endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Creation has been requested but not acknowledged.
    Requested,
    /// The backend accepted the creation request.
    BackendAccepted,
    /// The backend reports the node as running.
    Ready,
    /// A reachable endpoint has been resolved.
    EndpointAssigned,
    /// A readiness deadline elapsed first.
    TimedOut,
}

impl NodeState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::{BackendAccepted, EndpointAssigned, Ready, Requested, TimedOut};
        matches!(
            (self, next),
            (Requested, BackendAccepted)
                | (BackendAccepted, Ready)
                | (Ready, EndpointAssigned)
                | (BackendAccepted | Ready, TimedOut)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::BackendAccepted => "backend_accepted",
            Self::Ready => "ready",
            Self::EndpointAssigned => "endpoint_assigned",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Resolved network location of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port of the node's mutual-TLS listener.
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// HTTPS URL for this endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A provisioned compute unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    name: String,
    kind: BackendKind,
    owner: String,
    state: NodeState,
    endpoint: Option<Endpoint>,
}

impl Node {
    /// A node whose creation has just been requested.
    #[must_use]
    pub fn requested(name: impl Into<String>, kind: BackendKind, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            owner: owner.into(),
            state: NodeState::Requested,
            endpoint: None,
        }
    }

    /// A node discovered by listing the backend.
    #[must_use]
    pub fn observed(
        name: impl Into<String>,
        kind: BackendKind,
        owner: impl Into<String>,
        endpoint: Option<Endpoint>,
    ) -> Self {
        let state = if endpoint.is_some() {
            NodeState::EndpointAssigned
        } else {
            NodeState::Ready
        };
        Self {
            name: name.into(),
            kind,
            owner: owner.into(),
            state,
            endpoint,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Ownership label shared by every node of a cluster.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// The endpoint, or a configuration error naming the node.
    ///
    /// # Errors
    /// Returns [`FleetError::Configuration`] when no endpoint was resolved.
    pub fn require_endpoint(&self) -> Result<&Endpoint> {
        self.endpoint.as_ref().ok_or_else(|| {
            FleetError::Configuration(format!("node {} has no resolved endpoint", self.name))
        })
    }

    /// Move to the next lifecycle state.
    ///
    /// # Errors
    /// Returns [`FleetError::InvalidState`] for an illegal transition.
    pub fn transition(&mut self, next: NodeState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(FleetError::InvalidState {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record the resolved endpoint. It can be set only once.
    ///
    /// # Errors
    /// Returns [`FleetError::InvalidState`] if the node is not `Ready`.
    pub fn assign_endpoint(&mut self, endpoint: Endpoint) -> Result<()> {
        self.transition(NodeState::EndpointAssigned)?;
        self.endpoint = Some(endpoint);
        Ok(())
    }
}
