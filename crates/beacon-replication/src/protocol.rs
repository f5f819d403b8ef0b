//! Wire messages
//!
//! Shapes only; byte layout is left to whatever transport carries them.
//! Acknowledgements are transport frames and do not appear here.

use std::fmt;

use beacon_core::{Delta, InstanceInfo};

/// Opens a replication session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationHello {
    pub sender_id: String,
    pub registry_size: usize,
}

/// Receiver's answer to `ReplicationHello`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationHelloReply {
    pub source_id: String,
    /// The receiver holds nothing yet and expects a full seed
    pub seed_request: bool,
}

/// Peer-to-peer replication traffic
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationMessage {
    Hello(ReplicationHello),
    HelloReply(ReplicationHelloReply),
    RegisterCopy(InstanceInfo),
    UpdateCopy { info: InstanceInfo, deltas: Vec<Delta> },
    UnregisterCopy { id: String },
}

impl ReplicationMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ReplicationMessage::Hello(_) => "Hello",
            ReplicationMessage::HelloReply(_) => "HelloReply",
            ReplicationMessage::RegisterCopy(_) => "RegisterCopy",
            ReplicationMessage::UpdateCopy { .. } => "UpdateCopy",
            ReplicationMessage::UnregisterCopy { .. } => "UnregisterCopy",
        }
    }

    /// Instance the message refers to, for copy operations
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            ReplicationMessage::RegisterCopy(info) => Some(info.id()),
            ReplicationMessage::UpdateCopy { info, .. } => Some(info.id()),
            ReplicationMessage::UnregisterCopy { id } => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for ReplicationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance_id() {
            Some(id) => write!(f, "{}({})", self.name(), id),
            None => f.write_str(self.name()),
        }
    }
}

/// Lifecycle of one replication channel; `Closed` is terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Idle,
    Handshaking,
    Active,
    Closed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::Handshaking => "handshaking",
            ChannelState::Active => "active",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-to-server registration traffic
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationMessage {
    /// Register or re-register the instance owned by this connection
    Register(InstanceInfo),
    Unregister,
    Heartbeat,
}

impl RegistrationMessage {
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationMessage::Register(_) => "Register",
            RegistrationMessage::Unregister => "Unregister",
            RegistrationMessage::Heartbeat => "Heartbeat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_display() {
        let info = InstanceInfo::builder("i-1").app("web").build().unwrap();
        assert_eq!(
            ReplicationMessage::RegisterCopy(info).to_string(),
            "RegisterCopy(i-1)"
        );
        assert_eq!(
            ReplicationMessage::UnregisterCopy { id: "i-2".into() }.to_string(),
            "UnregisterCopy(i-2)"
        );
        let hello = ReplicationMessage::Hello(ReplicationHello {
            sender_id: "a".into(),
            registry_size: 3,
        });
        assert_eq!(hello.to_string(), "Hello");
        assert!(hello.instance_id().is_none());
    }
}
