use crate::models::log::LogBuffer;
use crate::models::port_forward::PortForward;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeKind {
    #[default]
    Tunnel,
    Folder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectStatus {
    #[default]
    Disconnected,
    MarkedForConnect,
    Connecting,
    Connected,
}

impl ConnectStatus {
    /// Connecting or Connected: the node holds (or is about to hold) its ports.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::MarkedForConnect => "queued",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Persisted configuration of a tree node.
///
/// Keys are PascalCase on disk; the same names are accepted in the `Hosts`
/// objects produced by folder populate commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct TunnelConfig {
    pub uuid: Uuid,
    /// Identifier assigned by an external discovery command.
    #[serde(rename = "Id", skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub name: String,
    pub kind: NodeKind,
    pub ssh_hosts: Vec<String>,
    pub selected_ssh_host: usize,
    pub remote_hosts: Vec<String>,
    pub selected_remote_host: usize,
    pub username: String,
    pub password: String,
    pub key_file: String,
    pub key_passphrase: String,
    #[serde(rename = "LocalIP")]
    pub local_ip: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub ssh_protocol: u8,
    pub compression: bool,
    pub extra_args: String,
    pub port_forwards: Vec<PortForward>,
    pub auto_reconnect: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tooltip: String,
    /// Folder only: command whose output populates the folder's children.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub child_command: String,
    /// Created by a populate run rather than by the user.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dynamic: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            external_id: None,
            name: String::new(),
            kind: NodeKind::Tunnel,
            ssh_hosts: Vec::new(),
            selected_ssh_host: 0,
            remote_hosts: Vec::new(),
            selected_remote_host: 0,
            username: String::new(),
            password: String::new(),
            key_file: String::new(),
            key_passphrase: String::new(),
            local_ip: String::new(),
            local_port: 0,
            remote_port: 0,
            ssh_protocol: 2,
            compression: false,
            extra_args: String::new(),
            port_forwards: Vec::new(),
            auto_reconnect: true,
            tooltip: String::new(),
            child_command: String::new(),
            dynamic: false,
        }
    }
}

impl TunnelConfig {
    pub fn new_tunnel(name: &str, ssh_host: &str, remote_port: u16) -> Self {
        Self {
            name: name.to_string(),
            ssh_hosts: vec![ssh_host.to_string()],
            remote_port,
            ..Self::default()
        }
    }

    pub fn new_folder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: NodeKind::Folder,
            ..Self::default()
        }
    }

    pub fn is_tunnel(&self) -> bool {
        self.kind == NodeKind::Tunnel
    }

    /// The selected SSH host entry, falling back to the first one.
    pub fn selected_ssh_host(&self) -> &str {
        pick(&self.ssh_hosts, self.selected_ssh_host)
    }

    /// The selected remote host entry, falling back to the first one.
    pub fn selected_remote_host(&self) -> &str {
        pick(&self.remote_hosts, self.selected_remote_host)
    }

    /// Every local port this tunnel binds: the primary port plus each enabled forward.
    /// Zero (unassigned) ports are skipped.
    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(1 + self.port_forwards.len());
        if self.is_tunnel() && self.local_port != 0 {
            ports.push(self.local_port);
        }
        ports.extend(
            self.port_forwards
                .iter()
                .filter(|f| f.enabled && f.local_port != 0)
                .map(|f| f.local_port),
        );
        ports
    }

    /// Compares everything that affects the spawned command except the local port.
    pub fn is_connection_details_equal(&self, other: &TunnelConfig) -> bool {
        self.selected_ssh_host() == other.selected_ssh_host()
            && self.selected_remote_host() == other.selected_remote_host()
            && self.username == other.username
            && self.password == other.password
            && self.key_file == other.key_file
            && self.key_passphrase == other.key_passphrase
            && self.local_ip == other.local_ip
            && self.remote_port == other.remote_port
            && self.ssh_protocol == other.ssh_protocol
            && self.compression == other.compression
            && self.extra_args == other.extra_args
            && self.port_forwards == other.port_forwards
    }
}

fn pick(list: &[String], selected: usize) -> &str {
    list.get(selected)
        .or_else(|| list.first())
        .map(|s| s.trim())
        .unwrap_or("")
}

/// Split `host[:port]` (or `[v6]:port`) into its parts.
pub fn split_host_port(entry: &str) -> (String, Option<u16>) {
    let entry = entry.trim();
    if let Some(rest) = entry.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    match entry.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(p) => (host.to_string(), Some(p)),
            Err(_) => (entry.to_string(), None),
        },
        _ => (entry.to_string(), None),
    }
}

/// Runtime counters for the prompts a connection attempt may answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptCounters {
    pub password: u32,
    pub key_passphrase: u32,
    pub challenge_response: u32,
}

impl PromptCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A node of the tunnel tree: persisted configuration plus runtime state.
#[derive(Debug, Clone)]
pub struct TunnelNode {
    pub config: TunnelConfig,
    pub parent: Option<Uuid>,
    pub children: Vec<Uuid>,
    pub status: ConnectStatus,
    pub retry_count: u32,
    pub should_reconnect: bool,
    /// Set by a direct connect: spawn without waiting for the parent chain.
    pub skip_parent_chain: bool,
    pub prompt_counters: PromptCounters,
    pub log: LogBuffer,
}

impl TunnelNode {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            parent: None,
            children: Vec::new(),
            status: ConnectStatus::Disconnected,
            retry_count: 0,
            should_reconnect: false,
            skip_parent_chain: false,
            prompt_counters: PromptCounters::default(),
            log: LogBuffer::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.config.uuid
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_tunnel(&self) -> bool {
        self.config.is_tunnel()
    }
}
