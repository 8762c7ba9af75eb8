use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ForwardKind {
    #[default]
    Local,
    Remote,
    Dynamic,
}

/// An additional forwarding spec attached to a tunnel beyond its primary port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct PortForward {
    pub enabled: bool,
    pub kind: ForwardKind,
    #[serde(rename = "LocalIP")]
    pub local_ip: String,
    pub local_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
}

impl Default for PortForward {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ForwardKind::Local,
            local_ip: String::new(),
            local_port: 0,
            destination_host: String::new(),
            destination_port: 0,
        }
    }
}

impl PortForward {
    pub fn new_local(local_port: u16, destination_host: &str, destination_port: u16) -> Self {
        Self {
            local_port,
            destination_host: destination_host.to_string(),
            destination_port,
            ..Self::default()
        }
    }

    pub fn new_remote(local_port: u16, destination_host: &str, destination_port: u16) -> Self {
        Self {
            kind: ForwardKind::Remote,
            ..Self::new_local(local_port, destination_host, destination_port)
        }
    }

    pub fn new_dynamic(local_port: u16) -> Self {
        Self {
            kind: ForwardKind::Dynamic,
            local_port,
            ..Self::default()
        }
    }

    /// The command-line flag selecting this forward's direction.
    pub fn flag(&self) -> &'static str {
        match self.kind {
            ForwardKind::Local => "-L",
            ForwardKind::Remote => "-R",
            ForwardKind::Dynamic => "-D",
        }
    }

    /// The `[ip:]port[:host:port]` argument following [`flag`](Self::flag).
    pub fn cli_spec(&self) -> String {
        let bind = if self.local_ip.trim().is_empty() {
            self.local_port.to_string()
        } else {
            format!("{}:{}", self.local_ip.trim(), self.local_port)
        };
        match self.kind {
            ForwardKind::Dynamic => bind,
            ForwardKind::Local | ForwardKind::Remote => {
                let host = if self.destination_host.trim().is_empty() {
                    "localhost"
                } else {
                    self.destination_host.trim()
                };
                format!("{}:{}:{}", bind, host, self.destination_port)
            }
        }
    }

    /// Whether the forward binds an address other hosts can reach.
    pub fn binds_non_loopback(&self) -> bool {
        is_non_loopback(&self.local_ip)
    }

    pub fn description(&self) -> String {
        match self.kind {
            ForwardKind::Local => format!(
                "L {}:{} -> {}:{}",
                display_ip(&self.local_ip),
                self.local_port,
                self.destination_host,
                self.destination_port
            ),
            ForwardKind::Remote => format!(
                "R remote:{} -> {}:{}",
                self.local_port, self.destination_host, self.destination_port
            ),
            ForwardKind::Dynamic => {
                format!("D SOCKS5 on {}:{}", display_ip(&self.local_ip), self.local_port)
            }
        }
    }
}

fn display_ip(ip: &str) -> &str {
    if ip.trim().is_empty() {
        "127.0.0.1"
    } else {
        ip.trim()
    }
}

pub(crate) fn is_non_loopback(ip: &str) -> bool {
    let ip = ip.trim();
    !(ip.is_empty() || ip == "localhost" || ip.starts_with("127.") || ip == "::1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_spec() {
        let fwd = PortForward::new_local(8080, "db.internal", 5432);
        assert_eq!(fwd.flag(), "-L");
        assert_eq!(fwd.cli_spec(), "8080:db.internal:5432");

        let mut fwd = PortForward::new_remote(9000, "", 80);
        fwd.local_ip = "0.0.0.0".to_string();
        assert_eq!(fwd.flag(), "-R");
        assert_eq!(fwd.cli_spec(), "0.0.0.0:9000:localhost:80");
        assert!(fwd.binds_non_loopback());

        let fwd = PortForward::new_dynamic(1080);
        assert_eq!(fwd.cli_spec(), "1080");
        assert!(!fwd.binds_non_loopback());
    }

    #[test]
    fn test_pascal_case_schema() {
        let json = r#"{"Enabled":false,"Kind":"Dynamic","LocalIP":"127.0.0.1","LocalPort":1080}"#;
        let fwd: PortForward = serde_json::from_str(json).unwrap();
        assert!(!fwd.enabled);
        assert_eq!(fwd.kind, ForwardKind::Dynamic);
        assert_eq!(fwd.local_port, 1080);
        assert_eq!(fwd.destination_port, 0);
    }
}
