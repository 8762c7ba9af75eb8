//! Folder populate protocol: a folder's child command prints a JSON block
//! between markers; its `Hosts` replace the folder's dynamic children.

use crate::error::PopulateError;
use serde::Deserialize;
use tunneldeck_core::{TunnelConfig, TunnelNode, TunnelTree};
use uuid::Uuid;

pub const BEGIN_MARKER: &str = "BEGIN_DST_JSON_DATA";
pub const END_MARKER: &str = "END_DST_JSON_DATA";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulateData {
    pub hosts: Vec<TunnelConfig>,
    pub tooltip: Option<String>,
    /// Keep live children whose connection details did not change.
    pub keep_conn: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Payload {
    hosts: Option<Vec<TunnelConfig>>,
    tooltip: Option<String>,
    #[serde(default)]
    keep_conn: bool,
}

/// Extract the data block from a child command's combined output.
pub fn parse_output(output: &str) -> Result<PopulateData, PopulateError> {
    let start = output
        .find(BEGIN_MARKER)
        .ok_or(PopulateError::MissingMarkers)?
        + BEGIN_MARKER.len();
    let end = output[start..]
        .find(END_MARKER)
        .ok_or(PopulateError::MissingMarkers)?
        + start;

    let payload: Payload = serde_json::from_str(output[start..end].trim())
        .map_err(|e| PopulateError::InvalidJson(e.to_string()))?;
    let mut hosts = payload.hosts.ok_or(PopulateError::MissingHosts)?;
    for host in &mut hosts {
        host.dynamic = true;
        if host.name.trim().is_empty() {
            host.name = host.selected_ssh_host().to_string();
        }
    }

    Ok(PopulateData {
        hosts,
        tooltip: payload.tooltip,
        keep_conn: payload.keep_conn,
    })
}

/// How the folder's children change for one populate result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    /// Live children left untouched.
    pub keep: Vec<Uuid>,
    /// Children to disconnect and remove.
    pub remove: Vec<Uuid>,
    /// New children, in `Hosts` order.
    pub insert: Vec<TunnelConfig>,
}

/// Match the populate hosts against the folder's current dynamic children.
///
/// Children are matched by external id first, then by name. A replaced child
/// hands its UUID on to the new definition.
pub fn plan_merge(tree: &TunnelTree, folder: Uuid, data: &PopulateData) -> MergePlan {
    let mut existing: Vec<&TunnelNode> = tree
        .children(folder)
        .iter()
        .filter_map(|id| tree.get(*id))
        .filter(|n| n.config.dynamic)
        .collect();

    let mut plan = MergePlan::default();
    for host in &data.hosts {
        let old = find_match(&existing, host).map(|i| existing.remove(i));
        match old {
            Some(old)
                if data.keep_conn
                    && old.status.is_active()
                    && old.config.is_connection_details_equal(host) =>
            {
                plan.keep.push(old.id());
            }
            Some(old) => {
                plan.remove.push(old.id());
                let mut host = host.clone();
                host.uuid = old.id();
                plan.insert.push(host);
            }
            None => plan.insert.push(host.clone()),
        }
    }
    plan.remove.extend(existing.iter().map(|n| n.id()));
    plan
}

fn find_match(existing: &[&TunnelNode], host: &TunnelConfig) -> Option<usize> {
    let by_id = host
        .external_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .and_then(|id| {
            existing
                .iter()
                .position(|n| n.config.external_id.as_deref() == Some(id))
        });
    by_id.or_else(|| existing.iter().position(|n| n.config.name == host.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunneldeck_core::ConnectStatus;

    fn wrap(json: &str) -> String {
        format!("running discovery\n{}{}{}\nbye\n", BEGIN_MARKER, json, END_MARKER)
    }

    fn dynamic(name: &str, host: &str) -> TunnelConfig {
        let mut cfg = TunnelConfig::new_tunnel(name, host, 22);
        cfg.dynamic = true;
        cfg
    }

    #[test]
    fn test_parse_errors_are_distinct() {
        assert_eq!(parse_output("nothing here"), Err(PopulateError::MissingMarkers));
        assert_eq!(
            parse_output(&format!("{}{{}}", BEGIN_MARKER)),
            Err(PopulateError::MissingMarkers)
        );
        assert!(matches!(
            parse_output(&wrap("{not json")),
            Err(PopulateError::InvalidJson(_))
        ));
        assert_eq!(
            parse_output(&wrap(r#"{"Tooltip":"x"}"#)),
            Err(PopulateError::MissingHosts)
        );
    }

    #[test]
    fn test_parse_hosts() {
        let data = parse_output(&wrap(
            r#"{"Hosts":[{"Id":"i-1","Name":"web","SshHosts":["10.0.0.1"],"RemotePort":22},{"SshHosts":["10.0.0.2"]}],"Tooltip":"2 hosts","KeepConn":true}"#,
        ))
        .unwrap();
        assert_eq!(data.hosts.len(), 2);
        assert_eq!(data.hosts[0].external_id.as_deref(), Some("i-1"));
        assert_eq!(data.hosts[1].name, "10.0.0.2");
        assert!(data.hosts.iter().all(|h| h.dynamic && h.is_tunnel()));
        assert_eq!(data.tooltip.as_deref(), Some("2 hosts"));
        assert!(data.keep_conn);
    }

    #[test]
    fn test_empty_hosts_removes_dynamic_children() {
        let mut tree = TunnelTree::new();
        let folder = tree.insert(None, TunnelConfig::new_folder("aws")).unwrap();
        let a = tree.insert(Some(folder), dynamic("a", "h1")).unwrap();
        let b = tree.insert(Some(folder), dynamic("b", "h2")).unwrap();
        let manual = tree
            .insert(Some(folder), TunnelConfig::new_tunnel("manual", "h3", 22))
            .unwrap();

        let data = parse_output(&wrap(r#"{"Hosts":[]}"#)).unwrap();
        let plan = plan_merge(&tree, folder, &data);
        assert_eq!(plan.remove, vec![a, b]);
        assert!(plan.insert.is_empty());
        assert!(!plan.remove.contains(&manual));
    }

    #[test]
    fn test_keep_conn_keeps_live_equal_child() {
        let mut tree = TunnelTree::new();
        let folder = tree.insert(None, TunnelConfig::new_folder("aws")).unwrap();
        let mut web = dynamic("web", "10.0.0.1");
        web.external_id = Some("i-1".to_string());
        web.local_port = 50001;
        let web = tree.insert(Some(folder), web).unwrap();
        tree.get_mut(web).unwrap().status = ConnectStatus::Connected;

        // renamed but same id, different local port: still equal
        let mut incoming = dynamic("web-renamed", "10.0.0.1");
        incoming.external_id = Some("i-1".to_string());
        let mut data = PopulateData {
            hosts: vec![incoming],
            tooltip: None,
            keep_conn: true,
        };
        let plan = plan_merge(&tree, folder, &data);
        assert_eq!(plan.keep, vec![web]);
        assert!(plan.remove.is_empty());
        assert!(plan.insert.is_empty());

        data.keep_conn = false;
        let plan = plan_merge(&tree, folder, &data);
        assert_eq!(plan.remove, vec![web]);
        assert_eq!(plan.insert.len(), 1);
        assert_eq!(plan.insert[0].uuid, web);
    }

    #[test]
    fn test_changed_details_replace_by_name() {
        let mut tree = TunnelTree::new();
        let folder = tree.insert(None, TunnelConfig::new_folder("aws")).unwrap();
        let web = tree.insert(Some(folder), dynamic("web", "10.0.0.1")).unwrap();
        tree.get_mut(web).unwrap().status = ConnectStatus::Connected;

        let data = PopulateData {
            hosts: vec![dynamic("web", "10.0.0.9"), dynamic("db", "10.0.0.2")],
            tooltip: None,
            keep_conn: true,
        };
        let plan = plan_merge(&tree, folder, &data);
        assert!(plan.keep.is_empty());
        assert_eq!(plan.remove, vec![web]);
        assert_eq!(plan.insert.len(), 2);
        assert_eq!(plan.insert[0].uuid, web);
        assert_eq!(plan.insert[1].name, "db");
    }
}
