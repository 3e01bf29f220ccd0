//! Container summaries
//!
//! The wire model pushed to dashboard clients, plus the mapping from the
//! docker CLI's `{{json .}}` rows to it.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Summary of one container as shown on the dashboard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerInfo {
    /// Full container ID
    pub id: String,
    /// Primary name, without the engine's leading slash
    pub name: String,
    /// Image reference
    pub image: String,
    /// Human-readable status ("Up 5 minutes")
    pub status: String,
    /// Machine state ("running", "exited", ...)
    pub state: String,
    /// Creation time, RFC 3339 in UTC when the engine's timestamp parses
    pub created: String,
    /// Published and exposed ports
    pub ports: Vec<PortInfo>,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Environment variables; the listing does not carry them
    pub environment: BTreeMap<String, String>,
    /// CPU usage in percent; not sampled by the listing
    pub cpu_usage: f64,
    /// Memory usage in bytes; not sampled by the listing
    pub memory_usage: i64,
}

/// A single port mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortInfo {
    /// Port inside the container
    pub private_port: u16,
    /// Port on the host (0 when not published)
    pub public_port: u16,
    /// Protocol ("tcp", "udp", "sctp")
    #[serde(rename = "type")]
    pub kind: String,
    /// Host address the port is bound to (empty when not published)
    pub ip: String,
}

/// One row of `docker ps --format '{{json .}}'`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DockerPsRow {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub names: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub labels: String,
}

impl From<DockerPsRow> for ContainerInfo {
    fn from(row: DockerPsRow) -> Self {
        let name = row
            .names
            .split(',')
            .next()
            .unwrap_or_default()
            .trim()
            .trim_start_matches('/')
            .to_string();

        ContainerInfo {
            id: row.id,
            name,
            image: row.image,
            status: row.status,
            state: row.state,
            created: normalize_created(&row.created_at),
            ports: parse_ports(&row.ports),
            labels: parse_labels(&row.labels),
            environment: BTreeMap::new(),
            cpu_usage: 0.0,
            memory_usage: 0,
        }
    }
}

/// Convert the CLI's `CreatedAt` (`2024-01-01 10:00:00 +0000 UTC`) to
/// RFC 3339 in UTC. Text that does not parse is passed through unchanged.
pub fn normalize_created(raw: &str) -> String {
    // The trailing zone abbreviation is redundant with the offset
    let stamp: Vec<&str> = raw.split_whitespace().take(3).collect();
    match DateTime::parse_from_str(&stamp.join(" "), "%Y-%m-%d %H:%M:%S%.f %z") {
        Ok(created) => created
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        Err(_) => raw.to_string(),
    }
}

/// Parse the docker CLI port column.
///
/// Entries look like `0.0.0.0:8080->80/tcp`, `:::8080->80/tcp`,
/// `[::]:8080->80/tcp` or `443/tcp`. Ranges keep their first port.
/// Entries that cannot be parsed are skipped.
pub fn parse_ports(raw: &str) -> Vec<PortInfo> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(parse_port_entry)
        .collect()
}

fn parse_port_entry(entry: &str) -> Option<PortInfo> {
    let (host, container) = match entry.split_once("->") {
        Some((host, container)) => (Some(host), container),
        None => (None, entry),
    };

    let (private, kind) = container.split_once('/').unwrap_or((container, "tcp"));
    let private_port = first_port(private)?;

    let (ip, public_port) = match host {
        Some(host) => {
            let (ip, port) = host.rsplit_once(':')?;
            let ip = ip.trim_start_matches('[').trim_end_matches(']');
            (ip.to_string(), first_port(port)?)
        }
        None => (String::new(), 0),
    };

    Some(PortInfo {
        private_port,
        public_port,
        kind: kind.to_string(),
        ip,
    })
}

fn first_port(raw: &str) -> Option<u16> {
    raw.split('-').next()?.trim().parse().ok()
}

/// Parse the docker CLI label column (`key=value,key2=value2`).
///
/// A segment without `=` belongs to the previous value, which had a comma in it.
pub fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut last_key: Option<String> = None;

    for segment in raw.split(',').filter(|s| !s.is_empty()) {
        match segment.split_once('=') {
            Some((key, value)) => {
                labels.insert(key.to_string(), value.to_string());
                last_key = Some(key.to_string());
            }
            None => {
                if let Some(value) = last_key.as_ref().and_then(|k| labels.get_mut(k)) {
                    value.push(',');
                    value.push_str(segment);
                }
            }
        }
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_published_port() {
        let ports = parse_ports("0.0.0.0:8080->80/tcp");
        assert_eq!(
            ports,
            vec![PortInfo {
                private_port: 80,
                public_port: 8080,
                kind: "tcp".to_string(),
                ip: "0.0.0.0".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_mixed_ports() {
        let ports = parse_ports("0.0.0.0:8080->80/tcp, :::8080->80/tcp, 443/tcp, [::]:53->53/udp");
        assert_eq!(ports.len(), 4);

        assert_eq!(ports[1].ip, "::");
        assert_eq!(ports[1].public_port, 8080);

        assert_eq!(ports[2].private_port, 443);
        assert_eq!(ports[2].public_port, 0);
        assert_eq!(ports[2].ip, "");

        assert_eq!(ports[3].ip, "::");
        assert_eq!(ports[3].kind, "udp");
    }

    #[test]
    fn test_parse_port_range_keeps_first() {
        let ports = parse_ports("0.0.0.0:8000-8001->8000-8001/tcp");
        assert_eq!(ports[0].private_port, 8000);
        assert_eq!(ports[0].public_port, 8000);
    }

    #[test]
    fn test_parse_ports_skips_garbage() {
        assert!(parse_ports("").is_empty());
        assert!(parse_ports("nonsense/tcp").is_empty());
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels("com.docker.compose.project=demo,tier=web");
        assert_eq!(labels.get("com.docker.compose.project").unwrap(), "demo");
        assert_eq!(labels.get("tier").unwrap(), "web");
        assert!(parse_labels("").is_empty());
    }

    #[test]
    fn test_parse_labels_value_with_comma() {
        let labels = parse_labels("hosts=a,b,owner=ops");
        assert_eq!(labels.get("hosts").unwrap(), "a,b");
        assert_eq!(labels.get("owner").unwrap(), "ops");
    }

    #[test]
    fn test_row_conversion() {
        let row: DockerPsRow = serde_json::from_str(
            r#"{"ID":"f00d","Names":"/api,api-alias","Image":"api:1","Status":"Exited (0) 1 hour ago","State":"exited","CreatedAt":"2024-01-01","Ports":"","Labels":"","Mounts":""}"#,
        )
        .unwrap();
        let info = ContainerInfo::from(row);

        assert_eq!(info.id, "f00d");
        assert_eq!(info.name, "api");
        assert_eq!(info.state, "exited");
        assert!(info.ports.is_empty());
        assert!(info.labels.is_empty());
        assert!(info.environment.is_empty());
        assert_eq!(info.cpu_usage, 0.0);
        assert_eq!(info.memory_usage, 0);
    }

    #[test]
    fn test_created_normalized_to_rfc3339() {
        assert_eq!(
            normalize_created("2024-01-01 10:00:00 +0000 UTC"),
            "2024-01-01T10:00:00Z"
        );
        assert_eq!(
            normalize_created("2024-06-30 23:30:00 +0200 CEST"),
            "2024-06-30T21:30:00Z"
        );
        assert_eq!(normalize_created("yesterday"), "yesterday");
        assert_eq!(normalize_created(""), "");
    }
}
