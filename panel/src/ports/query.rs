//! Filtered, run-length merged port listings

use std::collections::HashMap;

use serde::Deserialize;

use openapi_server::models::{PortQueryResponse, PortRange, PortRecord};

use crate::errors::PanelError;
use crate::ports::usage::UsageTable;
use crate::ports::{PortType, Protocol};
use crate::storage::ledger::NoteKey;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 1000;

/// Raw query string of `GET /api/ports`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortQueryParams {
    pub start: Option<u16>,
    pub end: Option<u16>,
    pub protocol: Option<String>,
    #[serde(rename = "type")]
    pub port_type: Option<String>,
    pub used: Option<String>,
    pub port: Option<u16>,
    pub search: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsedFilter {
    All,
    Used,
    Free,
}

/// Validated port query
#[derive(Debug, Clone)]
pub struct PortQuery {
    pub start: u16,
    pub end: u16,
    pub protocols: Vec<Protocol>,
    pub port_type: Option<PortType>,
    pub used: UsedFilter,
    pub exact_port: Option<u16>,
    pub search: String,
    pub page: usize,
    pub page_size: usize,
}

fn parse_protocols(value: &str) -> Result<Vec<Protocol>, PanelError> {
    match value.trim().to_lowercase().as_str() {
        "" | "all" | "both" | "tcp+udp" => Ok(vec![Protocol::Tcp, Protocol::Udp]),
        other => other
            .parse::<Protocol>()
            .map(|p| vec![p])
            .map_err(PanelError::ValidationError),
    }
}

impl PortQuery {
    /// Fill unset bounds and protocol from the stored scan window
    pub fn from_params(params: PortQueryParams, range: &PortRange) -> Result<Self, PanelError> {
        let start = params.start.unwrap_or(range.start);
        let end = params.end.unwrap_or(range.end);
        if start > end {
            return Err(PanelError::ValidationError(format!(
                "invalid port range {}-{}",
                start, end
            )));
        }

        let protocols = match params.protocol.as_deref() {
            Some(p) => parse_protocols(p)?,
            None => parse_protocols(&range.protocol)?,
        };

        let port_type = match params.port_type.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(t) if t.eq_ignore_ascii_case("all") => None,
            Some(t) => Some(t.parse::<PortType>().map_err(PanelError::ValidationError)?),
        };

        let used = match params.used.as_deref().map(|u| u.trim().to_lowercase()) {
            None => UsedFilter::All,
            Some(u) => match u.as_str() {
                "" | "all" => UsedFilter::All,
                "used" | "true" => UsedFilter::Used,
                "free" | "unused" | "available" | "false" => UsedFilter::Free,
                other => {
                    return Err(PanelError::ValidationError(format!(
                        "invalid used filter: {}",
                        other
                    )))
                }
            },
        };

        Ok(Self {
            start,
            end,
            protocols,
            port_type,
            used,
            exact_port: params.port,
            search: params.search.unwrap_or_default().trim().to_lowercase(),
            page: params.page.unwrap_or(1).max(1),
            page_size: params
                .page_size
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
        })
    }

    fn protocol_label(&self) -> String {
        self.protocols
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }

    fn matches(&self, record: &PortRecord) -> bool {
        match self.used {
            UsedFilter::Used if !record.used => return false,
            UsedFilter::Free if record.used => return false,
            _ => {}
        }
        // an unused port never matches a concrete type
        if let Some(port_type) = self.port_type {
            if !record.used || record.port_type != port_type.as_str() {
                return false;
            }
        }
        if !self.search.is_empty() {
            let hit = record.port.to_string() == self.search
                || record.service.to_lowercase().contains(&self.search)
                || record.note.to_lowercase().contains(&self.search);
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Build the display record for one port
pub fn port_record(
    port: u16,
    protocol: Protocol,
    table: &UsageTable,
    notes: &HashMap<NoteKey, String>,
) -> PortRecord {
    let usage = table.get(protocol, port);
    let port_type = match (usage.used, usage.port_type) {
        (true, Some(t)) => t.as_str().to_string(),
        (true, None) => PortType::Host.as_str().to_string(),
        (false, _) => String::new(),
    };
    let note = notes
        .get(&(port, port_type.clone(), protocol.as_str().to_string()))
        .cloned()
        .unwrap_or_default();
    PortRecord {
        port,
        end_port: port,
        port_type,
        protocol: protocol.as_str().to_string(),
        used: usage.used,
        note,
        service: usage.service.clone(),
    }
}

/// Extend the last record when `record` continues it with identical
/// attributes, otherwise start a new one
pub fn append_or_merge(items: &mut Vec<PortRecord>, record: PortRecord) {
    if let Some(last) = items.last_mut() {
        let adjacent = u32::from(last.end_port) + 1 == u32::from(record.port);
        if adjacent
            && last.used == record.used
            && last.port_type == record.port_type
            && last.service == record.service
            && last.protocol == record.protocol
            && last.note == record.note
        {
            last.end_port = record.end_port;
            return;
        }
    }
    items.push(record);
}

/// Run a query against a usage snapshot
pub fn run_query(
    table: &UsageTable,
    notes: &HashMap<NoteKey, String>,
    query: &PortQuery,
) -> PortQueryResponse {
    let mut items = Vec::new();
    let mut used = 0;
    let mut available = 0;

    for &protocol in &query.protocols {
        for port in query.start..=query.end {
            if let Some(exact) = query.exact_port {
                if port != exact {
                    continue;
                }
            }
            let record = port_record(port, protocol, table, notes);
            if record.used {
                used += 1;
            } else {
                available += 1;
            }
            if query.matches(&record) {
                append_or_merge(&mut items, record);
            }
        }
    }

    let total = items.len();
    let page_items = items
        .into_iter()
        .skip((query.page - 1).saturating_mul(query.page_size))
        .take(query.page_size)
        .collect();

    PortQueryResponse {
        items: page_items,
        total,
        used,
        available,
        range_start: query.start,
        range_end: query.end,
        protocol_filter: query.protocol_label(),
        type_filter: query
            .port_type
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "all".to_string()),
        page: query.page,
        page_size: query.page_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::usage::ListeningSocket;
    use crate::runtime::{ContainerInfo, PublishedPort};

    fn record(port: u16, used: bool, port_type: &str, service: &str) -> PortRecord {
        PortRecord {
            port,
            end_port: port,
            port_type: port_type.to_string(),
            protocol: "TCP".to_string(),
            used,
            note: String::new(),
            service: service.to_string(),
        }
    }

    #[test]
    fn test_append_or_merge() {
        let mut items = Vec::new();
        append_or_merge(&mut items, record(80, true, "Host", "http"));
        append_or_merge(&mut items, record(81, true, "Host", "http"));
        append_or_merge(&mut items, record(82, false, "", ""));
        append_or_merge(&mut items, record(83, true, "Container", "http"));

        assert_eq!(items.len(), 3);
        assert_eq!((items[0].port, items[0].end_port), (80, 81));
        assert_eq!((items[1].port, items[1].end_port), (82, 82));
        assert_eq!((items[2].port, items[2].end_port), (83, 83));
    }

    #[test]
    fn test_merge_requires_adjacency() {
        let mut items = Vec::new();
        append_or_merge(&mut items, record(80, true, "Host", "http"));
        append_or_merge(&mut items, record(82, true, "Host", "http"));
        assert_eq!(items.len(), 2);
    }

    fn sample_table() -> UsageTable {
        let sockets = vec![
            ListeningSocket {
                protocol: Protocol::Tcp,
                port: 100,
                process: "nginx".to_string(),
            },
            ListeningSocket {
                protocol: Protocol::Tcp,
                port: 101,
                process: "nginx".to_string(),
            },
        ];
        let containers = vec![ContainerInfo {
            name: "db".to_string(),
            ports: vec![PublishedPort {
                host_ip: "0.0.0.0".to_string(),
                host_port: 105,
                container_port: 5432,
                protocol: "tcp".to_string(),
            }],
            ..Default::default()
        }];
        UsageTable::build(&sockets, &containers)
    }

    fn params(start: u16, end: u16) -> PortQueryParams {
        PortQueryParams {
            start: Some(start),
            end: Some(end),
            protocol: Some("tcp".to_string()),
            ..Default::default()
        }
    }

    fn full_range() -> PortRange {
        PortRange {
            start: 0,
            end: 65535,
            protocol: "TCP+UDP".to_string(),
        }
    }

    #[test]
    fn test_query_merges_and_counts() {
        let table = sample_table();
        let query = PortQuery::from_params(params(100, 109), &full_range()).unwrap();
        let resp = run_query(&table, &HashMap::new(), &query);

        // 100-101 nginx, 102-104 free, 105 db, 106-109 free
        assert_eq!(resp.total, 4);
        assert_eq!(resp.used, 3);
        assert_eq!(resp.available, 7);
        assert_eq!((resp.items[0].port, resp.items[0].end_port), (100, 101));
        assert_eq!(resp.items[2].service, "db");
    }

    #[test]
    fn test_type_filter_excludes_unused() {
        let table = sample_table();
        let mut p = params(100, 109);
        p.port_type = Some("container".to_string());
        p.used = Some("all".to_string());
        let query = PortQuery::from_params(p, &full_range()).unwrap();
        let resp = run_query(&table, &HashMap::new(), &query);

        assert_eq!(resp.total, 1);
        assert!(resp.items.iter().all(|r| r.used && r.port_type == "Container"));
    }

    #[test]
    fn test_notes_split_runs() {
        let table = sample_table();
        let mut notes = HashMap::new();
        notes.insert((101, "Host".to_string(), "TCP".to_string()), "admin".to_string());
        let query = PortQuery::from_params(params(100, 101), &full_range()).unwrap();
        let resp = run_query(&table, &notes, &query);
        assert_eq!(resp.total, 2);
        assert_eq!(resp.items[1].note, "admin");
    }

    #[test]
    fn test_pagination_and_exact_port() {
        let table = sample_table();
        let mut p = params(100, 109);
        p.page = Some(2);
        p.page_size = Some(3);
        let query = PortQuery::from_params(p, &full_range()).unwrap();
        let resp = run_query(&table, &HashMap::new(), &query);
        assert_eq!(resp.total, 4);
        assert_eq!(resp.items.len(), 1);

        let mut p = params(0, 65535);
        p.port = Some(105);
        let query = PortQuery::from_params(p, &full_range()).unwrap();
        let resp = run_query(&table, &HashMap::new(), &query);
        assert_eq!(resp.total, 1);
        assert_eq!(resp.items[0].service, "db");
    }

    #[test]
    fn test_invalid_params() {
        assert!(PortQuery::from_params(params(10, 5), &full_range()).is_err());
        let mut p = params(1, 5);
        p.port_type = Some("vm".to_string());
        assert!(PortQuery::from_params(p, &full_range()).is_err());
    }
}
