//! Port engine facade used by handlers and the deployment pipeline

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use openapi_server::models::{
    AllocateRequest, AllocateResponse, PortQueryResponse, PortRange,
};

use crate::errors::PanelError;
use crate::ports::allocate::plan_segments;
use crate::ports::query::{run_query, PortQuery, PortQueryParams};
use crate::ports::usage::{gather_usage, SocketTable, UsageTable};
use crate::ports::{PortReservation, PortType, Protocol};
use crate::runtime::ContainerRuntime;
use crate::storage::ledger::PortLedger;

/// Allocation window options
#[derive(Debug, Clone)]
pub struct Options {
    pub alloc_start: u16,
    pub alloc_end: u16,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            alloc_start: 55500,
            alloc_end: 56000,
        }
    }
}

pub struct PortEngine {
    options: Options,
    ledger: Arc<PortLedger>,
    sockets: Arc<dyn SocketTable>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl PortEngine {
    pub fn new(
        options: Options,
        ledger: Arc<PortLedger>,
        sockets: Arc<dyn SocketTable>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            options,
            ledger,
            sockets,
            runtime,
        }
    }

    pub fn ledger(&self) -> &Arc<PortLedger> {
        &self.ledger
    }

    /// Live usage snapshot
    pub async fn gather_usage(&self) -> UsageTable {
        gather_usage(self.sockets.as_ref(), self.runtime.as_ref()).await
    }

    pub async fn query(&self, params: PortQueryParams) -> Result<PortQueryResponse, PanelError> {
        let range = self.ledger.range()?;
        let query = PortQuery::from_params(params, &range)?;
        let notes = self.ledger.notes()?;
        let table = self.gather_usage().await;
        Ok(run_query(&table, &notes, &query))
    }

    pub fn range(&self) -> Result<PortRange, PanelError> {
        self.ledger.range()
    }

    pub fn set_range(&self, range: PortRange) -> Result<PortRange, PanelError> {
        if range.start > range.end {
            return Err(PanelError::ValidationError(format!(
                "invalid port range {}-{}",
                range.start, range.end
            )));
        }
        let protocol = match range.protocol.trim().to_uppercase().as_str() {
            "" | "ALL" | "TCP+UDP" => "TCP+UDP".to_string(),
            other => other
                .parse::<Protocol>()
                .map_err(PanelError::ValidationError)?
                .as_str()
                .to_string(),
        };
        let range = PortRange { protocol, ..range };
        self.ledger.set_range(&range)?;
        Ok(range)
    }

    pub fn set_note(
        &self,
        port: u16,
        port_type: &str,
        protocol: &str,
        note: &str,
    ) -> Result<(), PanelError> {
        let protocol = if protocol.trim().is_empty() {
            Protocol::Tcp
        } else {
            protocol.parse().map_err(PanelError::ValidationError)?
        };
        let port_type = match port_type.trim() {
            "" => String::new(),
            t => t.parse::<PortType>()
                .map_err(PanelError::ValidationError)?
                .as_str()
                .to_string(),
        };
        self.ledger.set_note(port, &port_type, protocol.as_str(), note)
    }

    /// Find (and unless dry-running, reserve) one contiguous run per requested count
    pub async fn allocate(&self, req: AllocateRequest) -> Result<AllocateResponse, PanelError> {
        let counts: Vec<i64> = if req.counts.is_empty() {
            vec![req.count]
        } else {
            req.counts.clone()
        };
        if counts.iter().any(|c| *c <= 0) {
            return Err(PanelError::ValidationError(
                "port counts must be positive".to_string(),
            ));
        }
        let counts: Vec<usize> = counts.into_iter().map(|c| c as usize).collect();

        let protocol = match req.protocol.trim().to_lowercase().as_str() {
            "" | "all" | "tcp+udp" => Protocol::Tcp,
            other => other.parse().map_err(PanelError::ValidationError)?,
        };
        let port_type = match req.port_type.trim() {
            "" => PortType::Host,
            t => t.parse().map_err(PanelError::ValidationError)?,
        };
        let reserved_by = match req.reserved_by.trim() {
            "" => "deploy".to_string(),
            owner => owner.to_string(),
        };

        let (start, end) = if req.use_alloc_range {
            (self.options.alloc_start, self.options.alloc_end.max(self.options.alloc_start))
        } else {
            let range = self.ledger.range()?;
            (range.start, range.end)
        };
        // port 0 is never handed out
        let start = start.max(1);
        if start > end {
            return Err(PanelError::ValidationError(format!(
                "invalid port range {}-{}",
                start, end
            )));
        }

        let table = self.gather_usage().await;
        let mut used: HashSet<u16> = (start..=end)
            .filter(|p| table.get(protocol, *p).used)
            .collect();
        used.extend(self.ledger.reservations()?.into_iter().map(|r| r.port));

        let segments = plan_segments(&mut used, start, end, &counts)?;

        if !req.dry_run {
            let now = Utc::now();
            let reservations: Vec<PortReservation> = segments
                .iter()
                .flatten()
                .map(|port| PortReservation {
                    port: *port,
                    reserved_by: reserved_by.clone(),
                    protocol: protocol.as_str().to_string(),
                    port_type: port_type.as_str().to_string(),
                    reserved_at: now,
                })
                .collect();
            self.ledger.reserve(&reservations)?;
            info!(
                "Reserved {} port(s) in {} segment(s) for {}",
                reservations.len(),
                segments.len(),
                reserved_by
            );
        }

        Ok(AllocateResponse {
            segments,
            protocol: protocol.as_str().to_string(),
            port_type: port_type.as_str().to_string(),
            reserved_by,
            dry_run: req.dry_run,
            range_start: start,
            range_end: end,
        })
    }
}
