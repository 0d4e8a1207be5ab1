//! Relational store for port settings, notes and reservations

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use openapi_server::models::PortRange;

use crate::errors::PanelError;
use crate::ports::PortReservation;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS port_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    range_start INTEGER NOT NULL,
    range_end INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS port_notes (
    port INTEGER NOT NULL,
    type TEXT NOT NULL,
    protocol TEXT NOT NULL,
    note TEXT NOT NULL,
    PRIMARY KEY (port, type, protocol)
);
CREATE TABLE IF NOT EXISTS port_reservations (
    port INTEGER PRIMARY KEY,
    reserved_by TEXT NOT NULL,
    protocol TEXT NOT NULL,
    type TEXT NOT NULL,
    reserved_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_port_reservations_owner ON port_reservations (reserved_by);
";

/// `(port, type, protocol)` key of a port note
pub type NoteKey = (u16, String, String);

/// Port bookkeeping backed by SQLite.
///
/// Statements are short and local, so a plain mutex around one connection is
/// enough.
pub struct PortLedger {
    conn: Mutex<Connection>,
}

impl PortLedger {
    /// Open (and migrate) the ledger at `path`
    pub fn open(path: &Path) -> Result<Self, PanelError> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// Ledger that lives only as long as the value
    pub fn open_in_memory() -> Result<Self, PanelError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PanelError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Configured scan window, the full port space when never set
    pub fn range(&self) -> Result<PortRange, PanelError> {
        let conn = self.lock();
        let range = conn
            .query_row(
                "SELECT range_start, range_end, protocol FROM port_settings WHERE id = 1",
                [],
                |row| {
                    Ok(PortRange {
                        start: row.get(0)?,
                        end: row.get(1)?,
                        protocol: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(range.unwrap_or(PortRange {
            start: 0,
            end: u16::MAX,
            protocol: "TCP+UDP".to_string(),
        }))
    }

    pub fn set_range(&self, range: &PortRange) -> Result<(), PanelError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO port_settings (id, range_start, range_end, protocol, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                range_start = excluded.range_start,
                range_end = excluded.range_end,
                protocol = excluded.protocol,
                updated_at = excluded.updated_at",
            params![range.start, range.end, range.protocol, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn notes(&self) -> Result<HashMap<NoteKey, String>, PanelError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT port, type, protocol, note FROM port_notes")?;
        let rows = stmt.query_map([], |row| {
            Ok(((row.get(0)?, row.get(1)?, row.get(2)?), row.get(3)?))
        })?;
        let notes = rows.collect::<Result<HashMap<NoteKey, String>, _>>()?;
        Ok(notes)
    }

    /// Upsert a note; an empty note removes it
    pub fn set_note(
        &self,
        port: u16,
        port_type: &str,
        protocol: &str,
        note: &str,
    ) -> Result<(), PanelError> {
        let conn = self.lock();
        if note.trim().is_empty() {
            conn.execute(
                "DELETE FROM port_notes WHERE port = ?1 AND type = ?2 AND protocol = ?3",
                params![port, port_type, protocol],
            )?;
            return Ok(());
        }
        conn.execute(
            "INSERT INTO port_notes (port, type, protocol, note) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(port, type, protocol) DO UPDATE SET note = excluded.note",
            params![port, port_type, protocol, note],
        )?;
        Ok(())
    }

    pub fn reservations(&self) -> Result<Vec<PortReservation>, PanelError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT port, reserved_by, protocol, type, reserved_at
             FROM port_reservations ORDER BY port",
        )?;
        let rows = stmt.query_map([], |row| {
            let reserved_at: String = row.get(4)?;
            Ok(PortReservation {
                port: row.get(0)?,
                reserved_by: row.get(1)?,
                protocol: row.get(2)?,
                port_type: row.get(3)?,
                reserved_at: DateTime::parse_from_rfc3339(&reserved_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            })
        })?;
        let reservations = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(reservations)
    }

    /// Reserve every port or none.
    ///
    /// Re-reserving a port for the owner already holding it refreshes the
    /// record; a port held by another owner fails the whole batch.
    pub fn reserve(&self, reservations: &[PortReservation]) -> Result<(), PanelError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        insert_reservations(&tx, reservations, ForeignOwner::Fail)?;
        tx.commit()?;
        debug!("Reserved {} port(s)", reservations.len());
        Ok(())
    }

    /// Drop every reservation of `owner` (and its `owner/...` children) and
    /// record `reservations` in their place, in one transaction. Ports held by
    /// another owner are left to it and returned.
    pub fn replace_owner(
        &self,
        owner: &str,
        reservations: &[PortReservation],
    ) -> Result<Vec<u16>, PanelError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(RELEASE_OWNER_SQL, params![owner])?;
        let skipped = insert_reservations(&tx, reservations, ForeignOwner::Skip)?;
        tx.commit()?;
        debug!(
            "Replaced reservations of {} with {} port(s), {} held elsewhere",
            owner,
            reservations.len() - skipped.len(),
            skipped.len()
        );
        Ok(skipped)
    }

    pub fn release_owner(&self, owner: &str) -> Result<usize, PanelError> {
        let conn = self.lock();
        let removed = conn.execute(RELEASE_OWNER_SQL, params![owner])?;
        Ok(removed)
    }
}

const RELEASE_OWNER_SQL: &str = "DELETE FROM port_reservations
     WHERE reserved_by = ?1 OR substr(reserved_by, 1, length(?1) + 1) = ?1 || '/'";

/// Handling of a port already reserved by a different owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForeignOwner {
    /// Fail the whole batch (dropping the transaction rolls back)
    Fail,
    /// Leave the port to its owner and carry on
    Skip,
}

/// Insert or refresh reservations, returning the ports skipped for being
/// held by another owner
fn insert_reservations(
    tx: &rusqlite::Transaction<'_>,
    reservations: &[PortReservation],
    foreign: ForeignOwner,
) -> Result<Vec<u16>, PanelError> {
    let mut skipped = Vec::new();
    for r in reservations {
        let changed = tx.execute(
            "INSERT INTO port_reservations (port, reserved_by, protocol, type, reserved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(port) DO UPDATE SET
                protocol = excluded.protocol,
                type = excluded.type,
                reserved_at = excluded.reserved_at
             WHERE port_reservations.reserved_by = excluded.reserved_by",
            params![
                r.port,
                r.reserved_by,
                r.protocol,
                r.port_type,
                r.reserved_at.to_rfc3339()
            ],
        )?;
        if changed == 0 {
            match foreign {
                ForeignOwner::Fail => {
                    return Err(PanelError::Conflict(format!(
                        "port {} is already reserved",
                        r.port
                    )))
                }
                ForeignOwner::Skip => skipped.push(r.port),
            }
        }
    }
    Ok(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(port: u16, owner: &str) -> PortReservation {
        PortReservation {
            port,
            reserved_by: owner.to_string(),
            protocol: "TCP".to_string(),
            port_type: "Host".to_string(),
            reserved_at: Utc::now(),
        }
    }

    #[test]
    fn test_default_range() {
        let ledger = PortLedger::open_in_memory().unwrap();
        let range = ledger.range().unwrap();
        assert_eq!((range.start, range.end), (0, 65535));

        let custom = PortRange {
            start: 1000,
            end: 2000,
            protocol: "TCP".to_string(),
        };
        ledger.set_range(&custom).unwrap();
        assert_eq!(ledger.range().unwrap(), custom);
    }

    #[test]
    fn test_notes_upsert_and_delete() {
        let ledger = PortLedger::open_in_memory().unwrap();
        ledger.set_note(80, "Host", "TCP", "web").unwrap();
        ledger.set_note(80, "Host", "TCP", "nginx").unwrap();
        let notes = ledger.notes().unwrap();
        assert_eq!(notes.get(&(80, "Host".to_string(), "TCP".to_string())).unwrap(), "nginx");

        ledger.set_note(80, "Host", "TCP", "").unwrap();
        assert!(ledger.notes().unwrap().is_empty());
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let ledger = PortLedger::open_in_memory().unwrap();
        ledger.reserve(&[reservation(100, "a")]).unwrap();

        let err = ledger
            .reserve(&[reservation(101, "b"), reservation(100, "b")])
            .unwrap_err();
        assert!(matches!(err, PanelError::Conflict(_)));
        let ports: Vec<u16> = ledger.reservations().unwrap().iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![100]);

        // same owner may refresh
        ledger.reserve(&[reservation(100, "a")]).unwrap();
    }

    #[test]
    fn test_release_owner_matches_children() {
        let ledger = PortLedger::open_in_memory().unwrap();
        ledger
            .reserve(&[
                reservation(1, "shop"),
                reservation(2, "shop/web"),
                reservation(3, "shopping"),
            ])
            .unwrap();
        assert_eq!(ledger.release_owner("shop").unwrap(), 2);
        let left: Vec<u16> = ledger.reservations().unwrap().iter().map(|r| r.port).collect();
        assert_eq!(left, vec![3]);
    }

    #[test]
    fn test_replace_owner() {
        let ledger = PortLedger::open_in_memory().unwrap();
        ledger
            .reserve(&[reservation(10, "shop"), reservation(11, "shop/web"), reservation(20, "blog")])
            .unwrap();

        let skipped = ledger
            .replace_owner("shop", &[reservation(12, "shop/web")])
            .unwrap();
        assert!(skipped.is_empty());
        let ports: Vec<u16> = ledger.reservations().unwrap().iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![12, 20]);
    }

    #[test]
    fn test_replace_owner_skips_foreign_ports() {
        let ledger = PortLedger::open_in_memory().unwrap();
        ledger.reserve(&[reservation(20, "deploy")]).unwrap();

        let skipped = ledger
            .replace_owner("shop", &[reservation(20, "shop"), reservation(21, "shop/web")])
            .unwrap();
        assert_eq!(skipped, vec![20]);

        let owners: Vec<(u16, String)> = ledger
            .reservations()
            .unwrap()
            .into_iter()
            .map(|r| (r.port, r.reserved_by))
            .collect();
        assert_eq!(
            owners,
            vec![(20, "deploy".to_string()), (21, "shop/web".to_string())]
        );
    }

    #[test]
    fn test_reservation_covers_every_protocol() {
        let ledger = PortLedger::open_in_memory().unwrap();
        let mut udp = reservation(53, "dns");
        udp.protocol = "UDP".to_string();
        ledger.reserve(&[udp]).unwrap();

        let err = ledger.reserve(&[reservation(53, "web")]).unwrap_err();
        assert!(matches!(err, PanelError::Conflict(_)));
    }
}
