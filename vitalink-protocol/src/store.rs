//! Paired-device storage
//!
//! Persisted registry of devices that completed pairing. Rows hold only the
//! SHA-256 hash of each bearer token; raw tokens and pairing codes never
//! reach the database. Devices are soft-deactivated rather than deleted so
//! the audit trail survives revocation, and every read path filters on
//! active status.

use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// A paired device as persisted in the registry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    /// Unique device identifier (UUID)
    pub id: String,

    /// Pseudonymous label derived from the client-supplied name,
    /// never the raw name itself
    pub anonymized_name: String,

    /// SHA-256 hex of the bearer token; the raw token is never stored
    #[serde(skip_serializing)]
    pub token_hash: String,

    /// When pairing completed
    pub created_at: DateTime<Utc>,

    /// When the bearer token stops validating
    pub expires_at: DateTime<Utc>,

    /// Last successful token validation
    pub last_seen_at: DateTime<Utc>,

    /// False once revoked; rows are never physically deleted
    pub is_active: bool,
}

/// Storage seam for the paired-device registry
///
/// The server treats the store as an external resource with its own
/// transactional layer; implementations must persist on write.
pub trait DeviceStore: Send {
    /// Insert a newly paired device
    fn insert(&mut self, device: &PairedDevice) -> Result<()>;

    /// Find an active device by token hash
    ///
    /// Inactive rows are invisible to this lookup by design.
    fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<PairedDevice>>;

    /// Update `last_seen_at` after a successful validation
    fn touch_last_seen(&mut self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Soft-deactivate a single device; returns whether a row changed
    fn deactivate(&mut self, id: &str) -> Result<bool>;

    /// Soft-deactivate every active device; returns how many changed
    fn deactivate_all(&mut self) -> Result<usize>;

    /// All devices, active and revoked, newest first
    fn list(&self) -> Result<Vec<PairedDevice>>;
}

/// SQLite-backed device store
pub struct SqliteDeviceStore {
    conn: Connection,
}

impl SqliteDeviceStore {
    /// Open or create the registry database at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// Build a store over an existing connection (`:memory:` in tests)
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS paired_devices (
                id TEXT PRIMARY KEY,
                anonymized_name TEXT NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );",
        )?;
        Ok(Self { conn })
    }

    /// In-memory store for tests
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRow> {
        Ok(DeviceRow {
            id: row.get(0)?,
            anonymized_name: row.get(1)?,
            token_hash: row.get(2)?,
            created_at: row.get(3)?,
            expires_at: row.get(4)?,
            last_seen_at: row.get(5)?,
            is_active: row.get(6)?,
        })
    }
}

impl DeviceStore for SqliteDeviceStore {
    fn insert(&mut self, device: &PairedDevice) -> Result<()> {
        self.conn.execute(
            "INSERT INTO paired_devices
                (id, anonymized_name, token_hash, created_at, expires_at, last_seen_at, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                device.id,
                device.anonymized_name,
                device.token_hash,
                device.created_at.to_rfc3339(),
                device.expires_at.to_rfc3339(),
                device.last_seen_at.to_rfc3339(),
                device.is_active as i64,
            ],
        )?;
        debug!("Persisted paired device {}", device.id);
        Ok(())
    }

    fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<PairedDevice>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, anonymized_name, token_hash, created_at, expires_at, last_seen_at, is_active
             FROM paired_devices WHERE token_hash = ?1 AND is_active = 1",
        )?;

        match stmt.query_row(params![token_hash], Self::row_to_device) {
            Ok(row) => Ok(Some(row.into_device()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn touch_last_seen(&mut self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE paired_devices SET last_seen_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    fn deactivate(&mut self, id: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE paired_devices SET is_active = 0 WHERE id = ?1 AND is_active = 1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    fn deactivate_all(&mut self) -> Result<usize> {
        let changed = self
            .conn
            .execute("UPDATE paired_devices SET is_active = 0 WHERE is_active = 1", [])?;
        debug!("Deactivated {} paired devices", changed);
        Ok(changed)
    }

    fn list(&self) -> Result<Vec<PairedDevice>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, anonymized_name, token_hash, created_at, expires_at, last_seen_at, is_active
             FROM paired_devices ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map([], Self::row_to_device)?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?.into_device()?);
        }
        Ok(devices)
    }
}

/// Intermediate row type for reading from SQLite
struct DeviceRow {
    id: String,
    anonymized_name: String,
    token_hash: String,
    created_at: String,
    expires_at: String,
    last_seen_at: String,
    is_active: i64,
}

impl DeviceRow {
    fn into_device(self) -> Result<PairedDevice> {
        Ok(PairedDevice {
            id: self.id,
            anonymized_name: self.anonymized_name,
            token_hash: self.token_hash,
            created_at: parse_timestamp(&self.created_at)?,
            expires_at: parse_timestamp(&self.expires_at)?,
            last_seen_at: parse_timestamp(&self.last_seen_at)?,
            is_active: self.is_active != 0,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                .into()
        })
}
