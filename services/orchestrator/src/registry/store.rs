//! SQLite-backed unit and assignee registry.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid record: {0}")]
    Invalid(String),
}

/// Unit lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Accepts new assignees.
    Active,
    /// Holds a full complement of assignees.
    Completed,
    /// Taken out of rotation by an operator.
    Disabled,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Disabled => "disabled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Assignee progress status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeStatus {
    Pending,
    Active,
    Failed,
    Completed,
}

impl AssigneeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Assignee selection for a run: one status or every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Only(AssigneeStatus),
}

impl FromStr for StatusFilter {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "all" {
            return Ok(Self::All);
        }
        AssigneeStatus::parse(&s)
            .map(Self::Only)
            .ok_or_else(|| RegistryError::Invalid(format!("unknown status filter: {s}")))
    }
}

impl fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Only(status) => f.write_str(status.as_str()),
        }
    }
}

/// One execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unit {
    pub name: String,
    pub status: UnitStatus,
    pub updated_at: DateTime<Utc>,
}

/// One piece of work bound (eventually) to a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignee {
    pub id: String,
    pub payload: serde_json::Value,
    pub unit_name: Option<String>,
    pub status: AssigneeStatus,
    pub updated_at: DateTime<Utc>,
}

/// An assignee as submitted for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAssignee {
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewAssignee {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// SQLite registry.
pub struct Registry {
    conn: Connection,
}

impl Registry {
    /// Open or create a registry at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let registry = Self { conn };
        registry.init_schema()?;

        Ok(registry)
    }

    /// Open an in-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        let registry = Self { conn };
        registry.init_schema()?;
        Ok(registry)
    }

    fn init_schema(&self) -> Result<(), RegistryError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS units (
                name TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'active',
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS assignees (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL DEFAULT 'null',
                unit_name TEXT REFERENCES units(name),
                status TEXT NOT NULL DEFAULT 'pending',
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_assignees_unit ON assignees(unit_name);
            CREATE INDEX IF NOT EXISTS idx_assignees_status ON assignees(status);
            "#,
        )?;

        debug!("Registry schema initialized");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Units
    // -------------------------------------------------------------------------

    /// Insert an `active` unit. Returns false if the name already exists.
    pub fn create_unit(&self, name: &str) -> Result<bool, RegistryError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO units (name, status, updated_at) VALUES (?1, ?2, ?3)",
            params![name, UnitStatus::Active.as_str(), Utc::now().timestamp()],
        )?;
        Ok(changed == 1)
    }

    pub fn get_unit(&self, name: &str) -> Result<Option<Unit>, RegistryError> {
        self.conn
            .query_row(
                "SELECT name, status, updated_at FROM units WHERE name = ?1",
                params![name],
                unit_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// All units in insertion order.
    pub fn list_units(&self) -> Result<Vec<Unit>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, status, updated_at FROM units ORDER BY rowid")?;
        let units = stmt
            .query_map([], unit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(units)
    }

    /// Returns false if the unit does not exist.
    pub fn update_unit_status(&self, name: &str, status: UnitStatus) -> Result<bool, RegistryError> {
        let changed = self.conn.execute(
            "UPDATE units SET status = ?1, updated_at = ?2 WHERE name = ?3",
            params![status.as_str(), Utc::now().timestamp(), name],
        )?;
        Ok(changed == 1)
    }

    // -------------------------------------------------------------------------
    // Assignees
    // -------------------------------------------------------------------------

    /// Insert a `pending` assignee. Returns false if the id already exists.
    pub fn create_assignee(
        &self,
        new: &NewAssignee,
        unit_name: Option<&str>,
    ) -> Result<bool, RegistryError> {
        let payload = serde_json::to_string(&new.payload)
            .map_err(|e| RegistryError::Invalid(format!("payload for {}: {e}", new.id)))?;
        let changed = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO assignees (id, payload, unit_name, status, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                new.id,
                payload,
                unit_name,
                AssigneeStatus::Pending.as_str(),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn get_assignee(&self, id: &str) -> Result<Option<Assignee>, RegistryError> {
        self.conn
            .query_row(
                "SELECT id, payload, unit_name, status, updated_at FROM assignees WHERE id = ?1",
                params![id],
                assignee_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// All assignees in insertion order.
    pub fn list_assignees(&self) -> Result<Vec<Assignee>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload, unit_name, status, updated_at FROM assignees ORDER BY rowid",
        )?;
        let assignees = stmt
            .query_map([], assignee_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(assignees)
    }

    /// Assignees matching `filter`, in insertion order.
    pub fn assignees_by_status(&self, filter: StatusFilter) -> Result<Vec<Assignee>, RegistryError> {
        let status = match filter {
            StatusFilter::All => return self.list_assignees(),
            StatusFilter::Only(status) => status,
        };
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, payload, unit_name, status, updated_at
            FROM assignees WHERE status = ?1 ORDER BY rowid
            "#,
        )?;
        let assignees = stmt
            .query_map(params![status.as_str()], assignee_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(assignees)
    }

    /// Returns false if the assignee does not exist.
    pub fn update_assignee_status(
        &self,
        id: &str,
        status: AssigneeStatus,
    ) -> Result<bool, RegistryError> {
        let changed = self.conn.execute(
            "UPDATE assignees SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().timestamp(), id],
        )?;
        Ok(changed == 1)
    }

    /// Number of assignees bound to each unit that has any.
    pub fn assigned_counts(&self) -> Result<HashMap<String, usize>, RegistryError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT unit_name, COUNT(*) FROM assignees
            WHERE unit_name IS NOT NULL GROUP BY unit_name
            "#,
        )?;
        let counts = stmt
            .query_map([], |row| {
                let name: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((name, usize::try_from(count).unwrap_or(0)))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(counts)
    }

    pub fn assignee_ids(&self) -> Result<HashSet<String>, RegistryError> {
        let mut stmt = self.conn.prepare("SELECT id FROM assignees")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Cheap liveness probe for the health endpoint.
    pub fn health_check(&self) -> Result<(), RegistryError> {
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn unit_from_row(row: &Row<'_>) -> rusqlite::Result<Unit> {
    let status_str: String = row.get(1)?;
    Ok(Unit {
        name: row.get(0)?,
        status: UnitStatus::parse(&status_str).unwrap_or(UnitStatus::Disabled),
        updated_at: timestamp(row.get(2)?),
    })
}

fn assignee_from_row(row: &Row<'_>) -> rusqlite::Result<Assignee> {
    let payload_str: String = row.get(1)?;
    let status_str: String = row.get(3)?;
    Ok(Assignee {
        id: row.get(0)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        unit_name: row.get(2)?,
        status: AssigneeStatus::parse(&status_str).unwrap_or(AssigneeStatus::Failed),
        updated_at: timestamp(row.get(4)?),
    })
}
