use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, OptionalExtension};
use serde::de::DeserializeOwned;
use shared::types::{LegacyService, RobotRecord};

const ROBOTS_KEY: &str = "robots";
const LEGACY_SERVICES_KEY: &str = "services";

/// Key/value store for the persisted robot list.
pub struct CacheDb {
    conn: Connection,
}

impl CacheDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // In-memory databases answer "memory" and stay that way
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .context("Failed to enable WAL mode")?;
        tracing::debug!("Cache journal mode: {}", mode);

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Stored robot list, or `None` if nothing was ever saved
    pub fn get_robots(&self) -> Result<Option<Vec<RobotRecord>>> {
        self.get_json(ROBOTS_KEY)
    }

    /// Flat service list written by older versions
    pub fn get_legacy_services(&self) -> Result<Option<Vec<LegacyService>>> {
        self.get_json(LEGACY_SERVICES_KEY)
    }

    /// Replace the stored robot list. Returns true if the stored value changed.
    pub fn put_robots(&self, robots: &[RobotRecord]) -> Result<bool> {
        let json = serde_json::to_string(robots).context("Failed to serialize robots")?;

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM cache_entries WHERE key = ?1",
                params![ROBOTS_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query existing robots")?;

        if existing.as_deref() == Some(json.as_str()) {
            return Ok(false);
        }

        self.conn.execute(
            r#"
            INSERT INTO cache_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![ROBOTS_KEY, json, Utc::now().to_rfc3339()],
        )
        .context("Failed to save robots")?;

        Ok(true)
    }

    /// Drop every entry, legacy ones included
    pub fn clear(&self) -> Result<()> {
        self.conn
            .execute("DELETE FROM cache_entries", [])
            .context("Failed to clear cache")?;
        Ok(())
    }

    /// When the robot list was last written
    pub fn last_updated(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT updated_at FROM cache_entries WHERE key = ?1",
                params![ROBOTS_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query cache timestamp")?;

        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("Invalid cache timestamp: {}", s))
        })
        .transpose()
    }

    #[cfg(test)]
    fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Corrupt values are logged and read as absent
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to query cache entry {}", key))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Ignoring corrupt cache entry {}: {}", key, e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::AddressHealthState;

    fn test_robot(name: &str) -> RobotRecord {
        let mut robot = RobotRecord::new(name);
        robot.addresses.push(AddressHealthState::unpolled("10.0.0.5", 31950));
        robot
    }

    #[test]
    fn test_save_and_load() {
        let db = CacheDb::open(":memory:").unwrap();
        assert_eq!(db.get_robots().unwrap(), None);

        let robots = vec![test_robot("robotA"), test_robot("robotB")];
        assert!(db.put_robots(&robots).unwrap(), "First save should report change");

        assert_eq!(db.get_robots().unwrap(), Some(robots));
        assert!(db.last_updated().unwrap().is_some());
    }

    #[test]
    fn test_put_detects_changes() {
        let db = CacheDb::open(":memory:").unwrap();
        let mut robots = vec![test_robot("robotA")];

        db.put_robots(&robots).unwrap();
        assert!(!db.put_robots(&robots).unwrap(), "Identical save should not report change");

        robots[0].addresses[0].seen = true;
        assert!(db.put_robots(&robots).unwrap(), "Modified list should report change");
    }

    #[test]
    fn test_clear_removes_everything() {
        let db = CacheDb::open(":memory:").unwrap();
        db.put_robots(&[test_robot("robotA")]).unwrap();
        db.put_raw(LEGACY_SERVICES_KEY, "[]").unwrap();

        db.clear().unwrap();
        assert_eq!(db.get_robots().unwrap(), None);
        assert_eq!(db.get_legacy_services().unwrap(), None);
    }

    #[test]
    fn test_corrupt_entry_reads_as_absent() {
        let db = CacheDb::open(":memory:").unwrap();
        db.put_raw(ROBOTS_KEY, "{not json").unwrap();
        assert_eq!(db.get_robots().unwrap(), None);
    }

    #[test]
    fn test_legacy_services_parse() {
        let db = CacheDb::open(":memory:").unwrap();
        db.put_raw(
            LEGACY_SERVICES_KEY,
            r#"[{"name":"robotA","ip":"10.0.0.5","port":31950},{"name":"robotA","ip":null}]"#,
        )
        .unwrap();

        let services = db.get_legacy_services().unwrap().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[1].ip, None);
        assert_eq!(services[1].port, 31950);
    }
}
