use std::path::Path;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use shared::types::{Candidate, Service};

/// Persisted copy of the discovery directory, used to seed the client on
/// the next start.
pub struct DirectoryStore {
    conn: Connection,
}

impl DirectoryStore {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                name       TEXT PRIMARY KEY,
                addresses  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS candidates (
                ip    TEXT NOT NULL,
                port  INTEGER NOT NULL,
                PRIMARY KEY (ip, port)
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Replace the stored directory with `services` and `candidates`
    pub fn save(&mut self, services: &[Service], candidates: &[Candidate]) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to begin transaction")?;

        tx.execute("DELETE FROM services", [])
            .context("Failed to clear services")?;
        tx.execute("DELETE FROM candidates", [])
            .context("Failed to clear candidates")?;

        for service in services {
            let addresses_json = serde_json::to_string(&service.addresses)
                .context("Failed to serialize addresses")?;
            tx.execute(
                "INSERT INTO services (name, addresses) VALUES (?1, ?2)",
                params![&service.name, &addresses_json],
            )
            .with_context(|| format!("Failed to save service {}", service.name))?;
        }

        for candidate in candidates {
            tx.execute(
                "INSERT OR IGNORE INTO candidates (ip, port) VALUES (?1, ?2)",
                params![&candidate.ip, candidate.port],
            )
            .context("Failed to save candidate")?;
        }

        tx.commit().context("Failed to commit directory")?;
        Ok(())
    }

    /// Load the stored directory, services in name order
    pub fn load(&self) -> Result<(Vec<Service>, Vec<Candidate>)> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, addresses FROM services ORDER BY name")
            .context("Failed to prepare query")?;

        let services = stmt
            .query_map([], Self::row_to_service)
            .context("Failed to query services")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect services")?;

        let mut stmt = self
            .conn
            .prepare("SELECT ip, port FROM candidates ORDER BY rowid")
            .context("Failed to prepare query")?;

        let candidates = stmt
            .query_map([], |row| {
                Ok(Candidate {
                    ip: row.get(0)?,
                    port: row.get::<_, u16>(1)?,
                })
            })
            .context("Failed to query candidates")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect candidates")?;

        Ok((services, candidates))
    }

    fn row_to_service(row: &rusqlite::Row) -> Result<Service, rusqlite::Error> {
        let addresses_json: String = row.get(1)?;

        let addresses = serde_json::from_str(&addresses_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        Ok(Service {
            name: row.get(0)?,
            addresses,
        })
    }
}
