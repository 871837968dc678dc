use duckdb::{AccessMode, Config, Connection};
use r2d2::{ManageConnection, Pool};
use std::path::Path;
use tracing::info;

/// r2d2 manager for DuckDB file connections. Query connections are opened
/// read-only so the database rejects writes even if a statement slips through
/// validation.
#[derive(Debug)]
pub struct DuckDBConnectionManager {
    path: String,
    read_only: bool,
}

impl DuckDBConnectionManager {
    pub fn read_only(path: String) -> Self {
        Self { path, read_only: true }
    }

    pub fn read_write(path: String) -> Self {
        Self { path, read_only: false }
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let mode = if self.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };
        let config = Config::default().access_mode(mode)?;
        Connection::open_with_flags(&self.path, config)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Builds the read-only query pool, failing early if the database file is missing.
pub fn create_pool(
    path: &str,
    pool_size: u32,
) -> Result<Pool<DuckDBConnectionManager>, Box<dyn std::error::Error + Send + Sync>> {
    if !Path::new(path).exists() {
        return Err(format!(
            "Database file not found at {}. Run the `seed` command to create it.",
            path
        )
        .into());
    }

    let manager = DuckDBConnectionManager::read_only(path.to_string());
    let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;
    info!("Opened read-only database pool at {} (size {})", path, pool_size.max(1));
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.duckdb");
        let err = create_pool(&path.to_string_lossy(), 2).unwrap_err();
        assert!(err.to_string().contains("seed"));
    }

    #[test]
    fn manager_debug_shows_access_mode() {
        let manager = DuckDBConnectionManager::read_only("pm.duckdb".to_string());
        let shown = format!("{:?}", manager);
        assert!(shown.contains("pm.duckdb"));
        assert!(shown.contains("read_only: true"));
    }

    #[test]
    fn read_only_connections_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.duckdb").to_string_lossy().to_string();
        {
            let writer = DuckDBConnectionManager::read_write(path.clone()).connect().unwrap();
            writer.execute_batch("CREATE TABLE Owners (owner_id INTEGER)").unwrap();
        }

        let pool = create_pool(&path, 1).unwrap();
        let conn = pool.get().unwrap();
        assert!(conn.execute_batch("INSERT INTO Owners VALUES (1)").is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM Owners", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
