//! SQLite-backed lookups: employees, team connections and raw request payloads.
use anyhow::Result;
use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

use crate::db::Pool;
use crate::gateway::{ConnectionLookup, EmployeeDirectory, RequestCache};
use crate::model::{Connection, EmployeeRecord};

/// Pool handle implementing the storage-backed collaborator traits.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[instrument(skip_all)]
pub async fn upsert_employee(pool: &Pool, employee: &EmployeeRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO employees (frontend_id, wfm_id, login_name, display_name) VALUES (?, ?, ?, ?) \
         ON CONFLICT(frontend_id) DO UPDATE SET wfm_id = excluded.wfm_id, login_name = excluded.login_name, \
         display_name = excluded.display_name",
    )
    .bind(&employee.frontend_id)
    .bind(&employee.wfm_id)
    .bind(&employee.login_name)
    .bind(&employee.display_name)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_connection(pool: &Pool, connection: &Connection) -> Result<()> {
    sqlx::query(
        "INSERT INTO connections (team_id, wfm_bu_id, time_zone_id, enabled) VALUES (?, ?, ?, ?) \
         ON CONFLICT(team_id) DO UPDATE SET wfm_bu_id = excluded.wfm_bu_id, \
         time_zone_id = excluded.time_zone_id, enabled = excluded.enabled",
    )
    .bind(&connection.team_id)
    .bind(&connection.wfm_bu_id)
    .bind(&connection.time_zone_id)
    .bind(connection.enabled)
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_connection(row: &sqlx::sqlite::SqliteRow) -> Connection {
    Connection {
        team_id: row.get("team_id"),
        wfm_bu_id: row.get("wfm_bu_id"),
        time_zone_id: row.get("time_zone_id"),
        enabled: row.get("enabled"),
    }
}

#[async_trait]
impl EmployeeDirectory for SqliteStore {
    #[instrument(skip_all)]
    async fn get_employee(&self, id: &str) -> Result<Option<EmployeeRecord>> {
        let row = sqlx::query(
            "SELECT frontend_id, wfm_id, login_name, display_name FROM employees WHERE frontend_id = ? OR wfm_id = ? LIMIT 1",
        )
        .bind(id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| EmployeeRecord {
            frontend_id: row.get("frontend_id"),
            wfm_id: row.get("wfm_id"),
            login_name: row.get("login_name"),
            display_name: row.get("display_name"),
        }))
    }
}

#[async_trait]
impl ConnectionLookup for SqliteStore {
    #[instrument(skip_all)]
    async fn get_connection(&self, team_id: &str) -> Result<Option<Connection>> {
        let row = sqlx::query(
            "SELECT team_id, wfm_bu_id, time_zone_id, enabled FROM connections WHERE team_id = ?",
        )
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_connection))
    }

    #[instrument(skip_all)]
    async fn list_connections(&self) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            "SELECT team_id, wfm_bu_id, time_zone_id, enabled FROM connections WHERE enabled = 1 ORDER BY team_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_connection).collect())
    }
}

#[async_trait]
impl RequestCache for SqliteStore {
    #[instrument(skip_all)]
    async fn save_request(&self, team_id: &str, request_id: &str, body: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO request_cache (team_id, request_id, body) VALUES (?, ?, ?) \
             ON CONFLICT(team_id, request_id) DO UPDATE SET body = excluded.body",
        )
        .bind(team_id)
        .bind(request_id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn load_request(&self, team_id: &str, request_id: &str) -> Result<Option<String>> {
        let body = sqlx::query_scalar::<_, String>(
            "SELECT body FROM request_cache WHERE team_id = ? AND request_id = ?",
        )
        .bind(team_id)
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(body)
    }

    #[instrument(skip_all)]
    async fn delete_request(&self, team_id: &str, request_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM request_cache WHERE team_id = ? AND request_id = ?")
            .bind(team_id)
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
