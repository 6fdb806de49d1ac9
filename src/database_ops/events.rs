use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{ConnectOptions, Connection, Row};
use std::str::FromStr;
use tracing::{info, instrument};

const SELECT_CANDIDATES: &str = r#"SELECT "Id", "Icon" FROM "Events""#;
const UPDATE_ICON: &str = r#"UPDATE "Events" SET "Icon" = $1 WHERE "Id" = $2"#;

/// One `"Events"` row as seen by the migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIconRow {
    pub id: i64,
    pub icon: Option<String>,
}

impl EventIconRow {
    /// The icon URL, or `None` when the column is null or empty.
    pub fn icon_url(&self) -> Option<&str> {
        self.icon.as_deref().filter(|s| !s.is_empty())
    }

    fn from_row(row: &PgRow) -> Result<Self> {
        // "Id" may be integer or bigint depending on how the table was created.
        let id = match row.try_get::<i64, _>("Id") {
            Ok(v) => v,
            Err(_) => i64::from(row.try_get::<i32, _>("Id").context("decode \"Id\"")?),
        };
        let icon: Option<String> = row.try_get("Icon").context("decode \"Icon\"")?;
        Ok(Self { id, icon })
    }
}

/// The relational side of the migration: read candidate rows, rewrite icons.
#[async_trait]
pub trait EventStore: Send {
    /// Scope subsequent statements to `schema`.
    async fn set_schema(&mut self, schema: &str) -> Result<()>;
    async fn select_candidates(&mut self) -> Result<Vec<EventIconRow>>;
    async fn update_icon(&mut self, id: i64, url: &str) -> Result<()>;
    /// Release the underlying connection. Later calls are no-ops.
    async fn close(&mut self) -> Result<()>;
}

/// Quote a Postgres identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn search_path_statement(schema: &str) -> String {
    format!("SET search_path TO {}", quote_ident(schema))
}

/// Single Postgres connection held for the whole run.
pub struct PgEventStore {
    conn: Option<PgConnection>,
}

impl PgEventStore {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).context("parse database connection string")?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        // PgBouncer txn mode safe
        connect_options = connect_options.statement_cache_capacity(0);

        let conn = connect_options
            .connect()
            .await
            .context("connect to postgres")?;
        info!("connected to db");
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| anyhow!("database connection already closed"))
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn set_schema(&mut self, schema: &str) -> Result<()> {
        let stmt = search_path_statement(schema);
        sqlx::query(&stmt)
            .persistent(false)
            .execute(self.conn()?)
            .await
            .with_context(|| format!("set search_path to {schema}"))?;
        Ok(())
    }

    async fn select_candidates(&mut self) -> Result<Vec<EventIconRow>> {
        let rows = sqlx::query(SELECT_CANDIDATES)
            .persistent(false)
            .fetch_all(self.conn()?)
            .await
            .context("select event icons")?;
        rows.iter().map(EventIconRow::from_row).collect()
    }

    async fn update_icon(&mut self, id: i64, url: &str) -> Result<()> {
        sqlx::query(UPDATE_ICON)
            .persistent(false)
            .bind(url)
            .bind(id)
            .execute(self.conn()?)
            .await
            .with_context(|| format!("update icon of event {id}"))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.context("close postgres connection")?;
            info!("database connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_schema_identifiers() {
        assert_eq!(quote_ident("events_db"), "\"events_db\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn null_and_empty_icons_count_as_missing() {
        let row = |icon: Option<&str>| EventIconRow {
            id: 1,
            icon: icon.map(str::to_string),
        };
        assert_eq!(row(None).icon_url(), None);
        assert_eq!(row(Some("")).icon_url(), None);
        assert_eq!(
            row(Some("http://example.com/a.png")).icon_url(),
            Some("http://example.com/a.png")
        );
    }

    #[test]
    fn search_path_statement_quotes_schema() {
        assert_eq!(
            search_path_statement("events_db"),
            r#"SET search_path TO "events_db""#
        );
        assert_eq!(
            search_path_statement("x\"; DROP TABLE \"Events"),
            r#"SET search_path TO "x""; DROP TABLE ""Events""#
        );
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn store_futures_are_send() {
        let mut store = PgEventStore { conn: None };
        assert_send(&store.set_schema("events_db"));
    }

    #[tokio::test]
    async fn closed_store_rejects_statements() {
        let mut store = PgEventStore { conn: None };
        let err = store.set_schema("events_db").await.unwrap_err();
        assert!(format!("{err:#}").contains("already closed"));
        assert!(store.close().await.is_ok());
    }

    #[test]
    fn statements_use_bound_parameters() {
        assert!(UPDATE_ICON.contains("$1") && UPDATE_ICON.contains("$2"));
        assert_eq!(SELECT_CANDIDATES, r#"SELECT "Id", "Icon" FROM "Events""#);
    }
}
