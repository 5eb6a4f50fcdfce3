use crate::{
    config::AppConfig,
    error::{Result as ServiceResult, ServiceError},
    store::{BindParam, DataStore, Statement},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection};
use diesel::deserialize::QueryableByName;
use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_query;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Bool, Double, Json, Nullable, Text};
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use serde_json::Value;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{error, info};

pub type PgPool = Pool<PgConnectionManager>;

pub async fn connect_pool(config: &AppConfig) -> Result<PgPool> {
    let manager = PgConnectionManager::new(&config.database_url)?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .connection_timeout(config.request_timeout)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    // One probe so bad credentials show up in the startup log.
    match pool.get().await {
        Ok(_) => info!("database connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
}

impl PgConnectionManager {
    fn new(database_url: &str) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid DATABASE_URL")?;
        Ok(Self { config })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let (client, connection) = self.config.connect(NoTls).await?;
        AsyncPgConnection::try_from_client_and_connection(client, connection)
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

/// [`DataStore`] over the Postgres pool. Each statement checks out its own connection.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> ServiceResult<PooledConnection<'_, PgConnectionManager>> {
        self.pool.get().await.map_err(|err| {
            error!(error = ?err, "failed to acquire database connection");
            ServiceError::StoreUnavailable(anyhow::anyhow!("{err:?}"))
        })
    }
}

#[derive(Debug, QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

#[derive(Debug, QueryableByName)]
struct PayloadRow {
    #[diesel(sql_type = Json)]
    payload: Value,
}

fn bind_statement(statement: &Statement) -> BoxedSqlQuery<'static, Pg, SqlQuery> {
    statement
        .params
        .iter()
        .fold(sql_query(statement.sql.clone()).into_boxed::<Pg>(), |query, param| {
            param.apply(query)
        })
}

impl BindParam {
    fn apply<'a>(&self, query: BoxedSqlQuery<'a, Pg, SqlQuery>) -> BoxedSqlQuery<'a, Pg, SqlQuery> {
        match self {
            BindParam::Int(value) => query.bind::<BigInt, _>(*value),
            BindParam::OptionalInt(value) => query.bind::<Nullable<BigInt>, _>(*value),
            BindParam::Float(value) => query.bind::<Double, _>(*value),
            BindParam::Bool(value) => query.bind::<Bool, _>(*value),
            BindParam::Text(value) => query.bind::<Text, _>(value.clone()),
            BindParam::OptionalText(value) => query.bind::<Nullable<Text>, _>(value.clone()),
        }
    }
}

/// Constraint violations are the caller's doing; everything else is a store failure.
fn store_error(err: DieselError) -> ServiceError {
    match &err {
        DieselError::DatabaseError(
            kind @ (DatabaseErrorKind::UniqueViolation | DatabaseErrorKind::ForeignKeyViolation),
            info,
        ) => {
            let reason = match kind {
                DatabaseErrorKind::UniqueViolation => "duplicate value",
                _ => "row is still referenced or references a missing row",
            };
            let detail = info
                .constraint_name()
                .map(|name| format!("{reason} ({name})"))
                .unwrap_or_else(|| reason.to_string());
            ServiceError::Conflict(detail)
        }
        _ => ServiceError::StoreUnavailable(err.into()),
    }
}

#[async_trait]
impl DataStore for PgStore {
    async fn count(&self, statement: &Statement) -> ServiceResult<i64> {
        let mut conn = self.connection().await?;
        let rows: Vec<CountRow> = bind_statement(statement)
            .load(&mut *conn)
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().next().map(|row| row.total).unwrap_or(0))
    }

    async fn rows(&self, statement: &Statement) -> ServiceResult<Vec<Value>> {
        let mut conn = self.connection().await?;
        let rows: Vec<PayloadRow> = bind_statement(statement)
            .load(&mut *conn)
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(|row| row.payload).collect())
    }

    async fn execute(&self, statement: &Statement) -> ServiceResult<u64> {
        let mut conn = self.connection().await?;
        let affected = bind_statement(statement)
            .execute(&mut *conn)
            .await
            .map_err(store_error)?;
        Ok(affected as u64)
    }
}
