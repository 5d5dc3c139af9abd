use sqlx::{
    postgres::{PgArguments, PgPool, PgPoolOptions},
    query::Query,
    types::Json,
    Connection, Postgres, Row as _,
};
use serde_json::Value;
use tracing::{debug, info};

use super::{quote_identifier, Condition, Datastore, Filter, RowOutcome, UpsertMode};
use crate::config::DatabaseConfig;
use crate::error::{CollectorError, Result};
use crate::types::{EntityId, NormalizedRow, Row};

/// Postgres destination. Rows travel as jsonb; filter values are bound with
/// their native type so column indexes stay usable.
#[derive(Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| CollectorError::Config("DATABASE_URL is not set".to_string()))?;

        info!("Connecting to Postgres ({} connections max)", config.max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// A filter value with the Postgres type it is bound as.
#[derive(Debug, Clone, PartialEq)]
enum Bind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    /// Nulls and containers, compared through `to_jsonb(column)`.
    Json(Value),
}

impl Bind {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(n) => Bind::Int(n),
                None => n.as_f64().map(Bind::Float).unwrap_or_else(|| Bind::Json(value.clone())),
            },
            Value::Bool(b) => Bind::Bool(*b),
            Value::String(s) => Bind::Text(s.clone()),
            other => Bind::Json(other.clone()),
        }
    }

    /// `column op $n` for this bind's type.
    fn comparison(&self, column: &str, op: &str, n: usize) -> String {
        match self {
            Bind::Int(_) | Bind::Float(_) | Bind::Bool(_) => format!("{} {} ${}", column, op, n),
            Bind::Text(_) => format!("{}::text {} ${}", column, op, n),
            Bind::Json(_) => format!("to_jsonb({}) {} ${}::jsonb", column, op, n),
        }
    }
}

/// `WHERE` clause for `filter` plus the values to bind, in order.
fn where_clause(filter: &Filter) -> Result<(String, Vec<Bind>)> {
    let mut clauses = Vec::with_capacity(filter.conditions.len());
    let mut binds = Vec::new();

    for condition in &filter.conditions {
        let column = quote_identifier(condition.column())?;
        match condition {
            Condition::Eq(_, value) | Condition::Gt(_, value) => {
                let op = if matches!(condition, Condition::Eq(..)) { "=" } else { ">" };
                let bind = Bind::from_value(value);
                clauses.push(bind.comparison(&column, op, binds.len() + 1));
                binds.push(bind);
            }
            Condition::IsNull(_) => clauses.push(format!("{} IS NULL", column)),
            Condition::NotNull(_) => clauses.push(format!("{} IS NOT NULL", column)),
        }
    }

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    Ok((sql, binds))
}

fn bind_all<'q>(mut query: Query<'q, Postgres, PgArguments>, binds: &'q [Bind]) -> Query<'q, Postgres, PgArguments> {
    for bind in binds {
        query = match bind {
            Bind::Int(n) => query.bind(*n),
            Bind::Float(n) => query.bind(*n),
            Bind::Bool(b) => query.bind(*b),
            Bind::Text(s) => query.bind(s.as_str()),
            Bind::Json(value) => query.bind(Json(value)),
        };
    }
    query
}

/// Single-row upsert statement for the columns present in `row`.
///
/// The update is skipped when nothing would change, in which case no row is
/// returned; otherwise `inserted` tells an insert from an update.
pub fn upsert_statement(table: &str, conflict_key: &str, row: &NormalizedRow, mode: UpsertMode) -> Result<String> {
    let table = quote_identifier(table)?;
    let key = quote_identifier(conflict_key)?;
    let columns = row
        .fields
        .keys()
        .map(|column| quote_identifier(column))
        .collect::<Result<Vec<_>>>()?;
    let column_list = columns.join(", ");

    let updates: Vec<(String, String)> = columns
        .iter()
        .filter(|column| **column != key)
        .map(|column| {
            let value = match mode {
                UpsertMode::Overwrite => format!("EXCLUDED.{}", column),
                UpsertMode::PreserveNulls => format!("COALESCE(EXCLUDED.{0}, t.{0})", column),
            };
            (column.clone(), value)
        })
        .collect();

    let conflict_action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let set = updates
            .iter()
            .map(|(column, value)| format!("{} = {}", column, value))
            .collect::<Vec<_>>()
            .join(", ");
        let old = updates
            .iter()
            .map(|(column, _)| format!("t.{}", column))
            .collect::<Vec<_>>()
            .join(", ");
        let new = updates
            .iter()
            .map(|(_, value)| value.clone())
            .collect::<Vec<_>>()
            .join(", ");
        format!("DO UPDATE SET {} WHERE ROW({}) IS DISTINCT FROM ROW({})", set, old, new)
    };

    Ok(format!(
        "INSERT INTO {table} AS t ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
         ON CONFLICT ({key}) {conflict_action} \
         RETURNING (xmax = 0) AS inserted"
    ))
}

impl Datastore for PgDatastore {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
        let table = quote_identifier(table)?;
        let (where_sql, binds) = where_clause(filter)?;
        let mut sql = format!("SELECT to_jsonb(t) AS data FROM {} t{}", table, where_sql);
        if let Some(column) = &filter.order_by {
            sql.push_str(&format!(" ORDER BY {}", quote_identifier(column)?));
        }
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        debug!("select: {}", sql);
        let records = bind_all(sqlx::query(&sql), &binds).fetch_all(&self.pool).await?;
        records
            .iter()
            .map(|record| -> Result<Row> {
                let Json(row): Json<Row> = record.try_get("data")?;
                Ok(row)
            })
            .collect()
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[NormalizedRow],
        conflict_key: &str,
        mode: UpsertMode,
    ) -> Result<Vec<RowOutcome>> {
        let mut outcomes = Vec::with_capacity(rows.len());
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let sql = match upsert_statement(table, conflict_key, row, mode) {
                Ok(sql) => sql,
                Err(e) => {
                    outcomes.push(RowOutcome::Failed(e.to_string()));
                    continue;
                }
            };

            // Each row gets a savepoint so a constraint violation only
            // discards that row.
            let mut savepoint = Connection::begin(&mut *tx).await?;
            let result = sqlx::query(&sql)
                .bind(Json(&row.fields))
                .fetch_optional(&mut *savepoint)
                .await;

            match result {
                Ok(Some(record)) => {
                    let inserted: bool = record.try_get("inserted")?;
                    savepoint.commit().await?;
                    outcomes.push(if inserted {
                        RowOutcome::Inserted
                    } else {
                        RowOutcome::Updated
                    });
                }
                Ok(None) => {
                    savepoint.commit().await?;
                    outcomes.push(RowOutcome::Unchanged);
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    outcomes.push(RowOutcome::Failed(e.to_string()));
                }
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64> {
        let table = quote_identifier(table)?;
        let (where_sql, binds) = where_clause(filter)?;
        let sql = format!("SELECT COUNT(*) AS n FROM {} t{}", table, where_sql);

        let record = bind_all(sqlx::query(&sql), &binds).fetch_one(&self.pool).await?;
        let count: i64 = record.try_get("n")?;
        Ok(count.max(0) as u64)
    }

    async fn set_flag(
        &self,
        table: &str,
        key_column: &str,
        keys: &[EntityId],
        column: &str,
        value: bool,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET {} = $1 WHERE {} = ANY($2)",
            quote_identifier(table)?,
            quote_identifier(column)?,
            quote_identifier(key_column)?
        );
        let result = sqlx::query(&sql).bind(value).bind(keys).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count_orphans(&self, child: &str, foreign_key: &str, parent: &str, parent_key: &str) -> Result<u64> {
        let foreign_key = quote_identifier(foreign_key)?;
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {child} c WHERE c.{fk} IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.{key} = c.{fk})",
            child = quote_identifier(child)?,
            fk = foreign_key,
            parent = quote_identifier(parent)?,
            key = quote_identifier(parent_key)?
        );
        let record = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let count: i64 = record.try_get("n")?;
        Ok(count.max(0) as u64)
    }
}
