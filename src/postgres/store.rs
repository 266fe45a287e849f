use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::Pool;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Row;
use tracing::{debug, info, instrument};

use super::types::{EventTime, Record, RecordKey};
use crate::config::StoreConfig;
use crate::{Error, Result};

/// Read/update surface of the telemetry table.
///
/// Implementations must be safe to share between the poll loop and every
/// publish task.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Returns up to `limit` unsent records, oldest first. An empty vector
    /// means nothing is pending.
    async fn fetch_unprocessed_batch(&self, limit: usize) -> Result<Vec<Record>>;

    /// Flags the record addressed by its key as sent.
    async fn mark_sent(&self, record: &Record) -> Result<()>;
}

/// SQL text for the two statements, built once from the store settings.
#[derive(Debug, Clone)]
pub struct StoreQueries {
    fetch: String,
    mark_sent: String,
    field_names: Vec<String>,
    has_identity: bool,
}

impl StoreQueries {
    pub fn new(config: &StoreConfig) -> Self {
        let table = quote_qualified(&config.table);
        let timestamp = quote_ident(&config.timestamp_column);
        let sent = quote_ident(&config.sent_column);

        let mut select: Vec<String> = config.columns.iter().map(|c| quote_ident(c)).collect();
        select.push(timestamp.clone());

        let mut order_by = format!("{} ASC", timestamp);
        let key_predicate = match &config.identity_column {
            Some(identity) => {
                let identity = quote_ident(identity);
                select.push(format!("{}::int8", identity));
                order_by.push_str(&format!(", {} ASC", identity));
                format!("{} = $1::int8", identity)
            }
            None => format!("{} = $1", timestamp),
        };

        let fetch = format!(
            "SELECT {} FROM {} WHERE {} = FALSE AND {} IS NOT NULL ORDER BY {} LIMIT $1",
            select.join(", "),
            table,
            sent,
            timestamp,
            order_by
        );
        let mark_sent = format!(
            "UPDATE {} SET {} = TRUE WHERE {}",
            table, sent, key_predicate
        );

        Self {
            fetch,
            mark_sent,
            field_names: config.columns.clone(),
            has_identity: config.identity_column.is_some(),
        }
    }

    pub fn fetch_sql(&self) -> &str {
        &self.fetch
    }

    pub fn mark_sent_sql(&self) -> &str {
        &self.mark_sent
    }

    fn record_from_row(&self, row: &Row) -> Result<Record> {
        let mut fields = Map::with_capacity(self.field_names.len());
        for (idx, name) in self.field_names.iter().enumerate() {
            fields.insert(name.clone(), column_value(row, idx)?);
        }

        let ts_idx = self.field_names.len();
        let timestamp = match *row.columns()[ts_idx].type_() {
            Type::TIMESTAMP => EventTime::Naive(row.try_get::<_, NaiveDateTime>(ts_idx)?),
            Type::TIMESTAMPTZ => EventTime::Utc(row.try_get::<_, DateTime<Utc>>(ts_idx)?),
            ref other => {
                return Err(Error::Validation {
                    message: format!("timestamp column has unsupported type {}", other),
                })
            }
        };

        if self.has_identity {
            let id = row.try_get::<_, i64>(ts_idx + 1)?;
            Ok(Record::with_id(id, timestamp, fields))
        } else {
            Ok(Record::new(timestamp, fields))
        }
    }
}

/// [`StoreGateway`] backed by a `deadpool-postgres` pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
    queries: StoreQueries,
}

impl PostgresStore {
    pub fn new(pool: Pool, config: &StoreConfig) -> Self {
        Self {
            pool,
            queries: StoreQueries::new(config),
        }
    }

    /// Prepares both statements and checks the column types, so a schema
    /// mismatch stops the process at startup instead of on every poll.
    pub async fn verify(&self) -> Result<()> {
        let client = self.pool.get().await?;

        let fetch = client.prepare_cached(self.queries.fetch_sql()).await?;
        let columns = fetch.columns();
        let ts_idx = self.queries.field_names.len();

        for (name, column) in self.queries.field_names.iter().zip(columns) {
            if !is_supported_field_type(column.type_()) {
                return Err(Error::Config(format!(
                    "column '{}' has unsupported type {}",
                    name,
                    column.type_()
                )));
            }
        }
        match columns.get(ts_idx).map(|c| c.type_()) {
            Some(&Type::TIMESTAMP) | Some(&Type::TIMESTAMPTZ) => {}
            Some(other) => {
                return Err(Error::Config(format!(
                    "timestamp column must be timestamp or timestamptz, found {}",
                    other
                )))
            }
            None => return Err(Error::Config("timestamp column missing".to_string())),
        }

        client.prepare_cached(self.queries.mark_sent_sql()).await?;

        info!(fields = ts_idx, "Verified telemetry table schema");
        Ok(())
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<Record>> {
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(self.queries.fetch_sql()).await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client.query(&stmt, &[&limit]).await?;

        rows.iter()
            .map(|row| self.queries.record_from_row(row))
            .collect()
    }
}

#[async_trait]
impl StoreGateway for PostgresStore {
    async fn fetch_unprocessed_batch(&self, limit: usize) -> Result<Vec<Record>> {
        let records = self.fetch(limit).await.map_err(|e| match e {
            e @ Error::StoreUnavailable { .. } => e,
            other => Error::store_unavailable(other),
        })?;

        debug!(count = records.len(), limit, "Fetched unprocessed batch");
        Ok(records)
    }

    #[instrument(skip(self, record), fields(key = %record.key))]
    async fn mark_sent(&self, record: &Record) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::store_unavailable)?;
        let stmt = client
            .prepare_cached(self.queries.mark_sent_sql())
            .await
            .map_err(Error::store_unavailable)?;

        let param: &(dyn ToSql + Sync) = match &record.key {
            RecordKey::Timestamp(EventTime::Naive(ts)) => ts,
            RecordKey::Timestamp(EventTime::Utc(ts)) => ts,
            RecordKey::Id(id) => id,
        };

        let updated = client
            .execute(&stmt, &[param])
            .await
            .map_err(Error::store_unavailable)?;

        if updated == 0 {
            return Err(Error::RecordNotFound {
                key: record.key.to_string(),
            });
        }

        debug!(rows = updated, "Marked record as sent");
        Ok(())
    }
}

fn is_supported_field_type(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::NUMERIC
            | Type::TEXT
            | Type::VARCHAR
            | Type::BPCHAR
            | Type::NAME
            | Type::DATE
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
            | Type::JSON
            | Type::JSONB
    )
}

/// Converts one measurement column to JSON by its PostgreSQL type.
fn column_value(row: &Row, idx: usize) -> Result<Value> {
    let value = match *row.columns()[idx].type_() {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::from(f64::from(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::from),
        Type::NUMERIC => row.try_get::<_, Option<Decimal>>(idx)?.map(decimal_value),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::String)
        }
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|d| Value::String(d.to_string())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|ts| Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|ts| Value::String(ts.to_rfc3339())),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?,
        ref other => {
            return Err(Error::Validation {
                message: format!(
                    "column '{}' has unsupported type {}",
                    row.columns()[idx].name(),
                    other
                ),
            })
        }
    };

    Ok(value.unwrap_or(Value::Null))
}

/// A JSON number when an integer or `f64` carries the value exactly, otherwise
/// its decimal text.
fn decimal_value(value: Decimal) -> Value {
    let value = value.normalize();
    let text = value.to_string();

    if value.scale() == 0 {
        if let Some(i) = value.to_i64() {
            return Value::from(i);
        }
    }

    value
        .to_f64()
        .filter(|f| f.is_finite() && f.to_string() == text)
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::String(text))
}

/// Double-quotes an identifier, escaping embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_config(columns: &[&str], identity: Option<&str>) -> StoreConfig {
        StoreConfig {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            identity_column: identity.map(|c| c.to_string()),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("humidity"), "\"humidity\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_qualified("telemetry.iot_data"), "\"telemetry\".\"iot_data\"");
    }

    #[test]
    fn test_fetch_query_orders_oldest_first() {
        let queries = StoreQueries::new(&store_config(&["humidity", "temperature"], None));
        assert_eq!(
            queries.fetch_sql(),
            "SELECT \"humidity\", \"temperature\", \"timestamp\" FROM \"iot_data\" \
             WHERE \"is_sent\" = FALSE AND \"timestamp\" IS NOT NULL \
             ORDER BY \"timestamp\" ASC LIMIT $1"
        );
    }

    #[test]
    fn test_mark_sent_by_timestamp() {
        let queries = StoreQueries::new(&store_config(&["humidity"], None));
        assert_eq!(
            queries.mark_sent_sql(),
            "UPDATE \"iot_data\" SET \"is_sent\" = TRUE WHERE \"timestamp\" = $1"
        );
    }

    #[test]
    fn test_identity_column_queries() {
        let queries = StoreQueries::new(&store_config(&["humidity"], Some("id")));
        assert_eq!(
            queries.fetch_sql(),
            "SELECT \"humidity\", \"timestamp\", \"id\"::int8 FROM \"iot_data\" \
             WHERE \"is_sent\" = FALSE AND \"timestamp\" IS NOT NULL \
             ORDER BY \"timestamp\" ASC, \"id\" ASC LIMIT $1"
        );
        assert_eq!(
            queries.mark_sent_sql(),
            "UPDATE \"iot_data\" SET \"is_sent\" = TRUE WHERE \"id\" = $1::int8"
        );
    }

    #[test]
    fn test_timestamp_only_table() {
        let queries = StoreQueries::new(&store_config(&[], None));
        assert!(queries
            .fetch_sql()
            .starts_with("SELECT \"timestamp\" FROM \"iot_data\""));
    }

    #[test]
    fn test_supported_field_types() {
        assert!(is_supported_field_type(&Type::FLOAT8));
        assert!(is_supported_field_type(&Type::VARCHAR));
        assert!(is_supported_field_type(&Type::JSONB));
        assert!(is_supported_field_type(&Type::NUMERIC));
        assert!(!is_supported_field_type(&Type::BYTEA));
    }

    #[test]
    fn test_numeric_values_become_json_numbers() {
        let dec = |s: &str| s.parse::<Decimal>().unwrap();

        assert_eq!(decimal_value(dec("40.50")), serde_json::json!(40.5));
        assert_eq!(decimal_value(dec("0.1")), serde_json::json!(0.1));
        assert_eq!(decimal_value(dec("42.000")), serde_json::json!(42));
        assert_eq!(decimal_value(dec("-7")), serde_json::json!(-7));
    }

    #[test]
    fn test_inexact_numeric_kept_as_text() {
        let value = "12345678901234567890.123".parse::<Decimal>().unwrap();
        assert_eq!(
            decimal_value(value),
            Value::String("12345678901234567890.123".to_string())
        );
    }
}
