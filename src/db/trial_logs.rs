//! Trial-log read/write path: a thin SQLite adapter, separate from the
//! coordinator's persistence surface. Queries are parameterized throughout;
//! user-supplied filters go through a fielded DSL that maps known field
//! names to column expressions and rejects everything else.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;

use crate::error::{ExperimentError, Result};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrialLog {
    pub id: i64,
    pub trial_id: i64,
    pub message: String,
    pub agent_id: Option<String>,
    pub container_id: Option<String>,
    pub rank_id: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<String>,
    pub std_type: Option<String>,
    pub source: Option<String>,
}

/// Distinct values per filterable field for one trial, used to populate
/// filter pickers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrialLogFields {
    pub agent_ids: Vec<String>,
    pub container_ids: Vec<String>,
    pub rank_ids: Vec<i64>,
    pub sources: Vec<String>,
    pub std_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    In,
    NotIn,
    LessThan,
    GreaterThan,
}

/// One fielded filter. `In`/`NotIn` take any number of values; the
/// comparison operators take exactly one.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub values: Vec<Value>,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    Asc,
    Desc,
}

impl OrderBy {
    fn to_sql(self) -> &'static str {
        match self {
            OrderBy::Asc => "ASC",
            OrderBy::Desc => "DESC",
        }
    }
}

/// Column expression for a filterable field; unknown fields are rejected
/// before any SQL is built.
fn field_expr(field: &str) -> Option<&'static str> {
    match field {
        "agent_id" => Some("agent_id"),
        "container_id" => Some("container_id"),
        "rank_id" => Some("rank_id"),
        "level" => Some("level"),
        "stdtype" => Some("stdtype"),
        "source" => Some("source"),
        "timestamp" => Some("timestamp"),
        _ => None,
    }
}

/// Translate filters into an `AND ...` SQL fragment plus its parameters,
/// appended to `params` in placeholder order.
fn filters_to_sql(filters: &[Filter], params: &mut Vec<SqlValue>) -> Result<String> {
    let mut fragment = String::new();
    for filter in filters {
        let expr = field_expr(&filter.field).ok_or_else(|| {
            ExperimentError::validation(format!("unsupported filter field {}", filter.field))
        })?;
        match filter.op {
            FilterOp::In | FilterOp::NotIn => {
                if filter.values.is_empty() {
                    return Err(ExperimentError::validation(format!(
                        "filter on {} requires at least one value",
                        filter.field
                    )));
                }
                let placeholders = vec!["?"; filter.values.len()].join(", ");
                if filter.op == FilterOp::In {
                    fragment.push_str(&format!("\nAND {expr} IN ({placeholders})"));
                } else {
                    fragment.push_str(&format!(
                        "\nAND ({expr} IS NULL OR {expr} NOT IN ({placeholders}))"
                    ));
                }
                for value in &filter.values {
                    params.push(json_to_sql(value)?);
                }
            }
            FilterOp::LessThan | FilterOp::GreaterThan => {
                let [value] = filter.values.as_slice() else {
                    return Err(ExperimentError::validation(format!(
                        "comparison filter on {} requires exactly one value",
                        filter.field
                    )));
                };
                let op = if filter.op == FilterOp::LessThan { "<" } else { ">" };
                fragment.push_str(&format!("\nAND {expr} {op} ?"));
                params.push(json_to_sql(value)?);
            }
        }
    }
    Ok(fragment)
}

fn json_to_sql(value: &Value) -> Result<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(ExperimentError::validation("unsupported numeric filter value"))
            }
        }
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        _ => Err(ExperimentError::validation(
            "filter values must be scalars",
        )),
    }
}

fn db_err(e: rusqlite::Error) -> ExperimentError {
    ExperimentError::internal(format!("trial log store: {e}"))
}

pub struct TrialLogStore {
    conn: Connection,
}

impl TrialLogStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trial_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trial_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                agent_id TEXT,
                container_id TEXT,
                rank_id INTEGER,
                timestamp TEXT,
                level TEXT,
                stdtype TEXT,
                source TEXT
            );
            CREATE INDEX IF NOT EXISTS ix_trial_logs_trial_id ON trial_logs (trial_id);",
        )
        .map_err(db_err)?;
        Ok(Self { conn })
    }

    /// Insert a batch of logs as one multi-row statement.
    pub fn add_trial_logs(&self, logs: &[TrialLog]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut sql = String::from(
            "INSERT INTO trial_logs
  (trial_id, message, agent_id, container_id, rank_id, timestamp, level, stdtype, source)
 VALUES",
        );
        let mut params: Vec<SqlValue> = Vec::with_capacity(logs.len() * 9);
        for (i, log) in logs.iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push_str(" (?, ?, ?, ?, ?, ?, ?, ?, ?)");
            params.push(SqlValue::Integer(log.trial_id));
            params.push(SqlValue::Text(log.message.clone()));
            params.push(opt_text(&log.agent_id));
            params.push(opt_text(&log.container_id));
            params.push(match log.rank_id {
                Some(r) => SqlValue::Integer(r),
                None => SqlValue::Null,
            });
            params.push(match &log.timestamp {
                Some(ts) => SqlValue::Text(ts.to_rfc3339()),
                None => SqlValue::Null,
            });
            params.push(opt_text(&log.level));
            params.push(opt_text(&log.std_type));
            params.push(opt_text(&log.source));
        }

        self.conn
            .execute(&sql, params_from_iter(params))
            .map_err(db_err)?;
        Ok(())
    }

    /// Logs for one trial, filtered, ordered by timestamp and paginated.
    pub fn trial_logs(
        &self,
        trial_id: i64,
        offset: i64,
        limit: i64,
        filters: &[Filter],
        order: OrderBy,
    ) -> Result<Vec<TrialLog>> {
        let mut params: Vec<SqlValue> = vec![SqlValue::Integer(trial_id)];
        let fragment = filters_to_sql(filters, &mut params)?;
        let sql = format!(
            "SELECT id, trial_id, message, agent_id, container_id, rank_id, timestamp, level, stdtype, source
FROM trial_logs
WHERE trial_id = ?{fragment}
ORDER BY timestamp {order}, id {order}
LIMIT ? OFFSET ?",
            order = order.to_sql(),
        );
        params.push(SqlValue::Integer(limit));
        params.push(SqlValue::Integer(offset));

        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(params), row_to_log)
            .map_err(db_err)?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.map_err(db_err)?);
        }
        Ok(logs)
    }

    pub fn trial_logs_count(&self, trial_id: i64, filters: &[Filter]) -> Result<i64> {
        let mut params: Vec<SqlValue> = vec![SqlValue::Integer(trial_id)];
        let fragment = filters_to_sql(filters, &mut params)?;
        let sql = format!("SELECT count(*) FROM trial_logs WHERE trial_id = ?{fragment}");
        self.conn
            .query_row(&sql, params_from_iter(params), |row| row.get(0))
            .map_err(db_err)
    }

    pub fn delete_trial_logs(&self, trial_ids: &[i64]) -> Result<()> {
        if trial_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; trial_ids.len()].join(", ");
        let sql = format!("DELETE FROM trial_logs WHERE trial_id IN ({placeholders})");
        let params: Vec<SqlValue> = trial_ids.iter().map(|id| SqlValue::Integer(*id)).collect();
        self.conn
            .execute(&sql, params_from_iter(params))
            .map_err(db_err)?;
        Ok(())
    }

    /// Distinct filterable values present in one trial's logs.
    pub fn trial_log_fields(&self, trial_id: i64) -> Result<TrialLogFields> {
        Ok(TrialLogFields {
            agent_ids: self.distinct_text(trial_id, "agent_id")?,
            container_ids: self.distinct_text(trial_id, "container_id")?,
            rank_ids: self.distinct_ints(trial_id, "rank_id")?,
            sources: self.distinct_text(trial_id, "source")?,
            std_types: self.distinct_text(trial_id, "stdtype")?,
        })
    }

    fn distinct_text(&self, trial_id: i64, column: &'static str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {column} FROM trial_logs
WHERE trial_id = ? AND {column} IS NOT NULL ORDER BY {column}"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map([trial_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn distinct_ints(&self, trial_id: i64, column: &'static str) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT DISTINCT {column} FROM trial_logs
WHERE trial_id = ? AND {column} IS NOT NULL ORDER BY {column}"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map([trial_id], |row| row.get::<_, i64>(0))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

fn opt_text(value: &Option<String>) -> SqlValue {
    match value {
        Some(s) => SqlValue::Text(s.clone()),
        None => SqlValue::Null,
    }
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrialLog> {
    let timestamp: Option<String> = row.get(6)?;
    Ok(TrialLog {
        id: row.get(0)?,
        trial_id: row.get(1)?,
        message: row.get(2)?,
        agent_id: row.get(3)?,
        container_id: row.get(4)?,
        rank_id: row.get(5)?,
        timestamp: timestamp.and_then(|ts| {
            DateTime::parse_from_rfc3339(&ts)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
        level: row.get(7)?,
        std_type: row.get(8)?,
        source: row.get(9)?,
    })
}
