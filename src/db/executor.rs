use async_trait::async_trait;
use duckdb::types::Value;
use r2d2::Pool;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::db::db_pool::DuckDBConnectionManager;

/// One cell of a result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ScalarValue {
    /// Numeric reading of the cell, if it has one. Numeric text counts.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Integer(i) => Some(*i as f64),
            ScalarValue::Real(r) if r.is_finite() => Some(*r),
            ScalarValue::Text(t) => t.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(b) => write!(f, "{}", b),
            ScalarValue::Integer(i) => write!(f, "{}", i),
            ScalarValue::Real(r) => write!(f, "{}", r),
            ScalarValue::Text(t) => write!(f, "{}", t),
        }
    }
}

impl From<Value> for ScalarValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ScalarValue::Null,
            Value::Boolean(b) => ScalarValue::Boolean(b),
            Value::TinyInt(i) => ScalarValue::Integer(i.into()),
            Value::SmallInt(i) => ScalarValue::Integer(i.into()),
            Value::Int(i) => ScalarValue::Integer(i.into()),
            Value::BigInt(i) => ScalarValue::Integer(i),
            Value::UTinyInt(i) => ScalarValue::Integer(i.into()),
            Value::USmallInt(i) => ScalarValue::Integer(i.into()),
            Value::UInt(i) => ScalarValue::Integer(i.into()),
            Value::UBigInt(i) => i64::try_from(i)
                .map(ScalarValue::Integer)
                .unwrap_or(ScalarValue::Real(i as f64)),
            Value::HugeInt(i) => i64::try_from(i)
                .map(ScalarValue::Integer)
                .unwrap_or(ScalarValue::Real(i as f64)),
            Value::Float(v) => ScalarValue::Real(v.into()),
            Value::Double(v) => ScalarValue::Real(v),
            Value::Decimal(d) => d
                .to_string()
                .parse::<f64>()
                .map(ScalarValue::Real)
                .unwrap_or_else(|_| ScalarValue::Text(d.to_string())),
            Value::Text(s) | Value::Enum(s) => ScalarValue::Text(s),
            Value::Date32(days) => chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days.into())))
                .map(|d| ScalarValue::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(ScalarValue::Integer(days.into())),
            other => ScalarValue::Text(format!("{:?}", other)),
        }
    }
}

/// Ordered rows of ordered scalar values, plus the column names.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ScalarValue>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Every numeric cell, in row-major order.
    pub fn numeric_values(&self) -> Vec<f64> {
        self.rows
            .iter()
            .flat_map(|row| row.iter().filter_map(ScalarValue::as_f64))
            .collect()
    }

    /// Compact text rendering of the result for the answer oracle.
    pub fn summarize(&self) -> String {
        match (self.rows.len(), self.columns.len()) {
            (0, _) => "No results found.".to_string(),
            (1, 1) => format!("Result: {}", self.rows[0][0]),
            (n, _) if n <= 10 => self.render_table(n),
            (n, _) => format!("Found {} results. First 5:\n{}", n, self.render_table(5)),
        }
    }

    fn render_table(&self, limit: usize) -> String {
        let mut out = self.columns.join(" | ");
        for row in self.rows.iter().take(limit) {
            out.push('\n');
            let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
            out.push_str(&cells.join(" | "));
        }
        out
    }

    /// Short single-line preview, used when annotating low-confidence answers.
    pub fn preview(&self, max_rows: usize) -> String {
        let rows: Vec<String> = self
            .rows
            .iter()
            .take(max_rows)
            .map(|row| {
                let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
                format!("({})", cells.join(", "))
            })
            .collect();
        let mut out = format!("[{}]", rows.join(", "));
        if self.rows.len() > max_rows {
            out.push_str(&format!(" … {} rows total", self.rows.len()));
        }
        out
    }
}

#[derive(Debug)]
pub enum DataError {
    PoolError(String),
    QueryError(String),
    TaskError(String),
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::PoolError(msg) => write!(f, "Database connection error: {}", msg),
            DataError::QueryError(msg) => write!(f, "SQL execution error: {}", msg),
            DataError::TaskError(msg) => write!(f, "Database task execution failed: {}", msg),
        }
    }
}

impl Error for DataError {}

/// Read-only statement execution. Exactly one statement per call.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryResult, DataError>;

    /// Connectivity check used by the status endpoint.
    fn is_healthy(&self) -> bool {
        true
    }
}

pub struct DuckDbExecutor {
    pool: Pool<DuckDBConnectionManager>,
}

impl DuckDbExecutor {
    pub fn new(pool: Pool<DuckDBConnectionManager>) -> Self {
        Self { pool }
    }

    fn run(pool: &Pool<DuckDBConnectionManager>, sql: &str) -> Result<QueryResult, DataError> {
        let conn = pool.get().map_err(|e| DataError::PoolError(e.to_string()))?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DataError::QueryError(e.to_string()))?;

        let mut rows = Vec::new();
        {
            let mut result_rows = stmt
                .query([])
                .map_err(|e| DataError::QueryError(e.to_string()))?;

            while let Some(row) = result_rows
                .next()
                .map_err(|e| DataError::QueryError(e.to_string()))?
            {
                let column_count = row.as_ref().column_count();
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    let value = row
                        .get::<_, Value>(i)
                        .map_err(|e| DataError::QueryError(e.to_string()))?;
                    values.push(ScalarValue::from(value));
                }
                rows.push(values);
            }
        }

        let columns = stmt.column_names();
        Ok(QueryResult::new(columns, rows))
    }
}

#[async_trait]
impl QueryExecutor for DuckDbExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryResult, DataError> {
        let pool = self.pool.clone();
        let sql_to_execute = sql.to_string();
        info!("Executing SQL: {}", sql_to_execute);

        // DuckDB calls block, keep them off the async workers
        let blocking_task = tokio::task::spawn_blocking(move || {
            let start_time = Instant::now();
            let result = Self::run(&pool, &sql_to_execute);
            debug!("Query finished in {}ms", start_time.elapsed().as_millis());
            result
        });

        match blocking_task.await {
            Ok(Ok(result)) => {
                info!("Query executed successfully. Row count: {}", result.row_count());
                Ok(result)
            }
            Ok(Err(e)) => Err(e),
            Err(join_err) => {
                error!("Task join error: {}", join_err);
                Err(DataError::TaskError(join_err.to_string()))
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.pool
            .get()
            .map(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0)).is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::db_pool::DuckDBConnectionManager;

    fn sample() -> QueryResult {
        QueryResult::new(
            vec!["city".into(), "n".into(), "avg_rent".into()],
            vec![
                vec![ScalarValue::Text("Phoenix".into()), ScalarValue::Integer(4), ScalarValue::Real(970.49)],
                vec![ScalarValue::Text("Miami".into()), ScalarValue::Integer(2), ScalarValue::Null],
            ],
        )
    }

    #[test]
    fn numeric_values_skip_non_numeric_cells() {
        assert_eq!(sample().numeric_values(), vec![4.0, 970.49, 2.0]);
        let text = QueryResult::new(vec!["x".into()], vec![vec![ScalarValue::Text("12.5".into())]]);
        assert_eq!(text.numeric_values(), vec![12.5]);
    }

    #[test]
    fn summarize_matches_result_shape() {
        assert_eq!(QueryResult::default().summarize(), "No results found.");
        let single = QueryResult::new(vec!["count".into()], vec![vec![ScalarValue::Integer(12)]]);
        assert_eq!(single.summarize(), "Result: 12");
        assert!(sample().summarize().starts_with("city | n | avg_rent\nPhoenix | 4 | 970.49"));

        let many = QueryResult::new(
            vec!["id".into()],
            (0..12).map(|i| vec![ScalarValue::Integer(i)]).collect(),
        );
        let summary = many.summarize();
        assert!(summary.starts_with("Found 12 results. First 5:"));
        assert_eq!(summary.lines().count(), 7);
    }

    #[test]
    fn preview_truncates() {
        let preview = sample().preview(1);
        assert!(preview.starts_with("[(Phoenix, 4, 970.49)]"));
        assert!(preview.contains("2 rows total"));
    }

    #[tokio::test]
    async fn executes_against_duckdb_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.duckdb");
        {
            let conn = duckdb::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE Properties (property_id INTEGER, owner_id INTEGER, state VARCHAR, purchase_price DOUBLE);
                 INSERT INTO Properties VALUES (1, 2, 'AZ', 150000.5), (2, 2, 'TX', 200000), (3, 3, 'AZ', 99000);",
            )
            .unwrap();
        }

        let manager = DuckDBConnectionManager::read_only(path.to_string_lossy().to_string());
        let pool = Pool::builder().max_size(1).build(manager).unwrap();
        let executor = DuckDbExecutor::new(pool);
        assert!(executor.is_healthy());

        let result = executor
            .execute("SELECT state, COUNT(*) AS n FROM Properties WHERE owner_id = 2 GROUP BY state ORDER BY state")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["state".to_string(), "n".to_string()]);
        assert_eq!(result.rows[0], vec![ScalarValue::Text("AZ".into()), ScalarValue::Integer(1)]);

        let err = executor.execute("SELECT missing_column FROM Properties").await.unwrap_err();
        assert!(matches!(err, DataError::QueryError(_)));

        let write = executor.execute("INSERT INTO Properties VALUES (9, 9, 'CA', 1)").await;
        assert!(write.is_err());
    }
}
