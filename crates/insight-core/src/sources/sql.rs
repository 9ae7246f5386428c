// crates/insight-core/src/sources/sql.rs

use std::future::Future;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::any::AnyRow;
use sqlx::mysql::{MySqlConnection, MySqlRow};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{
    AnyConnection, Column as _, Connection, Executor as _, Row, Statement as _, TypeInfo as _,
    ValueRef as _,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::InsightError;
use crate::table::date_to_days;

#[derive(Debug, Error)]
enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("query failed: {0}")]
    Execute(#[source] sqlx::Error),
    #[error("no native client for scheme '{0}'")]
    Unsupported(String),
    #[error("column '{column}' has type {type_name}, which cannot be loaded")]
    Undecodable { column: String, type_name: String },
    #[error("could not build table from rows: {0}")]
    Frame(#[from] PolarsError),
}

impl ClientError {
    fn into_insight(self, source_name: &str) -> InsightError {
        let source_name = source_name.to_string();
        match self {
            ClientError::Connect(_) | ClientError::Unsupported(_) => InsightError::Connection {
                source_name,
                message: self.to_string(),
            },
            ClientError::Execute(_) | ClientError::Undecodable { .. } | ClientError::Frame(_) => {
                InsightError::Query {
                    source_name,
                    message: self.to_string(),
                }
            }
        }
    }
}

/// Runs `query` with the native driver for the URL scheme, then with the
/// generic `Any` driver if that fails. Both attempts send the same text.
pub async fn run_query(
    source_name: &str,
    connection_string: &str,
    query: &str,
) -> Result<DataFrame, InsightError> {
    debug!(source = source_name, query, "executing source query");
    with_fallback(
        source_name,
        fetch_native(connection_string, query),
        || fetch_universal(connection_string, query),
    )
    .await
}

/// Awaits `native`; on failure awaits the future built by `universal`, whose
/// error is the one reported.
async fn with_fallback<N, F, U>(
    source_name: &str,
    native: N,
    universal: F,
) -> Result<DataFrame, InsightError>
where
    N: Future<Output = Result<DataFrame, ClientError>>,
    F: FnOnce() -> U,
    U: Future<Output = Result<DataFrame, ClientError>>,
{
    match native.await {
        Ok(df) => {
            info!(source = source_name, rows = df.height(), client = "native", "loaded query source");
            return Ok(df);
        }
        Err(err) => {
            warn!(source = source_name, error = %err, "native client failed, retrying with generic client");
        }
    }

    let df = universal()
        .await
        .map_err(|err| err.into_insight(source_name))?;
    info!(source = source_name, rows = df.height(), client = "any", "loaded query source");
    Ok(df)
}

fn scheme(connection_string: &str) -> &str {
    connection_string
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .unwrap_or(connection_string)
}

// Connects, fetches every row and closes. A result without rows still keeps
// the column names and declared types, taken from the prepared statement.
macro_rules! fetch_with {
    ($conn:ty, $url:expr, $query:expr, $decode:expr, $temporal:expr) => {{
        let mut conn = <$conn>::connect($url).await.map_err(ClientError::Connect)?;
        let frame = match sqlx::query($query).fetch_all(&mut conn).await {
            Ok(rows) if rows.is_empty() => match (&mut conn).prepare($query).await {
                Ok(statement) => empty_frame(statement.columns(), $temporal).map_err(ClientError::from),
                Err(err) => Err(ClientError::Execute(err)),
            },
            Ok(rows) => rows_to_frame(&rows, $decode),
            Err(err) => Err(ClientError::Execute(err)),
        };
        if let Err(err) = conn.close().await {
            warn!(error = %err, "failed to close database connection cleanly");
        }
        frame
    }};
}

async fn fetch_native(connection_string: &str, query: &str) -> Result<DataFrame, ClientError> {
    match scheme(connection_string) {
        "postgres" | "postgresql" => {
            fetch_with!(PgConnection, connection_string, query, decode_pg, true)
        }
        "mysql" => fetch_with!(MySqlConnection, connection_string, query, decode_mysql, true),
        "sqlite" => fetch_with!(SqliteConnection, connection_string, query, decode_sqlite, false),
        other => Err(ClientError::Unsupported(other.to_string())),
    }
}

async fn fetch_universal(connection_string: &str, query: &str) -> Result<DataFrame, ClientError> {
    sqlx::any::install_default_drivers();
    fetch_with!(AnyConnection, connection_string, query, decode_any, false)
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

// Tries each type in order; the first one the driver accepts wins. A non-null
// value no decoder accepts is an error rather than a silent null.
macro_rules! decode_cell {
    ($row:expr, $idx:expr, $( $ty:ty => $wrap:expr ),+ $(,)?) => {{
        $(
            if let Ok(value) = $row.try_get::<Option<$ty>, _>($idx) {
                return Ok(match value {
                    Some(v) => $wrap(v),
                    None => Cell::Null,
                });
            }
        )+
        undecodable($row, $idx)
    }};
}

fn undecodable<R>(row: &R, idx: usize) -> Result<Cell, ClientError>
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
{
    let raw = row.try_get_raw(idx).map_err(ClientError::Execute)?;
    if raw.is_null() {
        return Ok(Cell::Null);
    }
    Err(ClientError::Undecodable {
        column: row.column(idx).name().to_string(),
        type_name: raw.type_info().name().to_string(),
    })
}

fn decimal_cell(value: Decimal) -> Cell {
    value.to_f64().map_or(Cell::Null, Cell::Float)
}

fn decode_pg(row: &PgRow, idx: usize) -> Result<Cell, ClientError> {
    decode_cell!(row, idx,
        i64 => Cell::Int,
        i32 => |v: i32| Cell::Int(v.into()),
        i16 => |v: i16| Cell::Int(v.into()),
        f64 => Cell::Float,
        f32 => |v: f32| Cell::Float(v.into()),
        Decimal => decimal_cell,
        bool => Cell::Bool,
        NaiveDate => Cell::Date,
        NaiveDateTime => Cell::DateTime,
        DateTime<Utc> => |v: DateTime<Utc>| Cell::DateTime(v.naive_utc()),
        String => Cell::Text,
    )
}

fn decode_mysql(row: &MySqlRow, idx: usize) -> Result<Cell, ClientError> {
    decode_cell!(row, idx,
        i64 => Cell::Int,
        i32 => |v: i32| Cell::Int(v.into()),
        u32 => |v: u32| Cell::Int(v.into()),
        f64 => Cell::Float,
        f32 => |v: f32| Cell::Float(v.into()),
        Decimal => decimal_cell,
        NaiveDate => Cell::Date,
        NaiveDateTime => Cell::DateTime,
        String => Cell::Text,
        bool => Cell::Bool,
    )
}

fn decode_sqlite(row: &SqliteRow, idx: usize) -> Result<Cell, ClientError> {
    decode_cell!(row, idx,
        i64 => Cell::Int,
        f64 => Cell::Float,
        String => Cell::Text,
        bool => Cell::Bool,
    )
}

fn decode_any(row: &AnyRow, idx: usize) -> Result<Cell, ClientError> {
    decode_cell!(row, idx,
        i64 => Cell::Int,
        f64 => Cell::Float,
        bool => Cell::Bool,
        String => Cell::Text,
    )
}

fn rows_to_frame<R: Row>(
    rows: &[R],
    decode: fn(&R, usize) -> Result<Cell, ClientError>,
) -> Result<DataFrame, ClientError> {
    let Some(first) = rows.first() else {
        return Ok(DataFrame::empty());
    };

    let names: Vec<String> = first
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();

    let mut values: Vec<Vec<Cell>> = vec![Vec::with_capacity(rows.len()); names.len()];
    for row in rows {
        for (idx, column_values) in values.iter_mut().enumerate() {
            column_values.push(decode(row, idx)?);
        }
    }

    let columns = names
        .iter()
        .zip(values)
        .map(|(name, cells)| cells_to_column(name, cells))
        .collect::<PolarsResult<Vec<Column>>>()?;

    Ok(DataFrame::new(columns)?)
}

/// Maps a declared SQL type name to the column type rows of that type decode to.
/// Date types only map to temporal columns for drivers that decode them as such.
fn declared_dtype(type_name: &str, temporal: bool) -> DataType {
    let upper = type_name.to_ascii_uppercase();
    let is = |needle: &str| upper.contains(needle);

    if is("BOOL") {
        DataType::Boolean
    } else if (is("INT") && !is("INTERVAL") && !is("POINT")) || upper.ends_with("SERIAL") {
        DataType::Int64
    } else if is("REAL") || is("FLOAT") || is("DOUBLE") || is("NUMERIC") || is("DECIMAL") {
        DataType::Float64
    } else if temporal && upper == "DATE" {
        DataType::Date
    } else if temporal && (is("TIMESTAMP") || is("DATETIME")) {
        DataType::Datetime(TimeUnit::Microseconds, None)
    } else {
        DataType::String
    }
}

fn empty_frame<C: sqlx::Column>(columns: &[C], temporal: bool) -> PolarsResult<DataFrame> {
    let columns = columns
        .iter()
        .map(|column| {
            let dtype = declared_dtype(column.type_info().name(), temporal);
            Column::new_empty(column.name().into(), &dtype)
        })
        .collect();
    DataFrame::new(columns)
}

fn cells_to_column(name: &str, cells: Vec<Cell>) -> PolarsResult<Column> {
    let non_null = || cells.iter().filter(|cell| **cell != Cell::Null);
    let all = |pred: fn(&Cell) -> bool| non_null().next().is_some() && non_null().all(pred);

    let series = if all(|c| matches!(c, Cell::Int(_))) {
        let values: Vec<Option<i64>> = cells
            .iter()
            .map(|c| match c {
                Cell::Int(v) => Some(*v),
                _ => None,
            })
            .collect();
        Series::new(name.into(), values)
    } else if all(|c| matches!(c, Cell::Int(_) | Cell::Float(_))) {
        let values: Vec<Option<f64>> = cells
            .iter()
            .map(|c| match c {
                Cell::Int(v) => Some(*v as f64),
                Cell::Float(v) => Some(*v),
                _ => None,
            })
            .collect();
        Series::new(name.into(), values)
    } else if all(|c| matches!(c, Cell::Bool(_))) {
        let values: Vec<Option<bool>> = cells
            .iter()
            .map(|c| match c {
                Cell::Bool(v) => Some(*v),
                _ => None,
            })
            .collect();
        Series::new(name.into(), values)
    } else if all(|c| matches!(c, Cell::Date(_))) {
        let days: Vec<Option<i32>> = cells
            .iter()
            .map(|c| match c {
                Cell::Date(v) => Some(date_to_days(*v)),
                _ => None,
            })
            .collect();
        Series::new(name.into(), days).cast(&DataType::Date)?
    } else if all(|c| matches!(c, Cell::DateTime(_))) {
        let micros: Vec<Option<i64>> = cells
            .iter()
            .map(|c| match c {
                Cell::DateTime(v) => Some(v.and_utc().timestamp_micros()),
                _ => None,
            })
            .collect();
        Series::new(name.into(), micros)
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?
    } else {
        let values: Vec<Option<String>> = cells.iter().map(cell_to_text).collect();
        Series::new(name.into(), values)
    };

    Ok(series.into())
}

fn cell_to_text(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Null => None,
        Cell::Bool(v) => Some(v.to_string()),
        Cell::Int(v) => Some(v.to_string()),
        Cell::Float(v) => Some(v.to_string()),
        Cell::Text(v) => Some(v.clone()),
        Cell::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
        Cell::DateTime(v) => Some(v.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}
