use std::sync::Arc;

use rusqlite::hooks::AuthContext;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, ToSql};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::auth::AuthorizationPolicy;
use crate::protocol::{ErrorInfo, Request, Response};

/// Core value types for SQLite operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// One result row, in column order.
pub type Row = Vec<Value>;

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Value::Null => ValueRef::Null,
            Value::Integer(i) => ValueRef::Integer(*i),
            Value::Real(f) => ValueRef::Real(*f),
            Value::Text(t) => ValueRef::Text(t.as_bytes()),
            Value::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

/// Parameter bindings for SQL queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Params {
    /// Positional values for one execution.
    Positional(Vec<Value>),
    /// One row of positional values per execution, for `execute_many`.
    Batch(Vec<Vec<Value>>),
}

impl Default for Params {
    fn default() -> Self {
        Params::Positional(Vec::new())
    }
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::Positional(values) => values.is_empty(),
            Params::Batch(rows) => rows.is_empty(),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<Vec<Vec<Value>>> for Params {
    fn from(rows: Vec<Vec<Value>>) -> Self {
        Params::Batch(rows)
    }
}

/// The server's single persistent connection.
///
/// Opened in WAL mode so the backup reader never blocks this writer, with
/// the authorization policy installed as the engine's authorizer.
#[derive(Debug)]
pub struct Database {
    connection: Connection,
}

impl Database {
    /// Open `path` (or `:memory:`) in WAL mode and install `policy`.
    pub fn open(path: &str, policy: AuthorizationPolicy) -> rusqlite::Result<Self> {
        let connection = Connection::open(path)?;
        connection.pragma_update(None, "journal_mode", "WAL")?;

        let policy = Arc::new(policy);
        connection.authorizer(Some(move |ctx: AuthContext<'_>| {
            policy.evaluate_action(&ctx.action).into()
        }));

        Ok(Self { connection })
    }

    /// Execute one request. Engine failures are returned inside the
    /// response.
    pub fn execute(&mut self, request: &Request) -> Response {
        match self.run(request) {
            Ok(response) => response,
            Err(failure) => {
                error!(query = %request.query, error = %failure.message, "exception while executing query");
                Response::failure(failure)
            }
        }
    }

    fn run(&mut self, request: &Request) -> Result<Response, ErrorInfo> {
        if request.has_conflicting_modes() {
            return Err(programming_error(
                "both execute_script and execute_many cannot be set",
            ));
        }

        let (items, rowcount) = if request.execute_script {
            debug!("sqlite remote execute: execute_script");
            self.connection
                .execute_batch(&request.query)
                .map_err(|e| summarize(&e))?;
            (Vec::new(), None)
        } else if request.execute_many && !request.params.is_empty() {
            debug!("sqlite remote execute: execute_many");
            let Params::Batch(rows) = &request.params else {
                return Err(programming_error(
                    "execute_many requires a batch of parameter rows",
                ));
            };
            (Vec::new(), Some(self.execute_many(&request.query, rows)?))
        } else {
            let values = match &request.params {
                Params::Positional(values) => values.as_slice(),
                Params::Batch(rows) if rows.is_empty() => &[][..],
                Params::Batch(_) => {
                    return Err(programming_error(
                        "a batch of parameter rows requires execute_many",
                    ))
                }
            };
            debug!(params = values.len(), "sqlite remote execute: execute");
            let (items, changed) = self.execute_one(&request.query, values)?;
            (items, is_dml(&request.query).then_some(changed))
        };

        let lastrowid = self.connection.last_insert_rowid();
        Ok(Response::rows(items)
            .with_rowcount(rowcount)
            .with_lastrowid((lastrowid != 0).then_some(lastrowid)))
    }

    fn execute_many(&self, query: &str, rows: &[Vec<Value>]) -> Result<i64, ErrorInfo> {
        let mut statement = self.connection.prepare(query).map_err(|e| summarize(&e))?;
        let mut total = 0i64;
        for row in rows {
            let changed = statement
                .execute(params_from_iter(row.iter()))
                .map_err(|e| summarize(&e))?;
            total += changed as i64;
        }
        Ok(total)
    }

    fn execute_one(&self, query: &str, values: &[Value]) -> Result<(Vec<Row>, i64), ErrorInfo> {
        let mut statement = self.connection.prepare(query).map_err(|e| summarize(&e))?;
        let columns = statement.column_count();
        if columns == 0 {
            let changed = statement
                .execute(params_from_iter(values.iter()))
                .map_err(|e| summarize(&e))?;
            return Ok((Vec::new(), changed as i64));
        }

        let mut items = Vec::new();
        let mut rows = statement
            .query(params_from_iter(values.iter()))
            .map_err(|e| summarize(&e))?;
        while let Some(row) = rows.next().map_err(|e| summarize(&e))? {
            let mut out = Vec::with_capacity(columns);
            for index in 0..columns {
                out.push(Value::from(row.get_ref(index).map_err(|e| summarize(&e))?));
            }
            items.push(out);
        }
        drop(rows);
        Ok((items, self.connection.changes() as i64))
    }
}

/// Leading keyword is INSERT, UPDATE, DELETE or REPLACE.
fn is_dml(query: &str) -> bool {
    let keyword: String = query
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    matches!(
        keyword.to_ascii_uppercase().as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE"
    )
}

/// Error class in the style of the DB-API exception hierarchy.
fn error_class(err: &rusqlite::Error) -> &'static str {
    use rusqlite::Error;

    match err {
        Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::ConstraintViolation => "IntegrityError",
            ErrorCode::Unknown
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::ReadOnly
            | ErrorCode::DiskFull
            | ErrorCode::CannotOpen
            | ErrorCode::OperationInterrupted => "OperationalError",
            _ => "DatabaseError",
        },
        Error::InvalidParameterCount(..)
        | Error::InvalidParameterName(_)
        | Error::MultipleStatement
        | Error::ExecuteReturnedResults
        | Error::InvalidQuery => "ProgrammingError",
        Error::FromSqlConversionFailure(..)
        | Error::ToSqlConversionFailure(_)
        | Error::InvalidColumnType(..)
        | Error::Utf8Error(_)
        | Error::NulError(_) => "InterfaceError",
        _ => "DatabaseError",
    }
}

fn summarize(err: &rusqlite::Error) -> ErrorInfo {
    let kind = format!("sqlite.{}", error_class(err));
    let message = format!("{kind}: {err}");
    ErrorInfo::new(kind, message)
}

fn programming_error(message: &str) -> ErrorInfo {
    ErrorInfo::new(
        "sqlite.ProgrammingError",
        format!("sqlite.ProgrammingError: {message}"),
    )
}
