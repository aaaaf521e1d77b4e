//! Driver seam
//!
//! Provides the `Session` trait that abstracts statement execution against a
//! Cassandra-compatible cluster. The migration engine only ever talks to the
//! cluster through this trait, so any driver (or a test double) can be plugged in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Consistency levels understood by Cassandra-compatible clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
}

impl Consistency {
    /// Whether reads and writes at this level overlap on a majority of replicas
    ///
    /// Lock correctness depends on linearizable compare-and-swap, which in
    /// turn needs at least quorum-equivalent reads and writes.
    #[must_use]
    pub fn is_quorum_or_stronger(self) -> bool {
        matches!(
            self,
            Consistency::Quorum
                | Consistency::All
                | Consistency::LocalQuorum
                | Consistency::EachQuorum
                | Consistency::Serial
                | Consistency::LocalSerial
        )
    }

    /// Whether this level is valid as the serial phase of a lightweight transaction
    #[must_use]
    pub fn is_serial(self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::Serial => "SERIAL",
            Consistency::LocalSerial => "LOCAL_SERIAL",
            Consistency::LocalOne => "LOCAL_ONE",
        };
        f.write_str(name)
    }
}

/// A value bound to a statement or read back from a row
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    BigInt(i64),
    Text(String),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
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

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A CQL statement with positional (`?`) bound values and execution options
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// CQL text
    pub cql: String,
    /// Values bound to the `?` markers, in order
    pub values: Vec<Value>,
    /// Consistency level for the regular phase of the request
    pub consistency: Consistency,
    /// Consistency level for the Paxos phase of a conditional (`IF ...`) statement
    pub serial_consistency: Option<Consistency>,
    /// Upper bound on how long the driver may wait for a response
    pub timeout: Option<Duration>,
}

impl Statement {
    /// Create a statement with no bound values at `QUORUM`
    pub fn new(cql: impl Into<String>) -> Self {
        Self {
            cql: cql.into(),
            values: Vec::new(),
            consistency: Consistency::Quorum,
            serial_consistency: None,
            timeout: None,
        }
    }

    /// Bind the next positional value
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.values.push(value.into());
        self
    }

    #[must_use]
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    #[must_use]
    pub fn with_serial_consistency(mut self, consistency: Consistency) -> Self {
        self.serial_consistency = Some(consistency);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Name of the column a cluster returns for conditional statements
pub const APPLIED_COLUMN: &str = "[applied]";

/// A single result row, columns addressed by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column (builder style, mostly used by drivers and tests)
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.push((name.into(), value.into()));
        self
    }

    /// Raw column lookup
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    fn require(&self, name: &str) -> Result<&Value, SessionError> {
        self.get(name).ok_or_else(|| SessionError::decode(format!("missing column '{name}'")))
    }

    /// Read an integer column (accepts both `int` and `bigint`)
    ///
    /// # Errors
    ///
    /// Returns a decode error if the column is missing, null or not an integer.
    pub fn get_i64(&self, name: &str) -> Result<i64, SessionError> {
        match self.require(name)? {
            Value::Int(v) => Ok(i64::from(*v)),
            Value::BigInt(v) => Ok(*v),
            other => Err(SessionError::decode(format!(
                "column '{name}' is not an integer: {other:?}"
            ))),
        }
    }

    /// Read an optional integer column (missing or null yields `None`)
    ///
    /// # Errors
    ///
    /// Returns a decode error if the column holds a non-integer value.
    pub fn get_opt_i64(&self, name: &str) -> Result<Option<i64>, SessionError> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get_i64(name).map(Some),
        }
    }

    /// # Errors
    ///
    /// Returns a decode error if the column is missing, null or not text.
    pub fn get_text(&self, name: &str) -> Result<String, SessionError> {
        match self.require(name)? {
            Value::Text(v) => Ok(v.clone()),
            other => Err(SessionError::decode(format!(
                "column '{name}' is not text: {other:?}"
            ))),
        }
    }

    /// # Errors
    ///
    /// Returns a decode error if the column is missing, null or not a boolean.
    pub fn get_bool(&self, name: &str) -> Result<bool, SessionError> {
        match self.require(name)? {
            Value::Boolean(v) => Ok(*v),
            other => Err(SessionError::decode(format!(
                "column '{name}' is not a boolean: {other:?}"
            ))),
        }
    }

    /// # Errors
    ///
    /// Returns a decode error if the column is missing, null or not a timestamp.
    pub fn get_timestamp(&self, name: &str) -> Result<DateTime<Utc>, SessionError> {
        match self.require(name)? {
            Value::Timestamp(v) => Ok(*v),
            other => Err(SessionError::decode(format!(
                "column '{name}' is not a timestamp: {other:?}"
            ))),
        }
    }
}

/// Rows returned by a statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// An empty result, as returned by DDL and unconditional writes
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// The single row a conditional statement returns
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Outcome of a lightweight transaction (`IF NOT EXISTS`, `IF col = ?`)
    ///
    /// # Errors
    ///
    /// Returns a decode error if the result carries no `[applied]` column,
    /// which means the statement was not conditional.
    pub fn applied(&self) -> Result<bool, SessionError> {
        let row = self.first().ok_or_else(|| {
            SessionError::decode("conditional statement returned no rows".to_string())
        })?;
        row.get_bool(APPLIED_COLUMN)
    }
}

/// Broad classification of driver faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// The request did not complete within its timeout
    Timeout,
    /// Not enough replicas were alive to satisfy the consistency level
    Unavailable,
    /// The connection to the cluster failed or was lost
    Connection,
    /// The cluster rejected the statement (syntax, invalid schema change, ...)
    Query,
    /// The response could not be decoded into the expected shape
    Decode,
}

impl SessionErrorKind {
    /// Transport-level faults, as opposed to faults caused by the statement itself
    #[must_use]
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            SessionErrorKind::Timeout | SessionErrorKind::Unavailable | SessionErrorKind::Connection
        )
    }
}

/// Fault raised by a `Session`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Timeout, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Query, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Decode, message)
    }
}

/// Trait for executing statements against the cluster
///
/// Implementations wrap a driver session. They must honour
/// [`Statement::timeout`] and report an expired request as
/// [`SessionErrorKind::Timeout`] rather than blocking indefinitely, and must
/// pass [`Statement::serial_consistency`] through for conditional statements.
///
/// # Examples
///
/// ```no_run
/// use harbormaster::session::{Consistency, Session, SessionError, Statement};
///
/// fn count_tables(session: &dyn Session) -> Result<usize, SessionError> {
///     let rows = session.execute(
///         &Statement::new("SELECT table_name FROM system_schema.tables WHERE keyspace_name = ?")
///             .bind("app")
///             .with_consistency(Consistency::One),
///     )?;
///     Ok(rows.rows.len())
/// }
/// ```
pub trait Session {
    /// Execute a single statement
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the request fails, times out or is rejected.
    fn execute(&self, statement: &Statement) -> Result<ResultSet, SessionError>;
}

impl<S: Session + ?Sized> Session for &S {
    fn execute(&self, statement: &Statement) -> Result<ResultSet, SessionError> {
        (**self).execute(statement)
    }
}
