//! SQLite-backed transaction ledger.
//!
//! Provides a thread-safe, append-only store with:
//! - Durable inserts with monotonically assigned ids
//! - Listing of every transaction, newest date first
//! - Aggregate income/expense balance

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS transacciones (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fecha TEXT NOT NULL,
    tipo TEXT NOT NULL,
    monto REAL NOT NULL
)";

/// Errors produced by ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Kind was neither income nor expense
    #[error("invalid transaction type. Must be 'Ingreso' (Income) or 'Gasto' (Expense), got '{0}'")]
    InvalidKind(String),

    /// Date field was empty
    #[error("transaction date must not be empty")]
    EmptyDate,

    /// Underlying database failure
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure while preparing the database location
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a transaction adds to or subtracts from the balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Income,
    Expense,
}

impl TransactionKind {
    /// Label persisted in the `tipo` column and echoed on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Income => "Ingreso",
            TransactionKind::Expense => "Gasto",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = LedgerError;

    /// Case-insensitive; accepts both the stored labels and their English names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("Ingreso") || s.eq_ignore_ascii_case("Income") {
            Ok(TransactionKind::Income)
        } else if s.eq_ignore_ascii_case("Gasto") || s.eq_ignore_ascii_case("Expense") {
            Ok(TransactionKind::Expense)
        } else {
            Err(LedgerError::InvalidKind(s.to_string()))
        }
    }
}

impl ToSql for TransactionKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TransactionKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LedgerError| FromSqlError::Other(Box::new(e)))
    }
}

/// A stored ledger entry
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: i64,
    /// Caller-supplied date, stored verbatim
    pub date: String,
    pub kind: TransactionKind,
    pub amount: f64,
}

/// Aggregate totals over the whole ledger
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Balance {
    pub income: f64,
    pub expense: f64,
    pub net: f64,
}

/// The append-only ledger.
///
/// A single connection is shared by every session. The mutex is held for
/// exactly one statement, so each operation is atomic on its own and nothing
/// spans two operations.
pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::initialize(&conn)?;
        info!(path = %path.display(), "Opened ledger database");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a throwaway in-memory ledger.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // A panic in another session cannot leave the connection half-written:
    // every statement is atomic inside SQLite.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new transaction and return its assigned id.
    pub fn append(&self, date: &str, kind: &str, amount: f64) -> Result<i64, LedgerError> {
        let kind: TransactionKind = kind.parse()?;
        if date.trim().is_empty() {
            return Err(LedgerError::EmptyDate);
        }

        let conn = self.conn();
        conn.execute(
            "INSERT INTO transacciones (fecha, tipo, monto) VALUES (?1, ?2, ?3)",
            params![date, kind, amount],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, date, %kind, amount, "Transaction appended");

        Ok(id)
    }

    /// Every transaction, newest date first; same-date rows newest insert first.
    pub fn list_all(&self) -> Result<Vec<Transaction>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, fecha, tipo, monto FROM transacciones ORDER BY fecha DESC, id DESC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(Transaction {
                    id: row.get(0)?,
                    date: row.get(1)?,
                    kind: row.get(2)?,
                    amount: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Total income, total expense and their difference.
    pub fn balance(&self) -> Result<Balance, LedgerError> {
        let conn = self.conn();
        // TOTAL() yields 0.0 on an empty set where SUM() would yield NULL
        let (income, expense): (f64, f64) = conn.query_row(
            "SELECT TOTAL(CASE WHEN tipo = ?1 THEN monto END),
                    TOTAL(CASE WHEN tipo = ?2 THEN monto END)
             FROM transacciones",
            params![TransactionKind::Income, TransactionKind::Expense],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(Balance {
            income,
            expense,
            net: income - expense,
        })
    }

    /// Number of stored transactions.
    pub fn count(&self) -> Result<u64, LedgerError> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM transacciones", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
