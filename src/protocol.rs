//! Ledger text protocol parser and response generator.
//!
//! Each request is a single line with fields separated by `|`:
//! - `ADD_TRANSACTION|<date>|<kind>|<amount>`
//! - `GET_TRANSACTIONS`
//! - `GET_BALANCE`
//!
//! The Spanish command names of the original service (`AGREGAR_TRANSACCION`,
//! `OBTENER_TRANSACCIONES`, `OBTENER_SALDO`) are accepted as aliases.
//! Every request yields exactly one reply line, `OK|...` or `ERROR|<message>`.

use crate::ledger::{Balance, LedgerError, LedgerStore, Transaction};
use std::fmt::Write;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Field separator within a line
pub const DELIMITER: char = '|';

/// Separator between records of a multi-row reply
pub const RECORD_TERMINATOR: char = ';';

/// Body of a `GET_TRANSACTIONS` reply when the ledger is empty
pub const NO_TRANSACTIONS: &str = "NO_HAY";

/// Parsed ledger command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Record a new transaction. The kind is validated by the store.
    AddTransaction {
        date: String,
        kind: String,
        amount: f64,
    },

    /// List every transaction
    GetTransactions,

    /// Aggregate income, expense and net balance
    GetBalance,
}

impl Command {
    /// Canonical wire name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddTransaction { .. } => "ADD_TRANSACTION",
            Command::GetTransactions => "GET_TRANSACTIONS",
            Command::GetBalance => "GET_BALANCE",
        }
    }
}

/// Errors turned into `ERROR|...` replies
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty message")]
    EmptyMessage,

    #[error("missing parameters. Expected format: ADD_TRANSACTION|date|kind|amount")]
    MissingParameters,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("unrecognized command")]
    UnknownCommand(String),

    #[error("line too long (limit {0} bytes)")]
    LineTooLong(usize),

    #[error("{0}")]
    Ledger(#[from] LedgerError),
}

/// Parser for the ledger line protocol
pub struct Parser;

impl Parser {
    /// Parse one request line. Trailing `\r`/`\n` are ignored.
    pub fn parse(line: &str) -> Result<Command, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(CommandError::EmptyMessage);
        }

        let parts: Vec<&str> = line.split(DELIMITER).collect();

        match parts[0] {
            "ADD_TRANSACTION" | "AGREGAR_TRANSACCION" => Self::parse_add(&parts),
            "GET_TRANSACTIONS" | "OBTENER_TRANSACCIONES" => Ok(Command::GetTransactions),
            "GET_BALANCE" | "OBTENER_SALDO" => Ok(Command::GetBalance),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }

    fn parse_add(parts: &[&str]) -> Result<Command, CommandError> {
        // Extra fields past the amount are ignored
        if parts.len() < 4 || parts[1].trim().is_empty() {
            return Err(CommandError::MissingParameters);
        }

        let amount_str = parts[3].trim();
        let amount = amount_str
            .parse::<f64>()
            .ok()
            .filter(|amount| amount.is_finite())
            .ok_or_else(|| CommandError::InvalidAmount(amount_str.to_string()))?;

        Ok(Command::AddTransaction {
            date: parts[1].to_string(),
            kind: parts[2].to_string(),
            amount,
        })
    }
}

/// Response builders
pub struct Response;

impl Response {
    pub fn transaction_added() -> String {
        "OK|Transaction added successfully".to_string()
    }

    pub fn transactions(rows: &[Transaction]) -> String {
        if rows.is_empty() {
            return format!("OK{DELIMITER}{NO_TRANSACTIONS}");
        }

        let mut out = String::with_capacity(3 + rows.len() * 32);
        out.push_str("OK|");
        for row in rows {
            // Writing into a String cannot fail
            let _ = write!(
                out,
                "{}|{}|{}|{:.2}{RECORD_TERMINATOR}",
                row.id, row.date, row.kind, row.amount
            );
        }
        out
    }

    pub fn balance(balance: &Balance) -> String {
        format!(
            "OK|{:.2}|{:.2}|{:.2}",
            balance.income, balance.expense, balance.net
        )
    }

    pub fn error(err: &CommandError) -> String {
        format!("ERROR{DELIMITER}{err}")
    }

    /// Reply used when command execution itself failed unexpectedly
    pub fn internal_error() -> String {
        "ERROR|internal server error".to_string()
    }
}

/// Execute a parsed command against the ledger.
pub fn execute(command: &Command, store: &LedgerStore) -> Result<String, CommandError> {
    match command {
        Command::AddTransaction { date, kind, amount } => {
            store.append(date, kind, *amount)?;
            Ok(Response::transaction_added())
        }
        Command::GetTransactions => Ok(Response::transactions(&store.list_all()?)),
        Command::GetBalance => Ok(Response::balance(&store.balance()?)),
    }
}

/// Turn one request line into exactly one reply line (without terminator).
///
/// Never fails: every error becomes an `ERROR|...` reply.
pub fn process(line: &str, store: &LedgerStore) -> String {
    let result = Parser::parse(line).and_then(|command| {
        trace!(command = command.name(), "Processing command");
        execute(&command, store)
    });

    match result {
        Ok(reply) => reply,
        Err(e) => {
            match &e {
                CommandError::Ledger(LedgerError::Database(db)) => {
                    warn!(error = %db, "Ledger operation failed")
                }
                CommandError::UnknownCommand(name) => {
                    debug!(command = %name, "Unrecognized command")
                }
                _ => debug!(error = %e, "Rejected request"),
            }
            Response::error(&e)
        }
    }
}
