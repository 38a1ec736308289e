use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use thiserror::Error;

/// Durable storage for accounts, the append-only transaction log,
/// interaction records, and users/sessions.
///
/// Every multi-step mutation runs inside a single sqlite transaction; that
/// transaction is the atomic scope the billing engine relies on. Balance
/// updates are conditional single-row updates, so concurrent charges for the
/// same user serialize on the row instead of racing on a read value.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("account not found: user {user_id}")]
    AccountNotFound { user_id: i64 },
    #[error("insufficient funds: balance={balance} required={required}")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("username or email already registered")]
    UserExists,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    Charge,
    Add,
    Refund,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Charge => "charge",
            TransactionKind::Add => "add",
            TransactionKind::Refund => "refund",
        }
    }

    fn from_column(raw: &str) -> TransactionKind {
        match raw {
            "add" => TransactionKind::Add,
            "refund" => TransactionKind::Refund,
            _ => TransactionKind::Charge,
        }
    }
}

impl serde::Serialize for TransactionKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct InteractionRecord {
    pub id: i64,
    pub user_id: i64,
    pub model: String,
    pub prompt: String,
    pub response: String,
    pub credits_charged: i64,
    pub processing_time_ms: u64,
    pub created_at_ms: u64,
}

/// Interaction payload stored together with its charge.
#[derive(Clone, Debug)]
pub struct NewInteraction {
    pub model: String,
    pub prompt: String,
    pub response: String,
    pub processing_time_ms: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct LedgerSnapshot {
    pub stored_balance: i64,
    pub transaction_sum: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct TransactionTotals {
    pub count: u64,
    pub charged: i64,
    pub added: i64,
    pub refunded: i64,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Inserts the user and its account with the initial balance in one
    /// transaction.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        salt: &str,
        initial_balance: i64,
    ) -> Result<UserRecord, StoreError> {
        let path = self.path.clone();
        let username = username.to_string();
        let email = email.to_string();
        let password_hash = password_hash.to_string();
        let salt = salt.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<UserRecord, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                "INSERT INTO users (username, email, password_hash, salt, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![username, email, password_hash, salt, ts_ms],
            );
            if let Err(err) = inserted {
                return Err(map_constraint(err, StoreError::UserExists));
            }
            let user_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO accounts (user_id, balance, updated_at_ms) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, initial_balance.max(0), ts_ms],
            )?;

            tx.commit()?;
            Ok(UserRecord {
                id: user_id,
                username,
                email,
                password_hash,
                salt,
                created_at_ms: i64_to_u64(ts_ms),
            })
        })
        .await?
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let path = self.path.clone();
        let username = username.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<UserRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let user = conn
                .query_row(
                    "SELECT id, username, email, password_hash, salt, created_at_ms
                     FROM users WHERE username = ?1",
                    rusqlite::params![username],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await?
    }

    pub async fn user_by_id(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<UserRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let user = conn
                .query_row(
                    "SELECT id, username, email, password_hash, salt, created_at_ms
                     FROM users WHERE id = ?1",
                    rusqlite::params![user_id],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await?
    }

    pub async fn insert_session(
        &self,
        token_hash: &str,
        user_id: i64,
        expires_at_ms: u64,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let token_hash = token_hash.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO sessions (token_hash, user_id, expires_at_ms)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![token_hash, user_id, u64_to_i64(expires_at_ms)],
            )?;
            Ok(())
        })
        .await?
    }

    /// Returns the session's user id when the session exists and has not
    /// expired.
    pub async fn session_user(&self, token_hash: &str) -> Result<Option<i64>, StoreError> {
        let path = self.path.clone();
        let token_hash = token_hash.to_string();
        let now_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<Option<i64>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let user_id = conn
                .query_row(
                    "SELECT user_id FROM sessions WHERE token_hash = ?1 AND expires_at_ms > ?2",
                    rusqlite::params![token_hash, now_ms],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(user_id)
        })
        .await?
    }

    pub async fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let token_hash = token_hash.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let deleted = conn.execute(
                "DELETE FROM sessions WHERE token_hash = ?1",
                rusqlite::params![token_hash],
            )?;
            Ok(deleted > 0)
        })
        .await?
    }

    pub async fn delete_expired_sessions(&self) -> Result<usize, StoreError> {
        let path = self.path.clone();
        let now_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let deleted = conn.execute(
                "DELETE FROM sessions WHERE expires_at_ms <= ?1",
                rusqlite::params![now_ms],
            )?;
            Ok(deleted)
        })
        .await?
    }

    pub async fn get_balance(&self, user_id: i64) -> Result<Option<i64>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<i64>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let balance = conn
                .query_row(
                    "SELECT balance FROM accounts WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(balance)
        })
        .await?
    }

    /// Overwrites the stored balance. Used by the consistency repair path,
    /// never by normal billing.
    pub async fn set_balance(&self, user_id: i64, new_balance: i64) -> Result<(), StoreError> {
        let path = self.path.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let updated = conn.execute(
                "UPDATE accounts SET balance = ?2, updated_at_ms = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id, new_balance.max(0), ts_ms],
            )?;
            if updated == 0 {
                return Err(StoreError::AccountNotFound { user_id });
            }
            Ok(())
        })
        .await?
    }

    /// Append-only insert into the transaction log without touching the
    /// balance. Billing operations use the composite `charge`/`credit`
    /// methods instead so the pair stays atomic.
    pub async fn append_transaction(
        &self,
        user_id: i64,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<TransactionRecord, StoreError> {
        let path = self.path.clone();
        let description = description.to_string();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<TransactionRecord, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO transactions (user_id, amount, kind, description, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![user_id, amount, kind.as_str(), description, ts_ms],
            )?;
            Ok(TransactionRecord {
                id: conn.last_insert_rowid(),
                user_id,
                amount,
                kind,
                description,
                created_at_ms: i64_to_u64(ts_ms),
            })
        })
        .await?
    }

    pub async fn list_transactions(
        &self,
        user_id: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let path = self.path.clone();
        let offset = usize_to_i64(offset);
        let limit = usize_to_i64(limit.max(1));
        tokio::task::spawn_blocking(move || -> Result<Vec<TransactionRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, amount, kind, description, created_at_ms
                 FROM transactions
                 WHERE user_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit, offset], |row| {
                Ok(TransactionRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    amount: row.get(2)?,
                    kind: TransactionKind::from_column(&row.get::<_, String>(3)?),
                    description: row.get(4)?,
                    created_at_ms: i64_to_u64(row.get(5)?),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    /// Conditional debit plus the matching `charge` transaction row in one
    /// transaction. Returns the new balance.
    pub async fn charge(
        &self,
        user_id: i64,
        amount: i64,
        description: &str,
    ) -> Result<i64, StoreError> {
        self.charge_inner(user_id, amount, description, None)
            .await
            .map(|(balance, _)| balance)
    }

    /// The principal atomic scope of the service: debit, transaction row,
    /// and interaction record commit together or not at all. Returns the new
    /// balance and the interaction id.
    pub async fn charge_with_interaction(
        &self,
        user_id: i64,
        amount: i64,
        description: &str,
        interaction: NewInteraction,
    ) -> Result<(i64, i64), StoreError> {
        let (balance, interaction_id) = self
            .charge_inner(user_id, amount, description, Some(interaction))
            .await?;
        Ok((balance, interaction_id))
    }

    async fn charge_inner(
        &self,
        user_id: i64,
        amount: i64,
        description: &str,
        interaction: Option<NewInteraction>,
    ) -> Result<(i64, i64), StoreError> {
        let path = self.path.clone();
        let description = description.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<(i64, i64), StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let balance: i64 = tx
                .query_row(
                    "SELECT balance FROM accounts WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::AccountNotFound { user_id })?;

            if balance < amount {
                return Err(StoreError::InsufficientFunds {
                    balance,
                    required: amount,
                });
            }

            let updated = tx.execute(
                "UPDATE accounts
                 SET balance = balance - ?2, updated_at_ms = ?3
                 WHERE user_id = ?1 AND balance >= ?2",
                rusqlite::params![user_id, amount, ts_ms],
            )?;
            if updated == 0 {
                return Err(StoreError::InsufficientFunds {
                    balance,
                    required: amount,
                });
            }

            tx.execute(
                "INSERT INTO transactions (user_id, amount, kind, description, created_at_ms)
                 VALUES (?1, ?2, 'charge', ?3, ?4)",
                rusqlite::params![user_id, -amount, description, ts_ms],
            )?;

            let mut interaction_id = 0;
            if let Some(interaction) = interaction {
                tx.execute(
                    "INSERT INTO interactions
                     (user_id, model, prompt, response, credits_charged, processing_time_ms, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        user_id,
                        interaction.model,
                        interaction.prompt,
                        interaction.response,
                        amount,
                        u64_to_i64(interaction.processing_time_ms),
                        ts_ms
                    ],
                )?;
                interaction_id = tx.last_insert_rowid();
            }

            tx.commit()?;
            Ok((balance - amount, interaction_id))
        })
        .await?
    }

    /// Balance increase plus the matching `add`/`refund` row in one
    /// transaction. Returns the new balance.
    pub async fn credit(
        &self,
        user_id: i64,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<i64, StoreError> {
        let path = self.path.clone();
        let description = description.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let updated = tx.execute(
                "UPDATE accounts
                 SET balance = balance + ?2, updated_at_ms = ?3
                 WHERE user_id = ?1",
                rusqlite::params![user_id, amount, ts_ms],
            )?;
            if updated == 0 {
                return Err(StoreError::AccountNotFound { user_id });
            }

            tx.execute(
                "INSERT INTO transactions (user_id, amount, kind, description, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![user_id, amount, kind.as_str(), description, ts_ms],
            )?;

            let balance: i64 = tx.query_row(
                "SELECT balance FROM accounts WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;

            tx.commit()?;
            Ok(balance)
        })
        .await?
    }

    /// Stored balance and transaction sum read in one transaction, so the
    /// consistency checker compares values from the same instant.
    pub async fn ledger_snapshot(&self, user_id: i64) -> Result<LedgerSnapshot, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<LedgerSnapshot, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let stored_balance: i64 = tx
                .query_row(
                    "SELECT balance FROM accounts WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::AccountNotFound { user_id })?;

            let transaction_sum: i64 = tx.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;

            tx.commit()?;
            Ok(LedgerSnapshot {
                stored_balance,
                transaction_sum,
            })
        })
        .await?
    }

    /// Overwrites the stored balance with the ledger-derived value in one
    /// transaction. Returns (previous, repaired).
    pub async fn repair_balance(
        &self,
        user_id: i64,
        initial_balance: i64,
    ) -> Result<(i64, i64), StoreError> {
        let path = self.path.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(i64, i64), StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let stored: i64 = tx
                .query_row(
                    "SELECT balance FROM accounts WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::AccountNotFound { user_id })?;

            let sum: i64 = tx.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            let derived = (initial_balance + sum).max(0);

            tx.execute(
                "UPDATE accounts SET balance = ?2, updated_at_ms = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id, derived, ts_ms],
            )?;

            tx.commit()?;
            Ok((stored, derived))
        })
        .await?
    }

    pub async fn transaction_totals(&self, user_id: i64) -> Result<TransactionTotals, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<TransactionTotals, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let totals = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN kind = 'charge' THEN -amount ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN kind = 'add' THEN amount ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN kind = 'refund' THEN amount ELSE 0 END), 0)
                 FROM transactions WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| {
                    Ok(TransactionTotals {
                        count: i64_to_u64(row.get(0)?),
                        charged: row.get(1)?,
                        added: row.get(2)?,
                        refunded: row.get(3)?,
                    })
                },
            )?;
            Ok(totals)
        })
        .await?
    }

    pub async fn list_interactions(
        &self,
        user_id: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StoreError> {
        let path = self.path.clone();
        let offset = usize_to_i64(offset);
        let limit = usize_to_i64(limit.max(1));
        tokio::task::spawn_blocking(move || -> Result<Vec<InteractionRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, model, prompt, response, credits_charged,
                        processing_time_ms, created_at_ms
                 FROM interactions
                 WHERE user_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit, offset], |row| {
                Ok(InteractionRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    model: row.get(2)?,
                    prompt: row.get(3)?,
                    response: row.get(4)?,
                    credits_charged: row.get(5)?,
                    processing_time_ms: i64_to_u64(row.get(6)?),
                    created_at_ms: i64_to_u64(row.get(7)?),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn count_interactions(&self, user_id: i64) -> Result<u64, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM interactions WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(count))
        })
        .await?
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS accounts (
            user_id INTEGER PRIMARY KEY NOT NULL REFERENCES users(id),
            balance INTEGER NOT NULL CHECK (balance >= 0),
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('charge', 'add', 'refund')),
            description TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_user_id
            ON transactions(user_id, id);

        CREATE TABLE IF NOT EXISTS interactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            model TEXT NOT NULL CHECK (length(model) > 0),
            prompt TEXT NOT NULL,
            response TEXT NOT NULL,
            credits_charged INTEGER NOT NULL,
            processing_time_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_interactions_user_id
            ON interactions(user_id, id);

        CREATE TABLE IF NOT EXISTS sessions (
            token_hash TEXT PRIMARY KEY NOT NULL,
            user_id INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_expires
            ON sessions(expires_at_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn user_from_row(row: &rusqlite::Row<'_>) -> Result<UserRecord, rusqlite::Error> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        salt: row.get(4)?,
        created_at_ms: i64_to_u64(row.get(5)?),
    })
}

fn map_constraint(err: rusqlite::Error, mapped: StoreError) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            mapped
        }
        _ => StoreError::Sqlite(err),
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn usize_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
