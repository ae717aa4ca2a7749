// storage/mod.rs — Contact store over SQLite.
//
// One table (`contacts`), point lookups, insert, and sparse link updates.
// The store owns row identity assignment and durability; all algorithm
// decisions live in `identity`. Every query excludes soft-deleted rows.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking a request indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(QUERY_TIMEOUT.as_secs())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("contact not found: {0}")]
    NotFound(i64),
    #[error("database query timed out after {0}s")]
    Timeout(u64),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Whether a contact is the canonical record of its identity cluster
/// or a record merged into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Contact {
    pub id: i64,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    /// Set only on secondary records, pointing at their primary.
    pub linked_id: Option<i64>,
    pub link_precedence: LinkPrecedence,
    /// RFC 3339. Sole ordering key for precedence decisions (id breaks ties).
    pub created_at: String,
    pub updated_at: String,
    /// Reserved extension point — never set by the core algorithm.
    pub deleted_at: Option<String>,
}

impl Contact {
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Ordering key for "earliest created wins" decisions.
    pub fn created_key(&self) -> (&str, i64) {
        (self.created_at.as_str(), self.id)
    }
}

/// Sparse update of a contact's link fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkUpdate {
    pub linked_id: Option<i64>,
    pub link_precedence: Option<LinkPrecedence>,
}

/// The four-operation store contract the resolver depends on.
///
/// Kept narrow so the resolver can be exercised against any backing
/// implementation; `SqliteContactStore` is the production one.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Every non-deleted record whose email or phone equals the given
    /// values (logical OR). Both criteria absent returns empty without
    /// touching the database.
    async fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError>;

    /// All records reachable from `ids` by one hop of the primary/secondary
    /// link in either direction: the ids themselves, any record linked to
    /// one of them, and the primary of any id that is itself secondary.
    /// Ordered by `created_at` ascending. One hop suffices because link
    /// depth is capped at 1.
    async fn find_connected_component(&self, ids: &[i64]) -> Result<Vec<Contact>, StoreError>;

    /// Insert a new contact and return the persisted row, id and
    /// timestamps populated.
    async fn create(
        &self,
        phone: Option<&str>,
        email: Option<&str>,
        linked_id: Option<i64>,
        precedence: LinkPrecedence,
    ) -> Result<Contact, StoreError>;

    /// Apply a sparse update to `linked_id` and/or `link_precedence`,
    /// refreshing `updated_at`. `StoreError::NotFound` if `id` does not
    /// exist.
    async fn update_link(&self, id: i64, update: LinkUpdate) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct SqliteContactStore {
    pool: SqlitePool,
}

impl SqliteContactStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the on-disk database at `{data_dir}/identityd.db`.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding
    /// it are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn open(data_dir: &Path, slow_query_ms: u64) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        let db_path = data_dir.join("identityd.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone_number TEXT,
                email TEXT,
                linked_id INTEGER REFERENCES contacts(id),
                link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary', 'secondary')),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
            CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(phone_number);
            CREATE INDEX IF NOT EXISTS idx_contacts_linked ON contacts(linked_id);
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Contact>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM contacts WHERE id = ? AND deleted_at IS NULL")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}

#[async_trait]
impl ContactStore for SqliteContactStore {
    async fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError> {
        with_timeout(async {
            let rows = match (email, phone) {
                (None, None) => Vec::new(),
                (Some(e), None) => {
                    sqlx::query_as(
                        "SELECT * FROM contacts
                         WHERE deleted_at IS NULL AND email = ?
                         ORDER BY created_at ASC, id ASC",
                    )
                    .bind(e)
                    .fetch_all(&self.pool)
                    .await?
                }
                (None, Some(p)) => {
                    sqlx::query_as(
                        "SELECT * FROM contacts
                         WHERE deleted_at IS NULL AND phone_number = ?
                         ORDER BY created_at ASC, id ASC",
                    )
                    .bind(p)
                    .fetch_all(&self.pool)
                    .await?
                }
                (Some(e), Some(p)) => {
                    sqlx::query_as(
                        "SELECT * FROM contacts
                         WHERE deleted_at IS NULL AND (email = ? OR phone_number = ?)
                         ORDER BY created_at ASC, id ASC",
                    )
                    .bind(e)
                    .bind(p)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(rows)
        })
        .await
    }

    async fn find_connected_component(&self, ids: &[i64]) -> Result<Vec<Contact>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        with_timeout(async {
            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT DISTINCT * FROM contacts
                 WHERE deleted_at IS NULL AND (
                     id IN ({placeholders})
                     OR linked_id IN ({placeholders})
                     OR id IN (SELECT linked_id FROM contacts
                               WHERE id IN ({placeholders}) AND linked_id IS NOT NULL)
                 )
                 ORDER BY created_at ASC, id ASC",
            );
            let mut query = sqlx::query_as(&sql);
            for _ in 0..3 {
                for id in ids {
                    query = query.bind(*id);
                }
            }
            Ok(query.fetch_all(&self.pool).await?)
        })
        .await
    }

    async fn create(
        &self,
        phone: Option<&str>,
        email: Option<&str>,
        linked_id: Option<i64>,
        precedence: LinkPrecedence,
    ) -> Result<Contact, StoreError> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            let id = sqlx::query_scalar::<_, i64>(
                "INSERT INTO contacts (phone_number, email, linked_id, link_precedence, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 RETURNING id",
            )
            .bind(phone)
            .bind(email)
            .bind(linked_id)
            .bind(precedence)
            .bind(&now)
            .bind(&now)
            .fetch_one(&self.pool)
            .await?;

            Ok(sqlx::query_as("SELECT * FROM contacts WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?)
        })
        .await
    }

    async fn update_link(&self, id: i64, update: LinkUpdate) -> Result<(), StoreError> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            let result = match (update.linked_id, update.link_precedence) {
                (None, None) => return Ok(()),
                (Some(linked_id), Some(precedence)) => {
                    sqlx::query(
                        "UPDATE contacts SET linked_id = ?, link_precedence = ?, updated_at = ?
                         WHERE id = ? AND deleted_at IS NULL",
                    )
                    .bind(linked_id)
                    .bind(precedence)
                    .bind(&now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
                }
                (Some(linked_id), None) => {
                    sqlx::query(
                        "UPDATE contacts SET linked_id = ?, updated_at = ?
                         WHERE id = ? AND deleted_at IS NULL",
                    )
                    .bind(linked_id)
                    .bind(&now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
                }
                (None, Some(precedence)) => {
                    sqlx::query(
                        "UPDATE contacts SET link_precedence = ?, updated_at = ?
                         WHERE id = ? AND deleted_at IS NULL",
                    )
                    .bind(precedence)
                    .bind(&now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
                }
            };
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
        .await
    }
}
