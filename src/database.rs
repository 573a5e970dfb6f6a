use crate::{
    config::DatabaseConfig,
    error::{EscrowError, Result},
    model::*,
    UserId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row, Sqlite, SqlitePool, Transaction,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub(crate) const USER_COLUMNS: &str =
    "id, username, role, on_shift, vip_until, free_fee_until, balance_cents, created_at";

pub(crate) const DEAL_COLUMNS: &str = "id, buyer_id, seller_id, guarantor_id, deal_type, price_cents, \
     addon_cents, fee_cents, room_id, room_ready, status, created_at, closed_at";

pub(crate) const ROOM_COLUMNS: &str =
    "id, chat_handle, title, invite_handle, assigned_deal_id, active, created_by, created_at";

pub(crate) const TRUST_EVENT_COLUMNS: &str =
    "id, user_id, event_type, delta, reason, ref_type, ref_id, applied, reversed, created_at";

pub(crate) const DISPUTE_COLUMNS: &str = "id, deal_id, reporter_id, description, status, winner_id, \
     resolved_by, created_at, resolved_at";

/// Shared handle to the SQLite store. Cloning shares the pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms.unwrap_or(5_000)));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(10))
            .min_connections(config.min_connections.unwrap_or(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds.unwrap_or(30)))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!("Database ready at {}", config.url);
        Ok(db)
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::new(&DatabaseConfig {
            url: database_url.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                on_shift INTEGER NOT NULL DEFAULT 0,
                vip_until DATETIME,
                free_fee_until DATETIME,
                balance_cents INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                buyer_id INTEGER NOT NULL,
                seller_id INTEGER NOT NULL,
                guarantor_id INTEGER,
                deal_type TEXT NOT NULL,
                price_cents INTEGER NOT NULL,
                addon_cents INTEGER,
                fee_cents INTEGER NOT NULL,
                room_id INTEGER,
                room_ready INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                closed_at DATETIME,
                FOREIGN KEY (buyer_id) REFERENCES users(id),
                FOREIGN KEY (seller_id) REFERENCES users(id),
                FOREIGN KEY (guarantor_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS rooms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_handle TEXT NOT NULL UNIQUE,
                title TEXT,
                invite_handle TEXT,
                assigned_deal_id INTEGER,
                assigned_at DATETIME,
                active INTEGER NOT NULL DEFAULT 1,
                created_by INTEGER,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (assigned_deal_id) REFERENCES deals(id)
            );

            CREATE TABLE IF NOT EXISTS trust_states (
                user_id INTEGER PRIMARY KEY,
                raw_total INTEGER NOT NULL DEFAULT 0,
                score INTEGER NOT NULL DEFAULT 0,
                frozen INTEGER NOT NULL DEFAULT 0,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trust_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                delta INTEGER NOT NULL,
                reason TEXT NOT NULL,
                ref_type TEXT,
                ref_id INTEGER,
                dedupe INTEGER NOT NULL DEFAULT 1,
                applied INTEGER NOT NULL,
                reversed INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS disputes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                deal_id INTEGER NOT NULL,
                reporter_id INTEGER NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                winner_id INTEGER,
                resolved_by INTEGER,
                created_at DATETIME NOT NULL,
                resolved_at DATETIME,
                FOREIGN KEY (deal_id) REFERENCES deals(id)
            );

            CREATE TABLE IF NOT EXISTS wallet_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                amount_cents INTEGER NOT NULL,
                kind TEXT NOT NULL,
                description TEXT,
                ref_type TEXT,
                ref_id INTEGER,
                created_at DATETIME NOT NULL,
                UNIQUE (kind, ref_type, ref_id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_rooms_assigned_deal
                ON rooms(assigned_deal_id) WHERE assigned_deal_id IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_trust_events_dedupe
                ON trust_events(user_id, event_type, ref_type, ref_id)
                WHERE reversed = 0 AND dedupe = 1 AND ref_type IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_disputes_open
                ON disputes(deal_id) WHERE status = 'open';

            CREATE INDEX IF NOT EXISTS idx_deals_status ON deals(status);
            CREATE INDEX IF NOT EXISTS idx_deals_buyer ON deals(buyer_id);
            CREATE INDEX IF NOT EXISTS idx_deals_seller ON deals(seller_id);
            CREATE INDEX IF NOT EXISTS idx_deals_guarantor ON deals(guarantor_id);
            CREATE INDEX IF NOT EXISTS idx_trust_events_user ON trust_events(user_id, id DESC);
            CREATE INDEX IF NOT EXISTS idx_wallet_user ON wallet_entries(user_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a user or refresh their username. Role and balance of an existing user stay untouched.
    pub async fn upsert_user(
        &self,
        user_id: UserId,
        username: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<User> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, role, on_shift, balance_cents, created_at)
            VALUES (?, ?, 'user', 0, 0, ?)
            ON CONFLICT(id) DO UPDATE SET username = COALESCE(excluded.username, users.username)
            "#,
        )
        .bind(user_id)
        .bind(username)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_user(user_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("user {}", user_id)))
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn require_user(&self, user_id: UserId) -> Result<User> {
        self.get_user(user_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("user {}", user_id)))
    }

    pub async fn set_role(&self, user_id: UserId, role: Role) -> Result<()> {
        let result = sqlx::query("UPDATE users SET role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EscrowError::not_found(format!("user {}", user_id)));
        }
        info!("User {} role set to {}", user_id, role.as_str());
        Ok(())
    }

    /// Toggle a guarantor's availability. Only staff can go on shift.
    pub async fn set_on_shift(&self, user_id: UserId, on_shift: bool) -> Result<()> {
        let user = self.require_user(user_id).await?;
        if on_shift && !user.role.is_staff() {
            return Err(EscrowError::forbidden(format!(
                "user {} is not a guarantor",
                user_id
            )));
        }

        sqlx::query("UPDATE users SET on_shift = ? WHERE id = ?")
            .bind(on_shift)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        debug!("User {} on_shift = {}", user_id, on_shift);
        Ok(())
    }

    pub async fn set_vip_until(&self, user_id: UserId, until: Option<DateTime<Utc>>) -> Result<()> {
        self.update_window("vip_until", user_id, until).await
    }

    pub async fn set_free_fee_until(
        &self,
        user_id: UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update_window("free_fee_until", user_id, until).await
    }

    async fn update_window(
        &self,
        column: &'static str,
        user_id: UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(&format!("UPDATE users SET {} = ? WHERE id = ?", column))
            .bind(until)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EscrowError::not_found(format!("user {}", user_id)));
        }
        Ok(())
    }

    pub async fn balance(&self, user_id: UserId) -> Result<Decimal> {
        let row = sqlx::query("SELECT balance_cents FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("user {}", user_id)))?;

        Ok(from_cents(row.try_get(0)?))
    }

    pub async fn wallet_entries(&self, user_id: UserId) -> Result<Vec<WalletEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, amount_cents, kind, description, ref_type, ref_id, created_at
            FROM wallet_entries WHERE user_id = ? ORDER BY id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(WalletEntry {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                amount: from_cents(row.try_get("amount_cents")?),
                kind: row.try_get("kind")?,
                description: row.try_get("description")?,
                ref_type: row.try_get("ref_type")?,
                ref_id: row.try_get("ref_id")?,
                created_at: row.try_get("created_at")?,
            });
        }

        Ok(entries)
    }
}

pub(crate) fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        role: Role::from_str(&row.try_get::<String, _>("role")?)?,
        on_shift: row.try_get("on_shift")?,
        vip_until: row.try_get("vip_until")?,
        free_fee_until: row.try_get("free_fee_until")?,
        balance: from_cents(row.try_get("balance_cents")?),
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn deal_from_row(row: &SqliteRow) -> Result<Deal> {
    Ok(Deal {
        id: row.try_get("id")?,
        buyer_id: row.try_get("buyer_id")?,
        seller_id: row.try_get("seller_id")?,
        guarantor_id: row.try_get("guarantor_id")?,
        deal_type: DealType::from_str(&row.try_get::<String, _>("deal_type")?)?,
        price: from_cents(row.try_get("price_cents")?),
        addon: row.try_get::<Option<i64>, _>("addon_cents")?.map(from_cents),
        fee: from_cents(row.try_get("fee_cents")?),
        room_id: row.try_get("room_id")?,
        room_ready: row.try_get("room_ready")?,
        status: DealStatus::from_str(&row.try_get::<String, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

pub(crate) fn room_from_row(row: &SqliteRow) -> Result<Room> {
    Ok(Room {
        id: row.try_get("id")?,
        chat_handle: row.try_get("chat_handle")?,
        title: row.try_get("title")?,
        invite_handle: row.try_get("invite_handle")?,
        assigned_deal_id: row.try_get("assigned_deal_id")?,
        active: row.try_get("active")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn trust_event_from_row(row: &SqliteRow) -> Result<TrustEvent> {
    Ok(TrustEvent {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        event_type: row.try_get("event_type")?,
        delta: row.try_get("delta")?,
        reason: row.try_get("reason")?,
        ref_type: row.try_get("ref_type")?,
        ref_id: row.try_get("ref_id")?,
        applied: row.try_get("applied")?,
        reversed: row.try_get("reversed")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn dispute_from_row(row: &SqliteRow) -> Result<Dispute> {
    Ok(Dispute {
        id: row.try_get("id")?,
        deal_id: row.try_get("deal_id")?,
        reporter_id: row.try_get("reporter_id")?,
        description: row.try_get("description")?,
        status: DisputeStatus::from_str(&row.try_get::<String, _>("status")?)?,
        winner_id: row.try_get("winner_id")?,
        resolved_by: row.try_get("resolved_by")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("escrow.db").display());
        let db = Database::connect(&url).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_upsert_keeps_role() {
        let (_dir, db) = open_temp().await;
        let now = Utc::now();

        let user = db.upsert_user(7, Some("alice"), now).await.unwrap();
        assert_eq!(user.role, Role::User);

        db.set_role(7, Role::Guarantor).await.unwrap();
        let user = db.upsert_user(7, None, now).await.unwrap();
        assert_eq!(user.role, Role::Guarantor);
        assert_eq!(user.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_shift_requires_staff() {
        let (_dir, db) = open_temp().await;
        db.upsert_user(1, None, Utc::now()).await.unwrap();

        let err = db.set_on_shift(1, true).await.unwrap_err();
        assert!(matches!(err, EscrowError::Forbidden(_)));

        db.set_role(1, Role::Guarantor).await.unwrap();
        db.set_on_shift(1, true).await.unwrap();
        assert!(db.require_user(1).await.unwrap().on_shift);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (_dir, db) = open_temp().await;
        assert!(db.get_user(404).await.unwrap().is_none());
        assert!(matches!(
            db.set_role(404, Role::Admin).await.unwrap_err(),
            EscrowError::NotFound(_)
        ));
    }
}
