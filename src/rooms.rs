//! Pool of reusable chat rooms. A room serves at most one deal at a time.

use crate::{
    auth::Actor,
    clock::Clock,
    config::RoomConfig,
    database::{room_from_row, Database, ROOM_COLUMNS},
    error::{EscrowError, Result},
    model::Room,
    notify::Notifier,
    DealId, RoomId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates invite links for rooms. May call out to the chat platform.
#[async_trait]
pub trait InviteIssuer: Send + Sync {
    async fn create_invite(&self, room: &Room) -> Result<String>;
}

/// Builds invite links from a URL template containing `{handle}`.
#[derive(Debug, Clone)]
pub struct TemplateInviteIssuer {
    template: String,
}

impl TemplateInviteIssuer {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl InviteIssuer for TemplateInviteIssuer {
    async fn create_invite(&self, room: &Room) -> Result<String> {
        let handle = room.chat_handle.trim_start_matches('@');
        Ok(self.template.replace("{handle}", handle))
    }
}

#[derive(Clone)]
pub struct RoomAllocator {
    db: Database,
    clock: Arc<dyn Clock>,
    config: RoomConfig,
}

impl RoomAllocator {
    pub fn new(db: Database, clock: Arc<dyn Clock>, config: RoomConfig) -> Self {
        Self { db, clock, config }
    }

    pub fn low_watermark(&self) -> u32 {
        self.config.low_watermark
    }

    pub async fn register(&self, actor: &Actor, chat_handle: &str, title: Option<&str>) -> Result<Room> {
        Ok(self.register_with_handover(actor, chat_handle, title).await?.0)
    }

    /// Add a room and, in the same transaction, give a free room to the next waiting deal.
    /// Returns the registered room and the room handed over, if any.
    pub(crate) async fn register_with_handover(
        &self,
        actor: &Actor,
        chat_handle: &str,
        title: Option<&str>,
    ) -> Result<(Room, Option<Room>)> {
        if !actor.is_staff() {
            return Err(EscrowError::forbidden("only staff can register rooms"));
        }

        let chat_handle = chat_handle.trim();
        if chat_handle.is_empty() {
            return Err(EscrowError::invalid_input("Room handle cannot be empty"));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO rooms (chat_handle, title, active, created_by, created_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(chat_handle) DO NOTHING
            RETURNING {}
            "#,
            ROOM_COLUMNS
        ))
        .bind(chat_handle)
        .bind(title)
        .bind(actor.user_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EscrowError::conflict(format!("room {} already registered", chat_handle)))?;
        let mut room = room_from_row(&row)?;

        let handed = self.assign_waiting_in(&mut *tx, now).await?;
        tx.commit().await?;

        info!("Room {} registered as {} by {}", room.id, room.chat_handle, actor.user_id);
        if let Some(handed) = handed.as_ref().filter(|handed| handed.id == room.id) {
            room = handed.clone();
        }
        Ok((room, handed))
    }

    /// Bind the lowest-id free room to an `in_progress` deal.
    pub async fn assign(&self, deal_id: DealId) -> Result<Room> {
        let mut tx = self.db.begin().await?;
        let room = self.assign_in(&mut *tx, deal_id, self.clock.now()).await?;
        tx.commit().await?;
        info!("Room {} assigned to deal {}", room.id, deal_id);
        Ok(room)
    }

    pub(crate) async fn assign_in(
        &self,
        conn: &mut SqliteConnection,
        deal_id: DealId,
        now: DateTime<Utc>,
    ) -> Result<Room> {
        let claimed = sqlx::query(&format!(
            r#"
            UPDATE rooms
            SET assigned_deal_id = ?1, assigned_at = ?2
            WHERE id = (
                SELECT id FROM rooms
                WHERE assigned_deal_id IS NULL AND active = 1
                ORDER BY id LIMIT 1
            )
              AND NOT EXISTS (SELECT 1 FROM rooms WHERE assigned_deal_id = ?1)
              AND EXISTS (SELECT 1 FROM deals WHERE id = ?1 AND status = 'in_progress')
            RETURNING {}
            "#,
            ROOM_COLUMNS
        ))
        .bind(deal_id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = claimed {
            let room = room_from_row(&row)?;
            sqlx::query("UPDATE deals SET room_id = ? WHERE id = ?")
                .bind(room.id)
                .bind(deal_id)
                .execute(&mut *conn)
                .await?;
            return Ok(room);
        }

        if let Some(room) = self.room_for_deal_in(conn, deal_id).await? {
            debug!("Deal {} already holds room {}", deal_id, room.id);
            return Ok(room);
        }

        let status: Option<String> = sqlx::query("SELECT status FROM deals WHERE id = ?")
            .bind(deal_id)
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| row.try_get("status"))
            .transpose()?;

        match status.as_deref() {
            None => Err(EscrowError::not_found(format!("deal {}", deal_id))),
            Some("in_progress") => Err(EscrowError::NoCapacity),
            Some(other) => Err(EscrowError::conflict(format!(
                "deal {} is {}, rooms go to in_progress deals",
                deal_id, other
            ))),
        }
    }

    /// Free the deal's room. Returns false when it held none.
    pub async fn release(&self, deal_id: DealId) -> Result<bool> {
        let mut conn = self.db.pool().acquire().await?;
        let released = self.release_in(&mut *conn, deal_id).await?;
        Ok(released.is_some())
    }

    pub(crate) async fn release_in(
        &self,
        conn: &mut SqliteConnection,
        deal_id: DealId,
    ) -> Result<Option<RoomId>> {
        let row = sqlx::query(
            r#"
            UPDATE rooms SET assigned_deal_id = NULL, assigned_at = NULL
            WHERE assigned_deal_id = ?
            RETURNING id
            "#,
        )
        .bind(deal_id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => {
                let room_id: RoomId = row.try_get("id")?;
                info!("Room {} released from deal {}", room_id, deal_id);
                Ok(Some(room_id))
            }
            None => {
                debug!("Deal {} held no room, nothing to release", deal_id);
                Ok(None)
            }
        }
    }

    /// Give a free room to the oldest `in_progress` deal still waiting for one.
    /// Deals of sellers with an active VIP go first.
    pub(crate) async fn assign_waiting_in(
        &self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> Result<Option<Room>> {
        let waiting: Option<DealId> = sqlx::query(
            r#"
            SELECT d.id FROM deals d
            LEFT JOIN users s ON s.id = d.seller_id
            WHERE d.status = 'in_progress'
              AND NOT EXISTS (SELECT 1 FROM rooms r WHERE r.assigned_deal_id = d.id)
            ORDER BY CASE WHEN s.vip_until IS NOT NULL AND s.vip_until >= ? THEN 0 ELSE 1 END, d.id
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| row.try_get("id"))
        .transpose()?;

        let Some(deal_id) = waiting else {
            return Ok(None);
        };

        match self.assign_in(conn, deal_id, now).await {
            Ok(room) => {
                info!("Room {} handed to waiting deal {}", room.id, deal_id);
                Ok(Some(room))
            }
            Err(EscrowError::NoCapacity) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Invite link for the room, created on first use and cached.
    /// The issuer runs outside any transaction; the first stored link wins.
    pub async fn invite_handle(&self, room_id: RoomId, issuer: &dyn InviteIssuer) -> Result<String> {
        let room = self.get(room_id).await?;
        if let Some(invite) = room.invite_handle {
            return Ok(invite);
        }

        let invite = issuer.create_invite(&room).await?;
        let stored = sqlx::query(
            "UPDATE rooms SET invite_handle = ? WHERE id = ? AND invite_handle IS NULL",
        )
        .bind(&invite)
        .bind(room_id)
        .execute(self.db.pool())
        .await?;

        if stored.rows_affected() > 0 {
            debug!("Invite for room {} created", room_id);
            return Ok(invite);
        }

        self.get(room_id)
            .await?
            .invite_handle
            .ok_or_else(|| EscrowError::Invariant(format!("room {} lost its invite", room_id)))
    }

    /// Retire or reactivate a room. A room serving a deal cannot be retired.
    pub async fn set_active(&self, actor: &Actor, room_id: RoomId, active: bool) -> Result<Room> {
        Ok(self.set_active_with_handover(actor, room_id, active).await?.0)
    }

    /// Reactivation hands a free room to the next waiting deal in the same transaction.
    pub(crate) async fn set_active_with_handover(
        &self,
        actor: &Actor,
        room_id: RoomId,
        active: bool,
    ) -> Result<(Room, Option<Room>)> {
        if !actor.is_staff() {
            return Err(EscrowError::forbidden("only staff can manage rooms"));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE rooms SET active = ?1
            WHERE id = ?2 AND (?1 = 1 OR assigned_deal_id IS NULL)
            RETURNING {}
            "#,
            ROOM_COLUMNS
        ))
        .bind(active)
        .bind(room_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            drop(tx);
            let room = self.get(room_id).await?;
            return Err(EscrowError::conflict(format!(
                "room {} is serving deal {}",
                room.id,
                room.assigned_deal_id.unwrap_or_default()
            )));
        };
        let mut room = room_from_row(&row)?;

        let handed = if active {
            self.assign_waiting_in(&mut *tx, now).await?
        } else {
            None
        };
        tx.commit().await?;

        info!("Room {} active = {}", room_id, active);
        if let Some(handed) = handed.as_ref().filter(|handed| handed.id == room.id) {
            room = handed.clone();
        }
        Ok((room, handed))
    }

    pub async fn get(&self, room_id: RoomId) -> Result<Room> {
        let row = sqlx::query(&format!("SELECT {} FROM rooms WHERE id = ?", ROOM_COLUMNS))
            .bind(room_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("room {}", room_id)))?;

        room_from_row(&row)
    }

    pub async fn room_for_deal(&self, deal_id: DealId) -> Result<Option<Room>> {
        let mut conn = self.db.pool().acquire().await?;
        self.room_for_deal_in(&mut *conn, deal_id).await
    }

    async fn room_for_deal_in(
        &self,
        conn: &mut SqliteConnection,
        deal_id: DealId,
    ) -> Result<Option<Room>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM rooms WHERE assigned_deal_id = ?",
            ROOM_COLUMNS
        ))
        .bind(deal_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(room_from_row).transpose()
    }

    pub async fn list_free(&self) -> Result<Vec<Room>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM rooms WHERE assigned_deal_id IS NULL AND active = 1 ORDER BY id",
            ROOM_COLUMNS
        ))
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(room_from_row).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<Room>> {
        let rows = sqlx::query(&format!("SELECT {} FROM rooms ORDER BY id", ROOM_COLUMNS))
            .fetch_all(self.db.pool())
            .await?;

        rows.iter().map(room_from_row).collect()
    }

    pub async fn free_count(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS free FROM rooms WHERE assigned_deal_id IS NULL AND active = 1",
        )
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.try_get("free")?)
    }

    /// Advisory only: alerts operators when the pool runs low, never blocks a deal.
    pub async fn check_capacity(&self, notifier: &dyn Notifier) -> Result<i64> {
        let free = self.free_count().await?;
        if free < i64::from(self.config.low_watermark) {
            warn!("Room pool low: {} free (watermark {})", free, self.config.low_watermark);
            notifier.alert_operators(&format!(
                "Only {} free deal room(s) left, please add more",
                free
            ));
        }
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::model::Role;
    use crate::notify::MockNotifier;
    use tempfile::TempDir;

    async fn allocator(low_watermark: u32) -> (TempDir, RoomAllocator) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("rooms.db").display());
        let db = Database::connect(&url).await.unwrap();
        let config = RoomConfig {
            low_watermark,
            ..RoomConfig::default()
        };
        (dir, RoomAllocator::new(db, Arc::new(SystemClock), config))
    }

    #[tokio::test]
    async fn test_register_requires_staff_and_unique_handle() {
        let (_dir, rooms) = allocator(3).await;
        let staff = Actor::new(1, Role::Guarantor);

        let err = rooms.register(&Actor::new(2, Role::User), "@deal_room_1", None).await;
        assert!(matches!(err, Err(EscrowError::Forbidden(_))));

        rooms.register(&staff, "@deal_room_1", Some("Room 1")).await.unwrap();
        let err = rooms.register(&staff, "@deal_room_1", None).await;
        assert!(matches!(err, Err(EscrowError::Conflict(_))));
        assert_eq!(rooms.free_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invite_is_created_once() {
        let (_dir, rooms) = allocator(3).await;
        let room = rooms
            .register(&Actor::new(1, Role::Admin), "@deal_room_7", None)
            .await
            .unwrap();

        let first = TemplateInviteIssuer::new("https://t.me/{handle}");
        let second = TemplateInviteIssuer::new("https://example.org/{handle}");

        let invite = rooms.invite_handle(room.id, &first).await.unwrap();
        assert_eq!(invite, "https://t.me/deal_room_7");
        assert_eq!(rooms.invite_handle(room.id, &second).await.unwrap(), invite);
    }

    #[tokio::test]
    async fn test_retired_rooms_are_not_free() {
        let (_dir, rooms) = allocator(3).await;
        let admin = Actor::new(1, Role::Admin);
        let room = rooms.register(&admin, "@r1", None).await.unwrap();

        let room = rooms.set_active(&admin, room.id, false).await.unwrap();
        assert!(!room.active);
        assert!(rooms.list_free().await.unwrap().is_empty());

        rooms.set_active(&admin, room.id, true).await.unwrap();
        assert_eq!(rooms.list_free().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_low_capacity_alerts_operators() {
        let (_dir, rooms) = allocator(2).await;
        rooms
            .register(&Actor::new(1, Role::Owner), "@only_room", None)
            .await
            .unwrap();

        let mut notifier = MockNotifier::new();
        notifier
            .expect_alert_operators()
            .withf(|message| message.contains("1 free"))
            .times(1)
            .return_const(());

        assert_eq!(rooms.check_capacity(&notifier).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_without_room_is_noop() {
        let (_dir, rooms) = allocator(3).await;
        assert!(!rooms.release(99).await.unwrap());
    }

    #[tokio::test]
    async fn test_assign_unknown_deal() {
        let (_dir, rooms) = allocator(3).await;
        rooms
            .register(&Actor::new(1, Role::Owner), "@room", None)
            .await
            .unwrap();
        assert!(matches!(rooms.assign(42).await, Err(EscrowError::NotFound(_))));
    }
}
