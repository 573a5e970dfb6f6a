//! Deal lifecycle: `requested -> in_progress -> closed | canceled`, plus `requested -> canceled`.
//!
//! Every transition is a single conditional `UPDATE` issued as the first statement of its
//! transaction. A racer that loses matches zero rows and the failure is classified by
//! re-reading the deal afterwards. Notifications go out only after commit.

use crate::{
    auth::Actor,
    clock::Clock,
    config::{AppConfig, DealConfig, DisputePolicy, TrustConfig},
    database::{deal_from_row, dispute_from_row, Database, DEAL_COLUMNS, DISPUTE_COLUMNS},
    error::{EscrowError, Result},
    fees::{FeeQuote, FeeSchedule},
    model::*,
    notify::Notifier,
    rooms::{InviteIssuer, RoomAllocator, TemplateInviteIssuer},
    trust::{ApplyOutcome, TrustEventKind, TrustEventRequest, TrustLedger},
    DealId, DisputeId, RoomId, UserId,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeal {
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub deal_type: DealType,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub addon: Option<Decimal>,
    /// Staff may open a deal with its guarantor already set.
    #[serde(default)]
    pub guarantor_id: Option<UserId>,
    #[serde(default)]
    pub waive_fee: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "room", rename_all = "snake_case")]
pub enum RoomAssignment {
    Assigned(Room),
    /// The deal proceeds without a room and waits for the next release.
    NoCapacity,
}

#[derive(Debug, Clone, Serialize)]
pub struct TakeOutcome {
    pub deal: Deal,
    pub room: RoomAssignment,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub deal: Deal,
    pub seller_reward: Decimal,
    /// Waiting deal that inherited the released room.
    pub next_deal: Option<DealId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenedRoom {
    pub deal_id: DealId,
    pub room: Room,
    pub invite: String,
    /// False when participants already had the invite.
    pub newly_opened: bool,
}

#[derive(Clone)]
pub struct DealRegistry {
    db: Database,
    trust: TrustLedger,
    rooms: RoomAllocator,
    fees: Arc<FeeSchedule>,
    invites: Arc<dyn InviteIssuer>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: DealConfig,
    trust_config: TrustConfig,
}

impl DealRegistry {
    pub fn new(
        db: Database,
        config: &AppConfig,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            trust: TrustLedger::new(db.clone(), clock.clone(), config.trust.clone()),
            rooms: RoomAllocator::new(db.clone(), clock.clone(), config.rooms.clone()),
            fees: Arc::new(FeeSchedule::default()),
            invites: Arc::new(TemplateInviteIssuer::new(config.rooms.invite_template.clone())),
            notifier,
            clock,
            config: config.deals.clone(),
            trust_config: config.trust.clone(),
            db,
        }
    }

    pub fn with_invite_issuer(mut self, invites: Arc<dyn InviteIssuer>) -> Self {
        self.invites = invites;
        self
    }

    pub fn with_fee_schedule(mut self, fees: FeeSchedule) -> Self {
        self.fees = Arc::new(fees);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn trust(&self) -> &TrustLedger {
        &self.trust
    }

    pub fn rooms(&self) -> &RoomAllocator {
        &self.rooms
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Fee the seller would pay right now, from their trust, loyalty tier and VIP status.
    pub async fn quote(
        &self,
        seller_id: UserId,
        deal_type: DealType,
        price: Decimal,
        addon: Option<Decimal>,
    ) -> Result<FeeQuote> {
        let seller = self.db.require_user(seller_id).await?;
        let trust_score = self.trust.score(seller_id).await?;
        let tier = self.loyalty_tier(seller_id).await?;
        let vip = seller.is_vip(self.clock.now());

        Ok(self.fees.quote(price, deal_type, addon, trust_score, tier, vip))
    }

    pub async fn create(&self, actor: &Actor, new: NewDeal) -> Result<Deal> {
        validate_terms(&new)?;

        if actor.is_banned() {
            return Err(EscrowError::forbidden("banned users cannot open deals"));
        }
        let party = actor.user_id == new.buyer_id || actor.user_id == new.seller_id;
        if !party && !actor.is_staff() {
            return Err(EscrowError::forbidden("only the parties or staff can open a deal"));
        }
        if new.waive_fee && !actor.is_staff() {
            return Err(EscrowError::forbidden("only staff can waive a fee"));
        }

        self.db.require_user(new.buyer_id).await?;
        let seller = self.db.require_user(new.seller_id).await?;

        if let Some(guarantor_id) = new.guarantor_id {
            let allowed = actor.is_admin()
                || (actor.user_id == guarantor_id && actor.role == Role::Guarantor);
            if !allowed {
                return Err(EscrowError::forbidden(
                    "a guarantor can only be pre-assigned by themselves or an admin",
                ));
            }
            if guarantor_id == new.buyer_id || guarantor_id == new.seller_id {
                return Err(EscrowError::invalid_input("guarantor cannot be a party of the deal"));
            }
            let guarantor = self.db.require_user(guarantor_id).await?;
            if !guarantor.role.is_staff() {
                return Err(EscrowError::forbidden(format!(
                    "user {} is not a guarantor",
                    guarantor_id
                )));
            }
        }

        let now = self.clock.now();
        let fee = if new.waive_fee || seller.free_fee_active(now) {
            Decimal::ZERO
        } else {
            self.quote(new.seller_id, new.deal_type, new.price, new.addon)
                .await?
                .fee
        };

        let status = if new.guarantor_id.is_some() {
            DealStatus::InProgress
        } else {
            DealStatus::Requested
        };

        let mut tx = self.db.begin().await?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO deals
                (buyer_id, seller_id, guarantor_id, deal_type, price_cents, addon_cents, fee_cents,
                 room_ready, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING {}
            "#,
            DEAL_COLUMNS
        ))
        .bind(new.buyer_id)
        .bind(new.seller_id)
        .bind(new.guarantor_id)
        .bind(new.deal_type.as_str())
        .bind(to_cents(new.price)?)
        .bind(new.addon.map(to_cents).transpose()?)
        .bind(to_cents(fee)?)
        .bind(status.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let mut deal = deal_from_row(&row)?;

        let assignment = if deal.status == DealStatus::InProgress {
            let assignment = self.assign_room_in(&mut *tx, deal.id, now).await?;
            if let RoomAssignment::Assigned(room) = &assignment {
                deal.room_id = Some(room.id);
            }
            Some(assignment)
        } else {
            None
        };
        tx.commit().await?;

        info!(
            "Deal {} created ({} {} fee {}) by {}",
            deal.id, deal.deal_type, deal.price, deal.fee, actor.user_id
        );

        if let Some(assignment) = assignment {
            self.announce_take(&deal, &assignment).await;
        }

        Ok(deal)
    }

    /// Claim a requested deal as its guarantor. Exactly one concurrent claimer wins.
    pub async fn take(&self, deal_id: DealId, actor: &Actor) -> Result<TakeOutcome> {
        if !actor.is_staff() {
            return Err(EscrowError::forbidden("only guarantors can take deals"));
        }
        let guarantor = self.db.require_user(actor.user_id).await?;
        if !guarantor.on_shift {
            return Err(EscrowError::forbidden(format!(
                "guarantor {} is not on shift",
                actor.user_id
            )));
        }

        let existing = self.get(deal_id).await?;
        if existing.buyer_id == actor.user_id || existing.seller_id == actor.user_id {
            return Err(EscrowError::forbidden("cannot guarantee your own deal"));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let claimed = sqlx::query(&format!(
            r#"
            UPDATE deals SET guarantor_id = ?, status = 'in_progress'
            WHERE id = ? AND guarantor_id IS NULL AND status = 'requested'
            RETURNING {}
            "#,
            DEAL_COLUMNS
        ))
        .bind(actor.user_id)
        .bind(deal_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = claimed else {
            drop(tx);
            let deal = self.get(deal_id).await?;
            debug!("Deal {} claim by {} lost, status {}", deal_id, actor.user_id, deal.status);
            return Err(EscrowError::conflict(match deal.guarantor_id {
                Some(holder) => format!("deal {} already taken by {}", deal_id, holder),
                None => format!("deal {} is {}", deal_id, deal.status),
            }));
        };
        let mut deal = deal_from_row(&row)?;

        let room = self.assign_room_in(&mut *tx, deal.id, now).await?;
        if let RoomAssignment::Assigned(assigned) = &room {
            deal.room_id = Some(assigned.id);
        }
        tx.commit().await?;

        info!("Deal {} taken by guarantor {}", deal.id, actor.user_id);
        self.announce_take(&deal, &room).await;

        Ok(TakeOutcome { deal, room })
    }

    pub async fn close(&self, deal_id: DealId, actor: &Actor) -> Result<CloseOutcome> {
        let now = self.clock.now();
        let block_on_dispute = self.config.dispute_policy == DisputePolicy::BlockClose;

        let mut tx = self.db.begin().await?;
        let closed = sqlx::query(&format!(
            r#"
            UPDATE deals SET status = 'closed', closed_at = ?
            WHERE id = ? AND guarantor_id = ? AND status = 'in_progress'
              AND (? = 0 OR NOT EXISTS (
                  SELECT 1 FROM disputes WHERE disputes.deal_id = deals.id AND disputes.status = 'open'
              ))
            RETURNING {}
            "#,
            DEAL_COLUMNS
        ))
        .bind(now)
        .bind(deal_id)
        .bind(actor.user_id)
        .bind(block_on_dispute)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = closed else {
            drop(tx);
            return Err(self.classify_close_failure(deal_id, actor).await?);
        };
        let deal = deal_from_row(&row)?;

        for user_id in [deal.buyer_id, deal.seller_id] {
            let request = TrustEventRequest::new(
                user_id,
                TrustEventKind::DealSuccess,
                format!("deal #{} closed", deal.id),
            )
            .with_reference("deal", deal.id);
            self.trust.apply_in(&mut *tx, &request, now).await?;
        }

        let seller_reward = self.reward_seller_in(&mut *tx, &deal, now).await?;

        let next = match self.rooms.release_in(&mut *tx, deal.id).await? {
            Some(_) => self.rooms.assign_waiting_in(&mut *tx, now).await?,
            None => None,
        };
        tx.commit().await?;

        info!(
            "Deal {} closed by {}, seller reward {}",
            deal.id, actor.user_id, seller_reward
        );
        let message = format!("Deal #{} is closed. Thank you for trading safely.", deal.id);
        self.notifier.notify_user(deal.buyer_id, &message);
        self.notifier.notify_user(deal.seller_id, &message);

        let next_deal = next.and_then(|room| room.assigned_deal_id);
        if let Some(next_id) = next_deal {
            self.announce_handover(next_id).await;
        }

        Ok(CloseOutcome {
            deal,
            seller_reward,
            next_deal,
        })
    }

    async fn classify_close_failure(&self, deal_id: DealId, actor: &Actor) -> Result<EscrowError> {
        let deal = self.get(deal_id).await?;
        if deal.guarantor_id != Some(actor.user_id) {
            return Ok(EscrowError::forbidden(format!(
                "only the guarantor of deal {} can close it",
                deal_id
            )));
        }
        if deal.status != DealStatus::InProgress {
            return Ok(EscrowError::conflict(format!("deal {} is {}", deal_id, deal.status)));
        }
        if self.open_dispute_for(deal_id).await?.is_some() {
            return Ok(EscrowError::conflict(format!(
                "deal {} has an open dispute",
                deal_id
            )));
        }
        Ok(EscrowError::conflict(format!("deal {} changed concurrently", deal_id)))
    }

    async fn reward_seller_in(
        &self,
        conn: &mut SqliteConnection,
        deal: &Deal,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let reward = round_money(deal.price * self.config.seller_reward_rate);
        if reward <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let cents = to_cents(reward)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO wallet_entries (user_id, amount_cents, kind, description, ref_type, ref_id, created_at)
            VALUES (?, ?, 'deal_reward', ?, 'deal', ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(deal.seller_id)
        .bind(cents)
        .bind(format!("reward for deal #{}", deal.id))
        .bind(deal.id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        if inserted.rows_affected() == 0 {
            warn!("Reward for deal {} already paid", deal.id);
            return Ok(Decimal::ZERO);
        }

        sqlx::query("UPDATE users SET balance_cents = balance_cents + ? WHERE id = ?")
            .bind(cents)
            .bind(deal.seller_id)
            .execute(&mut *conn)
            .await?;

        Ok(reward)
    }

    /// Cancel a live deal. The guarantor or an admin may do it, disputes notwithstanding.
    pub async fn cancel(&self, deal_id: DealId, actor: &Actor) -> Result<Deal> {
        let now = self.clock.now();

        let mut tx = self.db.begin().await?;
        let canceled = sqlx::query(&format!(
            r#"
            UPDATE deals SET status = 'canceled', closed_at = ?
            WHERE id = ? AND status IN ('requested', 'in_progress')
              AND (? = 1 OR guarantor_id = ?)
            RETURNING {}
            "#,
            DEAL_COLUMNS
        ))
        .bind(now)
        .bind(deal_id)
        .bind(actor.is_admin())
        .bind(actor.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = canceled else {
            drop(tx);
            let deal = self.get(deal_id).await?;
            if !actor.is_admin() && deal.guarantor_id != Some(actor.user_id) {
                return Err(EscrowError::forbidden(format!(
                    "only the guarantor of deal {} or an admin can cancel it",
                    deal_id
                )));
            }
            return Err(EscrowError::conflict(format!("deal {} is {}", deal_id, deal.status)));
        };
        let deal = deal_from_row(&row)?;

        for user_id in [deal.buyer_id, deal.seller_id] {
            let request = TrustEventRequest::new(
                user_id,
                TrustEventKind::DealCancel,
                format!("deal #{} canceled", deal.id),
            )
            .with_reference("deal", deal.id);
            self.trust.apply_in(&mut *tx, &request, now).await?;
        }

        let next = match self.rooms.release_in(&mut *tx, deal.id).await? {
            Some(_) => self.rooms.assign_waiting_in(&mut *tx, now).await?,
            None => None,
        };
        tx.commit().await?;

        info!("Deal {} canceled by {}", deal.id, actor.user_id);
        let message = format!("Deal #{} was canceled.", deal.id);
        self.notifier.notify_user(deal.buyer_id, &message);
        self.notifier.notify_user(deal.seller_id, &message);

        if let Some(next_id) = next.and_then(|room| room.assigned_deal_id) {
            self.announce_handover(next_id).await;
        }

        Ok(deal)
    }

    pub async fn get(&self, deal_id: DealId) -> Result<Deal> {
        let row = sqlx::query(&format!("SELECT {} FROM deals WHERE id = ?", DEAL_COLUMNS))
            .bind(deal_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("deal {}", deal_id)))?;

        deal_from_row(&row)
    }

    /// Deals the user took part in, newest first.
    pub async fn list_for_user(
        &self,
        user_id: UserId,
        status: Option<DealStatus>,
    ) -> Result<Vec<Deal>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM deals
            WHERE (buyer_id = ?1 OR seller_id = ?1 OR guarantor_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY id DESC
            "#,
            DEAL_COLUMNS
        ))
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(deal_from_row).collect()
    }

    /// Add a room to the pool. A deal waiting for capacity gets it at once and its
    /// guarantor is told after commit.
    pub async fn register_room(
        &self,
        actor: &Actor,
        chat_handle: &str,
        title: Option<&str>,
    ) -> Result<Room> {
        let (room, handed) = self
            .rooms
            .register_with_handover(actor, chat_handle, title)
            .await?;
        self.announce_room_handover(handed).await;
        Ok(room)
    }

    /// Retire or reactivate a room. Reactivation serves a waiting deal like a new room does.
    pub async fn set_room_active(&self, actor: &Actor, room_id: RoomId, active: bool) -> Result<Room> {
        let (room, handed) = self
            .rooms
            .set_active_with_handover(actor, room_id, active)
            .await?;
        self.announce_room_handover(handed).await;
        Ok(room)
    }

    async fn announce_room_handover(&self, handed: Option<Room>) {
        if let Some(deal_id) = handed.and_then(|room| room.assigned_deal_id) {
            self.announce_handover(deal_id).await;
        }
    }

    /// Hand the room invite to the participants. They are notified on the first call only.
    pub async fn open_room(&self, deal_id: DealId, actor: &Actor) -> Result<OpenedRoom> {
        let deal = self.get(deal_id).await?;
        if deal.guarantor_id != Some(actor.user_id) && !actor.is_admin() {
            return Err(EscrowError::forbidden(format!(
                "only the guarantor of deal {} can open its room",
                deal_id
            )));
        }
        if deal.status != DealStatus::InProgress {
            return Err(EscrowError::conflict(format!("deal {} is {}", deal_id, deal.status)));
        }

        let room = match self.rooms.room_for_deal(deal_id).await? {
            Some(room) => room,
            // still waiting: claim a room freed outside close or cancel
            None => self.rooms.assign(deal_id).await?,
        };
        let invite = self.rooms.invite_handle(room.id, self.invites.as_ref()).await?;

        let flipped = sqlx::query(
            "UPDATE deals SET room_ready = 1 WHERE id = ? AND room_ready = 0 AND status = 'in_progress'",
        )
        .bind(deal_id)
        .execute(self.db.pool())
        .await?;
        let newly_opened = flipped.rows_affected() > 0;

        if newly_opened {
            info!("Room {} opened for deal {}", room.id, deal_id);
            let message = format!("Your deal room for deal #{} is ready: {}", deal_id, invite);
            self.notifier.notify_user(deal.buyer_id, &message);
            self.notifier.notify_user(deal.seller_id, &message);
        } else {
            debug!("Room for deal {} was already opened", deal_id);
        }

        Ok(OpenedRoom {
            deal_id,
            room,
            invite,
            newly_opened,
        })
    }

    pub async fn open_dispute(
        &self,
        deal_id: DealId,
        actor: &Actor,
        description: &str,
    ) -> Result<Dispute> {
        let description = description.trim();
        if description.is_empty() {
            return Err(EscrowError::invalid_input("dispute description cannot be empty"));
        }

        let deal = self.get(deal_id).await?;
        if !deal.is_participant(actor.user_id) {
            return Err(EscrowError::forbidden(format!(
                "user {} is not part of deal {}",
                actor.user_id, deal_id
            )));
        }

        let now = self.clock.now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO disputes (deal_id, reporter_id, description, status, created_at)
            SELECT ?1, ?2, ?3, 'open', ?4
            WHERE EXISTS (
                SELECT 1 FROM deals
                WHERE id = ?1 AND status = 'in_progress' AND guarantor_id IS NOT NULL
            )
            ON CONFLICT DO NOTHING
            RETURNING {}
            "#,
            DISPUTE_COLUMNS
        ))
        .bind(deal_id)
        .bind(actor.user_id)
        .bind(description)
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;

        let Some(row) = row else {
            let deal = self.get(deal_id).await?;
            return Err(EscrowError::conflict(if deal.status != DealStatus::InProgress {
                format!("deal {} is {}", deal_id, deal.status)
            } else {
                format!("deal {} already has an open dispute", deal_id)
            }));
        };
        let dispute = dispute_from_row(&row)?;

        info!("Dispute {} opened on deal {} by {}", dispute.id, deal_id, actor.user_id);
        self.notifier.alert_operators(&format!(
            "Dispute #{} opened on deal #{}: {}",
            dispute.id, deal_id, description
        ));
        for user_id in [Some(deal.buyer_id), Some(deal.seller_id), deal.guarantor_id]
            .into_iter()
            .flatten()
            .filter(|id| *id != actor.user_id)
        {
            self.notifier.notify_user(
                user_id,
                &format!("A dispute was opened on deal #{}.", deal_id),
            );
        }

        Ok(dispute)
    }

    pub async fn resolve_dispute(
        &self,
        dispute_id: DisputeId,
        actor: &Actor,
        winner_id: Option<UserId>,
    ) -> Result<Dispute> {
        if !actor.is_admin() {
            return Err(EscrowError::forbidden("only admins can resolve disputes"));
        }

        let dispute = self.get_dispute(dispute_id).await?;
        let deal = self.get(dispute.deal_id).await?;
        if let Some(winner) = winner_id {
            if winner != deal.buyer_id && winner != deal.seller_id {
                return Err(EscrowError::invalid_input(format!(
                    "winner {} is not a party of deal {}",
                    winner, deal.id
                )));
            }
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE disputes SET status = 'resolved', winner_id = ?, resolved_by = ?, resolved_at = ?
            WHERE id = ? AND status = 'open'
            RETURNING {}
            "#,
            DISPUTE_COLUMNS
        ))
        .bind(winner_id)
        .bind(actor.user_id)
        .bind(self.clock.now())
        .bind(dispute_id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| EscrowError::conflict(format!("dispute {} already resolved", dispute_id)))?;
        let dispute = dispute_from_row(&row)?;

        info!("Dispute {} resolved by {}", dispute_id, actor.user_id);
        let message = format!("The dispute on deal #{} has been resolved.", deal.id);
        self.notifier.notify_user(deal.buyer_id, &message);
        self.notifier.notify_user(deal.seller_id, &message);

        Ok(dispute)
    }

    pub async fn get_dispute(&self, dispute_id: DisputeId) -> Result<Dispute> {
        let row = sqlx::query(&format!("SELECT {} FROM disputes WHERE id = ?", DISPUTE_COLUMNS))
            .bind(dispute_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("dispute {}", dispute_id)))?;

        dispute_from_row(&row)
    }

    pub async fn open_dispute_for(&self, deal_id: DealId) -> Result<Option<Dispute>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM disputes WHERE deal_id = ? AND status = 'open'",
            DISPUTE_COLUMNS
        ))
        .bind(deal_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(dispute_from_row).transpose()
    }

    /// +3 for each closed deal of the user that aged past the dispute window without
    /// ever seeing a dispute. Safe to run repeatedly.
    pub async fn award_no_dispute_bonus(&self, user_id: UserId) -> Result<u32> {
        let cutoff = self.clock.now() - Duration::days(self.trust_config.no_dispute_after_days);
        let rows = sqlx::query(
            r#"
            SELECT id FROM deals
            WHERE status = 'closed' AND closed_at <= ?
              AND (buyer_id = ? OR seller_id = ?)
              AND NOT EXISTS (SELECT 1 FROM disputes WHERE disputes.deal_id = deals.id)
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        let mut awarded = 0;
        for row in rows {
            let deal_id: DealId = row.try_get("id")?;
            let request = TrustEventRequest::new(
                user_id,
                TrustEventKind::DealNoDispute,
                format!("deal #{} closed without dispute", deal_id),
            )
            .with_reference("deal", deal_id);

            if let ApplyOutcome::Applied { .. } = self.trust.apply(request).await? {
                awarded += 1;
            }
        }

        if awarded > 0 {
            info!("User {} earned {} no-dispute bonus(es)", user_id, awarded);
        }
        Ok(awarded)
    }

    pub async fn loyalty_tier(&self, user_id: UserId) -> Result<LoyaltyTier> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS completed FROM deals
            WHERE status = 'closed' AND price_cents >= ? AND (buyer_id = ? OR seller_id = ?)
            "#,
        )
        .bind(LoyaltyTier::QUALIFYING_PRICE_CENTS)
        .bind(user_id)
        .bind(user_id)
        .fetch_one(self.db.pool())
        .await?;

        let completed: i64 = row.try_get("completed")?;
        Ok(LoyaltyTier::from_completed_deals(
            u32::try_from(completed).unwrap_or(u32::MAX),
        ))
    }

    async fn assign_room_in(
        &self,
        conn: &mut SqliteConnection,
        deal_id: DealId,
        now: DateTime<Utc>,
    ) -> Result<RoomAssignment> {
        match self.rooms.assign_in(conn, deal_id, now).await {
            Ok(room) => Ok(RoomAssignment::Assigned(room)),
            Err(EscrowError::NoCapacity) => Ok(RoomAssignment::NoCapacity),
            Err(e) => Err(e),
        }
    }

    async fn announce_take(&self, deal: &Deal, room: &RoomAssignment) {
        let guarantor = deal.guarantor_id.unwrap_or_default();
        let message = format!("Guarantor {} is now handling deal #{}.", guarantor, deal.id);
        self.notifier.notify_user(deal.buyer_id, &message);
        self.notifier.notify_user(deal.seller_id, &message);

        match room {
            RoomAssignment::Assigned(room) => {
                self.notifier.notify_user(
                    guarantor,
                    &format!("Deal #{} got room {}.", deal.id, room.chat_handle),
                );
                if let Err(e) = self.rooms.check_capacity(self.notifier.as_ref()).await {
                    warn!("Room capacity check failed: {}", e);
                }
            }
            RoomAssignment::NoCapacity => {
                warn!("Deal {} is waiting for a free room", deal.id);
                self.notifier.notify_user(
                    guarantor,
                    &format!("Deal #{} has no room yet, it will get the next free one.", deal.id),
                );
                self.notifier.alert_operators(&format!(
                    "No free room for deal #{}, please add rooms",
                    deal.id
                ));
            }
        }
    }

    async fn announce_handover(&self, deal_id: DealId) {
        match self.get(deal_id).await {
            Ok(deal) => {
                if let Some(guarantor) = deal.guarantor_id {
                    self.notifier.notify_user(
                        guarantor,
                        &format!("Deal #{} now has a room, you can open it.", deal.id),
                    );
                }
            }
            Err(e) => warn!("Could not load deal {} after room handover: {}", deal_id, e),
        }
    }
}

fn validate_terms(new: &NewDeal) -> Result<()> {
    if new.buyer_id == new.seller_id {
        return Err(EscrowError::invalid_input("buyer and seller must differ"));
    }
    if new.price < Decimal::ZERO {
        return Err(EscrowError::invalid_input("price cannot be negative"));
    }
    if new.deal_type.requires_price() && new.price <= Decimal::ZERO {
        return Err(EscrowError::invalid_input(format!(
            "{} deals need a positive price",
            new.deal_type
        )));
    }
    match (new.deal_type.takes_addon(), new.addon) {
        (true, None) => Err(EscrowError::invalid_input("exchange with addon needs an addon amount")),
        (true, Some(addon)) if addon <= Decimal::ZERO => {
            Err(EscrowError::invalid_input("addon must be positive"))
        }
        (false, Some(_)) => Err(EscrowError::invalid_input(format!(
            "{} deals take no addon",
            new.deal_type
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::notify::MockNotifier;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn new_deal(deal_type: DealType, price: Decimal, addon: Option<Decimal>) -> NewDeal {
        NewDeal {
            buyer_id: 1,
            seller_id: 2,
            deal_type,
            price,
            addon,
            guarantor_id: None,
            waive_fee: false,
        }
    }

    async fn registry(notifier: MockNotifier) -> (TempDir, DealRegistry) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("deals.db").display());
        let db = Database::connect(&url).await.unwrap();
        let now = Utc::now();
        for id in [1, 2, 3] {
            db.upsert_user(id, None, now).await.unwrap();
        }
        db.set_role(3, Role::Guarantor).await.unwrap();
        db.set_on_shift(3, true).await.unwrap();

        let registry = DealRegistry::new(
            db,
            &AppConfig::default(),
            Arc::new(notifier),
            Arc::new(SystemClock),
        );
        (dir, registry)
    }

    #[test]
    fn test_terms_validation() {
        let mut same = new_deal(DealType::DirectSale, dec!(100), None);
        same.seller_id = 1;
        assert!(validate_terms(&same).is_err());

        assert!(validate_terms(&new_deal(DealType::DirectSale, dec!(0), None)).is_err());
        assert!(validate_terms(&new_deal(DealType::Exchange, dec!(-5), None)).is_err());
        assert!(validate_terms(&new_deal(DealType::ExchangeWithAddon, dec!(0), None)).is_err());
        assert!(validate_terms(&new_deal(DealType::Exchange, dec!(0), Some(dec!(10)))).is_err());
        assert!(validate_terms(&new_deal(DealType::Exchange, dec!(0), None)).is_ok());
        assert!(
            validate_terms(&new_deal(DealType::ExchangeWithAddon, dec!(0), Some(dec!(10)))).is_ok()
        );
    }

    #[tokio::test]
    async fn test_take_without_rooms_alerts_operators() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify_user().times(3).return_const(());
        notifier
            .expect_alert_operators()
            .withf(|message| message.contains("No free room"))
            .times(1)
            .return_const(());

        let (_dir, registry) = registry(notifier).await;
        let deal = registry
            .create(&Actor::new(1, Role::User), new_deal(DealType::DirectSale, dec!(1500), None))
            .await
            .unwrap();
        assert_eq!(deal.fee, dec!(250));
        assert_eq!(deal.status, DealStatus::Requested);

        let outcome = registry.take(deal.id, &Actor::new(3, Role::Guarantor)).await.unwrap();
        assert!(matches!(outcome.room, RoomAssignment::NoCapacity));
        assert_eq!(outcome.deal.status, DealStatus::InProgress);
        assert_eq!(outcome.deal.room_id, None);
    }

    #[tokio::test]
    async fn test_outsider_cannot_open_deal() {
        let (_dir, registry) = registry(MockNotifier::new()).await;
        let err = registry
            .create(&Actor::new(9, Role::User), new_deal(DealType::Exchange, dec!(0), None))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_guarantor_must_be_on_shift() {
        let (_dir, registry) = registry(MockNotifier::new()).await;
        registry.db().set_on_shift(3, false).await.unwrap();

        let deal = registry
            .create(&Actor::new(2, Role::User), new_deal(DealType::Exchange, dec!(0), None))
            .await
            .unwrap();
        let err = registry
            .take(deal.id, &Actor::new(3, Role::Guarantor))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Forbidden(_)));
    }
}
