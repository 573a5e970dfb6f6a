//! Append-only reputation ledger with a cached bounded score per user.
//!
//! The cache keeps the unclipped running total of applied, non-reversed deltas next to
//! the clamped score. Reads re-clamp against the cap for the account's current age, so
//! an account leaving its probation period gets its full score back.

use crate::{
    clock::Clock,
    config::TrustConfig,
    database::{trust_event_from_row, Database, TRUST_EVENT_COLUMNS},
    error::{EscrowError, Result},
    model::{TrustEvent, TrustState},
    TrustEventId, UserId,
};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustEventKind {
    DealSuccess,
    DealCancel,
    DealNoDispute,
    MonthlyClean,
    GuaranteeBypass,
    Adjustment,
}

impl TrustEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustEventKind::DealSuccess => "deal_success",
            TrustEventKind::DealCancel => "deal_cancel",
            TrustEventKind::DealNoDispute => "deal_no_dispute",
            TrustEventKind::MonthlyClean => "monthly_clean",
            TrustEventKind::GuaranteeBypass => "guarantee_bypass",
            TrustEventKind::Adjustment => "adjustment",
        }
    }

    pub fn default_delta(&self) -> i32 {
        match self {
            TrustEventKind::DealSuccess => 2,
            TrustEventKind::DealCancel => -3,
            TrustEventKind::DealNoDispute => 3,
            TrustEventKind::MonthlyClean => 2,
            TrustEventKind::GuaranteeBypass => -7,
            TrustEventKind::Adjustment => 0,
        }
    }

    /// Every bypass report counts, even against the same deal.
    pub fn allows_duplicates(&self) -> bool {
        matches!(self, TrustEventKind::GuaranteeBypass)
    }
}

impl FromStr for TrustEventKind {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deal_success" => Ok(TrustEventKind::DealSuccess),
            "deal_cancel" => Ok(TrustEventKind::DealCancel),
            "deal_no_dispute" => Ok(TrustEventKind::DealNoDispute),
            "monthly_clean" => Ok(TrustEventKind::MonthlyClean),
            "guarantee_bypass" => Ok(TrustEventKind::GuaranteeBypass),
            "adjustment" => Ok(TrustEventKind::Adjustment),
            other => Err(EscrowError::invalid_input(format!(
                "Unknown trust event type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for TrustEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEventRequest {
    pub user_id: UserId,
    pub kind: TrustEventKind,
    pub delta: i32,
    pub reason: String,
    /// (ref_type, ref_id) of the object the event is about, e.g. ("deal", 17).
    pub reference: Option<(String, i64)>,
    pub allow_duplicate: bool,
}

impl TrustEventRequest {
    pub fn new(user_id: UserId, kind: TrustEventKind, reason: impl Into<String>) -> Self {
        Self {
            user_id,
            kind,
            delta: kind.default_delta(),
            reason: reason.into(),
            reference: None,
            allow_duplicate: kind.allows_duplicates(),
        }
    }

    pub fn with_delta(mut self, delta: i32) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_reference(mut self, ref_type: impl Into<String>, ref_id: i64) -> Self {
        self.reference = Some((ref_type.into(), ref_id));
        self
    }

    pub fn allowing_duplicates(mut self) -> Self {
        self.allow_duplicate = true;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.kind == TrustEventKind::Adjustment && self.delta == 0 {
            return Err(EscrowError::invalid_input("Adjustment needs a non-zero delta"));
        }
        if self.reason.trim().is_empty() {
            return Err(EscrowError::invalid_input("Trust event reason cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Delta added to the user's score.
    Applied { event: TrustEvent, score: i32 },
    /// User is frozen: event stored with `applied = false`, score untouched.
    Recorded { event: TrustEvent },
    /// A live event with the same (user, type, ref) already exists.
    Duplicate { existing: TrustEventId },
}

impl ApplyOutcome {
    pub fn event(&self) -> Option<&TrustEvent> {
        match self {
            ApplyOutcome::Applied { event, .. } | ApplyOutcome::Recorded { event } => Some(event),
            ApplyOutcome::Duplicate { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct TrustLedger {
    db: Database,
    clock: Arc<dyn Clock>,
    config: TrustConfig,
}

impl TrustLedger {
    pub fn new(db: Database, clock: Arc<dyn Clock>, config: TrustConfig) -> Self {
        Self { db, clock, config }
    }

    pub async fn apply(&self, request: TrustEventRequest) -> Result<ApplyOutcome> {
        let mut tx = self.db.begin().await?;
        let outcome = self.apply_in(&mut *tx, &request, self.clock.now()).await?;
        tx.commit().await?;

        match &outcome {
            ApplyOutcome::Applied { event, score } => info!(
                "Trust event {} ({} {:+}) applied to user {}, score now {}",
                event.id, event.event_type, event.delta, event.user_id, score
            ),
            ApplyOutcome::Recorded { event } => info!(
                "Trust event {} recorded without effect, user {} is frozen",
                event.id, event.user_id
            ),
            ApplyOutcome::Duplicate { existing } => debug!(
                "Trust event for user {} skipped, duplicate of {}",
                request.user_id, existing
            ),
        }

        Ok(outcome)
    }

    /// Record an event inside the caller's transaction.
    pub(crate) async fn apply_in(
        &self,
        conn: &mut SqliteConnection,
        request: &TrustEventRequest,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        request.validate()?;

        let state = sqlx::query(
            r#"
            INSERT INTO trust_states (user_id, raw_total, score, frozen, updated_at)
            VALUES (?, 0, 0, 0, ?)
            ON CONFLICT(user_id) DO UPDATE SET updated_at = excluded.updated_at
            RETURNING frozen
            "#,
        )
        .bind(request.user_id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        let frozen: bool = state.try_get("frozen")?;

        let (ref_type, ref_id) = match &request.reference {
            Some((ref_type, ref_id)) => (Some(ref_type.as_str()), Some(*ref_id)),
            None => (None, None),
        };
        let dedupe = request.reference.is_some() && !request.allow_duplicate;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO trust_events
                (user_id, event_type, delta, reason, ref_type, ref_id, dedupe, applied, reversed, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT DO NOTHING
            RETURNING {}
            "#,
            TRUST_EVENT_COLUMNS
        ))
        .bind(request.user_id)
        .bind(request.kind.as_str())
        .bind(request.delta)
        .bind(&request.reason)
        .bind(ref_type)
        .bind(ref_id)
        .bind(dedupe)
        .bind(!frozen)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        let event = match inserted {
            Some(row) => trust_event_from_row(&row)?,
            None => {
                let existing: TrustEventId = sqlx::query(
                    r#"
                    SELECT id FROM trust_events
                    WHERE user_id = ? AND event_type = ? AND ref_type = ? AND ref_id = ?
                      AND reversed = 0 AND dedupe = 1
                    "#,
                )
                .bind(request.user_id)
                .bind(request.kind.as_str())
                .bind(ref_type)
                .bind(ref_id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| {
                    EscrowError::Invariant(format!(
                        "trust event for user {} conflicted without a live duplicate",
                        request.user_id
                    ))
                })?
                .try_get("id")?;
                return Ok(ApplyOutcome::Duplicate { existing });
            }
        };

        if frozen {
            return Ok(ApplyOutcome::Recorded { event });
        }

        let cap = self.cap_in(conn, request.user_id, now).await?;
        let score = self
            .shift_total(conn, request.user_id, i64::from(request.delta), cap, now)
            .await?;

        Ok(ApplyOutcome::Applied { event, score })
    }

    /// Reverse an event exactly once. Applied deltas are subtracted even if the user
    /// has been frozen since.
    pub async fn rollback(&self, event_id: TrustEventId) -> Result<TrustEvent> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;

        let flipped = sqlx::query(&format!(
            "UPDATE trust_events SET reversed = 1 WHERE id = ? AND reversed = 0 RETURNING {}",
            TRUST_EVENT_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await?;

        let event = match flipped {
            Some(row) => trust_event_from_row(&row)?,
            None => {
                let exists = sqlx::query("SELECT 1 FROM trust_events WHERE id = ?")
                    .bind(event_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .is_some();
                return Err(if exists {
                    EscrowError::conflict(format!("trust event {} already reversed", event_id))
                } else {
                    EscrowError::not_found(format!("trust event {}", event_id))
                });
            }
        };

        if event.applied {
            let cap = self.cap_in(&mut *tx, event.user_id, now).await?;
            let score = self
                .shift_total(&mut *tx, event.user_id, -i64::from(event.delta), cap, now)
                .await?;
            tx.commit().await?;
            info!(
                "Trust event {} reversed, user {} score now {}",
                event_id, event.user_id, score
            );
        } else {
            tx.commit().await?;
            info!("Trust event {} reversed, it was never applied", event_id);
        }

        Ok(event)
    }

    pub async fn score(&self, user_id: UserId) -> Result<i32> {
        Ok(self.state(user_id).await?.score)
    }

    pub async fn state(&self, user_id: UserId) -> Result<TrustState> {
        let now = self.clock.now();
        let mut conn = self.db.pool().acquire().await?;
        let cap = self.cap_in(&mut *conn, user_id, now).await?;

        let row = sqlx::query("SELECT raw_total, score, frozen FROM trust_states WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;

        let (total, cached, frozen) = match row {
            Some(row) => (
                row.try_get::<i64, _>("raw_total")?,
                row.try_get::<i64, _>("score")?,
                row.try_get::<bool, _>("frozen")?,
            ),
            None => (0, 0, false),
        };

        if cached < 0 || cached > i64::from(cap) {
            warn!(
                "Cached trust score {} for user {} outside [0, {}], clamping",
                cached, user_id, cap
            );
        }

        Ok(TrustState {
            user_id,
            total,
            score: clamp_score(total, cap),
            cap,
            frozen,
        })
    }

    pub async fn cap(&self, user_id: UserId) -> Result<i32> {
        let mut conn = self.db.pool().acquire().await?;
        self.cap_in(&mut *conn, user_id, self.clock.now()).await
    }

    pub async fn freeze(&self, user_id: UserId) -> Result<()> {
        self.set_frozen(user_id, true).await
    }

    pub async fn unfreeze(&self, user_id: UserId) -> Result<()> {
        self.set_frozen(user_id, false).await
    }

    async fn set_frozen(&self, user_id: UserId, frozen: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trust_states (user_id, raw_total, score, frozen, updated_at)
            VALUES (?, 0, 0, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET frozen = excluded.frozen, updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(frozen)
        .bind(self.clock.now())
        .execute(self.db.pool())
        .await?;

        info!("Trust for user {} {}", user_id, if frozen { "frozen" } else { "unfrozen" });
        Ok(())
    }

    pub async fn event(&self, event_id: TrustEventId) -> Result<TrustEvent> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM trust_events WHERE id = ?",
            TRUST_EVENT_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| EscrowError::not_found(format!("trust event {}", event_id)))?;

        trust_event_from_row(&row)
    }

    /// Most recent events first.
    pub async fn history(&self, user_id: UserId, limit: i64) -> Result<Vec<TrustEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM trust_events WHERE user_id = ? ORDER BY id DESC LIMIT ?",
            TRUST_EVENT_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(trust_event_from_row).collect()
    }

    /// Reasons behind the latest live penalties, newest first.
    pub async fn recent_penalties(&self, user_id: UserId, limit: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT reason FROM trust_events
            WHERE user_id = ? AND delta < 0 AND reversed = 0
            ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|row| row.try_get("reason").map_err(EscrowError::from))
            .collect()
    }

    /// +2 `monthly_clean` for a calendar month without live penalties, once per month.
    /// Returns `None` when the user picked up a penalty this month.
    pub async fn award_monthly_clean(&self, user_id: UserId) -> Result<Option<ApplyOutcome>> {
        let now = self.clock.now();
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .ok_or_else(|| EscrowError::Invariant(format!("no month start for {}", now)))?;

        let penalized = sqlx::query(
            r#"
            SELECT 1 FROM trust_events
            WHERE user_id = ? AND delta < 0 AND reversed = 0 AND created_at >= ?
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(month_start)
        .fetch_optional(self.db.pool())
        .await?
        .is_some();

        if penalized {
            debug!("User {} had penalties this month, no clean bonus", user_id);
            return Ok(None);
        }

        let month_key = i64::from(now.year()) * 100 + i64::from(now.month());
        let request = TrustEventRequest::new(
            user_id,
            TrustEventKind::MonthlyClean,
            format!("clean month {}", month_key),
        )
        .with_reference("month", month_key);

        self.apply(request).await.map(Some)
    }

    async fn cap_in(
        &self,
        conn: &mut SqliteConnection,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        let created_at: Option<DateTime<Utc>> =
            sqlx::query("SELECT created_at FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| row.try_get("created_at"))
                .transpose()?;

        Ok(match created_at {
            Some(created_at) if now - created_at < Duration::days(self.config.new_account_days) => {
                self.config.new_account_cap
            }
            _ => self.config.max_score,
        })
    }

    async fn shift_total(
        &self,
        conn: &mut SqliteConnection,
        user_id: UserId,
        delta: i64,
        cap: i32,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        let row = sqlx::query(
            r#"
            UPDATE trust_states
            SET raw_total = raw_total + ?1,
                score = MAX(0, MIN(?2, raw_total + ?1)),
                updated_at = ?3
            WHERE user_id = ?4
            RETURNING raw_total
            "#,
        )
        .bind(delta)
        .bind(cap)
        .bind(now)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EscrowError::Invariant(format!("no trust state for user {}", user_id)))?;

        Ok(clamp_score(row.try_get("raw_total")?, cap))
    }
}

fn clamp_score(total: i64, cap: i32) -> i32 {
    // Bounded by cap, so the narrowing is lossless.
    total.clamp(0, i64::from(cap)) as i32
}
