use crate::{
    error::{EscrowError, Result},
    DealId, DisputeId, RoomId, TrustEventId, UserId,
};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Round a monetary value to cents, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn to_cents(value: Decimal) -> Result<i64> {
    round_money(value)
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|cents| cents.to_i64())
        .ok_or_else(|| EscrowError::invalid_input(format!("Amount {} out of range", value)))
}

pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Guarantor,
    Moderator,
    Admin,
    Owner,
    Banned,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Guarantor => "guarantor",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
            Role::Owner => "owner",
            Role::Banned => "banned",
        }
    }

    /// Any member of the team, guarantors included.
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Guarantor | Role::Moderator | Role::Admin | Role::Owner)
    }

    /// Staff allowed to override a guarantor: cancel foreign deals, resolve disputes.
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Moderator | Role::Admin | Role::Owner)
    }
}

impl FromStr for Role {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "guarantor" => Ok(Role::Guarantor),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            "banned" => Ok(Role::Banned),
            other => Err(EscrowError::invalid_input(format!("Unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: Option<String>,
    pub role: Role,
    pub on_shift: bool,
    pub vip_until: Option<DateTime<Utc>>,
    pub free_fee_until: Option<DateTime<Utc>>,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_vip(&self, now: DateTime<Utc>) -> bool {
        self.vip_until.map_or(false, |until| until >= now)
    }

    pub fn free_fee_active(&self, now: DateTime<Utc>) -> bool {
        self.free_fee_until.map_or(false, |until| until >= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealType {
    DirectSale,
    ContactOnly,
    Exchange,
    ExchangeWithAddon,
    Installment,
}

impl DealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealType::DirectSale => "direct_sale",
            DealType::ContactOnly => "contact_only",
            DealType::Exchange => "exchange",
            DealType::ExchangeWithAddon => "exchange_with_addon",
            DealType::Installment => "installment",
        }
    }

    /// Types whose fee is a share of the price need a positive price.
    pub fn requires_price(&self) -> bool {
        matches!(self, DealType::DirectSale | DealType::Installment)
    }

    pub fn takes_addon(&self) -> bool {
        matches!(self, DealType::ExchangeWithAddon)
    }
}

impl FromStr for DealType {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct_sale" | "buy" => Ok(DealType::DirectSale),
            "contact_only" | "contact" => Ok(DealType::ContactOnly),
            "exchange" => Ok(DealType::Exchange),
            "exchange_with_addon" => Ok(DealType::ExchangeWithAddon),
            "installment" => Ok(DealType::Installment),
            other => Err(EscrowError::invalid_input(format!("Unknown deal type: {}", other))),
        }
    }
}

impl fmt::Display for DealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Requested,
    InProgress,
    Closed,
    Canceled,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Requested => "requested",
            DealStatus::InProgress => "in_progress",
            DealStatus::Closed => "closed",
            DealStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DealStatus::Closed | DealStatus::Canceled)
    }

    pub fn can_transition_to(&self, next: DealStatus) -> bool {
        matches!(
            (self, next),
            (DealStatus::Requested, DealStatus::InProgress)
                | (DealStatus::Requested, DealStatus::Canceled)
                | (DealStatus::InProgress, DealStatus::Closed)
                | (DealStatus::InProgress, DealStatus::Canceled)
        )
    }
}

impl FromStr for DealStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "requested" => Ok(DealStatus::Requested),
            "in_progress" => Ok(DealStatus::InProgress),
            "closed" => Ok(DealStatus::Closed),
            "canceled" => Ok(DealStatus::Canceled),
            other => Err(EscrowError::invalid_input(format!("Unknown deal status: {}", other))),
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub guarantor_id: Option<UserId>,
    pub deal_type: DealType,
    pub price: Decimal,
    pub addon: Option<Decimal>,
    pub fee: Decimal,
    /// Last room bound to the deal; kept after release as audit metadata.
    pub room_id: Option<RoomId>,
    pub room_ready: bool,
    pub status: DealStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Deal {
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id || self.guarantor_id == Some(user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub chat_handle: String,
    pub title: Option<String>,
    pub invite_handle: Option<String>,
    pub assigned_deal_id: Option<DealId>,
    pub active: bool,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_free(&self) -> bool {
        self.active && self.assigned_deal_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustState {
    pub user_id: UserId,
    /// Sum of applied, non-reversed deltas; never clipped.
    pub total: i64,
    pub score: i32,
    pub cap: i32,
    pub frozen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEvent {
    pub id: TrustEventId,
    pub user_id: UserId,
    pub event_type: String,
    pub delta: i32,
    pub reason: String,
    pub ref_type: Option<String>,
    pub ref_id: Option<i64>,
    pub applied: bool,
    pub reversed: bool,
    pub created_at: DateTime<Utc>,
}

/// Loyalty level unlocked by completed deal volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoyaltyTier {
    Base,
    Trader,
    Pro,
    Elite,
}

impl LoyaltyTier {
    /// Deals below this price do not count towards a tier.
    pub const QUALIFYING_PRICE_CENTS: i64 = 250_000;

    pub fn from_completed_deals(count: u32) -> Self {
        match count {
            25.. => LoyaltyTier::Elite,
            15..=24 => LoyaltyTier::Pro,
            10..=14 => LoyaltyTier::Trader,
            _ => LoyaltyTier::Base,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            LoyaltyTier::Base => 0,
            LoyaltyTier::Trader => 1,
            LoyaltyTier::Pro => 2,
            LoyaltyTier::Elite => 3,
        }
    }

    pub fn from_level(level: u8) -> Result<Self> {
        match level {
            0 => Ok(LoyaltyTier::Base),
            1 => Ok(LoyaltyTier::Trader),
            2 => Ok(LoyaltyTier::Pro),
            3 => Ok(LoyaltyTier::Elite),
            other => Err(EscrowError::invalid_input(format!("Unknown loyalty tier: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Open => "open",
            DisputeStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for DisputeStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(DisputeStatus::Open),
            "resolved" => Ok(DisputeStatus::Resolved),
            other => Err(EscrowError::invalid_input(format!("Unknown dispute status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub deal_id: DealId,
    pub reporter_id: UserId,
    pub description: String,
    pub status: DisputeStatus,
    pub winner_id: Option<UserId>,
    pub resolved_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEntry {
    pub id: i64,
    pub user_id: UserId,
    pub amount: Decimal,
    pub kind: String,
    pub description: Option<String>,
    pub ref_type: Option<String>,
    pub ref_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}
