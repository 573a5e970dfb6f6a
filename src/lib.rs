//! # escrow-desk - guarantor-mediated escrow deal engine
//!
//! Brokers escrowed peer-to-peer trades between a buyer and a seller, with a neutral
//! guarantor finalizing each deal inside a pooled chat room.
//!
//! ## Architecture
//!
//! - **Deals**: lifecycle state machine `requested -> in_progress -> closed | canceled`
//! - **Rooms**: pool of reusable chat rooms, one active deal per room
//! - **Trust**: append-only reputation ledger with rollback and freeze
//! - **Fees**: pure fee schedule driven by price, deal type, trust, loyalty tier and VIP
//! - **Storage**: SQLite through sqlx; every claim is a single conditional write

pub mod auth;
pub mod clock;
pub mod config;
pub mod database;
pub mod deals;
pub mod error;
pub mod fees;
pub mod logging;
pub mod model;
pub mod notify;
pub mod rooms;
pub mod trust;

pub use auth::{Actor, TokenIssuer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use database::Database;
pub use deals::{CloseOutcome, DealRegistry, NewDeal, OpenedRoom, RoomAssignment, TakeOutcome};
pub use error::{ErrorKind, EscrowError, Result};
pub use fees::{FeeQuote, FeeSchedule};
pub use model::{
    Deal, DealStatus, DealType, Dispute, DisputeStatus, LoyaltyTier, Role, Room, TrustEvent,
    TrustState, User, WalletEntry,
};
pub use notify::{Notifier, TracingNotifier, WebhookNotifier};
pub use rooms::{InviteIssuer, RoomAllocator, TemplateInviteIssuer};
pub use trust::{ApplyOutcome, TrustEventKind, TrustEventRequest, TrustLedger};

pub type UserId = i64;
pub type DealId = i64;
pub type RoomId = i64;
pub type TrustEventId = i64;
pub type DisputeId = i64;
