#![allow(dead_code)]

use chrono::{Duration, Utc};
use escrow_desk::{
    config::AppConfig, Actor, Clock, Database, Deal, DealRegistry, DealType, ManualClock, NewDeal,
    Notifier, Result, Role, Room, User, UserId,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;

pub const ADMIN: UserId = 900;

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    User(UserId, String),
    Operators(String),
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn to_user(&self, user_id: UserId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|sent| match sent {
                Sent::User(id, message) if *id == user_id => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn operator_alerts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|sent| match sent {
                Sent::Operators(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_user(&self, user_id: UserId, message: &str) {
        self.sent.lock().push(Sent::User(user_id, message.to_string()));
    }

    fn alert_operators(&self, message: &str) {
        self.sent.lock().push(Sent::Operators(message.to_string()));
    }
}

/// Engine over a throwaway SQLite file. The directory lives as long as the harness.
pub struct Harness {
    _dir: TempDir,
    pub db: Database,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub registry: DealRegistry,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_config(AppConfig::default()).await
    }

    pub async fn with_config(mut config: AppConfig) -> Result<Self> {
        let dir = TempDir::new()?;
        config.database.url = format!("sqlite://{}", dir.path().join("escrow.db").display());

        let db = Database::new(&config.database).await?;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = DealRegistry::new(db.clone(), &config, notifier.clone(), clock.clone());

        db.upsert_user(ADMIN, Some("admin"), clock.now() - Duration::days(365))
            .await?;
        db.set_role(ADMIN, Role::Admin).await?;

        Ok(Self {
            _dir: dir,
            db,
            clock,
            notifier,
            registry,
        })
    }

    pub fn admin(&self) -> Actor {
        Actor::new(ADMIN, Role::Admin)
    }

    /// Established account, past the new-account trust cap.
    pub async fn user(&self, user_id: UserId) -> Result<Actor> {
        self.db
            .upsert_user(user_id, None, self.clock.now() - Duration::days(365))
            .await?;
        Ok(Actor::new(user_id, Role::User))
    }

    pub async fn new_user(&self, user_id: UserId) -> Result<User> {
        self.db.upsert_user(user_id, None, self.clock.now()).await
    }

    pub async fn guarantor(&self, user_id: UserId) -> Result<Actor> {
        self.user(user_id).await?;
        self.db.set_role(user_id, Role::Guarantor).await?;
        self.db.set_on_shift(user_id, true).await?;
        Ok(Actor::new(user_id, Role::Guarantor))
    }

    pub async fn rooms(&self, count: usize) -> Result<Vec<Room>> {
        let existing = self.registry.rooms().list_all().await?.len();
        let mut rooms = Vec::with_capacity(count);
        for n in existing..existing + count {
            rooms.push(
                self.registry
                    .register_room(&self.admin(), &format!("@deal_room_{}", n + 1), None)
                    .await?,
            );
        }
        Ok(rooms)
    }

    pub async fn deal(
        &self,
        buyer: UserId,
        seller: UserId,
        deal_type: DealType,
        price: Decimal,
    ) -> Result<Deal> {
        self.user(buyer).await?;
        self.user(seller).await?;
        self.registry
            .create(
                &Actor::new(buyer, Role::User),
                NewDeal {
                    buyer_id: buyer,
                    seller_id: seller,
                    deal_type,
                    price,
                    addon: None,
                    guarantor_id: None,
                    waive_fee: false,
                },
            )
            .await
    }
}
