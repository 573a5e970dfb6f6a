mod common;

use common::Harness;
use escrow_desk::{Actor, DealType, EscrowError, Result, Role, RoomAssignment};
use rust_decimal_macros::dec;
use std::collections::HashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_take_has_single_winner() -> Result<()> {
    let harness = Harness::new().await?;
    harness.rooms(2).await?;
    let deal = harness.deal(1, 2, DealType::DirectSale, dec!(5000)).await?;

    let mut guarantors = Vec::new();
    for id in 100..108 {
        guarantors.push(harness.guarantor(id).await?);
    }

    let deal_id = deal.id;
    let mut handles = Vec::new();
    for actor in guarantors {
        let registry = harness.registry.clone();
        handles.push(tokio::spawn(async move { registry.take(deal_id, &actor).await }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(outcome) => winners.push(outcome),
            Err(EscrowError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 7);

    let stored = harness.registry.get(deal.id).await?;
    assert_eq!(stored.guarantor_id, winners[0].deal.guarantor_id);
    assert!(matches!(winners[0].room, RoomAssignment::Assigned(_)));
    // one room claimed, one left
    assert_eq!(harness.registry.rooms().free_count().await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assign_respects_pool_size() -> Result<()> {
    let harness = Harness::new().await?;
    let guarantor = harness.guarantor(100).await?;

    harness.rooms(3).await?;
    let mut holders = Vec::new();
    for n in 0..3 {
        let deal = harness
            .deal(50 + n * 2, 51 + n * 2, DealType::Exchange, dec!(0))
            .await?;
        harness.registry.take(deal.id, &guarantor).await?;
        holders.push(deal.id);
    }

    // The pool is exhausted while these are taken, so all of them wait.
    let mut deal_ids = Vec::new();
    for n in 0..8 {
        let deal = harness
            .deal(10 + n * 2, 11 + n * 2, DealType::Exchange, dec!(0))
            .await?;
        let outcome = harness.registry.take(deal.id, &guarantor).await?;
        assert!(matches!(outcome.room, RoomAssignment::NoCapacity));
        deal_ids.push(deal.id);
    }

    // a bare release frees the room without serving the queue
    for holder in holders {
        assert!(harness.registry.rooms().release(holder).await?);
    }
    assert_eq!(harness.registry.rooms().free_count().await?, 3);

    let mut handles = Vec::new();
    for deal_id in deal_ids {
        let rooms = harness.registry.rooms().clone();
        handles.push(tokio::spawn(async move { rooms.assign(deal_id).await }));
    }

    let mut assigned = HashSet::new();
    let mut no_capacity = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(room) => {
                assert!(assigned.insert(room.id), "room {} handed out twice", room.id);
            }
            Err(EscrowError::NoCapacity) => no_capacity += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(assigned.len(), 3);
    assert_eq!(no_capacity, 5);
    assert_eq!(harness.registry.rooms().free_count().await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_close_rewards_once() -> Result<()> {
    let harness = Harness::new().await?;
    harness.rooms(1).await?;
    let guarantor = harness.guarantor(100).await?;
    let deal = harness.deal(1, 2, DealType::DirectSale, dec!(30000)).await?;
    harness.registry.take(deal.id, &guarantor).await?;

    let deal_id = deal.id;
    let mut handles = Vec::new();
    for _ in 0..5 {
        let registry = harness.registry.clone();
        handles.push(tokio::spawn(async move { registry.close(deal_id, &guarantor).await }));
    }

    let mut closed = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(outcome) => {
                assert_eq!(outcome.seller_reward, dec!(30));
                closed += 1;
            }
            Err(EscrowError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!((closed, conflicts), (1, 4));
    assert_eq!(harness.db.balance(2).await?, dec!(30));
    assert_eq!(harness.db.wallet_entries(2).await?.len(), 1);
    assert_eq!(harness.registry.trust().score(1).await?, 2);
    assert_eq!(harness.registry.trust().score(2).await?, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_disputes_only_one_open() -> Result<()> {
    let harness = Harness::new().await?;
    harness.rooms(1).await?;
    let guarantor = harness.guarantor(100).await?;
    let deal = harness.deal(1, 2, DealType::DirectSale, dec!(3000)).await?;
    harness.registry.take(deal.id, &guarantor).await?;

    let deal_id = deal.id;
    let mut handles = Vec::new();
    for reporter in [1, 2, 100] {
        let registry = harness.registry.clone();
        let role = if reporter == 100 { Role::Guarantor } else { Role::User };
        let actor = Actor::new(reporter, role);
        handles.push(tokio::spawn(async move {
            registry.open_dispute(deal_id, &actor, "goods not delivered").await
        }));
    }

    let mut opened = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => opened += 1,
            Err(EscrowError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(opened, 1);
    assert!(harness.registry.open_dispute_for(deal.id).await?.is_some());
    Ok(())
}
