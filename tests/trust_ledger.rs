mod common;

use chrono::{Duration, TimeZone, Utc};
use common::Harness;
use escrow_desk::{ApplyOutcome, EscrowError, Result, TrustEventKind, TrustEventRequest};

fn adjustment(user_id: i64, delta: i32) -> TrustEventRequest {
    TrustEventRequest::new(user_id, TrustEventKind::Adjustment, "manual review").with_delta(delta)
}

#[tokio::test]
async fn test_rollback_restores_score_exactly() -> Result<()> {
    let harness = Harness::new().await?;
    harness.user(1).await?;
    let trust = harness.registry.trust();

    trust.apply(adjustment(1, 98)).await?;
    assert_eq!(trust.score(1).await?, 98);

    // pushes past the cap; the running total keeps the excess
    let outcome = trust.apply(adjustment(1, 5)).await?;
    assert!(matches!(outcome, ApplyOutcome::Applied { score: 100, .. }));

    let event_id = outcome.event().map(|e| e.id).unwrap();
    let reversed = trust.rollback(event_id).await?;
    assert!(reversed.reversed);
    assert_eq!(trust.score(1).await?, 98);
    Ok(())
}

#[tokio::test]
async fn test_rollback_below_zero_round_trip() -> Result<()> {
    let harness = Harness::new().await?;
    harness.user(2).await?;
    let trust = harness.registry.trust();

    trust.apply(adjustment(2, 2)).await?;
    let penalty = trust
        .apply(TrustEventRequest::new(2, TrustEventKind::GuaranteeBypass, "paid outside"))
        .await?;
    assert_eq!(trust.score(2).await?, 0);
    assert_eq!(trust.state(2).await?.total, -5);

    trust.rollback(penalty.event().unwrap().id).await?;
    assert_eq!(trust.score(2).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_frozen_user_events_are_recorded_only() -> Result<()> {
    let harness = Harness::new().await?;
    harness.user(3).await?;
    let trust = harness.registry.trust();

    trust.apply(adjustment(3, 40)).await?;
    trust.freeze(3).await?;

    let outcome = trust.apply(adjustment(3, 10)).await?;
    let event = match outcome {
        ApplyOutcome::Recorded { event } => event,
        other => panic!("expected recorded, got {:?}", other),
    };
    assert!(!event.applied);
    assert_eq!(trust.score(3).await?, 40);

    // never applied, so reversing it leaves the score alone even after unfreezing
    trust.unfreeze(3).await?;
    trust.rollback(event.id).await?;
    assert_eq!(trust.score(3).await?, 40);
    Ok(())
}

#[tokio::test]
async fn test_rollback_of_applied_event_while_frozen() -> Result<()> {
    let harness = Harness::new().await?;
    harness.user(4).await?;
    let trust = harness.registry.trust();

    trust.apply(adjustment(4, 30)).await?;
    let bonus = trust.apply(adjustment(4, 10)).await?;
    trust.freeze(4).await?;

    trust.rollback(bonus.event().unwrap().id).await?;
    let state = trust.state(4).await?;
    assert!(state.frozen);
    assert_eq!(state.score, 30);
    Ok(())
}

#[tokio::test]
async fn test_rollback_errors() -> Result<()> {
    let harness = Harness::new().await?;
    harness.user(5).await?;
    let trust = harness.registry.trust();

    let outcome = trust.apply(adjustment(5, 7)).await?;
    let event_id = outcome.event().unwrap().id;
    trust.rollback(event_id).await?;

    assert!(matches!(trust.rollback(event_id).await, Err(EscrowError::Conflict(_))));
    assert!(matches!(trust.rollback(9_999).await, Err(EscrowError::NotFound(_))));
    assert_eq!(trust.score(5).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_new_account_is_capped() -> Result<()> {
    let harness = Harness::new().await?;
    harness.new_user(6).await?;
    let trust = harness.registry.trust();

    trust.apply(adjustment(6, 90)).await?;
    let state = trust.state(6).await?;
    assert_eq!((state.cap, state.score), (70, 70));

    harness.clock.advance(Duration::days(30));
    let state = trust.state(6).await?;
    assert_eq!((state.cap, state.score), (100, 90));
    Ok(())
}

#[tokio::test]
async fn test_history_and_penalties_newest_first() -> Result<()> {
    let harness = Harness::new().await?;
    harness.user(7).await?;
    let trust = harness.registry.trust();

    trust.apply(adjustment(7, 50)).await?;
    trust
        .apply(
            TrustEventRequest::new(7, TrustEventKind::DealCancel, "deal #1 canceled")
                .with_reference("deal", 1),
        )
        .await?;
    trust
        .apply(
            TrustEventRequest::new(7, TrustEventKind::GuaranteeBypass, "bypass on deal #2")
                .with_reference("deal", 2),
        )
        .await?;

    let history = trust.history(7, 10).await?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].event_type, "guarantee_bypass");
    assert_eq!(history[2].delta, 50);

    let penalties = trust.recent_penalties(7, 3).await?;
    assert_eq!(penalties, vec!["bypass on deal #2", "deal #1 canceled"]);
    assert_eq!(trust.score(7).await?, 40);
    Ok(())
}

#[tokio::test]
async fn test_unknown_user_has_empty_state() -> Result<()> {
    let harness = Harness::new().await?;
    let state = harness.registry.trust().state(12345).await?;
    assert_eq!((state.total, state.score, state.cap, state.frozen), (0, 0, 100, false));
    Ok(())
}

#[tokio::test]
async fn test_monthly_clean_once_per_month() -> Result<()> {
    let harness = Harness::new().await?;
    harness
        .clock
        .set(Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap());
    harness.user(1).await?;
    harness.user(2).await?;
    let trust = harness.registry.trust();

    let first = trust.award_monthly_clean(1).await?;
    assert!(matches!(first, Some(ApplyOutcome::Applied { score: 2, .. })));
    let event = first.as_ref().and_then(|o| o.event()).unwrap();
    assert_eq!((event.ref_type.as_deref(), event.ref_id), (Some("month"), Some(202603)));
    assert!(matches!(
        trust.award_monthly_clean(1).await?,
        Some(ApplyOutcome::Duplicate { .. })
    ));

    trust
        .apply(
            TrustEventRequest::new(2, TrustEventKind::DealCancel, "deal #9 canceled")
                .with_reference("deal", 9),
        )
        .await?;
    assert!(trust.award_monthly_clean(2).await?.is_none());

    harness.clock.advance(Duration::days(18));
    assert!(matches!(
        trust.award_monthly_clean(2).await?,
        Some(ApplyOutcome::Applied { .. })
    ));
    trust.award_monthly_clean(1).await?;
    assert_eq!(trust.score(1).await?, 4);
    Ok(())
}
