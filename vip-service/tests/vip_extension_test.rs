//! VIP expiry arithmetic against a real database.

mod common;

use chrono::{Duration, Utc};
use common::{
    assert_close, coordinator, paid, reload_user, seed_payment, seed_user, test_db, MockGateway,
    RecordingNotifier,
};
use service_core::error::AppError;
use std::sync::Arc;
use vip_service::services::{vip, Database, PaymentLookup, ReconcileOutcome, Trigger};

async fn set_vip(db: &Database, user_id: i64, is_vip: bool, expires_in: Option<Duration>) {
    sqlx::query("UPDATE users SET is_vip = $2, vip_expires_at = $3 WHERE id = $1")
        .bind(user_id)
        .bind(is_vip)
        .bind(expires_in.map(|d| Utc::now() + d))
        .execute(db.pool())
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn test_first_grant_starts_now() {
    let db = test_db().await;
    let user = seed_user(&db, None).await;
    let now = Utc::now();

    let mut tx = db.pool().begin().await.unwrap();
    let expiry = vip::extend_vip(&mut tx, user.id, 7, now).await.unwrap();
    tx.commit().await.unwrap();

    assert_close(expiry, now + Duration::days(7));
    assert!(reload_user(&db, &user.telegram_id).await.is_vip);
}

#[tokio::test]
#[ignore]
async fn test_active_grant_stacks_on_current_expiry() {
    let db = test_db().await;
    let user = seed_user(&db, None).await;
    set_vip(&db, user.id, true, Some(Duration::days(3))).await;

    let mut tx = db.pool().begin().await.unwrap();
    let expiry = vip::extend_vip(&mut tx, user.id, 7, Utc::now()).await.unwrap();
    tx.commit().await.unwrap();

    assert_close(expiry, Utc::now() + Duration::days(10));
}

#[tokio::test]
#[ignore]
async fn test_elapsed_grant_restarts_from_now() {
    let db = test_db().await;
    let user = seed_user(&db, None).await;
    set_vip(&db, user.id, true, Some(Duration::days(-2))).await;

    let mut tx = db.pool().begin().await.unwrap();
    let expiry = vip::extend_vip(&mut tx, user.id, 1, Utc::now()).await.unwrap();
    tx.commit().await.unwrap();

    assert_close(expiry, Utc::now() + Duration::days(1));
}

#[tokio::test]
#[ignore]
async fn test_non_positive_days_rejected() {
    let db = test_db().await;
    let user = seed_user(&db, None).await;

    let mut tx = db.pool().begin().await.unwrap();
    let result = vip::extend_vip(&mut tx, user.id, 0, Utc::now()).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_concurrent_grants_compose() {
    let db = test_db().await;
    let coordinator = coordinator(
        db.clone(),
        MockGateway::unreachable(),
        Arc::new(RecordingNotifier::default()),
    );
    let user = seed_user(&db, None).await;
    let one_day = seed_payment(&db, &user.telegram_id, "VIP 1 Hari", 2_000).await;
    let three_days = seed_payment(&db, &user.telegram_id, "VIP 3 Hari", 5_000).await;

    let (one_day_lookup, one_day_paid) = (PaymentLookup::Id(one_day.id), paid(2_000));
    let (three_days_lookup, three_days_paid) = (PaymentLookup::Id(three_days.id), paid(5_000));

    let (a, b) = tokio::join!(
        coordinator.reconcile(&one_day_lookup, &one_day_paid, Trigger::Webhook),
        coordinator.reconcile(&three_days_lookup, &three_days_paid, Trigger::Poll),
    );
    assert!(matches!(a.unwrap(), ReconcileOutcome::Activated(_)));
    assert!(matches!(b.unwrap(), ReconcileOutcome::Activated(_)));

    let after = reload_user(&db, &user.telegram_id).await;
    assert_close(after.vip_expires_at.unwrap(), Utc::now() + Duration::days(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_concurrent_grants_stack_on_active_vip() {
    let db = test_db().await;
    let coordinator = coordinator(
        db.clone(),
        MockGateway::unreachable(),
        Arc::new(RecordingNotifier::default()),
    );
    let user = seed_user(&db, None).await;
    set_vip(&db, user.id, true, Some(Duration::days(10))).await;
    let original_expiry = reload_user(&db, &user.telegram_id)
        .await
        .vip_expires_at
        .unwrap();

    let three_days = seed_payment(&db, &user.telegram_id, "VIP 3 Hari", 5_000).await;
    let seven_days = seed_payment(&db, &user.telegram_id, "VIP 7 Hari", 10_000).await;
    let (three_lookup, three_paid) = (PaymentLookup::Id(three_days.id), paid(5_000));
    let (seven_lookup, seven_paid) = (PaymentLookup::Id(seven_days.id), paid(10_000));

    let (a, b) = tokio::join!(
        coordinator.reconcile(&three_lookup, &three_paid, Trigger::Webhook),
        coordinator.reconcile(&seven_lookup, &seven_paid, Trigger::SyncWorker),
    );
    assert!(matches!(a.unwrap(), ReconcileOutcome::Activated(_)));
    assert!(matches!(b.unwrap(), ReconcileOutcome::Activated(_)));

    let after = reload_user(&db, &user.telegram_id).await;
    assert!(after.is_vip);
    assert_close(after.vip_expires_at.unwrap(), original_expiry + Duration::days(10));
}

#[tokio::test]
#[ignore]
async fn test_stale_flag_is_corrected_on_read() {
    let db = test_db().await;
    let user = seed_user(&db, None).await;
    set_vip(&db, user.id, true, Some(Duration::hours(-1))).await;

    let status = vip::vip_status(db.pool(), &user.telegram_id, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert!(!status.is_vip);
    assert!(status.vip_expires_at.is_some());

    let reloaded = reload_user(&db, &user.telegram_id).await;
    assert!(!reloaded.is_vip);
}

#[tokio::test]
#[ignore]
async fn test_bulk_stale_correction_leaves_active_users() {
    let db = test_db().await;
    let stale = seed_user(&db, None).await;
    let active = seed_user(&db, None).await;
    set_vip(&db, stale.id, true, Some(Duration::minutes(-5))).await;
    set_vip(&db, active.id, true, Some(Duration::days(2))).await;

    let cleared = vip::expire_all_stale_vip(db.pool(), Utc::now()).await.unwrap();
    assert!(cleared >= 1);
    assert!(!reload_user(&db, &stale.telegram_id).await.is_vip);
    assert!(reload_user(&db, &active.telegram_id).await.is_vip);
}
