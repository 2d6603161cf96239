//! Withdrawal ledger against a real database.

mod common;

use common::{reload_user, seed_user, test_db};
use service_core::error::AppError;
use tokio_test::{assert_err, assert_ok};
use vip_service::models::{NewWithdrawal, WithdrawalStatus};
use vip_service::services::{Database, WithdrawalService};

async fn set_balance(db: &Database, telegram_id: &str, balance: i64) {
    sqlx::query("UPDATE users SET commission_balance = $2 WHERE telegram_id = $1")
        .bind(telegram_id)
        .bind(balance)
        .execute(db.pool())
        .await
        .unwrap();
}

fn request(telegram_id: &str, amount: i64) -> NewWithdrawal {
    NewWithdrawal {
        telegram_id: telegram_id.to_string(),
        amount,
        payment_method: "DANA".to_string(),
        account_number: "08123456789".to_string(),
        account_name: "Budi".to_string(),
    }
}

#[tokio::test]
#[ignore]
async fn test_request_validation() {
    let db = test_db().await;
    let service = WithdrawalService::new(db.clone(), 50_000);
    let user = seed_user(&db, None).await;
    set_balance(&db, &user.telegram_id, 60_000).await;

    let below_min = service.request(&request(&user.telegram_id, 49_999)).await;
    assert!(matches!(below_min, Err(AppError::BadRequest(_))));

    let above_balance = service.request(&request(&user.telegram_id, 60_001)).await;
    assert!(matches!(above_balance, Err(AppError::BadRequest(_))));

    let created = assert_ok!(service.request(&request(&user.telegram_id, 50_000)).await);
    assert_eq!(created.status(), WithdrawalStatus::Pending);

    let second = service.request(&request(&user.telegram_id, 50_000)).await;
    assert!(matches!(second, Err(AppError::Conflict(_))));

    // Requests do not reserve balance.
    assert_eq!(reload_user(&db, &user.telegram_id).await.commission_balance, 60_000);
}

#[tokio::test]
#[ignore]
async fn test_approve_deducts_once() {
    let db = test_db().await;
    let service = WithdrawalService::new(db.clone(), 50_000);
    let user = seed_user(&db, None).await;
    set_balance(&db, &user.telegram_id, 60_000).await;

    let withdrawal = service.request(&request(&user.telegram_id, 50_000)).await.unwrap();
    let approved = service.approve(withdrawal.id).await.unwrap();
    assert_eq!(approved.status(), WithdrawalStatus::Approved);
    assert!(approved.processed_at.is_some());
    assert_eq!(reload_user(&db, &user.telegram_id).await.commission_balance, 10_000);

    let again = assert_err!(service.approve(withdrawal.id).await);
    assert!(matches!(again, AppError::Conflict(_)));
    assert_eq!(reload_user(&db, &user.telegram_id).await.commission_balance, 10_000);
}

#[tokio::test]
#[ignore]
async fn test_approve_with_insufficient_balance_changes_nothing() {
    let db = test_db().await;
    let service = WithdrawalService::new(db.clone(), 50_000);
    let user = seed_user(&db, None).await;
    set_balance(&db, &user.telegram_id, 50_000).await;

    let withdrawal = service.request(&request(&user.telegram_id, 50_000)).await.unwrap();
    set_balance(&db, &user.telegram_id, 20_000).await;

    let result = service.approve(withdrawal.id).await;
    assert!(matches!(result, Err(AppError::Conflict(_))));
    assert_eq!(reload_user(&db, &user.telegram_id).await.commission_balance, 20_000);

    let pending = db.list_user_withdrawals(&user.telegram_id).await.unwrap();
    assert_eq!(pending[0].status(), WithdrawalStatus::Pending);
}

#[tokio::test]
#[ignore]
async fn test_reject_leaves_balance() {
    let db = test_db().await;
    let service = WithdrawalService::new(db.clone(), 50_000);
    let user = seed_user(&db, None).await;
    set_balance(&db, &user.telegram_id, 75_000).await;

    let withdrawal = service.request(&request(&user.telegram_id, 60_000)).await.unwrap();
    let rejected = service.reject(withdrawal.id).await.unwrap();
    assert_eq!(rejected.status(), WithdrawalStatus::Rejected);
    assert_eq!(reload_user(&db, &user.telegram_id).await.commission_balance, 75_000);

    // A new request is allowed once the previous one is processed.
    service.request(&request(&user.telegram_id, 60_000)).await.unwrap();
}
