use chrono::{Duration, Utc};
use metergate::entitlements::{
    next_monthly_reset, AccountKey, AdmissionGate, EntitlementStore, NewAccount, Plan,
};
use metergate::error::EntitlementError;
use metergate::usage::{NewUsageEvent, UsageLedger};
use sqlx::PgPool;

// key: entitlement-tests -> store round-trips,counters,reset
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn create_then_get_returns_free_defaults(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let store = EntitlementStore::new(pool.clone());
    let created = store
        .create(NewAccount {
            email: "fresh@example.com".to_string(),
            id: None,
        })
        .await
        .unwrap();

    let fetched = store
        .get(&AccountKey::Email("fresh@example.com".to_string()))
        .await
        .unwrap();
    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.plan, Plan::Free);
    assert_eq!((fetched.requests_current, fetched.requests_limit), (0, 100));
    assert_eq!((fetched.tokens_current, fetched.tokens_limit), (0, 10_000));
    assert_eq!(fetched.reset_date, next_monthly_reset(Utc::now()));

    // dual addressing: the opaque id resolves to the same record
    let by_id = store.get(&AccountKey::Id(created.id)).await.unwrap();
    assert_eq!(by_id.email, "fresh@example.com");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_registration_yields_already_exists(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let store = EntitlementStore::new(pool.clone());
    store
        .create(NewAccount {
            email: "taken@example.com".to_string(),
            id: None,
        })
        .await
        .unwrap();

    let err = store
        .create(NewAccount {
            email: "taken@example.com".to_string(),
            id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::AlreadyExists));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_increments_are_all_reflected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let store = EntitlementStore::new(pool.clone());
    let created = store
        .create(NewAccount {
            email: "parallel@example.com".to_string(),
            id: None,
        })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        let key = AccountKey::Id(created.id);
        handles.push(tokio::spawn(async move {
            store.increment(&key, 1, 500).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let entitlement = store.get(&AccountKey::Id(created.id)).await.unwrap();
    assert_eq!(entitlement.requests_current, 20);
    assert_eq!(entitlement.tokens_current, 10_000);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn apply_reset_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let store = EntitlementStore::new(pool.clone());
    let created = store
        .create(NewAccount {
            email: "reset@example.com".to_string(),
            id: None,
        })
        .await
        .unwrap();
    let key = AccountKey::Id(created.id);

    sqlx::query(
        "UPDATE accounts SET reset_date = NOW() - INTERVAL '1 day', requests_current = 42, tokens_current = 9000 WHERE id = $1",
    )
    .bind(created.id)
    .execute(&pool)
    .await
    .unwrap();

    assert!(store.apply_reset(&key, Utc::now()).await.unwrap());
    let after_first = store.get(&key).await.unwrap();
    assert_eq!(after_first.requests_current, 0);
    assert_eq!(after_first.tokens_current, 0);
    assert!(after_first.reset_date > Utc::now());

    // redundant call is a no-op and leaves the same state behind
    assert!(!store.apply_reset(&key, Utc::now()).await.unwrap());
    let after_second = store.get(&key).await.unwrap();
    assert_eq!(after_second.requests_current, 0);
    assert_eq!(after_second.reset_date, after_first.reset_date);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn quota_exhaustion_then_monthly_reset(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let store = EntitlementStore::new(pool.clone());
    let ledger = UsageLedger::new(pool.clone());
    let gate = AdmissionGate::new(store.clone(), ledger.clone());
    let created = store
        .create(NewAccount {
            email: "quota@example.com".to_string(),
            id: None,
        })
        .await
        .unwrap();
    let key = AccountKey::Id(created.id);

    for _ in 0..100 {
        let entitlement = gate.admit(&key, None).await.unwrap();
        gate.settle(
            &entitlement,
            NewUsageEvent {
                provider: "openai".to_string(),
                model: "gpt-4o".to_string(),
                tokens: 500,
            },
        )
        .await
        .unwrap();
    }

    let err = gate.admit(&key, None).await.unwrap_err();
    assert!(matches!(err, EntitlementError::UsageLimitExceeded));

    let events = ledger
        .query(
            created.id,
            Utc::now() - Duration::hours(1),
            Utc::now() + Duration::hours(1),
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 100);
    assert!(events.windows(2).all(|w| w[0].occurred_at <= w[1].occurred_at));

    // advance the clock past the reset boundary
    sqlx::query("UPDATE accounts SET reset_date = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(created.id)
        .execute(&pool)
        .await
        .unwrap();
    assert!(store.apply_reset(&key, Utc::now()).await.unwrap());

    let entitlement = gate.admit(&key, None).await.unwrap();
    assert_eq!(entitlement.requests_current, 0);
    assert_eq!(entitlement.tokens_current, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_account_is_denied(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let store = EntitlementStore::new(pool.clone());
    let gate = AdmissionGate::new(store, UsageLedger::new(pool.clone()));
    let err = gate
        .admit(&AccountKey::Email("nobody@example.com".to_string()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::NotFound));
}
