//! Integration tests against a real PostgreSQL database.
//!
//! Skipped unless `TEST_DATABASE_URL` is set.

use chrono::{Duration, Utc};
use domain::clock::SystemClock;
use domain::models::{
    AccountStatus, ActorType, AssignOutcome, AuditAction, AuditActor, AuditFilter, InvitationStatus,
    LeaseStatus, NewAuditEntry, NewLease, NewOrder, NewPoolAccount, Order, OrderFilter, PaymentStatus,
    PoolAccount,
};
use domain::services::Allocator;
use domain::store::{AllocationStore, StoreError};
use fake::faker::internet::en::SafeEmail;
use fake::faker::name::en::Name;
use fake::Fake;
use persistence::PgAllocationStore;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use uuid::Uuid;

async fn test_store() -> Option<PgAllocationStore> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    persistence::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    Some(PgAllocationStore::new(pool))
}

/// A store over a fresh schema, so allocation tests see only their own
/// accounts.
async fn isolated_store() -> Option<PgAllocationStore> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let schema = format!("alloc_{}", Uuid::new_v4().simple());

    let setup = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&setup)
        .await
        .expect("Failed to create schema");
    setup.close().await;

    let search_path = format!("SET search_path TO {}", schema);
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .after_connect(move |conn, _meta| {
            let search_path = search_path.clone();
            Box::pin(async move {
                sqlx::query(&search_path).execute(conn).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    persistence::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    Some(PgAllocationStore::new(pool))
}

async fn seed(
    store: &PgAllocationStore,
    capacity: Option<i32>,
    orders: usize,
) -> (PoolAccount, Vec<Order>) {
    let mut uow = store.begin().await.unwrap();
    let account = uow.insert_account(new_account(capacity)).await.unwrap();
    let mut created = Vec::new();
    for _ in 0..orders {
        created.push(uow.insert_order(new_order()).await.unwrap());
    }
    uow.commit().await.unwrap();
    (account, created)
}

/// Runs one assignment per order concurrently and returns how many got a seat.
async fn race_assignments(allocator: &Allocator, orders: Vec<Order>) -> (usize, usize) {
    let handles: Vec<_> = orders
        .into_iter()
        .map(|order| {
            let allocator = allocator.clone();
            tokio::spawn(async move {
                let actor = AuditActor::system();
                allocator
                    .assign_to_user(&order, &order.customer_email, Duration::days(30), &actor)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let (mut assigned, mut no_capacity) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            AssignOutcome::Assigned(_) => assigned += 1,
            AssignOutcome::NoCapacity => no_capacity += 1,
        }
    }
    (assigned, no_capacity)
}

fn allocator(store: PgAllocationStore) -> Allocator {
    Allocator::new(Arc::new(store), Arc::new(SystemClock))
}

fn new_account(capacity: Option<i32>) -> NewPoolAccount {
    NewPoolAccount {
        id: Uuid::new_v4(),
        identity: format!("pool-{}@example.com", Uuid::new_v4().simple()),
        capacity,
        note: None,
        created_at: Utc::now(),
    }
}

fn new_order() -> NewOrder {
    NewOrder {
        id: Uuid::new_v4(),
        order_ref: Order::generate_ref(),
        customer_email: SafeEmail().fake(),
        full_name: Some(Name().fake()),
        package_id: "1_month".to_string(),
        amount: 50_000,
        created_at: Utc::now(),
    }
}

fn new_lease(order_id: Uuid, account_id: Uuid) -> NewLease {
    let now = Utc::now();
    NewLease {
        id: Uuid::new_v4(),
        order_id,
        account_id,
        holder_id: SafeEmail().fake::<String>().to_lowercase(),
        start_at: now,
        end_at: now + Duration::days(30),
    }
}

#[tokio::test]
async fn test_account_round_trip_and_duplicate_identity() {
    let Some(store) = test_store().await else {
        return;
    };

    let input = new_account(Some(2));
    let mut uow = store.begin().await.unwrap();
    let account = uow.insert_account(input.clone()).await.unwrap();
    uow.commit().await.unwrap();
    assert_eq!(account.status, AccountStatus::Available);
    assert_eq!(account.seats_used, 0);

    let mut duplicate = new_account(None);
    duplicate.identity = input.identity.clone();
    let mut uow = store.begin().await.unwrap();
    let err = uow.insert_account(duplicate).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    uow.rollback().await.unwrap();

    let found = store.find_account(account.id).await.unwrap().unwrap();
    assert_eq!(found.identity, input.identity);
}

#[tokio::test]
async fn test_rollback_discards_writes() {
    let Some(store) = test_store().await else {
        return;
    };

    let input = new_account(None);
    let mut uow = store.begin().await.unwrap();
    uow.insert_account(input.clone()).await.unwrap();
    uow.rollback().await.unwrap();

    assert!(store.find_account(input.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_picks_skip_locked_rows() {
    let Some(store) = test_store().await else {
        return;
    };

    let mut setup = store.begin().await.unwrap();
    setup.insert_account(new_account(None)).await.unwrap();
    setup.insert_account(new_account(None)).await.unwrap();
    setup.commit().await.unwrap();

    let mut first = store.begin().await.unwrap();
    let mut second = store.begin().await.unwrap();
    let a = first.lock_next_available_account().await.unwrap().unwrap();
    let b = second.lock_next_available_account().await.unwrap().unwrap();
    assert_ne!(a.id, b.id);

    first.rollback().await.unwrap();
    second.rollback().await.unwrap();
}

#[tokio::test]
async fn test_second_active_lease_for_order_conflicts() {
    let Some(store) = test_store().await else {
        return;
    };

    let mut uow = store.begin().await.unwrap();
    let account = uow.insert_account(new_account(Some(5))).await.unwrap();
    let order = uow.insert_order(new_order()).await.unwrap();
    let lease = uow.insert_lease(new_lease(order.id, account.id)).await.unwrap();
    uow.commit().await.unwrap();
    assert_eq!(lease.status, LeaseStatus::Active);

    let mut uow = store.begin().await.unwrap();
    let err = uow
        .insert_lease(new_lease(order.id, account.id))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    uow.rollback().await.unwrap();

    // Once the first lease is closed the order may be leased again.
    let mut uow = store.begin().await.unwrap();
    let mut locked = uow.lock_lease(lease.id).await.unwrap().unwrap();
    locked.status = LeaseStatus::Ended;
    locked.reason = Some("expired".to_string());
    uow.update_lease(&locked).await.unwrap();
    uow.insert_lease(new_lease(order.id, account.id)).await.unwrap();
    uow.commit().await.unwrap();

    let active = store.find_active_leases_for_order(order.id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_ne!(active[0].id, lease.id);
}

#[tokio::test]
async fn test_order_update_and_lookup_by_reference() {
    let Some(store) = test_store().await else {
        return;
    };

    let mut uow = store.begin().await.unwrap();
    let mut order = uow.insert_order(new_order()).await.unwrap();
    order.payment_status = PaymentStatus::Paid;
    order.reference = Some(format!("T-{}", Uuid::new_v4().simple()));
    order.paid_at = Some(Utc::now());
    order.raw_callback = Some(serde_json::json!({"status": "PAID"}));
    uow.update_order(&order).await.unwrap();
    uow.commit().await.unwrap();

    let reference = order.reference.clone().unwrap();
    let found = store.find_order_by_reference(&reference).await.unwrap().unwrap();
    assert_eq!(found.id, order.id);
    assert_eq!(found.payment_status, PaymentStatus::Paid);
    assert_eq!(found.raw_callback, order.raw_callback);
}

#[tokio::test]
async fn test_list_orders_filters_by_status() {
    let Some(store) = isolated_store().await else {
        return;
    };

    let mut uow = store.begin().await.unwrap();
    let mut newest = String::new();
    for i in 0..3 {
        let mut order = uow
            .insert_order(NewOrder {
                created_at: Utc::now() + Duration::seconds(i),
                ..new_order()
            })
            .await
            .unwrap();
        if i > 0 {
            order.payment_status = PaymentStatus::Paid;
            order.invitation_status = InvitationStatus::ManualReviewRequired;
            uow.update_order(&order).await.unwrap();
        }
        newest = order.order_ref;
    }
    uow.commit().await.unwrap();

    let filter = OrderFilter {
        payment_status: Some(PaymentStatus::Paid),
        invitation_status: Some(InvitationStatus::ManualReviewRequired),
    };
    let (orders, total) = store
        .list_orders(&filter, shared::pagination::PageRequest::new(Some(1), Some(1)))
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].order_ref, newest);

    let (_, total) = store.list_orders(&OrderFilter::default(), Default::default()).await.unwrap();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn test_audit_entries_filter_by_entity() {
    let Some(store) = test_store().await else {
        return;
    };

    let entity_id = Uuid::new_v4().to_string();
    let mut uow = store.begin().await.unwrap();
    uow.append_audit(NewAuditEntry {
        id: Uuid::new_v4(),
        actor_type: ActorType::Admin,
        actor: "ops".to_string(),
        action: AuditAction::AccountCreate,
        entity_type: "pool_account".to_string(),
        entity_id: Some(entity_id.clone()),
        payload: serde_json::json!({"identity": "pool@example.com"}),
        created_at: Utc::now(),
    })
    .await
    .unwrap();
    uow.commit().await.unwrap();

    let filter = AuditFilter {
        entity_id: Some(entity_id),
        ..Default::default()
    };
    let (entries, total) = store
        .list_audit_entries(&filter, Default::default())
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(entries[0].action, AuditAction::AccountCreate);
    assert_eq!(entries[0].actor_type, ActorType::Admin);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_for_last_seat_assigns_exactly_once() {
    let Some(store) = isolated_store().await else {
        return;
    };
    let (account, orders) = seed(&store, None, 6).await;
    let allocator = allocator(store.clone());

    let (assigned, no_capacity) = race_assignments(&allocator, orders).await;

    assert_eq!(assigned, 1);
    assert_eq!(no_capacity, 5);
    let account = store.find_account(account.id).await.unwrap().unwrap();
    assert_eq!(account.seats_used, 1);
    assert_eq!(account.status, AccountStatus::Assigned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_for_multi_seat_account_fills_every_seat() {
    let Some(store) = isolated_store().await else {
        return;
    };
    let (account, orders) = seed(&store, Some(5), 5).await;
    let allocator = allocator(store.clone());

    let (assigned, no_capacity) = race_assignments(&allocator, orders).await;

    assert_eq!(assigned, 5);
    assert_eq!(no_capacity, 0);
    let account = store.find_account(account.id).await.unwrap().unwrap();
    assert_eq!(account.seats_used, 5);
    assert_eq!(account.status, AccountStatus::Assigned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_assign_waits_for_locked_account_with_free_seats() {
    let Some(store) = isolated_store().await else {
        return;
    };
    let (account, mut orders) = seed(&store, Some(5), 1).await;
    let order = orders.remove(0);
    let allocator = allocator(store.clone());

    // Another transaction holds the only account, as an admin edit would.
    let mut holder = store.begin().await.unwrap();
    holder.lock_account(account.id).await.unwrap().unwrap();

    let pending = tokio::spawn(async move {
        let actor = AuditActor::system();
        allocator
            .assign_to_user(&order, &order.customer_email, Duration::days(30), &actor)
            .await
            .unwrap()
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!pending.is_finished());

    holder.rollback().await.unwrap();
    let outcome = pending.await.unwrap();

    assert!(matches!(outcome, AssignOutcome::Assigned(_)));
    let account = store.find_account(account.id).await.unwrap().unwrap();
    assert_eq!(account.seats_used, 1);
}
