//! Live-Redis backend tests.
//!
//! These exercise the Lua scripts and partition layout against a real
//! Redis and are ignored by default:
//!
//! ```bash
//! REDIS_URL=redis://127.0.0.1:6379 cargo test -p registry-store -- --ignored
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use fulcrum_protocol::{RegisteredServer, ServerId, SlotId};
use registry_store::{
    create_store, CapacityReservation, EntityStore, IdStore, RedisConfig, SlotStore, StoreBackend,
    StoreBundle, StoreError, StoreFactoryConfig,
};
use serial_test::serial;

static TEST_SEQ: AtomicU32 = AtomicU32::new(0);

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
}

/// Every test writes under its own prefix so runs never collide.
fn stores(test_name: &str) -> StoreBundle {
    let prefix = format!(
        "test:{}:{}:{}",
        test_name,
        std::process::id(),
        TEST_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    create_store(StoreFactoryConfig {
        backend: StoreBackend::Redis,
        redis: RedisConfig {
            url: redis_url(),
            pool_max: 8,
            key_prefix: prefix,
        },
    })
    .expect("redis store")
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn numbers_allocate_contiguously_and_recycle_lowest_first() {
    let bundle = stores("ids");
    for expected in 1..=3 {
        assert_eq!(
            bundle.ids.allocate_numeric("servers:mini").await.unwrap(),
            expected
        );
    }
    bundle
        .ids
        .release_numeric("servers:mini", 2, None)
        .await
        .unwrap();
    bundle
        .ids
        .release_numeric("servers:mini", 1, None)
        .await
        .unwrap();
    assert_eq!(bundle.ids.allocate_numeric("servers:mini").await.unwrap(), 1);
    assert_eq!(bundle.ids.allocate_numeric("servers:mini").await.unwrap(), 2);
    assert_eq!(bundle.ids.allocate_numeric("servers:mini").await.unwrap(), 4);
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn letter_pool_exhausts_at_twenty_six() {
    let bundle = stores("letters");
    for expected in 'A'..='Z' {
        assert_eq!(
            bundle.ids.allocate_letter("mini1").await.unwrap(),
            Some(expected)
        );
    }
    assert_eq!(bundle.ids.allocate_letter("mini1").await.unwrap(), None);

    // Cascading release drops the whole pool.
    bundle
        .ids
        .release_numeric("servers:mini", 1, Some("mini1"))
        .await
        .unwrap();
    assert_eq!(
        bundle.ids.allocate_letter("mini1").await.unwrap(),
        Some('A')
    );
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn concurrent_reservations_grant_exactly_one_winner() {
    let bundle = stores("race");
    let server = ServerId::from("mini1");
    bundle
        .slots
        .set_capacity(&server, "mini", 1)
        .await
        .unwrap();

    let slots = bundle.slots;
    let mut handles = Vec::new();
    for _ in 0..32 {
        let slots = Arc::clone(&slots);
        let server = server.clone();
        handles.push(tokio::spawn(async move {
            slots.reserve_capacity(&server, "mini").await.unwrap()
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if let CapacityReservation::Reserved { .. } = handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1, "the decrement script must never double-grant");
    assert!(slots.advertisers("mini").await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn corrupt_record_is_skipped_on_partition_load() {
    let bundle = stores("corrupt");
    let healthy = RegisteredServer {
        id: ServerId::from("mini1"),
        host: "10.0.0.1".to_string(),
        port: 25601,
        capacity: HashMap::new(),
        status: Default::default(),
        state: Default::default(),
        last_heartbeat_ms: 5,
        unavailable_since_ms: None,
        temp_id: None,
    };
    bundle.servers.save_active(&healthy).await.unwrap();

    let mut broken = healthy.clone();
    broken.id = ServerId::from("mini2");
    broken.host = "10.0.0.2".to_string();
    bundle.servers.save_active(&broken).await.unwrap();

    // Corrupt the stored hash in place: give it a garbage port.
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let pattern = format!(
        "test:corrupt:{}:*:servers:active:mini2",
        std::process::id()
    );
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(&pattern)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(keys.len(), 1, "expected exactly one mini2 record");
    let _: () = redis::cmd("HSET")
        .arg(&keys[0])
        .arg("port")
        .arg("not-a-port")
        .query_async(&mut conn)
        .await
        .unwrap();

    let loaded = bundle.servers.load_active().await.unwrap();
    assert_eq!(loaded.len(), 1, "corrupt record must be skipped, not fatal");
    assert_eq!(loaded[0].id.0, "mini1");
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn reservation_tokens_consume_exactly_once() {
    let bundle = stores("reservation");
    let slot = SlotId::from("mini1A");

    bundle
        .slots
        .create_reservation("Notch", "tok-1", &slot, 60_000)
        .await
        .unwrap();
    let locked = bundle
        .slots
        .create_reservation("Notch", "tok-2", &slot, 60_000)
        .await;
    assert!(matches!(locked, Err(StoreError::ReservationLocked { .. })));

    let mismatch = bundle
        .slots
        .consume_reservation("Notch", "tok-9", &slot)
        .await;
    assert!(matches!(
        mismatch,
        Err(StoreError::ReservationMismatch { .. })
    ));

    bundle
        .slots
        .consume_reservation("Notch", "tok-1", &slot)
        .await
        .unwrap();
    let gone = bundle
        .slots
        .consume_reservation("Notch", "tok-1", &slot)
        .await;
    assert!(matches!(gone, Err(StoreError::ReservationExpired { .. })));
}
