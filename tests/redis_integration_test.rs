//! Redis Backend Integration Tests
//!
//! These tests require a running Redis instance (6.2+ for `GEOSEARCH`).
//!
//! ```bash
//! docker run --rm -p 6379:6379 redis:7
//! cargo test --features redis --test redis_integration_test -- --ignored
//! ```
//!
//! ## Environment Variables
//!
//! - `TEST_REDIS_URL`: Redis connection URL (default: "redis://localhost:6379")
//!
//! Each test uses its own namespace so runs never see each other's keys.

#![cfg(feature = "redis")]

use ride_cache::backend::{CacheBackend, RedisBackend};
use ride_cache::config::CacheConfig;
use ride_cache::{CacheService, DistanceUnit, DriverLocation, Error, GeoPoint};
use std::env;
use std::time::Duration;

fn get_redis_url() -> String {
    env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

async fn create_test_service() -> CacheService<RedisBackend> {
    let backend = RedisBackend::from_connection_string(&get_redis_url())
        .await
        .expect("Failed to create Redis backend");
    assert!(backend.health_check().await.expect("Redis not reachable"));

    let namespace = format!("test-{}", uuid::Uuid::new_v4());
    CacheService::with_config(backend, CacheConfig::default().with_namespace(namespace))
        .expect("Invalid config")
}

#[tokio::test]
#[ignore]
async fn test_redis_set_get_ttl() {
    let cache = create_test_service().await;

    cache
        .set("ride:r-1", &"requested", Some(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(cache.get::<String>("ride:r-1").await.unwrap(), "requested");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(cache.get::<String>("ride:r-1").await.unwrap_err().is_not_found());
}

#[tokio::test]
#[ignore]
async fn test_redis_concurrent_increments() {
    let cache = create_test_service().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                cache
                    .increment("trips", 1, Some(Duration::from_secs(30)))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(cache.counters().get("trips").await.unwrap(), 400);
    assert!(cache.counters().ttl("trips").await.unwrap().is_some());
}

#[tokio::test]
#[ignore]
async fn test_redis_rate_limit() {
    let cache = create_test_service().await;
    let window = Duration::from_secs(1);

    for i in 1..=5u64 {
        let result = cache.check_rate_limit("login", 3, window).await.unwrap();
        assert_eq!(result.count, i);
        assert_eq!(result.allowed, i <= 3);
    }

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(cache.check_rate_limit("login", 3, window).await.unwrap().allowed);
}

#[tokio::test]
#[ignore]
async fn test_redis_lock_compare_and_delete() {
    let cache = create_test_service().await;

    let stale = cache.lock("ride:r-1", Duration::from_millis(200)).await.unwrap();
    assert!(matches!(
        cache.lock("ride:r-1", Duration::from_secs(5)).await,
        Err(Error::LockHeld(_))
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let current = cache.lock("ride:r-1", Duration::from_secs(5)).await.unwrap();

    assert!(!cache.unlock(&stale).await.unwrap());
    assert!(cache.unlock(&current).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_redis_geo() {
    let cache = create_test_service().await;
    cache
        .geo_add(
            "drivers",
            &[
                GeoPoint::new("d1", -122.42, 37.77).unwrap(),
                GeoPoint::new("d2", -122.41, 37.78).unwrap(),
            ],
        )
        .await
        .unwrap();

    let hits = cache
        .geo_radius("drivers", -122.42, 37.77, 5.0, DistanceUnit::Kilometers)
        .await
        .unwrap();
    let members: Vec<&str> = hits.iter().map(|h| h.member.as_str()).collect();
    assert_eq!(members, vec!["d1", "d2"]);
    assert!(hits[0].distance < 0.01);
    assert!((hits[1].distance - 1.4).abs() < 0.1);
}

#[tokio::test]
#[ignore]
async fn test_redis_nearby_drivers() {
    let cache = create_test_service().await;
    let entities = cache.entities();

    let location = DriverLocation::new("d-1", 13.4050, 52.5200).unwrap();
    entities.update_driver_location(&location).await.unwrap();

    let nearby = entities
        .nearby_drivers(13.4050, 52.5200, 1.0, DistanceUnit::Kilometers, Some(5))
        .await
        .unwrap();
    assert_eq!(nearby.len(), 1);
    assert_eq!(nearby[0].location.driver_id, "d-1");

    entities.remove_driver_location("d-1").await.unwrap();
    assert!(entities.get_driver_location("d-1").await.unwrap_err().is_not_found());
}

#[tokio::test]
#[ignore]
async fn test_redis_structured_values() {
    let cache = create_test_service().await;
    let kv = cache.kv();

    kv.hset("driver:d-1:meta", "vehicle", &"sedan").await.unwrap();
    assert_eq!(
        kv.hget::<String>("driver:d-1:meta", "vehicle").await.unwrap(),
        Some("sedan".to_string())
    );

    kv.rpush("ride:r-1:events", &"requested").await.unwrap();
    kv.rpush("ride:r-1:events", &"accepted").await.unwrap();
    let events: Vec<String> = kv.lrange("ride:r-1:events", 0, -1).await.unwrap();
    assert_eq!(events, vec!["requested", "accepted"]);

    assert!(kv.sadd("zone:4:drivers", "d-1").await.unwrap());
    assert!(kv.sismember("zone:4:drivers", "d-1").await.unwrap());

    let err = kv.llen("driver:d-1:meta").await.unwrap_err();
    assert!(matches!(err, Error::WrongType(_)));

    kv.delete(&["driver:d-1:meta", "ride:r-1:events", "zone:4:drivers"])
        .await
        .unwrap();
}
