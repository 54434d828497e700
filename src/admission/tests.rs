use super::*;
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn test_first_request_granted_second_denied() {
    let bucket = TokenBucket::default();

    assert_eq!(bucket.try_acquire(), Admission::Granted);
    match bucket.try_acquire() {
        Admission::Denied { retry_after } => {
            assert!(retry_after <= Duration::from_secs(1));
            assert!(retry_after > Duration::from_millis(900));
        }
        Admission::Granted => panic!("Second request in the same second must be denied"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_grant_per_second_under_sustained_load() {
    let bucket = TokenBucket::default();
    let mut granted = 0;

    // 10 requests every 100ms for 5 seconds.
    for _ in 0..50 {
        for _ in 0..10 {
            if bucket.try_acquire().is_granted() {
                granted += 1;
            }
        }
        tokio::time::advance(Duration::from_millis(100)).await;
    }

    // Initial token plus one refill per elapsed second (t=1s..t=4.9s).
    assert_eq!(granted, 5);
}

#[tokio::test(start_paused = true)]
async fn test_refill_boundary() {
    let bucket = TokenBucket::default();
    assert!(bucket.try_acquire().is_granted());

    tokio::time::advance(Duration::from_millis(999)).await;
    assert!(!bucket.try_acquire().is_granted());

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(bucket.try_acquire().is_granted());
}

#[tokio::test(start_paused = true)]
async fn test_capacity_caps_accumulation() {
    let bucket = TokenBucket::new(&RateLimitConfig {
        capacity: 3,
        refill_tokens: 1,
        interval_ms: 1000,
    });

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(bucket.available(), 3);

    let granted = (0..10).filter(|_| bucket.try_acquire().is_granted()).count();
    assert_eq!(granted, 3);
    assert_eq!(bucket.available(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_extreme_config_saturates_without_panicking() {
    let bucket = TokenBucket::new(&RateLimitConfig {
        capacity: u32::MAX,
        refill_tokens: 1,
        interval_ms: u64::MAX,
    });
    assert!(bucket.try_acquire().is_granted());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(bucket.try_acquire().is_granted());
}

#[tokio::test(start_paused = true)]
async fn test_huge_refill_rate_still_limits() {
    let bucket = TokenBucket::new(&RateLimitConfig {
        capacity: 2,
        refill_tokens: u32::MAX,
        interval_ms: 1,
    });

    let granted = (0..10).filter(|_| bucket.try_acquire().is_granted()).count();
    assert_eq!(granted, 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_config_is_clamped() {
    let bucket = TokenBucket::new(&RateLimitConfig {
        capacity: 0,
        refill_tokens: 0,
        interval_ms: 0,
    });
    assert!(bucket.try_acquire().is_granted());
}

#[test]
fn test_concurrent_callers_never_exceed_capacity() {
    let bucket = Arc::new(TokenBucket::default());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let bucket = Arc::clone(&bucket);
            std::thread::spawn(move || {
                (0..100)
                    .filter(|_| bucket.try_acquire().is_granted())
                    .count()
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 1);
}

#[test]
fn test_config_default() {
    let config = RateLimitConfig::default();
    assert_eq!(config.capacity, 1);
    assert_eq!(config.refill_tokens, 1);
    assert_eq!(config.interval_ms, 1000);
}
