//! Property-based tests for the cache manager and in-process backend.
//!
//! Verifies:
//! - TTL correctness: a value is readable strictly before its TTL elapses
//!   and absent from then on
//! - Increment atomicity: M increments from an unset key yield exactly M
//! - Last write wins, and a rewrite restarts the TTL
//! - Pattern deletes remove exactly the matching keys

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use trafficwarden_core::backend::{FallbackBackend, InMemoryBackend};
use trafficwarden_core::cache::CacheManager;
use trafficwarden_core::clock::ManualClock;
use trafficwarden_core::config::CacheConfig;

fn arb_key() -> impl Strategy<Value = String> {
    "[a-z]{1,8}(:[a-z0-9]{1,8}){0,2}"
}

fn arb_ttl_secs() -> impl Strategy<Value = u64> {
    1u64..86_400
}

fn cache() -> (Arc<ManualClock>, CacheManager) {
    let clock = ManualClock::shared(1_700_000_000_000);
    let cache = CacheManager::new(
        FallbackBackend::local_only("cache", clock.clone()),
        &CacheConfig::default(),
    );
    (clock, cache)
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime")
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Present before the TTL elapses, absent once it has.
    #[test]
    fn prop_ttl_correctness(
        key in arb_key(),
        value in ".{0,64}",
        ttl in arb_ttl_secs(),
        before_frac in 0.0f64..1.0,
        after_ms in 0u64..100_000,
    ) {
        let (clock, cache) = cache();
        block_on(async {
            cache.set(&key, &value, ttl).await.unwrap();

            let before_ms = ((ttl * 1000 - 1) as f64 * before_frac) as u64;
            clock.advance(Duration::from_millis(before_ms));
            let hit: Option<String> = cache.get(&key).await.unwrap();
            prop_assert_eq!(hit.as_deref(), Some(value.as_str()));

            clock.advance(Duration::from_millis(ttl * 1000 - before_ms + after_ms));
            let miss: Option<String> = cache.get(&key).await.unwrap();
            prop_assert!(miss.is_none());
            prop_assert!(!cache.exists(&key).await.unwrap());
            Ok(())
        })?;
    }

    /// Sequential increments from an unset key count exactly.
    #[test]
    fn prop_increment_counts_exactly(key in arb_key(), m in 1usize..200) {
        let (_clock, cache) = cache();
        let last = block_on(async {
            let mut last = 0;
            for _ in 0..m {
                last = cache.increment(&key, Some(60)).await.unwrap();
            }
            last
        });
        prop_assert_eq!(last, m as i64);
    }

    /// The most recent write is what a read returns, with the newest TTL.
    #[test]
    fn prop_last_write_wins(
        key in arb_key(),
        writes in prop::collection::vec((any::<i64>(), 2u64..600), 1..10),
    ) {
        let (clock, cache) = cache();
        block_on(async {
            for (value, ttl) in &writes {
                cache.set(&key, value, *ttl).await.unwrap();
                clock.advance(Duration::from_secs(1));
            }
            let (last_value, last_ttl) = writes[writes.len() - 1];
            let got: Option<i64> = cache.get(&key).await.unwrap();
            prop_assert_eq!(got, Some(last_value));

            clock.advance(Duration::from_secs(last_ttl));
            let gone: Option<i64> = cache.get(&key).await.unwrap();
            prop_assert!(gone.is_none());
            Ok(())
        })?;
    }

    /// `delete_pattern("prefix:*")` removes exactly the keys under the prefix.
    #[test]
    fn prop_pattern_delete_is_exact(
        inside in prop::collection::btree_set("[a-z0-9]{1,6}", 0..12),
        outside in prop::collection::btree_set("[a-z0-9]{1,6}", 0..12),
    ) {
        let (_clock, cache) = cache();
        block_on(async {
            for id in &inside {
                cache.set(&format!("site:{id}"), &1, 300).await.unwrap();
            }
            for id in &outside {
                cache.set(&format!("widget:{id}"), &2, 300).await.unwrap();
            }
            let removed = cache.delete_pattern("site:*").await.unwrap();
            prop_assert_eq!(removed, inside.len() as u64);
            for id in &outside {
                let key = format!("widget:{id}");
                prop_assert!(cache.exists(&key).await.unwrap());
            }
            Ok(())
        })?;
    }

    /// Purging drops exactly the expired entries.
    #[test]
    fn prop_purge_removes_only_expired(
        ttls in prop::collection::vec(1u64..100, 1..30),
        elapsed in 0u64..120,
    ) {
        let clock = ManualClock::shared(0);
        let backend = InMemoryBackend::new(clock.clone());
        for (i, ttl) in ttls.iter().enumerate() {
            backend.set_now(&format!("k{i}"), "v", Duration::from_secs(*ttl));
        }
        clock.advance(Duration::from_secs(elapsed));

        let expected: BTreeSet<usize> = ttls
            .iter()
            .enumerate()
            .filter(|(_, ttl)| **ttl <= elapsed)
            .map(|(i, _)| i)
            .collect();
        prop_assert_eq!(backend.purge_expired(), expected.len());
        prop_assert_eq!(backend.len(), ttls.len() - expected.len());
    }
}
