//! Single-flight guarantees of the memoizer under concurrent load.
//!
//! Run with: `cargo test --test single_flight`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use query_cache::{
    DistributedLock, InMemoryStore, KvStore, LockConfig, LockFallback, MemoConfig, MemoError,
    Memoizer, ResultCache, RetryConfig, Ttl,
};

fn memoizer(store: Arc<dyn KvStore>, fallback: LockFallback, acquire_timeout: Duration) -> Memoizer {
    let cache = Arc::new(ResultCache::new(store.clone()));
    let lock = DistributedLock::with_config(
        store,
        LockConfig {
            store_retry: RetryConfig::fast(),
            ..LockConfig::default()
        },
    );
    let config = MemoConfig::new(fallback)
        .with_lease(Duration::from_secs(10))
        .with_acquire_timeout(acquire_timeout);
    Memoizer::new(cache, lock, config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_concurrent_callers_compute_once() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
    let memo = memoizer(
        store,
        LockFallback::WaitForPeer {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(10),
        },
        Duration::from_millis(50),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let expensive = Arc::new(memo.wrap(
        "expensive_query",
        move |(course, page): (String, u32)| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(format!("{}:{}", course, page))
            }
        },
        Ttl::from_secs(60),
    ));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let expensive = expensive.clone();
        handles.push(tokio::spawn(async move {
            expensive.call(("rust".to_string(), 1)).await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "rust:1");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memoizers_sharing_a_store_compute_once() {
    // Two independent memoizers model two processes sharing one store
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
    let fallback = LockFallback::WaitForPeer {
        poll_interval: Duration::from_millis(10),
        max_wait: Duration::from_secs(10),
    };
    let a = memoizer(store.clone(), fallback, Duration::from_millis(50));
    let b = memoizer(store, fallback, Duration::from_millis(50));

    let calls = Arc::new(AtomicUsize::new(0));
    let make = |memo: &Memoizer| {
        let counter = calls.clone();
        Arc::new(memo.wrap(
            "shared",
            move |n: u64| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>(n * n)
                }
            },
            Ttl::Never,
        ))
    };
    let fa = make(&a);
    let fb = make(&b);

    let mut handles = Vec::new();
    for i in 0..20 {
        let f = if i % 2 == 0 { fa.clone() } else { fb.clone() };
        handles.push(tokio::spawn(async move { f.call(12).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 144);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_do_not_serialize() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
    let memo = memoizer(
        store,
        LockFallback::WaitForPeer {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(10),
        },
        Duration::from_secs(5),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let f = Arc::new(memo.wrap(
        "per_key",
        move |n: u32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(n)
            }
        },
        Ttl::Never,
    ));

    let started = std::time::Instant::now();
    let handles: Vec<_> = (0..10)
        .map(|n| {
            let f = f.clone();
            tokio::spawn(async move { f.call(n).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 10);
    // Ten 200ms computations on distinct keys run side by side
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_computation_lets_a_waiter_take_over() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
    let memo = memoizer(
        store,
        LockFallback::WaitForPeer {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(10),
        },
        Duration::from_millis(20),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let f = Arc::new(memo.wrap(
        "fails_first",
        move |_: ()| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                if n == 0 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        },
        Ttl::Never,
    ));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let f = f.clone();
            tokio::spawn(async move { f.call(()).await })
        })
        .collect();

    let mut failures = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(value) => assert_eq!(value, 1),
            Err(MemoError::Computation(_)) => failures += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(failures, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
