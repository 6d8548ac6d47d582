use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Barrier,
    },
    thread,
    time::Duration,
};

use serde_json::{json, Value};

use splitkit::{ConfigSource, Error, FeatureRepository, FetchResult, InMemoryFeatureCache, Result};

/// Serves a fixed payload after `delay`, counting fetches.
struct SlowSource {
    fetches: Arc<AtomicUsize>,
    delay: Duration,
    outcome: Result<Value>,
}

impl ConfigSource for SlowSource {
    fn fetch(&self, _: &str, _: &str, _: Option<&str>) -> Result<FetchResult> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let payload = self.outcome.clone()?;
        Ok(FetchResult::Fetched {
            payload,
            etag: None,
        })
    }
}

fn repository(
    outcome: Result<Value>,
    delay: Duration,
    ttl: Duration,
) -> (Arc<FeatureRepository>, Arc<AtomicUsize>) {
    let fetches = Arc::new(AtomicUsize::new(0));
    let source = SlowSource {
        fetches: fetches.clone(),
        delay,
        outcome,
    };
    let repository = FeatureRepository::new(
        Arc::new(source),
        Arc::new(InMemoryFeatureCache::new()),
        ttl,
    );
    (Arc::new(repository), fetches)
}

fn payload() -> Value {
    json!({ "features": { "dark-mode": { "defaultValue": true } } })
}

fn load_concurrently(repository: &Arc<FeatureRepository>, callers: usize) -> Vec<Result<()>> {
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let repository = repository.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                repository
                    .load_features("https://features.test", "key")
                    .map(|features| assert!(features.features.contains_key("dark-mode")))
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect()
}

#[test]
fn serves_fresh_payload_from_cache() {
    let (repository, fetches) = repository(Ok(payload()), Duration::ZERO, Duration::from_secs(60));

    repository.load_features("https://features.test", "key").unwrap();
    repository.load_features("https://features.test", "key").unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn cache_keys_are_per_host_and_client_key() {
    let (repository, fetches) = repository(Ok(payload()), Duration::ZERO, Duration::from_secs(60));

    repository.load_features("https://features.test", "key").unwrap();
    repository.load_features("https://features.test", "other-key").unwrap();
    repository.load_features("https://other.test", "key").unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 3);
}

#[test]
fn concurrent_loads_share_one_fetch() {
    let (repository, fetches) = repository(
        Ok(payload()),
        Duration::from_millis(100),
        Duration::from_millis(300),
    );

    for result in load_concurrently(&repository, 8) {
        result.unwrap();
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    // Let the cached payload expire.
    thread::sleep(Duration::from_millis(400));

    for result in load_concurrently(&repository, 8) {
        result.unwrap();
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_callers_share_the_error() {
    let (repository, fetches) = repository(
        Err(Error::Unauthorized),
        Duration::from_millis(100),
        Duration::from_secs(60),
    );

    for result in load_concurrently(&repository, 4) {
        assert!(matches!(result, Err(Error::Unauthorized)));
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    // Failures are not cached.
    assert!(repository.load_features("https://features.test", "key").is_err());
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn refresh_bypasses_fresh_cache() {
    let (repository, fetches) = repository(Ok(payload()), Duration::ZERO, Duration::from_secs(60));

    repository.load_features("https://features.test", "key").unwrap();
    repository.refresh_features("https://features.test", "key").unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

/// Panics in the first fetch, serves the payload afterwards.
struct PanickingSource {
    fetches: AtomicUsize,
}

impl ConfigSource for PanickingSource {
    fn fetch(&self, _: &str, _: &str, _: Option<&str>) -> Result<FetchResult> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(200));
            panic!("source failure");
        }
        Ok(FetchResult::Fetched {
            payload: payload(),
            etag: None,
        })
    }
}

#[test]
fn panicking_fetch_releases_waiters() {
    let repository = Arc::new(FeatureRepository::new(
        Arc::new(PanickingSource {
            fetches: AtomicUsize::new(0),
        }),
        Arc::new(InMemoryFeatureCache::new()),
        Duration::from_secs(60),
    ));

    let leader = {
        let repository = repository.clone();
        thread::spawn(move || repository.load_features("https://features.test", "key"))
    };
    thread::sleep(Duration::from_millis(50));

    let (sender, receiver) = mpsc::channel();
    {
        let repository = repository.clone();
        thread::spawn(move || {
            let _ = sender.send(repository.load_features("https://features.test", "key"));
        });
    }

    assert!(leader.join().is_err());
    let waiter = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(waiter, Err(Error::FetchPanicked)));

    // The key is released, so the next caller fetches again.
    let (sender, receiver) = mpsc::channel();
    {
        let repository = repository.clone();
        thread::spawn(move || {
            let _ = sender.send(repository.load_features("https://features.test", "key"));
        });
    }
    let later = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(later.unwrap().features.contains_key("dark-mode"));
}
