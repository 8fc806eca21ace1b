//! Triggered commit cache tests

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use piped::cache::commit::TriggeredCommitCache;

#[test]
fn test_triggered_commit_cache_put_and_get() {
    let cache = TriggeredCommitCache::new();
    assert!(cache.is_empty());

    cache.put("app-1", "h1");
    cache.put("app-2", "h1");
    cache.put("app-1", "h2");

    assert_eq!(cache.get("app-1").as_deref(), Some("h2"));
    assert_eq!(cache.get("app-2").as_deref(), Some("h1"));
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_triggered_commit_cache_concurrent_writers() {
    let cache = Arc::new(TriggeredCommitCache::new());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = cache.clone();
            thread::spawn(move || {
                for n in 0..100 {
                    cache.put(&format!("app-{}", i), &format!("h{}", n));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len(), 8);
    for i in 0..8 {
        assert_eq!(cache.get(&format!("app-{}", i)).as_deref(), Some("h99"));
    }
}

#[test]
fn test_triggered_commit_cache_retain() {
    let cache = TriggeredCommitCache::new();
    cache.put("app-1", "h1");
    cache.put("app-2", "h1");
    cache.put("app-3", "h1");

    cache.retain(&HashSet::from(["app-1", "app-3"]));
    assert_eq!(cache.len(), 2);
    assert!(cache.get("app-2").is_none());
}
