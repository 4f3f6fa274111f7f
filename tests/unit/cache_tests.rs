use std::sync::atomic::{AtomicUsize, Ordering};

use exdav::{DavResult, PropValue, PropertyBag, QueryCache, Relop, Restriction};
use hyper::StatusCode;

fn ok_result(href: &str) -> DavResult {
    DavResult {
        href: href.to_string(),
        status: StatusCode::OK,
        props: Some(PropertyBag::new()),
    }
}

fn failed_result(href: &str) -> DavResult {
    DavResult {
        href: href.to_string(),
        status: StatusCode::NOT_FOUND,
        props: None,
    }
}

#[tokio::test]
async fn identical_trees_fetch_once() {
    let cache = QueryCache::new();
    let fetches = AtomicUsize::new(0);

    let key = Restriction::prop_int("Size", Relop::Gt, 10)
        .compile()
        .unwrap();
    for _ in 0..2 {
        let results = cache
            .search_or_fetch(&key, || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(vec![ok_result("/ex/a")])
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn value_change_changes_the_key() {
    let cache = QueryCache::new();
    let fetches = AtomicUsize::new(0);

    for value in [10, 11] {
        let key = Restriction::prop_int("Size", Relop::Gt, value)
            .compile()
            .unwrap();
        cache
            .search_or_fetch(&key, || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(vec![ok_result("/ex/a")])
            })
            .await
            .unwrap();
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn partial_failure_is_never_cached() {
    let cache = QueryCache::new();
    let fetches = AtomicUsize::new(0);

    for _ in 0..2 {
        cache
            .search_or_fetch("key", || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(vec![ok_result("/ex/a"), failed_result("/ex/b")])
            })
            .await
            .unwrap();
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn hits_hand_back_private_copies() {
    let cache = QueryCache::new();
    cache
        .search_or_fetch("key", || async { Ok(vec![ok_result("/ex/a")]) })
        .await
        .unwrap();

    let mut first = cache.lookup("key").unwrap();
    if let Some(bag) = first[0].props.as_mut() {
        bag.insert("DAV:displayname", PropValue::String("mutated".to_string()));
    }

    // The stored entry is unaffected by the caller's mutation.
    let second = cache.lookup("key").unwrap();
    assert!(second[0].props.as_ref().unwrap().is_empty());
}

#[tokio::test]
async fn clear_drops_everything() {
    let cache = QueryCache::new();
    cache
        .search_or_fetch("key", || async { Ok(vec![ok_result("/ex/a")]) })
        .await
        .unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.status_of("key"), Some(StatusCode::MULTI_STATUS));

    cache.clear();
    assert!(cache.is_empty());
    assert!(cache.lookup("key").is_none());
}
