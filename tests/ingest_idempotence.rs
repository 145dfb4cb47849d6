// tests/ingest_idempotence.rs
//
// Ingesting the same feed twice stores every item once. Tracking parameters
// and a second feed repeating the same links do not create new candidates.

use std::sync::Arc;

use chrono::Utc;

use issue_pipeline::ingest::providers::RssProvider;
use issue_pipeline::ingest::{run_once, SourceProvider};
use issue_pipeline::retry::RetryPolicy;
use issue_pipeline::store::{MemoryStore, Repository};

fn feed(n: usize, tracking: &str) -> String {
    let mut xml = String::from(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Wire</title>"#);
    for i in 0..n {
        xml.push_str(&format!(
            "<item><title>Story number {i}</title><link>https://wire.test/story/{i}{tracking}</link>\
             <pubDate>Fri, 16 Oct 2026 08:{:02}:00 +0000</pubDate></item>",
            i % 60
        ));
    }
    xml.push_str("</channel></rss>");
    xml
}

fn repo() -> Repository {
    Repository::new(Arc::new(MemoryStore::new()), RetryPolicy::default())
}

#[tokio::test]
async fn same_fifty_items_twice_gives_fifty_then_zero() {
    let repo = repo();
    let providers: Vec<Arc<dyn SourceProvider>> = vec![Arc::new(RssProvider::from_fixture("Wire", &feed(50, "")))];

    let first = run_once(&providers, &repo, Utc::now()).await.unwrap();
    assert_eq!(first.fetched, 50);
    assert_eq!(first.ingested, 50);

    let second = run_once(&providers, &repo, Utc::now()).await.unwrap();
    assert_eq!(second.ingested, 0);
    assert_eq!(second.duplicate, 50);

    assert_eq!(repo.candidates().await.unwrap().len(), 50);
}

#[tokio::test]
async fn tracking_params_and_repeat_feeds_are_not_new() {
    let repo = repo();
    let providers: Vec<Arc<dyn SourceProvider>> = vec![
        Arc::new(RssProvider::from_fixture("Wire", &feed(20, ""))),
        Arc::new(RssProvider::from_fixture("Mirror", &feed(20, "?utm_source=rss&amp;utm_medium=feed"))),
    ];

    let stats = run_once(&providers, &repo, Utc::now()).await.unwrap();
    assert_eq!(stats.fetched, 40);
    assert_eq!(stats.ingested, 20);
    assert_eq!(stats.duplicate, 20);

    let summary = stats.to_summary();
    assert_eq!(summary.get("ingested"), 20);
}

#[tokio::test]
async fn one_broken_provider_does_not_stop_the_others() {
    let repo = repo();
    let providers: Vec<Arc<dyn SourceProvider>> = vec![
        Arc::new(RssProvider::from_fixture("Broken", "<rss><channel><item>")),
        Arc::new(RssProvider::from_fixture("Wire", &feed(5, ""))),
    ];

    let stats = run_once(&providers, &repo, Utc::now()).await.unwrap();
    assert_eq!(stats.provider_errors, 1);
    assert_eq!(stats.ingested, 5);
}
