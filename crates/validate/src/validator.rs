use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;
use url::Url;

use crawlsite_core::{CrawlConfig, EdgeRecord, EdgeStatus, LinkType, PageRecord, PageType};
use crawlsite_fetch::{Fetch, FetchError};
use crawlsite_frontier::AdaptiveBatch;

static TITLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());

/// Validates a bounded sample of the edge set. Owns its own concurrency
/// and adaptive batch, independent of the fetcher's, since it runs as a
/// distinct, tighter-capped concurrency domain.
pub struct Validator<F: Fetch + Send + Sync + 'static> {
    fetcher: Arc<F>,
    semaphore: Arc<Semaphore>,
    batch: Mutex<AdaptiveBatch>,
    max_links_to_validate: usize,
}

impl<F: Fetch + Send + Sync + 'static> Validator<F> {
    pub fn new(fetcher: Arc<F>, config: &CrawlConfig) -> Self {
        Self {
            fetcher,
            semaphore: Arc::new(Semaphore::new(config.validator_concurrency)),
            batch: Mutex::new(AdaptiveBatch::new(20)),
            max_links_to_validate: config.max_links_to_validate,
        }
    }

    /// Three-tier priority selection: (1) edges whose target already
    /// appears as a fetched page, (2) same-origin unvalidated edges in
    /// discovery order, (3) external edges — capped at
    /// `max_links_to_validate`.
    pub fn select(
        &self,
        edges: &[EdgeRecord],
        fetched_pages: &HashMap<String, PageRecord>,
    ) -> Vec<EdgeRecord> {
        let mut already_fetched = Vec::new();
        let mut same_origin = Vec::new();
        let mut external = Vec::new();

        for edge in edges {
            if fetched_pages.contains_key(&edge.url) {
                already_fetched.push(edge.clone());
            } else if edge.link_type == LinkType::External {
                external.push(edge.clone());
            } else {
                same_origin.push(edge.clone());
            }
        }

        let mut selected = Vec::with_capacity(self.max_links_to_validate.min(edges.len()));
        selected.extend(already_fetched);
        selected.extend(same_origin);
        selected.extend(external);
        selected.truncate(self.max_links_to_validate);
        selected
    }

    /// Resolves selected edges against the tiered rule: edges whose
    /// target already appears as a fetched page reuse that page's outcome
    /// at no network cost (tier 1 of `select`); everything else gets an
    /// actual GET via `fetch_remaining`. Edges not passed in here are left
    /// by the caller as `status = Unknown, status_code = None` (unselected
    /// edges are simply absent from the returned `Vec`).
    pub async fn run(
        &self,
        selected: Vec<EdgeRecord>,
        fetched_pages: &HashMap<String, PageRecord>,
    ) -> Vec<EdgeRecord> {
        let mut results = Vec::with_capacity(selected.len());
        let mut to_fetch = Vec::with_capacity(selected.len());

        for mut edge in selected {
            match fetched_pages.get(&edge.url) {
                Some(page) => {
                    edge.status = status_from_page_type(page.page_type);
                    edge.status_code = Some(page.fetch_status);
                    edge.title = page.title.clone();
                    results.push(edge);
                }
                None => to_fetch.push(edge),
            }
        }

        results.extend(self.fetch_remaining(to_fetch).await);
        results
    }

    /// Issues one GET per edge in adaptive-sized batches, tighter
    /// concurrency cap than the Fetcher, and classifies the outcome per
    /// the status table below.
    async fn fetch_remaining(&self, selected: Vec<EdgeRecord>) -> Vec<EdgeRecord> {
        let mut results = Vec::with_capacity(selected.len());
        let mut iter = selected.into_iter();

        loop {
            let batch_size = self.batch.lock().await.size();
            let batch: Vec<EdgeRecord> = (&mut iter).take(batch_size).collect();
            if batch.is_empty() {
                break;
            }

            let mut handles = Vec::with_capacity(batch.len());
            for edge in batch {
                let fetcher = self.fetcher.clone();
                let semaphore = self.semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("validator semaphore never closed");
                    validate_one(fetcher.as_ref(), edge).await
                }));
            }

            for handle in handles {
                let (edge, is_error) = handle.await.expect("validator task panicked");
                self.batch.lock().await.record_outcome(is_error);
                debug!(url = %edge.url, status = ?edge.status, "validated edge");
                results.push(edge);
            }

            self.batch.lock().await.adjust_for_next_batch();
        }

        results
    }
}

async fn validate_one<F: Fetch>(fetcher: &F, mut edge: EdgeRecord) -> (EdgeRecord, bool) {
    let Ok(url) = Url::parse(&edge.url) else {
        edge.status = EdgeStatus::Unknown;
        return (edge, true);
    };

    match fetcher.fetch(&url).await {
        Ok(outcome) => {
            edge.status_code = Some(outcome.status);
            edge.response_time_ms = Some(outcome.elapsed.as_millis() as u64);
            edge.status = classify_status(outcome.status);
            if edge.status == EdgeStatus::Valid {
                edge.title = extract_title(&String::from_utf8_lossy(&outcome.body));
            }
            let is_error = edge.status != EdgeStatus::Valid;
            (edge, is_error)
        }
        Err(FetchError::Timeout(_)) => {
            edge.status = EdgeStatus::Timeout;
            (edge, true)
        }
        Err(FetchError::RateLimited { .. }) => {
            edge.status = EdgeStatus::RateLimited;
            (edge, true)
        }
        Err(_) => {
            edge.status = EdgeStatus::Unknown;
            (edge, true)
        }
    }
}

/// Maps an already-fetched page's classification onto the edge status
/// table, so tier-1 reuse never issues a redundant GET.
fn status_from_page_type(page_type: PageType) -> EdgeStatus {
    match page_type {
        PageType::Content | PageType::Blank => EdgeStatus::Valid,
        PageType::Error => EdgeStatus::Broken,
        PageType::Redirect => EdgeStatus::Redirect,
    }
}

fn classify_status(status: u16) -> EdgeStatus {
    match status {
        200..=299 => EdgeStatus::Valid,
        300..=399 => EdgeStatus::Redirect,
        400..=599 => EdgeStatus::Broken,
        _ => EdgeStatus::Unknown,
    }
}

fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&TITLE_SEL)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crawlsite_core::EdgeRecord as Edge;
    use crawlsite_fetch::FetchOutcome;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    struct StubFetcher {
        status: AtomicU16,
    }

    #[async_trait]
    impl Fetch for StubFetcher {
        async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
            Ok(FetchOutcome {
                status: self.status.load(Ordering::SeqCst),
                headers: Map::new(),
                body: b"<html><head><title>Hi</title></head></html>".to_vec(),
                elapsed: Duration::from_millis(5),
                final_url: url.clone(),
            })
        }
    }

    fn run_id() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn selection_prioritizes_already_fetched_then_same_origin_then_external() {
        let config = CrawlConfig {
            max_links_to_validate: 2,
            ..Default::default()
        };
        let fetcher = Arc::new(StubFetcher {
            status: AtomicU16::new(200),
        });
        let validator = Validator::new(fetcher, &config);

        let run = run_id();
        let edges = vec![
            Edge::unvalidated(run, "http://a/ext".into(), "http://a/".into(), LinkType::External),
            Edge::unvalidated(run, "http://a/new".into(), "http://a/".into(), LinkType::StaticHtml),
            Edge::unvalidated(run, "http://a/known".into(), "http://a/".into(), LinkType::StaticHtml),
        ];
        let mut fetched = Map::new();
        fetched.insert(
            "http://a/known".to_string(),
            PageRecord {
                run_id: run,
                url: "http://a/known".into(),
                title: None,
                word_count: 10,
                page_type: crawlsite_core::PageType::Content,
                has_header: false,
                has_footer: false,
                has_navigation: false,
                structure_digest: "x".into(),
                depth: 1,
                path: vec!["http://a/".into(), "http://a/known".into()],
                fetch_status: 200,
            },
        );

        let selected = validator.select(&edges, &fetched);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].url, "http://a/known");
        assert_eq!(selected[1].url, "http://a/new");
    }

    #[tokio::test]
    async fn run_classifies_2xx_as_valid_with_title() {
        let config = CrawlConfig::default();
        let fetcher = Arc::new(StubFetcher {
            status: AtomicU16::new(200),
        });
        let validator = Validator::new(fetcher, &config);

        let run = run_id();
        let edges = vec![Edge::unvalidated(
            run,
            "http://a.example/x".into(),
            "http://a.example/".into(),
            LinkType::StaticHtml,
        )];
        let results = validator.run(edges, &Map::new()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, EdgeStatus::Valid);
        assert_eq!(results[0].title.as_deref(), Some("Hi"));
    }

    #[tokio::test]
    async fn run_classifies_4xx_as_broken() {
        let config = CrawlConfig::default();
        let fetcher = Arc::new(StubFetcher {
            status: AtomicU16::new(404),
        });
        let validator = Validator::new(fetcher, &config);

        let run = run_id();
        let edges = vec![Edge::unvalidated(
            run,
            "http://a.example/missing".into(),
            "http://a.example/".into(),
            LinkType::StaticHtml,
        )];
        let results = validator.run(edges, &Map::new()).await;
        assert_eq!(results[0].status, EdgeStatus::Broken);
        assert!(results[0].title.is_none());
    }

    /// Edges whose target already appears as a fetched page must reuse
    /// that page's classification rather than issuing a redundant GET. A
    /// fetcher that always errors proves no network call happened for
    /// this edge.
    #[tokio::test]
    async fn run_reuses_known_status_for_already_fetched_targets() {
        struct FailingFetcher;
        #[async_trait]
        impl Fetch for FailingFetcher {
            async fn fetch(&self, _url: &Url) -> Result<FetchOutcome, FetchError> {
                Err(FetchError::Timeout(Duration::from_secs(1)))
            }
        }

        let config = CrawlConfig::default();
        let validator = Validator::new(Arc::new(FailingFetcher), &config);

        let run = run_id();
        let edges = vec![Edge::unvalidated(
            run,
            "http://a.example/known".into(),
            "http://a.example/".into(),
            LinkType::StaticHtml,
        )];
        let mut fetched = Map::new();
        fetched.insert(
            "http://a.example/known".to_string(),
            PageRecord {
                run_id: run,
                url: "http://a.example/known".into(),
                title: Some("Known Page".into()),
                word_count: 10,
                page_type: crawlsite_core::PageType::Content,
                has_header: false,
                has_footer: false,
                has_navigation: false,
                structure_digest: "x".into(),
                depth: 1,
                path: vec!["http://a.example/".into(), "http://a.example/known".into()],
                fetch_status: 200,
            },
        );

        let results = validator.run(edges, &fetched).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, EdgeStatus::Valid);
        assert_eq!(results[0].status_code, Some(200));
        assert_eq!(results[0].title.as_deref(), Some("Known Page"));
    }
}
