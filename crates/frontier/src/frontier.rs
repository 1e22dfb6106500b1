use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crawlsite_core::{CrawlConfig, EdgeRecord, LinkType};

/// One pending fetch: no priority field — jobs are strict FIFO.
#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub url: Url,
    pub depth: u32,
    pub parent_url: Option<String>,
}

/// Per-URL state machine; transitions are monotonic and never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlState {
    Enqueued,
    Fetching,
    Fetched,
    FailedFetch,
    Classified,
}

struct QueueEntry {
    job: CrawlJob,
    _permit: OwnedSemaphorePermit,
}

/// Bounded same-origin BFS frontier. Uses an exact `DashMap` seen-set
/// rather than a probabilistic filter, since exact one-entry-per-URL
/// dedup is required at a bound of at most a few thousand URLs per run.
pub struct Frontier {
    run_id: Uuid,
    seed: String,
    config: CrawlConfig,
    queue: Mutex<VecDeque<QueueEntry>>,
    capacity: Arc<Semaphore>,
    /// Every URL ever observed as an edge target, same-origin or external.
    seen: DashMap<String, ()>,
    parent_map: DashMap<String, String>,
    url_state: DashMap<String, UrlState>,
    enqueued_count: AtomicUsize,
}

impl Frontier {
    /// Seeds the queue and seen-set with the canonicalized seed URL at
    /// depth 0.
    pub fn new(run_id: Uuid, seed: Url, config: CrawlConfig) -> Self {
        let seed_str = seed.to_string();
        let seen = DashMap::new();
        seen.insert(seed_str.clone(), ());
        let url_state = DashMap::new();
        url_state.insert(seed_str.clone(), UrlState::Enqueued);

        let capacity = Arc::new(Semaphore::new(4 * config.max_concurrent_requests));

        // The seed always has capacity reserved for it; acquiring here can
        // never block since the semaphore was just created.
        let permit = capacity
            .clone()
            .try_acquire_owned()
            .expect("fresh semaphore has capacity for the seed");
        let mut initial = VecDeque::new();
        initial.push_back(QueueEntry {
            job: CrawlJob {
                url: seed,
                depth: 0,
                parent_url: None,
            },
            _permit: permit,
        });

        Self {
            run_id,
            seed: seed_str,
            config,
            queue: Mutex::new(initial),
            capacity,
            seen,
            parent_map: DashMap::new(),
            url_state,
            enqueued_count: AtomicUsize::new(1),
        }
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    pub async fn pop(&self) -> Option<CrawlJob> {
        let mut queue = self.queue.lock().await;
        queue.pop_front().map(|entry| entry.job)
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn enqueued_count(&self) -> usize {
        self.enqueued_count.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, url: &str, state: UrlState) {
        self.url_state.insert(url.to_string(), state);
    }

    pub fn state(&self, url: &str) -> Option<UrlState> {
        self.url_state.get(url).map(|e| *e)
    }

    /// Snapshot of `parent_map` for persistence / `ParentChildMaps::rebuild_derived`.
    pub fn parent_map_snapshot(&self) -> std::collections::HashMap<String, String> {
        self.parent_map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Applies the enqueue conditions to `children`, in document order, and
    /// returns one `EdgeRecord` stub per *first* occurrence of each
    /// canonical URL (edge records are keyed by `(run_id, url)` — repeat
    /// occurrences on other parents update no additional record; see
    /// DESIGN.md).
    pub async fn enqueue_children(
        &self,
        parent_url: &str,
        depth: u32,
        children: &[(String, LinkType)],
    ) -> Vec<EdgeRecord> {
        let mut edges = Vec::with_capacity(children.len());

        for (child_url, link_type) in children {
            let first_seen = self.seen.insert(child_url.clone(), ()).is_none();
            if !first_seen {
                continue;
            }

            let is_external = *link_type == LinkType::External;
            if !is_external {
                self.parent_map
                    .insert(child_url.clone(), parent_url.to_string());

                let within_depth = depth + 1 <= self.config.max_crawl_depth;
                let within_budget =
                    self.enqueued_count.load(Ordering::SeqCst) < self.config.max_pages_to_crawl;

                if within_depth && within_budget {
                    if let Ok(url) = Url::parse(child_url) {
                        self.enqueued_count.fetch_add(1, Ordering::SeqCst);
                        self.url_state
                            .insert(child_url.clone(), UrlState::Enqueued);
                        self.push(CrawlJob {
                            url,
                            depth: depth + 1,
                            parent_url: Some(parent_url.to_string()),
                        })
                        .await;
                    }
                } else {
                    debug!(
                        %child_url,
                        within_depth,
                        within_budget,
                        "child discovered but not enqueued"
                    );
                }
            }

            edges.push(EdgeRecord::unvalidated(
                self.run_id,
                child_url.clone(),
                parent_url.to_string(),
                *link_type,
            ));
        }

        edges
    }

    async fn push(&self, job: CrawlJob) {
        let permit = self
            .capacity
            .clone()
            .acquire_owned()
            .await
            .expect("frontier capacity semaphore never closed");
        let mut queue = self.queue.lock().await;
        queue.push_back(QueueEntry { job, _permit: permit });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlsite_core::EdgeStatus;

    fn config() -> CrawlConfig {
        CrawlConfig {
            max_crawl_depth: 1,
            max_pages_to_crawl: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn seed_is_enqueued_at_construction() {
        let seed = Url::parse("http://a.example/").unwrap();
        let frontier = Frontier::new(Uuid::new_v4(), seed.clone(), config());
        assert_eq!(frontier.len().await, 1);
        let job = frontier.pop().await.unwrap();
        assert_eq!(job.url, seed);
        assert_eq!(job.depth, 0);
        assert!(job.parent_url.is_none());
    }

    #[tokio::test]
    async fn enqueues_same_origin_children_in_order() {
        let seed = Url::parse("http://a.example/").unwrap();
        let frontier = Frontier::new(Uuid::new_v4(), seed, config());
        frontier.pop().await;

        let children = vec![
            ("http://a.example/x".to_string(), LinkType::StaticHtml),
            ("http://a.example/y".to_string(), LinkType::StaticHtml),
        ];
        let edges = frontier
            .enqueue_children("http://a.example/", 0, &children)
            .await;
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.status == EdgeStatus::Unknown));
        assert_eq!(frontier.len().await, 2);
        assert_eq!(frontier.enqueued_count(), 3);
    }

    #[tokio::test]
    async fn external_children_never_enqueued_but_get_one_edge() {
        let seed = Url::parse("http://a.example/").unwrap();
        let frontier = Frontier::new(Uuid::new_v4(), seed, config());
        frontier.pop().await;

        let children = vec![("http://other.example/".to_string(), LinkType::External)];
        let edges = frontier
            .enqueue_children("http://a.example/", 0, &children)
            .await;
        assert_eq!(edges.len(), 1);
        assert_eq!(frontier.len().await, 0);
        assert!(frontier.parent_map_snapshot().is_empty());
    }

    #[tokio::test]
    async fn depth_cap_records_edge_without_enqueue() {
        let mut cfg = config();
        cfg.max_crawl_depth = 1;
        let seed = Url::parse("http://a.example/").unwrap();
        let frontier = Frontier::new(Uuid::new_v4(), seed, cfg);
        frontier.pop().await;

        // depth=1 (already at max_crawl_depth) -> depth+1=2 > 1, must not enqueue.
        let children = vec![("http://a.example/deep".to_string(), LinkType::StaticHtml)];
        let edges = frontier
            .enqueue_children("http://a.example/x", 1, &children)
            .await;
        assert_eq!(edges.len(), 1);
        assert_eq!(frontier.len().await, 0);
        assert_eq!(
            frontier.parent_map_snapshot().get("http://a.example/deep"),
            Some(&"http://a.example/x".to_string())
        );
    }

    #[tokio::test]
    async fn repeat_discovery_yields_no_second_edge() {
        let seed = Url::parse("http://a.example/").unwrap();
        let frontier = Frontier::new(Uuid::new_v4(), seed, config());
        frontier.pop().await;

        let children = vec![("http://a.example/x".to_string(), LinkType::StaticHtml)];
        let first = frontier
            .enqueue_children("http://a.example/", 0, &children)
            .await;
        assert_eq!(first.len(), 1);

        let second = frontier
            .enqueue_children("http://a.example/other-parent", 0, &children)
            .await;
        assert!(second.is_empty());
    }
}
