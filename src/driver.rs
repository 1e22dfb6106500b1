use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crawlsite_core::{
    CrawlConfig, CrawlError, EdgeRecord, LinkType, PageRecord, PageType, ParentChildMaps, Run,
    RunId, RunState, SourceBody,
};
use crawlsite_extract::{classify, extract};
use crawlsite_fetch::{Fetch, HttpFetcher};
use crawlsite_frontier::{AdaptiveBatch, CrawlJob, Frontier, UrlState};
use crawlsite_store::Store;
use crawlsite_validate::Validator;

/// Final state of a completed or failed run, returned by the spawned task
/// behind a `RunHandle`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: Run,
}

/// Point-in-time snapshot of a running (or finished) run, read without
/// consuming the underlying task.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub state: RunState,
    pub progress: u8,
    pub ready: bool,
    pub successful: bool,
    pub failed: bool,
    pub info: Option<String>,
}

/// Handle to an in-flight run. The `JoinHandle` alone can't answer "how far
/// along is it" without being awaited (and awaiting consumes it), so this
/// pairs it with a live-updated snapshot the pipeline writes to as it goes.
pub struct RunHandle {
    pub run_id: RunId,
    join: JoinHandle<RunOutcome>,
    snapshot: Arc<Mutex<Run>>,
    pages_fetched: Arc<AtomicUsize>,
    max_pages_to_crawl: usize,
}

impl RunHandle {
    /// Consumes the handle, waiting for the run to finish.
    pub async fn join(self) -> Result<RunOutcome, CrawlError> {
        self.join
            .await
            .map_err(|e| CrawlError::Invariant(format!("run task panicked: {e}")))
    }
}

/// Orchestrates Fetcher -> Frontier -> Classifier -> Validator -> Store for
/// one run at a time; callers own one `RunDriver` per `Store`.
pub struct RunDriver {
    store: Arc<Store>,
}

impl RunDriver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Validates `config`, persists the `Pending` run row, and spawns the
    /// pipeline task. Returns immediately; use `run_status` or `handle.join`
    /// to observe progress and completion.
    pub async fn start_run(
        &self,
        application_id: Uuid,
        seed: Url,
        config: CrawlConfig,
    ) -> Result<RunHandle, CrawlError> {
        config.validate()?;

        let run = Run::pending(application_id, chrono::Utc::now());
        let run_id = run.id;

        self.store
            .persist_run(&run, &[], &[], &ParentChildMaps::default(), &[])
            .await
            .map_err(CrawlError::Store)?;

        let snapshot = Arc::new(Mutex::new(run.clone()));
        let pages_fetched = Arc::new(AtomicUsize::new(0));
        let max_pages_to_crawl = config.max_pages_to_crawl;

        let store = self.store.clone();
        let snapshot_for_task = snapshot.clone();
        let pages_fetched_for_task = pages_fetched.clone();

        let join = tokio::spawn(async move {
            run_pipeline(run, seed, config, store, snapshot_for_task, pages_fetched_for_task).await
        });

        Ok(RunHandle {
            run_id,
            join,
            snapshot,
            pages_fetched,
            max_pages_to_crawl,
        })
    }

    /// Reads the handle's live snapshot without consuming it.
    pub async fn run_status(handle: &RunHandle) -> RunStatus {
        let run = handle.snapshot.lock().await;
        let progress = if handle.max_pages_to_crawl == 0 {
            100
        } else {
            let fetched = handle.pages_fetched.load(Ordering::SeqCst);
            ((fetched * 100) / handle.max_pages_to_crawl).min(100) as u8
        };

        RunStatus {
            state: run.state,
            progress: if run.state == RunState::Completed || run.state == RunState::Failed {
                100
            } else {
                progress
            },
            ready: matches!(run.state, RunState::Completed | RunState::Failed),
            successful: run.state == RunState::Completed,
            failed: run.state == RunState::Failed,
            info: run.error_message.clone(),
        }
    }
}

async fn run_pipeline(
    mut run: Run,
    seed: Url,
    config: CrawlConfig,
    store: Arc<Store>,
    snapshot: Arc<Mutex<Run>>,
    pages_fetched: Arc<AtomicUsize>,
) -> RunOutcome {
    run.state = RunState::Running;
    run.started_at = Some(chrono::Utc::now());
    *snapshot.lock().await = run.clone();

    let cancellation = CancellationToken::new();
    let ceiling = config.wall_clock_ceiling();
    let ceiling_token = cancellation.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(ceiling).await;
        ceiling_token.cancel();
    });

    let outcome = execute(&run, &seed, &config, cancellation.clone(), pages_fetched).await;
    timer.abort();

    match outcome {
        Ok((pages, edges, bodies, maps)) => {
            run.pages_analyzed = pages.len() as u64;
            run.links_found = edges.len() as u64;
            run.broken_count = edges
                .iter()
                .filter(|e| e.status == crawlsite_core::EdgeStatus::Broken)
                .count() as u64;
            run.blank_count = pages.iter().filter(|p| p.page_type == PageType::Blank).count() as u64;
            run.content_page_count = pages
                .iter()
                .filter(|p| p.page_type == PageType::Content)
                .count() as u64;
            run.score = compute_score(&run);
            run.completed_at = Some(chrono::Utc::now());
            run.state = RunState::Completed;

            if let Err(e) = store.persist_run(&run, &pages, &edges, &maps, &bodies).await {
                warn!(run_id = %run.id, error = %e, "store write failed, retrying once");
                if let Err(e2) = store.persist_run(&run, &pages, &edges, &maps, &bodies).await {
                    error!(run_id = %run.id, error = %e2, "store write failed after retry");
                    run.state = RunState::Failed;
                    run.error_message = Some(format!("store write failed: {e2}"));
                    let _ = store
                        .persist_run(&run, &[], &[], &ParentChildMaps::default(), &[])
                        .await;
                }
            }
        }
        Err(e) => {
            run.completed_at = Some(chrono::Utc::now());
            run.state = RunState::Failed;
            run.error_message = Some(e.to_string());
            error!(run_id = %run.id, error = %e, "run failed");
            let _ = store
                .persist_run(&run, &[], &[], &ParentChildMaps::default(), &[])
                .await;
        }
    }

    *snapshot.lock().await = run.clone();
    RunOutcome { run }
}

enum JobOutcome {
    Fetched {
        page: PageRecord,
        new_edges: Vec<EdgeRecord>,
        body: Option<SourceBody>,
        is_error: bool,
    },
    Failed,
}

/// Runs the crawl to completion: pops the frontier in adaptive-sized
/// batches, fetches/classifies/extracts each job concurrently within a
/// batch, feeds the results back into the frontier, and repeats until the
/// frontier is drained or `cancellation` fires.
async fn execute(
    run: &Run,
    seed: &Url,
    config: &CrawlConfig,
    cancellation: CancellationToken,
    pages_fetched: Arc<AtomicUsize>,
) -> Result<(Vec<PageRecord>, Vec<EdgeRecord>, Vec<SourceBody>, ParentChildMaps), CrawlError> {
    let fetcher = Arc::new(HttpFetcher::new(config)?);
    let frontier = Arc::new(Frontier::new(run.id, seed.clone(), config.clone()));
    let path_map: Arc<DashMap<String, Vec<String>>> = Arc::new(DashMap::new());
    path_map.insert(seed.to_string(), vec![seed.to_string()]);

    let mut adaptive = AdaptiveBatch::new(config.max_concurrent_requests.clamp(5, 50));
    let mut pages = Vec::new();
    let mut edges = Vec::new();
    let mut bodies = Vec::new();

    loop {
        if cancellation.is_cancelled() {
            return Err(CrawlError::Invariant(
                "cancelled: wall-clock ceiling exceeded".to_string(),
            ));
        }
        if frontier.is_empty().await {
            break;
        }

        let batch_size = adaptive.size();
        let mut jobs = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            match frontier.pop().await {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        if jobs.is_empty() {
            break;
        }

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let fetcher = fetcher.clone();
            let frontier = frontier.clone();
            let path_map = path_map.clone();
            let config = config.clone();
            let run_id = run.id;
            handles.push(tokio::spawn(async move {
                process_job(run_id, job, fetcher, frontier, path_map, config).await
            }));
        }

        let mut was_cancelled = false;
        for handle in handles {
            if cancellation.is_cancelled() {
                handle.abort();
                was_cancelled = true;
                continue;
            }
            match handle.await {
                Ok(JobOutcome::Fetched {
                    page,
                    new_edges,
                    body,
                    is_error,
                }) => {
                    adaptive.record_outcome(is_error);
                    pages_fetched.fetch_add(1, Ordering::SeqCst);
                    pages.push(page);
                    edges.extend(new_edges);
                    if let Some(b) = body {
                        bodies.push(b);
                    }
                }
                Ok(JobOutcome::Failed) => {
                    adaptive.record_outcome(true);
                }
                Err(e) if e.is_cancelled() => {
                    was_cancelled = true;
                }
                Err(e) => {
                    return Err(CrawlError::Invariant(format!("worker task panicked: {e}")));
                }
            }
        }
        if was_cancelled {
            return Err(CrawlError::Invariant(
                "cancelled: wall-clock ceiling exceeded".to_string(),
            ));
        }

        adaptive.adjust_for_next_batch();

        info!(
            run_id = %run.id,
            pages = pages.len(),
            frontier_len = frontier.len().await,
            batch_size,
            "batch complete"
        );
    }

    let fetched_pages: HashMap<String, PageRecord> =
        pages.iter().map(|p| (p.url.clone(), p.clone())).collect();
    let validator = Validator::new(fetcher, config);
    let selected = validator.select(&edges, &fetched_pages);
    let validated = validator.run(selected, &fetched_pages).await;
    let validated_by_url: HashMap<String, EdgeRecord> =
        validated.into_iter().map(|e| (e.url.clone(), e)).collect();
    for edge in &mut edges {
        if let Some(v) = validated_by_url.get(&edge.url) {
            *edge = v.clone();
        }
    }

    let maps = ParentChildMaps::rebuild_derived(frontier.parent_map_snapshot(), &seed.to_string());
    Ok((pages, edges, bodies, maps))
}

async fn process_job(
    run_id: Uuid,
    job: CrawlJob,
    fetcher: Arc<HttpFetcher>,
    frontier: Arc<Frontier>,
    path_map: Arc<DashMap<String, Vec<String>>>,
    config: CrawlConfig,
) -> JobOutcome {
    let url_str = job.url.to_string();
    frontier.set_state(&url_str, UrlState::Fetching);

    let outcome = match fetcher.fetch(&job.url).await {
        Ok(outcome) => outcome,
        Err(_) => {
            frontier.set_state(&url_str, UrlState::FailedFetch);
            return JobOutcome::Failed;
        }
    };
    frontier.set_state(&url_str, UrlState::Fetched);

    let body_str = String::from_utf8_lossy(&outcome.body).into_owned();
    let classified = classify(&body_str, outcome.status);
    frontier.set_state(&url_str, UrlState::Classified);

    let extracted = extract(&body_str, &job.url, config.link_toggles);
    let children: Vec<(String, LinkType)> =
        extracted.into_iter().map(|l| (l.url, l.link_type)).collect();
    let new_edges = frontier
        .enqueue_children(&url_str, job.depth, &children)
        .await;

    let has_own_children = new_edges.iter().any(|e| e.link_type != LinkType::External);

    let parent_key = job.parent_url.as_deref().unwrap_or("");
    let path = path_map
        .get(parent_key)
        .map(|p| {
            let mut v = p.clone();
            v.push(url_str.clone());
            v
        })
        .unwrap_or_else(|| vec![url_str.clone()]);
    path_map.insert(url_str.clone(), path.clone());

    let is_error = classified.page_type == PageType::Error;

    let page = PageRecord {
        run_id,
        url: url_str.clone(),
        title: classified.title,
        word_count: classified.word_count,
        page_type: classified.page_type,
        has_header: classified.has_header,
        has_footer: classified.has_footer,
        has_navigation: classified.has_navigation,
        structure_digest: classified.structure_digest,
        depth: job.depth,
        path,
        fetch_status: outcome.status,
    };

    let body = has_own_children.then(|| SourceBody {
        run_id,
        url: url_str,
        html: body_str,
        fetched_at: chrono::Utc::now(),
    });

    JobOutcome::Fetched {
        page,
        new_edges,
        body,
        is_error,
    }
}

/// Health heuristic over the finished run's own counters: content density
/// minus a penalty for broken edges, clamped to [0, 100]. Not specified by
/// the data model beyond its range: see DESIGN.md.
fn compute_score(run: &Run) -> f64 {
    if run.pages_analyzed == 0 {
        return 0.0;
    }
    let content_ratio = run.content_page_count as f64 / run.pages_analyzed as f64;
    let broken_ratio = if run.links_found == 0 {
        0.0
    } else {
        run.broken_count as f64 / run.links_found as f64
    };
    (content_ratio * 100.0 - broken_ratio * 50.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn run_execute(
        server: &MockServer,
        seed_path: &str,
        config: CrawlConfig,
    ) -> (Vec<PageRecord>, Vec<EdgeRecord>, Vec<SourceBody>, ParentChildMaps) {
        let seed = Url::parse(&format!("{}{}", server.uri(), seed_path)).unwrap();
        let mut run = Run::pending(Uuid::new_v4(), chrono::Utc::now());
        run.id = Uuid::new_v4();
        let pages_fetched = Arc::new(AtomicUsize::new(0));
        execute(
            &run,
            &seed,
            &config,
            CancellationToken::new(),
            pages_fetched,
        )
        .await
        .expect("pipeline run should not fail")
    }

    /// A trivial site: seed links to two same-origin pages that both 200
    /// with empty bodies.
    #[tokio::test]
    async fn trivial_site_produces_three_pages_and_two_edges() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><a href="/x">x</a><a href="/y">y</a></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/y"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let config = CrawlConfig {
            max_crawl_depth: 1,
            max_pages_to_crawl: 10,
            ..Default::default()
        };
        let (pages, edges, bodies, maps) = run_execute(&server, "/", config).await;

        assert_eq!(pages.len(), 3);
        assert_eq!(edges.len(), 2);
        let seed_url = format!("{}/", server.uri());
        assert_eq!(maps.children_map.get(&seed_url).map(|c| c.len()), Some(2));
        // Seed has children -> body stored; leaves do not.
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].url, seed_url);
    }

    /// A broken link: a 404 target still gets a page record (it's a
    /// fetched, same-origin URL) with `page_type = error`.
    #[tokio::test]
    async fn broken_same_origin_link_still_yields_a_page_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><a href="/ok">ok</a><a href="/bad">bad</a></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>hello there friend</p>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(404).set_body_string("<p>not found</p>"))
            .mount(&server)
            .await;

        let config = CrawlConfig {
            max_crawl_depth: 1,
            max_pages_to_crawl: 10,
            ..Default::default()
        };
        let (pages, edges, _bodies, _maps) = run_execute(&server, "/", config).await;

        assert_eq!(pages.len(), 3);
        assert_eq!(edges.len(), 2);
        let bad_page = pages.iter().find(|p| p.url.ends_with("/bad")).unwrap();
        assert_eq!(bad_page.page_type, PageType::Error);

        // Spec §8 scenario 2: a/bad is a fetched same-origin page, so the
        // validator resolves its edge via tier-1 reuse and must still carry
        // the real status code, not just the derived broken label.
        let bad_edge = edges.iter().find(|e| e.url.ends_with("/bad")).unwrap();
        assert_eq!(bad_edge.status, crawlsite_core::EdgeStatus::Broken);
        assert_eq!(bad_edge.status_code, Some(404));
    }

    /// A depth cap: a child discovered at the depth ceiling is recorded
    /// as an edge but never fetched.
    #[tokio::test]
    async fn depth_cap_records_edge_without_fetching_grandchild() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<html><body><a href="/x">x</a></body></html>"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<html><body><a href="/y">y</a></body></html>"#),
            )
            .mount(&server)
            .await;
        // Deliberately no mock for /y: the depth cap must prevent it from
        // ever being fetched.

        let config = CrawlConfig {
            max_crawl_depth: 1,
            max_pages_to_crawl: 10,
            ..Default::default()
        };
        let (pages, edges, _bodies, _maps) = run_execute(&server, "/", config).await;

        assert_eq!(pages.len(), 2);
        assert_eq!(edges.len(), 1);
        assert!(edges[0].url.ends_with("/y"));
        assert_eq!(edges[0].parent_url, format!("{}/x", server.uri()));
    }

    #[test]
    fn score_is_zero_for_an_empty_run() {
        let run = Run::pending(Uuid::new_v4(), chrono::Utc::now());
        assert_eq!(compute_score(&run), 0.0);
    }
}
