use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crawlsite_core::{
    EdgeRecord, HighlightedLink, ParentChildMaps, PageRecord, Run, RunId, SourceBody, SourceRead,
    StoreError,
};

use crate::codec::{
    edge_status_to_str, highlight_kind_for, link_type_to_str, page_type_to_str, run_state_to_str,
    str_to_edge_status, str_to_link_type, str_to_page_type, str_to_run_state,
};

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Result of `Store::get_run`: run metadata, the full page and edge
/// record sets, the parent/child maps, and the run's own aggregate
/// counters (already present on `Run`).
#[derive(Debug, Clone)]
pub struct RunBundle {
    pub run: Run,
    pub pages: Vec<PageRecord>,
    pub edges: Vec<EdgeRecord>,
    pub maps: ParentChildMaps,
}

/// `sqlx` + Postgres hierarchical store over the run/page/edge/
/// parent-map/body schema, with a connection pool and embedded migration.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::with_pool_size(database_url, 20).await
    }

    pub async fn with_pool_size(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;

        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    /// Wraps an already-open pool, e.g. one handed out by `#[sqlx::test]`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        info!("migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Atomic (within the scope of the run) write of every artifact:
    /// commits only after every insert succeeds, rolling back wholesale on
    /// any failure, so partially-written data is never visible. Idempotent
    /// under the run id key via `ON CONFLICT DO NOTHING` on
    /// pages/edges/parent_map/source_bodies and `DO UPDATE` on the run row
    /// itself.
    pub async fn persist_run(
        &self,
        run: &Run,
        pages: &[PageRecord],
        edges: &[EdgeRecord],
        maps: &ParentChildMaps,
        bodies: &[SourceBody],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        self.upsert_run(&mut tx, run).await?;
        self.insert_pages(&mut tx, pages).await?;
        self.insert_edges(&mut tx, edges).await?;
        self.insert_parent_map(&mut tx, run.id, maps).await?;
        self.insert_bodies(&mut tx, bodies).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn upsert_run(&self, tx: &mut Transaction<'_, Postgres>, run: &Run) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO runs (run_id, application_id, state, created_at, started_at,
                   completed_at, error_message, pages_analyzed, links_found, broken_count,
                   blank_count, content_page_count, score)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
               ON CONFLICT (run_id) DO UPDATE SET
                   state = EXCLUDED.state,
                   started_at = EXCLUDED.started_at,
                   completed_at = EXCLUDED.completed_at,
                   error_message = EXCLUDED.error_message,
                   pages_analyzed = EXCLUDED.pages_analyzed,
                   links_found = EXCLUDED.links_found,
                   broken_count = EXCLUDED.broken_count,
                   blank_count = EXCLUDED.blank_count,
                   content_page_count = EXCLUDED.content_page_count,
                   score = EXCLUDED.score"#,
        )
        .bind(run.id)
        .bind(run.application_id)
        .bind(run_state_to_str(run.state))
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error_message)
        .bind(run.pages_analyzed as i64)
        .bind(run.links_found as i64)
        .bind(run.broken_count as i64)
        .bind(run.blank_count as i64)
        .bind(run.content_page_count as i64)
        .bind(run.score)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Per-row inserts: `path` is a variable-length array per page, which
    /// doesn't fit a fixed-width `UNNEST` batch the way `parent_map`/
    /// `source_bodies` do.
    async fn insert_pages(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        pages: &[PageRecord],
    ) -> Result<(), StoreError> {
        for page in pages {
            sqlx::query(
                r#"INSERT INTO pages (run_id, url, title, word_count, page_type, has_header,
                       has_footer, has_navigation, structure_digest, depth, path, fetch_status)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                   ON CONFLICT (run_id, url) DO NOTHING"#,
            )
            .bind(page.run_id)
            .bind(&page.url)
            .bind(&page.title)
            .bind(page.word_count as i64)
            .bind(page_type_to_str(page.page_type))
            .bind(page.has_header)
            .bind(page.has_footer)
            .bind(page.has_navigation)
            .bind(&page.structure_digest)
            .bind(page.depth as i32)
            .bind(&page.path)
            .bind(page.fetch_status as i32)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn insert_edges(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        edges: &[EdgeRecord],
    ) -> Result<(), StoreError> {
        for edge in edges {
            sqlx::query(
                r#"INSERT INTO edges (run_id, url, parent_url, status_code, status, link_type,
                       response_time_ms, error_message, title)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (run_id, url) DO NOTHING"#,
            )
            .bind(edge.run_id)
            .bind(&edge.url)
            .bind(&edge.parent_url)
            .bind(edge.status_code.map(|s| s as i32))
            .bind(edge_status_to_str(edge.status))
            .bind(link_type_to_str(edge.link_type))
            .bind(edge.response_time_ms.map(|t| t as i64))
            .bind(&edge.error_message)
            .bind(&edge.title)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn insert_parent_map(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        run_id: RunId,
        maps: &ParentChildMaps,
    ) -> Result<(), StoreError> {
        if maps.parent_map.is_empty() {
            return Ok(());
        }
        let (urls, parents): (Vec<String>, Vec<String>) = maps
            .parent_map
            .iter()
            .map(|(u, p)| (u.clone(), p.clone()))
            .unzip();

        sqlx::query(
            r#"INSERT INTO parent_map (run_id, url, parent_url)
               SELECT $1, * FROM UNNEST($2::text[], $3::text[])
               ON CONFLICT (run_id, url) DO NOTHING"#,
        )
        .bind(run_id)
        .bind(&urls)
        .bind(&parents)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_bodies(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        bodies: &[SourceBody],
    ) -> Result<(), StoreError> {
        if bodies.is_empty() {
            return Ok(());
        }
        let run_id = bodies[0].run_id;
        let urls: Vec<String> = bodies.iter().map(|b| b.url.clone()).collect();
        let htmls: Vec<String> = bodies.iter().map(|b| b.html.clone()).collect();
        let fetched_ats: Vec<chrono::DateTime<chrono::Utc>> =
            bodies.iter().map(|b| b.fetched_at).collect();

        sqlx::query(
            r#"INSERT INTO source_bodies (run_id, url, html, fetched_at)
               SELECT $1, * FROM UNNEST($2::text[], $3::text[], $4::timestamptz[])
               ON CONFLICT (run_id, url) DO NOTHING"#,
        )
        .bind(run_id)
        .bind(&urls)
        .bind(&htmls)
        .bind(&fetched_ats)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<RunBundle, StoreError> {
        let run_row: Option<(
            uuid::Uuid,
            String,
            chrono::DateTime<chrono::Utc>,
            Option<chrono::DateTime<chrono::Utc>>,
            Option<chrono::DateTime<chrono::Utc>>,
            Option<String>,
            i64,
            i64,
            i64,
            i64,
            i64,
            f64,
        )> = sqlx::query_as(
            r#"SELECT application_id, state, created_at, started_at, completed_at,
                      error_message, pages_analyzed, links_found, broken_count, blank_count,
                      content_page_count, score
               FROM runs WHERE run_id = $1"#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some((
            application_id,
            state,
            created_at,
            started_at,
            completed_at,
            error_message,
            pages_analyzed,
            links_found,
            broken_count,
            blank_count,
            content_page_count,
            score,
        )) = run_row
        else {
            return Err(StoreError::RunNotFound(run_id));
        };

        let run = Run {
            id: run_id,
            application_id,
            state: str_to_run_state(&state),
            created_at,
            started_at,
            completed_at,
            error_message,
            pages_analyzed: pages_analyzed as u64,
            links_found: links_found as u64,
            broken_count: broken_count as u64,
            blank_count: blank_count as u64,
            content_page_count: content_page_count as u64,
            score,
        };

        let page_rows: Vec<(
            String,
            Option<String>,
            i64,
            String,
            bool,
            bool,
            bool,
            String,
            i32,
            Vec<String>,
            i32,
        )> = sqlx::query_as(
            r#"SELECT url, title, word_count, page_type, has_header, has_footer, has_navigation,
                      structure_digest, depth, path, fetch_status
               FROM pages WHERE run_id = $1"#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let pages = page_rows
            .into_iter()
            .map(
                |(
                    url,
                    title,
                    word_count,
                    page_type,
                    has_header,
                    has_footer,
                    has_navigation,
                    structure_digest,
                    depth,
                    path,
                    fetch_status,
                )| PageRecord {
                    run_id,
                    url,
                    title,
                    word_count: word_count as usize,
                    page_type: str_to_page_type(&page_type),
                    has_header,
                    has_footer,
                    has_navigation,
                    structure_digest,
                    depth: depth as u32,
                    path,
                    fetch_status: fetch_status as u16,
                },
            )
            .collect();

        let edge_rows: Vec<(
            String,
            String,
            Option<i32>,
            String,
            String,
            Option<i64>,
            Option<String>,
            Option<String>,
        )> = sqlx::query_as(
            r#"SELECT url, parent_url, status_code, status, link_type, response_time_ms,
                      error_message, title
               FROM edges WHERE run_id = $1"#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let edges = edge_rows
            .into_iter()
            .map(
                |(
                    url,
                    parent_url,
                    status_code,
                    status,
                    link_type,
                    response_time_ms,
                    error_message,
                    title,
                )| EdgeRecord {
                    run_id,
                    url,
                    parent_url,
                    status_code: status_code.map(|s| s as u16),
                    status: str_to_edge_status(&status),
                    link_type: str_to_link_type(&link_type),
                    response_time_ms: response_time_ms.map(|t| t as u64),
                    error_message,
                    title,
                },
            )
            .collect();

        let maps = self.get_parent_child(run_id).await?;

        Ok(RunBundle {
            run,
            pages,
            edges,
            maps,
        })
    }

    /// `children_map`/`path_map` are derived from `parent_map` at read
    /// time as pure functions of it, never persisted redundantly.
    pub async fn get_parent_child(&self, run_id: RunId) -> Result<ParentChildMaps, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT url, parent_url FROM parent_map WHERE run_id = $1")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        let seed = self.seed_url(run_id).await?;
        let parent_map = rows.into_iter().collect();
        Ok(ParentChildMaps::rebuild_derived(parent_map, &seed))
    }

    async fn seed_url(&self, run_id: RunId) -> Result<String, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"SELECT url FROM pages
               WHERE run_id = $1 AND depth = 0
               LIMIT 1"#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|(url,)| url).unwrap_or_default())
    }

    async fn fetch_body(&self, run_id: RunId, url: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT html FROM source_bodies WHERE run_id = $1 AND url = $2")
                .bind(run_id)
                .bind(url)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(|(html,)| html))
    }

    async fn fetch_parent(&self, run_id: RunId, url: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT parent_url FROM parent_map WHERE run_id = $1 AND url = $2")
                .bind(run_id)
                .bind(url)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(|(parent,)| parent))
    }

    /// Upward-walk traversal toward the nearest stored body, bounded by
    /// the `max_crawl_depth + 1` hard ceiling, plus `highlighted_links`
    /// byte-offset computation.
    pub async fn get_source(
        &self,
        run_id: RunId,
        url: &str,
        max_crawl_depth: u32,
    ) -> Result<SourceRead, StoreError> {
        if let Some(html) = self.fetch_body(run_id, url).await? {
            let highlighted_links = self.highlight_links(run_id, url, &html).await?;
            return Ok(SourceRead {
                actual_source_page: url.to_string(),
                is_source_from_parent: false,
                traversal_path: vec![url.to_string()],
                hierarchy_depth: 0,
                html,
                highlighted_links,
            });
        }

        let ceiling = max_crawl_depth as usize + 1;
        let mut cur = url.to_string();
        let mut path = vec![url.to_string()];
        let mut depth = 0usize;

        loop {
            let Some(parent_url) = self.fetch_parent(run_id, &cur).await? else {
                break;
            };
            cur = parent_url;
            path.push(cur.clone());
            depth += 1;
            if depth > ceiling {
                return Err(StoreError::SourceNotFound(url.to_string()));
            }
            if let Some(html) = self.fetch_body(run_id, &cur).await? {
                let highlighted_links = self.highlight_links(run_id, &cur, &html).await?;
                return Ok(SourceRead {
                    actual_source_page: cur,
                    is_source_from_parent: true,
                    traversal_path: path,
                    hierarchy_depth: depth,
                    html,
                    highlighted_links,
                });
            }
        }

        Err(StoreError::SourceNotFound(url.to_string()))
    }

    /// First byte offset of each edge URL literally occurring in `html`,
    /// non-overlapping and left-biased; an edge not textually present is
    /// omitted silently.
    async fn highlight_links(
        &self,
        run_id: RunId,
        source_page: &str,
        html: &str,
    ) -> Result<Vec<HighlightedLink>, StoreError> {
        let rows: Vec<(String, Option<i32>, String, String)> = sqlx::query_as(
            r#"SELECT url, status_code, status, link_type
               FROM edges WHERE run_id = $1 AND parent_url = $2
               ORDER BY url"#,
        )
        .bind(run_id)
        .bind(source_page)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let haystack = html.as_bytes();
        let mut claimed: Vec<(usize, usize)> = Vec::new();
        let mut highlighted = Vec::new();

        for (url, status_code, status, _link_type) in rows {
            let status = str_to_edge_status(&status);
            if let Some(start) = find_non_overlapping(haystack, url.as_bytes(), &claimed) {
                let end = start + url.len();
                claimed.push((start, end));
                highlighted.push(HighlightedLink {
                    url,
                    start,
                    end,
                    kind: highlight_kind_for(status),
                    status_code: status_code.map(|s| s as u16),
                    status,
                });
            }
        }

        Ok(highlighted)
    }

    /// Cascading delete across every keyed row; a second call is a no-op.
    pub async fn delete_run(&self, run_id: RunId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for table in ["source_bodies", "parent_map", "edges", "pages", "runs"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE run_id = $1"))
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

fn find_non_overlapping(haystack: &[u8], needle: &[u8], claimed: &[(usize, usize)]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    'outer: for start in 0..=(haystack.len() - needle.len()) {
        let end = start + needle.len();
        for (c_start, c_end) in claimed {
            if start < *c_end && end > *c_start {
                continue 'outer;
            }
        }
        if &haystack[start..end] == needle {
            return Some(start);
        }
    }
    None
}
