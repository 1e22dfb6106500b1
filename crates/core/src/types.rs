use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One invocation of the engine against one seed and one config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub application_id: Uuid,
    pub state: RunState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error_message: Option<String>,
    pub pages_analyzed: u64,
    pub links_found: u64,
    pub broken_count: u64,
    pub blank_count: u64,
    pub content_page_count: u64,
    pub score: f64,
}

impl Run {
    pub fn pending(application_id: Uuid, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            application_id,
            state: RunState::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            pages_analyzed: 0,
            links_found: 0,
            broken_count: 0,
            blank_count: 0,
            content_page_count: 0,
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Content,
    Blank,
    Error,
    Redirect,
}

/// Per-fetched-URL summary produced by the content classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub run_id: RunId,
    pub url: String,
    pub title: Option<String>,
    pub word_count: usize,
    pub page_type: PageType,
    pub has_header: bool,
    pub has_footer: bool,
    pub has_navigation: bool,
    pub structure_digest: String,
    pub depth: u32,
    /// Ordered ancestor sequence from seed to this URL, inclusive.
    pub path: Vec<String>,
    /// HTTP status this page was fetched with; lets edges whose target is
    /// already a fetched page carry a real `status_code` on reuse instead
    /// of just a derived `EdgeStatus`.
    pub fetch_status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    Valid,
    Broken,
    Redirect,
    Timeout,
    RateLimited,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    StaticHtml,
    DynamicJs,
    Resource,
    External,
}

/// A discovered hyperlink; validated or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub run_id: RunId,
    pub url: String,
    pub parent_url: String,
    pub status_code: Option<u16>,
    pub status: EdgeStatus,
    pub link_type: LinkType,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub title: Option<String>,
}

impl EdgeRecord {
    /// An edge record that hasn't gone through the validator yet.
    pub fn unvalidated(run_id: RunId, url: String, parent_url: String, link_type: LinkType) -> Self {
        Self {
            run_id,
            url,
            parent_url,
            status_code: None,
            status: EdgeStatus::Unknown,
            link_type,
            response_time_ms: None,
            error_message: None,
            title: None,
        }
    }
}

/// The three denormalized discovery-forest views, all keyed by run id.
/// `children_map` and `path_map` are derivable from `parent_map` alone —
/// callers that only need to persist state should keep `parent_map`
/// authoritative and recompute the other two at read time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParentChildMaps {
    pub parent_map: HashMap<String, String>,
    pub children_map: HashMap<String, HashSet<String>>,
    pub path_map: HashMap<String, Vec<String>>,
}

impl ParentChildMaps {
    /// Rebuild `children_map` and `path_map` from `parent_map` plus the seed.
    /// Used both by the frontier (incrementally, see `crawlsite-frontier`)
    /// and by the store when serving `get_parent_child` from a persisted
    /// `parent_map` alone.
    pub fn rebuild_derived(parent_map: HashMap<String, String>, seed: &str) -> Self {
        let mut children_map: HashMap<String, HashSet<String>> = HashMap::new();
        for (child, parent) in &parent_map {
            children_map
                .entry(parent.clone())
                .or_default()
                .insert(child.clone());
        }

        let mut path_map: HashMap<String, Vec<String>> = HashMap::new();
        path_map.insert(seed.to_string(), vec![seed.to_string()]);

        // parent_map has no cycles, so a bounded number of passes over the
        // remaining entries always converges.
        let mut remaining: Vec<(String, String)> = parent_map
            .iter()
            .map(|(c, p)| (c.clone(), p.clone()))
            .collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|(child, parent)| {
                if let Some(parent_path) = path_map.get(parent).cloned() {
                    let mut path = parent_path;
                    path.push(child.clone());
                    path_map.insert(child.clone(), path);
                    false
                } else {
                    true
                }
            });
            if remaining.len() == before {
                // Unreachable given an acyclic parent_map; guards against
                // silent hangs if a caller hands us a malformed one.
                break;
            }
        }

        Self {
            parent_map,
            children_map,
            path_map,
        }
    }
}

/// HTML body stored only at interior (non-leaf) pages of the discovery
/// forest; leaves resolve theirs via an upward walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBody {
    pub run_id: RunId,
    pub url: String,
    pub html: String,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightKind {
    Broken,
    Working,
    Other,
}

/// One byte-offset span in a source body's HTML where a validated edge's
/// URL literally occurs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightedLink {
    pub url: String,
    pub start: usize,
    pub end: usize,
    pub kind: HighlightKind,
    pub status_code: Option<u16>,
    pub status: EdgeStatus,
}

/// Result of `Store::get_source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRead {
    pub actual_source_page: String,
    pub is_source_from_parent: bool,
    pub traversal_path: Vec<String>,
    pub hierarchy_depth: usize,
    pub html: String,
    pub highlighted_links: Vec<HighlightedLink>,
}
