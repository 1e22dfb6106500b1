use crawlsite_core::{EdgeStatus, HighlightKind, LinkType, PageType, RunState};

pub fn run_state_to_str(s: RunState) -> &'static str {
    match s {
        RunState::Pending => "pending",
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Failed => "failed",
    }
}

pub fn str_to_run_state(s: &str) -> RunState {
    match s {
        "running" => RunState::Running,
        "completed" => RunState::Completed,
        "failed" => RunState::Failed,
        _ => RunState::Pending,
    }
}

pub fn page_type_to_str(t: PageType) -> &'static str {
    match t {
        PageType::Content => "content",
        PageType::Blank => "blank",
        PageType::Error => "error",
        PageType::Redirect => "redirect",
    }
}

pub fn str_to_page_type(s: &str) -> PageType {
    match s {
        "blank" => PageType::Blank,
        "error" => PageType::Error,
        "redirect" => PageType::Redirect,
        _ => PageType::Content,
    }
}

pub fn edge_status_to_str(s: EdgeStatus) -> &'static str {
    match s {
        EdgeStatus::Valid => "valid",
        EdgeStatus::Broken => "broken",
        EdgeStatus::Redirect => "redirect",
        EdgeStatus::Timeout => "timeout",
        EdgeStatus::RateLimited => "rate_limited",
        EdgeStatus::Unknown => "unknown",
    }
}

pub fn str_to_edge_status(s: &str) -> EdgeStatus {
    match s {
        "valid" => EdgeStatus::Valid,
        "broken" => EdgeStatus::Broken,
        "redirect" => EdgeStatus::Redirect,
        "timeout" => EdgeStatus::Timeout,
        "rate_limited" => EdgeStatus::RateLimited,
        _ => EdgeStatus::Unknown,
    }
}

pub fn link_type_to_str(t: LinkType) -> &'static str {
    match t {
        LinkType::StaticHtml => "static_html",
        LinkType::DynamicJs => "dynamic_js",
        LinkType::Resource => "resource",
        LinkType::External => "external",
    }
}

pub fn str_to_link_type(s: &str) -> LinkType {
    match s {
        "dynamic_js" => LinkType::DynamicJs,
        "resource" => LinkType::Resource,
        "external" => LinkType::External,
        _ => LinkType::StaticHtml,
    }
}

/// `Working` for a validated-good edge, `Broken` for anything that failed to
/// resolve, `Other` for everything still unresolved or redirected.
pub fn highlight_kind_for(status: EdgeStatus) -> HighlightKind {
    match status {
        EdgeStatus::Valid => HighlightKind::Working,
        EdgeStatus::Broken | EdgeStatus::Timeout | EdgeStatus::RateLimited => HighlightKind::Broken,
        EdgeStatus::Redirect | EdgeStatus::Unknown => HighlightKind::Other,
    }
}
