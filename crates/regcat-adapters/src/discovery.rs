//! Candidate link discovery on a source page.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use regcat_core::{ArtifactKind, CandidateLink};
use regcat_storage::{Fetch, FetchError};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_EXTENSIONS: &[&str] = &["zip", "xlsx", "xlsm", "xls", "ods"];

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid page url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("page unreachable: {0}")]
    Unreachable(#[from] FetchError),
    #[error("no candidate links on {url} for extensions [{}]", .extensions.join(", "))]
    NoCandidates { url: String, extensions: Vec<String> },
    #[error("unsupported extension `{0}` in allow-list")]
    UnsupportedExtension(String),
    #[error("invalid selector: {0}")]
    Selector(String),
}

/// Tie-break between several matching links.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    FirstListed,
    LastListed,
    /// Earliest extension in the allow-list wins, then document order.
    #[default]
    ExtensionPreference,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::FirstListed => "first_listed",
            SelectionPolicy::LastListed => "last_listed",
            SelectionPolicy::ExtensionPreference => "extension_preference",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "first_listed" | "first" => Ok(SelectionPolicy::FirstListed),
            "last_listed" | "last" => Ok(SelectionPolicy::LastListed),
            "extension_preference" | "preference" => Ok(SelectionPolicy::ExtensionPreference),
            other => Err(format!("unknown link selection policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchPolicy {
    extensions: Vec<String>,
    name_pattern: Option<Regex>,
    selection: SelectionPolicy,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            name_pattern: None,
            selection: SelectionPolicy::default(),
        }
    }
}

impl MatchPolicy {
    /// `extensions` is the allow-list in preference order. Leading dots and
    /// case are ignored; an empty list means the defaults.
    pub fn new<S: AsRef<str>>(extensions: &[S]) -> Result<Self, DiscoveryError> {
        let mut normalized: Vec<String> = Vec::new();
        for ext in extensions {
            let ext = ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase();
            if ArtifactKind::from_extension(&ext).is_none() {
                return Err(DiscoveryError::UnsupportedExtension(ext));
            }
            if !normalized.contains(&ext) {
                normalized.push(ext);
            }
        }
        if normalized.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self {
            extensions: normalized,
            ..Self::default()
        })
    }

    pub fn with_name_pattern(mut self, pattern: Option<Regex>) -> Self {
        self.name_pattern = pattern;
        self
    }

    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn selection(&self) -> SelectionPolicy {
        self.selection
    }

    fn preference(&self, extension: &str) -> usize {
        self.extensions
            .iter()
            .position(|e| e == extension)
            .unwrap_or(usize::MAX)
    }
}

/// Result of scanning one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub page_url: String,
    pub candidates: Vec<CandidateLink>,
    pub selected: CandidateLink,
}

fn normalize_whitespace(text: &str) -> Option<String> {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Candidate links in document order, duplicates (by absolute URL) removed.
pub fn find_candidate_links(
    html: &str,
    page_url: &str,
    policy: &MatchPolicy,
) -> Result<Vec<CandidateLink>, DiscoveryError> {
    let base = Url::parse(page_url).map_err(|e| DiscoveryError::InvalidUrl {
        url: page_url.to_string(),
        message: e.to_string(),
    })?;
    let anchors = Selector::parse("a[href]").map_err(|e| DiscoveryError::Selector(e.to_string()))?;
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for (position, anchor) in document.select(&anchors).enumerate() {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let mut url = match base.join(href) {
            Ok(url) => url,
            Err(err) => {
                debug!(href, error = %err, "skipping unresolvable href");
                continue;
            }
        };
        if !matches!(url.scheme(), "http" | "https" | "file") {
            continue;
        }
        url.set_fragment(None);

        let Some(file_name) = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
        else {
            continue;
        };
        let Some((_, ext)) = file_name.rsplit_once('.') else {
            continue;
        };
        let extension = ext.to_ascii_lowercase();
        if !policy.extensions.contains(&extension) {
            continue;
        }
        let Some(kind) = ArtifactKind::from_extension(&extension) else {
            continue;
        };

        let anchor_text = normalize_whitespace(&anchor.text().collect::<String>());
        if let Some(pattern) = &policy.name_pattern {
            let text_matches = anchor_text.as_deref().is_some_and(|t| pattern.is_match(t));
            if !pattern.is_match(&file_name) && !text_matches {
                continue;
            }
        }

        let url = url.to_string();
        if !seen.insert(url.clone()) {
            continue;
        }
        candidates.push(CandidateLink {
            url,
            file_name,
            extension,
            kind,
            anchor_text,
            position,
        });
    }

    Ok(candidates)
}

/// Applies the policy's tie-break. Same input, same answer.
pub fn select_link<'a>(
    candidates: &'a [CandidateLink],
    policy: &MatchPolicy,
) -> Option<&'a CandidateLink> {
    match policy.selection {
        SelectionPolicy::FirstListed => candidates.first(),
        SelectionPolicy::LastListed => candidates.last(),
        SelectionPolicy::ExtensionPreference => candidates
            .iter()
            .min_by_key(|c| (policy.preference(&c.extension), c.position)),
    }
}

/// Fetches `page_url` and selects one candidate link.
pub async fn discover(
    fetcher: &dyn Fetch,
    page_url: &str,
    policy: &MatchPolicy,
) -> Result<Discovery, DiscoveryError> {
    Url::parse(page_url).map_err(|e| DiscoveryError::InvalidUrl {
        url: page_url.to_string(),
        message: e.to_string(),
    })?;
    let response = fetcher.fetch(page_url).await?;
    let base = if Url::parse(&response.final_url).is_ok() {
        response.final_url.as_str()
    } else {
        page_url
    };

    let candidates = find_candidate_links(&response.body_text(), base, policy)?;
    let Some(selected) = select_link(&candidates, policy).cloned() else {
        return Err(DiscoveryError::NoCandidates {
            url: page_url.to_string(),
            extensions: policy.extensions.clone(),
        });
    };

    info!(
        page = page_url,
        candidates = candidates.len(),
        selected = %selected.url,
        policy = %policy.selection,
        "selected download link"
    );
    Ok(Discovery {
        page_url: page_url.to_string(),
        candidates,
        selected,
    })
}
