use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::CrawlerSettings;

/// Decides which discovered URLs a job follows, deduplicating by normalized URL
pub struct Frontier {
    /// Normalized URLs already admitted
    seen_urls: HashSet<String>,

    /// Compiled regex patterns for URL inclusion
    include_patterns: Vec<Regex>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,

    /// Allowed domains (if empty, any domain is allowed)
    allowed_domains: HashSet<String>,
}

impl Frontier {
    pub fn new(config: &CrawlerSettings) -> Self {
        Self {
            seen_urls: HashSet::new(),
            include_patterns: compile_patterns(&config.url_patterns.include, "include"),
            exclude_patterns: compile_patterns(&config.url_patterns.exclude, "exclude"),
            allowed_domains: config
                .allowed_domains
                .iter()
                .map(|domain| domain.trim_start_matches("www.").to_lowercase())
                .collect(),
        }
    }

    /// The normalized form of `url` when it passes every filter and was not seen before
    pub fn admit(&mut self, url: &str) -> Option<String> {
        let normalized = normalize_url(url)?;

        if self.seen_urls.contains(&normalized) {
            debug!("Skipping already seen URL: {}", normalized);
            return None;
        }
        if !self.in_scope(&normalized) {
            return None;
        }

        self.seen_urls.insert(normalized.clone());
        Some(normalized)
    }

    /// Admit an explicitly requested URL; only deduplication applies
    pub fn admit_explicit(&mut self, url: &str) -> Option<String> {
        let normalized = normalize_url(url)?;
        if self.seen_urls.insert(normalized.clone()) {
            Some(normalized)
        } else {
            debug!("Skipping duplicate URL: {}", normalized);
            None
        }
    }

    fn in_scope(&self, normalized: &str) -> bool {
        let Ok(parsed) = Url::parse(normalized) else {
            return false;
        };

        if !self.allowed_domains.is_empty() {
            let Some(host) = parsed.host_str() else {
                debug!("Skipping URL without host: {}", normalized);
                return false;
            };
            let host = host.trim_start_matches("www.");
            if !self
                .allowed_domains
                .iter()
                .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)))
            {
                debug!("Skipping URL from non-allowed domain: {}", host);
                return false;
            }
        }

        if self.exclude_patterns.iter().any(|p| p.is_match(normalized)) {
            debug!("Skipping URL matching exclusion pattern: {}", normalized);
            return false;
        }

        if !self.include_patterns.is_empty() && !self.include_patterns.iter().any(|p| p.is_match(normalized)) {
            debug!("Skipping URL not matching any inclusion pattern: {}", normalized);
            return false;
        }

        true
    }
}

fn compile_patterns(patterns: &[String], kind: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Invalid {} pattern '{}': {}", kind, pattern, e);
                None
            }
        })
        .collect()
}

/// Canonical form of an http(s) URL: no fragment, no default port, no lone
/// trailing slash, query parameters sorted by key.
pub fn normalize_url(url: &str) -> Option<String> {
    let mut parsed = match Url::parse(url.trim()) {
        Ok(url) => url,
        Err(e) => {
            debug!("Skipping invalid URL {}: {}", url, e);
            return None;
        }
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        debug!("Skipping non-http URL: {}", url);
        return None;
    }

    // The url crate already lowercases hosts and drops default ports
    parsed.set_fragment(None);

    if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
        let mut params: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        parsed.query_pairs_mut().clear().extend_pairs(params);
    } else {
        parsed.set_query(None);
    }

    let mut normalized = parsed.to_string();
    if normalized.ends_with('/') && parsed.query().is_none() {
        normalized.pop();
    }
    Some(normalized)
}
