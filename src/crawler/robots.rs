//! robots.txt fetching, caching, and allowance checks
//!
//! Fetches `scheme://host/robots.txt` once per host and caches the parsed
//! rules for a TTL. Policy by fetch status: 2xx parses the body (a parse
//! failure degrades to allow-all), 4xx is allow-all (the site has no robots
//! policy), 5xx is disallow-all (conservative while the origin is broken).
//! A network error caches allow-all but surfaces the error so the caller
//! can decide whether to proceed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

/// How long parsed robots.txt rules stay cached
const ROBOTS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from robots.txt handling
#[derive(Debug, Error)]
pub enum RobotsError {
    /// The URL has no host to key the cache on
    #[error("URL has no host: {0}")]
    MissingHost(String),
    /// robots.txt could not be fetched
    #[error("failed to fetch robots.txt: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// Parsed rules for one host, applicable to our user agent
#[derive(Debug, Clone, Default)]
struct RobotsRules {
    disallow: Vec<String>,
    allow: Vec<String>,
}

impl RobotsRules {
    /// Parse robots.txt content, keeping only the group that applies to
    /// `user_agent`. A specific agent group overrides wildcard rules.
    fn parse(content: &str, user_agent: &str) -> Self {
        let mut rules = RobotsRules::default();
        let ua_lower = user_agent.to_lowercase();
        let mut current_group_applies = false;
        let mut found_specific_agent = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    let agent = value.to_lowercase();
                    if agent == "*" {
                        current_group_applies = !found_specific_agent;
                    } else if ua_lower.contains(&agent) || agent.contains(&ua_lower) {
                        current_group_applies = true;
                        if !found_specific_agent {
                            // Specific group supersedes wildcard rules
                            found_specific_agent = true;
                            rules.disallow.clear();
                            rules.allow.clear();
                        }
                    } else {
                        current_group_applies = false;
                    }
                }
                "disallow" if current_group_applies => {
                    if !value.is_empty() {
                        rules.disallow.push(value.to_string());
                    }
                }
                "allow" if current_group_applies => {
                    if !value.is_empty() {
                        rules.allow.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        rules
    }

    /// Longest-match semantics: the longer of the best allow and best
    /// disallow match wins; ties go to allow.
    fn is_allowed(&self, path: &str) -> bool {
        let longest_allow = self
            .allow
            .iter()
            .filter(|p| path_matches(path, p))
            .map(|p| p.len())
            .max()
            .unwrap_or(0);

        let longest_disallow = self
            .disallow
            .iter()
            .filter(|p| path_matches(path, p))
            .map(|p| p.len())
            .max()
            .unwrap_or(0);

        longest_allow >= longest_disallow
    }
}

/// Match a path against a robots.txt pattern (`*` wildcards, `$` anchor)
fn path_matches(path: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }

    let (pattern, must_end_match) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };

    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('*').collect();
        let mut pos = 0;

        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            match path[pos..].find(part) {
                Some(found) => {
                    if i == 0 && found != 0 {
                        // First literal must match at the start
                        return false;
                    }
                    pos += found + part.len();
                }
                None => return false,
            }
        }

        return !must_end_match || pos == path.len();
    }

    if must_end_match {
        return path == pattern;
    }

    path.starts_with(pattern)
}

/// Cached robots.txt state for one host
#[derive(Debug, Clone)]
struct RobotsEntry {
    rules: RobotsRules,
    fetched_at: Instant,
    /// HTTP status of the robots fetch; None when the fetch itself failed
    status: Option<u16>,
}

impl RobotsEntry {
    fn from_response(status: u16, body: &str, user_agent: &str) -> Self {
        let rules = if (200..300).contains(&status) {
            RobotsRules::parse(body, user_agent)
        } else {
            RobotsRules::default()
        };
        Self {
            rules,
            fetched_at: Instant::now(),
            status: Some(status),
        }
    }

    fn unreachable() -> Self {
        Self {
            rules: RobotsRules::default(),
            fetched_at: Instant::now(),
            status: None,
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }

    /// Apply the status-code policy, then the parsed rules
    fn allows(&self, path: &str) -> bool {
        match self.status {
            Some(status) if (500..600).contains(&status) => false,
            Some(status) if (400..500).contains(&status) => true,
            _ => self.rules.is_allowed(path),
        }
    }
}

/// TTL cache of robots.txt rules keyed by host
pub struct RobotsCache {
    entries: RwLock<HashMap<String, RobotsEntry>>,
    user_agent: String,
    client: reqwest::Client,
    ttl: Duration,
}

impl RobotsCache {
    pub fn new(user_agent: &str, client: reqwest::Client) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            user_agent: user_agent.to_string(),
            client,
            ttl: ROBOTS_TTL,
        }
    }

    /// Check whether `url` may be fetched under the host's robots policy.
    ///
    /// A robots.txt that cannot be fetched at all returns the transport
    /// error; the caller decides whether to proceed.
    pub async fn is_allowed(&self, url: &Url) -> Result<bool, RobotsError> {
        let host = url
            .host_str()
            .ok_or_else(|| RobotsError::MissingHost(url.to_string()))?
            .to_string();

        let mut path = url.path().to_string();
        if path.is_empty() {
            path = "/".to_string();
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        // Cache hit fast path
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&host) {
                if entry.is_fresh(self.ttl) {
                    return Ok(entry.allows(&path));
                }
            }
        }

        // Fetch outside the lock; a concurrent fetch of the same host is
        // benign, last insert wins
        let robots_url = format!("{}://{}/robots.txt", url.scheme(), host);
        let (entry, fetch_err) = match self.fetch_robots(&robots_url).await {
            Ok((status, body)) => (
                RobotsEntry::from_response(status, &body, &self.user_agent),
                None,
            ),
            Err(e) => (RobotsEntry::unreachable(), Some(e)),
        };

        let allowed = entry.allows(&path);
        self.entries.write().await.insert(host, entry);

        match fetch_err {
            Some(e) => Err(RobotsError::Fetch(e)),
            None => Ok(allowed),
        }
    }

    async fn fetch_robots(&self, robots_url: &str) -> Result<(u16, String), reqwest::Error> {
        let response = self
            .client
            .get(robots_url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await?;

        let status = response.status().as_u16();
        // A body read failure on an otherwise reachable origin degrades to
        // an empty parse rather than an unreachable entry
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }
}
