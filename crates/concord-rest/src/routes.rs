//! Route normalization for rate-limit bucket keys.
//!
//! The remote applies one quota per `(method, path-template)` pair, not per
//! concrete URL. Opaque id segments are collapsed to placeholders so that
//! all calls sharing a quota land in the same bucket, while ids that name
//! the resource collection itself (channel, guild, webhook ids) stay
//! literal to keep unrelated resources in separate buckets.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Method;

/// Webhook token segments are long opaque strings, never ids.
static WEBHOOK_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{64,}$").expect("valid regex"));

/// Path segments whose following id identifies the resource collection.
/// Those ids must remain literal to avoid bucket collisions.
const MAJOR_SEGMENTS: &[&str] = &["channels", "guilds", "webhooks"];

/// A normalized route: the bucket key for one remote quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    key: String,
}

impl Route {
    /// Normalize `path` under `method` into a bucket key.
    #[must_use]
    pub fn new(method: &Method, path: &str) -> Self {
        let template = routefy(method, path);

        // Adding and removing a reaction share one quota on the remote, so
        // PUT and DELETE under a reaction collection fold onto a shared
        // MODIFY key truncated at the collection.
        if *method == Method::PUT || *method == Method::DELETE {
            if let Some(idx) = template.find("/reactions") {
                let end = idx.saturating_add("/reactions".len());
                return Self {
                    key: format!("MODIFY {}", &template[..end]),
                };
            }
        }

        Self {
            key: format!("{method} {template}"),
        }
    }

    /// The normalized bucket key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Collapse opaque segments of `path` into a route template.
fn routefy(method: &Method, path: &str) -> String {
    let mut segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();

    // Numeric ids become placeholders unless the preceding literal names a
    // major resource collection.
    for i in 0..segments.len() {
        if !is_numeric(&segments[i]) {
            continue;
        }
        let protected = i
            .checked_sub(1)
            .is_some_and(|p| MAJOR_SEGMENTS.contains(&segments[p].as_str()));
        if !protected {
            segments[i] = ":id".to_owned();
        }
    }

    // Emoji and user segments under a reaction collection are opaque.
    if let Some(i) = segments.iter().position(|s| s == "reactions") {
        if let Some(seg) = segments.get_mut(i.saturating_add(1)) {
            *seg = ":id".to_owned();
        }
        if let Some(seg) = segments.get_mut(i.saturating_add(2)) {
            *seg = ":userID".to_owned();
        }
    }

    // Webhook tokens collapse so every token shares the webhook's bucket.
    if segments.first().is_some_and(|s| s == "webhooks")
        && segments.get(1).is_some_and(|s| is_numeric(s))
        && segments.get(2).is_some_and(|s| WEBHOOK_TOKEN.is_match(s))
    {
        segments[2] = ":token".to_owned();
    }

    // Listing a guild's channels shares one quota across guilds.
    if *method == Method::GET
        && segments.len() == 3
        && segments[0] == "guilds"
        && is_numeric(&segments[1])
        && segments[2] == "channels"
    {
        segments[1] = ":id".to_owned();
    }

    let mut template = String::new();
    for seg in &segments {
        template.push('/');
        template.push_str(seg);
    }
    template
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}
