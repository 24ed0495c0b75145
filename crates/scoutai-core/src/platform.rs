// Supported-platform and draft-page predicates, evaluated against a URL.

use serde::{Deserialize, Serialize};
use url::Url;

/// Fantasy platform hosting the current page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Espn,
    Yahoo,
    /// Not a supported fantasy platform.
    #[serde(rename = "none")]
    Unsupported,
}

impl Platform {
    /// Detect the platform from a page URL. Unparseable URLs are
    /// [`Platform::Unsupported`].
    pub fn detect(url: &str) -> Self {
        let Ok(parsed) = Url::parse(url) else {
            return Platform::Unsupported;
        };
        let Some(host) = parsed.host_str() else {
            return Platform::Unsupported;
        };
        let host = host.to_ascii_lowercase();
        if host_matches(&host, "espn.com") {
            Platform::Espn
        } else if host_matches(&host, "yahoo.com") {
            Platform::Yahoo
        } else {
            Platform::Unsupported
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Platform::Unsupported)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Espn => "espn",
            Platform::Yahoo => "yahoo",
            Platform::Unsupported => "none",
        }
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Whether the URL points at a live draft room: the path or query mentions
/// `draft` or `live`. The host is not considered.
pub fn is_draft_page(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let mut haystack = parsed.path().to_ascii_lowercase();
    if let Some(query) = parsed.query() {
        haystack.push('?');
        haystack.push_str(&query.to_ascii_lowercase());
    }
    haystack.contains("draft") || haystack.contains("live")
}

/// Platform and draft-page predicates together: the condition under which
/// the overlay is allowed to exist.
pub fn is_supported_draft_page(url: &str) -> bool {
    Platform::detect(url).is_supported() && is_draft_page(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_espn_and_yahoo_subdomains() {
        assert_eq!(
            Platform::detect("https://fantasy.espn.com/football/draft?leagueId=1"),
            Platform::Espn
        );
        assert_eq!(
            Platform::detect("https://football.fantasysports.yahoo.com/f1/draftclient"),
            Platform::Yahoo
        );
        assert_eq!(Platform::detect("https://espn.com/"), Platform::Espn);
    }

    #[test]
    fn lookalike_hosts_are_unsupported() {
        assert_eq!(
            Platform::detect("https://notespn.com/draft"),
            Platform::Unsupported
        );
        assert_eq!(
            Platform::detect("https://espn.com.example.org/draft"),
            Platform::Unsupported
        );
    }

    #[test]
    fn garbage_url_is_unsupported() {
        assert_eq!(Platform::detect("not a url"), Platform::Unsupported);
        assert!(!is_draft_page("not a url"));
    }

    #[test]
    fn draft_page_looks_at_path_and_query() {
        assert!(is_draft_page("https://fantasy.espn.com/football/draft?leagueId=1"));
        assert!(is_draft_page("https://fantasy.espn.com/football/league?view=LIVE"));
        assert!(!is_draft_page("https://fantasy.espn.com/football/team?teamId=3"));
    }

    #[test]
    fn host_alone_does_not_make_a_draft_page() {
        assert!(!is_draft_page("https://draft.example.com/"));
    }

    #[test]
    fn combined_predicate() {
        assert!(is_supported_draft_page(
            "https://fantasy.espn.com/football/draft?leagueId=1"
        ));
        assert!(!is_supported_draft_page("https://example.com/draft"));
        assert!(!is_supported_draft_page("https://fantasy.espn.com/football/team"));
    }

    #[test]
    fn serializes_as_lowercase_names() {
        assert_eq!(serde_json::to_string(&Platform::Espn).unwrap(), r#""espn""#);
        assert_eq!(
            serde_json::to_string(&Platform::Unsupported).unwrap(),
            r#""none""#
        );
    }
}
