//! Host filtering: which requests get intercepted
//!
//! The whitelist narrows, the blacklist vetoes. A non-empty blacklist
//! replaces the whitelist verdict entirely, so a host that matches neither
//! list is intercepted as soon as any blacklist entry exists.

use hyper::Uri;
use serde::{Deserialize, Serialize};

/// Allow/deny host suffix lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Hosts ending with any of these suffixes are never intercepted
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// When non-empty, only hosts ending with one of these suffixes are intercepted
    #[serde(default)]
    pub whitelist: Vec<String>,
}

impl FilterConfig {
    /// Create a filter from both lists
    pub fn new<B, W>(blacklist: B, whitelist: W) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        Self {
            blacklist: blacklist.into_iter().map(Into::into).collect(),
            whitelist: whitelist.into_iter().map(Into::into).collect(),
        }
    }

    /// Decide whether a request to `host` should be intercepted
    #[must_use]
    pub fn should_intercept(&self, host: &str) -> bool {
        let mut should = if self.whitelist.is_empty() {
            true
        } else {
            matches_any(host, &self.whitelist)
        };

        if !self.blacklist.is_empty() {
            should = !matches_any(host, &self.blacklist);
        }

        should
    }

    /// Same as [`should_intercept`](Self::should_intercept), for a URI.
    /// URIs without a host are never intercepted.
    #[must_use]
    pub fn should_intercept_uri(&self, uri: &Uri) -> bool {
        uri.host().is_some_and(|host| self.should_intercept(host))
    }

    /// Check that no list contains an empty suffix
    ///
    /// # Errors
    ///
    /// Returns the name of the offending list
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.blacklist.iter().any(String::is_empty) {
            return Err("blacklist");
        }
        if self.whitelist.iter().any(String::is_empty) {
            return Err("whitelist");
        }
        Ok(())
    }
}

fn matches_any(host: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|suffix| host.ends_with(suffix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter(blacklist: &[&str], whitelist: &[&str]) -> FilterConfig {
        FilterConfig::new(blacklist.iter().copied(), whitelist.iter().copied())
    }

    #[test]
    fn test_empty_lists_intercept_everything() {
        let config = FilterConfig::default();
        assert!(config.should_intercept("example.com"));
        assert!(config.should_intercept("localhost"));
    }

    #[test]
    fn test_whitelist_suffix_match() {
        let config = filter(&[], &["good.com"]);
        assert!(config.should_intercept("sub.good.com"));
        assert!(config.should_intercept("good.com"));
        assert!(!config.should_intercept("bad.com"));
    }

    #[test]
    fn test_blacklist_exact_host() {
        let config = filter(&["bad.com"], &[]);
        assert!(!config.should_intercept("bad.com"));
        assert!(config.should_intercept("good.com"));
    }

    #[test]
    fn test_blacklist_is_suffix_match() {
        let config = filter(&["example.com"], &[]);
        assert!(!config.should_intercept("api.example.com"));
    }

    #[test]
    fn test_blacklist_wins_over_whitelist() {
        let config = filter(&["good.com"], &["good.com"]);
        assert!(!config.should_intercept("api.good.com"));
    }

    #[test]
    fn test_blacklist_replaces_whitelist_verdict() {
        // The whitelist rejects other.org, but the blacklist check overrides it.
        let config = filter(&["bad.com"], &["good.com"]);
        assert!(config.should_intercept("other.org"));
        assert!(config.should_intercept("sub.good.com"));
        assert!(!config.should_intercept("bad.com"));
    }

    #[test]
    fn test_match_is_case_sensitive() {
        let config = filter(&["Example.com"], &[]);
        assert!(config.should_intercept("example.com"));
    }

    #[test]
    fn test_uri_without_host_is_skipped() {
        let config = FilterConfig::default();
        let uri: Uri = "/relative/path".parse().unwrap();
        assert!(!config.should_intercept_uri(&uri));

        let uri: Uri = "http://sub.good.com/x".parse().unwrap();
        assert!(config.should_intercept_uri(&uri));
    }

    #[test]
    fn test_validate_rejects_empty_suffix() {
        assert!(filter(&["ok.com"], &["fine.com"]).validate().is_ok());
        assert_eq!(filter(&[""], &[]).validate(), Err("blacklist"));
        assert_eq!(filter(&[], &[""]).validate(), Err("whitelist"));
    }

    proptest! {
        #[test]
        fn prop_empty_lists_intercept(host in "[a-z0-9.-]{0,40}") {
            prop_assert!(FilterConfig::default().should_intercept(&host));
        }

        #[test]
        fn prop_blacklist_veto(prefix in "[a-z0-9-]{0,12}", domain in "[a-z]{1,10}\\.[a-z]{2,4}") {
            let host = format!("{prefix}{domain}");
            let config = FilterConfig::new([domain.clone()], [domain]);
            prop_assert!(!config.should_intercept(&host));
        }
    }
}
