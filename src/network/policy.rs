//! Cache storage policy handed to the caller with each response head

use hyper::header::{HeaderMap, CACHE_CONTROL};

/// How the caller may cache a relayed response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStoragePolicy {
    /// Any cache, including persistent ones
    Allowed,
    /// In-memory caches only
    AllowedInMemoryOnly,
    /// Must not be cached
    NotAllowed,
}

/// Request directives that leave the default policy untouched
const NEUTRAL_DIRECTIVES: &[&str] = &[
    "max-age",
    "max-stale",
    "min-fresh",
    "no-transform",
    "only-if-cached",
];

impl CacheStoragePolicy {
    /// Derive the policy from the original request's `Cache-Control`
    #[must_use]
    pub fn for_request(headers: &HeaderMap) -> Self {
        let mut values = headers.get_all(CACHE_CONTROL).iter().peekable();
        if values.peek().is_none() {
            return Self::Allowed;
        }

        let mut policy = Self::Allowed;
        for value in values {
            let Ok(value) = value.to_str() else {
                return Self::NotAllowed;
            };

            for directive in value.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                let (name, argument) = match directive.split_once('=') {
                    Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                let name = name.to_ascii_lowercase();

                match name.as_str() {
                    "no-store" => return Self::NotAllowed,
                    "no-cache" => policy = Self::AllowedInMemoryOnly,
                    "max-age" if argument == Some("0") => policy = Self::AllowedInMemoryOnly,
                    known if NEUTRAL_DIRECTIVES.contains(&known) => {}
                    _ => return Self::NotAllowed,
                }
            }
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(value: &str) -> CacheStoragePolicy {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, value.parse().unwrap());
        CacheStoragePolicy::for_request(&headers)
    }

    #[test]
    fn test_no_header_allows_caching() {
        assert_eq!(
            CacheStoragePolicy::for_request(&HeaderMap::new()),
            CacheStoragePolicy::Allowed
        );
    }

    #[test]
    fn test_directives() {
        assert_eq!(policy("no-store"), CacheStoragePolicy::NotAllowed);
        assert_eq!(policy("max-age=60, no-store"), CacheStoragePolicy::NotAllowed);
        assert_eq!(policy("no-cache"), CacheStoragePolicy::AllowedInMemoryOnly);
        assert_eq!(policy("max-age=0"), CacheStoragePolicy::AllowedInMemoryOnly);
        assert_eq!(policy("Max-Age=600"), CacheStoragePolicy::Allowed);
        assert_eq!(policy("max-stale, only-if-cached"), CacheStoragePolicy::Allowed);
    }

    #[test]
    fn test_unknown_directive_disallows() {
        assert_eq!(policy("x-custom"), CacheStoragePolicy::NotAllowed);
        assert_eq!(policy("no-cache, private"), CacheStoragePolicy::NotAllowed);
    }

    #[test]
    fn test_multiple_header_values() {
        let mut headers = HeaderMap::new();
        headers.append(CACHE_CONTROL, "max-age=10".parse().unwrap());
        headers.append(CACHE_CONTROL, "no-cache".parse().unwrap());
        assert_eq!(
            CacheStoragePolicy::for_request(&headers),
            CacheStoragePolicy::AllowedInMemoryOnly
        );
    }
}
