//! Path whitelist deciding which requests the circuit breaker guards
//!
//! Matching is exact on the decoded URL path component. Scheme, host, query
//! and fragment are discarded before the lookup; there is no prefix or
//! wildcard matching.

use percent_encoding::percent_decode_str;
use std::collections::HashSet;
use url::{ParseError, Url};

/// Exact-match set of URL paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathWhitelist {
    paths: HashSet<String>,
}

impl PathWhitelist {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Check whether the path component of `target` is whitelisted
    ///
    /// `target` may be an absolute URL (`https://api.example.com/pay?id=1`)
    /// or a bare path (`/pay`). Unparseable targets never match.
    pub fn matches(&self, target: &str) -> bool {
        if self.paths.is_empty() {
            return false;
        }

        request_path(target)
            .map(|path| self.paths.contains(&path))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }
}

/// Extract the decoded path component of an absolute URL or a bare path
///
/// The path is taken as written: percent escapes are decoded but dot
/// segments are kept, so `/x/../pay` is not `/pay`.
pub fn request_path(target: &str) -> Option<String> {
    let target = target.trim_matches(|c: char| c <= ' ');
    let rest = match Url::parse(target) {
        Ok(_) => {
            let (_, after_scheme) = target.split_once(':')?;
            match after_scheme.strip_prefix("//") {
                Some(authority) => authority
                    .find(['/', '?', '#'])
                    .map_or("", |start| &authority[start..]),
                None => after_scheme,
            }
        }
        Err(ParseError::RelativeUrlWithoutBase) => target,
        Err(_) => return None,
    };

    let raw = match rest.find(['?', '#']) {
        Some(end) => &rest[..end],
        None => rest,
    };
    let raw = if raw.is_empty() { "/" } else { raw };

    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|path| path.into_owned())
}
