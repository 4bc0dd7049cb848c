use std::collections::BTreeMap;
use std::fmt::{self, Write};

use regex::Regex;

/// Builds stable cache keys from a resource name and its request parameters.
///
/// Parameters are sorted by name, so the same resource and parameters always produce the same
/// key regardless of the order they were added in. All keys of a resource share the
/// `"{resource}:"` prefix, which makes them easy to invalidate as a family with
/// [`KeyPattern::Prefix`].
///
/// ```
/// use fetchcache::CacheKeyBuilder;
///
/// let key = CacheKeyBuilder::new("posts")
///     .param("sort", "new")
///     .param("page", 2)
///     .build();
/// assert_eq!(key, "posts:page=2&sort=new");
/// ```
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    resource: String,
    params: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter. Adding the same name twice keeps the last value.
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Adds a parameter only if it has a value.
    pub fn opt_param<T: fmt::Display>(self, name: impl Into<String>, value: Option<T>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    pub fn build(self) -> String {
        let mut key = self.resource;
        key.push(':');
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                key.push('&');
            }
            // writing into a `String` cannot fail
            let _ = write!(key, "{name}={value}");
        }
        key
    }
}

/// Selects a family of cache keys for bulk invalidation.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Matches all keys starting with the given string.
    Prefix(String),
    /// Matches all keys the regular expression finds a match in.
    Regex(Regex),
}

impl KeyPattern {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Regex)
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyPattern::Regex(regex) => regex.is_match(key),
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(prefix: &str) -> Self {
        Self::prefix(prefix)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            KeyPattern::Regex(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}
