//! Scope and audience sets plus the strategies used to match them.

use serde::{Deserialize, Serialize};
use url::Url;

/// An ordered set of protocol arguments (scopes, audiences, grant types).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(Vec<String>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split on `delimiter`, dropping empty segments.
    pub fn split(raw: &str, delimiter: char) -> Self {
        raw.split(delimiter)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn from_space_delimited(raw: &str) -> Self {
        raw.split_whitespace().collect()
    }

    pub fn has(&self, value: &str) -> bool {
        self.0.iter().any(|v| v == value)
    }

    pub fn has_one_of(&self, values: &[&str]) -> bool {
        values.iter().any(|v| self.has(v))
    }

    /// True when the set holds exactly `value` and nothing else.
    pub fn exact(&self, value: &str) -> bool {
        self.0.len() == 1 && self.0[0] == value
    }

    /// Adds `value` unless it is already present.
    pub fn append(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() && !self.has(&value) {
            self.0.push(value);
        }
    }

    pub fn join(&self, delimiter: &str) -> String {
        self.0.join(delimiter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<S: Into<String>> FromIterator<S> for Arguments {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut args = Arguments::new();
        for value in iter {
            args.append(value);
        }
        args
    }
}

impl From<Vec<String>> for Arguments {
    fn from(values: Vec<String>) -> Self {
        values.into_iter().collect()
    }
}

/// Hierarchic scope matching: `root` covers `root.read` and `root.read.all`,
/// but `root.read` does not cover `root`.
pub fn hierarchic_scope_match(haystack: &Arguments, needle: &str) -> bool {
    let wanted: Vec<&str> = needle.split('.').collect();
    haystack.iter().any(|granted| {
        if granted == needle {
            return true;
        }
        if granted.len() > needle.len() {
            return false;
        }
        let granted: Vec<&str> = granted.split('.').collect();
        granted.len() <= wanted.len() && granted.iter().zip(&wanted).all(|(g, w)| g == w)
    })
}

/// Every requested audience must share scheme, host and port with an allowed
/// entry, and its path must equal or sit below the allowed path.
pub fn audience_matches(allowed: &[String], requested: &Arguments) -> Result<(), String> {
    for needle in requested.iter() {
        let wanted =
            Url::parse(needle).map_err(|e| format!("audience {needle} is not a valid url: {e}"))?;
        let found = allowed.iter().any(|entry| {
            let Ok(allowed) = Url::parse(entry) else {
                return false;
            };
            if wanted.scheme() != allowed.scheme()
                || wanted.host_str() != allowed.host_str()
                || wanted.port_or_known_default() != allowed.port_or_known_default()
            {
                return false;
            }
            let base = allowed.path().trim_end_matches('/');
            let path = wanted.path();
            path == allowed.path()
                || path == base
                || path.starts_with(&format!("{base}/"))
        });
        if !found {
            return Err(format!("audience {needle} is not allowed for this client"));
        }
    }
    Ok(())
}
