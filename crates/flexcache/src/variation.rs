//! Matching a resource key against a request key
//!
//! The result is a [`Variation`]: the values of every request dimension the
//! resource declared relevant, in a fixed order. Variations are hashed
//! directly as the second-level cache key; their `Display` form is the
//! canonical variation string.

use std::fmt;

use crate::key::{Cacheability, ResourceKey};
use crate::request::RequestKey;

/// One matched request dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    /// Current group of the user
    Group(String),
    /// Top-level request URI
    Uri(String),
    /// User id
    User(u64),
    /// Selected request parameters with their first value, by name
    Params(Vec<(String, String)>),
    /// Request scheme
    Scheme(String),
    /// Server port
    Port(u16),
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Group(group) => write!(f, "groups=({})", group),
            Dimension::Uri(uri) => write!(f, "uri=({})", uri),
            Dimension::User(user) => write!(f, "user=({})", user),
            Dimension::Params(params) => {
                f.write_str("params=(")?;
                for (i, (name, value)) in params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}={}", name, value)?;
                }
                f.write_str(")")
            }
            Dimension::Scheme(scheme) => write!(f, "schemes=({})", scheme),
            Dimension::Port(port) => write!(f, "ports=({})", port),
        }
    }
}

/// Identifies one cached rendering of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variation {
    /// The resource renders identically for every request
    Always,
    /// Matched dimensions, in declaration order groups, uri, user, params,
    /// schemes, ports
    Matched(Vec<Dimension>),
}

impl fmt::Display for Variation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variation::Always => f.write_str("always"),
            Variation::Matched(dimensions) => {
                for (i, dimension) in dimensions.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    write!(f, "{}", dimension)?;
                }
                Ok(())
            }
        }
    }
}

impl ResourceKey {
    /// Compute the variation a request falls into
    ///
    /// Returns `None` when the response to this request must not be cached.
    /// The timeout is not part of the variation; it is checked against the
    /// stored entry at lookup.
    pub fn match_request(&self, request: &RequestKey) -> Option<Variation> {
        if self.cacheability() == Cacheability::Never {
            return None;
        }

        if let Some(blocked) = self.no_params() {
            let params = request.params();
            if !params.is_empty() {
                if blocked.is_empty() {
                    return None;
                }
                if params.keys().any(|name| blocked.contains(&name.to_lowercase())) {
                    return None;
                }
            }
        }

        if self.cacheability() == Cacheability::Always {
            return Some(Variation::Always);
        }

        let mut dimensions = Vec::new();

        if let Some(groups) = self.groups() {
            if !groups.is_empty() && !groups.contains(request.group()) {
                return None;
            }
            dimensions.push(Dimension::Group(request.group().to_string()));
        }

        if self.uri() {
            dimensions.push(Dimension::Uri(request.uri().to_string()));
        }

        if self.user() {
            dimensions.push(Dimension::User(request.user()));
        }

        if let Some(names) = self.params() {
            let selected = request
                .params()
                .iter()
                .filter(|(name, _)| names.is_empty() || names.contains(&name.to_lowercase()))
                .map(|(name, values)| {
                    // Only the first occurrence of a parameter is significant
                    let first = values.first().cloned().unwrap_or_default();
                    (name.clone(), first)
                })
                .collect();
            dimensions.push(Dimension::Params(selected));
        }

        if let Some(schemes) = self.schemes() {
            if !schemes.is_empty() && !schemes.contains(request.scheme()) {
                return None;
            }
            dimensions.push(Dimension::Scheme(request.scheme().to_string()));
        }

        if let Some(ports) = self.ports() {
            if !ports.is_empty() && !ports.contains(&request.port()) {
                return None;
            }
            dimensions.push(Dimension::Port(request.port()));
        }

        Some(Variation::Matched(dimensions))
    }
}
