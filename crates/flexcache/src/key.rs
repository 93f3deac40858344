//! Cache key language: resource-level caching directives
//!
//! A directive string is read from a resource's `cache` property:
//! ```text
//! always | never | uri | user | groups[=(a,b,...)] | params[=(a,b,...)]
//! no-params[=(a,b,...)] | timeout=<minutes> | publish-clear
//! schemes[=(a,...)] | ports[=(a,...)]
//! ```
//! Directives are separated by `;`. Parsing never fails: anything the
//! grammar does not accept turns the whole key into "never cacheable".
//!
//! Precedence: the first `never` (or its alias `false`) ends parsing and wins
//! outright, wherever it appears. `always` only sets a flag, so a `never`
//! after it still wins. A parse error seen before the `never` stays flagged.
//!
//! A bare list directive (`groups`) means "any value"; an explicit but empty
//! list (`groups=()`) is a parse error.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::{take_till, take_till1},
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map, map_res, opt, rest},
    multi::separated_list0,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use tracing::warn;

/// Whether a resource may be cached at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cacheability {
    /// Never cached
    #[default]
    Never,
    /// Cached per variation of the declared request dimensions
    Check,
    /// Cached once for every request
    Always,
}

/// Parsed caching directives of one resource
///
/// A never-cacheable key carries no other directives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceKey {
    cacheability: Cacheability,
    uri: bool,
    user: bool,
    groups: Option<BTreeSet<String>>,
    params: Option<BTreeSet<String>>,
    no_params: Option<BTreeSet<String>>,
    timeout: Option<u32>,
    publish_clear: bool,
    schemes: Option<BTreeSet<String>>,
    ports: Option<BTreeSet<u16>>,
    parse_error: bool,
}

impl ResourceKey {
    /// Key that never allows caching
    pub fn never() -> Self {
        Self::default()
    }

    /// Parse a directive string
    ///
    /// An empty string yields a never-cacheable key. Unknown directives and
    /// malformed values yield a never-cacheable key flagged with
    /// [`had_parse_error`](Self::had_parse_error).
    pub fn parse(directives: &str) -> Self {
        let mut key = ResourceKey::default();
        let mut always = false;
        let mut seen = false;

        for token in directives.split(';') {
            if token.trim().is_empty() {
                continue;
            }

            let (name, value) = match directive(token) {
                Ok((_, parsed)) => parsed,
                Err(_) => {
                    warn!(token, "malformed cache directive");
                    key.parse_error = true;
                    continue;
                }
            };

            let accepted = match name {
                "always" => {
                    always = true;
                    true
                }
                "never" | "false" => {
                    return ResourceKey {
                        parse_error: key.parse_error,
                        ..ResourceKey::never()
                    };
                }
                "uri" => {
                    key.uri = true;
                    true
                }
                "user" => {
                    key.user = true;
                    true
                }
                "groups" => assign_names(&mut key.groups, value),
                "params" => assign_names(&mut key.params, value),
                "no-params" => assign_names(&mut key.no_params, value),
                "timeout" => match value.map(minutes) {
                    Some(Ok((_, m))) if m > 0 => {
                        key.timeout = Some(m);
                        true
                    }
                    _ => false,
                },
                "publish-clear" => {
                    key.publish_clear = true;
                    true
                }
                "schemes" => assign_names(&mut key.schemes, value),
                "ports" => assign_ports(&mut key.ports, value),
                // Emitted by Display for flagged keys
                "parse-error" => continue,
                _ => false,
            };

            if accepted {
                seen = true;
            } else {
                warn!(directive = name, value, "invalid cache directive");
                key.parse_error = true;
            }
        }

        if key.parse_error {
            return ResourceKey {
                parse_error: true,
                ..ResourceKey::never()
            };
        }
        if !seen {
            return ResourceKey::never();
        }

        key.cacheability = if always {
            Cacheability::Always
        } else {
            Cacheability::Check
        };
        key
    }

    /// Cacheability of the resource
    pub fn cacheability(&self) -> Cacheability {
        self.cacheability
    }

    /// `false` for never-cacheable keys
    pub fn is_cacheable(&self) -> bool {
        self.cacheability != Cacheability::Never
    }

    /// The request URI is a variation dimension
    pub fn uri(&self) -> bool {
        self.uri
    }

    /// The user id is a variation dimension
    pub fn user(&self) -> bool {
        self.user
    }

    /// Declared groups (empty = any group)
    pub fn groups(&self) -> Option<&BTreeSet<String>> {
        self.groups.as_ref()
    }

    /// Declared parameters (empty = all request parameters)
    pub fn params(&self) -> Option<&BTreeSet<String>> {
        self.params.as_ref()
    }

    /// Parameters that forbid caching (empty = any parameter does)
    pub fn no_params(&self) -> Option<&BTreeSet<String>> {
        self.no_params.as_ref()
    }

    /// Timeout in minutes
    pub fn timeout(&self) -> Option<u32> {
        self.timeout
    }

    /// The resource asks to be cleared on publish
    pub fn publish_clear(&self) -> bool {
        self.publish_clear
    }

    /// Declared schemes (empty = any scheme)
    pub fn schemes(&self) -> Option<&BTreeSet<String>> {
        self.schemes.as_ref()
    }

    /// Declared ports (empty = any port)
    pub fn ports(&self) -> Option<&BTreeSet<u16>> {
        self.ports.as_ref()
    }

    /// The directive string could not be parsed
    pub fn had_parse_error(&self) -> bool {
        self.parse_error
    }
}

impl FromStr for ResourceKey {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ResourceKey::parse(s))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cacheability == Cacheability::Never {
            f.write_str("never")?;
            if self.parse_error {
                f.write_str(";parse-error")?;
            }
            return Ok(());
        }

        let mut parts: Vec<String> = Vec::new();
        if self.cacheability == Cacheability::Always {
            parts.push("always".to_string());
        }
        if self.uri {
            parts.push("uri".to_string());
        }
        if self.user {
            parts.push("user".to_string());
        }
        parts.extend(list_directive("groups", self.groups.as_ref()));
        parts.extend(list_directive("params", self.params.as_ref()));
        parts.extend(list_directive("no-params", self.no_params.as_ref()));
        if let Some(minutes) = self.timeout {
            parts.push(format!("timeout={}", minutes));
        }
        if self.publish_clear {
            parts.push("publish-clear".to_string());
        }
        parts.extend(list_directive("schemes", self.schemes.as_ref()));
        parts.extend(list_directive("ports", self.ports.as_ref()));

        f.write_str(&parts.join(";"))
    }
}

fn list_directive<T: fmt::Display>(name: &str, values: Option<&BTreeSet<T>>) -> Option<String> {
    let values = values?;
    if values.is_empty() {
        return Some(name.to_string());
    }
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    Some(format!("{}=({})", name, items.join(",")))
}

/// `name` or `name=value`, split on the first `=`
fn directive(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    all_consuming(tuple((
        preceded(multispace0, take_till1(|c: char| c == '=' || c.is_whitespace())),
        preceded(multispace0, opt(preceded(char('='), map(rest, str::trim)))),
    )))(input)
}

/// `(a,b,...)`; parentheses are optional and a trailing comma is tolerated
fn value_list(input: &str) -> IResult<&str, Vec<&str>> {
    all_consuming(delimited(
        pair(multispace0, opt(char('('))),
        separated_list0(char(','), take_till(|c: char| c == ',' || c == ')')),
        pair(opt(char(')')), multispace0),
    ))(input)
}

/// `20` or `(20)`
fn minutes(input: &str) -> IResult<&str, u32> {
    all_consuming(delimited(
        opt(char('(')),
        map_res(digit1, |digits: &str| digits.parse::<u32>()),
        opt(char(')')),
    ))(input)
}

fn names(value: &str) -> Option<BTreeSet<String>> {
    let (_, items) = value_list(value).ok()?;
    Some(
        items
            .into_iter()
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect(),
    )
}

/// A bare directive means "all"; an explicit list must name something
fn assign_names(slot: &mut Option<BTreeSet<String>>, value: Option<&str>) -> bool {
    let parsed = match value {
        Some(value) => names(value).filter(|set| !set.is_empty()),
        None => Some(BTreeSet::new()),
    };
    match parsed {
        Some(set) => {
            *slot = Some(set);
            true
        }
        None => false,
    }
}

fn assign_ports(slot: &mut Option<BTreeSet<u16>>, value: Option<&str>) -> bool {
    let Some(value) = value else {
        *slot = Some(BTreeSet::new());
        return true;
    };
    let Some(items) = names(value).filter(|set| !set.is_empty()) else {
        return false;
    };
    let ports: Result<BTreeSet<u16>, _> = items.iter().map(|item| item.parse::<u16>()).collect();
    match ports {
        Ok(ports) => {
            *slot = Some(ports);
            true
        }
        Err(_) => false,
    }
}
