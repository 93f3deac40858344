//! Cached rendering result
//!
//! An entry is filled while a resource renders and frozen by
//! [`CacheEntry::complete`]. After that it is only read, possibly by many
//! request threads at once, through [`CacheEntry::playback`].

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::request::Params;

/// Response headers: name to values
pub type Headers = BTreeMap<String, Vec<String>>;

const DAY_MILLIS: u64 = 24 * 60 * 60 * 1000;
const MINUTE_MILLIS: u64 = 60 * 1000;

/// One recorded piece of a rendering
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// Raw output
    Output(Bytes),
    /// Nested include call, replayed on every playback
    Include {
        /// Include target
        target: String,
        /// Parameters overlaid on the request while the target renders
        params: Params,
    },
}

/// Destination of an entry playback
///
/// Implemented by the renderer's response wrapper. `include` re-enters the
/// rendering pipeline, which may in turn play back another cached entry.
pub trait PlaybackSink {
    /// Error raised by the sink's own I/O
    type Error;

    /// Send a redirect; nothing else is played for a redirect entry
    fn redirect(&mut self, target: &str) -> Result<(), Self::Error>;

    /// Apply cached response headers
    fn headers(&mut self, headers: &Headers) -> Result<(), Self::Error>;

    /// Write a cached output fragment
    ///
    /// `leaf` is set when the fragment is the whole entry, so the sink may
    /// keep the buffer instead of copying it.
    fn write(&mut self, output: &Bytes, leaf: bool) -> Result<(), Self::Error>;

    /// Ambient request parameters include targets are rendered with
    fn parameters(&mut self) -> &mut Params;

    /// Render an include target
    fn include(&mut self, target: &str) -> Result<(), Self::Error>;
}

/// Rendered output of one resource variation
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    elements: Vec<Element>,
    headers: Option<Headers>,
    redirect: Option<String>,
    byte_size: usize,
    expires_at: Option<u64>,
    completed: bool,
}

impl CacheEntry {
    /// Create an empty entry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw output
    pub fn add_output(&mut self, output: impl Into<Bytes>) {
        if self.completed || self.redirect.is_some() {
            return;
        }
        let output = output.into();
        self.byte_size += output.len();
        self.elements.push(Element::Output(output));
    }

    /// Append an include call; only the target name counts towards the cost
    pub fn add_include(&mut self, target: impl Into<String>, params: Params) {
        if self.completed || self.redirect.is_some() {
            return;
        }
        let target = target.into();
        self.byte_size += target.len();
        self.elements.push(Element::Include { target, params });
    }

    /// Record response headers; only header names count towards the cost
    pub fn add_headers(&mut self, headers: Headers) {
        if self.completed || self.redirect.is_some() {
            return;
        }
        self.byte_size += headers.keys().map(|name| name.len()).sum::<usize>();
        self.headers.get_or_insert_with(Headers::new).extend(headers);
    }

    /// Turn the entry into a redirect, dropping everything recorded so far
    pub fn set_redirect(&mut self, target: impl Into<String>) {
        if self.completed {
            return;
        }
        let target = target.into();
        self.byte_size = target.len();
        self.elements.clear();
        self.headers = None;
        self.redirect = Some(target);
    }

    /// Freeze the entry
    pub fn complete(&mut self) {
        self.completed = true;
    }

    /// Check whether the entry is frozen
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Set the expiry for a timeout in minutes, aligned to the clock
    ///
    /// Entries expire on a fixed grid counted from midnight (UTC): with a
    /// 20 minute timeout an entry completed at 10:07 expires at 10:20, not
    /// at 10:27. Ignored before [`complete`](Self::complete).
    pub fn set_timeout(&mut self, minutes: u32, now_millis: u64) {
        if !self.completed || minutes == 0 {
            return;
        }
        let timeout = u64::from(minutes) * MINUTE_MILLIS;
        let daytime = now_millis % DAY_MILLIS;
        self.expires_at = Some(now_millis - (daytime % timeout) + timeout);
    }

    /// Expiry instant in epoch milliseconds
    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    /// Check whether the entry has expired at the given time
    pub fn is_expired(&self, now_millis: u64) -> bool {
        matches!(self.expires_at, Some(expires) if expires < now_millis)
    }

    /// Recorded elements in order
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Recorded headers
    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    /// Redirect target, if this is a redirect entry
    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    /// Cost of the entry in bytes
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// An entry made of exactly one output fragment and no includes
    pub fn is_leaf(&self) -> bool {
        matches!(self.elements.as_slice(), [Element::Output(_)])
    }

    /// Replay the entry onto a sink
    ///
    /// Include parameters are overlaid on the sink's ambient parameters for
    /// the duration of the include and restored afterwards, also when the
    /// include fails. Nothing is played for an entry that is not completed.
    pub fn playback<S: PlaybackSink>(&self, sink: &mut S) -> Result<(), S::Error> {
        if !self.completed {
            return Ok(());
        }

        if let Some(target) = &self.redirect {
            return sink.redirect(target);
        }

        if let Some(headers) = &self.headers {
            sink.headers(headers)?;
        }

        let leaf = self.is_leaf();
        for element in &self.elements {
            match element {
                Element::Output(output) => sink.write(output, leaf)?,
                Element::Include { target, params } => {
                    let saved = if params.is_empty() {
                        None
                    } else {
                        let ambient = sink.parameters();
                        let saved = ambient.clone();
                        ambient.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
                        Some(saved)
                    };

                    let result = sink.include(target);

                    if let Some(saved) = saved {
                        *sink.parameters() = saved;
                    }
                    result?;
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(target) = &self.redirect {
            return write!(f, "CacheEntry [redirect to {}]", target);
        }

        writeln!(
            f,
            "CacheEntry [{} elements/{} bytes]",
            self.elements.len(),
            self.byte_size
        )?;
        for (i, element) in self.elements.iter().enumerate() {
            match element {
                Element::Output(output) => {
                    writeln!(f, "{} - output {}", i + 1, String::from_utf8_lossy(output))?
                }
                Element::Include { target, .. } => writeln!(f, "{} - include {}", i + 1, target)?,
            }
        }
        Ok(())
    }
}
