//! SPIFFE ID value: trust domain + path segments, canonicalized.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdError;

const SCHEME: &str = "spiffe://";

/// A validated SPIFFE ID. Immutable once built; equality is structural.
///
/// The canonical form is `spiffe://<trust-domain>` followed by `/<segment>`
/// for every path segment. It is used both for display and on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpiffeId {
    trust_domain: String,
    segments: Vec<String>,
}

impl SpiffeId {
    /// Build an ID from a trust domain and pre-split path segments.
    ///
    /// The trust domain may be given bare (`example.org`) or with the
    /// scheme (`spiffe://example.org`), but never with a path.
    pub fn parse<I, S>(trust_domain: &str, segments: I) -> Result<Self, IdError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let trust_domain = parse_trust_domain(trust_domain)?;
        let segments = segments
            .into_iter()
            .map(|s| {
                let s = s.as_ref();
                validate_segment(s)?;
                Ok(s.to_string())
            })
            .collect::<Result<Vec<_>, IdError>>()?;
        Ok(Self { trust_domain, segments })
    }

    /// The bare trust-domain identity, e.g. `spiffe://example.org`.
    pub fn trust_domain_root(trust_domain: &str) -> Result<Self, IdError> {
        Self::parse(trust_domain, std::iter::empty::<&str>())
    }

    pub fn trust_domain(&self) -> &str { &self.trust_domain }

    pub fn segments(&self) -> &[String] { &self.segments }

    /// Path portion of the canonical form (`/a/b`, or empty for the root).
    pub fn path(&self) -> String {
        self.segments.iter().fold(String::new(), |mut acc, s| {
            acc.push('/');
            acc.push_str(s);
            acc
        })
    }

    /// True when the ID names a trust domain only (no path segments).
    pub fn is_trust_domain_only(&self) -> bool { self.segments.is_empty() }
}

fn parse_trust_domain(raw: &str) -> Result<String, IdError> {
    let td = raw.strip_prefix(SCHEME).unwrap_or(raw);
    let ok = !td.is_empty()
        && td.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.');
    if !ok {
        return Err(IdError::InvalidTrustDomain(raw.to_string()));
    }
    Ok(td.to_string())
}

fn validate_segment(seg: &str) -> Result<(), IdError> {
    if seg.is_empty() || seg == "." || seg == ".." || seg.contains('/') {
        return Err(IdError::InvalidPathSegment(seg.to_string()));
    }
    Ok(())
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SCHEME, self.trust_domain)?;
        for seg in &self.segments {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}

impl FromStr for SpiffeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(SCHEME).ok_or_else(|| IdError::InvalidScheme(s.to_string()))?;
        match rest.split_once('/') {
            None => Self::trust_domain_root(rest),
            Some((td, path)) => Self::parse(td, path.split('/')),
        }
    }
}

impl Serialize for SpiffeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpiffeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Raw SPIFFE ID as written by an operator: either the canonical URI or the
/// composed `{trust_domain, segments}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdInput {
    Uri(String),
    Parts {
        trust_domain: String,
        #[serde(default)]
        segments: Vec<String>,
    },
}

impl IdInput {
    pub fn resolve(&self) -> Result<SpiffeId, IdError> {
        match self {
            IdInput::Uri(s) => s.parse(),
            IdInput::Parts { trust_domain, segments } => SpiffeId::parse(trust_domain, segments),
        }
    }
}

impl From<&SpiffeId> for IdInput {
    fn from(id: &SpiffeId) -> Self { IdInput::Uri(id.to_string()) }
}
