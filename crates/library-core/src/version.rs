//! Package version ordering.
//!
//! Follows PEP 440 ordering: numeric release segments compare component-wise
//! with trailing zeros ignored, pre-releases (`a`, `b`, `rc`) and dev releases
//! sort below the matching final release, post releases sort above it.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::VersionError;

fn pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?ix)^\s*v?
                (?:(?P<epoch>[0-9]+)!)?
                (?P<release>[0-9]+(?:\.[0-9]+)*)
                (?:[-_.]?(?P<pre_l>alpha|a|beta|b|preview|pre|c|rc)[-_.]?(?P<pre_n>[0-9]+)?)?
                (?:-(?P<post_n1>[0-9]+)|[-_.]?(?P<post_l>post|rev|r)[-_.]?(?P<post_n2>[0-9]+)?)?
                (?:[-_.]?(?P<dev_l>dev)[-_.]?(?P<dev_n>[0-9]+)?)?
                (?:\+(?P<local>[a-z0-9]+(?:[-_.][a-z0-9]+)*))?
                \s*$",
            )
            .ok()
        })
        .as_ref()
}

/// Sort key component that can sit below or above every concrete value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Bound<T> {
    NegInf,
    Value(T),
    PosInf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PreKind {
    Alpha,
    Beta,
    Rc,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum LocalSegment {
    Alpha(String),
    Num(u64),
}

/// A parsed package version.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    epoch: u64,
    release: Vec<u64>,
    pre: Option<(PreKind, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
    local: Option<Vec<LocalSegment>>,
}

type SortKey<'a> = (
    u64,
    &'a [u64],
    Bound<(PreKind, u64)>,
    Bound<u64>,
    Bound<u64>,
    Bound<&'a [LocalSegment]>,
);

impl Version {
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::Invalid(raw.to_string());
        let caps = pattern()
            .and_then(|re| re.captures(raw))
            .ok_or_else(invalid)?;
        let num = |s: &str| s.parse::<u64>().map_err(|_| invalid());

        let epoch = caps.name("epoch").map(|m| num(m.as_str())).transpose()?;
        let release = caps["release"]
            .split('.')
            .map(num)
            .collect::<Result<Vec<_>, _>>()?;

        let pre = match caps.name("pre_l") {
            Some(letter) => {
                let kind = match letter.as_str().to_lowercase().as_str() {
                    "a" | "alpha" => PreKind::Alpha,
                    "b" | "beta" => PreKind::Beta,
                    _ => PreKind::Rc,
                };
                let n = caps.name("pre_n").map(|m| num(m.as_str())).transpose()?;
                Some((kind, n.unwrap_or(0)))
            }
            None => None,
        };

        let post = match (caps.name("post_n1"), caps.name("post_n2")) {
            (Some(n), _) | (None, Some(n)) => Some(num(n.as_str())?),
            // A bare `.post` marker without a number.
            (None, None) if caps.name("post_l").is_some() => Some(0),
            (None, None) => None,
        };

        let dev = match caps.name("dev_l") {
            Some(_) => Some(caps.name("dev_n").map(|m| num(m.as_str())).transpose()?.unwrap_or(0)),
            None => None,
        };

        let local = caps.name("local").map(|m| {
            m.as_str()
                .split(['-', '_', '.'])
                .map(|seg| match seg.parse::<u64>() {
                    Ok(n) => LocalSegment::Num(n),
                    Err(_) => LocalSegment::Alpha(seg.to_lowercase()),
                })
                .collect()
        });

        let mut release = release;
        while release.len() > 1 && release.last() == Some(&0) {
            release.pop();
        }

        Ok(Self {
            raw: raw.trim().to_string(),
            epoch: epoch.unwrap_or(0),
            release,
            pre,
            post,
            dev,
            local,
        })
    }

    /// True for pre-releases and development releases.
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn key(&self) -> SortKey<'_> {
        let pre = match (self.pre, self.post, self.dev) {
            // `1.0.dev0` sorts before `1.0a0`.
            (None, None, Some(_)) => Bound::NegInf,
            (None, _, _) => Bound::PosInf,
            (Some(p), _, _) => Bound::Value(p),
        };
        let post = self.post.map_or(Bound::NegInf, Bound::Value);
        let dev = self.dev.map_or(Bound::PosInf, Bound::Value);
        let local = self
            .local
            .as_deref()
            .map_or(Bound::NegInf, Bound::Value);
        (self.epoch, &self.release, pre, post, dev, local)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Whether `a` sorts strictly before `b`.
pub fn is_older(a: &str, b: &str) -> Result<bool, VersionError> {
    Ok(Version::parse(a)? < Version::parse(b)?)
}

/// Whether `v` is a final release (no pre-release or dev marker).
pub fn is_release(v: &str) -> Result<bool, VersionError> {
    Ok(!Version::parse(v)?.is_prerelease())
}
