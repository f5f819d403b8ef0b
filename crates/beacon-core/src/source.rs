//! Sources - who asserted a copy of an entry
//!
//! A source is identified by an origin, a name, and a generation id. Two
//! sources with the same origin and name refer to the same logical asserter;
//! the generation id tells successive connections of that asserter apart.

use std::fmt;

/// Where a copy came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// Bootstrapped from a static or external snapshot
    Bootstrap,
    /// Copied from a peer registry over replication
    Replicated,
    /// Registered directly by the instance itself
    Local,
}

impl Origin {
    /// Priority used when electing the effective copy, higher wins
    #[inline]
    pub fn priority(self) -> u8 {
        match self {
            Origin::Bootstrap => 0,
            Origin::Replicated => 1,
            Origin::Local => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Bootstrap => "BOOTSTRAP",
            Origin::Replicated => "REPLICATED",
            Origin::Local => "LOCAL",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one asserter of registry entries
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Source {
    origin: Origin,
    name: String,
    id: u64,
}

impl Source {
    pub fn new(origin: Origin, name: impl Into<String>, id: u64) -> Self {
        Source {
            origin,
            name: name.into(),
            id,
        }
    }

    /// Fresh local source with a random generation id
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(Origin::Local, name, rand::random())
    }

    /// Fresh replicated source with a random generation id
    pub fn replicated(name: impl Into<String>) -> Self {
        Self::new(Origin::Replicated, name, rand::random())
    }

    pub fn bootstrap(name: impl Into<String>) -> Self {
        Self::new(Origin::Bootstrap, name, rand::random())
    }

    #[inline]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Same origin and name, generation ignored
    #[inline]
    pub fn same_asserter(&self, other: &Source) -> bool {
        self.origin == other.origin && self.name == other.name
    }

    /// A new generation of the same asserter
    pub fn next_generation(&self) -> Source {
        let mut id = rand::random();
        while id == self.id {
            id = rand::random();
        }
        Source::new(self.origin, self.name.clone(), id)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{:x}", self.origin, self.name, self.id)
    }
}

/// Predicate over sources used to filter subscriptions and bulk evictions
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum SourceMatcher {
    #[default]
    Any,
    Origin(Origin),
    /// Origin and name, any generation
    OriginName(Origin, String),
    /// Exactly this source, generation included
    Exact(Source),
}

impl SourceMatcher {
    pub fn matches(&self, source: &Source) -> bool {
        match self {
            SourceMatcher::Any => true,
            SourceMatcher::Origin(origin) => source.origin == *origin,
            SourceMatcher::OriginName(origin, name) => {
                source.origin == *origin && source.name == *name
            }
            SourceMatcher::Exact(expected) => expected == source,
        }
    }
}
