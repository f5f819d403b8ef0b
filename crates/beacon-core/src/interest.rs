//! Interest Model - predicates over registry entries
//!
//! An interest selects the instances a subscriber or snapshot cares about:
//! - `FullRegistry` matches everything, `Empty` matches nothing
//! - atomic interests match one field (id, application, group, vip) with
//!   an `Equals` or `Like` (anchored regex) operator
//! - `Multiple` is a flat union of atomic interests

use std::fmt;
use std::hash::{Hash, Hasher};

use regex::Regex;

use crate::{BeaconError, BeaconResult, InstanceInfo};

/// Comparison operator of an atomic interest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    Like,
}

/// Value to compare against, with its compiled regex for `Like`
#[derive(Clone, Debug)]
pub struct Pattern {
    operator: Operator,
    value: String,
    regex: Option<Regex>,
}

impl Pattern {
    pub fn equals(value: impl Into<String>) -> Self {
        Pattern {
            operator: Operator::Equals,
            value: value.into(),
            regex: None,
        }
    }

    /// Regex pattern; it must match the whole field value
    pub fn like(value: impl Into<String>) -> BeaconResult<Self> {
        let value = value.into();
        let regex = Regex::new(&format!("^(?:{})$", value)).map_err(|e| {
            BeaconError::InvalidPattern {
                pattern: value.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Pattern {
            operator: Operator::Like,
            value,
            regex: Some(regex),
        })
    }

    #[inline]
    pub fn operator(&self) -> Operator {
        self.operator
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Absent fields never match
    pub fn matches(&self, candidate: Option<&str>) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        match &self.regex {
            Some(regex) => regex.is_match(candidate),
            None => self.value == candidate,
        }
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.operator == other.operator && self.value == other.value
    }
}

impl Eq for Pattern {}

impl Hash for Pattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.operator.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Equals => write!(f, "={}", self.value),
            Operator::Like => write!(f, "~{}", self.value),
        }
    }
}

/// Predicate selecting a subset of registry entries
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Interest {
    FullRegistry,
    Empty,
    Instance(Pattern),
    Application(Pattern),
    Group(Pattern),
    Vip(Pattern),
    Multiple(MultipleInterests),
}

impl Interest {
    pub fn for_full_registry() -> Self {
        Interest::FullRegistry
    }

    pub fn for_instance(id: impl Into<String>) -> Self {
        Interest::Instance(Pattern::equals(id))
    }

    pub fn for_instance_like(pattern: impl Into<String>) -> BeaconResult<Self> {
        Ok(Interest::Instance(Pattern::like(pattern)?))
    }

    pub fn for_application(app: impl Into<String>) -> Self {
        Interest::Application(Pattern::equals(app))
    }

    pub fn for_application_like(pattern: impl Into<String>) -> BeaconResult<Self> {
        Ok(Interest::Application(Pattern::like(pattern)?))
    }

    pub fn for_group(group: impl Into<String>) -> Self {
        Interest::Group(Pattern::equals(group))
    }

    pub fn for_group_like(pattern: impl Into<String>) -> BeaconResult<Self> {
        Ok(Interest::Group(Pattern::like(pattern)?))
    }

    pub fn for_vip(vip: impl Into<String>) -> Self {
        Interest::Vip(Pattern::equals(vip))
    }

    pub fn for_vip_like(pattern: impl Into<String>) -> BeaconResult<Self> {
        Ok(Interest::Vip(Pattern::like(pattern)?))
    }

    /// Union of the given interests, flattened and normalised.
    ///
    /// No members gives `Empty`, a single member is returned as is, and a
    /// union containing `FullRegistry` is `FullRegistry`.
    pub fn for_some(interests: impl IntoIterator<Item = Interest>) -> Self {
        MultipleInterests::new(interests).into_interest()
    }

    pub fn matches(&self, info: &InstanceInfo) -> bool {
        match self {
            Interest::FullRegistry => true,
            Interest::Empty => false,
            Interest::Instance(p) => p.matches(Some(info.id())),
            Interest::Application(p) => p.matches(Some(info.app())),
            Interest::Group(p) => p.matches(info.app_group()),
            Interest::Vip(p) => p.matches(info.vip_address()),
            Interest::Multiple(m) => m.matches(info),
        }
    }

    /// Atomic members of this interest (itself unless it is a union)
    pub fn atoms(&self) -> Vec<&Interest> {
        match self {
            Interest::Empty => Vec::new(),
            Interest::Multiple(m) => m.members.iter().collect(),
            other => vec![other],
        }
    }

    #[inline]
    pub fn is_atomic(&self) -> bool {
        !matches!(self, Interest::Multiple(_) | Interest::Empty)
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::FullRegistry => f.write_str("full"),
            Interest::Empty => f.write_str("empty"),
            Interest::Instance(p) => write!(f, "instance{}", p),
            Interest::Application(p) => write!(f, "app{}", p),
            Interest::Group(p) => write!(f, "group{}", p),
            Interest::Vip(p) => write!(f, "vip{}", p),
            Interest::Multiple(m) => {
                f.write_str("[")?;
                for (i, member) in m.members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", member)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Flat union of atomic interests
///
/// Nested unions are collapsed on construction, `Empty` members are dropped
/// and duplicates removed, so `members()` only ever holds atomic interests.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct MultipleInterests {
    members: Vec<Interest>,
}

impl MultipleInterests {
    pub fn new(interests: impl IntoIterator<Item = Interest>) -> Self {
        let mut multiple = MultipleInterests::default();
        for interest in interests {
            multiple.push(interest);
        }
        multiple
    }

    fn push(&mut self, interest: Interest) {
        match interest {
            Interest::Empty => {}
            Interest::Multiple(nested) => {
                for member in nested.members {
                    self.push(member);
                }
            }
            atomic => {
                if !self.members.contains(&atomic) {
                    self.members.push(atomic);
                }
            }
        }
    }

    pub fn members(&self) -> &[Interest] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn matches(&self, info: &InstanceInfo) -> bool {
        self.members.iter().any(|m| m.matches(info))
    }

    /// New union with `interest` added
    pub fn copy_and_append(&self, interest: Interest) -> MultipleInterests {
        let mut copy = self.clone();
        copy.push(interest);
        copy
    }

    /// New union without the atomic members of `interest`
    pub fn copy_and_remove(&self, interest: &Interest) -> MultipleInterests {
        let removed = interest.atoms();
        MultipleInterests {
            members: self
                .members
                .iter()
                .filter(|m| !removed.contains(m))
                .cloned()
                .collect(),
        }
    }

    /// Normalise into the simplest equivalent interest
    pub fn into_interest(self) -> Interest {
        if self.members.contains(&Interest::FullRegistry) {
            return Interest::FullRegistry;
        }
        match self.members.len() {
            0 => Interest::Empty,
            1 => self.members.into_iter().next().unwrap_or(Interest::Empty),
            _ => Interest::Multiple(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn instance(id: &str, app: &str) -> InstanceInfo {
        InstanceInfo::builder(id)
            .app(app)
            .app_group("grp")
            .build()
            .unwrap()
    }

    #[test]
    fn test_equals_and_like() {
        let info = instance("i-42", "billing");

        assert!(Interest::for_instance("i-42").matches(&info));
        assert!(!Interest::for_instance("i-4").matches(&info));
        assert!(Interest::for_application_like("bill.*").unwrap().matches(&info));
        // anchored: a substring match is not enough
        assert!(!Interest::for_application_like("ill").unwrap().matches(&info));
        assert!(Interest::for_group("grp").matches(&info));
        assert!(!Interest::for_vip("any").matches(&info));
    }

    #[test]
    fn test_invalid_like_pattern() {
        let err = Interest::for_instance_like("(").unwrap_err();
        assert!(matches!(err, BeaconError::InvalidPattern { .. }));
    }

    #[test]
    fn test_union_flattening() {
        let inner = Interest::for_some([Interest::for_application("a"), Interest::for_application("b")]);
        let outer = Interest::for_some([inner, Interest::for_application("a"), Interest::Empty]);

        match &outer {
            Interest::Multiple(m) => {
                assert_eq!(m.len(), 2);
                assert!(m.members().iter().all(Interest::is_atomic));
            }
            other => panic!("expected union, got {other}"),
        }
    }

    #[test]
    fn test_union_normalisation() {
        assert_eq!(Interest::for_some(Vec::new()), Interest::Empty);
        assert_eq!(
            Interest::for_some([Interest::for_instance("x")]),
            Interest::for_instance("x")
        );
        assert_eq!(
            Interest::for_some([Interest::for_instance("x"), Interest::FullRegistry]),
            Interest::FullRegistry
        );
    }

    #[test]
    fn test_copy_and_remove() {
        let m = MultipleInterests::new([Interest::for_application("a"), Interest::for_application("b")]);
        let m = m.copy_and_append(Interest::for_group("g"));
        assert_eq!(m.len(), 3);
        let m = m.copy_and_remove(&Interest::for_application("a"));
        assert_eq!(
            m.members(),
            &[Interest::for_application("b"), Interest::for_group("g")]
        );
    }

    proptest! {
        #[test]
        fn test_union_matches_any_member(
            id in "[a-c]{1,2}",
            app in "[a-c]{1,2}",
            wanted_id in "[a-c]{1,2}",
            wanted_app in "[a-c]{1,2}",
        ) {
            let info = instance(&id, &app);
            let by_id = Interest::for_instance(wanted_id.clone());
            let by_app = Interest::for_application(wanted_app.clone());
            let union = Interest::for_some([by_id.clone(), by_app.clone()]);

            prop_assert_eq!(
                union.matches(&info),
                by_id.matches(&info) || by_app.matches(&info)
            );
        }
    }
}
