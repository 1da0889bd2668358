//! Selectors and selector sets.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SelectorError;

/// One attestation condition, e.g. `k8s:ns:default`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Selector {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: kind.into(), value: value.into() }
    }

    fn check(&self) -> Result<(), SelectorError> {
        if self.kind.is_empty() {
            return Err(SelectorError::EmptySelectorType);
        }
        if self.kind.contains(':') || self.kind.chars().any(char::is_whitespace) {
            return Err(SelectorError::InvalidSelectorType(self.kind.clone()));
        }
        if self.value.is_empty() {
            return Err(SelectorError::EmptySelectorValue(self.kind.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.kind, self.value) }
}

/// Normalized selectors of one entry. Membership, not order, defines
/// equality, so `==` is the drift comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SelectorSet(BTreeSet<Selector>);

impl SelectorSet {
    /// Validate every selector and reject duplicate (type, value) pairs.
    pub fn normalize<I>(selectors: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = Selector>,
    {
        Self::normalize_indexed(selectors).map_err(|(_, e)| e)
    }

    /// Index-aware variant of [`SelectorSet::normalize`]: on failure also
    /// reports the position of the offending selector.
    pub(crate) fn normalize_indexed<I>(selectors: I) -> Result<Self, (usize, SelectorError)>
    where
        I: IntoIterator<Item = Selector>,
    {
        let mut set = BTreeSet::new();
        for (i, sel) in selectors.into_iter().enumerate() {
            sel.check().map_err(|e| (i, e))?;
            if set.contains(&sel) {
                return Err((i, SelectorError::DuplicateSelector { kind: sel.kind, value: sel.value }));
            }
            set.insert(sel);
        }
        Ok(Self(set))
    }

    pub fn equals(&self, other: &SelectorSet) -> bool { self == other }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn contains(&self, sel: &Selector) -> bool { self.0.contains(sel) }

    /// Sorted iteration, stable across runs.
    pub fn iter(&self) -> impl Iterator<Item = &Selector> { self.0.iter() }

    /// Selectors present in `self` but not in `other`.
    pub fn difference<'a>(&'a self, other: &'a SelectorSet) -> impl Iterator<Item = &'a Selector> {
        self.0.difference(&other.0)
    }
}

impl<'a> IntoIterator for &'a SelectorSet {
    type Item = &'a Selector;
    type IntoIter = std::collections::btree_set::Iter<'a, Selector>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

impl<'de> Deserialize<'de> for SelectorSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<Selector>::deserialize(deserializer)?;
        SelectorSet::normalize(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sels(pairs: &[(&str, &str)]) -> Vec<Selector> {
        pairs.iter().map(|(k, v)| Selector::new(*k, *v)).collect()
    }

    #[test]
    fn normalize_rejects_blank_fields() {
        assert_eq!(SelectorSet::normalize(sels(&[("", "x")])), Err(SelectorError::EmptySelectorType));
        assert_eq!(
            SelectorSet::normalize(sels(&[("k8s", "")])),
            Err(SelectorError::EmptySelectorValue("k8s".into()))
        );
        assert!(matches!(
            SelectorSet::normalize(sels(&[("k8s:ns", "default")])),
            Err(SelectorError::InvalidSelectorType(_))
        ));
    }

    #[test]
    fn normalize_rejects_duplicates() {
        let err = SelectorSet::normalize(sels(&[("k8s", "ns:default"), ("unix", "uid:0"), ("k8s", "ns:default")]))
            .unwrap_err();
        assert_eq!(err, SelectorError::DuplicateSelector { kind: "k8s".into(), value: "ns:default".into() });
        let (at, indexed) =
            SelectorSet::normalize_indexed(sels(&[("k8s", "ns:default"), ("unix", "uid:0"), ("k8s", "ns:default")]))
                .unwrap_err();
        assert_eq!((at, indexed), (2, err));
    }

    #[test]
    fn same_value_different_type_is_not_a_duplicate() {
        let set = SelectorSet::normalize(sels(&[("k8s", "x"), ("docker", "x")])).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn difference_lists_added_selectors() {
        let a = SelectorSet::normalize(sels(&[("k8s", "ns:default"), ("k8s", "sa:myapp")])).unwrap();
        let b = SelectorSet::normalize(sels(&[("k8s", "ns:default")])).unwrap();
        let added: Vec<String> = a.difference(&b).map(|s| s.to_string()).collect();
        assert_eq!(added, vec!["k8s:sa:myapp"]);
        assert_eq!(b.difference(&a).count(), 0);
    }

    #[test]
    fn deserialize_normalizes() {
        let set: SelectorSet = serde_json::from_value(serde_json::json!([
            {"type": "k8s", "value": "sa:b"},
            {"type": "k8s", "value": "ns:a"}
        ]))
        .unwrap();
        let order: Vec<String> = set.iter().map(|s| s.to_string()).collect();
        assert_eq!(order, vec!["k8s:ns:a", "k8s:sa:b"]);

        let dup = serde_json::from_value::<SelectorSet>(serde_json::json!([
            {"type": "k8s", "value": "ns:a"},
            {"type": "k8s", "value": "ns:a"}
        ]));
        assert!(dup.is_err());
    }

    fn pairs() -> impl Strategy<Value = Vec<(String, String)>> {
        proptest::collection::btree_set(("[a-z_]{1,6}", "[a-z0-9:]{1,8}"), 1..8)
            .prop_map(|s| s.into_iter().collect::<Vec<_>>())
    }

    proptest! {
        #[test]
        fn equality_ignores_input_order(list in pairs(), seed in any::<u64>()) {
            let forward: Vec<Selector> = list.iter().map(|(k, v)| Selector::new(k, v)).collect();
            let mut shuffled = forward.clone();
            // deterministic rotation + reverse as the permutation
            let n = shuffled.len();
            shuffled.rotate_left((seed as usize) % n);
            if seed % 2 == 0 { shuffled.reverse(); }
            let a = SelectorSet::normalize(forward).unwrap();
            let b = SelectorSet::normalize(shuffled).unwrap();
            prop_assert!(a.equals(&b));
        }

        #[test]
        fn duplicate_always_detected(list in pairs(), pick in any::<prop::sample::Index>(), at in any::<prop::sample::Index>()) {
            let mut items: Vec<Selector> = list.iter().map(|(k, v)| Selector::new(k, v)).collect();
            let dup = items[pick.index(items.len())].clone();
            let pos = at.index(items.len() + 1);
            items.insert(pos, dup.clone());
            let err = SelectorSet::normalize(items).unwrap_err();
            prop_assert_eq!(err, SelectorError::DuplicateSelector { kind: dup.kind, value: dup.value });
        }
    }
}
