//! Tag sets, tag combinations and the combination generator
//!
//! A [`TagSet`] is the canonical, key-sorted set of routing attributes an
//! item carries. A [`TagCombination`] is any non-empty, order-preserving
//! sub-sequence of a tag set; the index holds one node per combination.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Hard ceiling on tags per item; a set of `n` tags fans out into `2^n - 1`
/// index nodes.
pub const MAX_TAGS_LIMIT: usize = 20;

/// Sorted key/value pairs identifying an item's routing attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Create an empty tag set
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a tag (builder pattern). A repeated key keeps the last value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a tag, returning the previous value for the key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the pairs in canonical key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The full combination of this tag set (the exact-match index key)
    pub fn to_combination(&self) -> TagCombination {
        TagCombination(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Every non-empty sub-combination, exact combination last
    pub fn combinations(&self) -> Vec<TagCombination> {
        generate_combinations(&self.to_combination())
    }

    /// True when every pair of `combination` is present in this set
    pub fn contains(&self, combination: &TagCombination) -> bool {
        combination
            .pairs()
            .iter()
            .all(|(k, v)| self.0.get(k) == Some(v))
    }

    /// Reject empty sets and sets above `max_tags`
    pub fn validate(&self, max_tags: usize) -> Result<()> {
        if self.is_empty() {
            return Err(BrokerError::InvalidTags("tag set is empty".to_string()));
        }
        let limit = max_tags.min(MAX_TAGS_LIMIT);
        if self.len() > limit {
            return Err(BrokerError::InvalidTags(format!(
                "{} tags exceeds the limit of {}",
                self.len(),
                limit
            )));
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for TagSet {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<TagCombination> for TagSet {
    fn from(combination: TagCombination) -> Self {
        combination.0.into_iter().collect()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_pairs(f, self.iter())
    }
}

/// A non-empty, key-sorted sub-sequence of a tag set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagCombination(Vec<(String, String)>);

impl TagCombination {
    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&TagSet> for TagCombination {
    fn from(tags: &TagSet) -> Self {
        tags.to_combination()
    }
}

impl fmt::Display for TagCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_pairs(f, self.0.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

fn write_pairs<'a>(
    f: &mut fmt::Formatter<'_>,
    pairs: impl Iterator<Item = (&'a str, &'a str)>,
) -> fmt::Result {
    for (i, (k, v)) in pairs.enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}={}", k, v)?;
    }
    Ok(())
}

/// Generate every non-empty order-preserving sub-combination of `tags`.
///
/// The input is already sorted, so each bitmask over its positions yields
/// a sorted combination. Masks are walked in ascending order, which puts
/// the full combination last. An empty input, or one with more than
/// [`MAX_TAGS_LIMIT`] pairs, yields an empty list; [`TagSet::validate`]
/// rejects such sets before they reach the index.
pub fn generate_combinations(tags: &TagCombination) -> Vec<TagCombination> {
    let pairs = tags.pairs();
    let n = pairs.len();
    if n == 0 || n > MAX_TAGS_LIMIT {
        return Vec::new();
    }

    let total: u64 = (1u64 << n) - 1;
    let mut out = Vec::with_capacity(total as usize);
    for mask in 1..=total {
        let combination = pairs
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1u64 << *i) != 0)
            .map(|(_, pair)| pair.clone())
            .collect();
        out.push(TagCombination(combination));
    }
    out
}

/// How a subscription entry matches tag groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Only the tag group whose full tag set equals the selection
    Exact,
    /// Every tag group whose tag set contains the selection
    Matches,
}

/// One entry of a subscription selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub mode: MatchMode,
    pub tags: TagSet,
}

impl Selector {
    pub fn exact(tags: impl Into<TagSet>) -> Self {
        Self {
            mode: MatchMode::Exact,
            tags: tags.into(),
        }
    }

    pub fn matches(tags: impl Into<TagSet>) -> Self {
        Self {
            mode: MatchMode::Matches,
            tags: tags.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_tag_set_sorted() {
        let tags = TagSet::from([("b", "2"), ("a", "1"), ("c", "3")]);
        let keys: Vec<&str> = tags.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(tags.to_string(), "a=1,b=2,c=3");
    }

    #[test]
    fn test_tag_set_equality_ignores_insert_order() {
        let a = TagSet::new().with("x", "1").with("y", "2");
        let b = TagSet::new().with("y", "2").with("x", "1");
        assert_eq!(a, b);
        assert_eq!(a.to_combination(), b.to_combination());
    }

    #[test]
    fn test_generate_empty() {
        assert!(TagSet::new().combinations().is_empty());
    }

    #[test]
    fn test_generate_above_limit_is_empty() {
        let over: TagSet = (0..=MAX_TAGS_LIMIT)
            .map(|i| (format!("k{:02}", i), "v"))
            .collect();
        assert!(over.combinations().is_empty());

        let wide: TagSet = (0..64).map(|i| (format!("k{:02}", i), "v")).collect();
        assert!(generate_combinations(&wide.to_combination()).is_empty());
        assert!(wide.validate(MAX_TAGS_LIMIT).is_err());
    }

    #[test]
    fn test_generate_three() {
        let tags = TagSet::from([("a", "1"), ("b", "2"), ("c", "3")]);
        let combos = tags.combinations();
        let rendered: Vec<String> = combos.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "a=1",
                "b=2",
                "a=1,b=2",
                "c=3",
                "a=1,c=3",
                "b=2,c=3",
                "a=1,b=2,c=3",
            ]
        );
        assert_eq!(combos.last(), Some(&tags.to_combination()));
    }

    #[test]
    fn test_contains() {
        let tags = TagSet::from([("a", "1"), ("b", "2")]);
        assert!(tags.contains(&TagSet::from([("a", "1")]).to_combination()));
        assert!(!tags.contains(&TagSet::from([("a", "2")]).to_combination()));
        assert!(!tags.contains(&TagSet::from([("c", "1")]).to_combination()));
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            TagSet::new().validate(16),
            Err(BrokerError::InvalidTags(_))
        ));
        let tags = TagSet::from([("a", "1"), ("b", "2"), ("c", "3")]);
        assert!(tags.validate(3).is_ok());
        assert!(tags.validate(2).is_err());
    }

    #[test]
    fn test_selector_serialization() {
        let selector = Selector::matches([("region", "eu")]);
        let json = serde_json::to_string(&selector).unwrap();
        assert_eq!(json, r#"{"mode":"matches","tags":{"region":"eu"}}"#);
        let parsed: Selector = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, selector);
    }

    proptest! {
        #[test]
        fn prop_combination_count(keys in proptest::collection::btree_set("[a-z]{1,4}", 0..8)) {
            let tags: TagSet = keys.iter().map(|k| (k.clone(), format!("v-{}", k))).collect();
            let combos = tags.combinations();
            let n = tags.len();
            prop_assert_eq!(combos.len(), (1usize << n) - 1);

            let unique: HashSet<&TagCombination> = combos.iter().collect();
            prop_assert_eq!(unique.len(), combos.len());

            for combo in &combos {
                prop_assert!(!combo.is_empty());
                prop_assert!(combo.pairs().windows(2).all(|w| w[0].0 < w[1].0));
                prop_assert!(tags.contains(combo));
            }
        }
    }
}
