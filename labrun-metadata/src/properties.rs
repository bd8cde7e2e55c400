//! `PropertyBag`: the append-or-overwrite key/value store described in spec
//! §3 for `TestExecutionUnit.properties`. Backed by `indexmap` rather than
//! `HashMap` so that iteration (and therefore any logging/debug output)
//! stays in insertion order, the same tradeoff the teacher makes when it
//! reaches for `indexmap` over config maps that must preserve source order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PropertyBag {
    values: IndexMap<String, Vec<String>>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites any existing values for `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), vec![value.into()]);
    }

    /// Appends a value to `key`, preserving any values already present.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .entry(key.into())
            .or_default()
            .push(value.into());
    }

    /// Returns the first value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key)?.first().map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.values.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Copies a whitelisted subset of keys from `self` into a fresh bag, as
    /// used by the retry engine (spec §4.I step 6: "inherits a whitelisted
    /// subset of properties").
    pub fn inherit_subset(&self, keys: &[&str]) -> PropertyBag {
        let mut out = PropertyBag::new();
        for key in keys {
            if let Some(values) = self.values.get(*key) {
                out.values.insert((*key).to_string(), values.clone());
            }
        }
        out
    }

    pub fn merge_from(&mut self, other: &PropertyBag) {
        for (key, values) in &other.values {
            self.values.insert(key.clone(), values.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_append_accumulates() {
        let mut bag = PropertyBag::new();
        bag.append("k", "a");
        bag.append("k", "b");
        assert_eq!(bag.get_all("k"), &["a".to_string(), "b".to_string()]);

        bag.set("k", "c");
        assert_eq!(bag.get_all("k"), &["c".to_string()]);
    }

    #[test]
    fn inherit_subset_only_copies_named_keys() {
        let mut bag = PropertyBag::new();
        bag.set("REPEAT_INDEX", "1");
        bag.set("SOMETHING_ELSE", "x");

        let inherited = bag.inherit_subset(&["REPEAT_INDEX", "_DRAIN_TIMEOUT_RETRY_ATTEMPTS"]);
        assert_eq!(inherited.get("REPEAT_INDEX"), Some("1"));
        assert!(!inherited.contains_key("SOMETHING_ELSE"));
        assert!(!inherited.contains_key("_DRAIN_TIMEOUT_RETRY_ATTEMPTS"));
    }
}
