//! Multi-value header bridge and its iterator
//!
//! [`HeaderBridge`] aliases the live header store of a request or response, so
//! a script that sets a header through it changes what the transport sends.
//! Cloning a bridge clones the alias; [`HeaderBridge::copy`] is the only way to
//! get an independent map.

use crate::error::{HostError, Result};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Header store shared between a bridge and the transport that owns it
pub type SharedHeaders = Arc<Mutex<HeaderMap>>;

/// Case-insensitive, ordered key to multi-value mapping exposed to scripts
#[derive(Clone)]
pub struct HeaderBridge {
    store: SharedHeaders,
}

impl HeaderBridge {
    /// Wrap a live header store without copying it
    pub fn new(store: SharedHeaders) -> Self {
        Self { store }
    }

    /// Create a bridge that owns `map`
    pub fn from_map(map: HeaderMap) -> Self {
        Self::new(Arc::new(Mutex::new(map)))
    }

    /// The underlying store
    pub fn store(&self) -> &SharedHeaders {
        &self.store
    }

    /// Snapshot of the current contents
    pub fn to_map(&self) -> HeaderMap {
        self.store.lock().clone()
    }

    /// First value for `key`, or an empty string when the key is absent
    pub fn get(&self, key: &str) -> String {
        self.store
            .lock()
            .get(key)
            .map(value_to_string)
            .unwrap_or_default()
    }

    /// All values for `key`, in order
    pub fn get_all(&self, key: &str) -> Vec<String> {
        self.store
            .lock()
            .get_all(key)
            .iter()
            .map(value_to_string)
            .collect()
    }

    /// Replace every value of `key` with `value`
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.insert_value(key, value, false)?)
    }

    /// Append `value` to the values of `key`
    pub fn add(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.insert_value(key, value, true)?)
    }

    pub(crate) fn insert_value(
        &self,
        key: &str,
        value: &str,
        append: bool,
    ) -> std::result::Result<(), HostError> {
        let (name, value) = parse_pair(key, value)?;
        let mut map = self.store.lock();
        if append {
            map.append(name, value);
        } else {
            map.insert(name, value);
        }
        Ok(())
    }

    /// Remove `key` entirely; no-op if absent
    pub fn delete(&self, key: &str) {
        self.store.lock().remove(key);
    }

    /// Whether `key` has at least one value
    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().contains_key(key)
    }

    /// Distinct keys, normalized to lowercase
    pub fn keys(&self) -> Vec<String> {
        self.store
            .lock()
            .keys()
            .map(|name| name.as_str().to_owned())
            .collect()
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.store.lock().keys_len()
    }

    /// True when no key is present
    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Independent deep copy sharing no state with `self`
    pub fn copy(&self) -> Self {
        Self::from_map(self.to_map())
    }

    /// Structural equality: same keys and identical ordered values per key
    pub fn equals(&self, other: &HeaderBridge) -> bool {
        if Arc::ptr_eq(&self.store, &other.store) {
            return true;
        }
        let theirs = other.to_map();
        *self.store.lock() == theirs
    }

    /// Iterator over a snapshot of the current keys
    pub fn iter(&self) -> HeaderIterator {
        HeaderIterator::new(Arc::clone(&self.store))
    }
}

impl PartialEq for HeaderBridge {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl fmt::Display for HeaderBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.store.lock();
        let pairs: Vec<String> = map
            .keys()
            .map(|name| {
                let values: Vec<String> = map.get_all(name).iter().map(value_to_string).collect();
                format!("{}: {:?}", name, values)
            })
            .collect();
        write!(f, "header{{{}}}", pairs.join(", "))
    }
}

impl fmt::Debug for HeaderBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl IntoIterator for HeaderBridge {
    type Item = HeaderEntry;
    type IntoIter = HeaderIterator;

    fn into_iter(self) -> Self::IntoIter {
        HeaderIterator::new(self.store)
    }
}

impl IntoIterator for &HeaderBridge {
    type Item = HeaderEntry;
    type IntoIter = HeaderIterator;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A (key, value) pair surfaced while iterating a bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    /// Lowercase header name
    pub key: String,
    /// All values of the key joined with `", "`
    pub value: String,
}

/// Single-pass cursor over the keys a bridge held when the cursor was created
///
/// Keys are snapshotted up front; values are read from the live store at each
/// step, so a value changed mid-iteration is observed but a key added
/// mid-iteration is not.
pub struct HeaderIterator {
    store: SharedHeaders,
    keys: Vec<HeaderName>,
    pos: usize,
    len: usize,
    on_element: bool,
}

impl HeaderIterator {
    fn new(store: SharedHeaders) -> Self {
        let keys: Vec<HeaderName> = store.lock().keys().cloned().collect();
        let len = keys.len();
        Self {
            store,
            keys,
            pos: 0,
            len,
            on_element: false,
        }
    }

    /// Move to the next key; returns whether a current element now exists
    pub fn advance(&mut self) -> bool {
        self.on_element = self.pos < self.len;
        if self.on_element {
            self.pos += 1;
        }
        self.on_element
    }

    /// Key at the cursor
    ///
    /// # Panics
    ///
    /// Panics unless the last call to [`advance`](Self::advance) returned `true`.
    pub fn current_key(&self) -> &HeaderName {
        assert!(self.on_element, "header iterator read outside of an element");
        &self.keys[self.pos - 1]
    }

    /// Values of the key at the cursor, read live and joined with `", "`
    ///
    /// # Panics
    ///
    /// Panics unless the last call to [`advance`](Self::advance) returned `true`.
    pub fn current_value(&self) -> String {
        let key = self.current_key();
        let map = self.store.lock();
        let values: Vec<String> = map.get_all(key).iter().map(value_to_string).collect();
        values.join(", ")
    }
}

impl Iterator for HeaderIterator {
    type Item = HeaderEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.advance() {
            return None;
        }
        Some(HeaderEntry {
            key: self.current_key().as_str().to_owned(),
            value: self.current_value(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.pos;
        (remaining, Some(remaining))
    }
}

impl fmt::Debug for HeaderIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderIterator")
            .field("keys", &self.keys)
            .field("pos", &self.pos)
            .finish()
    }
}

fn value_to_string(value: &HeaderValue) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

fn parse_pair(
    key: &str,
    value: &str,
) -> std::result::Result<(HeaderName, HeaderValue), HostError> {
    let name = HeaderName::from_bytes(key.as_bytes())
        .map_err(|_| HostError::invalid("index", format!("'{}' is not a valid header name", key)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| HostError::invalid("value", "header values may not contain control characters"))?;
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptError;

    fn bridge(pairs: &[(&str, &str)]) -> HeaderBridge {
        let bridge = HeaderBridge::from_map(HeaderMap::new());
        for (k, v) in pairs {
            bridge.add(k, v).unwrap();
        }
        bridge
    }

    #[test]
    fn test_case_insensitive_get_set() {
        let h = bridge(&[]);
        h.set("Content-Type", "text/plain").unwrap();

        assert_eq!(h.get("content-type"), "text/plain");
        assert_eq!(h.get("CONTENT-TYPE"), "text/plain");

        h.set("CONTENT-type", "application/json").unwrap();
        assert_eq!(h.get("Content-Type"), "application/json");
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_absent_key_reads_empty() {
        let h = bridge(&[("x-present", "1")]);
        assert_eq!(h.get("x-missing"), "");
        assert_eq!(h.get("not a header name"), "");
        assert!(h.get_all("x-missing").is_empty());
    }

    #[test]
    fn test_set_replaces_all_values() {
        let h = bridge(&[("accept", "a"), ("accept", "b")]);
        assert_eq!(h.get_all("Accept"), vec!["a", "b"]);

        h.set("accept", "c").unwrap();
        assert_eq!(h.get_all("accept"), vec!["c"]);
    }

    #[test]
    fn test_delete_removes_key() {
        let h = bridge(&[("x-a", "1"), ("x-a", "2"), ("x-b", "3")]);
        h.delete("X-A");

        assert_eq!(h.get("x-a"), "");
        assert!(!h.contains("x-a"));
        assert_eq!(h.keys(), vec!["x-b"]);

        h.delete("x-never-there");
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_invalid_name_and_value_rejected() {
        let h = bridge(&[]);
        assert!(matches!(
            h.set("bad name", "v"),
            Err(ScriptError::InvalidArgument { name, .. }) if name == "index"
        ));
        assert!(matches!(
            h.set("x-ok", "line\nbreak"),
            Err(ScriptError::InvalidArgument { name, .. }) if name == "value"
        ));
        assert!(h.is_empty());
    }

    #[test]
    fn test_copy_is_independent() {
        let original = bridge(&[("x-a", "1")]);
        let copy = original.copy();

        copy.set("x-a", "2").unwrap();
        copy.set("x-b", "3").unwrap();
        assert_eq!(original.get("x-a"), "1");
        assert!(!original.contains("x-b"));

        original.delete("x-a");
        assert_eq!(copy.get("x-a"), "2");
    }

    #[test]
    fn test_clone_aliases_store() {
        let original = bridge(&[]);
        let alias = original.clone();
        alias.set("x-a", "1").unwrap();
        assert_eq!(original.get("x-a"), "1");
    }

    #[test]
    fn test_equality() {
        let a = bridge(&[("x-a", "1"), ("x-b", "2"), ("x-b", "3")]);
        let b = bridge(&[("x-b", "2"), ("x-b", "3"), ("x-a", "1")]);
        let reordered_values = bridge(&[("x-a", "1"), ("x-b", "3"), ("x-b", "2")]);

        assert!(a.equals(&a));
        assert!(a.equals(&a.clone()));
        assert!(a.equals(&b));
        assert!(b.equals(&a));
        assert!(!a.equals(&reordered_values));
        assert!(!a.equals(&bridge(&[("x-a", "1")])));
    }

    #[test]
    fn test_empty_predicate() {
        let h = bridge(&[]);
        assert!(h.is_empty());
        h.set("x-a", "1").unwrap();
        assert!(!h.is_empty());
        h.delete("x-a");
        assert!(h.is_empty());
    }

    #[test]
    fn test_display() {
        let h = bridge(&[("x-a", "1"), ("x-a", "2")]);
        assert_eq!(h.to_string(), r#"header{x-a: ["1", "2"]}"#);
        assert_eq!(bridge(&[]).to_string(), "header{}");
    }

    #[test]
    fn test_iteration_yields_each_key_once() {
        let h = bridge(&[("x-a", "1"), ("x-b", "2"), ("x-b", "3"), ("x-c", "4")]);
        let mut entries: Vec<HeaderEntry> = h.iter().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, "x-a");
        assert_eq!(entries[1].value, "2, 3");
        assert_eq!(entries[2].value, "4");
    }

    #[test]
    fn test_iteration_snapshot_keys_live_values() {
        let h = bridge(&[("x-a", "1"), ("x-b", "2")]);
        let mut iter = h.iter();

        h.set("x-new", "ignored").unwrap();
        h.set("x-a", "changed").unwrap();
        h.set("x-b", "changed").unwrap();

        let mut seen = Vec::new();
        while iter.advance() {
            seen.push((iter.current_key().to_string(), iter.current_value()));
        }

        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(k, v)| k != "x-new" && v == "changed"));
        assert!(!iter.advance());
        assert!(!iter.advance());
    }

    #[test]
    fn test_iterator_reads_are_idempotent() {
        let h = bridge(&[("x-a", "1")]);
        let mut iter = h.iter();
        assert!(iter.advance());
        assert_eq!(iter.current_key().as_str(), "x-a");
        assert_eq!(iter.current_key().as_str(), "x-a");
        assert_eq!(iter.current_value(), iter.current_value());
    }

    #[test]
    #[should_panic(expected = "outside of an element")]
    fn test_iterator_read_before_advance_panics() {
        let h = bridge(&[("x-a", "1")]);
        let iter = h.iter();
        let _ = iter.current_key();
    }

    #[test]
    #[should_panic(expected = "outside of an element")]
    fn test_iterator_read_past_end_panics() {
        let h = bridge(&[("x-a", "1")]);
        let mut iter = h.iter();
        while iter.advance() {}
        let _ = iter.current_value();
    }
}
