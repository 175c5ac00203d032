//! Ordered attribute set of one start tag.
//!
//! Values are stored exactly as they appeared in the input (still escaped),
//! so untouched attributes are written back byte for byte.

use std::borrow::Cow;

use quick_xml::escape::{escape, unescape};
use quick_xml::events::attributes::AttrError;
use quick_xml::events::BytesStart;

/// Why a start tag could not be read into an [`AttrSet`].
#[derive(Debug)]
pub(crate) enum AttrSetError {
    Syntax(AttrError),
    Utf8(std::str::Utf8Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AttrSet {
    entries: Vec<(String, String)>,
}

impl AttrSet {
    /// Read the attributes of `start`, keeping the last of duplicate names.
    pub(crate) fn from_start(start: &BytesStart<'_>) -> Result<Self, AttrSetError> {
        let mut set = AttrSet::default();
        let mut attributes = start.attributes();
        attributes.with_checks(false);
        for attr in attributes {
            let attr = attr.map_err(AttrSetError::Syntax)?;
            let key = std::str::from_utf8(attr.key.as_ref()).map_err(AttrSetError::Utf8)?;
            let value = std::str::from_utf8(&attr.value).map_err(AttrSetError::Utf8)?;
            set.remove(key);
            set.entries.push((key.to_string(), value.to_string()));
        }
        Ok(set)
    }

    /// Unescaped value of `key`.
    pub(crate) fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        self.raw(key)
            .map(|raw| unescape(raw).unwrap_or(Cow::Borrowed(raw)))
    }

    pub(crate) fn raw(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Whether `key` is present with exactly `value`.
    pub(crate) fn is(&self, key: &str, value: &str) -> bool {
        self.get(key).is_some_and(|v| v == value)
    }

    /// Set `key` to the unescaped `value`.
    pub(crate) fn set(&mut self, key: &str, value: &str) {
        self.set_raw(key, escape_value(value));
    }

    /// Set `key` only if its current value differs, keeping the raw form otherwise.
    pub(crate) fn update(&mut self, key: &str, value: &str) {
        if !self.is(key, value) {
            self.set(key, value);
        }
    }

    /// Replace in place, or append, with an already escaped `value`.
    pub(crate) fn set_raw(&mut self, key: &str, value: String) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub(crate) fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|(k, _)| keep(k));
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Keys and unescaped values, in order.
    pub(crate) fn values(&self) -> impl Iterator<Item = (&str, Cow<'_, str>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), unescape(v).unwrap_or(Cow::Borrowed(v.as_str()))))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Build a start tag named `name` carrying these attributes.
    pub(crate) fn to_start(&self, name: &str) -> BytesStart<'static> {
        let mut start = BytesStart::new(name.to_string());
        for (key, value) in self.iter() {
            start.push_attribute((key.as_bytes(), value.as_bytes()));
        }
        start
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for AttrSet {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut set = AttrSet::default();
        for (key, value) in iter {
            set.set(key, value);
        }
        set
    }
}

/// Escape an attribute value, encoding whitespace that XML would normalize.
pub(crate) fn escape_value(value: &str) -> String {
    let escaped = escape(value);
    let mut out = String::with_capacity(escaped.len());
    for c in escaped.chars() {
        match c {
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            c => out.push(c),
        }
    }
    out
}
