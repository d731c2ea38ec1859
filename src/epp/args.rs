//! Query argument parsing and canonical re-serialisation.
//!
//! An internal rewrite drops the original request URI, so the arguments
//! have to be carried over to the continuation path explicitly.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left as-is when serialising, the same unreserved set as
/// `encodeURIComponent`.
const COMPONENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Parsed query arguments.
///
/// Keys keep the order of their first appearance; repeated keys collect
/// all their values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryArgs {
    args: Vec<(String, Vec<String>)>,
}

impl QueryArgs {
    /// Parses a raw query string (without the leading `?`).
    ///
    /// `+` decodes to a space, a key without `=` gets an empty value and
    /// empty segments are skipped.
    pub fn parse(query: Option<&str>) -> Self {
        let mut args = Self::default();
        let Some(query) = query else {
            return args;
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            args.append(decode_component(key), decode_component(value));
        }
        args
    }

    /// Adds a value under `key`, keeping earlier values for the same key.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.args.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.args.push((key, vec![value])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Serialises to `key=value&...`, one pair per value.
    pub fn to_query_string(&self) -> String {
        self.args
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |value| (key, value)))
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(key, COMPONENT_ENCODE_SET),
                    utf8_percent_encode(value, COMPONENT_ENCODE_SET)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Returns `?` followed by the serialised arguments, or an empty
    /// string when there are none.
    pub fn to_suffix(&self) -> String {
        let query = self.to_query_string();
        if query.is_empty() {
            query
        } else {
            format!("?{}", query)
        }
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}
