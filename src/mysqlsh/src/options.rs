// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt;

/// The value of a single administration option.
///
/// MySQL Shell's options are Python values. Only booleans and strings are
/// ever needed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Str(String),
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

/// Strings spelling `true` or `false`, in any case, become booleans.
impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("true") {
            OptionValue::Bool(true)
        } else if s.eq_ignore_ascii_case("false") {
            OptionValue::Bool(false)
        } else {
            OptionValue::Str(s.to_owned())
        }
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        match OptionValue::from(s.as_str()) {
            OptionValue::Str(_) => OptionValue::Str(s),
            b => b,
        }
    }
}

/// Renders the value as a Python literal. Strings are single quoted without
/// escaping, so they must not themselves contain a single quote.
impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OptionValue::Bool(true) => f.write_str("True"),
            OptionValue::Bool(false) => f.write_str("False"),
            OptionValue::Str(s) => write!(f, "'{}'", s),
        }
    }
}

/// The options passed to an individual administration command, rendered as
/// a Python dictionary literal by [`fmt::Display`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options(BTreeMap<String, OptionValue>);

impl Options {
    pub fn new() -> Self {
        Options::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K, V> FromIterator<(K, V)> for Options
where
    K: Into<String>,
    V: Into<OptionValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Options(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{}': {}", key, value)?;
        }
        f.write_str("}")
    }
}
