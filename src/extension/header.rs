//! `Sec-WebSocket-Extensions` element syntax: `name[;p1=v1;p2;p3=v3]`.

use std::fmt;
use std::str::FromStr;

use crate::error::ExtensionError;

/// One extension with its parameters, in header order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionHeader {
    pub name: String,
    pub parameters: Vec<(String, Option<String>)>,
}

impl ExtensionHeader {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.parameters
            .push((key.into(), value.map(str::to_string)));
        self
    }

    /// Value of the first parameter named `key`. `Some(None)` for a bare flag.
    pub fn parameter(&self, key: &str) -> Option<Option<&str>> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_deref())
    }

    pub fn has_parameter(&self, key: &str) -> bool {
        self.parameter(key).is_some()
    }

    /// Split a comma-separated header value into its extensions.
    pub fn parse_list(value: &str) -> Result<Vec<Self>, ExtensionError> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

impl FromStr for ExtensionHeader {
    type Err = ExtensionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ExtensionError::InvalidHeader(s.to_string());
        let mut parts = s.split(';').map(str::trim);
        let name = parts.next().filter(|n| is_token(n)).ok_or_else(invalid)?;
        let mut header = ExtensionHeader::new(name);
        for part in parts {
            if part.is_empty() {
                continue;
            }
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => {
                    let v = v.trim();
                    let v = v
                        .strip_prefix('"')
                        .and_then(|v| v.strip_suffix('"'))
                        .unwrap_or(v);
                    (k.trim(), Some(v.to_string()))
                }
                None => (part, None),
            };
            if !is_token(key) {
                return Err(invalid());
            }
            header.parameters.push((key.to_string(), value));
        }
        Ok(header)
    }
}

impl fmt::Display for ExtensionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.parameters {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        Ok(())
    }
}
