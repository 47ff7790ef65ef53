use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Which redirects a connection may follow while opening.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedirectPolicy {
    Never,
    Always,
    /// Same scheme, host and port.
    #[default]
    Origin,
    /// Same host; scheme and port may change.
    Domain,
    /// Hosts under the same parent domain, e.g. `a.example.com` to `b.example.com`.
    PeerDomain,
    /// The target host is the current host or one of its subdomains.
    SubDomain,
}

fn host(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase())
}

fn parent_domain(host: &str) -> Option<&str> {
    host.split_once('.').map(|(_, rest)| rest).filter(|rest| rest.contains('.'))
}

impl RedirectPolicy {
    /// Whether a redirect from `current` to `target` is allowed.
    pub fn allows(&self, current: &Url, target: &Url) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Origin => {
                current.scheme() == target.scheme()
                    && host(current) == host(target)
                    && current.port_or_known_default() == target.port_or_known_default()
            }
            Self::Domain | Self::PeerDomain | Self::SubDomain => {
                let (Some(from), Some(to)) = (host(current), host(target)) else {
                    return false;
                };
                if from == to {
                    return true;
                }
                match self {
                    Self::PeerDomain => matches!(
                        (parent_domain(&from), parent_domain(&to)),
                        (Some(a), Some(b)) if a == b
                    ),
                    Self::SubDomain => to.ends_with(&format!(".{}", from)),
                    _ => false,
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "NEVER",
            Self::Always => "ALWAYS",
            Self::Origin => "ORIGIN",
            Self::Domain => "DOMAIN",
            Self::PeerDomain => "PEER_DOMAIN",
            Self::SubDomain => "SUB_DOMAIN",
        }
    }
}

impl FromStr for RedirectPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NEVER" => Ok(Self::Never),
            "ALWAYS" => Ok(Self::Always),
            "ORIGIN" => Ok(Self::Origin),
            "DOMAIN" | "SAME_DOMAIN" => Ok(Self::Domain),
            "PEER_DOMAIN" => Ok(Self::PeerDomain),
            "SUB_DOMAIN" => Ok(Self::SubDomain),
            other => Err(Error::IllegalArgument(format!("unknown redirect policy {}", other))),
        }
    }
}

impl fmt::Display for RedirectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
