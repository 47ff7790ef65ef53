use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::NegotiationError;

/// In-flight requests for long-polling when the strategy does not say.
pub const DEFAULT_LONG_POLLING_REQUESTS: u32 = 2;

static POLLING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^polling;interval=(\d+)s$").expect("valid polling regex"));
static LONG_POLLING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^long-polling;interval=(\d+)s(?:;requests=(\d+))?$").expect("valid long-polling regex")
});
static STREAMING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^streaming;request=chunked$").expect("valid streaming regex"));

/// How bytes move between client and a BBOSH instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BboshStrategy {
    /// One request per exchange; the client waits `interval` after an empty poll.
    Polling { interval: Duration },
    /// The server holds each request up to `interval`; `requests` may be outstanding.
    LongPolling { interval: Duration, requests: u32 },
    /// One chunked upload and one chunked download for the session lifetime.
    Streaming,
}

impl BboshStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Polling { .. } => "polling",
            Self::LongPolling { .. } => "long-polling",
            Self::Streaming => "streaming",
        }
    }

    /// Round trips that may be in flight at once.
    pub fn requests(&self) -> u32 {
        match self {
            Self::LongPolling { requests, .. } => *requests,
            _ => 1,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            Self::Polling { interval } | Self::LongPolling { interval, .. } => Some(*interval),
            Self::Streaming => None,
        }
    }
}

fn seconds(value: &str, raw: &str) -> Result<Duration, NegotiationError> {
    value
        .parse()
        .map(Duration::from_secs)
        .map_err(|_| NegotiationError::UnknownStrategy(raw.to_string()))
}

impl FromStr for BboshStrategy {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if let Some(caps) = POLLING.captures(raw) {
            return Ok(Self::Polling {
                interval: seconds(&caps[1], raw)?,
            });
        }
        if let Some(caps) = LONG_POLLING.captures(raw) {
            let requests = match caps.get(2) {
                Some(m) => m
                    .as_str()
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| NegotiationError::UnknownStrategy(raw.to_string()))?,
                None => DEFAULT_LONG_POLLING_REQUESTS,
            };
            return Ok(Self::LongPolling {
                interval: seconds(&caps[1], raw)?,
                requests,
            });
        }
        if STREAMING.is_match(raw) {
            return Ok(Self::Streaming);
        }
        Err(NegotiationError::UnknownStrategy(raw.to_string()))
    }
}

impl fmt::Display for BboshStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polling { interval } => write!(f, "polling;interval={}s", interval.as_secs()),
            Self::LongPolling { interval, requests } => {
                write!(f, "long-polling;interval={}s", interval.as_secs())?;
                if *requests != DEFAULT_LONG_POLLING_REQUESTS {
                    write!(f, ";requests={}", requests)?;
                }
                Ok(())
            }
            Self::Streaming => f.write_str("streaming;request=chunked"),
        }
    }
}
