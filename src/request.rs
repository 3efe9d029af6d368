//! Ingress request schema and validation (§4.1 of the design doc).

use serde::Deserialize;

use crate::error::RequestError;
use crate::target::Target;
use crate::wire;

/// `to` may be a single URL string or a non-empty array of them.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ToField {
    One(String),
    Many(Vec<String>),
}

/// One ingress request object: `{"to": ..., "privmsg": "..."}`.
///
/// Unknown keys are a hard parse error (`deny_unknown_fields`) so a
/// producer that drifts from this schema is caught immediately instead of
/// silently losing a field.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub to: ToField,
    pub privmsg: String,
}

impl Request {
    /// Parse and validate every URL in `to`, in order.
    pub fn targets(&self) -> Result<Vec<Target>, RequestError> {
        let raw: Vec<&str> = match &self.to {
            ToField::One(s) => vec![s.as_str()],
            ToField::Many(v) => {
                if v.is_empty() {
                    return Err(RequestError::EmptyTargetList);
                }
                v.iter().map(String::as_str).collect()
            }
        };
        raw.into_iter()
            .map(|s| s.parse::<Target>().map_err(RequestError::from))
            .collect()
    }
}

/// Turn a (possibly multi-line) `privmsg` body into the ordered sequence of
/// raw `PRIVMSG` payload lines that should be enqueued on `channel`'s
/// session: one per `\n`-separated line, further split wherever a single
/// line would exceed IRC's framing limit.
pub fn expand_privmsg(privmsg: &str, channel: &str) -> Vec<String> {
    privmsg
        .split('\n')
        .flat_map(|line| wire::split_for_privmsg(channel, line, wire::MAX_LINE_LEN))
        .collect()
}
