use crate::ProtocolError;
use std::fmt::Display;

/// A slash-delimited capability token:
/// `<scheme>//<host>:<port>/<key>/<wrm-key>/<code>`.
///
/// The original string is kept so the token can be re-emitted verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    raw: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub key: String,
    pub wrm_key: String,
    pub code: String,
}

impl Capability {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::Malformed(format!("malformed capability string: {raw}"));

        let parts: Vec<&str> = raw.split('/').collect();
        if parts.len() < 6 || !parts[1].is_empty() {
            return Err(malformed());
        }

        let scheme = parts[0].trim_end_matches(':').to_string();
        let (host, port) = parts[2].split_once(':').ok_or_else(malformed)?;
        let port: u16 = port.parse().map_err(|_| malformed())?;

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            host: host.to_string(),
            port,
            key: parts[3].to_string(),
            wrm_key: parts[4].to_string(),
            code: parts[5].to_string(),
        })
    }

    /// Builds a fresh token in the canonical slash form.
    pub fn build(scheme: &str, authority: &str, key: &str, wrm_key: &str, code: &str) -> String {
        format!("{scheme}://{authority}/{key}/{wrm_key}/{code}")
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
