//! Session parameters: ICE servers and media/session constraints.
//!
//! Resolved once when a signaling client connects and shared read-only with
//! the session engine afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable holding a JSON array of [`IceServer`]s.
pub const ICE_SERVERS_ENV: &str = "DUET_ICE_SERVERS";

/// Public STUN server used when nothing else is configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

const ICE_URL_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

/// A STUN or TURN server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// A single key/value media constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub key: String,
    pub value: String,
}

impl Constraint {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Mandatory and optional media/session constraints handed to the engine
/// when it creates offers and answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(default)]
    pub mandatory: Vec<Constraint>,
    #[serde(default)]
    pub optional: Vec<Constraint>,
}

impl MediaConstraints {
    /// Data-only sessions: no audio or video is requested.
    pub fn data_only() -> Self {
        Self {
            mandatory: Vec::new(),
            optional: vec![
                Constraint::new("OfferToReceiveAudio", "false"),
                Constraint::new("OfferToReceiveVideo", "false"),
                Constraint::new("DtlsSrtpKeyAgreement", "true"),
                Constraint::new("RtpDataChannels", "true"),
            ],
        }
    }

    /// Looks a key up, mandatory entries first.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.mandatory
            .iter()
            .chain(self.optional.iter())
            .find(|c| c.key == key)
            .map(|c| c.value.as_str())
    }

    /// Interprets a constraint as a boolean (`"true"`, case-insensitive).
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).map(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// ICE servers plus media constraints for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParameters {
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "MediaConstraints::data_only")]
    pub constraints: MediaConstraints,
}

impl SessionParameters {
    pub fn new(ice_servers: Vec<IceServer>, constraints: MediaConstraints) -> Result<Self> {
        let params = Self {
            ice_servers,
            constraints,
        };
        params.validate()?;
        Ok(params)
    }

    /// Built-in parameters: a public STUN server and data-only constraints.
    ///
    /// No TURN relay is built in; supply one through [`ICE_SERVERS_ENV`] or a
    /// config file when peers sit behind symmetric NATs.
    pub fn well_known() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            constraints: MediaConstraints::data_only(),
        }
    }

    /// Parse either a full parameters object or a bare ICE server array.
    pub fn from_json(text: &str) -> Result<Self> {
        let trimmed = text.trim_start();
        let params = if trimmed.starts_with('[') {
            let ice_servers: Vec<IceServer> = serde_json::from_str(text)
                .map_err(|e| Error::config(format!("invalid ICE server list: {e}")))?;
            Self {
                ice_servers,
                constraints: MediaConstraints::data_only(),
            }
        } else {
            serde_json::from_str(text)
                .map_err(|e| Error::config(format!("invalid session parameters: {e}")))?
        };
        params.validate()?;
        Ok(params)
    }

    /// Load parameters from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        debug!("loaded session parameters from {}", path.display());
        Self::from_json(&text)
    }

    /// Parameters from `DUET_ICE_SERVERS`, or [`SessionParameters::well_known`]
    /// when the variable is unset or blank.
    pub fn from_env() -> Result<Self> {
        match std::env::var(ICE_SERVERS_ENV) {
            Ok(value) if !value.trim().is_empty() => Self::from_json(&value),
            Ok(_) | Err(std::env::VarError::NotPresent) => Ok(Self::well_known()),
            Err(e) => Err(Error::config(format!("failed to read {ICE_SERVERS_ENV}: {e}"))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ice_servers.is_empty() {
            return Err(Error::config("at least one ICE server is required"));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::config("ICE server entry has no urls"));
            }
            for url in &server.urls {
                let lower = url.trim().to_ascii_lowercase();
                if !ICE_URL_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
                    return Err(Error::config(format!("unsupported ICE server url `{url}`")));
                }
            }
        }
        Ok(())
    }
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self::well_known()
    }
}
