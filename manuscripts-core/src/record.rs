use std::{collections::HashMap, fmt, net::IpAddr, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PROTOCOL_VERSION;

pub const SERVICE_TYPE: &str = "_manuscripts._tcp.local.";
pub const TXT_NAME: &str = "name";
pub const TXT_VERSION: &str = "version";
pub const TXT_AUTH: &str = "auth";
pub const TXT_MODE: &str = "mode";
const MAX_INSTANCE_LABEL_BYTES: usize = 63;
const FALLBACK_INSTANCE_LABEL: &str = "Receiver";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverMode {
    /// Collects submissions from many senders.
    #[default]
    Receiver,
    /// Peer-to-peer sharing between two writers.
    Share,
}

impl ReceiverMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiverMode::Receiver => "receiver",
            ReceiverMode::Share => "share",
        }
    }
}

impl fmt::Display for ReceiverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiverMode {
    type Err = RecordError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "receiver" => Ok(ReceiverMode::Receiver),
            "share" => Ok(ReceiverMode::Share),
            other => Err(RecordError::UnknownMode(other.to_owned())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record has no protocol version")]
    MissingVersion,
    #[error("record protocol version {0:?} is not a number")]
    InvalidVersion(String),
    #[error("unknown receiver mode {0:?}")]
    UnknownMode(String),
}

/// Advertised discovery metadata for one running receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub protocol_version: u32,
    pub requires_passphrase: bool,
    pub mode: ReceiverMode,
    pub instance_id: String,
}

impl ServiceRecord {
    pub fn new(
        display_name: &str,
        host: &str,
        port: u16,
        requires_passphrase: bool,
        mode: ReceiverMode,
    ) -> Self {
        Self {
            display_name: display_name.to_owned(),
            host: host.to_owned(),
            port,
            protocol_version: PROTOCOL_VERSION,
            requires_passphrase,
            mode,
            instance_id: instance_fullname(&instance_label(display_name)),
        }
    }

    pub fn instance_label(&self) -> String {
        instance_label(&self.display_name)
    }

    pub fn txt_properties(&self) -> HashMap<String, String> {
        HashMap::from([
            (TXT_NAME.to_owned(), self.display_name.clone()),
            (TXT_VERSION.to_owned(), self.protocol_version.to_string()),
            (
                TXT_AUTH.to_owned(),
                if self.requires_passphrase { "1" } else { "0" }.to_owned(),
            ),
            (TXT_MODE.to_owned(), self.mode.as_str().to_owned()),
        ])
    }

    /// Rebuild a record from a resolved announcement.
    ///
    /// A missing `name` falls back to the instance label; a missing `auth`
    /// means no passphrase; a missing `mode` means receiver mode.
    pub fn from_txt(
        instance_id: &str,
        host: &str,
        port: u16,
        properties: &HashMap<String, String>,
    ) -> Result<Self, RecordError> {
        let raw_version = properties
            .get(TXT_VERSION)
            .ok_or(RecordError::MissingVersion)?;
        let protocol_version = raw_version
            .trim()
            .parse::<u32>()
            .map_err(|_| RecordError::InvalidVersion(raw_version.clone()))?;

        let display_name = properties
            .get(TXT_NAME)
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| label_from_fullname(instance_id).to_owned());

        let requires_passphrase = properties
            .get(TXT_AUTH)
            .is_some_and(|value| value.trim() == "1");

        let mode = match properties.get(TXT_MODE) {
            Some(value) => value.parse()?,
            None => ReceiverMode::Receiver,
        };

        Ok(Self {
            display_name,
            host: host.to_owned(),
            port,
            protocol_version,
            requires_passphrase,
            mode,
            instance_id: instance_id.to_owned(),
        })
    }

    /// Records from a newer (or older) protocol generation are unusable, not errors.
    pub fn is_supported(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }

    pub fn submit_url(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("ws://[{}]:{}/submit", v6, self.port),
            _ => format!("ws://{}:{}/submit", self.host, self.port),
        }
    }
}

/// DNS-SD instance label for a display name.
///
/// Dots would split the label, so they become dashes; the label is capped
/// at 63 bytes on a char boundary.
pub fn instance_label(display_name: &str) -> String {
    let cleaned: String = display_name
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '.' { '-' } else { c })
        .collect();

    let mut label = String::with_capacity(MAX_INSTANCE_LABEL_BYTES);
    for c in cleaned.trim().chars() {
        if label.len() + c.len_utf8() > MAX_INSTANCE_LABEL_BYTES {
            break;
        }
        label.push(c);
    }

    let label = label.trim_end().to_owned();
    if label.is_empty() {
        FALLBACK_INSTANCE_LABEL.to_owned()
    } else {
        label
    }
}

pub fn instance_fullname(label: &str) -> String {
    format!("{}.{}", label, SERVICE_TYPE)
}

fn label_from_fullname(fullname: &str) -> &str {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|label| label.trim_end_matches('.'))
        .unwrap_or(fullname)
}
