//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC message model and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Separator between component and channel id in the canonical form.
pub const SEPARATOR: char = '/';

/// Errors raised while parsing a `component/channel` string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelAddressError {
    /// The string contains no separator.
    #[error("channel address `{0}` has no '/' separator")]
    MissingSeparator(String),
    /// Component or channel part is empty.
    #[error("channel address `{0}` has an empty component or channel id")]
    Empty(String),
}

/// Address of a single data point: `componentId/channelId`.
///
/// Equality, ordering and hashing follow the canonical string form, so two
/// addresses that render to the same string are the same key. Parsing splits
/// at the first separator: a channel id may contain `/`, a component id may not.
#[derive(Debug, Clone)]
pub struct ChannelAddress {
    component_id: String,
    channel_id: String,
}

impl ChannelAddress {
    /// Build an address from its two parts.
    pub fn new(component_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Component part.
    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Channel part.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn canonical(&self) -> impl Iterator<Item = u8> + '_ {
        self.component_id
            .bytes()
            .chain(std::iter::once(SEPARATOR as u8))
            .chain(self.channel_id.bytes())
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.component_id, SEPARATOR, self.channel_id)
    }
}

impl FromStr for ChannelAddress {
    type Err = ChannelAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((component, channel)) = s.split_once(SEPARATOR) else {
            return Err(ChannelAddressError::MissingSeparator(s.to_owned()));
        };
        if component.is_empty() || channel.is_empty() {
            return Err(ChannelAddressError::Empty(s.to_owned()));
        }
        Ok(Self::new(component, channel))
    }
}

impl PartialEq for ChannelAddress {
    fn eq(&self, other: &Self) -> bool {
        self.canonical().eq(other.canonical())
    }
}

impl Eq for ChannelAddress {}

impl PartialOrd for ChannelAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical().cmp(other.canonical())
    }
}

impl Hash for ChannelAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.canonical() {
            state.write_u8(byte);
        }
        state.write_u8(0xff);
    }
}

impl Serialize for ChannelAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
