//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};

use ems_link_msg::ChannelAddress;

/// Set of channels.
pub type ChannelSet = BTreeSet<ChannelAddress>;

#[derive(Debug, Default)]
struct DeviceSubscriptions {
    consumers: BTreeMap<String, ChannelSet>,
    effective: ChannelSet,
    /// What the remote currently believes; `None` when unknown.
    sent: Option<ChannelSet>,
}

impl DeviceSubscriptions {
    fn recompute(&mut self) -> bool {
        let union: ChannelSet = self.consumers.values().flatten().cloned().collect();
        if union == self.effective {
            return false;
        }
        self.effective = union;
        true
    }
}

/// Per-device consumer interest, merged into one wire subscription per device.
///
/// The effective set of a device is always recomputed from scratch as the
/// union of its consumers' sets.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    devices: BTreeMap<String, DeviceSubscriptions>,
    count: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `consumer`'s interest on `device`. Returns the new effective
    /// set when it changed.
    pub fn subscribe<I>(&mut self, device: &str, consumer: &str, channels: I) -> Option<ChannelSet>
    where
        I: IntoIterator<Item = ChannelAddress>,
    {
        let channels: ChannelSet = channels.into_iter().collect();
        let entry = self.devices.entry(device.to_owned()).or_default();
        if channels.is_empty() {
            entry.consumers.remove(consumer);
        } else {
            entry.consumers.insert(consumer.to_owned(), channels);
        }
        entry.recompute().then(|| entry.effective.clone())
    }

    /// Drop `consumer`'s interest on `device`. Returns the new effective set
    /// when it changed.
    pub fn unsubscribe(&mut self, device: &str, consumer: &str) -> Option<ChannelSet> {
        let entry = self.devices.get_mut(device)?;
        entry.consumers.remove(consumer)?;
        entry.recompute().then(|| entry.effective.clone())
    }

    /// Current union for `device`.
    pub fn effective(&self, device: &str) -> ChannelSet {
        self.devices
            .get(device)
            .map(|entry| entry.effective.clone())
            .unwrap_or_default()
    }

    /// Effective set of `device` when it differs from what was last sent.
    pub fn pending_flush(&self, device: &str) -> Option<ChannelSet> {
        let entry = self.devices.get(device)?;
        match &entry.sent {
            Some(sent) if *sent == entry.effective => None,
            None if entry.effective.is_empty() => None,
            _ => Some(entry.effective.clone()),
        }
    }

    /// Record the set carried by a `subscribeChannels` request and return
    /// the sequence number to tag it with.
    pub fn mark_sent(&mut self, device: &str, channels: ChannelSet) -> u64 {
        self.devices.entry(device.to_owned()).or_default().sent = Some(channels);
        self.count += 1;
        self.count
    }

    /// Forget what the remote knows about `device`, e.g. after a failed request.
    pub fn mark_unknown(&mut self, device: &str) {
        if let Some(entry) = self.devices.get_mut(device) {
            entry.sent = None;
        }
    }

    /// Forget remote state for every device. A fresh connection starts with
    /// no subscriptions on the remote side.
    pub fn reset_sent(&mut self) {
        for entry in self.devices.values_mut() {
            entry.sent = None;
        }
    }

    /// Devices whose effective set is non-empty, for re-issue after re-login.
    pub fn active_devices(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|(_, entry)| !entry.effective.is_empty())
            .map(|(device, _)| device.clone())
            .collect()
    }

    /// Drop all interest, e.g. on logout.
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}
