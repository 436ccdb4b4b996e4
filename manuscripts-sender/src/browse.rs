//! Receiver discovery on the sending side.
//!
//! [`RecordCache`] turns raw announcements into a clean added/removed feed:
//! duplicates are dropped, removals of records never reported are ignored,
//! and a known record that turns unusable is reported as removed.

use std::{
    collections::HashMap,
    net::IpAddr,
    time::Duration,
};

use futures::{StreamExt, stream};
use manuscripts_core::{
    Browser, DiscoveryError, DiscoveryEvent, SERVICE_TYPE, ServiceRecord,
    record::{TXT_AUTH, TXT_MODE, TXT_NAME, TXT_VERSION},
};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct RecordCache {
    records: HashMap<String, ServiceRecord>,
}

impl RecordCache {
    /// Folds one raw event into the cache; returns what observers should see.
    pub fn apply(&mut self, event: DiscoveryEvent) -> Option<DiscoveryEvent> {
        match event {
            DiscoveryEvent::Added(record) if !record.is_supported() => {
                debug!(
                    instance = %record.instance_id,
                    version = record.protocol_version,
                    "skipping receiver with unsupported protocol"
                );
                self.records
                    .remove(&record.instance_id)
                    .map(|old| DiscoveryEvent::Removed {
                        instance_id: old.instance_id,
                    })
            }
            DiscoveryEvent::Added(record) => {
                if self.records.get(&record.instance_id) == Some(&record) {
                    return None;
                }
                self.records
                    .insert(record.instance_id.clone(), record.clone());
                Some(DiscoveryEvent::Added(record))
            }
            DiscoveryEvent::Removed { instance_id } => self
                .records
                .remove(&instance_id)
                .map(|_| DiscoveryEvent::Removed { instance_id }),
        }
    }

    pub fn records(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        records
    }

    pub fn find_by_name(&self, display_name: &str) -> Option<&ServiceRecord> {
        let wanted = display_name.trim();
        self.records
            .values()
            .find(|record| record.display_name.eq_ignore_ascii_case(wanted))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()
            .map_err(|err| DiscoveryError::Unavailable(err.to_string()))?;
        Ok(Self { daemon })
    }
}

impl Browser for MdnsBrowser {
    fn browse(&self) -> Result<stream::BoxStream<'static, DiscoveryEvent>, DiscoveryError> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|err| DiscoveryError::Browse(err.to_string()))?;

        let events = stream::unfold(
            (receiver, RecordCache::default()),
            |(receiver, mut cache)| async move {
                loop {
                    let raw = match receiver.recv_async().await {
                        Ok(ServiceEvent::ServiceResolved(info)) => event_from_info(&info),
                        Ok(ServiceEvent::ServiceRemoved(_, fullname)) => Some(DiscoveryEvent::Removed {
                            instance_id: fullname,
                        }),
                        Ok(other) => {
                            debug!("mDNS event: {other:?}");
                            None
                        }
                        Err(err) => {
                            warn!("mDNS browse ended: {err}");
                            return None;
                        }
                    };
                    if let Some(event) = raw.and_then(|raw| cache.apply(raw)) {
                        return Some((event, (receiver, cache)));
                    }
                }
            },
        );
        Ok(events.boxed())
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Err(err) = self.daemon.shutdown() {
            warn!("mDNS daemon shutdown failed: {err}");
        }
    }
}

/// A record whose TXT data cannot be read is treated like one that went away.
fn event_from_info(info: &ServiceInfo) -> Option<DiscoveryEvent> {
    let fullname = info.get_fullname().to_owned();
    let Some(addr) = pick_addr(info) else {
        debug!(instance = %fullname, "resolved receiver has no address yet");
        return None;
    };

    let properties: HashMap<String, String> = [TXT_NAME, TXT_VERSION, TXT_AUTH, TXT_MODE]
        .into_iter()
        .filter_map(|key| {
            info.get_property_val_str(key)
                .map(|value| (key.to_owned(), value.to_owned()))
        })
        .collect();

    match ServiceRecord::from_txt(&fullname, &addr.to_string(), info.get_port(), &properties) {
        Ok(record) => Some(DiscoveryEvent::Added(record)),
        Err(err) => {
            debug!(instance = %fullname, "unusable receiver record: {err}");
            Some(DiscoveryEvent::Removed {
                instance_id: fullname,
            })
        }
    }
}

/// Prefers a routable IPv4 address, then any non-loopback one.
fn pick_addr(info: &ServiceInfo) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4() && !a.is_loopback())
        .or_else(|| addrs.iter().find(|a| !a.is_loopback()))
        .or_else(|| addrs.first())
        .copied()
}

/// Everything seen within `wait`.
pub async fn list_receivers(
    browser: &dyn Browser,
    wait: Duration,
) -> Result<Vec<ServiceRecord>, DiscoveryError> {
    let mut events = browser.browse()?;
    let mut cache = RecordCache::default();
    let deadline = Instant::now() + wait;
    while let Ok(Some(event)) = timeout_at(deadline, events.next()).await {
        cache.apply(event);
    }
    Ok(cache.records())
}

/// First receiver whose display name matches, case-insensitively.
pub async fn resolve_by_name(
    browser: &dyn Browser,
    display_name: &str,
    wait: Duration,
) -> Result<Option<ServiceRecord>, DiscoveryError> {
    let mut events = browser.browse()?;
    let mut cache = RecordCache::default();
    let deadline = Instant::now() + wait;
    while let Ok(Some(event)) = timeout_at(deadline, events.next()).await {
        cache.apply(event);
        if let Some(record) = cache.find_by_name(display_name) {
            return Ok(Some(record.clone()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use manuscripts_core::ReceiverMode;

    use super::*;

    fn record(name: &str, port: u16) -> ServiceRecord {
        ServiceRecord::new(name, "192.168.1.20", port, false, ReceiverMode::Receiver)
    }

    struct ScriptedBrowser {
        events: Vec<DiscoveryEvent>,
    }

    impl Browser for ScriptedBrowser {
        fn browse(&self) -> Result<stream::BoxStream<'static, DiscoveryEvent>, DiscoveryError> {
            let scripted = stream::iter(self.events.clone());
            Ok(scripted.chain(stream::pending()).boxed())
        }
    }

    #[test]
    fn duplicates_are_reported_once() {
        let mut cache = RecordCache::default();
        let room = record("Room 204", 8765);
        assert!(cache.apply(DiscoveryEvent::Added(room.clone())).is_some());
        assert!(cache.apply(DiscoveryEvent::Added(room.clone())).is_none());

        let moved = record("Room 204", 9000);
        assert_eq!(
            cache.apply(DiscoveryEvent::Added(moved.clone())),
            Some(DiscoveryEvent::Added(moved))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn removal_of_unknown_record_is_ignored() {
        let mut cache = RecordCache::default();
        assert!(cache
            .apply(DiscoveryEvent::Removed {
                instance_id: "Ghost._manuscripts._tcp.local.".to_owned(),
            })
            .is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn unsupported_versions_are_skipped_or_withdrawn() {
        let mut cache = RecordCache::default();
        let mut future = record("Lab", 8765);
        future.protocol_version = 2;
        assert!(cache.apply(DiscoveryEvent::Added(future.clone())).is_none());

        let lab = record("Lab", 8765);
        cache.apply(DiscoveryEvent::Added(lab.clone()));
        assert_eq!(
            cache.apply(DiscoveryEvent::Added(future)),
            Some(DiscoveryEvent::Removed {
                instance_id: lab.instance_id,
            })
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn lookup_ignores_case_and_whitespace() {
        let mut cache = RecordCache::default();
        cache.apply(DiscoveryEvent::Added(record("Room 204", 8765)));
        assert!(cache.find_by_name("  room 204 ").is_some());
        assert!(cache.find_by_name("Room 205").is_none());
    }

    #[tokio::test]
    async fn list_collects_until_the_deadline() {
        let browser = ScriptedBrowser {
            events: vec![
                DiscoveryEvent::Added(record("Zoology", 1)),
                DiscoveryEvent::Added(record("art room", 2)),
                DiscoveryEvent::Added(record("Biology", 3)),
                DiscoveryEvent::Removed {
                    instance_id: record("Biology", 3).instance_id,
                },
            ],
        };
        let names: Vec<String> = list_receivers(&browser, Duration::from_millis(100))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.display_name)
            .collect();
        assert_eq!(names, ["art room", "Zoology"]);
    }

    #[tokio::test]
    async fn resolve_returns_early_or_gives_up() {
        let browser = ScriptedBrowser {
            events: vec![DiscoveryEvent::Added(record("Room 204", 8765))],
        };
        let found = resolve_by_name(&browser, "room 204", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.port), Some(8765));

        let missing = resolve_by_name(&browser, "Room 9", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
