//! mDNS/DNS-SD publication of the receiver record.

use std::{
    net::{IpAddr, Ipv4Addr, UdpSocket},
    time::Duration,
};

use manuscripts_core::{AdvertisementHandle, Advertiser, DiscoveryError, SERVICE_TYPE, ServiceRecord};
use mdns_sd::{ServiceDaemon, ServiceInfo, UnregisterStatus};
use tracing::{debug, info, warn};

const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(1);

pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
}

impl MdnsAdvertiser {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()
            .map_err(|err| DiscoveryError::Unavailable(err.to_string()))?;
        Ok(Self { daemon })
    }
}

impl Advertiser for MdnsAdvertiser {
    fn publish(&self, record: &ServiceRecord) -> Result<AdvertisementHandle, DiscoveryError> {
        let label = record.instance_label();
        let host_name = format!("{}.local.", host_label(&label));
        let addrs: Vec<IpAddr> = record.host.parse::<IpAddr>().into_iter().collect();

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &label,
            &host_name,
            addrs.as_slice(),
            record.port,
            record.txt_properties(),
        )
        .map_err(|err| DiscoveryError::Publish(err.to_string()))?;
        let info = if addrs.is_empty() {
            info.enable_addr_auto()
        } else {
            info
        };

        let fullname = info.get_fullname().to_owned();
        self.daemon
            .register(info)
            .map_err(|err| DiscoveryError::Publish(err.to_string()))?;

        info!(
            instance = %fullname,
            host = %host_name,
            port = record.port,
            auth = record.requires_passphrase,
            "advertised receiver"
        );
        Ok(AdvertisementHandle::new(fullname))
    }

    fn withdraw(&self, handle: &AdvertisementHandle) -> Result<(), DiscoveryError> {
        let status = self
            .daemon
            .unregister(handle.fullname())
            .map_err(|err| DiscoveryError::Withdraw(err.to_string()))?;

        match status.recv_timeout(UNREGISTER_TIMEOUT) {
            Ok(UnregisterStatus::OK) => {
                info!(instance = %handle.fullname(), "advertisement withdrawn");
                Ok(())
            }
            Ok(UnregisterStatus::NotFound) => {
                debug!(instance = %handle.fullname(), "advertisement was already gone");
                Ok(())
            }
            Err(err) => Err(DiscoveryError::Withdraw(err.to_string())),
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        if let Err(err) = self.daemon.shutdown() {
            warn!("mDNS daemon shutdown failed: {err}");
        }
    }
}

/// DNS-safe host label derived from the instance label.
fn host_label(label: &str) -> String {
    let mut host: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while host.contains("--") {
        host = host.replace("--", "-");
    }
    let host = host.trim_matches('-');
    if host.is_empty() {
        "manuscripts-receiver".to_owned()
    } else {
        format!("manuscripts-{host}")
    }
}

/// Address of the interface that routes off-host. No packet is sent.
pub fn primary_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
