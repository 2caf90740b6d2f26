use std::net::IpAddr;
use std::sync::Arc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::TXT_ROBOT_MODEL;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::store::ServiceFound;

/// Receives one call per resolved address of every accepted announcement
pub type AnnouncementSink = Arc<dyn Fn(ServiceFound) + Send + Sync>;

struct Listening {
    daemon: ServiceDaemon,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Listens for robot service announcements over mDNS.
pub struct ServiceBrowser {
    service_type: String,
    ports: Vec<u16>,
    sink: AnnouncementSink,
    listening: Option<Listening>,
}

impl ServiceBrowser {
    pub fn new(service_type: impl Into<String>, ports: Vec<u16>, sink: AnnouncementSink) -> Self {
        Self {
            service_type: service_type.into(),
            ports,
            sink,
            listening: None,
        }
    }

    /// Begin listening. Calling this while already listening restarts the
    /// listener, which sends fresh queries. Failures are logged and leave the
    /// browser idle. Must be called from within a Tokio runtime.
    pub fn start(&mut self) {
        self.stop();

        match self.listen() {
            Ok(listening) => {
                tracing::info!("Browsing for {} on ports {:?}", self.service_type, self.ports);
                self.listening = Some(listening);
            }
            Err(e) => {
                tracing::error!("mDNS browser failed to start: {:#}", e);
            }
        }
    }

    /// Stop listening and release the mDNS socket.
    pub fn stop(&mut self) {
        let Some(listening) = self.listening.take() else {
            return;
        };
        listening.cancel.cancel();
        listening.task.abort();
        if let Err(e) = listening.daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
        tracing::info!("Stopped browsing for {}", self.service_type);
    }

    pub fn is_listening(&self) -> bool {
        self.listening
            .as_ref()
            .map(|l| !l.task.is_finished())
            .unwrap_or(false)
    }

    fn listen(&self) -> Result<Listening> {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
        let receiver = match daemon.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(e).with_context(|| format!("Failed to browse {}", self.service_type));
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_browser(
            receiver,
            self.ports.clone(),
            self.sink.clone(),
            cancel.clone(),
        ));

        Ok(Listening { daemon, cancel, task })
    }
}

impl Drop for ServiceBrowser {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_browser(
    receiver: flume::Receiver<ServiceEvent>,
    ports: Vec<u16>,
    sink: AnnouncementSink,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        for found in convert_service_info(&info, &ports) {
                            tracing::debug!("Service found: {} at {}:{}", found.name, found.ip, found.port);
                            sink(found);
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        // Robots stay known until polling says otherwise
                        tracing::debug!("Service removed: {}", fullname);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("mDNS receiver disconnected: {}", e);
                        break;
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::debug!("mDNS browser task shutting down");
                break;
            }
        }
    }
}

/// One `ServiceFound` per usable address of an announcement. Announcements on
/// ports outside `ports` are not robots and are skipped; an empty `ports`
/// accepts everything.
pub fn convert_service_info(info: &ServiceInfo, ports: &[u16]) -> Vec<ServiceFound> {
    let port = info.get_port();
    if !ports.is_empty() && !ports.contains(&port) {
        tracing::trace!("Skipping {} on port {}", info.get_fullname(), port);
        return Vec::new();
    }

    let name = instance_name(info.get_fullname(), info.get_type());
    if name.is_empty() {
        tracing::warn!("Skipping announcement without instance name: {}", info.get_fullname());
        return Vec::new();
    }

    let advertised_model = info.get_property_val_str(TXT_ROBOT_MODEL).map(str::to_string);

    let mut addresses: Vec<IpAddr> = info
        .get_addresses()
        .iter()
        .copied()
        // Link-local v6 is unusable without a scope id
        .filter(|ip| match ip {
            IpAddr::V4(v4) => !v4.is_unspecified(),
            IpAddr::V6(v6) => !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80,
        })
        .collect();
    // HashSet order is arbitrary; prefer IPv4, then stable by value
    addresses.sort_by_key(|ip| (ip.is_ipv6(), *ip));

    if addresses.is_empty() {
        tracing::debug!("Skipping {} - no usable addresses", info.get_fullname());
    }

    addresses
        .into_iter()
        .map(|ip| ServiceFound {
            name: name.to_string(),
            ip: ip.to_string(),
            port,
            advertised_model: advertised_model.clone(),
        })
        .collect()
}

/// `opentrons-robotA._http._tcp.local.` -> `opentrons-robotA`
fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .unwrap_or(fullname)
        .trim_end_matches('.')
}
