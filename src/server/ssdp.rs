//! LAN discovery announcements
//!
//! Periodic SSDP NOTIFY broadcasts plus an M-SEARCH responder, with the
//! framing a hardware tuner uses, so Plex and IPTV apps find the appliance
//! without configuration.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

use super::hdhr::{get_local_ip, normalize_device_id};

/// Standard SSDP multicast endpoint
const SSDP_MULTICAST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);

/// NOTIFY cadence; a real tuner announces at roughly half its max-age
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Advertised cache lifetime
const MAX_AGE_SECS: u32 = 120;

/// Device types this appliance answers searches for
const SEARCH_TARGETS: &[&str] = &[
    "ssdp:all",
    "upnp:rootdevice",
    "urn:schemas-upnp-org:device:MediaServer:1",
];

fn device_usn(device_id: &str) -> String {
    format!("uuid:telecast-{}::upnp:rootdevice", device_id.to_lowercase())
}

fn notify_payload(location: &str, usn: &str) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         CACHE-CONTROL: max-age={}\r\n\
         LOCATION: {}\r\n\
         NT: upnp:rootdevice\r\n\
         NTS: ssdp:alive\r\n\
         SERVER: Telecast/{} UPnP/1.0\r\n\
         USN: {}\r\n\r\n",
        MAX_AGE_SECS,
        location,
        env!("CARGO_PKG_VERSION"),
        usn
    )
}

fn search_response(location: &str, usn: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age={}\r\n\
         EXT:\r\n\
         LOCATION: {}\r\n\
         SERVER: Telecast/{} UPnP/1.0\r\n\
         ST: upnp:rootdevice\r\n\
         USN: {}\r\n\r\n",
        MAX_AGE_SECS,
        location,
        env!("CARGO_PKG_VERSION"),
        usn
    )
}

/// Whether an M-SEARCH datagram targets something we should answer
fn is_relevant_search(datagram: &str) -> bool {
    if !datagram.starts_with("M-SEARCH") {
        return false;
    }
    SEARCH_TARGETS
        .iter()
        .any(|target| datagram.contains(target))
}

/// Run the announcer: periodic NOTIFY plus M-SEARCH responses.
///
/// Socket errors are logged and retried on the next tick; discovery being
/// down must never take streaming with it.
pub async fn run_announcer(port: u16, configured_device_id: Option<String>) {
    let device_id = normalize_device_id(configured_device_id.as_deref());
    let location = format!("http://{}:{}/discover.json", get_local_ip(), port);
    let usn = device_usn(&device_id);

    let socket = match UdpSocket::bind(("0.0.0.0", 1900)).await {
        Ok(socket) => socket,
        Err(e) => {
            // Another stack may own 1900; announce-only still works from
            // an ephemeral port
            tracing::warn!("SSDP bind to :1900 failed ({}), falling back to announce-only", e);
            match UdpSocket::bind(("0.0.0.0", 0)).await {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::error!("SSDP disabled, no UDP socket available: {}", e);
                    return;
                }
            }
        }
    };
    if let Err(e) = socket.join_multicast_v4(*SSDP_MULTICAST.ip(), Ipv4Addr::UNSPECIFIED) {
        tracing::debug!("SSDP multicast join failed: {}", e);
    }

    tracing::info!(location = %location, "SSDP announcer running");

    let mut announce = tokio::time::interval(ANNOUNCE_INTERVAL);
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = announce.tick() => {
                let payload = notify_payload(&location, &usn);
                if let Err(e) = socket.send_to(payload.as_bytes(), SSDP_MULTICAST).await {
                    tracing::debug!("SSDP NOTIFY failed: {}", e);
                }
            }
            received = socket.recv_from(&mut buf) => {
                let Ok((len, peer)) = received else { continue };
                let datagram = String::from_utf8_lossy(&buf[..len]);
                if is_relevant_search(&datagram) {
                    let response = search_response(&location, &usn);
                    if let Err(e) = socket.send_to(response.as_bytes(), peer).await {
                        tracing::debug!("SSDP search response failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_payload_framing() {
        let payload = notify_payload("http://10.0.0.2:5004/discover.json", "uuid:telecast-e5e17001::upnp:rootdevice");
        assert!(payload.starts_with("NOTIFY * HTTP/1.1\r\n"));
        assert!(payload.contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(payload.contains("NTS: ssdp:alive\r\n"));
        assert!(payload.contains("LOCATION: http://10.0.0.2:5004/discover.json\r\n"));
        assert!(payload.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_search_response_framing() {
        let response = search_response("http://10.0.0.2:5004/discover.json", "uuid:x");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("ST: upnp:rootdevice\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_msearch_relevance() {
        let msearch = "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nST: ssdp:all\r\n\r\n";
        assert!(is_relevant_search(msearch));
        let notify = "NOTIFY * HTTP/1.1\r\n\r\n";
        assert!(!is_relevant_search(notify));
        let other_st = "M-SEARCH * HTTP/1.1\r\nST: urn:dial-multiscreen-org:service:dial:1\r\n\r\n";
        assert!(!is_relevant_search(other_st));
    }

    #[test]
    fn test_usn_embeds_lowercased_device_id() {
        assert_eq!(
            device_usn("E5E17001"),
            "uuid:telecast-e5e17001::upnp:rootdevice"
        );
    }
}
