use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use str0m::Candidate;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// The filter defaults to `info` and can be overridden with `RUST_LOG`.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Host candidates for every routable IPv4 interface, all sharing the port of
/// `local`.
///
/// Loopback and link-local addresses are skipped. If no interface qualifies,
/// the list is empty and the peer can only be reached through remote
/// candidates.
pub fn get_candidates(local: SocketAddr) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = vec![];
    let Ok(network_interfaces) = list_afinet_netifas() else {
        warn!("could not enumerate network interfaces");
        return candidates;
    };

    for (name, ip) in network_interfaces {
        let IpAddr::V4(ip4) = ip else {
            continue;
        };
        if ip4.is_loopback() || ip4.is_link_local() {
            continue;
        }
        debug!(iface = %name, ip = %ip4, "host candidate");
        match Candidate::host(SocketAddr::new(ip, local.port()), str0m::net::Protocol::Udp) {
            Ok(candidate) => candidates.push(candidate),
            Err(e) => warn!(iface = %name, error = ?e, "skipping interface"),
        }
    }

    candidates
}

/// Lock a mutex, recovering the data if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Milliseconds since the Unix epoch, the unit every wire timestamp uses.
pub(crate) fn epoch_millis(time: SystemTime) -> i64 {
    chrono::DateTime::<chrono::Utc>::from(time).timestamp_millis()
}
