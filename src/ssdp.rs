//! SSDP discovery: a per-interface, per-scope announce loop and M-SEARCH
//! responder over multicast UDP.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{IpFilter, IpNet};

pub const SSDP_PORT: u16 = 1900;
const MCAST_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const MCAST_V6_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);
const MCAST_V6_SITE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc);

const NTS_ALIVE: &str = "ssdp:alive";
const NTS_BYEBYE: &str = "ssdp:byebye";

/// Maximum MX a search may ask for; larger values are clamped.
const MX_MAX: u64 = 10;
/// Jitter window for NOTIFY sends.
const NOTIFY_JITTER: Duration = Duration::from_millis(100);

/// The three multicast scopes every usable interface participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    V4,
    V6LinkLocal,
    V6SiteLocal,
}

pub const SCOPES: [Scope; 3] = [Scope::V4, Scope::V6LinkLocal, Scope::V6SiteLocal];

impl Scope {
    pub fn is_ipv4(&self) -> bool {
        matches!(self, Scope::V4)
    }

    fn group(&self) -> IpAddr {
        match self {
            Scope::V4 => IpAddr::V4(MCAST_V4),
            Scope::V6LinkLocal => IpAddr::V6(MCAST_V6_LINK_LOCAL),
            Scope::V6SiteLocal => IpAddr::V6(MCAST_V6_SITE_LOCAL),
        }
    }

    fn multicast_addr(&self) -> SocketAddr {
        SocketAddr::new(self.group(), SSDP_PORT)
    }

    /// The HOST header string clients are expected to use.
    pub fn host_string(&self) -> &'static str {
        match self {
            Scope::V4 => "239.255.255.250:1900",
            Scope::V6LinkLocal => "[ff02::c]:1900",
            Scope::V6SiteLocal => "[ff05::c]:1900",
        }
    }
}

fn ipv6_is_link_local(ip: Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

fn ip_is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => ipv6_is_link_local(v6),
    }
}

fn prefix_from_netmask(mask: IpAddr) -> u8 {
    let bits = match mask {
        IpAddr::V4(v4) => u32::from(v4).leading_ones() as u8,
        IpAddr::V6(v6) => u128::from(v6).leading_ones() as u8,
    };
    bits
}

/// One address bound to an interface, with its subnet prefix.
#[derive(Debug, Clone, Copy)]
pub struct IfaceAddr {
    pub ip: IpAddr,
    pub prefix: u8,
}

impl IfaceAddr {
    fn subnet(&self) -> IpNet {
        IpNet {
            addr: self.ip,
            prefix: self.prefix,
        }
    }
}

/// A usable network interface for SSDP purposes.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub addrs: Vec<IfaceAddr>,
}

impl Interface {
    fn addrs_for(&self, scope: Scope) -> impl Iterator<Item = &IfaceAddr> {
        let v4 = scope.is_ipv4();
        self.addrs.iter().filter(move |a| a.ip.is_ipv4() == v4)
    }

    fn has_family(&self, scope: Scope) -> bool {
        self.addrs_for(scope).next().is_some()
    }
}

/// Enumerates interfaces worth serving on: named ones carrying at least
/// one non-loopback address.
pub fn usable_interfaces(if_name: Option<&str>) -> Result<Vec<Interface>> {
    let raw = NetworkInterface::show().context("enumerating network interfaces")?;
    let mut out = Vec::new();
    for nic in raw {
        if let Some(wanted) = if_name {
            if nic.name != wanted {
                continue;
            }
        }
        let addrs: Vec<IfaceAddr> = nic
            .addr
            .iter()
            .filter(|a| !a.ip().is_loopback())
            .map(|a| IfaceAddr {
                ip: a.ip(),
                prefix: a
                    .netmask()
                    .map(prefix_from_netmask)
                    .unwrap_or_else(|| if a.ip().is_ipv4() { 32 } else { 128 }),
            })
            .collect();
        if addrs.is_empty() {
            continue;
        }
        out.push(Interface {
            name: nic.name,
            index: nic.index,
            addrs,
        });
    }
    Ok(out)
}

/// Parameters shared by every SSDP engine.
pub struct SsdpOptions {
    pub udn: String,
    pub server_string: String,
    pub targets: Vec<String>,
    pub http_port: u16,
    pub notify_interval: Duration,
    pub if_name: Option<String>,
    pub ip_filter: IpFilter,
    pub shutdown: CancellationToken,
}

struct Shared {
    udn: String,
    server_string: String,
    targets: Vec<String>,
    http_port: u16,
    notify_interval: Duration,
    ip_filter: IpFilter,
    shutdown: CancellationToken,
}

impl Shared {
    fn usn_from_target(&self, target: &str) -> String {
        if target == self.udn {
            return target.to_string();
        }
        format!("{}::{target}", self.udn)
    }

    fn max_age(&self) -> u64 {
        self.notify_interval.as_secs() * 5 / 2
    }

    fn location(&self, ip: IpAddr) -> String {
        let addr = SocketAddr::new(ip, self.http_port);
        format!("http://{addr}/rootDesc.xml")
    }

    /// The targets matching an ST header value.
    fn match_targets(&self, st: &str) -> Vec<String> {
        if st == "ssdp:all" {
            return self.targets.clone();
        }
        self.targets.iter().filter(|t| *t == st).cloned().collect()
    }

    fn make_notify(&self, scope: Scope, target: &str, nts: &str, location: Option<&str>) -> String {
        let mut msg = format!(
            concat!(
                "NOTIFY * HTTP/1.1\r\n",
                "HOST: {host}\r\n",
                "CACHE-CONTROL: max-age={max_age}\r\n"
            ),
            host = scope.host_string(),
            max_age = self.max_age(),
        );
        if let Some(location) = location {
            msg.push_str(&format!("LOCATION: {location}\r\n"));
        }
        msg.push_str(&format!(
            concat!(
                "NT: {target}\r\n",
                "NTS: {nts}\r\n",
                "SERVER: {server}\r\n",
                "USN: {usn}\r\n",
                "\r\n"
            ),
            target = target,
            nts = nts,
            server = self.server_string,
            usn = self.usn_from_target(target),
        ));
        msg
    }

    fn make_response(&self, ip: IpAddr, target: &str) -> String {
        format!(
            concat!(
                "HTTP/1.1 200 OK\r\n",
                "CACHE-CONTROL: max-age={max_age}\r\n",
                "EXT:\r\n",
                "LOCATION: {location}\r\n",
                "SERVER: {server}\r\n",
                "ST: {target}\r\n",
                "USN: {usn}\r\n",
                "\r\n"
            ),
            max_age = self.max_age(),
            location = self.location(ip),
            server = self.server_string,
            target = target,
            usn = self.usn_from_target(target),
        )
    }
}

/// A parsed M-SEARCH request.
#[derive(Debug, PartialEq, Eq)]
pub struct MSearch {
    pub host: String,
    pub man: String,
    pub st: String,
    pub mx: Option<u64>,
}

/// Parses an SSDP datagram; returns `None` for anything that is not an
/// M-SEARCH request.
pub fn parse_msearch(buf: &[u8]) -> Option<MSearch> {
    if buf.starts_with(b"HTTP/") {
        return None;
    }
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(_) => {}
        Err(e) => {
            trace!("unparseable ssdp datagram: {e}");
            return None;
        }
    }
    if req.method != Some("M-SEARCH") {
        return None;
    }
    let mut host = None;
    let mut man = None;
    let mut st = None;
    let mut mx = None;
    for header in req.headers.iter() {
        let value = || String::from_utf8_lossy(header.value).trim().to_string();
        if header.name.eq_ignore_ascii_case("host") {
            host = Some(value());
        } else if header.name.eq_ignore_ascii_case("man") {
            man = Some(value());
        } else if header.name.eq_ignore_ascii_case("st") {
            st = Some(value());
        } else if header.name.eq_ignore_ascii_case("mx") {
            mx = value().parse().ok();
        }
    }
    Some(MSearch {
        host: host?,
        man: man?,
        st: st?,
        mx,
    })
}

/// MX clamped into [1, MX_MAX]; zero or missing becomes 1.
pub fn clamp_mx(mx: Option<u64>) -> u64 {
    mx.unwrap_or(1).clamp(1, MX_MAX)
}

/// Picks the local source address for a unicast response: the interface
/// address whose subnet contains the sender, or for link-local senders
/// the first address of the family.
pub fn source_ip_for(addrs: &[IfaceAddr], sender: IpAddr) -> Option<IpAddr> {
    for addr in addrs {
        if addr.ip.is_ipv4() != sender.is_ipv4() {
            continue;
        }
        if addr.subnet().contains(sender) {
            return Some(addr.ip);
        }
    }
    if ip_is_link_local(sender) {
        return addrs
            .iter()
            .find(|a| a.ip.is_ipv4() == sender.is_ipv4())
            .map(|a| a.ip);
    }
    None
}

struct Engine {
    shared: Arc<Shared>,
    iface: Interface,
    scope: Scope,
    socket: Arc<UdpSocket>,
}

fn make_socket(scope: Scope, iface: &Interface) -> Result<UdpSocket> {
    let domain = if scope.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, None)
        .context("creating SSDP socket")?;
    sock.set_reuse_address(true).context("setting SO_REUSEADDR")?;
    #[cfg(not(windows))]
    sock.set_reuse_port(true).context("setting SO_REUSEPORT")?;

    let bind_addr: SocketAddr = if scope.is_ipv4() {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT).into()
    } else {
        SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, SSDP_PORT, 0, 0).into()
    };
    sock.bind(&bind_addr.into())
        .with_context(|| format!("binding {bind_addr}"))?;

    match scope {
        Scope::V4 => {
            let local = iface
                .addrs_for(scope)
                .find_map(|a| match a.ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            sock.join_multicast_v4(&MCAST_V4, &local)
                .context("joining IPv4 multicast group")?;
            sock.set_multicast_ttl_v4(2).context("setting multicast TTL")?;
            sock.set_multicast_if_v4(&local)
                .context("selecting multicast interface")?;
        }
        Scope::V6LinkLocal | Scope::V6SiteLocal => {
            let group = match scope.group() {
                IpAddr::V6(v6) => v6,
                IpAddr::V4(_) => unreachable!("v6 scope carries a v6 group"),
            };
            sock.join_multicast_v6(&group, iface.index)
                .context("joining IPv6 multicast group")?;
            sock.set_multicast_hops_v6(2).context("setting hop limit")?;
            sock.set_multicast_if_v6(iface.index)
                .context("selecting multicast interface")?;
        }
    }

    sock.set_nonblocking(true)?;
    UdpSocket::from_std(sock.into()).context("registering socket with the runtime")
}

impl Engine {
    /// Sends `buf` after a uniform random delay within `window`, unless
    /// shutdown happens first.
    fn delayed_send(&self, buf: String, addr: SocketAddr, window: Duration) {
        let socket = self.socket.clone();
        let shutdown = self.shared.shutdown.clone();
        let nanos = window.as_nanos().max(1) as u64;
        let delay = Duration::from_nanos(rand::thread_rng().gen_range(0..nanos));
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = socket.send_to(buf.as_bytes(), addr).await {
                        debug!(%addr, "ssdp send failed: {e}");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// The local IPs announcements go out for: same family, not
    /// link-local, admitted by the configured filter.
    fn announce_ips(&self) -> Vec<IpAddr> {
        self.iface
            .addrs_for(self.scope)
            .map(|a| a.ip)
            .filter(|ip| !ip_is_link_local(*ip))
            .filter(|ip| self.shared.ip_filter.allows(*ip))
            .collect()
    }

    fn notify_all(&self) {
        for ip in self.announce_ips() {
            let location = self.shared.location(ip);
            for target in &self.shared.targets {
                let msg = self
                    .shared
                    .make_notify(self.scope, target, NTS_ALIVE, Some(&location));
                self.delayed_send(msg, self.scope.multicast_addr(), NOTIFY_JITTER);
            }
        }
    }

    async fn send_byebye(&self) {
        for target in &self.shared.targets {
            let msg = self.shared.make_notify(self.scope, target, NTS_BYEBYE, None);
            if let Err(e) = self
                .socket
                .send_to(msg.as_bytes(), self.scope.multicast_addr())
                .await
            {
                debug!(iface = %self.iface.name, "byebye send failed: {e}");
            }
        }
    }

    async fn announce_loop(&self) {
        let mut ticker = tokio::time::interval(self.shared.notify_interval);
        loop {
            ticker.tick().await;
            trace!(iface = %self.iface.name, scope = ?self.scope, "announcing");
            self.notify_all();
        }
    }

    fn handle_datagram(&self, buf: &[u8], sender: SocketAddr) {
        let Some(msearch) = parse_msearch(buf) else {
            return;
        };
        if msearch.man != "\"ssdp:discover\"" {
            return;
        }
        if !msearch.host.eq_ignore_ascii_case(self.scope.host_string()) {
            return;
        }
        let targets = self.shared.match_targets(&msearch.st);
        if targets.is_empty() {
            return;
        }
        let mx = clamp_mx(msearch.mx);
        let addrs: Vec<IfaceAddr> = self.iface.addrs_for(self.scope).copied().collect();
        let Some(ip) = source_ip_for(&addrs, sender.ip()) else {
            trace!(%sender, iface = %self.iface.name, "no address matches searcher");
            return;
        };
        debug!(%sender, st = %msearch.st, n = targets.len(), "answering M-SEARCH");
        for target in targets {
            let resp = self.shared.make_response(ip, &target);
            self.delayed_send(resp, sender, Duration::from_secs(mx));
        }
    }

    async fn responder_loop(&self) {
        let mut buf = vec![0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, sender)) => self.handle_datagram(&buf[..n], sender),
                Err(e) => {
                    if self.shared.shutdown.is_cancelled() {
                        return;
                    }
                    warn!(iface = %self.iface.name, "ssdp read failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn run(self) {
        let shutdown = self.shared.shutdown.clone();
        tokio::select! {
            _ = self.announce_loop() => {}
            _ = self.responder_loop() => {}
            _ = shutdown.cancelled() => {
                self.send_byebye().await;
            }
        }
    }
}

/// Spawns an engine per usable interface and scope; the returned future
/// resolves once every engine has shut down (byebyes sent).
pub fn spawn_engines(opts: SsdpOptions) -> impl std::future::Future<Output = ()> {
    let shared = Arc::new(Shared {
        udn: opts.udn,
        server_string: opts.server_string,
        targets: opts.targets,
        http_port: opts.http_port,
        notify_interval: opts.notify_interval,
        ip_filter: opts.ip_filter,
        shutdown: opts.shutdown,
    });

    let mut tasks = tokio::task::JoinSet::new();
    match usable_interfaces(opts.if_name.as_deref()) {
        Ok(interfaces) => {
            if interfaces.is_empty() {
                warn!("no usable interfaces for SSDP");
            }
            for iface in interfaces {
                for scope in SCOPES {
                    if !iface.has_family(scope) {
                        continue;
                    }
                    let socket = match make_socket(scope, &iface) {
                        Ok(socket) => Arc::new(socket),
                        Err(e) => {
                            debug!(iface = %iface.name, scope = ?scope, "ssdp socket setup failed: {e:#}");
                            continue;
                        }
                    };
                    info!(iface = %iface.name, scope = ?scope, "SSDP engine started");
                    let engine = Engine {
                        shared: shared.clone(),
                        iface: iface.clone(),
                        scope,
                        socket,
                    };
                    tasks.spawn(engine.run());
                }
            }
        }
        Err(e) => warn!("interface enumeration failed: {e:#}"),
    }

    async move {
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Shared {
        Shared {
            udn: "uuid:0000-1111".to_string(),
            server_string: "Linux/3.4 DLNADOC/1.50 UPnP/1.0 dlnacast/0.1.0".to_string(),
            targets: vec![
                "upnp:rootdevice".to_string(),
                "uuid:0000-1111".to_string(),
                "urn:schemas-upnp-org:device:MediaServer:1".to_string(),
                "urn:schemas-upnp-org:service:ContentDirectory:1".to_string(),
            ],
            http_port: 1338,
            notify_interval: Duration::from_secs(30),
            ip_filter: IpFilter::default(),
            shutdown: CancellationToken::new(),
        }
    }

    #[test]
    fn msearch_parsing() {
        let buf = b"M-SEARCH * HTTP/1.1\r\nHOST:239.255.255.250:1900\r\nMAN:\"ssdp:discover\"\r\nMX:2\r\nST:ssdp:all\r\n\r\n";
        let req = parse_msearch(buf).unwrap();
        assert_eq!(req.host, "239.255.255.250:1900");
        assert_eq!(req.man, "\"ssdp:discover\"");
        assert_eq!(req.st, "ssdp:all");
        assert_eq!(req.mx, Some(2));
    }

    #[test]
    fn non_msearch_ignored() {
        assert!(parse_msearch(b"NOTIFY * HTTP/1.1\r\nHOST: x\r\n\r\n").is_none());
        assert!(parse_msearch(b"HTTP/1.1 200 OK\r\n\r\n").is_none());
        assert!(parse_msearch(b"\x00\x01garbage").is_none());
        // Missing ST header.
        assert!(parse_msearch(
            b"M-SEARCH * HTTP/1.1\r\nHOST:239.255.255.250:1900\r\nMAN:\"ssdp:discover\"\r\n\r\n"
        )
        .is_none());
    }

    #[test]
    fn mx_clamping() {
        assert_eq!(clamp_mx(None), 1);
        assert_eq!(clamp_mx(Some(0)), 1);
        assert_eq!(clamp_mx(Some(2)), 2);
        assert_eq!(clamp_mx(Some(10)), 10);
        assert_eq!(clamp_mx(Some(600)), 10);
    }

    #[test]
    fn target_matching() {
        let shared = shared();
        assert_eq!(shared.match_targets("ssdp:all").len(), 4);
        assert_eq!(
            shared.match_targets("upnp:rootdevice"),
            vec!["upnp:rootdevice".to_string()]
        );
        assert!(shared.match_targets("urn:unknown:service:Nope:1").is_empty());
    }

    #[test]
    fn usn_derivation() {
        let shared = shared();
        assert_eq!(shared.usn_from_target("uuid:0000-1111"), "uuid:0000-1111");
        assert_eq!(
            shared.usn_from_target("upnp:rootdevice"),
            "uuid:0000-1111::upnp:rootdevice"
        );
    }

    #[test]
    fn notify_message_shape() {
        let shared = shared();
        let msg = shared.make_notify(
            Scope::V4,
            "upnp:rootdevice",
            NTS_ALIVE,
            Some("http://192.168.1.2:1338/rootDesc.xml"),
        );
        assert!(msg.starts_with("NOTIFY * HTTP/1.1\r\n"));
        assert!(msg.contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(msg.contains("CACHE-CONTROL: max-age=75\r\n"));
        assert!(msg.contains("LOCATION: http://192.168.1.2:1338/rootDesc.xml\r\n"));
        assert!(msg.contains("NTS: ssdp:alive\r\n"));
        assert!(msg.contains("USN: uuid:0000-1111::upnp:rootdevice\r\n"));
        assert!(msg.ends_with("\r\n\r\n"));
    }

    #[test]
    fn byebye_omits_location() {
        let shared = shared();
        let msg = shared.make_notify(Scope::V4, "upnp:rootdevice", NTS_BYEBYE, None);
        assert!(!msg.contains("LOCATION"));
        assert!(msg.contains("NTS: ssdp:byebye\r\n"));
    }

    #[test]
    fn response_message_shape() {
        let shared = shared();
        let msg = shared.make_response("192.168.1.2".parse().unwrap(), "upnp:rootdevice");
        assert!(msg.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(msg.contains("EXT:\r\n"));
        assert!(msg.contains("LOCATION: http://192.168.1.2:1338/rootDesc.xml\r\n"));
        assert!(msg.contains("ST: upnp:rootdevice\r\n"));
        assert!(msg.contains("USN: uuid:0000-1111::upnp:rootdevice\r\n"));
    }

    #[test]
    fn v6_location_is_bracketed() {
        let shared = shared();
        let msg = shared.make_response("fd00::2".parse().unwrap(), "upnp:rootdevice");
        assert!(msg.contains("LOCATION: http://[fd00::2]:1338/rootDesc.xml\r\n"));
    }

    #[test]
    fn source_ip_selection() {
        let addrs = [
            IfaceAddr {
                ip: "192.168.1.10".parse().unwrap(),
                prefix: 24,
            },
            IfaceAddr {
                ip: "10.8.0.3".parse().unwrap(),
                prefix: 16,
            },
        ];
        assert_eq!(
            source_ip_for(&addrs, "192.168.1.77".parse().unwrap()),
            Some("192.168.1.10".parse().unwrap())
        );
        assert_eq!(
            source_ip_for(&addrs, "10.8.200.1".parse().unwrap()),
            Some("10.8.0.3".parse().unwrap())
        );
        assert_eq!(source_ip_for(&addrs, "172.16.0.1".parse().unwrap()), None);
        // Link-local sender falls back to the first family match.
        assert_eq!(
            source_ip_for(&addrs, "169.254.7.7".parse().unwrap()),
            Some("192.168.1.10".parse().unwrap())
        );
    }

    #[test]
    fn netmask_prefix_conversion() {
        assert_eq!(prefix_from_netmask("255.255.255.0".parse().unwrap()), 24);
        assert_eq!(prefix_from_netmask("255.255.0.0".parse().unwrap()), 16);
        assert_eq!(
            prefix_from_netmask("ffff:ffff:ffff:ffff::".parse().unwrap()),
            64
        );
    }

    #[test]
    fn link_local_detection() {
        assert!(ip_is_link_local("169.254.1.1".parse().unwrap()));
        assert!(ip_is_link_local("fe80::1".parse().unwrap()));
        assert!(!ip_is_link_local("192.168.1.1".parse().unwrap()));
        assert!(!ip_is_link_local("fd00::1".parse().unwrap()));
    }
}
