//! Composition root: shared server state, service wiring, the HTTP
//! listener and shutdown choreography.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CachedProbe, ProbeCache, ProbeKey};
use crate::cds::{ConnectionManagerService, ContentDirectoryService, MediaReceiverRegistrarService};
use crate::config::{Config, IpFilter};
use crate::eventing::Subscriptions;
use crate::object::{FilterOptions, ObjectModel};
use crate::probe::{self, ProbeError};
use crate::soap::ServiceRegistry;
use crate::ssdp;
use crate::state::AppState;
use crate::web;

/// The UPnP `SERVER`/`Server` header value.
pub const SERVER_FIELD: &str = concat!(
    "Linux/3.4 DLNADOC/1.50 UPnP/1.0 dlnacast/",
    env!("CARGO_PKG_VERSION")
);

pub const ROOT_DEVICE_TYPE: &str = "urn:schemas-upnp-org:device:MediaServer:1";

/// A UPnP service exposed by the device.
pub struct ServiceDef {
    pub service_type: &'static str,
    pub service_id: &'static str,
    /// Trailing path segment for SCPD and eventing URLs.
    pub url_key: &'static str,
    pub scpd: &'static str,
}

pub fn services() -> &'static [ServiceDef] {
    use crate::web::xml;
    static SERVICES: &[ServiceDef] = &[
        ServiceDef {
            service_type: "urn:schemas-upnp-org:service:ContentDirectory:1",
            service_id: "urn:upnp-org:serviceId:ContentDirectory",
            url_key: "ContentDirectory",
            scpd: xml::CONTENT_DIRECTORY_SCPD,
        },
        ServiceDef {
            service_type: "urn:schemas-upnp-org:service:ConnectionManager:1",
            service_id: "urn:upnp-org:serviceId:ConnectionManager",
            url_key: "ConnectionManager",
            scpd: xml::CONNECTION_MANAGER_SCPD,
        },
        ServiceDef {
            service_type: "urn:microsoft.com:service:X_MS_MediaReceiverRegistrar:1",
            service_id: "urn:microsoft.com:serviceId:X_MS_MediaReceiverRegistrar",
            url_key: "X_MS_MediaReceiverRegistrar",
            scpd: xml::MEDIA_RECEIVER_REGISTRAR_SCPD,
        },
    ];
    SERVICES
}

/// SSDP notification targets: the root device, the device UUID, device
/// types and service types.
pub fn ssdp_targets(udn: &str) -> Vec<String> {
    let mut targets = vec!["upnp:rootdevice".to_string(), udn.to_string()];
    targets.push(ROOT_DEVICE_TYPE.to_string());
    targets.extend(services().iter().map(|s| s.service_type.to_string()));
    targets
}

/// One remembered HTTP client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub user_agent: String,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub requests: u64,
}

/// State shared by the CDS, the web layer and the SSDP engines.
pub struct ServerCore {
    pub config: Config,
    /// Device UDN, `uuid:<v5-of-friendly-name>`.
    pub udn: String,
    pub friendly_name: String,
    pub http_port: u16,
    pub model: ObjectModel,
    pub probe_cache: ProbeCache,
    pub subscriptions: Subscriptions,
    pub ip_filter: RwLock<IpFilter>,
    clients: Mutex<HashMap<IpAddr, ClientInfo>>,
}

impl ServerCore {
    pub fn new(mut config: Config, http_port: u16) -> Result<Self> {
        config.path = config
            .path
            .canonicalize()
            .with_context(|| format!("resolving content root {}", config.path.display()))?;

        let friendly_name = config.friendly_name.clone();
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_DNS, friendly_name.as_bytes());
        let ip_filter = config.ip_filter()?;
        let model = ObjectModel::new(
            config.path.clone(),
            FilterOptions {
                ignore_hidden: config.ignore_hidden,
                ignore_unreadable: config.ignore_unreadable,
                ignore_paths: config.ignore_paths.clone(),
                allow_dynamic_streams: config.allow_dynamic_streams,
            },
        );
        let probe_cache = ProbeCache::new(config.probe_cache_budget);

        Ok(Self {
            config,
            udn: format!("uuid:{uuid}"),
            friendly_name,
            http_port,
            model,
            probe_cache,
            subscriptions: Subscriptions::new(),
            ip_filter: RwLock::new(ip_filter),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// A constant for the process lifetime; the library is enumerated live
    /// so there is no mutation counter to track.
    pub fn system_update_id(&self) -> u32 {
        std::process::id()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.ip_filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .allows(ip)
    }

    /// Records a client sighting for the seen-clients table.
    pub fn note_client(&self, ip: IpAddr, user_agent: &str) {
        let now = SystemTime::now();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .entry(ip)
            .and_modify(|c| {
                c.last_seen = now;
                c.requests += 1;
                if !user_agent.is_empty() {
                    c.user_agent = user_agent.to_string();
                }
            })
            .or_insert_with(|| ClientInfo {
                user_agent: user_agent.to_string(),
                first_seen: now,
                last_seen: now,
                requests: 1,
            });
    }

    pub fn seen_clients(&self) -> Vec<(IpAddr, ClientInfo)> {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.iter().map(|(ip, info)| (*ip, info.clone())).collect()
    }

    /// Probes a file through the cache. Returns `None` when probing is
    /// disabled, unavailable, or remembered to have failed for this
    /// (path, mtime).
    pub async fn probe_file(&self, fs_path: &Path) -> CachedProbe {
        if self.config.no_probe {
            return None;
        }
        let meta = match std::fs::metadata(fs_path) {
            Ok(meta) => meta,
            Err(_) => return None,
        };
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
            .unwrap_or(0);
        let key = ProbeKey {
            path: fs_path.to_path_buf(),
            mtime_ns,
        };
        let path = fs_path.to_path_buf();
        self.probe_cache
            .get(key, || async move {
                match probe::probe(&path).await {
                    Ok(result) => Ok(Some(Arc::new(result))),
                    // Unavailability is not a per-file condition; stay quiet.
                    Err(ProbeError::Unavailable) => Ok(None),
                    Err(e) => {
                        warn!(path = %path.display(), "probe failed: {e}");
                        Ok(None)
                    }
                }
            })
            .await
            .unwrap_or_default()
    }

    pub fn load_probe_cache(&self) {
        let Some(path) = &self.config.ffprobe_cache_path else {
            return;
        };
        match self.probe_cache.load(path) {
            Ok(0) => {}
            Ok(n) => info!(entries = n, "restored probe cache"),
            Err(e) => warn!("couldn't load probe cache: {e:#}"),
        }
    }

    pub fn save_probe_cache(&self) {
        let Some(path) = &self.config.ffprobe_cache_path else {
            return;
        };
        if let Err(e) = self.probe_cache.save(path) {
            warn!("couldn't save probe cache: {e:#}");
        }
    }
}

fn build_registry(core: &Arc<ServerCore>) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry.register(
        "ContentDirectory",
        Arc::new(ContentDirectoryService::new(core.clone())),
    );
    registry.register(
        "ConnectionManager",
        Arc::new(ConnectionManagerService::default()),
    );
    registry.register(
        "X_MS_MediaReceiverRegistrar",
        Arc::new(MediaReceiverRegistrarService::default()),
    );
    registry
}

/// Binds the HTTP listener, wires the services and runs until a shutdown
/// signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let addr = config.http_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding HTTP listener on {addr}"))?;
    let local_addr = listener.local_addr()?;

    let core = Arc::new(ServerCore::new(config, local_addr.port())?);
    core.load_probe_cache();

    let registry = Arc::new(build_registry(&core));
    let root_desc = Arc::new(web::xml::generate_device_description(
        &core.friendly_name,
        &core.udn,
    ));
    let state = AppState {
        core: core.clone(),
        services: registry,
        root_desc,
    };

    info!(udn = %core.udn, name = %core.friendly_name, "serving on http://{local_addr}");
    info!(root = %core.model.root_path().display(), "content root");

    let shutdown = CancellationToken::new();
    let ssdp_tasks = ssdp::spawn_engines(ssdp::SsdpOptions {
        udn: core.udn.clone(),
        server_string: SERVER_FIELD.to_string(),
        targets: ssdp_targets(&core.udn),
        http_port: core.http_port,
        notify_interval: core.config.notify_interval(),
        if_name: if core.config.if_name.is_empty() {
            None
        } else {
            Some(core.config.if_name.clone())
        },
        ip_filter: core
            .ip_filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone(),
        shutdown: shutdown.clone(),
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    let app = web::create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await
    .context("HTTP server failed")?;

    // Give the SSDP engines a moment to say goodbye before we exit.
    match tokio::time::timeout(std::time::Duration::from_secs(5), ssdp_tasks).await {
        Ok(()) => debug!("SSDP engines stopped"),
        Err(_) => warn!("SSDP engines did not stop in time"),
    }

    core.save_probe_cache();
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("couldn't install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_for(dir: &Path) -> ServerCore {
        let config = Config {
            path: dir.to_path_buf(),
            ffprobe_cache_path: None,
            ..Default::default()
        };
        ServerCore::new(config, 1338).unwrap()
    }

    #[test]
    fn device_uuid_is_stable_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let a = core_for(dir.path());
        let b = core_for(dir.path());
        assert_eq!(a.udn, b.udn);
        assert!(a.udn.starts_with("uuid:"));

        let mut config = Config {
            path: dir.path().to_path_buf(),
            friendly_name: "another name".into(),
            ffprobe_cache_path: None,
            ..Default::default()
        };
        config.validate().unwrap();
        let c = ServerCore::new(config, 1338).unwrap();
        assert_ne!(a.udn, c.udn);
    }

    #[test]
    fn ssdp_target_set_is_complete() {
        let targets = ssdp_targets("uuid:1234");
        assert!(targets.contains(&"upnp:rootdevice".to_string()));
        assert!(targets.contains(&"uuid:1234".to_string()));
        assert!(targets.contains(&ROOT_DEVICE_TYPE.to_string()));
        assert!(targets
            .iter()
            .any(|t| t == "urn:schemas-upnp-org:service:ContentDirectory:1"));
        assert_eq!(targets.len(), 3 + services().len());
    }

    #[test]
    fn seen_clients_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_for(dir.path());
        let ip: IpAddr = "192.168.1.50".parse().unwrap();
        core.note_client(ip, "VLC/3.0");
        core.note_client(ip, "VLC/3.0");
        let clients = core.seen_clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].1.requests, 2);
    }
}
