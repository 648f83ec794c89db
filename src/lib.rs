pub mod cache;
pub mod cds;
pub mod config;
pub mod dlna;
pub mod dynamic;
pub mod error;
pub mod eventing;
pub mod logging;
pub mod mime;
pub mod object;
pub mod platform;
pub mod probe;
pub mod server;
pub mod soap;
pub mod ssdp;
pub mod transcode;
pub mod web;

pub mod state {
    use crate::{server::ServerCore, soap::ServiceRegistry};
    use std::sync::Arc;

    /// Shared handle threaded through every HTTP handler.
    #[derive(Clone)]
    pub struct AppState {
        pub core: Arc<ServerCore>,
        pub services: Arc<ServiceRegistry>,
        pub root_desc: Arc<String>,
    }
}
