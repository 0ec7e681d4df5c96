pub mod certs;
pub mod config;
pub mod error;
pub mod host;
pub mod proxy;
pub mod renewal;
pub mod route_config;

pub use certs::{CertificateEntry, CertificateStore, Generation, SniCertResolver};
pub use config::Config;
pub use error::{CertificateError, ForwardError, LoadError, RenewalError};
pub use proxy::{
    ForwardingGateway, Listener, ListenerConfig, ListenerKind, RequestHandler, ResponsePolicy,
    RouteDecision, RouteEntry, RouteTable, SharedRouteTable,
};
pub use renewal::{CommandTool, RenewalOutcome, RenewalScheduler, RenewalState, RenewalTool};
