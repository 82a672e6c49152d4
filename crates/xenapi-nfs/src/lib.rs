//! # xenapi-nfs – XenAPI NFS volume driver
//!
//! Storage-repository and virtual-disk lifecycle over the XenAPI XML-RPC
//! API, specialised for NFS-backed SRs.
//!
//! ## Modules
//!
//! - **types** — Opaque refs, NFS export / volume descriptors, typed records
//! - **error** — Crate error type carrying the original XAPI failure
//! - **config** — Endpoint / credential configuration
//! - **xmlrpc** — XML-RPC value model, codec and XenAPI envelope
//! - **transport** — Transport seam plus the reqwest HTTP transport
//! - **simulated** — In-memory XAPI for tests and offline use
//! - **session** — Login session, pass-through calls, session factory
//! - **sr** / **vdi** / **pbd** / **host** / **pool** / **vm** — Per-class calls
//! - **nfs** — Scoped NFS SR attachment and re-attachment
//! - **driver** — Volume create / connect / delete / copy / resize / attach
//! - **tools** — Guest-side helpers

pub mod types;
pub mod error;
pub mod config;
pub mod xmlrpc;
pub mod transport;
pub mod simulated;
pub mod session;
pub mod sr;
pub mod vdi;
pub mod pbd;
pub mod host;
pub mod pool;
pub mod vm;
pub mod nfs;
pub mod driver;
pub mod tools;

pub use config::XenApiConfig;
pub use driver::NfsVolumeDriver;
pub use error::{XenApiError, XenApiErrorKind, XenApiFailure, XenApiResult};
pub use session::{connect, SessionFactory, XenApiSession};
pub use transport::{HttpTransport, XenApiTransport};
pub use types::{ConnectionData, NfsExport, SrLabels};
