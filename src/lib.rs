//! # tandem-dl
//!
//! A multi-protocol download engine driven by a single non-blocking I/O
//! thread.
//!
//! ## Features
//!
//! - **Cooperative scheduling**: every transfer is a task run once per turn
//!   over one mio reactor; no locks, no thread pool
//! - **Stream downloads**: segmented HTTP/FTP transfers behind a pluggable
//!   [`stream::StreamSource`]
//! - **BitTorrent plumbing**: DHT (BEP 5), UDP trackers (BEP 15) and the
//!   extension protocol (BEP 9, 10, 11)
//! - **Credentials**: netrc and Basic auth resolution per host and path
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tandem_dl::{DownloadEngine, EngineConfig};
//!
//! # struct Backend;
//! # impl tandem_dl::stream::StreamSourceFactory for Backend {
//! #     fn open(&self, _: &str, _: Option<&tandem_dl::AuthConfig>) -> tandem_dl::Result<Box<dyn tandem_dl::stream::StreamSource>> { unimplemented!() }
//! # }
//! # fn backend() -> impl tandem_dl::stream::StreamSourceFactory { Backend }
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = DownloadEngine::new(EngineConfig::default())?
//!         .with_stream_factory(backend());
//!
//!     let gid = engine.add_uri(vec!["https://example.com/file.zip".into()])?;
//!     engine.run();
//!
//!     println!("{:?}", engine.results().get(gid));
//!     Ok(())
//! }
//! ```

// Modules
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod rpc;
pub mod stream;
pub mod torrent;
pub mod types;

// Re-exports for convenience
pub use auth::{AuthConfig, AuthConfigFactory, AuthOptions, CredentialRequest, Netrc};
pub use config::{EngineConfig, FtpConfig, HttpConfig, TorrentConfig};
pub use engine::{DownloadEngine, EngineContext, Execute, Task, TaskStatus};
pub use error::{
    EngineError, ErrorCode, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind,
};
pub use group::man::{DownloadResult, DownloadResults, RequestGroupMan};
pub use group::RequestGroup;
pub use types::{Cuid, GroupId, GroupState, HaltReason};
