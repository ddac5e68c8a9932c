//! arbor-services: the peer registry, the scheduler that speaks the
//! protocol over UDP, and the directory client used to find peers.

pub mod discovery;
pub mod peer;
pub mod scheduler;

pub use discovery::HttpDirectory;
pub use peer::{new_registry, PeerInfo, PeerRegistry};
pub use scheduler::{DownloadError, Scheduler, SchedulerConfig, SchedulerEntry, SchedulerError};
