//! Sync orchestration: configuration, the single-flight sync service,
//! advisory checks and the scheduled trigger.

pub mod anomaly;
pub mod clock;
pub mod config;
pub mod schedule;
pub mod service;
pub mod status;
pub mod testing;

pub use anomaly::{collision_report, mass_disappearance, Anomaly, CollisionReport};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ScheduleInterval, SyncConfig};
pub use schedule::build_scheduler;
pub use service::{EventCounts, MaintenanceError, SyncError, SyncOutcome, SyncPhase, SyncService, SyncStatus, Trigger};
pub use status::{last_schema_report, status_report, LastSync, LockInfo, StatusReport};

pub const CRATE_NAME: &str = "jobfeed-sync";
