//! Service layer for map-server
//!
//! Status notifications, facility placement, monitor watches, the campaign
//! loop and the task engine that ties them together.

pub mod campaign;
pub mod monitor;
pub mod placement;
pub mod status;
pub mod tasks;
pub mod worker;

pub use campaign::{CampaignAction, CampaignService};
pub use monitor::MonitorService;
pub use placement::PlacementService;
pub use status::StatusService;
pub use tasks::{TaskCounters, TaskMetrics, TaskRunner};
pub use worker::WorkerPool;
