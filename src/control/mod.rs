//! The logger control plane: the authoritative store of cruises, modes,
//! loggers and configs, and the API through which everything reads and
//! mutates it.

pub mod api;
pub mod cruise;
pub mod store;

pub use api::{ApiError, ControlApi, LoggerStatus, StatusMap};
pub use cruise::CruiseConfig;
pub use store::ControlStore;
