pub mod abort;
pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod errors;
pub mod gates;
pub mod orchestrator;
pub mod review;
pub mod state;
pub mod stride_config;
pub mod telemetry;
pub mod ui;
pub mod util;
pub mod worker;
