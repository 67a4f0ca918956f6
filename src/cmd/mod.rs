//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                        |
//! |-----------|---------------------------------------------------------|
//! | `project` | `Init`, `Import`                                        |
//! | `status`  | `Status`, `History`                                     |
//! | `run`     | `Run`                                                   |
//! | `control` | `Policy`, `Confirm`, `Resume`, `Cancel`, `Reopen`, `Blocker` |
//! | `config`  | `Config`                                                |
//! | `maintenance` | `Backup`, `Compact`, `Migrate`                      |

pub mod config;
pub mod control;
pub mod maintenance;
pub mod project;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use control::{cmd_blocker, cmd_cancel, cmd_confirm, cmd_policy, cmd_reopen, cmd_resume};
pub use maintenance::{cmd_backup, cmd_compact, cmd_migrate};
pub use project::{cmd_import, cmd_init};
pub use run::{RunOptions, cmd_run};
pub use status::{cmd_history, cmd_status};
