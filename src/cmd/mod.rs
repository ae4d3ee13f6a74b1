//! CLI command implementations.
//!
//! | Module     | Commands handled            |
//! |------------|-----------------------------|
//! | `init`     | `Init`                      |
//! | `queue`    | `Queue`, `Status`           |
//! | `run`      | `Run`                       |
//! | `evidence` | `Evidence`                  |
//! | `config`   | `Config`                    |
//! | `serve`    | `Serve`                     |

pub mod config;
pub mod evidence;
pub mod init;
pub mod queue;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use evidence::cmd_evidence;
pub use init::cmd_init;
pub use queue::{cmd_queue, cmd_status};
pub use run::cmd_run;
pub use serve::cmd_serve;
