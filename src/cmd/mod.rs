//! CLI command implementations.
//!
//! | Module    | Commands handled                                  |
//! |-----------|---------------------------------------------------|
//! | `serve`   | `Serve`                                           |
//! | `session` | `Plan`, `Approve`, `Fast`, `Repair`, `Reset`      |
//! | `config`  | `Config`                                          |

pub mod config;
pub mod serve;
pub mod session;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use session::{cmd_approve, cmd_fast, cmd_plan, cmd_repair, cmd_reset};
