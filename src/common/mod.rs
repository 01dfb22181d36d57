//! Common utilities and types shared across minishard

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{Config, JobConfig, WaitPolicy};
pub use error::{Error, Result};
pub use hash::{hrw_owner, name_hash};
pub use utils::{instance_id, parse_duration, server_ip_of, wait_until};
