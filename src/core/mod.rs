//! Core types shared by every command: configuration and cancellation.

mod cancel;
mod config;

pub use cancel::CancelToken;
pub use config::{BranchesConfig, Config, GeneralConfig, SessionsConfig, ShipConfig, SwitchConfig};
