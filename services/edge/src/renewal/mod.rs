//! Certificate renewal.
//!
//! - [`RenewalTool`] refreshes certificate files on disk (`certbot renew` in
//!   production, through [`CommandTool`])
//! - [`RenewalScheduler`] runs the tool periodically and swaps the reloaded
//!   generation into the certificate store, one run at a time

mod tool;
mod worker;

pub use tool::{CommandTool, RenewalTool, ToolOutput};
pub use worker::{
    RenewalOutcome, RenewalScheduler, RenewalState, DEFAULT_RENEW_INTERVAL, MIN_RENEW_INTERVAL,
};
