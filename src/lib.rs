// SPDX-License-Identifier: Apache-2.0

pub mod batch;
pub mod bounded_channel;
pub mod checksum;
pub mod config;
pub mod discover;
pub mod error;
pub mod forward;
pub mod kubernetes;
pub mod metadata;
pub mod pid_file;
pub mod pipeline;
pub mod shutdown;
pub mod state;
pub mod tail;

/// Version string reported in the User-Agent header and recorded in the
/// statefile. The build SHA is set during CI.
pub fn version() -> String {
    let build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");
    format!("{}-{}", env!("CARGO_PKG_VERSION"), build)
}

pub fn user_agent() -> String {
    format!("timber-agent/{}", version())
}
