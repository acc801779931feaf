//! Library entry for the `authgate_proxy` crate.
//!
//! Exposes `inner_main` so the workspace-level shim binary can call into the gateway logic.
//!
//! The gateway plays two roles behind one listener: an external-authorization filter consulted
//! by the mesh sidecar for every inbound request, and the OIDC relying party that runs the
//! browser login and mints session credentials.
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "This is not problematic in tests",)
)]

extern crate alloc;
extern crate core;

pub mod auth;
pub mod cli;
pub mod config;
pub mod http;
pub mod run;
pub mod state;

use std::env;
use std::sync::Once;

use eyre::Result;
use tracing::{Instrument as _, info};
use tracing_subscriber::{EnvFilter, fmt::time::ChronoLocal};

use cli::{Cli, Command, LogFormat};
use config::GatewayConfig;

use crate::run::start;

static INIT_TRACING: Once = Once::new();
static INIT_RUSTLS: Once = Once::new();

/// The gateway's main function; can be called from a shim binary.
///
/// # Errors
///
/// Returns an error if OIDC discovery fails or the server cannot bind.
///
/// # Panics
///
/// Panics if the OpenSSL crypto provider cannot be installed.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    match invocation.command {
        Command::Serve(args) => {
            let log_format = args.log_format;
            INIT_TRACING.call_once(move || {
                let default_level = if env::var("AUTHGATE_INTEGRATION_TEST").is_ok() {
                    "error"
                } else {
                    "info"
                };

                let builder = tracing_subscriber::fmt()
                    .with_env_filter(
                        EnvFilter::try_from_default_env()
                            .unwrap_or_else(|_| EnvFilter::new(default_level)),
                    )
                    .with_timer(ChronoLocal::rfc_3339());

                match log_format {
                    LogFormat::Compact => builder.compact().init(),
                    LogFormat::Json => builder.json().init(),
                    LogFormat::Pretty => builder.pretty().init(),
                }
            });

            let startup_span = tracing::info_span!("gateway.startup", pid = ?std::process::id(), version = env!("CARGO_PKG_VERSION"));

            // Outbound calls to the identity provider go through reqwest with rustls, which
            // needs a process-wide crypto provider before the first client is built.
            INIT_RUSTLS.call_once(|| {
                rustls_openssl::default_provider()
                    .install_default()
                    .expect("failed to install default rustls provider");
            });

            let config = GatewayConfig::from_args(&args);
            startup_span.in_scope(|| info!(oidc = config.oidc.is_some(), "Starting gateway"));

            start(&config, &args.bind, args.port)
                .instrument(startup_span)
                .await
        }
    }
}
