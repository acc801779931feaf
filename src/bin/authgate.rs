//! Shim binary that calls into the `authgate_proxy` library's `inner_main`.
use authgate_proxy::cli::Cli;
use clap::Parser as _;
use eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    authgate_proxy::inner_main(Cli::parse()).await
}
