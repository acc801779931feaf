use core::net::{IpAddr, SocketAddr};

use eyre::WrapErr as _;
use tokio::{net, signal};

use crate::{
    config::GatewayConfig,
    http::server::router,
    state::{self, AppState},
};

/// Creates a future that resolves when a shutdown signal is received.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to create SIGTERM signal handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        drop(signal::ctrl_c().await);
    }
}

/// Start the HTTP server.
pub(crate) async fn start_server(
    app_state: AppState,
    listen_ip: IpAddr,
    listen_port: u16,
) -> eyre::Result<()> {
    let app = router::create_app(app_state).into_make_service();

    let addr = SocketAddr::from((listen_ip, listen_port));
    let listener = net::TcpListener::bind(addr)
        .await
        .wrap_err(format!("failed to bind {addr}"))?;
    tracing::info!("Listening on http://{}", addr);

    let server = axum::serve(listener, app);
    tokio::select! {
        res = server => res?,
        () = shutdown_signal() => {
            tracing::info!("Received shutdown, shutting down");
        }
    }

    Ok(())
}

/// # Errors
///
/// Returns an error if the bind address is invalid, provider discovery fails, or the server
/// cannot bind.
pub(crate) async fn start(config: &GatewayConfig, bind: &str, port: u16) -> eyre::Result<()> {
    tracing::info!("Starting HTTP server...");

    let app_state = state::initialize_state(config).await?;
    let listen_ip: IpAddr = bind
        .parse()
        .wrap_err(format!("invalid bind address: {bind}"))?;

    start_server(app_state, listen_ip, port).await
}
