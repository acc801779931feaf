//! Common utilities for integration tests.
//!
//! Spawns the gateway binary with a clean environment, finds free ports and waits for the
//! listener to come up.

use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Once;
use std::time::{Duration, Instant};

use reqwest::{Client, ClientBuilder, redirect::Policy};

const OIDC_ENV: [&str; 6] = [
    "AUTHGATE_OIDC_CLIENT_ID",
    "AUTHGATE_OIDC_CLIENT_SECRET",
    "AUTHGATE_OIDC_PROVIDER_URL",
    "AUTHGATE_OIDC_AUTH_PROXY_URL",
    "AUTHGATE_OIDC_SCOPES",
    "AUTHGATE_OIDC_DISCOVERY_ATTEMPTS",
];

pub fn get_free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("failed to bind to address")
        .local_addr()
        .unwrap()
        .port()
}

/// Guard that kills and waits on a child process when dropped.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        drop(self.0.kill());
        drop(self.0.wait());
    }
}

fn get_gateway_bin() -> &'static str {
    env!("CARGO_BIN_EXE_authgate")
}

/// Spawn the gateway on `127.0.0.1:port`.
///
/// OIDC settings inherited from the caller's environment are removed, so only `envs` decide
/// whether OIDC is configured.
pub fn spawn_gateway_with_env(port: u16, envs: &[(&str, &str)]) -> Child {
    let mut cmd = Command::new(get_gateway_bin());
    for name in OIDC_ENV {
        cmd.env_remove(name);
    }
    cmd.env("AUTHGATE_INTEGRATION_TEST", "1");
    for &(k, v) in envs {
        cmd.env(k, v);
    }
    cmd.args(["serve", "--port", &port.to_string(), "--bind", "127.0.0.1"])
        .stdout(Stdio::null())
        .spawn()
        .expect("failed to start gateway")
}

/// Block until a TCP listener is accepting on `127.0.0.1:port` or timeout.
pub async fn wait_for_listening(port: u16, timeout_secs: u64) {
    let start = Instant::now();
    while TcpStream::connect(("127.0.0.1", port)).is_err() {
        if start.elapsed() > Duration::from_secs(timeout_secs) {
            panic!("server did not start within timeout");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Block until the child exits or timeout.
pub async fn wait_for_exit(child: &mut Child, timeout_secs: u64) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("failed to poll child") {
            return status;
        }
        if start.elapsed() > Duration::from_secs(timeout_secs) {
            panic!("process did not exit within timeout");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// HTTP client that reports redirects instead of following them.
pub fn client() -> Client {
    client_builder().build().expect("failed to build client")
}

/// Client builder with the crypto provider installed and redirects disabled.
pub fn client_builder() -> ClientBuilder {
    static INIT_RUSTLS: Once = Once::new();
    INIT_RUSTLS.call_once(|| {
        rustls_openssl::default_provider()
            .install_default()
            .expect("failed to install default rustls provider");
    });
    Client::builder().redirect(Policy::none())
}
