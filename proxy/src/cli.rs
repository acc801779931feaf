//! Command-line interface definitions for the gateway.
//!
//! Every setting can also be supplied through an `AUTHGATE_*` environment variable, which is
//! how the sidecar deployment configures it.

use alloc::sync::Arc;
use core::convert::Infallible;

use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::SecretString;

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the authorization filter and the OIDC login endpoints.
    Serve(ServiceArgs),
}

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
    Pretty,
}

/// Arguments for the serve command.
#[derive(Debug, Parser)]
pub struct ServiceArgs {
    /// Port to listen on
    #[arg(long, env = "AUTHGATE_PORT", default_value = "3002")]
    pub port: u16,

    /// Address to bind to
    #[arg(long, env = "AUTHGATE_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "AUTHGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub oidc: OidcArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}

/// Identity provider settings. Leaving any of the four required ones out disables OIDC,
/// and every filter and login request is then answered with 503.
#[derive(Debug, Args)]
pub struct OidcArgs {
    #[arg(long = "oidc-client-id", env = "AUTHGATE_OIDC_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Client secret; also keys the credential cipher and the login link signatures
    #[arg(
        long = "oidc-client-secret",
        env = "AUTHGATE_OIDC_CLIENT_SECRET",
        hide_env_values = true,
        value_parser = parse_secret
    )]
    pub client_secret: Option<Arc<SecretString>>,

    /// Issuer URL, used for discovery
    #[arg(long = "oidc-provider-url", env = "AUTHGATE_OIDC_PROVIDER_URL")]
    pub provider_url: Option<String>,

    /// Public base URL under which this gateway serves `/oidc/login` and `/oidc/callback`
    #[arg(long = "oidc-auth-proxy-url", env = "AUTHGATE_OIDC_AUTH_PROXY_URL")]
    pub auth_proxy_url: Option<String>,

    #[arg(
        long = "oidc-scopes",
        env = "AUTHGATE_OIDC_SCOPES",
        value_delimiter = ',',
        default_value = "openid,profile,email,groups,offline_access"
    )]
    pub scopes: Vec<String>,

    /// Discovery attempts at startup before giving up; waits double from 1s up to 30s
    #[arg(
        long = "oidc-discovery-attempts",
        env = "AUTHGATE_OIDC_DISCOVERY_ATTEMPTS",
        default_value = "5",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub discovery_attempts: u32,
}

/// Session lifetime and refresh tuning.
#[derive(Debug, Args)]
pub struct SessionArgs {
    /// Lifetime of the session cookie
    #[arg(long, env = "AUTHGATE_SESSION_MAX_AGE_DAYS", default_value = "7")]
    pub session_max_age_days: u32,

    /// How long a finished refresh stays shared with late arrivals holding the same refresh token
    #[arg(long, env = "AUTHGATE_REFRESH_GRACE_SECS", default_value = "60")]
    pub refresh_grace_secs: u64,

    /// Upper bound for a single refresh call against the provider
    #[arg(long, env = "AUTHGATE_REFRESH_TIMEOUT_SECS", default_value = "10")]
    pub refresh_timeout_secs: u64,

    /// How long a signed login link handed out by the filter stays valid
    #[arg(long, env = "AUTHGATE_LOGIN_LINK_MAX_AGE_SECS", default_value = "600")]
    pub login_link_max_age_secs: u64,
}

fn parse_secret(raw: &str) -> Result<Arc<SecretString>, Infallible> {
    Ok(Arc::new(SecretString::from(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_flags() {
        let cli = Cli::try_parse_from(["authgate", "serve"]).unwrap();
        let Command::Serve(args) = cli.command;
        assert_eq!(args.port, 3002, "default port");
        assert_eq!(args.bind, "0.0.0.0", "default bind");
        assert_eq!(
            args.oidc.scopes,
            ["openid", "profile", "email", "groups", "offline_access"],
            "default scopes"
        );
        assert_eq!(args.session.session_max_age_days, 7, "cookie lifetime");
        assert_eq!(args.session.refresh_grace_secs, 60, "grace window");
    }

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let cli = Cli::try_parse_from([
            "authgate",
            "serve",
            "--oidc-client-secret",
            "super-secret-value",
            "--oidc-scopes",
            "openid,groups",
        ])
        .unwrap();
        let rendered = format!("{cli:?}");
        assert!(
            !rendered.contains("super-secret-value"),
            "secret leaked: {rendered}"
        );
        let Command::Serve(args) = cli.command;
        assert_eq!(args.oidc.scopes, ["openid", "groups"], "comma list");
    }
}
