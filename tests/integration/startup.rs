//! Process-level behaviour of the gateway binary.

use reqwest::{StatusCode, Version};

use crate::common::{
    KillOnDrop, client, client_builder, get_free_port, spawn_gateway_with_env, wait_for_exit,
    wait_for_listening,
};

#[tokio::test]
async fn unconfigured_gateway_serves_but_fails_closed() {
    let port = get_free_port();
    let _guard = KillOnDrop(spawn_gateway_with_env(port, &[]));
    wait_for_listening(port, 10).await;

    let client = client();
    let base = format!("http://127.0.0.1:{port}");

    let health = client
        .get(format!("{base}/healthz"))
        .send()
        .await
        .expect("healthz request");
    assert_eq!(health.status(), StatusCode::OK, "health check");

    for path in [
        "/ext_authz/dashboard",
        "/oidc/login?original_url=x&now=1&sign=y",
        "/oidc/callback?code=c&state=s",
    ] {
        let resp = client
            .get(format!("{base}{path}"))
            .header("host", "app.example.com")
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE, "{path}");
        assert!(
            resp.headers().get("set-cookie").is_none(),
            "{path}: no cookie"
        );
    }
}

#[tokio::test]
async fn cleartext_http2_is_accepted() {
    let port = get_free_port();
    let _guard = KillOnDrop(spawn_gateway_with_env(port, &[]));
    wait_for_listening(port, 10).await;

    let h2c = client_builder()
        .http2_prior_knowledge()
        .build()
        .expect("failed to build client");
    let resp = h2c
        .get(format!("http://127.0.0.1:{port}/healthz"))
        .send()
        .await
        .expect("h2c request");
    assert_eq!(resp.status(), StatusCode::OK, "health over h2c");
    assert_eq!(resp.version(), Version::HTTP_2, "spoken as HTTP/2");
}

#[tokio::test]
async fn partial_oidc_config_is_treated_as_unconfigured() {
    let port = get_free_port();
    let _guard = KillOnDrop(spawn_gateway_with_env(
        port,
        &[("AUTHGATE_OIDC_CLIENT_ID", "gateway")],
    ));
    wait_for_listening(port, 10).await;

    let resp = client()
        .get(format!("http://127.0.0.1:{port}/ext_authz/"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE, "fails closed");
}

#[tokio::test]
async fn unreachable_provider_aborts_startup() {
    let port = get_free_port();
    let provider_port = get_free_port();
    let provider_url = format!("http://127.0.0.1:{provider_port}");
    let mut guard = KillOnDrop(spawn_gateway_with_env(
        port,
        &[
            ("AUTHGATE_OIDC_CLIENT_ID", "gateway"),
            ("AUTHGATE_OIDC_CLIENT_SECRET", "secret"),
            ("AUTHGATE_OIDC_PROVIDER_URL", &provider_url),
            ("AUTHGATE_OIDC_AUTH_PROXY_URL", "http://127.0.0.1/"),
            ("AUTHGATE_OIDC_DISCOVERY_ATTEMPTS", "2"),
        ],
    ));

    let status = wait_for_exit(&mut guard.0, 30).await;
    assert!(!status.success(), "startup must fail when discovery fails");
}
