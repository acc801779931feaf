//! Cookie handling for the session credential.

use core::time::Duration;

use axum::http::HeaderMap;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use cookie::{
    SameSite,
    time::{Duration as CookieDuration, OffsetDateTime},
};

/// Name of the session cookie, and of the one-shot query parameter that installs it.
pub const COOKIE_SSO: &str = "authgate-sso";

/// Create the session cookie carrying a sealed credential.
pub(crate) fn create_session_cookie(
    sealed: String,
    max_age: Duration,
    secure: bool,
) -> Cookie<'static> {
    let max_age = CookieDuration::try_from(max_age).unwrap_or(CookieDuration::days(7));
    Cookie::build((COOKIE_SSO, sealed))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(max_age)
        .expires(OffsetDateTime::now_utc() + max_age)
        .path("/")
        .build()
}

/// Add a cookie that makes the browser drop the session immediately.
///
/// `CookieJar::remove` only emits a removal for cookies the jar already holds, and the filter
/// answers with a fresh jar, so the removal cookie is added explicitly.
pub(crate) fn clear_session_cookie(jar: CookieJar, secure: bool) -> CookieJar {
    let mut removal = Cookie::build(COOKIE_SSO)
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    removal.make_removal();
    jar.add(removal)
}

/// Heuristic to determine whether the original request reached the edge over HTTPS.
pub(crate) fn request_is_secure(headers: &HeaderMap) -> bool {
    if let Some(p) = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        && p.eq_ignore_ascii_case("https")
    {
        return true;
    }
    if let Some(fwd) = headers.get("forwarded").and_then(|v| v.to_str().ok())
        && fwd.to_lowercase().contains("proto=https")
    {
        return true;
    }
    if let Some(x) = headers.get("x-forwarded-ssl").and_then(|v| v.to_str().ok())
        && x.eq_ignore_ascii_case("on")
    {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, header::SET_COOKIE};
    use axum::response::IntoResponse as _;

    use super::*;

    #[test]
    fn session_cookie_attributes() {
        let cookie = create_session_cookie(
            "sealed".to_owned(),
            Duration::from_secs(7 * 24 * 60 * 60),
            true,
        );
        assert_eq!(cookie.name(), COOKIE_SSO, "name");
        assert_eq!(cookie.value(), "sealed", "value");
        assert_eq!(cookie.http_only(), Some(true), "http only");
        assert_eq!(cookie.secure(), Some(true), "secure");
        assert_eq!(cookie.same_site(), Some(SameSite::Lax), "same site");
        assert_eq!(cookie.path(), Some("/"), "path");
        assert_eq!(cookie.max_age(), Some(CookieDuration::days(7)), "max age");
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let response = clear_session_cookie(CookieJar::new(), false).into_response();
        let header = response
            .headers()
            .get(SET_COOKIE)
            .expect("set-cookie present")
            .to_str()
            .unwrap();
        let cookie = Cookie::parse(header).unwrap();
        assert_eq!(cookie.name(), COOKIE_SSO, "name");
        assert_eq!(cookie.value(), "", "emptied");
        assert_eq!(cookie.max_age(), Some(CookieDuration::ZERO), "max-age 0");
        assert!(
            cookie
                .expires_datetime()
                .is_some_and(|at| at < OffsetDateTime::now_utc()),
            "expiry in the past"
        );
    }

    #[test]
    fn clearing_works_on_an_empty_jar() {
        let jar = clear_session_cookie(CookieJar::new(), true);
        let cookie = jar.get(COOKIE_SSO).expect("removal cookie in jar");
        assert_eq!(cookie.value(), "", "emptied");
        assert_eq!(cookie.max_age(), Some(CookieDuration::ZERO), "max-age 0");
        assert_eq!(cookie.path(), Some("/"), "same path as the session");
        assert_eq!(cookie.secure(), Some(true), "secure kept");
    }

    #[test]
    fn secure_detection_from_forwarding_headers() {
        let mut headers = HeaderMap::new();
        assert!(!request_is_secure(&headers), "plain");
        headers.insert("x-forwarded-proto", HeaderValue::from_static("HTTPS"));
        assert!(request_is_secure(&headers), "x-forwarded-proto");

        let mut headers = HeaderMap::new();
        headers.insert(
            "forwarded",
            HeaderValue::from_static("for=10.0.0.1;proto=https"),
        );
        assert!(request_is_secure(&headers), "forwarded");
    }
}
