//! Owner login
//!
//! A single configured account signs in with username and password; the
//! session token is stored in the `session` cookie.

use axum::{
    Form, Router,
    extract::State,
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::Deserialize;

use super::session::{SESSION_COOKIE, Session, create_session_token, credentials_match};
use crate::AppState;
use crate::error::AppError;

/// Create authentication router
///
/// Routes:
/// - GET /login - Login page
/// - POST /login - Check credentials, set session cookie
/// - POST /logout - Clear session cookie
pub fn auth_router() -> Router<AppState> {
    Router::new()
        .route("/login", get(login_page).post(login))
        .route("/logout", post(logout))
}

/// GET /login
async fn login_page() -> impl IntoResponse {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Login</title></head>
<body>
<form method="post" action="/login">
<input type="text" name="username" placeholder="Username" autocomplete="username">
<input type="password" name="password" placeholder="Password" autocomplete="current-password">
<input type="submit" value="Login">
</form>
</body>
</html>"#,
    )
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
    /// Local path to go to after login
    #[serde(default)]
    redirect: Option<String>,
}

/// POST /login
async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<impl IntoResponse, AppError> {
    let auth = &state.config.auth;
    let username_ok = credentials_match(&form.username, &auth.username, &auth.session_secret);
    let password_ok = credentials_match(&form.password, &auth.password, &auth.session_secret);
    if !(username_ok && password_ok) {
        tracing::warn!(username = %form.username, "Failed login attempt");
        return Err(AppError::Unauthorized);
    }

    let session = Session::new(&auth.username, auth.session_max_age);
    let token = create_session_token(&session, &auth.session_secret)?;

    let cookie = Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.config.should_use_secure_cookies())
        .build();

    // Only local paths; "//host" would leave the site.
    let target = form
        .redirect
        .filter(|r| r.starts_with('/') && !r.starts_with("//"))
        .unwrap_or_else(|| "/".to_string());

    tracing::info!(username = %auth.username, "Logged in");
    Ok((jar.add(cookie), Redirect::to(&target)))
}

/// POST /logout
async fn logout(jar: CookieJar) -> impl IntoResponse {
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/").build()),
        Redirect::to("/login"),
    )
}
