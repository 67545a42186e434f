//! Static/misc routes: favicon redirect and robots.txt (spec.md §4.4).

use axum::response::{IntoResponse, Redirect, Response};

const UPSTREAM_FAVICON: &str = "https://e-hentai.org/favicon.ico";
const ROBOTS_BODY: &str = "User-agent: *\nDisallow: /";

pub async fn favicon() -> Redirect {
    Redirect::temporary(UPSTREAM_FAVICON)
}

pub async fn robots() -> Response {
    ([(axum::http::header::CONTENT_TYPE, "text/plain")], ROBOTS_BODY).into_response()
}
