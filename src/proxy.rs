//! Rewriting reverse proxy
//!
//! A single pooled HTTP client forwards hot-path requests to the
//! container's published port. Relative redirects coming back from the
//! app are rewritten into the router's `/app/...` URL space so the next
//! click re-enters the hot path; absolute redirects pass through.

use crate::app::AppId;
use crate::error::{json_error_response, RouterErrorCode};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, LOCATION};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error};

/// Pooled client for forwarding requests to app containers
pub struct ProxyClient {
    client: Client<HttpConnector, Incoming>,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self { client }
    }

    /// Forward a request to `target` and return the app's response, with
    /// relative redirects pulled back into the router's URL space.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        target: Uri,
        app: &AppId,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let (parts, body) = req.into_parts();

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(target.clone());
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let outbound = match builder.body(body) {
            Ok(r) => r,
            Err(e) => {
                error!(app = %app, error = %e, "Failed to build outbound request");
                return json_error_response(RouterErrorCode::InternalError, "Proxy request error");
            }
        };

        debug!(app = %app, target = %target, "Proxying request");

        match self.client.request(outbound).await {
            Ok(response) => {
                let (mut rparts, rbody) = response.into_parts();

                if rparts.status.is_redirection() {
                    let rewritten = rparts
                        .headers
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|loc| rewrite_location(loc, app));
                    if let Some(location) = rewritten {
                        if let Ok(value) = HeaderValue::from_str(&location) {
                            rparts.headers.insert(LOCATION, value);
                        }
                    }
                }

                Response::from_parts(rparts, rbody.boxed())
            }
            Err(e) => {
                error!(app = %app, target = %target, error = %e, "Failed to reach app");
                json_error_response(
                    RouterErrorCode::UpstreamUnreachable,
                    "Failed to connect to application",
                )
            }
        }
    }
}

/// Rewrite a redirect target into the router's URL space. Absolute
/// locations (carrying an http/https scheme) pass through untouched and
/// yield `None`.
pub fn rewrite_location(location: &str, app: &AppId) -> Option<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return None;
    }
    Some(format!(
        "/app/{}/{}/{}{}",
        app.org, app.repo, app.commit, location
    ))
}
