use hyper::Body;
use hyper::Response;
use hyper::StatusCode;

pub(crate) const BLOCKED_BODY: &str = "Connection blocked by network allowlist";
pub(crate) const PROXY_ERROR_HEADER: &str = "x-proxy-error";
pub(crate) const PROXY_ERROR_BLOCKED: &str = "blocked-by-allowlist";

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from(body.to_string())))
}

/// The 403 returned for any destination the filter rejects.
pub(crate) fn blocked_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header("content-type", "text/plain")
        .header(PROXY_ERROR_HEADER, PROXY_ERROR_BLOCKED)
        .body(Body::from(BLOCKED_BODY))
        .unwrap_or_else(|_| Response::new(Body::from(BLOCKED_BODY)))
}
