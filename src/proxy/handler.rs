use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::{Method, Request, Response, StatusCode, body::Incoming};
use tracing::{debug, warn};

use crate::{
    config::Settings,
    policy::{PolicyResolver, RouteDirective},
    proxy::{forward, tunnel},
};

/// Dispatch one request: resolve the route, then hand off to the matching
/// path. A resolver failure is answered with a 500 before any connection
/// is touched.
pub async fn handle_request(
    req: Request<Incoming>,
    resolver: Arc<dyn PolicyResolver>,
    settings: Arc<Settings>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    debug!(
        client = %client_addr,
        method = %req.method(),
        uri = %req.uri(),
        headers = ?req.headers(),
        "incoming request"
    );

    let route = match resolver.find_proxy(req.uri()) {
        Ok(route) => route,
        Err(e) => {
            warn!(uri = %req.uri(), "route resolution failed: {e}");
            return Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("route resolution failed: {e}"),
            ));
        }
    };

    let response = if req.method() == Method::CONNECT {
        match route {
            RouteDirective::Direct => tunnel::connect_direct(req, &settings, client_addr).await,
            RouteDirective::ViaProxy(proxy) => {
                tunnel::connect_via_proxy(req, &proxy, &settings, client_addr).await
            }
        }
    } else {
        forward::forward(req, &route, &settings).await
    };
    Ok(response)
}

pub fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn status_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

pub fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full_body(format!("{message}\n")));
    *resp.status_mut() = status;
    resp
}
