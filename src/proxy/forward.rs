use bytes::Bytes;
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper::{
    Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{HOST, HeaderValue},
};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::{
    config::Settings,
    policy::RouteDirective,
    proxy::{dial, handler::error_response},
};

/// Non-CONNECT requests: one round trip through a fresh outbound
/// connection chosen by the route, then the upstream response is returned
/// as-is: status, headers (duplicates included, order per name
/// preserved) and a streamed body. When a proxy is named, the absolute
/// request target is kept and the final host is never dialed here.
///
/// Hop-by-hop headers are forwarded unfiltered in both directions.
pub async fn forward(
    mut req: Request<Incoming>,
    route: &RouteDirective,
    settings: &Settings,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let dial_addr = match route {
        RouteDirective::Direct => {
            let Some(host) = req.uri().host() else {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "request target has no host",
                );
            };
            let default_port = if req.uri().scheme_str() == Some("https") {
                443
            } else {
                80
            };
            let port = req.uri().port_u16().unwrap_or(default_port);
            format!("{host}:{port}")
        }
        RouteDirective::ViaProxy(proxy) => proxy.clone(),
    };

    let stream = match dial(&dial_addr, settings).await {
        Ok(stream) => stream,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("dial {dial_addr}: {e}"),
            );
        }
    };

    // Origin servers get origin-form targets; proxies get the absolute
    // form the client sent.
    if matches!(route, RouteDirective::Direct) {
        if let Err(resp) = to_origin_form(&mut req) {
            return *resp;
        }
    }

    let handshake = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await;
    let (mut sender, conn) = match handshake {
        Ok(parts) => parts,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("handshake with {dial_addr}: {e}"),
            );
        }
    };
    tokio::task::spawn(async move {
        if let Err(e) = conn.await {
            debug!("outbound connection error: {e}");
        }
    });

    match sender.send_request(req).await {
        Ok(response) => response.map(|body| body.boxed()),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("forwarding through {dial_addr} failed: {e}"),
        ),
    }
}

fn to_origin_form(
    req: &mut Request<Incoming>,
) -> Result<(), Box<Response<BoxBody<Bytes, hyper::Error>>>> {
    let authority = req.uri().authority().map(|a| a.to_string());
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    match target.parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => {
            return Err(Box::new(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("rewriting request target `{target}`: {e}"),
            )));
        }
    }
    if let Some(authority) = authority {
        if !req.headers().contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&authority) {
                req.headers_mut().insert(HOST, value);
            }
        }
    }
    Ok(())
}
