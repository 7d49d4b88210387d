use std::{io, net::SocketAddr};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::{
    HeaderMap, Request, Response, StatusCode,
    body::Incoming,
    header::{CONNECTION, HOST, HeaderValue},
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, error};

use crate::{
    config::Settings,
    proxy::{
        dial,
        handler::{error_response, status_response},
        relay,
    },
};

const CONNECT_RESPONSE_MAX_SIZE: usize = 8192;
const CONNECT_RESPONSE_MAX_HEADERS: usize = 32;

/// CONNECT with a `DIRECT` route: dial the target itself, accept the
/// tunnel with a 200, then relay raw bytes once the client connection has
/// been upgraded away from the HTTP layer.
pub async fn connect_direct(
    req: Request<Incoming>,
    settings: &Settings,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "CONNECT target must be host:port",
        );
    };

    let upstream = match dial(&authority, settings).await {
        Ok(stream) => stream,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("dial {authority}: {e}"),
            );
        }
    };

    debug!(client = %client_addr, target = %authority, "direct tunnel accepted");
    spawn_tunnel(req, upstream, authority, settings, client_addr);
    accepted_response()
}

/// CONNECT with a `PROXY host:port` route. The client connection cannot be
/// upgraded until a status is known, so the CONNECT is replayed over a
/// fresh connection to the upstream proxy and its response parsed first.
/// The upstream's status code is relayed verbatim; only a 200 upgrades the
/// client into a tunnel.
pub async fn connect_via_proxy(
    req: Request<Incoming>,
    proxy_addr: &str,
    settings: &Settings,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "CONNECT target must be host:port",
        );
    };

    let mut upstream = match dial(proxy_addr, settings).await {
        Ok(stream) => stream,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("dial upstream proxy {proxy_addr}: {e}"),
            );
        }
    };

    let status = match upstream_connect(&mut upstream, &authority, req.headers()).await {
        Ok(status) => status,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("CONNECT handshake with {proxy_addr}: {e}"),
            );
        }
    };

    if status != StatusCode::OK {
        debug!(
            client = %client_addr,
            target = %authority,
            proxy = %proxy_addr,
            %status,
            "upstream proxy refused the tunnel"
        );
        return status_response(status);
    }

    debug!(client = %client_addr, target = %authority, proxy = %proxy_addr, "chained tunnel accepted");
    spawn_tunnel(
        req,
        upstream,
        format!("{authority} via {proxy_addr}"),
        settings,
        client_addr,
    );
    accepted_response()
}

fn accepted_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = status_response(StatusCode::OK);
    resp.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    resp
}

/// Hand the tunnel off to a detached task. hyper writes the response
/// status before completing the upgrade, so an upgrade failure here is
/// past the point where the client can be told anything; it is logged and
/// the dialed connection dropped.
fn spawn_tunnel(
    req: Request<Incoming>,
    upstream: TcpStream,
    upstream_label: String,
    settings: &Settings,
    client_addr: SocketAddr,
) {
    let idle_timeout = settings.idle_timeout;
    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                relay::relay(
                    TokioIo::new(upgraded),
                    upstream,
                    client_addr.to_string(),
                    upstream_label,
                    idle_timeout,
                )
                .await;
            }
            Err(e) => {
                error!(client = %client_addr, upstream = %upstream_label, "upgrade failed after 200: {e}");
            }
        }
    });
}

/// Replay the CONNECT onto the upstream proxy and return the status it
/// answers with.
async fn upstream_connect(
    upstream: &mut TcpStream,
    authority: &str,
    headers: &HeaderMap,
) -> io::Result<StatusCode> {
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\n").into_bytes();
    if !headers.contains_key(HOST) {
        request.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    }
    for (name, value) in headers {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    upstream.write_all(&request).await?;
    upstream.flush().await?;

    // Read exactly up to the blank line and no further: bytes the upstream
    // pipelines after its response head stay in the socket and flow
    // through the relay instead of being lost in a read buffer.
    let mut head = Vec::with_capacity(512);
    let mut one = [0u8; 1];
    loop {
        let n = upstream.read(&mut one).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream proxy closed the connection before responding",
            ));
        }
        head.push(one[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > CONNECT_RESPONSE_MAX_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upstream proxy response headers too large",
            ));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; CONNECT_RESPONSE_MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&head)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let code = response.code.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "empty upstream proxy response")
    })?;
    StatusCode::from_u16(code).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
