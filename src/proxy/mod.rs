use std::{io, net::SocketAddr, sync::Arc};

use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::error;

use crate::{config::Settings, policy::PolicyResolver};

mod forward;
mod handler;
mod relay;
mod tunnel;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("HTTP serve error: {0}")]
    Serve(String),
}

/// Accept loop: one task per client connection. Serve errors are logged
/// with the peer address; the loop itself only fails if accepting does.
pub async fn start(
    settings: Arc<Settings>,
    resolver: Arc<dyn PolicyResolver>,
    listener: TcpListener,
) -> anyhow::Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;

        let settings = settings.clone();
        let resolver = resolver.clone();

        tokio::spawn(async move {
            if let Err(e) = serve(settings, resolver, socket, addr).await {
                error!("proxy error from {addr}: {e:?}");
            }
        });
    }
}

/// Serve HTTP/1.1 on one client connection. `with_upgrades` is what makes
/// CONNECT hijacking possible: without it the connection can never be
/// detached from the HTTP layer.
async fn serve(
    settings: Arc<Settings>,
    resolver: Arc<dyn PolicyResolver>,
    stream: TcpStream,
    client_addr: SocketAddr,
) -> Result<(), ProxyError> {
    let io = TokioIo::new(stream);

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(
            io,
            service_fn(move |req| {
                handler::handle_request(req, resolver.clone(), settings.clone(), client_addr)
            }),
        )
        .with_upgrades()
        .await
        .map_err(|e| ProxyError::Serve(e.to_string()))?;

    Ok(())
}

/// Dial an outbound TCP connection, honoring the configured dial deadline
/// and socket options. Used by every outbound path; connections are never
/// pooled or reused.
pub(crate) async fn dial(addr: &str, settings: &Settings) -> io::Result<TcpStream> {
    let stream = match settings.dial_timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr} timed out"))
            })??,
        None => TcpStream::connect(addr).await?,
    };
    if settings.tcp_nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyError, RouteDirective};
    use hyper::Uri;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::oneshot,
    };

    struct Fixed(RouteDirective);

    impl PolicyResolver for Fixed {
        fn find_proxy(&self, _target: &Uri) -> Result<RouteDirective, PolicyError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl PolicyResolver for Failing {
        fn find_proxy(&self, _target: &Uri) -> Result<RouteDirective, PolicyError> {
            Err(PolicyError::Evaluation("policy script is broken".to_string()))
        }
    }

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            pac_url: None,
            upstream_proxy: None,
            tcp_nodelay: false,
            dial_timeout: Some(Duration::from_secs(5)),
            idle_timeout: None,
        })
    }

    async fn spawn_proxy(resolver: Arc<dyn PolicyResolver>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings = test_settings();
        tokio::spawn(async move {
            let _ = start(settings, resolver, listener).await;
        });
        addr
    }

    /// Accepts connections and echoes every byte back.
    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        if socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    /// A one-shot upstream proxy: records the request head it received,
    /// answers with `response`, then echoes if asked to.
    async fn spawn_upstream(
        response: &'static str,
        echo_after: bool,
    ) -> (SocketAddr, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_head(&mut socket).await;
            let _ = tx.send(head);
            socket.write_all(response.as_bytes()).await.unwrap();
            if echo_after {
                let mut buf = [0u8; 1024];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        });
        (addr, rx)
    }

    async fn read_head<S: AsyncReadExt + Unpin>(stream: &mut S) -> String {
        let mut head = Vec::new();
        let mut one = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut one).await {
                Ok(0) | Err(_) => break,
                Ok(_) => head.push(one[0]),
            }
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
        let head = read_head(stream).await;
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        if length > 0 {
            stream.read_exact(&mut body).await.unwrap();
        }
        (head, body)
    }

    #[tokio::test]
    async fn test_direct_connect_tunnels_bytes_both_ways() {
        let echo = spawn_echo().await;
        let proxy = spawn_proxy(Arc::new(Fixed(RouteDirective::Direct))).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

        client.write_all(b"hello through the tunnel").await.unwrap();
        let mut buf = [0u8; 24];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello through the tunnel");

        // A second exchange on the same tunnel still round-trips.
        client.write_all(b"again").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
    }

    #[tokio::test]
    async fn test_connect_dial_failure_is_a_500() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = unused.local_addr().unwrap();
        drop(unused);

        let proxy = spawn_proxy(Arc::new(Fixed(RouteDirective::Direct))).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(format!("CONNECT {dead} HTTP/1.1\r\nHost: {dead}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 500"), "got: {head}");
        assert!(String::from_utf8_lossy(&body).contains("dial"));
    }

    #[tokio::test]
    async fn test_chained_connect_replays_request_and_tunnels() {
        let (upstream, head_rx) =
            spawn_upstream("HTTP/1.1 200 Connection Established\r\n\r\n", true).await;
        let proxy =
            spawn_proxy(Arc::new(Fixed(RouteDirective::ViaProxy(upstream.to_string())))).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(
                b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
            )
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

        let replayed = head_rx.await.unwrap();
        assert!(
            replayed.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"),
            "got: {replayed}"
        );
        assert!(replayed.to_lowercase().contains("host: example.com:443"));

        client.write_all(b"through the chain").await.unwrap();
        let mut buf = [0u8; 17];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the chain");
    }

    #[tokio::test]
    async fn test_chained_connect_keeps_bytes_pipelined_after_200() {
        // The upstream sends tunnel payload in the same write as its
        // response head. Nothing may be swallowed by the handshake reader.
        let (upstream, _head_rx) = spawn_upstream(
            "HTTP/1.1 200 Connection Established\r\n\r\nearly-bytes",
            false,
        )
        .await;
        let proxy =
            spawn_proxy(Arc::new(Fixed(RouteDirective::ViaProxy(upstream.to_string())))).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(
                b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
            )
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early-bytes");
    }

    #[tokio::test]
    async fn test_chained_connect_relays_upstream_refusal() {
        let (upstream, _head_rx) =
            spawn_upstream("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n", false).await;
        let proxy =
            spawn_proxy(Arc::new(Fixed(RouteDirective::ViaProxy(upstream.to_string())))).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(
                b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
            )
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 407"), "got: {head}");
    }

    #[tokio::test]
    async fn test_direct_get_matches_origin_response() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = origin_listener.local_addr().unwrap();
        let (tx, head_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = origin_listener.accept().await.unwrap();
            let head = read_head(&mut socket).await;
            let _ = tx.send(head);
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: a\r\nX-Test: b\r\n\r\nworld",
                )
                .await
                .unwrap();
        });

        let proxy = spawn_proxy(Arc::new(Fixed(RouteDirective::Direct))).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(
                format!("GET http://{origin}/hello?q=1 HTTP/1.1\r\nHost: {origin}\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();

        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
        assert_eq!(body, b"world");
        // Duplicate headers survive forwarding.
        assert_eq!(head.to_lowercase().matches("x-test:").count(), 2);

        // The origin saw an origin-form request line.
        let origin_head = head_rx.await.unwrap();
        assert!(
            origin_head.starts_with("GET /hello?q=1 HTTP/1.1\r\n"),
            "got: {origin_head}"
        );
    }

    #[tokio::test]
    async fn test_proxied_get_routes_through_upstream_only() {
        let (upstream, head_rx) =
            spawn_upstream("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", false).await;
        let proxy =
            spawn_proxy(Arc::new(Fixed(RouteDirective::ViaProxy(upstream.to_string())))).await;

        // target.invalid never resolves: a direct dial would fail, so a
        // 200 proves the request went through the upstream alone.
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(b"GET http://target.invalid/ HTTP/1.1\r\nHost: target.invalid\r\n\r\n")
            .await
            .unwrap();

        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
        assert_eq!(body, b"ok");

        // The upstream saw the absolute-form target.
        let upstream_head = head_rx.await.unwrap();
        assert!(
            upstream_head.starts_with("GET http://target.invalid/ HTTP/1.1\r\n"),
            "got: {upstream_head}"
        );
    }

    #[tokio::test]
    async fn test_resolver_failure_is_a_500_and_nothing_is_dialed() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_listener.local_addr().unwrap();
        let touched = Arc::new(AtomicBool::new(false));
        let touched_flag = touched.clone();
        tokio::spawn(async move {
            if target_listener.accept().await.is_ok() {
                touched_flag.store(true, Ordering::SeqCst);
            }
        });

        let proxy = spawn_proxy(Arc::new(Failing)).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(format!("GET http://{target}/ HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 500"), "got: {head}");
        assert!(String::from_utf8_lossy(&body).contains("route resolution failed"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!touched.load(Ordering::SeqCst));
    }
}
