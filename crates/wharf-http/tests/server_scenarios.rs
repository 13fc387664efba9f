//! End-to-end scenarios over real loopback sockets: the server and its
//! clients share one wharf runtime, so every exchange is driven through
//! the event pool.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use http::{Response, StatusCode};
use http_body_util::BodyExt;

use wharf_http::connection::OnUpgrade;
use wharf_http::handler::route_fn;
use wharf_http::protocol::{parse_byte_range, ResponseBody};
use wharf_http::router::Route;
use wharf_http::server::{Server, ServerConfig};
use wharf_io::net::TcpStream;
use wharf_io::time::{sleep, timeout};
use wharf_io::{PoolHandle, Runtime, SocketAddr};

fn loopback() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
}

async fn start(server: &Server) -> SocketAddr {
    while server.listening_address().is_none() {
        sleep(Duration::from_millis(1)).await;
    }
    server.listening_address().unwrap()
}

async fn read_until(client: &TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if collected.windows(needle.len().max(1)).any(|w| w == needle) {
            return collected;
        }
        let n = timeout(Duration::from_secs(5), client.read(&mut chunk))
            .await
            .expect("read timed out")
            .unwrap();
        if n == 0 {
            return collected;
        }
        collected.extend_from_slice(&chunk[..n]);
    }
}

async fn read_to_eof(client: &TcpStream) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = timeout(Duration::from_secs(5), client.read(&mut chunk))
            .await
            .expect("read timed out")
            .unwrap();
        if n == 0 {
            return collected;
        }
        collected.extend_from_slice(&chunk[..n]);
    }
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

fn position(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn server_on(pool: &PoolHandle, config: ServerConfig) -> Server {
    Server::new(config, pool.clone())
}

#[test]
fn keep_alive_serves_pipelined_requests_in_order() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let server = server_on(&pool, ServerConfig::new(loopback()));
        server.route(
            Route::get("/x").unwrap(),
            route_fn(|_| async { Ok(Response::builder().body(ResponseBody::from("first!")).unwrap()) }),
        );
        server.route(
            Route::get("/y").unwrap(),
            route_fn(|_| async { Ok(Response::builder().body(ResponseBody::from("second")).unwrap()) }),
        );
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\nGET /y HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();

        let wire = read_until(&client, b"second").await;
        assert_eq!(count(&wire, b"HTTP/1.1 200 OK"), 2);
        assert!(position(&wire, b"first!").unwrap() < position(&wire, b"second").unwrap());

        // the connection is still usable for a third request
        client.write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();
        let wire = read_until(&client, b"first!").await;
        assert_eq!(count(&wire, b"HTTP/1.1 200 OK"), 1);

        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
    });
}

#[test]
fn range_request_gets_206_with_content_range() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let server = server_on(&pool, ServerConfig::new(loopback()));
        server.route(
            Route::get("/resource").unwrap(),
            route_fn(|req| async move {
                let resource: Vec<u8> = (0..100u8).collect();
                let response = match parse_byte_range(req.headers()) {
                    Some((start, end)) if end < resource.len() as u64 => Response::builder()
                        .status(StatusCode::PARTIAL_CONTENT)
                        .header(
                            http::header::CONTENT_RANGE,
                            format!("bytes {start}-{end}/{}", resource.len()),
                        )
                        .body(ResponseBody::from(resource[start as usize..=end as usize].to_vec()))
                        .unwrap(),
                    _ => Response::builder().body(ResponseBody::from(resource)).unwrap(),
                };
                Ok(response)
            }),
        );
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        client
            .write_all(b"GET /resource HTTP/1.1\r\nHost: h\r\nRange: bytes=10-19\r\n\r\n")
            .await
            .unwrap();

        let wire = read_until(&client, &[19u8]).await;
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{text}");
        assert!(text.contains("content-range: bytes 10-19/100\r\n"), "{text}");
        assert!(text.contains("content-length: 10\r\n"), "{text}");
        let body_at = position(&wire, b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&wire[body_at..], &(10..20u8).collect::<Vec<u8>>()[..]);

        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
    });
}

#[test]
fn chunked_upload_reaches_the_handler_reassembled() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let server = server_on(&pool, ServerConfig::new(loopback()));
        server.route(
            Route::post("/upload").unwrap(),
            route_fn(|req| async move {
                let body = req.into_body().collect().await?.to_bytes();
                Ok(Response::builder().body(ResponseBody::from(body)).unwrap())
            }),
        );
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        client
            .write_all(
                b"POST /upload HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .await
            .unwrap();

        let wire = read_until(&client, b"hello world").await;
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("content-length: 11\r\n"), "{text}");

        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
    });
}

#[test]
fn slow_handler_times_out_with_500_and_close() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let config = ServerConfig::new(loopback()).timeout(Duration::from_millis(100));
        let server = server_on(&pool, config);
        server.route(
            Route::get("/slow").unwrap(),
            route_fn(|_| async {
                sleep(Duration::from_secs(10)).await;
                Ok(Response::builder().body(ResponseBody::from("too late")).unwrap())
            }),
        );
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let started = Instant::now();
        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        client.write_all(b"GET /slow HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();

        let wire = read_to_eof(&client).await;
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{text}");
        assert!(text.contains("connection: close\r\n"), "{text}");
        assert!(started.elapsed() < Duration::from_secs(5), "timeout must fire well before the handler");

        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
    });
}

#[test]
fn unmatched_route_is_a_404() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let server = server_on(&pool, ServerConfig::new(loopback()));
        server.route(
            Route::get("/known").unwrap(),
            route_fn(|_| async { Ok(Response::builder().body(ResponseBody::empty()).unwrap()) }),
        );
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        client.write_all(b"GET /unknown HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();
        let wire = read_until(&client, b"\r\n\r\n").await;
        assert!(wire.starts_with(b"HTTP/1.1 404 Not Found\r\n"));

        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
    });
}

#[test]
fn malformed_request_is_a_400_and_close() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let server = server_on(&pool, ServerConfig::new(loopback()));
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        client.write_all(b"THIS IS NOT HTTP\r\n\r\n").await.unwrap();
        let wire = read_to_eof(&client).await;
        assert!(wire.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
    });
}

#[test]
fn graceful_stop_closes_idle_connections_within_the_deadline() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let server = server_on(&pool, ServerConfig::new(loopback()));
        server.route(
            Route::get("/").unwrap(),
            route_fn(|_| async { Ok(Response::builder().body(ResponseBody::empty()).unwrap()) }),
        );
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let mut clients = Vec::new();
        for _ in 0..10 {
            let client = TcpStream::connect(&addr, &pool).await.unwrap();
            // prove each connection is established and idle keep-alive
            client.write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();
            read_until(&client, b"\r\n\r\n").await;
            clients.push(client);
        }

        let started = Instant::now();
        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3), "stop must respect its deadline");

        for client in &clients {
            let rest = read_to_eof(client).await;
            assert!(rest.is_empty(), "idle connections close without extra bytes");
        }
    });
}

#[test]
fn upgrade_hands_the_socket_to_the_callback() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let server = server_on(&pool, ServerConfig::new(loopback()));
        server.route(
            Route::get("/ws").unwrap(),
            route_fn(|_| async {
                let mut response = Response::builder()
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header(http::header::UPGRADE, "echo")
                    .body(ResponseBody::empty())
                    .unwrap();
                response.extensions_mut().insert(OnUpgrade::new(|upgraded| async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let (mut reader, mut writer, read_ahead) = upgraded.into_parts();
                    assert!(read_ahead.is_empty());
                    let mut buf = [0u8; 5];
                    reader.read_exact(&mut buf).await.unwrap();
                    writer.write_all(b"echo:").await.unwrap();
                    writer.write_all(&buf).await.unwrap();
                }));
                Ok(response)
            }),
        );
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        client
            .write_all(b"GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();

        let head = read_until(&client, b"\r\n\r\n").await;
        assert!(head.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));

        client.write_all(b"hello").await.unwrap();
        let echoed = read_until(&client, b"echo:hello").await;
        assert!(count(&echoed, b"echo:hello") == 1);

        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
    });
}

#[test]
fn stalled_request_head_is_a_408() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let config = ServerConfig::new(loopback()).read_timeout(Duration::from_millis(100));
        let server = server_on(&pool, config);
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        // half a request line, then silence
        client.write_all(b"GET /stalled HT").await.unwrap();
        let wire = read_to_eof(&client).await;
        assert!(wire.starts_with(b"HTTP/1.1 408 Request Timeout\r\n"));

        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
    });
}

#[test]
fn http10_defaults_to_close() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let server = server_on(&pool, ServerConfig::new(loopback()));
        server.route(
            Route::get("/").unwrap(),
            route_fn(|_| async { Ok(Response::builder().body(ResponseBody::from("ten")).unwrap()) }),
        );
        let run = wharf_io::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        let addr = start(&server).await;

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        client.write_all(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n").await.unwrap();
        let wire = read_to_eof(&client).await;
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("connection: close\r\n"), "{text}");

        server.stop(Duration::from_secs(1)).await.unwrap();
        run.await.unwrap();
    });
}
