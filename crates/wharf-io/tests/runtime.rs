//! Runtime, pool and socket behaviour over real loopback sockets.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use wharf_io::net::{TcpListener, TcpStream, UdpSocket};
use wharf_io::time::{sleep, timeout};
use wharf_io::{Runtime, SocketAddr, SocketError};

fn loopback() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
}

#[test]
fn spawn_and_join() {
    let rt = Runtime::new().unwrap();
    let out = rt.block_on(async {
        let handle = wharf_io::spawn(async { 21 * 2 });
        handle.await
    });
    assert_eq!(out, 42);
}

#[test]
fn sleep_orders_wakeups() {
    let rt = Runtime::new().unwrap();
    let order = rt.block_on(async {
        let slow = wharf_io::spawn(async {
            sleep(Duration::from_millis(30)).await;
            "slow"
        });
        let fast = wharf_io::spawn(async {
            sleep(Duration::from_millis(5)).await;
            "fast"
        });
        let first = fast.await;
        let second = slow.await;
        (first, second)
    });
    assert_eq!(order, ("fast", "slow"));
}

#[test]
fn zero_timeout_still_polls_once() {
    let rt = Runtime::new().unwrap();
    let result = rt.block_on(async { timeout(Duration::ZERO, async { "ran" }).await });
    assert_eq!(result.unwrap(), "ran");
}

#[test]
fn timeout_fires_on_slow_operation() {
    let rt = Runtime::new().unwrap();
    let started = Instant::now();
    let result = rt.block_on(async {
        timeout(Duration::from_millis(20), sleep(Duration::from_secs(30))).await
    });
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn abort_cancels_at_suspension_point() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut handle = wharf_io::spawn(async {
            sleep(Duration::from_secs(60)).await;
        });
        sleep(Duration::from_millis(5)).await;
        handle.abort();
        // the aborted task must not keep the loop alive
        sleep(Duration::from_millis(5)).await;
    });
}

#[test]
fn tcp_round_trip() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let listener = TcpListener::bind(&loopback(), &pool).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = wharf_io::spawn(async move {
            let (stream, _peer) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong!").await.unwrap();
            buf
        });

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        client.write_all(b"ping!").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();

        assert_eq!(&server.await, b"ping!");
        assert_eq!(&reply, b"pong!");
    });
}

#[test]
fn read_sees_eof_after_peer_close() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let listener = TcpListener::bind(&loopback(), &pool).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = wharf_io::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"bye").await.unwrap();
            // dropping the stream closes the fd exactly once
        });

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        server.await;

        let mut rest = [0u8; 8];
        let n = client.read(&mut rest).await.unwrap();
        assert_eq!(n, 0, "peer close must read as EOF");
    });
}

#[test]
fn read_exact_past_eof_is_disconnected() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let listener = TcpListener::bind(&loopback(), &pool).unwrap();
        let addr = listener.local_addr().unwrap();

        wharf_io::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"xy").await.unwrap();
        })
        .detach();

        let client = TcpStream::connect(&addr, &pool).await.unwrap();
        let mut buf = [0u8; 16];
        let err = client.read_exact(&mut buf).await.unwrap_err();
        assert!(matches!(err, SocketError::Disconnected));
    });
}

#[test]
fn unix_stream_round_trip() {
    use wharf_io::net::{UnixListener, UnixStream};

    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    let path = std::env::temp_dir().join(format!("wharf-io-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    rt.block_on(async move {
        let listener = UnixListener::bind(&path, &pool).unwrap();

        let server = wharf_io::spawn(async move {
            let (stream, _peer) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let client = UnixStream::connect(&path, &pool).await.unwrap();
        client.write_all(b"uds!").await.unwrap();
        let mut reply = [0u8; 4];
        let n = client.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"uds!");
        server.await;
    });
}

#[test]
fn udp_send_recv_with_pktinfo() {
    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let receiver = UdpSocket::bind(&loopback(), &pool).unwrap();
        receiver.set_recv_pktinfo(false, true).unwrap();
        let addr = receiver.local_addr().unwrap();

        let sender = UdpSocket::bind(&loopback(), &pool).unwrap();
        sender.send_to(b"datagram", &addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, peer, pktinfo) = receiver.recv_msg(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_eq!(peer, sender.local_addr().unwrap());
        let info = pktinfo.expect("pktinfo requested");
        assert_eq!(info.destination, std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));
    });
}

#[test]
fn readiness_resolves_for_connected_socket() {
    use std::os::fd::AsRawFd;
    use wharf_io::socket::{Socket, Type};
    use wharf_io::Interest;

    let rt = Runtime::new().unwrap();
    let pool = rt.pool();
    rt.block_on(async move {
        let addr = loopback();
        let listener = Socket::for_addr(&addr, Type::Stream).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(8).unwrap();
        let target = listener.local_addr().unwrap();

        let client = TcpStream::connect(&target, &pool).await.unwrap();
        // a freshly connected socket reports writability
        let event = timeout(
            Duration::from_secs(2),
            pool.readiness(client.as_raw_fd(), Interest::WRITABLE),
        )
        .await
        .expect("readiness should not hang")
        .unwrap();
        assert!(event.writable);
    });
}
