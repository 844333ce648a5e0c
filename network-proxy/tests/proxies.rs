#![allow(clippy::expect_used, clippy::unwrap_used)]

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use vsbx_network_proxy::HostFilter;
use vsbx_network_proxy::HttpProxy;
use vsbx_network_proxy::SocksProxy;

struct AllowOnly(&'static str);

#[async_trait]
impl HostFilter for AllowOnly {
    async fn allow(&self, host: &str, _port: u16) -> bool {
        host == self.0
    }
}

async fn read_until_headers_end(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("read header byte");
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8_lossy(&buf).to_string()
}

#[tokio::test]
async fn connect_to_denied_host_returns_403_with_allowlist_marker() {
    let proxy = HttpProxy::start(Arc::new(AllowOnly("example.com")))
        .await
        .expect("start http proxy");

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port()))
        .await
        .expect("connect to proxy");
    stream
        .write_all(b"CONNECT evil.com:443 HTTP/1.1\r\nHost: evil.com:443\r\n\r\n")
        .await
        .expect("send CONNECT");

    let headers = read_until_headers_end(&mut stream).await;
    assert!(
        headers.starts_with("HTTP/1.1 403"),
        "expected 403, got: {headers}"
    );
    assert!(
        headers.to_ascii_lowercase().contains("x-proxy-error: blocked-by-allowlist"),
        "missing marker header: {headers}"
    );

    let mut body = vec![0u8; "Connection blocked by network allowlist".len()];
    stream.read_exact(&mut body).await.expect("read body");
    assert_eq!(
        String::from_utf8_lossy(&body),
        "Connection blocked by network allowlist"
    );

    proxy.close().await;
}

#[tokio::test]
async fn connect_to_allowed_host_establishes_a_tunnel() {
    // Stand in for the origin with a local echo listener.
    let origin = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind origin");
    let origin_port = origin.local_addr().expect("origin addr").port();
    tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.expect("accept origin");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.expect("origin read");
        stream.write_all(&buf).await.expect("origin write");
    });

    let proxy = HttpProxy::start(Arc::new(AllowOnly("127.0.0.1")))
        .await
        .expect("start http proxy");

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port()))
        .await
        .expect("connect to proxy");
    let connect = format!("CONNECT 127.0.0.1:{origin_port} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.expect("send CONNECT");

    let headers = read_until_headers_end(&mut stream).await;
    assert!(
        headers.starts_with("HTTP/1.1 200"),
        "expected 200, got: {headers}"
    );

    stream.write_all(b"ping").await.expect("send through tunnel");
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.expect("read echo");
    assert_eq!(&reply, b"ping");

    proxy.close().await;
}

#[tokio::test]
async fn socks5_denied_host_receives_ruleset_failure() {
    let proxy = SocksProxy::start(Arc::new(AllowOnly("example.com")))
        .await
        .expect("start socks proxy");

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port()))
        .await
        .expect("connect to proxy");

    // Greeting: version 5, one method, no-auth.
    stream.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.expect("method reply");
    assert_eq!(method, [0x05, 0x00]);

    // CONNECT evil.com:443 by domain name.
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 8];
    request.extend_from_slice(b"evil.com");
    request.extend_from_slice(&443u16.to_be_bytes());
    stream.write_all(&request).await.expect("request");

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.expect("reply");
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x02, "expected connection-not-allowed reply");

    proxy.close().await;
}

#[tokio::test]
async fn socks5_allowed_host_connects_and_relays() {
    let origin = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind origin");
    let origin_port = origin.local_addr().expect("origin addr").port();
    tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.expect("accept origin");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.expect("origin read");
        stream.write_all(&buf).await.expect("origin write");
    });

    let proxy = SocksProxy::start(Arc::new(AllowOnly("127.0.0.1")))
        .await
        .expect("start socks proxy");

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port()))
        .await
        .expect("connect to proxy");
    stream.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.expect("method reply");

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&origin_port.to_be_bytes());
    stream.write_all(&request).await.expect("request");

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.expect("reply");
    assert_eq!(reply[1], 0x00, "expected success reply");

    stream.write_all(b"hello").await.expect("send through tunnel");
    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await.expect("read echo");
    assert_eq!(&echoed, b"hello");

    proxy.close().await;
}
