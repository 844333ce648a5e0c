//! SOCKS5 (RFC 1928) server, CONNECT only, no authentication.
//!
//! The exchange is read directly off the stream rather than through an
//! acceptor framework so the bound port is known and the accept loop can
//! be shut down on reset.

use crate::HostFilter;
use anyhow::Result;
use anyhow::anyhow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_NOT_ALLOWED: u8 = 0x02;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// A running SOCKS5 proxy bound to an ephemeral localhost port.
pub struct SocksProxy {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SocksProxy {
    pub async fn start(filter: Arc<dyn HostFilter>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| anyhow!("bind SOCKS5 proxy: {err}"))?;
        let port = listener.local_addr()?.port();
        info!(port, "SOCKS5 proxy listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(accept_loop(listener, filter, shutdown_rx));

        Ok(Self {
            port,
            shutdown: Some(shutdown_tx),
            handle,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the accept loop. In-flight tunnels run to completion.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    filter: Arc<dyn HostFilter>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "SOCKS5 accept failed");
                        continue;
                    }
                };
                let filter = filter.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, peer, filter).await {
                        debug!(error = %err, client = %peer, "SOCKS5 connection ended");
                    }
                });
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    filter: Arc<dyn HostFilter>,
) -> Result<()> {
    // Method negotiation.
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(anyhow!("unsupported SOCKS version {}", header[0]));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(anyhow!("no acceptable auth method"));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request.
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[1] != CMD_CONNECT {
        send_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(anyhow!("unsupported SOCKS command {}", request[1]));
    }
    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_ascii_lowercase()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        other => {
            send_reply(&mut stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(anyhow!("unsupported address type {other}"));
        }
    };
    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    if !filter.allow(&host, port).await {
        warn!(client = %peer, host = %host, port, "SOCKS blocked");
        send_reply(&mut stream, REPLY_NOT_ALLOWED).await?;
        return Ok(());
    }
    debug!(client = %peer, host = %host, port, "SOCKS allowed");

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(upstream) => upstream,
        Err(err) => {
            send_reply(&mut stream, REPLY_CONNECTION_REFUSED).await?;
            return Err(anyhow!("connect {host}:{port}: {err}"));
        }
    };
    send_reply(&mut stream, REPLY_SUCCEEDED).await?;

    if let Err(err) = copy_bidirectional(&mut stream, &mut upstream).await {
        debug!(error = %err, "SOCKS tunnel closed");
    }
    Ok(())
}

/// Reply with the given code and a zeroed IPv4 bind address. Clients only
/// inspect the bind address after UDP ASSOCIATE, which we do not support.
async fn send_reply(stream: &mut TcpStream, code: u8) -> Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}
