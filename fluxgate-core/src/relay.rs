//! Local listener and tunnel session relay.
//!
//! Each accepted local connection speaks SOCKS5 CONNECT, is paired with
//! one secured tunnel connection, and relays bytes in both directions
//! until either side closes. Sessions never share cipher state; all of a
//! run's sessions share the aggregate counters and the optional rate
//! limiter.

use crate::addr::TargetAddr;
use crate::cipher::{self, CipherContext, CipherKind, MAX_CHUNK};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::stats::TransferStats;
use crate::transport::{AsyncReadWrite, Transport};
use dashmap::DashMap;
use fluxgate_dns::Resolver;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_REPLY_SUCCESS: u8 = 0x00;
const SOCKS_REPLY_FAILURE: u8 = 0x01;
const SOCKS_REPLY_CMD_UNSUPPORTED: u8 = 0x07;

const CONNECT_RETRY_BUDGET: u32 = 3;
const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Shared state for all sessions of one worker run.
pub struct RelayContext {
    config: Arc<Config>,
    cipher: CipherKind,
    transport: Arc<dyn Transport>,
    resolver: Arc<Resolver>,
    remote_addr: RwLock<SocketAddr>,
    limiter: Option<RateLimiter>,
    stats: Arc<TransferStats>,
    permits: Arc<Semaphore>,
    sessions: DashMap<u64, CancellationToken>,
    next_session_id: AtomicU64,
}

impl RelayContext {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        resolver: Arc<Resolver>,
        remote_addr: SocketAddr,
        stats: Arc<TransferStats>,
    ) -> Result<Self> {
        let cipher = CipherKind::from_name(&config.method)
            .ok_or_else(|| Error::config(format!("Unsupported cipher: {}", config.method)))?;

        let limiter = if config.limit_rate > 0 {
            Some(RateLimiter::new(config.limit_rate))
        } else {
            None
        };

        let permits = Arc::new(Semaphore::new(config.parallel_max as usize));

        Ok(Self {
            config,
            cipher,
            transport,
            resolver,
            remote_addr: RwLock::new(remote_addr),
            limiter,
            stats,
            permits,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn remote_addr(&self) -> SocketAddr {
        *self
            .remote_addr
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_remote_addr(&self, addr: SocketAddr) {
        *self
            .remote_addr
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = addr;
    }
}

/// Bind the local listener with SO_REUSEADDR.
pub fn bind_listener(addr: SocketAddr) -> Result<(TcpListener, u16)> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(|e| Error::connect_with_source("Failed to create listener socket", e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| Error::connect_with_source("Failed to set SO_REUSEADDR", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::connect_with_source("Failed to set non-blocking", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::connect_with_source(format!("Failed to bind to {}", addr), e))?;
    socket
        .listen(1024)
        .map_err(|e| Error::connect_with_source(format!("Failed to listen on {}", addr), e))?;

    let listener = TcpListener::from_std(socket.into())
        .map_err(|e| Error::connect_with_source("Failed to create listener", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::connect_with_source("Failed to read bound address", e))?
        .port();

    Ok((listener, port))
}

/// Accept loop. Runs until `cancel` fires; each accepted connection becomes
/// its own task holding a child token.
pub async fn serve(listener: TcpListener, ctx: Arc<RelayContext>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let session_id = ctx.next_session_id.fetch_add(1, Ordering::Relaxed);
                        let token = cancel.child_token();
                        ctx.sessions.insert(session_id, token.clone());

                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            // the outer select covers the handshake phase;
                            // the relay phase watches the token itself
                            let result = tokio::select! {
                                r = handle_session(stream, peer_addr, &ctx, token.clone()) => r,
                                _ = token.cancelled() => Ok(()),
                            };
                            if let Err(e) = result {
                                crate::logging::log_error(
                                    &e,
                                    Some(&format!("session {} from {}", session_id, peer_addr)),
                                );
                            }
                            ctx.sessions.remove(&session_id);
                        });
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                    }
                }
            }
        }
    }
    info!("local listener stopped");
}

/// One session: SOCKS5 accept, tunnel connect with backoff, proxy
/// handshake, then bidirectional relay until EOF/error/cancellation.
async fn handle_session<S>(
    mut local: S,
    peer_addr: SocketAddr,
    ctx: &RelayContext,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let _permit = ctx
        .permits
        .acquire()
        .await
        .map_err(|_| Error::internal("Session permit pool closed"))?;

    let target = socks5_accept(&mut local).await?;
    debug!("session from {} to {}", peer_addr, target);

    let remote = match connect_remote(ctx, &cancel).await {
        Ok(remote) => remote,
        Err(e) => {
            let _ = socks5_reply(&mut local, SOCKS_REPLY_FAILURE).await;
            return Err(e);
        }
    };

    // request framing: salt, then the target address as the first sealed
    // chunk, preserved bit-for-bit with deployed servers
    let salt = ctx.cipher.generate_salt()?;
    let mut seal_ctx = CipherContext::new(ctx.cipher, &ctx.config.password, &salt)?;

    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    remote_write
        .write_all(&salt)
        .await
        .map_err(|e| Error::connect_with_source("Failed to send session salt", e))?;
    cipher::write_sealed_chunk(&mut remote_write, &mut seal_ctx, &target.encode()?).await?;

    socks5_reply(&mut local, SOCKS_REPLY_SUCCESS).await?;

    let (mut local_read, mut local_write) = tokio::io::split(local);

    let upstream = async {
        let mut buf = vec![0u8; MAX_CHUNK];
        loop {
            let n = local_read.read(&mut buf).await.map_err(Error::Io)?;
            if n == 0 {
                return Ok::<(), Error>(());
            }
            if let Some(limiter) = &ctx.limiter {
                limiter.acquire(n).await;
            }
            cipher::write_sealed_chunk(&mut remote_write, &mut seal_ctx, &buf[..n]).await?;
            ctx.stats.record_tx(n as u64);
        }
    };

    let downstream = async {
        let mut server_salt = vec![0u8; ctx.cipher.salt_len()];
        remote_read
            .read_exact(&mut server_salt)
            .await
            .map_err(|e| Error::handshake(format!("Failed to read server salt: {}", e)))?;
        let mut open_ctx = CipherContext::new(ctx.cipher, &ctx.config.password, &server_salt)?;

        while let Some(chunk) = cipher::read_sealed_chunk(&mut remote_read, &mut open_ctx).await? {
            local_write.write_all(&chunk).await.map_err(Error::Io)?;
            ctx.stats.record_rx(chunk.len() as u64);
        }
        Ok::<(), Error>(())
    };

    // first side to finish (EOF or error) tears down the pair; half-close
    // is not a steady state
    tokio::select! {
        result = upstream => result,
        result = downstream => result,
        _ = cancel.cancelled() => {
            debug!("session from {} cancelled by stop", peer_addr);
            Ok(())
        }
    }
}

/// Connect to the tunnel endpoint, retrying recoverable failures with
/// capped exponential backoff and a re-resolve between attempts.
/// Authentication and handshake failures are returned immediately.
async fn connect_remote(
    ctx: &RelayContext,
    cancel: &CancellationToken,
) -> Result<Box<dyn AsyncReadWrite>> {
    let mut delay = BACKOFF_INITIAL;
    let mut attempt = 0u32;

    loop {
        let addr = ctx.remote_addr();
        let err = match ctx.transport.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        if !err.is_recoverable() || attempt >= CONNECT_RETRY_BUDGET {
            return Err(err);
        }
        attempt += 1;
        warn!(
            "tunnel connect attempt {} failed, retrying in {:?}: {}",
            attempt, delay, err
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(err),
        }
        delay = (delay * 2).min(BACKOFF_MAX);

        // the cached address may be stale; refresh it best-effort
        if let Ok(addr) = ctx
            .resolver
            .resolve_addr(&ctx.config.server_host, ctx.config.server_port)
            .await
        {
            ctx.set_remote_addr(addr);
        }
    }
}

/// SOCKS5 greeting and CONNECT request from the local application.
/// The success reply is deferred until the tunnel is established.
async fn socks5_accept<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| Error::handshake(format!("Failed to read SOCKS5 greeting: {}", e)))?;

    if head[0] != SOCKS_VERSION {
        return Err(Error::handshake("Not a SOCKS5 client"));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| Error::handshake(format!("Failed to read SOCKS5 methods: {}", e)))?;

    if !methods.contains(&0x00) {
        stream
            .write_all(&[SOCKS_VERSION, 0xFF])
            .await
            .map_err(Error::Io)?;
        return Err(Error::handshake("No acceptable SOCKS5 auth method"));
    }

    stream
        .write_all(&[SOCKS_VERSION, 0x00])
        .await
        .map_err(Error::Io)?;

    let mut request = [0u8; 4];
    stream
        .read_exact(&mut request)
        .await
        .map_err(|e| Error::handshake(format!("Failed to read SOCKS5 request: {}", e)))?;

    if request[0] != SOCKS_VERSION {
        return Err(Error::handshake("Invalid SOCKS5 request version"));
    }
    if request[1] != SOCKS_CMD_CONNECT {
        let _ = socks5_reply(stream, SOCKS_REPLY_CMD_UNSUPPORTED).await;
        return Err(Error::handshake("Unsupported SOCKS5 command"));
    }

    let target = match request[3] {
        0x01 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await.map_err(Error::Io)?;
            let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            TargetAddr::Ip(SocketAddr::new(ip.into(), port))
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(Error::Io)?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await.map_err(Error::Io)?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::handshake("Invalid domain encoding"))?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.map_err(Error::Io)?;
            TargetAddr::Domain(domain, u16::from_be_bytes(port))
        }
        0x04 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await.map_err(Error::Io)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            TargetAddr::Ip(SocketAddr::new(ip.into(), port))
        }
        _ => return Err(Error::handshake("Unsupported SOCKS5 address type")),
    };

    Ok(target)
}

async fn socks5_reply<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // bound address is not meaningful for a tunneled connect
    let reply = [SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await.map_err(Error::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let (listener, port) = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(port, 0);
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_socks5_accept_domain_connect() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let accept = tokio::spawn(async move { socks5_accept(&mut server).await });

        // greeting: version 5, one method (no auth)
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        // CONNECT example.com:443
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let target = accept.await.unwrap().unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".to_string(), 443));
    }

    #[tokio::test]
    async fn test_socks5_accept_ipv4_connect() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let accept = tokio::spawn(async move { socks5_accept(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90])
            .await
            .unwrap();

        let target = accept.await.unwrap().unwrap();
        assert_eq!(target, TargetAddr::Ip("10.0.0.1:8080".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_socks5_rejects_bind_command() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let accept = tokio::spawn(async move { socks5_accept(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        // BIND command
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let result = accept.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_socks5_rejects_non_socks_client() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let accept = tokio::spawn(async move { socks5_accept(&mut server).await });

        // an HTTP request, not SOCKS
        client.write_all(b"GE").await.unwrap();

        let result = accept.await.unwrap();
        assert!(result.is_err());
    }
}
