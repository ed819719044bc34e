//! TCP MITM Relay: per-port acceptors that infer a connection's real
//! destination from its first bytes and bidirectionally proxy the rest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::address_map::AddressMap;
use crate::affinity::ClientAffinityCache;
use crate::dns::DnsResponder;
use crate::error::relay::RelayError;
use crate::policy::InterceptPolicy;

/// Bytes read from the client before any relaying begins. Large enough to
/// contain a typical HTTP request line plus Host header, or the start of a
/// TLS ClientHello carrying the SNI extension.
pub const PREFIX_BYTES: usize = 2048;

/// Buffer size used by each direction of the steady-state byte pump.
const PUMP_BUFFER: usize = 2048;

/// Bound on how long we'll wait for the client's first bytes, so a silent
/// peer can't hold a handler task open forever.
const PREFIX_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A single per-port TCP acceptor plus the per-connection state machine
/// that extracts a destination, dials it, and proxies bytes.
pub struct MitmRelay {
    policy: Arc<InterceptPolicy>,
    address_map: Arc<AddressMap>,
    affinity: Arc<ClientAffinityCache>,
    dns: Arc<DnsResponder>,
}

impl MitmRelay {
    pub fn new(
        policy: Arc<InterceptPolicy>,
        address_map: Arc<AddressMap>,
        affinity: Arc<ClientAffinityCache>,
        dns: Arc<DnsResponder>,
    ) -> Self {
        Self {
            policy,
            address_map,
            affinity,
            dns,
        }
    }

    /// Bind `port` on all interfaces and accept connections until the
    /// listener itself errors out.
    pub async fn serve(self: Arc<Self>, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        log::info!("MITM relay listening on :{}", port);

        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(v) => v,
                Err(err) => {
                    log::error!("accept error on :{}: {}", port, err);
                    continue;
                }
            };
            let relay = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = relay.handle_connection(stream, client_addr, port).await {
                    log::info!("closing connection from {}: {}", client_addr, err);
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        mut client: TcpStream,
        client_addr: SocketAddr,
        port: u16,
    ) -> Result<(), RelayError> {
        let mut prefix = vec![0u8; PREFIX_BYTES];
        let n = timeout(PREFIX_READ_TIMEOUT, client.read(&mut prefix))
            .await
            .map_err(|_| {
                RelayError::PrefixRead(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "prefix read timed out",
                ))
            })?
            .map_err(RelayError::PrefixRead)?;
        if n == 0 {
            return Err(RelayError::PrefixRead(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed before sending any bytes",
            )));
        }
        prefix.truncate(n);

        let prefix_text = String::from_utf8_lossy(&prefix);
        let wanted = self.policy.matches(&prefix_text);
        let host = if wanted { extract_host(&prefix) } else { None };

        let client_key = client_addr.to_string();
        let resolved_ip = match self
            .resolve_destination(host.as_deref(), wanted, &client_key)
            .await
        {
            Some(ip) => ip,
            None => {
                let shown = &prefix[..prefix.len().min(20)];
                log::info!(
                    "dropping connection from {}: no destination resolved (first bytes: {:?})",
                    client_addr,
                    shown
                );
                return Err(RelayError::Unresolved);
            }
        };

        self.affinity.put(&client_key, &resolved_ip);

        let mut upstream = TcpStream::connect((resolved_ip.as_str(), port))
            .await
            .map_err(RelayError::UpstreamConnect)?;

        upstream
            .write_all(&prefix)
            .await
            .map_err(RelayError::PrefixReplay)?;

        log::info!("relaying {} -> {}:{}", client_addr, resolved_ip, port);
        pump_both_ways(client, upstream).await;
        Ok(())
    }

    /// Resolve the real destination IP for this connection, per the
    /// relay's per-connection state machine:
    ///
    /// 1. A host was extracted: look it up, triggering a synchronous
    ///    refresh on miss.
    /// 2. No host but the prefix matched the intercept policy: fall
    ///    through to the client affinity cache.
    /// 3. No host and the prefix didn't match: no destination.
    async fn resolve_destination(
        &self,
        host: Option<&str>,
        wanted: bool,
        client_key: &str,
    ) -> Option<String> {
        if let Some(host) = host {
            if let Some(ip) = self.address_map.lookup(host) {
                return Some(ip);
            }
            if let Err(err) = self.dns.refresh_now(host).await {
                log::warn!("synchronous refresh failed for {}: {}", host, err);
            }
            if let Some(ip) = self.address_map.lookup(host) {
                return Some(ip);
            }
        } else if !wanted {
            return None;
        }

        self.affinity.get(client_key)
    }
}

/// Spawn the two byte pumps and wait for both to finish, then both sides
/// are considered closed.
async fn pump_both_ways(client: TcpStream, upstream: TcpStream) {
    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    let client_to_upstream = tokio::spawn(async move {
        pump(&mut client_rd, &mut upstream_wr).await;
        let _ = upstream_wr.shutdown().await;
    });
    let upstream_to_client = tokio::spawn(async move {
        pump(&mut upstream_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
    });

    let _ = tokio::join!(client_to_upstream, upstream_to_client);
}

/// Read from `src` and write to `dst` until a read error, a zero-length
/// read, or a write error occurs. This must keep looping across many
/// read/write cycles -- a pump that returns after a single iteration is the
/// known-bad variant documented in the crate's design notes.
async fn pump<R, W>(src: &mut R, dst: &mut W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        if dst.write_all(&buf[..n]).await.is_err() {
            return;
        }
    }
}

/// Attempt HTTP Host-header extraction, then TLS-SNI-ish extraction.
fn extract_host(prefix: &[u8]) -> Option<String> {
    extract_http_host(prefix).or_else(|| extract_tls_sni(prefix))
}

/// Locate a case-insensitive `Host:` header and return its trimmed value, up
/// to the end of the line.
fn extract_http_host(prefix: &[u8]) -> Option<String> {
    let lower: Vec<u8> = prefix.iter().map(|b| b.to_ascii_lowercase()).collect();
    let pos = find_subslice(&lower, b"host:")?;
    let rest = &prefix[pos + b"host:".len()..];

    let mut start = 0;
    while start < rest.len() && (rest[start] == b' ' || rest[start] == b'\t') {
        start += 1;
    }
    let mut end = start;
    while end < rest.len() && rest[end] != b'\r' && rest[end] != b'\n' {
        end += 1;
    }

    let value = rest[start..end].to_vec();
    if value.is_empty() {
        return None;
    }
    let host = String::from_utf8_lossy(&value).trim().to_string();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Approximate SNI extraction: scan for `\x00\x00<len-byte>` followed by
/// 10-50 bytes drawn from `[A-Za-z0-9._-]`, terminated by `\x00`. This is a
/// heuristic byte pattern, not a TLS parser -- it must never be mistaken
/// for one.
fn extract_tls_sni(prefix: &[u8]) -> Option<String> {
    const MIN_LEN: usize = 10;
    const MAX_LEN: usize = 50;

    fn is_host_byte(b: u8) -> bool {
        b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_')
    }

    if prefix.len() < 4 {
        return None;
    }
    for i in 0..prefix.len() - 3 {
        if prefix[i] != 0 || prefix[i + 1] != 0 {
            continue;
        }
        let start = i + 3;
        let mut end = start;
        while end < prefix.len() && is_host_byte(prefix[end]) && (end - start) < MAX_LEN {
            end += 1;
        }
        let len = end - start;
        if len >= MIN_LEN && end < prefix.len() && prefix[end] == 0 {
            return Some(String::from_utf8_lossy(&prefix[start..end]).to_string());
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn extract_http_host_is_case_insensitive_and_trims() {
        let prefix = b"GET / HTTP/1.1\r\nHOST:   example-stream.cdn.net  \r\n\r\n";
        assert_eq!(
            extract_host(prefix),
            Some("example-stream.cdn.net".to_string())
        );
    }

    #[test]
    fn extract_tls_sni_finds_marker_pattern() {
        let mut prefix = vec![0x16, 0x03, 0x01, 0x00, 0x00];
        prefix.extend_from_slice(b"\x00\x00\x0dexample-stream\x00");
        assert_eq!(extract_host(&prefix), Some("example-stream".to_string()));
    }

    #[test]
    fn extract_host_returns_none_without_host_or_sni() {
        let prefix = b"random binary junk with no markers at all";
        assert_eq!(extract_host(prefix), None);
    }

    #[tokio::test]
    async fn pump_loops_across_multiple_reads_until_eof() {
        let (mut src_wr, src_rd) = duplex(8);
        let (dst_wr, mut dst_rd) = duplex(64);

        let pump_task = tokio::spawn(async move {
            let mut src_rd = src_rd;
            let mut dst_wr = dst_wr;
            pump(&mut src_rd, &mut dst_wr).await;
        });

        src_wr.write_all(b"first-chunk-").await.unwrap();
        src_wr.write_all(b"second-chunk").await.unwrap();
        drop(src_wr); // EOF

        pump_task.await.unwrap();

        let mut received = Vec::new();
        dst_rd.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"first-chunk-second-chunk".to_vec());
    }
}
