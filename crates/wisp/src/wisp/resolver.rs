//! Name resolution for the remote server address.
//!
//! The system resolver is the default. When a fallback DNS server is
//! configured, lookups are sent to it directly as DNS-over-TCP queries instead.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use rand::{RngExt, rng};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time,
};

use crate::wisp::net::{self, ConnectHook};

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            ));
        }
        Ok(addrs)
    }
}

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MESSAGE: usize = 64 * 1024;

/// Resolves through one DNS server over TCP.
///
/// Query sockets go through the same connect hook as tunnel sockets, so in
/// VPN mode DNS traffic is protected too.
#[derive(Clone)]
pub struct TcpDnsResolver {
    server: SocketAddr,
    hook: Arc<dyn ConnectHook>,
}

impl TcpDnsResolver {
    pub fn new(server: SocketAddr, hook: Arc<dyn ConnectHook>) -> Self {
        Self { server, hook }
    }

    async fn query(&self, host: &str, qtype: u16) -> io::Result<Vec<IpAddr>> {
        let id: u16 = rng().random();
        let query = encode_query(id, host, qtype)?;

        let exchange = async {
            let socket = net::new_socket_for(self.server.ip())?;
            self.hook.before_connect(&socket).await?;
            let mut conn = socket.connect(self.server).await?;
            let mut framed = Vec::with_capacity(query.len() + 2);
            framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
            framed.extend_from_slice(&query);
            conn.write_all(&framed).await?;

            let n = conn.read_u16().await? as usize;
            let mut resp = vec![0u8; n];
            conn.read_exact(&mut resp).await?;
            Ok::<_, io::Error>(resp)
        };

        let resp = time::timeout(QUERY_TIMEOUT, exchange)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dns: query timed out"))??;
        decode_answers(id, &resp)
    }
}

#[async_trait]
impl Resolver for TcpDnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let mut ips = self.query(host, QTYPE_A).await?;
        if ips.is_empty() {
            ips = self.query(host, QTYPE_AAAA).await?;
        }
        if ips.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("dns: no records for {host}"),
            ));
        }

        tracing::debug!(host = %host, server = %self.server, answers = ips.len(), "dns: resolved");
        Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("dns: {msg}"))
}

fn encode_query(id: u16, host: &str, qtype: u16) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(18 + host.len());
    out.extend_from_slice(&id.to_be_bytes());
    // Standard query, recursion desired.
    out.extend_from_slice(&[0x01, 0x00]);
    // QDCOUNT=1, ANCOUNT=0, NSCOUNT=0, ARCOUNT=0
    out.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);

    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("dns: invalid name {host:?}"),
            ));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(out)
}

fn read_u16(msg: &[u8], at: usize) -> io::Result<u16> {
    msg.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| invalid("truncated message"))
}

/// Returns the offset just past the (possibly compressed) name at `at`.
fn skip_name(msg: &[u8], mut at: usize) -> io::Result<usize> {
    loop {
        let len = *msg.get(at).ok_or_else(|| invalid("truncated name"))?;
        match len {
            0 => return Ok(at + 1),
            l if l & 0xC0 == 0xC0 => {
                // Compression pointer ends the name in place.
                if at + 2 > msg.len() {
                    return Err(invalid("truncated pointer"));
                }
                return Ok(at + 2);
            }
            l if l & 0xC0 != 0 => return Err(invalid("bad label type")),
            l => at += 1 + l as usize,
        }
    }
}

fn decode_answers(id: u16, msg: &[u8]) -> io::Result<Vec<IpAddr>> {
    if msg.len() < 12 || msg.len() > MAX_MESSAGE {
        return Err(invalid("bad message length"));
    }
    if read_u16(msg, 0)? != id {
        return Err(invalid("transaction id mismatch"));
    }
    let flags = read_u16(msg, 2)?;
    if flags & 0x8000 == 0 {
        return Err(invalid("not a response"));
    }
    let rcode = flags & 0x000F;
    if rcode != 0 {
        return Err(invalid(&format!("server returned rcode {rcode}")));
    }

    let qdcount = read_u16(msg, 4)?;
    let ancount = read_u16(msg, 6)?;

    let mut at = 12;
    for _ in 0..qdcount {
        at = skip_name(msg, at)? + 4;
    }

    let mut out = Vec::new();
    for _ in 0..ancount {
        at = skip_name(msg, at)?;
        let rtype = read_u16(msg, at)?;
        let rclass = read_u16(msg, at + 2)?;
        let rdlen = read_u16(msg, at + 8)? as usize;
        let rdata = msg
            .get(at + 10..at + 10 + rdlen)
            .ok_or_else(|| invalid("truncated record"))?;
        at += 10 + rdlen;

        if rclass != QCLASS_IN {
            continue;
        }
        match (rtype, rdata.len()) {
            (QTYPE_A, 4) => {
                out.push(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
            }
            (QTYPE_AAAA, 16) => {
                let mut b = [0u8; 16];
                b.copy_from_slice(rdata);
                out.push(IpAddr::V6(Ipv6Addr::from(b)));
            }
            // CNAME and friends: the server already chased them for us.
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wisp::net::SocketTuning;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpSocket};

    #[derive(Default)]
    struct CountingHook {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl ConnectHook for CountingHook {
        async fn before_connect(&self, _socket: &TcpSocket) -> io::Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn before_listen(&self, _socket: &TcpSocket) -> io::Result<()> {
            Ok(())
        }
    }

    fn response(id: u16, rcode: u8, question: &[u8], answers: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&[0x81, 0x80 | rcode]);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&(answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(question);
        for (rtype, rdata) in answers {
            // Pointer to the question name at offset 12.
            out.extend_from_slice(&[0xC0, 0x0C]);
            out.extend_from_slice(&rtype.to_be_bytes());
            out.extend_from_slice(&QCLASS_IN.to_be_bytes());
            out.extend_from_slice(&300u32.to_be_bytes());
            out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            out.extend_from_slice(rdata);
        }
        out
    }

    #[test]
    fn encode_query_layout() {
        let q = encode_query(0xBEEF, "example.com", QTYPE_A).unwrap();
        assert_eq!(&q[..4], &[0xBE, 0xEF, 0x01, 0x00]);
        assert_eq!(&q[4..6], &[0, 1]);
        assert_eq!(
            &q[12..],
            b"\x07example\x03com\x00\x00\x01\x00\x01".as_slice()
        );
    }

    #[test]
    fn encode_query_rejects_empty_label() {
        assert!(encode_query(1, "bad..name", QTYPE_A).is_err());
    }

    #[test]
    fn decode_compressed_answers() {
        let q = encode_query(7, "example.com", QTYPE_A).unwrap();
        let cname = b"\x03www\xC0\x0C".to_vec();
        let resp = response(
            7,
            0,
            &q[12..],
            &[(5, cname), (QTYPE_A, vec![93, 184, 216, 34]), (QTYPE_A, vec![10, 0, 0, 1])],
        );
        let ips = decode_answers(7, &resp).unwrap();
        assert_eq!(
            ips,
            vec![
                IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            ]
        );
    }

    #[test]
    fn decode_rejects_bad_responses() {
        let q = encode_query(7, "example.com", QTYPE_A).unwrap();
        let ok = response(7, 0, &q[12..], &[(QTYPE_A, vec![1, 2, 3, 4])]);

        assert!(decode_answers(8, &ok).is_err(), "id mismatch");
        assert!(decode_answers(7, &ok[..ok.len() - 2]).is_err(), "truncated");

        let nx = response(7, 3, &q[12..], &[]);
        let err = decode_answers(7, &nx).unwrap_err();
        assert!(err.to_string().contains("rcode 3"));
    }

    #[tokio::test]
    async fn resolves_over_tcp_and_falls_back_to_aaaa() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = ln.local_addr().unwrap();

        tokio::spawn(async move {
            // One connection per query: A (empty), then AAAA.
            for _ in 0..2 {
                let (mut c, _) = ln.accept().await.unwrap();
                let n = c.read_u16().await.unwrap() as usize;
                let mut q = vec![0u8; n];
                c.read_exact(&mut q).await.unwrap();
                let id = u16::from_be_bytes([q[0], q[1]]);
                let qtype = u16::from_be_bytes([q[n - 4], q[n - 3]]);
                let answers = if qtype == QTYPE_AAAA {
                    vec![(QTYPE_AAAA, Ipv6Addr::LOCALHOST.octets().to_vec())]
                } else {
                    vec![]
                };
                let resp = response(id, 0, &q[12..], &answers);
                c.write_u16(resp.len() as u16).await.unwrap();
                c.write_all(&resp).await.unwrap();
            }
        });

        let hook = Arc::new(CountingHook::default());
        let r = TcpDnsResolver::new(server, hook.clone());
        let addrs = r.resolve("v6only.test", 443).await.unwrap();
        assert_eq!(addrs, vec![SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 443)]);
        // Both query sockets were handed to the hook before connecting.
        assert_eq!(hook.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ip_literals_skip_the_server() {
        // Nothing listens on this address; a query would fail.
        let r = TcpDnsResolver::new(
            "127.0.0.1:9".parse().unwrap(),
            Arc::new(SocketTuning::default()),
        );
        let addrs = r.resolve("192.0.2.1", 80).await.unwrap();
        assert_eq!(addrs, vec!["192.0.2.1:80".parse().unwrap()]);
    }

    #[tokio::test]
    async fn hook_failure_aborts_the_query() {
        struct Refuse;

        #[async_trait]
        impl ConnectHook for Refuse {
            async fn before_connect(&self, _socket: &TcpSocket) -> io::Result<()> {
                Err(io::Error::other("vpn: protect rejected by host"))
            }

            fn before_listen(&self, _socket: &TcpSocket) -> io::Result<()> {
                Ok(())
            }
        }

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let r = TcpDnsResolver::new(ln.local_addr().unwrap(), Arc::new(Refuse));
        let err = r.resolve("example.test", 443).await.unwrap_err();
        assert!(err.to_string().contains("rejected"), "got {err}");
    }
}
