//! DNS Responder: a UDP DNS server that forges A-records for intercepted
//! names while transparently forwarding everything else, and that keeps the
//! Address Map fresh with periodic re-resolution.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::proto::op::{Message, MessageType, OpCode, Query};
use hickory_resolver::proto::rr::{rdata, DNSClass, Name, RData, Record, RecordType};
use hickory_resolver::proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::address_map::AddressMap;
use crate::error::dns::DnsError;
use crate::policy::InterceptPolicy;

/// Maximum time to wait for a single upstream DNS exchange.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the refresh task re-resolves every cached name.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// TTL injected into every forged A-record.
const HIJACK_TTL: u32 = 600;

/// Maximum UDP datagram size accepted from clients or upstream.
const MAX_DNS_PACKET: usize = 4096;

/// Shared DNS responder state: everything the per-request handler, the
/// refresh task, and the TCP relay's synchronous re-resolution path need.
pub struct DnsResponder {
    upstream: SocketAddr,
    external_address: Ipv4Addr,
    policy: Arc<InterceptPolicy>,
    address_map: Arc<AddressMap>,
}

impl DnsResponder {
    pub fn new(
        upstream: SocketAddr,
        external_address: Ipv4Addr,
        policy: Arc<InterceptPolicy>,
        address_map: Arc<AddressMap>,
    ) -> Self {
        Self {
            upstream,
            external_address,
            policy,
            address_map,
        }
    }

    /// Bind the configured listen address and serve forever. Returns an
    /// error only if the initial bind fails (the only bind-failure path
    /// that's meant to take the whole process down, per the config
    /// load/bind failure policy); per-request errors are logged and never
    /// propagate out of here.
    pub async fn serve(self: Arc<Self>, listen_addr: SocketAddr) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind(listen_addr).await?);
        log::info!("DNS responder listening on {}", listen_addr);

        let refresh_responder = Arc::clone(&self);
        tokio::spawn(async move { refresh_responder.refresh_loop().await });

        let mut buf = vec![0u8; MAX_DNS_PACKET];
        loop {
            let (len, client_addr) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(err) => {
                    log::error!("DNS socket recv error: {}", err);
                    continue;
                }
            };
            let request_bytes = buf[..len].to_vec();
            let responder = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Err(err) = responder
                    .handle_datagram(&socket, client_addr, request_bytes)
                    .await
                {
                    log::error!("error handling DNS request from {}: {}", client_addr, err);
                }
            });
        }
    }

    async fn handle_datagram(
        &self,
        socket: &UdpSocket,
        client_addr: SocketAddr,
        request_bytes: Vec<u8>,
    ) -> Result<(), DnsError> {
        let request = Message::from_bytes(&request_bytes)?;
        let question = match request.queries().first() {
            Some(q) => q,
            None => return Ok(()), // question count < 1: silently drop
        };
        let qname = question.name().to_string();

        if !self.policy.matches(&qname) {
            log::debug!("passing {} through to upstream", qname);
            match self.exchange_upstream(&request_bytes).await {
                Ok(reply_bytes) => socket.send_to(&reply_bytes, client_addr).await.map(|_| ())?,
                Err(err) => log::error!("upstream exchange failed for {}: {}", qname, err),
            }
            return Ok(());
        }

        log::info!("{} matches intercept policy, hijacking", qname);
        if self.address_map.lookup(&qname).is_none() {
            if let Err(err) = self.resolve_and_cache(&request_bytes).await {
                log::warn!("could not populate address map for {}: {}", qname, err);
            }
        }

        let reply = build_hijack_reply(&request, question, self.external_address);
        let reply_bytes = reply.to_bytes()?;
        socket.send_to(&reply_bytes, client_addr).await?;
        Ok(())
    }

    /// Re-resolve `request_bytes` upstream (same wire bytes, same ID) and
    /// feed every answer name into the address map with the first
    /// A-record's IPv4 value. Leaves the address map untouched if no usable
    /// A-record is present.
    async fn resolve_and_cache(&self, request_bytes: &[u8]) -> Result<(), DnsError> {
        let reply_bytes = self.exchange_upstream(request_bytes).await?;
        let reply = Message::from_bytes(&reply_bytes)?;
        apply_upstream_answer(&self.address_map, &reply);
        Ok(())
    }

    /// Build and send a synthetic A-query for `name` upstream, and apply
    /// the answer to the address map. Used both by the periodic refresh
    /// task and by the TCP relay when it needs an on-demand re-resolution.
    pub async fn refresh_now(&self, name: &str) -> Result<(), DnsError> {
        let query_bytes = build_a_query(name)?;
        let reply_bytes = self.exchange_upstream(&query_bytes).await?;
        let reply = Message::from_bytes(&reply_bytes)?;
        apply_upstream_answer(&self.address_map, &reply);
        Ok(())
    }

    async fn exchange_upstream(&self, request_bytes: &[u8]) -> Result<Vec<u8>, DnsError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.upstream).await?;
        socket.send(request_bytes).await?;

        let mut buf = vec![0u8; MAX_DNS_PACKET];
        let len = timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::Timeout)??;
        buf.truncate(len);
        Ok(buf)
    }

    /// Wake every `REFRESH_INTERVAL`, snapshot the address map's keys, and
    /// re-resolve each one in place so hijacked names stay backed by a
    /// current real IP.
    async fn refresh_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.tick().await; // first tick fires immediately; the real wait starts after
        loop {
            ticker.tick().await;
            let keys = self.address_map.snapshot_keys();
            log::info!("refreshing {} domains in address map", keys.len());
            for key in keys {
                if let Err(err) = self.refresh_now(&key).await {
                    log::warn!("refresh failed for {}: {}", key, err);
                }
            }
        }
    }
}

/// Build a reply whose header and question are copied from `request`, and
/// whose answer section contains exactly one A-record: `question.name()` ->
/// `external_address`, class IN, TTL 600 (invariant #3).
fn build_hijack_reply(request: &Message, question: &Query, external_address: Ipv4Addr) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(request.op_code());
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    reply.add_query(question.clone());

    let mut record = Record::from_rdata(
        question.name().clone(),
        HIJACK_TTL,
        RData::A(rdata::A(external_address)),
    );
    record.set_dns_class(DNSClass::IN);
    reply.add_answer(record);
    reply
}

/// Build a synthetic `A` query for `name`, used by the refresh task and by
/// the TCP relay's on-demand re-resolution.
fn build_a_query(name: &str) -> Result<Vec<u8>, DnsError> {
    let fqdn = if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    };
    let dns_name = Name::from_str(&fqdn)?;

    let mut query = Query::new();
    query.set_name(dns_name);
    query.set_query_type(RecordType::A);
    query.set_query_class(DNSClass::IN);

    let mut message = Message::new();
    message.set_id(transaction_id());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(query);
    Ok(message.to_bytes()?)
}

/// A transaction ID for synthetic upstream queries. Not required to be
/// unpredictable (this is a LAN appliance talking to a configured upstream
/// over a fresh ephemeral socket, not a public resolver), just distinct
/// enough across back-to-back refreshes to aid log correlation.
fn transaction_id() -> u16 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos & 0xFFFF) as u16
}

/// Extract every answer name plus the first A-record's IPv4 value from an
/// upstream reply and write them into `address_map`. If no A-record with a
/// parseable address is present, the address map is left untouched -- the
/// caller still proceeds to hijack with the configured external address.
fn apply_upstream_answer(address_map: &AddressMap, reply: &Message) {
    let names: Vec<String> = reply
        .answers()
        .iter()
        .map(|rr| rr.name().to_string())
        .collect();
    let ip = reply.answers().iter().find_map(|rr| match rr.data() {
        Some(RData::A(a)) => Some(a.0.to_string()),
        _ => None,
    });

    match ip {
        Some(ip) if !names.is_empty() => address_map.insert_many(&names, &ip),
        _ => log::warn!("upstream answer had no usable A record; address map not updated"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_query(name: &str) -> Query {
        let mut query = Query::new();
        query.set_name(Name::from_str(name).unwrap());
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        query
    }

    fn sample_request(name: &str) -> Message {
        let mut message = Message::new();
        message.set_id(0x1234);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(sample_query(name));
        message
    }

    #[test]
    fn hijack_reply_has_exactly_one_a_record_matching_question() {
        let request = sample_request("example-stream.cdn.net.");
        let question = request.queries().first().unwrap().clone();
        let external = Ipv4Addr::new(10, 0, 0, 1);

        let reply = build_hijack_reply(&request, &question, external);

        assert_eq!(reply.id(), request.id());
        assert_eq!(reply.answer_count(), 1);
        let answer = &reply.answers()[0];
        assert_eq!(answer.name(), question.name());
        assert_eq!(answer.record_type(), RecordType::A);
        assert_eq!(answer.ttl(), HIJACK_TTL);
        match answer.data() {
            Some(RData::A(a)) => assert_eq!(a.0, external),
            other => panic!("expected an A record, got {:?}", other),
        }
    }

    #[test]
    fn apply_upstream_answer_populates_both_key_forms() {
        let address_map = AddressMap::new();
        let mut reply = Message::new();
        let mut record = Record::from_rdata(
            Name::from_str("example-stream.cdn.net.").unwrap(),
            300,
            RData::A(rdata::A(Ipv4Addr::new(203, 0, 113, 7))),
        );
        record.set_dns_class(DNSClass::IN);
        reply.add_answer(record);

        apply_upstream_answer(&address_map, &reply);

        assert_eq!(
            address_map.lookup("example-stream.cdn.net"),
            Some("203.0.113.7".to_string())
        );
        assert_eq!(
            address_map.lookup("example-stream.cdn.net."),
            Some("203.0.113.7".to_string())
        );
    }

    #[test]
    fn apply_upstream_answer_leaves_map_untouched_without_a_record() {
        let address_map = AddressMap::new();
        let reply = Message::new(); // no answers at all

        apply_upstream_answer(&address_map, &reply);

        assert!(address_map.snapshot_keys().is_empty());
    }

    #[test]
    fn build_a_query_appends_trailing_dot() {
        let bytes = build_a_query("foo.example").unwrap();
        let message = Message::from_bytes(&bytes).unwrap();
        let question = message.queries().first().unwrap();
        assert_eq!(question.name().to_string(), "foo.example.");
        assert_eq!(question.query_type(), RecordType::A);
    }
}
