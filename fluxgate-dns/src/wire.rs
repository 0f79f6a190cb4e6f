//! DNS message construction and answer extraction shared by the DoH and
//! DoT clients.

use crate::error::{DnsError, Result};
use crate::RecordType;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData};
use hickory_proto::serialize::binary::BinDecodable;
use std::net::IpAddr;
use std::str::FromStr;

/// Build a recursive query for `domain` as a wire-format DNS message.
pub(crate) fn build_query(domain: &str, record_type: RecordType) -> Result<Vec<u8>> {
    let name = Name::from_str(domain)
        .map_err(|e| DnsError::NameError(format!("Invalid domain name: {}", e)))?;

    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, record_type.into()));

    message
        .to_vec()
        .map_err(|e| DnsError::Protocol(format!("Failed to serialize query: {}", e)))
}

/// Extract A/AAAA answers from a wire-format DNS response.
pub(crate) fn parse_answers(response: &[u8]) -> Result<Vec<IpAddr>> {
    let message = Message::from_bytes(response)
        .map_err(|e| DnsError::Protocol(format!("Failed to parse DNS response: {}", e)))?;

    let mut ips = Vec::new();
    for answer in message.answers() {
        match answer.data() {
            Some(RData::A(a)) => ips.push(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => ips.push(IpAddr::V6(aaaa.0)),
            _ => {}
        }
    }
    Ok(ips)
}

/// TLS connector over the webpki root store, shared by both encrypted
/// transports.
pub(crate) fn tls_connector() -> tokio_rustls::TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_rustls::TlsConnector::from(std::sync::Arc::new(config))
}
