//! DNS responder error types.

/// Errors from the DNS responder's upstream exchange path.
///
/// All of these are per-request: the caller logs them and either drops the
/// pass-through response or proceeds to hijack with the configured external
/// address, per the responder's failure semantics.
#[derive(Debug)]
pub enum DnsError {
    /// Could not dial, write to, or read from the upstream DNS server.
    Upstream(std::io::Error),
    /// The wire bytes could not be parsed as (or built into) a DNS message.
    Proto(hickory_resolver::proto::ProtoError),
    /// The upstream exchange did not complete within the configured timeout.
    Timeout,
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upstream(err) => write!(f, "upstream DNS error: {}", err),
            Self::Proto(err) => write!(f, "DNS message error: {}", err),
            Self::Timeout => write!(f, "upstream DNS exchange timed out"),
        }
    }
}

impl std::error::Error for DnsError {}

impl From<std::io::Error> for DnsError {
    fn from(err: std::io::Error) -> Self {
        Self::Upstream(err)
    }
}

impl From<hickory_resolver::proto::ProtoError> for DnsError {
    fn from(err: hickory_resolver::proto::ProtoError) -> Self {
        Self::Proto(err)
    }
}
