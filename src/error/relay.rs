//! TCP MITM relay error types.

/// Errors from a single relayed connection's setup. By the time the byte
/// pumps are running, failures are no longer reported as `RelayError` --
/// they just end the pump loop and close the connection.
#[derive(Debug)]
pub enum RelayError {
    /// Reading the client's initial prefix failed, timed out, or hit EOF
    /// before any byte arrived.
    PrefixRead(std::io::Error),
    /// Host extraction and the client affinity cache both came up empty.
    Unresolved,
    /// Connecting to the resolved real destination failed.
    UpstreamConnect(std::io::Error),
    /// Writing the buffered client prefix to the upstream socket failed.
    PrefixReplay(std::io::Error),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrefixRead(err) => write!(f, "error reading client prefix: {}", err),
            Self::Unresolved => write!(f, "no destination resolved for this connection"),
            Self::UpstreamConnect(err) => write!(f, "error connecting to upstream: {}", err),
            Self::PrefixReplay(err) => write!(f, "error replaying prefix upstream: {}", err),
        }
    }
}

impl std::error::Error for RelayError {}
