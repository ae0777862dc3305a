//! Pluggable datagram transport.
//!
//! The codec operates on plaintext; a transport sits between the socket
//! and the codec and may wrap frames in an encrypted envelope. The
//! baseline is clear-text passthrough. A keyed AEAD transport plugs in
//! behind the same trait once its handshake exists; the `handshake` hook
//! is reserved for it.

use std::sync::Arc;

use bytes::Bytes;

use box_core::config::TransportKind;

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unwrap one inbound datagram into plaintext frame bytes.
    fn open(&self, datagram: &[u8]) -> Result<Bytes, TransportError>;

    /// Wrap outbound plaintext frame bytes for the wire.
    fn seal(&self, frame: Bytes) -> Result<Bytes, TransportError>;

    /// Session establishment for keyed transports. No-op for clear text.
    fn handshake(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// The clear-text baseline: frames travel as-is.
pub struct ClearText;

impl Transport for ClearText {
    fn name(&self) -> &'static str {
        "clear"
    }

    fn open(&self, datagram: &[u8]) -> Result<Bytes, TransportError> {
        Ok(Bytes::copy_from_slice(datagram))
    }

    fn seal(&self, frame: Bytes) -> Result<Bytes, TransportError> {
        Ok(frame)
    }
}

/// Select the transport for the configured kind.
pub fn for_config(kind: TransportKind) -> Result<Arc<dyn Transport>, TransportError> {
    match kind {
        TransportKind::Clear => Ok(Arc::new(ClearText)),
        TransportKind::Noise => Err(TransportError::Unsupported(
            "noise transport is reserved and not yet available",
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unsupported(&'static str),

    #[error("datagram rejected: {0}")]
    Rejected(&'static str),
}
