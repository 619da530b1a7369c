//! Routes the higher layer's logical CTAP commands to the Framer /
//! Reassembler, or synthesizes a local response for `INIT`.
//!
//! Ported from `fido_ble_tx`/`rx_init`/`fido_ble_rx` in
//! `original_source/src/ble.c`. The raw command byte `switch` in the C
//! source becomes a closed `CtapCommand` enum here, so an invalid command
//! is unrepresentable at the call site rather than only caught at
//! runtime — `Other` is kept so a caller that still parses a wire byte
//! upstream has somewhere to route an unrecognized one.

use crate::error::{BleTransportError, Result};
use crate::framer;
use crate::link::LinkIo;
use crate::reassembler;

/// Capability flags this transport reports in its synthesized `INIT` response.
pub const CAP_CBOR: u8 = 0x04;
pub const CAP_NMSG: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtapCommand {
    Init,
    Cbor,
    Msg,
    Other(u8),
}

/// The locally-synthesized reply to an `INIT` request (spec.md §4.5).
/// This transport has no native INIT handshake, so the façade fabricates
/// one shaped like CTAP-HID's, echoing the caller's nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResponse {
    pub nonce: Vec<u8>,
    pub capabilities: u8,
}

pub struct Transport;

impl Transport {
    /// Sends one CTAP-BLE request. `Init` is a no-op: it never touches the link.
    pub async fn send<L: LinkIo>(link: &mut L, cmd: CtapCommand, payload: &[u8]) -> Result<()> {
        match cmd {
            CtapCommand::Init => Ok(()),
            CtapCommand::Cbor | CtapCommand::Msg => framer::send_msg(link, payload).await,
            CtapCommand::Other(b) => Err(BleTransportError::InternalError(format!(
                "unsupported CTAP command byte 0x{b:02x}"
            ))),
        }
    }

    /// Synthesizes the reply to an `INIT` request; never touches the link.
    pub async fn recv_init(nonce: &[u8]) -> InitResponse {
        InitResponse {
            nonce: nonce.to_vec(),
            capabilities: CAP_CBOR | CAP_NMSG,
        }
    }

    /// Receives one CTAP-BLE `MSG` reply into `out`, returning the
    /// announced length (spec.md §4.4 property 3).
    pub async fn recv<L: LinkIo>(link: &mut L, cmd: CtapCommand, out: &mut [u8], timeout_ms: i64) -> Result<u16> {
        match cmd {
            CtapCommand::Cbor => reassembler::recv_msg(link, out, timeout_ms).await,
            CtapCommand::Msg | CtapCommand::Other(_) => Err(BleTransportError::InternalError(format!(
                "unsupported CTAP command for recv: {cmd:?}"
            ))),
            CtapCommand::Init => Err(BleTransportError::InternalError(
                "recv_init should be used for CtapCommand::Init".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLink;

    #[tokio::test]
    async fn init_never_touches_the_link() {
        let mut link = MockLink {
            controlpoint_size: 64,
            written: Vec::new(),
            to_read: Default::default(),
        };
        Transport::send(&mut link, CtapCommand::Init, b"ignored").await.unwrap();
        assert!(link.written.is_empty());
    }

    #[tokio::test]
    async fn init_synthesizes_capability_flags_and_echoes_nonce() {
        let nonce = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let resp = Transport::recv_init(&nonce).await;
        assert_eq!(resp.nonce, nonce);
        assert_eq!(resp.capabilities, CAP_CBOR | CAP_NMSG);
    }

    #[tokio::test]
    async fn other_command_is_internal_error() {
        let mut link = MockLink {
            controlpoint_size: 64,
            written: Vec::new(),
            to_read: Default::default(),
        };
        let err = Transport::send(&mut link, CtapCommand::Other(0x99), b"x").await.unwrap_err();
        assert!(matches!(err, BleTransportError::InternalError(_)));
    }

    #[tokio::test]
    async fn recv_rejects_msg_command() {
        let mut link = MockLink {
            controlpoint_size: 64,
            written: Vec::new(),
            to_read: Default::default(),
        };
        let mut out = [0u8; 4];
        let err = Transport::recv(&mut link, CtapCommand::Msg, &mut out, -1).await.unwrap_err();
        assert!(matches!(err, BleTransportError::InternalError(_)));
    }
}
