//! CTAP-BLE RX path: consumes frames from a [`LinkIo`], skips
//! keep-alives, validates frame type and sequence numbering, and
//! delivers the reassembled payload.
//!
//! Ported from `rx_fragments` in `original_source/src/ble.c`. The state
//! machine is made explicit here (`State`) rather than the C source's
//! interleaved `count`/`reply_length` bookkeeping, which spec.md §9 flags
//! as ambiguous; this port fixes that ambiguity to silent truncation
//! with the announced length always returned.

use zeroize::Zeroize;

use crate::constants::{CTAPBLE_KEEPALIVE, CTAPBLE_MSG};
use crate::error::{BleTransportError, Result};
use crate::link::LinkIo;

enum State {
    ExpectInit,
    ExpectCont { seq_expected: u8 },
    Done,
}

/// Reads one CTAP-BLE `MSG` reply into `out`, returning the length `L`
/// announced by the authenticator — which may exceed `out.len()`. The
/// caller can detect truncation by comparing the return value to the
/// buffer it supplied (spec.md §8 property 3).
pub async fn recv_msg<L: LinkIo>(link: &mut L, out: &mut [u8], timeout_ms: i64) -> Result<u16> {
    let mtu = link.controlpoint_size() as usize;
    if mtu <= 3 {
        return Err(BleTransportError::IoError(format!(
            "controlpoint_size {mtu} too small to carry an init frame header"
        )));
    }

    let mut scratch = vec![0u8; mtu];
    let result = recv_msg_inner(link, out, timeout_ms, mtu, &mut scratch).await;
    scratch.zeroize();
    result
}

async fn recv_msg_inner<L: LinkIo>(
    link: &mut L, out: &mut [u8], timeout_ms: i64, mtu: usize, scratch: &mut [u8],
) -> Result<u16> {
    let mut state = State::ExpectInit;
    let mut announced_len: u16 = 0;
    let mut effective: usize = 0;
    let mut written: usize = 0;

    loop {
        match state {
            State::ExpectInit => {
                let n = read_until_non_keepalive(link, scratch, timeout_ms).await?;
                if n < 4 || scratch[0] != CTAPBLE_MSG {
                    return Err(BleTransportError::ProtocolError(format!(
                        "expected MSG init frame, got cmd=0x{:02x} len={n}",
                        scratch.first().copied().unwrap_or(0)
                    )));
                }
                announced_len = (scratch[1] as u16) << 8 | scratch[2] as u16;
                effective = (announced_len as usize).min(out.len());

                let payload = &scratch[3..n];
                let copy_len = payload.len().min(effective);
                out[..copy_len].copy_from_slice(&payload[..copy_len]);
                written = copy_len;

                state = if written < effective {
                    State::ExpectCont { seq_expected: 0 }
                } else {
                    State::Done
                };
            }
            State::ExpectCont { seq_expected } => {
                let payload_budget = (effective - written).min(mtu - 1);
                let n = link.read(&mut scratch[..payload_budget + 1], timeout_ms).await?;
                if n < 2 {
                    return Err(BleTransportError::ProtocolError(format!(
                        "continuation frame too short ({n} bytes)"
                    )));
                }
                if scratch[0] != seq_expected {
                    return Err(BleTransportError::ProtocolError(format!(
                        "sequence mismatch: expected {seq_expected}, got {}",
                        scratch[0]
                    )));
                }
                let payload = &scratch[1..n];
                let copy_len = payload.len().min(effective - written);
                out[written..written + copy_len].copy_from_slice(&payload[..copy_len]);
                written += copy_len;

                state = if written < effective {
                    State::ExpectCont {
                        seq_expected: (seq_expected + 1) & crate::constants::SEQ_MASK,
                    }
                } else {
                    State::Done
                };
            }
            State::Done => return Ok(announced_len),
        }
    }
}

/// Reads frames until one arrives whose command byte isn't `KEEPALIVE`,
/// silently consuming any number of keep-alives first (spec.md I5).
async fn read_until_non_keepalive<L: LinkIo>(link: &mut L, scratch: &mut [u8], timeout_ms: i64) -> Result<usize> {
    loop {
        let n = link.read(scratch, timeout_ms).await?;
        if n == 0 || scratch[0] != CTAPBLE_KEEPALIVE {
            return Ok(n);
        }
        log::debug!("skipping keep-alive frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLink;

    fn mock(mtu: u16, frames: Vec<Vec<u8>>) -> MockLink {
        MockLink {
            controlpoint_size: mtu,
            written: Vec::new(),
            to_read: frames.into(),
        }
    }

    #[tokio::test]
    async fn s3_keepalive_then_reply() {
        let mut link = mock(
            64,
            vec![
                vec![0x82, 0, 0, 0],
                vec![0x82, 0, 0, 0],
                vec![0x83, 0x00, 0x05, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE],
            ],
        );
        let mut out = [0u8; 5];
        let n = recv_msg(&mut link, &mut out, -1).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
    }

    #[tokio::test]
    async fn s5_truncation_reports_full_announced_length() {
        let mut payload = vec![0x83, 0x00, 100];
        payload.extend(vec![0x11u8; 61]);
        let mut link = mock(64, vec![payload]);
        let mut out = [0u8; 10];
        let n = recv_msg(&mut link, &mut out, -1).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(out, [0x11u8; 10]);
    }

    #[tokio::test]
    async fn sequence_enforcement_rejects_gap() {
        let mut init = vec![0x83, 0x00, 40];
        init.extend(vec![0xAA; 17]);
        let bad_cont = {
            let mut f = vec![5u8];
            f.extend(vec![0xBB; 13]);
            f
        };
        let mut link = mock(20, vec![init, bad_cont]);
        let mut out = [0u8; 40];
        let err = recv_msg(&mut link, &mut out, -1).await.unwrap_err();
        assert!(matches!(err, BleTransportError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn rejects_wrong_command_byte() {
        let mut link = mock(64, vec![vec![0x81, 0x00, 0x01, 0xFF]]);
        let mut out = [0u8; 1];
        let err = recv_msg(&mut link, &mut out, -1).await.unwrap_err();
        assert!(matches!(err, BleTransportError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn round_trip_across_mtus() {
        use crate::framer::send_msg;

        for &mtu in &[20u16, 23, 64, 128, 244, 512] {
            for &len in &[0usize, 1, 50, 4096, 65535] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
                let mut tx_link = MockLink {
                    controlpoint_size: mtu,
                    written: Vec::new(),
                    to_read: Default::default(),
                };
                send_msg(&mut tx_link, &payload).await.unwrap();

                let mut rx_link = MockLink {
                    controlpoint_size: mtu,
                    written: Vec::new(),
                    to_read: tx_link.written.into(),
                };
                let mut out = vec![0u8; len];
                let n = recv_msg(&mut rx_link, &mut out, -1).await.unwrap();
                assert_eq!(n as usize, len, "mtu={mtu} len={len}");
                assert_eq!(out, payload, "mtu={mtu} len={len}");
            }
        }
    }
}
