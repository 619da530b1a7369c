//! CTAP-BLE TX path: splits an opaque command payload into one
//! initialization frame and zero or more continuation frames sized
//! against the link's `controlpoint_size`.
//!
//! Ported from `tx_preamble`/`tx_cont`/`fido_ble_fragment_tx` in
//! `original_source/src/ble.c`; the wire shape is unchanged, only the
//! buffer ownership moves from a stack union to a `Vec<u8>` zeroized on
//! every exit path.

use zeroize::Zeroize;

use crate::constants::{CTAPBLE_CONT_HEADER_LEN, CTAPBLE_INIT_HEADER_LEN, CTAPBLE_MSG, SEQ_MASK};
use crate::error::{BleTransportError, Result};
use crate::link::LinkIo;

/// Writes one initialization frame (`[CTAPBLE_MSG, L_hi, L_lo, ...payload]`)
/// followed by as many continuation frames as needed to ship `payload`.
pub async fn send_msg<L: LinkIo>(link: &mut L, payload: &[u8]) -> Result<()> {
    let mtu = link.controlpoint_size() as usize;
    if mtu <= CTAPBLE_INIT_HEADER_LEN {
        return Err(BleTransportError::IoError(format!(
            "controlpoint_size {mtu} too small for a {CTAPBLE_INIT_HEADER_LEN}-byte init header"
        )));
    }

    let total_len = payload.len();
    if total_len > u16::MAX as usize {
        return Err(BleTransportError::InvalidArgument(format!(
            "payload of {total_len} bytes exceeds the 16-bit CTAP-BLE length field"
        )));
    }

    let sent = tx_init(link, total_len as u16, payload, mtu).await?;

    let mut sent = sent;
    let mut seq: u8 = 0;
    while sent < total_len {
        let n = tx_cont(link, seq, &payload[sent..], mtu).await?;
        sent += n;
        seq = (seq + 1) & SEQ_MASK;
    }

    Ok(())
}

async fn tx_init<L: LinkIo>(link: &mut L, total_len: u16, payload: &[u8], mtu: usize) -> Result<usize> {
    let mut frame = vec![0u8; mtu];
    frame[0] = CTAPBLE_MSG;
    frame[1] = (total_len >> 8) as u8;
    frame[2] = (total_len & 0xff) as u8;

    let chunk_len = payload.len().min(mtu - CTAPBLE_INIT_HEADER_LEN);
    frame[CTAPBLE_INIT_HEADER_LEN..CTAPBLE_INIT_HEADER_LEN + chunk_len].copy_from_slice(&payload[..chunk_len]);
    frame.truncate(CTAPBLE_INIT_HEADER_LEN + chunk_len);

    let result = link.write(&frame).await;
    frame.zeroize();
    result?;
    Ok(chunk_len)
}

async fn tx_cont<L: LinkIo>(link: &mut L, seq: u8, remaining: &[u8], mtu: usize) -> Result<usize> {
    if mtu <= CTAPBLE_CONT_HEADER_LEN {
        return Err(BleTransportError::IoError(format!(
            "controlpoint_size {mtu} too small for a {CTAPBLE_CONT_HEADER_LEN}-byte continuation header"
        )));
    }
    let mut frame = vec![0u8; mtu];
    frame[0] = seq;

    let chunk_len = remaining.len().min(mtu - CTAPBLE_CONT_HEADER_LEN);
    frame[CTAPBLE_CONT_HEADER_LEN..CTAPBLE_CONT_HEADER_LEN + chunk_len]
        .copy_from_slice(&remaining[..chunk_len]);
    frame.truncate(CTAPBLE_CONT_HEADER_LEN + chunk_len);

    let result = link.write(&frame).await;
    frame.zeroize();
    result?;
    Ok(chunk_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLink;

    fn mock(mtu: u16) -> MockLink {
        MockLink {
            controlpoint_size: mtu,
            written: Vec::new(),
            to_read: Default::default(),
        }
    }

    #[tokio::test]
    async fn s1_single_frame_request() {
        let mut link = mock(64);
        send_msg(&mut link, &[0x01]).await.unwrap();
        assert_eq!(link.written.len(), 1);
        assert_eq!(link.written[0], vec![0x83, 0x00, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn s2_two_frame_request() {
        let mut link = mock(20);
        let payload: Vec<u8> = (0u8..30).collect();
        send_msg(&mut link, &payload).await.unwrap();

        assert_eq!(link.written.len(), 2);
        let mut expect_init = vec![0x83, 0x00, 0x1e];
        expect_init.extend_from_slice(&payload[0..17]);
        assert_eq!(link.written[0], expect_init);

        let mut expect_cont = vec![0x00];
        expect_cont.extend_from_slice(&payload[17..30]);
        assert_eq!(link.written[1], expect_cont);
    }

    #[tokio::test]
    async fn mtu_discipline_and_sequence_wrap() {
        let mtu: usize = 23;
        let mut link = mock(mtu as u16);
        let payload = vec![0xAB; 0x81 * (mtu - 1) + 1];
        send_msg(&mut link, &payload).await.unwrap();

        assert!(link.written.iter().all(|f| f.len() <= mtu));
        assert_eq!(link.written[0][0], 0x83);

        let seqs: Vec<u8> = link.written[1..].iter().map(|f| f[0]).collect();
        for (i, &s) in seqs.iter().enumerate() {
            assert_eq!(s, (i as u8) & SEQ_MASK);
        }
        assert!(seqs.contains(&0x7f));
        assert!(seqs.contains(&0x00));
    }

    #[tokio::test]
    async fn rejects_payload_too_large_for_length_field() {
        let mut link = mock(64);
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(send_msg(&mut link, &payload).await.is_err());
    }
}
