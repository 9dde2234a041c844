//! Streaming a transport stream source into a modulator.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::device::DeviceError;
use crate::error::Result;
use crate::protocol::{PKT_SIZE, SYNC_BYTE, TsPacket};
use crate::session::Modulator;

/// What one pass over a packet source produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    /// Packets handed to the modulator.
    pub packets: u64,
    /// Packets whose first byte is not the sync byte (sent anyway).
    pub bad_sync: u64,
    /// Bytes at the end of the source that did not form a whole packet.
    pub trailing_bytes: usize,
    /// Streaming stopped because the cancel flag was raised.
    pub cancelled: bool,
}

impl StreamSummary {
    /// Fold the result of another pass into this one.
    pub fn merge(&mut self, other: &StreamSummary) {
        self.packets += other.packets;
        self.bad_sync += other.bad_sync;
        self.trailing_bytes += other.trailing_bytes;
        self.cancelled |= other.cancelled;
    }
}

/// Read until `buf` is full or the source ends.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Send every packet of `reader` to an already started modulator, in bursts
/// of `burst_packets`.
///
/// Raising `cancel` ends the stream at the next burst (or inside the send
/// when the modulator watches the same flag); that is reported through
/// [`StreamSummary::cancelled`], not as an error.
pub fn stream_packets<M, R>(
    modulator: &mut M,
    reader: &mut R,
    burst_packets: usize,
    cancel: Option<&AtomicBool>,
) -> Result<StreamSummary>
where
    M: Modulator + ?Sized,
    R: Read,
{
    let mut summary = StreamSummary::default();
    let mut burst: Vec<TsPacket> = vec![[0u8; PKT_SIZE]; burst_packets.max(1)];

    loop {
        if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
            summary.cancelled = true;
            break;
        }

        let filled = fill(reader, burst.as_flattened_mut())?;
        let count = filled / PKT_SIZE;
        summary.trailing_bytes = filled % PKT_SIZE;

        if count > 0 {
            let packets = &burst[..count];
            let bad = packets.iter().filter(|p| p[0] != SYNC_BYTE).count() as u64;
            if bad > 0 && summary.bad_sync == 0 {
                log::warn!("packet without sync byte near packet {}", summary.packets);
            }
            summary.bad_sync += bad;

            match modulator.send(packets) {
                Ok(()) => summary.packets += count as u64,
                Err(DeviceError::Cancelled) => {
                    summary.cancelled = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if filled < burst.as_flattened().len() {
            break;
        }
    }

    if summary.trailing_bytes > 0 {
        log::warn!(
            "ignored {} trailing bytes (not a whole packet)",
            summary.trailing_bytes
        );
    }
    Ok(summary)
}
