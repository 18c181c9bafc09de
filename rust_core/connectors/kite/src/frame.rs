//! Splits one binary feed message into its tick payloads.
//!
//! Layout: `u16 packet_count`, then `packet_count` times `u16 length` followed
//! by `length` payload bytes, all big-endian.

use byteorder::{BigEndian, ByteOrder};
use log::trace;

/// Returns the payloads in wire order.
///
/// Messages of two bytes or fewer (heartbeats) yield nothing. A length field
/// or payload running past the end of the buffer stops the split; packets
/// already read are still returned.
pub fn split_packets(message: &[u8]) -> Vec<&[u8]> {
    if message.len() <= 2 {
        return Vec::new();
    }

    let count = BigEndian::read_u16(&message[0..2]) as usize;
    let mut packets = Vec::with_capacity(count);
    let mut offset = 2;

    for index in 0..count {
        if offset + 2 > message.len() {
            trace!("frame truncated before length of packet {}/{}", index + 1, count);
            break;
        }
        let len = BigEndian::read_u16(&message[offset..offset + 2]) as usize;
        offset += 2;

        let end = offset + len;
        if end > message.len() {
            trace!(
                "frame truncated inside packet {}/{} ({} bytes declared)",
                index + 1,
                count,
                len
            );
            break;
        }
        packets.push(&message[offset..end]);
        offset = end;
    }
    packets
}
