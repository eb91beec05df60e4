use super::{
    read_adaptation_field, DvbSiParser, ErrorDetails, Packet, PacketHeader, Payload, Result,
    SliceReader, PACKET_SIZE, PID_NULL, SYNC_BYTE,
};
use crate::read_bitfield;
use log::warn;
use std::convert::TryFrom;

/// Scans `buf` from `from` for the start of an MPEG-TS packet.
///
/// A candidate offset must hold a 0x47 sync byte that is followed by another 0x47 exactly one
/// packet later; the two-point check defeats false positives from 0x47 bytes occurring inside
/// payloads. Returns the first such offset, or [`None`] when the remainder of the buffer holds no
/// confirmed sync pair.
pub fn find_sync(buf: &[u8], from: usize) -> Option<usize> {
    let last = buf.len().checked_sub(PACKET_SIZE + 1)?;
    (from..=last).find(|&i| buf[i] == SYNC_BYTE && buf[i + PACKET_SIZE] == SYNC_BYTE)
}

/// Iterator over consecutive 188-byte frames of a capture, re-synchronizing after corruption.
pub(crate) struct Frames<'a> {
    buf: &'a [u8],
    pos: Option<usize>,
}

pub(crate) fn frames(buf: &[u8]) -> Frames {
    Frames {
        buf,
        pos: find_sync(buf, 0),
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a [u8; PACKET_SIZE];

    fn next(&mut self) -> Option<Self::Item> {
        let mut pos = self.pos?;
        loop {
            if pos + PACKET_SIZE > self.buf.len() {
                self.pos = None;
                return None;
            }
            if self.buf[pos] != SYNC_BYTE {
                warn!("Lost sync at offset {}", pos);
                match find_sync(self.buf, pos + 1) {
                    Some(resync) => {
                        pos = resync;
                        continue;
                    }
                    None => {
                        self.pos = None;
                        return None;
                    }
                }
            }
            /* Length checked above */
            let frame = <&[u8; PACKET_SIZE]>::try_from(&self.buf[pos..pos + PACKET_SIZE]).unwrap();
            self.pos = Some(pos + PACKET_SIZE);
            return Some(frame);
        }
    }
}

impl<'a> Packet<'a> {
    /// Stateless parse of one 188-byte frame.
    ///
    /// No section reassembly happens here: the payload is always returned as [`Payload::Raw`]
    /// positioned after the adaptation field (if any). Used by the batch helpers in [`demux`]
    /// which group payloads themselves.
    ///
    /// [`demux`]: crate::demux
    pub fn parse_raw(frame: &'a [u8; PACKET_SIZE]) -> Result<Packet<'a>> {
        let mut reader = SliceReader::new(frame);
        let mut out = Packet {
            header: read_bitfield!(reader, PacketHeader),
            adaptation_field: None,
            payload: None,
        };
        if out.header.sync_byte() != SYNC_BYTE {
            return Err(reader.make_error(ErrorDetails::LostSync));
        }
        if out.header.pid() == PID_NULL {
            return Ok(out);
        }
        if out.header.has_adaptation_field() {
            out.adaptation_field = Some(read_adaptation_field(&mut reader)?);
        }
        if out.header.has_payload() {
            out.payload = Some(Payload::Raw(reader));
        }
        Ok(out)
    }
}

impl DvbSiParser {
    /// Parses every packet of a raw capture, assembling and decoding sections along the way.
    ///
    /// The initial sync position is located with [`find_sync`]; runs of garbage between packets
    /// are skipped by re-synchronizing. When `pid_filter` is set, only packets with a matching
    /// PID are returned (all packets still feed section reassembly). Packets that fail to parse
    /// are logged and dropped; whatever decoded successfully is returned.
    pub fn parse_stream<'a>(&mut self, buf: &'a [u8], pid_filter: Option<u16>) -> Vec<Packet<'a>> {
        let mut out = Vec::new();
        for frame in frames(buf) {
            match self.parse(frame) {
                Ok(packet) => {
                    if pid_filter.map_or(true, |pid| packet.header.pid() == pid) {
                        out.push(packet);
                    }
                }
                Err(e) => warn!("Dropping undecodable packet: {:?}", e),
            }
        }
        out
    }
}
