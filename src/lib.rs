//! Library for decoding DVB service information from MPEG transport streams.
//!
//! The decoding pipeline is layered: raw bytes are framed into 188-byte packets
//! ([`DvbSiParser::parse_stream`]), per-PID payloads are reassembled into sections across packet
//! boundaries, and sections are decoded into the PSI/SI table records of ISO/IEC 13818-1 and
//! ETSI EN 300 468 (PAT, PMT, NIT, SDT, EIT) together with their descriptors, including DVB text
//! decoding and EIT event timestamps.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! dvbsi-io = "~0.1.0"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dvbsi_io::{DvbSiParser, Payload};
//!
//! let capture = std::fs::read("mux.ts").expect("unable to open!");
//! let mut parser = DvbSiParser::default();
//! for packet in parser.parse_stream(&capture, None) {
//!     if let Some(Payload::Section(section)) = packet.payload {
//!         println!("{:?}", section);
//!     }
//! }
//! ```

#![allow(unused)]
#![deny(unsafe_code)]

use crc::{Crc, Digest, CRC_32_MPEG_2};
use log::warn;
use modular_bitfield_msb::prelude::*;
use std::collections::{HashMap, HashSet};
use std::result;

mod slice_reader;
pub use slice_reader::SliceReader;

mod framer;
pub use framer::find_sync;

mod payload_unit;
use payload_unit::PayloadUnitBuilder;

pub mod psi;
use psi::{SectionBuilder, SiSection};

pub mod si;

pub mod demux;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);
type CrcDigest = Digest<'static, u32>;

/// Length of one MPEG-TS packet in bytes.
pub const PACKET_SIZE: usize = 188;
/// Value of the sync byte opening every MPEG-TS packet.
pub const SYNC_BYTE: u8 = 0x47;

/// PID carrying the Program Association Table.
pub const PID_PAT: u16 = 0x0000;
/// PID carrying the Network Information Table unless the PAT redirects it.
pub const PID_NIT_DEFAULT: u16 = 0x0010;
/// PID carrying the Service Description Table.
pub const PID_SDT: u16 = 0x0011;
/// PID carrying the Event Information Table.
pub const PID_EIT: u16 = 0x0012;
/// PID of null (stuffing) packets.
pub const PID_NULL: u16 = 0x1fff;

/// Errors that may be encountered while parsing an MPEG transport stream.
#[derive(Debug)]
pub enum ErrorDetails {
    /// Encountered when a [`SliceReader`] reads out of bounds.
    /// The [`usize`] parameter is the length of the offending read.
    PacketOverrun(usize),
    /// MPEG-TS packet headers must contain a sync byte of 0x47.
    /// This is the error when encountering any other value.
    LostSync,
    /// Encountered for inconsistent adaptation field parses.
    BadAdaptationHeader,
    /// Encountered for inconsistent section header parses (bad pointer field, oversized or
    /// undersized section length).
    BadSectionHeader,
    /// A section declared more body bytes than the buffer holds.
    TruncatedSection,
    /// A section's table ID does not belong to the table family expected on its PID.
    UnexpectedTableId {
        /// PID the section arrived on.
        pid: u16,
        /// Table ID found in the section header.
        table_id: u8,
    },
    /// A DVB text field selected a character set this implementation does not handle.
    /// Only surfaced by the strict text decoding entry point.
    UnsupportedEncoding(u8),
    /// No section was found on the requested PID.
    SectionNotFound(u16),
}

/// Error type encapsulating all possible parser errors.
#[derive(Debug)]
pub struct Error {
    /// Byte index within the packet that the error was encountered.
    pub location: usize,
    /// Information about the error.
    pub details: ErrorDetails,
}

impl Error {
    /// Creates an error at an explicit byte location.
    pub fn new(location: usize, details: ErrorDetails) -> Self {
        Self { location, details }
    }
}

/// [`std::result::Result`] alias that uses [`Error`].
pub type Result<T> = result::Result<T, Error>;

/// TSC information used in a packet's payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Do not use.
    Reserved,
    /// Scrambled with even key.
    ScrambledEvenKey,
    /// Scrambled with odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte MPEG-TS packet.
#[bitfield]
#[derive(Debug)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// Flag byte following the adaptation field length.
#[bitfield]
#[derive(Debug)]
pub struct AdaptationFieldFlags {
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// Non-payload packet metadata.
///
/// Timestamp and private-data contents are skipped, not interpreted; only the flags are kept so
/// applications can spot discontinuities and random access points.
#[derive(Debug)]
pub struct AdaptationField {
    /// Number of adaptation field bytes following the length byte.
    pub length: u8,
    /// Flag byte, present whenever `length > 0`.
    pub flags: Option<AdaptationFieldFlags>,
}

/// Parsed payload of the packet.
///
/// If the packet is part of an incomplete section, the pending variant is set.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Unhandled payload type; parsing is left to the application.
    Raw(SliceReader<'a>),
    /// Section payload unit is incomplete.
    SectionPending,
    /// Complete parsed PSI/SI section.
    Section(SiSection),
    /// Continuation of a payload unit whose start was never seen; the data is discarded.
    Unknown,
}

/// Top-level parsed structure for one MPEG-TS packet.
#[derive(Debug)]
pub struct Packet<'a> {
    /// Packet link-layer header.
    pub header: PacketHeader,
    /// Optional adaptation field metadata.
    pub adaptation_field: Option<AdaptationField>,
    /// Optional payload data.
    pub payload: Option<Payload<'a>>,
}

fn read_adaptation_field(reader: &mut SliceReader) -> Result<AdaptationField> {
    let length = reader.read_u8()?;
    if length as usize > reader.remaining_len() {
        warn!("Bad adaptation field length");
        return Err(reader.make_error(ErrorDetails::BadAdaptationHeader));
    }
    let mut a_reader = reader.new_sub_reader(length as usize)?;
    let flags = if length > 0 {
        Some(AdaptationFieldFlags::from_bytes([a_reader.read_u8()?]))
    } else {
        None
    };
    // PCR/OPCR and private data stay inside a_reader and are dropped with it
    Ok(AdaptationField { length, flags })
}

/// DVB-SI parser state capable of assembling sections that span packets.
///
/// Sections are detected on the PSI/SI PIDs (PAT, NIT, SDT, EIT) and on the PMT PIDs learned from
/// the most recent PAT. All other payloads are handed back raw.
///
/// # Example
///
/// ```no_run
/// use dvbsi_io::DvbSiParser;
/// use std::convert::TryInto;
///
/// let capture = std::fs::read("mux.ts").expect("unable to open!");
/// let mut parser = DvbSiParser::default();
/// for frame in capture.chunks_exact(188) {
///     let packet = parser.parse(frame.try_into().unwrap()).expect("parse error!");
///     println!("{:?}", packet);
/// }
/// ```
pub struct DvbSiParser {
    pending_sections: HashMap<u16, PayloadUnitBuilder>,
    nit_pid: u16,
    known_pmt_pids: HashSet<u16>,
}

impl Default for DvbSiParser {
    fn default() -> Self {
        Self {
            pending_sections: HashMap::new(),
            nit_pid: PID_NIT_DEFAULT,
            known_pmt_pids: HashSet::new(),
        }
    }
}

impl DvbSiParser {
    /// PID the parser currently expects the NIT on (0x0010 unless a PAT redirected it).
    pub fn nit_pid(&self) -> u16 {
        self.nit_pid
    }

    /// PMT PIDs learned from the most recent PAT.
    pub fn known_pmt_pids(&self) -> &HashSet<u16> {
        &self.known_pmt_pids
    }

    pub(crate) fn is_si_pid(&self, pid: u16) -> bool {
        pid == PID_PAT
            || pid == self.nit_pid
            || pid == PID_SDT
            || pid == PID_EIT
            || self.known_pmt_pids.contains(&pid)
    }

    fn read_payload<'a>(
        &mut self,
        pusi: bool,
        pid: u16,
        mut reader: SliceReader<'a>,
    ) -> Result<Payload<'a>> {
        if pusi {
            /* Make sure we're not starting an already-started unit */
            if self.pending_sections.contains_key(&pid) {
                warn!("Discarding unfinished section on PID: {:x}", pid);
                self.pending_sections.remove(&pid);
            }

            if self.is_si_pid(pid) {
                self.start_section(pid, &mut reader)
            } else {
                Ok(Payload::Raw(reader))
            }
        } else if self.is_si_pid(pid) {
            /* Attempt unit continuation */
            self.continue_payload_unit(pid, &mut reader)
        } else {
            Ok(Payload::Raw(reader))
        }
    }

    /// Parse data for exactly one 188-byte MPEG-TS packet.
    ///
    /// All information about the packet is returned as [`Packet`].
    ///
    /// For sections that span multiple packets, [`Payload::SectionPending`] is returned until the
    /// final packet of the section is read, at which point the entire section is parsed and made
    /// available as [`Payload::Section`].
    pub fn parse<'a>(&mut self, packet: &'a [u8; PACKET_SIZE]) -> Result<Packet<'a>> {
        let mut reader = SliceReader::new(packet);

        /* Start with header and verify sync */
        let mut out = Packet {
            header: read_bitfield!(reader, PacketHeader),
            adaptation_field: None,
            payload: None,
        };
        if out.header.sync_byte() != SYNC_BYTE {
            return Err(reader.make_error(ErrorDetails::LostSync));
        }

        let pid = out.header.pid();

        /* Discard null packets early */
        if pid == PID_NULL {
            return Ok(out);
        }

        /* Read adaptation field if it exists; its contents are skipped, not interpreted */
        if out.header.has_adaptation_field() {
            out.adaptation_field = Some(read_adaptation_field(&mut reader)?);
        }

        /* Read payload if it exists. Scrambled payloads are opaque. */
        if out.header.has_payload() {
            if out.header.tsc() == TransportScramblingControl::NotScrambled {
                out.payload = Some(self.read_payload(out.header.pusi(), pid, reader)?);
            } else {
                out.payload = Some(Payload::Raw(reader));
            }
        }

        Ok(out)
    }
}
