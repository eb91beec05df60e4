//! Section-layer decoding: headers, CRC validation, and table dispatch.
//!
//! Sections arrive either streamed (assembled across packets by [`DvbSiParser`]) or as one
//! contiguous byte run ([`SiSection::parse`]); both paths end in the same per-table decoders.

use super::{
    CrcDigest, DvbSiParser, ErrorDetails, Payload, Result, SliceReader, CRC, PID_EIT,
    PID_NIT_DEFAULT, PID_PAT, PID_SDT,
};
use crate::read_bitfield;
use crate::si::{self, descriptors::Descriptor, Eit, Nit, Sdt};
use log::warn;
use modular_bitfield_msb::prelude::*;
use smallvec::SmallVec;
use std::collections::HashSet;

/// Table ID of the Program Association Table.
pub const TID_PAT: u8 = 0x00;
/// Table ID of the Program Map Table.
pub const TID_PMT: u8 = 0x02;
/// Table ID of the NIT for the actual network.
pub const TID_NIT_ACTUAL: u8 = 0x40;
/// Table ID of the NIT for another network.
pub const TID_NIT_OTHER: u8 = 0x41;
/// Table ID of the SDT for the actual transport stream.
pub const TID_SDT_ACTUAL: u8 = 0x42;
/// Table ID of the SDT for another transport stream.
pub const TID_SDT_OTHER: u8 = 0x46;
/// First table ID of the EIT family (present/following, actual stream).
pub const TID_EIT_FIRST: u8 = 0x4e;
/// Last table ID of the EIT family (schedule, other streams).
pub const TID_EIT_LAST: u8 = 0x6f;

/// Largest section_length a DVB SI section may declare.
pub const MAX_SECTION_LENGTH: usize = 4093;

#[bitfield]
#[derive(Debug)]
pub struct SectionHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_bits: B2,
    pub section_length: B12,
}

#[bitfield]
#[derive(Debug)]
pub struct SectionSyntax {
    pub table_id_extension: B16,
    pub reserved_bits: B2,
    pub version: B5,
    pub current_next_indicator: bool,
    pub section_num: B8,
    pub last_section_num: B8,
}

/// One program association. Program number 0 carries the NIT PID; every other entry maps a
/// program to its PMT PID.
#[bitfield]
#[derive(Debug)]
pub struct PatEntry {
    pub program_num: B16,
    pub reserved: B3,
    pub program_map_pid: B13,
}

#[bitfield]
#[derive(Debug)]
pub struct PmtHeader {
    pub reserved: B3,
    pub pcr_pid: B13,
    pub reserved2: B4,
    pub program_info_length: B12,
}

#[bitfield]
#[derive(Debug)]
pub struct ElementaryStreamInfoHeader {
    pub stream_type: B8,
    pub reserved: B3,
    pub elementary_pid: B13,
    pub reserved2: B4,
    pub es_info_length: B12,
}

/// One elementary stream entry of a PMT.
#[derive(Debug)]
pub struct ElementaryStreamInfo {
    /// Stream type and PID.
    pub header: ElementaryStreamInfoHeader,
    /// Descriptors scoped to this elementary stream.
    pub es_descriptors: SmallVec<[Descriptor; 4]>,
}

/// Program Map Table body.
#[derive(Debug)]
pub struct Pmt {
    /// PCR PID and program info length.
    pub header: PmtHeader,
    /// Descriptors scoped to the whole program.
    pub program_descriptors: Vec<Descriptor>,
    /// Elementary streams of the program.
    pub es_infos: Vec<ElementaryStreamInfo>,
}

/// Decoded body of a section, dispatched on PID and table ID.
#[derive(Debug)]
pub enum TableData {
    /// Unhandled table type; body bytes kept raw.
    Raw(Vec<u8>),
    /// Program Association Table.
    Pat(Vec<PatEntry>),
    /// Program Map Table.
    Pmt(Pmt),
    /// Network Information Table.
    Nit(Nit),
    /// Service Description Table.
    Sdt(Sdt),
    /// Event Information Table.
    Eit(Eit),
}

/// One decoded PSI/SI section.
#[derive(Debug)]
pub struct SiSection {
    /// Common section header.
    pub header: SectionHeader,
    /// Long-form syntax fields, absent for short sections.
    pub syntax: Option<SectionSyntax>,
    /// Whether the MPEG-2 CRC32 over the section matched the stored value. A failed check does
    /// not suppress the decoded data.
    pub crc_valid: bool,
    /// Decoded table body.
    pub data: TableData,
}

fn expected_on_pid(pid: u16, table_id: u8, nit_pid: u16, pmt_pids: &HashSet<u16>) -> bool {
    if pid == PID_PAT {
        table_id == TID_PAT
    } else if pid == nit_pid {
        matches!(table_id, TID_NIT_ACTUAL | TID_NIT_OTHER)
    } else if pid == PID_SDT {
        matches!(table_id, TID_SDT_ACTUAL | TID_SDT_OTHER)
    } else if pid == PID_EIT {
        (TID_EIT_FIRST..=TID_EIT_LAST).contains(&table_id)
    } else if pmt_pids.contains(&pid) {
        table_id == TID_PMT
    } else {
        true
    }
}

fn decode_pat(reader: &mut SliceReader) -> Result<Vec<PatEntry>> {
    let mut entries = Vec::with_capacity(reader.remaining_len() / 4);
    while reader.remaining_len() >= 4 {
        entries.push(PatEntry::from_bytes(*reader.read_array_ref::<4>()?));
    }
    Ok(entries)
}

fn decode_pmt(reader: &mut SliceReader) -> Result<Pmt> {
    let header = read_bitfield!(reader, PmtHeader);
    let mut pmt = Pmt {
        header,
        program_descriptors: Vec::new(),
        es_infos: Vec::new(),
    };
    let mut info_reader = reader.new_sub_reader(pmt.header.program_info_length() as usize)?;
    pmt.program_descriptors = Descriptor::read_loop(&mut info_reader)?;
    while reader.remaining_len() > 0 {
        let es_header = read_bitfield!(reader, ElementaryStreamInfoHeader);
        let mut es_reader = reader.new_sub_reader(es_header.es_info_length() as usize)?;
        pmt.es_infos.push(ElementaryStreamInfo {
            header: es_header,
            es_descriptors: SmallVec::from_vec(Descriptor::read_loop(&mut es_reader)?),
        });
    }
    Ok(pmt)
}

impl SiSection {
    /// Decodes one section from a contiguous byte run starting at the pointer field.
    ///
    /// This is the batch-mode twin of the streaming path in [`DvbSiParser`]: hand it the
    /// reassembled payload bytes of one PUSI-delimited unit (see [`crate::demux`]) and the PID
    /// they arrived on. The PID selects the expected table family; a section whose table ID does
    /// not belong to it is rejected with [`ErrorDetails::UnexpectedTableId`]. PMT sections are
    /// recognized by table ID on any unclassified PID.
    pub fn parse(pid: u16, bytes: &[u8]) -> Result<SiSection> {
        let mut reader = SliceReader::new(bytes);
        let pointer_field = reader.read_u8()?;
        reader.skip(pointer_field as usize)?;
        if reader.remaining_len() < 3 {
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        let header_bytes = reader.read_array_ref::<3>()?;
        let header = SectionHeader::from_bytes(*header_bytes);
        let section_length = header.section_length() as usize;
        if section_length > MAX_SECTION_LENGTH {
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        if section_length > reader.remaining_len() {
            return Err(reader.make_error(ErrorDetails::TruncatedSection));
        }
        let table_id = header.table_id();
        if !expected_on_pid(pid, table_id, PID_NIT_DEFAULT, &HashSet::new()) {
            warn!("Unexpected table 0x{:02x} on PID: {:x}", table_id, pid);
            return Err(reader.make_error(ErrorDetails::UnexpectedTableId { pid, table_id }));
        }
        if section_length == 0 {
            return Ok(SiSection {
                header,
                syntax: None,
                crc_valid: true,
                data: TableData::Raw(Vec::new()),
            });
        }
        if !header.section_syntax_indicator() {
            let body = reader.read(section_length)?;
            return Ok(SiSection {
                header,
                syntax: None,
                crc_valid: true,
                data: TableData::Raw(body.to_vec()),
            });
        }
        if section_length < 9 {
            /* Must have length to read the syntax fields and the CRC32 */
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        let syntax_bytes = reader.read_array_ref::<5>()?;
        let syntax = SectionSyntax::from_bytes(*syntax_bytes);
        let body = reader.read(section_length - 9)?;
        let stored_hash = reader.read_be_u32()?;
        let mut hasher = CRC.digest();
        hasher.update(header_bytes);
        hasher.update(syntax_bytes);
        hasher.update(body);
        let crc_valid = hasher.finalize() == stored_hash;
        if !crc_valid {
            warn!("Section CRC mismatch for PID: {:x}", pid);
        }

        let ext = syntax.table_id_extension();
        let mut body_reader = SliceReader::new(body);
        let data = match pid {
            PID_PAT => TableData::Pat(decode_pat(&mut body_reader)?),
            PID_NIT_DEFAULT => TableData::Nit(si::decode_nit(ext, &mut body_reader)?),
            PID_SDT => TableData::Sdt(si::decode_sdt(ext, &mut body_reader)?),
            PID_EIT => TableData::Eit(si::decode_eit(ext, &mut body_reader)?),
            _ if table_id == TID_PMT => TableData::Pmt(decode_pmt(&mut body_reader)?),
            _ => TableData::Raw(body.to_vec()),
        };
        Ok(SiSection {
            header,
            syntax: Some(syntax),
            crc_valid,
            data,
        })
    }
}

pub(crate) struct SectionBuilder {
    header: SectionHeader,
    syntax: Option<SectionSyntax>,
    data: Vec<u8>,
    hasher: CrcDigest,
}

impl SectionBuilder {
    pub fn new(
        capacity: usize,
        header: SectionHeader,
        syntax: Option<SectionSyntax>,
        hasher: CrcDigest,
    ) -> Self {
        Self {
            header,
            syntax,
            data: Vec::with_capacity(capacity),
            hasher,
        }
    }

    pub fn extend_from_slice(&mut self, slice: &[u8]) {
        self.data.extend_from_slice(slice);
    }

    pub fn finish<'a>(mut self, pid: u16, parser: &mut DvbSiParser) -> Result<Payload<'a>> {
        if self.data.is_empty() {
            /* section_length of zero: an empty record, not an error */
            return Ok(Payload::Section(SiSection {
                header: self.header,
                syntax: None,
                crc_valid: true,
                data: TableData::Raw(Vec::new()),
            }));
        }

        /* Validate using CRC32; a mismatch is recorded on the section, not fatal */
        let len_minus_crc = self.data.len() - 4;
        self.hasher.update(&self.data[..len_minus_crc]);
        let actual_hash = self.hasher.finalize();
        let expected_hash = u32::from_be_bytes(
            *SliceReader::new(&self.data[len_minus_crc..])
                .read_array_ref::<4>()
                .unwrap(),
        );
        let crc_valid = actual_hash == expected_hash;
        if !crc_valid {
            warn!("Section CRC mismatch for PID: {:x}", pid);
        }
        self.data.truncate(len_minus_crc);

        let table_id = self.header.table_id();
        let ext = self.syntax.as_ref().map_or(0, |s| s.table_id_extension());
        let body = self.data;

        /* Process table based on known type */
        let data = if pid == PID_PAT && table_id == TID_PAT {
            let mut reader = SliceReader::new(&body);
            let entries = decode_pat(&mut reader)?;
            parser.nit_pid = PID_NIT_DEFAULT;
            parser.known_pmt_pids.clear();
            for entry in &entries {
                if entry.program_num() == 0 {
                    parser.nit_pid = entry.program_map_pid();
                } else {
                    parser.known_pmt_pids.insert(entry.program_map_pid());
                }
            }
            TableData::Pat(entries)
        } else if pid == parser.nit_pid && matches!(table_id, TID_NIT_ACTUAL | TID_NIT_OTHER) {
            let mut reader = SliceReader::new(&body);
            TableData::Nit(si::decode_nit(ext, &mut reader)?)
        } else if pid == PID_SDT && matches!(table_id, TID_SDT_ACTUAL | TID_SDT_OTHER) {
            let mut reader = SliceReader::new(&body);
            TableData::Sdt(si::decode_sdt(ext, &mut reader)?)
        } else if pid == PID_EIT && (TID_EIT_FIRST..=TID_EIT_LAST).contains(&table_id) {
            let mut reader = SliceReader::new(&body);
            TableData::Eit(si::decode_eit(ext, &mut reader)?)
        } else if parser.known_pmt_pids.contains(&pid) && table_id == TID_PMT {
            let mut reader = SliceReader::new(&body);
            TableData::Pmt(decode_pmt(&mut reader)?)
        } else {
            /* Unhandled table type; keep data raw */
            TableData::Raw(body)
        };

        Ok(Payload::Section(SiSection {
            header: self.header,
            syntax: self.syntax,
            crc_valid,
            data,
        }))
    }
}

impl DvbSiParser {
    pub(crate) fn start_section<'a>(
        &mut self,
        pid: u16,
        reader: &mut SliceReader<'a>,
    ) -> Result<Payload<'a>> {
        if reader.remaining_len() < 1 {
            warn!("Short read of section pointer field");
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        let pointer_field = reader.read_u8()?;
        if reader.remaining_len() < pointer_field as usize {
            warn!("Short read of section pointer filler");
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        reader.skip(pointer_field as usize)?;

        if reader.remaining_len() < 3 {
            warn!("Short read of section header");
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        let mut hasher = CRC.digest();
        let header_bytes = reader.read_array_ref::<3>()?;
        hasher.update(header_bytes);
        let header = SectionHeader::from_bytes(*header_bytes);
        let section_length = header.section_length() as usize;
        if section_length > MAX_SECTION_LENGTH {
            warn!("Oversized section length {}", section_length);
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }

        let table_id = header.table_id();
        if !expected_on_pid(pid, table_id, self.nit_pid, &self.known_pmt_pids) {
            warn!("Unexpected table 0x{:02x} on PID: {:x}", table_id, pid);
            return Err(reader.make_error(ErrorDetails::UnexpectedTableId { pid, table_id }));
        }

        if section_length == 0 {
            return SectionBuilder::new(0, header, None, hasher).finish(pid, self);
        }
        if section_length < 9 {
            /* Must have length to read the syntax fields and at least the CRC32 */
            warn!("Insufficient table length");
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }

        if reader.remaining_len() < 5 {
            warn!("Short read of section syntax");
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        let syntax_bytes = reader.read_array_ref::<5>()?;
        hasher.update(syntax_bytes);
        let syntax = SectionSyntax::from_bytes(*syntax_bytes);

        let table_length = section_length - 5;
        self.start_payload_unit(
            SectionBuilder::new(table_length, header, Some(syntax), hasher),
            table_length,
            pid,
            reader,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_section(table_id: u8, ext: u16, body: &[u8]) -> Vec<u8> {
        let section_length = (5 + body.len() + 4) as u16;
        let mut out = vec![
            0x00, // pointer field
            table_id,
            0xb0 | (section_length >> 8) as u8,
            section_length as u8,
            (ext >> 8) as u8,
            ext as u8,
            0xc1, // version 0, current
            0x00,
            0x00,
        ];
        out.extend_from_slice(body);
        let crc = CRC.checksum(&out[1..]);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    fn pat_body(entries: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        for &(program, pid) in entries {
            body.extend_from_slice(&program.to_be_bytes());
            body.extend_from_slice(&(0xe000 | pid).to_be_bytes());
        }
        body
    }

    #[test]
    fn parses_pat_in_order() {
        let bytes = make_section(TID_PAT, 1, &pat_body(&[(0, 16), (268, 2100), (270, 2200)]));
        let section = SiSection::parse(PID_PAT, &bytes).unwrap();
        assert!(section.crc_valid);
        assert_eq!(section.syntax.as_ref().unwrap().table_id_extension(), 1);
        match section.data {
            TableData::Pat(entries) => {
                let pairs: Vec<(u16, u16)> = entries
                    .iter()
                    .map(|e| (e.program_num(), e.program_map_pid()))
                    .collect();
                assert_eq!(pairs, vec![(0, 16), (268, 2100), (270, 2200)]);
            }
            other => panic!("expected PAT, got {:?}", other),
        }
    }

    #[test]
    fn crc_mismatch_is_flagged_not_fatal() {
        let mut bytes = make_section(TID_PAT, 1, &pat_body(&[(268, 2100)]));
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let section = SiSection::parse(PID_PAT, &bytes).unwrap();
        assert!(!section.crc_valid);
        assert!(matches!(section.data, TableData::Pat(ref entries) if entries.len() == 1));
    }

    #[test]
    fn truncated_section_is_rejected() {
        let mut bytes = make_section(TID_PAT, 1, &pat_body(&[(268, 2100)]));
        bytes.truncate(bytes.len() - 3);
        let err = SiSection::parse(PID_PAT, &bytes).unwrap_err();
        assert!(matches!(err.details, ErrorDetails::TruncatedSection));
    }

    #[test]
    fn unexpected_table_id_is_rejected() {
        let bytes = make_section(TID_SDT_ACTUAL, 1, &[]);
        let err = SiSection::parse(PID_PAT, &bytes).unwrap_err();
        assert!(matches!(
            err.details,
            ErrorDetails::UnexpectedTableId {
                pid: 0,
                table_id: TID_SDT_ACTUAL,
            }
        ));
    }

    #[test]
    fn zero_length_section_is_an_empty_record() {
        let bytes = [0x00, TID_PAT, 0xb0, 0x00];
        let section = SiSection::parse(PID_PAT, &bytes).unwrap();
        assert!(section.crc_valid);
        assert!(section.syntax.is_none());
        assert!(matches!(section.data, TableData::Raw(ref raw) if raw.is_empty()));
    }

    #[test]
    fn pointer_field_skips_previous_section_tail() {
        let mut bytes = make_section(TID_PAT, 1, &pat_body(&[(268, 2100)]));
        bytes[0] = 3;
        bytes.splice(1..1, [0xaa, 0xbb, 0xcc]);
        let section = SiSection::parse(PID_PAT, &bytes).unwrap();
        assert!(section.crc_valid);
    }

    #[test]
    fn pmt_decodes_by_table_id() {
        // program info: one raw descriptor; one ES entry with no descriptors
        let mut body = Vec::new();
        body.extend_from_slice(&(0xe000u16 | 0x0abc).to_be_bytes()); // PCR PID
        body.extend_from_slice(&0xf002u16.to_be_bytes()); // program_info_length = 2
        body.extend_from_slice(&[0x85, 0x00]); // user-private descriptor, empty
        body.push(0x1b); // H.264 video
        body.extend_from_slice(&(0xe000u16 | 0x0abd).to_be_bytes());
        body.extend_from_slice(&0xf000u16.to_be_bytes()); // es_info_length = 0
        let bytes = make_section(TID_PMT, 268, &body);
        let section = SiSection::parse(0x0834, &bytes).unwrap();
        match section.data {
            TableData::Pmt(pmt) => {
                assert_eq!(pmt.header.pcr_pid(), 0x0abc);
                assert_eq!(pmt.program_descriptors.len(), 1);
                assert_eq!(pmt.es_infos.len(), 1);
                assert_eq!(pmt.es_infos[0].header.stream_type(), 0x1b);
                assert_eq!(pmt.es_infos[0].header.elementary_pid(), 0x0abd);
            }
            other => panic!("expected PMT, got {:?}", other),
        }
    }
}
