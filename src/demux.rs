//! Batch helpers over a raw capture: per-PID payload reassembly and one-shot table extraction.
//!
//! These are the offline twins of the streaming path in [`crate::DvbSiParser`]: they frame the
//! whole buffer, group payload bytes by the payload unit start indicator, and decode sections
//! with [`SiSection::parse`]. Bytes on a PID before its first unit start cannot be framed and are
//! discarded.

use crate::framer::frames;
use crate::psi::{PatEntry, SiSection};
use crate::si::{Sdt, SdtService};
use crate::{Error, ErrorDetails, Packet, Payload, Result};
use std::collections::BTreeMap;

/// Collects the packets of the first logical section on `pid`.
///
/// Packets before the first unit start are discarded; the scan stops when a second unit start
/// would begin the next section.
pub fn packets_for_pid(buf: &[u8], pid: u16) -> Vec<Packet> {
    let mut out = Vec::new();
    let mut started = false;
    for frame in frames(buf) {
        let packet = match Packet::parse_raw(frame) {
            Ok(packet) => packet,
            Err(_) => continue,
        };
        if packet.header.pid() != pid {
            continue;
        }
        if packet.header.pusi() {
            if started {
                break;
            }
            started = true;
        }
        if started {
            out.push(packet);
        }
    }
    out
}

/// Concatenates the payload bytes of every logical section on `pid`, keyed by section index in
/// arrival order.
pub fn payloads_by_pid(buf: &[u8], pid: u16) -> BTreeMap<usize, Vec<u8>> {
    let mut out: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    let mut section_index: Option<usize> = None;
    for frame in frames(buf) {
        let packet = match Packet::parse_raw(frame) {
            Ok(packet) => packet,
            Err(_) => continue,
        };
        if packet.header.pid() != pid {
            continue;
        }
        if packet.header.pusi() {
            section_index = Some(section_index.map_or(0, |index| index + 1));
        }
        let index = match section_index {
            Some(index) => index,
            None => continue,
        };
        if let Some(Payload::Raw(mut reader)) = packet.payload {
            if let Ok(bytes) = reader.read_to_end() {
                out.entry(index).or_default().extend_from_slice(bytes);
            }
        }
    }
    out
}

/// Decodes the first section found on `pid`.
pub fn extract_section(buf: &[u8], pid: u16) -> Result<SiSection> {
    match payloads_by_pid(buf, pid).get(&0) {
        Some(bytes) => SiSection::parse(pid, bytes),
        None => Err(Error::new(0, ErrorDetails::SectionNotFound(pid))),
    }
}

/// Joins SDT service records against PAT program associations on the program number, yielding
/// each service together with its PMT PID.
///
/// The join is SDT-driven and preserves SDT order; a service without a matching PAT entry is
/// omitted.
pub fn services_to_pmt_map<'a>(sdt: &'a Sdt, pat: &[PatEntry]) -> Vec<(&'a SdtService, u16)> {
    sdt.services
        .iter()
        .filter_map(|service| {
            pat.iter()
                .find(|entry| entry.program_num() == service.service_id)
                .map(|entry| (service, entry.program_map_pid()))
        })
        .collect()
}
