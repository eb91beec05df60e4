//! End-to-end decode of a synthetic terrestrial multiplex: garbage prefix, PAT, NIT, SDT
//! spanning two packets, and an EIT event with accented text.

use crc::{Crc, CRC_32_MPEG_2};
use dvbsi_io::psi::{SiSection, TableData};
use dvbsi_io::si::ServiceType;
use dvbsi_io::{demux, DvbSiParser, Payload, PACKET_SIZE, PID_EIT, PID_PAT, PID_SDT, SYNC_BYTE};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);
const PID_NIT: u16 = 0x0010;

fn section(table_id: u8, ext: u16, body: &[u8]) -> Vec<u8> {
    let section_length = (5 + body.len() + 4) as u16;
    let mut out = vec![
        table_id,
        0xf0 | (section_length >> 8) as u8,
        section_length as u8,
        (ext >> 8) as u8,
        ext as u8,
        0xc1, // version 0, current
        0x00,
        0x00,
    ];
    out.extend_from_slice(body);
    let crc = CRC32.checksum(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// Wraps a section in as many 188-byte packets as it needs, PUSI set on the first.
fn packetize(pid: u16, section: &[u8]) -> Vec<u8> {
    let mut payload = vec![0x00]; // pointer field
    payload.extend_from_slice(section);
    let mut out = Vec::new();
    for (i, chunk) in payload.chunks(PACKET_SIZE - 4).enumerate() {
        let mut packet = vec![
            SYNC_BYTE,
            ((i == 0) as u8) << 6 | (pid >> 8) as u8,
            pid as u8,
            0x10 | (i as u8 & 0x0f),
        ];
        packet.extend_from_slice(chunk);
        packet.resize(PACKET_SIZE, 0xff);
        out.extend_from_slice(&packet);
    }
    out
}

fn descriptor(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag, body.len() as u8];
    out.extend_from_slice(body);
    out
}

fn text_field(s: &str) -> Vec<u8> {
    let mut out = vec![s.len() as u8];
    out.extend_from_slice(s.as_bytes());
    out
}

const PROGRAMS: &[(u16, u16)] = &[
    (0, 16),
    (268, 2100),
    (270, 2200),
    (286, 2900),
    (16651, 7010),
    (16652, 7020),
];

const SERVICES: &[(u16, u8, &str, &str)] = &[
    (268, 0x1f, "CESKA TELEVIZE", "CT 1 HD T2"),
    (270, 0x1f, "CESKA TELEVIZE", "CT 2 HD T2"),
    (286, 0x01, "CESKA TELEVIZE", "CT 1 JZC HD T2"),
    (16651, 0x02, "CESKY ROZHLAS", "CRo RADIOZURNAL T2"),
    (16652, 0x02, "CESKY ROZHLAS", "CRo DVOJKA T2"),
    (16653, 0x02, "CESKY ROZHLAS", "CRo VLTAVA T2"),
];

fn pat_section() -> Vec<u8> {
    let mut body = Vec::new();
    for &(program, pid) in PROGRAMS {
        body.extend_from_slice(&program.to_be_bytes());
        body.extend_from_slice(&(0xe000 | pid).to_be_bytes());
    }
    section(0x00, 1, &body)
}

fn nit_section() -> Vec<u8> {
    let name = descriptor(0x40, b"CT, MUX 21");
    let mut list = Vec::new();
    for &(service_id, service_type, _, _) in SERVICES {
        list.extend_from_slice(&service_id.to_be_bytes());
        list.push(service_type);
    }
    let list = descriptor(0x41, &list);

    let mut body = Vec::new();
    body.extend_from_slice(&(0xf000u16 | name.len() as u16).to_be_bytes());
    body.extend_from_slice(&name);
    body.extend_from_slice(&(0xf000u16 | (6 + list.len() as u16)).to_be_bytes());
    body.extend_from_slice(&0x0209u16.to_be_bytes());
    body.extend_from_slice(&0x20fau16.to_be_bytes());
    body.extend_from_slice(&(0xf000u16 | list.len() as u16).to_be_bytes());
    body.extend_from_slice(&list);
    section(0x40, 0x3085, &body)
}

fn sdt_section() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x20fau16.to_be_bytes()); // original_network_id
    body.push(0xff);
    for &(service_id, service_type, provider, name) in SERVICES {
        let mut sd = vec![service_type];
        sd.extend_from_slice(&text_field(provider));
        sd.extend_from_slice(&text_field(name));
        let sd = descriptor(0x48, &sd);
        body.extend_from_slice(&service_id.to_be_bytes());
        body.push(0xfd); // EIT present/following only
        body.extend_from_slice(&(0x8000u16 | sd.len() as u16).to_be_bytes());
        body.extend_from_slice(&sd);
    }
    section(0x42, 0x0209, &body)
}

fn eit_section() -> Vec<u8> {
    let mut short_event = Vec::new();
    short_event.extend_from_slice(b"ces");
    short_event.extend_from_slice(&[7, b'Z', b'p', b'r', 0xc2, b'a', b'v', b'y']);
    short_event.extend_from_slice(&text_field("hlavni zpravodajska relace"));
    let short_event = descriptor(0x4d, &short_event);

    let extended = |number: u8, text: &str| {
        let mut body = vec![number << 4 | 0x01];
        body.extend_from_slice(b"ces");
        body.push(0); // no items
        body.extend_from_slice(&text_field(text));
        descriptor(0x4e, &body)
    };

    let mut descriptors = Vec::new();
    descriptors.extend_from_slice(&short_event);
    descriptors.extend_from_slice(&extended(0, "moderuje "));
    descriptors.extend_from_slice(&extended(1, "redakce zpravodajstvi"));

    let mut body = Vec::new();
    body.extend_from_slice(&0x0209u16.to_be_bytes());
    body.extend_from_slice(&0x20fau16.to_be_bytes());
    body.push(0x00); // segment_last_section_number
    body.push(0x4e); // last_table_id
    body.extend_from_slice(&0x5678u16.to_be_bytes()); // event_id
    let mjd = dvbsi_io::si::time::date_to_mjd(chrono::NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
    body.extend_from_slice(&mjd.to_be_bytes());
    body.extend_from_slice(&[0x19, 0x00, 0x00]); // 19:00:00 UTC
    body.extend_from_slice(&[0x00, 0x45, 0x00]); // 45 minutes
    body.extend_from_slice(&(0x8000u16 | descriptors.len() as u16).to_be_bytes());
    body.extend_from_slice(&descriptors);
    section(0x4e, 268, &body)
}

fn build_mux() -> Vec<u8> {
    let mut buf = vec![0u8; 100]; // garbage before the first sync byte
    buf.extend(packetize(PID_PAT, &pat_section()));
    buf.extend(packetize(PID_NIT, &nit_section()));
    buf.extend(packetize(PID_SDT, &sdt_section()));
    buf.extend(packetize(PID_EIT, &eit_section()));
    buf
}

fn sections(packets: Vec<dvbsi_io::Packet>) -> Vec<SiSection> {
    packets
        .into_iter()
        .filter_map(|packet| match packet.payload {
            Some(Payload::Section(section)) => Some(section),
            _ => None,
        })
        .collect()
}

#[test]
fn decodes_all_tables_from_noisy_capture() {
    let buf = build_mux();
    let mut parser = DvbSiParser::default();
    let decoded = sections(parser.parse_stream(&buf, None));
    assert_eq!(decoded.len(), 4);
    assert!(decoded.iter().all(|s| s.crc_valid));
    assert!(parser.known_pmt_pids().contains(&2100));
    assert_eq!(parser.nit_pid(), 16);

    match &decoded[0].data {
        TableData::Pat(entries) => {
            let pairs: Vec<(u16, u16)> = entries
                .iter()
                .map(|e| (e.program_num(), e.program_map_pid()))
                .collect();
            assert_eq!(pairs, PROGRAMS.to_vec());
        }
        other => panic!("expected PAT, got {:?}", other),
    }

    match &decoded[1].data {
        TableData::Nit(nit) => {
            assert_eq!(nit.network_id, 0x3085);
            assert_eq!(nit.network_name, "CT, MUX 21");
            assert_eq!(
                nit.service_type(268),
                Some(ServiceType::HevcDigitalTelevision)
            );
            assert_eq!(nit.service_type(286), Some(ServiceType::DigitalTelevision));
            assert_eq!(
                nit.service_type(16652),
                Some(ServiceType::DigitalRadioSound)
            );
        }
        other => panic!("expected NIT, got {:?}", other),
    }

    match &decoded[2].data {
        TableData::Sdt(sdt) => {
            assert_eq!(sdt.services.len(), SERVICES.len());
            for (service, &(id, service_type, provider, name)) in
                sdt.services.iter().zip(SERVICES)
            {
                assert_eq!(service.service_id, id);
                assert_eq!(service.service_type(), Some(service_type));
                assert_eq!(service.provider_name(), Some(provider));
                assert_eq!(service.service_name(), Some(name));
            }
        }
        other => panic!("expected SDT, got {:?}", other),
    }

    match &decoded[3].data {
        TableData::Eit(eit) => {
            assert_eq!(eit.service_id, 268);
            assert_eq!(eit.events.len(), 1);
            let event = &eit.events[0];
            assert_eq!(event.event_id, 0x5678);
            assert_eq!(event.language, "ces");
            assert_eq!(event.name, "Zprávy");
            assert_eq!(event.text, "hlavni zpravodajska relace");
            assert_eq!(event.extended_text, "moderuje redakce zpravodajstvi");
            assert_eq!(event.duration, 45 * 60);
            assert_eq!(
                event.finish_time() - event.start_time,
                chrono::Duration::minutes(45)
            );
        }
        other => panic!("expected EIT, got {:?}", other),
    }
}

#[test]
fn sdt_spans_multiple_packets() {
    // the SDT section is longer than one packet payload, so reassembly must kick in
    assert!(sdt_section().len() > PACKET_SIZE - 4);
    let buf = build_mux();
    let payloads = demux::payloads_by_pid(&buf, PID_SDT);
    assert_eq!(payloads.len(), 1);
    assert!(payloads[&0].len() > PACKET_SIZE - 4);
}

#[test]
fn batch_extraction_matches_streaming() {
    let buf = build_mux();
    let section = demux::extract_section(&buf, PID_PAT).unwrap();
    assert!(section.crc_valid);
    match section.data {
        TableData::Pat(entries) => assert_eq!(entries.len(), PROGRAMS.len()),
        other => panic!("expected PAT, got {:?}", other),
    }
}

#[test]
fn sdt_pat_join_is_sdt_driven() {
    let buf = build_mux();
    let pat = match demux::extract_section(&buf, PID_PAT).unwrap().data {
        TableData::Pat(entries) => entries,
        other => panic!("expected PAT, got {:?}", other),
    };
    let sdt = match demux::extract_section(&buf, PID_SDT).unwrap().data {
        TableData::Sdt(sdt) => sdt,
        other => panic!("expected SDT, got {:?}", other),
    };

    let map = demux::services_to_pmt_map(&sdt, &pat);
    // service 16653 has no PAT entry and is omitted from the join
    assert_eq!(map.len(), SERVICES.len() - 1);
    assert_eq!(map[0].0.service_id, 268);
    assert_eq!(map[0].1, 2100);
    assert!(map.iter().all(|(service, _)| service.service_id != 16653));
}

#[test]
fn pid_filter_limits_output() {
    let buf = build_mux();
    let mut parser = DvbSiParser::default();
    let packets = parser.parse_stream(&buf, Some(PID_EIT));
    assert!(!packets.is_empty());
    assert!(packets.iter().all(|p| p.header.pid() == PID_EIT));
}
