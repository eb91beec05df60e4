//! DVB Service Information table bodies (ETSI EN 300 468): NIT, SDT and EIT.
//!
//! Section framing, CRC validation and table dispatch live in [`crate::psi`]; this module holds
//! the value records the bodies decode into.

pub mod descriptors;
pub mod text;
pub mod time;

use crate::{Result, SliceReader};
use chrono::{DateTime, Duration, Utc};
use descriptors::{ContentEntry, Descriptor, ServiceDescriptor, ShortEventDescriptor};
use log::warn;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};

/// Service types of EN 300 468 table 87.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ServiceType {
    /// MPEG-2 SD digital television.
    DigitalTelevision = 0x01,
    /// Digital radio sound service.
    DigitalRadioSound = 0x02,
    /// Teletext service.
    Teletext = 0x03,
    /// NVOD reference service.
    NvodReference = 0x04,
    /// NVOD time-shifted service.
    NvodTimeShifted = 0x05,
    /// Mosaic service.
    Mosaic = 0x06,
    /// FM radio service.
    FmRadio = 0x07,
    /// DVB SRM service.
    DvbSrm = 0x08,
    /// Advanced codec digital radio sound service.
    AdvancedCodecDigitalRadioSound = 0x0a,
    /// H.264/AVC mosaic service.
    H264AvcMosaic = 0x0b,
    /// Data broadcast service.
    DataBroadcast = 0x0c,
    /// RCS map service.
    RcsMap = 0x0e,
    /// RCS FLS service.
    RcsFls = 0x0f,
    /// DVB MHP service.
    DvbMhp = 0x10,
    /// MPEG-2 HD digital television.
    Mpeg2HdDigitalTelevision = 0x11,
    /// H.264/AVC SD digital television.
    H264AvcSdDigitalTelevision = 0x16,
    /// H.264/AVC SD NVOD time-shifted service.
    H264AvcSdNvodTimeShifted = 0x17,
    /// H.264/AVC SD NVOD reference service.
    H264AvcSdNvodReference = 0x18,
    /// H.264/AVC HD digital television.
    H264AvcHdDigitalTelevision = 0x19,
    /// H.264/AVC HD NVOD time-shifted service.
    H264AvcHdNvodTimeShifted = 0x1a,
    /// H.264/AVC HD NVOD reference service.
    H264AvcHdNvodReference = 0x1b,
    /// HEVC digital television.
    HevcDigitalTelevision = 0x1f,
}

impl ServiceType {
    /// Looks up the service type for a raw type byte. User-defined and reserved values yield
    /// [`None`].
    pub fn from_id(id: u8) -> Option<ServiceType> {
        Self::from_u8(id)
    }
}

/// Running status of a service or event (EN 300 468 table 6).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum RunningStatus {
    /// Undefined.
    Undefined = 0,
    /// Not running.
    NotRunning = 1,
    /// Starts in a few seconds.
    StartsInAFewSeconds = 2,
    /// Pausing.
    Pausing = 3,
    /// Running.
    Running = 4,
    /// Service off-air.
    ServiceOffAir = 5,
}

impl RunningStatus {
    /// Looks up the running status for a raw 3-bit field. Reserved values yield [`None`].
    pub fn from_id(id: u8) -> Option<RunningStatus> {
        Self::from_u8(id)
    }
}

/// Network Information Table body.
#[derive(Debug)]
pub struct Nit {
    /// Network this table describes (table ID extension).
    pub network_id: u16,
    /// Network name from the 0x40 descriptor, empty when absent.
    pub network_name: String,
    /// service_id to raw service type byte, accumulated from the 0x41 service list descriptors
    /// of every transport stream.
    pub service_types: HashMap<u16, u8>,
    /// Transport streams carried on the network.
    pub transports: Vec<NitTransportStream>,
}

impl Nit {
    /// Typed lookup into the accumulated service list.
    pub fn service_type(&self, service_id: u16) -> Option<ServiceType> {
        self.service_types
            .get(&service_id)
            .and_then(|&id| ServiceType::from_id(id))
    }
}

/// One transport stream record of a NIT.
#[derive(Debug)]
pub struct NitTransportStream {
    /// Transport stream the record describes.
    pub transport_stream_id: u16,
    /// Network the transport stream originates from.
    pub original_network_id: u16,
    /// Descriptors of the transport stream loop.
    pub descriptors: Vec<Descriptor>,
}

/// Service Description Table body.
#[derive(Debug)]
pub struct Sdt {
    /// Transport stream the table describes (table ID extension).
    pub transport_stream_id: u16,
    /// Network the transport stream originates from.
    pub original_network_id: u16,
    /// Described services, in table order.
    pub services: Vec<SdtService>,
}

/// One service record of an SDT.
#[derive(Debug)]
pub struct SdtService {
    /// Service this record describes (same value as the PAT program number).
    pub service_id: u16,
    /// EIT schedule information is present for this service.
    pub eit_schedule: bool,
    /// EIT present/following information is present for this service.
    pub eit_present_following: bool,
    /// Raw 3-bit running status.
    pub running_status: u8,
    /// One or more streams of the service are CA-controlled.
    pub free_ca: bool,
    /// Descriptors of the service loop.
    pub descriptors: SmallVec<[Descriptor; 4]>,
}

impl SdtService {
    /// The 0x48 service descriptor, when present.
    pub fn service_info(&self) -> Option<&ServiceDescriptor> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::Service(s) => Some(s),
            _ => None,
        })
    }

    /// Raw service type byte from the service descriptor.
    pub fn service_type(&self) -> Option<u8> {
        self.service_info().map(|s| s.service_type)
    }

    /// Service provider name from the service descriptor.
    pub fn provider_name(&self) -> Option<&str> {
        self.service_info().map(|s| s.provider_name.as_str())
    }

    /// Service name from the service descriptor.
    pub fn service_name(&self) -> Option<&str> {
        self.service_info().map(|s| s.service_name.as_str())
    }

    /// Typed running status.
    pub fn status(&self) -> Option<RunningStatus> {
        RunningStatus::from_id(self.running_status)
    }
}

/// Event Information Table body.
#[derive(Debug)]
pub struct Eit {
    /// Service the events belong to (table ID extension).
    pub service_id: u16,
    /// Transport stream carrying the service.
    pub transport_stream_id: u16,
    /// Network the transport stream originates from.
    pub original_network_id: u16,
    /// Last section number of this segment.
    pub segment_last_section_number: u8,
    /// Last table ID used for this service.
    pub last_table_id: u8,
    /// Events carried by this section, in table order.
    pub events: Vec<EitEvent>,
}

/// One program guide event.
///
/// Events are only emitted when a short event descriptor was present; extended event text is
/// attached when available.
#[derive(Debug)]
pub struct EitEvent {
    /// Event identifier, unique within the service.
    pub event_id: u16,
    /// Service the event belongs to.
    pub service_id: u16,
    /// Event start, UTC.
    pub start_time: DateTime<Utc>,
    /// Event duration in seconds.
    pub duration: u32,
    /// Raw 3-bit running status.
    pub running_status: u8,
    /// The event is CA-controlled.
    pub free_ca: bool,
    /// ISO 639-2 language of the short event descriptor.
    pub language: String,
    /// Event title.
    pub name: String,
    /// Short description.
    pub text: String,
    /// Long description, concatenated from the extended event descriptors in ascending
    /// descriptor_number order.
    pub extended_text: String,
    /// Genre nibbles from the content descriptor.
    pub content: SmallVec<[ContentEntry; 2]>,
}

impl EitEvent {
    /// Event end, start plus duration.
    pub fn finish_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::seconds(i64::from(self.duration))
    }

    /// Typed running status.
    pub fn status(&self) -> Option<RunningStatus> {
        RunningStatus::from_id(self.running_status)
    }
}

/// Opens a sub-reader over a length-prefixed loop, clipping a length that overruns the enclosing
/// reader instead of failing.
fn loop_reader<'a>(
    reader: &mut SliceReader<'a>,
    length: usize,
    what: &str,
) -> Result<SliceReader<'a>> {
    if length > reader.remaining_len() {
        warn!(
            "{} length {} overruns section ({} bytes left)",
            what,
            length,
            reader.remaining_len()
        );
        let remaining = reader.remaining_len();
        reader.new_sub_reader(remaining)
    } else {
        reader.new_sub_reader(length)
    }
}

pub(crate) fn decode_nit(network_id: u16, reader: &mut SliceReader) -> Result<Nit> {
    let mut nit = Nit {
        network_id,
        network_name: String::new(),
        service_types: HashMap::new(),
        transports: Vec::new(),
    };

    let network_descriptors_length = (reader.read_be_u16()? & 0x0fff) as usize;
    let mut nd_reader = loop_reader(reader, network_descriptors_length, "Network descriptor loop")?;
    for descriptor in Descriptor::read_loop(&mut nd_reader)? {
        if let Descriptor::NetworkName(name) = descriptor {
            nit.network_name = name.name;
        }
    }

    let transport_loop_length = (reader.read_be_u16()? & 0x0fff) as usize;
    let mut ts_reader = loop_reader(reader, transport_loop_length, "Transport stream loop")?;
    while ts_reader.remaining_len() >= 6 {
        let transport_stream_id = ts_reader.read_be_u16()?;
        let original_network_id = ts_reader.read_be_u16()?;
        let descriptors_length = (ts_reader.read_be_u16()? & 0x0fff) as usize;
        let mut d_reader = loop_reader(&mut ts_reader, descriptors_length, "Transport descriptor loop")?;
        let descriptors = Descriptor::read_loop(&mut d_reader)?;
        for descriptor in &descriptors {
            if let Descriptor::ServiceList(list) = descriptor {
                for entry in &list.services {
                    nit.service_types.insert(entry.service_id, entry.service_type);
                }
            }
        }
        nit.transports.push(NitTransportStream {
            transport_stream_id,
            original_network_id,
            descriptors,
        });
    }
    Ok(nit)
}

pub(crate) fn decode_sdt(transport_stream_id: u16, reader: &mut SliceReader) -> Result<Sdt> {
    let mut sdt = Sdt {
        transport_stream_id,
        original_network_id: reader.read_be_u16()?,
        services: Vec::new(),
    };
    reader.skip(1)?; // reserved_future_use

    while reader.remaining_len() >= 5 {
        let service_id = reader.read_be_u16()?;
        let flags = reader.read_u8()?;
        let status_and_length = reader.read_be_u16()?;
        let descriptors_length = (status_and_length & 0x0fff) as usize;
        let mut d_reader = loop_reader(reader, descriptors_length, "Service descriptor loop")?;
        sdt.services.push(SdtService {
            service_id,
            eit_schedule: flags & 0x02 != 0,
            eit_present_following: flags & 0x01 != 0,
            running_status: (status_and_length >> 13) as u8,
            free_ca: status_and_length & 0x1000 != 0,
            descriptors: SmallVec::from_vec(Descriptor::read_loop(&mut d_reader)?),
        });
    }
    Ok(sdt)
}

pub(crate) fn decode_eit(service_id: u16, reader: &mut SliceReader) -> Result<Eit> {
    let mut eit = Eit {
        service_id,
        transport_stream_id: reader.read_be_u16()?,
        original_network_id: reader.read_be_u16()?,
        segment_last_section_number: reader.read_u8()?,
        last_table_id: reader.read_u8()?,
        events: Vec::new(),
    };

    while reader.remaining_len() >= 12 {
        let event_id = reader.read_be_u16()?;
        let start_time = time::decode_start_time(reader.read_array_ref::<5>()?);
        let duration = time::decode_duration(reader.read_array_ref::<3>()?);
        let status_and_length = reader.read_be_u16()?;
        let descriptors_length = (status_and_length & 0x0fff) as usize;
        let mut d_reader = loop_reader(reader, descriptors_length, "Event descriptor loop")?;

        let mut short_event: Option<ShortEventDescriptor> = None;
        let mut extended_texts: BTreeMap<u8, String> = BTreeMap::new();
        let mut content = SmallVec::new();
        for descriptor in Descriptor::read_loop(&mut d_reader)? {
            match descriptor {
                Descriptor::ShortEvent(se) => {
                    short_event.get_or_insert(se);
                }
                Descriptor::ExtendedEvent(ee) => {
                    extended_texts.insert(ee.descriptor_number, ee.text);
                }
                Descriptor::Content(c) => content = c.entries,
                _ => {}
            }
        }

        let start_time = match start_time {
            Some(start_time) => start_time,
            None => {
                warn!("Skipping event {} with undecodable start time", event_id);
                continue;
            }
        };
        /* Events without a short event descriptor are not emitted */
        let short_event = match short_event {
            Some(short_event) => short_event,
            None => continue,
        };

        eit.events.push(EitEvent {
            event_id,
            service_id,
            start_time,
            duration: duration.unwrap_or(0),
            running_status: (status_and_length >> 13) as u8,
            free_ca: status_and_length & 0x1000 != 0,
            language: short_event.language,
            name: short_event.event_name,
            text: short_event.text,
            extended_text: extended_texts.into_values().collect(),
            content,
        });
    }
    Ok(eit)
}
