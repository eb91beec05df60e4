//! DVB descriptor decoding.
//!
//! Descriptors are tag-length-value elements embedded in table bodies. Recognized tags decode
//! into typed variants; everything else (including the recognized-but-skipped component, parental
//! rating and PDC descriptors) is carried raw.

use super::text;
use crate::{Result, SliceReader};
use enum_dispatch::enum_dispatch;
use log::warn;
use smallvec::SmallVec;

/// Network name descriptor tag (NIT).
pub const TAG_NETWORK_NAME: u8 = 0x40;
/// Service list descriptor tag (NIT transport stream loop).
pub const TAG_SERVICE_LIST: u8 = 0x41;
/// Service descriptor tag (SDT).
pub const TAG_SERVICE: u8 = 0x48;
/// Short event descriptor tag (EIT).
pub const TAG_SHORT_EVENT: u8 = 0x4d;
/// Extended event descriptor tag (EIT).
pub const TAG_EXTENDED_EVENT: u8 = 0x4e;
/// Component descriptor tag (recognized, kept raw).
pub const TAG_COMPONENT: u8 = 0x50;
/// Content (genre) descriptor tag (EIT).
pub const TAG_CONTENT: u8 = 0x54;
/// Parental rating descriptor tag (recognized, kept raw).
pub const TAG_PARENTAL_RATING: u8 = 0x55;
/// Subtitling descriptor tag.
pub const TAG_SUBTITLING: u8 = 0x59;
/// PDC descriptor tag (recognized, kept raw).
pub const TAG_PDC: u8 = 0x69;

/// Common behavior of decoded descriptors.
#[enum_dispatch]
pub trait DescriptorPayload {
    /// Tag byte identifying this descriptor on the wire.
    fn tag(&self) -> u8;
}

/// Network name as DVB text (tag 0x40).
#[derive(Debug)]
pub struct NetworkNameDescriptor {
    pub name: String,
}

impl DescriptorPayload for NetworkNameDescriptor {
    fn tag(&self) -> u8 {
        TAG_NETWORK_NAME
    }
}

/// One (service_id, service_type) pair of a service list descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ServiceListEntry {
    pub service_id: u16,
    pub service_type: u8,
}

/// Services carried on a transport stream (tag 0x41).
#[derive(Debug)]
pub struct ServiceListDescriptor {
    pub services: SmallVec<[ServiceListEntry; 8]>,
}

impl DescriptorPayload for ServiceListDescriptor {
    fn tag(&self) -> u8 {
        TAG_SERVICE_LIST
    }
}

/// Service type, provider and name (tag 0x48).
#[derive(Debug)]
pub struct ServiceDescriptor {
    pub service_type: u8,
    pub provider_name: String,
    pub service_name: String,
}

impl DescriptorPayload for ServiceDescriptor {
    fn tag(&self) -> u8 {
        TAG_SERVICE
    }
}

/// Event title and subtitle in one language (tag 0x4D).
#[derive(Debug)]
pub struct ShortEventDescriptor {
    pub language: String,
    pub event_name: String,
    pub text: String,
}

impl DescriptorPayload for ShortEventDescriptor {
    fn tag(&self) -> u8 {
        TAG_SHORT_EVENT
    }
}

/// One fragment of an event's long description (tag 0x4E).
///
/// Fragments are numbered 0..=15 and concatenated in ascending order when the event record is
/// assembled.
#[derive(Debug)]
pub struct ExtendedEventDescriptor {
    pub descriptor_number: u8,
    pub last_descriptor_number: u8,
    pub language: String,
    pub text: String,
}

impl DescriptorPayload for ExtendedEventDescriptor {
    fn tag(&self) -> u8 {
        TAG_EXTENDED_EVENT
    }
}

/// One genre classification pair of a content descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ContentEntry {
    pub content_nibble_level_1: u8,
    pub content_nibble_level_2: u8,
    pub user_byte: u8,
}

/// Event genre nibbles (tag 0x54).
#[derive(Debug)]
pub struct ContentDescriptor {
    pub entries: SmallVec<[ContentEntry; 2]>,
}

impl DescriptorPayload for ContentDescriptor {
    fn tag(&self) -> u8 {
        TAG_CONTENT
    }
}

/// One subtitle stream entry of a subtitling descriptor.
#[derive(Debug)]
pub struct SubtitlingEntry {
    pub language: String,
    pub subtitling_type: u8,
    pub composition_page_id: u16,
    pub ancillary_page_id: u16,
}

/// DVB subtitle streams (tag 0x59).
#[derive(Debug)]
pub struct SubtitlingDescriptor {
    pub entries: SmallVec<[SubtitlingEntry; 2]>,
}

impl DescriptorPayload for SubtitlingDescriptor {
    fn tag(&self) -> u8 {
        TAG_SUBTITLING
    }
}

/// Unhandled descriptor; body bytes kept raw.
#[derive(Debug)]
pub struct RawDescriptor {
    pub tag: u8,
    pub data: SmallVec<[u8; 8]>,
}

impl DescriptorPayload for RawDescriptor {
    fn tag(&self) -> u8 {
        self.tag
    }
}

/// A decoded descriptor, dispatched on its tag.
#[enum_dispatch(DescriptorPayload)]
#[derive(Debug)]
pub enum Descriptor {
    NetworkName(NetworkNameDescriptor),
    ServiceList(ServiceListDescriptor),
    Service(ServiceDescriptor),
    ShortEvent(ShortEventDescriptor),
    ExtendedEvent(ExtendedEventDescriptor),
    Content(ContentDescriptor),
    Subtitling(SubtitlingDescriptor),
    Other(RawDescriptor),
}

impl Descriptor {
    /// Reads one descriptor from a loop reader.
    ///
    /// A descriptor whose declared length extends past the enclosing loop is clipped to the loop
    /// boundary; a descriptor whose body does not parse is kept raw. Both are local conditions
    /// that never abort the loop.
    pub fn read(reader: &mut SliceReader) -> Result<Descriptor> {
        let tag = reader.read_u8()?;
        let mut length = reader.read_u8()? as usize;
        if length > reader.remaining_len() {
            warn!(
                "Descriptor 0x{:02x} length {} overruns its loop ({} bytes left)",
                tag,
                length,
                reader.remaining_len()
            );
            length = reader.remaining_len();
        }
        let body = reader.read(length)?;
        Ok(match Self::parse_body(tag, body) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Malformed descriptor 0x{:02x}: {:?}", tag, e);
                Descriptor::Other(RawDescriptor {
                    tag,
                    data: SmallVec::from_slice(body),
                })
            }
        })
    }

    /// Reads descriptors until the loop reader is exhausted.
    pub fn read_loop(reader: &mut SliceReader) -> Result<Vec<Descriptor>> {
        let mut out = Vec::new();
        while reader.remaining_len() >= 2 {
            out.push(Self::read(reader)?);
        }
        /* A trailing stray byte cannot hold a tag-length pair */
        reader.read_to_end()?;
        Ok(out)
    }

    fn parse_body(tag: u8, body: &[u8]) -> Result<Descriptor> {
        let mut d = SliceReader::new(body);
        Ok(match tag {
            TAG_NETWORK_NAME => Descriptor::NetworkName(NetworkNameDescriptor {
                name: text::decode(d.read_to_end()?),
            }),
            TAG_SERVICE_LIST => {
                let mut services = SmallVec::new();
                while d.remaining_len() >= 3 {
                    services.push(ServiceListEntry {
                        service_id: d.read_be_u16()?,
                        service_type: d.read_u8()?,
                    });
                }
                Descriptor::ServiceList(ServiceListDescriptor { services })
            }
            TAG_SERVICE => Descriptor::Service(ServiceDescriptor {
                service_type: d.read_u8()?,
                provider_name: read_text(&mut d)?,
                service_name: read_text(&mut d)?,
            }),
            TAG_SHORT_EVENT => Descriptor::ShortEvent(ShortEventDescriptor {
                language: text::language_code(d.read_array_ref::<3>()?),
                event_name: read_text(&mut d)?,
                text: read_text(&mut d)?,
            }),
            TAG_EXTENDED_EVENT => {
                let numbers = d.read_u8()?;
                let language = text::language_code(d.read_array_ref::<3>()?);
                let items_length = d.read_u8()? as usize;
                /* Itemized fields are not retained, only the free text */
                d.skip(items_length)?;
                Descriptor::ExtendedEvent(ExtendedEventDescriptor {
                    descriptor_number: numbers >> 4,
                    last_descriptor_number: numbers & 0x0f,
                    language,
                    text: read_text(&mut d)?,
                })
            }
            TAG_CONTENT => {
                let mut entries = SmallVec::new();
                while d.remaining_len() >= 2 {
                    let nibbles = d.read_u8()?;
                    entries.push(ContentEntry {
                        content_nibble_level_1: nibbles >> 4,
                        content_nibble_level_2: nibbles & 0x0f,
                        user_byte: d.read_u8()?,
                    });
                }
                Descriptor::Content(ContentDescriptor { entries })
            }
            TAG_SUBTITLING => {
                let mut entries = SmallVec::new();
                while d.remaining_len() >= 8 {
                    entries.push(SubtitlingEntry {
                        language: text::language_code(d.read_array_ref::<3>()?),
                        subtitling_type: d.read_u8()?,
                        composition_page_id: d.read_be_u16()?,
                        ancillary_page_id: d.read_be_u16()?,
                    });
                }
                Descriptor::Subtitling(SubtitlingDescriptor { entries })
            }
            _ => Descriptor::Other(RawDescriptor {
                tag,
                data: SmallVec::from_slice(body),
            }),
        })
    }
}

fn read_text(reader: &mut SliceReader) -> Result<String> {
    let length = reader.read_u8()? as usize;
    Ok(text::decode(reader.read(length)?))
}
