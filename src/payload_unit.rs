use super::{DvbSiParser, Payload, Result, SectionBuilder, SliceReader};
use log::debug;

/// Accumulates one section's bytes across packet boundaries until the declared length is reached.
pub(crate) struct PayloadUnitBuilder {
    section: SectionBuilder,
    remaining: usize,
}

impl PayloadUnitBuilder {
    pub fn new(section: SectionBuilder, length: usize) -> Self {
        Self {
            section,
            remaining: length,
        }
    }

    /// Appends as much of `reader` as the unit still needs. Returns true once the unit is
    /// complete; any bytes left in `reader` afterwards are stuffing.
    pub fn append(&mut self, reader: &mut SliceReader) -> Result<bool> {
        if reader.remaining_len() <= self.remaining {
            self.remaining -= reader.remaining_len();
            self.section.extend_from_slice(reader.read_to_end()?);
            Ok(self.remaining == 0)
        } else {
            self.section.extend_from_slice(reader.read(self.remaining)?);
            self.remaining = 0;
            Ok(true)
        }
    }

    pub fn finish<'a>(self, pid: u16, parser: &mut DvbSiParser) -> Result<Payload<'a>> {
        assert_eq!(self.remaining, 0);
        self.section.finish(pid, parser)
    }

    pub fn pending<'a>(&self) -> Result<Payload<'a>> {
        Ok(Payload::SectionPending)
    }
}

impl DvbSiParser {
    pub(crate) fn start_payload_unit<'a>(
        &mut self,
        section: SectionBuilder,
        length: usize,
        pid: u16,
        reader: &mut SliceReader<'a>,
    ) -> Result<Payload<'a>> {
        let mut builder = PayloadUnitBuilder::new(section, length);
        if builder.append(reader)? {
            builder.finish(pid, self)
        } else {
            let pending = builder.pending();
            self.pending_sections.insert(pid, builder);
            pending
        }
    }

    pub(crate) fn continue_payload_unit<'a>(
        &mut self,
        pid: u16,
        reader: &mut SliceReader<'a>,
    ) -> Result<Payload<'a>> {
        match self.pending_sections.get_mut(&pid) {
            Some(state) => {
                if state.append(reader)? {
                    self.pending_sections
                        .remove(&pid)
                        .unwrap()
                        .finish(pid, self)
                } else {
                    state.pending()
                }
            }
            None => {
                /* Normal when decoding starts mid-section; bytes before the first unit start
                 * on a PID cannot be framed and are discarded. */
                debug!("Discarding payload of unknown continuation PID: {:x}", pid);
                Ok(Payload::Unknown)
            }
        }
    }
}
