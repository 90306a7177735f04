//----------------------------------------------------------------------------------------------
// Module daq
// DAQ list, ODT and ODT entry model, event channels and the per tick sampling and
// stimulation algorithm. Lists below the configured minimum index are predefined
// (read only topology supplied by the integrator), lists at or above it are mutable
// or, with the dyn_daq feature, allocated and freed at runtime.

use bitflags::bitflags;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::fifo::XcpQueues;
use crate::mta::{AddressSpaces, Mta};
use crate::protocol::{ErrorCode, IdentificationMode, TimestampUnit};

//----------------------------------------------------------------------------------------------
// Mode and property flags

bitflags! {
    /// Running mode of a DAQ list
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DaqListMode: u8 {
        /// Marked by START_STOP_DAQ_LIST select, consumed by START_STOP_SYNCH
        const SELECTED  = 0x01;
        /// Direction is stimulation (host to target)
        const STIM      = 0x02;
        /// Insert a timestamp into every DTO packet of this list
        const TIMESTAMP = 0x10;
        /// Transmit without identification field
        const PID_OFF   = 0x20;
        /// List is actively sampled or stimulated
        const RUNNING   = 0x40;
        /// List stays alive across disconnect
        const RESUME    = 0x80;
    }
}

/// Mode bits settable through SET_DAQ_LIST_MODE
pub const DAQ_LIST_MODE_SETTABLE: u8 = 0x32;
/// Mode bits reported by GET_DAQ_LIST_MODE (SELECTED is internal)
pub const DAQ_LIST_MODE_WIRE: u8 = 0xF2;

bitflags! {
    /// Capability properties of a DAQ list, reported by GET_DAQ_LIST_INFO
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DaqListProperties: u8 {
        /// Topology fixed by the integrator, entries are read only
        const PREDEFINED  = 0x01;
        /// Bound to one event channel forever
        const EVENT_FIXED = 0x02;
        /// May run in acquisition direction
        const DAQ         = 0x04;
        /// May run in stimulation direction
        const STIM        = 0x08;
    }
}

bitflags! {
    /// Direction capabilities of an event channel
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventChannelProperties: u8 {
        const DAQ  = 0x04;
        const STIM = 0x08;
    }
}

/// Bit offset sentinel meaning whole byte access
pub const ODT_ENTRY_NO_BIT_OFFSET: u8 = 0xFF;

//----------------------------------------------------------------------------------------------
// OdtEntry

/// One sampled or stimulated memory element
/// Zero length entries are empty placeholders
#[derive(Debug, Clone, Copy)]
pub struct OdtEntry {
    pub address: u32,
    pub extension: u8,
    pub length: u8,
    pub bit_offset: u8,
}

impl OdtEntry {
    pub fn empty() -> OdtEntry {
        OdtEntry {
            address: 0,
            extension: 0,
            length: 0,
            bit_offset: ODT_ENTRY_NO_BIT_OFFSET,
        }
    }

    pub fn new(address: u32, extension: u8, length: u8) -> OdtEntry {
        OdtEntry {
            address,
            extension,
            length,
            bit_offset: ODT_ENTRY_NO_BIT_OFFSET,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

//----------------------------------------------------------------------------------------------
// Odt

/// A group of ODT entries transmitted as one wire packet
#[derive(Debug)]
pub struct Odt {
    pub entries: Vec<OdtEntry>,
    /// Non empty entries, maintained by WRITE_DAQ and CLEAR_DAQ_LIST
    /// An ODT with no valid entry is not transmitted at all
    pub valid_count: u8,
    /// Queued incoming stimulation data awaiting application to memory
    pub stim: Option<crate::fifo::XcpBuffer>,
}

impl Odt {
    pub fn new() -> Odt {
        Odt {
            entries: Vec::new(),
            valid_count: 0,
            stim: None,
        }
    }

    /// A predefined ODT with fixed entries
    pub fn with_entries(entries: Vec<OdtEntry>) -> Odt {
        let valid_count = entries.iter().filter(|e| !e.is_empty()).count() as u8;
        Odt {
            entries,
            valid_count,
            stim: None,
        }
    }
}

impl Default for Odt {
    fn default() -> Self {
        Odt::new()
    }
}

//----------------------------------------------------------------------------------------------
// DaqList

/// An ordered collection of ODTs forming one acquisition or stimulation stream
#[derive(Debug)]
pub struct DaqList {
    pub number: u16,
    pub odts: Vec<Odt>,
    pub mode: DaqListMode,
    pub properties: DaqListProperties,
    /// Channel the list is attached to, EVENT_CHANNEL_NONE if detached
    pub event_channel: u16,
    /// Channel a list with EVENT_FIXED is bound to
    pub fixed_event: Option<u16>,
    pub prescaler: u8,
    pub priority: u8,
    /// Absolute PID of the first ODT, assigned when PIDs are distributed
    pub first_pid: u8,
}

/// No event channel assigned
pub const EVENT_CHANNEL_NONE: u16 = 0xFFFF;

impl DaqList {
    /// A mutable list with no ODTs, configured at runtime
    pub fn new(number: u16, properties: DaqListProperties) -> DaqList {
        DaqList {
            number,
            odts: Vec::new(),
            mode: DaqListMode::empty(),
            properties,
            event_channel: EVENT_CHANNEL_NONE,
            fixed_event: None,
            prescaler: 1,
            priority: 0,
            first_pid: 0,
        }
    }

    /// A predefined list with fixed topology
    pub fn predefined(number: u16, odts: Vec<Odt>, properties: DaqListProperties, fixed_event: Option<u16>) -> DaqList {
        DaqList {
            number,
            odts,
            mode: DaqListMode::empty(),
            properties: properties | DaqListProperties::PREDEFINED,
            event_channel: EVENT_CHANNEL_NONE,
            fixed_event,
            prescaler: 1,
            priority: 0,
            first_pid: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.mode.contains(DaqListMode::RUNNING)
    }

    pub fn is_stim(&self) -> bool {
        self.mode.contains(DaqListMode::STIM)
    }
}

//----------------------------------------------------------------------------------------------
// EventChannel

/// A periodic or externally triggered trigger point DAQ lists attach to
#[derive(Debug)]
pub struct EventChannel {
    pub number: u16,
    pub name: &'static str,
    pub priority: u8,
    pub max_daq_lists: u8,
    /// Attached list numbers, compacted on detach
    attached: Vec<u16>,
    /// Monotonic tick counter, wraps
    counter: u32,
    pub properties: EventChannelProperties,
    pub time_unit: TimestampUnit,
    pub time_cycle: u8,
}

impl EventChannel {
    pub fn new(number: u16, name: &'static str, max_daq_lists: u8, properties: EventChannelProperties) -> EventChannel {
        EventChannel {
            number,
            name,
            priority: 0,
            max_daq_lists,
            attached: Vec::new(),
            counter: 0,
            properties,
            time_unit: TimestampUnit::default(),
            time_cycle: 0,
        }
    }

    pub fn set_timing(mut self, time_unit: TimestampUnit, time_cycle: u8) -> EventChannel {
        self.time_unit = time_unit;
        self.time_cycle = time_cycle;
        self
    }

    pub fn attached(&self) -> &[u16] {
        &self.attached
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Attach a list, false if the channel is full
    pub fn attach(&mut self, list: u16) -> bool {
        if self.attached.len() >= self.max_daq_lists as usize {
            return false;
        }
        if !self.attached.contains(&list) {
            self.attached.push(list);
        }
        true
    }

    /// Detach a list, compacting the attachment array
    pub fn detach(&mut self, list: u16) {
        self.attached.retain(|l| *l != list);
    }
}

/// Remove a list from whatever channel it is attached to
/// A list appears in at most one channel's attachment array at a time
pub fn detach_everywhere(channels: &mut [EventChannel], list: u16) {
    for ech in channels.iter_mut() {
        ech.detach(list);
    }
}

//----------------------------------------------------------------------------------------------
// DaqTable

/// Owner of all DAQ lists, the static prefix plus the dynamic region
#[derive(Debug)]
pub struct DaqTable {
    lists: Vec<DaqList>,
    min_daq: u16,
    max_daq: u16,
    max_odt: u8,
    max_odt_entries: u8,
}

impl DaqTable {
    pub fn new(predefined: Vec<DaqList>, max_daq: u16, max_odt: u8, max_odt_entries: u8) -> DaqTable {
        let min_daq = predefined.len() as u16;
        DaqTable {
            lists: predefined,
            min_daq,
            max_daq,
            max_odt,
            max_odt_entries,
        }
    }

    pub fn count(&self) -> u16 {
        self.lists.len() as u16
    }

    pub fn min_daq(&self) -> u16 {
        self.min_daq
    }

    pub fn get(&self, number: u16) -> Option<&DaqList> {
        self.lists.get(number as usize)
    }

    pub fn get_mut(&mut self, number: u16) -> Option<&mut DaqList> {
        self.lists.get_mut(number as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DaqList> {
        self.lists.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DaqList> {
        self.lists.iter_mut()
    }

    pub fn any_running(&self) -> bool {
        self.lists.iter().any(|d| d.is_running())
    }

    pub fn any_resume(&self) -> bool {
        self.lists.iter().any(|d| d.mode.contains(DaqListMode::RESUME))
    }

    /// Distribute absolute DTO packet identifiers over all ODTs in list order
    /// For relative identification modes the PID is the ODT index within its list
    pub fn assign_first_pids(&mut self, identification: IdentificationMode) {
        if identification == IdentificationMode::Absolute {
            let mut pid: u16 = 0;
            for daq in self.lists.iter_mut() {
                daq.first_pid = pid as u8;
                pid += daq.odts.len() as u16;
            }
        } else {
            for daq in self.lists.iter_mut() {
                daq.first_pid = 0;
            }
        }
    }

    /// Resolve an inbound stimulation packet to its (list, odt) target
    /// `packet` is the full wire packet, its first byte the DTO PID
    pub fn resolve_stim(&self, packet: &[u8], identification: IdentificationMode) -> Option<(u16, u8)> {
        let pid = *packet.first()?;
        match identification {
            IdentificationMode::Absolute => {
                for daq in &self.lists {
                    let first = daq.first_pid as u16;
                    let count = daq.odts.len() as u16;
                    if (pid as u16) >= first && (pid as u16) < first + count {
                        return Some((daq.number, pid - daq.first_pid));
                    }
                }
                None
            }
            IdentificationMode::RelativeByte => {
                let list = *packet.get(1)? as u16;
                self.check_odt(list, pid)
            }
            IdentificationMode::RelativeWord => {
                if packet.len() < 3 {
                    return None;
                }
                let list = crate::codec::get_u16(packet, 1);
                self.check_odt(list, pid)
            }
            IdentificationMode::RelativeWordAligned => {
                if packet.len() < 4 {
                    return None;
                }
                let list = crate::codec::get_u16(packet, 2);
                self.check_odt(list, pid)
            }
        }
    }

    fn check_odt(&self, list: u16, odt: u8) -> Option<(u16, u8)> {
        let daq = self.get(list)?;
        if (odt as usize) < daq.odts.len() {
            Some((list, odt))
        } else {
            None
        }
    }

    /// Release all dynamically owned lists, their pending stimulation buffers
    /// and their event channel attachments
    #[cfg(feature = "dyn_daq")]
    pub fn free_dynamic(&mut self, channels: &mut [EventChannel], queues: &XcpQueues) {
        for daq in self.lists.drain(self.min_daq as usize..) {
            detach_everywhere(channels, daq.number);
            for odt in daq.odts {
                if let Some(buf) = odt.stim {
                    queues.pool.free(buf);
                }
            }
        }
    }

    /// Bulk allocate `count` lists behind the static prefix
    /// New lists are DAQ and STIM capable, neither predefined nor event fixed
    #[cfg(feature = "dyn_daq")]
    pub fn alloc_daq(&mut self, count: u16) -> Result<(), ErrorCode> {
        let wanted = self.min_daq as usize + count as usize;
        if wanted > self.max_daq as usize {
            return Err(ErrorCode::MemoryOverflow);
        }
        for n in self.lists.len()..wanted {
            self.lists.push(DaqList::new(n as u16, DaqListProperties::DAQ | DaqListProperties::STIM));
        }
        Ok(())
    }

    #[cfg(feature = "dyn_daq")]
    pub fn alloc_odt(&mut self, number: u16, count: u8) -> Result<(), ErrorCode> {
        if number < self.min_daq {
            return Err(ErrorCode::WriteProtected);
        }
        let max_odt = self.max_odt as usize;
        let daq = self.get_mut(number).ok_or(ErrorCode::OutOfRange)?;
        if daq.odts.len() + count as usize > max_odt {
            return Err(ErrorCode::MemoryOverflow);
        }
        for _ in 0..count {
            daq.odts.push(Odt::new());
        }
        Ok(())
    }

    #[cfg(feature = "dyn_daq")]
    pub fn alloc_odt_entry(&mut self, number: u16, odt: u8, count: u8) -> Result<(), ErrorCode> {
        if number < self.min_daq {
            return Err(ErrorCode::WriteProtected);
        }
        let max_entries = self.max_odt_entries as usize;
        let daq = self.get_mut(number).ok_or(ErrorCode::OutOfRange)?;
        let odt = daq.odts.get_mut(odt as usize).ok_or(ErrorCode::OutOfRange)?;
        if odt.entries.len() + count as usize > max_entries {
            return Err(ErrorCode::MemoryOverflow);
        }
        for _ in 0..count {
            odt.entries.push(OdtEntry::empty());
        }
        Ok(())
    }

    pub fn max_odt(&self) -> u8 {
        self.max_odt
    }

    pub fn max_odt_entries(&self) -> u8 {
        self.max_odt_entries
    }

    pub fn max_daq(&self) -> u16 {
        self.max_daq
    }
}

//----------------------------------------------------------------------------------------------
// Sampling and stimulation
// Run once per event channel tick from the main loop

/// Per tick context captured from the engine
pub(crate) struct SampleParams {
    pub connected: bool,
    pub identification: IdentificationMode,
    /// 0, 1, 2 or 4 bytes
    pub timestamp_size: u8,
    pub timestamp: u32,
    pub max_dto: usize,
}

/// Process one event channel tick: run every attached list that is due, then
/// advance the channel counter
pub(crate) fn process_event_channel(
    ech: &mut EventChannel,
    table: &mut DaqTable,
    spaces: &mut AddressSpaces,
    queues: &XcpQueues,
    params: &SampleParams,
) {
    // Attachment entries may be stale after a dynamic free, skip what no longer resolves
    let attached: Vec<u16> = ech.attached.clone();
    for number in attached {
        let Some(daq) = table.get_mut(number) else {
            continue;
        };
        if !daq.is_running() {
            continue;
        }
        // Disconnected sessions only keep RESUME flagged lists alive
        if !daq.mode.contains(DaqListMode::RESUME) && !params.connected {
            continue;
        }
        let prescaler = daq.prescaler.max(1) as u32;
        if ech.counter % prescaler != 0 {
            continue;
        }
        if daq.is_stim() {
            apply_stimulation(daq, spaces, queues, params);
        } else {
            sample_list(daq, spaces, queues, params);
        }
    }
    ech.counter = ech.counter.wrapping_add(1);
}

/// DAQ direction: each ODT with at least one valid entry becomes exactly one DTO
/// packet. A packet that would overflow the maximum DTO size stops at the last
/// entry that still fits. No transmit buffer available drops the packet silently.
fn sample_list(daq: &mut DaqList, spaces: &mut AddressSpaces, queues: &XcpQueues, params: &SampleParams) {
    let number = daq.number;
    for (o, odt) in daq.odts.iter().enumerate() {
        if odt.valid_count == 0 {
            continue;
        }
        let Some(mut buf) = queues.pool.get() else {
            trace!("DAQ {}: no transmit buffer, packet dropped", number);
            continue;
        };

        if !daq.mode.contains(DaqListMode::PID_OFF) {
            match params.identification {
                IdentificationMode::Absolute => {
                    buf.append_u8(daq.first_pid + o as u8);
                }
                IdentificationMode::RelativeByte => {
                    buf.append_u8(o as u8);
                    buf.append_u8(number as u8);
                }
                IdentificationMode::RelativeWord => {
                    buf.append_u8(o as u8);
                    buf.append_u16(number);
                }
                IdentificationMode::RelativeWordAligned => {
                    buf.append_u8(o as u8);
                    buf.append_u8(0);
                    buf.append_u16(number);
                }
            }
        }

        if daq.mode.contains(DaqListMode::TIMESTAMP) {
            match params.timestamp_size {
                1 => buf.append_u8(params.timestamp as u8),
                2 => buf.append_u16(params.timestamp as u16),
                4 => buf.append_u32(params.timestamp),
                _ => {}
            }
        }

        let mut failed = false;
        for entry in &odt.entries {
            if entry.is_empty() {
                continue;
            }
            let len = entry.length as usize;
            if buf.len() + len > params.max_dto {
                // Remaining entries stay unsampled this cycle, capping each ODT
                // to one DTO frame
                break;
            }
            let mut mta = Mta::init(entry.address, entry.extension);
            let mut tmp = [0u8; 256];
            if let Err(e) = mta.read(spaces, &mut tmp[..len]) {
                warn!("DAQ {}: entry read failed at 0x{:08X}: {:?}", number, entry.address, e);
                failed = true;
                break;
            }
            buf.append_slice(&tmp[..len]);
        }

        if failed {
            queues.pool.free(buf);
        } else {
            queues.tx.put(buf);
        }
    }
}

/// STIM direction: split each pending stimulation buffer across the ODT entries in
/// order and write each span through a fresh MTA. A short payload stops early, a
/// tolerated short stimulation frame.
fn apply_stimulation(daq: &mut DaqList, spaces: &mut AddressSpaces, queues: &XcpQueues, params: &SampleParams) {
    let id_size = params.identification.field_size();
    for odt in daq.odts.iter_mut() {
        let Some(buf) = odt.stim.take() else {
            continue;
        };
        let data = buf.data();
        let payload = if data.len() > id_size { &data[id_size..] } else { &[][..] };

        let mut offset = 0usize;
        for entry in &odt.entries {
            if entry.is_empty() {
                continue;
            }
            let len = entry.length as usize;
            if offset + len > payload.len() {
                break;
            }
            let mut mta = Mta::init(entry.address, entry.extension);
            if let Err(e) = mta.write(spaces, &payload[offset..offset + len]) {
                warn!("STIM {}: entry write failed at 0x{:08X}: {:?}", daq.number, entry.address, e);
                break;
            }
            if let Err(e) = mta.flush(spaces) {
                warn!("STIM {}: flush failed: {:?}", daq.number, e);
            }
            offset += len;
        }
        queues.pool.free(buf);
    }
}

//----------------------------------------------------------------------------------------------
//----------------------------------------------------------------------------------------------
// Test module
