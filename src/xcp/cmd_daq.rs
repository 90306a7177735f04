//----------------------------------------------------------------------------------------------
// Module cmd_daq
// DAQ and STIM configuration handlers: list clearing, the SET_DAQ_PTR cursor with
// WRITE_DAQ / READ_DAQ auto advance, list mode and event channel attachment, start
// and stop, the info queries and the dynamic allocation sequence

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::codec::{get_u8, get_u16, get_u32};
use crate::daq::{
    detach_everywhere, DaqListMode, DaqListProperties, EventChannelProperties, OdtEntry, DAQ_LIST_MODE_SETTABLE, DAQ_LIST_MODE_WIRE,
    EVENT_CHANNEL_NONE, ODT_ENTRY_NO_BIT_OFFSET,
};
use crate::mta::Mta;
use crate::protocol::*;

use super::{CmdError, CmdResult, DaqPtr, XcpSlave};

#[cfg(feature = "dyn_daq")]
use super::DaqAllocState;

//----------------------------------------------------------------------------------------------
// List configuration

pub(super) fn cmd_clear_daq_list(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let number = get_u16(data, 1);
    let queues = std::sync::Arc::clone(&x.queues);
    let daq = x.daq.get_mut(number).ok_or(ErrorCode::OutOfRange)?;
    if daq.is_running() {
        return Err(ErrorCode::DaqActive.into());
    }
    if daq.properties.contains(DaqListProperties::PREDEFINED) {
        return Err(ErrorCode::WriteProtected.into());
    }
    for odt in daq.odts.iter_mut() {
        for entry in odt.entries.iter_mut() {
            *entry = OdtEntry::empty();
        }
        odt.valid_count = 0;
        if let Some(buf) = odt.stim.take() {
            queues.pool.free(buf);
        }
    }
    debug!("clear_daq_list {}", number);
    x.send_ok();
    Ok(())
}

pub(super) fn cmd_set_daq_ptr(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let number = get_u16(data, 1);
    let odt = get_u8(data, 3);
    let entry = get_u8(data, 4);

    x.daq_ptr = None;
    let daq = x.daq.get(number).ok_or(ErrorCode::OutOfRange)?;
    let o = daq.odts.get(odt as usize).ok_or(ErrorCode::OutOfRange)?;
    if entry as usize >= o.entries.len() {
        return Err(ErrorCode::OutOfRange.into());
    }
    x.daq_ptr = Some(DaqPtr { daq: number, odt, entry });
    x.send_ok();
    Ok(())
}

/// Move the cursor to the next entry, clearing it at end of ODT
fn advance_daq_ptr(x: &mut XcpSlave) {
    if let Some(mut ptr) = x.daq_ptr {
        let entries = x
            .daq
            .get(ptr.daq)
            .and_then(|d| d.odts.get(ptr.odt as usize))
            .map(|o| o.entries.len())
            .unwrap_or(0);
        ptr.entry += 1;
        x.daq_ptr = if (ptr.entry as usize) < entries { Some(ptr) } else { None };
    }
}

pub(super) fn cmd_write_daq(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let bit_offset = get_u8(data, 0);
    let size = get_u8(data, 1);
    let extension = get_u8(data, 2);
    let address = get_u32(data, 3);

    let ptr = x.daq_ptr.ok_or(ErrorCode::DaqConfig)?;
    if ptr.daq < x.daq.min_daq() {
        return Err(ErrorCode::WriteProtected.into());
    }
    if size > x.config.max_odt_entry_size {
        return Err(ErrorCode::OutOfRange.into());
    }
    let daq = x.daq.get_mut(ptr.daq).ok_or(ErrorCode::DaqConfig)?;
    if daq.is_running() {
        return Err(ErrorCode::DaqActive.into());
    }
    // Stimulation lists do not support bit access
    if daq.mode.contains(DaqListMode::STIM) && bit_offset != ODT_ENTRY_NO_BIT_OFFSET {
        return Err(ErrorCode::OutOfRange.into());
    }
    if bit_offset != ODT_ENTRY_NO_BIT_OFFSET {
        // Bit access applies to a single element of the configured granularity
        if bit_offset > 31 || size != 1 {
            return Err(ErrorCode::OutOfRange.into());
        }
    }

    let odt = &mut daq.odts[ptr.odt as usize];
    let entry = &mut odt.entries[ptr.entry as usize];
    if entry.length == 0 && size > 0 {
        odt.valid_count += 1;
    } else if entry.length > 0 && size == 0 {
        odt.valid_count -= 1;
    }
    *entry = OdtEntry {
        address,
        extension,
        length: size,
        bit_offset,
    };

    advance_daq_ptr(x);
    x.send_ok();
    Ok(())
}

pub(super) fn cmd_read_daq(x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    let ptr = x.daq_ptr.ok_or(ErrorCode::DaqConfig)?;
    let entry = *x
        .daq
        .get(ptr.daq)
        .and_then(|d| d.odts.get(ptr.odt as usize))
        .and_then(|o| o.entries.get(ptr.entry as usize))
        .ok_or(ErrorCode::DaqConfig)?;

    advance_daq_ptr(x);
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(entry.bit_offset);
        b.append_u8(entry.length);
        b.append_u8(entry.extension);
        b.append_u32(entry.address);
    });
    Ok(())
}

//----------------------------------------------------------------------------------------------
// Mode and event channel attachment

pub(super) fn cmd_set_daq_list_mode(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let mode = get_u8(data, 0);
    let number = get_u16(data, 1);
    let event = get_u16(data, 3);
    let prescaler = get_u8(data, 5);
    let priority = get_u8(data, 6);

    if mode & !DAQ_LIST_MODE_SETTABLE != 0 {
        return Err(ErrorCode::ModeNotValid.into());
    }
    // Prioritized scheduling is unsupported beyond validation
    if priority != 0 {
        return Err(ErrorCode::OutOfRange.into());
    }
    // The prescaler is 1 based, a prescaler of 1 fires every tick
    if prescaler == 0 {
        return Err(ErrorCode::OutOfRange.into());
    }
    let stim = mode & DaqListMode::STIM.bits() != 0;
    let timestamp = mode & DaqListMode::TIMESTAMP.bits() != 0;
    if timestamp && x.config.timestamp_size == 0 {
        return Err(ErrorCode::ModeNotValid.into());
    }

    let ech = x.channels.get(event as usize).ok_or(ErrorCode::OutOfRange)?;
    let ech_props = ech.properties;

    let daq = x.daq.get(number).ok_or(ErrorCode::OutOfRange)?;
    if daq.is_running() {
        return Err(ErrorCode::DaqActive.into());
    }
    // Direction must be within both the list's and the channel's capabilities
    if stim {
        if !daq.properties.contains(DaqListProperties::STIM) || !ech_props.contains(EventChannelProperties::STIM) {
            return Err(ErrorCode::ModeNotValid.into());
        }
    } else if !daq.properties.contains(DaqListProperties::DAQ) || !ech_props.contains(EventChannelProperties::DAQ) {
        return Err(ErrorCode::ModeNotValid.into());
    }
    // A predefined list cannot be moved to another channel
    if daq.properties.contains(DaqListProperties::PREDEFINED) && daq.event_channel != EVENT_CHANNEL_NONE && daq.event_channel != event {
        return Err(ErrorCode::WriteProtected.into());
    }
    // An event fixed list only accepts its fixed channel
    if let Some(fixed) = daq.fixed_event {
        if fixed != event {
            return Err(ErrorCode::OutOfRange.into());
        }
    }

    detach_everywhere(&mut x.channels, number);
    if !x.channels[event as usize].attach(number) {
        return Err(ErrorCode::OutOfRange.into());
    }

    let daq = x.daq.get_mut(number).unwrap();
    let keep = daq.mode.bits() & !DAQ_LIST_MODE_SETTABLE;
    daq.mode = DaqListMode::from_bits_truncate(keep | (mode & DAQ_LIST_MODE_SETTABLE));
    daq.event_channel = event;
    daq.prescaler = prescaler;
    daq.priority = priority;

    debug!("set_daq_list_mode: list {}, mode {:02X}, event {}, prescaler {}", number, mode, event, prescaler);
    x.send_ok();
    Ok(())
}

pub(super) fn cmd_get_daq_list_mode(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let number = get_u16(data, 1);
    let daq = x.daq.get(number).ok_or(ErrorCode::OutOfRange)?;
    let mode = daq.mode.bits() & DAQ_LIST_MODE_WIRE;
    let event = daq.event_channel;
    let prescaler = daq.prescaler;
    let priority = daq.priority;
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(mode);
        b.append_u16(0); // Reserved
        b.append_u16(event);
        b.append_u8(prescaler);
        b.append_u8(priority);
    });
    Ok(())
}

//----------------------------------------------------------------------------------------------
// Start and stop

pub(super) fn cmd_start_stop_daq_list(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let mode = get_u8(data, 0);
    let number = get_u16(data, 1);
    let identification = x.config.identification;

    let daq = x.daq.get(number).ok_or(ErrorCode::OutOfRange)?;
    match mode {
        0 => {
            let daq = x.daq.get_mut(number).unwrap();
            daq.mode.remove(DaqListMode::RUNNING | DaqListMode::SELECTED);
        }
        1 => {
            if daq.event_channel == EVENT_CHANNEL_NONE {
                return Err(ErrorCode::DaqConfig.into());
            }
            x.daq.assign_first_pids(identification);
            let daq = x.daq.get_mut(number).unwrap();
            daq.mode.insert(DaqListMode::RUNNING);
        }
        2 => {
            if daq.event_channel == EVENT_CHANNEL_NONE {
                return Err(ErrorCode::DaqConfig.into());
            }
            let daq = x.daq.get_mut(number).unwrap();
            daq.mode.insert(DaqListMode::SELECTED);
        }
        _ => return Err(ErrorCode::ModeNotValid.into()),
    }

    let first_pid = x.daq.get(number).unwrap().first_pid;
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(first_pid);
    });
    Ok(())
}

pub(super) fn cmd_start_stop_synch(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let mode = get_u8(data, 0);
    let identification = x.config.identification;
    match mode {
        0 => {
            // Stop all
            for daq in x.daq.iter_mut() {
                daq.mode.remove(DaqListMode::RUNNING | DaqListMode::SELECTED);
            }
        }
        1 => {
            // Start selected
            x.daq.assign_first_pids(identification);
            for daq in x.daq.iter_mut() {
                if daq.mode.contains(DaqListMode::SELECTED) {
                    if daq.event_channel != EVENT_CHANNEL_NONE {
                        daq.mode.insert(DaqListMode::RUNNING);
                    }
                    daq.mode.remove(DaqListMode::SELECTED);
                }
            }
        }
        2 => {
            // Stop selected
            for daq in x.daq.iter_mut() {
                if daq.mode.contains(DaqListMode::SELECTED) {
                    daq.mode.remove(DaqListMode::RUNNING | DaqListMode::SELECTED);
                }
            }
        }
        _ => return Err(ErrorCode::ModeNotValid.into()),
    }
    x.send_ok();
    Ok(())
}

//----------------------------------------------------------------------------------------------
// Info queries

pub(super) fn cmd_get_daq_clock(x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    let timestamp = x.timestamp();
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(0); // Reserved
        b.append_u16(0); // Reserved
        b.append_u32(timestamp);
    });
    Ok(())
}

pub(super) fn cmd_get_daq_processor_info(x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    // Properties: prescaler and pid off supported, resume kept across disconnect
    let mut properties: u8 = 0x02 | 0x04 | 0x20;
    if cfg!(feature = "dyn_daq") {
        properties |= 0x01; // Dynamic DAQ configuration
    }
    if x.config.timestamp_size > 0 {
        properties |= 0x10;
    }
    let max_daq = x.daq.max_daq();
    let max_event = x.channels.len() as u16;
    let min_daq = x.daq.min_daq().min(255) as u8;
    let key_byte = x.config.identification.key_code() << 6;
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(properties);
        b.append_u16(max_daq);
        b.append_u16(max_event);
        b.append_u8(min_daq);
        b.append_u8(key_byte);
    });
    Ok(())
}

pub(super) fn cmd_get_daq_resolution_info(x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    let max_size = x.config.max_odt_entry_size;
    let timestamp_mode = x.config.timestamp_size | ((x.config.timestamp_unit as u8) << 4);
    let timestamp_ticks = x.config.timestamp_ticks;
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(1); // Granularity ODT entry size DAQ
        b.append_u8(max_size);
        b.append_u8(1); // Granularity ODT entry size STIM
        b.append_u8(max_size);
        b.append_u8(timestamp_mode);
        b.append_u16(timestamp_ticks);
    });
    Ok(())
}

pub(super) fn cmd_get_daq_list_info(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let number = get_u16(data, 1);
    let daq = x.daq.get(number).ok_or(ErrorCode::OutOfRange)?;
    let properties = daq.properties.bits();
    let fixed_event = daq.fixed_event.unwrap_or(EVENT_CHANNEL_NONE);
    let max_odt = x.daq.max_odt();
    let max_odt_entries = x.daq.max_odt_entries();
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(properties);
        b.append_u8(max_odt);
        b.append_u8(max_odt_entries);
        b.append_u16(fixed_event);
    });
    Ok(())
}

pub(super) fn cmd_get_daq_event_info(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let event = get_u16(data, 1);
    let ech = x.channels.get(event as usize).ok_or(ErrorCode::OutOfRange)?;
    let properties = ech.properties.bits();
    let max_daq_lists = ech.max_daq_lists;
    let name = ech.name;
    let time_cycle = ech.time_cycle;
    let time_unit = ech.time_unit as u8;
    let priority = ech.priority;

    // The channel name is transferred by upload, like the GET_ID identity
    x.spaces.stage(name.as_bytes());
    x.mta = Some(Mta::staged());

    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(properties);
        b.append_u8(max_daq_lists);
        b.append_u8(name.len() as u8);
        b.append_u8(time_cycle);
        b.append_u8(time_unit);
        b.append_u8(priority);
    });
    Ok(())
}

//----------------------------------------------------------------------------------------------
// Dynamic allocation
// A four step configuration sequence, each step only valid immediately after its
// predecessor or a repeat of itself, any out of order call resets to Undefined

#[cfg(feature = "dyn_daq")]
fn check_alloc_sequence(x: &mut XcpSlave, allowed: &[DaqAllocState]) -> CmdResult {
    if !allowed.contains(&x.alloc_state) {
        warn!("allocation command out of sequence in state {:?}", x.alloc_state);
        x.alloc_state = DaqAllocState::Undefined;
        return Err(ErrorCode::Sequence.into());
    }
    Ok(())
}

#[cfg(feature = "dyn_daq")]
pub(super) fn cmd_free_daq(x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    x.daq_ptr = None;
    x.daq.free_dynamic(&mut x.channels, &x.queues);
    x.alloc_state = DaqAllocState::FreeDaq;
    debug!("free_daq");
    x.send_ok();
    Ok(())
}

#[cfg(feature = "dyn_daq")]
pub(super) fn cmd_alloc_daq(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    check_alloc_sequence(x, &[DaqAllocState::FreeDaq, DaqAllocState::AllocDaq])?;
    let count = get_u16(data, 1);
    // A failed allocation keeps completed prior steps, the host restarts via FREE_DAQ
    x.daq.alloc_daq(count).map_err(CmdError::from)?;
    x.alloc_state = DaqAllocState::AllocDaq;
    debug!("alloc_daq: {} lists", count);
    x.send_ok();
    Ok(())
}

#[cfg(feature = "dyn_daq")]
pub(super) fn cmd_alloc_odt(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    check_alloc_sequence(x, &[DaqAllocState::AllocDaq, DaqAllocState::AllocOdt])?;
    let number = get_u16(data, 1);
    let count = get_u8(data, 3);
    x.daq.alloc_odt(number, count).map_err(CmdError::from)?;
    x.alloc_state = DaqAllocState::AllocOdt;
    debug!("alloc_odt: list {}, {} odts", number, count);
    x.send_ok();
    Ok(())
}

#[cfg(feature = "dyn_daq")]
pub(super) fn cmd_alloc_odt_entry(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    check_alloc_sequence(x, &[DaqAllocState::AllocOdt, DaqAllocState::AllocOdtEntry])?;
    let number = get_u16(data, 1);
    let odt = get_u8(data, 3);
    let count = get_u8(data, 4);
    x.daq.alloc_odt_entry(number, odt, count).map_err(CmdError::from)?;
    x.alloc_state = DaqAllocState::AllocOdtEntry;
    debug!("alloc_odt_entry: list {}, odt {}, {} entries", number, odt, count);
    x.send_ok();
    Ok(())
}
