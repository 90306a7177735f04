//----------------------------------------------------------------------------------------------
// Module cmd_std
// Standard command handlers: session control, identification, seed and key, memory
// upload and checksum. Handlers receive the payload without the pid byte, minimum
// lengths are enforced by the dispatch table.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::codec::{get_u8, get_u32};
use crate::mta::Mta;
use crate::protocol::*;

use super::{CmdError, CmdResult, PendingWorker, SeedKeyState, XcpSlave};

//----------------------------------------------------------------------------------------------
// Session

pub(super) fn cmd_connect(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let mode = get_u8(data, 0);
    if mode != 0 {
        debug!("connect mode {:02X} not supported", mode);
        return Err(ErrorCode::CmdUnknown.into());
    }
    debug!("connect");

    // A new connection resets protection and any leftover transfer state
    x.connected = true;
    x.protection = x.config.resource_protect;
    x.worker = PendingWorker::None;
    x.transfer = None;
    x.seed_key = SeedKeyState::Idle;
    x.daq_ptr = None;
    x.mta = None;

    let resources = x.config.resources.bits();
    let mut comm_mode = 0u8;
    if x.config.slave_block_mode {
        comm_mode |= COMM_MODE_BASIC_SLAVE_BLOCK_MODE;
    }
    let max_cto = x.config.max_cto;
    let max_dto = x.config.max_dto;
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(resources);
        b.append_u8(comm_mode);
        b.append_u8(max_cto);
        b.append_u16(max_dto);
        b.append_u8(PROTOCOL_MAJOR_VERSION << 4);
        b.append_u8(TRANSPORT_MAJOR_VERSION << 4);
    });
    Ok(())
}

pub(super) fn cmd_disconnect(x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    debug!("disconnect");
    x.disconnect();
    x.send_ok();
    Ok(())
}

pub(super) fn cmd_get_status(x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    let mut status = SessionStatus::empty();
    if x.daq.any_running() {
        status |= SessionStatus::DAQ_RUNNING;
    }
    if x.daq.any_resume() {
        status |= SessionStatus::RESUME;
    }
    let protection = x.protection.bits();
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(status.bits());
        b.append_u8(protection);
        b.append_u8(0); // Reserved
        b.append_u16(0); // Session configuration id
    });
    Ok(())
}

pub(super) fn cmd_synch(_x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    // SYNCH is answered with ERR_CMD_SYNCH, the resynchronization handshake
    Err(ErrorCode::CmdSynch.into())
}

pub(super) fn cmd_get_comm_mode_info(x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    let queue_size = x.config.queue_size.min(255) as u8;
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(0); // Reserved
        b.append_u8(0); // Comm mode optional: no master block mode, no interleaved mode
        b.append_u8(0); // Reserved
        b.append_u8(0); // Max BS
        b.append_u8(0); // Min ST
        b.append_u8(queue_size);
        b.append_u8(0x10); // Driver version
    });
    Ok(())
}

pub(super) fn cmd_get_id(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let mode = get_u8(data, 0);
    if mode > 1 {
        return Err(ErrorCode::OutOfRange.into());
    }
    // Identity is transferred by upload: stage it and point the MTA at it
    let ident = x.config.ident;
    x.spaces.stage(ident.as_bytes());
    x.mta = Some(Mta::staged());
    let len = ident.len() as u32;
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(0); // Transfer mode: upload via MTA
        b.append_u16(0); // Reserved
        b.append_u32(len);
    });
    Ok(())
}

//----------------------------------------------------------------------------------------------
// Seed and key

pub(super) fn cmd_get_seed(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    if x.cb.seed.is_none() {
        return Err(ErrorCode::CmdUnknown.into());
    }
    let mode = get_u8(data, 0);
    let chunk_max = x.config.max_cto as usize - 2;

    match mode {
        0 => {
            let bits = get_u8(data, 1);
            let resource = Resource::from_bits(bits)
                .filter(|r| r.bits().count_ones() == 1)
                .ok_or(ErrorCode::OutOfRange)?;

            // An unprotected resource needs no seed
            if !x.protection.contains(resource) {
                x.seed_key = SeedKeyState::Idle;
                x.reply(|b| {
                    b.append_u8(PID_RES);
                    b.append_u8(0);
                });
                return Ok(());
            }

            let mut seed = (x.cb.seed.as_mut().unwrap())(resource);
            if seed.len() > 255 {
                warn!("seed longer than 255 bytes, truncated");
                seed.truncate(255);
            }
            let total = seed.len();
            let chunk = total.min(chunk_max);
            let head: Vec<u8> = seed[..chunk].to_vec();
            x.seed_key = SeedKeyState::SeedPending { resource, seed, offset: chunk };
            x.reply(|b| {
                b.append_u8(PID_RES);
                b.append_u8(total as u8);
                b.append_slice(&head);
            });
            Ok(())
        }
        1 => {
            let SeedKeyState::SeedPending { seed, offset, .. } = &mut x.seed_key else {
                return Err(ErrorCode::Sequence.into());
            };
            let remaining = seed.len() - *offset;
            let chunk = remaining.min(chunk_max);
            let part: Vec<u8> = seed[*offset..*offset + chunk].to_vec();
            *offset += chunk;
            x.reply(|b| {
                b.append_u8(PID_RES);
                b.append_u8(remaining as u8);
                b.append_slice(&part);
            });
            Ok(())
        }
        _ => Err(ErrorCode::OutOfRange.into()),
    }
}

pub(super) fn cmd_unlock(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    if x.cb.unlock.is_none() {
        return Err(ErrorCode::CmdUnknown.into());
    }
    let declared = get_u8(data, 0) as usize;
    let key_bytes = &data[1..];

    let state = std::mem::replace(&mut x.seed_key, SeedKeyState::Idle);
    let (resource, seed, mut key, total) = match state {
        SeedKeyState::Idle => {
            // UNLOCK before any GET_SEED
            return Err(ErrorCode::Sequence.into());
        }
        SeedKeyState::SeedPending { resource, seed, offset } => {
            if offset < seed.len() {
                // The host has not retrieved the whole seed yet
                x.seed_key = SeedKeyState::SeedPending { resource, seed, offset };
                return Err(ErrorCode::Sequence.into());
            }
            if declared == 0 {
                return Err(ErrorCode::Sequence.into());
            }
            (resource, seed, Vec::with_capacity(declared), declared)
        }
        SeedKeyState::KeyPending { resource, seed, key, total } => {
            let remaining = total - key.len();
            if declared != remaining {
                // Declared length must match the remembered remaining count
                x.seed_key = SeedKeyState::KeyPending { resource, seed, key, total };
                return Err(CmdError::with_info(ErrorCode::Sequence, remaining as u8));
            }
            (resource, seed, key, total)
        }
    };

    let take = key_bytes.len().min(total - key.len());
    key.extend_from_slice(&key_bytes[..take]);

    if key.len() < total {
        x.seed_key = SeedKeyState::KeyPending { resource, seed, key, total };
        return Ok(());
    }

    let unlocked = (x.cb.unlock.as_mut().unwrap())(resource, &seed, &key);
    if !unlocked {
        debug!("unlock for {:?} rejected", resource);
        return Err(ErrorCode::AccessLocked.into());
    }
    x.protection.remove(resource);
    info!("resource {:?} unlocked", resource);
    let protection = x.protection.bits();
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(protection);
    });
    Ok(())
}

//----------------------------------------------------------------------------------------------
// Memory access

pub(super) fn cmd_set_mta(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let extension = get_u8(data, 2);
    let address = get_u32(data, 3);
    debug!("set_mta 0x{:08X} ext {}", address, extension);
    // Validity is deferred to first use
    x.mta = Some(Mta::init(address, extension));
    x.send_ok();
    Ok(())
}

pub(super) fn cmd_upload(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let n = get_u8(data, 0) as u32;
    let mut mta = x.mta_for_read()?;

    if n + 1 <= x.config.max_cto as u32 {
        let mut tmp = [0u8; 256];
        mta.read(&mut x.spaces, &mut tmp[..n as usize]).map_err(CmdError::from)?;
        x.mta = Some(mta);
        x.reply(|b| {
            b.append_u8(PID_RES);
            b.append_slice(&tmp[..n as usize]);
        });
    } else {
        // Block mode: a continuation worker emits one CTO sized slice per tick,
        // while registered the main loop runs it instead of new command intake
        if x.worker != PendingWorker::None {
            return Err(ErrorCode::CmdBusy.into());
        }
        trace!("upload of {} bytes deferred to worker", n);
        x.worker = PendingWorker::Upload { remaining: n };
    }
    Ok(())
}

pub(super) fn cmd_short_upload(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let n = get_u8(data, 0) as usize;
    if n == 0 || n + 1 > x.config.max_cto as usize {
        return Err(ErrorCode::OutOfRange.into());
    }
    let extension = get_u8(data, 2);
    let address = get_u32(data, 3);
    let mut mta = Mta::init(address, extension);
    if !mta.can_read() {
        return Err(ErrorCode::AccessDenied.into());
    }
    let mut tmp = [0u8; 256];
    mta.read(&mut x.spaces, &mut tmp[..n]).map_err(CmdError::from)?;
    x.mta = Some(mta);
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_slice(&tmp[..n]);
    });
    Ok(())
}

pub(super) fn cmd_build_checksum(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let block_size = get_u32(data, 3);
    if block_size == 0 {
        return Err(ErrorCode::OutOfRange.into());
    }
    let mut mta = x.mta_for_read()?;

    // ADD_11 is the only implemented algorithm: additive 8 bit sum over the block
    let mut sum: u8 = 0;
    let mut remaining = block_size as usize;
    let mut tmp = [0u8; 256];
    while remaining > 0 {
        let chunk = remaining.min(tmp.len());
        mta.read(&mut x.spaces, &mut tmp[..chunk]).map_err(CmdError::from)?;
        for v in &tmp[..chunk] {
            sum = sum.wrapping_add(*v);
        }
        remaining -= chunk;
    }
    x.mta = Some(mta);

    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(CHECKSUM_TYPE_ADD_11);
        b.append_u16(0); // Reserved
        b.append_u32(sum as u32);
    });
    Ok(())
}

//----------------------------------------------------------------------------------------------
// Pass through commands

pub(super) fn cmd_transport_layer(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let Some(handler) = x.cb.transport_cmd.as_mut() else {
        return Err(ErrorCode::CmdUnknown.into());
    };
    match handler(data) {
        Ok(()) => {
            x.send_ok();
            Ok(())
        }
        Err(code) => Err(code.into()),
    }
}

pub(super) fn cmd_user(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let Some(handler) = x.cb.user_cmd.as_mut() else {
        return Err(ErrorCode::CmdUnknown.into());
    };
    match handler(data) {
        Ok(()) => {
            x.send_ok();
            Ok(())
        }
        Err(code) => Err(code.into()),
    }
}
