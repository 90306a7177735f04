//----------------------------------------------------------------------------------------------
// Module cmd_cal
// Calibration download handlers: single packet and block mode transfers through the MTA
// The declared element count of every continuation must match the remembered remaining
// count, a mismatch is a SEQUENCE error carrying the expected count and leaves the
// transfer state untouched.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::codec::{get_u8, get_u32};
use crate::mta::Mta;
use crate::protocol::ErrorCode;

use super::{CmdError, CmdResult, Transfer, XcpSlave};

pub(super) fn cmd_download(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let n = get_u8(data, 0) as usize;
    let mut mta = x.mta_for_write()?;

    let avail = data.len() - 1;
    if n <= avail {
        // The whole transfer fits this packet
        mta.write(&mut x.spaces, &data[1..1 + n]).map_err(CmdError::from)?;
        mta.flush(&mut x.spaces).map_err(CmdError::from)?;
        x.mta = Some(mta);
        x.transfer = None;
        x.send_ok();
    } else {
        if !x.config.slave_block_mode {
            return Err(ErrorCode::OutOfRange.into());
        }
        // First packet of a block transfer establishes the remaining count,
        // the response is deferred until the last DOWNLOAD_NEXT
        mta.write(&mut x.spaces, &data[1..]).map_err(CmdError::from)?;
        x.mta = Some(mta);
        x.transfer = Some(Transfer {
            remaining: (n - avail) as u32,
        });
        trace!("download: block transfer, {} bytes remaining", n - avail);
    }
    Ok(())
}

pub(super) fn cmd_download_next(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let Some(transfer) = x.transfer else {
        return Err(CmdError::with_info(ErrorCode::Sequence, 0));
    };
    let n = get_u8(data, 0) as u32;
    if n != transfer.remaining {
        // The host is expected to retry the correct continuation, state is kept
        debug!("download_next: declared {} != remaining {}", n, transfer.remaining);
        return Err(CmdError::with_info(ErrorCode::Sequence, transfer.remaining.min(255) as u8));
    }

    let mut mta = x.mta_for_write()?;
    let take = (data.len() - 1).min(n as usize);
    mta.write(&mut x.spaces, &data[1..1 + take]).map_err(CmdError::from)?;

    let remaining = n - take as u32;
    if remaining == 0 {
        mta.flush(&mut x.spaces).map_err(CmdError::from)?;
        x.mta = Some(mta);
        x.transfer = None;
        x.send_ok();
    } else {
        x.mta = Some(mta);
        x.transfer = Some(Transfer { remaining });
    }
    Ok(())
}

pub(super) fn cmd_short_download(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let n = get_u8(data, 0) as usize;
    let extension = get_u8(data, 2);
    let address = get_u32(data, 3);
    if n + 8 > x.config.max_cto as usize || data.len() < 7 + n {
        return Err(ErrorCode::OutOfRange.into());
    }
    let mut mta = Mta::init(address, extension);
    if !mta.can_write() {
        return Err(ErrorCode::AccessDenied.into());
    }
    mta.write(&mut x.spaces, &data[7..7 + n]).map_err(CmdError::from)?;
    mta.flush(&mut x.spaces).map_err(CmdError::from)?;
    x.mta = Some(mta);
    x.send_ok();
    Ok(())
}
