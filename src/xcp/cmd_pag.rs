//----------------------------------------------------------------------------------------------
// Module cmd_pag
// Calibration page switching: mode bits select whether the ECU side and/or the XCP
// side page pointer is updated, mode bit 0x80 broadcasts to all segments

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::codec::get_u8;
use crate::protocol::*;

use super::{CmdResult, XcpSlave, CAL_PAGE_MODE_ALL, CAL_PAGE_MODE_ECU, CAL_PAGE_MODE_XCP};

pub(super) fn cmd_set_cal_page(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let mode = get_u8(data, 0);
    let segment = get_u8(data, 1) as usize;
    let page = get_u8(data, 2);

    if mode & (CAL_PAGE_MODE_ECU | CAL_PAGE_MODE_XCP) == 0 {
        return Err(ErrorCode::ModeNotValid.into());
    }

    if mode & CAL_PAGE_MODE_ALL != 0 {
        if x.segments.iter().any(|s| page >= s.max_page) {
            return Err(ErrorCode::PageNotValid.into());
        }
        for s in x.segments.iter_mut() {
            if mode & CAL_PAGE_MODE_ECU != 0 {
                s.page_ecu = page;
            }
            if mode & CAL_PAGE_MODE_XCP != 0 {
                s.page_xcp = page;
            }
        }
    } else {
        let Some(s) = x.segments.get_mut(segment) else {
            return Err(ErrorCode::SegmentNotValid.into());
        };
        if page >= s.max_page {
            return Err(ErrorCode::PageNotValid.into());
        }
        if mode & CAL_PAGE_MODE_ECU != 0 {
            s.page_ecu = page;
        }
        if mode & CAL_PAGE_MODE_XCP != 0 {
            s.page_xcp = page;
        }
    }
    debug!("set_cal_page: mode {:02X}, segment {}, page {}", mode, segment, page);
    x.send_ok();
    Ok(())
}

pub(super) fn cmd_get_cal_page(x: &mut XcpSlave, data: &[u8]) -> CmdResult {
    let mode = get_u8(data, 0);
    let segment = get_u8(data, 1) as usize;

    let Some(s) = x.segments.get(segment) else {
        return Err(ErrorCode::SegmentNotValid.into());
    };
    let page = match mode {
        CAL_PAGE_MODE_ECU => s.page_ecu,
        CAL_PAGE_MODE_XCP => s.page_xcp,
        _ => return Err(ErrorCode::ModeNotValid.into()),
    };
    x.reply(|b| {
        b.append_u8(PID_RES);
        b.append_u8(0); // Reserved
        b.append_u8(0); // Reserved
        b.append_u8(page);
    });
    Ok(())
}
