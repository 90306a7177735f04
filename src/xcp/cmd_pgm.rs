//----------------------------------------------------------------------------------------------
// Module cmd_pgm
// Flash programming is an external collaborator behind the MTA abstraction, the
// programming command group is explicitly rejected

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::protocol::ErrorCode;

use super::{CmdResult, XcpSlave};

pub(super) fn cmd_program_start(_x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    debug!("program_start not implemented");
    Err(ErrorCode::CmdUnknown.into())
}

pub(super) fn cmd_program_clear(_x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    debug!("program_clear not implemented");
    Err(ErrorCode::CmdUnknown.into())
}

pub(super) fn cmd_program(_x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    debug!("program not implemented");
    Err(ErrorCode::CmdUnknown.into())
}

pub(super) fn cmd_program_reset(_x: &mut XcpSlave, _data: &[u8]) -> CmdResult {
    debug!("program_reset not implemented");
    Err(ErrorCode::CmdUnknown.into())
}
