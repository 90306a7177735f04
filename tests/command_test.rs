// command_test
// Integration tests for session control, identification, protection and error behavior
// Driven end-to-end through rx_indication and the main schedule loop

use xcp_slave::*;

use test_util::*;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

//-----------------------------------------------------------------------------
// Session

#[test]
fn test_connect_response_layout() {
    let mut h = harness(default_config());
    let res = h.cmd1(&[0xFF, 0x00]);
    assert_eq!(res.len(), 8);
    assert_eq!(res[0], 0xFF); // Positive response
    assert_eq!(res[1], 0x0D); // CAL_PAG | DAQ | STIM
    assert_eq!(res[2], 0x40); // Little-endian byte order, slave block mode
    assert_eq!(res[3], 8); // Max CTO
    assert_eq!(u16::from_le_bytes([res[4], res[5]]), 32); // Max DTO
    assert_eq!(res[6], 0x10); // Protocol layer version
    assert_eq!(res[7], 0x10); // Transport layer version
    assert!(h.slave.is_connected());
}

#[test]
fn test_connect_bad_mode_rejected() {
    let mut h = harness(default_config());
    let res = h.cmd1(&[0xFF, 0x01]);
    assert_eq!(res, vec![0xFE, 0x20]); // ERR_CMD_UNKNOWN
    assert!(!h.slave.is_connected());
}

#[test]
fn test_commands_before_connect_silently_discarded() {
    let mut h = harness(default_config());
    // GET_STATUS, SET_MTA, an unknown pid: no response at all without a session
    assert!(h.cmd(&[0xFD]).is_empty());
    assert!(h.cmd(&[0xF6, 0, 0, 0, 0, 0x10, 0, 0]).is_empty());
    assert!(h.cmd(&[0xC8]).is_empty());
}

#[test]
fn test_disconnect() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xFE]);
    assert_eq!(res, vec![0xFF]);
    assert!(!h.slave.is_connected());
    // Back to silent discard
    assert!(h.cmd(&[0xFD]).is_empty());
}

#[test]
fn test_get_status() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xFD]);
    assert_eq!(res.len(), 6);
    assert_eq!(res[0], 0xFF);
    assert_eq!(res[1], 0x00); // No DAQ running, no resume
    assert_eq!(res[2], 0x00); // Nothing locked
}

#[test]
fn test_synch_answers_err_cmd_synch() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xFC]);
    assert_eq!(res, vec![0xFE, 0x00]);
}

#[test]
fn test_unknown_command() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xC8]); // PROGRAM_VERIFY, not in the table
    assert_eq!(res, vec![0xFE, 0x20]);
}

#[test]
fn test_get_comm_mode_info() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xFB]);
    assert_eq!(res.len(), 8);
    assert_eq!(res[0], 0xFF);
    assert_eq!(res[2], 0x00); // No optional comm modes
    assert_eq!(res[6], 16); // Queue size
}

#[test]
fn test_get_id_and_upload_identity() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xFA, 0x00]);
    assert_eq!(res.len(), 8);
    assert_eq!(res[0], 0xFF);
    let len = u32::from_le_bytes([res[4], res[5], res[6], res[7]]);
    assert_eq!(len, 6); // "XCPSIM"

    // The identity is transferred by upload through the staged MTA
    let res = h.cmd1(&[0xF5, 6]);
    assert_eq!(res[0], 0xFF);
    assert_eq!(&res[1..], b"XCPSIM");
}

#[test]
fn test_get_id_bad_mode() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xFA, 0x05]);
    assert_eq!(res, vec![0xFE, 0x22]); // ERR_OUT_OF_RANGE
}

//-----------------------------------------------------------------------------
// Batch abort on truncated packets

#[test]
fn test_short_packet_aborts_receive_batch() {
    let mut h = harness(default_config());
    h.connect();
    // A truncated SET_MTA followed by a valid GET_STATUS in the same batch:
    // processing stops at the truncated packet for this tick
    h.slave.rx_indication(&[0xF6, 0, 0]);
    h.slave.rx_indication(&[0xFD]);
    h.slave.main_function();
    assert!(h.tp.take().is_empty());

    // The rest of the batch is picked up on the next tick
    let frames = h.tick();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][0], 0xFF);
}

//-----------------------------------------------------------------------------
// Resource protection, seed and key

fn protected_config() -> XcpConfig {
    XcpConfig {
        resource_protect: Resource::CAL_PAG,
        ..default_config()
    }
}

fn protected_harness() -> Harness {
    harness_with(protected_config(), |cb| {
        cb.seed = Some(Box::new(|_res| vec![0x11, 0x22, 0x33, 0x44]));
        // The key must be the bitwise inverted seed
        cb.unlock = Some(Box::new(|_res, seed, key| {
            key.len() == seed.len() && seed.iter().zip(key).all(|(s, k)| *k == !*s)
        }));
    })
}

#[test]
fn test_locked_resource_rejects_command() {
    let mut h = protected_harness();
    h.connect();
    // DOWNLOAD requires CAL_PAG
    let res = h.cmd1(&[0xF0, 1, 0xAA]);
    assert_eq!(res, vec![0xFE, 0x25]); // ERR_ACCESS_LOCKED
}

#[test]
fn test_seed_and_key_unlock() {
    let mut h = protected_harness();
    h.connect();

    // GET_SEED mode 0 for CAL_PAG
    let res = h.cmd1(&[0xF8, 0x00, 0x01]);
    assert_eq!(res[0], 0xFF);
    assert_eq!(res[1], 4); // Seed length
    assert_eq!(&res[2..], &[0x11, 0x22, 0x33, 0x44]);

    // UNLOCK with the inverted seed
    let res = h.cmd1(&[0xF7, 4, 0xEE, 0xDD, 0xCC, 0xBB]);
    assert_eq!(res[0], 0xFF);
    assert_eq!(res[1], 0x00); // Nothing locked anymore
    assert_eq!(h.slave.protection(), Resource::empty());

    // The previously locked command goes through now
    h.set_mta(RAM_BASE, 0);
    let res = h.cmd1(&[0xF0, 1, 0xAA]);
    assert_eq!(res, vec![0xFF]);
}

#[test]
fn test_unlock_with_wrong_key() {
    let mut h = protected_harness();
    h.connect();
    let res = h.cmd1(&[0xF8, 0x00, 0x01]);
    assert_eq!(res[0], 0xFF);
    let res = h.cmd1(&[0xF7, 4, 0, 0, 0, 0]);
    assert_eq!(res, vec![0xFE, 0x25]);
    assert_eq!(h.slave.protection(), Resource::CAL_PAG);
}

#[test]
fn test_unlock_before_get_seed_is_sequence_error() {
    let mut h = protected_harness();
    h.connect();
    let res = h.cmd1(&[0xF7, 4, 1, 2, 3, 4]);
    assert_eq!(res, vec![0xFE, 0x29]); // ERR_SEQUENCE
}

#[test]
fn test_get_seed_for_unprotected_resource() {
    let mut h = protected_harness();
    h.connect();
    // DAQ is not locked, the seed length is zero
    let res = h.cmd1(&[0xF8, 0x00, 0x04]);
    assert_eq!(res, vec![0xFF, 0x00]);
}

#[test]
fn test_connect_restores_protection() {
    let mut h = protected_harness();
    h.connect();
    let res = h.cmd1(&[0xF8, 0x00, 0x01]);
    assert_eq!(res[0], 0xFF);
    let res = h.cmd1(&[0xF7, 4, 0xEE, 0xDD, 0xCC, 0xBB]);
    assert_eq!(res[0], 0xFF);
    assert_eq!(h.slave.protection(), Resource::empty());

    // A fresh connection resets the protection mask to its configured initial value
    h.connect();
    assert_eq!(h.slave.protection(), Resource::CAL_PAG);
}

//-----------------------------------------------------------------------------
// User and transport layer commands

#[test]
fn test_user_cmd_dispatched() {
    let mut h = harness_with(default_config(), |cb| {
        cb.user_cmd = Some(Box::new(|data| if data.first() == Some(&0x42) { Ok(()) } else { Err(ErrorCode::OutOfRange) }));
    });
    h.connect();
    assert_eq!(h.cmd1(&[0xF1, 0x42]), vec![0xFF]);
    assert_eq!(h.cmd1(&[0xF1, 0x43]), vec![0xFE, 0x22]);
}

#[test]
fn test_user_cmd_without_callback() {
    let mut h = harness(default_config());
    h.connect();
    assert_eq!(h.cmd1(&[0xF1, 0x42]), vec![0xFE, 0x20]);
}

//-----------------------------------------------------------------------------
// Transmit retry

#[test]
fn test_failed_transmit_is_retried_in_order() {
    let mut h = harness(default_config());
    h.connect();

    h.tp.set_down(true);
    // Two commands in one batch, both responses stay queued while the transport is down
    h.slave.rx_indication(&[0xFD]);
    h.slave.rx_indication(&[0xFB]);
    h.slave.main_function();
    assert_eq!(h.tp.frame_count(), 0);

    h.tp.set_down(false);
    let frames = h.tick();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].len(), 6); // GET_STATUS response first, order preserved
    assert_eq!(frames[1].len(), 8); // GET_COMM_MODE_INFO response
}
