// daq_test
// Integration tests for the DAQ/STIM engine: dynamic list configuration, the
// SET_DAQ_PTR/WRITE_DAQ cursor, start/stop, sampling to DTO packets, prescaler,
// stimulation and the configuration info queries

use xcp_slave::daq::{DaqList, DaqListProperties, EventChannel, EventChannelProperties, Odt, OdtEntry};
use xcp_slave::*;

use test_util::*;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

//-----------------------------------------------------------------------------
// Helpers

fn le16(v: u16) -> [u8; 2] {
    v.to_le_bytes()
}

/// Build one dynamic list with a single ODT holding the given entries
fn configure_list(h: &mut Harness, entries: &[(u32, u8)]) {
    assert_eq!(h.cmd1(&[0xD6]), vec![0xFF]); // FREE_DAQ
    assert_eq!(h.cmd1(&[0xD5, 0, 1, 0]), vec![0xFF]); // ALLOC_DAQ 1
    assert_eq!(h.cmd1(&[0xD4, 0, 0, 0, 1]), vec![0xFF]); // ALLOC_ODT 1
    assert_eq!(h.cmd1(&[0xD3, 0, 0, 0, 0, entries.len() as u8]), vec![0xFF]); // ALLOC_ODT_ENTRY
    assert_eq!(h.cmd1(&[0xE2, 0, 0, 0, 0, 0]), vec![0xFF]); // SET_DAQ_PTR to entry 0
    for (addr, size) in entries {
        let a = addr.to_le_bytes();
        assert_eq!(h.cmd1(&[0xE1, 0xFF, *size, 0, a[0], a[1], a[2], a[3]]), vec![0xFF]); // WRITE_DAQ
    }
}

fn set_list_mode(h: &mut Harness, mode: u8, event: u16, prescaler: u8) -> Vec<u8> {
    let e = le16(event);
    h.cmd1(&[0xE0, mode, 0, 0, e[0], e[1], prescaler, 0])
}

fn start_list(h: &mut Harness) -> Vec<Vec<u8>> {
    h.cmd(&[0xDE, 1, 0, 0])
}

//-----------------------------------------------------------------------------
// Configuration and lifecycle

#[test]
fn test_dynamic_configuration_and_sampling() {
    let mut h = harness(default_config());
    h.connect();

    configure_list(&mut h, &[(RAM_BASE, 2), (RAM_BASE + 0x10, 2)]);
    assert_eq!(set_list_mode(&mut h, 0x00, 0, 1), vec![0xFF]);

    // Start: the response carries the first PID, the same tick already samples
    let frames = start_list(&mut h);
    assert_eq!(frames[0], vec![0xFF, 0x00]);
    assert_eq!(frames.len(), 2);
    let dto = &frames[1];
    assert_eq!(
        dto.as_slice(),
        &[
            0x00, // Absolute ODT PID
            Harness::pattern(0),
            Harness::pattern(1),
            Harness::pattern(0x10),
            Harness::pattern(0x11),
        ]
    );

    // Every following tick produces exactly one DTO for the single ODT
    let frames = h.tick();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][0], 0x00);
}

#[test]
fn test_stop_ends_sampling() {
    let mut h = harness(default_config());
    h.connect();
    configure_list(&mut h, &[(RAM_BASE, 2)]);
    assert_eq!(set_list_mode(&mut h, 0x00, 0, 1), vec![0xFF]);
    start_list(&mut h);
    assert_eq!(h.tick().len(), 1);

    // STOP removes the list from active sampling without detaching it
    let frames = h.cmd(&[0xDE, 0, 0, 0]);
    assert_eq!(frames[0], vec![0xFF, 0x00]);
    assert!(h.tick().is_empty());
    assert!(h.tick().is_empty());

    // Restart works without reattaching
    start_list(&mut h);
    assert_eq!(h.tick().len(), 1);
}

#[test]
fn test_prescaler_divides_sampling() {
    let mut h = harness(default_config());
    h.connect();
    configure_list(&mut h, &[(RAM_BASE, 2)]);
    assert_eq!(set_list_mode(&mut h, 0x00, 0, 2), vec![0xFF]);
    start_list(&mut h);

    // With prescaler 2, four channel ticks produce exactly two DTOs
    let mut dtos = 0;
    for _ in 0..4 {
        dtos += h.tick().len();
    }
    assert_eq!(dtos, 2);
}

#[test]
fn test_clear_daq_list_lifecycle() {
    let mut h = harness(default_config());
    h.connect();
    configure_list(&mut h, &[(RAM_BASE, 2)]);
    assert_eq!(set_list_mode(&mut h, 0x00, 0, 1), vec![0xFF]);
    start_list(&mut h);

    // Clearing a running list is rejected
    let res = h.cmd(&[0xE3, 0, 0, 0]);
    assert_eq!(res[0], vec![0xFE, 0x11]); // ERR_DAQ_ACTIVE

    // Stop, then clear succeeds
    h.cmd(&[0xDE, 0, 0, 0]);
    let res = h.cmd1(&[0xE3, 0, 0, 0]);
    assert_eq!(res, vec![0xFF]);

    // All entries read back empty and the list produces no DTOs when restarted
    assert_eq!(h.cmd1(&[0xE2, 0, 0, 0, 0, 0]), vec![0xFF]);
    let res = h.cmd1(&[0xDB]);
    assert_eq!(res, vec![0xFF, 0xFF, 0, 0, 0, 0, 0, 0]);

    start_list(&mut h);
    assert!(h.tick().is_empty());
}

#[test]
fn test_read_daq_returns_written_entry() {
    let mut h = harness(default_config());
    h.connect();
    configure_list(&mut h, &[(RAM_BASE + 4, 3)]);

    assert_eq!(h.cmd1(&[0xE2, 0, 0, 0, 0, 0]), vec![0xFF]);
    let res = h.cmd1(&[0xDB]);
    let a = (RAM_BASE + 4).to_le_bytes();
    assert_eq!(res, vec![0xFF, 0xFF, 3, 0, a[0], a[1], a[2], a[3]]);

    // The cursor auto-advanced past the last entry, the next READ_DAQ fails
    let res = h.cmd1(&[0xDB]);
    assert_eq!(res, vec![0xFE, 0x2A]); // ERR_DAQ_CONFIG
}

#[test]
fn test_alloc_sequence_violation() {
    let mut h = harness(default_config());
    h.connect();
    // ALLOC_ODT without FREE_DAQ/ALLOC_DAQ resets the sequence state
    assert_eq!(h.cmd1(&[0xD4, 0, 0, 0, 1]), vec![0xFE, 0x29]);
    // ALLOC_DAQ is now equally out of sequence
    assert_eq!(h.cmd1(&[0xD5, 0, 1, 0]), vec![0xFE, 0x29]);
    // The full sequence from FREE_DAQ works
    assert_eq!(h.cmd1(&[0xD6]), vec![0xFF]);
    assert_eq!(h.cmd1(&[0xD5, 0, 1, 0]), vec![0xFF]);
}

#[test]
fn test_alloc_overflow_reports_memory_overflow() {
    let mut h = harness(default_config());
    h.connect();
    assert_eq!(h.cmd1(&[0xD6]), vec![0xFF]);
    // The configuration caps the table at 8 lists
    assert_eq!(h.cmd1(&[0xD5, 0, 9, 0]), vec![0xFE, 0x30]);
}

//-----------------------------------------------------------------------------
// Mode validation

#[test]
fn test_set_daq_list_mode_validation() {
    let mut h = harness(default_config());
    h.connect();
    configure_list(&mut h, &[(RAM_BASE, 2)]);

    // Nonzero priority is unsupported
    assert_eq!(h.cmd1(&[0xE0, 0x00, 0, 0, 0, 0, 1, 5]), vec![0xFE, 0x22]);
    // Prescaler is 1 based
    assert_eq!(h.cmd1(&[0xE0, 0x00, 0, 0, 0, 0, 0, 0]), vec![0xFE, 0x22]);
    // Timestamps are not configured
    assert_eq!(h.cmd1(&[0xE0, 0x10, 0, 0, 0, 0, 1, 0]), vec![0xFE, 0x27]);
    // Unknown event channel
    assert_eq!(h.cmd1(&[0xE0, 0x00, 0, 0, 9, 0, 1, 0]), vec![0xFE, 0x22]);
}

#[test]
fn test_stim_direction_needs_channel_capability() {
    let mut config = default_config();
    config.event_channels.push(EventChannel::new(1, "daq_only", 4, EventChannelProperties::DAQ));
    let mut h = harness(config);
    h.connect();
    configure_list(&mut h, &[(RAM_BASE, 2)]);

    // Channel 1 cannot stimulate
    assert_eq!(set_list_mode(&mut h, 0x02, 1, 1), vec![0xFE, 0x27]);
    // Channel 0 can
    assert_eq!(set_list_mode(&mut h, 0x02, 0, 1), vec![0xFF]);
}

#[test]
fn test_predefined_list_is_write_protected() {
    let mut config = default_config();
    config.event_channels.push(EventChannel::new(1, "second", 4, EventChannelProperties::DAQ | EventChannelProperties::STIM));
    config.predefined_lists = vec![DaqList::predefined(
        0,
        vec![Odt::with_entries(vec![OdtEntry::new(RAM_BASE, 0, 2)])],
        DaqListProperties::DAQ,
        None,
    )];
    let mut h = harness(config);
    h.connect();

    // Entries of a predefined list cannot be rewritten
    assert_eq!(h.cmd1(&[0xE2, 0, 0, 0, 0, 0]), vec![0xFF]);
    let a = RAM_BASE.to_le_bytes();
    assert_eq!(h.cmd1(&[0xE1, 0xFF, 2, 0, a[0], a[1], a[2], a[3]]), vec![0xFE, 0x23]);

    // Attaching to a first channel is allowed, moving it afterwards is not
    assert_eq!(set_list_mode(&mut h, 0x00, 0, 1), vec![0xFF]);
    assert_eq!(set_list_mode(&mut h, 0x00, 1, 1), vec![0xFE, 0x23]);
}

//-----------------------------------------------------------------------------
// Stimulation

#[test]
fn test_stimulation_end_to_end() {
    let mut h = harness(default_config());
    h.connect();
    configure_list(&mut h, &[(RAM_BASE + 0x40, 2), (RAM_BASE + 0x50, 2)]);
    assert_eq!(set_list_mode(&mut h, 0x02, 0, 1), vec![0xFF]);
    start_list(&mut h);

    // Inbound stimulation data for ODT 0: acknowledged, applied on the same tick
    let frames = h.cmd(&[0x00, 0xA1, 0xA2, 0xB1, 0xB2]);
    assert_eq!(frames[0], vec![0xFF]);

    let a = (RAM_BASE + 0x40).to_le_bytes();
    let res = h.cmd1(&[0xF4, 2, 0, 0, a[0], a[1], a[2], a[3]]);
    assert_eq!(res, vec![0xFF, 0xA1, 0xA2]);
    let a = (RAM_BASE + 0x50).to_le_bytes();
    let res = h.cmd1(&[0xF4, 2, 0, 0, a[0], a[1], a[2], a[3]]);
    assert_eq!(res, vec![0xFF, 0xB1, 0xB2]);
}

#[test]
fn test_stimulation_locked_by_protection() {
    let mut config = default_config();
    config.resource_protect = Resource::STIM;
    let mut h = harness(config);
    h.connect();
    configure_list(&mut h, &[(RAM_BASE + 0x60, 2)]);
    assert_eq!(set_list_mode(&mut h, 0x02, 0, 1), vec![0xFF]);
    start_list(&mut h);

    let frames = h.cmd(&[0x00, 0xA1, 0xA2]);
    assert_eq!(frames[0], vec![0xFE, 0x25]); // ERR_ACCESS_LOCKED

    // Memory untouched
    let a = (RAM_BASE + 0x60).to_le_bytes();
    let res = h.cmd1(&[0xF4, 1, 0, 0, a[0], a[1], a[2], a[3]]);
    assert_eq!(res, vec![0xFF, Harness::pattern(0x60)]);
}

//-----------------------------------------------------------------------------
// Timestamps

#[test]
fn test_timestamped_dto() {
    let mut config = default_config();
    config.timestamp_size = 4;
    let mut h = harness_with(config, |cb| {
        cb.clock = Some(Box::new(|| 0xA1B2C3D4));
    });
    h.connect();
    configure_list(&mut h, &[(RAM_BASE, 2)]);
    // Timestamped DAQ mode
    assert_eq!(set_list_mode(&mut h, 0x10, 0, 1), vec![0xFF]);
    start_list(&mut h);

    let frames = h.tick();
    assert_eq!(frames.len(), 1);
    let dto = &frames[0];
    assert_eq!(dto[0], 0x00); // PID
    assert_eq!(u32::from_le_bytes([dto[1], dto[2], dto[3], dto[4]]), 0xA1B2C3D4);
    assert_eq!(&dto[5..], &[Harness::pattern(0), Harness::pattern(1)]);
}

//-----------------------------------------------------------------------------
// Info queries

#[test]
fn test_get_daq_processor_info() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xDA]);
    assert_eq!(res.len(), 8);
    assert_eq!(res[0], 0xFF);
    assert_eq!(res[1] & 0x01, 0x01); // Dynamic configuration supported
    assert_eq!(u16::from_le_bytes([res[2], res[3]]), 8); // Max DAQ
    assert_eq!(u16::from_le_bytes([res[4], res[5]]), 1); // Max event channels
    assert_eq!(res[6], 0); // Min DAQ
    assert_eq!(res[7] >> 6, 0); // Absolute identification
}

#[test]
fn test_get_daq_resolution_info() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xD9]);
    assert_eq!(res.len(), 8);
    assert_eq!(res[1], 1); // DAQ granularity
    assert_eq!(res[3], 1); // STIM granularity
    assert_eq!(res[5] & 0x07, 0); // No timestamp
}

#[test]
fn test_get_daq_list_mode_reflects_configuration() {
    let mut h = harness(default_config());
    h.connect();
    configure_list(&mut h, &[(RAM_BASE, 2)]);
    assert_eq!(set_list_mode(&mut h, 0x00, 0, 3), vec![0xFF]);

    let res = h.cmd1(&[0xDF, 0, 0, 0]);
    assert_eq!(res.len(), 8);
    assert_eq!(res[0], 0xFF);
    assert_eq!(res[1], 0x00); // Mode
    assert_eq!(u16::from_le_bytes([res[4], res[5]]), 0); // Event channel
    assert_eq!(res[6], 3); // Prescaler
}

#[test]
fn test_get_daq_event_info() {
    let mut h = harness(default_config());
    h.connect();
    let res = h.cmd1(&[0xD7, 0, 0, 0]);
    assert_eq!(res.len(), 7);
    assert_eq!(res[0], 0xFF);
    assert_eq!(res[1], 0x0C); // DAQ and STIM capable
    assert_eq!(res[2], 4); // Max attachable lists
    assert_eq!(res[3], 10); // Name length of "cycle_10ms"

    // The name is transferred by upload through the staged MTA
    let res = h.cmd1(&[0xF5, 7]);
    assert_eq!(&res[1..], b"cycle_1");
}

#[test]
fn test_get_daq_list_info() {
    let mut h = harness(default_config());
    h.connect();
    configure_list(&mut h, &[(RAM_BASE, 2)]);
    let res = h.cmd1(&[0xD8, 0, 0, 0]);
    assert_eq!(res.len(), 6);
    assert_eq!(res[0], 0xFF);
    assert_eq!(res[1], 0x0C); // DAQ and STIM capable, not predefined
    assert_eq!(u16::from_le_bytes([res[4], res[5]]), 0xFFFF); // No fixed event
}

#[test]
fn test_get_daq_clock() {
    let mut h = harness_with(default_config(), |cb| {
        cb.clock = Some(Box::new(|| 0x01020304));
    });
    h.connect();
    let res = h.cmd1(&[0xDC]);
    assert_eq!(res.len(), 8);
    assert_eq!(u32::from_le_bytes([res[4], res[5], res[6], res[7]]), 0x01020304);
}
