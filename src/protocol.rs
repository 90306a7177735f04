//----------------------------------------------------------------------------------------------
// Module protocol
// XCP wire protocol constants: packet identifiers, command codes, error codes, resource bits

use bitflags::bitflags;

//----------------------------------------------------------------------------------------------
// Response packet identifiers

/// Positive response packet marker
pub const PID_RES: u8 = 0xFF;
/// Error response packet marker, followed by one error code byte
pub const PID_ERR: u8 = 0xFE;
/// Asynchronous event packet marker, followed by one event code byte
pub const PID_EV: u8 = 0xFD;
/// Service request packet marker
pub const PID_SERV: u8 = 0xFC;

//----------------------------------------------------------------------------------------------
// Command codes
// Grouped by function: standard, calibration, paging, DAQ/STIM, programming
// PIDs below CC_FIRST are reserved for inbound STIM data keyed by ODT number

/// Lowest command code; received PIDs below this are inbound STIM data
pub const CC_FIRST: u8 = 0xC0;

// Standard commands
pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_GET_STATUS: u8 = 0xFD;
pub const CC_SYNCH: u8 = 0xFC;
pub const CC_GET_COMM_MODE_INFO: u8 = 0xFB;
pub const CC_GET_ID: u8 = 0xFA;
pub const CC_SET_REQUEST: u8 = 0xF9;
pub const CC_GET_SEED: u8 = 0xF8;
pub const CC_UNLOCK: u8 = 0xF7;
pub const CC_SET_MTA: u8 = 0xF6;
pub const CC_UPLOAD: u8 = 0xF5;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;
pub const CC_BUILD_CHECKSUM: u8 = 0xF3;
pub const CC_TRANSPORT_LAYER_CMD: u8 = 0xF2;
pub const CC_USER_CMD: u8 = 0xF1;

// Calibration commands
pub const CC_DOWNLOAD: u8 = 0xF0;
pub const CC_DOWNLOAD_NEXT: u8 = 0xEF;
pub const CC_DOWNLOAD_MAX: u8 = 0xEE;
pub const CC_SHORT_DOWNLOAD: u8 = 0xED;
pub const CC_MODIFY_BITS: u8 = 0xEC;

// Page switching commands
pub const CC_SET_CAL_PAGE: u8 = 0xEB;
pub const CC_GET_CAL_PAGE: u8 = 0xEA;
pub const CC_GET_PAG_PROCESSOR_INFO: u8 = 0xE9;
pub const CC_GET_SEGMENT_INFO: u8 = 0xE8;
pub const CC_GET_PAGE_INFO: u8 = 0xE7;
pub const CC_SET_SEGMENT_MODE: u8 = 0xE6;
pub const CC_GET_SEGMENT_MODE: u8 = 0xE5;
pub const CC_COPY_CAL_PAGE: u8 = 0xE4;

// Data acquisition and stimulation commands
pub const CC_CLEAR_DAQ_LIST: u8 = 0xE3;
pub const CC_SET_DAQ_PTR: u8 = 0xE2;
pub const CC_WRITE_DAQ: u8 = 0xE1;
pub const CC_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CC_GET_DAQ_LIST_MODE: u8 = 0xDF;
pub const CC_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CC_START_STOP_SYNCH: u8 = 0xDD;
pub const CC_GET_DAQ_CLOCK: u8 = 0xDC;
pub const CC_READ_DAQ: u8 = 0xDB;
pub const CC_GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
pub const CC_GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
pub const CC_GET_DAQ_LIST_INFO: u8 = 0xD8;
pub const CC_GET_DAQ_EVENT_INFO: u8 = 0xD7;
pub const CC_FREE_DAQ: u8 = 0xD6;
pub const CC_ALLOC_DAQ: u8 = 0xD5;
pub const CC_ALLOC_ODT: u8 = 0xD4;
pub const CC_ALLOC_ODT_ENTRY: u8 = 0xD3;

// Non-volatile memory programming commands
pub const CC_PROGRAM_START: u8 = 0xD2;
pub const CC_PROGRAM_CLEAR: u8 = 0xD1;
pub const CC_PROGRAM: u8 = 0xD0;
pub const CC_PROGRAM_RESET: u8 = 0xCF;

//----------------------------------------------------------------------------------------------
// Error codes

/// Wire error codes carried in ERR packets
/// These are protocol responses, not crate errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Command processor synchronization response to SYNCH
    CmdSynch = 0x00,
    /// Command was performed but another one is still pending
    CmdBusy = 0x10,
    /// Command rejected because DAQ is running
    DaqActive = 0x11,
    /// Command rejected because programming is active
    PgmActive = 0x12,
    /// Unknown or unsupported command
    CmdUnknown = 0x20,
    /// Command syntax invalid
    CmdSyntax = 0x21,
    /// Parameter out of range
    OutOfRange = 0x22,
    /// Write attempt to a read only resource
    WriteProtected = 0x23,
    /// Access to the requested object denied
    AccessDenied = 0x24,
    /// Resource is protected, seed and key required
    AccessLocked = 0x25,
    /// Requested page is not available
    PageNotValid = 0x26,
    /// Requested mode is not available
    ModeNotValid = 0x27,
    /// Requested segment is not valid
    SegmentNotValid = 0x28,
    /// Sequencing error on a multi packet transfer
    Sequence = 0x29,
    /// DAQ configuration is not valid
    DaqConfig = 0x2A,
    /// Memory overflow during dynamic DAQ allocation
    MemoryOverflow = 0x30,
    /// Generic error
    Generic = 0x31,
    /// The slave internal program verify routine detected an error
    Verify = 0x32,
}

//----------------------------------------------------------------------------------------------
// Event codes

/// Session terminated by the slave
pub const EV_SESSION_TERMINATED: u8 = 0x07;

//----------------------------------------------------------------------------------------------
// Resource protection bits
// Used in the CONNECT response, GET_STATUS response, GET_SEED/UNLOCK and the command table

bitflags! {
    /// Resource classes subject to seed and key protection
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Resource: u8 {
        /// Calibration and paging
        const CAL_PAG = 0x01;
        /// Data acquisition
        const DAQ     = 0x04;
        /// Stimulation
        const STIM    = 0x08;
        /// Flash programming
        const PGM     = 0x10;
    }
}

bitflags! {
    /// Session status byte reported by GET_STATUS
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionStatus: u8 {
        const STORE_CAL_REQ = 0x01;
        const STORE_DAQ_REQ = 0x04;
        const CLEAR_DAQ_REQ = 0x08;
        const DAQ_RUNNING   = 0x40;
        const RESUME        = 0x80;
    }
}

//----------------------------------------------------------------------------------------------
// CONNECT response COMM_MODE_BASIC bits

/// Multi byte values are transferred in Motorola format (never set, little-endian only)
pub const COMM_MODE_BASIC_BYTE_ORDER_MOTOROLA: u8 = 0x01;
/// Slave block mode transfers available
pub const COMM_MODE_BASIC_SLAVE_BLOCK_MODE: u8 = 0x40;

/// Protocol layer version reported in the CONNECT response
pub const PROTOCOL_MAJOR_VERSION: u8 = 1;
/// Transport layer version reported in the CONNECT response
pub const TRANSPORT_MAJOR_VERSION: u8 = 1;

//----------------------------------------------------------------------------------------------
// Checksum types

/// Additive checksum over bytes, result in a byte (the only implemented algorithm)
pub const CHECKSUM_TYPE_ADD_11: u8 = 0x01;

//----------------------------------------------------------------------------------------------
// DTO identification field

/// Layout of the identification field leading every DTO packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentificationMode {
    /// One byte absolute ODT number
    Absolute,
    /// Relative ODT number plus one byte DAQ list number
    RelativeByte,
    /// Relative ODT number plus word DAQ list number
    #[default]
    RelativeWord,
    /// Relative ODT number, one alignment fill byte, word DAQ list number
    RelativeWordAligned,
}

impl IdentificationMode {
    /// Total width of the identification field in a DTO packet
    pub fn field_size(self) -> usize {
        match self {
            IdentificationMode::Absolute => 1,
            IdentificationMode::RelativeByte => 2,
            IdentificationMode::RelativeWord => 3,
            IdentificationMode::RelativeWordAligned => 4,
        }
    }

    /// Identification field type code for the DAQ key byte of GET_DAQ_PROCESSOR_INFO
    pub fn key_code(self) -> u8 {
        match self {
            IdentificationMode::Absolute => 0,
            IdentificationMode::RelativeByte => 1,
            IdentificationMode::RelativeWord => 2,
            IdentificationMode::RelativeWordAligned => 3,
        }
    }
}

//----------------------------------------------------------------------------------------------
// Timestamp units

/// Timestamp unit codes as reported by GET_DAQ_RESOLUTION_INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TimestampUnit {
    Ns1 = 0,
    Ns10 = 1,
    Ns100 = 2,
    Us1 = 3,
    Us10 = 4,
    Us100 = 5,
    #[default]
    Ms1 = 6,
    Ms10 = 7,
    Ms100 = 8,
    S1 = 9,
}

//----------------------------------------------------------------------------------------------
//----------------------------------------------------------------------------------------------
// Test module

#[cfg(test)]
mod protocol_tests {

    use super::*;

    #[test]
    fn test_identification_field_size() {
        assert_eq!(IdentificationMode::Absolute.field_size(), 1);
        assert_eq!(IdentificationMode::RelativeByte.field_size(), 2);
        assert_eq!(IdentificationMode::RelativeWord.field_size(), 3);
        assert_eq!(IdentificationMode::RelativeWordAligned.field_size(), 4);
    }

    #[test]
    fn test_resource_bits() {
        let all = Resource::CAL_PAG | Resource::DAQ | Resource::STIM | Resource::PGM;
        assert_eq!(all.bits(), 0x1D);
        assert!(Resource::from_bits(0x04).unwrap() == Resource::DAQ);
    }
}
