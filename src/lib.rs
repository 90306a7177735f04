//-----------------------------------------------------------------------------
// Crate xcp-slave
// Path: src/lib.rs

//! A transport independent XCP slave protocol layer.
//!
//! The crate implements the slave side protocol state machine: command dispatch,
//! the memory transfer address (MTA) abstraction over pluggable accessors, the
//! DAQ/STIM list engine driven by event channels, and the packet buffer queues
//! between the transport and the processing loop.
//!
//! The integrator owns the scheduling and the wire: received packets are pushed
//! through [`XcpSlave::rx_indication`] (interrupt safe via [`XcpRxHandle`]), the
//! engine is driven by periodic calls to [`XcpSlave::main_function`], and framed
//! response packets are handed back through the injected transmit callback.
//! Target memory, flash and digital I/O attach behind the accessor traits in
//! module [`mta`].

// This crate is a library
#![crate_type = "lib"]
#![crate_name = "xcp_slave"]
//
// Disabled clippy lints
#![allow(dead_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::if_not_else)]
#![allow(clippy::wildcard_imports)]

//-----------------------------------------------------------------------------
// Submodules

// Submodule codec: little-endian wire accessors
pub mod codec;

// Submodule fifo: packet buffer pool and queues
pub mod fifo;

// Submodule mta: memory transfer address and accessor backends
pub mod mta;

// Submodule daq: DAQ list model and sampling engine
pub mod daq;

// Submodule protocol: wire constants
pub mod protocol;

// Submodule xcp: the slave engine
mod xcp;

pub use xcp::xcp_test;
pub use xcp::CalSegment;
pub use xcp::ClockFn;
pub use xcp::SeedFn;
pub use xcp::TransmitFn;
pub use xcp::UnlockFn;
pub use xcp::UserCmdFn;
pub use xcp::XcpCallbacks;
pub use xcp::XcpConfig;
pub use xcp::XcpError;
pub use xcp::XcpRxHandle;
pub use xcp::XcpSlave;
pub use xcp::{CAL_PAGE_MODE_ALL, CAL_PAGE_MODE_ECU, CAL_PAGE_MODE_XCP};

pub use protocol::ErrorCode;
pub use protocol::IdentificationMode;
pub use protocol::Resource;
pub use protocol::TimestampUnit;
