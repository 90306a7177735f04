//----------------------------------------------------------------------------------------------
// Module xcp
// The XCP slave engine: session state, command dispatch, main schedule loop
// All protocol logic runs to completion inside one call to the main loop entry point,
// the only cross context surface are the packet queues (see module fifo)

use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::daq::{self, DaqList, DaqTable, EventChannel, SampleParams};
use crate::fifo::{XcpBuffer, XcpQueues};
use crate::mta::{AddressSpaces, Mta};
use crate::protocol::*;

//-----------------------------------------------------------------------------
// Submodules

// Standard command handlers
mod cmd_std;
// Calibration download handlers
mod cmd_cal;
// Page switching handlers
mod cmd_pag;
// DAQ configuration handlers
mod cmd_daq;
// Programming command stubs
mod cmd_pgm;

//----------------------------------------------------------------------------------------------
// XCP error

use thiserror::Error;

#[derive(Error, Debug)]
pub enum XcpError {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("transport error: `{0}`")]
    Transport(&'static str),

    #[error("configuration error: `{0}`")]
    Config(&'static str),
}

//----------------------------------------------------------------------------------------------
// Command results
// A handler either queues its own response and returns Ok, or returns the wire error
// code to send, optionally with one diagnostic byte (e.g. the expected remaining
// element count of a SEQUENCE error)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CmdError {
    pub code: ErrorCode,
    pub info: Option<u8>,
}

impl CmdError {
    pub fn with_info(code: ErrorCode, info: u8) -> CmdError {
        CmdError { code, info: Some(info) }
    }
}

impl From<ErrorCode> for CmdError {
    fn from(code: ErrorCode) -> CmdError {
        CmdError { code, info: None }
    }
}

pub(crate) type CmdResult = Result<(), CmdError>;

type CmdHandler = fn(&mut XcpSlave, &[u8]) -> CmdResult;

//----------------------------------------------------------------------------------------------
// Command dispatch table
// Indexed by packet identifier: handler, minimum total packet length (including the
// pid byte) and the resource lock that must be open

#[derive(Clone, Copy)]
struct CmdEntry {
    handler: Option<CmdHandler>,
    min_len: u8,
    lock: u8,
}

const NO_CMD: CmdEntry = CmdEntry {
    handler: None,
    min_len: 0,
    lock: 0,
};

const fn cmd(handler: CmdHandler, min_len: u8, lock: u8) -> CmdEntry {
    CmdEntry {
        handler: Some(handler),
        min_len,
        lock,
    }
}

const LOCK_CAL: u8 = Resource::CAL_PAG.bits();
const LOCK_DAQ: u8 = Resource::DAQ.bits();
const LOCK_PGM: u8 = Resource::PGM.bits();

static CMD_TABLE: [CmdEntry; 256] = build_cmd_table();

const fn build_cmd_table() -> [CmdEntry; 256] {
    let mut t = [NO_CMD; 256];

    // Standard commands
    t[CC_CONNECT as usize] = cmd(cmd_std::cmd_connect, 2, 0);
    t[CC_DISCONNECT as usize] = cmd(cmd_std::cmd_disconnect, 1, 0);
    t[CC_GET_STATUS as usize] = cmd(cmd_std::cmd_get_status, 1, 0);
    t[CC_SYNCH as usize] = cmd(cmd_std::cmd_synch, 1, 0);
    t[CC_GET_COMM_MODE_INFO as usize] = cmd(cmd_std::cmd_get_comm_mode_info, 1, 0);
    t[CC_GET_ID as usize] = cmd(cmd_std::cmd_get_id, 2, 0);
    t[CC_GET_SEED as usize] = cmd(cmd_std::cmd_get_seed, 3, 0);
    t[CC_UNLOCK as usize] = cmd(cmd_std::cmd_unlock, 3, 0);
    t[CC_SET_MTA as usize] = cmd(cmd_std::cmd_set_mta, 8, 0);
    t[CC_UPLOAD as usize] = cmd(cmd_std::cmd_upload, 2, LOCK_CAL);
    t[CC_SHORT_UPLOAD as usize] = cmd(cmd_std::cmd_short_upload, 8, LOCK_CAL);
    t[CC_BUILD_CHECKSUM as usize] = cmd(cmd_std::cmd_build_checksum, 8, LOCK_CAL);
    t[CC_TRANSPORT_LAYER_CMD as usize] = cmd(cmd_std::cmd_transport_layer, 2, 0);
    t[CC_USER_CMD as usize] = cmd(cmd_std::cmd_user, 2, 0);

    // Calibration commands
    t[CC_DOWNLOAD as usize] = cmd(cmd_cal::cmd_download, 2, LOCK_CAL);
    t[CC_DOWNLOAD_NEXT as usize] = cmd(cmd_cal::cmd_download_next, 2, LOCK_CAL);
    t[CC_SHORT_DOWNLOAD as usize] = cmd(cmd_cal::cmd_short_download, 8, LOCK_CAL);

    // Page switching commands
    t[CC_SET_CAL_PAGE as usize] = cmd(cmd_pag::cmd_set_cal_page, 4, LOCK_CAL);
    t[CC_GET_CAL_PAGE as usize] = cmd(cmd_pag::cmd_get_cal_page, 3, LOCK_CAL);

    // DAQ and STIM commands
    t[CC_CLEAR_DAQ_LIST as usize] = cmd(cmd_daq::cmd_clear_daq_list, 4, LOCK_DAQ);
    t[CC_SET_DAQ_PTR as usize] = cmd(cmd_daq::cmd_set_daq_ptr, 6, LOCK_DAQ);
    t[CC_WRITE_DAQ as usize] = cmd(cmd_daq::cmd_write_daq, 8, LOCK_DAQ);
    t[CC_SET_DAQ_LIST_MODE as usize] = cmd(cmd_daq::cmd_set_daq_list_mode, 8, LOCK_DAQ);
    t[CC_GET_DAQ_LIST_MODE as usize] = cmd(cmd_daq::cmd_get_daq_list_mode, 4, LOCK_DAQ);
    t[CC_START_STOP_DAQ_LIST as usize] = cmd(cmd_daq::cmd_start_stop_daq_list, 4, LOCK_DAQ);
    t[CC_START_STOP_SYNCH as usize] = cmd(cmd_daq::cmd_start_stop_synch, 2, LOCK_DAQ);
    t[CC_GET_DAQ_CLOCK as usize] = cmd(cmd_daq::cmd_get_daq_clock, 1, 0);
    t[CC_READ_DAQ as usize] = cmd(cmd_daq::cmd_read_daq, 1, LOCK_DAQ);
    t[CC_GET_DAQ_PROCESSOR_INFO as usize] = cmd(cmd_daq::cmd_get_daq_processor_info, 1, 0);
    t[CC_GET_DAQ_RESOLUTION_INFO as usize] = cmd(cmd_daq::cmd_get_daq_resolution_info, 1, 0);
    t[CC_GET_DAQ_LIST_INFO as usize] = cmd(cmd_daq::cmd_get_daq_list_info, 4, LOCK_DAQ);
    t[CC_GET_DAQ_EVENT_INFO as usize] = cmd(cmd_daq::cmd_get_daq_event_info, 4, LOCK_DAQ);
    #[cfg(feature = "dyn_daq")]
    {
        t[CC_FREE_DAQ as usize] = cmd(cmd_daq::cmd_free_daq, 1, LOCK_DAQ);
        t[CC_ALLOC_DAQ as usize] = cmd(cmd_daq::cmd_alloc_daq, 4, LOCK_DAQ);
        t[CC_ALLOC_ODT as usize] = cmd(cmd_daq::cmd_alloc_odt, 5, LOCK_DAQ);
        t[CC_ALLOC_ODT_ENTRY as usize] = cmd(cmd_daq::cmd_alloc_odt_entry, 6, LOCK_DAQ);
    }

    // Programming commands, not supported but explicitly rejected
    t[CC_PROGRAM_START as usize] = cmd(cmd_pgm::cmd_program_start, 1, LOCK_PGM);
    t[CC_PROGRAM_CLEAR as usize] = cmd(cmd_pgm::cmd_program_clear, 1, LOCK_PGM);
    t[CC_PROGRAM as usize] = cmd(cmd_pgm::cmd_program, 1, LOCK_PGM);
    t[CC_PROGRAM_RESET as usize] = cmd(cmd_pgm::cmd_program_reset, 1, LOCK_PGM);

    t
}

//----------------------------------------------------------------------------------------------
// Calibration segment

/// Page state of one calibration memory segment
/// Switching selects which page the ECU and the XCP side see
#[derive(Debug, Clone)]
pub struct CalSegment {
    pub name: &'static str,
    pub max_page: u8,
    pub page_ecu: u8,
    pub page_xcp: u8,
}

impl CalSegment {
    pub fn new(name: &'static str, max_page: u8) -> CalSegment {
        CalSegment {
            name,
            max_page,
            page_ecu: 0,
            page_xcp: 0,
        }
    }
}

/// Page switching mode bits of SET_CAL_PAGE / GET_CAL_PAGE
pub const CAL_PAGE_MODE_ECU: u8 = 0x01;
pub const CAL_PAGE_MODE_XCP: u8 = 0x02;
pub const CAL_PAGE_MODE_ALL: u8 = 0x80;

//----------------------------------------------------------------------------------------------
// Injected callbacks
// The seams where the excluded collaborators attach: transport transmit, seed and key
// trust delegate, vendor specific commands, slave clock

pub type TransmitFn = Box<dyn FnMut(&[u8]) -> Result<(), XcpError> + Send>;
pub type SeedFn = Box<dyn FnMut(Resource) -> Vec<u8> + Send>;
pub type UnlockFn = Box<dyn FnMut(Resource, &[u8], &[u8]) -> bool + Send>;
pub type UserCmdFn = Box<dyn FnMut(&[u8]) -> Result<(), ErrorCode> + Send>;
pub type ClockFn = Box<dyn FnMut() -> u32 + Send>;

pub struct XcpCallbacks {
    pub transmit: TransmitFn,
    pub seed: Option<SeedFn>,
    pub unlock: Option<UnlockFn>,
    pub user_cmd: Option<UserCmdFn>,
    pub transport_cmd: Option<UserCmdFn>,
    pub clock: Option<ClockFn>,
}

impl XcpCallbacks {
    pub fn new(transmit: TransmitFn) -> XcpCallbacks {
        XcpCallbacks {
            transmit,
            seed: None,
            unlock: None,
            user_cmd: None,
            transport_cmd: None,
            clock: None,
        }
    }
}

impl std::fmt::Debug for XcpCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XcpCallbacks")
            .field("seed", &self.seed.is_some())
            .field("unlock", &self.unlock.is_some())
            .field("user_cmd", &self.user_cmd.is_some())
            .field("transport_cmd", &self.transport_cmd.is_some())
            .finish()
    }
}

//----------------------------------------------------------------------------------------------
// Configuration

/// Static configuration of one engine instance, supplied wholesale by the integrator
#[derive(Debug)]
pub struct XcpConfig {
    /// Maximum command transfer object size, 8..=255
    pub max_cto: u8,
    /// Maximum data transfer object size
    pub max_dto: u16,
    /// Number of packet buffers in the shared pool
    pub queue_size: usize,
    /// Upper bound of DAQ lists including the predefined prefix
    pub max_daq: u16,
    /// Upper bound of ODTs per list
    pub max_odt: u8,
    /// Upper bound of entries per ODT
    pub max_odt_entries: u8,
    /// Upper bound of one ODT entry's byte length
    pub max_odt_entry_size: u8,
    /// DTO identification field layout
    pub identification: IdentificationMode,
    /// Timestamp width in DTO packets: 0, 1, 2 or 4
    pub timestamp_size: u8,
    pub timestamp_unit: TimestampUnit,
    /// Timestamp ticks per unit
    pub timestamp_ticks: u16,
    /// Resources reported available in the CONNECT response
    pub resources: Resource,
    /// Protection mask restored on every new connection
    pub resource_protect: Resource,
    /// Identity string served by GET_ID
    pub ident: &'static str,
    /// Report slave block mode in the CONNECT response
    pub slave_block_mode: bool,
    /// Drain more than one transmit frame per tick
    pub fast_transmit: bool,
    /// Predefined DAQ lists, the read only prefix of the table
    pub predefined_lists: Vec<DaqList>,
    /// Event channels, index is the channel number
    pub event_channels: Vec<EventChannel>,
    /// Calibration segments
    pub segments: Vec<CalSegment>,
}

impl Default for XcpConfig {
    fn default() -> XcpConfig {
        XcpConfig {
            max_cto: 8,
            max_dto: 8,
            queue_size: 16,
            max_daq: 8,
            max_odt: 16,
            max_odt_entries: 16,
            max_odt_entry_size: 0xFA,
            identification: IdentificationMode::default(),
            timestamp_size: 0,
            timestamp_unit: TimestampUnit::default(),
            timestamp_ticks: 1,
            resources: Resource::CAL_PAG | Resource::DAQ | Resource::STIM,
            resource_protect: Resource::empty(),
            ident: "XCPSIM",
            slave_block_mode: true,
            fast_transmit: false,
            predefined_lists: Vec::new(),
            event_channels: Vec::new(),
            segments: Vec::new(),
        }
    }
}

//----------------------------------------------------------------------------------------------
// Engine internal state machines

/// Deferred continuation run once per main loop tick instead of command intake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingWorker {
    None,
    /// Block mode upload, emits one CTO sized slice per tick through the MTA
    Upload { remaining: u32 },
}

/// Block mode download progress
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transfer {
    pub remaining: u32,
}

/// Cursor cached by SET_DAQ_PTR, consumed and advanced by WRITE_DAQ / READ_DAQ
#[derive(Debug, Clone, Copy)]
pub(crate) struct DaqPtr {
    pub daq: u16,
    pub odt: u8,
    pub entry: u8,
}

/// Configuration sequence state of the dynamic DAQ allocation commands
#[cfg(feature = "dyn_daq")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DaqAllocState {
    Undefined,
    FreeDaq,
    AllocDaq,
    AllocOdt,
    AllocOdtEntry,
}

/// Seed and key exchange progress
#[derive(Debug)]
pub(crate) enum SeedKeyState {
    Idle,
    /// Seed generated, drip fed to the host across GET_SEED packets
    SeedPending { resource: Resource, seed: Vec<u8>, offset: usize },
    /// Key accumulated across UNLOCK packets
    KeyPending {
        resource: Resource,
        seed: Vec<u8>,
        key: Vec<u8>,
        total: usize,
    },
}

//----------------------------------------------------------------------------------------------
// Receive handle

/// Clonable handle for the transport receive path
/// May be invoked from interrupt context, touches only the locked queues
#[derive(Debug, Clone)]
pub struct XcpRxHandle {
    queues: Arc<XcpQueues>,
    max_dto: usize,
}

impl XcpRxHandle {
    /// Deliver one raw protocol packet as received from the wire
    /// Oversized and empty packets are dropped with a log entry, pool exhaustion
    /// drops the indication silently
    pub fn indication(&self, data: &[u8]) {
        if data.is_empty() {
            debug!("rx_indication: empty packet dropped");
            return;
        }
        if data.len() > self.max_dto {
            debug!("rx_indication: length {} exceeds max DTO, dropped", data.len());
            return;
        }
        match self.queues.pool.get() {
            Some(mut buf) => {
                buf.fill(data);
                self.queues.rx.put(buf);
            }
            None => {
                trace!("rx_indication: no free buffer, indication dropped");
            }
        }
    }
}

//----------------------------------------------------------------------------------------------
// XcpSlave

/// One instance of the slave protocol engine
/// Holds all protocol state: connection flag, protection mask, MTA cursor, transfer
/// progress, the DAQ table, event channels and the packet queues
pub struct XcpSlave {
    pub(crate) config: XcpConfig,
    pub(crate) cb: XcpCallbacks,
    pub(crate) queues: Arc<XcpQueues>,
    pub(crate) spaces: AddressSpaces,
    pub(crate) connected: bool,
    pub(crate) protection: Resource,
    pub(crate) mta: Option<Mta>,
    pub(crate) daq: DaqTable,
    pub(crate) channels: Vec<EventChannel>,
    pub(crate) segments: Vec<CalSegment>,
    pub(crate) worker: PendingWorker,
    pub(crate) transfer: Option<Transfer>,
    pub(crate) daq_ptr: Option<DaqPtr>,
    #[cfg(feature = "dyn_daq")]
    pub(crate) alloc_state: DaqAllocState,
    pub(crate) seed_key: SeedKeyState,
    /// Fallback timestamp source, advances once per main loop tick
    pub(crate) tick: u32,
}

impl XcpSlave {
    /// Create an engine instance
    /// Buffers are sized for the larger of max CTO and max DTO and allocated once here
    pub fn new(mut config: XcpConfig, spaces: AddressSpaces, callbacks: XcpCallbacks) -> XcpSlave {
        let buf_size = (config.max_cto as usize).max(config.max_dto as usize);
        let queues = XcpQueues::new(config.queue_size, buf_size);
        let predefined = std::mem::take(&mut config.predefined_lists);
        let channels = std::mem::take(&mut config.event_channels);
        let segments = std::mem::take(&mut config.segments);
        let daq = DaqTable::new(predefined, config.max_daq, config.max_odt, config.max_odt_entries);
        let protection = config.resource_protect;
        info!(
            "XcpSlave: max_cto={}, max_dto={}, {} buffers, {} event channels, {} predefined lists",
            config.max_cto,
            config.max_dto,
            config.queue_size,
            channels.len(),
            daq.min_daq()
        );
        XcpSlave {
            config,
            cb: callbacks,
            queues,
            spaces,
            connected: false,
            protection,
            mta: None,
            daq,
            channels,
            segments,
            worker: PendingWorker::None,
            transfer: None,
            daq_ptr: None,
            #[cfg(feature = "dyn_daq")]
            alloc_state: DaqAllocState::Undefined,
            seed_key: SeedKeyState::Idle,
            tick: 0,
        }
    }

    /// Handle for the transport receive path, clonable into interrupt context
    pub fn rx_handle(&self) -> XcpRxHandle {
        XcpRxHandle {
            queues: Arc::clone(&self.queues),
            max_dto: self.config.max_dto as usize,
        }
    }

    /// Deliver one received packet, see XcpRxHandle::indication
    pub fn rx_indication(&self, data: &[u8]) {
        self.rx_handle().indication(data);
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Current resource protection mask
    pub fn protection(&self) -> Resource {
        self.protection
    }

    //------------------------------------------------------------------------------------------
    // Main schedule loop

    /// Scheduled function of the engine, called periodically by the integrator
    /// Runs the pending continuation worker or one receive-and-dispatch pass, processes
    /// all event channels, then drains the transmit queue
    pub fn main_function(&mut self) {
        self.tick = self.tick.wrapping_add(1);

        if self.worker != PendingWorker::None {
            // A registered worker serializes block transfers against new command intake
            self.step_worker();
        } else {
            self.receive_main();
        }

        for c in 0..self.channels.len() {
            self.process_channel(c);
        }

        self.transmit_main();
    }

    /// Process one event channel, entry point for channels driven by an independent
    /// timer with tighter timing than the main poll rate
    pub fn main_function_channel(&mut self, channel: u16) {
        let c = channel as usize;
        if c >= self.channels.len() {
            warn!("main_function_channel: channel {} not configured", channel);
            return;
        }
        self.process_channel(c);
    }

    fn process_channel(&mut self, c: usize) {
        let params = SampleParams {
            connected: self.connected,
            identification: self.config.identification,
            timestamp_size: self.config.timestamp_size,
            timestamp: self.timestamp(),
            max_dto: self.config.max_dto as usize,
        };
        daq::process_event_channel(&mut self.channels[c], &mut self.daq, &mut self.spaces, &self.queues, &params);
    }

    /// Pull received packets and dispatch them through the command table
    fn receive_main(&mut self) {
        while let Some(buf) = self.queues.rx.get() {
            if !self.dispatch(buf) {
                // A truncated packet aborts the whole batch to avoid desynchronizing
                // on a corrupt stream
                break;
            }
            // A handler may have registered a continuation worker, stop command intake
            if self.worker != PendingWorker::None {
                break;
            }
        }
    }

    /// Drain the transmit queue: at most one frame per tick unless fast transmit is
    /// configured, a failed transmit is requeued at the front and retried next tick
    fn transmit_main(&mut self) {
        while let Some(buf) = self.queues.tx.get() {
            match (self.cb.transmit)(buf.data()) {
                Ok(()) => {
                    self.queues.pool.free(buf);
                    if !self.config.fast_transmit {
                        break;
                    }
                }
                Err(e) => {
                    debug!("transmit failed ({}), retry next tick", e);
                    self.queues.tx.put_front(buf);
                    break;
                }
            }
        }
    }

    //------------------------------------------------------------------------------------------
    // Dispatch

    /// Dispatch one received packet, returns false to abort the current receive batch
    fn dispatch(&mut self, buf: XcpBuffer) -> bool {
        let pid = buf.data()[0];

        // Guard against acting on stale commands after disconnect or reset
        if !self.connected && pid != CC_CONNECT && pid != CC_TRANSPORT_LAYER_CMD {
            trace!("not connected, packet {:02X} silently discarded", pid);
            self.queues.pool.free(buf);
            return true;
        }

        // Low PIDs carry inbound stimulation data keyed by ODT number
        if pid < CC_FIRST {
            self.stim_indication(buf);
            return true;
        }

        let entry = &CMD_TABLE[pid as usize];
        let Some(handler) = entry.handler else {
            debug!("unknown command {:02X}", pid);
            self.send_error(ErrorCode::CmdUnknown, None);
            self.queues.pool.free(buf);
            return true;
        };

        if buf.len() < entry.min_len as usize {
            warn!(
                "command {:02X}: length {} below minimum {}, aborting receive batch",
                pid,
                buf.len(),
                entry.min_len
            );
            self.queues.pool.free(buf);
            return false;
        }

        if self.protection.bits() & entry.lock != 0 {
            debug!("command {:02X}: resource locked", pid);
            self.send_error(ErrorCode::AccessLocked, None);
            self.queues.pool.free(buf);
            return true;
        }

        trace!("dispatch command {:02X}, len {}", pid, buf.len());
        let result = handler(self, &buf.data()[1..]);
        if let Err(e) = result {
            self.send_error(e.code, e.info);
        }
        self.queues.pool.free(buf);
        true
    }

    /// Route an inbound stimulation packet to its ODT's pending slot
    /// Acknowledged with a bare success response, some host tools time out otherwise
    fn stim_indication(&mut self, buf: XcpBuffer) {
        if self.protection.contains(Resource::STIM) {
            self.send_error(ErrorCode::AccessLocked, None);
            self.queues.pool.free(buf);
            return;
        }
        let Some((list, odt)) = self.daq.resolve_stim(buf.data(), self.config.identification) else {
            warn!("stim packet does not resolve to an ODT, dropped");
            self.queues.pool.free(buf);
            return;
        };
        let odt = &mut self.daq.get_mut(list).unwrap().odts[odt as usize];
        // Replace any previous unconsumed stimulation data
        if let Some(old) = odt.stim.take() {
            self.queues.pool.free(old);
        }
        odt.stim = Some(buf);
        self.send_ok();
    }

    //------------------------------------------------------------------------------------------
    // Continuation worker

    /// Run the registered worker for exactly one tick
    fn step_worker(&mut self) {
        match self.worker {
            PendingWorker::None => {}
            PendingWorker::Upload { remaining } => {
                let slice = remaining.min(self.config.max_cto as u32 - 1);
                let Some(mut mta) = self.mta else {
                    self.worker = PendingWorker::None;
                    self.send_error(ErrorCode::OutOfRange, None);
                    return;
                };
                let Some(mut buf) = self.queues.pool.get() else {
                    // No buffer, stall until the next tick
                    return;
                };
                let mut tmp = [0u8; 256];
                match mta.read(&mut self.spaces, &mut tmp[..slice as usize]) {
                    Ok(()) => {
                        buf.append_u8(PID_RES);
                        buf.append_slice(&tmp[..slice as usize]);
                        self.queues.tx.put(buf);
                        self.mta = Some(mta);
                        let remaining = remaining - slice;
                        self.worker = if remaining > 0 { PendingWorker::Upload { remaining } } else { PendingWorker::None };
                    }
                    Err(code) => {
                        self.queues.pool.free(buf);
                        self.worker = PendingWorker::None;
                        self.send_error(code, None);
                    }
                }
            }
        }
    }

    //------------------------------------------------------------------------------------------
    // Session control

    /// Terminate the session from the slave side and notify the host
    pub fn session_terminated(&mut self) {
        self.send_event(EV_SESSION_TERMINATED);
        self.disconnect();
    }

    /// Drop the connection and abandon any in-flight transfer state
    pub fn disconnect(&mut self) {
        if !self.connected {
            warn!("disconnect while not connected");
        }
        self.connected = false;
        self.worker = PendingWorker::None;
        self.transfer = None;
        self.seed_key = SeedKeyState::Idle;
    }

    /// Slave timestamp: the injected clock or the main loop tick counter
    pub(crate) fn timestamp(&mut self) -> u32 {
        match self.cb.clock.as_mut() {
            Some(clock) => clock(),
            None => self.tick,
        }
    }

    //------------------------------------------------------------------------------------------
    // Response helpers

    /// Queue a response packet built by the closure
    /// Pool exhaustion drops the response, backpressure is not a protocol fault
    pub(crate) fn reply(&mut self, build: impl FnOnce(&mut XcpBuffer)) {
        match self.queues.pool.get() {
            Some(mut buf) => {
                build(&mut buf);
                self.queues.tx.put(buf);
            }
            None => {
                warn!("no free buffer for response, dropped");
            }
        }
    }

    /// Queue a bare positive response
    pub(crate) fn send_ok(&mut self) {
        self.reply(|b| b.append_u8(PID_RES));
    }

    /// Queue an error response with an optional diagnostic byte
    pub(crate) fn send_error(&mut self, code: ErrorCode, info: Option<u8>) {
        self.reply(|b| {
            b.append_u8(PID_ERR);
            b.append_u8(code as u8);
            if let Some(info) = info {
                b.append_u8(info);
            }
        });
    }

    /// Queue an asynchronous event packet
    pub(crate) fn send_event(&mut self, event: u8) {
        self.reply(|b| {
            b.append_u8(PID_EV);
            b.append_u8(event);
        });
    }

    //------------------------------------------------------------------------------------------
    // Shared handler helpers

    /// Fetch the MTA for a read access, uninitialized or read denied cursors fail cleanly
    pub(crate) fn mta_for_read(&mut self) -> Result<Mta, CmdError> {
        let mta = self.mta.ok_or(ErrorCode::OutOfRange)?;
        if !mta.can_read() {
            return Err(ErrorCode::AccessDenied.into());
        }
        Ok(mta)
    }

    /// Fetch the MTA for a write access
    pub(crate) fn mta_for_write(&mut self) -> Result<Mta, CmdError> {
        let mta = self.mta.ok_or(ErrorCode::OutOfRange)?;
        if !mta.can_write() {
            return Err(ErrorCode::AccessDenied.into());
        }
        Ok(mta)
    }
}

impl std::fmt::Debug for XcpSlave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XcpSlave")
            .field("connected", &self.connected)
            .field("protection", &self.protection)
            .field("daq_lists", &self.daq.count())
            .field("channels", &self.channels.len())
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Public test helpers

pub mod xcp_test {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Once;

    static TEST_INIT: Once = Once::new();

    /// Initialize test logging once
    pub fn test_setup(level: log::LevelFilter) {
        TEST_INIT.call_once(|| {
            env_logger::Builder::new().target(env_logger::Target::Stdout).filter_level(level).init();
        });
    }

    /// Transmit sink capturing all frames handed to the transport
    #[derive(Clone, Default)]
    pub struct TestTransport {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl TestTransport {
        pub fn new() -> TestTransport {
            TestTransport::default()
        }

        /// Transmit callback for XcpCallbacks
        pub fn transmit_fn(&self) -> TransmitFn {
            let frames = Arc::clone(&self.frames);
            let fail = Arc::clone(&self.fail);
            Box::new(move |data: &[u8]| {
                if *fail.lock() {
                    return Err(XcpError::Transport("test transport down"));
                }
                frames.lock().push(data.to_vec());
                Ok(())
            })
        }

        /// Let the next transmit attempts fail
        pub fn set_down(&self, down: bool) {
            *self.fail.lock() = down;
        }

        /// Take all captured frames
        pub fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.frames.lock())
        }

        pub fn frame_count(&self) -> usize {
            self.frames.lock().len()
        }
    }
}
