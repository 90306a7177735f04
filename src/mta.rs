//----------------------------------------------------------------------------------------------
// Module mta
// Memory Transfer Address: a cursor over an addressable resource selected by an address
// extension tag. Upload, download, checksum and DAQ sampling all go through this cursor.
// Every transfer advances the address by the number of bytes moved, so chunked block
// transfers resume correctly across calls.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::protocol::ErrorCode;

//----------------------------------------------------------------------------------------------
// Address extensions

/// Linear target memory
pub const XCP_MTA_EXT_MEMORY: u8 = 0x00;
/// Read only flash memory
pub const XCP_MTA_EXT_FLASH: u8 = 0x01;
/// Digital I/O, addressed byte-wise within ports
#[cfg(feature = "dio")]
pub const XCP_MTA_EXT_DIO_PORT: u8 = 0x02;
/// Digital I/O, addressed by channel number
#[cfg(feature = "dio")]
pub const XCP_MTA_EXT_DIO_CHANNEL: u8 = 0x03;
/// Internal scratch region, test and simulation aid
pub const XCP_MTA_EXT_DEBUG: u8 = 0xFE;

/// Default size of the debug scratch region
pub const XCP_DEBUG_MEMORY_SIZE: usize = 1024;

//----------------------------------------------------------------------------------------------
// Backend traits
// These are the seams where the platform memory and DIO drivers attach

/// Byte addressable linear memory backend
pub trait MemorySpace: Send {
    /// Read one byte, None if the address is not mapped
    fn get(&mut self, addr: u32) -> Option<u8>;

    /// Write one byte, false if the address is not mapped or not writable
    fn put(&mut self, addr: u32, value: u8) -> bool;

    /// Block read, default is a byte loop
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> bool {
        for (i, b) in buf.iter_mut().enumerate() {
            match self.get(addr + i as u32) {
                Some(v) => *b = v,
                None => return false,
            }
        }
        true
    }

    /// Block write, default is a byte loop
    fn write(&mut self, addr: u32, data: &[u8]) -> bool {
        for (i, v) in data.iter().enumerate() {
            if !self.put(addr + i as u32, *v) {
                return false;
            }
        }
        true
    }
}

/// Digital I/O backend
/// Ports are `port_width` bytes wide; byte-wise access goes through a port wide shadow
#[cfg(feature = "dio")]
pub trait DioSpace: Send {
    /// Width of one port in bytes, 1 to 4
    fn port_width(&self) -> u32;

    fn read_port(&mut self, port: u32) -> u32;

    fn write_port(&mut self, port: u32, value: u32);

    /// Read one channel level
    fn read_channel(&mut self, channel: u32) -> u8;

    /// Write one channel level
    fn write_channel(&mut self, channel: u32, value: u8);
}

//----------------------------------------------------------------------------------------------
// RamRegion
// Vec backed linear memory, used for simulation and as the test backend

/// A linear memory region starting at a base address
#[derive(Debug)]
pub struct RamRegion {
    base: u32,
    data: Vec<u8>,
}

impl RamRegion {
    pub fn new(base: u32, size: usize) -> RamRegion {
        RamRegion { base, data: vec![0u8; size] }
    }

    fn index(&self, addr: u32) -> Option<usize> {
        let offset = addr.checked_sub(self.base)? as usize;
        if offset < self.data.len() {
            Some(offset)
        } else {
            None
        }
    }
}

impl MemorySpace for RamRegion {
    fn get(&mut self, addr: u32) -> Option<u8> {
        self.index(addr).map(|i| self.data[i])
    }

    fn put(&mut self, addr: u32, value: u8) -> bool {
        match self.index(addr) {
            Some(i) => {
                self.data[i] = value;
                true
            }
            None => false,
        }
    }
}

//----------------------------------------------------------------------------------------------
// AddressSpaces
// The set of backends an engine instance routes MTA operations to

pub struct AddressSpaces {
    memory: Option<Box<dyn MemorySpace>>,
    flash: Option<Box<dyn MemorySpace>>,
    #[cfg(feature = "dio")]
    dio: Option<Box<dyn DioSpace>>,
    debug: Box<[u8]>,
    staging: Vec<u8>,
}

impl std::fmt::Debug for AddressSpaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpaces")
            .field("memory", &self.memory.is_some())
            .field("flash", &self.flash.is_some())
            .field("debug_size", &self.debug.len())
            .finish()
    }
}

impl AddressSpaces {
    pub fn new() -> AddressSpaces {
        AddressSpaces {
            memory: None,
            flash: None,
            #[cfg(feature = "dio")]
            dio: None,
            debug: vec![0u8; XCP_DEBUG_MEMORY_SIZE].into_boxed_slice(),
            staging: Vec::new(),
        }
    }

    /// Attach the linear memory backend
    pub fn set_memory(&mut self, memory: Box<dyn MemorySpace>) {
        self.memory = Some(memory);
    }

    /// Attach the read only flash backend
    pub fn set_flash(&mut self, flash: Box<dyn MemorySpace>) {
        self.flash = Some(flash);
    }

    /// Attach the digital I/O backend
    #[cfg(feature = "dio")]
    pub fn set_dio(&mut self, dio: Box<dyn DioSpace>) {
        self.dio = Some(dio);
    }

    /// Load the staging buffer read by an identity handoff MTA (GET_ID, event names)
    pub(crate) fn stage(&mut self, data: &[u8]) {
        self.staging.clear();
        self.staging.extend_from_slice(data);
    }
}

impl Default for AddressSpaces {
    fn default() -> Self {
        AddressSpaces::new()
    }
}

//----------------------------------------------------------------------------------------------
// Mta

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MtaKind {
    Memory,
    Debug,
    Flash,
    #[cfg(feature = "dio")]
    DioPort,
    #[cfg(feature = "dio")]
    DioChannel,
    /// Read only view of the staging buffer, bound internally (never by SET_MTA)
    Staged,
    Unsupported,
}

/// The MTA cursor, reinitialized on every addressing command
/// Transient per operation state, not persistent protocol state
#[derive(Debug, Clone, Copy)]
pub struct Mta {
    address: u32,
    extension: u8,
    kind: MtaKind,
    // Port wide shadow for the DIO port accessor
    shadow: u32,
    shadow_valid: bool,
    dirty: bool,
}

impl Mta {
    /// Bind an accessor for the given address and extension
    /// An unknown extension yields a cursor whose operations all fail cleanly
    pub fn init(address: u32, extension: u8) -> Mta {
        let kind = match extension {
            XCP_MTA_EXT_MEMORY => MtaKind::Memory,
            XCP_MTA_EXT_FLASH => MtaKind::Flash,
            #[cfg(feature = "dio")]
            XCP_MTA_EXT_DIO_PORT => MtaKind::DioPort,
            #[cfg(feature = "dio")]
            XCP_MTA_EXT_DIO_CHANNEL => MtaKind::DioChannel,
            XCP_MTA_EXT_DEBUG => MtaKind::Debug,
            _ => MtaKind::Unsupported,
        };
        if kind == MtaKind::Unsupported {
            warn!("Mta::init: unsupported address extension {}", extension);
        }
        Mta {
            address,
            extension,
            kind,
            shadow: 0,
            shadow_valid: false,
            dirty: false,
        }
    }

    /// Cursor over the staging buffer, used for identity and name handoff uploads
    pub(crate) fn staged() -> Mta {
        Mta {
            address: 0,
            extension: XCP_MTA_EXT_MEMORY,
            kind: MtaKind::Staged,
            shadow: 0,
            shadow_valid: false,
            dirty: false,
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn extension(&self) -> u8 {
        self.extension
    }

    /// Whether get/read are available on this cursor
    pub fn can_read(&self) -> bool {
        self.kind != MtaKind::Unsupported
    }

    /// Whether put/write are available on this cursor
    pub fn can_write(&self) -> bool {
        !matches!(self.kind, MtaKind::Flash | MtaKind::Staged | MtaKind::Unsupported)
    }

    /// Read one byte and advance
    pub fn get(&mut self, spaces: &mut AddressSpaces) -> Result<u8, ErrorCode> {
        match self.kind {
            MtaKind::Memory => {
                let mem = spaces.memory.as_mut().ok_or(ErrorCode::AccessDenied)?;
                let v = mem.get(self.address).ok_or(ErrorCode::OutOfRange)?;
                self.address += 1;
                Ok(v)
            }
            MtaKind::Flash => {
                let flash = spaces.flash.as_mut().ok_or(ErrorCode::AccessDenied)?;
                let v = flash.get(self.address).ok_or(ErrorCode::OutOfRange)?;
                self.address += 1;
                Ok(v)
            }
            MtaKind::Debug => {
                let v = *spaces.debug.get(self.address as usize).ok_or(ErrorCode::OutOfRange)?;
                self.address += 1;
                Ok(v)
            }
            MtaKind::Staged => {
                let v = *spaces.staging.get(self.address as usize).ok_or(ErrorCode::OutOfRange)?;
                self.address += 1;
                Ok(v)
            }
            #[cfg(feature = "dio")]
            MtaKind::DioPort => {
                let dio = spaces.dio.as_mut().ok_or(ErrorCode::AccessDenied)?;
                let width = dio.port_width();
                let offset = self.address % width;
                // Refill the port wide shadow on the first access to a port,
                // a misaligned start address reads the containing port
                if offset == 0 || !self.shadow_valid {
                    self.shadow = dio.read_port(self.address / width);
                    self.shadow_valid = true;
                }
                self.address += 1;
                if self.address % width == 0 {
                    self.shadow_valid = false;
                }
                Ok(((self.shadow >> (8 * offset)) & 0xFF) as u8)
            }
            #[cfg(feature = "dio")]
            MtaKind::DioChannel => {
                let dio = spaces.dio.as_mut().ok_or(ErrorCode::AccessDenied)?;
                let v = dio.read_channel(self.address);
                self.address += 1;
                Ok(v)
            }
            MtaKind::Unsupported => Err(ErrorCode::AccessDenied),
        }
    }

    /// Write one byte and advance
    pub fn put(&mut self, spaces: &mut AddressSpaces, value: u8) -> Result<(), ErrorCode> {
        match self.kind {
            MtaKind::Memory => {
                let mem = spaces.memory.as_mut().ok_or(ErrorCode::AccessDenied)?;
                if !mem.put(self.address, value) {
                    return Err(ErrorCode::OutOfRange);
                }
                self.address += 1;
                Ok(())
            }
            MtaKind::Debug => {
                let slot = spaces.debug.get_mut(self.address as usize).ok_or(ErrorCode::OutOfRange)?;
                *slot = value;
                self.address += 1;
                Ok(())
            }
            #[cfg(feature = "dio")]
            MtaKind::DioPort => {
                let dio = spaces.dio.as_mut().ok_or(ErrorCode::AccessDenied)?;
                let width = dio.port_width();
                let offset = self.address % width;
                // Accumulate into the shadow, preserve bytes not written yet
                if offset == 0 || !self.shadow_valid {
                    self.shadow = dio.read_port(self.address / width);
                    self.shadow_valid = true;
                }
                self.shadow &= !(0xFFu32 << (8 * offset));
                self.shadow |= (value as u32) << (8 * offset);
                self.dirty = true;
                self.address += 1;
                // A full port width accumulated, apply the side effecting port write
                if self.address % width == 0 {
                    dio.write_port((self.address - 1) / width, self.shadow);
                    self.dirty = false;
                    self.shadow_valid = false;
                }
                Ok(())
            }
            #[cfg(feature = "dio")]
            MtaKind::DioChannel => {
                let dio = spaces.dio.as_mut().ok_or(ErrorCode::AccessDenied)?;
                dio.write_channel(self.address, value);
                self.address += 1;
                Ok(())
            }
            MtaKind::Flash | MtaKind::Staged | MtaKind::Unsupported => Err(ErrorCode::AccessDenied),
        }
    }

    /// Block read, advances the address by the buffer length
    pub fn read(&mut self, spaces: &mut AddressSpaces, buf: &mut [u8]) -> Result<(), ErrorCode> {
        match self.kind {
            MtaKind::Memory => {
                let mem = spaces.memory.as_mut().ok_or(ErrorCode::AccessDenied)?;
                if !mem.read(self.address, buf) {
                    return Err(ErrorCode::OutOfRange);
                }
                self.address += buf.len() as u32;
                Ok(())
            }
            MtaKind::Flash => {
                let flash = spaces.flash.as_mut().ok_or(ErrorCode::AccessDenied)?;
                if !flash.read(self.address, buf) {
                    return Err(ErrorCode::OutOfRange);
                }
                self.address += buf.len() as u32;
                Ok(())
            }
            _ => {
                for b in buf.iter_mut() {
                    *b = self.get(spaces)?;
                }
                Ok(())
            }
        }
    }

    /// Block write, advances the address by the data length
    pub fn write(&mut self, spaces: &mut AddressSpaces, data: &[u8]) -> Result<(), ErrorCode> {
        match self.kind {
            MtaKind::Memory => {
                let mem = spaces.memory.as_mut().ok_or(ErrorCode::AccessDenied)?;
                if !mem.write(self.address, data) {
                    return Err(ErrorCode::OutOfRange);
                }
                self.address += data.len() as u32;
                Ok(())
            }
            _ => {
                for v in data {
                    self.put(spaces, *v)?;
                }
                Ok(())
            }
        }
    }

    /// Apply any deferred side effect, a no-op for byte addressable accessors
    /// Mandatory before reuse of an accumulator style cursor
    pub fn flush(&mut self, spaces: &mut AddressSpaces) -> Result<(), ErrorCode> {
        #[cfg(feature = "dio")]
        if self.kind == MtaKind::DioPort && self.dirty {
            let dio = spaces.dio.as_mut().ok_or(ErrorCode::AccessDenied)?;
            let width = dio.port_width();
            dio.write_port(self.address / width, self.shadow);
            self.dirty = false;
            self.shadow_valid = false;
        }
        let _ = spaces;
        Ok(())
    }
}

//----------------------------------------------------------------------------------------------
//----------------------------------------------------------------------------------------------
// Test module
