//! Driver model
//!
//! Every driver exposes exactly one polymorphic entry point: `command
//! (function, param)`. The function space is closed and shared by all
//! driver classes; parameters travel as typed references instead of raw
//! integers, and unhandled functions answer `NotImplemented`.

pub mod ahci;
pub mod disk;
pub mod irq;
pub mod pci;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::KernelResult;

/// Driver classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    None,
    Clock,
    Console,
    Interrupt,
    Memory,
    HardDisk,
    RamDisk,
    FileSystem,
    Keyboard,
    Graphics,
    Network,
    Other,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverFlags: u32 {
        const READY    = 1 << 0;
        const CRITICAL = 1 << 1;
    }
}

/// The closed set of driver functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DriverFunction {
    Load = 0x0001,
    Unload = 0x0002,
    GetVersion = 0x0003,
    Probe = 0x0004,

    DiskReset = 0x0100,
    DiskRead = 0x0101,
    DiskWrite = 0x0102,
    DiskGetInfo = 0x0103,
    DiskSetAccess = 0x0104,

    FsGetVolumeInfo = 0x0200,
    FsSetVolumeInfo = 0x0201,
    FsFlush = 0x0202,
    FsCreateFolder = 0x0203,
    FsDeleteFolder = 0x0204,
    FsRenameFolder = 0x0205,
    FsOpenFile = 0x0206,
    FsOpenNext = 0x0207,
    FsCloseFile = 0x0208,
    FsDeleteFile = 0x0209,
    FsRenameFile = 0x020A,
    FsRead = 0x020B,
    FsWrite = 0x020C,
    FsGetPosition = 0x020D,
    FsSetPosition = 0x020E,
    FsGetAttributes = 0x020F,
    FsSetAttributes = 0x0210,
    FsCreatePartition = 0x0211,

    GfxEnumModes = 0x0300,
    GfxGetModeInfo = 0x0301,
    GfxSetMode = 0x0302,
    GfxCreateContext = 0x0303,
    GfxCreateBrush = 0x0304,
    GfxCreatePen = 0x0305,
    GfxSetPixel = 0x0306,
    GfxGetPixel = 0x0307,
    GfxLine = 0x0308,
    GfxRectangle = 0x0309,
    GfxEllipse = 0x030A,
    GfxGetCapabilities = 0x030B,
    GfxEnumOutputs = 0x030C,
    GfxGetOutputInfo = 0x030D,
    GfxPresent = 0x030E,
    GfxWaitVBlank = 0x030F,
    GfxAllocSurface = 0x0310,
    GfxFreeSurface = 0x0311,
    GfxSetScanout = 0x0312,

    TextPutCell = 0x0380,
    TextClearRegion = 0x0381,
    TextScrollRegion = 0x0382,
    TextSetCursor = 0x0383,
    TextSetCursorVisible = 0x0384,

    EnumNext = 0x0400,
    EnumPretty = 0x0401,
}

/// Enumeration domains advertised by drivers.
pub const ENUM_DOMAIN_AHCI_PORT: u32 = 0x0001;

/// Generic enumeration record filled by `EnumNext`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverEnumNext {
    pub domain: u32,
    pub index: u32,
    pub id: u32,
    pub status: u32,
    pub signature: u32,
}

/// Typed command parameter. One variant per parameter family the
/// function space needs; `None` for functions that carry nothing.
pub enum Param<'a> {
    None,
    Raw(u32),
    Pci(&'a pci::PciDeviceInfo),
    DiskIo(disk::IoControl<'a>),
    DiskInfo(&'a mut disk::DiskInfo),
    DiskAccess(disk::DiskAccessRequest),
    FsOpen(&'a crate::fs::FileInfo),
    FsFile(&'a Arc<crate::fs::file::File>),
    FsRead(crate::fs::FileOperation<'a>),
    FsWrite(crate::fs::FileWriteOperation<'a>),
    FsPosition {
        file: &'a Arc<crate::fs::file::File>,
        position: &'a mut u32,
    },
    FsVolumeInfo(&'a mut crate::fs::VolumeInfo),
    FsPath(&'a str),
    FsRename {
        from: &'a str,
        to: &'a str,
    },
    GfxCapabilities(&'a mut crate::graphics::GfxCapabilities),
    GfxModeInfo(&'a mut crate::graphics::GfxModeInfo),
    GfxSetMode(&'a crate::graphics::GfxModeInfo),
    GfxSurface(&'a mut crate::graphics::GfxSurface),
    Text(&'a crate::graphics::TextRequest),
    EnumNext(&'a mut DriverEnumNext),
    EnumPretty {
        domain: u32,
        index: u32,
        line: &'a mut String,
    },
}

/// Value handed back by a successful command.
#[derive(Clone, Default)]
pub enum DriverValue {
    #[default]
    None,
    Version {
        major: u32,
        minor: u32,
    },
    Count(u32),
    File(Arc<crate::fs::file::File>),
}

pub type DriverResult = KernelResult<DriverValue>;

/// Static identity of a driver plus its runtime flags.
pub struct DriverDescriptor {
    pub kind: DriverKind,
    pub version_major: u32,
    pub version_minor: u32,
    pub designer: &'static str,
    pub manufacturer: &'static str,
    pub product: &'static str,
    flags: AtomicU32,
    pub enum_domains: &'static [u32],
}

impl DriverDescriptor {
    pub const fn new(
        kind: DriverKind,
        version_major: u32,
        version_minor: u32,
        designer: &'static str,
        manufacturer: &'static str,
        product: &'static str,
        enum_domains: &'static [u32],
    ) -> Self {
        Self {
            kind,
            version_major,
            version_minor,
            designer,
            manufacturer,
            product,
            flags: AtomicU32::new(0),
            enum_domains,
        }
    }

    pub fn flags(&self) -> DriverFlags {
        DriverFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: DriverFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn mark_ready(&self) {
        self.flags
            .fetch_or(DriverFlags::READY.bits(), Ordering::AcqRel);
    }

    pub fn is_ready(&self) -> bool {
        self.flags().contains(DriverFlags::READY)
    }

    pub fn version_value(&self) -> DriverValue {
        DriverValue::Version {
            major: self.version_major,
            minor: self.version_minor,
        }
    }
}

/// The single polymorphic driver entry point.
pub trait DriverCommand: Send + Sync {
    fn descriptor(&self) -> &DriverDescriptor;

    fn command(&self, function: DriverFunction, param: &mut Param<'_>) -> DriverResult;
}

static DRIVERS: Mutex<Vec<Arc<dyn DriverCommand>>> = Mutex::new(Vec::new());

/// Register a driver and run its `Load` function.
pub fn register_driver(driver: Arc<dyn DriverCommand>) -> DriverResult {
    let result = driver.command(DriverFunction::Load, &mut Param::None);
    if result.is_ok() {
        driver.descriptor().mark_ready();
    }
    DRIVERS.lock().push(driver);
    result
}

pub fn drivers() -> Vec<Arc<dyn DriverCommand>> {
    DRIVERS.lock().clone()
}

pub fn drivers_of_kind(kind: DriverKind) -> Vec<Arc<dyn DriverCommand>> {
    DRIVERS
        .lock()
        .iter()
        .filter(|driver| driver.descriptor().kind == kind)
        .cloned()
        .collect()
}

#[doc(hidden)]
pub fn reset_drivers_for_tests() {
    DRIVERS.lock().clear();
}
