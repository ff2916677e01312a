// vim: tw=80
//! Common type definitions used throughout the scan engine

use bitfield::bitfield;
use enum_primitive_derive::Primitive;
use num_enum::{FromPrimitive, IntoPrimitive};
use num_traits::{FromPrimitive as _, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde::{
    de::{Deserialize, Deserializer},
    ser::{Serialize, Serializer},
};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
    ops::{Add, AddAssign, Sub},
};

/// Objects that implement this trait have a typical size when serialized with
/// bincode
pub trait TypicalSize {
    const TYPICAL_SIZE: usize;
}

/// The scan engine's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive, Serialize)]
pub enum Error {
    // Standard errnos
    #[error("Operation not permitted")]
    EPERM           = libc::EPERM as isize,
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Interrupted system call")]
    EINTR           = libc::EINTR as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Resource deadlock avoided")]
    EDEADLK         = libc::EDEADLK as isize,
    #[error("Cannot allocate memory")]
    ENOMEM          = libc::ENOMEM as isize,
    #[error("Device busy")]
    EBUSY           = libc::EBUSY as isize,
    #[error("File exists")]
    EEXIST          = libc::EEXIST as isize,
    #[error("Operation not supported by device")]
    ENODEV          = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Broken pipe")]
    EPIPE           = libc::EPIPE as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Operation not supported")]
    EOPNOTSUPP      = libc::EOPNOTSUPP as isize,
    #[error("Can't send after socket shutdown")]
    ESHUTDOWN       = libc::ESHUTDOWN as isize,
    #[error("Operation timed out")]
    ETIMEDOUT       = libc::ETIMEDOUT as isize,
    #[error("Value too large to be stored in data type")]
    EOVERFLOW       = libc::EOVERFLOW as isize,
    #[error("Operation canceled")]
    ECANCELED       = libc::ECANCELED as isize,
    #[error("Bad message")]
    EBADMSG         = libc::EBADMSG as isize,

    //// Custom error types below
    #[error("Unknown error")]
    EUNKNOWN        = 256,
    /// A read completed, but its data did not match the block's checksum
    #[error("Checksum mismatch")]
    ECKSUM          = 257,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<bincode::Error> for Error {
    /// Any persisted record that fails to decode is treated as corrupt
    fn from(_: bincode::Error) -> Self {
        Error::EBADMSG
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap_or(libc::EIO)
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Transaction group numbers.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct TxgT(pub u64);

impl TxgT {
    /// The first txg of a freshly created pool.  Scans whose minimum txg is
    /// larger than this are incremental.
    pub const INITIAL: TxgT = TxgT(4);
}

impl Add<u64> for TxgT {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        TxgT(self.0 + rhs)
    }
}

impl AddAssign<u64> for TxgT {
    fn add_assign(&mut self, rhs: u64) {
        *self = TxgT(self.0 + rhs)
    }
}

impl Display for TxgT {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for TxgT {
    fn from(t: u64) -> Self {
        TxgT(t)
    }
}

impl From<TxgT> for u64 {
    fn from(t: TxgT) -> Self {
        t.0
    }
}

impl Sub<u64> for TxgT {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        TxgT(self.0 - rhs)
    }
}

impl TypicalSize for TxgT {
    const TYPICAL_SIZE: usize = 8;
}

/// Wall-clock time in seconds since the epoch.
///
/// Dumped as an RFC 3339 string for human-readable formats like YAML, but
/// stored compactly in bincode.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(time::OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Seconds elapsed between `earlier` and `self`, clamped at zero
    pub fn since(&self, earlier: Timestamp) -> u64 {
        u64::try_from(self.0 - earlier.0).unwrap_or(0)
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S)
        -> std::result::Result<S::Ok, S::Error>
        where S: Serializer
    {
        use ::time::OffsetDateTime;
        use ::time::format_description::well_known::Rfc3339;

        if serializer.is_human_readable() {
            let formatted = OffsetDateTime::from_unix_timestamp(self.0)
                .ok()
                .and_then(|odt| odt.format(&Rfc3339).ok());
            match formatted {
                Some(s) => s.serialize(serializer),
                None => self.0.serialize(serializer)
            }
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where D: Deserializer<'de>
    {
        i64::deserialize(deserializer).map(Timestamp)
    }
}

impl TypicalSize for Timestamp {
    const TYPICAL_SIZE: usize = 8;
}

/// Object types that the traversal needs to distinguish.
///
/// The numbering matches the pool's on-disk object type table.  Types that
/// the scan does not care about decode as `Other`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, FromPrimitive, Hash,
         IntoPrimitive, Ord, PartialEq, PartialOrd, Serialize)]
#[repr(u8)]
pub enum ObjType {
    None = 0,
    ObjectDirectory = 1,
    IntentLog = 9,
    Dnode = 10,
    Objset = 11,
    DslDir = 12,
    DslDataset = 16,
    PlainFileContents = 19,
    DirectoryContents = 20,
    Zvol = 23,
    #[num_enum(default)]
    Other = 255,
}

impl Default for ObjType {
    fn default() -> Self {
        ObjType::None
    }
}

/// A block's checksum, as recorded in its parent's block pointer
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct Checksum(pub [u64; 4]);

/// Data Virtual Address: the location of one copy of a block
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct Dva {
    /// Top-level device id
    pub vdev: u64,
    /// Byte offset within the top-level device
    pub offset: u64,
    /// Allocated size on the device, including any parity
    pub asize: u64,
    /// This copy is a gang header whose children may live anywhere
    pub gang: bool,
}

impl Dva {
    pub fn is_empty(&self) -> bool {
        self.asize == 0
    }
}

/// Maximum number of copies of a single block
pub const DVAS_PER_BP: usize = 3;

/// log2 of the on-disk size of a block pointer
pub const BLKPTR_SHIFT: u32 = 7;

/// log2 of the smallest allocatable unit
pub const MINBLOCKSHIFT: u32 = 9;

/// Pointer to a block, as stored in its parent
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockPtr {
    pub dva: [Dva; DVAS_PER_BP],
    /// Indirection level.  0 for data and dnode blocks
    pub level: u8,
    pub objtype: ObjType,
    /// Logical (uncompressed) size
    pub lsize: u64,
    /// Physical (compressed) size
    pub psize: u64,
    /// Logical birth txg
    pub birth: TxgT,
    /// Physical birth txg, if different from the logical birth
    pub phys_birth: TxgT,
    pub checksum: Checksum,
    /// This block is referenced through the dedup table
    pub dedup: bool,
    /// The block's data lives inside the pointer itself
    pub embedded: bool,
}

impl BlockPtr {
    /// Holes have no storage at all
    pub fn is_hole(&self) -> bool {
        !self.embedded && self.dva[0].is_empty() && self.birth == TxgT(0)
    }

    pub fn is_gang(&self) -> bool {
        self.dva[0].gang
    }

    /// Count of gang copies
    pub fn count_gang(&self) -> u64 {
        self.dvas().filter(|dva| dva.gang).count() as u64
    }

    /// Iterate over the block's valid copies
    pub fn dvas(&self) -> impl Iterator<Item=&Dva> {
        self.dva.iter().filter(|dva| !dva.is_empty())
    }

    pub fn ndvas(&self) -> usize {
        self.dvas().count()
    }

    /// Total allocated size of all copies
    pub fn asize(&self) -> u64 {
        self.dvas().map(|dva| dva.asize).sum()
    }

    pub fn physical_birth(&self) -> TxgT {
        if self.phys_birth == TxgT(0) {
            self.birth
        } else {
            self.phys_birth
        }
    }

    /// Return a copy of this block pointer that references only its `i`th
    /// copy.
    pub fn with_single_dva(&self, i: usize) -> BlockPtr {
        let mut bp = *self;
        bp.dva = [Dva::default(); DVAS_PER_BP];
        bp.dva[0] = self.dva[i];
        bp
    }

    /// Is this a block whose contents the traversal must read and expand?
    pub fn is_metadata(&self) -> bool {
        self.level > 0 ||
            self.objtype == ObjType::Dnode ||
            self.objtype == ObjType::Objset
    }
}

bitfield! {
    /// Flags attached to a single scan read
    #[derive(Clone, Copy, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct IoFlags(u16);
    impl Debug;
    pub scrub, set_scrub: 0;
    pub resilver, set_resilver: 1;
    /// Failure is expected and should not be counted
    pub speculative, set_speculative: 2;
    pub canfail, set_canfail: 3;
    pub raw, set_raw: 4;
    pub scan_thread, set_scan_thread: 5;
}

// LCOV_EXCL_STOP
