//! Core CDF constants, enumerations, and the dynamically typed value model.

use crate::error::Error;

/// First four magic bytes of every v3 CDF file.
pub const MAGIC_V3: u32 = 0xCDF3_0001;
/// Second magic word of an uncompressed CDF.
pub const MAGIC_UNCOMPRESSED: u32 = 0x0000_FFFF;
/// Second magic word of a file-level compressed CDF.
pub const MAGIC_COMPRESSED: u32 = 0xCCCC_0001;

/// Fixed length of variable and attribute names on disk.
pub const NAME_LEN: usize = 256;
/// Fixed length of the CDR copyright field.
pub const COPYRIGHT_LEN: usize = 256;

/// CDF compression type code for gzip, the only supported method.
pub const GZIP_COMPRESSION: i32 = 5;

/// Internal record type codes.
pub mod record_type {
    pub const CDR: i32 = 1;
    pub const GDR: i32 = 2;
    pub const RVDR: i32 = 3;
    pub const ADR: i32 = 4;
    pub const AGR_EDR: i32 = 5;
    pub const VXR: i32 = 6;
    pub const VVR: i32 = 7;
    pub const ZVDR: i32 = 8;
    pub const AZ_EDR: i32 = 9;
    pub const CCR: i32 = 10;
    pub const CPR: i32 = 11;
    pub const SPR: i32 = 12;
    pub const CVVR: i32 = 13;
    pub const UIR: i32 = 14;
}

/// CDR flag bits.
pub mod cdr_flags {
    pub const ROW_MAJOR: u32 = 1 << 0;
    pub const SINGLE_FILE: u32 = 1 << 1;
    pub const CHECKSUM: u32 = 1 << 2;
    pub const MD5: u32 = 1 << 3;
}

/// VDR flag bits.
pub mod vdr_flags {
    pub const REC_VARY: u32 = 1 << 0;
    pub const PAD_VALUE: u32 = 1 << 1;
    pub const COMPRESSED: u32 = 1 << 2;
}

/// Number of entries in a leaf VXR emitted by the writer.
pub const VXR_LEAF_ENTRIES: usize = 7;
/// Number of entries in an interior (level) VXR emitted by the writer.
pub const VXR_LEVEL_ENTRIES: usize = 3;
/// Target uncompressed chunk size when auto-sizing a blocking factor.
pub const BLOCKING_BYTES: usize = 65536;

/// Byte order of multi-byte values in a file, derived from the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    /// The byte order of the host this library runs on.
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// CDF data encoding codes.
///
/// The encoding is a property of the whole file; it fixes the byte order of
/// every data value (record headers are always big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Network = 1,
    Sun = 2,
    DecStation = 4,
    Sgi = 5,
    IbmPc = 6,
    IbmRs = 7,
    Host = 8,
    Ppc = 9,
    Hp = 11,
    Next = 12,
    AlphaOsf1 = 13,
    AlphaVmsI = 16,
    ArmLittle = 17,
    ArmBig = 18,
}

impl Encoding {
    pub fn from_code(code: i32) -> Result<Self, Error> {
        Ok(match code {
            1 => Encoding::Network,
            2 => Encoding::Sun,
            4 => Encoding::DecStation,
            5 => Encoding::Sgi,
            6 => Encoding::IbmPc,
            7 => Encoding::IbmRs,
            8 => Encoding::Host,
            9 => Encoding::Ppc,
            11 => Encoding::Hp,
            12 => Encoding::Next,
            13 => Encoding::AlphaOsf1,
            16 => Encoding::AlphaVmsI,
            17 => Encoding::ArmLittle,
            18 => Encoding::ArmBig,
            3 | 14 | 15 => {
                return Err(Error::Unsupported(format!(
                    "VAX/VMS floating-point encoding {code}"
                )))
            }
            _ => return Err(Error::Unsupported(format!("encoding code {code}"))),
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Resolves `Host` to the concrete encoding of this machine.
    pub fn resolve(self) -> Self {
        if self == Encoding::Host {
            match ByteOrder::host() {
                ByteOrder::Little => Encoding::IbmPc,
                ByteOrder::Big => Encoding::Sun,
            }
        } else {
            self
        }
    }

    /// Byte order of data values stored with this encoding.
    pub fn byte_order(self) -> ByteOrder {
        match self.resolve() {
            Encoding::Network
            | Encoding::Sun
            | Encoding::Sgi
            | Encoding::IbmRs
            | Encoding::Ppc
            | Encoding::Hp
            | Encoding::Next
            | Encoding::ArmBig => ByteOrder::Big,
            _ => ByteOrder::Little,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Network => "NETWORK",
            Encoding::Sun => "SUN",
            Encoding::DecStation => "DECSTATION",
            Encoding::Sgi => "SGi",
            Encoding::IbmPc => "IBMPC",
            Encoding::IbmRs => "IBMRS",
            Encoding::Host => "HOST",
            Encoding::Ppc => "PPC",
            Encoding::Hp => "HP",
            Encoding::Next => "NeXT",
            Encoding::AlphaOsf1 => "ALPHAOSF1",
            Encoding::AlphaVmsI => "ALPHAVMSi",
            Encoding::ArmLittle => "ARM_LITTLE",
            Encoding::ArmBig => "ARM_BIG",
        }
    }
}

/// Row- or column-major storage of multi-dimensional records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Majority {
    Row = 1,
    Column = 2,
}

impl Majority {
    pub fn from_code(code: i32) -> Result<Self, Error> {
        match code {
            1 => Ok(Majority::Row),
            2 => Ok(Majority::Column),
            _ => Err(Error::Malformed(format!("majority code {code}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Majority::Row => "Row_major",
            Majority::Column => "Column_major",
        }
    }
}

/// Sparse-record policy of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sparseness {
    #[default]
    None = 0,
    /// Missing records read back as the variable's pad value.
    Pad = 1,
    /// Missing records read back as the previous physical record.
    Previous = 2,
}

impl Sparseness {
    pub fn from_code(code: i32) -> Result<Self, Error> {
        match code {
            0 => Ok(Sparseness::None),
            1 => Ok(Sparseness::Pad),
            2 => Ok(Sparseness::Previous),
            _ => Err(Error::Malformed(format!("sparse record code {code}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Sparseness::None => "No_sparse",
            Sparseness::Pad => "Pad_sparse",
            Sparseness::Previous => "Prev_sparse",
        }
    }
}

/// The CDF scalar data types with their canonical on-disk codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdfType {
    Int1 = 1,
    Int2 = 2,
    Int4 = 4,
    Int8 = 8,
    UInt1 = 11,
    UInt2 = 12,
    UInt4 = 14,
    Real4 = 21,
    Real8 = 22,
    Epoch = 31,
    Epoch16 = 32,
    TimeTt2000 = 33,
    Byte = 41,
    Float = 44,
    Double = 45,
    Char = 51,
    UChar = 52,
}

impl CdfType {
    pub fn from_code(code: i32) -> Result<Self, Error> {
        Ok(match code {
            1 => CdfType::Int1,
            2 => CdfType::Int2,
            4 => CdfType::Int4,
            8 => CdfType::Int8,
            11 => CdfType::UInt1,
            12 => CdfType::UInt2,
            14 => CdfType::UInt4,
            21 => CdfType::Real4,
            22 => CdfType::Real8,
            31 => CdfType::Epoch,
            32 => CdfType::Epoch16,
            33 => CdfType::TimeTt2000,
            41 => CdfType::Byte,
            44 => CdfType::Float,
            45 => CdfType::Double,
            51 => CdfType::Char,
            52 => CdfType::UChar,
            _ => return Err(Error::Unsupported(format!("data type code {code}"))),
        })
    }

    /// Parses a `CDF_xxx` type name, case-insensitively.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        Ok(match name.to_ascii_uppercase().as_str() {
            "CDF_INT1" => CdfType::Int1,
            "CDF_INT2" => CdfType::Int2,
            "CDF_INT4" => CdfType::Int4,
            "CDF_INT8" => CdfType::Int8,
            "CDF_UINT1" => CdfType::UInt1,
            "CDF_UINT2" => CdfType::UInt2,
            "CDF_UINT4" => CdfType::UInt4,
            "CDF_REAL4" => CdfType::Real4,
            "CDF_REAL8" => CdfType::Real8,
            "CDF_EPOCH" => CdfType::Epoch,
            "CDF_EPOCH16" => CdfType::Epoch16,
            "CDF_TIME_TT2000" => CdfType::TimeTt2000,
            "CDF_BYTE" => CdfType::Byte,
            "CDF_FLOAT" => CdfType::Float,
            "CDF_DOUBLE" => CdfType::Double,
            "CDF_CHAR" => CdfType::Char,
            "CDF_UCHAR" => CdfType::UChar,
            _ => return Err(Error::Unsupported(format!("data type name {name}"))),
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            CdfType::Int1 => "CDF_INT1",
            CdfType::Int2 => "CDF_INT2",
            CdfType::Int4 => "CDF_INT4",
            CdfType::Int8 => "CDF_INT8",
            CdfType::UInt1 => "CDF_UINT1",
            CdfType::UInt2 => "CDF_UINT2",
            CdfType::UInt4 => "CDF_UINT4",
            CdfType::Real4 => "CDF_REAL4",
            CdfType::Real8 => "CDF_REAL8",
            CdfType::Epoch => "CDF_EPOCH",
            CdfType::Epoch16 => "CDF_EPOCH16",
            CdfType::TimeTt2000 => "CDF_TIME_TT2000",
            CdfType::Byte => "CDF_BYTE",
            CdfType::Float => "CDF_FLOAT",
            CdfType::Double => "CDF_DOUBLE",
            CdfType::Char => "CDF_CHAR",
            CdfType::UChar => "CDF_UCHAR",
        }
    }

    /// On-disk width of one value in bytes. Strings occupy `num_elems`
    /// bytes; every other type has `num_elems == 1`.
    pub fn byte_size(self, num_elems: usize) -> usize {
        match self {
            CdfType::Int1 | CdfType::UInt1 | CdfType::Byte => 1,
            CdfType::Int2 | CdfType::UInt2 => 2,
            CdfType::Int4 | CdfType::UInt4 | CdfType::Real4 | CdfType::Float => 4,
            CdfType::Int8
            | CdfType::TimeTt2000
            | CdfType::Real8
            | CdfType::Double
            | CdfType::Epoch => 8,
            CdfType::Epoch16 => 16,
            CdfType::Char | CdfType::UChar => num_elems,
        }
    }

    pub fn is_string(self) -> bool {
        matches!(self, CdfType::Char | CdfType::UChar)
    }

    pub fn is_epoch_type(self) -> bool {
        matches!(self, CdfType::Epoch | CdfType::Epoch16 | CdfType::TimeTt2000)
    }
}

/// A `CDF_EPOCH16` value: seconds since 0000-01-01T00:00:00 plus
/// picoseconds within the second.
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Epoch16 {
    pub seconds: f64,
    pub picoseconds: f64,
}

impl Epoch16 {
    pub fn new(seconds: f64, picoseconds: f64) -> Self {
        Epoch16 {
            seconds,
            picoseconds,
        }
    }
}

/// Dynamically typed CDF data: one variant per value class.
///
/// Attribute entries and variable records are dynamically typed on disk;
/// this is the tagged carrier the reader materializes them into and the
/// writer accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Int1(Vec<i8>),
    Int2(Vec<i16>),
    Int4(Vec<i32>),
    Int8(Vec<i64>),
    UInt1(Vec<u8>),
    UInt2(Vec<u16>),
    UInt4(Vec<u32>),
    Real4(Vec<f32>),
    Real8(Vec<f64>),
    Epoch(Vec<f64>),
    Epoch16(Vec<Epoch16>),
    TimeTt2000(Vec<i64>),
    /// One fixed-length string per value, trailing NULs stripped.
    Char(Vec<String>),
}

impl Values {
    /// The canonical data type this variant maps to.
    pub fn data_type(&self) -> CdfType {
        match self {
            Values::Int1(_) => CdfType::Int1,
            Values::Int2(_) => CdfType::Int2,
            Values::Int4(_) => CdfType::Int4,
            Values::Int8(_) => CdfType::Int8,
            Values::UInt1(_) => CdfType::UInt1,
            Values::UInt2(_) => CdfType::UInt2,
            Values::UInt4(_) => CdfType::UInt4,
            Values::Real4(_) => CdfType::Real4,
            Values::Real8(_) => CdfType::Real8,
            Values::Epoch(_) => CdfType::Epoch,
            Values::Epoch16(_) => CdfType::Epoch16,
            Values::TimeTt2000(_) => CdfType::TimeTt2000,
            Values::Char(_) => CdfType::Char,
        }
    }

    /// Number of values held.
    pub fn len(&self) -> usize {
        match self {
            Values::Int1(v) => v.len(),
            Values::Int2(v) => v.len(),
            Values::Int4(v) => v.len(),
            Values::Int8(v) => v.len(),
            Values::UInt1(v) => v.len(),
            Values::UInt2(v) => v.len(),
            Values::UInt4(v) => v.len(),
            Values::Real4(v) => v.len(),
            Values::Real8(v) => v.len(),
            Values::Epoch(v) => v.len(),
            Values::Epoch16(v) => v.len(),
            Values::TimeTt2000(v) => v.len(),
            Values::Char(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `ty` stores the same value class as this variant, so the
    /// bytes produced for it decode back losslessly.
    pub fn compatible_with(&self, ty: CdfType) -> bool {
        use CdfType::*;
        matches!(
            (self, ty),
            (Values::Int1(_), Int1 | Byte)
                | (Values::Int2(_), Int2)
                | (Values::Int4(_), Int4)
                | (Values::Int8(_), Int8)
                | (Values::UInt1(_), UInt1)
                | (Values::UInt2(_), UInt2)
                | (Values::UInt4(_), UInt4)
                | (Values::Real4(_), Real4 | Float)
                | (Values::Real8(_), Real8 | Double)
                | (Values::Epoch(_), Epoch | Real8 | Double)
                | (Values::Epoch16(_), Epoch16)
                | (Values::TimeTt2000(_), TimeTt2000 | Int8)
                | (Values::Char(_), Char | UChar)
        )
    }
}

/// The default pad value of a data type, as defined by the format.
pub fn default_pad(ty: CdfType, num_elems: usize) -> Values {
    match ty {
        CdfType::Int1 | CdfType::Byte => Values::Int1(vec![-127]),
        CdfType::Int2 => Values::Int2(vec![-32767]),
        CdfType::Int4 => Values::Int4(vec![-2147483647]),
        CdfType::Int8 => Values::Int8(vec![-9223372036854775807]),
        CdfType::UInt1 => Values::UInt1(vec![254]),
        CdfType::UInt2 => Values::UInt2(vec![65534]),
        CdfType::UInt4 => Values::UInt4(vec![4294967294]),
        CdfType::Real4 | CdfType::Float => Values::Real4(vec![-1.0e30]),
        CdfType::Real8 | CdfType::Double => Values::Real8(vec![-1.0e30]),
        CdfType::Epoch => Values::Epoch(vec![0.0]),
        CdfType::Epoch16 => Values::Epoch16(vec![Epoch16::default()]),
        CdfType::TimeTt2000 => Values::TimeTt2000(vec![-9223372036854775807]),
        CdfType::Char | CdfType::UChar => Values::Char(vec![" ".repeat(num_elems)]),
    }
}
