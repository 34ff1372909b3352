//! The internal-record codec: parsing and emitting the typed,
//! length-prefixed records a CDF file is made of.
//!
//! Every record starts with an 8-byte big-endian size and a 4-byte
//! big-endian type code; structural fields are big-endian regardless of
//! the file's data encoding. Records link to one another by absolute file
//! offset, with 0 terminating a chain.

use std::borrow::Cow;
use std::io::Read;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Error;
use crate::models::{cdr_flags, record_type, vdr_flags, Encoding, Majority, Sparseness};
use crate::models::{COPYRIGHT_LEN, GZIP_COMPRESSION, NAME_LEN};

/// Maximum VXR nesting the reader will follow.
const MAX_VXR_DEPTH: usize = 64;

// Byte offsets of back-patched fields, relative to each record's start.
pub mod patch {
    pub const GDR_RVDR_HEAD: u64 = 12;
    pub const GDR_ZVDR_HEAD: u64 = 20;
    pub const GDR_ADR_HEAD: u64 = 28;
    pub const GDR_EOF: u64 = 36;
    pub const GDR_NR_VARS: u64 = 44;
    pub const GDR_NUM_ATTR: u64 = 48;
    pub const GDR_R_MAX_REC: u64 = 52;
    pub const GDR_NZ_VARS: u64 = 60;

    pub const ADR_NEXT: u64 = 12;
    pub const ADR_AGR_EDR_HEAD: u64 = 20;
    pub const ADR_NGR_ENTRIES: u64 = 36;
    pub const ADR_MAX_GR_ENTRY: u64 = 40;
    pub const ADR_AZ_EDR_HEAD: u64 = 48;
    pub const ADR_NZ_ENTRIES: u64 = 56;
    pub const ADR_MAX_Z_ENTRY: u64 = 60;

    pub const AEDR_NEXT: u64 = 12;

    pub const VDR_NEXT: u64 = 12;
    pub const VDR_MAX_REC: u64 = 24;
    pub const VDR_VXR_HEAD: u64 = 28;
    pub const VDR_VXR_TAIL: u64 = 36;
    pub const VDR_FLAGS: u64 = 44;
    pub const VDR_BLOCKING_FACTOR: u64 = 80;

    pub const VXR_NEXT: u64 = 12;
    pub const VXR_N_USED: u64 = 24;

    pub const CCR_CPR_OFFSET: u64 = 12;
}

// ---- big-endian field access against the mapped image ----

fn slice_at(image: &[u8], pos: u64, len: usize) -> Result<&[u8], Error> {
    let start = usize::try_from(pos).map_err(|_| Error::UnexpectedEof)?;
    let end = start.checked_add(len).ok_or(Error::UnexpectedEof)?;
    image.get(start..end).ok_or(Error::UnexpectedEof)
}

pub(crate) fn be_i32(image: &[u8], pos: u64) -> Result<i32, Error> {
    Ok(BigEndian::read_i32(slice_at(image, pos, 4)?))
}

pub(crate) fn be_i64(image: &[u8], pos: u64) -> Result<i64, Error> {
    Ok(BigEndian::read_i64(slice_at(image, pos, 8)?))
}

fn offset_field(image: &[u8], pos: u64) -> Result<u64, Error> {
    let raw = be_i64(image, pos)?;
    if raw < 0 {
        // -1 marks an absent link in some writers; treat like 0
        return Ok(0);
    }
    Ok(raw as u64)
}

/// Reads a fixed-length NUL-padded name field.
fn name_field(image: &[u8], pos: u64) -> Result<String, Error> {
    let raw = slice_at(image, pos, NAME_LEN)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

fn put_i32(buf: &mut [u8], pos: usize, value: i32) {
    BigEndian::write_i32(&mut buf[pos..pos + 4], value);
}

fn put_i64(buf: &mut [u8], pos: usize, value: i64) {
    BigEndian::write_i64(&mut buf[pos..pos + 8], value);
}

fn put_name(buf: &mut [u8], pos: usize, name: &str) {
    let bytes = name.as_bytes();
    buf[pos..pos + bytes.len()].copy_from_slice(bytes);
}

/// Reads and validates a record header, returning `(size, type)`.
///
/// The declared size must cover at least the header and lie within the
/// image.
pub fn record_header(image: &[u8], offset: u64) -> Result<(u64, i32), Error> {
    let size = be_i64(image, offset)?;
    let rtype = be_i32(image, offset + 8)?;
    if size < 12 {
        return Err(Error::Malformed(format!(
            "record at offset {offset} declares size {size}"
        )));
    }
    let size = size as u64;
    if offset + size > image.len() as u64 {
        return Err(Error::Malformed(format!(
            "record at offset {offset} overruns the file image"
        )));
    }
    Ok((size, rtype))
}

fn expect_type(image: &[u8], offset: u64, wanted: &[i32]) -> Result<(u64, i32), Error> {
    let (size, rtype) = record_header(image, offset)?;
    if !wanted.contains(&rtype) {
        return Err(Error::Malformed(format!(
            "record at offset {offset} has type {rtype}, expected one of {wanted:?}"
        )));
    }
    Ok((size, rtype))
}

fn expect_min_size(offset: u64, size: u64, min: u64, what: &str) -> Result<(), Error> {
    if size < min {
        return Err(Error::Malformed(format!(
            "{what} at offset {offset} declares size {size}, minimum is {min}"
        )));
    }
    Ok(())
}

// ---- CDR ----

/// The file descriptor record.
#[derive(Debug, Clone)]
pub struct Cdr {
    pub gdr_offset: u64,
    pub version: i32,
    pub release: i32,
    pub increment: i32,
    pub encoding: Encoding,
    pub majority: Majority,
    pub single_file: bool,
    pub md5: bool,
    pub copyright: String,
}

pub const CDR_SIZE: u64 = 56 + COPYRIGHT_LEN as u64;

impl Cdr {
    pub fn parse(image: &[u8], offset: u64) -> Result<Self, Error> {
        let (size, _) = expect_type(image, offset, &[record_type::CDR])?;
        expect_min_size(offset, size, 56, "CDR")?;
        let version = be_i32(image, offset + 20)?;
        if version != 3 {
            return Err(Error::Unsupported(format!(
                "CDF version {version}; only version 3 is supported"
            )));
        }
        let flags = be_i32(image, offset + 32)? as u32;
        let copyright = {
            let len = (size - 56).min(COPYRIGHT_LEN as u64) as usize;
            let raw = slice_at(image, offset + 56, len)?;
            let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
            String::from_utf8_lossy(&raw[..end]).into_owned()
        };
        Ok(Cdr {
            gdr_offset: offset_field(image, offset + 12)?,
            version,
            release: be_i32(image, offset + 24)?,
            increment: be_i32(image, offset + 44)?,
            encoding: Encoding::from_code(be_i32(image, offset + 28)?)?,
            majority: if flags & cdr_flags::ROW_MAJOR != 0 {
                Majority::Row
            } else {
                Majority::Column
            },
            single_file: flags & cdr_flags::SINGLE_FILE != 0,
            md5: flags & cdr_flags::CHECKSUM != 0 && flags & cdr_flags::MD5 != 0,
            copyright,
        })
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CDR_SIZE as usize];
        put_i64(&mut buf, 0, CDR_SIZE as i64);
        put_i32(&mut buf, 8, record_type::CDR);
        put_i64(&mut buf, 12, self.gdr_offset as i64);
        put_i32(&mut buf, 20, self.version);
        put_i32(&mut buf, 24, self.release);
        put_i32(&mut buf, 28, self.encoding.code());
        let mut flags = 0u32;
        if self.majority == Majority::Row {
            flags |= cdr_flags::ROW_MAJOR;
        }
        if self.single_file {
            flags |= cdr_flags::SINGLE_FILE;
        }
        if self.md5 {
            flags |= cdr_flags::CHECKSUM | cdr_flags::MD5;
        }
        put_i32(&mut buf, 32, flags as i32);
        put_i32(&mut buf, 44, self.increment);
        put_i32(&mut buf, 48, 2); // identifier
        put_i32(&mut buf, 52, -1);
        put_name(&mut buf, 56, &self.copyright);
        buf
    }
}

// ---- GDR ----

/// The global descriptor record.
#[derive(Debug, Clone)]
pub struct Gdr {
    pub rvdr_head: u64,
    pub zvdr_head: u64,
    pub adr_head: u64,
    pub eof: i64,
    pub num_rvars: i32,
    pub num_attrs: i32,
    pub r_max_rec: i32,
    pub num_zvars: i32,
    pub leapsecond_updated: i32,
    pub rdim_sizes: Vec<i32>,
}

pub const GDR_BASE_SIZE: u64 = 84;

impl Gdr {
    pub fn parse(image: &[u8], offset: u64) -> Result<Self, Error> {
        let (size, _) = expect_type(image, offset, &[record_type::GDR])?;
        expect_min_size(offset, size, GDR_BASE_SIZE, "GDR")?;
        let num_rdims = be_i32(image, offset + 56)?;
        if num_rdims < 0 || GDR_BASE_SIZE + 4 * num_rdims as u64 > size {
            return Err(Error::Malformed(format!(
                "GDR declares {num_rdims} rVariable dimensions in a {size}-byte record"
            )));
        }
        let mut rdim_sizes = Vec::with_capacity(num_rdims as usize);
        for i in 0..num_rdims as u64 {
            rdim_sizes.push(be_i32(image, offset + 84 + 4 * i)?);
        }
        Ok(Gdr {
            rvdr_head: offset_field(image, offset + 12)?,
            zvdr_head: offset_field(image, offset + 20)?,
            adr_head: offset_field(image, offset + 28)?,
            eof: be_i64(image, offset + 36)?,
            num_rvars: be_i32(image, offset + 44)?,
            num_attrs: be_i32(image, offset + 48)?,
            r_max_rec: be_i32(image, offset + 52)?,
            num_zvars: be_i32(image, offset + 60)?,
            leapsecond_updated: be_i32(image, offset + 76)?,
            rdim_sizes,
        })
    }

    pub fn emit(&self) -> Vec<u8> {
        let size = GDR_BASE_SIZE as usize + 4 * self.rdim_sizes.len();
        let mut buf = vec![0u8; size];
        put_i64(&mut buf, 0, size as i64);
        put_i32(&mut buf, 8, record_type::GDR);
        put_i64(&mut buf, 12, self.rvdr_head as i64);
        put_i64(&mut buf, 20, self.zvdr_head as i64);
        put_i64(&mut buf, 28, self.adr_head as i64);
        put_i64(&mut buf, 36, self.eof);
        put_i32(&mut buf, 44, self.num_rvars);
        put_i32(&mut buf, 48, self.num_attrs);
        put_i32(&mut buf, 52, self.r_max_rec);
        put_i32(&mut buf, 56, self.rdim_sizes.len() as i32);
        put_i32(&mut buf, 60, self.num_zvars);
        put_i64(&mut buf, 64, 0); // UIR head
        put_i32(&mut buf, 72, 0);
        put_i32(&mut buf, 76, self.leapsecond_updated);
        put_i32(&mut buf, 80, -1);
        for (i, &d) in self.rdim_sizes.iter().enumerate() {
            put_i32(&mut buf, 84 + 4 * i, d);
        }
        buf
    }
}

// ---- ADR ----

/// Attribute scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global = 1,
    Variable = 2,
}

impl Scope {
    pub fn from_code(code: i32) -> Result<Self, Error> {
        match code {
            1 => Ok(Scope::Global),
            2 => Ok(Scope::Variable),
            _ => Err(Error::Malformed(format!("attribute scope code {code}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scope::Global => "Global",
            Scope::Variable => "Variable",
        }
    }
}

/// An attribute descriptor record.
#[derive(Debug, Clone)]
pub struct Adr {
    pub next: u64,
    pub agr_edr_head: u64,
    pub scope: Scope,
    pub num: i32,
    pub num_gr_entries: i32,
    pub max_gr_entry: i32,
    pub az_edr_head: u64,
    pub num_z_entries: i32,
    pub max_z_entry: i32,
    pub name: String,
}

pub const ADR_SIZE: u64 = 68 + NAME_LEN as u64;

impl Adr {
    pub fn parse(image: &[u8], offset: u64) -> Result<Self, Error> {
        let (size, _) = expect_type(image, offset, &[record_type::ADR])?;
        expect_min_size(offset, size, ADR_SIZE, "ADR")?;
        Ok(Adr {
            next: offset_field(image, offset + 12)?,
            agr_edr_head: offset_field(image, offset + 20)?,
            scope: Scope::from_code(be_i32(image, offset + 28)?)?,
            num: be_i32(image, offset + 32)?,
            num_gr_entries: be_i32(image, offset + 36)?,
            max_gr_entry: be_i32(image, offset + 40)?,
            az_edr_head: offset_field(image, offset + 48)?,
            num_z_entries: be_i32(image, offset + 56)?,
            max_z_entry: be_i32(image, offset + 60)?,
            name: name_field(image, offset + 68)?,
        })
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ADR_SIZE as usize];
        put_i64(&mut buf, 0, ADR_SIZE as i64);
        put_i32(&mut buf, 8, record_type::ADR);
        put_i64(&mut buf, 12, self.next as i64);
        put_i64(&mut buf, 20, self.agr_edr_head as i64);
        put_i32(&mut buf, 28, self.scope as i32);
        put_i32(&mut buf, 32, self.num);
        put_i32(&mut buf, 36, self.num_gr_entries);
        put_i32(&mut buf, 40, self.max_gr_entry);
        put_i32(&mut buf, 44, 0);
        put_i64(&mut buf, 48, self.az_edr_head as i64);
        put_i32(&mut buf, 56, self.num_z_entries);
        put_i32(&mut buf, 60, self.max_z_entry);
        put_i32(&mut buf, 64, -1);
        put_name(&mut buf, 68, &self.name);
        buf
    }
}

// ---- AEDR ----

/// An attribute entry record (g-entry or z-entry).
#[derive(Debug, Clone)]
pub struct Aedr {
    /// `AGR_EDR` for g/r entries, `AZ_EDR` for z entries.
    pub rtype: i32,
    pub next: u64,
    pub attr_num: i32,
    pub data_type: i32,
    pub entry_num: i32,
    pub num_elems: i32,
    pub num_strings: i32,
    pub value: Vec<u8>,
}

pub const AEDR_BASE_SIZE: u64 = 56;

impl Aedr {
    pub fn parse(image: &[u8], offset: u64) -> Result<Self, Error> {
        let (size, rtype) =
            expect_type(image, offset, &[record_type::AGR_EDR, record_type::AZ_EDR])?;
        expect_min_size(offset, size, AEDR_BASE_SIZE, "AEDR")?;
        let value = slice_at(image, offset + 56, (size - 56) as usize)?.to_vec();
        Ok(Aedr {
            rtype,
            next: offset_field(image, offset + 12)?,
            attr_num: be_i32(image, offset + 20)?,
            data_type: be_i32(image, offset + 24)?,
            entry_num: be_i32(image, offset + 28)?,
            num_elems: be_i32(image, offset + 32)?,
            num_strings: be_i32(image, offset + 36)?,
            value,
        })
    }

    pub fn emit(&self) -> Vec<u8> {
        let size = AEDR_BASE_SIZE as usize + self.value.len();
        let mut buf = vec![0u8; size];
        put_i64(&mut buf, 0, size as i64);
        put_i32(&mut buf, 8, self.rtype);
        put_i64(&mut buf, 12, self.next as i64);
        put_i32(&mut buf, 20, self.attr_num);
        put_i32(&mut buf, 24, self.data_type);
        put_i32(&mut buf, 28, self.entry_num);
        put_i32(&mut buf, 32, self.num_elems);
        put_i32(&mut buf, 36, self.num_strings);
        put_i32(&mut buf, 48, -1);
        put_i32(&mut buf, 52, -1);
        buf[56..].copy_from_slice(&self.value);
        buf
    }
}

// ---- VDR ----

/// r- and z-variables differ only in how dimensionality is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    R,
    Z,
}

impl VarKind {
    pub fn name(self) -> &'static str {
        match self {
            VarKind::R => "rVariable",
            VarKind::Z => "zVariable",
        }
    }
}

/// A variable descriptor record.
///
/// `dim_sizes`/`dim_varys` always hold the full declared dimensionality;
/// [`Vdr::shape`] filters down to the varying dimensions that make up a
/// physical record.
#[derive(Debug, Clone)]
pub struct Vdr {
    pub kind: VarKind,
    pub next: u64,
    pub data_type: i32,
    pub max_rec: i32,
    pub vxr_head: u64,
    pub vxr_tail: u64,
    pub rec_vary: bool,
    pub compressed: bool,
    pub sparse: Sparseness,
    pub num_elems: i32,
    pub num: i32,
    pub cpr_offset: u64,
    pub blocking_factor: i32,
    pub name: String,
    pub dim_sizes: Vec<i32>,
    pub dim_varys: Vec<bool>,
    /// Raw pad bytes in the file's data encoding, when the pad flag is set.
    pub pad: Option<Vec<u8>>,
}

pub const ZVDR_BASE_SIZE: u64 = 88 + NAME_LEN as u64;
pub const RVDR_BASE_SIZE: u64 = 84 + NAME_LEN as u64;

impl Vdr {
    /// Parses a VDR. `rdim_sizes` supplies the file-wide rVariable
    /// dimensions an rVDR inherits.
    pub fn parse(image: &[u8], offset: u64, rdim_sizes: &[i32]) -> Result<Self, Error> {
        let (size, rtype) = expect_type(image, offset, &[record_type::RVDR, record_type::ZVDR])?;
        let kind = if rtype == record_type::ZVDR {
            VarKind::Z
        } else {
            VarKind::R
        };
        expect_min_size(
            offset,
            size,
            match kind {
                VarKind::Z => ZVDR_BASE_SIZE,
                VarKind::R => RVDR_BASE_SIZE,
            },
            "VDR",
        )?;
        let flags = be_i32(image, offset + 44)? as u32;
        let data_type = be_i32(image, offset + 20)?;
        let num_elems = be_i32(image, offset + 64)?;

        let mut dim_sizes = Vec::new();
        let mut dim_varys = Vec::new();
        let pad_pos;
        match kind {
            VarKind::Z => {
                let num_dims = be_i32(image, offset + 340)?;
                if num_dims < 0 || ZVDR_BASE_SIZE + 8 * num_dims as u64 > size {
                    return Err(Error::Malformed(format!(
                        "zVDR at offset {offset} declares {num_dims} dimensions"
                    )));
                }
                for i in 0..num_dims as u64 {
                    dim_sizes.push(be_i32(image, offset + 344 + 4 * i)?);
                }
                let varys_at = offset + 344 + 4 * num_dims as u64;
                for i in 0..num_dims as u64 {
                    dim_varys.push(be_i32(image, varys_at + 4 * i)? != 0);
                }
                pad_pos = offset + 344 + 8 * num_dims as u64;
            }
            VarKind::R => {
                let num_dims = rdim_sizes.len() as u64;
                if RVDR_BASE_SIZE + 4 * num_dims > size {
                    return Err(Error::Malformed(format!(
                        "rVDR at offset {offset} is too small for {num_dims} dimensions"
                    )));
                }
                dim_sizes.extend_from_slice(rdim_sizes);
                for i in 0..num_dims {
                    dim_varys.push(be_i32(image, offset + 340 + 4 * i)? != 0);
                }
                pad_pos = offset + 340 + 4 * num_dims;
            }
        }
        let pad = if flags & vdr_flags::PAD_VALUE != 0 {
            Some(slice_at(image, pad_pos, (offset + size - pad_pos) as usize)?.to_vec())
        } else {
            None
        };

        Ok(Vdr {
            kind,
            next: offset_field(image, offset + 12)?,
            data_type,
            max_rec: be_i32(image, offset + 24)?,
            vxr_head: offset_field(image, offset + 28)?,
            vxr_tail: offset_field(image, offset + 36)?,
            rec_vary: flags & vdr_flags::REC_VARY != 0,
            compressed: flags & vdr_flags::COMPRESSED != 0,
            sparse: Sparseness::from_code(be_i32(image, offset + 48)?)?,
            num_elems,
            num: be_i32(image, offset + 68)?,
            cpr_offset: offset_field(image, offset + 72)?,
            blocking_factor: be_i32(image, offset + 80)?,
            name: name_field(image, offset + 84)?,
            dim_sizes,
            dim_varys,
            pad,
        })
    }

    /// Shape of one physical record: the sizes of varying dimensions.
    pub fn shape(&self) -> Vec<usize> {
        self.dim_sizes
            .iter()
            .zip(&self.dim_varys)
            .filter(|(_, &vary)| vary)
            .map(|(&s, _)| s as usize)
            .collect()
    }

    /// Number of values in one physical record.
    pub fn values_per_record(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn emit(&self) -> Vec<u8> {
        let num_dims = self.dim_sizes.len();
        let base = match self.kind {
            VarKind::Z => ZVDR_BASE_SIZE as usize + 8 * num_dims,
            VarKind::R => RVDR_BASE_SIZE as usize + 4 * num_dims,
        };
        let pad_len = self.pad.as_ref().map_or(0, Vec::len);
        let size = base + pad_len;
        let mut buf = vec![0u8; size];
        put_i64(&mut buf, 0, size as i64);
        put_i32(
            &mut buf,
            8,
            match self.kind {
                VarKind::Z => record_type::ZVDR,
                VarKind::R => record_type::RVDR,
            },
        );
        put_i64(&mut buf, 12, self.next as i64);
        put_i32(&mut buf, 20, self.data_type);
        put_i32(&mut buf, 24, self.max_rec);
        put_i64(&mut buf, 28, self.vxr_head as i64);
        put_i64(&mut buf, 36, self.vxr_tail as i64);
        let mut flags = 0u32;
        if self.rec_vary {
            flags |= vdr_flags::REC_VARY;
        }
        if self.pad.is_some() {
            flags |= vdr_flags::PAD_VALUE;
        }
        if self.compressed {
            flags |= vdr_flags::COMPRESSED;
        }
        put_i32(&mut buf, 44, flags as i32);
        put_i32(&mut buf, 48, self.sparse as i32);
        put_i32(&mut buf, 56, -1);
        put_i32(&mut buf, 60, -1);
        put_i32(&mut buf, 64, self.num_elems);
        put_i32(&mut buf, 68, self.num);
        put_i64(
            &mut buf,
            72,
            if self.cpr_offset == 0 {
                -1
            } else {
                self.cpr_offset as i64
            },
        );
        put_i32(&mut buf, 80, self.blocking_factor);
        put_name(&mut buf, 84, &self.name);
        match self.kind {
            VarKind::Z => {
                put_i32(&mut buf, 340, num_dims as i32);
                for (i, &d) in self.dim_sizes.iter().enumerate() {
                    put_i32(&mut buf, 344 + 4 * i, d);
                }
                let varys_at = 344 + 4 * num_dims;
                for (i, &v) in self.dim_varys.iter().enumerate() {
                    put_i32(&mut buf, varys_at + 4 * i, if v { -1 } else { 0 });
                }
            }
            VarKind::R => {
                for (i, &v) in self.dim_varys.iter().enumerate() {
                    put_i32(&mut buf, 340 + 4 * i, if v { -1 } else { 0 });
                }
            }
        }
        if let Some(pad) = &self.pad {
            buf[size - pad_len..].copy_from_slice(pad);
        }
        buf
    }
}

// ---- VXR ----

/// One VXR entry: the record range `[first, last]` stored at `offset`
/// (a VVR, CVVR, or child VXR).
#[derive(Debug, Clone, Copy)]
pub struct VxrEntry {
    pub first: i32,
    pub last: i32,
    pub offset: u64,
}

/// A variable index record.
#[derive(Debug, Clone)]
pub struct Vxr {
    pub next: u64,
    pub n_entries: i32,
    pub entries: Vec<VxrEntry>,
}

pub const VXR_BASE_SIZE: u64 = 28;

impl Vxr {
    pub fn parse(image: &[u8], offset: u64) -> Result<Self, Error> {
        let (size, _) = expect_type(image, offset, &[record_type::VXR])?;
        let n_entries = be_i32(image, offset + 20)?;
        let n_used = be_i32(image, offset + 24)?;
        if n_entries < 0
            || n_used < 0
            || n_used > n_entries
            || VXR_BASE_SIZE + 16 * n_entries as u64 > size
        {
            return Err(Error::Malformed(format!(
                "VXR at offset {offset} declares {n_used}/{n_entries} entries in a {size}-byte record"
            )));
        }
        let firsts_at = offset + 28;
        let lasts_at = firsts_at + 4 * n_entries as u64;
        let offsets_at = lasts_at + 4 * n_entries as u64;
        let mut entries = Vec::with_capacity(n_used as usize);
        for i in 0..n_used as u64 {
            entries.push(VxrEntry {
                first: be_i32(image, firsts_at + 4 * i)?,
                last: be_i32(image, lasts_at + 4 * i)?,
                offset: offset_field(image, offsets_at + 8 * i)?,
            });
        }
        Ok(Vxr {
            next: offset_field(image, offset + 12)?,
            n_entries,
            entries,
        })
    }

    /// Emits an empty VXR with `n_entries` slots; entries are
    /// back-patched as they are used.
    pub fn emit_empty(n_entries: usize) -> Vec<u8> {
        let size = VXR_BASE_SIZE as usize + 16 * n_entries;
        let mut buf = vec![0u8; size];
        put_i64(&mut buf, 0, size as i64);
        put_i32(&mut buf, 8, record_type::VXR);
        put_i32(&mut buf, 20, n_entries as i32);
        put_i32(&mut buf, 24, 0);
        for i in 0..n_entries {
            put_i32(&mut buf, 28 + 4 * i, -1);
            put_i32(&mut buf, 28 + 4 * n_entries + 4 * i, -1);
            put_i64(&mut buf, 28 + 8 * n_entries + 8 * i, -1);
        }
        buf
    }
}

/// Flattens a variable's VXR tree into leaf segments, in record order.
///
/// Entries pointing at child VXRs are descended into; any fan-out and any
/// nesting depth (up to a safety bound) are accepted.
pub fn collect_segments(image: &[u8], head: u64) -> Result<Vec<VxrEntry>, Error> {
    let mut segments = Vec::new();
    collect_segments_into(image, head, &mut segments, 0)?;
    Ok(segments)
}

fn collect_segments_into(
    image: &[u8],
    mut offset: u64,
    out: &mut Vec<VxrEntry>,
    depth: usize,
) -> Result<(), Error> {
    if depth > MAX_VXR_DEPTH {
        return Err(Error::Malformed("VXR tree exceeds maximum depth".into()));
    }
    while offset != 0 {
        let vxr = Vxr::parse(image, offset)?;
        for entry in &vxr.entries {
            if entry.offset == 0 {
                continue;
            }
            let (_, rtype) = record_header(image, entry.offset)?;
            if rtype == record_type::VXR {
                collect_segments_into(image, entry.offset, out, depth + 1)?;
            } else {
                out.push(*entry);
            }
        }
        offset = vxr.next;
    }
    Ok(())
}

// ---- VVR / CVVR ----

pub const VVR_BASE_SIZE: u64 = 12;
pub const CVVR_BASE_SIZE: u64 = 24;

/// Returns the raw record payload stored at `offset`: the bytes of a VVR
/// directly, or a CVVR's payload after gzip inflation.
pub fn read_data_block(image: &[u8], offset: u64) -> Result<Cow<'_, [u8]>, Error> {
    let (size, rtype) = expect_type(image, offset, &[record_type::VVR, record_type::CVVR])?;
    if rtype == record_type::VVR {
        let payload = slice_at(image, offset + 12, (size - VVR_BASE_SIZE) as usize)?;
        return Ok(Cow::Borrowed(payload));
    }
    expect_min_size(offset, size, CVVR_BASE_SIZE, "CVVR")?;
    let csize = be_i64(image, offset + 16)?;
    if csize < 0 || CVVR_BASE_SIZE + csize as u64 > size {
        return Err(Error::Malformed(format!(
            "CVVR at offset {offset} declares compressed size {csize}"
        )));
    }
    let compressed = slice_at(image, offset + 24, csize as usize)?;
    let mut inflated = Vec::new();
    flate2::read::GzDecoder::new(compressed)
        .read_to_end(&mut inflated)
        .map_err(|e| Error::Compression { offset, source: e })?;
    Ok(Cow::Owned(inflated))
}

/// Emits a VVR holding `data`.
pub fn emit_vvr(data: &[u8]) -> Vec<u8> {
    let size = VVR_BASE_SIZE as usize + data.len();
    let mut buf = vec![0u8; 12];
    put_i64(&mut buf, 0, size as i64);
    put_i32(&mut buf, 8, record_type::VVR);
    buf.extend_from_slice(data);
    buf
}

/// Emits a CVVR holding an already gzip-compressed payload.
pub fn emit_cvvr(compressed: &[u8]) -> Vec<u8> {
    let size = CVVR_BASE_SIZE as usize + compressed.len();
    let mut buf = vec![0u8; 24];
    put_i64(&mut buf, 0, size as i64);
    put_i32(&mut buf, 8, record_type::CVVR);
    put_i64(&mut buf, 16, compressed.len() as i64);
    buf.extend_from_slice(compressed);
    buf
}

// ---- CPR / CCR ----

/// Compression parameters record.
#[derive(Debug, Clone, Copy)]
pub struct Cpr {
    pub ctype: i32,
    pub parameter: i32,
}

pub const CPR_SIZE: u64 = 28;

impl Cpr {
    pub fn parse(image: &[u8], offset: u64) -> Result<Self, Error> {
        let (size, _) = expect_type(image, offset, &[record_type::CPR, record_type::SPR])?;
        expect_min_size(offset, size, CPR_SIZE, "CPR")?;
        Ok(Cpr {
            ctype: be_i32(image, offset + 12)?,
            parameter: be_i32(image, offset + 24)?,
        })
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CPR_SIZE as usize];
        put_i64(&mut buf, 0, CPR_SIZE as i64);
        put_i32(&mut buf, 8, record_type::CPR);
        put_i32(&mut buf, 12, self.ctype);
        put_i32(&mut buf, 20, 1); // parameter count
        put_i32(&mut buf, 24, self.parameter);
        buf
    }
}

/// File-level compression record header (payload handled separately).
#[derive(Debug, Clone, Copy)]
pub struct Ccr {
    pub cpr_offset: u64,
    pub uncompressed_size: i64,
    pub data_start: u64,
    pub data_size: u64,
}

pub const CCR_BASE_SIZE: u64 = 32;

impl Ccr {
    pub fn parse(image: &[u8], offset: u64) -> Result<Self, Error> {
        let (size, _) = expect_type(image, offset, &[record_type::CCR])?;
        expect_min_size(offset, size, CCR_BASE_SIZE, "CCR")?;
        Ok(Ccr {
            cpr_offset: offset_field(image, offset + 12)?,
            uncompressed_size: be_i64(image, offset + 20)?,
            data_start: offset + 32,
            data_size: size - CCR_BASE_SIZE,
        })
    }

    /// Inflates the CCR payload and checks the gzip compression type
    /// against the referenced CPR.
    pub fn inflate(&self, image: &[u8]) -> Result<Vec<u8>, Error> {
        let cpr = Cpr::parse(image, self.cpr_offset)?;
        if cpr.ctype != GZIP_COMPRESSION {
            return Err(Error::Unsupported(format!(
                "file-level compression type {}; only GZIP is supported",
                cpr.ctype
            )));
        }
        let compressed = slice_at(image, self.data_start, self.data_size as usize)?;
        let mut inflated = Vec::new();
        flate2::read::GzDecoder::new(compressed)
            .read_to_end(&mut inflated)
            .map_err(|e| Error::Compression {
                offset: self.data_start,
                source: e,
            })?;
        Ok(inflated)
    }
}

/// Emits a CCR holding an already-compressed whole-file payload. The CPR
/// offset is back-patched after the CPR is written.
pub fn emit_ccr(compressed: &[u8], uncompressed_size: u64) -> Vec<u8> {
    let size = CCR_BASE_SIZE as usize + compressed.len();
    let mut buf = vec![0u8; 32];
    put_i64(&mut buf, 0, size as i64);
    put_i32(&mut buf, 8, record_type::CCR);
    put_i64(&mut buf, 12, 0);
    put_i64(&mut buf, 20, uncompressed_size as i64);
    buf.extend_from_slice(compressed);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CdfType;

    #[test]
    fn cdr_round_trip() {
        let cdr = Cdr {
            gdr_offset: 320,
            version: 3,
            release: 7,
            increment: 0,
            encoding: Encoding::IbmPc,
            majority: Majority::Row,
            single_file: true,
            md5: true,
            copyright: "test copyright".into(),
        };
        let mut image = vec![0u8; 8];
        image.extend_from_slice(&cdr.emit());
        let back = Cdr::parse(&image, 8).unwrap();
        assert_eq!(back.gdr_offset, 320);
        assert_eq!(back.version, 3);
        assert_eq!(back.encoding, Encoding::IbmPc);
        assert_eq!(back.majority, Majority::Row);
        assert!(back.md5);
        assert_eq!(back.copyright, "test copyright");
    }

    #[test]
    fn cdr_rejects_v2() {
        let mut cdr = Cdr {
            gdr_offset: 0,
            version: 2,
            release: 6,
            increment: 0,
            encoding: Encoding::IbmPc,
            majority: Majority::Column,
            single_file: true,
            md5: false,
            copyright: String::new(),
        }
        .emit();
        let mut image = vec![0u8; 8];
        image.append(&mut cdr);
        assert!(matches!(Cdr::parse(&image, 8), Err(Error::Unsupported(_))));
    }

    #[test]
    fn gdr_round_trip_with_rdims() {
        let gdr = Gdr {
            rvdr_head: 0,
            zvdr_head: 1000,
            adr_head: 2000,
            eof: 12345,
            num_rvars: 0,
            num_attrs: 3,
            r_max_rec: -1,
            num_zvars: 7,
            leapsecond_updated: 20170101,
            rdim_sizes: vec![10, 20],
        };
        let image = gdr.emit();
        let back = Gdr::parse(&image, 0).unwrap();
        assert_eq!(back.zvdr_head, 1000);
        assert_eq!(back.num_zvars, 7);
        assert_eq!(back.rdim_sizes, vec![10, 20]);
        assert_eq!(back.leapsecond_updated, 20170101);
    }

    #[test]
    fn zvdr_round_trip() {
        let vdr = Vdr {
            kind: VarKind::Z,
            next: 0,
            data_type: CdfType::Real8.code(),
            max_rec: 99,
            vxr_head: 4096,
            vxr_tail: 4096,
            rec_vary: true,
            compressed: false,
            sparse: Sparseness::Pad,
            num_elems: 1,
            num: 2,
            cpr_offset: 0,
            blocking_factor: 1,
            name: "flux_density".into(),
            dim_sizes: vec![3, 4],
            dim_varys: vec![true, false],
            pad: Some(vec![0u8; 8]),
        };
        let image = vdr.emit();
        let back = Vdr::parse(&image, 0, &[]).unwrap();
        assert_eq!(back.name, "flux_density");
        assert_eq!(back.max_rec, 99);
        assert_eq!(back.sparse, Sparseness::Pad);
        assert_eq!(back.dim_sizes, vec![3, 4]);
        assert_eq!(back.dim_varys, vec![true, false]);
        assert_eq!(back.shape(), vec![3]);
        assert_eq!(back.pad.as_deref(), Some(&[0u8; 8][..]));
    }

    #[test]
    fn rvdr_inherits_file_dims() {
        let vdr = Vdr {
            kind: VarKind::R,
            next: 0,
            data_type: CdfType::Int4.code(),
            max_rec: 0,
            vxr_head: 0,
            vxr_tail: 0,
            rec_vary: true,
            compressed: false,
            sparse: Sparseness::None,
            num_elems: 1,
            num: 0,
            cpr_offset: 0,
            blocking_factor: 1,
            name: "counts".into(),
            dim_sizes: vec![5, 6],
            dim_varys: vec![false, true],
            pad: None,
        };
        let image = vdr.emit();
        let back = Vdr::parse(&image, 0, &[5, 6]).unwrap();
        assert_eq!(back.kind, VarKind::R);
        assert_eq!(back.dim_sizes, vec![5, 6]);
        assert_eq!(back.dim_varys, vec![false, true]);
        assert_eq!(back.shape(), vec![6]);
    }

    #[test]
    fn vxr_tree_flattening() {
        // two leaf VXRs chained through a parent entry and a next link
        let mut image = Vec::new();

        let leaf1_at = 0u64;
        let mut leaf1 = Vxr::emit_empty(2);
        // entries are patched in place for the test
        BigEndian::write_i32(&mut leaf1[28..32], 0);
        BigEndian::write_i32(&mut leaf1[36..40], 4);
        image.extend_from_slice(&leaf1);

        let vvr_at = image.len() as u64;
        image.extend_from_slice(&emit_vvr(&[1, 2, 3]));

        let leaf2_at = image.len() as u64;
        image.extend_from_slice(&Vxr::emit_empty(2));

        let parent_at = image.len() as u64;
        image.extend_from_slice(&Vxr::emit_empty(3));

        // leaf1: one used entry [0,4] -> vvr
        BigEndian::write_i32(&mut image[(leaf1_at + 24) as usize..][..4], 1);
        BigEndian::write_i64(&mut image[(leaf1_at + 28 + 16) as usize..][..8], vvr_at as i64);
        // leaf2: one used entry [5,9] -> vvr
        BigEndian::write_i32(&mut image[(leaf2_at + 24) as usize..][..4], 1);
        BigEndian::write_i32(&mut image[(leaf2_at + 28) as usize..][..4], 5);
        BigEndian::write_i32(&mut image[(leaf2_at + 28 + 8) as usize..][..4], 9);
        BigEndian::write_i64(&mut image[(leaf2_at + 28 + 16) as usize..][..8], vvr_at as i64);
        // parent: two used entries pointing at the leaves
        BigEndian::write_i32(&mut image[(parent_at + 24) as usize..][..4], 2);
        BigEndian::write_i32(&mut image[(parent_at + 28) as usize..][..4], 0);
        BigEndian::write_i32(&mut image[(parent_at + 32) as usize..][..4], 5);
        BigEndian::write_i32(&mut image[(parent_at + 28 + 12) as usize..][..4], 4);
        BigEndian::write_i32(&mut image[(parent_at + 28 + 16) as usize..][..4], 9);
        BigEndian::write_i64(
            &mut image[(parent_at + 28 + 24) as usize..][..8],
            leaf1_at as i64,
        );
        BigEndian::write_i64(
            &mut image[(parent_at + 28 + 32) as usize..][..8],
            leaf2_at as i64,
        );

        let segments = collect_segments(&image, parent_at).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].first, segments[0].last), (0, 4));
        assert_eq!((segments[1].first, segments[1].last), (5, 9));
        assert_eq!(segments[0].offset, vvr_at);
    }

    #[test]
    fn vvr_payload_round_trip() {
        let data = [9u8, 8, 7, 6];
        let image = emit_vvr(&data);
        let back = read_data_block(&image, 0).unwrap();
        assert_eq!(&back[..], &data);
    }

    #[test]
    fn cvvr_inflates() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let payload: Vec<u8> = (0..200u8).collect();
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::new(6));
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();

        let image = emit_cvvr(&compressed);
        let back = read_data_block(&image, 0).unwrap();
        assert_eq!(&back[..], &payload[..]);
    }

    #[test]
    fn truncated_record_rejected() {
        let vvr = emit_vvr(&[1, 2, 3, 4]);
        assert!(record_header(&vvr[..8], 0).is_err());
        assert!(record_header(&vvr[..14], 0).is_err());
    }

    #[test]
    fn leaf1_offset_zero_skipped() {
        // a VXR with a zero entry offset is skipped rather than followed
        let mut vxr = Vxr::emit_empty(1);
        BigEndian::write_i32(&mut vxr[24..28], 1);
        BigEndian::write_i64(&mut vxr[36..44], 0);
        let segments = collect_segments(&vxr, 0).unwrap();
        assert!(segments.is_empty());
    }
}
