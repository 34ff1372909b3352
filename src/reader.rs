//! CDF file reader.
//!
//! [`Reader::open`] maps the file, validates the magic and CDR, inflates
//! file-level compression into a scratch image, verifies the MD5 trailer,
//! and caches the record tables. All metadata queries after that are
//! pure in-memory walks; variable reads slice VVR/CVVR segments through
//! the VXR tree.

use std::borrow::Cow;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder as _};
use md5::{Digest, Md5};
use memmap2::Mmap;

use crate::codec;
use crate::epochs::{self, EpochValue};
use crate::error::Error;
use crate::models::{
    default_pad, ByteOrder, CdfType, Encoding, Majority, Sparseness, Values, MAGIC_COMPRESSED,
    MAGIC_UNCOMPRESSED, MAGIC_V3,
};
use crate::records::{
    collect_segments, read_data_block, Adr, Aedr, Ccr, Cdr, Cpr, Gdr, Scope, VarKind, Vdr,
    VxrEntry,
};

/// Separator the format uses to pack multiple strings into one entry.
const MULTI_STRING_SEP: &str = "\\N ";

/// The file image: mapped directly, or owned after file-level inflation.
enum Image {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Image {
    fn bytes(&self) -> &[u8] {
        match self {
            Image::Mapped(m) => m,
            Image::Owned(v) => v,
        }
    }
}

/// A variable selector: by name or by number.
#[derive(Debug, Clone, Copy)]
pub enum VarRef<'a> {
    Name(&'a str),
    Num(usize),
}

impl<'a> From<&'a str> for VarRef<'a> {
    fn from(name: &'a str) -> Self {
        VarRef::Name(name)
    }
}

impl From<usize> for VarRef<'_> {
    fn from(num: usize) -> Self {
        VarRef::Num(num)
    }
}

/// An attribute selector: by name or by number.
#[derive(Debug, Clone, Copy)]
pub enum AttrRef<'a> {
    Name(&'a str),
    Num(usize),
}

impl<'a> From<&'a str> for AttrRef<'a> {
    fn from(name: &'a str) -> Self {
        AttrRef::Name(name)
    }
}

impl From<usize> for AttrRef<'_> {
    fn from(num: usize) -> Self {
        AttrRef::Num(num)
    }
}

/// An attribute entry selector: an entry number, or (for variable-scope
/// attributes) the variable holding the entry.
#[derive(Debug, Clone, Copy)]
pub enum EntryRef<'a> {
    Num(i32),
    Var(&'a str),
}

impl<'a> From<&'a str> for EntryRef<'a> {
    fn from(name: &'a str) -> Self {
        EntryRef::Var(name)
    }
}

impl From<i32> for EntryRef<'_> {
    fn from(num: i32) -> Self {
        EntryRef::Num(num)
    }
}

/// Basic file information, see [`Reader::info`].
#[derive(Debug, Clone)]
pub struct CdfInfo {
    pub path: PathBuf,
    pub version: String,
    pub encoding: Encoding,
    pub majority: Majority,
    pub r_variables: Vec<String>,
    pub z_variables: Vec<String>,
    /// Attribute names with their scope, in attribute-number order.
    pub attributes: Vec<(String, Scope)>,
    pub copyright: String,
    pub checksum: bool,
    pub num_rdim: usize,
    pub rdim_sizes: Vec<i32>,
    pub compressed: bool,
    /// Last leap-second table update recorded in the file (YYYYMMDD).
    pub leapsecond_updated: i32,
}

/// Everything the VDR says about one variable, see [`Reader::varinq`].
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: String,
    pub num: usize,
    pub kind: VarKind,
    pub data_type: CdfType,
    pub num_elements: usize,
    pub num_dims: usize,
    pub dim_sizes: Vec<usize>,
    pub dim_varys: Vec<bool>,
    pub sparse: Sparseness,
    /// Maximum written record number, 0-based; -1 when no records exist.
    pub last_rec: i64,
    pub rec_vary: bool,
    pub pad: Option<Values>,
    /// GZIP level 1-9, or 0 when the variable is not compressed.
    pub compress: i32,
    pub blocking_factor: i32,
}

/// Attribute information, see [`Reader::attinq`].
#[derive(Debug, Clone)]
pub struct AttInfo {
    pub name: String,
    pub num: usize,
    pub scope: Scope,
    pub num_gr_entries: usize,
    pub max_gr_entry: i32,
    pub num_z_entries: usize,
    pub max_z_entry: i32,
}

/// One attribute entry, see [`Reader::attget`].
#[derive(Debug, Clone)]
pub struct AttData {
    pub data: Values,
    pub data_type: CdfType,
    pub num_items: usize,
}

/// The result of a variable read, see [`Reader::varget`].
#[derive(Debug, Clone)]
pub struct VarData {
    pub rec_ndim: usize,
    pub rec_shape: Vec<usize>,
    /// Total records written to the variable.
    pub num_records: usize,
    pub records_returned: usize,
    pub data_type: CdfType,
    /// Records in row-major order, gap records synthesized per the
    /// sparse-record policy.
    pub data: Values,
    /// Physical record numbers, for sparse variables.
    pub real_records: Option<Vec<i64>>,
}

/// Record- or time-range options for [`Reader::varget`].
///
/// When both a record range and a time range are supplied, the record
/// range wins. A time range constrains the read through the variable
/// named by `epoch_var`, or the variable's `DEPEND_0` attribute, or the
/// variable itself when it is epoch-typed.
#[derive(Debug, Clone, Default)]
pub struct VarGetOptions {
    pub start_rec: Option<i64>,
    pub end_rec: Option<i64>,
    pub start_time: Option<EpochValue>,
    pub end_time: Option<EpochValue>,
    pub epoch_var: Option<String>,
}

/// Reader over a CDF v3 file.
pub struct Reader {
    image: Image,
    path: PathBuf,
    cdr: Cdr,
    gdr: Gdr,
    byte_order: ByteOrder,
    compressed: bool,
    zvdrs: Vec<Vdr>,
    rvdrs: Vec<Vdr>,
    adrs: Vec<Adr>,
    /// Deferred checksum failure, surfaced by the first data read.
    checksum_error: Cell<Option<(String, String)>>,
}

impl Reader {
    /// Opens a CDF file.
    ///
    /// Fails eagerly on malformed or unsupported headers. A checksum
    /// mismatch does not fail the open: the handle degrades so that
    /// metadata queries succeed and the first data read reports
    /// [`Error::ChecksumMismatch`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < 16 {
            return Err(Error::Malformed("file too small to be a CDF".into()));
        }

        let magic1 = BigEndian::read_u32(&mmap[0..4]);
        let magic2 = BigEndian::read_u32(&mmap[4..8]);
        if magic1 != MAGIC_V3 {
            if magic1 >> 16 == 0xCDF2 || magic1 == MAGIC_UNCOMPRESSED {
                return Err(Error::Unsupported(
                    "CDF version 2 files are not supported".into(),
                ));
            }
            return Err(Error::InvalidMagicNumber {
                found: mmap[0..8].to_vec(),
            });
        }

        let compressed = match magic2 {
            MAGIC_UNCOMPRESSED => false,
            MAGIC_COMPRESSED => true,
            _ => {
                return Err(Error::InvalidMagicNumber {
                    found: mmap[0..8].to_vec(),
                })
            }
        };

        let image = if compressed {
            // The whole logical file after the magic words lives in one
            // CCR; inflate it into a scratch image downstream code can
            // address like an uncompressed file.
            let ccr = Ccr::parse(&mmap, 8)?;
            let payload = ccr.inflate(&mmap)?;
            let mut scratch = Vec::with_capacity(8 + payload.len());
            scratch.extend_from_slice(&MAGIC_V3.to_be_bytes());
            scratch.extend_from_slice(&MAGIC_UNCOMPRESSED.to_be_bytes());
            scratch.extend_from_slice(&payload);
            Image::Owned(scratch)
        } else {
            Image::Mapped(mmap)
        };

        let cdr = Cdr::parse(image.bytes(), 8)?;
        if !cdr.single_file {
            return Err(Error::Unsupported("multi-file CDFs".into()));
        }
        let byte_order = cdr.encoding.byte_order();
        let gdr = Gdr::parse(image.bytes(), cdr.gdr_offset)?;

        // The trailer covers the on-disk byte stream, compressed or not.
        let checksum_error = Cell::new(None);
        if cdr.md5 {
            let (expected, computed) = match &image {
                Image::Mapped(m) => md5_trailer_check(m)?,
                // the scratch image replaced the mapping; hash the file
                Image::Owned(_) => md5_trailer_check(&std::fs::read(&path)?)?,
            };
            if expected != computed {
                checksum_error.set(Some((expected, computed)));
            }
        }

        let mut reader = Reader {
            image,
            path,
            cdr,
            gdr,
            byte_order,
            compressed,
            zvdrs: Vec::new(),
            rvdrs: Vec::new(),
            adrs: Vec::new(),
            checksum_error,
        };
        reader.load_tables()?;
        Ok(reader)
    }

    fn load_tables(&mut self) -> Result<(), Error> {
        let image = self.image.bytes();
        let mut offset = self.gdr.zvdr_head;
        for _ in 0..self.gdr.num_zvars {
            if offset == 0 {
                return Err(Error::Malformed("zVariable chain ends early".into()));
            }
            let vdr = Vdr::parse(image, offset, &self.gdr.rdim_sizes)?;
            offset = vdr.next;
            self.zvdrs.push(vdr);
        }
        let mut offset = self.gdr.rvdr_head;
        for _ in 0..self.gdr.num_rvars {
            if offset == 0 {
                return Err(Error::Malformed("rVariable chain ends early".into()));
            }
            let vdr = Vdr::parse(image, offset, &self.gdr.rdim_sizes)?;
            offset = vdr.next;
            self.rvdrs.push(vdr);
        }
        let mut offset = self.gdr.adr_head;
        for _ in 0..self.gdr.num_attrs {
            if offset == 0 {
                return Err(Error::Malformed("attribute chain ends early".into()));
            }
            let adr = Adr::parse(image, offset)?;
            offset = adr.next;
            self.adrs.push(adr);
        }
        Ok(())
    }

    /// Releases the handle. Dropping the reader is equivalent.
    pub fn close(self) {}

    /// Basic information about the file.
    pub fn info(&self) -> CdfInfo {
        CdfInfo {
            path: self.path.clone(),
            version: format!(
                "{}.{}.{}",
                self.cdr.version, self.cdr.release, self.cdr.increment
            ),
            encoding: self.cdr.encoding,
            majority: self.cdr.majority,
            r_variables: self.rvdrs.iter().map(|v| v.name.clone()).collect(),
            z_variables: self.zvdrs.iter().map(|v| v.name.clone()).collect(),
            attributes: self
                .adrs
                .iter()
                .map(|a| (a.name.clone(), a.scope))
                .collect(),
            copyright: self.cdr.copyright.clone(),
            checksum: self.cdr.md5,
            num_rdim: self.gdr.rdim_sizes.len(),
            rdim_sizes: self.gdr.rdim_sizes.clone(),
            compressed: self.compressed,
            leapsecond_updated: self.gdr.leapsecond_updated,
        }
    }

    fn find_vdr(&self, var: VarRef<'_>) -> Result<&Vdr, Error> {
        match var {
            VarRef::Name(name) => {
                let wanted = name.trim();
                self.zvdrs
                    .iter()
                    .chain(&self.rvdrs)
                    .find(|v| v.name.trim().eq_ignore_ascii_case(wanted))
                    .ok_or_else(|| Error::NotFound(format!("variable {name}")))
            }
            VarRef::Num(num) => {
                if !self.zvdrs.is_empty() && !self.rvdrs.is_empty() {
                    return Err(Error::NotFound(format!(
                        "variable number {num} is ambiguous in a file with both r and z \
                         variables; use the name"
                    )));
                }
                self.zvdrs
                    .get(num)
                    .or_else(|| self.rvdrs.get(num))
                    .ok_or_else(|| Error::NotFound(format!("variable number {num}")))
            }
        }
    }

    fn var_info(&self, vdr: &Vdr) -> Result<VarInfo, Error> {
        let data_type = CdfType::from_code(vdr.data_type)?;
        let pad = match &vdr.pad {
            Some(bytes) => Some(codec::read_scalar(
                bytes,
                data_type,
                vdr.num_elems as usize,
                self.byte_order,
            )?),
            None => None,
        };
        let compress = if vdr.compressed && vdr.cpr_offset != 0 {
            Cpr::parse(self.image.bytes(), vdr.cpr_offset)?.parameter
        } else {
            0
        };
        Ok(VarInfo {
            name: vdr.name.clone(),
            num: vdr.num as usize,
            kind: vdr.kind,
            data_type,
            num_elements: vdr.num_elems as usize,
            num_dims: vdr.dim_sizes.len(),
            dim_sizes: vdr.dim_sizes.iter().map(|&d| d as usize).collect(),
            dim_varys: vdr.dim_varys.clone(),
            sparse: vdr.sparse,
            last_rec: vdr.max_rec as i64,
            rec_vary: vdr.rec_vary,
            pad,
            compress,
            blocking_factor: vdr.blocking_factor,
        })
    }

    /// Full description of a variable.
    pub fn varinq<'a>(&self, var: impl Into<VarRef<'a>>) -> Result<VarInfo, Error> {
        self.var_info(self.find_vdr(var.into())?)
    }

    fn find_adr(&self, attr: AttrRef<'_>) -> Result<&Adr, Error> {
        match attr {
            AttrRef::Name(name) => {
                let wanted = name.trim();
                self.adrs
                    .iter()
                    .find(|a| a.name.trim().eq_ignore_ascii_case(wanted))
                    .ok_or_else(|| Error::NotFound(format!("attribute {name}")))
            }
            AttrRef::Num(num) => self
                .adrs
                .get(num)
                .ok_or_else(|| Error::NotFound(format!("attribute number {num}"))),
        }
    }

    /// Attribute information by name or number.
    pub fn attinq<'a>(&self, attr: impl Into<AttrRef<'a>>) -> Result<AttInfo, Error> {
        let adr = self.find_adr(attr.into())?;
        Ok(AttInfo {
            name: adr.name.clone(),
            num: adr.num as usize,
            scope: adr.scope,
            num_gr_entries: adr.num_gr_entries.max(0) as usize,
            max_gr_entry: adr.max_gr_entry,
            num_z_entries: adr.num_z_entries.max(0) as usize,
            max_z_entry: adr.max_z_entry,
        })
    }

    fn decode_entry(&self, aedr: &Aedr) -> Result<AttData, Error> {
        let ty = CdfType::from_code(aedr.data_type)?;
        let num_elems = aedr.num_elems.max(0) as usize;
        let data = if ty.is_string() {
            let raw = codec::read_array(&aedr.value, ty, 1, num_elems, self.byte_order)?;
            match raw {
                Values::Char(strings) if aedr.num_strings > 1 => Values::Char(
                    strings[0]
                        .split(MULTI_STRING_SEP)
                        .map(str::to_owned)
                        .collect(),
                ),
                other => other,
            }
        } else {
            codec::read_array(&aedr.value, ty, num_elems, 1, self.byte_order)?
        };
        let num_items = if ty.is_string() && aedr.num_strings > 1 {
            aedr.num_strings as usize
        } else if ty.is_string() {
            num_elems
        } else {
            data.len()
        };
        Ok(AttData {
            data,
            data_type: ty,
            num_items,
        })
    }

    fn entry_chain(&self, head: u64, count: i32) -> Result<Vec<Aedr>, Error> {
        let image = self.image.bytes();
        let mut entries = Vec::new();
        let mut offset = head;
        for _ in 0..count.max(0) {
            if offset == 0 {
                break;
            }
            let aedr = Aedr::parse(image, offset)?;
            offset = aedr.next;
            entries.push(aedr);
        }
        Ok(entries)
    }

    /// The value of one attribute entry.
    ///
    /// For variable-scope attributes the entry may be selected by the
    /// variable's name; the entry number is then the variable number.
    pub fn attget<'a, 'b>(
        &self,
        attr: impl Into<AttrRef<'a>>,
        entry: impl Into<EntryRef<'b>>,
    ) -> Result<AttData, Error> {
        self.checked()?;
        let adr = self.find_adr(attr.into())?;
        let entry = entry.into();
        let (entry_num, z_chain) = match (adr.scope, entry) {
            (Scope::Global, EntryRef::Num(n)) => (n, false),
            (Scope::Global, EntryRef::Var(_)) => {
                return Err(Error::NotFound(format!(
                    "attribute {} is global; select the entry by number",
                    adr.name
                )))
            }
            (Scope::Variable, EntryRef::Num(n)) => {
                if !self.zvdrs.is_empty() && !self.rvdrs.is_empty() {
                    return Err(Error::NotFound(
                        "entry number is ambiguous in a file with both r and z variables; \
                         use the variable name"
                            .into(),
                    ));
                }
                (n, !self.zvdrs.is_empty())
            }
            (Scope::Variable, EntryRef::Var(name)) => {
                let vdr = self.find_vdr(VarRef::Name(name))?;
                (vdr.num, vdr.kind == VarKind::Z)
            }
        };
        let (head, count) = if z_chain {
            (adr.az_edr_head, adr.num_z_entries)
        } else {
            (adr.agr_edr_head, adr.num_gr_entries)
        };
        for aedr in self.entry_chain(head, count)? {
            if aedr.entry_num == entry_num {
                return self.decode_entry(&aedr);
            }
        }
        Err(Error::NotFound(format!(
            "attribute {} has no entry {entry_num}",
            adr.name
        )))
    }

    /// All global attributes: name to entries keyed by entry number.
    pub fn globalattsget(&self) -> Result<BTreeMap<String, BTreeMap<i32, Values>>, Error> {
        self.checked()?;
        let mut out = BTreeMap::new();
        for adr in &self.adrs {
            if adr.scope != Scope::Global {
                continue;
            }
            let mut entries = BTreeMap::new();
            for aedr in self.entry_chain(adr.agr_edr_head, adr.num_gr_entries)? {
                entries.insert(aedr.entry_num, self.decode_entry(&aedr)?.data);
            }
            if !entries.is_empty() {
                out.insert(adr.name.clone(), entries);
            }
        }
        Ok(out)
    }

    /// All variable-scope attribute entries attached to one variable.
    pub fn varattsget<'a>(
        &self,
        var: impl Into<VarRef<'a>>,
    ) -> Result<BTreeMap<String, Values>, Error> {
        self.checked()?;
        let vdr = self.find_vdr(var.into())?;
        let z = vdr.kind == VarKind::Z;
        let mut out = BTreeMap::new();
        for adr in &self.adrs {
            if adr.scope != Scope::Variable {
                continue;
            }
            let (head, count) = if z {
                (adr.az_edr_head, adr.num_z_entries)
            } else {
                (adr.agr_edr_head, adr.num_gr_entries)
            };
            for aedr in self.entry_chain(head, count)? {
                if aedr.entry_num == vdr.num {
                    out.insert(adr.name.clone(), self.decode_entry(&aedr)?.data);
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Reads a variable's data, full range.
    pub fn varget_all<'a>(&self, var: impl Into<VarRef<'a>>) -> Result<VarData, Error> {
        self.varget(var, &VarGetOptions::default())
    }

    /// Reads a variable's data with record- or time-range options.
    pub fn varget<'a>(
        &self,
        var: impl Into<VarRef<'a>>,
        options: &VarGetOptions,
    ) -> Result<VarData, Error> {
        self.checked()?;
        let vdr = self.find_vdr(var.into())?;
        if vdr.max_rec < 0 {
            return Err(Error::OutOfRange(format!(
                "variable {} has no written records",
                vdr.name
            )));
        }

        let (mut startrec, mut endrec) =
            if options.start_rec.is_some() || options.end_rec.is_some() {
                // record range wins over a simultaneous time range
                (
                    options.start_rec.unwrap_or(0),
                    options.end_rec.unwrap_or(vdr.max_rec as i64),
                )
            } else if options.start_time.is_some() || options.end_time.is_some() {
                match self.time_range_records(vdr, options)? {
                    Some(range) => range,
                    None => return self.empty_vardata(vdr),
                }
            } else {
                (0, vdr.max_rec as i64)
            };

        // out-of-range requests clamp to the written range
        if !vdr.rec_vary {
            startrec = 0;
            endrec = 0;
        } else {
            startrec = startrec.clamp(0, vdr.max_rec as i64);
            endrec = endrec.clamp(startrec, vdr.max_rec as i64);
        }

        self.read_records(vdr, startrec, endrec)
    }

    /// Record range of an epoch variable within a time window, or `None`
    /// when no records fall inside it.
    pub fn epochrange<'a>(
        &self,
        epoch_var: impl Into<VarRef<'a>>,
        start: Option<EpochValue>,
        end: Option<EpochValue>,
    ) -> Result<Option<(i64, i64)>, Error> {
        self.checked()?;
        let vdr = self.find_vdr(epoch_var.into())?;
        let options = VarGetOptions {
            start_time: start,
            end_time: end,
            ..Default::default()
        };
        self.time_range_records(vdr, &options)
    }

    // ---- internals ----

    fn checked(&self) -> Result<(), Error> {
        if let Some((expected, computed)) = self.checksum_error.take() {
            return Err(Error::ChecksumMismatch { expected, computed });
        }
        Ok(())
    }

    fn empty_vardata(&self, vdr: &Vdr) -> Result<VarData, Error> {
        let data_type = CdfType::from_code(vdr.data_type)?;
        let shape = vdr.shape();
        Ok(VarData {
            rec_ndim: shape.len(),
            rec_shape: shape,
            num_records: (vdr.max_rec + 1) as usize,
            records_returned: 0,
            data_type,
            data: codec::read_array(&[], data_type, 0, vdr.num_elems as usize, self.byte_order)?,
            real_records: None,
        })
    }

    /// Resolves a time window into a record range through the governing
    /// epoch variable.
    fn time_range_records(
        &self,
        vdr: &Vdr,
        options: &VarGetOptions,
    ) -> Result<Option<(i64, i64)>, Error> {
        let epoch_vdr = if let Some(name) = &options.epoch_var {
            self.find_vdr(VarRef::Name(name))?
        } else if CdfType::from_code(vdr.data_type)?.is_epoch_type() {
            vdr
        } else {
            let depend = self.attget("DEPEND_0", EntryRef::Var(&vdr.name)).map_err(|_| {
                Error::NotFound(format!(
                    "variable {} has no DEPEND_0 attribute; name its epoch variable explicitly",
                    vdr.name
                ))
            })?;
            let name = match depend.data {
                Values::Char(ref strings) if !strings.is_empty() => strings[0].clone(),
                _ => {
                    return Err(Error::Malformed(format!(
                        "DEPEND_0 of variable {} is not a variable name",
                        vdr.name
                    )))
                }
            };
            self.find_vdr(VarRef::Name(&name))?
        };

        let ty = CdfType::from_code(epoch_vdr.data_type)?;
        if !ty.is_epoch_type() {
            return Err(Error::OutOfRange(format!(
                "variable {} is not a CDF epoch type",
                epoch_vdr.name
            )));
        }
        let epochs = self
            .read_records(epoch_vdr, 0, epoch_vdr.max_rec as i64)?
            .data;
        let range = epochs::findepochrange(&epochs, options.start_time, options.end_time)?;
        Ok(range.map(|(a, b)| (a as i64, b as i64)))
    }

    /// Assembles `[startrec, endrec]` of a variable into decoded values.
    fn read_records(&self, vdr: &Vdr, startrec: i64, endrec: i64) -> Result<VarData, Error> {
        let image = self.image.bytes();
        let data_type = CdfType::from_code(vdr.data_type)?;
        let num_elems = vdr.num_elems.max(1) as usize;
        let value_size = data_type.byte_size(num_elems);
        let num_values = vdr.values_per_record();
        let rec_size = value_size * num_values;
        let total_recs = (endrec - startrec + 1) as usize;

        let segments = collect_segments(image, vdr.vxr_head)?;
        let mut stream = vec![0u8; rec_size * total_recs];

        if vdr.sparse == Sparseness::None {
            for seg in &segments {
                let (first, last) = (seg.first as i64, seg.last as i64);
                if last < startrec || first > endrec {
                    continue;
                }
                let block = read_data_block(image, seg.offset)?;
                let lo = first.max(startrec);
                let hi = last.min(endrec);
                let src_off = ((lo - first) as usize) * rec_size;
                let len = ((hi - lo + 1) as usize) * rec_size;
                if src_off + len > block.len() {
                    return Err(Error::Malformed(format!(
                        "data segment at offset {} is shorter than its VXR range",
                        seg.offset
                    )));
                }
                let dst_off = ((lo - startrec) as usize) * rec_size;
                stream[dst_off..dst_off + len].copy_from_slice(&block[src_off..src_off + len]);
            }
        } else {
            self.fill_sparse(vdr, &segments, startrec, endrec, rec_size, &mut stream)?;
        }

        // majority is a storage property; expose row-major at the boundary
        let shape = vdr.shape();
        if self.cdr.majority == Majority::Column && shape.len() > 1 && !data_type.is_string() {
            transpose_records(&mut stream, &shape, value_size);
        }

        let data = codec::read_array(
            &stream,
            data_type,
            total_recs * num_values,
            num_elems,
            self.byte_order,
        )?;

        let real_records = if vdr.sparse != Sparseness::None {
            let mut recs = Vec::new();
            for seg in &segments {
                recs.extend(seg.first as i64..=seg.last as i64);
            }
            Some(recs)
        } else {
            None
        };

        Ok(VarData {
            rec_ndim: shape.len(),
            rec_shape: shape,
            num_records: (vdr.max_rec + 1) as usize,
            records_returned: total_recs,
            data_type,
            data,
            real_records,
        })
    }

    /// One-record-at-a-time assembly for sparse variables, synthesizing
    /// gap records from the pad value or the previous physical record.
    fn fill_sparse(
        &self,
        vdr: &Vdr,
        segments: &[VxrEntry],
        startrec: i64,
        endrec: i64,
        rec_size: usize,
        stream: &mut [u8],
    ) -> Result<(), Error> {
        let image = self.image.bytes();
        let data_type = CdfType::from_code(vdr.data_type)?;
        let num_elems = vdr.num_elems.max(1) as usize;
        let value_size = data_type.byte_size(num_elems);

        let pad_value: Vec<u8> = match &vdr.pad {
            Some(bytes) => bytes[..value_size.min(bytes.len())].to_vec(),
            None => codec::write_array(
                &default_pad(data_type, num_elems),
                data_type,
                num_elems,
                self.byte_order,
            )?,
        };
        let pad_record: Vec<u8> = pad_value
            .iter()
            .cycle()
            .take(rec_size)
            .copied()
            .collect();

        let mut cur_idx: Option<usize> = None;
        let mut cur_data: Cow<'_, [u8]> = Cow::Borrowed(&[]);
        let mut pos = 0usize;
        for rec in startrec..=endrec {
            let (block_idx, prev_idx) = find_block(segments, rec);
            match (block_idx, prev_idx) {
                (Some(idx), _) => {
                    if cur_idx != Some(idx) {
                        cur_data = read_data_block(image, segments[idx].offset)?;
                        cur_idx = Some(idx);
                    }
                    let off = ((rec - segments[idx].first as i64) as usize) * rec_size;
                    if off + rec_size > cur_data.len() {
                        return Err(Error::Malformed(format!(
                            "data segment at offset {} is shorter than its VXR range",
                            segments[idx].offset
                        )));
                    }
                    stream[pos..pos + rec_size]
                        .copy_from_slice(&cur_data[off..off + rec_size]);
                }
                (None, Some(idx)) if vdr.sparse == Sparseness::Previous => {
                    let block = read_data_block(image, segments[idx].offset)?;
                    let last_off =
                        ((segments[idx].last - segments[idx].first) as usize) * rec_size;
                    if last_off + rec_size > block.len() {
                        return Err(Error::Malformed(format!(
                            "data segment at offset {} is shorter than its VXR range",
                            segments[idx].offset
                        )));
                    }
                    stream[pos..pos + rec_size]
                        .copy_from_slice(&block[last_off..last_off + rec_size]);
                }
                // pad policy, or previous-value with no preceding record
                _ => stream[pos..pos + rec_size].copy_from_slice(&pad_record),
            }
            pos += rec_size;
        }
        Ok(())
    }
}

/// Locates the segment containing `rec`, and the nearest segment at or
/// before it (for previous-value gap filling).
fn find_block(segments: &[VxrEntry], rec: i64) -> (Option<usize>, Option<usize>) {
    let mut prev = None;
    for (i, seg) in segments.iter().enumerate() {
        if (seg.first as i64) <= rec && rec <= seg.last as i64 {
            return (Some(i), Some(i));
        }
        if (seg.first as i64) > rec {
            break;
        }
        prev = Some(i);
    }
    (None, prev)
}

/// Transposes each record in `stream` from column-major to row-major
/// element order, in place via a scratch copy.
fn transpose_records(stream: &mut [u8], shape: &[usize], value_size: usize) {
    let values: usize = shape.iter().product();
    let rec_size = values * value_size;
    if rec_size == 0 {
        return;
    }
    // row-major strides of the logical shape
    let mut row_strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        row_strides[d] = row_strides[d + 1] * shape[d + 1];
    }
    // column-major strides: first dimension varies fastest
    let mut col_strides = vec![1usize; shape.len()];
    for d in 1..shape.len() {
        col_strides[d] = col_strides[d - 1] * shape[d - 1];
    }

    let mut scratch = vec![0u8; rec_size];
    for record in stream.chunks_exact_mut(rec_size) {
        scratch.copy_from_slice(record);
        for dst_idx in 0..values {
            // decompose the row-major linear index, accumulate the
            // column-major source offset
            let mut rem = dst_idx;
            let mut src_idx = 0usize;
            for d in 0..shape.len() {
                let coord = rem / row_strides[d];
                rem %= row_strides[d];
                src_idx += coord * col_strides[d];
            }
            record[dst_idx * value_size..(dst_idx + 1) * value_size]
                .copy_from_slice(&scratch[src_idx * value_size..(src_idx + 1) * value_size]);
        }
    }
}

/// Splits the 16-byte MD5 trailer off `bytes` and hashes the rest.
/// Returns `(expected, computed)` hex strings.
fn md5_trailer_check(bytes: &[u8]) -> Result<(String, String), Error> {
    if bytes.len() < 16 {
        return Err(Error::Malformed("file too small for an MD5 trailer".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 16);
    let mut hasher = Md5::new();
    hasher.update(body);
    let computed = hasher.finalize();
    let to_hex = |b: &[u8]| b.iter().map(|x| format!("{x:02x}")).collect::<String>();
    Ok((to_hex(trailer), to_hex(&computed)))
}
