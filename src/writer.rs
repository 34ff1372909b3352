//! CDF file writer.
//!
//! Records are appended as they are produced; chain heads, counts, and
//! the end-of-file offset are back-patched as the object graph grows.
//! [`Writer::close`] finalizes the GDR, optionally folds the whole
//! payload into a file-level CCR, and appends the MD5 trailer.
//!
//! The writer moves through `Open -> Dirty -> Closed`; any failed write
//! poisons it, after which only `close` is legal (and it aborts without
//! finalizing).

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder as _};
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};

use crate::codec;
use crate::epochs::{self, EpochValue, LEAP_TABLE_LAST_UPDATED};
use crate::error::Error;
use crate::models::{
    default_pad, record_type, ByteOrder, CdfType, Encoding, Epoch16, Majority, Sparseness, Values,
    BLOCKING_BYTES, GZIP_COMPRESSION, MAGIC_COMPRESSED, MAGIC_UNCOMPRESSED, MAGIC_V3, NAME_LEN,
    VXR_LEAF_ENTRIES, VXR_LEVEL_ENTRIES,
};
use crate::records::{
    emit_ccr, emit_cvvr, emit_vvr, patch, Adr, Aedr, Cdr, Cpr, Gdr, Scope, VarKind, Vdr, Vxr,
    CDR_SIZE,
};

const COPYRIGHT_TEXT: &str = "\nCommon Data Format (CDF)\nhttps://cdf.gsfc.nasa.gov\n\
                              Space Physics Data Facility\nNASA/Goddard Space Flight Center\n\
                              Greenbelt, Maryland 20771 USA\n\
                              (User support: gsfc-cdf-support@lists.nasa.gov)\n";

const MULTI_STRING_SEP: &str = "\\N ";

/// File-wide options for [`Writer::create`].
#[derive(Debug, Clone)]
pub struct CdfSpec {
    pub majority: Majority,
    pub encoding: Encoding,
    /// Append an MD5 trailer on close.
    pub checksum: bool,
    /// File-level gzip level 0-9; 0 disables the CCR.
    pub compression: i32,
    /// File-wide rVariable dimension sizes.
    pub rdim_sizes: Vec<i32>,
    /// Truncate a pre-existing file instead of failing.
    pub delete: bool,
}

impl Default for CdfSpec {
    fn default() -> Self {
        CdfSpec {
            majority: Majority::Column,
            encoding: Encoding::Host,
            checksum: false,
            compression: 0,
            rdim_sizes: Vec::new(),
            delete: false,
        }
    }
}

/// Specification of one variable for [`Writer::write_var`].
#[derive(Debug, Clone)]
pub struct VarSpec {
    pub name: String,
    pub data_type: CdfType,
    /// 1 for numeric types, the fixed character length for strings.
    pub num_elements: usize,
    pub rec_vary: bool,
    pub kind: VarKind,
    /// zVariables carry their own dimensions; rVariables use the
    /// file-wide sizes and this field is ignored.
    pub dim_sizes: Vec<i32>,
    /// rVariable dimension variances; zVariable dimensions always vary.
    pub dim_varys: Vec<bool>,
    pub sparse: Sparseness,
    /// Per-variable gzip level 0-9; 0 disables compression.
    pub compress: i32,
    /// Records per compressed chunk; auto-sized when too small.
    pub blocking_factor: i32,
    pub pad: Option<Values>,
}

impl VarSpec {
    /// A zVariable spec with the common defaults.
    pub fn z(name: &str, data_type: CdfType, dim_sizes: Vec<i32>) -> Self {
        VarSpec {
            name: name.into(),
            data_type,
            num_elements: 1,
            rec_vary: true,
            kind: VarKind::Z,
            dim_sizes,
            dim_varys: Vec::new(),
            sparse: Sparseness::None,
            compress: 0,
            blocking_factor: 1,
            pad: None,
        }
    }
}

/// One attribute entry value, with an optional explicit data type.
///
/// Without an explicit type the entry is stored as the canonical type of
/// the [`Values`] variant. Strings supplied for an epoch-typed entry are
/// parsed with [`crate::epochs::parse`].
#[derive(Debug, Clone)]
pub struct AttrVal {
    pub data: Values,
    pub data_type: Option<CdfType>,
}

impl AttrVal {
    pub fn typed(data: Values, data_type: CdfType) -> Self {
        AttrVal {
            data,
            data_type: Some(data_type),
        }
    }
}

impl From<Values> for AttrVal {
    fn from(data: Values) -> Self {
        AttrVal {
            data,
            data_type: None,
        }
    }
}

/// Variable data for [`Writer::write_var`].
#[derive(Debug, Clone)]
pub enum WriteData<'a> {
    /// Contiguous records starting at record 0.
    Dense(&'a Values),
    /// Sparse records: the physical record numbers plus the data. The
    /// data may hold exactly the physical records, or one record per
    /// index up to the maximum (virtual gap records are then dropped).
    Sparse(&'a [i64], &'a Values),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Dirty,
    Closed,
    Poisoned,
}

struct AttrSlot {
    name: String,
    scope: Scope,
    offset: u64,
    /// In-file AEDR chains, kept sorted by entry number:
    /// `(entry_num, aedr_offset)`.
    gr_entries: Vec<(i32, u64)>,
    z_entries: Vec<(i32, u64)>,
}

struct VarSlot {
    name: String,
    offset: u64,
}

/// Writer for CDF v3 files.
pub struct Writer {
    file: File,
    path: PathBuf,
    state: State,
    byte_order: ByteOrder,
    checksum: bool,
    compression: i32,
    rdim_sizes: Vec<i32>,
    gdr_offset: u64,
    attrs: Vec<AttrSlot>,
    zvars: Vec<VarSlot>,
    rvars: Vec<VarSlot>,
}

impl Writer {
    /// Creates a CDF file and writes the CDR/GDR skeleton.
    pub fn create(path: impl AsRef<Path>, spec: CdfSpec) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if path.exists() && !spec.delete {
            return Err(Error::Other(format!(
                "{} already exists; set delete to overwrite",
                path.display()
            )));
        }
        if !(0..=9).contains(&spec.compression) {
            return Err(Error::OutOfRange(format!(
                "file compression level {}",
                spec.compression
            )));
        }
        let encoding = spec.encoding.resolve();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut writer = Writer {
            file,
            path,
            state: State::Open,
            byte_order: encoding.byte_order(),
            checksum: spec.checksum,
            compression: spec.compression,
            rdim_sizes: spec.rdim_sizes.clone(),
            gdr_offset: 0,
            attrs: Vec::new(),
            zvars: Vec::new(),
            rvars: Vec::new(),
        };

        writer.file.write_all(&MAGIC_V3.to_be_bytes())?;
        writer.file.write_all(&MAGIC_UNCOMPRESSED.to_be_bytes())?;

        let cdr = Cdr {
            gdr_offset: 8 + CDR_SIZE,
            version: 3,
            release: 7,
            increment: 0,
            encoding,
            majority: spec.majority,
            single_file: true,
            md5: spec.checksum,
            copyright: COPYRIGHT_TEXT.into(),
        };
        writer.append(&cdr.emit())?;

        let gdr = Gdr {
            rvdr_head: 0,
            zvdr_head: 0,
            adr_head: 0,
            eof: 0,
            num_rvars: 0,
            num_attrs: 0,
            r_max_rec: -1,
            num_zvars: 0,
            leapsecond_updated: LEAP_TABLE_LAST_UPDATED,
            rdim_sizes: spec.rdim_sizes,
        };
        writer.gdr_offset = writer.append(&gdr.emit())?;
        Ok(writer)
    }

    /// Writes global attributes: attribute name to entries keyed by
    /// entry number.
    pub fn write_globalattrs(
        &mut self,
        attrs: &BTreeMap<String, BTreeMap<i32, AttrVal>>,
    ) -> Result<(), Error> {
        self.mutate(|w| {
            for (name, entries) in attrs {
                if w.find_attr(name).is_some() {
                    return Err(Error::Other(format!("attribute {name} already exists")));
                }
                let attr_idx = w.write_adr(name, Scope::Global)?;
                for (&entry_num, val) in entries {
                    w.write_attr_entry(attr_idx, entry_num, false, val)?;
                }
            }
            Ok(())
        })
    }

    /// Writes variable-scope attributes: attribute name to entries keyed
    /// by variable name. The named variables must already exist.
    pub fn write_variableattrs(
        &mut self,
        attrs: &BTreeMap<String, BTreeMap<String, AttrVal>>,
    ) -> Result<(), Error> {
        self.mutate(|w| {
            for (name, entries) in attrs {
                let attr_idx = match w.find_attr(name) {
                    Some(idx) if w.attrs[idx].scope == Scope::Global => {
                        return Err(Error::Other(format!("attribute {name} is global-scope")))
                    }
                    Some(idx) => idx,
                    None => w.write_adr(name, Scope::Variable)?,
                };
                for (var_name, val) in entries {
                    let (var_num, z) = w.find_var(var_name)?;
                    w.write_attr_entry_for_var(attr_idx, var_num, z, val)?;
                }
            }
            Ok(())
        })
    }

    /// Creates a variable and writes its attributes and data.
    pub fn write_var(
        &mut self,
        spec: &VarSpec,
        var_attrs: &BTreeMap<String, AttrVal>,
        data: Option<WriteData<'_>>,
    ) -> Result<(), Error> {
        self.mutate(|w| w.write_var_inner(spec, var_attrs, data))
    }

    /// Finalizes and flushes the file. Idempotent; on a poisoned writer
    /// it aborts, removing the partial file.
    pub fn close(mut self) -> Result<(), Error> {
        match self.state {
            State::Closed => return Ok(()),
            State::Poisoned => {
                self.state = State::Closed;
                let _ = std::fs::remove_file(&self.path);
                return Ok(());
            }
            State::Open | State::Dirty => {}
        }
        let eof = self.file.seek(SeekFrom::End(0))?;
        self.patch_i64(self.gdr_offset + patch::GDR_EOF, eof as i64)?;

        if self.compression > 0 {
            self.compress_whole_file()?;
        }
        if self.checksum {
            self.append_md5_trailer()?;
        }
        self.file.flush()?;
        self.state = State::Closed;
        Ok(())
    }

    // ---- low-level file plumbing ----

    /// Appends a record at the end of the file, returning its offset.
    fn append(&mut self, bytes: &[u8]) -> Result<u64, Error> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        Ok(offset)
    }

    fn patch_i32(&mut self, offset: u64, value: i32) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn patch_i64(&mut self, offset: u64, value: i64) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn read_i32(&mut self, offset: u64) -> Result<i32, Error> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; 4];
        self.file.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Runs a mutation under the state machine: `Open -> Dirty`, any
    /// error poisons the writer.
    fn mutate<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        match self.state {
            State::Closed => return Err(Error::Closed),
            State::Poisoned => return Err(Error::Poisoned),
            State::Open | State::Dirty => {}
        }
        match f(self) {
            Ok(v) => {
                self.state = State::Dirty;
                Ok(v)
            }
            Err(e) => {
                self.state = State::Poisoned;
                Err(e)
            }
        }
    }

    fn find_attr(&self, name: &str) -> Option<usize> {
        self.attrs
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))
    }

    fn find_var(&self, name: &str) -> Result<(i32, bool), Error> {
        if let Some(i) = self
            .zvars
            .iter()
            .position(|v| v.name.eq_ignore_ascii_case(name))
        {
            return Ok((i as i32, true));
        }
        if let Some(i) = self
            .rvars
            .iter()
            .position(|v| v.name.eq_ignore_ascii_case(name))
        {
            return Ok((i as i32, false));
        }
        Err(Error::NotFound(format!("variable {name}")))
    }

    fn check_name(name: &str) -> Result<(), Error> {
        if name.is_empty() || name.len() > NAME_LEN {
            return Err(Error::OutOfRange(format!(
                "name must be 1..={NAME_LEN} bytes, got {}",
                name.len()
            )));
        }
        Ok(())
    }

    // ---- attributes ----

    /// Emits an ADR, links it into the attribute chain, and bumps the
    /// GDR attribute count. Returns the slot index.
    fn write_adr(&mut self, name: &str, scope: Scope) -> Result<usize, Error> {
        Self::check_name(name)?;
        let num = self.attrs.len();
        let adr = Adr {
            next: 0,
            agr_edr_head: 0,
            scope,
            num: num as i32,
            num_gr_entries: 0,
            max_gr_entry: -1,
            az_edr_head: 0,
            num_z_entries: 0,
            max_z_entry: -1,
            name: name.into(),
        };
        let offset = self.append(&adr.emit())?;
        if let Some(prev) = self.attrs.last() {
            let prev_offset = prev.offset;
            self.patch_i64(prev_offset + patch::ADR_NEXT, offset as i64)?;
        } else {
            self.patch_i64(self.gdr_offset + patch::GDR_ADR_HEAD, offset as i64)?;
        }
        self.patch_i32(self.gdr_offset + patch::GDR_NUM_ATTR, num as i32 + 1)?;
        self.attrs.push(AttrSlot {
            name: name.into(),
            scope,
            offset,
            gr_entries: Vec::new(),
            z_entries: Vec::new(),
        });
        Ok(num)
    }

    /// Resolves an entry's data type, element count, string count, and
    /// encoded bytes.
    fn prepare_entry(
        &self,
        val: &AttrVal,
        var_scope: bool,
    ) -> Result<(CdfType, usize, i32, Vec<u8>), Error> {
        let ty = val.data_type.unwrap_or_else(|| val.data.data_type());
        match &val.data {
            Values::Char(strings) if ty.is_epoch_type() => {
                // encoded epoch strings; parse into the target type
                let parsed = parse_epoch_strings(strings, ty)?;
                let bytes = codec::write_array(&parsed, ty, 1, self.byte_order)?;
                Ok((ty, parsed.len(), 0, bytes))
            }
            Values::Char(strings) => {
                if strings.is_empty() {
                    return Err(Error::Other("empty string attribute entry".into()));
                }
                let joined = strings.join(MULTI_STRING_SEP);
                let num_elems = joined.len();
                let num_strings = if var_scope { strings.len() as i32 } else { 0 };
                let bytes = codec::write_array(
                    &Values::Char(vec![joined]),
                    ty,
                    num_elems,
                    self.byte_order,
                )?;
                Ok((ty, num_elems, num_strings, bytes))
            }
            other => {
                if other.is_empty() {
                    return Err(Error::Other("empty attribute entry".into()));
                }
                let bytes = codec::write_array(other, ty, 1, self.byte_order)?;
                Ok((ty, other.len(), 0, bytes))
            }
        }
    }

    /// Writes a g-entry of a global attribute.
    fn write_attr_entry(
        &mut self,
        attr_idx: usize,
        entry_num: i32,
        z_chain: bool,
        val: &AttrVal,
    ) -> Result<(), Error> {
        let (ty, num_elems, num_strings, bytes) = self.prepare_entry(val, false)?;
        self.insert_aedr(attr_idx, entry_num, z_chain, ty, num_elems, num_strings, bytes)
    }

    /// Writes the entry of a variable-scope attribute for one variable.
    fn write_attr_entry_for_var(
        &mut self,
        attr_idx: usize,
        var_num: i32,
        z: bool,
        val: &AttrVal,
    ) -> Result<(), Error> {
        let (ty, num_elems, num_strings, bytes) = self.prepare_entry(val, true)?;
        self.insert_aedr(attr_idx, var_num, z, ty, num_elems, num_strings, bytes)
    }

    /// Emits an AEDR and splices it into the attribute's entry chain,
    /// keeping the chain sorted by entry number.
    #[allow(clippy::too_many_arguments)]
    fn insert_aedr(
        &mut self,
        attr_idx: usize,
        entry_num: i32,
        z_chain: bool,
        ty: CdfType,
        num_elems: usize,
        num_strings: i32,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        let adr_offset = self.attrs[attr_idx].offset;
        let (pos, prev, next) = {
            let entries = if z_chain {
                &self.attrs[attr_idx].z_entries
            } else {
                &self.attrs[attr_idx].gr_entries
            };
            if entries.iter().any(|&(n, _)| n == entry_num) {
                return Err(Error::Other(format!(
                    "attribute {} already has entry {entry_num}",
                    self.attrs[attr_idx].name
                )));
            }
            let pos = entries.partition_point(|&(n, _)| n < entry_num);
            (
                pos,
                pos.checked_sub(1).map(|p| entries[p].1),
                entries.get(pos).map(|&(_, o)| o),
            )
        };

        let aedr = Aedr {
            rtype: if z_chain {
                record_type::AZ_EDR
            } else {
                record_type::AGR_EDR
            },
            next: 0,
            attr_num: attr_idx as i32,
            data_type: ty.code(),
            entry_num,
            num_elems: num_elems as i32,
            num_strings,
            value,
        };
        let offset = self.append(&aedr.emit())?;

        let entries = if z_chain {
            &mut self.attrs[attr_idx].z_entries
        } else {
            &mut self.attrs[attr_idx].gr_entries
        };
        entries.insert(pos, (entry_num, offset));
        let count = entries.len() as i32;
        let max_entry = entries.last().map(|&(n, _)| n).unwrap_or(-1);

        // splice: predecessor (or the ADR head) points here, we point at
        // the successor
        match prev {
            Some(prev_offset) => self.patch_i64(prev_offset + patch::AEDR_NEXT, offset as i64)?,
            None => {
                let head_field = if z_chain {
                    patch::ADR_AZ_EDR_HEAD
                } else {
                    patch::ADR_AGR_EDR_HEAD
                };
                self.patch_i64(adr_offset + head_field, offset as i64)?;
            }
        }
        if let Some(next_offset) = next {
            self.patch_i64(offset + patch::AEDR_NEXT, next_offset as i64)?;
        }
        let (count_field, max_field) = if z_chain {
            (patch::ADR_NZ_ENTRIES, patch::ADR_MAX_Z_ENTRY)
        } else {
            (patch::ADR_NGR_ENTRIES, patch::ADR_MAX_GR_ENTRY)
        };
        self.patch_i32(adr_offset + count_field, count)?;
        self.patch_i32(adr_offset + max_field, max_entry)?;
        Ok(())
    }

    // ---- variables ----

    fn write_var_inner(
        &mut self,
        spec: &VarSpec,
        var_attrs: &BTreeMap<String, AttrVal>,
        data: Option<WriteData<'_>>,
    ) -> Result<(), Error> {
        Self::check_name(&spec.name)?;
        if self.find_var(&spec.name).is_ok() {
            return Err(Error::Other(format!(
                "variable {} already exists",
                spec.name
            )));
        }
        if spec.data_type.is_string() {
            if spec.num_elements < 1 {
                return Err(Error::OutOfRange(
                    "string variables need a positive element count".into(),
                ));
            }
        } else if spec.num_elements != 1 {
            return Err(Error::OutOfRange(
                "numeric variables carry exactly one element per value".into(),
            ));
        }
        let compress = spec.compress.clamp(0, 9);

        let (dim_sizes, dim_varys) = match spec.kind {
            VarKind::Z => (
                spec.dim_sizes.clone(),
                vec![true; spec.dim_sizes.len()],
            ),
            VarKind::R => {
                if spec.dim_varys.len() != self.rdim_sizes.len() {
                    return Err(Error::OutOfRange(format!(
                        "rVariable dimension variance length {} does not match the \
                         file's {} rDimensions",
                        spec.dim_varys.len(),
                        self.rdim_sizes.len()
                    )));
                }
                (self.rdim_sizes.clone(), spec.dim_varys.clone())
            }
        };

        let pad_values = match &spec.pad {
            Some(p) => p.clone(),
            None => default_pad(spec.data_type, spec.num_elements),
        };
        let pad_bytes = codec::write_array(
            &pad_values,
            spec.data_type,
            spec.num_elements,
            self.byte_order,
        )?;

        let cpr_offset = if compress > 0 {
            self.append(
                &Cpr {
                    ctype: GZIP_COMPRESSION,
                    parameter: compress,
                }
                .emit(),
            )?
        } else {
            0
        };

        let num = match spec.kind {
            VarKind::Z => self.zvars.len(),
            VarKind::R => self.rvars.len(),
        };
        let vdr = Vdr {
            kind: spec.kind,
            next: 0,
            data_type: spec.data_type.code(),
            max_rec: -1,
            vxr_head: 0,
            vxr_tail: 0,
            rec_vary: spec.rec_vary,
            compressed: false,
            sparse: spec.sparse,
            num_elems: spec.num_elements as i32,
            num: num as i32,
            cpr_offset,
            blocking_factor: spec.blocking_factor.max(1),
            name: spec.name.clone(),
            dim_sizes: dim_sizes.clone(),
            dim_varys: dim_varys.clone(),
            pad: Some(pad_bytes),
        };
        let vdr_offset = self.append(&vdr.emit())?;

        let num_values: usize = dim_sizes
            .iter()
            .zip(&dim_varys)
            .filter(|(_, &v)| v)
            .map(|(&s, _)| s as usize)
            .product();

        let (prev_offset, head_field, count_field) = match spec.kind {
            VarKind::Z => (
                self.zvars.last().map(|v| v.offset),
                patch::GDR_ZVDR_HEAD,
                patch::GDR_NZ_VARS,
            ),
            VarKind::R => (
                self.rvars.last().map(|v| v.offset),
                patch::GDR_RVDR_HEAD,
                patch::GDR_NR_VARS,
            ),
        };
        match prev_offset {
            Some(prev) => self.patch_i64(prev + patch::VDR_NEXT, vdr_offset as i64)?,
            None => self.patch_i64(self.gdr_offset + head_field, vdr_offset as i64)?,
        }
        self.patch_i32(self.gdr_offset + count_field, num as i32 + 1)?;

        let slot = VarSlot {
            name: spec.name.clone(),
            offset: vdr_offset,
        };
        match spec.kind {
            VarKind::Z => self.zvars.push(slot),
            VarKind::R => self.rvars.push(slot),
        }

        for (attr_name, val) in var_attrs {
            let attr_idx = match self.find_attr(attr_name) {
                Some(idx) if self.attrs[idx].scope == Scope::Global => {
                    return Err(Error::Other(format!(
                        "attribute {attr_name} is global-scope"
                    )))
                }
                Some(idx) => idx,
                None => self.write_adr(attr_name, Scope::Variable)?,
            };
            self.write_attr_entry_for_var(
                attr_idx,
                num as i32,
                spec.kind == VarKind::Z,
                val,
            )?;
        }

        let max_rec = match data {
            None => -1,
            Some(WriteData::Dense(values)) => {
                self.write_dense_records(spec, vdr_offset, num_values, compress, values)?
            }
            Some(WriteData::Sparse(records, values)) => {
                if spec.sparse == Sparseness::None {
                    return Err(Error::Other(format!(
                        "variable {} is not sparse; write dense data",
                        spec.name
                    )));
                }
                self.write_sparse_records(spec, vdr_offset, num_values, records, values)?
            }
        };
        if max_rec >= 0 {
            self.patch_i32(vdr_offset + patch::VDR_MAX_REC, max_rec)?;
            if spec.kind == VarKind::R {
                let cur = self.read_i32(self.gdr_offset + patch::GDR_R_MAX_REC)?;
                if max_rec > cur {
                    self.patch_i32(self.gdr_offset + patch::GDR_R_MAX_REC, max_rec)?;
                }
            }
        }
        Ok(())
    }

    fn values_to_records(
        &self,
        spec: &VarSpec,
        num_values: usize,
        values: &Values,
    ) -> Result<(usize, Vec<u8>), Error> {
        let bytes = codec::write_array(
            values,
            spec.data_type,
            spec.num_elements,
            self.byte_order,
        )?;
        let count = values.len();
        if num_values == 0 || count % num_values != 0 {
            return Err(Error::OutOfRange(format!(
                "{count} values do not divide into records of {num_values}"
            )));
        }
        Ok((count / num_values, bytes))
    }

    /// Writes dense records as VVR/CVVR chunks indexed by a VXR tree.
    /// Returns the last record number.
    fn write_dense_records(
        &mut self,
        spec: &VarSpec,
        vdr_offset: u64,
        num_values: usize,
        compress: i32,
        values: &Values,
    ) -> Result<i32, Error> {
        let (mut recs, bytes) = self.values_to_records(spec, num_values, values)?;
        if !spec.rec_vary {
            recs = 1;
        }
        if recs == 0 {
            return Ok(-1);
        }
        let rec_size = spec.data_type.byte_size(spec.num_elements) * num_values;

        if compress == 0 {
            let vvr_offset = self.append(&emit_vvr(&bytes[..recs * rec_size]))?;
            let vxr_offset = self.append(&Vxr::emit_empty(VXR_LEAF_ENTRIES))?;
            self.use_vxr_entry(vxr_offset, VXR_LEAF_ENTRIES, 0, 0, recs as i32 - 1, vvr_offset)?;
            self.patch_i64(vdr_offset + patch::VDR_VXR_HEAD, vxr_offset as i64)?;
            self.patch_i64(vdr_offset + patch::VDR_VXR_TAIL, vxr_offset as i64)?;
            return Ok(recs as i32 - 1);
        }

        // chunk by blocking factor, compress each chunk, keep the raw
        // VVR whenever gzip does not win
        let default_bf = BLOCKING_BYTES.div_ceil(rec_size).max(1);
        let mut bf = (spec.blocking_factor.max(1) as usize).max(default_bf);
        if recs < bf {
            bf = recs;
        }
        let blocks = recs.div_ceil(bf);

        let mut vdr_flagged = false;
        let mut leaves: Vec<(u64, i32, i32)> = Vec::new();
        let mut used = 0usize;
        for b in 0..blocks {
            let start_rec = b * bf;
            let end_rec = ((b + 1) * bf - 1).min(recs - 1);
            let chunk = &bytes[start_rec * rec_size..(end_rec + 1) * rec_size];

            let mut enc = GzEncoder::new(Vec::new(), Compression::new(compress as u32));
            enc.write_all(chunk).map_err(|e| Error::Compression {
                offset: vdr_offset,
                source: e,
            })?;
            let compressed = enc.finish().map_err(|e| Error::Compression {
                offset: vdr_offset,
                source: e,
            })?;

            let block_offset = if compressed.len() < chunk.len() {
                if !vdr_flagged {
                    let flags = self.read_i32(vdr_offset + patch::VDR_FLAGS)?;
                    self.patch_i32(
                        vdr_offset + patch::VDR_FLAGS,
                        flags | crate::models::vdr_flags::COMPRESSED as i32,
                    )?;
                    self.patch_i32(vdr_offset + patch::VDR_BLOCKING_FACTOR, bf as i32)?;
                    vdr_flagged = true;
                }
                self.append(&emit_cvvr(&compressed))?
            } else {
                // not worth compressing; keep the raw records
                self.append(&emit_vvr(chunk))?
            };

            match leaves.last().copied() {
                Some((vxr, _, _)) if used < VXR_LEAF_ENTRIES => {
                    self.use_vxr_entry(
                        vxr,
                        VXR_LEAF_ENTRIES,
                        used,
                        start_rec as i32,
                        end_rec as i32,
                        block_offset,
                    )?;
                    used += 1;
                    if let Some(last) = leaves.last_mut() {
                        last.2 = end_rec as i32;
                    }
                }
                prev => {
                    let vxr = self.append(&Vxr::emit_empty(VXR_LEAF_ENTRIES))?;
                    self.use_vxr_entry(
                        vxr,
                        VXR_LEAF_ENTRIES,
                        0,
                        start_rec as i32,
                        end_rec as i32,
                        block_offset,
                    )?;
                    used = 1;
                    match prev {
                        Some((prev_vxr, _, _)) => {
                            self.patch_i64(prev_vxr + patch::VXR_NEXT, vxr as i64)?;
                        }
                        None => {
                            self.patch_i64(vdr_offset + patch::VDR_VXR_HEAD, vxr as i64)?;
                        }
                    }
                    self.patch_i64(vdr_offset + patch::VDR_VXR_TAIL, vxr as i64)?;
                    leaves.push((vxr, start_rec as i32, end_rec as i32));
                }
            }
        }

        if leaves.len() > VXR_LEVEL_ENTRIES {
            let (head, tail) = self.add_vxr_levels(leaves)?;
            self.patch_i64(vdr_offset + patch::VDR_VXR_HEAD, head as i64)?;
            self.patch_i64(vdr_offset + patch::VDR_VXR_TAIL, tail as i64)?;
        }
        Ok(recs as i32 - 1)
    }

    /// Interposes a level of parent VXRs over `nodes`, recursively,
    /// until at most [`VXR_LEVEL_ENTRIES`] roots remain. Returns the new
    /// head and tail offsets.
    fn add_vxr_levels(&mut self, nodes: Vec<(u64, i32, i32)>) -> Result<(u64, u64), Error> {
        // children become tree nodes; break their sibling links
        for &(offset, _, _) in &nodes {
            self.patch_i64(offset + patch::VXR_NEXT, 0)?;
        }
        let mut parents: Vec<(u64, i32, i32)> = Vec::new();
        for chunk in nodes.chunks(VXR_LEVEL_ENTRIES) {
            let parent = self.append(&Vxr::emit_empty(VXR_LEVEL_ENTRIES))?;
            for (i, &(child, first, last)) in chunk.iter().enumerate() {
                self.use_vxr_entry(parent, VXR_LEVEL_ENTRIES, i, first, last, child)?;
            }
            if let Some(&(prev, _, _)) = parents.last() {
                self.patch_i64(prev + patch::VXR_NEXT, parent as i64)?;
            }
            parents.push((parent, chunk[0].1, chunk[chunk.len() - 1].2));
        }
        if parents.len() > VXR_LEVEL_ENTRIES {
            return self.add_vxr_levels(parents);
        }
        let head = parents[0].0;
        let tail = parents[parents.len() - 1].0;
        Ok((head, tail))
    }

    /// Writes sparse records. Consecutive physical record numbers
    /// coalesce into one VVR per run; data may carry only the physical
    /// records or one record per index with virtual gap records embedded.
    fn write_sparse_records(
        &mut self,
        spec: &VarSpec,
        vdr_offset: u64,
        num_values: usize,
        records: &[i64],
        values: &Values,
    ) -> Result<i32, Error> {
        let (recs, bytes) = self.values_to_records(spec, num_values, values)?;
        let rec_size = spec.data_type.byte_size(spec.num_elements) * num_values;

        if records.windows(2).any(|w| w[1] <= w[0]) || records.iter().any(|&r| r < 0) {
            return Err(Error::OutOfRange(
                "sparse record numbers must be non-negative and strictly increasing".into(),
            ));
        }
        let physical_only = recs == records.len();
        if !physical_only {
            let span = records.last().map(|&r| r + 1).unwrap_or(0);
            if (recs as i64) < span {
                return Err(Error::OutOfRange(format!(
                    "{recs} data records cannot cover sparse indices up to {span}"
                )));
            }
        }

        let runs = make_blocks(records);
        let mut leaves: Vec<(u64, i32, i32)> = Vec::new();
        let mut used = 0usize;
        let mut consumed = 0usize;
        let mut max_rec = -1i32;
        for &(first, last) in &runs {
            let run_len = (last - first + 1) as usize;
            let chunk = if physical_only {
                let start = consumed * rec_size;
                consumed += run_len;
                &bytes[start..start + run_len * rec_size]
            } else {
                // virtual records are embedded: slice by record number
                &bytes[first as usize * rec_size..(last as usize + 1) * rec_size]
            };
            let vvr_offset = self.append(&emit_vvr(chunk))?;

            match leaves.last().copied() {
                Some((vxr, _, _)) if used < VXR_LEAF_ENTRIES => {
                    self.use_vxr_entry(
                        vxr,
                        VXR_LEAF_ENTRIES,
                        used,
                        first as i32,
                        last as i32,
                        vvr_offset,
                    )?;
                    used += 1;
                }
                prev => {
                    let vxr = self.append(&Vxr::emit_empty(VXR_LEAF_ENTRIES))?;
                    self.use_vxr_entry(
                        vxr,
                        VXR_LEAF_ENTRIES,
                        0,
                        first as i32,
                        last as i32,
                        vvr_offset,
                    )?;
                    used = 1;
                    match prev {
                        Some((prev_vxr, _, _)) => {
                            self.patch_i64(prev_vxr + patch::VXR_NEXT, vxr as i64)?;
                        }
                        None => {
                            self.patch_i64(vdr_offset + patch::VDR_VXR_HEAD, vxr as i64)?;
                        }
                    }
                    self.patch_i64(vdr_offset + patch::VDR_VXR_TAIL, vxr as i64)?;
                    leaves.push((vxr, first as i32, last as i32));
                }
            }
            max_rec = max_rec.max(last as i32);
        }
        Ok(max_rec)
    }

    /// Fills slot `used` of the VXR at `vxr_offset` and bumps its
    /// used-entry count.
    fn use_vxr_entry(
        &mut self,
        vxr_offset: u64,
        n_entries: usize,
        used: usize,
        first: i32,
        last: i32,
        target: u64,
    ) -> Result<(), Error> {
        let firsts = vxr_offset + 28;
        let lasts = firsts + 4 * n_entries as u64;
        let offsets = lasts + 4 * n_entries as u64;
        self.patch_i32(firsts + 4 * used as u64, first)?;
        self.patch_i32(lasts + 4 * used as u64, last)?;
        self.patch_i64(offsets + 8 * used as u64, target as i64)?;
        self.patch_i32(vxr_offset + patch::VXR_N_USED, used as i32 + 1)?;
        Ok(())
    }

    // ---- close helpers ----

    /// Rewrites the file as `magic || CCR(gzip(payload)) || CPR`.
    fn compress_whole_file(&mut self) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(8))?;
        let mut payload = Vec::new();
        self.file.read_to_end(&mut payload)?;

        let mut enc = GzEncoder::new(Vec::new(), Compression::new(self.compression as u32));
        enc.write_all(&payload).map_err(|e| Error::Compression {
            offset: 8,
            source: e,
        })?;
        let compressed = enc.finish().map_err(|e| Error::Compression {
            offset: 8,
            source: e,
        })?;

        let mut out = Vec::with_capacity(compressed.len() + 64);
        out.extend_from_slice(&MAGIC_V3.to_be_bytes());
        out.extend_from_slice(&MAGIC_COMPRESSED.to_be_bytes());
        let ccr_offset = out.len() as u64;
        out.extend_from_slice(&emit_ccr(&compressed, payload.len() as u64));
        let cpr_offset = out.len() as u64;
        out.extend_from_slice(
            &Cpr {
                ctype: GZIP_COMPRESSION,
                parameter: self.compression,
            }
            .emit(),
        );
        BigEndian::write_i64(
            &mut out[(ccr_offset + patch::CCR_CPR_OFFSET) as usize..][..8],
            cpr_offset as i64,
        );

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&out)?;
        Ok(())
    }

    fn append_md5_trailer(&mut self) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; 16384];
        loop {
            let n = self.file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize();
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&digest)?;
        Ok(())
    }
}

/// Groups sorted record numbers into maximal consecutive runs.
fn make_blocks(records: &[i64]) -> Vec<(i64, i64)> {
    let mut blocks = Vec::new();
    let mut iter = records.iter().copied();
    let Some(mut start) = iter.next() else {
        return blocks;
    };
    let mut prev = start;
    for rec in iter {
        if rec != prev + 1 {
            blocks.push((start, prev));
            start = rec;
        }
        prev = rec;
    }
    blocks.push((start, prev));
    blocks
}

/// Parses encoded epoch strings into values of the given epoch type.
fn parse_epoch_strings(strings: &[String], ty: CdfType) -> Result<Values, Error> {
    match ty {
        CdfType::Epoch => {
            let mut out = Vec::with_capacity(strings.len());
            for s in strings {
                match epochs::parse(s)? {
                    EpochValue::Epoch(e) => out.push(e),
                    _ => {
                        return Err(Error::OutOfRange(format!("{s} is not a CDF_EPOCH string")))
                    }
                }
            }
            Ok(Values::Epoch(out))
        }
        CdfType::Epoch16 => {
            let mut out: Vec<Epoch16> = Vec::with_capacity(strings.len());
            for s in strings {
                match epochs::parse(s)? {
                    EpochValue::Epoch16(e) => out.push(e),
                    _ => {
                        return Err(Error::OutOfRange(format!(
                            "{s} is not a CDF_EPOCH16 string"
                        )))
                    }
                }
            }
            Ok(Values::Epoch16(out))
        }
        CdfType::TimeTt2000 => {
            let mut out = Vec::with_capacity(strings.len());
            for s in strings {
                match epochs::parse(s)? {
                    EpochValue::TimeTt2000(t) => out.push(t),
                    _ => {
                        return Err(Error::OutOfRange(format!(
                            "{s} is not a CDF_TIME_TT2000 string"
                        )))
                    }
                }
            }
            Ok(Values::TimeTt2000(out))
        }
        _ => Err(Error::OutOfRange(format!(
            "{} is not an epoch type",
            ty.name()
        ))),
    }
}
