//! # cdfio
//!
//! A pure-Rust reader and writer for CDF version 3 files (the Common
//! Data Format used by space-physics archives), independent of the NASA
//! reference library. Covers large-file layout, file- and variable-level
//! GZIP compression, sparse records, multi-dimensional variables in
//! either majority, whole-file MD5 validation, and the three CDF epoch
//! types with leap-second-exact TT2000 conversions.
//!
//! ## Reading
//!
//! ```no_run
//! use cdfio::Reader;
//!
//! let cdf = Reader::open("mms1_fgm_srvy.cdf")?;
//! let info = cdf.info();
//! println!("{} zVariables", info.z_variables.len());
//!
//! let b_field = cdf.varget_all("B_gse")?;
//! println!("{} records of {:?}", b_field.records_returned, b_field.rec_shape);
//! # Ok::<(), cdfio::Error>(())
//! ```
//!
//! ## Writing
//!
//! ```no_run
//! use cdfio::{CdfSpec, CdfType, Values, VarSpec, WriteData, Writer};
//!
//! let mut writer = Writer::create("output.cdf", CdfSpec::default())?;
//! let density = Values::Real8(vec![4.9, 5.1, 5.0]);
//! writer.write_var(
//!     &VarSpec::z("density", CdfType::Double, vec![]),
//!     &Default::default(),
//!     Some(WriteData::Dense(&density)),
//! )?;
//! writer.close()?;
//! # Ok::<(), cdfio::Error>(())
//! ```
//!
//! ## Epochs
//!
//! ```
//! use cdfio::epochs;
//!
//! // the leap second inserted at the end of 2016
//! let t = epochs::compute_tt2000(&[2016.0, 12.0, 31.0, 23.0, 59.0, 60.0, 500.0])?;
//! assert_eq!(epochs::encode_tt2000(t, true), "2016-12-31T23:59:60.500000000");
//! # Ok::<(), cdfio::Error>(())
//! ```

pub mod codec;
pub mod epochs;
pub mod error;
pub mod models;
pub mod reader;
pub mod records;
pub mod writer;

pub use epochs::EpochValue;
pub use error::Error;
pub use models::{CdfType, Encoding, Epoch16, Majority, Sparseness, Values};
pub use reader::{
    AttData, AttInfo, AttrRef, CdfInfo, EntryRef, Reader, VarData, VarGetOptions, VarInfo, VarRef,
};
pub use records::{Scope, VarKind};
pub use writer::{AttrVal, CdfSpec, VarSpec, WriteData, Writer};

/// Opens a CDF file for reading. Shorthand for [`Reader::open`].
pub fn open(path: impl AsRef<std::path::Path>) -> Result<Reader, Error> {
    Reader::open(path)
}
