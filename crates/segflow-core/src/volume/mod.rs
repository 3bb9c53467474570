//! Volumetric artifact codec.
//!
//! Reads single-file NIfTI-1 images (`.nii`, or gzip-compressed `.nii.gz`)
//! into a [`Volume`] holding the raw header and typed voxel samples, and
//! writes them back gzip-compressed. Only 3-D volumes are handled; a fourth
//! or higher dimension is accepted only with extent 1.

mod header;
mod resample;

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

pub use header::{DataType, HEADER_SIZE, NiftiHeader, SINGLE_FILE_OFFSET};
pub use resample::Interpolation;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated volume: needed {needed} bytes, found {available}")]
    Truncated { needed: usize, available: usize },

    #[error("invalid NIfTI header: {0}")]
    BadHeader(String),

    #[error("unsupported NIfTI datatype code {0}")]
    UnsupportedDatatype(i16),

    #[error("unsupported volume: {0}")]
    Unsupported(String),
}

// ── samples ──────────────────────────────────────────────────────────────────

/// A primitive voxel type that can be read from and written to a NIfTI
/// byte stream.
pub trait Sample: Copy + Send + Sync + 'static {
    const DATATYPE: DataType;

    /// Decode one sample; `bytes` holds exactly the sample's width.
    fn read(bytes: &[u8], big_endian: bool) -> Self;
    fn write(self, out: &mut Vec<u8>, big_endian: bool);
    fn to_f64(self) -> f64;
    /// Convert an interpolated value back, rounding and saturating for
    /// integer types.
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_sample {
    (@io $t:ty, $width:expr) => {
        fn read(bytes: &[u8], big_endian: bool) -> Self {
            let arr: [u8; $width] = std::array::from_fn(|i| bytes[i]);
            if big_endian { <$t>::from_be_bytes(arr) } else { <$t>::from_le_bytes(arr) }
        }

        fn write(self, out: &mut Vec<u8>, big_endian: bool) {
            if big_endian {
                out.extend_from_slice(&self.to_be_bytes());
            } else {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }

        fn to_f64(self) -> f64 {
            self as f64
        }
    };
    ($t:ty, $dt:expr, $width:expr, int) => {
        impl Sample for $t {
            const DATATYPE: DataType = $dt;
            impl_sample!(@io $t, $width);
            fn from_f64(value: f64) -> Self {
                value.round() as $t
            }
        }
    };
    ($t:ty, $dt:expr, $width:expr, float) => {
        impl Sample for $t {
            const DATATYPE: DataType = $dt;
            impl_sample!(@io $t, $width);
            fn from_f64(value: f64) -> Self {
                value as $t
            }
        }
    };
}

impl_sample!(u8, DataType::U8, 1, int);
impl_sample!(i8, DataType::I8, 1, int);
impl_sample!(i16, DataType::I16, 2, int);
impl_sample!(u16, DataType::U16, 2, int);
impl_sample!(i32, DataType::I32, 4, int);
impl_sample!(u32, DataType::U32, 4, int);
impl_sample!(f32, DataType::F32, 4, float);
impl_sample!(f64, DataType::F64, 8, float);

/// Voxel samples in file order (x fastest, then y, then z).
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Run `$body` with `$v` bound to the inner `Vec` of any variant.
macro_rules! with_samples {
    ($data:expr, |$v:ident| $body:expr) => {
        match $data {
            VoxelData::U8($v) => $body,
            VoxelData::I8($v) => $body,
            VoxelData::I16($v) => $body,
            VoxelData::U16($v) => $body,
            VoxelData::I32($v) => $body,
            VoxelData::U32($v) => $body,
            VoxelData::F32($v) => $body,
            VoxelData::F64($v) => $body,
        }
    };
}

/// Like [`with_samples!`], re-wrapping the resulting `Vec` in the same variant.
macro_rules! map_samples {
    ($data:expr, |$v:ident| $body:expr) => {
        match $data {
            VoxelData::U8($v) => VoxelData::U8($body),
            VoxelData::I8($v) => VoxelData::I8($body),
            VoxelData::I16($v) => VoxelData::I16($body),
            VoxelData::U16($v) => VoxelData::U16($body),
            VoxelData::I32($v) => VoxelData::I32($body),
            VoxelData::U32($v) => VoxelData::U32($body),
            VoxelData::F32($v) => VoxelData::F32($body),
            VoxelData::F64($v) => VoxelData::F64($body),
        }
    };
}

pub(crate) use map_samples;

impl VoxelData {
    fn decode(bytes: &[u8], datatype: DataType, big_endian: bool) -> Self {
        fn collect<T: Sample>(bytes: &[u8], big_endian: bool) -> Vec<T> {
            bytes
                .chunks_exact(T::DATATYPE.byte_size())
                .map(|chunk| T::read(chunk, big_endian))
                .collect()
        }
        match datatype {
            DataType::U8 => VoxelData::U8(collect(bytes, big_endian)),
            DataType::I8 => VoxelData::I8(collect(bytes, big_endian)),
            DataType::I16 => VoxelData::I16(collect(bytes, big_endian)),
            DataType::U16 => VoxelData::U16(collect(bytes, big_endian)),
            DataType::I32 => VoxelData::I32(collect(bytes, big_endian)),
            DataType::U32 => VoxelData::U32(collect(bytes, big_endian)),
            DataType::F32 => VoxelData::F32(collect(bytes, big_endian)),
            DataType::F64 => VoxelData::F64(collect(bytes, big_endian)),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>, big_endian: bool) {
        with_samples!(self, |v| {
            for sample in v {
                sample.write(out, big_endian);
            }
        })
    }

    pub fn datatype(&self) -> DataType {
        fn of<T: Sample>(_: &[T]) -> DataType {
            T::DATATYPE
        }
        with_samples!(self, |v| of(v.as_slice()))
    }

    pub fn len(&self) -> usize {
        with_samples!(self, |v| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unscaled sample `index` as `f64`.
    pub fn get(&self, index: usize) -> Option<f64> {
        with_samples!(self, |v| v.get(index).map(|s| s.to_f64()))
    }
}

// ── volume ───────────────────────────────────────────────────────────────────

/// A decoded 3-D NIfTI-1 image.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    header: NiftiHeader,
    dims: [usize; 3],
    data: VoxelData,
}

impl Volume {
    /// Read a `.nii` or `.nii.gz` file; compression is detected from content.
    pub fn read(path: &Path) -> Result<Self, VolumeError> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VolumeError> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let mut raw = Vec::new();
            MultiGzDecoder::new(bytes).read_to_end(&mut raw)?;
            return Self::decode_raw(&raw);
        }
        Self::decode_raw(bytes)
    }

    fn decode_raw(bytes: &[u8]) -> Result<Self, VolumeError> {
        let header = NiftiHeader::parse(bytes)?;
        let dims = header.spatial_dims()?;
        let datatype = header.datatype()?;

        let offset = header.vox_offset();
        if !offset.is_finite() || offset < HEADER_SIZE as f32 {
            return Err(VolumeError::BadHeader(format!("vox_offset {offset} is before the data")));
        }
        let offset = offset as usize;
        let needed = dims
            .iter()
            .try_fold(datatype.byte_size(), |acc, &n| acc.checked_mul(n))
            .and_then(|payload| payload.checked_add(offset))
            .ok_or_else(|| {
                VolumeError::BadHeader(format!(
                    "{}x{}x{} voxels at offset {offset} exceed the addressable size",
                    dims[0], dims[1], dims[2]
                ))
            })?;
        let payload = bytes.get(offset..needed).ok_or(VolumeError::Truncated {
            needed,
            available: bytes.len(),
        })?;

        let data = VoxelData::decode(payload, datatype, header.is_big_endian());
        Ok(Self { header, dims, data })
    }

    /// Build a volume with an axis-aligned geometry from raw samples.
    pub fn from_data(dims: [usize; 3], spacing: [f32; 3], data: VoxelData) -> Result<Self, VolumeError> {
        let expected = dims[0] * dims[1] * dims[2];
        if data.len() != expected {
            return Err(VolumeError::Unsupported(format!(
                "{} samples do not fill a {}x{}x{} grid",
                data.len(),
                dims[0],
                dims[1],
                dims[2]
            )));
        }
        let header = NiftiHeader::for_volume(dims, spacing, data.datatype())?;
        Ok(Self { header, dims, data })
    }

    pub(crate) fn from_parts(header: NiftiHeader, dims: [usize; 3], data: VoxelData) -> Self {
        Self { header, dims, data }
    }

    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn spacing(&self) -> [f32; 3] {
        self.header.spacing()
    }

    pub fn data(&self) -> &VoxelData {
        &self.data
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    /// Sample `index` with the header's slope/intercept applied.
    pub fn value(&self, index: usize) -> Option<f64> {
        let raw = self.data.get(index)?;
        Some(match self.header.scaling() {
            Some((slope, inter)) => raw * slope + inter,
            None => raw,
        })
    }

    /// Iterate over every scaled sample in file order.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.voxel_count()).filter_map(|i| self.value(i))
    }

    /// Serialize as an uncompressed single-file image.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = self.header.clone();
        header.set_vox_offset(SINGLE_FILE_OFFSET as f32);
        header.set_datatype(self.data.datatype());

        let width = self.data.datatype().byte_size();
        let mut out = Vec::with_capacity(SINGLE_FILE_OFFSET + self.data.len() * width);
        out.extend_from_slice(header.as_bytes());
        // Extension flag: no extensions follow.
        out.extend_from_slice(&[0u8; SINGLE_FILE_OFFSET - HEADER_SIZE]);
        self.data.encode_into(&mut out, header.is_big_endian());
        out
    }

    /// Serialize gzip-compressed. The gzip header carries no timestamp, so
    /// the same volume always yields the same bytes.
    pub fn encode_gz(&self) -> Result<Vec<u8>, VolumeError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.encode())?;
        Ok(encoder.finish()?)
    }
}
