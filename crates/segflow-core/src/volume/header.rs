//! NIfTI-1 single-file header (`n+1`), kept as its raw 348 bytes.
//!
//! Only the fields the analyzer and resampler touch have accessors; every
//! other byte (description, intent, calibration) is carried through
//! untouched when a derived volume is written.

use super::VolumeError;

pub const HEADER_SIZE: usize = 348;
/// Header plus the 4-byte extension flag of a single-file image.
pub const SINGLE_FILE_OFFSET: usize = 352;

const OFF_SIZEOF_HDR: usize = 0;
const OFF_DIM: usize = 40;
const OFF_DATATYPE: usize = 70;
const OFF_BITPIX: usize = 72;
const OFF_PIXDIM: usize = 76;
const OFF_VOX_OFFSET: usize = 108;
const OFF_SCL_SLOPE: usize = 112;
const OFF_SCL_INTER: usize = 116;
const OFF_XYZT_UNITS: usize = 123;
const OFF_QFORM_CODE: usize = 252;
const OFF_SFORM_CODE: usize = 254;
const OFF_QUATERN: usize = 256;
const OFF_QOFFSET: usize = 268;
const OFF_SROW: usize = 280;
const OFF_MAGIC: usize = 344;

const MAGIC_SINGLE: &[u8; 4] = b"n+1\0";
const MAGIC_PAIR: &[u8; 4] = b"ni1\0";

/// Millimetres for space, seconds for time.
const UNITS_MM_SEC: u8 = 2 | 8;

/// Voxel storage types this codec reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U8,
    I16,
    I32,
    F32,
    F64,
    I8,
    U16,
    U32,
}

impl DataType {
    pub fn from_code(code: i16) -> Result<Self, VolumeError> {
        Ok(match code {
            2 => DataType::U8,
            4 => DataType::I16,
            8 => DataType::I32,
            16 => DataType::F32,
            64 => DataType::F64,
            256 => DataType::I8,
            512 => DataType::U16,
            768 => DataType::U32,
            other => return Err(VolumeError::UnsupportedDatatype(other)),
        })
    }

    pub fn code(self) -> i16 {
        match self {
            DataType::U8 => 2,
            DataType::I16 => 4,
            DataType::I32 => 8,
            DataType::F32 => 16,
            DataType::F64 => 64,
            DataType::I8 => 256,
            DataType::U16 => 512,
            DataType::U32 => 768,
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::I16 | DataType::U16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    raw: [u8; HEADER_SIZE],
    big_endian: bool,
}

impl NiftiHeader {
    /// Parse the first 348 bytes of a single-file NIfTI-1 image.
    pub fn parse(bytes: &[u8]) -> Result<Self, VolumeError> {
        let raw: [u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(VolumeError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            })?;

        let size = [raw[0], raw[1], raw[2], raw[3]];
        let big_endian = if i32::from_le_bytes(size) == HEADER_SIZE as i32 {
            false
        } else if i32::from_be_bytes(size) == HEADER_SIZE as i32 {
            true
        } else {
            return Err(VolumeError::BadHeader("sizeof_hdr is not 348".into()));
        };

        let magic = &raw[OFF_MAGIC..OFF_MAGIC + 4];
        if magic == MAGIC_PAIR {
            return Err(VolumeError::Unsupported(
                "header/image pairs (.hdr/.img) are not supported".into(),
            ));
        }
        if magic != MAGIC_SINGLE {
            return Err(VolumeError::BadHeader("missing n+1 magic".into()));
        }

        let header = Self { raw, big_endian };
        let ndim = header.dim()[0];
        if !(1..=7).contains(&ndim) {
            return Err(VolumeError::BadHeader(format!("dim[0] = {ndim} out of range")));
        }
        Ok(header)
    }

    /// A minimal little-endian header for a 3-D volume with an axis-aligned
    /// sform built from `spacing`.
    pub fn for_volume(dims: [usize; 3], spacing: [f32; 3], datatype: DataType) -> Result<Self, VolumeError> {
        let mut header = Self {
            raw: [0; HEADER_SIZE],
            big_endian: false,
        };
        header.put_i32(OFF_SIZEOF_HDR, HEADER_SIZE as i32);
        header.set_spatial_dims(dims)?;
        header.set_datatype(datatype);
        header.set_pixdim([1.0, spacing[0], spacing[1], spacing[2], 1.0, 1.0, 1.0, 1.0]);
        header.set_vox_offset(SINGLE_FILE_OFFSET as f32);
        header.put_f32(OFF_SCL_SLOPE, 1.0);
        header.raw[OFF_XYZT_UNITS] = UNITS_MM_SEC;
        header.put_i16(OFF_SFORM_CODE, 1);
        header.set_srow(0, [spacing[0], 0.0, 0.0, 0.0]);
        header.set_srow(1, [0.0, spacing[1], 0.0, 0.0]);
        header.set_srow(2, [0.0, 0.0, spacing[2], 0.0]);
        header.raw[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(MAGIC_SINGLE);
        Ok(header)
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.raw
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    // ── field accessors ─────────────────────────────────────────────────────

    pub fn dim(&self) -> [i16; 8] {
        std::array::from_fn(|i| self.get_i16(OFF_DIM + 2 * i))
    }

    /// Sizes of the three spatial axes; axes beyond `dim[0]` count as 1.
    pub fn spatial_dims(&self) -> Result<[usize; 3], VolumeError> {
        let dim = self.dim();
        let ndim = dim[0] as usize;
        let mut out = [1usize; 3];
        for (axis, slot) in out.iter_mut().enumerate() {
            if axis + 1 <= ndim {
                let n = dim[axis + 1];
                if n < 1 {
                    return Err(VolumeError::BadHeader(format!("dim[{}] = {n}", axis + 1)));
                }
                *slot = n as usize;
            }
        }
        for axis in 4..=ndim {
            if dim[axis] > 1 {
                return Err(VolumeError::Unsupported(format!(
                    "dimension {axis} has extent {}; only 3-D volumes are handled",
                    dim[axis]
                )));
            }
        }
        Ok(out)
    }

    pub fn set_spatial_dims(&mut self, dims: [usize; 3]) -> Result<(), VolumeError> {
        let mut dim = [1i16; 8];
        dim[0] = 3;
        for (axis, &n) in dims.iter().enumerate() {
            dim[axis + 1] = i16::try_from(n)
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| VolumeError::Unsupported(format!("axis extent {n} does not fit a NIfTI-1 header")))?;
        }
        for (i, value) in dim.iter().enumerate() {
            self.put_i16(OFF_DIM + 2 * i, *value);
        }
        Ok(())
    }

    pub fn datatype(&self) -> Result<DataType, VolumeError> {
        DataType::from_code(self.get_i16(OFF_DATATYPE))
    }

    pub fn set_datatype(&mut self, datatype: DataType) {
        self.put_i16(OFF_DATATYPE, datatype.code());
        self.put_i16(OFF_BITPIX, (datatype.byte_size() * 8) as i16);
    }

    pub fn pixdim(&self) -> [f32; 8] {
        std::array::from_fn(|i| self.get_f32(OFF_PIXDIM + 4 * i))
    }

    pub fn set_pixdim(&mut self, pixdim: [f32; 8]) {
        for (i, value) in pixdim.iter().enumerate() {
            self.put_f32(OFF_PIXDIM + 4 * i, *value);
        }
    }

    /// Voxel size along x, y and z (`pixdim[1..=3]`).
    pub fn spacing(&self) -> [f32; 3] {
        let p = self.pixdim();
        [p[1], p[2], p[3]]
    }

    /// Handedness factor stored in `pixdim[0]`; anything but -1 means 1.
    pub fn qfac(&self) -> f32 {
        if self.pixdim()[0] < 0.0 { -1.0 } else { 1.0 }
    }

    pub fn vox_offset(&self) -> f32 {
        self.get_f32(OFF_VOX_OFFSET)
    }

    pub fn set_vox_offset(&mut self, offset: f32) {
        self.put_f32(OFF_VOX_OFFSET, offset);
    }

    /// `(slope, intercept)`; a zero or non-finite slope means no scaling.
    pub fn scaling(&self) -> Option<(f64, f64)> {
        let slope = self.get_f32(OFF_SCL_SLOPE);
        let inter = self.get_f32(OFF_SCL_INTER);
        if slope == 0.0 || !slope.is_finite() {
            return None;
        }
        let inter = if inter.is_finite() { inter } else { 0.0 };
        if slope == 1.0 && inter == 0.0 {
            return None;
        }
        Some((f64::from(slope), f64::from(inter)))
    }

    pub fn clear_scaling(&mut self) {
        self.put_f32(OFF_SCL_SLOPE, 1.0);
        self.put_f32(OFF_SCL_INTER, 0.0);
    }

    pub fn qform_code(&self) -> i16 {
        self.get_i16(OFF_QFORM_CODE)
    }

    pub fn sform_code(&self) -> i16 {
        self.get_i16(OFF_SFORM_CODE)
    }

    /// Quaternion `(b, c, d)`; `a` is implied.
    pub fn quatern(&self) -> [f32; 3] {
        std::array::from_fn(|i| self.get_f32(OFF_QUATERN + 4 * i))
    }

    pub fn qoffset(&self) -> [f32; 3] {
        std::array::from_fn(|i| self.get_f32(OFF_QOFFSET + 4 * i))
    }

    pub fn set_qoffset(&mut self, offset: [f32; 3]) {
        for (i, value) in offset.iter().enumerate() {
            self.put_f32(OFF_QOFFSET + 4 * i, *value);
        }
    }

    /// Row `row` (0 = x, 1 = y, 2 = z) of the sform affine.
    pub fn srow(&self, row: usize) -> [f32; 4] {
        std::array::from_fn(|i| self.get_f32(OFF_SROW + 16 * row + 4 * i))
    }

    pub fn set_srow(&mut self, row: usize, values: [f32; 4]) {
        for (i, value) in values.iter().enumerate() {
            self.put_f32(OFF_SROW + 16 * row + 4 * i, *value);
        }
    }

    /// Rotation part of the qform as a 3x3 matrix (rows are x, y, z).
    pub fn quatern_rotation(&self) -> [[f64; 3]; 3] {
        let [b, c, d] = self.quatern().map(f64::from);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - b * b - c * c],
        ]
    }

    // ── raw access ──────────────────────────────────────────────────────────

    fn get_i16(&self, off: usize) -> i16 {
        let b = [self.raw[off], self.raw[off + 1]];
        if self.big_endian { i16::from_be_bytes(b) } else { i16::from_le_bytes(b) }
    }

    fn get_f32(&self, off: usize) -> f32 {
        let b = [self.raw[off], self.raw[off + 1], self.raw[off + 2], self.raw[off + 3]];
        if self.big_endian { f32::from_be_bytes(b) } else { f32::from_le_bytes(b) }
    }

    fn put_i16(&mut self, off: usize, value: i16) {
        let b = if self.big_endian { value.to_be_bytes() } else { value.to_le_bytes() };
        self.raw[off..off + 2].copy_from_slice(&b);
    }

    fn put_i32(&mut self, off: usize, value: i32) {
        let b = if self.big_endian { value.to_be_bytes() } else { value.to_le_bytes() };
        self.raw[off..off + 4].copy_from_slice(&b);
    }

    fn put_f32(&mut self, off: usize, value: f32) {
        let b = if self.big_endian { value.to_be_bytes() } else { value.to_le_bytes() };
        self.raw[off..off + 4].copy_from_slice(&b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_header_parses_back() {
        let header = NiftiHeader::for_volume([4, 5, 6], [0.8, 0.8, 2.5], DataType::I16).unwrap();
        let parsed = NiftiHeader::parse(header.as_bytes()).unwrap();

        assert_eq!(parsed.spatial_dims().unwrap(), [4, 5, 6]);
        assert_eq!(parsed.datatype().unwrap(), DataType::I16);
        assert_eq!(parsed.spacing(), [0.8, 0.8, 2.5]);
        assert_eq!(parsed.vox_offset(), 352.0);
        assert_eq!(parsed.sform_code(), 1);
        assert_eq!(parsed.srow(2), [0.0, 0.0, 2.5, 0.0]);
        assert!(parsed.scaling().is_none());
    }

    #[test]
    fn big_endian_headers_are_detected() {
        let header = NiftiHeader::for_volume([2, 2, 2], [1.0, 1.0, 1.0], DataType::U8).unwrap();
        let mut raw = *header.as_bytes();
        // Swap every multi-byte field this test reads.
        raw[0..4].reverse();
        for i in 0..8 {
            raw[OFF_DIM + 2 * i..OFF_DIM + 2 * i + 2].reverse();
            raw[OFF_PIXDIM + 4 * i..OFF_PIXDIM + 4 * i + 4].reverse();
        }
        raw[OFF_DATATYPE..OFF_DATATYPE + 2].reverse();

        let parsed = NiftiHeader::parse(&raw).unwrap();
        assert!(parsed.is_big_endian());
        assert_eq!(parsed.spatial_dims().unwrap(), [2, 2, 2]);
        assert_eq!(parsed.datatype().unwrap(), DataType::U8);
    }

    #[test]
    fn rejects_short_and_foreign_input() {
        assert!(matches!(
            NiftiHeader::parse(&[0u8; 100]),
            Err(VolumeError::Truncated { needed: 348, available: 100 })
        ));
        assert!(matches!(
            NiftiHeader::parse(&[0u8; 400]),
            Err(VolumeError::BadHeader(_))
        ));
    }

    #[test]
    fn fourth_dimension_must_be_singleton() {
        let mut header = NiftiHeader::for_volume([2, 2, 2], [1.0, 1.0, 1.0], DataType::U8).unwrap();
        header.put_i16(OFF_DIM, 4);
        header.put_i16(OFF_DIM + 8, 3);
        assert!(matches!(header.spatial_dims(), Err(VolumeError::Unsupported(_))));

        header.put_i16(OFF_DIM + 8, 1);
        assert_eq!(header.spatial_dims().unwrap(), [2, 2, 2]);
    }

    #[test]
    fn identity_quaternion_yields_identity_rotation() {
        let header = NiftiHeader::for_volume([1, 1, 1], [1.0, 1.0, 1.0], DataType::U8).unwrap();
        assert_eq!(
            header.quatern_rotation(),
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
        );
    }
}
