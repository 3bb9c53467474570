//! Integer-factor downsampling with geometry kept in register.

use super::{Sample, Volume, VolumeError, VoxelData, map_samples};

/// How output voxels are sampled from the source grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Nearest source voxel; keeps discrete label values intact.
    Nearest,
    /// Trilinear blend of the eight surrounding voxels.
    Linear,
}

impl Volume {
    /// Shrink each spatial axis by `factor`.
    ///
    /// Output extent is `max(1, n / factor)`. Output voxel `i` samples source
    /// position `i * factor + (factor - 1) / 2`, the centre of the block it
    /// replaces, and the qform and sform translations move by the same half
    /// block so world coordinates of the two grids line up. Spacing grows by
    /// `factor`. The datatype and intensity scaling of the source are kept.
    pub fn downsample(&self, factor: u32, interpolation: Interpolation) -> Result<Volume, VolumeError> {
        if factor == 0 {
            return Err(VolumeError::Unsupported("downsample factor must be positive".into()));
        }
        let f = factor as usize;
        let src_dims = self.dims();
        let out_dims = src_dims.map(|n| (n / f).max(1));
        let grid = Grid {
            src: src_dims,
            out: out_dims,
            factor: f64::from(factor),
        };

        let data = map_samples!(self.data(), |v| grid.resample(v.as_slice(), interpolation));
        let header = self.rescaled_header(factor, out_dims)?;
        Ok(Volume::from_parts(header, out_dims, data))
    }

    fn rescaled_header(&self, factor: u32, out_dims: [usize; 3]) -> Result<super::NiftiHeader, VolumeError> {
        let f = factor as f32;
        let shift = (f - 1.0) / 2.0;
        let mut header = self.header().clone();
        header.set_spatial_dims(out_dims)?;

        let mut pixdim = header.pixdim();
        for p in &mut pixdim[1..=3] {
            *p *= f;
        }
        header.set_pixdim(pixdim);

        // qform: world = R * diag(dx, dy, qfac * dz) * ijk + qoffset
        let source = self.header();
        let [dx, dy, dz] = source.spacing().map(f64::from);
        let step = [dx, dy, dz * f64::from(source.qfac())].map(|d| d * f64::from(shift));
        let rotation = source.quatern_rotation();
        let mut qoffset = source.qoffset();
        for (row, offset) in rotation.iter().zip(qoffset.iter_mut()) {
            let delta: f64 = row.iter().zip(step).map(|(r, s)| r * s).sum();
            *offset += delta as f32;
        }
        header.set_qoffset(qoffset);

        for r in 0..3 {
            let [a, b, c, d] = source.srow(r);
            header.set_srow(r, [a * f, b * f, c * f, d + (a + b + c) * shift]);
        }
        Ok(header)
    }
}

struct Grid {
    src: [usize; 3],
    out: [usize; 3],
    factor: f64,
}

impl Grid {
    fn centre(&self, i: usize) -> f64 {
        i as f64 * self.factor + (self.factor - 1.0) / 2.0
    }

    fn src_index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.src[0] * (y + self.src[1] * z)
    }

    fn resample<T: Sample>(&self, src: &[T], interpolation: Interpolation) -> Vec<T> {
        let [ox, oy, oz] = self.out;
        let mut out = Vec::with_capacity(ox * oy * oz);
        for z in 0..oz {
            let pz = self.centre(z);
            for y in 0..oy {
                let py = self.centre(y);
                for x in 0..ox {
                    let px = self.centre(x);
                    let value = match interpolation {
                        Interpolation::Nearest => self.nearest(src, [px, py, pz]),
                        Interpolation::Linear => self.linear(src, [px, py, pz]),
                    };
                    out.push(value);
                }
            }
        }
        out
    }

    fn nearest<T: Sample>(&self, src: &[T], pos: [f64; 3]) -> T {
        let [x, y, z] = std::array::from_fn(|axis| clamp_index(pos[axis].round(), self.src[axis]));
        src[self.src_index(x, y, z)]
    }

    fn linear<T: Sample>(&self, src: &[T], pos: [f64; 3]) -> T {
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        let mut t = [0f64; 3];
        for axis in 0..3 {
            let base = pos[axis].floor();
            lo[axis] = clamp_index(base, self.src[axis]);
            hi[axis] = (lo[axis] + 1).min(self.src[axis] - 1);
            t[axis] = if hi[axis] == lo[axis] { 0.0 } else { pos[axis] - base };
        }

        let mut acc = 0.0;
        for corner in 0..8 {
            let pick = |axis: usize| (corner >> axis) & 1 == 1;
            let mut weight = 1.0;
            let mut idx = [0usize; 3];
            for axis in 0..3 {
                if pick(axis) {
                    weight *= t[axis];
                    idx[axis] = hi[axis];
                } else {
                    weight *= 1.0 - t[axis];
                    idx[axis] = lo[axis];
                }
            }
            if weight != 0.0 {
                acc += weight * src[self.src_index(idx[0], idx[1], idx[2])].to_f64();
            }
        }
        T::from_f64(acc)
    }
}

fn clamp_index(pos: f64, extent: usize) -> usize {
    if pos <= 0.0 {
        0
    } else {
        (pos as usize).min(extent - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(dims: [usize; 3]) -> Volume {
        let n = dims[0] * dims[1] * dims[2];
        let data = (0..n).map(|i| (i % dims[0]) as f32).collect();
        Volume::from_data(dims, [1.0, 1.0, 1.0], VoxelData::F32(data)).unwrap()
    }

    #[test]
    fn nearest_keeps_label_values_discrete() {
        let data: Vec<u8> = (0..64).map(|i| if i % 4 < 2 { 1 } else { 2 }).collect();
        let volume = Volume::from_data([4, 4, 4], [1.0; 3], VoxelData::U8(data)).unwrap();

        let small = volume.downsample(2, Interpolation::Nearest).unwrap();
        assert_eq!(small.dims(), [2, 2, 2]);
        assert!(small.values().all(|v| v == 1.0 || v == 2.0));
    }

    #[test]
    fn linear_averages_across_the_block() {
        let small = ramp([4, 2, 2]).downsample(2, Interpolation::Linear).unwrap();
        assert_eq!(small.dims(), [2, 1, 1]);
        // Centres sit at x = 0.5 and 2.5 on the source grid.
        assert_eq!(small.value(0), Some(0.5));
        assert_eq!(small.value(1), Some(2.5));
    }

    #[test]
    fn tiny_axes_collapse_to_one_voxel() {
        let small = ramp([3, 1, 1]).downsample(8, Interpolation::Linear).unwrap();
        assert_eq!(small.dims(), [1, 1, 1]);
        assert_eq!(small.value(0), Some(2.0));
    }

    #[test]
    fn geometry_is_rescaled_and_shifted() {
        let volume = Volume::from_data([8, 8, 8], [0.5, 0.5, 2.0], VoxelData::U8(vec![0; 512])).unwrap();
        let small = volume.downsample(4, Interpolation::Nearest).unwrap();

        assert_eq!(small.spacing(), [2.0, 2.0, 8.0]);
        assert_eq!(small.header().srow(0), [2.0, 0.0, 0.0, 0.75]);
        assert_eq!(small.header().srow(2), [0.0, 0.0, 8.0, 3.0]);
        assert_eq!(small.header().qoffset(), [0.75, 0.75, 3.0]);
    }

    #[test]
    fn zero_factor_is_rejected() {
        assert!(ramp([2, 2, 2]).downsample(0, Interpolation::Nearest).is_err());
    }
}
