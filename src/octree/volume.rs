//! Dense in-memory volume with interleaved 16-bit channels

use std::path::Path;

use glam::UVec3;

use crate::core::error::{Error, IoContext};
use crate::core::types::Result;
use crate::octree::geometry::MAX_CHANNELS;

/// Dense volume, x varying fastest, channels interleaved per voxel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeRam {
    dim: UVec3,
    num_channels: usize,
    data: Vec<u16>,
}

impl VolumeRam {
    pub fn new(dim: UVec3, num_channels: usize, data: Vec<u16>) -> Result<Self> {
        if num_channels == 0 || num_channels > MAX_CHANNELS {
            return Err(Error::InvalidArgument(format!("unsupported channel count {}", num_channels)));
        }
        let expected = dim.x as usize * dim.y as usize * dim.z as usize * num_channels;
        if data.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "volume {} with {} channels needs {} values, got {}",
                dim,
                num_channels,
                expected,
                data.len()
            )));
        }
        Ok(Self { dim, num_channels, data })
    }

    pub fn zeroed(dim: UVec3, num_channels: usize) -> Result<Self> {
        let len = dim.x as usize * dim.y as usize * dim.z as usize * num_channels;
        Self::new(dim, num_channels, vec![0; len])
    }

    /// Volume whose values come from `f(position, channel)`
    pub fn from_fn(dim: UVec3, num_channels: usize, mut f: impl FnMut(UVec3, usize) -> u16) -> Result<Self> {
        let mut volume = Self::zeroed(dim, num_channels)?;
        for z in 0..dim.z {
            for y in 0..dim.y {
                for x in 0..dim.x {
                    let pos = UVec3::new(x, y, z);
                    for c in 0..num_channels {
                        volume.set_voxel(pos, c, f(pos, c));
                    }
                }
            }
        }
        Ok(volume)
    }

    /// Read a raw native-endian `u16` file.
    pub fn load_raw(path: &Path, dim: UVec3, num_channels: usize) -> Result<Self> {
        let bytes = std::fs::read(path).with_path(path)?;
        if bytes.len() % 2 != 0 {
            return Err(Error::InvalidArgument(format!("{} has an odd byte count", path.display())));
        }
        let data: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|b| u16::from_ne_bytes([b[0], b[1]]))
            .collect();
        Self::new(dim, num_channels, data)
    }

    /// Write the raw native-endian `u16` values.
    pub fn save_raw(&self, path: &Path) -> Result<()> {
        std::fs::write(path, bytemuck::cast_slice::<u16, u8>(&self.data)).with_path(path)
    }

    pub fn dim(&self) -> UVec3 {
        self.dim
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_voxels(&self) -> usize {
        self.dim.x as usize * self.dim.y as usize * self.dim.z as usize
    }

    pub fn data(&self) -> &[u16] {
        &self.data
    }

    pub fn contains(&self, pos: UVec3) -> bool {
        pos.cmplt(self.dim).all()
    }

    fn index(&self, pos: UVec3, channel: usize) -> usize {
        let linear = pos.x as usize
            + pos.y as usize * self.dim.x as usize
            + pos.z as usize * self.dim.x as usize * self.dim.y as usize;
        linear * self.num_channels + channel
    }

    pub fn voxel(&self, pos: UVec3, channel: usize) -> u16 {
        self.data[self.index(pos, channel)]
    }

    pub fn set_voxel(&mut self, pos: UVec3, channel: usize, value: u16) {
        let index = self.index(pos, channel);
        self.data[index] = value;
    }
}
