//! 压缩/解压（LZ4 / None）

use serde::{Deserialize, Serialize};
use crate::common::{Result, TableError};

/// Tablet 列数据的压缩编码（schema `filters.complib` 的取值）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompLib {
    #[default]
    None,
    Lz4,
}

impl CompLib {
    /// 磁盘编码用的单字节标记
    pub fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4  => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            t => Err(TableError::TabletCorrupt(format!("unknown compression tag {t}"))),
        }
    }
}

pub fn compress(data: &[u8], codec: CompLib) -> Result<Vec<u8>> {
    match codec {
        CompLib::None => Ok(data.to_vec()),
        CompLib::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| TableError::Compression(e.to_string())),
    }
}

pub fn decompress(
    data:             &[u8],
    codec:            CompLib,
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    match codec {
        CompLib::None => Ok(data.to_vec()),
        CompLib::Lz4  =>
            lz4::block::decompress(data, Some(uncompressed_len as i32))
                .map_err(|e| TableError::Compression(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_round_trip() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let packed = compress(&data, CompLib::Lz4).unwrap();
        assert!(packed.len() < data.len());
        let back = decompress(&packed, CompLib::Lz4, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn none_is_identity() {
        let data = b"plain bytes".to_vec();
        let packed = compress(&data, CompLib::None).unwrap();
        assert_eq!(packed, data);
        assert_eq!(decompress(&packed, CompLib::None, data.len()).unwrap(), data);
    }
}
