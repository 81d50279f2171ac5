//! Brick byte-range reading and decoding

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::core::types::UVec3;
use crate::core::{Error, Result};
use crate::volume::{BrickEncoding, BrickPayload, BrickSourcePath, FileLocation, TexelFormat};

/// Reads the raw bytes of a brick range
pub trait RangeFetcher: Send + Sync {
    fn fetch(&self, location: &FileLocation) -> Result<Vec<u8>>;
}

/// Reads ranges from local files; URL sources are reported as errors
#[derive(Clone, Copy, Debug, Default)]
pub struct FileFetcher;

impl RangeFetcher for FileFetcher {
    fn fetch(&self, location: &FileLocation) -> Result<Vec<u8>> {
        match &location.source {
            BrickSourcePath::File(path) => read_range(path, location.offset, location.size),
            BrickSourcePath::Url(url) => Err(Error::Streaming(format!("no fetcher for remote brick {}", url))),
        }
    }
}

/// Read `size` bytes at `offset`
pub fn read_range(path: &Path, offset: u64, size: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = vec![0u8; size as usize];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Async variant used by the prefetch workers
pub async fn read_range_async(path: &Path, offset: u64, size: u64) -> Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut bytes = vec![0u8; size as usize];
    file.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Turn the stored bytes of a brick into a texture payload
pub fn decode_brick(bytes: &[u8], encoding: BrickEncoding, dims: UVec3, format: TexelFormat) -> Result<BrickPayload> {
    let bytes = match encoding {
        BrickEncoding::Raw => bytes.to_vec(),
        BrickEncoding::Lz4 => lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| Error::Decode(format!("LZ4 decompression failed: {}", e)))?,
    };
    let expected = BrickPayload::expected_len(dims, format);
    if bytes.len() != expected {
        return Err(Error::Decode(format!(
            "brick {:?} decoded to {} bytes, expected {}",
            dims,
            bytes.len(),
            expected
        )));
    }
    Ok(BrickPayload { dims, format, bytes })
}

/// Fetch and decode in one step
pub fn load_brick(fetcher: &dyn RangeFetcher, location: &FileLocation, dims: UVec3, format: TexelFormat) -> Result<BrickPayload> {
    let bytes = fetcher.fetch(location)?;
    decode_brick(&bytes, location.encoding, dims, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn location(path: &Path, offset: u64, size: u64, encoding: BrickEncoding) -> FileLocation {
        FileLocation {
            source: BrickSourcePath::File(path.to_path_buf()),
            offset,
            size,
            encoding,
        }
    }

    #[test]
    fn test_raw_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[9, 9, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let payload = load_brick(&FileFetcher, &location(&path, 2, 8, BrickEncoding::Raw), UVec3::new(2, 2, 2), TexelFormat::R8).unwrap();
        assert_eq!(payload.bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_lz4_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.lz4");
        let raw: Vec<u8> = (0..16u16).flat_map(|v| v.to_le_bytes()).collect();
        let packed = lz4_flex::compress_prepend_size(&raw);
        std::fs::write(&path, &packed).unwrap();

        let loc = location(&path, 0, packed.len() as u64, BrickEncoding::Lz4);
        let payload = load_brick(&FileFetcher, &loc, UVec3::new(4, 2, 2), TexelFormat::R16).unwrap();
        assert_eq!(payload.texel(3, 1, 1), 15);
    }

    #[test]
    fn test_corrupt_bytes_are_decode_errors() {
        assert!(matches!(
            decode_brick(&[1, 2, 3], BrickEncoding::Raw, UVec3::splat(2), TexelFormat::R8),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode_brick(&[8, 0, 0, 0, 0xff, 0xff, 0xff], BrickEncoding::Lz4, UVec3::splat(2), TexelFormat::R8),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_short_file_and_url_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [1, 2]).unwrap();
        assert!(FileFetcher.fetch(&location(&path, 0, 8, BrickEncoding::Raw)).is_err());

        let url = FileLocation {
            source: BrickSourcePath::Url("https://example.org/b.bin".into()),
            offset: 0,
            size: 8,
            encoding: BrickEncoding::Raw,
        };
        assert!(matches!(FileFetcher.fetch(&url), Err(Error::Streaming(_))));
    }

    #[tokio::test]
    async fn test_async_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, [0, 1, 2, 3, 4]).unwrap();
        assert_eq!(read_range_async(&path, 1, 3).await.unwrap(), vec![1, 2, 3]);
    }
}
