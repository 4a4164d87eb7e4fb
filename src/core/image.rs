use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};

/// Squashfs superblock magic ("hsqs", little-endian) at offset 0.
const SQUASHFS_MAGIC: [u8; 4] = [0x68, 0x73, 0x71, 0x73];

/// Ext-family superblock magic, two bytes at offset 1024 + 56.
const EXT_MAGIC: [u8; 2] = [0x53, 0xEF];
const EXT_SUPERBLOCK_OFFSET: u64 = 1024;
const EXT_MAGIC_OFFSET: u64 = EXT_SUPERBLOCK_OFFSET + 56;

/// Classification of an image payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// A plain directory tree; bind-mounted rather than loop-mounted.
    Directory,
    Squashfs,
    Ext3,
    /// Recognized as a regular file but no known filesystem magic. The
    /// caller attempts a mount with empty fstype, which fails without a
    /// loop device being attached.
    Unknown,
}

impl ImageFormat {
    /// The fstype string handed to mount(2). Empty for formats the kernel
    /// cannot identify from us.
    pub fn fstype(&self) -> &'static str {
        match self {
            ImageFormat::Squashfs => "squashfs",
            ImageFormat::Ext3 => "ext3",
            ImageFormat::Directory | ImageFormat::Unknown => "",
        }
    }
}

/// What the inspector learned about an image: its format and the region of
/// the file holding the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub offset: u64,
    pub size: u64,
}

/// Abstract image classifier. The production implementation sniffs
/// filesystem magic from the file header; tests substitute fixtures.
pub trait ImageInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<ImageInfo>;
}

/// Header-sniffing inspector: stat the path, then look for squashfs or
/// ext superblock magic at their fixed offsets.
#[derive(Debug, Default)]
pub struct HeaderInspector;

impl ImageInspector for HeaderInspector {
    fn inspect(&self, path: &Path) -> Result<ImageInfo> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("stat on {} failed", path.display()))?;

        if meta.is_dir() {
            return Ok(ImageInfo {
                format: ImageFormat::Directory,
                offset: 0,
                size: 0,
            });
        }

        let mut file = File::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?;
        let size = meta.len();

        let mut head = [0u8; 4];
        if file.read_exact(&mut head).is_ok() && head == SQUASHFS_MAGIC {
            return Ok(ImageInfo {
                format: ImageFormat::Squashfs,
                offset: 0,
                size,
            });
        }

        if size > EXT_MAGIC_OFFSET + 2 {
            let mut magic = [0u8; 2];
            file.seek(SeekFrom::Start(EXT_MAGIC_OFFSET))
                .context("seek to ext superblock")?;
            if file.read_exact(&mut magic).is_ok() && magic == EXT_MAGIC {
                return Ok(ImageInfo {
                    format: ImageFormat::Ext3,
                    offset: 0,
                    size,
                });
            }
        }

        Ok(ImageInfo {
            format: ImageFormat::Unknown,
            offset: 0,
            size,
        })
    }
}
