//! Disk image header parsing using nom
//!
//! Image layout:
//! ```text
//! BDEV001\n
//! [version: u32 little-endian]
//! [block_count: u32 little-endian]
//! ...block_count blocks of BLOCK_SIZE bytes...
//! ```

use nom::{
    bytes::complete::tag,
    number::complete::le_u32,
    sequence::tuple,
    IResult,
};

use crate::error::{Error, Result};

/// Magic header for disk image files
pub const IMAGE_MAGIC: &[u8] = b"BDEV001\n";

/// Total header length in bytes (magic + version + block_count)
pub const HEADER_LEN: usize = 16;

/// Disk image header
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHeader {
    /// Image format version
    pub version: u32,
    /// Number of blocks in the image
    pub block_count: u32,
}

fn header(input: &[u8]) -> IResult<&[u8], ImageHeader> {
    let (rest, (_, version, block_count)) = tuple((tag(IMAGE_MAGIC), le_u32, le_u32))(input)?;
    Ok((rest, ImageHeader { version, block_count }))
}

/// Parse a disk image header
///
/// Format:
/// ```text
/// BDEV001\n
/// [4 bytes: version u32 little-endian]
/// [4 bytes: block_count u32 little-endian]
/// ```
pub fn parse_header(input: &[u8]) -> Result<ImageHeader> {
    if input.len() < HEADER_LEN {
        return Err(Error::Parse("Input too short for header".to_string()));
    }

    match header(input) {
        Ok((_, parsed)) => Ok(parsed),
        Err(e) => Err(Error::Parse(format!("Invalid image header: {:?}", e))),
    }
}

/// Create a disk image header
pub fn create_header(version: u32, block_count: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(IMAGE_MAGIC);
    header.extend_from_slice(&version.to_le_bytes());
    header.extend_from_slice(&block_count.to_le_bytes());
    header
}
