use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use v4l::FourCC;

use crate::error::{Error, Result};

/// Fail unless `path` exists and is a character device node
pub fn ensure_char_device(path: &Path) -> Result<()> {
    let meta =
        std::fs::metadata(path).map_err(|e| Error::device(path, format!("cannot stat: {e}")))?;

    if !meta.file_type().is_char_device() {
        return Err(Error::device(path, "not a character device"));
    }
    Ok(())
}

/// Parse a four character pixel format code such as `"NV12"`
pub fn parse_fourcc(code: &str) -> Result<FourCC> {
    let bytes: [u8; 4] = code
        .as_bytes()
        .try_into()
        .map_err(|_| Error::config(format!("format must be 4 characters, got {code:?}")))?;

    if !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Err(Error::config(format!("format {code:?} is not printable ASCII")));
    }
    Ok(FourCC::new(&bytes))
}

/// Render a little-endian fourcc word as text, hex if not printable
pub fn fourcc_name(code: u32) -> String {
    let bytes = code.to_le_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        bytes.iter().map(|&b| b as char).collect()
    } else {
        format!("{code:#010x}")
    }
}
