//! Reading the designated entry point out of a managed PE image.
//!
//! Only as much of the PE/COFF layout is parsed as is needed to reach the CLI
//! header: DOS stub → NT headers → CLR data directory → section table → CLI
//! header → `EntryPointToken`.

use thiserror::Error;

const DOS_MAGIC: &[u8; 2] = b"MZ";
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const CLR_DIRECTORY: usize = 14;
const SECTION_HEADER_LEN: usize = 40;
const NATIVE_ENTRYPOINT: u32 = 0x10;
const METHOD_DEF_TABLE: u32 = 0x06;

/// Why an image has no usable entry point.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// Not a PE file at all.
    #[error("image is not a PE file")]
    NotPe,
    /// A PE file without a CLI header.
    #[error("image is not a managed assembly")]
    NotManaged,
    /// A header points outside the image.
    #[error("image is truncated or malformed")]
    Malformed,
    /// The CLI header names no entry-point method.
    #[error("image does not designate an entry point")]
    NoEntryPoint,
}

fn u16_at(image: &[u8], offset: usize) -> Result<u16, ImageError> {
    image
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(ImageError::Malformed)
}

fn u32_at(image: &[u8], offset: usize) -> Result<u32, ImageError> {
    image
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ImageError::Malformed)
}

fn rva_to_offset(image: &[u8], sections: usize, count: usize, rva: u32) -> Result<usize, ImageError> {
    for i in 0..count {
        let header = sections + i * SECTION_HEADER_LEN;
        let virtual_size = u32_at(image, header + 8)?;
        let virtual_address = u32_at(image, header + 12)?;
        let raw_size = u32_at(image, header + 16)?;
        let raw_pointer = u32_at(image, header + 20)?;

        let span = virtual_size.max(raw_size);
        if rva >= virtual_address && rva - virtual_address < span {
            return (rva - virtual_address)
                .checked_add(raw_pointer)
                .map(|offset| offset as usize)
                .ok_or(ImageError::Malformed);
        }
    }
    Err(ImageError::Malformed)
}

/// The `EntryPointToken` from the image's CLI header.
///
/// # Errors
///
/// Fails if the bytes aren't a managed PE image or the header names no
/// `MethodDef` entry point.
pub fn entry_point_token(image: &[u8]) -> Result<u32, ImageError> {
    if image.get(..2) != Some(DOS_MAGIC.as_slice()) {
        return Err(ImageError::NotPe);
    }
    let nt = u32_at(image, 0x3c).map_err(|_| ImageError::NotPe)? as usize;
    if image.get(nt..nt + 4) != Some(PE_SIGNATURE.as_slice()) {
        return Err(ImageError::NotPe);
    }

    let coff = nt + 4;
    let section_count = usize::from(u16_at(image, coff + 2)?);
    let optional_len = usize::from(u16_at(image, coff + 16)?);
    let optional = coff + 20;

    let (count_offset, directories) = match u16_at(image, optional)? {
        PE32_MAGIC => (92, 96),
        PE32_PLUS_MAGIC => (108, 112),
        _ => return Err(ImageError::NotPe),
    };
    if (u32_at(image, optional + count_offset)? as usize) <= CLR_DIRECTORY {
        return Err(ImageError::NotManaged);
    }

    let clr = optional + directories + CLR_DIRECTORY * 8;
    let cli_rva = u32_at(image, clr)?;
    let cli_size = u32_at(image, clr + 4)?;
    if cli_rva == 0 || cli_size == 0 {
        return Err(ImageError::NotManaged);
    }

    let cli = rva_to_offset(image, optional + optional_len, section_count, cli_rva)?;
    let flags = u32_at(image, cli + 16)?;
    let token = u32_at(image, cli + 20)?;

    if token == 0 || flags & NATIVE_ENTRYPOINT != 0 || token >> 24 != METHOD_DEF_TABLE {
        return Err(ImageError::NoEntryPoint);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put16(buf: &mut [u8], at: usize, v: u16) {
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// One section at RVA 0x2000 / file offset 0x200, CLI header at RVA 0x2008.
    fn synthetic(token: u32, plus: bool) -> Vec<u8> {
        let mut buf = vec![0u8; 0x400];
        buf[..2].copy_from_slice(b"MZ");
        put32(&mut buf, 0x3c, 0x80);
        buf[0x80..0x84].copy_from_slice(b"PE\0\0");

        let coff = 0x84;
        put16(&mut buf, coff, 0x14c);
        put16(&mut buf, coff + 2, 1);
        let optional_len: u16 = if plus { 240 } else { 224 };
        put16(&mut buf, coff + 16, optional_len);

        let optional = coff + 20;
        let (magic, count, dirs) = if plus {
            (PE32_PLUS_MAGIC, 108, 112)
        } else {
            (PE32_MAGIC, 92, 96)
        };
        put16(&mut buf, optional, magic);
        put32(&mut buf, optional + count, 16);
        put32(&mut buf, optional + dirs + 14 * 8, 0x2008);
        put32(&mut buf, optional + dirs + 14 * 8 + 4, 72);

        let section = optional + usize::from(optional_len);
        put32(&mut buf, section + 8, 0x1000);
        put32(&mut buf, section + 12, 0x2000);
        put32(&mut buf, section + 16, 0x200);
        put32(&mut buf, section + 20, 0x200);

        put32(&mut buf, 0x208, 72);
        put32(&mut buf, 0x208 + 20, token);
        buf
    }

    #[test]
    fn reads_token_from_pe32() {
        assert_eq!(entry_point_token(&synthetic(0x0600_0001, false)), Ok(0x0600_0001));
    }

    #[test]
    fn reads_token_from_pe32_plus() {
        assert_eq!(entry_point_token(&synthetic(0x0600_0003, true)), Ok(0x0600_0003));
    }

    #[test]
    fn zero_token_has_no_entry_point() {
        assert_eq!(entry_point_token(&synthetic(0, false)), Err(ImageError::NoEntryPoint));
    }

    #[test]
    fn non_method_token_is_rejected() {
        assert_eq!(
            entry_point_token(&synthetic(0x2600_0001, false)),
            Err(ImageError::NoEntryPoint)
        );
    }

    #[test]
    fn garbage_is_not_pe() {
        assert_eq!(entry_point_token(b""), Err(ImageError::NotPe));
        assert_eq!(entry_point_token(b"echo hi"), Err(ImageError::NotPe));
        assert_eq!(entry_point_token(b"MZ"), Err(ImageError::NotPe));
    }

    #[test]
    fn missing_clr_directory_is_not_managed() {
        let mut image = synthetic(0x0600_0001, false);
        let clr = 0x84 + 20 + 96 + 14 * 8;
        put32(&mut image, clr, 0);
        assert_eq!(entry_point_token(&image), Err(ImageError::NotManaged));
    }

    #[test]
    fn section_past_the_address_space_is_malformed() {
        let mut image = synthetic(0x0600_0001, false);
        let section = 0x84 + 20 + 224;
        put32(&mut image, section + 20, 0xFFFF_FFFF);
        assert_eq!(entry_point_token(&image), Err(ImageError::Malformed));
    }

    #[test]
    fn truncated_image_is_malformed() {
        let image = synthetic(0x0600_0001, false);
        assert_eq!(entry_point_token(&image[..0x210]), Err(ImageError::Malformed));
    }
}
