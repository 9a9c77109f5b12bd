//! Firmware file parsing (Intel HEX and raw binary)
//!
//! Produces the canonical segment form consumed by the flash workflows: an
//! ordered list of contiguous, non-overlapping, non-empty byte runs. The
//! parser is a pure transform and knows nothing about the device.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Base of STM32 on-chip flash, the default load address for raw binaries
pub const STM32_FLASH_START: u32 = 0x0800_0000;

/// A contiguous run of bytes at an absolute address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Segment {
    /// Address one past the last byte
    pub fn end(&self) -> u32 {
        self.address.wrapping_add(self.data.len() as u32)
    }
}

/// Load a firmware file, dispatching on its lowercase extension.
///
/// `base` applies only to raw binaries; address-bearing formats ignore it.
pub fn load(path: &Path, base: Option<u32>) -> Result<Vec<Segment>> {
    if !path.exists() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("hex") => parse_hex(&fs::read_to_string(path)?),
        Some("bin") => Ok(parse_bin(
            fs::read(path)?,
            base.unwrap_or(STM32_FLASH_START),
        )),
        _ => Err(Error::InvalidArgument(format!(
            "unsupported file format: {} (use .hex or .bin)",
            ext.as_deref().unwrap_or("<none>")
        ))),
    }
}

/// Decode Intel HEX text into segments.
///
/// Recognized record types: 0x00 data, 0x01 end-of-file, 0x02 extended
/// segment address, 0x04 extended linear address. Other types are ignored.
/// Blank lines and lines starting with `#` are skipped. Per-record checksum
/// bytes are not verified.
pub fn parse_hex(text: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut current: Option<Segment> = None;
    let mut base: u32 = 0;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !line.is_ascii() || !line.starts_with(':') {
            return Err(Error::Parse {
                line: line_no,
                msg: "record must start with ':'".into(),
            });
        }
        if line.len() < 11 {
            return Err(Error::Parse {
                line: line_no,
                msg: "record too short".into(),
            });
        }

        let byte_count = hex_field(&line[1..3], line_no)?[0] as usize;
        let offset_bytes = hex_field(&line[3..7], line_no)?;
        let offset = u16::from_be_bytes([offset_bytes[0], offset_bytes[1]]);
        let record_type = hex_field(&line[7..9], line_no)?[0];

        let payload_end = 9 + byte_count * 2;
        if line.len() < payload_end {
            return Err(Error::Parse {
                line: line_no,
                msg: "record shorter than its byte count".into(),
            });
        }
        let payload = hex_field(&line[9..payload_end], line_no)?;

        match record_type {
            0x00 => {
                let address = base.wrapping_add(offset as u32);
                match current.as_mut() {
                    Some(seg) if address == seg.end() => seg.data.extend_from_slice(&payload),
                    _ => {
                        if let Some(seg) = current.take() {
                            if !seg.data.is_empty() {
                                segments.push(seg);
                            }
                        }
                        current = Some(Segment {
                            address,
                            data: payload,
                        });
                    }
                }
            }
            0x01 => break,
            0x02 => base = (extended_base(&payload, line_no)? as u32) << 4,
            0x04 => base = (extended_base(&payload, line_no)? as u32) << 16,
            _ => {}
        }
    }

    if let Some(seg) = current.take() {
        if !seg.data.is_empty() {
            segments.push(seg);
        }
    }
    Ok(segments)
}

/// A raw binary becomes a single segment at the caller-supplied address.
pub fn parse_bin(data: Vec<u8>, address: u32) -> Vec<Segment> {
    if data.is_empty() {
        return Vec::new();
    }
    vec![Segment { address, data }]
}

fn extended_base(payload: &[u8], line_no: usize) -> Result<u16> {
    if payload.len() != 2 {
        return Err(Error::Parse {
            line: line_no,
            msg: "extended address record must carry two bytes".into(),
        });
    }
    Ok(u16::from_be_bytes([payload[0], payload[1]]))
}

fn hex_field(s: &str, line_no: usize) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::Parse {
            line: line_no,
            msg: "odd number of hex digits".into(),
        });
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| Error::Parse {
                line: line_no,
                msg: format!("invalid hex digits {:?}", &s[i..i + 2]),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_simple_data_record() {
        let segments =
            parse_hex(":10010000214601360121470136007EFE09D2190140\n:00000001FF\n").unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address, 0x0100);
        assert_eq!(segments[0].data.len(), 16);
        assert_eq!(&segments[0].data[..4], &[0x21, 0x46, 0x01, 0x36]);
    }

    #[test]
    fn test_parse_extended_linear_address() {
        let segments = parse_hex(":020000040800F2\n:04000000DEADBEEF84\n:00000001FF\n").unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address, 0x0800_0000);
        assert_eq!(segments[0].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_parse_extended_segment_address() {
        // Base is the 16-bit payload shifted left by 4.
        let segments = parse_hex(":020000021000EC\n:02000000AABB99\n:00000001FF\n").unwrap();
        assert_eq!(segments[0].address, 0x0001_0000);
        assert_eq!(segments[0].data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_contiguous_records_merge() {
        let text = ":040000001122334400\n:040004005566778800\n:00000001FF\n";
        let segments = parse_hex(text).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(
            segments[0].data,
            vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
    }

    #[test]
    fn test_gap_splits_segments() {
        let text = ":0200000011223344\n:02001000AABB99\n:00000001FF\n";
        let segments = parse_hex(text).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].address, 0x0000);
        assert_eq!(segments[0].data, vec![0x11, 0x22]);
        assert_eq!(segments[1].address, 0x0010);
        assert_eq!(segments[1].data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let text = "# generated by a linker\n\n:0100000042BD\n:00000001FF\n";
        let segments = parse_hex(text).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data, vec![0x42]);
    }

    #[test]
    fn test_records_after_eof_ignored() {
        let text = ":0100000042BD\n:00000001FF\n:01000000FF00\n";
        let segments = parse_hex(text).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data, vec![0x42]);
    }

    #[test]
    fn test_unknown_record_type_ignored() {
        let text = ":0400000300003800C1\n:0100000042BD\n:00000001FF\n";
        let segments = parse_hex(text).unwrap();
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn test_missing_colon_rejected() {
        let err = parse_hex("0100000042BD\n").unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }

    #[test]
    fn test_short_record_rejected() {
        let err = parse_hex(":00000001\n").unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }

    #[test]
    fn test_bad_hex_digits_rejected() {
        let err = parse_hex(":01000000ZZBD\n").unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }

    #[test]
    fn test_byte_count_beyond_line_rejected() {
        let err = parse_hex(":10000000AABB00\n").unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }

    #[test]
    fn test_bin_single_segment() {
        let segments = parse_bin(vec![1, 2, 3], 0x2000_0000);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address, 0x2000_0000);
        assert_eq!(segments[0].data, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_bin_yields_no_segments() {
        assert!(parse_bin(Vec::new(), 0).is_empty());
    }

    #[test]
    fn test_load_bin_uses_default_base() {
        let mut file = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        file.write_all(&[0xDE, 0xAD]).unwrap();
        let segments = load(file.path(), None).unwrap();
        assert_eq!(segments[0].address, STM32_FLASH_START);
    }

    #[test]
    fn test_load_bin_honors_explicit_base() {
        let mut file = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        file.write_all(&[0xDE, 0xAD]).unwrap();
        let segments = load(file.path(), Some(0x0800_4000)).unwrap();
        assert_eq!(segments[0].address, 0x0800_4000);
    }

    #[test]
    fn test_load_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".elf").tempfile().unwrap();
        let err = load(file.path(), None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/firmware.hex"), None).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn test_segments_ordered_and_nonoverlapping() {
        let text = ":020000040800F2\n:040000001122334400\n:04001000AABBCCDD00\n:00000001FF\n";
        let segments = parse_hex(text).unwrap();
        assert!(segments.windows(2).all(|w| w[0].end() <= w[1].address));
        assert!(segments.iter().all(|s| !s.data.is_empty()));
    }
}
