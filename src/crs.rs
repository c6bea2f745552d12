//! Coordinate reference system tags and their header encoding.
//!
//! The index never interprets coordinates; it only records which reference
//! system they were expressed in so that callers can refuse to mix data from
//! incompatible systems. The tag is persisted in the file header as a small
//! versioned, language-neutral byte string: no serialized runtime objects.

use serde::{Deserialize, Serialize};

use crate::errors::{IndexError, IndexResult};

/// Version byte of the tag encoding, independent of the file format version.
const CRS_ENCODING_VERSION: u8 = 1;

/// Longest accepted authority name in bytes.
const MAX_AUTHORITY_LEN: usize = 64;

/// Axis order of the coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisOrder {
    /// Easting/longitude first.
    XY,
    /// Northing/latitude first.
    YX,
}

/// Identifies the coordinate reference system of a tree.
///
/// A tag is an authority name plus a numeric code (e.g. `EPSG:4326`) and the
/// axis order the data uses. Encoded form:
/// `[version u8][axis u8][code u32 le][len u16 le][authority utf-8]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrsTag {
    authority: String,
    code: u32,
    axis_order: AxisOrder,
}

impl CrsTag {
    pub fn new(authority: &str, code: u32, axis_order: AxisOrder) -> IndexResult<CrsTag> {
        if authority.is_empty() || authority.len() > MAX_AUTHORITY_LEN {
            return Err(IndexError::argument(format!(
                "CRS authority must be 1..={} bytes",
                MAX_AUTHORITY_LEN
            )));
        }
        Ok(CrsTag {
            authority: authority.to_string(),
            code,
            axis_order,
        })
    }

    /// An EPSG tag with the conventional x/y axis order.
    pub fn epsg(code: u32) -> CrsTag {
        CrsTag {
            authority: "EPSG".to_string(),
            code,
            axis_order: AxisOrder::XY,
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn axis_order(&self) -> AxisOrder {
        self.axis_order
    }

    /// Encodes the tag for storage in the index header.
    pub fn encode(&self) -> Vec<u8> {
        let name = self.authority.as_bytes();
        let mut out = Vec::with_capacity(8 + name.len());
        out.push(CRS_ENCODING_VERSION);
        out.push(match self.axis_order {
            AxisOrder::XY => 0,
            AxisOrder::YX => 1,
        });
        out.extend_from_slice(&self.code.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out
    }

    /// Decodes a tag previously produced by [`CrsTag::encode`].
    pub fn decode(bytes: &[u8]) -> IndexResult<CrsTag> {
        if bytes.len() < 8 {
            return Err(IndexError::format("CRS tag too short"));
        }
        if bytes[0] != CRS_ENCODING_VERSION {
            return Err(IndexError::format(format!(
                "unsupported CRS tag encoding version {}",
                bytes[0]
            )));
        }
        let axis_order = match bytes[1] {
            0 => AxisOrder::XY,
            1 => AxisOrder::YX,
            other => {
                return Err(IndexError::format(format!("invalid CRS axis order {}", other)));
            }
        };
        let code = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
        let len = u16::from_le_bytes(bytes[6..8].try_into().unwrap()) as usize;
        if len == 0 || len > MAX_AUTHORITY_LEN || bytes.len() < 8 + len {
            return Err(IndexError::format("CRS authority length out of range"));
        }
        let authority = std::str::from_utf8(&bytes[8..8 + len])
            .map_err(|_| IndexError::format("CRS authority is not valid UTF-8"))?
            .to_string();
        Ok(CrsTag {
            authority,
            code,
            axis_order,
        })
    }
}

impl Default for CrsTag {
    fn default() -> Self {
        CrsTag::epsg(4326)
    }
}

impl std::fmt::Display for CrsTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let axes = match self.axis_order {
            AxisOrder::XY => "x,y",
            AxisOrder::YX => "y,x",
        };
        write!(f, "{}:{} ({})", self.authority, self.code, axes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let tag = CrsTag::new("EPSG", 3857, AxisOrder::XY).unwrap();
        let decoded = CrsTag::decode(&tag.encode()).unwrap();
        assert_eq!(tag, decoded);

        let tag = CrsTag::new("ESRI", 102100, AxisOrder::YX).unwrap();
        let decoded = CrsTag::decode(&tag.encode()).unwrap();
        assert_eq!(tag, decoded);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut bytes = CrsTag::epsg(4326).encode();
        bytes[0] = 99;
        assert!(matches!(CrsTag::decode(&bytes), Err(IndexError::Format(_))));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let bytes = CrsTag::epsg(4326).encode();
        assert!(CrsTag::decode(&bytes[..5]).is_err());
        assert!(CrsTag::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_new_rejects_long_authority() {
        let name = "A".repeat(65);
        assert!(CrsTag::new(&name, 1, AxisOrder::XY).is_err());
        assert!(CrsTag::new("", 1, AxisOrder::XY).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(CrsTag::epsg(4326).to_string(), "EPSG:4326 (x,y)");
    }
}
