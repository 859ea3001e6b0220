//! Runtime configuration for packing and opening archives, deserializable from JSON so host
//! applications can ship it alongside their own settings.

use serde::{Deserialize, Deserializer, Serialize};

use crate::{container::ContainerFormat, errors::ArchiveError};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Container variant written by `pack`.
    pub format: ContainerFormat,
    /// DEFLATE level (0..=9), only used by the deflate variant.
    pub deflate_level: u32,
    /// Embed per-file and manifest hashes at pack time.
    pub include_hashes: bool,
    /// Whether the secure hashing capability is present in this runtime.
    pub hashing_available: bool,
    /// Requested quality tier: "sd", "hd" or "auto".
    pub quality: String,
    #[serde(deserialize_with = "string_or_usize")]
    pub max_container_size: String,
    pub fetch_timeout_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            format: ContainerFormat::Deflate,
            deflate_level: 6,
            include_hashes: false,
            hashing_available: true,
            quality: "auto".to_string(),
            max_container_size: "4G".to_string(),
            fetch_timeout_secs: 120,
        }
    }
}

impl ArchiveConfig {
    /// Parse a configuration document; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, ArchiveError> {
        let config: ArchiveConfig = serde_json::from_str(s)?;
        if config.deflate_level > 9 {
            return Err(ArchiveError::InvalidArgument(format!(
                "deflate_level must be 0..=9, got {}",
                config.deflate_level
            )));
        }
        config.max_container_bytes()?;
        Ok(config)
    }

    /// `max_container_size` in bytes.
    pub fn max_container_bytes(&self) -> Result<u64, ArchiveError> {
        parse_size(&self.max_container_size)
    }
}

/// Parse sizes like `"512"`, `"64K"`, `"2M"`, `"4G"` (binary multiples).
pub fn parse_size(s: &str) -> Result<u64, ArchiveError> {
    let s = s.trim();
    let invalid = || ArchiveError::InvalidArgument(format!("invalid size `{s}`"));
    let (digits, multiplier) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let m = match c.to_ascii_uppercase() {
                'K' => 1u64 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                _ => return Err(invalid()),
            };
            (&s[..i], m)
        }
        Some(_) => (s, 1),
        None => return Err(invalid()),
    };
    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    n.checked_mul(multiplier).ok_or_else(invalid)
}

fn string_or_usize<'deserialize, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'deserialize>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrUSize {
        String(String),
        USize(usize),
    }

    Ok(match StringOrUSize::deserialize(deserializer)? {
        StringOrUSize::String(v) => v,
        StringOrUSize::USize(v) => v.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("2m").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("4G").unwrap(), 4u64 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("abc").is_err());
    }

    /// Integers and strings are both accepted for the size field; omitted fields default.
    #[test]
    fn config_from_json() {
        let cfg = ArchiveConfig::from_json_str(
            r#"{"format": "stored", "max_container_size": 1048576, "quality": "hd"}"#,
        )
        .unwrap();
        assert_eq!(cfg.format, ContainerFormat::Stored);
        assert_eq!(cfg.max_container_bytes().unwrap(), 1_048_576);
        assert_eq!(cfg.quality, "hd");
        assert_eq!(cfg.deflate_level, 6);
        assert!(cfg.hashing_available);
    }

    #[test]
    fn config_rejects_bad_level() {
        let err = ArchiveConfig::from_json_str(r#"{"deflate_level": 12}"#).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidArgument(_)));
    }
}
