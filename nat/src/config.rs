// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Startup configuration of the NAT engine
//!
//! A [`NatConfig`] is either built programmatically with [`NatConfigBuilder`], or parsed from a
//! startup stanza such as:
//!
//! ```text
//! snat {
//!     translation hash buckets 2048
//!     user hash memory 32m
//!     max translations per user 50
//!     outside VRF id 1
//!     static mapping only connection tracking
//! }
//! ```

use derive_builder::Builder;
use std::str::FromStr;

pub const DEFAULT_TRANSLATION_BUCKETS: u32 = 1024;
pub const DEFAULT_TRANSLATION_MEMORY_SIZE: u64 = 128 << 20;
pub const DEFAULT_USER_BUCKETS: u32 = 128;
pub const DEFAULT_USER_MEMORY_SIZE: u64 = 64 << 20;
pub const DEFAULT_MAX_TRANSLATIONS_PER_USER: u32 = 100;
pub const DEFAULT_STATIC_MAPPING_BUCKETS: u32 = 1024;
pub const DEFAULT_STATIC_MAPPING_MEMORY_SIZE: u64 = 64 << 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NatConfigError {
    #[error("unknown input: '{0}'")]
    UnknownInput(String),
    #[error("missing value after '{0}'")]
    MissingValue(String),
    #[error("invalid value '{value}' for '{setting}'")]
    InvalidValue { setting: String, value: String },
    #[error("unbalanced braces in configuration stanza")]
    UnbalancedBraces,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Builder, Debug, Clone, PartialEq, Eq)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct NatConfig {
    /// Expected number of sessions, sizes the session indices.
    pub translation_buckets: u32,
    /// Accepted for compatibility with existing `snat` stanzas, not used for sizing.
    pub translation_memory_size: u64,
    /// Expected number of users, sizes the user index.
    pub user_buckets: u32,
    /// Accepted for compatibility with existing `snat` stanzas, not used for sizing.
    pub user_memory_size: u64,
    /// Maximum number of dynamic sessions of one user.
    pub max_translations_per_user: u32,
    pub outside_vrf_id: u32,
    /// VRF of static mappings that do not name one.
    pub inside_vrf_id: u32,
    pub static_mapping_buckets: u32,
    /// Accepted for compatibility with existing `snat` stanzas, not used for sizing.
    pub static_mapping_memory_size: u64,
    /// Only translate through static mappings, never create dynamic sessions.
    pub static_mapping_only: bool,
    /// In static-mapping-only mode, still track sessions of static mappings.
    pub static_mapping_connection_tracking: bool,
    /// Seed of the port allocator, for reproducible allocations.
    #[builder(setter(strip_option))]
    pub random_seed: Option<u64>,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            translation_buckets: DEFAULT_TRANSLATION_BUCKETS,
            translation_memory_size: DEFAULT_TRANSLATION_MEMORY_SIZE,
            user_buckets: DEFAULT_USER_BUCKETS,
            user_memory_size: DEFAULT_USER_MEMORY_SIZE,
            max_translations_per_user: DEFAULT_MAX_TRANSLATIONS_PER_USER,
            outside_vrf_id: 0,
            inside_vrf_id: 0,
            static_mapping_buckets: DEFAULT_STATIC_MAPPING_BUCKETS,
            static_mapping_memory_size: DEFAULT_STATIC_MAPPING_MEMORY_SIZE,
            static_mapping_only: false,
            static_mapping_connection_tracking: false,
            random_seed: None,
        }
    }
}

impl NatConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.static_mapping_connection_tracking == Some(true)
            && self.static_mapping_only != Some(true)
        {
            return Err("connection tracking requires static mapping only mode".to_string());
        }
        Ok(())
    }
}

impl NatConfig {
    #[must_use]
    pub fn builder() -> NatConfigBuilder {
        NatConfigBuilder::default()
    }

    /// Whether sessions are created and tracked: always with dynamic translations, and with
    /// connection tracking in static-mapping-only mode.
    #[must_use]
    pub fn session_tracking(&self) -> bool {
        !self.static_mapping_only || self.static_mapping_connection_tracking
    }
}

#[derive(Debug, Clone, Copy)]
enum Setting {
    TranslationBuckets,
    TranslationMemory,
    UserBuckets,
    UserMemory,
    MaxTranslationsPerUser,
    OutsideVrf,
    InsideVrf,
    StaticMappingOnly,
}

const PHRASES: [(&[&str], Setting); 8] = [
    (&["translation", "hash", "buckets"], Setting::TranslationBuckets),
    (&["translation", "hash", "memory"], Setting::TranslationMemory),
    (&["user", "hash", "buckets"], Setting::UserBuckets),
    (&["user", "hash", "memory"], Setting::UserMemory),
    (&["max", "translations", "per", "user"], Setting::MaxTranslationsPerUser),
    (&["outside", "VRF", "id"], Setting::OutsideVrf),
    (&["inside", "VRF", "id"], Setting::InsideVrf),
    (&["static", "mapping", "only"], Setting::StaticMappingOnly),
];

const CONNECTION_TRACKING: [&str; 2] = ["connection", "tracking"];

fn parse_value<T: FromStr>(phrase: &[&str], token: Option<&&str>) -> Result<T, NatConfigError> {
    let token = token.ok_or_else(|| NatConfigError::MissingValue(phrase.join(" ")))?;
    token.parse().map_err(|_| NatConfigError::InvalidValue {
        setting: phrase.join(" "),
        value: (*token).to_string(),
    })
}

/// Parse a memory size, with an optional `k`, `m` or `g` suffix.
fn parse_memory_size(phrase: &[&str], token: Option<&&str>) -> Result<u64, NatConfigError> {
    let token = token.ok_or_else(|| NatConfigError::MissingValue(phrase.join(" ")))?;
    let invalid = || NatConfigError::InvalidValue {
        setting: phrase.join(" "),
        value: (*token).to_string(),
    };
    let (digits, shift) = match token.char_indices().last() {
        Some((i, 'k' | 'K')) => (&token[..i], 10),
        Some((i, 'm' | 'M')) => (&token[..i], 20),
        Some((i, 'g' | 'G')) => (&token[..i], 30),
        _ => (*token, 0),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|value| value.checked_mul(1 << shift))
        .ok_or_else(invalid)
}

/// Remove the optional `snat { ... }` wrapping around the settings.
fn stanza_body(input: &str) -> Result<&str, NatConfigError> {
    let input = input.trim();
    let input = input.strip_prefix("snat").map_or(input, str::trim_start);
    match (input.strip_prefix('{'), input.ends_with('}')) {
        (Some(inner), true) => Ok(&inner[..inner.len() - 1]),
        (None, false) if !input.contains(['{', '}']) => Ok(input),
        _ => Err(NatConfigError::UnbalancedBraces),
    }
}

impl FromStr for NatConfig {
    type Err = NatConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = stanza_body(input)?.split_whitespace().collect();
        let mut builder = NatConfigBuilder::default();
        let mut i = 0;
        while i < tokens.len() {
            let (phrase, setting) = PHRASES
                .iter()
                .find(|(phrase, _)| tokens[i..].starts_with(phrase))
                .ok_or_else(|| NatConfigError::UnknownInput(tokens[i..].join(" ")))?;
            i += phrase.len();
            let value = tokens.get(i);
            match setting {
                Setting::TranslationBuckets => {
                    builder.translation_buckets(parse_value(phrase, value)?);
                }
                Setting::TranslationMemory => {
                    builder.translation_memory_size(parse_memory_size(phrase, value)?);
                }
                Setting::UserBuckets => {
                    builder.user_buckets(parse_value(phrase, value)?);
                }
                Setting::UserMemory => {
                    builder.user_memory_size(parse_memory_size(phrase, value)?);
                }
                Setting::MaxTranslationsPerUser => {
                    builder.max_translations_per_user(parse_value(phrase, value)?);
                }
                Setting::OutsideVrf => {
                    builder.outside_vrf_id(parse_value(phrase, value)?);
                }
                Setting::InsideVrf => {
                    builder.inside_vrf_id(parse_value(phrase, value)?);
                }
                Setting::StaticMappingOnly => {
                    builder.static_mapping_only(true);
                    if tokens[i..].starts_with(&CONNECTION_TRACKING) {
                        builder.static_mapping_connection_tracking(true);
                        i += CONNECTION_TRACKING.len();
                    }
                    continue;
                }
            }
            i += 1;
        }
        builder
            .build()
            .map_err(|e| NatConfigError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = NatConfig::builder().build().unwrap();
        assert_eq!(config, NatConfig::default());
        assert_eq!(config.translation_buckets, 1024);
        assert_eq!(config.translation_memory_size, 128 << 20);
        assert_eq!(config.user_buckets, 128);
        assert_eq!(config.user_memory_size, 64 << 20);
        assert_eq!(config.max_translations_per_user, 100);
        assert_eq!(config.static_mapping_buckets, 1024);
        assert!(!config.static_mapping_only);
        assert!(config.session_tracking());
        assert_eq!("".parse::<NatConfig>().unwrap(), config);
    }

    #[test]
    fn test_builder_validation() {
        assert!(
            NatConfig::builder()
                .static_mapping_connection_tracking(true)
                .build()
                .is_err()
        );
        let config = NatConfig::builder()
            .static_mapping_only(true)
            .static_mapping_connection_tracking(true)
            .random_seed(3)
            .build()
            .unwrap();
        assert!(config.session_tracking());
        assert_eq!(config.random_seed, Some(3));
    }

    #[test]
    fn test_parse_stanza() {
        let config: NatConfig = "snat {
            translation hash buckets 2048
            translation hash memory 256m
            user hash buckets 64
            user hash memory 1048576
            max translations per user 50
            outside VRF id 1
            inside VRF id 2
            static mapping only connection tracking
        }"
        .parse()
        .unwrap();
        assert_eq!(
            config,
            NatConfig {
                translation_buckets: 2048,
                translation_memory_size: 256 << 20,
                user_buckets: 64,
                user_memory_size: 1 << 20,
                max_translations_per_user: 50,
                outside_vrf_id: 1,
                inside_vrf_id: 2,
                static_mapping_only: true,
                static_mapping_connection_tracking: true,
                ..NatConfig::default()
            }
        );
    }

    #[test]
    fn test_parse_static_only_without_tracking() {
        let config: NatConfig = "static mapping only max translations per user 7"
            .parse()
            .unwrap();
        assert!(config.static_mapping_only);
        assert!(!config.static_mapping_connection_tracking);
        assert!(!config.session_tracking());
        assert_eq!(config.max_translations_per_user, 7);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "translation hash buckets".parse::<NatConfig>(),
            Err(NatConfigError::MissingValue(
                "translation hash buckets".to_string()
            ))
        );
        assert_eq!(
            "user hash memory 12x".parse::<NatConfig>(),
            Err(NatConfigError::InvalidValue {
                setting: "user hash memory".to_string(),
                value: "12x".to_string()
            })
        );
        assert_eq!(
            "outside VRF id 1 bogus".parse::<NatConfig>(),
            Err(NatConfigError::UnknownInput("bogus".to_string()))
        );
        assert_eq!(
            "snat { outside VRF id 1".parse::<NatConfig>(),
            Err(NatConfigError::UnbalancedBraces)
        );
        assert_eq!(
            "max translations per user -1".parse::<NatConfig>(),
            Err(NatConfigError::InvalidValue {
                setting: "max translations per user".to_string(),
                value: "-1".to_string()
            })
        );
    }

    #[test]
    fn test_memory_sizes() {
        let phrase = ["m"];
        assert_eq!(parse_memory_size(&phrase, Some(&"4k")), Ok(4096));
        assert_eq!(parse_memory_size(&phrase, Some(&"2G")), Ok(2 << 30));
        assert_eq!(parse_memory_size(&phrase, Some(&"17")), Ok(17));
        assert!(parse_memory_size(&phrase, Some(&"k")).is_err());
    }
}
