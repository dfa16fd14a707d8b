// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

/// Number of surfaces allocated on top of the DPB capacity so that the client
/// can hold on to output pictures while decoding continues.
pub const DEFAULT_EXTRA_SURFACES: usize = 4;

/// How access units handed to `decode` are framed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StreamFormat {
    /// Annex-B unless avcC codec data is supplied at start.
    #[default]
    Auto,
    AnnexB,
    /// Length-prefixed NAL units even without codec data.
    Avc,
}

fn extra_surfaces_default() -> usize {
    DEFAULT_EXTRA_SURFACES
}

fn nal_length_size_default() -> usize {
    4
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DecoderConfig {
    #[serde(default = "extra_surfaces_default")]
    pub extra_surfaces: usize,
    #[serde(default)]
    pub stream_format: StreamFormat,
    /// Length prefix size used when `stream_format` is `avc` and no codec data
    /// overrides it.
    #[serde(default = "nal_length_size_default")]
    pub nal_length_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            extra_surfaces: extra_surfaces_default(),
            stream_format: Default::default(),
            nal_length_size: nal_length_size_default(),
        }
    }
}

impl DecoderConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("error deserializing config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        Self::from_json(&json)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(1..=4).contains(&self.nal_length_size) {
            anyhow::bail!(
                "nal-length-size must be between 1 and 4, got {}",
                self.nal_length_size
            );
        }

        Ok(())
    }
}

impl FromStr for DecoderConfig {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_json(s).map_err(|e| format!("{:#}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = DecoderConfig::from_json("{}").unwrap();
        assert_eq!(config, DecoderConfig::default());
        assert_eq!(config.extra_surfaces, DEFAULT_EXTRA_SURFACES);
        assert_eq!(config.stream_format, StreamFormat::Auto);
    }

    #[test]
    fn config_from_json() {
        let config: DecoderConfig =
            r#"{"extra-surfaces": 2, "stream-format": "avc", "nal-length-size": 2}"#
                .parse()
                .unwrap();
        assert_eq!(config.extra_surfaces, 2);
        assert_eq!(config.stream_format, StreamFormat::Avc);
        assert_eq!(config.nal_length_size, 2);
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(DecoderConfig::from_json(r#"{"nal-length-size": 5}"#).is_err());
        assert!(DecoderConfig::from_json(r#"{"unknown-field": 1}"#).is_err());
    }
}
