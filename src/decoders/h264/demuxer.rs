// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Splits access units into NAL units, either by scanning for Annex-B start
//! codes or by reading AVC length prefixes.

use anyhow::anyhow;
use anyhow::Result;
use log::trace;
use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NalFormat {
    AnnexB,
    /// NAL units preceded by a big-endian length of `length_size` bytes.
    Avc { length_size: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DemuxError {
    #[error("NAL unit of {declared} bytes exceeds the {remaining} bytes left in the buffer")]
    LengthOverflow { declared: usize, remaining: usize },
}

/// A NAL unit as found in the access unit, without start code or prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawNalu<'a> {
    pub offset: usize,
    pub data: &'a [u8],
}

/// Lazy iterator over the NAL units of one access unit. Iteration stops
/// quietly when the remaining bytes cannot hold a complete NAL unit.
pub struct Demuxer<'a> {
    data: &'a [u8],
    pos: usize,
    format: NalFormat,
}

fn find_start_code(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|w| w == [0, 0, 1])
}

impl<'a> Demuxer<'a> {
    pub fn new(data: &'a [u8], format: NalFormat) -> Self {
        Self {
            data,
            pos: 0,
            format,
        }
    }

    /// Bytes that have not been consumed yet.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn next_annex_b(&mut self) -> Option<RawNalu<'a>> {
        loop {
            if self.remaining() < 4 {
                return None;
            }

            let sc = self.pos + find_start_code(&self.data[self.pos..])?;
            let start = sc + 3;

            // Only look for the next start code if there is room for a NAL
            // header and another start code.
            let next = if self.data.len() - sc >= 7 {
                find_start_code(&self.data[start..]).map(|p| start + p)
            } else {
                None
            };

            let mut end = next.unwrap_or(self.data.len());
            self.pos = end;

            // Zero bytes before the next start code belong to it, or are
            // trailing_zero_8bits.
            while end > start && self.data[end - 1] == 0 {
                end -= 1;
            }

            if end == start {
                trace!("Skipping empty NAL unit at offset {}", sc);
                continue;
            }

            return Some(RawNalu {
                offset: start,
                data: &self.data[start..end],
            });
        }
    }

    fn next_avc(&mut self, length_size: usize) -> Result<Option<RawNalu<'a>>, DemuxError> {
        loop {
            if self.remaining() < length_size || length_size == 0 {
                return Ok(None);
            }

            let declared = self.data[self.pos..self.pos + length_size]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
            let start = self.pos + length_size;
            let remaining = self.data.len() - start;

            if declared > remaining {
                self.pos = self.data.len();
                return Err(DemuxError::LengthOverflow {
                    declared,
                    remaining,
                });
            }

            self.pos = start + declared;
            if declared == 0 {
                continue;
            }

            return Ok(Some(RawNalu {
                offset: start,
                data: &self.data[start..start + declared],
            }));
        }
    }
}

impl<'a> Iterator for Demuxer<'a> {
    type Item = Result<RawNalu<'a>, DemuxError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.format {
            NalFormat::AnnexB => self.next_annex_b().map(Ok),
            NalFormat::Avc { length_size } => self.next_avc(length_size).transpose(),
        }
    }
}

/// Contents of an AVCDecoderConfigurationRecord (ISO/IEC 14496-15).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvcConfig<'a> {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub length_size: usize,
    pub spses: Vec<&'a [u8]>,
    pub ppses: Vec<&'a [u8]>,
}

fn read_records<'a>(data: &'a [u8], pos: &mut usize, count: usize) -> Result<Vec<&'a [u8]>> {
    let mut records = Vec::with_capacity(count);

    for _ in 0..count {
        let header = data
            .get(*pos..*pos + 2)
            .ok_or_else(|| anyhow!("avcC truncated in parameter set length"))?;
        let len = usize::from(u16::from_be_bytes([header[0], header[1]]));
        *pos += 2;

        let record = data
            .get(*pos..*pos + len)
            .ok_or_else(|| anyhow!("avcC truncated in parameter set of {} bytes", len))?;
        *pos += len;

        records.push(record);
    }

    Ok(records)
}

pub fn parse_avcc(data: &[u8]) -> Result<AvcConfig<'_>> {
    if data.len() < 8 {
        return Err(anyhow!("avcC too short: {} bytes", data.len()));
    }

    if data[0] != 1 {
        return Err(anyhow!("Unsupported avcC version {}", data[0]));
    }

    let length_size = usize::from(data[4] & 0x3) + 1;
    let num_sps = usize::from(data[5] & 0x1f);

    let mut pos = 6;
    let spses = read_records(data, &mut pos, num_sps)?;

    let num_pps = usize::from(
        *data
            .get(pos)
            .ok_or_else(|| anyhow!("avcC truncated before the PPS count"))?,
    );
    pos += 1;
    let ppses = read_records(data, &mut pos, num_pps)?;

    Ok(AvcConfig {
        profile_idc: data[1],
        level_idc: data[3],
        length_size,
        spses,
        ppses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(data: &[u8], format: NalFormat) -> Vec<&[u8]> {
        Demuxer::new(data, format)
            .map(|nalu| nalu.unwrap().data)
            .collect()
    }

    #[test]
    fn annex_b_start_codes() {
        let data = [
            0, 0, 0, 1, 0x67, 0xaa, 0xbb, // 4-byte start code
            0, 0, 1, 0x68, 0xcc, // 3-byte start code
            0, 0, 0, 1, 0x65, 0x88, 0x80, 0, 0,
        ];

        let nalus = collect(&data, NalFormat::AnnexB);
        assert_eq!(
            nalus,
            vec![&[0x67u8, 0xaa, 0xbb][..], &[0x68, 0xcc], &[0x65, 0x88, 0x80]]
        );

        let first = Demuxer::new(&data, NalFormat::AnnexB).next().unwrap().unwrap();
        assert_eq!(first.offset, 4);
    }

    #[test]
    fn annex_b_short_tail() {
        assert!(collect(&[0, 0, 1], NalFormat::AnnexB).is_empty());
        assert!(collect(&[0xff, 0xff, 0xff, 0xff], NalFormat::AnnexB).is_empty());
        assert_eq!(collect(&[0, 0, 1, 0x09], NalFormat::AnnexB), vec![&[0x09u8][..]]);
    }

    #[test]
    fn avc_length_prefixed() {
        let data = [0, 2, 0x67, 0x01, 0, 1, 0x68, 0];
        let mut demuxer = Demuxer::new(&data, NalFormat::Avc { length_size: 2 });
        assert_eq!(demuxer.next().unwrap().unwrap().data, &[0x67, 0x01]);
        assert_eq!(demuxer.next().unwrap().unwrap().data, &[0x68]);
        // A lone prefix byte is not enough to read a length.
        assert!(demuxer.next().is_none());
    }

    #[test]
    fn avc_length_overflow() {
        let data = [0, 0, 0, 9, 0x65, 0x88];
        let mut demuxer = Demuxer::new(&data, NalFormat::Avc { length_size: 4 });
        assert_eq!(
            demuxer.next(),
            Some(Err(DemuxError::LengthOverflow {
                declared: 9,
                remaining: 2
            }))
        );
        assert!(demuxer.next().is_none());
    }

    #[test]
    fn avcc_records() {
        let data = [
            1, 77, 0, 30, 0xff, 0xe1, 0, 3, 0x67, 0x4d, 0x00, 1, 0, 2, 0x68, 0xee,
        ];
        let config = parse_avcc(&data).unwrap();
        assert_eq!(config.length_size, 4);
        assert_eq!(config.profile_idc, 77);
        assert_eq!(config.spses, vec![&[0x67u8, 0x4d, 0x00][..]]);
        assert_eq!(config.ppses, vec![&[0x68u8, 0xee][..]]);

        assert!(parse_avcc(&data[..7]).is_err());
        assert!(parse_avcc(&data[..12]).is_err());

        let mut bad_version = data;
        bad_version[0] = 0;
        assert!(parse_avcc(&bad_version).is_err());
    }
}
