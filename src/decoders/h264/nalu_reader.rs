// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use anyhow::anyhow;
use anyhow::Result;
use bytes::Buf;

/// A bit reader for H.264 RBSP data. Emulation-prevention bytes are skipped
/// transparently but still accounted for in [`NaluReader::position`].
pub struct NaluReader<T> {
    /// Next unread byte of the underlying NAL payload.
    data: Cursor<T>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u32,
    num_remaining_bits_in_curr_byte: usize,
    /// Used in epb detection.
    prev_two_bytes: u32,
    num_epb: usize,
}

impl<T: AsRef<[u8]>> NaluReader<T> {
    pub fn new(data: T) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
        }
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U> {
        if num_bits > 31 {
            return Err(anyhow!("Overflow: more than 31 bits requested at once"));
        }

        let mut bits_left = num_bits;
        let mut out = 0;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        U::try_from(out).map_err(|_| anyhow!("Conversion failed"))
    }

    /// Skip any number of bits.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<()> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Number of emulation-prevention bytes met so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Number of bits consumed from the raw payload, emulation-prevention
    /// bytes included.
    pub fn position(&self) -> usize {
        self.data.position() as usize * 8 - self.num_remaining_bits_in_curr_byte
    }

    /// Whether the current position is byte aligned.
    pub fn is_byte_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte == 0
    }

    /// Implements more_rbsp_data().
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        let data = self.data.chunk();
        if data.iter().any(|b| *b != 0) {
            return true;
        }

        self.data.advance(self.data.remaining());
        false
    }

    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> Result<U> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 31 {
                return Err(anyhow!("Invalid stream: exp-Golomb prefix too long"));
            }
        }

        let value: u32 = if num_bits == 31 {
            // Only 2^31 - 1 fits once the prefix is this long.
            if self.read_bits::<u32>(num_bits)? != 0 {
                return Err(anyhow!("Invalid stream: exp-Golomb value overflows"));
            }
            (1u32 << num_bits) - 1
        } else if num_bits > 0 {
            (1u32 << num_bits) - 1 + self.read_bits::<u32>(num_bits)?
        } else {
            0
        };

        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> Result<U> {
        let ue = self.read_ue()?;
        if ue > max {
            Err(anyhow!(
                "Value out of bounds: expected at most {}, got {}",
                max,
                ue
            ))
        } else {
            U::try_from(ue).map_err(|_| anyhow!("Conversion error"))
        }
    }

    pub fn read_se<U: TryFrom<i32>>(&mut self) -> Result<U> {
        let ue = self.read_ue::<u32>()?;
        let se = if ue % 2 == 0 {
            -((ue / 2) as i64)
        } else {
            (ue / 2) as i64 + 1
        };

        i32::try_from(se)
            .ok()
            .and_then(|se| U::try_from(se).ok())
            .ok_or_else(|| anyhow!("Conversion error"))
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> Result<U> {
        let se = self.read_se()?;
        if se < min || se > max {
            Err(anyhow!(
                "Value out of bounds, expected between {}-{}, got {}",
                min,
                max,
                se
            ))
        } else {
            U::try_from(se).map_err(|_| anyhow!("Conversion error"))
        }
    }

    fn get_byte(&mut self) -> Result<u8> {
        if self.data.remaining() == 0 {
            return Err(anyhow!("Reader ran out of bits"));
        }

        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> Result<()> {
        let mut byte = self.get_byte()?;

        if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            self.num_epb += 1;
            byte = self.get_byte()?;
            // We need another 3 bytes before another epb can happen.
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);

        self.curr_byte = u32::from(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::NaluReader;

    // Adapted from media/video/h264_bit_reader_unittest.cc in Chromium.

    #[test]
    fn read_stream_without_escape_and_trailing_zero_bytes() {
        const RBSP: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 47);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.num_bits_left(), 39);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.num_bits_left(), 8);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 1);
        assert_eq!(reader.num_bits_left(), 7);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 6);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn stop_bit_occupy_full_byte() {
        const RBSP: [u8; 2] = [0xab, 0x80];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.num_bits_left(), 16);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xab);
        assert_eq!(reader.num_bits_left(), 8);

        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn emulation_prevention_bytes_are_counted() {
        const RBSP: [u8; 6] = [0x00, 0x00, 0x03, 0x01, 0xff, 0x80];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(16).unwrap(), 0);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x01);
        assert_eq!(reader.num_epb(), 1);
        // Three payload bytes plus the escape byte.
        assert_eq!(reader.position(), 32);
        assert_eq!(reader.read_bits::<u32>(4).unwrap(), 0xf);
        assert_eq!(reader.position(), 36);
    }

    #[test]
    fn exp_golomb() {
        // 1 | 010 | 011 | 00100 -> ue 0, 1, 2, 3, followed by a truncated code.
        const RBSP: [u8; 2] = [0b1010_0110, 0b0100_0010];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 1);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 2);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 3);
        assert!(reader.read_se::<i32>().is_err());
    }
}
