// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::decoders::h264::backends::params::IqMatrixBufferH264;
use crate::decoders::h264::backends::params::PictureParameterBufferH264;
use crate::decoders::h264::backends::params::SliceParameterBufferH264;
use crate::decoders::h264::parser::Pps;
use crate::decoders::h264::parser::Sps;
use crate::decoders::SurfaceId;
use crate::ChromaFormat;
use crate::Resolution;

pub type Result<T> = std::result::Result<T, crate::decoders::StatelessBackendError>;

pub mod dummy;
pub mod params;

/// H.264 profiles an accelerator context is created for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Profile {
    Baseline,
    ConstrainedBaseline,
    Main,
    High,
}

impl Profile {
    /// Profile to request for a stream using `sps` and `pps`. Extended
    /// streams are decoded as Main, and every profile above High as High.
    pub fn from_parameter_sets(sps: &Sps, pps: &Pps) -> Self {
        match sps.profile_idc {
            66 => {
                if sps.constraint_set1_flag
                    || (pps.num_slice_groups_minus1 == 0 && !pps.redundant_pic_cnt_present_flag)
                {
                    Profile::ConstrainedBaseline
                } else {
                    Profile::Baseline
                }
            }
            77 | 88 => Profile::Main,
            _ => Profile::High,
        }
    }
}

impl ChromaFormat {
    pub fn from_chroma_format_idc(chroma_format_idc: u8) -> Self {
        match chroma_format_idc {
            0 => ChromaFormat::Yuv400,
            1 => ChromaFormat::Yuv420,
            2 => ChromaFormat::Yuv422,
            _ => ChromaFormat::Yuv444,
        }
    }
}

/// Configuration of an accelerator decoding context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ContextParams {
    pub profile: Profile,
    /// Macroblock aligned size of the surfaces.
    pub resolution: Resolution,
    /// Number of surfaces the decoder may hold at once.
    pub num_surfaces: usize,
    pub chroma: ChromaFormat,
}

/// Everything the accelerator needs to decode one picture into its surface.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PictureBuffers {
    pub picture: PictureParameterBufferH264,
    pub iq_matrix: IqMatrixBufferH264,
    /// Slice parameters along with the slice NAL unit they describe.
    pub slices: Vec<(SliceParameterBufferH264, Vec<u8>)>,
}

/// Trait for stateless decoder backends. The decoder calls into the backend
/// to manage the decoding context and its surfaces, and to execute the decode
/// of fully described pictures. Submission is blocking.
pub trait StatelessDecoderBackend {
    /// Creates the decoding context and its surface pool.
    fn start(&mut self, params: &ContextParams) -> Result<()>;

    /// Recreates the decoding context after a profile, resolution or chroma
    /// format change. Surfaces of the previous context are released.
    fn reconfigure(&mut self, params: &ContextParams) -> Result<()>;

    /// Releases the decoding context.
    fn stop(&mut self);

    /// Obtains a surface to decode a new picture into.
    fn new_surface(&mut self) -> Result<SurfaceId>;

    /// Returns a surface of the current context to the pool once no picture
    /// refers to it anymore.
    fn release_surface(&mut self, surface: SurfaceId);

    /// Decodes the picture described by `buffers` into `surface`.
    fn submit_picture(&mut self, surface: SurfaceId, buffers: &PictureBuffers) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::h264::synthetic;

    #[test]
    fn profiles() {
        let mut sps = synthetic::sps(0);
        let mut pps = synthetic::pps(0);
        assert_eq!(Profile::from_parameter_sets(&sps, &pps), Profile::Main);

        sps.profile_idc = 66;
        assert_eq!(
            Profile::from_parameter_sets(&sps, &pps),
            Profile::ConstrainedBaseline
        );

        pps.redundant_pic_cnt_present_flag = true;
        assert_eq!(Profile::from_parameter_sets(&sps, &pps), Profile::Baseline);

        sps.constraint_set1_flag = true;
        assert_eq!(
            Profile::from_parameter_sets(&sps, &pps),
            Profile::ConstrainedBaseline
        );

        sps.profile_idc = 100;
        assert_eq!(Profile::from_parameter_sets(&sps, &pps), Profile::High);
    }

    #[test]
    fn chroma_formats() {
        assert_eq!(ChromaFormat::from_chroma_format_idc(0), ChromaFormat::Yuv400);
        assert_eq!(ChromaFormat::from_chroma_format_idc(1), ChromaFormat::Yuv420);
        assert_eq!(ChromaFormat::from_chroma_format_idc(3), ChromaFormat::Yuv444);
    }
}
