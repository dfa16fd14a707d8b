// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control path of a stateless, hardware-accelerated H.264 decoder.
//!
//! The crate splits access units into NAL units, tracks parameter sets, runs
//! the picture order count, reference marking and decoded picture buffer
//! processes, and hands fully populated parameter buffers to an accelerator
//! implementing [`decoders::h264::backends::StatelessDecoderBackend`].

pub mod config;
pub mod decoders;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Chroma sampling of the decoded surfaces.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChromaFormat {
    Yuv400,
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}
