// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod backends;
pub mod decoder;
pub mod demuxer;
pub mod dpb;
pub mod frame_store;
pub mod nalu_reader;
pub mod parser;
pub mod picture;
pub mod poc;

#[cfg(test)]
pub mod synthetic;
