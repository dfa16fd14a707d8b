// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// This file contains a dummy backend whose only purpose is to let the decoder
// run without an accelerator, so we can test it in isolation. It records what
// it is asked to do.

use log::debug;

use crate::decoders::h264::backends::ContextParams;
use crate::decoders::h264::backends::PictureBuffers;
use crate::decoders::h264::backends::Result as StatelessBackendResult;
use crate::decoders::h264::backends::StatelessDecoderBackend;
use crate::decoders::StatelessBackendError;
use crate::decoders::SurfaceId;

#[derive(Default)]
pub struct Backend {
    /// Parameters of the current context, if any.
    pub context: Option<ContextParams>,
    /// Number of times the context was recreated.
    pub num_reconfigurations: usize,
    /// Every picture submitted since the backend was created.
    pub submissions: Vec<(SurfaceId, PictureBuffers)>,
    /// When set, surface allocation fails while that many surfaces of the
    /// current context are in use.
    pub surface_limit: Option<usize>,
    next_surface: SurfaceId,
    free_surfaces: Vec<SurfaceId>,
    live_surfaces: usize,
}

impl Backend {
    pub fn new() -> Self {
        Default::default()
    }

    /// Surfaces of the current context handed out and not released yet.
    pub fn num_live_surfaces(&self) -> usize {
        self.live_surfaces
    }
}

impl StatelessDecoderBackend for Backend {
    fn start(&mut self, params: &ContextParams) -> StatelessBackendResult<()> {
        debug!("Starting dummy context with {:?}", params);

        self.context = Some(*params);
        self.free_surfaces.clear();
        self.live_surfaces = 0;
        Ok(())
    }

    fn reconfigure(&mut self, params: &ContextParams) -> StatelessBackendResult<()> {
        debug!("Reconfiguring dummy context with {:?}", params);

        self.context = Some(*params);
        self.num_reconfigurations += 1;
        self.free_surfaces.clear();
        self.live_surfaces = 0;
        Ok(())
    }

    fn stop(&mut self) {
        self.context = None;
        self.free_surfaces.clear();
        self.live_surfaces = 0;
    }

    fn new_surface(&mut self) -> StatelessBackendResult<SurfaceId> {
        if self.context.is_none() {
            return Err(StatelessBackendError::Other(anyhow::anyhow!(
                "No decoding context"
            )));
        }

        if matches!(self.surface_limit, Some(limit) if self.live_surfaces >= limit) {
            return Err(StatelessBackendError::OutOfResources);
        }

        let surface = match self.free_surfaces.pop() {
            Some(surface) => surface,
            None => {
                let surface = self.next_surface;
                self.next_surface = self.next_surface.wrapping_add(1);
                surface
            }
        };
        self.live_surfaces += 1;

        Ok(surface)
    }

    fn release_surface(&mut self, surface: SurfaceId) {
        debug!("Surface {} released", surface);

        self.free_surfaces.push(surface);
        self.live_surfaces = self.live_surfaces.saturating_sub(1);
    }

    fn submit_picture(
        &mut self,
        surface: SurfaceId,
        buffers: &PictureBuffers,
    ) -> StatelessBackendResult<()> {
        self.submissions.push((surface, buffers.clone()));
        Ok(())
    }
}
