// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use thiserror::Error;

use crate::Resolution;

pub mod h264;

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Opaque accelerator surface handle.
pub type SurfaceId = u32;

#[derive(Default)]
struct ReleasedSurfaces {
    surfaces: VecDeque<SurfaceId>,
    /// Bumped whenever the accelerator context is recreated. Surfaces of an
    /// older context are not given back.
    generation: u64,
}

/// Queue of surfaces whose last handle was dropped, shared by the decoder and
/// every `SurfaceHandle` it hands out. The decoder gives the queued surfaces
/// back to the accelerator before allocating new ones.
#[derive(Clone, Default)]
pub struct SurfacePoolHandle {
    inner: Rc<RefCell<ReleasedSurfaces>>,
}

impl SurfacePoolHandle {
    pub fn new() -> Self {
        Default::default()
    }

    /// Wraps a surface obtained from the accelerator into a handle that
    /// returns it here once dropped.
    pub fn wrap(&self, id: SurfaceId) -> Rc<SurfaceHandle> {
        Rc::new(SurfaceHandle {
            id,
            generation: self.inner.borrow().generation,
            pool: self.clone(),
        })
    }

    /// Forgets the surfaces of the previous accelerator context.
    pub fn new_generation(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.generation += 1;
        inner.surfaces.clear();
    }

    /// Takes the surfaces released since the last call.
    pub fn take_released(&self) -> Vec<SurfaceId> {
        self.inner.borrow_mut().surfaces.drain(..).collect()
    }
}

/// Shared ownership of an accelerator surface. Pictures in the DPB, both
/// fields of a frame and output pictures held by the client all keep a clone;
/// the surface goes back to the pool when the last one is dropped.
pub struct SurfaceHandle {
    id: SurfaceId,
    generation: u64,
    pool: SurfacePoolHandle,
}

impl SurfaceHandle {
    pub fn id(&self) -> SurfaceId {
        self.id
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        let mut inner = self.pool.inner.borrow_mut();

        // Only give back surfaces of the current context, stale ones are
        // already gone.
        if inner.generation == self.generation {
            inner.surfaces.push_back(self.id);
        }
    }
}

impl PartialEq for SurfaceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.generation == other.generation
    }
}

impl Eq for SurfaceHandle {}

impl std::fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Non-error outcomes of a decode call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    Success,
    /// The stream geometry or profile changed and the accelerator context was
    /// (re)created. The client must renegotiate its output buffers.
    FormatChange,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid data: {0:#}")]
    InvalidData(anyhow::Error),
    #[error("parser failure: {0:#}")]
    ParserFail(anyhow::Error),
    #[error("decode failure: {0:#}")]
    Fail(anyhow::Error),
    #[error("out of memory: {0:#}")]
    MemoryFail(anyhow::Error),
    #[error(transparent)]
    StatelessBackendError(#[from] StatelessBackendError),
}

#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("Not enough resources to proceed with the operation now.")]
    OutOfResources,
    #[error("This format is not supported.")]
    UnsupportedFormat,
    #[error("Negotiation failed")]
    NegotiationFailed(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A picture ready to be displayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedPicture {
    /// The surface is not reused while this picture, or a clone of it, is
    /// alive.
    pub surface: Rc<SurfaceHandle>,
    pub pic_order_cnt: i32,
    pub timestamp: u64,
    pub coded_resolution: Resolution,
    pub display_resolution: Resolution,
    /// Whether the surface holds an interlaced field pair or a single field.
    pub interlaced: bool,
}

impl DecodedPicture {
    pub fn surface_id(&self) -> SurfaceId {
        self.surface.id()
    }
}

pub trait VideoDecoder {
    /// Prepares the decoder. `codec_data` optionally carries an out-of-band
    /// configuration record, e.g. avcC for H.264.
    fn start(&mut self, codec_data: Option<&[u8]>) -> Result<()>;

    /// Decode one access unit tagged with `timestamp`.
    fn decode(&mut self, bitstream: &[u8], timestamp: u64) -> Result<DecodeStatus>;

    /// Returns the next picture ready for display, if any. When `draining` is
    /// true, the decoder first finishes the pending picture and outputs every
    /// buffered picture.
    fn get_output(&mut self, draining: bool) -> Option<DecodedPicture>;

    /// Finish the pending picture and emit every picture waiting for output.
    fn flush(&mut self) -> Result<()>;

    /// Drop every buffered picture without outputting it.
    fn reset(&mut self);

    /// Flush, release all pictures and stop the accelerator.
    fn stop(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_returns_after_last_handle() {
        let pool = SurfacePoolHandle::new();
        let handle = pool.wrap(3);
        let other = Rc::clone(&handle);

        drop(handle);
        assert!(pool.take_released().is_empty());

        drop(other);
        assert_eq!(pool.take_released(), vec![3]);
        assert!(pool.take_released().is_empty());
    }

    #[test]
    fn stale_surfaces_are_not_returned() {
        let pool = SurfacePoolHandle::new();
        let old = pool.wrap(1);
        let queued = pool.wrap(2);
        drop(queued);

        pool.new_generation();
        let new = pool.wrap(1);
        assert_ne!(*old, *new);

        drop(old);
        assert!(pool.take_released().is_empty());

        drop(new);
        assert_eq!(pool.take_released(), vec![1]);
    }
}
