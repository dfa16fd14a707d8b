// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A frame store is one DPB slot: a frame, or a pair of complementary fields
//! decoded into the same surface.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Result;
use log::debug;

use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::PictureData;
use crate::decoders::h264::picture::PictureRc;
use crate::decoders::SurfaceHandle;

pub type FrameStoreRef = Rc<RefCell<FrameStore>>;

pub struct FrameStore {
    structure: Field,
    pictures: Vec<PictureRc>,
    /// Number of pictures in this store waiting to be output.
    output_needed: usize,
}

impl FrameStore {
    pub fn new(pic: PictureRc) -> Self {
        let (structure, output_needed) = {
            let p = pic.borrow();
            (p.field, usize::from(p.needed_for_output))
        };

        Self {
            structure,
            pictures: vec![pic],
            output_needed,
        }
    }

    /// Pairs the second field `pic` with the single field held by this store.
    /// Each field must only know the order count of its own parity, the
    /// other one is copied across.
    pub fn add_picture(&mut self, pic: PictureRc) -> Result<()> {
        if self.pictures.len() != 1 {
            return Err(anyhow!(
                "Frame store already holds {} pictures",
                self.pictures.len()
            ));
        }

        let first_rc = Rc::clone(&self.pictures[0]);
        let mut first = first_rc.borrow_mut();
        let mut second = pic.borrow_mut();

        let parity = second.field;
        if parity == Field::Frame || first.field == Field::Frame {
            return Err(anyhow!("Only two fields can be paired in a frame store"));
        }

        if first.field.opposite() != Some(parity) {
            return Err(anyhow!(
                "Cannot pair two fields of the same parity ({:?})",
                parity
            ));
        }

        // Both slots are checked before anything is written.
        if first.field_order_cnt(parity).is_some() {
            return Err(anyhow!(
                "First field already has an order count for the {:?} field",
                parity
            ));
        }

        let opposite = first.field;
        if second.field_order_cnt(opposite).is_some() {
            return Err(anyhow!(
                "Second field already has an order count for the {:?} field",
                opposite
            ));
        }

        match parity {
            Field::Top => {
                first.top_field_order_cnt = second.top_field_order_cnt;
                second.bottom_field_order_cnt = first.bottom_field_order_cnt;
            }
            _ => {
                first.bottom_field_order_cnt = second.bottom_field_order_cnt;
                second.top_field_order_cnt = first.top_field_order_cnt;
            }
        }

        if second.output_flag {
            second.needed_for_output = true;
            self.output_needed += 1;
        }

        debug!(
            "Paired fields of frame_num {} with POCs {:?}/{:?}",
            first.frame_num, first.top_field_order_cnt, first.bottom_field_order_cnt
        );

        drop(second);
        drop(first);

        self.structure = Field::Frame;
        self.pictures.push(pic);

        Ok(())
    }

    /// Stores a frame as two fields, the frame becoming the top field.
    pub fn split_fields(&mut self) -> Result<()> {
        if self.pictures.len() != 1 || self.pictures[0].borrow().field != Field::Frame {
            return Err(anyhow!("Only a single frame can be split into fields"));
        }

        let bottom = PictureData::split_frame(&self.pictures[0]);

        {
            let mut b = bottom.borrow_mut();
            if b.output_flag && !b.nonexisting {
                b.needed_for_output = true;
                self.output_needed += 1;
            }
        }

        self.pictures.push(bottom);
        Ok(())
    }

    /// Whether the store holds a complete frame.
    pub fn has_frame(&self) -> bool {
        self.structure == Field::Frame
    }

    /// Whether any held picture is used for reference.
    pub fn has_reference(&self) -> bool {
        self.pictures.iter().any(|p| p.borrow().is_ref())
    }

    pub fn has_short_term_reference(&self) -> bool {
        self.pictures.iter().any(|p| p.borrow().is_short_term())
    }

    pub fn has_long_term_reference(&self) -> bool {
        self.pictures.iter().any(|p| p.borrow().is_long_term())
    }

    /// Whether the store is a frame with every field used for short term
    /// reference, so that it can be referenced by a frame.
    pub fn is_short_term_frame(&self) -> bool {
        self.has_frame() && self.pictures.iter().all(|p| p.borrow().is_short_term())
    }

    /// Same as `is_short_term_frame()` for long term references.
    pub fn is_long_term_frame(&self) -> bool {
        self.has_frame() && self.pictures.iter().all(|p| p.borrow().is_long_term())
    }

    pub fn pictures(&self) -> &[PictureRc] {
        &self.pictures
    }

    /// The picture representing the whole store.
    pub fn first(&self) -> &PictureRc {
        &self.pictures[0]
    }

    pub fn surface(&self) -> Option<Rc<SurfaceHandle>> {
        self.pictures[0].borrow().surface.clone()
    }

    pub fn frame_num(&self) -> i32 {
        self.pictures[0].borrow().frame_num
    }

    /// Order count of the store, the lowest known field order count.
    pub fn pic_order_cnt(&self) -> i32 {
        self.pictures
            .iter()
            .filter_map(|p| p.borrow().field_order_cnt(Field::Frame))
            .min()
            .unwrap_or_default()
    }

    pub fn is_output_needed(&self) -> bool {
        self.output_needed > 0
    }

    /// Whether every picture of the store is a non-existing one.
    pub fn is_nonexisting(&self) -> bool {
        self.pictures.iter().all(|p| p.borrow().nonexisting)
    }

    /// Marks every picture as output.
    pub fn mark_output(&mut self) {
        for pic in &self.pictures {
            pic.borrow_mut().needed_for_output = false;
        }
        self.output_needed = 0;
    }

    pub fn is_interlaced(&self) -> bool {
        self.pictures[0].borrow().interlaced
    }
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("structure", &self.structure)
            .field("pictures", &self.pictures)
            .field("output_needed", &self.output_needed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::h264::picture::Reference;
    use crate::decoders::SurfacePoolHandle;

    fn field(field: Field, poc: i32) -> PictureRc {
        let mut pic = PictureData {
            surface: Some(SurfacePoolHandle::new().wrap(1)),
            field,
            pic_order_cnt: poc,
            output_flag: true,
            needed_for_output: true,
            ..Default::default()
        };
        match field {
            Field::Top => pic.top_field_order_cnt = Some(poc),
            Field::Bottom => pic.bottom_field_order_cnt = Some(poc),
            Field::Frame => {
                pic.top_field_order_cnt = Some(poc);
                pic.bottom_field_order_cnt = Some(poc + 1);
            }
        }
        Rc::new(RefCell::new(pic))
    }

    #[test]
    fn pair_fields() {
        let top = field(Field::Top, 4);
        let bottom = field(Field::Bottom, 5);

        let mut store = FrameStore::new(Rc::clone(&top));
        assert!(!store.has_frame());
        store.add_picture(Rc::clone(&bottom)).unwrap();

        assert!(store.has_frame());
        assert_eq!(top.borrow().bottom_field_order_cnt, Some(5));
        assert_eq!(bottom.borrow().top_field_order_cnt, Some(4));
        assert_eq!(store.pic_order_cnt(), 4);
        assert!(store.is_output_needed());
    }

    #[test]
    fn add_picture_rejects_double_write() {
        let top = field(Field::Top, 4);
        top.borrow_mut().bottom_field_order_cnt = Some(5);

        let mut store = FrameStore::new(top);
        assert!(store.add_picture(field(Field::Bottom, 5)).is_err());
        assert!(!store.has_frame());
    }

    #[test]
    fn add_picture_only_once() {
        let mut store = FrameStore::new(field(Field::Top, 0));
        store.add_picture(field(Field::Bottom, 1)).unwrap();
        assert!(store.add_picture(field(Field::Bottom, 1)).is_err());
    }

    #[test]
    fn add_picture_rejects_same_parity_and_frames() {
        let mut store = FrameStore::new(field(Field::Top, 0));
        assert!(store.add_picture(field(Field::Top, 2)).is_err());
        assert!(store.add_picture(field(Field::Frame, 2)).is_err());

        let mut frame_store = FrameStore::new(field(Field::Frame, 0));
        assert!(frame_store.add_picture(field(Field::Bottom, 1)).is_err());
    }

    #[test]
    fn split_fields() {
        let frame = field(Field::Frame, 2);
        frame.borrow_mut().set_reference(Reference::ShortTerm, false);

        let mut store = FrameStore::new(Rc::clone(&frame));
        store.split_fields().unwrap();

        assert!(store.has_frame());
        assert!(store.has_reference());
        assert_eq!(store.pictures().len(), 2);
        assert_eq!(store.pictures()[1].borrow().field, Field::Bottom);
        assert_eq!(store.pictures()[1].borrow().pic_order_cnt, 3);
        assert!(store.is_short_term_frame());
        assert!(store.split_fields().is_err());

        store.mark_output();
        assert!(!store.is_output_needed());
    }
}
