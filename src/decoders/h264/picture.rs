// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use log::debug;

use crate::decoders::h264::parser::RefPicMarking;
use crate::decoders::h264::parser::Slice;
use crate::decoders::h264::parser::SliceType;
use crate::decoders::h264::parser::Sps;
use crate::decoders::SurfaceHandle;
use crate::decoders::SurfaceId;
use crate::Resolution;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    /// Returns the field of opposite parity.
    pub fn opposite(&self) -> Option<Self> {
        match *self {
            Field::Frame => None,
            Field::Top => Some(Field::Bottom),
            Field::Bottom => Some(Field::Top),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// Pictures are shared between the decoder, frame stores, the DPB and
/// reference lists. Two fields of a frame point to each other weakly.
pub type PictureRc = Rc<RefCell<PictureData>>;

#[derive(Default)]
pub struct PictureData {
    /// Accelerator surface. Non-existing pictures have none.
    pub surface: Option<Rc<SurfaceHandle>>,
    pub pps_id: u8,

    /// Field order counts. `None` until assigned, a field only knows the one
    /// of its own parity until it is paired.
    pub top_field_order_cnt: Option<i32>,
    pub bottom_field_order_cnt: Option<i32>,
    pub pic_order_cnt: i32,

    pub pic_num: i32,
    pub long_term_pic_num: i32,
    pub frame_num: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: i32,

    pub coded_resolution: Resolution,
    pub display_resolution: Resolution,

    pub type_: SliceType,
    pub nal_ref_idc: u8,
    pub is_idr: IsIdr,
    pub(crate) reference: Reference,
    /// Whether the picture is meant to be output at all.
    pub output_flag: bool,
    pub needed_for_output: bool,

    // Does memory management op 5 needs to be executed after this
    // picture has finished decoding?
    pub has_mmco_5: bool,

    // Created by the decoding process for gaps in frame_num.
    // Not for decode or output.
    pub nonexisting: bool,

    pub field: Field,
    /// Part of an interlaced sequence, either coded as a field or split.
    pub interlaced: bool,

    // Values from slice_hdr to be used during reference marking and
    // memory management after finishing this picture.
    pub ref_pic_marking: RefPicMarking,

    pub(crate) is_second_field: bool,
    pub(crate) other_field: Option<Weak<RefCell<Self>>>,

    pub timestamp: u64,
}

impl PictureData {
    pub fn new_non_existing(frame_num: i32, timestamp: u64) -> Self {
        PictureData {
            frame_num,
            frame_num_wrap: frame_num,
            nonexisting: true,
            nal_ref_idc: 1,
            field: Field::Frame,
            pic_num: frame_num,
            reference: Reference::ShortTerm,
            timestamp,
            ..Default::default()
        }
    }

    /// Builds the structure and reference flags of a new picture from the
    /// first slice of that picture. The POC is assigned separately.
    pub fn new_from_slice(
        slice: &Slice,
        sps: &Sps,
        surface: Option<Rc<SurfaceHandle>>,
        timestamp: u64,
    ) -> Self {
        let hdr = &slice.header;
        let nalu_hdr = &slice.nalu.header;

        let is_idr = if nalu_hdr.idr_pic_flag {
            IsIdr::Yes {
                idr_pic_id: hdr.idr_pic_id,
            }
        } else {
            IsIdr::No
        };

        let field = if hdr.field_pic_flag {
            if hdr.bottom_field_flag {
                Field::Bottom
            } else {
                Field::Top
            }
        } else {
            Field::Frame
        };

        let reference = if nalu_hdr.ref_idc == 0 {
            Reference::None
        } else if nalu_hdr.idr_pic_flag && hdr.dec_ref_pic_marking.long_term_reference_flag {
            Reference::LongTerm
        } else {
            Reference::ShortTerm
        };

        let pic_num = if !hdr.field_pic_flag {
            i32::from(hdr.frame_num)
        } else {
            2 * i32::from(hdr.frame_num) + 1
        };

        PictureData {
            surface,
            pps_id: hdr.pic_parameter_set_id,
            pic_num,
            frame_num: i32::from(hdr.frame_num),
            frame_num_wrap: i32::from(hdr.frame_num),
            coded_resolution: sps.coded_resolution(),
            display_resolution: sps.display_resolution(),
            type_: hdr.slice_type,
            nal_ref_idc: nalu_hdr.ref_idc,
            is_idr,
            reference,
            output_flag: true,
            field,
            interlaced: hdr.field_pic_flag,
            ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            timestamp,
            ..Default::default()
        }
    }

    /// Creates the second field of `first_field` from the first slice of that
    /// field. Both fields decode into the same surface.
    pub fn new_second_field(
        first_field: &PictureRc,
        slice: &Slice,
        sps: &Sps,
        timestamp: u64,
    ) -> PictureRc {
        let surface = first_field.borrow().surface.clone();

        let mut second = PictureData::new_from_slice(slice, sps, surface, timestamp);
        second.is_second_field = true;
        second.other_field = Some(Rc::downgrade(first_field));

        let second = Rc::new(RefCell::new(second));
        first_field.borrow_mut().other_field = Some(Rc::downgrade(&second));

        second
    }

    pub fn surface_id(&self) -> Option<SurfaceId> {
        self.surface.as_ref().map(|s| s.id())
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn is_short_term(&self) -> bool {
        matches!(self.reference, Reference::ShortTerm)
    }

    pub fn is_long_term(&self) -> bool {
        matches!(self.reference, Reference::LongTerm)
    }

    pub fn is_idr(&self) -> bool {
        matches!(self.is_idr, IsIdr::Yes { .. })
    }

    /// Whether this picture is a second field.
    pub fn is_second_field(&self) -> bool {
        self.is_second_field
    }

    /// Mark the picture as a reference picture.
    pub fn set_reference(&mut self, reference: Reference, apply_to_other_field: bool) {
        debug!(
            "Set reference of frame_num {} ({:?}, POC {}) to {:?}",
            self.frame_num, self.field, self.pic_order_cnt, reference
        );
        self.reference = reference;

        if apply_to_other_field {
            if let Some(other_field) = self.other_field() {
                other_field.borrow_mut().reference = reference;
            }
        }
    }

    /// Get the picture's other field, if it is still alive.
    pub fn other_field(&self) -> Option<PictureRc> {
        self.other_field.as_ref().and_then(Weak::upgrade)
    }

    /// Whether the current picture is the second field of a complementary ref pair.
    pub fn is_second_field_of_complementary_ref_pair(&self) -> bool {
        self.is_ref()
            && self.is_second_field
            && self
                .other_field()
                .map(|f| f.borrow().is_ref())
                .unwrap_or(false)
    }

    /// Order count of the field of the given parity, if known.
    pub fn field_order_cnt(&self, field: Field) -> Option<i32> {
        match field {
            Field::Top => self.top_field_order_cnt,
            Field::Bottom => self.bottom_field_order_cnt,
            Field::Frame => match (self.top_field_order_cnt, self.bottom_field_order_cnt) {
                (Some(top), Some(bottom)) => Some(std::cmp::min(top, bottom)),
                (top, bottom) => top.or(bottom),
            },
        }
    }

    /// Split a frame into two complementary fields. The frame becomes the
    /// top field and the returned picture is the bottom field.
    pub fn split_frame(pic_rc: &PictureRc) -> PictureRc {
        let mut pic = pic_rc.borrow_mut();

        debug!(
            "Splitting picture (frame_num, POC) ({:?}, {:?})",
            pic.frame_num, pic.pic_order_cnt
        );

        pic.field = Field::Top;
        pic.interlaced = true;
        pic.pic_order_cnt = pic.top_field_order_cnt.unwrap_or(pic.pic_order_cnt);

        let other_field = PictureData {
            surface: pic.surface.clone(),
            pps_id: pic.pps_id,
            top_field_order_cnt: pic.top_field_order_cnt,
            bottom_field_order_cnt: pic.bottom_field_order_cnt,
            pic_order_cnt: pic.bottom_field_order_cnt.unwrap_or(pic.pic_order_cnt),
            frame_num: pic.frame_num,
            frame_num_wrap: pic.frame_num_wrap,
            long_term_frame_idx: pic.long_term_frame_idx,
            coded_resolution: pic.coded_resolution,
            display_resolution: pic.display_resolution,
            type_: pic.type_,
            nal_ref_idc: pic.nal_ref_idc,
            is_idr: pic.is_idr,
            reference: pic.reference,
            output_flag: pic.output_flag,
            nonexisting: pic.nonexisting,
            field: Field::Bottom,
            interlaced: true,
            is_second_field: true,
            other_field: Some(Rc::downgrade(pic_rc)),
            timestamp: pic.timestamp,
            ..Default::default()
        };

        let other_field = Rc::new(RefCell::new(other_field));
        pic.other_field = Some(Rc::downgrade(&other_field));

        debug!(
            "Split into fields with POC {} and {}",
            pic.pic_order_cnt,
            other_field.borrow().pic_order_cnt
        );

        other_field
    }
}

impl std::fmt::Debug for PictureData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PictureData")
            .field("surface", &self.surface_id())
            .field("top_field_order_cnt", &self.top_field_order_cnt)
            .field("bottom_field_order_cnt", &self.bottom_field_order_cnt)
            .field("pic_order_cnt", &self.pic_order_cnt)
            .field("pic_num", &self.pic_num)
            .field("long_term_pic_num", &self.long_term_pic_num)
            .field("frame_num", &self.frame_num)
            .field("frame_num_wrap", &self.frame_num_wrap)
            .field("long_term_frame_idx", &self.long_term_frame_idx)
            .field("type_", &self.type_)
            .field("nal_ref_idc", &self.nal_ref_idc)
            .field("is_idr", &self.is_idr)
            .field("reference", &self.reference)
            .field("needed_for_output", &self.needed_for_output)
            .field("has_mmco_5", &self.has_mmco_5)
            .field("nonexisting", &self.nonexisting)
            .field("field", &self.field)
            .field("is_second_field", &self.is_second_field)
            .field("has_other_field", &self.other_field.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::decoders::SurfacePoolHandle;

    fn frame(frame_num: i32, top: i32, bottom: i32) -> PictureRc {
        Rc::new(RefCell::new(PictureData {
            surface: Some(SurfacePoolHandle::new().wrap(7)),
            frame_num,
            top_field_order_cnt: Some(top),
            bottom_field_order_cnt: Some(bottom),
            pic_order_cnt: std::cmp::min(top, bottom),
            reference: Reference::ShortTerm,
            output_flag: true,
            ..Default::default()
        }))
    }

    #[test]
    fn split_frame_links_fields() {
        let top = frame(3, 8, 9);
        let bottom = PictureData::split_frame(&top);

        let t = top.borrow();
        let b = bottom.borrow();
        assert_eq!(t.field, Field::Top);
        assert_eq!(b.field, Field::Bottom);
        assert_eq!(t.pic_order_cnt, 8);
        assert_eq!(b.pic_order_cnt, 9);
        assert_eq!(b.frame_num, 3);
        assert_eq!(b.surface_id(), Some(7));
        assert!(b.is_second_field());
        assert!(b.is_short_term());
        assert!(Rc::ptr_eq(&t.other_field().unwrap(), &bottom));
        assert!(Rc::ptr_eq(&b.other_field().unwrap(), &top));
    }

    #[test]
    fn set_reference_on_both_fields() {
        let top = frame(1, 0, 1);
        let bottom = PictureData::split_frame(&top);

        top.borrow_mut().set_reference(Reference::LongTerm, true);
        assert!(bottom.borrow().is_long_term());

        bottom.borrow_mut().set_reference(Reference::None, false);
        assert!(top.borrow().is_long_term());
        assert!(!bottom.borrow().is_ref());
        assert!(!bottom.borrow().is_second_field_of_complementary_ref_pair());
    }

    #[test]
    fn field_order_cnt() {
        let pic = PictureData {
            top_field_order_cnt: None,
            bottom_field_order_cnt: Some(5),
            ..Default::default()
        };
        assert_eq!(pic.field_order_cnt(Field::Top), None);
        assert_eq!(pic.field_order_cnt(Field::Frame), Some(5));
    }
}
