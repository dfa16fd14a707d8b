// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::trace;
use log::warn;

use crate::decoders::h264::frame_store::FrameStore;
use crate::decoders::h264::frame_store::FrameStoreRef;
use crate::decoders::h264::parser::MarkingOp;
use crate::decoders::h264::parser::RefPicListModification;
use crate::decoders::h264::parser::SliceHeader;
use crate::decoders::h264::parser::Sps;
use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::PictureData;
use crate::decoders::h264::picture::PictureRc;
use crate::decoders::h264::picture::Reference;

/// Picture named by a reference list modification.
#[derive(Copy, Clone, Debug)]
enum ModificationTarget {
    ShortTerm(i32),
    LongTerm(i32),
}

#[derive(Default)]
pub struct Dpb {
    /// Frame stores in decoding order.
    stores: Vec<FrameStoreRef>,
    /// The maximum number of frame stores.
    max_num_frames: usize,
    /// Output is forced once more stores than this wait for output.
    max_num_reorder_frames: Option<usize>,
    /// MaxLongTermFrameIdx, `None` meaning "no long-term frame indices".
    max_long_term_frame_idx: Option<i32>,
    /// Stores bumped out and not yet collected by the decoder, in output
    /// order.
    output: Vec<FrameStoreRef>,
    /// RefPicList0 and RefPicList1 of the current slice.
    ref_pic_list0: Vec<PictureRc>,
    ref_pic_list1: Vec<PictureRc>,
}

impl Dpb {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn stores(&self) -> &[FrameStoreRef] {
        &self.stores
    }

    pub fn ref_pic_list0(&self) -> &[PictureRc] {
        &self.ref_pic_list0
    }

    pub fn ref_pic_list1(&self) -> &[PictureRc] {
        &self.ref_pic_list1
    }

    /// Stores holding at least one reference picture, as handed to the
    /// accelerator as the reference frame set of a picture.
    pub fn reference_stores(&self) -> impl Iterator<Item = &FrameStoreRef> + '_ {
        self.stores.iter().filter(|s| s.borrow().has_reference())
    }

    /// Every picture held by the DPB.
    fn pictures(&self) -> Vec<PictureRc> {
        self.stores
            .iter()
            .flat_map(|s| s.borrow().pictures().to_vec())
            .collect()
    }

    /// Number of stores holding a reference picture.
    pub fn num_ref_frames(&self) -> usize {
        self.stores
            .iter()
            .filter(|s| s.borrow().has_reference())
            .count()
    }

    fn has_empty_frame_buffer(&self) -> bool {
        self.stores.len() < self.max_num_frames
    }

    /// Takes the stores that left the DPB for output since the last call.
    pub fn take_output(&mut self) -> Vec<FrameStoreRef> {
        std::mem::take(&mut self.output)
    }

    /// Drops stores that are neither used for reference nor waiting for
    /// output.
    fn remove_unused(&mut self) {
        self.stores.retain(|store| {
            let s = store.borrow();
            let keep = s.has_reference() || s.is_output_needed();

            if !keep {
                trace!("Removing unused frame store with POC {}", s.pic_order_cnt());
            }

            keep
        });
    }

    /// Position of the store with the lowest POC waiting for output. Stores
    /// holding a single field are only considered when `incomplete` is set.
    fn find_lowest_poc_for_bumping(&self, incomplete: bool) -> Option<usize> {
        self.stores
            .iter()
            .enumerate()
            .filter(|(_, store)| {
                let s = store.borrow();
                s.is_output_needed() && (incomplete || s.has_frame())
            })
            .min_by_key(|(_, store)| store.borrow().pic_order_cnt())
            .map(|(i, _)| i)
    }

    /// C.4.5.3: outputs the store with the lowest POC, removing it if it is
    /// not used for reference. Returns false when nothing could be output.
    fn bump(&mut self, incomplete: bool) -> bool {
        let position = match self.find_lowest_poc_for_bumping(incomplete) {
            Some(position) => position,
            None => return false,
        };

        let store = Rc::clone(&self.stores[position]);
        store.borrow_mut().mark_output();

        debug!(
            "Bumping frame store with POC {} out of the DPB",
            store.borrow().pic_order_cnt()
        );

        if !store.borrow().has_reference() {
            self.stores.remove(position);
        }

        self.output.push(store);
        true
    }

    fn num_output_needed(&self) -> usize {
        self.stores
            .iter()
            .filter(|s| s.borrow().is_output_needed())
            .count()
    }

    /// Inserts a newly decoded frame store, making room as per C.4.5.1 and
    /// C.4.5.2.
    pub fn add_dpb(&mut self, store: FrameStoreRef) -> Result<()> {
        self.remove_unused();

        let (is_ref, is_nonexisting, has_frame, poc) = {
            let s = store.borrow();
            (
                s.has_reference(),
                s.is_nonexisting(),
                s.has_frame(),
                s.pic_order_cnt(),
            )
        };

        if is_ref || is_nonexisting || !has_frame {
            while !self.has_empty_frame_buffer() {
                if !self.bump(true) {
                    return Err(anyhow!(
                        "DPB is full with {} stores and none can be output",
                        self.stores.len()
                    ));
                }
            }
        } else {
            // A non-reference frame is output right away if nothing waiting
            // in the DPB precedes it.
            while !self.has_empty_frame_buffer() {
                let lowest = self
                    .find_lowest_poc_for_bumping(true)
                    .map(|i| self.stores[i].borrow().pic_order_cnt());

                match lowest {
                    Some(lowest) if lowest < poc => {
                        self.bump(true);
                    }
                    _ => {
                        debug!("Outputting non-reference frame with POC {} directly", poc);
                        store.borrow_mut().mark_output();
                        self.output.push(store);
                        return Ok(());
                    }
                }
            }
        }

        debug!(
            "Stored frame store with POC {}, the DPB holds {} stores",
            poc,
            self.stores.len() + 1
        );

        self.stores.push(store);

        if let Some(max_num_reorder_frames) = self.max_num_reorder_frames {
            while self.num_output_needed() > max_num_reorder_frames {
                if !self.bump(false) {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Outputs every store waiting for output. Reference pictures stay.
    pub fn flush_dpb(&mut self) {
        debug!("Flushing the DPB");

        while self.bump(true) {}
        self.remove_unused();
    }

    /// Outputs every store waiting for output and empties the DPB.
    pub fn drain_dpb(&mut self) {
        debug!("Draining the DPB");

        self.flush_dpb();
        self.stores.clear();
        self.ref_pic_list0.clear();
        self.ref_pic_list1.clear();
        self.max_long_term_frame_idx = None;
    }

    /// Resizes the DPB for a new active SPS, dropping all its contents.
    pub fn reset_dpb(&mut self, sps: &Sps) {
        self.max_num_frames = sps.max_dpb_frames();
        self.max_num_reorder_frames =
            if sps.vui_parameters_present_flag && sps.vui_parameters.bitstream_restriction_flag {
                Some(sps.vui_parameters.max_num_reorder_frames as usize)
            } else {
                None
            };

        debug!(
            "Resetting the DPB to {} frames (reorder bound {:?})",
            self.max_num_frames, self.max_num_reorder_frames
        );

        self.clear_dpb();
    }

    /// Drops every picture, without output.
    pub fn clear_dpb(&mut self) {
        debug!("Clearing the DPB");

        self.stores.clear();
        self.output.clear();
        self.ref_pic_list0.clear();
        self.ref_pic_list1.clear();
        self.max_long_term_frame_idx = None;
    }

    fn mark_all_as_unused_for_ref(&mut self) {
        for pic in self.pictures() {
            pic.borrow_mut().set_reference(Reference::None, false);
        }
    }

    /// 8.2.4.1: derives FrameNumWrap, PicNum and LongTermPicNum of every
    /// reference picture relative to `cur`.
    fn update_pic_nums(&self, cur: &PictureData, max_frame_num: i32) {
        for pic in self.pictures() {
            let mut pic = pic.borrow_mut();

            if pic.is_long_term() {
                pic.long_term_pic_num = if cur.field == Field::Frame {
                    pic.long_term_frame_idx
                } else if pic.field == cur.field {
                    2 * pic.long_term_frame_idx + 1
                } else {
                    2 * pic.long_term_frame_idx
                };
            } else if pic.is_short_term() {
                pic.frame_num_wrap = if pic.frame_num > cur.frame_num {
                    pic.frame_num - max_frame_num
                } else {
                    pic.frame_num
                };

                pic.pic_num = if cur.field == Field::Frame {
                    pic.frame_num_wrap
                } else if pic.field == cur.field {
                    2 * pic.frame_num_wrap + 1
                } else {
                    2 * pic.frame_num_wrap
                };
            }
        }
    }

    /// Pictures a picture of structure `field` may reference: whole frames
    /// for frames, individual fields otherwise.
    fn candidates(&self, field: Field) -> Vec<PictureRc> {
        if field == Field::Frame {
            self.stores
                .iter()
                .filter(|s| s.borrow().has_frame())
                .map(|s| Rc::clone(s.borrow().first()))
                .collect()
        } else {
            self.pictures()
        }
    }

    fn find_short_term_with_pic_num(&self, field: Field, pic_num: i32) -> Option<PictureRc> {
        self.candidates(field).into_iter().find(|p| {
            let p = p.borrow();
            p.is_short_term() && p.pic_num == pic_num
        })
    }

    fn find_long_term_with_long_term_pic_num(
        &self,
        field: Field,
        long_term_pic_num: i32,
    ) -> Option<PictureRc> {
        self.candidates(field).into_iter().find(|p| {
            let p = p.borrow();
            p.is_long_term() && p.long_term_pic_num == long_term_pic_num
        })
    }

    /// Unmarks the short-term frame with the lowest FrameNumWrap until fewer
    /// than `max_num_ref_frames` frames are used for reference.
    fn sliding_window(&mut self, max_num_ref_frames: usize) -> Result<()> {
        while self.num_ref_frames() >= max_num_ref_frames {
            let to_unmark = self
                .stores
                .iter()
                .filter(|s| s.borrow().has_short_term_reference())
                .min_by_key(|s| {
                    s.borrow()
                        .pictures()
                        .iter()
                        .map(|p| p.borrow().frame_num_wrap)
                        .min()
                        .unwrap_or(i32::MAX)
                })
                .cloned()
                .context("Could not find a ShortTerm picture to unmark in the DPB")?;

            debug!(
                "Sliding window unmarks frame_num {}",
                to_unmark.borrow().frame_num()
            );

            for p in to_unmark.borrow().pictures() {
                if p.borrow().is_short_term() {
                    p.borrow_mut().set_reference(Reference::None, false);
                }
            }
        }

        Ok(())
    }

    /// 8.2.5.3
    fn sliding_window_marking(&mut self, pic: &PictureRc, sps: &Sps) -> Result<()> {
        // The second field of a complementary reference field pair takes the
        // marking of the first one.
        if pic.borrow().is_second_field_of_complementary_ref_pair() {
            return Ok(());
        }

        self.sliding_window(std::cmp::max(1, sps.max_num_ref_frames as usize))
    }

    fn mmco_op_1(&mut self, pic: &PictureRc, op: &MarkingOp) -> Result<()> {
        let (field, pic_num) = {
            let p = pic.borrow();
            (p.field, p.pic_num)
        };
        let pic_num_x = pic_num - (op.difference_of_pic_nums_minus1 as i32 + 1);

        debug!("MMCO op 1 for pic_num_x {}", pic_num_x);

        let to_mark = self
            .find_short_term_with_pic_num(field, pic_num_x)
            .with_context(|| format!("No ShortTerm picture with pic_num {}", pic_num_x))?;

        to_mark
            .borrow_mut()
            .set_reference(Reference::None, field == Field::Frame);

        Ok(())
    }

    fn mmco_op_2(&mut self, pic: &PictureRc, op: &MarkingOp) -> Result<()> {
        let field = pic.borrow().field;
        let long_term_pic_num = op.long_term_pic_num as i32;

        debug!("MMCO op 2 for long_term_pic_num {}", long_term_pic_num);

        let to_mark = self
            .find_long_term_with_long_term_pic_num(field, long_term_pic_num)
            .with_context(|| {
                format!(
                    "No LongTerm picture with long_term_pic_num {}",
                    long_term_pic_num
                )
            })?;

        to_mark
            .borrow_mut()
            .set_reference(Reference::None, field == Field::Frame);

        Ok(())
    }

    /// Unmarks the long-term pictures using `long_term_frame_idx`, except for
    /// `keep` and its other field.
    fn release_long_term_frame_idx(&mut self, long_term_frame_idx: i32, keep: Option<&PictureRc>) {
        let keep_other = keep.and_then(|k| k.borrow().other_field());

        for dpb_pic in self.pictures() {
            let skip = keep.map(|k| Rc::ptr_eq(k, &dpb_pic)).unwrap_or(false)
                || keep_other
                    .as_ref()
                    .map(|k| Rc::ptr_eq(k, &dpb_pic))
                    .unwrap_or(false);

            let assigned = {
                let p = dpb_pic.borrow();
                p.is_long_term() && p.long_term_frame_idx == long_term_frame_idx
            };

            if assigned && !skip {
                dpb_pic.borrow_mut().set_reference(Reference::None, false);
            }
        }
    }

    fn mmco_op_3(&mut self, pic: &PictureRc, op: &MarkingOp) -> Result<()> {
        let (field, pic_num) = {
            let p = pic.borrow();
            (p.field, p.pic_num)
        };
        let pic_num_x = pic_num - (op.difference_of_pic_nums_minus1 as i32 + 1);
        let long_term_frame_idx = op.long_term_frame_idx as i32;

        debug!(
            "MMCO op 3 for pic_num_x {}, long_term_frame_idx {}",
            pic_num_x, long_term_frame_idx
        );

        let to_mark_as_long = self
            .find_short_term_with_pic_num(field, pic_num_x)
            .with_context(|| format!("No ShortTerm picture with pic_num {}", pic_num_x))?;

        if to_mark_as_long.borrow().nonexisting {
            return Err(anyhow!(
                "A non-existing picture cannot be marked as LongTerm"
            ));
        }

        self.release_long_term_frame_idx(long_term_frame_idx, Some(&to_mark_as_long));

        let mut target = to_mark_as_long.borrow_mut();
        target.set_reference(Reference::LongTerm, field == Field::Frame);
        target.long_term_frame_idx = long_term_frame_idx;

        if let Some(other_field) = target.other_field() {
            let mut other_field = other_field.borrow_mut();
            if other_field.is_long_term() {
                other_field.long_term_frame_idx = long_term_frame_idx;
            }
        }

        Ok(())
    }

    fn mmco_op_4(&mut self, op: &MarkingOp) {
        self.max_long_term_frame_idx = op
            .max_long_term_frame_idx_plus1
            .checked_sub(1)
            .map(|idx| idx as i32);

        debug!(
            "MMCO op 4, max_long_term_frame_idx {:?}",
            self.max_long_term_frame_idx
        );

        for dpb_pic in self.pictures() {
            let mut p = dpb_pic.borrow_mut();
            let above = match self.max_long_term_frame_idx {
                Some(max) => p.long_term_frame_idx > max,
                None => true,
            };

            if p.is_long_term() && above {
                p.set_reference(Reference::None, false);
            }
        }
    }

    fn mmco_op_5(&mut self, pic: &PictureRc) {
        debug!("MMCO op 5, marking all pictures in the DPB as unused for reference");

        self.mark_all_as_unused_for_ref();
        self.max_long_term_frame_idx = None;

        let mut pic = pic.borrow_mut();
        pic.has_mmco_5 = true;

        // The picture is inferred to have had frame_num 0 and its POCs are
        // made relative to tempPicOrderCnt, 8.2.1.
        pic.frame_num = 0;

        let temp_pic_order_cnt = pic.pic_order_cnt;
        pic.top_field_order_cnt = pic.top_field_order_cnt.map(|t| t - temp_pic_order_cnt);
        pic.bottom_field_order_cnt = pic.bottom_field_order_cnt.map(|b| b - temp_pic_order_cnt);
        pic.pic_order_cnt = pic.field_order_cnt(Field::Frame).unwrap_or(0);
    }

    fn mmco_op_6(&mut self, pic: &PictureRc, op: &MarkingOp) {
        let long_term_frame_idx = op.long_term_frame_idx as i32;

        debug!("MMCO op 6, long_term_frame_idx {}", long_term_frame_idx);

        self.release_long_term_frame_idx(long_term_frame_idx, Some(pic));

        let mut cur = pic.borrow_mut();
        cur.set_reference(Reference::LongTerm, false);
        cur.long_term_frame_idx = long_term_frame_idx;
    }

    /// 8.2.5: marks the decoded reference picture `pic` and the pictures of
    /// the DPB. Returns whether memory_management_control_operation 5 was
    /// executed.
    pub fn exec_ref_pic_marking(&mut self, pic: &PictureRc, sps: &Sps) -> Result<bool> {
        if !pic.borrow().is_ref() {
            return Ok(false);
        }

        self.update_pic_nums(&pic.borrow(), sps.max_frame_num as i32);

        let (is_idr, marking) = {
            let p = pic.borrow();
            (p.is_idr(), p.ref_pic_marking.clone())
        };

        // 8.2.5.1
        if is_idr {
            self.mark_all_as_unused_for_ref();

            let mut p = pic.borrow_mut();
            if marking.long_term_reference_flag {
                p.set_reference(Reference::LongTerm, false);
                p.long_term_frame_idx = 0;
                self.max_long_term_frame_idx = Some(0);
            } else {
                p.set_reference(Reference::ShortTerm, false);
                self.max_long_term_frame_idx = None;
            }

            return Ok(false);
        }

        if !marking.adaptive_ref_pic_marking_mode_flag {
            self.sliding_window_marking(pic, sps)?;
            return Ok(false);
        }

        let mut mmco5 = false;
        for op in &marking.inner {
            match op.memory_management_control_operation {
                0 => break,
                1 => self.mmco_op_1(pic, op)?,
                2 => self.mmco_op_2(pic, op)?,
                3 => self.mmco_op_3(pic, op)?,
                4 => self.mmco_op_4(op),
                5 => {
                    self.mmco_op_5(pic);
                    mmco5 = true;
                }
                6 => self.mmco_op_6(pic, op),
                other => return Err(anyhow!("Unknown MMCO {}", other)),
            }
        }

        Ok(mmco5)
    }

    /// Builds a non-existing frame for frame_num gap recovery, 8.2.5.2.
    pub fn add_dummy_picture(
        &mut self,
        pic: PictureData,
        split_fields: bool,
    ) -> Result<PictureRc> {
        let pic = Rc::new(RefCell::new(pic));
        let mut store = FrameStore::new(Rc::clone(&pic));

        if split_fields {
            store.split_fields()?;
        }

        self.add_dpb(Rc::new(RefCell::new(store)))?;
        Ok(pic)
    }

    /// Sliding window marking on behalf of a non-existing frame, done before
    /// it is added.
    pub fn exec_dummy_picture_marking(&mut self, pic: &PictureData, sps: &Sps) -> Result<()> {
        self.update_pic_nums(pic, sps.max_frame_num as i32);
        self.sliding_window(std::cmp::max(1, sps.max_num_ref_frames as usize))
    }

    fn short_term_frames(&self) -> Vec<PictureRc> {
        self.stores
            .iter()
            .filter(|s| s.borrow().is_short_term_frame())
            .map(|s| Rc::clone(s.borrow().first()))
            .collect()
    }

    fn long_term_frames(&self) -> Vec<PictureRc> {
        self.stores
            .iter()
            .filter(|s| s.borrow().is_long_term_frame())
            .map(|s| Rc::clone(s.borrow().first()))
            .collect()
    }

    fn frame_poc(pic: &PictureRc) -> i32 {
        pic.borrow().field_order_cnt(Field::Frame).unwrap_or_default()
    }

    /// 8.2.4.2.1
    fn init_ref_pic_list_p(&mut self) {
        let mut short_term = self.short_term_frames();
        short_term.sort_by_key(|p| std::cmp::Reverse(p.borrow().pic_num));

        let mut long_term = self.long_term_frames();
        long_term.sort_by_key(|p| p.borrow().long_term_pic_num);

        self.ref_pic_list0 = short_term;
        self.ref_pic_list0.extend(long_term);
    }

    /// 8.2.4.2.3
    fn init_ref_pic_list_b(&mut self, cur_poc: i32, pic_order_cnt_type: u8) {
        let mut short_term = self.short_term_frames();
        // Non-existing frames have no usable POC under type 0.
        if pic_order_cnt_type == 0 {
            short_term.retain(|p| !p.borrow().nonexisting);
        }

        let (mut before, mut after): (Vec<_>, Vec<_>) = short_term
            .into_iter()
            .partition(|p| Self::frame_poc(p) < cur_poc);
        before.sort_by_key(|p| std::cmp::Reverse(Self::frame_poc(p)));
        after.sort_by_key(Self::frame_poc);

        let mut long_term = self.long_term_frames();
        long_term.sort_by_key(|p| p.borrow().long_term_pic_num);

        self.ref_pic_list0 = before.iter().chain(after.iter()).cloned().collect();
        self.ref_pic_list0.extend(long_term.iter().cloned());

        self.ref_pic_list1 = after.iter().chain(before.iter()).cloned().collect();
        self.ref_pic_list1.extend(long_term);

        self.swap_l1_if_needed();
    }

    fn swap_l1_if_needed(&mut self) {
        // When RefPicList1 has more than one entry and is identical to
        // RefPicList0, its first two entries are switched.
        if self.ref_pic_list1.len() > 1
            && self.ref_pic_list0.len() == self.ref_pic_list1.len()
            && self
                .ref_pic_list0
                .iter()
                .zip(self.ref_pic_list1.iter())
                .all(|(a, b)| Rc::ptr_eq(a, b))
        {
            self.ref_pic_list1.swap(0, 1);
        }
    }

    /// 8.2.4.2.5: fields are taken from the ordered frame list alternating
    /// parity, starting with the parity of the current field.
    fn alternate_fields(
        frames: &[FrameStoreRef],
        parity: Field,
        want: impl Fn(&PictureData) -> bool,
    ) -> Vec<PictureRc> {
        let fields_of = |field: Field| -> Vec<PictureRc> {
            frames
                .iter()
                .flat_map(|s| s.borrow().pictures().to_vec())
                .filter(|p| {
                    let p = p.borrow();
                    p.field == field && !p.nonexisting && want(&p)
                })
                .collect()
        };

        let same = fields_of(parity);
        let opposite = fields_of(parity.opposite().unwrap_or(Field::Bottom));

        let mut list = Vec::with_capacity(same.len() + opposite.len());
        let mut same = same.into_iter();
        let mut opposite = opposite.into_iter();

        loop {
            match (same.next(), opposite.next()) {
                (Some(s), Some(o)) => {
                    list.push(s);
                    list.push(o);
                }
                (Some(s), None) => {
                    list.push(s);
                    list.extend(same);
                    break;
                }
                (None, Some(o)) => {
                    list.push(o);
                    list.extend(opposite);
                    break;
                }
                (None, None) => break,
            }
        }

        list
    }

    fn short_term_field_stores(&self) -> Vec<FrameStoreRef> {
        self.stores
            .iter()
            .filter(|s| s.borrow().has_short_term_reference())
            .cloned()
            .collect()
    }

    fn long_term_field_stores(&self) -> Vec<FrameStoreRef> {
        let mut stores: Vec<_> = self
            .stores
            .iter()
            .filter(|s| s.borrow().has_long_term_reference())
            .cloned()
            .collect();
        stores.sort_by_key(|s| s.borrow().first().borrow().long_term_frame_idx);
        stores
    }

    /// POC of a store restricted to its short-term fields.
    fn short_term_store_poc(store: &FrameStoreRef) -> i32 {
        store
            .borrow()
            .pictures()
            .iter()
            .filter(|p| p.borrow().is_short_term())
            .filter_map(|p| {
                let p = p.borrow();
                p.field_order_cnt(p.field)
            })
            .min()
            .unwrap_or_default()
    }

    /// 8.2.4.2.2
    fn init_ref_field_pic_list_p(&mut self, parity: Field) {
        let mut short_term = self.short_term_field_stores();
        short_term.sort_by_key(|s| {
            std::cmp::Reverse(
                s.borrow()
                    .pictures()
                    .iter()
                    .map(|p| p.borrow().frame_num_wrap)
                    .max()
                    .unwrap_or_default(),
            )
        });

        let long_term = self.long_term_field_stores();

        self.ref_pic_list0 = Self::alternate_fields(&short_term, parity, |p| p.is_short_term());
        self.ref_pic_list0
            .extend(Self::alternate_fields(&long_term, parity, |p| p.is_long_term()));
    }

    /// 8.2.4.2.4
    fn init_ref_field_pic_list_b(&mut self, parity: Field, cur_poc: i32, pic_order_cnt_type: u8) {
        let mut short_term = self.short_term_field_stores();
        if pic_order_cnt_type == 0 {
            short_term.retain(|s| !s.borrow().is_nonexisting());
        }

        let (mut before, mut after): (Vec<_>, Vec<_>) = short_term
            .into_iter()
            .partition(|s| Self::short_term_store_poc(s) <= cur_poc);
        before.sort_by_key(|s| std::cmp::Reverse(Self::short_term_store_poc(s)));
        after.sort_by_key(Self::short_term_store_poc);

        let list0: Vec<_> = before.iter().chain(after.iter()).cloned().collect();
        let list1: Vec<_> = after.iter().chain(before.iter()).cloned().collect();
        let long_term = self.long_term_field_stores();

        self.ref_pic_list0 = Self::alternate_fields(&list0, parity, |p| p.is_short_term());
        self.ref_pic_list0
            .extend(Self::alternate_fields(&long_term, parity, |p| p.is_long_term()));

        self.ref_pic_list1 = Self::alternate_fields(&list1, parity, |p| p.is_short_term());
        self.ref_pic_list1
            .extend(Self::alternate_fields(&long_term, parity, |p| p.is_long_term()));

        self.swap_l1_if_needed();
    }

    fn pic_num_f(pic: &PictureData, max_pic_num: i32) -> i32 {
        if pic.is_short_term() {
            pic.pic_num
        } else {
            max_pic_num
        }
    }

    fn long_term_pic_num_f(pic: &PictureData, max_long_term_frame_idx: Option<i32>) -> i32 {
        if pic.is_long_term() {
            pic.long_term_pic_num
        } else {
            2 * (max_long_term_frame_idx.unwrap_or(-1) + 1)
        }
    }

    /// 8.2.4.3: applies the modifications of one list. Pictures that cannot
    /// be found are skipped.
    fn modify_ref_pic_list(
        &self,
        list: &mut Vec<PictureRc>,
        modifications: &[RefPicListModification],
        num_ref_idx_active: usize,
        cur: &PictureData,
        max_pic_num: i32,
    ) {
        let mut pic_num_lx_pred = cur.pic_num;
        let mut ref_idx_lx = 0;

        for modification in modifications {
            let target = match modification.modification_of_pic_nums_idc {
                idc @ (0 | 1) => {
                    let abs_diff_pic_num = modification.abs_diff_pic_num_minus1 as i32 + 1;

                    // (8-34) and (8-35)
                    let pic_num_lx_no_wrap = if idc == 0 {
                        if pic_num_lx_pred - abs_diff_pic_num < 0 {
                            pic_num_lx_pred - abs_diff_pic_num + max_pic_num
                        } else {
                            pic_num_lx_pred - abs_diff_pic_num
                        }
                    } else if pic_num_lx_pred + abs_diff_pic_num >= max_pic_num {
                        pic_num_lx_pred + abs_diff_pic_num - max_pic_num
                    } else {
                        pic_num_lx_pred + abs_diff_pic_num
                    };

                    pic_num_lx_pred = pic_num_lx_no_wrap;

                    // (8-36)
                    let pic_num_lx = if pic_num_lx_no_wrap > cur.pic_num {
                        pic_num_lx_no_wrap - max_pic_num
                    } else {
                        pic_num_lx_no_wrap
                    };

                    ModificationTarget::ShortTerm(pic_num_lx)
                }
                2 => ModificationTarget::LongTerm(modification.long_term_pic_num as i32),
                _ => break,
            };

            let picture = match target {
                ModificationTarget::ShortTerm(pic_num) => {
                    self.find_short_term_with_pic_num(cur.field, pic_num)
                }
                ModificationTarget::LongTerm(long_term_pic_num) => {
                    self.find_long_term_with_long_term_pic_num(cur.field, long_term_pic_num)
                }
            };

            let picture = match picture {
                Some(picture) => picture,
                None => {
                    warn!(
                        "Reference list modification {:?} names a missing picture",
                        modification
                    );
                    continue;
                }
            };

            // (8-37) and (8-38): insert, then drop the later duplicate.
            let insert_at = std::cmp::min(ref_idx_lx, list.len());
            list.insert(insert_at, picture);
            ref_idx_lx = insert_at + 1;

            let mut nidx = ref_idx_lx;
            for cidx in ref_idx_lx..list.len() {
                let duplicate = {
                    let p = list[cidx].borrow();
                    match target {
                        ModificationTarget::ShortTerm(pic_num) => {
                            Self::pic_num_f(&p, max_pic_num) == pic_num
                        }
                        ModificationTarget::LongTerm(long_term_pic_num) => {
                            Self::long_term_pic_num_f(&p, self.max_long_term_frame_idx)
                                == long_term_pic_num
                        }
                    }
                };

                if !duplicate {
                    list.swap(nidx, cidx);
                    nidx += 1;
                }
            }

            list.truncate(nidx);
            list.truncate(num_ref_idx_active);
        }
    }

    /// 8.2.4: builds RefPicList0, and RefPicList1 for B slices, for the
    /// slice `hdr` of the current picture.
    pub fn init_picture_refs(&mut self, pic: &PictureRc, hdr: &SliceHeader, sps: &Sps) {
        self.ref_pic_list0.clear();
        self.ref_pic_list1.clear();

        if hdr.slice_type.is_i() || hdr.slice_type.is_si() {
            return;
        }

        let cur = pic.borrow();
        self.update_pic_nums(&cur, sps.max_frame_num as i32);

        let pic_order_cnt_type = sps.pic_order_cnt_type;
        let is_b = hdr.slice_type.is_b();

        match (cur.field, is_b) {
            (Field::Frame, false) => self.init_ref_pic_list_p(),
            (Field::Frame, true) => self.init_ref_pic_list_b(cur.pic_order_cnt, pic_order_cnt_type),
            (parity, false) => self.init_ref_field_pic_list_p(parity),
            (parity, true) => {
                self.init_ref_field_pic_list_b(parity, cur.pic_order_cnt, pic_order_cnt_type)
            }
        }

        let max_pic_num = hdr.max_pic_num as i32;

        let num_l0 = usize::from(hdr.num_ref_idx_l0_active_minus1) + 1;
        let mut list0 = std::mem::take(&mut self.ref_pic_list0);
        list0.truncate(num_l0);
        if hdr.ref_pic_list_modification_flag_l0 {
            self.modify_ref_pic_list(
                &mut list0,
                &hdr.ref_pic_list_modification_l0,
                num_l0,
                &cur,
                max_pic_num,
            );
        }
        self.ref_pic_list0 = list0;

        if is_b {
            let num_l1 = usize::from(hdr.num_ref_idx_l1_active_minus1) + 1;
            let mut list1 = std::mem::take(&mut self.ref_pic_list1);
            list1.truncate(num_l1);
            if hdr.ref_pic_list_modification_flag_l1 {
                self.modify_ref_pic_list(
                    &mut list1,
                    &hdr.ref_pic_list_modification_l1,
                    num_l1,
                    &cur,
                    max_pic_num,
                );
            }
            self.ref_pic_list1 = list1;
        }

        trace!(
            "RefPicList0 (pic_num, POC): {:?}",
            self.ref_pic_list0
                .iter()
                .map(|p| (p.borrow().pic_num, p.borrow().pic_order_cnt))
                .collect::<Vec<_>>()
        );
        if is_b {
            trace!(
                "RefPicList1 (pic_num, POC): {:?}",
                self.ref_pic_list1
                    .iter()
                    .map(|p| (p.borrow().pic_num, p.borrow().pic_order_cnt))
                    .collect::<Vec<_>>()
            );
        }
    }
}

impl std::fmt::Debug for Dpb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dpb")
            .field("stores", &self.stores)
            .field("max_num_frames", &self.max_num_frames)
            .field("max_num_reorder_frames", &self.max_num_reorder_frames)
            .field("max_long_term_frame_idx", &self.max_long_term_frame_idx)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::h264::parser::RefPicMarking;
    use crate::decoders::h264::parser::SliceType;
    use crate::decoders::h264::picture::IsIdr;
    use crate::decoders::h264::synthetic;
    use crate::decoders::SurfacePoolHandle;

    fn dpb(sps: &Sps) -> Dpb {
        let mut dpb = Dpb::new();
        dpb.reset_dpb(sps);
        dpb
    }

    fn ref_frame(frame_num: i32, poc: i32) -> PictureRc {
        let mut pic = PictureData {
            surface: Some(SurfacePoolHandle::new().wrap(frame_num as u32)),
            frame_num,
            frame_num_wrap: frame_num,
            pic_num: frame_num,
            top_field_order_cnt: Some(poc),
            bottom_field_order_cnt: Some(poc),
            pic_order_cnt: poc,
            nal_ref_idc: 1,
            output_flag: true,
            needed_for_output: true,
            ..Default::default()
        };
        pic.set_reference(Reference::ShortTerm, false);
        Rc::new(RefCell::new(pic))
    }

    fn store(pic: &PictureRc) -> FrameStoreRef {
        Rc::new(RefCell::new(FrameStore::new(Rc::clone(pic))))
    }

    fn surfaces(list: &[PictureRc]) -> Vec<Option<u32>> {
        list.iter().map(|p| p.borrow().surface_id()).collect()
    }

    #[test]
    fn sliding_window_unmarks_oldest() {
        // max_num_ref_frames is 2.
        let sps = synthetic::sps(0);
        let mut dpb = dpb(&sps);

        for (frame_num, poc) in [(0, 0), (1, 2)] {
            let pic = ref_frame(frame_num, poc);
            dpb.exec_ref_pic_marking(&pic, &sps).unwrap();
            dpb.add_dpb(store(&pic)).unwrap();
        }
        assert_eq!(dpb.num_ref_frames(), 2);

        let pic = ref_frame(2, 4);
        assert!(!dpb.exec_ref_pic_marking(&pic, &sps).unwrap());

        assert_eq!(dpb.num_ref_frames(), 1);
        assert!(!dpb.stores()[0].borrow().has_reference());
        assert!(dpb.stores()[1].borrow().has_reference());
    }

    #[test]
    fn idr_marks_everything_unused() {
        let sps = synthetic::sps(0);
        let mut dpb = dpb(&sps);

        let pic = ref_frame(0, 0);
        dpb.add_dpb(store(&pic)).unwrap();

        let idr = ref_frame(0, 0);
        {
            let mut idr = idr.borrow_mut();
            idr.is_idr = IsIdr::Yes { idr_pic_id: 1 };
            idr.ref_pic_marking.long_term_reference_flag = true;
        }

        dpb.exec_ref_pic_marking(&idr, &sps).unwrap();
        assert!(!pic.borrow().is_ref());
        assert!(idr.borrow().is_long_term());
        assert_eq!(dpb.max_long_term_frame_idx, Some(0));
    }

    #[test]
    fn mmco_ops() {
        let mut sps = synthetic::sps(0);
        sps.max_num_ref_frames = 4;
        let mut dpb = dpb(&sps);

        let pics: Vec<_> = (0..3).map(|n| ref_frame(n, 2 * n)).collect();
        for pic in &pics {
            dpb.add_dpb(store(pic)).unwrap();
        }

        let cur = ref_frame(3, 6);
        cur.borrow_mut().ref_pic_marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: vec![
                // Unmark pic_num 3 - 3 = 0.
                MarkingOp {
                    memory_management_control_operation: 1,
                    difference_of_pic_nums_minus1: 2,
                    ..Default::default()
                },
                MarkingOp {
                    memory_management_control_operation: 4,
                    max_long_term_frame_idx_plus1: 2,
                    ..Default::default()
                },
                // pic_num 3 - 2 = 1 becomes long term index 1.
                MarkingOp {
                    memory_management_control_operation: 3,
                    difference_of_pic_nums_minus1: 1,
                    long_term_frame_idx: 1,
                    ..Default::default()
                },
                // The current picture takes long term index 0.
                MarkingOp {
                    memory_management_control_operation: 6,
                    long_term_frame_idx: 0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert!(!dpb.exec_ref_pic_marking(&cur, &sps).unwrap());

        assert!(!pics[0].borrow().is_ref());
        assert!(pics[1].borrow().is_long_term());
        assert_eq!(pics[1].borrow().long_term_frame_idx, 1);
        assert!(pics[2].borrow().is_short_term());
        assert!(cur.borrow().is_long_term());
        assert_eq!(cur.borrow().long_term_frame_idx, 0);
    }

    #[test]
    fn mmco_5_resets() {
        let sps = synthetic::sps(0);
        let mut dpb = dpb(&sps);

        let pic = ref_frame(0, 0);
        dpb.add_dpb(store(&pic)).unwrap();

        let cur = ref_frame(1, 8);
        cur.borrow_mut().bottom_field_order_cnt = Some(9);
        cur.borrow_mut().ref_pic_marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: vec![MarkingOp {
                memory_management_control_operation: 5,
                ..Default::default()
            }],
            ..Default::default()
        };

        assert!(dpb.exec_ref_pic_marking(&cur, &sps).unwrap());
        assert!(!pic.borrow().is_ref());

        let cur = cur.borrow();
        assert!(cur.has_mmco_5);
        assert_eq!(cur.frame_num, 0);
        assert_eq!(cur.top_field_order_cnt, Some(0));
        assert_eq!(cur.bottom_field_order_cnt, Some(1));
        assert_eq!(cur.pic_order_cnt, 0);
    }

    #[test]
    fn missing_mmco_target_fails() {
        let sps = synthetic::sps(0);
        let mut dpb = dpb(&sps);

        let cur = ref_frame(3, 6);
        cur.borrow_mut().ref_pic_marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: vec![MarkingOp {
                memory_management_control_operation: 2,
                long_term_pic_num: 5,
                ..Default::default()
            }],
            ..Default::default()
        };

        assert!(dpb.exec_ref_pic_marking(&cur, &sps).is_err());
    }

    #[test]
    fn p_and_b_lists() {
        let mut sps = synthetic::sps(0);
        sps.max_num_ref_frames = 4;
        let mut dpb = dpb(&sps);

        // Decoding order I0 P4 P8, POC 0 8 16.
        for (frame_num, poc) in [(0, 0), (1, 8), (2, 16)] {
            dpb.add_dpb(store(&ref_frame(frame_num, poc))).unwrap();
        }

        let mut hdr = synthetic::slice(SliceType::P, 3, 0);
        hdr.num_ref_idx_l0_active_minus1 = 2;
        hdr.max_pic_num = 16;
        let cur = ref_frame(3, 24);

        dpb.init_picture_refs(&cur, &hdr, &sps);
        assert_eq!(surfaces(dpb.ref_pic_list0()), vec![Some(2), Some(1), Some(0)]);
        assert!(dpb.ref_pic_list1().is_empty());

        // A B frame displayed between P4 and P8.
        let mut hdr = synthetic::slice(SliceType::B, 3, 0);
        hdr.num_ref_idx_l0_active_minus1 = 2;
        hdr.num_ref_idx_l1_active_minus1 = 1;
        hdr.max_pic_num = 16;
        let cur = ref_frame(3, 12);

        dpb.init_picture_refs(&cur, &hdr, &sps);
        assert_eq!(surfaces(dpb.ref_pic_list0()), vec![Some(1), Some(0), Some(2)]);
        assert_eq!(surfaces(dpb.ref_pic_list1()), vec![Some(2), Some(1)]);
    }

    #[test]
    fn list_modification_moves_picture_first() {
        let mut sps = synthetic::sps(0);
        sps.max_num_ref_frames = 4;
        let mut dpb = dpb(&sps);

        for frame_num in 0..3 {
            dpb.add_dpb(store(&ref_frame(frame_num, 2 * frame_num)))
                .unwrap();
        }

        let mut hdr = synthetic::slice(SliceType::P, 3, 0);
        hdr.num_ref_idx_l0_active_minus1 = 2;
        hdr.max_pic_num = 16;
        hdr.ref_pic_list_modification_flag_l0 = true;
        // pic_num 3 - 3 = 0 first, then a missing pic_num which is skipped.
        hdr.ref_pic_list_modification_l0 = vec![
            RefPicListModification {
                modification_of_pic_nums_idc: 0,
                abs_diff_pic_num_minus1: 2,
                ..Default::default()
            },
            RefPicListModification {
                modification_of_pic_nums_idc: 2,
                long_term_pic_num: 7,
                ..Default::default()
            },
            RefPicListModification {
                modification_of_pic_nums_idc: 3,
                ..Default::default()
            },
        ];

        let cur = ref_frame(3, 6);
        dpb.init_picture_refs(&cur, &hdr, &sps);
        assert_eq!(surfaces(dpb.ref_pic_list0()), vec![Some(0), Some(2), Some(1)]);
    }

    #[test]
    fn bumping_outputs_in_poc_order() {
        let mut sps = synthetic::sps(0);
        sps.max_num_ref_frames = 1;
        let mut dpb = dpb(&sps);
        dpb.max_num_frames = 2;

        for (frame_num, poc) in [(0, 4), (1, 0)] {
            let pic = ref_frame(frame_num, poc);
            dpb.exec_ref_pic_marking(&pic, &sps).unwrap();
            dpb.add_dpb(store(&pic)).unwrap();
        }
        assert!(dpb.take_output().is_empty());

        let pic = ref_frame(2, 2);
        dpb.exec_ref_pic_marking(&pic, &sps).unwrap();
        dpb.add_dpb(store(&pic)).unwrap();

        let out = dpb.take_output();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].borrow().pic_order_cnt(), 0);

        dpb.flush_dpb();
        let pocs: Vec<_> = dpb
            .take_output()
            .iter()
            .map(|s| s.borrow().pic_order_cnt())
            .collect();
        assert_eq!(pocs, vec![2, 4]);

        // The latest frame is still a reference after the flush.
        assert_eq!(dpb.num_ref_frames(), 1);

        dpb.drain_dpb();
        assert!(dpb.stores().is_empty());
    }

    #[test]
    fn non_reference_frame_output_directly() {
        let sps = synthetic::sps(0);
        let mut dpb = dpb(&sps);
        dpb.max_num_frames = 1;

        let pic = ref_frame(0, 4);
        dpb.add_dpb(store(&pic)).unwrap();

        let non_ref = ref_frame(1, 2);
        non_ref.borrow_mut().set_reference(Reference::None, false);
        dpb.add_dpb(store(&non_ref)).unwrap();

        let out = dpb.take_output();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].borrow().pic_order_cnt(), 2);
        assert_eq!(dpb.stores().len(), 1);
    }

    #[test]
    fn field_lists_alternate_parity() {
        let mut sps = synthetic::sps(0);
        sps.max_num_ref_frames = 4;
        let mut dpb = dpb(&sps);

        for frame_num in 0..2 {
            let frame = ref_frame(frame_num, 4 * frame_num);
            frame.borrow_mut().bottom_field_order_cnt = Some(4 * frame_num + 1);
            let mut s = FrameStore::new(frame);
            s.split_fields().unwrap();
            dpb.add_dpb(Rc::new(RefCell::new(s))).unwrap();
        }

        let mut hdr = synthetic::slice(SliceType::P, 2, 0);
        hdr.field_pic_flag = true;
        hdr.bottom_field_flag = true;
        hdr.num_ref_idx_l0_active_minus1 = 3;
        hdr.max_pic_num = 32;

        let cur = ref_frame(2, 9);
        {
            let mut c = cur.borrow_mut();
            c.field = Field::Bottom;
            c.pic_num = 5;
        }

        dpb.init_picture_refs(&cur, &hdr, &sps);

        let fields: Vec<_> = dpb
            .ref_pic_list0()
            .iter()
            .map(|p| (p.borrow().frame_num, p.borrow().field))
            .collect();
        assert_eq!(
            fields,
            vec![
                (1, Field::Bottom),
                (1, Field::Top),
                (0, Field::Bottom),
                (0, Field::Top)
            ]
        );
    }

    #[test]
    fn dummy_pictures() {
        let sps = synthetic::sps(0);
        let mut dpb = dpb(&sps);

        for frame_num in 1..4 {
            let pic = PictureData::new_non_existing(frame_num, 0);
            dpb.exec_dummy_picture_marking(&pic, &sps).unwrap();
            dpb.add_dummy_picture(pic, false).unwrap();
        }

        // Only max_num_ref_frames of them remain references.
        assert_eq!(dpb.num_ref_frames(), 2);
        assert!(dpb.take_output().is_empty());
    }
}
