// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count derivation, 8.2.1. Each algorithm is a pure function
//! from the carried-over state and the current picture to the field order
//! counts and the state for the next picture.

use log::trace;

use crate::decoders::h264::parser::SliceHeader;
use crate::decoders::h264::parser::Sps;
use crate::decoders::h264::picture::Field;

/// State carried from one picture to the next, per POC type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PocState {
    Type0 {
        /// prevPicOrderCntMsb of the previous reference picture.
        prev_pic_order_cnt_msb: i32,
        /// prevPicOrderCntLsb of the previous reference picture.
        prev_pic_order_cnt_lsb: i32,
    },
    Type1 {
        prev_frame_num_offset: i32,
    },
    Type2 {
        prev_frame_num_offset: i32,
    },
}

impl PocState {
    /// A fresh state for `pic_order_cnt_type`.
    pub fn new(pic_order_cnt_type: u8) -> Self {
        match pic_order_cnt_type {
            0 => PocState::Type0 {
                prev_pic_order_cnt_msb: 0,
                prev_pic_order_cnt_lsb: 0,
            },
            1 => PocState::Type1 {
                prev_frame_num_offset: 0,
            },
            _ => PocState::Type2 {
                prev_frame_num_offset: 0,
            },
        }
    }

    pub fn pic_order_cnt_type(&self) -> u8 {
        match self {
            PocState::Type0 { .. } => 0,
            PocState::Type1 { .. } => 1,
            PocState::Type2 { .. } => 2,
        }
    }

    /// The state to use for a picture of an SPS with `pic_order_cnt_type`.
    /// Accumulators are never carried across a change of POC type.
    pub fn for_type(self, pic_order_cnt_type: u8) -> Self {
        if self.pic_order_cnt_type() == pic_order_cnt_type {
            self
        } else {
            PocState::new(pic_order_cnt_type)
        }
    }

    /// State following a picture that carried memory_management_control_operation
    /// 5. `top_field_order_cnt` is the top field POC of that picture after
    /// its own reset (8.2.1).
    pub fn after_mmco5(self, field: Field, top_field_order_cnt: i32) -> Self {
        match self {
            PocState::Type0 { .. } => PocState::Type0 {
                prev_pic_order_cnt_msb: 0,
                prev_pic_order_cnt_lsb: if field == Field::Bottom {
                    0
                } else {
                    top_field_order_cnt
                },
            },
            PocState::Type1 { .. } => PocState::Type1 {
                prev_frame_num_offset: 0,
            },
            PocState::Type2 { .. } => PocState::Type2 {
                prev_frame_num_offset: 0,
            },
        }
    }
}

/// Field order counts of a picture. A field picture only has its own parity.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PicOrderCnt {
    pub top: Option<i32>,
    pub bottom: Option<i32>,
}

impl PicOrderCnt {
    /// PicOrderCnt(), (8-1).
    pub fn pic_order_cnt(&self) -> i32 {
        match (self.top, self.bottom) {
            (Some(top), Some(bottom)) => std::cmp::min(top, bottom),
            (Some(top), None) => top,
            (None, Some(bottom)) => bottom,
            (None, None) => 0,
        }
    }
}

/// Properties of the current picture the POC derivation depends on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PocInput {
    pub idr: bool,
    pub is_ref: bool,
    pub field: Field,
    pub frame_num: i32,
    /// frame_num of the previous picture in decoding order.
    pub prev_frame_num: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
}

impl PocInput {
    pub fn from_slice(
        hdr: &SliceHeader,
        idr: bool,
        is_ref: bool,
        field: Field,
        prev_frame_num: i32,
    ) -> Self {
        Self {
            idr,
            is_ref,
            field,
            frame_num: i32::from(hdr.frame_num),
            prev_frame_num,
            pic_order_cnt_lsb: i32::from(hdr.pic_order_cnt_lsb),
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt: hdr.delta_pic_order_cnt,
        }
    }
}

fn frame_num_offset(prev_frame_num_offset: i32, sps: &Sps, input: &PocInput) -> i32 {
    // (8-6) and (8-11)
    if input.idr {
        0
    } else if input.prev_frame_num > input.frame_num {
        prev_frame_num_offset + sps.max_frame_num as i32
    } else {
        prev_frame_num_offset
    }
}

/// 8.2.1.1
fn compute_type_0(
    prev_msb: i32,
    prev_lsb: i32,
    sps: &Sps,
    input: &PocInput,
) -> (PicOrderCnt, PocState) {
    let (prev_msb, prev_lsb) = if input.idr { (0, 0) } else { (prev_msb, prev_lsb) };

    let max_lsb = sps.max_pic_order_cnt_lsb();
    let lsb = input.pic_order_cnt_lsb;

    // (8-3)
    let msb = if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
        prev_msb + max_lsb
    } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
        prev_msb - max_lsb
    } else {
        prev_msb
    };

    let poc = msb + lsb;
    let order = match input.field {
        Field::Frame => PicOrderCnt {
            top: Some(poc),
            bottom: Some(poc + input.delta_pic_order_cnt_bottom),
        },
        Field::Top => PicOrderCnt {
            top: Some(poc),
            bottom: None,
        },
        Field::Bottom => PicOrderCnt {
            top: None,
            bottom: Some(poc),
        },
    };

    // prevPicOrderCntMsb/Lsb come from the previous reference picture.
    let state = if input.is_ref {
        PocState::Type0 {
            prev_pic_order_cnt_msb: msb,
            prev_pic_order_cnt_lsb: lsb,
        }
    } else {
        PocState::Type0 {
            prev_pic_order_cnt_msb: prev_msb,
            prev_pic_order_cnt_lsb: prev_lsb,
        }
    };

    (order, state)
}

/// 8.2.1.2
fn compute_type_1(
    prev_frame_num_offset: i32,
    sps: &Sps,
    input: &PocInput,
) -> (PicOrderCnt, PocState) {
    let frame_num_offset = frame_num_offset(prev_frame_num_offset, sps, input);
    let cycle_len = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);

    // (8-7)
    let mut abs_frame_num = if cycle_len != 0 {
        frame_num_offset + input.frame_num
    } else {
        0
    };

    if !input.is_ref && abs_frame_num > 0 {
        abs_frame_num -= 1;
    }

    let mut expected_pic_order_cnt = if abs_frame_num > 0 {
        // (8-8)
        let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / cycle_len;
        let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % cycle_len;

        // (8-9)
        let in_cycle: i32 = sps.offset_for_ref_frame
            [..=frame_num_in_pic_order_cnt_cycle as usize]
            .iter()
            .fold(0i32, |acc, offset| acc.wrapping_add(*offset));

        pic_order_cnt_cycle_cnt
            .wrapping_mul(sps.expected_delta_per_pic_order_cnt_cycle)
            .wrapping_add(in_cycle)
    } else {
        0
    };

    if !input.is_ref {
        expected_pic_order_cnt += sps.offset_for_non_ref_pic;
    }

    // (8-10)
    let order = match input.field {
        Field::Frame => {
            let top = expected_pic_order_cnt + input.delta_pic_order_cnt[0];
            PicOrderCnt {
                top: Some(top),
                bottom: Some(
                    top + sps.offset_for_top_to_bottom_field + input.delta_pic_order_cnt[1],
                ),
            }
        }
        Field::Top => PicOrderCnt {
            top: Some(expected_pic_order_cnt + input.delta_pic_order_cnt[0]),
            bottom: None,
        },
        Field::Bottom => PicOrderCnt {
            top: None,
            bottom: Some(
                expected_pic_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + input.delta_pic_order_cnt[0],
            ),
        },
    };

    (
        order,
        PocState::Type1 {
            prev_frame_num_offset: frame_num_offset,
        },
    )
}

/// 8.2.1.3
fn compute_type_2(
    prev_frame_num_offset: i32,
    sps: &Sps,
    input: &PocInput,
) -> (PicOrderCnt, PocState) {
    let frame_num_offset = frame_num_offset(prev_frame_num_offset, sps, input);

    // (8-12)
    let temp_pic_order_cnt = if input.idr {
        0
    } else if !input.is_ref {
        2 * (frame_num_offset + input.frame_num) - 1
    } else {
        2 * (frame_num_offset + input.frame_num)
    };

    // (8-13)
    let order = PicOrderCnt {
        top: (input.field != Field::Bottom).then_some(temp_pic_order_cnt),
        bottom: (input.field != Field::Top).then_some(temp_pic_order_cnt),
    };

    (
        order,
        PocState::Type2 {
            prev_frame_num_offset: frame_num_offset,
        },
    )
}

/// Derives the field order counts of the current picture and the state for
/// the next one.
pub fn compute(state: PocState, sps: &Sps, input: &PocInput) -> (PicOrderCnt, PocState) {
    let (order, next) = match state.for_type(sps.pic_order_cnt_type) {
        PocState::Type0 {
            prev_pic_order_cnt_msb,
            prev_pic_order_cnt_lsb,
        } => compute_type_0(prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb, sps, input),
        PocState::Type1 {
            prev_frame_num_offset,
        } => compute_type_1(prev_frame_num_offset, sps, input),
        PocState::Type2 {
            prev_frame_num_offset,
        } => compute_type_2(prev_frame_num_offset, sps, input),
    };

    trace!(
        "POC type {}: frame_num {} -> {:?}",
        sps.pic_order_cnt_type,
        input.frame_num,
        order
    );

    (order, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::h264::synthetic;

    fn frame(frame_num: i32, pic_order_cnt_lsb: i32, is_ref: bool) -> PocInput {
        PocInput {
            is_ref,
            frame_num,
            prev_frame_num: frame_num - 1,
            pic_order_cnt_lsb,
            ..Default::default()
        }
    }

    #[test]
    fn type_0_idr_resets_accumulators() {
        let sps = synthetic::sps(0);
        let state = PocState::Type0 {
            prev_pic_order_cnt_msb: 640,
            prev_pic_order_cnt_lsb: 50,
        };

        let idr = PocInput {
            idr: true,
            ..frame(0, 4, true)
        };
        let (order, next) = compute(state, &sps, &idr);

        assert_eq!(order.top, Some(4));
        assert_eq!(order.pic_order_cnt(), 4);
        assert_eq!(
            next,
            PocState::Type0 {
                prev_pic_order_cnt_msb: 0,
                prev_pic_order_cnt_lsb: 4
            }
        );
    }

    #[test]
    fn type_0_lsb_wraps() {
        // MaxPicOrderCntLsb is 64.
        let sps = synthetic::sps(0);
        let state = PocState::Type0 {
            prev_pic_order_cnt_msb: 0,
            prev_pic_order_cnt_lsb: 60,
        };

        let (order, next) = compute(state, &sps, &frame(5, 2, true));
        assert_eq!(order.pic_order_cnt(), 66);

        // Going back across the boundary decrements the MSB.
        let (order, _) = compute(next, &sps, &frame(6, 62, false));
        assert_eq!(order.pic_order_cnt(), 62);
    }

    #[test]
    fn type_0_non_ref_does_not_advance_state() {
        let sps = synthetic::sps(0);
        let state = PocState::new(0);

        let (_, next) = compute(state, &sps, &frame(1, 8, false));
        assert_eq!(next, state);
    }

    #[test]
    fn type_0_bottom_delta() {
        let sps = synthetic::sps(0);
        let input = PocInput {
            delta_pic_order_cnt_bottom: -1,
            ..frame(1, 8, true)
        };

        let (order, _) = compute(PocState::new(0), &sps, &input);
        assert_eq!(order.top, Some(8));
        assert_eq!(order.bottom, Some(7));
        assert_eq!(order.pic_order_cnt(), 7);
    }

    #[test]
    fn type_1_cycle() {
        // One reference frame per cycle with an offset of 2, non-reference
        // pictures offset by -1.
        let sps = synthetic::sps(1);

        let (order, state) = compute(PocState::new(1), &sps, &frame(1, 0, true));
        assert_eq!(order.top, Some(2));
        assert_eq!(order.bottom, Some(2));

        let (order, _) = compute(state, &sps, &frame(2, 0, false));
        // AbsFrameNum 1 after the non-reference decrement.
        assert_eq!(order.pic_order_cnt(), 1);

        let (order, _) = compute(state, &sps, &frame(3, 0, true));
        assert_eq!(order.pic_order_cnt(), 6);
    }

    #[test]
    fn type_2_frame_num_wrap() {
        let sps = synthetic::sps(2);

        let (order, state) = compute(PocState::new(2), &sps, &frame(15, 0, true));
        assert_eq!(order.pic_order_cnt(), 30);

        let input = PocInput {
            prev_frame_num: 15,
            ..frame(0, 0, false)
        };
        let (order, next) = compute(state, &sps, &input);
        assert_eq!(order.pic_order_cnt(), 31);
        assert_eq!(
            next,
            PocState::Type2 {
                prev_frame_num_offset: 16
            }
        );

        let field = PocInput {
            field: Field::Bottom,
            ..frame(3, 0, true)
        };
        let (order, _) = compute(PocState::new(2), &sps, &field);
        assert_eq!(order.top, None);
        assert_eq!(order.bottom, Some(6));
    }

    #[test]
    fn type_change_starts_fresh() {
        let sps = synthetic::sps(2);
        let state = PocState::Type0 {
            prev_pic_order_cnt_msb: 128,
            prev_pic_order_cnt_lsb: 10,
        };

        let (order, next) = compute(state, &sps, &frame(1, 0, true));
        assert_eq!(order.pic_order_cnt(), 2);
        assert_eq!(next.pic_order_cnt_type(), 2);
    }

    #[test]
    fn mmco5_reset() {
        let state = PocState::Type0 {
            prev_pic_order_cnt_msb: 64,
            prev_pic_order_cnt_lsb: 12,
        };
        assert_eq!(
            state.after_mmco5(Field::Frame, 3),
            PocState::Type0 {
                prev_pic_order_cnt_msb: 0,
                prev_pic_order_cnt_lsb: 3
            }
        );
        assert_eq!(
            state.after_mmco5(Field::Bottom, 3),
            PocState::Type0 {
                prev_pic_order_cnt_msb: 0,
                prev_pic_order_cnt_lsb: 0
            }
        );
        assert_eq!(
            PocState::Type1 {
                prev_frame_num_offset: 32
            }
            .after_mmco5(Field::Frame, 0),
            PocState::new(1)
        );
    }
}
