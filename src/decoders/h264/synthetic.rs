// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream writer used by the unit tests to build small H.264 streams from
//! parsed syntax structures. Only the syntax elements read by the parser are
//! emitted.

use crate::decoders::h264::parser::Level;
use crate::decoders::h264::parser::NaluType;
use crate::decoders::h264::parser::Pps;
use crate::decoders::h264::parser::SliceHeader;
use crate::decoders::h264::parser::SliceType;
use crate::decoders::h264::parser::Sps;

#[derive(Default)]
pub struct BitWriter {
    data: Vec<u8>,
    cur: u8,
    nbits: u8,
}

impl BitWriter {
    pub fn put_bit(&mut self, bit: bool) {
        self.cur = (self.cur << 1) | u8::from(bit);
        self.nbits += 1;
        if self.nbits == 8 {
            self.data.push(self.cur);
            self.cur = 0;
            self.nbits = 0;
        }
    }

    pub fn put_bits(&mut self, value: u64, num_bits: usize) {
        for i in (0..num_bits).rev() {
            self.put_bit((value >> i) & 1 == 1);
        }
    }

    pub fn put_ue(&mut self, value: u32) {
        let v = u64::from(value) + 1;
        let len = 64 - v.leading_zeros() as usize;
        self.put_bits(0, len - 1);
        self.put_bits(v, len);
    }

    pub fn put_se(&mut self, value: i32) {
        let v = i64::from(value);
        let ue = if v > 0 { 2 * v - 1 } else { -2 * v };
        self.put_ue(ue as u32);
    }

    /// rbsp_trailing_bits()
    pub fn finish(mut self) -> Vec<u8> {
        self.put_bit(true);
        while self.nbits != 0 {
            self.put_bit(false);
        }
        self.data
    }
}

/// Wraps `rbsp` into a NAL unit, inserting emulation prevention bytes.
pub fn nalu(ref_idc: u8, type_: NaluType, rbsp: &[u8]) -> Vec<u8> {
    let mut out = vec![(ref_idc << 5) | type_ as u8];
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

pub fn annex_b(nalus: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![];
    for nalu in nalus {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nalu);
    }
    out
}

pub fn length_prefixed(nalus: &[Vec<u8>], length_size: usize) -> Vec<u8> {
    let mut out = vec![];
    for nalu in nalus {
        let len = nalu.len().to_be_bytes();
        out.extend_from_slice(&len[len.len() - length_size..]);
        out.extend_from_slice(nalu);
    }
    out
}

/// Builds an AVCDecoderConfigurationRecord.
pub fn avcc(spses: &[Vec<u8>], ppses: &[Vec<u8>], length_size: usize) -> Vec<u8> {
    let mut out = vec![1, 77, 0, 30, 0xfc | (length_size as u8 - 1)];
    out.push(0xe0 | spses.len() as u8);
    for sps in spses {
        out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        out.extend_from_slice(sps);
    }
    out.push(ppses.len() as u8);
    for pps in ppses {
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(pps);
    }
    out
}

/// A 32x32 progressive Main profile SPS with the given POC type.
pub fn sps(pic_order_cnt_type: u8) -> Sps {
    let mut sps = Sps {
        profile_idc: 77,
        level_idc: Level::L3,
        pic_order_cnt_type,
        log2_max_pic_order_cnt_lsb_minus4: 2,
        max_num_ref_frames: 2,
        pic_width_in_mbs_minus1: 1,
        pic_height_in_map_units_minus1: 1,
        direct_8x8_inference_flag: true,
        ..Default::default()
    };

    if pic_order_cnt_type == 1 {
        sps.offset_for_non_ref_pic = -1;
        sps.num_ref_frames_in_pic_order_cnt_cycle = 1;
        sps.offset_for_ref_frame[0] = 2;
        sps.expected_delta_per_pic_order_cnt_cycle = 2;
    }

    sps
}

pub fn pps(pic_parameter_set_id: u8) -> Pps {
    Pps {
        pic_parameter_set_id,
        ..Default::default()
    }
}

pub fn slice(slice_type: SliceType, frame_num: u16, pic_order_cnt_lsb: u16) -> SliceHeader {
    SliceHeader {
        slice_type,
        frame_num,
        pic_order_cnt_lsb,
        ..Default::default()
    }
}

fn is_high_profile(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

pub fn write_sps(sps: &Sps) -> Vec<u8> {
    let mut w = BitWriter::default();
    w.put_bits(u64::from(sps.profile_idc), 8);
    for flag in [
        sps.constraint_set0_flag,
        sps.constraint_set1_flag,
        sps.constraint_set2_flag,
        sps.constraint_set3_flag,
        sps.constraint_set4_flag,
        sps.constraint_set5_flag,
    ] {
        w.put_bit(flag);
    }
    w.put_bits(0, 2);
    w.put_bits(sps.level_idc as u64, 8);
    w.put_ue(u32::from(sps.seq_parameter_set_id));

    if is_high_profile(sps.profile_idc) {
        w.put_ue(u32::from(sps.chroma_format_idc));
        if sps.chroma_format_idc == 3 {
            w.put_bit(sps.separate_colour_plane_flag);
        }
        w.put_ue(u32::from(sps.bit_depth_luma_minus8));
        w.put_ue(u32::from(sps.bit_depth_chroma_minus8));
        w.put_bit(sps.qpprime_y_zero_transform_bypass_flag);
        w.put_bit(sps.seq_scaling_matrix_present_flag);
        if sps.seq_scaling_matrix_present_flag {
            // Every list absent, falling back to the defaults.
            let num_lists = if sps.chroma_format_idc != 3 { 8 } else { 12 };
            w.put_bits(0, num_lists);
        }
    }

    w.put_ue(u32::from(sps.log2_max_frame_num_minus4));
    w.put_ue(u32::from(sps.pic_order_cnt_type));
    if sps.pic_order_cnt_type == 0 {
        w.put_ue(u32::from(sps.log2_max_pic_order_cnt_lsb_minus4));
    } else if sps.pic_order_cnt_type == 1 {
        w.put_bit(sps.delta_pic_order_always_zero_flag);
        w.put_se(sps.offset_for_non_ref_pic);
        w.put_se(sps.offset_for_top_to_bottom_field);
        w.put_ue(u32::from(sps.num_ref_frames_in_pic_order_cnt_cycle));
        for offset in &sps.offset_for_ref_frame[..usize::from(sps.num_ref_frames_in_pic_order_cnt_cycle)]
        {
            w.put_se(*offset);
        }
    }

    w.put_ue(sps.max_num_ref_frames);
    w.put_bit(sps.gaps_in_frame_num_value_allowed_flag);
    w.put_ue(sps.pic_width_in_mbs_minus1);
    w.put_ue(sps.pic_height_in_map_units_minus1);
    w.put_bit(sps.frame_mbs_only_flag);
    if !sps.frame_mbs_only_flag {
        w.put_bit(sps.mb_adaptive_frame_field_flag);
    }
    w.put_bit(sps.direct_8x8_inference_flag);
    w.put_bit(sps.frame_cropping_flag);
    if sps.frame_cropping_flag {
        w.put_ue(sps.frame_crop_left_offset);
        w.put_ue(sps.frame_crop_right_offset);
        w.put_ue(sps.frame_crop_top_offset);
        w.put_ue(sps.frame_crop_bottom_offset);
    }
    // No VUI.
    w.put_bit(false);

    nalu(3, NaluType::Sps, &w.finish())
}

pub fn write_pps(pps: &Pps, sps: &Sps) -> Vec<u8> {
    let mut w = BitWriter::default();
    w.put_ue(u32::from(pps.pic_parameter_set_id));
    w.put_ue(u32::from(pps.seq_parameter_set_id));
    w.put_bit(pps.entropy_coding_mode_flag);
    w.put_bit(pps.bottom_field_pic_order_in_frame_present_flag);
    w.put_ue(pps.num_slice_groups_minus1);
    w.put_ue(u32::from(pps.num_ref_idx_l0_default_active_minus1));
    w.put_ue(u32::from(pps.num_ref_idx_l1_default_active_minus1));
    w.put_bit(pps.weighted_pred_flag);
    w.put_bits(u64::from(pps.weighted_bipred_idc), 2);
    w.put_se(i32::from(pps.pic_init_qp_minus26));
    w.put_se(i32::from(pps.pic_init_qs_minus26));
    w.put_se(i32::from(pps.chroma_qp_index_offset));
    w.put_bit(pps.deblocking_filter_control_present_flag);
    w.put_bit(pps.constrained_intra_pred_flag);
    w.put_bit(pps.redundant_pic_cnt_present_flag);

    if pps.transform_8x8_mode_flag
        || pps.pic_scaling_matrix_present_flag
        || pps.second_chroma_qp_index_offset != pps.chroma_qp_index_offset
    {
        w.put_bit(pps.transform_8x8_mode_flag);
        w.put_bit(pps.pic_scaling_matrix_present_flag);
        if pps.pic_scaling_matrix_present_flag {
            let num_8x8 = match (pps.transform_8x8_mode_flag, sps.chroma_format_idc) {
                (false, _) => 0,
                (true, 3) => 6,
                (true, _) => 2,
            };
            w.put_bits(0, 6 + num_8x8);
        }
        w.put_se(i32::from(pps.second_chroma_qp_index_offset));
    }

    nalu(3, NaluType::Pps, &w.finish())
}

pub fn write_slice(hdr: &SliceHeader, ref_idc: u8, idr: bool, sps: &Sps, pps: &Pps) -> Vec<u8> {
    let mut w = BitWriter::default();
    w.put_ue(hdr.first_mb_in_slice);
    w.put_ue(hdr.slice_type as u32);
    w.put_ue(u32::from(hdr.pic_parameter_set_id));
    if sps.separate_colour_plane_flag {
        w.put_bits(u64::from(hdr.colour_plane_id), 2);
    }
    w.put_bits(
        u64::from(hdr.frame_num),
        usize::from(sps.log2_max_frame_num_minus4) + 4,
    );
    if !sps.frame_mbs_only_flag {
        w.put_bit(hdr.field_pic_flag);
        if hdr.field_pic_flag {
            w.put_bit(hdr.bottom_field_flag);
        }
    }
    if idr {
        w.put_ue(u32::from(hdr.idr_pic_id));
    }
    if sps.pic_order_cnt_type == 0 {
        w.put_bits(
            u64::from(hdr.pic_order_cnt_lsb),
            usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
        );
        if pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag {
            w.put_se(hdr.delta_pic_order_cnt_bottom);
        }
    }
    if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
        w.put_se(hdr.delta_pic_order_cnt[0]);
        if pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag {
            w.put_se(hdr.delta_pic_order_cnt[1]);
        }
    }
    if pps.redundant_pic_cnt_present_flag {
        w.put_ue(u32::from(hdr.redundant_pic_cnt));
    }

    let is_b = hdr.slice_type.is_b();
    let is_p = hdr.slice_type.is_p() || hdr.slice_type.is_sp();
    if is_b {
        w.put_bit(hdr.direct_spatial_mv_pred_flag);
    }
    if is_p || is_b {
        w.put_bit(hdr.num_ref_idx_active_override_flag);
        if hdr.num_ref_idx_active_override_flag {
            w.put_ue(u32::from(hdr.num_ref_idx_l0_active_minus1));
            if is_b {
                w.put_ue(u32::from(hdr.num_ref_idx_l1_active_minus1));
            }
        }
    }

    let mut lists = vec![];
    if is_p || is_b {
        lists.push((
            hdr.ref_pic_list_modification_flag_l0,
            &hdr.ref_pic_list_modification_l0,
        ));
    }
    if is_b {
        lists.push((
            hdr.ref_pic_list_modification_flag_l1,
            &hdr.ref_pic_list_modification_l1,
        ));
    }
    for (flag, mods) in lists {
        w.put_bit(flag);
        if flag {
            for m in mods {
                w.put_ue(u32::from(m.modification_of_pic_nums_idc));
                if m.modification_of_pic_nums_idc == 2 {
                    w.put_ue(m.long_term_pic_num);
                } else {
                    w.put_ue(m.abs_diff_pic_num_minus1);
                }
            }
            w.put_ue(3);
        }
    }

    if (pps.weighted_pred_flag && is_p) || (pps.weighted_bipred_idc == 1 && is_b) {
        let (l0_active_minus1, l1_active_minus1) = if hdr.num_ref_idx_active_override_flag {
            (
                hdr.num_ref_idx_l0_active_minus1,
                hdr.num_ref_idx_l1_active_minus1,
            )
        } else {
            (
                pps.num_ref_idx_l0_default_active_minus1,
                pps.num_ref_idx_l1_default_active_minus1,
            )
        };

        let pt = &hdr.pred_weight_table;
        w.put_ue(u32::from(pt.luma_log2_weight_denom));
        if sps.chroma_array_type != 0 {
            w.put_ue(u32::from(pt.chroma_log2_weight_denom));
        }

        let luma_default = 1i16 << pt.luma_log2_weight_denom;
        let chroma_default = 1i16 << pt.chroma_log2_weight_denom;
        let mut put_list = |n: u8,
                            luma_weight: &[i16; 32],
                            luma_offset: &[i16; 32],
                            chroma_weight: &[[i16; 2]; 32],
                            chroma_offset: &[[i16; 2]; 32]| {
            for i in 0..=usize::from(n) {
                let luma = luma_weight[i] != luma_default || luma_offset[i] != 0;
                w.put_bit(luma);
                if luma {
                    w.put_se(i32::from(luma_weight[i]));
                    w.put_se(i32::from(luma_offset[i]));
                }
                if sps.chroma_array_type != 0 {
                    let chroma = chroma_weight[i] != [chroma_default; 2]
                        || chroma_offset[i] != [0; 2];
                    w.put_bit(chroma);
                    if chroma {
                        for j in 0..2 {
                            w.put_se(i32::from(chroma_weight[i][j]));
                            w.put_se(i32::from(chroma_offset[i][j]));
                        }
                    }
                }
            }
        };

        put_list(
            l0_active_minus1,
            &pt.luma_weight_l0,
            &pt.luma_offset_l0,
            &pt.chroma_weight_l0,
            &pt.chroma_offset_l0,
        );
        if is_b {
            put_list(
                l1_active_minus1,
                &pt.luma_weight_l1,
                &pt.luma_offset_l1,
                &pt.chroma_weight_l1,
                &pt.chroma_offset_l1,
            );
        }
    }

    if ref_idc != 0 {
        let rpm = &hdr.dec_ref_pic_marking;
        if idr {
            w.put_bit(rpm.no_output_of_prior_pics_flag);
            w.put_bit(rpm.long_term_reference_flag);
        } else {
            w.put_bit(rpm.adaptive_ref_pic_marking_mode_flag);
            if rpm.adaptive_ref_pic_marking_mode_flag {
                for op in &rpm.inner {
                    let mmco = op.memory_management_control_operation;
                    w.put_ue(u32::from(mmco));
                    if mmco == 1 || mmco == 3 {
                        w.put_ue(op.difference_of_pic_nums_minus1);
                    }
                    if mmco == 2 {
                        w.put_ue(op.long_term_pic_num);
                    }
                    if mmco == 3 || mmco == 6 {
                        w.put_ue(op.long_term_frame_idx);
                    }
                    if mmco == 4 {
                        w.put_ue(op.max_long_term_frame_idx_plus1);
                    }
                }
                w.put_ue(0);
            }
        }
    }

    if pps.entropy_coding_mode_flag && !hdr.slice_type.is_i() && !hdr.slice_type.is_si() {
        w.put_ue(u32::from(hdr.cabac_init_idc));
    }
    w.put_se(i32::from(hdr.slice_qp_delta));
    if hdr.slice_type.is_sp() || hdr.slice_type.is_si() {
        if hdr.slice_type.is_sp() {
            w.put_bit(hdr.sp_for_switch_flag);
        }
        w.put_se(i32::from(hdr.slice_qs_delta));
    }
    if pps.deblocking_filter_control_present_flag {
        w.put_ue(u32::from(hdr.disable_deblocking_filter_idc));
        if hdr.disable_deblocking_filter_idc != 1 {
            w.put_se(i32::from(hdr.slice_alpha_c0_offset_div2));
            w.put_se(i32::from(hdr.slice_beta_offset_div2));
        }
    }

    // Some opaque macroblock data.
    w.put_bits(0xa5a5, 16);

    let type_ = if idr {
        NaluType::SliceIdr
    } else {
        NaluType::Slice
    };
    nalu(ref_idc, type_, &w.finish())
}
