// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Field-for-field mirrors of the VA-API H.264 decode buffers, and the code
//! filling them from the parameter sets, the slice header and the DPB.

use anyhow::anyhow;
use anyhow::Result;

use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::parser::Level;
use crate::decoders::h264::parser::Pps;
use crate::decoders::h264::parser::Slice;
use crate::decoders::h264::parser::Sps;
use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::PictureData;
use crate::decoders::h264::picture::PictureRc;

pub const VA_INVALID_ID: u32 = 0xffffffff;

pub const VA_PICTURE_H264_INVALID: u32 = 0x00000001;
pub const VA_PICTURE_H264_TOP_FIELD: u32 = 0x00000002;
pub const VA_PICTURE_H264_BOTTOM_FIELD: u32 = 0x00000004;
pub const VA_PICTURE_H264_SHORT_TERM_REFERENCE: u32 = 0x00000008;
pub const VA_PICTURE_H264_LONG_TERM_REFERENCE: u32 = 0x00000010;

pub const VA_SLICE_DATA_FLAG_ALL: u32 = 0x00;

const ZIGZAG_8X8: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27, 20,
    13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58, 59,
    52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

/// VAPictureH264
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureH264 {
    pub picture_id: u32,
    pub frame_idx: u32,
    pub flags: u32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
}

impl PictureH264 {
    /// Entry for unused slots of reference arrays.
    pub const fn invalid() -> Self {
        Self {
            picture_id: VA_INVALID_ID,
            frame_idx: 0,
            flags: VA_PICTURE_H264_INVALID,
            top_field_order_cnt: 0,
            bottom_field_order_cnt: 0,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.flags & VA_PICTURE_H264_INVALID != 0
    }
}

impl Default for PictureH264 {
    fn default() -> Self {
        Self::invalid()
    }
}

/// The `seq_fields` bit field of VAPictureParameterBufferH264.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SeqFields {
    pub chroma_format_idc: u32,
    pub residual_colour_transform_flag: bool,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub min_luma_bi_pred_size8x8: bool,
    pub log2_max_frame_num_minus4: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub delta_pic_order_always_zero_flag: bool,
}

impl SeqFields {
    /// The packed representation.
    pub fn value(&self) -> u32 {
        (self.chroma_format_idc & 0x3)
            | u32::from(self.residual_colour_transform_flag) << 2
            | u32::from(self.gaps_in_frame_num_value_allowed_flag) << 3
            | u32::from(self.frame_mbs_only_flag) << 4
            | u32::from(self.mb_adaptive_frame_field_flag) << 5
            | u32::from(self.direct_8x8_inference_flag) << 6
            | u32::from(self.min_luma_bi_pred_size8x8) << 7
            | (self.log2_max_frame_num_minus4 & 0xf) << 8
            | (self.pic_order_cnt_type & 0x3) << 12
            | (self.log2_max_pic_order_cnt_lsb_minus4 & 0xf) << 14
            | u32::from(self.delta_pic_order_always_zero_flag) << 18
    }
}

/// The `pic_fields` bit field of VAPictureParameterBufferH264.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PicFields {
    pub entropy_coding_mode_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u32,
    pub transform_8x8_mode_flag: bool,
    pub field_pic_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub pic_order_present_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub reference_pic_flag: bool,
}

impl PicFields {
    pub fn value(&self) -> u32 {
        u32::from(self.entropy_coding_mode_flag)
            | u32::from(self.weighted_pred_flag) << 1
            | (self.weighted_bipred_idc & 0x3) << 2
            | u32::from(self.transform_8x8_mode_flag) << 4
            | u32::from(self.field_pic_flag) << 5
            | u32::from(self.constrained_intra_pred_flag) << 6
            | u32::from(self.pic_order_present_flag) << 7
            | u32::from(self.deblocking_filter_control_present_flag) << 8
            | u32::from(self.redundant_pic_cnt_present_flag) << 9
            | u32::from(self.reference_pic_flag) << 10
    }
}

/// VAPictureParameterBufferH264
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureParameterBufferH264 {
    pub curr_pic: PictureH264,
    pub reference_frames: [PictureH264; 16],
    pub picture_width_in_mbs_minus1: u16,
    pub picture_height_in_mbs_minus1: u16,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub num_ref_frames: u8,
    pub seq_fields: SeqFields,
    pub num_slice_groups_minus1: u8,
    pub slice_group_map_type: u8,
    pub slice_group_change_rate_minus1: u16,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub pic_fields: PicFields,
    pub frame_num: u16,
}

/// VASliceParameterBufferH264
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceParameterBufferH264 {
    pub slice_data_size: u32,
    pub slice_data_offset: u32,
    pub slice_data_flag: u32,
    /// Bit offset of the first macroblock, from the start of the NAL unit.
    pub slice_data_bit_offset: u16,
    pub first_mb_in_slice: u16,
    pub slice_type: u8,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
    pub ref_pic_list0: [PictureH264; 32],
    pub ref_pic_list1: [PictureH264; 32],
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    pub luma_weight_l0_flag: bool,
    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i16; 32],
    pub chroma_weight_l0_flag: bool,
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i16; 2]; 32],
    pub luma_weight_l1_flag: bool,
    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i16; 32],
    pub chroma_weight_l1_flag: bool,
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i16; 2]; 32],
}

impl Default for SliceParameterBufferH264 {
    fn default() -> Self {
        Self {
            slice_data_size: 0,
            slice_data_offset: 0,
            slice_data_flag: VA_SLICE_DATA_FLAG_ALL,
            slice_data_bit_offset: 0,
            first_mb_in_slice: 0,
            slice_type: 0,
            direct_spatial_mv_pred_flag: false,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            cabac_init_idc: 0,
            slice_qp_delta: 0,
            disable_deblocking_filter_idc: 0,
            slice_alpha_c0_offset_div2: 0,
            slice_beta_offset_div2: 0,
            ref_pic_list0: [PictureH264::invalid(); 32],
            ref_pic_list1: [PictureH264::invalid(); 32],
            luma_log2_weight_denom: 0,
            chroma_log2_weight_denom: 0,
            luma_weight_l0_flag: false,
            luma_weight_l0: [0; 32],
            luma_offset_l0: [0; 32],
            chroma_weight_l0_flag: false,
            chroma_weight_l0: [[0; 2]; 32],
            chroma_offset_l0: [[0; 2]; 32],
            luma_weight_l1_flag: false,
            luma_weight_l1: [0; 32],
            luma_offset_l1: [0; 32],
            chroma_weight_l1_flag: false,
            chroma_weight_l1: [[0; 2]; 32],
            chroma_offset_l1: [[0; 2]; 32],
        }
    }
}

/// VAIQMatrixBufferH264, lists in raster order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IqMatrixBufferH264 {
    pub scaling_list4x4: [[u8; 16]; 6],
    pub scaling_list8x8: [[u8; 64]; 2],
}

impl Default for IqMatrixBufferH264 {
    fn default() -> Self {
        Self {
            scaling_list4x4: [[16; 16]; 6],
            scaling_list8x8: [[16; 64]; 2],
        }
    }
}

pub fn get_raster_from_zigzag_8x8(src: &[u8; 64], dst: &mut [u8; 64]) {
    for (i, value) in src.iter().enumerate() {
        dst[ZIGZAG_8X8[i]] = *value;
    }
}

pub fn get_raster_from_zigzag_4x4(src: &[u8; 16], dst: &mut [u8; 16]) {
    for (i, value) in src.iter().enumerate() {
        dst[ZIGZAG_4X4[i]] = *value;
    }
}

/// Describes `pic` as a VAPictureH264. When `as_frame` is set, a field is
/// described as the frame it belongs to, with both field order counts.
pub fn fill_va_h264_pic(pic: &PictureData, as_frame: bool) -> PictureH264 {
    let surface = match pic.surface_id() {
        Some(surface) if !pic.nonexisting => surface,
        _ => return PictureH264::invalid(),
    };

    let mut flags = 0;
    let frame_idx = if pic.is_long_term() {
        flags |= VA_PICTURE_H264_LONG_TERM_REFERENCE;
        pic.long_term_frame_idx
    } else {
        if pic.is_short_term() {
            flags |= VA_PICTURE_H264_SHORT_TERM_REFERENCE;
        }
        pic.frame_num
    };

    let mut top_field_order_cnt = pic.top_field_order_cnt.unwrap_or_default();
    let mut bottom_field_order_cnt = pic.bottom_field_order_cnt.unwrap_or_default();

    match pic.field {
        Field::Frame => (),
        Field::Top if !as_frame => {
            flags |= VA_PICTURE_H264_TOP_FIELD;
            bottom_field_order_cnt = 0;
        }
        Field::Bottom if !as_frame => {
            flags |= VA_PICTURE_H264_BOTTOM_FIELD;
            top_field_order_cnt = 0;
        }
        _ => (),
    }

    PictureH264 {
        picture_id: surface,
        frame_idx: frame_idx as u32,
        flags,
        top_field_order_cnt,
        bottom_field_order_cnt,
    }
}

/// The reference frame set, one entry per frame store holding a reference,
/// invalid entries after that.
fn fill_reference_frames(dpb: &Dpb) -> [PictureH264; 16] {
    let mut reference_frames = [PictureH264::invalid(); 16];

    let refs = dpb.reference_stores().filter_map(|store| {
        let store = store.borrow();
        if store.is_nonexisting() {
            return None;
        }

        let refs: Vec<_> = store
            .pictures()
            .iter()
            .filter(|p| p.borrow().is_ref())
            .cloned()
            .collect();

        // A single reference field is described as a field, otherwise as a
        // frame.
        match refs.as_slice() {
            [single] if store.pictures().len() > 1 || single.borrow().field != Field::Frame => {
                Some(fill_va_h264_pic(&single.borrow(), false))
            }
            [first, ..] => Some(fill_va_h264_pic(&first.borrow(), true)),
            [] => None,
        }
    });

    for (slot, pic) in reference_frames.iter_mut().zip(refs) {
        *slot = pic;
    }

    reference_frames
}

/// Fills the picture parameter buffer of `pic`.
pub fn fill_picture(
    pic: &PictureData,
    sps: &Sps,
    pps: &Pps,
    dpb: &Dpb,
) -> Result<PictureParameterBufferH264> {
    let seq_fields = SeqFields {
        chroma_format_idc: u32::from(sps.chroma_format_idc),
        residual_colour_transform_flag: sps.separate_colour_plane_flag,
        gaps_in_frame_num_value_allowed_flag: sps.gaps_in_frame_num_value_allowed_flag,
        frame_mbs_only_flag: sps.frame_mbs_only_flag,
        mb_adaptive_frame_field_flag: sps.mb_adaptive_frame_field_flag,
        direct_8x8_inference_flag: sps.direct_8x8_inference_flag,
        // A.3.3.2
        min_luma_bi_pred_size8x8: sps.level_idc > Level::L3_1,
        log2_max_frame_num_minus4: u32::from(sps.log2_max_frame_num_minus4),
        pic_order_cnt_type: u32::from(sps.pic_order_cnt_type),
        log2_max_pic_order_cnt_lsb_minus4: u32::from(sps.log2_max_pic_order_cnt_lsb_minus4),
        delta_pic_order_always_zero_flag: sps.delta_pic_order_always_zero_flag,
    };

    let pic_fields = PicFields {
        entropy_coding_mode_flag: pps.entropy_coding_mode_flag,
        weighted_pred_flag: pps.weighted_pred_flag,
        weighted_bipred_idc: u32::from(pps.weighted_bipred_idc),
        transform_8x8_mode_flag: pps.transform_8x8_mode_flag,
        field_pic_flag: pic.field != Field::Frame,
        constrained_intra_pred_flag: pps.constrained_intra_pred_flag,
        pic_order_present_flag: pps.bottom_field_pic_order_in_frame_present_flag,
        deblocking_filter_control_present_flag: pps.deblocking_filter_control_present_flag,
        redundant_pic_cnt_present_flag: pps.redundant_pic_cnt_present_flag,
        reference_pic_flag: pic.nal_ref_idc != 0,
    };

    Ok(PictureParameterBufferH264 {
        curr_pic: fill_va_h264_pic(pic, false),
        reference_frames: fill_reference_frames(dpb),
        picture_width_in_mbs_minus1: u16::try_from(sps.pic_width_in_mbs_minus1)?,
        picture_height_in_mbs_minus1: u16::try_from(sps.mb_height() - 1)?,
        bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
        bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
        num_ref_frames: u8::try_from(sps.max_num_ref_frames)?,
        seq_fields,
        // FMO is not supported.
        num_slice_groups_minus1: 0,
        slice_group_map_type: 0,
        slice_group_change_rate_minus1: 0,
        pic_init_qp_minus26: pps.pic_init_qp_minus26,
        pic_init_qs_minus26: pps.pic_init_qs_minus26,
        chroma_qp_index_offset: pps.chroma_qp_index_offset,
        second_chroma_qp_index_offset: pps.second_chroma_qp_index_offset,
        pic_fields,
        frame_num: u16::try_from(pic.frame_num)?,
    })
}

/// Fills the quantization matrices. 4:4:4 streams carry six 8x8 lists which
/// do not fit the buffer and are rejected.
pub fn fill_iq_matrix(sps: &Sps, pps: &Pps) -> Result<IqMatrixBufferH264> {
    if sps.chroma_format_idc == 3 {
        return Err(anyhow!(
            "4:4:4 scaling lists cannot be described to the accelerator"
        ));
    }

    let mut iq_matrix = IqMatrixBufferH264::default();

    for (src, dst) in pps
        .scaling_lists_4x4
        .iter()
        .zip(iq_matrix.scaling_list4x4.iter_mut())
    {
        get_raster_from_zigzag_4x4(src, dst);
    }

    for (src, dst) in pps
        .scaling_lists_8x8
        .iter()
        .zip(iq_matrix.scaling_list8x8.iter_mut())
    {
        get_raster_from_zigzag_8x8(src, dst);
    }

    Ok(iq_matrix)
}

fn fill_ref_pic_list(list: &[PictureRc], field_decoding: bool) -> [PictureH264; 32] {
    let mut va_pics = [PictureH264::invalid(); 32];

    for (slot, pic) in va_pics.iter_mut().zip(list) {
        *slot = fill_va_h264_pic(&pic.borrow(), !field_decoding);
    }

    va_pics
}

/// Copies the prediction weight tables of the slice, for the lists that use
/// explicit weighted prediction.
pub fn fill_pred_weight_table(
    slice_param: &mut SliceParameterBufferH264,
    slice: &Slice,
    sps: &Sps,
    pps: &Pps,
) {
    let hdr = &slice.header;
    let pwt = &hdr.pred_weight_table;

    let (fill_l0, fill_l1) = if pps.weighted_pred_flag
        && (hdr.slice_type.is_p() || hdr.slice_type.is_sp())
    {
        (true, false)
    } else if pps.weighted_bipred_idc == 1 && hdr.slice_type.is_b() {
        (true, true)
    } else {
        (false, false)
    };

    slice_param.luma_log2_weight_denom = pwt.luma_log2_weight_denom;
    slice_param.chroma_log2_weight_denom = pwt.chroma_log2_weight_denom;

    let has_chroma = sps.chroma_array_type != 0;

    if fill_l0 {
        let n = usize::from(hdr.num_ref_idx_l0_active_minus1) + 1;

        slice_param.luma_weight_l0_flag = true;
        slice_param.luma_weight_l0[..n].copy_from_slice(&pwt.luma_weight_l0[..n]);
        slice_param.luma_offset_l0[..n].copy_from_slice(&pwt.luma_offset_l0[..n]);

        slice_param.chroma_weight_l0_flag = has_chroma;
        if has_chroma {
            slice_param.chroma_weight_l0[..n].copy_from_slice(&pwt.chroma_weight_l0[..n]);
            slice_param.chroma_offset_l0[..n].copy_from_slice(&pwt.chroma_offset_l0[..n]);
        }
    }

    if fill_l1 {
        let n = usize::from(hdr.num_ref_idx_l1_active_minus1) + 1;

        slice_param.luma_weight_l1_flag = true;
        slice_param.luma_weight_l1[..n].copy_from_slice(&pwt.luma_weight_l1[..n]);
        slice_param.luma_offset_l1[..n].copy_from_slice(&pwt.luma_offset_l1[..n]);

        slice_param.chroma_weight_l1_flag = has_chroma;
        if has_chroma {
            slice_param.chroma_weight_l1[..n].copy_from_slice(&pwt.chroma_weight_l1[..n]);
            slice_param.chroma_offset_l1[..n].copy_from_slice(&pwt.chroma_offset_l1[..n]);
        }
    }
}

/// Bit offset of the first macroblock within the slice NAL unit, header
/// included. The parser counts emulation prevention bytes in the header
/// size, the accelerator does not.
pub fn slice_data_bit_offset(slice: &Slice) -> usize {
    let hdr = &slice.header;

    8 * slice.nalu.header.header_bytes + hdr.header_bit_size
        - 8 * hdr.n_emulation_prevention_bytes
}

/// Fills the slice parameter buffer of `slice` using the reference lists
/// built for it.
pub fn fill_slice(
    slice: &Slice,
    sps: &Sps,
    pps: &Pps,
    field_decoding: bool,
    ref_pic_list0: &[PictureRc],
    ref_pic_list1: &[PictureRc],
) -> Result<SliceParameterBufferH264> {
    let hdr = &slice.header;

    let mut slice_param = SliceParameterBufferH264 {
        slice_data_size: u32::try_from(slice.nalu.size())?,
        slice_data_offset: 0,
        slice_data_flag: VA_SLICE_DATA_FLAG_ALL,
        slice_data_bit_offset: u16::try_from(slice_data_bit_offset(slice))?,
        first_mb_in_slice: u16::try_from(hdr.first_mb_in_slice)?,
        slice_type: hdr.slice_type as u8,
        direct_spatial_mv_pred_flag: hdr.direct_spatial_mv_pred_flag,
        num_ref_idx_l0_active_minus1: hdr.num_ref_idx_l0_active_minus1,
        num_ref_idx_l1_active_minus1: hdr.num_ref_idx_l1_active_minus1,
        cabac_init_idc: hdr.cabac_init_idc,
        slice_qp_delta: hdr.slice_qp_delta,
        disable_deblocking_filter_idc: hdr.disable_deblocking_filter_idc,
        slice_alpha_c0_offset_div2: hdr.slice_alpha_c0_offset_div2,
        slice_beta_offset_div2: hdr.slice_beta_offset_div2,
        ref_pic_list0: fill_ref_pic_list(ref_pic_list0, field_decoding),
        ref_pic_list1: fill_ref_pic_list(ref_pic_list1, field_decoding),
        ..Default::default()
    };

    fill_pred_weight_table(&mut slice_param, slice, sps, pps);

    Ok(slice_param)
}
