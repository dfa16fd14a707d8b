// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Can't reasonably expect client code to consume everything that has been parsed.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use enumn::N;
use log::debug;

use crate::decoders::h264::nalu_reader::NaluReader;
use crate::Resolution;

const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const MAX_PPS_COUNT: u32 = 256;
const MAX_SPS_COUNT: u32 = 32;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
pub const DPB_MAX_SIZE: usize = 16;

#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum NaluType {
    /// Unspecified and reserved values.
    #[default]
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
    pub header_bytes: usize,
}

impl NaluHeader {
    pub fn parse(byte: u8) -> Result<Self> {
        if byte & 0x80 != 0 {
            return Err(anyhow!("Broken Data: forbidden_zero_bit is set"));
        }

        let type_ = NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown);
        let header_bytes = match type_ {
            NaluType::PrefixUnit | NaluType::SliceExt | NaluType::SliceDepth => 4,
            _ => 1,
        };

        Ok(NaluHeader {
            ref_idc: (byte & 0x60) >> 5,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
            header_bytes,
        })
    }
}

/// A NAL unit borrowed from the access unit it was found in. `data` starts at
/// the NAL header and excludes any start code or length prefix.
#[derive(Copy, Clone, Debug)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    pub data: &'a [u8],
    /// Offset of `data` within the access unit.
    pub offset: usize,
}

impl<'a> Nalu<'a> {
    pub fn new(data: &'a [u8], offset: usize) -> Result<Self> {
        let first = *data.first().ok_or_else(|| anyhow!("Broken Data: empty NAL unit"))?;
        let header = NaluHeader::parse(first)?;
        if data.len() < header.header_bytes {
            return Err(anyhow!("Broken Data: truncated NAL unit header"));
        }

        Ok(Nalu {
            header,
            data,
            offset,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The NAL payload, emulation prevention bytes included.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header.header_bytes..]
    }
}

#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

impl Level {
    /// MaxDpbMbs, Table A-1.
    fn max_dpb_mbs(&self) -> u32 {
        match self {
            Level::L1 | Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 | Level::L1_3 | Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 | Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 | Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 | Level::L5_2 => 184320,
            Level::L6 | Level::L6_1 | Level::L6_2 => 696320,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub cpb_cnt_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,
    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,
    pub pic_struct_present_flag: bool,
    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

/// A H264 Sequence Parameter Set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,
    pub level_idc: Level,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub seq_scaling_matrix_present_flag: bool,
    /// Scaling lists in zigzag order, as coded.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: [i32; 255],
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,

    // Derived values.
    pub chroma_array_type: u8,
    pub max_frame_num: u32,
    /// (7-12)
    pub expected_delta_per_pic_order_cnt_cycle: i32,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: Default::default(),
            profile_idc: Default::default(),
            constraint_set0_flag: Default::default(),
            constraint_set1_flag: Default::default(),
            constraint_set2_flag: Default::default(),
            constraint_set3_flag: Default::default(),
            constraint_set4_flag: Default::default(),
            constraint_set5_flag: Default::default(),
            level_idc: Default::default(),
            chroma_format_idc: 1,
            separate_colour_plane_flag: Default::default(),
            bit_depth_luma_minus8: Default::default(),
            bit_depth_chroma_minus8: Default::default(),
            qpprime_y_zero_transform_bypass_flag: Default::default(),
            seq_scaling_matrix_present_flag: Default::default(),
            scaling_lists_4x4: [[16; 16]; 6],
            scaling_lists_8x8: [[16; 64]; 6],
            log2_max_frame_num_minus4: Default::default(),
            pic_order_cnt_type: Default::default(),
            log2_max_pic_order_cnt_lsb_minus4: Default::default(),
            delta_pic_order_always_zero_flag: Default::default(),
            offset_for_non_ref_pic: Default::default(),
            offset_for_top_to_bottom_field: Default::default(),
            num_ref_frames_in_pic_order_cnt_cycle: Default::default(),
            offset_for_ref_frame: [0; 255],
            max_num_ref_frames: Default::default(),
            gaps_in_frame_num_value_allowed_flag: Default::default(),
            pic_width_in_mbs_minus1: Default::default(),
            pic_height_in_map_units_minus1: Default::default(),
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: Default::default(),
            direct_8x8_inference_flag: Default::default(),
            frame_cropping_flag: Default::default(),
            frame_crop_left_offset: Default::default(),
            frame_crop_right_offset: Default::default(),
            frame_crop_top_offset: Default::default(),
            frame_crop_bottom_offset: Default::default(),
            vui_parameters_present_flag: Default::default(),
            vui_parameters: Default::default(),
            chroma_array_type: 1,
            max_frame_num: 16,
            expected_delta_per_pic_order_cnt_cycle: Default::default(),
        }
    }
}

impl Sps {
    pub fn mb_width(&self) -> u32 {
        self.pic_width_in_mbs_minus1 + 1
    }

    /// Frame height in macroblocks.
    pub fn mb_height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 + 1) << u32::from(!self.frame_mbs_only_flag)
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub fn coded_resolution(&self) -> Resolution {
        Resolution {
            width: self.mb_width() * 16,
            height: self.mb_height() * 16,
        }
    }

    /// Resolution after applying the frame cropping window. See Table 6-1.
    pub fn display_resolution(&self) -> Resolution {
        let coded = self.coded_resolution();
        if !self.frame_cropping_flag {
            return coded;
        }

        let field_factor = 2 - u32::from(self.frame_mbs_only_flag);
        let (crop_unit_x, crop_unit_y) = if self.chroma_array_type == 0 {
            (1, field_factor)
        } else {
            let sub_width_c = if self.chroma_format_idc > 2 { 1 } else { 2 };
            let sub_height_c = if self.chroma_format_idc > 1 { 1 } else { 2 };
            (sub_width_c, sub_height_c * field_factor)
        };

        let crop_x = crop_unit_x * (self.frame_crop_left_offset + self.frame_crop_right_offset);
        let crop_y = crop_unit_y * (self.frame_crop_top_offset + self.frame_crop_bottom_offset);

        Resolution {
            width: coded.width.saturating_sub(crop_x),
            height: coded.height.saturating_sub(crop_y),
        }
    }

    /// Number of frames the DPB must be able to hold for this sequence.
    pub fn max_dpb_frames(&self) -> usize {
        let mut level = self.level_idc;

        // A.3.1 and A.3.2: Level 1b for Baseline, Constrained Baseline and Main
        // profile if level_idc == 11 and constraint_set3_flag == 1
        if level == Level::L1_1
            && matches!(self.profile_idc, 66 | 77 | 88)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        }

        let frame_mbs = self.mb_width() * self.mb_height();
        let max_dpb_frames =
            std::cmp::min(level.max_dpb_mbs() / frame_mbs, DPB_MAX_SIZE as u32) as usize;
        let max_dpb_frames = std::cmp::max(max_dpb_frames, self.max_num_ref_frames as usize);

        if self.vui_parameters_present_flag && self.vui_parameters.bitstream_restriction_flag {
            return std::cmp::max(1, self.vui_parameters.max_dec_frame_buffering as usize);
        }

        max_dpb_frames
    }
}

/// A H264 Picture Parameter Set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    /// Lookup key of the SPS this PPS belongs to.
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    /// Scaling lists in zigzag order, inherited from the SPS when absent.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],
    pub second_chroma_qp_index_offset: i8,
}

impl Default for Pps {
    fn default() -> Self {
        Self {
            pic_parameter_set_id: Default::default(),
            seq_parameter_set_id: Default::default(),
            entropy_coding_mode_flag: Default::default(),
            bottom_field_pic_order_in_frame_present_flag: Default::default(),
            num_slice_groups_minus1: Default::default(),
            num_ref_idx_l0_default_active_minus1: Default::default(),
            num_ref_idx_l1_default_active_minus1: Default::default(),
            weighted_pred_flag: Default::default(),
            weighted_bipred_idc: Default::default(),
            pic_init_qp_minus26: Default::default(),
            pic_init_qs_minus26: Default::default(),
            chroma_qp_index_offset: Default::default(),
            deblocking_filter_control_present_flag: Default::default(),
            constrained_intra_pred_flag: Default::default(),
            redundant_pic_cnt_present_flag: Default::default(),
            transform_8x8_mode_flag: Default::default(),
            pic_scaling_matrix_present_flag: Default::default(),
            scaling_lists_4x4: [[16; 16]; 6],
            scaling_lists_8x8: [[16; 64]; 6],
            second_chroma_qp_index_offset: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    pub abs_diff_pic_num_minus1: u32,
    pub long_term_pic_num: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i16; 32],
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i16; 2]; 32],
    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i16; 32],
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i16; 2]; 32],
}

/// One memory_management_control_operation with its arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkingOp {
    pub memory_management_control_operation: u8,
    pub difference_of_pic_nums_minus1: u32,
    pub long_term_pic_num: u32,
    pub long_term_frame_idx: u32,
    pub max_long_term_frame_idx_plus1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub inner: Vec<MarkingOp>,
}

impl RefPicMarking {
    pub fn has_mmco_5(&self) -> bool {
        self.adaptive_ref_pic_marking_mode_flag
            && self
                .inner
                .iter()
                .any(|op| op.memory_management_control_operation == 5)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u8,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,
    pub pred_weight_table: PredWeightTable,
    pub dec_ref_pic_marking: RefPicMarking,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    /// MaxPicNum, derived from frame_num and the field structure.
    pub max_pic_num: u32,
    /// Size of the slice header in bits, measured on the raw payload after
    /// the NAL header, emulation prevention bytes included.
    pub header_bit_size: usize,
    /// Emulation prevention bytes found while parsing the header.
    pub n_emulation_prevention_bytes: usize,
}

/// A parsed slice header along with the NAL unit carrying it.
#[derive(Clone, Debug)]
pub struct Slice<'a> {
    pub header: SliceHeader,
    pub nalu: Nalu<'a>,
}

/// Header of one SEI message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SeiMessage {
    pub payload_type: u32,
    pub payload_size: u32,
}

/// Parameter set tables. Parameter sets are indexed by id for slice lookup,
/// and the last successfully parsed ones are remembered for the decoder.
#[derive(Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,
    last_sps: Option<Rc<Sps>>,
    last_pps: Option<Rc<Pps>>,
}

impl Parser {
    fn fill_default_scaling_list_4x4(scaling_list4x4: &mut [u8; 16], i: usize) {
        // See table 7-2.
        if i < 3 {
            *scaling_list4x4 = DEFAULT_4X4_INTRA;
        } else {
            *scaling_list4x4 = DEFAULT_4X4_INTER;
        }
    }

    fn fill_default_scaling_list_8x8(scaling_list8x8: &mut [u8; 64], i: usize) {
        if i % 2 == 0 {
            *scaling_list8x8 = DEFAULT_8X8_INTRA;
        } else {
            *scaling_list8x8 = DEFAULT_8X8_INTER;
        }
    }

    fn fill_fallback_scaling_list_4x4(
        scaling_list4x4: &mut [[u8; 16]; 6],
        i: usize,
        default_scaling_list_intra: &[u8; 16],
        default_scaling_list_inter: &[u8; 16],
    ) {
        // See table 7-2.
        scaling_list4x4[i] = match i {
            0 => *default_scaling_list_intra,
            1 => scaling_list4x4[0],
            2 => scaling_list4x4[1],
            3 => *default_scaling_list_inter,
            4 => scaling_list4x4[3],
            _ => scaling_list4x4[4],
        }
    }

    fn fill_fallback_scaling_list_8x8(
        scaling_list8x8: &mut [[u8; 64]; 6],
        i: usize,
        default_scaling_list_intra: &[u8; 64],
        default_scaling_list_inter: &[u8; 64],
    ) {
        // See table 7-2.
        scaling_list8x8[i] = match i {
            0 => *default_scaling_list_intra,
            1 => *default_scaling_list_inter,
            _ => scaling_list8x8[i - 2],
        }
    }

    fn parse_scaling_list<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        scaling_list: &mut [u8],
        use_default: &mut bool,
    ) -> Result<()> {
        // 7.3.2.1.1.1
        let mut last_scale = 8;
        let mut next_scale = 8;

        for j in 0..scaling_list.len() {
            if next_scale != 0 {
                let delta_scale = r.read_se_bounded::<i32>(-128, 127)?;
                next_scale = (last_scale + delta_scale + 256) % 256;
                *use_default = j == 0 && next_scale == 0;
                if *use_default {
                    return Ok(());
                }
            }

            scaling_list[j] = if next_scale == 0 {
                u8::try_from(last_scale)?
            } else {
                u8::try_from(next_scale)?
            };

            last_scale = i32::from(scaling_list[j]);
        }

        Ok(())
    }

    fn parse_sps_scaling_lists<T: AsRef<[u8]>>(r: &mut NaluReader<T>, sps: &mut Sps) -> Result<()> {
        for i in 0..6 {
            if r.read_bit()? {
                let mut use_default = false;
                Parser::parse_scaling_list(r, &mut sps.scaling_lists_4x4[i], &mut use_default)?;
                if use_default {
                    Parser::fill_default_scaling_list_4x4(&mut sps.scaling_lists_4x4[i], i);
                }
            } else {
                Parser::fill_fallback_scaling_list_4x4(
                    &mut sps.scaling_lists_4x4,
                    i,
                    &DEFAULT_4X4_INTRA,
                    &DEFAULT_4X4_INTER,
                );
            }
        }

        let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
        for i in 0..num_8x8 {
            if r.read_bit()? {
                let mut use_default = false;
                Parser::parse_scaling_list(r, &mut sps.scaling_lists_8x8[i], &mut use_default)?;
                if use_default {
                    Parser::fill_default_scaling_list_8x8(&mut sps.scaling_lists_8x8[i], i);
                }
            } else {
                Parser::fill_fallback_scaling_list_8x8(
                    &mut sps.scaling_lists_8x8,
                    i,
                    &DEFAULT_8X8_INTRA,
                    &DEFAULT_8X8_INTER,
                );
            }
        }

        Ok(())
    }

    fn parse_pps_scaling_lists<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        pps: &mut Pps,
        sps: &Sps,
    ) -> Result<()> {
        for i in 0..6 {
            if r.read_bit()? {
                let mut use_default = false;
                Parser::parse_scaling_list(r, &mut pps.scaling_lists_4x4[i], &mut use_default)?;
                if use_default {
                    Parser::fill_default_scaling_list_4x4(&mut pps.scaling_lists_4x4[i], i);
                }
            } else if !sps.seq_scaling_matrix_present_flag {
                // Table 7-2: Fallback rule A
                Parser::fill_fallback_scaling_list_4x4(
                    &mut pps.scaling_lists_4x4,
                    i,
                    &DEFAULT_4X4_INTRA,
                    &DEFAULT_4X4_INTER,
                );
            } else {
                // Table 7-2: Fallback rule B
                Parser::fill_fallback_scaling_list_4x4(
                    &mut pps.scaling_lists_4x4,
                    i,
                    &sps.scaling_lists_4x4[0],
                    &sps.scaling_lists_4x4[3],
                );
            }
        }

        if pps.transform_8x8_mode_flag {
            let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };

            for i in 0..num_8x8 {
                if r.read_bit()? {
                    let mut use_default = false;
                    Parser::parse_scaling_list(r, &mut pps.scaling_lists_8x8[i], &mut use_default)?;
                    if use_default {
                        Parser::fill_default_scaling_list_8x8(&mut pps.scaling_lists_8x8[i], i);
                    }
                } else if !sps.seq_scaling_matrix_present_flag {
                    // Table 7-2: Fallback rule A
                    Parser::fill_fallback_scaling_list_8x8(
                        &mut pps.scaling_lists_8x8,
                        i,
                        &DEFAULT_8X8_INTRA,
                        &DEFAULT_8X8_INTER,
                    );
                } else {
                    // Table 7-2: Fallback rule B
                    Parser::fill_fallback_scaling_list_8x8(
                        &mut pps.scaling_lists_8x8,
                        i,
                        &sps.scaling_lists_8x8[0],
                        &sps.scaling_lists_8x8[1],
                    );
                }
            }
        }

        Ok(())
    }

    fn parse_hrd<T: AsRef<[u8]>>(r: &mut NaluReader<T>, hrd: &mut HrdParams) -> Result<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    fn parse_vui<T: AsRef<[u8]>>(r: &mut NaluReader<T>, vui: &mut VuiParams) -> Result<()> {
        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits::<u32>(31)? << 1;
            vui.num_units_in_tick |= u32::from(r.read_bit()?);
            if vui.num_units_in_tick == 0 {
                return Err(anyhow!(
                    "num_units_in_tick == 0, which is not allowed by E.2.1"
                ));
            }

            vui.time_scale = r.read_bits::<u32>(31)? << 1;
            vui.time_scale |= u32::from(r.read_bit()?);
            if vui.time_scale == 0 {
                return Err(anyhow!("time_scale == 0, which is not allowed by E.2.1"));
            }

            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit()?;
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters)?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit()?;
        }

        vui.pic_struct_present_flag = r.read_bit()?;
        vui.bitstream_restriction_flag = r.read_bit()?;

        if vui.bitstream_restriction_flag {
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.max_bytes_per_pic_denom = r.read_ue()?;
            vui.max_bits_per_mb_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
            vui.max_num_reorder_frames = r.read_ue()?;
            vui.max_dec_frame_buffering = r.read_ue()?;
        }

        Ok(())
    }

    pub fn parse_sps(&mut self, nalu: &Nalu) -> Result<Rc<Sps>> {
        let mut r = NaluReader::new(nalu.payload());
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // skip reserved_zero_2bits
        r.skip_bits(2)?;

        let level: u8 = r.read_bits(8)?;
        sps.level_idc = Level::n(level).with_context(|| format!("Unsupported level {}", level))?;
        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT - 1)?;

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                Parser::parse_sps_scaling_lists(&mut r, &mut sps)?;
            }
        }

        sps.chroma_array_type = if sps.separate_colour_plane_flag {
            0
        } else {
            sps.chroma_format_idc
        };

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;
        sps.max_frame_num = 1 << (sps.log2_max_frame_num_minus4 + 4);

        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            sps.num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(255)?;

            let mut offset_acc = 0i32;
            for i in 0..usize::from(sps.num_ref_frames_in_pic_order_cnt_cycle) {
                sps.offset_for_ref_frame[i] = r.read_se()?;

                // (7-12)
                offset_acc = offset_acc.wrapping_add(sps.offset_for_ref_frame[i]);
            }

            sps.expected_delta_per_pic_order_cnt_cycle = offset_acc;
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue_max(1023)?;
        sps.pic_height_in_map_units_minus1 = r.read_ue_max(1023)?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps.vui_parameters)?;
        }

        debug!(
            "SPS {}: profile {} level {:?}, {}x{} MBs",
            sps.seq_parameter_set_id,
            sps.profile_idc,
            sps.level_idc,
            sps.mb_width(),
            sps.mb_height()
        );

        let sps = Rc::new(sps);
        self.active_spses
            .insert(sps.seq_parameter_set_id, Rc::clone(&sps));
        self.last_sps = Some(Rc::clone(&sps));

        Ok(sps)
    }

    pub fn parse_pps(&mut self, nalu: &Nalu) -> Result<Rc<Pps>> {
        let mut r = NaluReader::new(nalu.payload());
        let mut pps = Pps {
            pic_parameter_set_id: r.read_ue_max(MAX_PPS_COUNT - 1)?,
            seq_parameter_set_id: r.read_ue_max(MAX_SPS_COUNT - 1)?,
            ..Default::default()
        };

        let sps = self.get_sps(pps.seq_parameter_set_id).context(
            "Broken stream: stream references a SPS that has not been successfully parsed",
        )?;

        pps.entropy_coding_mode_flag = r.read_bit()?;
        pps.bottom_field_pic_order_in_frame_present_flag = r.read_bit()?;
        pps.num_slice_groups_minus1 = r.read_ue_max(7)?;

        if pps.num_slice_groups_minus1 > 0 {
            return Err(anyhow!("Stream contain unsupported/unimplemented NALs"));
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;

        let qp_bd_offset_y = i32::from(6 * (sps.bit_depth_luma_minus8));
        pps.pic_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;

        pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;

        // When second_chroma_qp_index_offset is not present, it shall be
        // inferred to be equal to chroma_qp_index_offset.
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        // The inherited lists are the starting point of the fallback rules.
        pps.scaling_lists_4x4 = sps.scaling_lists_4x4;
        pps.scaling_lists_8x8 = sps.scaling_lists_8x8;

        if r.has_more_rsbp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                Parser::parse_pps_scaling_lists(&mut r, &mut pps, &sps)?;
            }

            pps.second_chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        }

        debug!(
            "PPS {} (SPS {})",
            pps.pic_parameter_set_id, pps.seq_parameter_set_id
        );

        let pps = Rc::new(pps);
        self.active_ppses
            .insert(pps.pic_parameter_set_id, Rc::clone(&pps));
        self.last_pps = Some(Rc::clone(&pps));

        Ok(pps)
    }

    fn parse_ref_pic_list_modification<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        ref_list_mods: &mut Vec<RefPicListModification>,
    ) -> Result<()> {
        loop {
            let mut pic_num_mod = RefPicListModification {
                modification_of_pic_nums_idc: r.read_ue_max(3)?,
                ..Default::default()
            };

            match pic_num_mod.modification_of_pic_nums_idc {
                0 | 1 => {
                    pic_num_mod.abs_diff_pic_num_minus1 = r.read_ue()?;
                }
                2 => {
                    pic_num_mod.long_term_pic_num = r.read_ue()?;
                }
                _ => break,
            }

            // At most num_ref_idx_lX_active_minus1 + 1 modifications plus the
            // terminating one.
            if ref_list_mods.len() >= 32 {
                return Err(anyhow!("Broken Data: too many reference list modifications"));
            }

            ref_list_mods.push(pic_num_mod);
        }

        Ok(())
    }

    fn parse_ref_pic_list_modifications<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        header: &mut SliceHeader,
    ) -> Result<()> {
        if !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.ref_pic_list_modification_flag_l0 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l0 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    &mut header.ref_pic_list_modification_l0,
                )?;
            }
        }

        if header.slice_type.is_b() {
            header.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l1 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    &mut header.ref_pic_list_modification_l1,
                )?;
            }
        }

        Ok(())
    }

    fn parse_pred_weight_table<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        sps: &Sps,
        header: &mut SliceHeader,
    ) -> Result<()> {
        let pt = &mut header.pred_weight_table;
        pt.luma_log2_weight_denom = r.read_ue_max(7)?;

        // When luma_weight_lX_flag is equal to 0, luma_weight_lX[i] shall be
        // inferred to be equal to 2 ^ luma_log2_weight_denom.
        let default_luma_weight = 1 << pt.luma_log2_weight_denom;
        for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
            pt.luma_weight_l0[i] = default_luma_weight;
        }

        if header.slice_type.is_b() {
            for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
                pt.luma_weight_l1[i] = default_luma_weight;
            }
        }

        if sps.chroma_array_type != 0 {
            pt.chroma_log2_weight_denom = r.read_ue_max(7)?;
            let default_chroma_weight = 1 << pt.chroma_log2_weight_denom;

            for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
                pt.chroma_weight_l0[i] = [default_chroma_weight; 2];
            }

            if header.slice_type.is_b() {
                for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
                    pt.chroma_weight_l1[i] = [default_chroma_weight; 2];
                }
            }
        }

        for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
            if r.read_bit()? {
                pt.luma_weight_l0[i] = r.read_se_bounded(-128, 127)?;
                pt.luma_offset_l0[i] = r.read_se_bounded(-128, 127)?;
            }

            if sps.chroma_array_type != 0 && r.read_bit()? {
                for j in 0..2 {
                    pt.chroma_weight_l0[i][j] = r.read_se_bounded(-128, 127)?;
                    pt.chroma_offset_l0[i][j] = r.read_se_bounded(-128, 127)?;
                }
            }
        }

        if header.slice_type.is_b() {
            for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
                if r.read_bit()? {
                    pt.luma_weight_l1[i] = r.read_se_bounded(-128, 127)?;
                    pt.luma_offset_l1[i] = r.read_se_bounded(-128, 127)?;
                }

                if sps.chroma_array_type != 0 && r.read_bit()? {
                    for j in 0..2 {
                        pt.chroma_weight_l1[i][j] = r.read_se_bounded(-128, 127)?;
                        pt.chroma_offset_l1[i][j] = r.read_se_bounded(-128, 127)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_dec_ref_pic_marking<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        idr_pic_flag: bool,
        rpm: &mut RefPicMarking,
    ) -> Result<()> {
        if idr_pic_flag {
            rpm.no_output_of_prior_pics_flag = r.read_bit()?;
            rpm.long_term_reference_flag = r.read_bit()?;
            return Ok(());
        }

        rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;
        if !rpm.adaptive_ref_pic_marking_mode_flag {
            return Ok(());
        }

        loop {
            let mut marking = MarkingOp {
                memory_management_control_operation: r.read_ue_max(6)?,
                ..Default::default()
            };

            let op = marking.memory_management_control_operation;
            if op == 0 {
                break;
            }

            if op == 1 || op == 3 {
                marking.difference_of_pic_nums_minus1 = r.read_ue()?;
            }

            if op == 2 {
                marking.long_term_pic_num = r.read_ue()?;
            }

            if op == 3 || op == 6 {
                marking.long_term_frame_idx = r.read_ue()?;
            }

            if op == 4 {
                marking.max_long_term_frame_idx_plus1 = r.read_ue()?;
            }

            if rpm.inner.len() >= 66 {
                return Err(anyhow!("Broken Data: too many marking operations"));
            }

            rpm.inner.push(marking);
        }

        Ok(())
    }

    pub fn parse_slice_header<'a>(&self, nalu: Nalu<'a>) -> Result<Slice<'a>> {
        if !matches!(nalu.header.type_, NaluType::Slice | NaluType::SliceIdr) {
            return Err(anyhow!(
                "Stream contain unsupported/unimplemented NALs: {:?}",
                nalu.header.type_
            ));
        }

        let mut r = NaluReader::new(nalu.payload());

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = r.read_ue_max::<u8>(9)? % 5;
        header.slice_type = SliceType::n(slice_type)
            .with_context(|| format!("Invalid slice type {}", slice_type))?;

        header.pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT - 1)?;

        let pps = self.get_pps(header.pic_parameter_set_id).context(
            "Broken stream: slice references PPS that has not been successfully parsed.",
        )?;

        let sps = self.get_sps(pps.seq_parameter_set_id).context(
            "Broken stream: slice's PPS references SPS that has not been successfully parsed.",
        )?;

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        header.max_pic_num = if header.field_pic_flag {
            2 * sps.max_frame_num
        } else {
            sps.max_frame_num
        };

        if nalu.header.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            header.redundant_pic_cnt = r.read_ue_max(127)?;
        }

        if header.slice_type.is_b() {
            header.direct_spatial_mv_pred_flag = r.read_bit()?;
        }

        if header.slice_type.is_p() || header.slice_type.is_sp() || header.slice_type.is_b() {
            header.num_ref_idx_active_override_flag = r.read_bit()?;
            if header.num_ref_idx_active_override_flag {
                header.num_ref_idx_l0_active_minus1 = r.read_ue_max(31)?;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = r.read_ue_max(31)?;
                }
            } else {
                header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                }
            }
        }

        let max_active_minus1 = if header.field_pic_flag { 31 } else { 15 };
        if header.num_ref_idx_l0_active_minus1 > max_active_minus1
            || header.num_ref_idx_l1_active_minus1 > max_active_minus1
        {
            return Err(anyhow!("Broken Data: num_ref_idx_active_minus1 out of range"));
        }

        Parser::parse_ref_pic_list_modifications(&mut r, &mut header)?;

        if (pps.weighted_pred_flag && (header.slice_type.is_p() || header.slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && header.slice_type.is_b())
        {
            Parser::parse_pred_weight_table(&mut r, &sps, &mut header)?;
        }

        if nalu.header.ref_idc != 0 {
            Parser::parse_dec_ref_pic_marking(
                &mut r,
                nalu.header.idr_pic_flag,
                &mut header.dec_ref_pic_marking,
            )?;
        }

        if pps.entropy_coding_mode_flag && !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.cabac_init_idc = r.read_ue_max(2)?;
        }

        header.slice_qp_delta = r.read_se_bounded(-87, 77)?;

        if header.slice_type.is_sp() || header.slice_type.is_si() {
            if header.slice_type.is_sp() {
                header.sp_for_switch_flag = r.read_bit()?;
            }

            header.slice_qs_delta = r.read_se_bounded(-51, 51)?;
        }

        if pps.deblocking_filter_control_present_flag {
            header.disable_deblocking_filter_idc = r.read_ue_max(2)?;

            if header.disable_deblocking_filter_idc != 1 {
                header.slice_alpha_c0_offset_div2 = r.read_se_bounded(-6, 6)?;
                header.slice_beta_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        header.header_bit_size = r.position();
        header.n_emulation_prevention_bytes = r.num_epb();

        Ok(Slice { header, nalu })
    }

    /// Walks the SEI messages of `nalu`. Payloads are skipped.
    pub fn parse_sei(&self, nalu: &Nalu) -> Result<Vec<SeiMessage>> {
        let mut r = NaluReader::new(nalu.payload());
        let mut messages = vec![];

        while r.has_more_rsbp_data() {
            let mut payload_type = 0u32;
            loop {
                let byte: u32 = r.read_bits(8)?;
                payload_type += byte;
                if byte != 0xff {
                    break;
                }
            }

            let mut payload_size = 0u32;
            loop {
                let byte: u32 = r.read_bits(8)?;
                payload_size += byte;
                if byte != 0xff {
                    break;
                }
            }

            r.skip_bits(payload_size as usize * 8)
                .context("Broken Data: SEI payload exceeds the NAL unit")?;

            messages.push(SeiMessage {
                payload_type,
                payload_size,
            });
        }

        Ok(messages)
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<Rc<Sps>> {
        self.active_spses.get(&sps_id).cloned()
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<Rc<Pps>> {
        self.active_ppses.get(&pps_id).cloned()
    }

    /// The SPS most recently parsed successfully.
    pub fn last_sps(&self) -> Option<&Rc<Sps>> {
        self.last_sps.as_ref()
    }

    /// The PPS most recently parsed successfully.
    pub fn last_pps(&self) -> Option<&Rc<Pps>> {
        self.last_pps.as_ref()
    }

    /// Number of distinct SPSs and PPSs known.
    pub fn num_parameter_sets(&self) -> (usize, usize) {
        (self.active_spses.len(), self.active_ppses.len())
    }
}
