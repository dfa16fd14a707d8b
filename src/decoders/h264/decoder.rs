// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::rc::Rc;

use anyhow::anyhow;
use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;

use crate::config::DecoderConfig;
use crate::config::StreamFormat;
use crate::decoders::h264::backends::params;
use crate::decoders::h264::backends::ContextParams;
use crate::decoders::h264::backends::PictureBuffers;
use crate::decoders::h264::backends::Profile;
use crate::decoders::h264::backends::StatelessDecoderBackend;
use crate::decoders::h264::demuxer::parse_avcc;
use crate::decoders::h264::demuxer::Demuxer;
use crate::decoders::h264::demuxer::NalFormat;
use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::frame_store::FrameStore;
use crate::decoders::h264::frame_store::FrameStoreRef;
use crate::decoders::h264::parser::Nalu;
use crate::decoders::h264::parser::NaluHeader;
use crate::decoders::h264::parser::NaluType;
use crate::decoders::h264::parser::Parser;
use crate::decoders::h264::parser::Pps;
use crate::decoders::h264::parser::Slice;
use crate::decoders::h264::parser::SliceHeader;
use crate::decoders::h264::parser::Sps;
use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::PictureData;
use crate::decoders::h264::picture::PictureRc;
use crate::decoders::h264::poc;
use crate::decoders::h264::poc::PocInput;
use crate::decoders::h264::poc::PocState;
use crate::decoders::DecodeError;
use crate::decoders::DecodeStatus;
use crate::decoders::DecodedPicture;
use crate::decoders::Result;
use crate::decoders::StatelessBackendError;
use crate::decoders::SurfacePoolHandle;
use crate::decoders::VideoDecoder;
use crate::ChromaFormat;

/// Whether the decoder has an accelerator context, and with which
/// parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum ContextState {
    #[default]
    NoContext,
    Active(ContextParams),
}

/// The picture slices are being accumulated into.
struct CurrentPicture {
    picture: PictureRc,
    buffers: PictureBuffers,
    sps: Rc<Sps>,
    pps: Rc<Pps>,
    /// Header of the last slice added, new slices are compared against it.
    last_slice: SliceHeader,
    last_nalu_header: NaluHeader,
}

/// A picture ready to be handed to the client, ordered so that the lowest
/// (epoch, POC) is at the top of a `BinaryHeap`.
struct ReadyPicture {
    /// Incremented on every IDR and MMCO 5, after which POCs restart.
    epoch: u64,
    pic_order_cnt: i32,
    /// Insertion order, to break ties.
    seq: u64,
    picture: DecodedPicture,
}

impl ReadyPicture {
    fn key(&self) -> (u64, i32, u64) {
        (self.epoch, self.pic_order_cnt, self.seq)
    }
}

impl PartialEq for ReadyPicture {
    fn eq(&self, other: &Self) -> bool {
        self.key().eq(&other.key())
    }
}

impl Eq for ReadyPicture {}

impl PartialOrd for ReadyPicture {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyPicture {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // We reverse the order because we want the picture with the lowest order to be at the top
        // of the `BinaryHeap`.
        other.key().cmp(&self.key())
    }
}

/// Decides whether the slice with header `hdr` starts a new picture, given
/// the last slice of the picture currently open, if any. See 7.4.1.2.4.
pub fn is_new_picture(
    cur: Option<(&SliceHeader, &NaluHeader)>,
    hdr: &SliceHeader,
    nalu_hdr: &NaluHeader,
    sps: &Sps,
) -> bool {
    let (prev, prev_nalu_hdr) = match cur {
        Some(cur) => cur,
        None => return true,
    };

    if prev.frame_num != hdr.frame_num {
        return true;
    }

    if prev.pic_parameter_set_id != hdr.pic_parameter_set_id {
        return true;
    }

    if prev.field_pic_flag != hdr.field_pic_flag {
        return true;
    }

    if prev.field_pic_flag && prev.bottom_field_flag != hdr.bottom_field_flag {
        return true;
    }

    if (prev_nalu_hdr.ref_idc == 0) != (nalu_hdr.ref_idc == 0) {
        return true;
    }

    match sps.pic_order_cnt_type {
        0 => {
            if prev.pic_order_cnt_lsb != hdr.pic_order_cnt_lsb
                || prev.delta_pic_order_cnt_bottom != hdr.delta_pic_order_cnt_bottom
            {
                return true;
            }
        }
        1 => {
            if prev.delta_pic_order_cnt != hdr.delta_pic_order_cnt {
                return true;
            }
        }
        _ => (),
    }

    if prev_nalu_hdr.idr_pic_flag != nalu_hdr.idr_pic_flag {
        return true;
    }

    prev_nalu_hdr.idr_pic_flag && prev.idr_pic_id != hdr.idr_pic_id
}

fn backend_error(e: StatelessBackendError) -> DecodeError {
    match e {
        StatelessBackendError::OutOfResources => {
            DecodeError::MemoryFail(anyhow!("the accelerator ran out of surfaces"))
        }
        e => DecodeError::StatelessBackendError(e),
    }
}

pub struct Decoder<B: StatelessDecoderBackend> {
    /// A parser to extract bitstream metadata
    parser: Parser,
    /// The backend used for hardware acceleration.
    backend: B,
    config: DecoderConfig,
    /// How access units are split into NAL units.
    nal_format: NalFormat,
    context: ContextState,
    /// Surfaces whose last holder is gone, to be given back to the backend.
    surface_pool: SurfacePoolHandle,

    /// The decoded picture buffer
    dpb: Dpb,

    poc_state: PocState,
    /// frame_num of the current picture.
    frame_num: i32,
    /// frame_num of the previous picture, prevFrameNum.
    prev_frame_num: i32,
    /// frame_num of the previous reference picture, PrevRefFrameNum.
    prev_ref_frame_num: i32,

    got_sps: bool,
    got_pps: bool,

    /// The current picture being worked on.
    cur_pic: Option<CurrentPicture>,
    /// Store holding a first field waiting for its second field.
    prev_frame: Option<FrameStoreRef>,

    /// Number of interlaced pictures seen, the first one is logged.
    interlaced_pictures: u64,

    /// Pictures that left the DPB, lowest order at the top.
    ready_queue: BinaryHeap<ReadyPicture>,
    epoch: u64,
    seq: u64,
}

impl<B: StatelessDecoderBackend> Decoder<B> {
    // Creates a new instance of the decoder.
    pub fn new(backend: B, config: DecoderConfig) -> Self {
        let nal_format = match config.stream_format {
            StreamFormat::Avc => NalFormat::Avc {
                length_size: config.nal_length_size,
            },
            StreamFormat::Auto | StreamFormat::AnnexB => NalFormat::AnnexB,
        };

        Self {
            parser: Default::default(),
            backend,
            config,
            nal_format,
            context: Default::default(),
            surface_pool: SurfacePoolHandle::new(),
            dpb: Default::default(),
            poc_state: PocState::new(0),
            frame_num: 0,
            prev_frame_num: 0,
            prev_ref_frame_num: 0,
            got_sps: false,
            got_pps: false,
            cur_pic: None,
            prev_frame: None,
            interlaced_pictures: 0,
            ready_queue: Default::default(),
            epoch: 0,
            seq: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn nal_format(&self) -> NalFormat {
        self.nal_format
    }

    /// Gives the surfaces nothing holds anymore back to the backend.
    fn recycle_surfaces(&mut self) {
        for surface in self.surface_pool.take_released() {
            trace!("Surface {} is free again", surface);
            self.backend.release_surface(surface);
        }
    }

    /// Moves the stores bumped out of the DPB to the ready queue.
    fn collect_output(&mut self) {
        for store in self.dpb.take_output() {
            let store = store.borrow();
            if store.is_nonexisting() {
                continue;
            }

            let surface = match store.surface() {
                Some(surface) => surface,
                None => continue,
            };

            let first = store.first().borrow();
            let pic_order_cnt = store.pic_order_cnt();

            trace!("Picture with POC {} is ready for output", pic_order_cnt);

            self.ready_queue.push(ReadyPicture {
                epoch: self.epoch,
                pic_order_cnt,
                seq: self.seq,
                picture: DecodedPicture {
                    surface,
                    pic_order_cnt,
                    timestamp: first.timestamp,
                    coded_resolution: first.coded_resolution,
                    display_resolution: first.display_resolution,
                    interlaced: store.is_interlaced(),
                },
            });
            self.seq += 1;
        }
    }

    /// Creates or recreates the accelerator context if the stream parameters
    /// changed. Returns whether the format changed.
    fn ensure_context(&mut self, sps: &Sps, pps: &Pps) -> Result<bool> {
        let params = ContextParams {
            profile: Profile::from_parameter_sets(sps, pps),
            resolution: sps.coded_resolution(),
            num_surfaces: sps.max_dpb_frames() + self.config.extra_surfaces,
            chroma: ChromaFormat::from_chroma_format_idc(sps.chroma_format_idc),
        };

        match self.context {
            ContextState::Active(current) if current == params => return Ok(false),
            ContextState::Active(current) => {
                info!("Stream format changed from {:?} to {:?}", current, params);

                self.dpb.drain_dpb();
                self.collect_output();

                self.backend.reconfigure(&params).map_err(backend_error)?;
            }
            ContextState::NoContext => {
                info!("Starting decoding context with {:?}", params);

                self.backend.start(&params).map_err(backend_error)?;
            }
        }

        // The surfaces of the previous context are gone with it.
        self.surface_pool.new_generation();

        self.dpb.reset_dpb(sps);
        self.prev_frame = None;
        self.context = ContextState::Active(params);

        Ok(true)
    }

    /// 8.2.5.2: fills the frame_num gap up to `frame_num` with non-existing
    /// frames.
    fn handle_frame_num_gap(&mut self, frame_num: i32, sps: &Sps, timestamp: u64) -> Result<()> {
        if self.dpb.stores().is_empty() {
            return Ok(());
        }

        if !sps.gaps_in_frame_num_value_allowed_flag {
            warn!(
                "frame_num jumps from {} to {}, some pictures were lost",
                self.prev_ref_frame_num, frame_num
            );
            return Ok(());
        }

        debug!(
            "frame_num gap detected between {} and {}",
            self.prev_ref_frame_num, frame_num
        );

        let max_frame_num = sps.max_frame_num as i32;
        let mut unused_short_term_frame_num = (self.prev_ref_frame_num + 1) % max_frame_num;

        while unused_short_term_frame_num != frame_num {
            let mut pic = PictureData::new_non_existing(unused_short_term_frame_num, timestamp);
            pic.coded_resolution = sps.coded_resolution();
            pic.display_resolution = sps.display_resolution();

            // With POC type 0 the order of non-existing frames is unknown, and
            // they do not update the POC state.
            if sps.pic_order_cnt_type != 0 {
                let input = PocInput {
                    is_ref: true,
                    field: Field::Frame,
                    frame_num: unused_short_term_frame_num,
                    prev_frame_num: self.prev_frame_num,
                    ..Default::default()
                };

                let (order, next) = poc::compute(self.poc_state, sps, &input);
                pic.top_field_order_cnt = order.top;
                pic.bottom_field_order_cnt = order.bottom;
                pic.pic_order_cnt = order.pic_order_cnt();
                self.poc_state = next;
            }

            self.dpb
                .exec_dummy_picture_marking(&pic, sps)
                .map_err(DecodeError::Fail)?;
            self.dpb
                .add_dummy_picture(pic, !sps.frame_mbs_only_flag)
                .map_err(DecodeError::Fail)?;

            self.prev_frame_num = unused_short_term_frame_num;
            self.prev_ref_frame_num = unused_short_term_frame_num;

            unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
        }

        self.collect_output();

        Ok(())
    }

    /// Returns the first field the slice `hdr` completes, if any.
    fn find_first_field(&mut self, hdr: &SliceHeader) -> Option<PictureRc> {
        let store = self.prev_frame.as_ref()?;
        let first = Rc::clone(store.borrow().first());

        let parity = if hdr.bottom_field_flag {
            Field::Bottom
        } else {
            Field::Top
        };

        let matches = {
            let f = first.borrow();
            hdr.field_pic_flag
                && !f.nonexisting
                && f.frame_num == i32::from(hdr.frame_num)
                && f.field.opposite() == Some(parity)
        };

        if matches {
            Some(first)
        } else {
            debug!(
                "Field with frame_num {} stays unpaired",
                first.borrow().frame_num
            );
            self.prev_frame = None;
            None
        }
    }

    /// Starts a new picture from its first slice.
    fn decode_picture(
        &mut self,
        slice: &Slice,
        sps: Rc<Sps>,
        pps: Rc<Pps>,
        timestamp: u64,
    ) -> Result<()> {
        let hdr = &slice.header;
        let nalu_hdr = &slice.nalu.header;
        let frame_num = i32::from(hdr.frame_num);

        if nalu_hdr.idr_pic_flag {
            // C.4.4
            if hdr.dec_ref_pic_marking.no_output_of_prior_pics_flag {
                debug!("IDR drops the prior pictures without output");
                self.dpb.clear_dpb();
            } else {
                self.dpb.flush_dpb();
                self.collect_output();
            }

            self.epoch += 1;
            self.prev_frame = None;
            self.prev_ref_frame_num = 0;
        } else if frame_num != self.prev_ref_frame_num
            && frame_num != (self.prev_ref_frame_num + 1) % sps.max_frame_num as i32
        {
            self.handle_frame_num_gap(frame_num, &sps, timestamp)?;
        }

        let picture = match self.find_first_field(hdr) {
            Some(first_field) => {
                PictureData::new_second_field(&first_field, slice, &sps, timestamp)
            }
            None => {
                self.recycle_surfaces();
                let surface = self.backend.new_surface().map_err(backend_error)?;
                Rc::new(RefCell::new(PictureData::new_from_slice(
                    slice,
                    &sps,
                    Some(self.surface_pool.wrap(surface)),
                    timestamp,
                )))
            }
        };

        {
            let mut pic = picture.borrow_mut();
            pic.interlaced |= !sps.frame_mbs_only_flag;

            let input = PocInput::from_slice(
                hdr,
                nalu_hdr.idr_pic_flag,
                nalu_hdr.ref_idc != 0,
                pic.field,
                self.prev_frame_num,
            );
            let (order, next) = poc::compute(self.poc_state, &sps, &input);

            pic.top_field_order_cnt = order.top;
            pic.bottom_field_order_cnt = order.bottom;
            pic.pic_order_cnt = order.pic_order_cnt();
            self.poc_state = next;

            if pic.interlaced {
                if self.interlaced_pictures == 0 {
                    info!("Interlaced stream, fields are stored separately in the DPB");
                }
                self.interlaced_pictures += 1;
            }

            debug!(
                "Decode picture frame_num {} ({:?}) POC {}",
                frame_num, pic.field, pic.pic_order_cnt
            );
        }

        self.frame_num = frame_num;
        self.prev_frame_num = frame_num;
        if nalu_hdr.ref_idc != 0 {
            self.prev_ref_frame_num = frame_num;
        }

        let picture_buffer = params::fill_picture(&picture.borrow(), &sps, &pps, &self.dpb)
            .map_err(DecodeError::Fail)?;
        let iq_matrix = params::fill_iq_matrix(&sps, &pps).map_err(DecodeError::Fail)?;

        self.cur_pic = Some(CurrentPicture {
            picture,
            buffers: PictureBuffers {
                picture: picture_buffer,
                iq_matrix,
                slices: vec![],
            },
            sps,
            pps,
            last_slice: hdr.clone(),
            last_nalu_header: *nalu_hdr,
        });

        Ok(())
    }

    /// Builds the reference lists of `slice` and adds its parameters to the
    /// current picture.
    fn decode_slice(&mut self, slice: &Slice) -> Result<()> {
        let cur = self
            .cur_pic
            .as_mut()
            .ok_or_else(|| DecodeError::Fail(anyhow!("slice without a picture")))?;

        self.dpb
            .init_picture_refs(&cur.picture, &slice.header, &cur.sps);

        let field_decoding = cur.picture.borrow().field != Field::Frame;
        let slice_param = params::fill_slice(
            slice,
            &cur.sps,
            &cur.pps,
            field_decoding,
            self.dpb.ref_pic_list0(),
            self.dpb.ref_pic_list1(),
        )
        .map_err(DecodeError::Fail)?;

        cur.buffers
            .slices
            .push((slice_param, slice.nalu.data.to_vec()));
        cur.last_slice = slice.header.clone();
        cur.last_nalu_header = slice.nalu.header;

        Ok(())
    }

    /// Stores a decoded picture, pairing it with its first field or adding a
    /// new frame store to the DPB.
    fn store_picture(&mut self, pic: PictureRc, sps: &Sps) -> anyhow::Result<()> {
        if pic.borrow().is_second_field() {
            if let Some(store) = self.prev_frame.take() {
                store.borrow_mut().add_picture(pic)?;
                return Ok(());
            }
        }

        {
            let mut p = pic.borrow_mut();
            p.needed_for_output = p.output_flag;
        }

        let is_frame = pic.borrow().field == Field::Frame;
        let mut store = FrameStore::new(pic);

        if is_frame && !sps.frame_mbs_only_flag {
            store.split_fields()?;
        }

        let store = Rc::new(RefCell::new(store));
        self.dpb.add_dpb(Rc::clone(&store))?;

        self.prev_frame = if store.borrow().has_frame() {
            None
        } else {
            Some(store)
        };

        Ok(())
    }

    /// Submits the current picture, marks it and stores it in the DPB.
    fn decode_current_picture(&mut self) -> Result<()> {
        let CurrentPicture {
            picture,
            buffers,
            sps,
            ..
        } = match self.cur_pic.take() {
            Some(cur) => cur,
            None => return Ok(()),
        };

        let surface = picture
            .borrow()
            .surface_id()
            .ok_or_else(|| DecodeError::Fail(anyhow!("picture without a surface")))?;

        if buffers.slices.is_empty() {
            return Err(DecodeError::Fail(anyhow!("picture without slices")));
        }

        self.backend
            .submit_picture(surface, &buffers)
            .map_err(backend_error)?;

        let mmco5 = self
            .dpb
            .exec_ref_pic_marking(&picture, &sps)
            .map_err(DecodeError::Fail)?;

        if mmco5 {
            let (field, top_field_order_cnt) = {
                let p = picture.borrow();
                (p.field, p.top_field_order_cnt.unwrap_or_default())
            };

            debug!("MMCO 5 executed, outputting the prior pictures");

            self.poc_state = self.poc_state.after_mmco5(field, top_field_order_cnt);
            self.frame_num = 0;
            self.prev_frame_num = 0;
            self.prev_ref_frame_num = 0;
            self.prev_frame = None;

            self.dpb.flush_dpb();
            self.collect_output();
            self.epoch += 1;
        }

        self.store_picture(picture, &sps)
            .map_err(DecodeError::Fail)?;
        self.collect_output();

        Ok(())
    }

    fn process_slice(&mut self, nalu: Nalu, timestamp: u64) -> Result<DecodeStatus> {
        if !(self.got_sps && self.got_pps) {
            debug!("Skipping slice received before SPS and PPS");
            return Ok(DecodeStatus::Success);
        }

        let slice = self
            .parser
            .parse_slice_header(nalu)
            .map_err(DecodeError::ParserFail)?;

        let pps = self
            .parser
            .get_pps(slice.header.pic_parameter_set_id)
            .ok_or_else(|| {
                DecodeError::ParserFail(anyhow!(
                    "slice refers to unknown PPS {}",
                    slice.header.pic_parameter_set_id
                ))
            })?;
        let sps = self
            .parser
            .get_sps(pps.seq_parameter_set_id)
            .ok_or_else(|| {
                DecodeError::ParserFail(anyhow!(
                    "PPS refers to unknown SPS {}",
                    pps.seq_parameter_set_id
                ))
            })?;

        let new_picture = is_new_picture(
            self.cur_pic
                .as_ref()
                .map(|c| (&c.last_slice, &c.last_nalu_header)),
            &slice.header,
            &slice.nalu.header,
            &sps,
        );

        let mut status = DecodeStatus::Success;

        let res = (|| {
            if new_picture {
                self.decode_current_picture()?;

                if self.ensure_context(&sps, &pps)? {
                    status = DecodeStatus::FormatChange;
                }

                self.decode_picture(&slice, Rc::clone(&sps), Rc::clone(&pps), timestamp)?;
            }

            self.decode_slice(&slice)
        })();

        if let Err(e) = res {
            // The picture cannot be completed.
            self.cur_pic = None;
            return Err(e);
        }

        Ok(status)
    }

    /// Decodes the pending picture and outputs everything the DPB holds.
    fn finish_sequence(&mut self) -> Result<()> {
        let res = self.decode_current_picture();

        self.dpb.drain_dpb();
        self.collect_output();
        self.prev_frame = None;

        res
    }

    fn process_nalu(&mut self, nalu: Nalu, timestamp: u64) -> Result<DecodeStatus> {
        trace!(
            "Processing NAL unit {:?} of {} bytes at offset {}",
            nalu.header.type_,
            nalu.size(),
            nalu.offset
        );

        match nalu.header.type_ {
            NaluType::Sps => {
                let sps = self
                    .parser
                    .parse_sps(&nalu)
                    .map_err(DecodeError::ParserFail)?;
                debug!(
                    "Parsed SPS {} ({}x{})",
                    sps.seq_parameter_set_id,
                    sps.coded_resolution().width,
                    sps.coded_resolution().height
                );
                self.got_sps = true;
            }

            NaluType::Pps => {
                let pps = self
                    .parser
                    .parse_pps(&nalu)
                    .map_err(DecodeError::ParserFail)?;
                debug!("Parsed PPS {}", pps.pic_parameter_set_id);
                self.got_pps = true;
            }

            NaluType::Sei => {
                let messages = self
                    .parser
                    .parse_sei(&nalu)
                    .map_err(DecodeError::ParserFail)?;
                trace!("SEI messages: {:?}", messages);
            }

            NaluType::Slice | NaluType::SliceIdr => return self.process_slice(nalu, timestamp),

            NaluType::SeqEnd | NaluType::StreamEnd => {
                debug!("End of sequence");
                self.finish_sequence()?;
            }

            NaluType::AuDelimiter
            | NaluType::FillerData
            | NaluType::SpsExt
            | NaluType::SliceAux => (),

            other => {
                return Err(DecodeError::ParserFail(anyhow!(
                    "unsupported NAL unit type {:?}",
                    other
                )))
            }
        }

        Ok(DecodeStatus::Success)
    }
}

impl<B: StatelessDecoderBackend> VideoDecoder for Decoder<B> {
    fn start(&mut self, codec_data: Option<&[u8]>) -> Result<()> {
        let data = match codec_data {
            Some(data) => data,
            None => return Ok(()),
        };

        let config = parse_avcc(data).map_err(DecodeError::InvalidData)?;

        for sps in &config.spses {
            let nalu = Nalu::new(sps, 0).map_err(DecodeError::ParserFail)?;
            self.parser
                .parse_sps(&nalu)
                .map_err(DecodeError::ParserFail)?;
            self.got_sps = true;
        }

        for pps in &config.ppses {
            let nalu = Nalu::new(pps, 0).map_err(DecodeError::ParserFail)?;
            self.parser
                .parse_pps(&nalu)
                .map_err(DecodeError::ParserFail)?;
            self.got_pps = true;
        }

        info!(
            "avcC: profile {} level {}, {}-byte NAL lengths, {} SPS, {} PPS",
            config.profile_idc,
            config.level_idc,
            config.length_size,
            config.spses.len(),
            config.ppses.len()
        );

        self.nal_format = NalFormat::Avc {
            length_size: config.length_size,
        };

        Ok(())
    }

    fn decode(&mut self, bitstream: &[u8], timestamp: u64) -> Result<DecodeStatus> {
        let mut status = DecodeStatus::Success;
        let mut parser_failure = None;

        for raw in Demuxer::new(bitstream, self.nal_format) {
            let raw = raw.map_err(|e| DecodeError::InvalidData(e.into()))?;

            let res = Nalu::new(raw.data, raw.offset)
                .map_err(DecodeError::ParserFail)
                .and_then(|nalu| self.process_nalu(nalu, timestamp));

            match res {
                Ok(DecodeStatus::FormatChange) => status = DecodeStatus::FormatChange,
                Ok(DecodeStatus::Success) => (),
                Err(DecodeError::ParserFail(e)) => {
                    warn!("Skipping NAL unit at offset {}: {:#}", raw.offset, e);
                    parser_failure = Some(e);
                }
                Err(e) => {
                    error!("Decoding failed at offset {}: {}", raw.offset, e);
                    return Err(e);
                }
            }
        }

        // A format change must reach the client even if some NAL units were
        // skipped.
        match parser_failure {
            Some(e) if status != DecodeStatus::FormatChange => Err(DecodeError::ParserFail(e)),
            _ => Ok(status),
        }
    }

    fn get_output(&mut self, draining: bool) -> Option<DecodedPicture> {
        if draining {
            if let Err(e) = self.finish_sequence() {
                error!("Failed to decode the pending picture while draining: {}", e);
            }
        }

        self.ready_queue.pop().map(|ready| ready.picture)
    }

    fn flush(&mut self) -> Result<()> {
        let res = self.decode_current_picture();

        self.dpb.flush_dpb();
        self.collect_output();

        res
    }

    fn reset(&mut self) {
        debug!("Resetting the decoder");

        self.cur_pic = None;
        self.prev_frame = None;
        self.dpb.clear_dpb();
        self.ready_queue.clear();
    }

    fn stop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Failed to flush while stopping: {}", e);
        }

        self.reset();

        if let ContextState::Active(_) = self.context {
            self.backend.stop();
            self.surface_pool.new_generation();
            self.context = ContextState::NoContext;
        }
    }
}
