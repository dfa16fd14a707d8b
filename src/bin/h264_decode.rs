// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs an H.264 stream through the decoder control path with the dummy
//! backend, and reports the pictures in output order.

use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use cros_h264::config::DecoderConfig;
use cros_h264::decoders::h264::backends::dummy::Backend;
use cros_h264::decoders::h264::decoder::Decoder;
use cros_h264::decoders::h264::demuxer::Demuxer;
use cros_h264::decoders::h264::demuxer::NalFormat;
use cros_h264::decoders::DecodeError;
use cros_h264::decoders::DecodeStatus;
use cros_h264::decoders::DecodedPicture;
use cros_h264::decoders::VideoDecoder;
use log::error;
use log::info;
use log::warn;
use serde::Serialize;

#[derive(FromArgs)]
/// Decode an H.264 stream without an accelerator.
struct Args {
    #[argh(positional, description = "path to the stream", arg_name = "INFILE")]
    input: PathBuf,
    #[argh(
        option,
        description = "path to avcC codec data, switches to length-prefixed input",
        arg_name = "AVCC"
    )]
    codec_data: Option<PathBuf>,
    #[argh(option, description = "path to a JSON decoder configuration", arg_name = "CONFIG")]
    config: Option<PathBuf>,
    #[argh(
        option,
        description = "write one JSON line per output picture to this file",
        arg_name = "OUTFILE"
    )]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct OutputRecord {
    surface: u32,
    pic_order_cnt: i32,
    timestamp: u64,
    width: u32,
    height: u32,
    interlaced: bool,
}

impl From<&DecodedPicture> for OutputRecord {
    fn from(pic: &DecodedPicture) -> Self {
        Self {
            surface: pic.surface_id(),
            pic_order_cnt: pic.pic_order_cnt,
            timestamp: pic.timestamp,
            width: pic.display_resolution.width,
            height: pic.display_resolution.height,
            interlaced: pic.interlaced,
        }
    }
}

struct Sink {
    writer: Option<BufWriter<File>>,
    count: usize,
}

impl Sink {
    fn write(&mut self, pic: &DecodedPicture) -> anyhow::Result<()> {
        let record = OutputRecord::from(pic);
        info!(
            "Output #{}: surface {} POC {} ts {}",
            self.count, record.surface, record.pic_order_cnt, record.timestamp
        );
        self.count += 1;

        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, &record)?;
            writeln!(writer)?;
        }

        Ok(())
    }

    fn drain(&mut self, decoder: &mut Decoder<Backend>, draining: bool) -> anyhow::Result<()> {
        while let Some(pic) = decoder.get_output(draining) {
            self.write(&pic)?;
        }

        Ok(())
    }
}

/// Decodes one buffer, tolerating the per-NAL failures the decoder recovers
/// from.
fn decode_buffer(decoder: &mut Decoder<Backend>, buf: &[u8], timestamp: u64) -> anyhow::Result<()> {
    match decoder.decode(buf, timestamp) {
        Ok(DecodeStatus::FormatChange) => {
            info!("Format change, new context {:?}", decoder.backend().context);
            Ok(())
        }
        Ok(DecodeStatus::Success) => Ok(()),
        Err(DecodeError::ParserFail(e)) => {
            warn!("Buffer {} was partially skipped: {:#}", timestamp, e);
            Ok(())
        }
        Err(e) => Err(e).context("decoding failed"),
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => DecoderConfig::from_file(path)?,
        None => Default::default(),
    };

    let stream = std::fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let writer = match &args.output {
        Some(path) => Some(BufWriter::new(File::create(path).with_context(|| {
            format!("failed to create {}", path.display())
        })?)),
        None => None,
    };
    let mut sink = Sink { writer, count: 0 };

    let mut decoder = Decoder::new(Backend::new(), config);

    let codec_data = match &args.codec_data {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        ),
        None => None,
    };
    decoder.start(codec_data.as_deref())?;

    match decoder.nal_format() {
        NalFormat::AnnexB => {
            // One buffer per NAL unit, the index serving as timestamp.
            let mut buf = Vec::new();
            for (timestamp, raw) in Demuxer::new(&stream, NalFormat::AnnexB).enumerate() {
                let raw = raw?;

                buf.clear();
                buf.extend_from_slice(&[0, 0, 1]);
                buf.extend_from_slice(raw.data);

                decode_buffer(&mut decoder, &buf, timestamp as u64)?;
                sink.drain(&mut decoder, false)?;
            }
        }
        NalFormat::Avc { .. } => {
            decode_buffer(&mut decoder, &stream, 0)?;
            sink.drain(&mut decoder, false)?;
        }
    }

    sink.drain(&mut decoder, true)?;
    decoder.stop();

    if let Some(writer) = sink.writer.as_mut() {
        writer.flush()?;
    }

    info!(
        "Decoded {} pictures, {} submitted to the backend",
        sink.count,
        decoder.backend().submissions.len()
    );

    Ok(())
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
