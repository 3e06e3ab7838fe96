use std::{ffi::CString, path::Path};

use rsmpeg::{
    avformat::{AVFormatContextInput, AVFormatContextOutput},
    UnsafeDerefMut,
};
use tokio_util::sync::CancellationToken;

use super::{remove_partial_output, MuxJob, MuxStats};
use crate::{BdownError, BdownResult, StreamKind};

fn c_path(path: &Path) -> BdownResult<CString> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| BdownError::mux(format!("{} contains a NUL byte", path.display())))
}

struct Input {
    context: AVFormatContextInput,
    stream_index: usize,
}

fn open_input(path: &Path, kind: StreamKind) -> BdownResult<Input> {
    let context = AVFormatContextInput::open(&c_path(path)?, None, &mut None)?;
    let stream_index = context
        .streams()
        .iter()
        .position(|stream| {
            let codec_type = stream.codecpar().codec_type();
            match kind {
                StreamKind::Video => codec_type.is_video(),
                StreamKind::Audio => codec_type.is_audio(),
            }
        })
        .ok_or_else(|| BdownError::mux(format!("no {kind} track found")))?;

    Ok(Input {
        context,
        stream_index,
    })
}

/// Stream-copy the first video and first audio stream through libavformat.
pub(crate) fn ffmpeg_remux(job: &MuxJob, cancel: &CancellationToken) -> BdownResult<MuxStats> {
    let mut inputs = [
        open_input(&job.video_path, StreamKind::Video)?,
        open_input(&job.audio_path, StreamKind::Audio)?,
    ];

    let c_output = c_path(&job.output_path)?;
    let mut output = AVFormatContextOutput::create(&c_output, None)?;
    let result = copy_packets(&mut inputs, &mut output, cancel);
    drop(output);
    if result.is_err() {
        remove_partial_output(&job.output_path);
    }
    result
}

fn copy_packets(
    inputs: &mut [Input; 2],
    output: &mut AVFormatContextOutput,
    cancel: &CancellationToken,
) -> BdownResult<MuxStats> {
    for input in inputs.iter() {
        let input_stream = &input.context.streams()[input.stream_index];
        let mut codecpar = input_stream.codecpar().clone();
        {
            let codecpar = unsafe { codecpar.deref_mut() };
            codecpar.codec_tag = 0;
        }
        let mut output_stream = output.new_stream();
        output_stream.codecpar_mut().copy(&codecpar);
    }
    output.write_header(&mut None)?;

    let mut counts = [0u64; 2];
    for (output_index, input) in inputs.iter_mut().enumerate() {
        while let Some(mut packet) = input.context.read_packet()? {
            if cancel.is_cancelled() {
                return Err(BdownError::Cancelled);
            }
            if packet.stream_index as usize != input.stream_index {
                continue;
            }

            {
                let input_stream = &input.context.streams()[input.stream_index];
                let output_stream = &output.streams()[output_index];
                packet.rescale_ts(input_stream.time_base, output_stream.time_base);
                packet.set_stream_index(output_index as i32);
                packet.set_pos(-1);
            }
            output.interleaved_write_frame(&mut packet)?;
            counts[output_index] += 1;
        }
    }

    output.write_trailer()?;
    Ok(MuxStats {
        video_samples: counts[0],
        audio_samples: counts[1],
    })
}
