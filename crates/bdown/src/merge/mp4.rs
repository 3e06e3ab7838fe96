//! Native ISO BMFF support.
//!
//! [Mp4Demuxer] reads both progressive files and fragmented DASH segments,
//! [Mp4Muxer] always writes a progressive file with a single `mdat`.

mod boxes;
mod demux;
mod mux;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use boxes::FourCC;
pub use demux::Mp4Demuxer;
pub use mux::Mp4Muxer;

/// Movie timescale of the files written by [Mp4Muxer].
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Convert `value` from the `from` timescale to the `to` timescale, rounding down.
pub(crate) fn rescale(value: u64, to: u32, from: u32) -> u64 {
    if from == 0 {
        return 0;
    }
    (value as u128 * to as u128 / from as u128).min(u64::MAX as u128) as u64
}

/// `sample_is_non_sync_sample` bit of the ISO BMFF sample flags.
pub(crate) const NON_SYNC_SAMPLE_FLAG: u32 = 0x0001_0000;

/// MIME type of a track from its handler type and sample entry FourCC.
pub fn mime_type(handler: &FourCC, sample_entry: &FourCC) -> String {
    let known = match sample_entry {
        b"avc1" | b"avc3" => Some("video/avc"),
        b"hvc1" | b"hev1" => Some("video/hevc"),
        b"av01" => Some("video/av01"),
        b"mp4a" => Some("audio/mp4a-latm"),
        b"ec-3" => Some("audio/eac3"),
        b"ac-3" => Some("audio/ac3"),
        b"fLaC" => Some("audio/flac"),
        b"Opus" => Some("audio/opus"),
        _ => None,
    };
    if let Some(mime) = known {
        return mime.to_string();
    }

    let fourcc = boxes::fourcc_str(sample_entry);
    let fourcc = fourcc.trim_end_matches(['\0', ' ']);
    match handler {
        b"vide" => format!("video/{fourcc}"),
        b"soun" => format!("audio/{fourcc}"),
        _ => format!("application/{fourcc}"),
    }
}
