use std::{
    fs::File,
    io::{BufWriter, Seek, SeekFrom, Write},
    path::Path,
};

use bytes::{BufMut, BytesMut};

use super::{
    boxes::{put_unity_matrix, write_box, write_full_box},
    rescale, MOVIE_TIMESCALE,
};
use crate::{
    merge::{Muxer, SampleInfo, TrackFormat},
    BdownError, BdownResult,
};

/// `mdat` header carrying a 64-bit size, patched in [Muxer::finish].
const MDAT_HEADER_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy)]
struct WrittenSample {
    offset: u64,
    info: SampleInfo,
}

struct MuxTrack {
    format: TrackFormat,
    samples: Vec<WrittenSample>,
}

impl MuxTrack {
    /// Media duration in the track timescale.
    fn duration(&self) -> u64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => {
                last.info.dts + last.info.duration as u64 - first.info.dts
            }
            _ => 0,
        }
    }

    fn movie_duration(&self) -> u64 {
        rescale(self.duration(), MOVIE_TIMESCALE, self.format.timescale)
    }

    /// Presentation time of the first visible sample on the source timeline,
    /// in the movie timescale. `None` for an empty track.
    fn presentation_start(&self) -> Option<u64> {
        let first_dts = self.samples.first()?.info.dts;
        let format = &self.format;
        let start = format
            .edit_delay
            .saturating_add(first_dts.saturating_sub(format.edit_media_time));
        Some(rescale(start, MOVIE_TIMESCALE, format.timescale))
    }

    /// Decode times are written starting from zero, so the edit is placed
    /// relative to `origin`, the earliest start of all tracks.
    fn edit(&self, origin: u64) -> Option<Edit> {
        let start = self.presentation_start()?;
        let first_dts = self.samples.first()?.info.dts;
        let media_time = self.format.edit_media_time.saturating_sub(first_dts);
        let edit = Edit {
            delay: start.saturating_sub(origin),
            media_time,
            segment_duration: rescale(
                self.duration().saturating_sub(media_time),
                MOVIE_TIMESCALE,
                self.format.timescale,
            ),
        };
        (edit.delay > 0 || edit.media_time > 0).then_some(edit)
    }
}

/// Edit list of one output track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edit {
    /// Empty edit before the media, movie timescale.
    delay: u64,
    /// Where presentation starts in the written media, track timescale.
    media_time: u64,
    /// Presented media, movie timescale.
    segment_duration: u64,
}

impl Edit {
    fn track_duration(&self) -> u64 {
        self.delay + self.segment_duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AddingTracks,
    Writing { mdat_start: u64 },
    Finished,
}

/// Progressive MP4 writer: `ftyp`, one `mdat`, then `moov`.
pub struct Mp4Muxer {
    writer: BufWriter<File>,
    tracks: Vec<MuxTrack>,
    position: u64,
    state: State,
}

impl Mp4Muxer {
    pub fn create(path: impl AsRef<Path>) -> BdownResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            tracks: Vec::new(),
            position: 0,
            state: State::AddingTracks,
        })
    }

    fn write_all(&mut self, data: &[u8]) -> BdownResult<()> {
        self.writer.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn build_moov(&self) -> BytesMut {
        let mut out = BytesMut::new();
        let origin = self
            .tracks
            .iter()
            .filter_map(MuxTrack::presentation_start)
            .min()
            .unwrap_or_default();
        let edits: Vec<Option<Edit>> = self.tracks.iter().map(|t| t.edit(origin)).collect();
        let durations: Vec<u64> = self
            .tracks
            .iter()
            .zip(&edits)
            .map(|(track, edit)| match edit {
                Some(edit) => edit.track_duration(),
                None => track.movie_duration(),
            })
            .collect();
        let duration = durations.iter().copied().max().unwrap_or_default();

        write_box(&mut out, b"moov", |out| {
            write_full_box(out, b"mvhd", 1, 0, |out| {
                out.put_u64(0); // creation_time
                out.put_u64(0); // modification_time
                out.put_u32(MOVIE_TIMESCALE);
                out.put_u64(duration);
                out.put_u32(0x0001_0000); // rate 1.0
                out.put_u16(0x0100); // volume 1.0
                out.put_bytes(0, 10);
                put_unity_matrix(out);
                out.put_bytes(0, 24);
                out.put_u32(self.tracks.len() as u32 + 1);
            });

            for (i, track) in self.tracks.iter().enumerate() {
                write_trak(out, i as u32 + 1, track, durations[i], edits[i]);
            }
        });
        out
    }
}

impl Muxer for Mp4Muxer {
    fn add_track(&mut self, format: &TrackFormat) -> BdownResult<usize> {
        if self.state != State::AddingTracks {
            return Err(BdownError::mux("tracks must be added before start"));
        }

        self.tracks.push(MuxTrack {
            format: format.clone(),
            samples: Vec::new(),
        });
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> BdownResult<()> {
        if self.state != State::AddingTracks {
            return Err(BdownError::mux("muxer already started"));
        }

        let mut header = BytesMut::new();
        write_box(&mut header, b"ftyp", |out| {
            out.put_slice(b"isom");
            out.put_u32(0x200);
            for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
                out.put_slice(brand);
            }
        });

        let mdat_start = self.position + header.len() as u64;
        header.put_u32(1);
        header.put_slice(b"mdat");
        header.put_u64(0);
        self.write_all(&header)?;

        self.state = State::Writing { mdat_start };
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &SampleInfo) -> BdownResult<()> {
        if !matches!(self.state, State::Writing { .. }) {
            return Err(BdownError::mux("muxer is not writing"));
        }
        if track >= self.tracks.len() {
            return Err(BdownError::mux(format!("track {track} does not exist")));
        }

        let offset = self.position;
        self.write_all(data)?;
        self.tracks[track].samples.push(WrittenSample {
            offset,
            info: SampleInfo {
                size: data.len() as u32,
                ..*info
            },
        });
        Ok(())
    }

    fn finish(&mut self) -> BdownResult<()> {
        if self.state == State::AddingTracks {
            self.start()?;
        }
        let State::Writing { mdat_start } = self.state else {
            return Err(BdownError::mux("muxer already finished"));
        };

        let mdat_size = self.position - mdat_start;
        debug_assert!(mdat_size >= MDAT_HEADER_SIZE);
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(mdat_start + 8))?;
        file.write_all(&mdat_size.to_be_bytes())?;
        file.seek(SeekFrom::Start(self.position))?;

        let moov = self.build_moov();
        self.write_all(&moov)?;
        self.writer.flush()?;
        self.state = State::Finished;
        Ok(())
    }
}

fn write_trak(
    out: &mut BytesMut,
    track_id: u32,
    track: &MuxTrack,
    duration: u64,
    edit: Option<Edit>,
) {
    let format = &track.format;
    let is_audio = &format.handler == b"soun";

    write_box(out, b"trak", |out| {
        // enabled | in_movie
        write_full_box(out, b"tkhd", 1, 3, |out| {
            out.put_u64(0);
            out.put_u64(0);
            out.put_u32(track_id);
            out.put_u32(0);
            out.put_u64(duration);
            out.put_bytes(0, 8);
            out.put_u16(0); // layer
            out.put_u16(0); // alternate_group
            out.put_u16(if is_audio { 0x0100 } else { 0 });
            out.put_u16(0);
            put_unity_matrix(out);
            out.put_u32(format.width);
            out.put_u32(format.height);
        });

        if let Some(edit) = edit {
            write_box(out, b"edts", |out| write_elst(out, &edit));
        }

        write_box(out, b"mdia", |out| {
            write_full_box(out, b"mdhd", 1, 0, |out| {
                out.put_u64(0);
                out.put_u64(0);
                out.put_u32(format.timescale);
                out.put_u64(track.duration());
                out.put_u16(format.language);
                out.put_u16(0);
            });

            let name: &[u8] = match &format.handler {
                b"vide" => b"VideoHandler\0",
                b"soun" => b"SoundHandler\0",
                _ => b"DataHandler\0",
            };
            write_full_box(out, b"hdlr", 0, 0, |out| {
                out.put_u32(0);
                out.put_slice(&format.handler);
                out.put_bytes(0, 12);
                out.put_slice(name);
            });

            write_box(out, b"minf", |out| {
                match &format.handler {
                    b"vide" => write_full_box(out, b"vmhd", 0, 1, |out| out.put_bytes(0, 8)),
                    b"soun" => write_full_box(out, b"smhd", 0, 0, |out| out.put_bytes(0, 4)),
                    _ => write_full_box(out, b"nmhd", 0, 0, |_| {}),
                }
                write_box(out, b"dinf", |out| {
                    write_full_box(out, b"dref", 0, 0, |out| {
                        out.put_u32(1);
                        // self-contained
                        write_full_box(out, b"url ", 0, 1, |_| {});
                    });
                });
                write_stbl(out, track);
            });
        });
    });
}

fn write_elst(out: &mut BytesMut, edit: &Edit) {
    const MEDIA_RATE: u32 = 0x0001_0000;

    write_full_box(out, b"elst", 1, 0, |out| {
        out.put_u32(if edit.delay > 0 { 2 } else { 1 });
        if edit.delay > 0 {
            out.put_u64(edit.delay);
            out.put_i64(-1);
            out.put_u32(MEDIA_RATE);
        }
        out.put_u64(edit.segment_duration);
        out.put_i64(edit.media_time.min(i64::MAX as u64) as i64);
        out.put_u32(MEDIA_RATE);
    });
}

fn write_stbl(out: &mut BytesMut, track: &MuxTrack) {
    let samples = &track.samples;

    write_box(out, b"stbl", |out| {
        out.put_slice(&track.format.sample_description);

        // decode deltas, the last sample keeps its own duration
        let deltas = samples.iter().enumerate().map(|(i, sample)| {
            let delta = samples.get(i + 1).map_or(sample.info.duration as u64, |next| {
                next.info.dts.saturating_sub(sample.info.dts)
            });
            u32::try_from(delta).unwrap_or(u32::MAX)
        });
        let stts = run_lengths(deltas);
        write_full_box(out, b"stts", 0, 0, |out| {
            out.put_u32(stts.len() as u32);
            for (count, delta) in &stts {
                out.put_u32(*count);
                out.put_u32(*delta);
            }
        });

        if samples.iter().any(|s| s.info.cts_offset != 0) {
            let offsets = samples.iter().map(|s| {
                s.info
                    .cts_offset
                    .clamp(i32::MIN as i64, i32::MAX as i64) as i32
            });
            let ctts = run_lengths(offsets);
            let version = if ctts.iter().any(|(_, offset)| *offset < 0) {
                1
            } else {
                0
            };
            write_full_box(out, b"ctts", version, 0, |out| {
                out.put_u32(ctts.len() as u32);
                for (count, offset) in &ctts {
                    out.put_u32(*count);
                    out.put_i32(*offset);
                }
            });
        }

        if !samples.iter().all(|s| s.info.sync) {
            let sync: Vec<u32> = samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.info.sync)
                .map(|(i, _)| i as u32 + 1)
                .collect();
            write_full_box(out, b"stss", 0, 0, |out| {
                out.put_u32(sync.len() as u32);
                for number in sync {
                    out.put_u32(number);
                }
            });
        }

        // a chunk is a run of samples stored back to back
        let mut chunks: Vec<(u64, u32)> = Vec::new();
        let mut chunk_end = None;
        for sample in samples {
            match chunks.last_mut() {
                Some((_, count)) if chunk_end == Some(sample.offset) => *count += 1,
                _ => chunks.push((sample.offset, 1)),
            }
            chunk_end = Some(sample.offset + sample.info.size as u64);
        }

        let mut stsc: Vec<(u32, u32)> = Vec::new();
        for (i, (_, count)) in chunks.iter().enumerate() {
            if stsc.last().map(|(_, last)| last) != Some(count) {
                stsc.push((i as u32 + 1, *count));
            }
        }
        write_full_box(out, b"stsc", 0, 0, |out| {
            out.put_u32(stsc.len() as u32);
            for (first_chunk, count) in stsc {
                out.put_u32(first_chunk);
                out.put_u32(count);
                out.put_u32(1);
            }
        });

        write_full_box(out, b"stsz", 0, 0, |out| {
            out.put_u32(0);
            out.put_u32(samples.len() as u32);
            for sample in samples {
                out.put_u32(sample.info.size);
            }
        });

        if chunks.iter().any(|(offset, _)| *offset > u32::MAX as u64) {
            write_full_box(out, b"co64", 0, 0, |out| {
                out.put_u32(chunks.len() as u32);
                for (offset, _) in &chunks {
                    out.put_u64(*offset);
                }
            });
        } else {
            write_full_box(out, b"stco", 0, 0, |out| {
                out.put_u32(chunks.len() as u32);
                for (offset, _) in &chunks {
                    out.put_u32(*offset as u32);
                }
            });
        }
    });
}

/// Collapse equal neighbours into `(count, value)` pairs.
fn run_lengths<T: PartialEq>(values: impl IntoIterator<Item = T>) -> Vec<(u32, T)> {
    let mut runs: Vec<(u32, T)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => runs.push((1, value)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_lengths() {
        assert_eq!(
            run_lengths([512, 512, 512, 1024, 512]),
            vec![(3, 512), (1, 1024), (1, 512)]
        );
        assert!(run_lengths(Vec::<u32>::new()).is_empty());
    }
}
