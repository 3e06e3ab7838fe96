use std::{
    collections::HashMap,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use bytes::{Buf, Bytes};

use super::{
    boxes::{ensure, fourcc_str, read_full_box_header, FourCC, Mp4Box},
    mime_type, rescale, NON_SYNC_SAMPLE_FLAG,
};
use crate::{
    merge::{Demuxer, SampleInfo, TrackFormat},
    BdownError, BdownResult,
};

/// Where a sample lives in the file and how it is timed.
#[derive(Debug, Clone, Copy)]
struct SampleEntry {
    offset: u64,
    info: SampleInfo,
}

/// `trex` defaults, overridden by `tfhd` and `trun`.
#[derive(Debug, Clone, Copy, Default)]
struct FragmentDefaults {
    duration: u32,
    size: u32,
    flags: u32,
}

#[derive(Debug)]
struct TrackState {
    format: TrackFormat,
    defaults: FragmentDefaults,
    samples: Vec<SampleEntry>,
    next_dts: u64,
}

/// Demuxer over an MP4 file on disk.
///
/// Boxes describing samples are loaded when opening, sample data is only read
/// on demand.
pub struct Mp4Demuxer {
    file: File,
    formats: Vec<TrackFormat>,
    samples: Vec<Vec<SampleEntry>>,
    selected: Option<usize>,
    cursor: usize,
}

impl Mp4Demuxer {
    pub fn open(path: impl AsRef<Path>) -> BdownResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut moov = None;
        let mut fragments = Vec::new();
        let mut offset = 0;
        while offset < file_len {
            let (fourcc, size, header_size) = read_header_at(&mut file, offset, file_len)?;
            match &fourcc {
                b"moov" => moov = Some(read_box_at(&mut file, offset, size, header_size, fourcc)?),
                b"moof" => {
                    fragments.push((offset, read_box_at(&mut file, offset, size, header_size, fourcc)?))
                }
                _ => {}
            }
            offset += size;
        }

        let moov =
            moov.ok_or_else(|| BdownError::mux(format!("{}: no moov box", path.display())))?;
        let mut tracks = parse_moov(&moov, file_len)?;
        for (moof_offset, moof) in &fragments {
            parse_moof(*moof_offset, moof, &mut tracks, file_len)?;
        }

        tracing::debug!(
            "Opened {}: {} tracks, {} fragments",
            path.display(),
            tracks.len(),
            fragments.len()
        );

        let (formats, samples) = tracks
            .into_iter()
            .map(|track| (track.format, track.samples))
            .unzip();
        Ok(Self {
            file,
            formats,
            samples,
            selected: None,
            cursor: 0,
        })
    }
}

impl Demuxer for Mp4Demuxer {
    fn tracks(&self) -> &[TrackFormat] {
        &self.formats
    }

    fn select_track(&mut self, index: usize) -> BdownResult<()> {
        if index >= self.formats.len() {
            return Err(BdownError::mux(format!("track {index} does not exist")));
        }
        self.selected = Some(index);
        self.cursor = 0;
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> BdownResult<Option<SampleInfo>> {
        let Some(track) = self.selected else {
            return Err(BdownError::mux("no track selected"));
        };
        let Some(entry) = self.samples[track].get(self.cursor).copied() else {
            return Ok(None);
        };

        buf.resize(entry.info.size as usize, 0);
        self.file
            .seek(SeekFrom::Start(entry.offset))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| {
                BdownError::mux(format!(
                    "failed to read sample {} of track {track}: {e}",
                    self.cursor
                ))
            })?;

        self.cursor += 1;
        Ok(Some(entry.info))
    }
}

/// Returns `(fourcc, size, header_size)` of the top-level box at `offset`.
fn read_header_at(file: &mut File, offset: u64, file_len: u64) -> BdownResult<(FourCC, u64, u64)> {
    if file_len - offset < 8 {
        return Err(BdownError::mux("truncated box header"));
    }

    let mut header = [0u8; 8];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut header)?;
    let mut cursor = &header[..];
    let size = cursor.get_u32() as u64;
    let mut fourcc = [0u8; 4];
    cursor.copy_to_slice(&mut fourcc);

    let (size, header_size) = match size {
        0 => (file_len - offset, 8),
        1 => {
            if file_len - offset < 16 {
                return Err(BdownError::mux("truncated box header"));
            }
            let mut large_size = [0u8; 8];
            file.read_exact(&mut large_size)?;
            (u64::from_be_bytes(large_size), 16)
        }
        size => (size, 8),
    };

    if size < header_size || size > file_len - offset {
        return Err(BdownError::mux(format!(
            "truncated {} box",
            fourcc_str(&fourcc)
        )));
    }
    Ok((fourcc, size, header_size))
}

fn read_box_at(
    file: &mut File,
    offset: u64,
    size: u64,
    header_size: u64,
    fourcc: FourCC,
) -> BdownResult<Mp4Box> {
    let mut raw = vec![0u8; size as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut raw)?;
    Ok(Mp4Box {
        fourcc,
        raw: Bytes::from(raw),
        header_size: header_size as usize,
    })
}

fn required(parent: &Mp4Box, fourcc: &FourCC) -> BdownResult<Mp4Box> {
    parent.child(fourcc)?.ok_or_else(|| {
        BdownError::mux(format!(
            "{} box has no {}",
            fourcc_str(&parent.fourcc),
            fourcc_str(fourcc)
        ))
    })
}

fn parse_moov(moov: &Mp4Box, file_len: u64) -> BdownResult<Vec<TrackState>> {
    let movie_timescale = parse_mvhd(required(moov, b"mvhd")?.body())?;
    let mut tracks = Vec::new();
    let mut defaults = HashMap::new();
    for child in moov.children() {
        let child = child?;
        match &child.fourcc {
            b"trak" => tracks.push(parse_trak(&child, tracks.len(), movie_timescale, file_len)?),
            b"mvex" => {
                for trex in child.children() {
                    let trex = trex?;
                    if &trex.fourcc == b"trex" {
                        let (track_id, trex_defaults) = parse_trex(trex.body())?;
                        defaults.insert(track_id, trex_defaults);
                    }
                }
            }
            _ => {}
        }
    }

    for track in &mut tracks {
        if let Some(trex) = defaults.get(&track.format.track_id) {
            track.defaults = *trex;
        }
    }
    Ok(tracks)
}

fn parse_trex(mut body: Bytes) -> BdownResult<(u32, FragmentDefaults)> {
    read_full_box_header(&mut body, "trex")?;
    ensure(&body, 20, "trex")?;
    let track_id = body.get_u32();
    let _sample_description_index = body.get_u32();
    let defaults = FragmentDefaults {
        duration: body.get_u32(),
        size: body.get_u32(),
        flags: body.get_u32(),
    };
    Ok((track_id, defaults))
}

fn parse_mvhd(mut body: Bytes) -> BdownResult<u32> {
    let (version, _) = read_full_box_header(&mut body, "mvhd")?;
    let times = if version == 1 { 16 } else { 8 };
    ensure(&body, times + 4, "mvhd")?;
    body.advance(times);
    Ok(body.get_u32())
}

fn parse_trak(
    trak: &Mp4Box,
    index: usize,
    movie_timescale: u32,
    file_len: u64,
) -> BdownResult<TrackState> {
    let (track_id, width, height) = parse_tkhd(required(trak, b"tkhd")?.body())?;
    let mdia = required(trak, b"mdia")?;
    let (timescale, language) = parse_mdhd(required(&mdia, b"mdhd")?.body())?;
    let handler = parse_hdlr(required(&mdia, b"hdlr")?.body())?;
    let stbl = required(&required(&mdia, b"minf")?, b"stbl")?;
    let stsd = required(&stbl, b"stsd")?;

    let mut stsd_body = stsd.body();
    read_full_box_header(&mut stsd_body, "stsd")?;
    ensure(&stsd_body, 12, "stsd")?;
    let entry_fourcc: FourCC = stsd_body[8..12].try_into().unwrap_or_default();

    let elst = match trak.child(b"edts")? {
        Some(edts) => edts.child(b"elst")?,
        None => None,
    };
    let (edit_delay, edit_media_time) = match elst {
        Some(elst) => parse_elst(elst.body(), movie_timescale, timescale)?,
        None => (0, 0),
    };

    let format = TrackFormat {
        index,
        track_id,
        mime: mime_type(&handler, &entry_fourcc),
        handler,
        timescale,
        width,
        height,
        language,
        sample_description: stsd.raw.clone(),
        edit_delay,
        edit_media_time,
    };
    let samples = parse_sample_table(&stbl, file_len)?;
    let next_dts = samples
        .last()
        .map(|s| s.info.dts + s.info.duration as u64)
        .unwrap_or_default();

    Ok(TrackState {
        format,
        defaults: FragmentDefaults::default(),
        samples,
        next_dts,
    })
}

/// Returns `(delay, media_time)` in the media timescale: the length of the
/// leading empty edits and where the first edit with media starts.
fn parse_elst(
    mut body: Bytes,
    movie_timescale: u32,
    media_timescale: u32,
) -> BdownResult<(u64, u64)> {
    let (version, _) = read_full_box_header(&mut body, "elst")?;
    ensure(&body, 4, "elst")?;
    let count = body.get_u32() as usize;
    let entry_size = if version == 1 { 20 } else { 12 };
    ensure(&body, count * entry_size, "elst")?;

    let mut empty = 0u64;
    for _ in 0..count {
        let (duration, media_time) = if version == 1 {
            (body.get_u64(), body.get_i64())
        } else {
            (body.get_u32() as u64, body.get_i32() as i64)
        };
        body.advance(4); // media_rate
        if media_time == -1 {
            empty = empty.saturating_add(duration);
            continue;
        }

        let delay = rescale(empty, media_timescale, movie_timescale);
        return Ok((delay, media_time.max(0) as u64));
    }
    Ok((rescale(empty, media_timescale, movie_timescale), 0))
}

/// Returns `(track_id, width, height)`.
fn parse_tkhd(mut body: Bytes) -> BdownResult<(u32, u32, u32)> {
    let (version, _) = read_full_box_header(&mut body, "tkhd")?;
    let times = if version == 1 { 16 } else { 8 };
    ensure(&body, times + 4, "tkhd")?;
    body.advance(times);
    let track_id = body.get_u32();

    // width and height close the box in both versions
    let (width, height) = if body.len() >= 8 {
        let mut tail = body.slice(body.len() - 8..);
        (tail.get_u32(), tail.get_u32())
    } else {
        (0, 0)
    };
    Ok((track_id, width, height))
}

/// Returns `(timescale, language)`.
fn parse_mdhd(mut body: Bytes) -> BdownResult<(u32, u16)> {
    let (version, _) = read_full_box_header(&mut body, "mdhd")?;
    let (times, duration) = if version == 1 { (16, 8) } else { (8, 4) };
    ensure(&body, times + 4 + duration + 2, "mdhd")?;
    body.advance(times);
    let timescale = body.get_u32();
    body.advance(duration);
    let language = body.get_u16();
    Ok((timescale, language))
}

fn parse_hdlr(mut body: Bytes) -> BdownResult<FourCC> {
    read_full_box_header(&mut body, "hdlr")?;
    ensure(&body, 8, "hdlr")?;
    body.advance(4);
    let mut handler = [0u8; 4];
    body.copy_to_slice(&mut handler);
    Ok(handler)
}

fn table_entries(table: &Option<Mp4Box>, what: &str) -> BdownResult<(u8, Bytes, u32)> {
    let Some(table) = table else {
        return Ok((0, Bytes::new(), 0));
    };
    let mut body = table.body();
    let (version, _) = read_full_box_header(&mut body, what)?;
    ensure(&body, 4, what)?;
    let count = body.get_u32();
    Ok((version, body, count))
}

/// Resolve the sample tables of a progressive file.
fn parse_sample_table(stbl: &Mp4Box, file_len: u64) -> BdownResult<Vec<SampleEntry>> {
    let Some(stsz) = stbl.child(b"stsz")? else {
        return Ok(Vec::new());
    };
    let mut stsz = stsz.body();
    read_full_box_header(&mut stsz, "stsz")?;
    ensure(&stsz, 8, "stsz")?;
    let uniform_size = stsz.get_u32();
    let sample_count = stsz.get_u32() as usize;
    if sample_count == 0 {
        return Ok(Vec::new());
    }
    if (sample_count as u64).saturating_mul(uniform_size.max(1) as u64) > file_len {
        return Err(BdownError::mux("stsz describes more data than the file holds"));
    }

    let sizes = if uniform_size == 0 {
        ensure(&stsz, sample_count * 4, "stsz")?;
        (0..sample_count).map(|_| stsz.get_u32()).collect()
    } else {
        vec![uniform_size; sample_count]
    };

    // decode times
    let (_, mut stts, count) = table_entries(&stbl.child(b"stts")?, "stts")?;
    ensure(&stts, count as usize * 8, "stts")?;
    let mut durations = Vec::with_capacity(sample_count);
    for _ in 0..count {
        let run = stts.get_u32();
        let delta = stts.get_u32();
        let run = (run as usize).min(sample_count - durations.len());
        durations.extend(std::iter::repeat(delta).take(run));
    }
    if durations.len() < sample_count {
        return Err(BdownError::mux("stts describes fewer samples than stsz"));
    }

    // composition offsets
    let (version, mut ctts, count) = table_entries(&stbl.child(b"ctts")?, "ctts")?;
    ensure(&ctts, count as usize * 8, "ctts")?;
    let mut cts_offsets = Vec::with_capacity(sample_count);
    for _ in 0..count {
        let run = ctts.get_u32();
        let offset = if version == 1 {
            ctts.get_i32() as i64
        } else {
            ctts.get_u32() as i64
        };
        let run = (run as usize).min(sample_count - cts_offsets.len());
        cts_offsets.extend(std::iter::repeat(offset).take(run));
    }

    // sync samples, all of them when the table is missing
    let stss = stbl.child(b"stss")?;
    let mut sync = vec![stss.is_none(); sample_count];
    let (_, mut stss, count) = table_entries(&stss, "stss")?;
    ensure(&stss, count as usize * 4, "stss")?;
    for _ in 0..count {
        let number = stss.get_u32() as usize;
        if let Some(flag) = number.checked_sub(1).and_then(|i| sync.get_mut(i)) {
            *flag = true;
        }
    }

    // chunk offsets
    let mut chunk_offsets = Vec::new();
    if let Some(stco) = stbl.child(b"stco")? {
        let (_, mut stco, count) = table_entries(&Some(stco), "stco")?;
        ensure(&stco, count as usize * 4, "stco")?;
        chunk_offsets.extend((0..count).map(|_| stco.get_u32() as u64));
    } else if let Some(co64) = stbl.child(b"co64")? {
        let (_, mut co64, count) = table_entries(&Some(co64), "co64")?;
        ensure(&co64, count as usize * 8, "co64")?;
        chunk_offsets.extend((0..count).map(|_| co64.get_u64()));
    }

    // (first_chunk, samples_per_chunk)
    let (_, mut stsc, count) = table_entries(&stbl.child(b"stsc")?, "stsc")?;
    ensure(&stsc, count as usize * 12, "stsc")?;
    let runs: Vec<(u32, u32)> = (0..count)
        .map(|_| {
            let first_chunk = stsc.get_u32();
            let samples_per_chunk = stsc.get_u32();
            stsc.advance(4);
            (first_chunk, samples_per_chunk)
        })
        .collect();

    let mut samples = Vec::with_capacity(sample_count);
    let mut dts = 0u64;
    'chunks: for (chunk, chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = chunk as u32 + 1;
        let per_chunk = runs
            .iter()
            .take_while(|(first, _)| *first <= chunk_number)
            .last()
            .map(|(_, count)| *count)
            .unwrap_or_default();

        let mut offset = *chunk_offset;
        for _ in 0..per_chunk {
            let index = samples.len();
            if index == sample_count {
                break 'chunks;
            }

            let info = SampleInfo {
                size: sizes[index],
                dts,
                cts_offset: cts_offsets.get(index).copied().unwrap_or_default(),
                duration: durations[index],
                sync: sync[index],
            };
            samples.push(SampleEntry { offset, info });
            offset += info.size as u64;
            dts += info.duration as u64;
        }
    }

    if samples.len() < sample_count {
        return Err(BdownError::mux("chunk tables describe fewer samples than stsz"));
    }
    Ok(samples)
}

const TFHD_BASE_DATA_OFFSET: u32 = 0x00_0001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x00_0002;
const TFHD_DEFAULT_DURATION: u32 = 0x00_0008;
const TFHD_DEFAULT_SIZE: u32 = 0x00_0010;
const TFHD_DEFAULT_FLAGS: u32 = 0x00_0020;

const TRUN_DATA_OFFSET: u32 = 0x00_0001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x00_0004;
const TRUN_DURATION: u32 = 0x00_0100;
const TRUN_SIZE: u32 = 0x00_0200;
const TRUN_FLAGS: u32 = 0x00_0400;
const TRUN_CTS_OFFSET: u32 = 0x00_0800;

/// Append the samples described by one `moof` to their tracks.
fn parse_moof(
    moof_offset: u64,
    moof: &Mp4Box,
    tracks: &mut [TrackState],
    file_len: u64,
) -> BdownResult<()> {
    for traf in moof.children() {
        let traf = traf?;
        if &traf.fourcc != b"traf" {
            continue;
        }

        let mut tfhd = required(&traf, b"tfhd")?.body();
        let (_, flags) = read_full_box_header(&mut tfhd, "tfhd")?;
        ensure(&tfhd, 4, "tfhd")?;
        let track_id = tfhd.get_u32();
        let Some(track) = tracks.iter_mut().find(|t| t.format.track_id == track_id) else {
            tracing::warn!("Skipping fragment of unknown track {track_id}");
            continue;
        };

        let mut defaults = track.defaults;
        let mut base = moof_offset;
        if flags & TFHD_BASE_DATA_OFFSET != 0 {
            ensure(&tfhd, 8, "tfhd")?;
            base = tfhd.get_u64();
        }
        if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
            ensure(&tfhd, 4, "tfhd")?;
            tfhd.advance(4);
        }
        if flags & TFHD_DEFAULT_DURATION != 0 {
            ensure(&tfhd, 4, "tfhd")?;
            defaults.duration = tfhd.get_u32();
        }
        if flags & TFHD_DEFAULT_SIZE != 0 {
            ensure(&tfhd, 4, "tfhd")?;
            defaults.size = tfhd.get_u32();
        }
        if flags & TFHD_DEFAULT_FLAGS != 0 {
            ensure(&tfhd, 4, "tfhd")?;
            defaults.flags = tfhd.get_u32();
        }

        if let Some(tfdt) = traf.child(b"tfdt")? {
            let mut tfdt = tfdt.body();
            let (version, _) = read_full_box_header(&mut tfdt, "tfdt")?;
            track.next_dts = if version == 1 {
                ensure(&tfdt, 8, "tfdt")?;
                tfdt.get_u64()
            } else {
                ensure(&tfdt, 4, "tfdt")?;
                tfdt.get_u32() as u64
            };
        }

        let mut data_end = base;
        for trun in traf.children() {
            let trun = trun?;
            if &trun.fourcc == b"trun" {
                data_end = parse_trun(trun.body(), base, data_end, &defaults, track, file_len)?;
            }
        }
    }
    Ok(())
}

/// Returns the offset right after the last sample of the run.
fn parse_trun(
    mut body: Bytes,
    base: u64,
    data_end: u64,
    defaults: &FragmentDefaults,
    track: &mut TrackState,
    file_len: u64,
) -> BdownResult<u64> {
    let (version, flags) = read_full_box_header(&mut body, "trun")?;
    ensure(&body, 4, "trun")?;
    let sample_count = body.get_u32();

    let mut offset = data_end;
    if flags & TRUN_DATA_OFFSET != 0 {
        ensure(&body, 4, "trun")?;
        offset = base
            .checked_add_signed(body.get_i32() as i64)
            .ok_or_else(|| BdownError::mux("trun data offset out of range"))?;
    }
    let mut first_flags = None;
    if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        ensure(&body, 4, "trun")?;
        first_flags = Some(body.get_u32());
    }

    let per_sample = [TRUN_DURATION, TRUN_SIZE, TRUN_FLAGS, TRUN_CTS_OFFSET]
        .iter()
        .filter(|bit| flags & **bit != 0)
        .count();
    ensure(&body, sample_count as usize * per_sample * 4, "trun")?;

    // without per-sample fields the count is only bounded by the sample data
    let min_size = if flags & TRUN_SIZE != 0 {
        1
    } else {
        defaults.size.max(1) as u64
    };
    if (sample_count as u64).saturating_mul(min_size) > file_len {
        return Err(BdownError::mux(format!(
            "trun of track {} describes more samples than the file holds",
            track.format.track_id
        )));
    }

    track.samples.reserve(sample_count as usize);
    for i in 0..sample_count {
        let duration = if flags & TRUN_DURATION != 0 {
            body.get_u32()
        } else {
            defaults.duration
        };
        let size = if flags & TRUN_SIZE != 0 {
            body.get_u32()
        } else {
            defaults.size
        };
        let mut sample_flags = if flags & TRUN_FLAGS != 0 {
            body.get_u32()
        } else {
            defaults.flags
        };
        if i == 0 {
            if let Some(first) = first_flags {
                sample_flags = first;
            }
        }
        let cts_offset = if flags & TRUN_CTS_OFFSET == 0 {
            0
        } else if version == 0 {
            body.get_u32() as i64
        } else {
            body.get_i32() as i64
        };

        let info = SampleInfo {
            size,
            dts: track.next_dts,
            cts_offset,
            duration,
            sync: sample_flags & NON_SYNC_SAMPLE_FLAG == 0,
        };
        track.samples.push(SampleEntry { offset, info });
        offset += size as u64;
        track.next_dts += duration as u64;
    }
    Ok(offset)
}
