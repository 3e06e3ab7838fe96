//! Synthetic MP4 builders.
//!
//! Available to the crate's own tests and, with the `test-utils` feature, to
//! downstream tests.

/// Sample entry fields before the child boxes, `data_reference_index` included.
const VISUAL_SAMPLE_ENTRY_HEADER: usize = 78;
const AUDIO_SAMPLE_ENTRY_HEADER: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureSample {
    pub data: Vec<u8>,
    pub duration: u32,
    pub sync: bool,
    pub cts_offset: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureTrack {
    pub track_id: u32,
    pub handler: [u8; 4],
    pub sample_entry: [u8; 4],
    pub timescale: u32,
    pub width: u16,
    pub height: u16,
    /// Decode time of the first fragment.
    pub start_dts: u64,
    pub samples: Vec<FixtureSample>,
}

impl FixtureTrack {
    /// 1080p AVC track with a keyframe every 5 samples and reordered frames.
    pub fn video(sample_count: usize) -> Self {
        let samples = (0..sample_count)
            .map(|i| FixtureSample {
                data: pattern(i, 100 + (i * 37) % 50),
                duration: 512,
                sync: i % 5 == 0,
                cts_offset: [0, 1024, -512][i % 3],
            })
            .collect();

        Self {
            track_id: 1,
            handler: *b"vide",
            sample_entry: *b"avc1",
            timescale: 12800,
            width: 1920,
            height: 1080,
            start_dts: 0,
            samples,
        }
    }

    /// 48kHz AAC track, every sample a sync sample.
    pub fn audio(sample_count: usize) -> Self {
        let samples = (0..sample_count)
            .map(|i| FixtureSample {
                data: pattern(i + 7, 200 + i % 7),
                duration: 1024,
                sync: true,
                cts_offset: 0,
            })
            .collect();

        Self {
            track_id: 1,
            handler: *b"soun",
            sample_entry: *b"mp4a",
            timescale: 48000,
            width: 0,
            height: 0,
            start_dts: 0,
            samples,
        }
    }

    pub fn with_start_dts(mut self, start_dts: u64) -> Self {
        self.start_dts = start_dts;
        self
    }
}

fn pattern(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|j| (seed * 31 + j) as u8).collect()
}

pub fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

pub fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

fn make_sample_entry(fourcc: &[u8; 4], header_len: usize, children: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; header_len];
    // data_reference_index
    body[6..8].copy_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(children);
    make_box(fourcc, &body)
}

fn make_stsd(track: &FixtureTrack) -> Vec<u8> {
    let entry = if &track.handler == b"vide" {
        let avcc = make_box(b"avcC", &[1, 0x64, 0, 0x28, 0xff, 0xe1, 0, 0]);
        make_sample_entry(&track.sample_entry, VISUAL_SAMPLE_ENTRY_HEADER, &avcc)
    } else {
        let esds = make_full_box(b"esds", 0, 0, &[3, 25, 0, 1, 0, 4, 17, 0x40, 0x15]);
        make_sample_entry(&track.sample_entry, AUDIO_SAMPLE_ENTRY_HEADER, &esds)
    };

    let mut payload = 1u32.to_be_bytes().to_vec();
    payload.extend_from_slice(&entry);
    make_full_box(b"stsd", 0, 0, &payload)
}

fn make_trak(track: &FixtureTrack) -> Vec<u8> {
    let mut tkhd = Vec::new();
    tkhd.extend_from_slice(&[0u8; 8]); // creation, modification
    tkhd.extend_from_slice(&track.track_id.to_be_bytes());
    tkhd.extend_from_slice(&[0u8; 4 + 4 + 8 + 2 + 2]);
    let volume: u16 = if &track.handler == b"soun" { 0x0100 } else { 0 };
    tkhd.extend_from_slice(&volume.to_be_bytes());
    tkhd.extend_from_slice(&[0u8; 2]);
    for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        tkhd.extend_from_slice(&value.to_be_bytes());
    }
    tkhd.extend_from_slice(&((track.width as u32) << 16).to_be_bytes());
    tkhd.extend_from_slice(&((track.height as u32) << 16).to_be_bytes());
    let tkhd = make_full_box(b"tkhd", 0, 3, &tkhd);

    let mut mdhd = Vec::new();
    mdhd.extend_from_slice(&[0u8; 8]);
    mdhd.extend_from_slice(&track.timescale.to_be_bytes());
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&0x55c4u16.to_be_bytes()); // und
    mdhd.extend_from_slice(&[0u8; 2]);
    let mdhd = make_full_box(b"mdhd", 0, 0, &mdhd);

    let mut hdlr = vec![0u8; 4];
    hdlr.extend_from_slice(&track.handler);
    hdlr.extend_from_slice(&[0u8; 12]);
    hdlr.extend_from_slice(b"fixture\0");
    let hdlr = make_full_box(b"hdlr", 0, 0, &hdlr);

    let media_header = if &track.handler == b"vide" {
        make_full_box(b"vmhd", 0, 1, &[0u8; 8])
    } else {
        make_full_box(b"smhd", 0, 0, &[0u8; 4])
    };
    let url = make_full_box(b"url ", 0, 1, &[]);
    let mut dref = 1u32.to_be_bytes().to_vec();
    dref.extend_from_slice(&url);
    let dinf = make_box(b"dinf", &make_full_box(b"dref", 0, 0, &dref));

    let empty_table = 0u32.to_be_bytes();
    let stbl = [
        make_stsd(track),
        make_full_box(b"stts", 0, 0, &empty_table),
        make_full_box(b"stsc", 0, 0, &empty_table),
        make_full_box(b"stsz", 0, 0, &[0u8; 8]),
        make_full_box(b"stco", 0, 0, &empty_table),
    ]
    .concat();

    let minf = [media_header, dinf, make_box(b"stbl", &stbl)].concat();
    let mdia = [mdhd, hdlr, make_box(b"minf", &minf)].concat();
    make_box(b"trak", &[tkhd, make_box(b"mdia", &mdia)].concat())
}

fn make_moov(track: &FixtureTrack) -> Vec<u8> {
    let mut mvhd = Vec::new();
    mvhd.extend_from_slice(&[0u8; 8]);
    mvhd.extend_from_slice(&1000u32.to_be_bytes());
    mvhd.extend_from_slice(&0u32.to_be_bytes());
    mvhd.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    mvhd.extend_from_slice(&0x0100u16.to_be_bytes());
    mvhd.extend_from_slice(&[0u8; 10 + 36 + 24]);
    mvhd.extend_from_slice(&(track.track_id + 1).to_be_bytes());
    let mvhd = make_full_box(b"mvhd", 0, 0, &mvhd);

    let mut trex = Vec::new();
    trex.extend_from_slice(&track.track_id.to_be_bytes());
    trex.extend_from_slice(&1u32.to_be_bytes());
    trex.extend_from_slice(&[0u8; 12]);
    let mvex = make_box(b"mvex", &make_full_box(b"trex", 0, 0, &trex));

    make_box(b"moov", &[mvhd, make_trak(track), mvex].concat())
}

fn make_fragment(track: &FixtureTrack, sequence: u32, base_dts: u64, samples: &[FixtureSample]) -> Vec<u8> {
    let mfhd = make_full_box(b"mfhd", 0, 0, &sequence.to_be_bytes());

    // default-base-is-moof
    let tfhd = make_full_box(b"tfhd", 0, 0x02_0000, &track.track_id.to_be_bytes());
    let tfdt = make_full_box(b"tfdt", 1, 0, &base_dts.to_be_bytes());

    // data offset, duration, size, flags, composition offset
    let trun_flags = 0x000001 | 0x000100 | 0x000200 | 0x000400 | 0x000800;
    let mut trun = Vec::new();
    trun.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    trun.extend_from_slice(&0i32.to_be_bytes());
    for sample in samples {
        let flags: u32 = if sample.sync { 0x0200_0000 } else { 0x0101_0000 };
        trun.extend_from_slice(&sample.duration.to_be_bytes());
        trun.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
        trun.extend_from_slice(&flags.to_be_bytes());
        trun.extend_from_slice(&sample.cts_offset.to_be_bytes());
    }
    let mut trun = make_full_box(b"trun", 1, trun_flags, &trun);

    // the payload starts right after the moof and the mdat header
    let moof_len = 8 + mfhd.len() + 8 + tfhd.len() + tfdt.len() + trun.len();
    let data_offset = (moof_len + 8) as i32;
    let data_offset_pos = 8 + 4 + 4;
    trun[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

    let traf = make_box(b"traf", &[tfhd, tfdt, trun].concat());
    let moof = make_box(b"moof", &[mfhd, traf].concat());
    let payload: Vec<u8> = samples.iter().flat_map(|s| s.data.iter().copied()).collect();
    [moof, make_box(b"mdat", &payload)].concat()
}

/// A fragmented file with `samples_per_fragment` samples in each `moof`/`mdat` pair.
pub fn make_fragmented_mp4(track: &FixtureTrack, samples_per_fragment: usize) -> Vec<u8> {
    let mut out = make_box(b"ftyp", b"iso6\0\0\0\0iso6dash");
    out.extend_from_slice(&make_moov(track));

    let mut base_dts = track.start_dts;
    for (sequence, chunk) in track
        .samples
        .chunks(samples_per_fragment.max(1))
        .enumerate()
    {
        out.extend_from_slice(&make_fragment(track, sequence as u32 + 1, base_dts, chunk));
        base_dts += chunk.iter().map(|s| s.duration as u64).sum::<u64>();
    }
    out
}
