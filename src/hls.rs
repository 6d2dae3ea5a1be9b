// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! HLS profile derivation and master playlist emission.
//!
//! For each camera we derive an adaptive-bitrate ladder from the source
//! geometry, cap it by the user's resolution/bitrate limits, and append a
//! remux rendition (re-containerized, not re-encoded) when the source is
//! already H.264 within those limits. The segmenter writes media playlists
//! per profile; this module writes the master playlist enumerating them.
//!
//! Ladder choices follow the usual industry guidance for HLS bitrates
//! (bitmovin's streaming ladder write-up and Apple TN2224).

use base::clock::Clocks;
use base::{bail, err, Error};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Stand-in bitrate when the source advertises none.
const DUMMY_BITRATE: u32 = 5_000_000;

const RENAME_RETRIES: u32 = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum H264Profile {
    Baseline,
    Main,
    High,
    Extended,
}

impl H264Profile {
    fn codec_prefix(self) -> &'static str {
        match self {
            H264Profile::Baseline => "42E0",
            H264Profile::Main => "4D40",
            H264Profile::High => "6400",
            H264Profile::Extended => "58A0",
        }
    }
}

/// `avc1.` codec string for a profile/level pair, per the RFC 6381 rules
/// for H.264. Levels outside the deployable set are refused.
pub fn h264_codec_string(profile: H264Profile, level: u32) -> Option<String> {
    match level {
        30 | 31 | 32 | 40 | 41 | 42 | 50 | 51 => {
            Some(format!("{}{:X}", profile.codec_prefix(), level))
        }
        _ => None,
    }
}

struct LadderRung {
    bitrate: u32,
    fps: u32,
    height_4_3: u32,
    height_16_9: u32,
    profile: H264Profile,
    level: u32,
}

#[rustfmt::skip]
const LADDER: [LadderRung; 6] = [
    LadderRung { bitrate: 145_000,   fps: 10, height_4_3: 234,  height_16_9: 300,  profile: H264Profile::Baseline, level: 30 },
    LadderRung { bitrate: 365_000,   fps: 10, height_4_3: 270,  height_16_9: 360,  profile: H264Profile::Baseline, level: 30 },
    LadderRung { bitrate: 730_000,   fps: 12, height_4_3: 360,  height_16_9: 480,  profile: H264Profile::Baseline, level: 31 },
    LadderRung { bitrate: 2_000_000, fps: 12, height_4_3: 540,  height_16_9: 720,  profile: H264Profile::Baseline, level: 32 },
    LadderRung { bitrate: 4_500_000, fps: 15, height_4_3: 720,  height_16_9: 960,  profile: H264Profile::Baseline, level: 40 },
    LadderRung { bitrate: 7_800_000, fps: 15, height_4_3: 1080, height_16_9: 1440, profile: H264Profile::Baseline, level: 41 },
];

#[derive(Clone, Debug)]
pub struct HlsProfile {
    pub id: u32,
    pub bitrate: u32,
    /// Target FPS for re-encoded renditions; zero for remux.
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub profile: H264Profile,
    pub level: u32,
    pub remux: bool,
}

/// What the ladder derivation needs to know about the source stream.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Present when the source is H.264 and could be remuxed directly.
    pub h264: Option<SourceH264>,
    pub has_audio: bool,
}

#[derive(Copy, Clone, Debug)]
pub struct SourceH264 {
    pub profile: H264Profile,
    pub level: u32,
    /// Zero when the source doesn't advertise one.
    pub bitrate: u32,
}

/// Derives the profile ladder for a source. `max_res` / `max_bitrate`
/// cap renditions; zero means unlimited.
pub fn create_profiles(src: &SourceInfo, max_res: u32, max_bitrate: u32) -> Vec<HlsProfile> {
    // Aspect switch at ~1.35, splitting 4:3 (1.33) from wide modes.
    let is_4_3 = src.width as u64 * 100 <= src.height as u64 * 135;
    let derive_width = |h: u32| (h as u64 * src.width as u64).div_ceil(src.height as u64) as u32;

    let remux = src.h264.filter(|h| {
        let capped = (max_res > 0 && src.height > max_res)
            || (max_bitrate > 0 && h.bitrate > max_bitrate);
        if capped {
            debug!("skipping remux profile due to user settings");
        }
        !capped
    });
    let remux_bitrate = remux.map(|h| if h.bitrate == 0 { DUMMY_BITRATE } else { h.bitrate });

    let mut out: Vec<HlsProfile> = Vec::new();
    for rung in &LADDER {
        let mut h = if is_4_3 { rung.height_4_3 } else { rung.height_16_9 };
        // Don't go over the remux bitrate; if a rung would, aim between
        // the previous rung and the remux rate.
        let bitrate = match remux_bitrate {
            Some(rb) if rung.bitrate >= rb && !out.is_empty() => {
                out.last().expect("non-empty").bitrate / 2 + rb / 2
            }
            _ => rung.bitrate,
        };

        let mut use_rung = h < src.height && h != 0;
        if (max_res > 0 && h > max_res) || (max_bitrate > 0 && rung.bitrate > max_bitrate) {
            use_rung = false;
        }
        if !use_rung && out.is_empty() && remux.is_none() {
            // Not a single rung fits, probably a very low resolution
            // source; serve it at its own height.
            h = src.height;
            use_rung = true;
        }
        info!(
            "{} profile {}: h={h} streamHeight={} profile={:?} level={}",
            if use_rung { "using" } else { "skipping" },
            out.len() + 1,
            src.height,
            rung.profile,
            rung.level,
        );
        if !use_rung {
            break;
        }
        out.push(HlsProfile {
            id: out.len() as u32 + 1,
            bitrate,
            fps: rung.fps,
            width: derive_width(h),
            height: h,
            profile: rung.profile,
            level: rung.level,
            remux: false,
        });
    }

    if let (Some(h), Some(bitrate)) = (remux, remux_bitrate) {
        info!(
            "adding remux profile {}: streamHeight={} profile={:?} level={}",
            out.len() + 1,
            src.height,
            h.profile,
            h.level,
        );
        out.push(HlsProfile {
            id: out.len() as u32 + 1,
            bitrate,
            fps: 0,
            width: src.width,
            height: src.height,
            profile: h.profile,
            level: h.level,
            remux: true,
        });
    }

    out
}

/// The media playlist filename a profile's segmenter writes, relative to
/// the master playlist.
pub fn variant_playlist_name(master: &Path, profile_id: u32) -> String {
    let stem = master
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}-{profile_id}.m3u8")
}

/// Writes the master playlist enumerating every profile, to a temporary
/// sibling first, then renamed into place. The rename retries with backoff:
/// a player may hold the old playlist open on some filesystems.
pub fn write_master_playlist(
    clocks: &Arc<dyn Clocks>,
    path: &Path,
    profiles: &[HlsProfile],
    has_audio: bool,
) -> Result<(), Error> {
    let tmp = path.with_file_name(format!(
        "{}-{}.tmp",
        path.file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        clocks.wall_ms(),
    ));

    {
        let mut f = std::fs::File::create(&tmp)
            .map_err(|e| err!(Io, "failed to create master HLS file at {}: {e}", tmp.display()))?;
        writeln!(f, "#EXTM3U")?;
        writeln!(f, "#EXT-X-VERSION:3")?;
        writeln!(f, "#EXT-X-INDEPENDENT-SEGMENTS")?;
        for p in profiles {
            let Some(codec) = h264_codec_string(p.profile, p.level) else {
                error!(
                    "failed to generate H264 codec string for profile={:?} level={}",
                    p.profile, p.level
                );
                continue;
            };
            writeln!(
                f,
                "#EXT-X-STREAM-INF:BANDWIDTH={},AVERAGE-BANDWIDTH={},RESOLUTION={}x{},CODECS=\"avc1.{}{}\"",
                p.bitrate,
                p.bitrate,
                p.width,
                p.height,
                codec,
                if has_audio { ",mp4a.40.2" } else { "" },
            )?;
            writeln!(f, "{}", variant_playlist_name(path, p.id))?;
        }
        f.flush()?;
    }

    let mut retries = 0;
    loop {
        match std::fs::rename(&tmp, path) {
            Ok(()) => return Ok(()),
            Err(_) if retries < RENAME_RETRIES => {
                retries += 1;
                clocks.sleep(Duration::from_millis(10 * retries as u64));
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                bail!(
                    Io,
                    "failed to move HLS file from {} to {}: {e}",
                    tmp.display(),
                    path.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::RealClocks;

    fn hd_h264_source() -> SourceInfo {
        SourceInfo {
            width: 1280,
            height: 720,
            h264: Some(SourceH264 {
                profile: H264Profile::Baseline,
                level: 31,
                bitrate: 2_000_000,
            }),
            has_audio: false,
        }
    }

    #[test]
    fn ladder_for_720p_h264_source() {
        let profiles = create_profiles(&hd_h264_source(), 0, 0);
        // Three re-encoded variants below the source height plus a remux.
        assert_eq!(profiles.len(), 4);
        let heights: Vec<u32> = profiles.iter().map(|p| p.height).collect();
        assert_eq!(heights, vec![300, 360, 480, 720]);
        // Aspect-ratio-preserving widths derived from 16:9.
        let widths: Vec<u32> = profiles.iter().map(|p| p.width).collect();
        assert_eq!(widths, vec![534, 640, 854, 1280]);
        let remux = profiles.last().unwrap();
        assert!(remux.remux);
        assert_eq!(remux.bitrate, 2_000_000);
        assert_eq!(remux.fps, 0);
        assert!(profiles[..3].iter().all(|p| !p.remux));
    }

    #[test]
    fn four_three_sources_use_their_own_heights() {
        let src = SourceInfo {
            width: 640,
            height: 480,
            h264: None,
            has_audio: false,
        };
        let profiles = create_profiles(&src, 0, 0);
        let heights: Vec<u32> = profiles.iter().map(|p| p.height).collect();
        assert_eq!(heights, vec![234, 270, 360]);
    }

    #[test]
    fn tiny_source_gets_single_fallback_profile() {
        let src = SourceInfo {
            width: 160,
            height: 120,
            h264: None,
            has_audio: false,
        };
        let profiles = create_profiles(&src, 0, 0);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].height, 120);
        assert!(!profiles[0].remux);
    }

    #[test]
    fn caps_limit_the_ladder() {
        let profiles = create_profiles(&hd_h264_source(), 400, 0);
        // Height cap cuts the ladder and the remux rendition.
        let heights: Vec<u32> = profiles.iter().map(|p| p.height).collect();
        assert_eq!(heights, vec![300, 360]);
        assert!(profiles.iter().all(|p| !p.remux));

        let profiles = create_profiles(&hd_h264_source(), 0, 500_000);
        assert!(profiles.iter().all(|p| p.bitrate <= 500_000));
    }

    #[test]
    fn midpoint_bitrate_below_remux_rate() {
        let mut src = hd_h264_source();
        src.h264.as_mut().unwrap().bitrate = 1_000_000;
        let profiles = create_profiles(&src, 0, 0);
        // The 730k rung sits under 1 Mb/s; the 2 Mb/s rung would overshoot
        // the remux rate, so nothing between it and the remux is emitted.
        let h480 = profiles.iter().find(|p| p.height == 480).unwrap();
        assert_eq!(h480.bitrate, 730_000);
        let remux = profiles.last().unwrap();
        assert!(remux.remux);
        assert_eq!(remux.bitrate, 1_000_000);
    }

    #[test]
    fn codec_strings() {
        assert_eq!(
            h264_codec_string(H264Profile::Baseline, 31).as_deref(),
            Some("42E01F")
        );
        assert_eq!(
            h264_codec_string(H264Profile::Main, 40).as_deref(),
            Some("4D4028")
        );
        assert_eq!(
            h264_codec_string(H264Profile::High, 51).as_deref(),
            Some("640033")
        );
        assert_eq!(h264_codec_string(H264Profile::Baseline, 99), None);
    }

    #[test]
    fn master_playlist_contents_and_rename() {
        crate::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam1.m3u8");
        let clocks: Arc<dyn Clocks> = Arc::new(RealClocks);
        let profiles = create_profiles(&hd_h264_source(), 0, 0);
        write_master_playlist(&clocks, &path, &profiles, true).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-INDEPENDENT-SEGMENTS\n"));
        assert!(text.contains(
            "#EXT-X-STREAM-INF:BANDWIDTH=145000,AVERAGE-BANDWIDTH=145000,\
             RESOLUTION=534x300,CODECS=\"avc1.42E01E,mp4a.40.2\"\ncam1-1.m3u8\n"
        ));
        // The remux variant advertises the source's own codec string.
        assert!(text.contains("RESOLUTION=1280x720,CODECS=\"avc1.42E01F,mp4a.40.2\"\ncam1-4.m3u8"));
        // No temporary files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .collect();
        assert!(leftovers.is_empty());
    }
}
