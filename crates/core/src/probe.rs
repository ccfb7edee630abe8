//! Media probe extracting video attributes, container metadata and HDR types.
//!
//! Invokes ffprobe once with a fixed set of requested fields and parses the
//! JSON output. Fields with undetermined values default to `None` (or zero)
//! with a warning; the pixel aspect ratio defaults to `"1:1"`.

use crate::locking::{self, LockMode, DEFAULT_LOCK_TIMEOUT};
use crate::model::{FfmpegMetadata, HdrType, VideoAttributes};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe exited with a non-zero status.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// ffprobe binary was not found on the host.
    #[error("ffprobe is not found. Please ensure it is installed and in your PATH.")]
    ToolNotFound,

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    Parse(String),

    /// The probed file does not exist.
    #[error("File not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Lock(#[from] crate::locking::LockError),

    /// IO error while running ffprobe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream and format fields requested from ffprobe in one invocation.
const PROBE_ENTRIES: &str = "stream=width,height,codec_name,r_frame_rate,avg_frame_rate,tags,\
bit_rate,profile,pix_fmt,chroma_location,color_primaries,color_transfer,color_space,level,\
side_data_list:format=size,duration,bit_rate,nb_frames";

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use serde_json::Value;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct Stream {
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub profile: Option<String>,
        pub pix_fmt: Option<String>,
        pub chroma_location: Option<String>,
        pub color_primaries: Option<String>,
        pub color_transfer: Option<String>,
        pub color_space: Option<String>,
        pub level: Option<i64>,
        pub display_aspect_ratio: Option<String>,
        pub tags: Option<HashMap<String, Value>>,
        pub side_data_list: Option<Vec<SideData>>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct SideData {
        pub side_data_type: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Probe a video file, returning its stream attributes and container metadata.
///
/// Takes a shared file-operation lock for the duration of the ffprobe call.
pub fn probe_video(path: &Path) -> Result<(VideoAttributes, FfmpegMetadata), ProbeError> {
    let _lock = locking::acquire_file_operation_lock(path, LockMode::Shared, DEFAULT_LOCK_TIMEOUT)?;

    if !path.is_file() {
        return Err(ProbeError::NotFound(path.display().to_string()));
    }

    debug!("Executing ffprobe for {}", path.display());

    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "v", "-show_entries", PROBE_ENTRIES, "-of", "json"])
        .arg(path)
        .output()
        .map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ProbeError::ToolNotFound
            } else {
                ProbeError::Io(e)
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {} for {}: {}",
            output.status,
            path.display(),
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout, path)
}

/// Parse ffprobe JSON output into video attributes and container metadata.
pub fn parse_probe_output(
    json_str: &str,
    source: &Path,
) -> Result<(VideoAttributes, FfmpegMetadata), ProbeError> {
    let parsed: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let stream = parsed
        .streams
        .unwrap_or_default()
        .into_iter()
        .next()
        .unwrap_or_default();
    let format = parsed.format.unwrap_or_default();

    let attributes = extract_video_attributes(&stream, &format, source);
    let metadata = extract_ffmpeg_metadata(&stream, source);

    Ok((attributes, metadata))
}

fn extract_video_attributes(
    stream: &ffprobe_json::Stream,
    format: &ffprobe_json::Format,
    source: &Path,
) -> VideoAttributes {
    let codec = stream.codec_name.clone().unwrap_or_else(|| {
        warn!(
            "Codec name could not be determined for {}, defaulting to empty",
            source.display()
        );
        String::new()
    });

    let width_px = stream.width.unwrap_or_else(|| {
        warn!("Width could not be determined for {}, defaulting to 0", source.display());
        0
    });
    let height_px = stream.height.unwrap_or_else(|| {
        warn!("Height could not be determined for {}, defaulting to 0", source.display());
        0
    });

    let duration_seconds = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d >= 0.0)
        .unwrap_or_else(|| {
            warn!(
                "Duration could not be determined for {}, defaulting to 0.0",
                source.display()
            );
            0.0
        });

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .unwrap_or_else(|| {
            warn!("FPS could not be determined for {}, defaulting to 0.0", source.display());
            0.0
        });

    let average_bitrate_kilobits_per_second = stream
        .bit_rate
        .as_deref()
        .or(format.bit_rate.as_deref())
        .and_then(|b| b.parse::<f64>().ok())
        .map(|bps| bps / 1000.0)
        .unwrap_or_else(|| {
            warn!(
                "Bitrate could not be determined for {}, defaulting to 0.0",
                source.display()
            );
            0.0
        });

    VideoAttributes {
        codec,
        width_px,
        height_px,
        duration_seconds,
        fps,
        average_bitrate_kilobits_per_second,
    }
}

fn extract_ffmpeg_metadata(stream: &ffprobe_json::Stream, source: &Path) -> FfmpegMetadata {
    let tag_str = |key: &str| -> Option<String> {
        stream
            .tags
            .as_ref()
            .and_then(|tags| tags.get(key))
            .and_then(|value| value.as_str())
            .map(str::to_string)
    };

    let pixel_aspect_ratio = stream
        .display_aspect_ratio
        .clone()
        .or_else(|| tag_str("display_aspect_ratio"))
        .or_else(|| {
            warn!(
                "Pixel aspect ratio could not be determined for {}, defaulting to 1:1",
                source.display()
            );
            Some("1:1".to_string())
        });

    FfmpegMetadata {
        pixel_aspect_ratio,
        pixel_format: stream.pix_fmt.clone(),
        chroma_sample_location: stream.chroma_location.clone(),
        color_primaries: stream.color_primaries.clone(),
        color_trc: stream.color_transfer.clone(),
        colorspace: stream.color_space.clone(),
        profile: stream.profile.clone(),
        level: stream.level,
        hdr_types: detect_hdr_types(stream),
    }
}

/// Parse an ffprobe frame rate fraction such as `"30000/1001"`.
fn parse_frame_rate(fraction: &str) -> Option<f64> {
    let (numerator, denominator) = fraction.split_once('/')?;
    let numerator: f64 = numerator.trim().parse().ok()?;
    let denominator: f64 = denominator.trim().parse().ok()?;
    if denominator == 0.0 {
        return Some(0.0);
    }
    Some(numerator / denominator)
}

/// Detect the set of HDR kinds present in a video stream.
///
/// An empty set means SDR. Multiple kinds may coexist (e.g. PQ + HDR10, or
/// HDR10 + Dolby Vision on dual-layer content).
fn detect_hdr_types(stream: &ffprobe_json::Stream) -> BTreeSet<HdrType> {
    let mut detected = BTreeSet::new();

    let transfer = stream
        .color_transfer
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let is_pq = transfer == "smpte2084";
    let is_hlg = transfer == "arib-std-b67";

    if is_hlg {
        detected.insert(HdrType::Hlg);
    }
    if is_pq && !is_hlg {
        detected.insert(HdrType::Pq);
    }

    if stream
        .tags
        .as_ref()
        .map(|tags| tags.contains_key("dv_profile"))
        .unwrap_or(false)
    {
        detected.insert(HdrType::DolbyVision);
    }

    let mut has_static_metadata = false;

    for entry in stream.side_data_list.as_deref().unwrap_or_default() {
        let side_data_type = entry.side_data_type.as_deref().unwrap_or_default();

        if side_data_type.contains("DOVI") || side_data_type.contains("Dolby Vision") {
            detected.insert(HdrType::DolbyVision);
        }
        if side_data_type.contains("HDR Dynamic Metadata") && side_data_type.contains("2094-40") {
            detected.insert(HdrType::Hdr10Plus);
        }
        if side_data_type == "Mastering display metadata"
            || side_data_type == "Content light level settings"
        {
            has_static_metadata = true;
        }
    }

    if is_pq && has_static_metadata {
        detected.insert(HdrType::Hdr10);
    }

    detected
}
