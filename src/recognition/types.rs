use std::ffi::c_void;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::errors::{TowerError, TowerResult};

/// Bounding box in frame pixel coordinates.
/// Serialized as `[x, y, width, height]`, which is how the host ships boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// True if the box lies entirely inside a `width` x `height` frame.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = i64::from(self.x) + i64::from(self.width);
        let bottom = i64::from(self.y) + i64::from(self.height);
        self.x >= 0 && self.y >= 0 && right <= i64::from(width) && bottom <= i64::from(height)
    }
}

impl From<[i32; 4]> for Rect {
    fn from([x, y, width, height]: [i32; 4]) -> Self {
        Self { x, y, width, height }
    }
}

impl From<Rect> for [i32; 4] {
    fn from(r: Rect) -> Self {
        [r.x, r.y, r.width, r.height]
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.x, self.y, self.width, self.height)
    }
}

/// Host-owned image buffer the frame was captured into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeImage(NonNull<c_void>);

// SAFETY: the buffer is owned by the host and stays valid for the whole
// recognition callback it was passed to; it is only ever read through the
// host API, never dereferenced here.
unsafe impl Send for NativeImage {}
unsafe impl Sync for NativeImage {}

impl NativeImage {
    pub fn new(ptr: *const c_void) -> Option<Self> {
        NonNull::new(ptr.cast_mut()).map(Self)
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.0.as_ptr()
    }
}

/// A captured frame, borrowed from the host for one invocation.
///
/// Pixel data stays in the host buffer and is handed back untouched on
/// every probe. Must not outlive the invocation it was created for.
#[derive(Debug)]
pub struct Frame {
    width: u32,
    height: u32,
    native: Option<NativeImage>,
}

impl Frame {
    pub fn from_native(native: NativeImage, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            native: Some(native),
        }
    }

    /// A frame with known size but no host buffer behind it.
    pub fn detached(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            native: None,
        }
    }

    pub fn native(&self) -> Option<NativeImage> {
        self.native
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Result of one `run_recognition` call, produced by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionDetail {
    #[serde(default)]
    pub reco_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub algorithm: String,
    pub hit: bool,
    #[serde(default, rename = "box", skip_serializing_if = "Option::is_none")]
    pub best_box: Option<Rect>,
    /// Raw algorithm output, kept for logging only.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl RecognitionDetail {
    pub fn hit(rect: Rect) -> Self {
        Self {
            hit: true,
            best_box: Some(rect),
            ..Self::default()
        }
    }

    pub fn miss() -> Self {
        Self::default()
    }

    /// The best box, read only after the hit flag has been checked.
    ///
    /// `Ok(None)` for a miss. A hit that carries no box is a probe failure.
    pub fn hit_box(&self) -> TowerResult<Option<Rect>> {
        if !self.hit {
            return Ok(None);
        }
        self.best_box.map(Some).ok_or_else(|| {
            TowerError::Probe(format!(
                "host reported a hit for '{}' without a bounding box",
                self.name
            ))
        })
    }
}

/// Arguments of one custom-recognition invocation.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzeArgs<'a> {
    pub task: &'a str,
    pub name: &'a str,
    pub custom_param: &'a serde_json::Value,
    pub frame: &'a Frame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeResult {
    /// `None` tells the host nothing was recognized.
    pub rect: Option<Rect>,
    pub detail: String,
}

#[cfg(test)]
pub(crate) fn test_frame(width: u32, height: u32) -> Frame {
    Frame::detached(width, height)
}
