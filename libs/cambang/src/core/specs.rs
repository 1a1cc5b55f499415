// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Camera and imaging spec stores.
//!
//! A spec is the hardware-reported truth plus optional user corrections.
//! Patches are opaque byte payloads that must parse as a JSON object; the
//! store is content-addressed, so re-applying identical content is a no-op
//! and does not bump the version. A patch may carry a `"capabilities"` key
//! to replace the capability set used by profile validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, Result};
use super::formats;

/// When a spec patch takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyMode {
    /// Defer until no affected device is engaged and no in-flight capture
    /// depends on the spec; retried after each relevant state transition.
    WhenSafe,
    /// Apply immediately or fail with `BadState`.
    Now,
}

/// One advertised operating mode of a camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityMode {
    pub max_width: u32,
    pub max_height: u32,
    pub fps_min: u32,
    pub fps_max: u32,
    pub stream_formats: Vec<u32>,
    pub still_formats: Vec<u32>,
}

/// Union of capability modes a device may be driven in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub modes: Vec<CapabilityMode>,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            modes: vec![CapabilityMode {
                max_width: 1920,
                max_height: 1080,
                fps_min: 1,
                fps_max: 60,
                stream_formats: vec![
                    formats::FOURCC_NV12,
                    formats::FOURCC_I420,
                    formats::FOURCC_RGBA,
                ],
                still_formats: vec![
                    formats::FOURCC_JPEG,
                    formats::FOURCC_RAW,
                    formats::FOURCC_NV12,
                ],
            }],
        }
    }
}

impl CapabilitySet {
    /// Whether any mode can carry a repeating stream with this shape.
    pub fn supports_stream(&self, width: u32, height: u32, fps_min: u32, fps_max: u32, format: u32) -> bool {
        self.modes.iter().any(|m| {
            width <= m.max_width
                && height <= m.max_height
                && fps_min >= m.fps_min
                && fps_max <= m.fps_max
                && m.stream_formats.contains(&format)
        })
    }

    /// Whether any mode can produce a still with this shape.
    pub fn supports_still(&self, width: u32, height: u32, format: u32) -> bool {
        self.modes.iter().any(|m| {
            width <= m.max_width && height <= m.max_height && m.still_formats.contains(&format)
        })
    }

    /// Default fps range used when a profile leaves fps unspecified.
    pub fn default_fps_range(&self) -> (u32, u32) {
        self.modes
            .first()
            .map(|m| (m.fps_min, m.fps_max))
            .unwrap_or((1, 30))
    }
}

/// Effective per-hardware camera spec.
#[derive(Debug, Clone)]
pub struct CameraSpec {
    pub version: u64,
    pub capabilities: CapabilitySet,
    payload: Vec<u8>,
}

impl Default for CameraSpec {
    fn default() -> Self {
        Self {
            version: 1,
            capabilities: CapabilitySet::default(),
            payload: Vec::new(),
        }
    }
}

/// Structured view of a spec patch document. Unknown keys are preserved in
/// the opaque payload but ignored here.
#[derive(Debug, Deserialize)]
struct PatchDocument {
    capabilities: Option<CapabilitySet>,
}

/// Validate a patch payload without applying it.
pub(crate) fn validate_spec_patch(patch: &[u8]) -> Result<()> {
    validate_patch(patch).map(|_| ())
}

/// Validate a patch payload: non-empty and a JSON object.
fn validate_patch(patch: &[u8]) -> Result<PatchDocument> {
    if patch.is_empty() {
        return Err(CoreError::InvalidArgument("empty spec patch".into()));
    }
    let value: serde_json::Value = serde_json::from_slice(patch)
        .map_err(|e| CoreError::InvalidArgument(format!("spec patch is not JSON: {e}")))?;
    if !value.is_object() {
        return Err(CoreError::InvalidArgument(
            "spec patch must be a JSON object".into(),
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| CoreError::InvalidArgument(format!("malformed capabilities: {e}")))
}

/// Per-hardware camera spec store.
#[derive(Debug, Default)]
pub struct CameraSpecStore {
    specs: HashMap<String, CameraSpec>,
}

impl CameraSpecStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective spec for a hardware id (default spec if never patched).
    pub fn spec(&self, hardware_id: &str) -> CameraSpec {
        self.specs.get(hardware_id).cloned().unwrap_or_default()
    }

    pub fn version(&self, hardware_id: &str) -> u64 {
        self.specs.get(hardware_id).map(|s| s.version).unwrap_or(1)
    }

    /// Apply a validated patch. Returns the new version, or `None` when the
    /// content was identical and nothing changed.
    pub fn apply_patch(&mut self, hardware_id: &str, patch: &[u8]) -> Result<Option<u64>> {
        let document = validate_patch(patch)?;
        let spec = self.specs.entry(hardware_id.to_string()).or_default();
        if spec.payload == patch {
            return Ok(None);
        }
        if let Some(capabilities) = document.capabilities {
            spec.capabilities = capabilities;
        }
        spec.payload = patch.to_vec();
        spec.version += 1;
        Ok(Some(spec.version))
    }
}

/// Global imaging spec store.
#[derive(Debug)]
pub struct ImagingSpecStore {
    version: u64,
    payload: Vec<u8>,
}

impl Default for ImagingSpecStore {
    fn default() -> Self {
        Self {
            version: 1,
            payload: Vec::new(),
        }
    }
}

impl ImagingSpecStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply a validated patch; identical content is an idempotent no-op.
    pub fn apply_patch(&mut self, patch: &[u8]) -> Result<Option<u64>> {
        validate_patch(patch)?;
        if self.payload == patch {
            return Ok(None);
        }
        self.payload = patch.to_vec();
        self.version += 1;
        Ok(Some(self.version))
    }
}

/// A `WhenSafe` patch waiting for its safety condition.
#[derive(Debug, Clone)]
pub enum PendingPatch {
    Camera { hardware_id: String, patch: Vec<u8> },
    Imaging { patch: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capabilities_cover_common_profiles() {
        let caps = CapabilitySet::default();
        assert!(caps.supports_stream(1280, 720, 1, 30, formats::FOURCC_NV12));
        assert!(caps.supports_still(1920, 1080, formats::FOURCC_JPEG));
        assert!(!caps.supports_stream(1280, 720, 1, 30, formats::FOURCC_JPEG));
        assert!(!caps.supports_stream(4096, 2160, 1, 30, formats::FOURCC_NV12));
    }

    #[test]
    fn test_patch_bumps_version_once_per_content() {
        let mut store = CameraSpecStore::new();
        assert_eq!(store.version("camA"), 1);

        let patch = br#"{"note":"tuned"}"#;
        assert_eq!(store.apply_patch("camA", patch).unwrap(), Some(2));
        // Identical content: no version bump.
        assert_eq!(store.apply_patch("camA", patch).unwrap(), None);
        assert_eq!(store.version("camA"), 2);

        assert_eq!(
            store.apply_patch("camA", br#"{"note":"tuned again"}"#).unwrap(),
            Some(3)
        );
    }

    #[test]
    fn test_patch_can_replace_capabilities() {
        let mut store = CameraSpecStore::new();
        let caps = CapabilitySet {
            modes: vec![CapabilityMode {
                max_width: 640,
                max_height: 480,
                fps_min: 1,
                fps_max: 15,
                stream_formats: vec![formats::FOURCC_NV12],
                still_formats: vec![formats::FOURCC_JPEG],
            }],
        };
        let document = serde_json::json!({ "capabilities": caps });
        let payload = serde_json::to_vec(&document).unwrap();
        store.apply_patch("camA", &payload).unwrap();

        let spec = store.spec("camA");
        assert!(spec.capabilities.supports_stream(640, 480, 1, 15, formats::FOURCC_NV12));
        assert!(!spec.capabilities.supports_stream(1280, 720, 1, 15, formats::FOURCC_NV12));
    }

    #[test]
    fn test_invalid_patches_rejected() {
        let mut store = CameraSpecStore::new();
        assert!(matches!(
            store.apply_patch("camA", b""),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.apply_patch("camA", b"not json"),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.apply_patch("camA", b"[1,2,3]"),
            Err(CoreError::InvalidArgument(_))
        ));
        assert_eq!(store.version("camA"), 1);
    }

    #[test]
    fn test_imaging_store_idempotent_at_same_content() {
        let mut store = ImagingSpecStore::new();
        assert_eq!(store.version(), 1);
        assert_eq!(store.apply_patch(br#"{"tone":"neutral"}"#).unwrap(), Some(2));
        assert_eq!(store.apply_patch(br#"{"tone":"neutral"}"#).unwrap(), None);
        assert_eq!(store.version(), 2);
    }
}
