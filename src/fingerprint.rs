//! Content fingerprints for upstream change detection.
//!
//! A [`ContentFingerprint`] accumulates the position, normal and UV streams
//! of one or more content entities (meshes) and produces one SHA-256 digest
//! per aspect. Each element is hashed together with its index, so permuting
//! a vertex stream changes the result. Distinct entities are keyed by id and
//! combined in sorted order, so the order in which entities are visited does
//! not.
//!
//! ```text
//! set_target(mesh) ─▶ accumulate_points()   ─┐
//!                    accumulate_normals()   ─┼─▶ digest() = { points, normals, uvmap }
//!                    accumulate_uvmap("")   ─┘
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Per-entity digests: entity id → aspect name → hex digest.
pub type FingerprintProfile = BTreeMap<String, BTreeMap<String, String>>;

/// Geometry of one content entity, exported by host-side glue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshContent {
    /// Stable id of the entity (survives renames in the host scene).
    pub id: String,
    #[serde(default)]
    pub points: Vec<[f64; 3]>,
    #[serde(default)]
    pub normals: Vec<[f64; 3]>,
    /// UV sets keyed by set name.
    #[serde(default)]
    pub uvs: BTreeMap<String, Vec<[f64; 2]>>,
    /// UV set used when no channel is requested.
    #[serde(default)]
    pub current_uv: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Aspect {
    Points,
    Normals,
    UvMap,
}

impl Aspect {
    fn as_str(self) -> &'static str {
        match self {
            Aspect::Points => "points",
            Aspect::Normals => "normals",
            Aspect::UvMap => "uvmap",
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("no fingerprint target set; call set_target first")]
    NoTarget,

    #[error("mesh '{mesh}' has no UV set named '{channel}'")]
    UnknownUvSet { mesh: String, channel: String },
}

/// Rolling fingerprint over one or more content entities.
#[derive(Debug, Default)]
pub struct ContentFingerprint<'a> {
    target: Option<&'a MeshContent>,
    contributions: BTreeMap<Aspect, BTreeMap<String, [u8; 32]>>,
}

impl<'a> ContentFingerprint<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the entity subsequent `accumulate_*` calls read from.
    pub fn set_target(&mut self, mesh: &'a MeshContent) {
        self.target = Some(mesh);
    }

    pub fn accumulate_points(&mut self) -> Result<(), FingerprintError> {
        let mesh = self.target.ok_or(FingerprintError::NoTarget)?;
        let hash = hash_stream(mesh.points.iter().map(|p| p.as_slice()));
        self.contribute(Aspect::Points, &mesh.id, hash);
        Ok(())
    }

    pub fn accumulate_normals(&mut self) -> Result<(), FingerprintError> {
        let mesh = self.target.ok_or(FingerprintError::NoTarget)?;
        let hash = hash_stream(mesh.normals.iter().map(|n| n.as_slice()));
        self.contribute(Aspect::Normals, &mesh.id, hash);
        Ok(())
    }

    /// Accumulate one UV set. An empty `uv_channel` selects the mesh's
    /// current set, falling back to the first set by name.
    pub fn accumulate_uvmap(&mut self, uv_channel: &str) -> Result<(), FingerprintError> {
        let mesh = self.target.ok_or(FingerprintError::NoTarget)?;
        let stream = if uv_channel.is_empty() {
            let current = mesh
                .current_uv
                .as_ref()
                .and_then(|name| mesh.uvs.get(name));
            match current.or_else(|| mesh.uvs.values().next()) {
                Some(uvs) => uvs,
                // No UV sets at all: nothing to contribute.
                None => return Ok(()),
            }
        } else {
            mesh.uvs
                .get(uv_channel)
                .ok_or_else(|| FingerprintError::UnknownUvSet {
                    mesh: mesh.id.clone(),
                    channel: uv_channel.to_string(),
                })?
        };
        let hash = hash_stream(stream.iter().map(|uv| uv.as_slice()));
        self.contribute(Aspect::UvMap, &mesh.id, hash);
        Ok(())
    }

    /// Digest per accumulated aspect. Aspects without any contribution are
    /// absent from the map.
    pub fn digest(&self) -> BTreeMap<String, String> {
        self.contributions
            .iter()
            .filter(|(_, per_entity)| !per_entity.is_empty())
            .map(|(aspect, per_entity)| {
                let mut hasher = Sha256::new();
                for (entity, hash) in per_entity {
                    hasher.update((entity.len() as u64).to_le_bytes());
                    hasher.update(entity.as_bytes());
                    hasher.update(hash);
                }
                (aspect.as_str().to_string(), hex::encode(hasher.finalize()))
            })
            .collect()
    }

    /// Forget the target and every accumulated contribution.
    pub fn clear(&mut self) {
        self.target = None;
        self.contributions.clear();
    }

    fn contribute(&mut self, aspect: Aspect, entity: &str, hash: Option<[u8; 32]>) {
        if let Some(hash) = hash {
            self.contributions
                .entry(aspect)
                .or_default()
                .insert(entity.to_string(), hash);
        }
    }
}

/// Hash an element stream; `None` when the stream is empty.
fn hash_stream<'s>(elements: impl Iterator<Item = &'s [f64]>) -> Option<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut count = 0u64;
    for (index, element) in elements.enumerate() {
        hasher.update((index as u64).to_le_bytes());
        for component in element {
            hasher.update(component.to_bits().to_le_bytes());
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    hasher.update(count.to_le_bytes());
    Some(hasher.finalize().into())
}

/// Fingerprint every mesh on its own, keyed by mesh id.
///
/// This is the profile carried by dependency descriptors so a later step can
/// tell which sub-entities changed or vanished without reopening the
/// upstream scene.
pub fn profile(meshes: &[MeshContent]) -> Result<FingerprintProfile, FingerprintError> {
    let mut out = FingerprintProfile::new();
    let mut fp = ContentFingerprint::new();
    for mesh in meshes {
        fp.clear();
        fp.set_target(mesh);
        fp.accumulate_points()?;
        fp.accumulate_normals()?;
        fp.accumulate_uvmap("")?;
        out.insert(mesh.id.clone(), fp.digest());
    }
    Ok(out)
}
