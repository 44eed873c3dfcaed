//! Cache keys and parameter fingerprints

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Characters of the fingerprint used in slot file names.
const SLOT_FINGERPRINT_LEN: usize = 16;

/// Artifact family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Band,
    Index,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Band => "band",
            ArtifactKind::Index => "index",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SHA-256 over every parameter that affects an artifact's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn builder() -> FingerprintBuilder {
        FingerprintBuilder::default()
    }

    /// Full lowercase hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..SLOT_FINGERPRINT_LEN.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Collects `name=value` pairs; insertion order does not matter.
#[derive(Debug, Clone, Default)]
pub struct FingerprintBuilder {
    params: BTreeMap<String, String>,
}

impl FingerprintBuilder {
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn finish(self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for (name, value) in &self.params {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        Fingerprint(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

/// (scene id, kind, name, fingerprint) -> one immutable slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scene_id: String,
    pub kind: ArtifactKind,
    pub name: String,
    pub fingerprint: Fingerprint,
    extension: String,
}

impl CacheKey {
    pub fn new(
        scene_id: impl Into<String>,
        kind: ArtifactKind,
        name: impl Into<String>,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            scene_id: scene_id.into(),
            kind,
            name: name.into(),
            fingerprint,
            extension: "bin".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// `scene/kind/name/fingerprint`, used for lock tables and logs.
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.scene_id, self.kind, self.name, self.fingerprint
        )
    }

    /// Slot path relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(sanitize_component(&self.scene_id));
        path.push(self.kind.as_str());
        path.push(sanitize_component(&self.name));
        path.push(format!(
            "{}.{}",
            self.fingerprint.short(),
            sanitize_component(&self.extension)
        ));
        path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.scene_id,
            self.kind,
            self.name,
            self.fingerprint.short()
        )
    }
}

/// Make an identifier safe as a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
