use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---- Program manifest (programs.toml) -------------------------------

/// Shader programs and the virtual paths of their sources.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgramManifest {
    /// Directory the virtual source paths are relative to, itself relative
    /// to the manifest file.
    #[serde(default, with = "option_path_serde", skip_serializing_if = "Option::is_none")]
    pub shader_root: Option<PathBuf>,
    #[serde(default)]
    pub program: Vec<ProgramEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgramEntry {
    pub name: String,
    #[serde(default)]
    pub vertex: Vec<String>,
    #[serde(default)]
    pub fragment: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Program '{0}' is declared more than once")]
    DuplicateProgram(String),
}

impl ProgramManifest {
    pub fn from_toml_str(text: &str) -> Result<Self, ManifestError> {
        let manifest: ProgramManifest = toml::from_str(text)?;
        for (i, entry) in manifest.program.iter().enumerate() {
            if manifest.program[..i].iter().any(|e| e.name == entry.name) {
                return Err(ManifestError::DuplicateProgram(entry.name.clone()));
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Shader root resolved against the directory holding the manifest.
    pub fn resolve_shader_root(&self, manifest_path: &Path) -> PathBuf {
        let base = manifest_path.parent().unwrap_or(Path::new(""));
        match &self.shader_root {
            Some(root) => base.join(root),
            None => base.to_owned(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ProgramEntry> {
        self.program.iter().find(|entry| entry.name == name)
    }
}

// ---- Serde helpers: forward-slash paths -----------------------------

mod option_path_serde {
    use std::path::PathBuf;

    use path_slash::PathBufExt as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        path: &Option<PathBuf>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        path.as_ref().map(|p| p.to_slash_lossy().into_owned()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<PathBuf>, D::Error> {
        Ok(Option::<String>::deserialize(d)?.map(PathBuf::from_slash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
shader_root = "shaders/gl"

[[program]]
name = "basic"
vertex = ["basic.vert"]
fragment = ["basic.frag", "lighting/common.frag"]

[[program]]
name = "depth-only"
vertex = ["basic.vert"]
"#;

    #[test]
    fn parses_programs_and_slash_paths() {
        let manifest = ProgramManifest::from_toml_str(MANIFEST).unwrap();

        assert_eq!(
            manifest.shader_root,
            Some(PathBuf::from("shaders").join("gl"))
        );
        let basic = manifest.get("basic").unwrap();
        assert_eq!(basic.fragment, ["basic.frag", "lighting/common.frag"]);
        assert!(manifest.get("depth-only").unwrap().fragment.is_empty());
        assert!(manifest.get("missing").is_none());

        let root = manifest.resolve_shader_root(Path::new("assets/programs.toml"));
        assert_eq!(root, Path::new("assets").join("shaders").join("gl"));
    }

    #[test]
    fn round_trips_through_toml() {
        let manifest = ProgramManifest::from_toml_str(MANIFEST).unwrap();
        let text = toml::to_string(&manifest).unwrap();
        assert!(text.contains("shader_root = \"shaders/gl\""));
        assert_eq!(ProgramManifest::from_toml_str(&text).unwrap().program.len(), 2);
    }

    #[test]
    fn duplicate_programs_are_rejected() {
        let text = "[[program]]\nname = \"a\"\n[[program]]\nname = \"a\"\n";
        assert!(matches!(
            ProgramManifest::from_toml_str(text),
            Err(ManifestError::DuplicateProgram(name)) if name == "a"
        ));
    }
}
