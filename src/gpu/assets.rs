//! Shader sources as data.
//!
//! Built-in shaders are embedded from `assets/shaders/`. Extra effect shaders
//! can be dropped into a directory (`settings.shader_dir`); a file there with
//! the same stem as a built-in effect overrides it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

/// Vertex stage paired with GLSL ES 3.00 fragment shaders.
pub const VERTEX_ES3: &str = include_str!("../../assets/shaders/vertex.glsl");
/// Vertex stage paired with GLSL ES 1.00 fragment shaders.
pub const VERTEX_ES2: &str = include_str!("../../assets/shaders/vertex_es2.glsl");
/// Compositor layer pass (video, canvas, passthrough + chroma key).
pub const LAYER_FRAGMENT: &str = include_str!("../../assets/shaders/layer.glsl");

const BUILTIN_EFFECTS: [(&str, &str); 3] = [
    ("grayscale", include_str!("../../assets/shaders/grayscale.glsl")),
    ("invert", include_str!("../../assets/shaders/invert.glsl")),
    ("vignette", include_str!("../../assets/shaders/vignette.glsl")),
];

/// GLSL ES language version declared by a shader source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlslVersion {
    Es100,
    Es300,
}

impl GlslVersion {
    /// Read the `#version` directive; sources without one are ES 1.00.
    pub fn detect(source: &str) -> Self {
        let directive = source
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with("//"));
        match directive {
            Some(line) if line.starts_with("#version") && line.contains("300") => GlslVersion::Es300,
            _ => GlslVersion::Es100,
        }
    }

    /// Vertex stage whose language version links with this fragment version.
    pub fn vertex_source(self) -> &'static str {
        match self {
            GlslVersion::Es100 => VERTEX_ES2,
            GlslVersion::Es300 => VERTEX_ES3,
        }
    }
}

/// Named effect fragment shaders.
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    effects: BTreeMap<String, String>,
}

impl Default for ShaderLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderLibrary {
    /// Library with the embedded effects only.
    pub fn new() -> Self {
        let effects = BUILTIN_EFFECTS
            .iter()
            .map(|(name, src)| (name.to_string(), src.to_string()))
            .collect();
        Self { effects }
    }

    /// Embedded effects plus `dir` (if given and present).
    pub fn with_directory(dir: Option<&Path>) -> Self {
        let mut library = Self::new();
        if let Some(dir) = dir {
            match library.load_directory(dir) {
                Ok(count) => info!("Loaded {} shader(s) from {}", count, dir.display()),
                Err(e) => warn!("Shader directory {} not loaded: {}", dir.display(), e),
            }
        }
        library
    }

    /// Add every `*.glsl` file of `dir`, keyed by file stem.
    pub fn load_directory(&mut self, dir: &Path) -> std::io::Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("glsl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match fs::read_to_string(&path) {
                Ok(source) => {
                    self.effects.insert(stem.to_string(), source);
                    count += 1;
                }
                Err(e) => warn!("Failed to read shader file {}: {}", path.display(), e),
            }
        }
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.effects.get(name).map(String::as_str)
    }

    /// Resolve an effect reference: a library name, else a path to a `.glsl` file.
    pub fn resolve(&self, reference: &str) -> Option<String> {
        if let Some(source) = self.get(reference) {
            return Some(source.to_string());
        }
        let path = PathBuf::from(reference);
        if path.is_file() {
            return fs::read_to_string(&path)
                .map_err(|e| warn!("Failed to read shader {}: {}", path.display(), e))
                .ok();
        }
        None
    }

    pub fn names(&self) -> Vec<&str> {
        self.effects.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_version() {
        assert_eq!(GlslVersion::detect("#version 300 es\nvoid main(){}"), GlslVersion::Es300);
        assert_eq!(GlslVersion::detect("\n// effect\n#version 300 es\n"), GlslVersion::Es300);
        assert_eq!(GlslVersion::detect("precision mediump float;"), GlslVersion::Es100);
        assert_eq!(GlslVersion::detect("#version 100\n"), GlslVersion::Es100);
    }

    #[test]
    fn test_builtin_shaders_declare_expected_versions() {
        assert_eq!(GlslVersion::detect(VERTEX_ES3), GlslVersion::Es300);
        assert_eq!(GlslVersion::detect(VERTEX_ES2), GlslVersion::Es100);
        assert_eq!(GlslVersion::detect(LAYER_FRAGMENT), GlslVersion::Es300);

        let library = ShaderLibrary::new();
        assert_eq!(GlslVersion::detect(library.get("grayscale").unwrap()), GlslVersion::Es100);
        assert_eq!(GlslVersion::detect(library.get("invert").unwrap()), GlslVersion::Es300);
    }

    #[test]
    fn test_effects_use_resolution_uniform() {
        let library = ShaderLibrary::new();
        for name in library.names() {
            assert!(library.get(name).unwrap().contains("vResolution"), "{} lacks vResolution", name);
        }
    }

    #[test]
    fn test_directory_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("invert.glsl"), "// custom").unwrap();
        fs::write(dir.path().join("sepia.glsl"), "// sepia").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let library = ShaderLibrary::with_directory(Some(dir.path()));
        assert_eq!(library.get("invert"), Some("// custom"));
        assert_eq!(library.get("sepia"), Some("// sepia"));
        assert!(library.get("notes").is_none());
        assert!(library.get("grayscale").is_some());
    }

    #[test]
    fn test_resolve_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.glsl");
        fs::write(&path, "// from file").unwrap();

        let library = ShaderLibrary::new();
        assert_eq!(library.resolve(path.to_str().unwrap()).as_deref(), Some("// from file"));
        assert!(library.resolve("no-such-effect").is_none());
    }
}
