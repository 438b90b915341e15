//! The Project Model (§3): an immutable description of a workspace's
//! modules, source roots and classpaths. Built once per resolution by the
//! resolver, replaced wholesale (never mutated) by the rebuild orchestrator.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, ResolveError};

/// One of the four platform kinds a KmpTarget or session can be pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    Jvm,
    Android,
    Js,
    Native,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Jvm => "JVM",
            Platform::Android => "ANDROID",
            Platform::Js => "JS",
            Platform::Native => "NATIVE",
        }
    }

    /// Platform a session should be built for; ANDROID sessions are built as
    /// JVM sessions (§4.4) but keep their own display name via `as_str`.
    pub fn session_kind(&self) -> Platform {
        match self {
            Platform::Android => Platform::Jvm,
            other => *other,
        }
    }

    pub fn includes_jdk(&self) -> bool {
        matches!(self, Platform::Jvm | Platform::Android)
    }
}

/// Deterministic name→platform map (§3, §4.1 step 6). An unrecognized target
/// name is a hard error at model construction.
pub fn platform_for_target_name(name: &str) -> std::result::Result<Platform, ResolveError> {
    let lower = name.to_ascii_lowercase();
    if lower == "jvm" {
        Ok(Platform::Jvm)
    } else if lower == "android" {
        Ok(Platform::Android)
    } else if lower == "js" || lower == "wasmjs" || lower.starts_with("wasm") {
        Ok(Platform::Js)
    } else if lower.starts_with("ios")
        || lower.starts_with("macos")
        || lower.starts_with("linux")
        || lower.starts_with("mingw")
        || lower.starts_with("native")
        || lower.starts_with("tvos")
        || lower.starts_with("watchos")
    {
        Ok(Platform::Native)
    } else {
        Err(ResolveError::UnknownTargetName(name.to_string()))
    }
}

/// One platform-specific target inside a multiplatform module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmpTarget {
    pub name: String,
    pub platform: Platform,
    pub source_roots: Vec<PathBuf>,
    pub test_source_roots: Vec<PathBuf>,
    pub classpath: Vec<PathBuf>,
    pub test_classpath: Vec<PathBuf>,
}

impl KmpTarget {
    pub fn new(name: impl Into<String>, platform: Platform) -> Self {
        KmpTarget {
            name: name.into(),
            platform,
            source_roots: Vec::new(),
            test_source_roots: Vec::new(),
            classpath: Vec::new(),
            test_classpath: Vec::new(),
        }
    }
}

/// A build-system module. A module with non-empty `targets` is multiplatform;
/// its top-level `source_roots` are the "common" roots shared by every target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub source_roots: Vec<PathBuf>,
    pub test_source_roots: Vec<PathBuf>,
    pub classpath: Vec<PathBuf>,
    pub test_classpath: Vec<PathBuf>,
    pub kotlin_version: Option<String>,
    pub jvm_target: Option<String>,
    pub is_android: bool,
    pub targets: Vec<KmpTarget>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            source_roots: Vec::new(),
            test_source_roots: Vec::new(),
            classpath: Vec::new(),
            test_classpath: Vec::new(),
            kotlin_version: None,
            jvm_target: None,
            is_android: false,
            targets: Vec::new(),
        }
    }

    pub fn is_multiplatform(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Canonicalize every path carried by this module in place. Paths that
    /// don't exist on disk yet (generated-source dirs not produced by a
    /// build, stub temp dirs) are kept as normalized-but-not-canonicalized.
    fn canonicalize_paths(&mut self) {
        canonicalize_list(&mut self.source_roots);
        canonicalize_list(&mut self.test_source_roots);
        canonicalize_list(&mut self.classpath);
        canonicalize_list(&mut self.test_classpath);
        for target in &mut self.targets {
            canonicalize_list(&mut target.source_roots);
            canonicalize_list(&mut target.test_source_roots);
            canonicalize_list(&mut target.classpath);
            canonicalize_list(&mut target.test_classpath);
        }
    }
}

fn canonicalize_list(paths: &mut [PathBuf]) {
    for p in paths.iter_mut() {
        if let Ok(canon) = p.canonicalize() {
            *p = canon;
        } else if !p.is_absolute() {
            // leave relative paths as-is; callers are expected to already
            // hand us absolute paths per the resolver's contract.
        }
    }
}

/// The whole-workspace model (§3). Immutable after construction; a rebuild
/// produces a brand-new value rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectModel {
    pub modules: Vec<Module>,
    pub project_dir: Option<PathBuf>,
    pub variant: String,
    pub is_multiplatform: bool,
}

impl ProjectModel {
    /// Construct and validate a model, canonicalizing every path and
    /// re-deriving `is_multiplatform` from the modules (never guessed).
    pub fn new(
        mut modules: Vec<Module>,
        project_dir: Option<PathBuf>,
        variant: impl Into<String>,
    ) -> crate::error::Result<Self> {
        for module in &mut modules {
            module.canonicalize_paths();
        }
        let is_multiplatform = modules.iter().any(Module::is_multiplatform);
        Ok(ProjectModel {
            modules,
            project_dir,
            variant: variant.into(),
            is_multiplatform,
        })
    }

    pub fn source_only(root: &Path, variant: impl Into<String>) -> crate::error::Result<Self> {
        let module = Module::new("source-only");
        ProjectModel::new(vec![module], Some(root.to_path_buf()), variant)
    }

    /// Every distinct platform appearing in any module's targets, sorted for
    /// determinism. Empty for non-multiplatform projects.
    pub fn available_platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self
            .modules
            .iter()
            .flat_map(|m| m.targets.iter().map(|t| t.platform))
            .collect();
        platforms.sort();
        platforms.dedup();
        platforms
    }

    pub fn resolve_failure(reason: impl Into<String>) -> CoreError {
        CoreError::Resolve(ResolveError::BuildToolFailed(reason.into()))
    }
}
