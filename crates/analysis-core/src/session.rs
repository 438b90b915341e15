//! Session Builder (§4.4, §4.5): composes one Analysis Session per target
//! platform from the current `ProjectModel`, unwrapping archives and
//! generating klib stubs along the way. Must be invoked on the analysis
//! worker (§5); the previous sessions map is dropped before the new one is
//! built.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::warn;

use crate::archive::adapt_classpath_entry;
use crate::backend::SessionSpec;
use crate::klib::generate_stubs;
use crate::model::{Platform, ProjectModel};

/// An immutable, fully-resolved input to one backend session build. Distinct
/// from `SessionSpec` (the backend's wire shape) because a session also
/// needs bookkeeping the backend doesn't care about (which platform names
/// feed it, for routing and `getAvailableTargets`).
#[derive(Debug, Clone)]
pub struct Session {
    pub platform: Platform,
    pub source_roots: Vec<PathBuf>,
    pub classpath: Vec<PathBuf>,
    pub jdk_home: Option<PathBuf>,
}

impl Session {
    pub fn to_backend_spec(&self) -> SessionSpec {
        SessionSpec {
            platform: self.platform,
            source_roots: self.source_roots.clone(),
            classpath: self.classpath.clone(),
            jdk_home: self.jdk_home.clone(),
        }
    }
}

/// Adapts one classpath entry, generating klib stubs (as an extra source
/// root) or unwrapping an aar (as a substituted jar path). Archive/klib
/// adaptation failures are dropped with a warning, never fatal (§4.2, §4.3).
fn adapt_entry(path: &PathBuf, extra_source_roots: &mut Vec<PathBuf>) -> Option<PathBuf> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("klib") => {
            match generate_stubs(path) {
                Some(stub_dir) => extra_source_roots.push(stub_dir),
                None => warn!(path = %path.display(), "klib produced no stubs"),
            }
            None
        }
        Some("aar") => adapt_classpath_entry(path),
        _ => Some(path.clone()),
    }
}

fn adapt_classpath(entries: &[PathBuf], extra_source_roots: &mut Vec<PathBuf>) -> Vec<PathBuf> {
    entries
        .iter()
        .filter_map(|p| adapt_entry(p, extra_source_roots))
        .collect()
}

/// Builds every session implied by `model` (§4.4 "Build-sessions policy").
/// Non-multiplatform projects get exactly one `JVM`-keyed session; otherwise
/// one session per distinct platform appearing in any module's targets.
pub fn build_sessions(model: &ProjectModel, jdk_home: Option<PathBuf>) -> HashMap<Platform, Session> {
    let mut sessions = HashMap::new();

    if !model.is_multiplatform {
        let mut source_roots = Vec::new();
        let mut classpath = Vec::new();
        for module in &model.modules {
            source_roots.extend(module.source_roots.iter().cloned());
            source_roots.extend(module.test_source_roots.iter().cloned());
            classpath.extend(adapt_classpath(&module.classpath, &mut source_roots));
            classpath.extend(adapt_classpath(&module.test_classpath, &mut source_roots));
        }
        dedup(&mut source_roots);
        dedup(&mut classpath);
        sessions.insert(
            Platform::Jvm,
            Session { platform: Platform::Jvm, source_roots, classpath, jdk_home },
        );
        return sessions;
    }

    for platform in model.available_platforms() {
        let mut source_roots = Vec::new();
        let mut classpath = Vec::new();
        for module in &model.modules {
            source_roots.extend(module.source_roots.iter().cloned());
            classpath.extend(adapt_classpath(&module.classpath, &mut source_roots));
            for target in module.targets.iter().filter(|t| t.platform == platform) {
                source_roots.extend(target.source_roots.iter().cloned());
                source_roots.extend(target.test_source_roots.iter().cloned());
                classpath.extend(adapt_classpath(&target.classpath, &mut source_roots));
                classpath.extend(adapt_classpath(&target.test_classpath, &mut source_roots));
            }
        }
        dedup(&mut source_roots);
        dedup(&mut classpath);
        let session_jdk = if platform.includes_jdk() { jdk_home.clone() } else { None };
        sessions.insert(platform, Session { platform, source_roots, classpath, jdk_home: session_jdk });
    }

    sessions
}

fn dedup(paths: &mut Vec<PathBuf>) {
    let mut seen = std::collections::HashSet::new();
    paths.retain(|p| seen.insert(p.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KmpTarget, Module};

    #[test]
    fn non_multiplatform_project_builds_single_jvm_session() {
        let mut module = Module::new("app");
        module.source_roots.push(PathBuf::from("/ws/src/main/kotlin"));
        module.classpath.push(PathBuf::from("/libs/a.jar"));
        let model = ProjectModel::new(vec![module], None, "debug").unwrap();

        let sessions = build_sessions(&model, Some(PathBuf::from("/usr/lib/jvm/17")));
        assert_eq!(sessions.len(), 1);
        let session = &sessions[&Platform::Jvm];
        assert!(session.source_roots.iter().any(|r| r.ends_with("src/main/kotlin")));
        assert!(session.jdk_home.is_some());
    }

    #[test]
    fn multiplatform_project_builds_one_session_per_platform() {
        let mut module = Module::new("shared");
        module.source_roots.push(PathBuf::from("/ws/common"));
        module.targets.push({
            let mut t = KmpTarget::new("jvm", Platform::Jvm);
            t.source_roots.push(PathBuf::from("/ws/jvm"));
            t
        });
        module.targets.push({
            let mut t = KmpTarget::new("iosArm64", Platform::Native);
            t.source_roots.push(PathBuf::from("/ws/ios"));
            t
        });
        let model = ProjectModel::new(vec![module], None, "debug").unwrap();

        let sessions = build_sessions(&model, Some(PathBuf::from("/jdk")));
        assert_eq!(sessions.len(), 2);
        assert!(sessions[&Platform::Jvm].jdk_home.is_some());
        assert!(sessions[&Platform::Native].jdk_home.is_none());
        assert!(sessions[&Platform::Jvm].source_roots.iter().any(|r| r.ends_with("common")));
        assert!(sessions[&Platform::Jvm].source_roots.iter().any(|r| r.ends_with("jvm")));
    }

    #[test]
    fn dedup_removes_repeated_classpath_entries() {
        let mut paths = vec![PathBuf::from("/a.jar"), PathBuf::from("/a.jar"), PathBuf::from("/b.jar")];
        dedup(&mut paths);
        assert_eq!(paths.len(), 2);
    }
}
