//! Build-System Resolver (§4.1): discovers the Project Model from disk.
//! Providers are tried in priority order; the first whose marker files are
//! present attempts full resolution, falling back to a source-only model on
//! any failure. Never fatal — `resolve` always returns *some* model.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

use crate::model::{platform_for_target_name, KmpTarget, Module, Platform, ProjectModel};

const RECORD_START: &str = "---KOTLIN-ANALYZER-START---";
const RECORD_END: &str = "---KOTLIN-ANALYZER-END---";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSystem {
    Gradle,
    Maven,
    None,
}

/// One parsed line of the init-script record stream (§6.2).
#[derive(Debug, Clone)]
enum Record {
    MainClasspath { module: String, path: PathBuf },
    TestClasspath { module: String, path: PathBuf },
    KmpClasspath { module: String, config_name: String, path: PathBuf },
    Error { module: String, where_: String, message: String },
    Debug { module: String, text: String },
}

fn parse_record_line(line: &str) -> Option<Record> {
    if let Some(rest) = line.strip_prefix("LSPCP:") {
        let (module, path) = rest.split_once(':')?;
        return Some(Record::MainClasspath { module: module.to_string(), path: PathBuf::from(path) });
    }
    if let Some(rest) = line.strip_prefix("LSPTCP:") {
        let (module, path) = rest.split_once(':')?;
        return Some(Record::TestClasspath { module: module.to_string(), path: PathBuf::from(path) });
    }
    if let Some(rest) = line.strip_prefix("LSPKMP:") {
        let mut parts = rest.splitn(3, ':');
        let module = parts.next()?.to_string();
        let config_name = parts.next()?.to_string();
        let path = PathBuf::from(parts.next()?);
        return Some(Record::KmpClasspath { module, config_name, path });
    }
    if let Some(rest) = line.strip_prefix("LSPERR:") {
        let mut parts = rest.splitn(3, ':');
        let module = parts.next()?.to_string();
        let where_ = parts.next()?.to_string();
        let message = parts.next().unwrap_or("").to_string();
        return Some(Record::Error { module, where_, message });
    }
    if let Some(rest) = line.strip_prefix("LSPDBG:") {
        let (module, text) = rest.split_once(':').unwrap_or((rest, ""));
        return Some(Record::Debug { module: module.to_string(), text: text.to_string() });
    }
    None
}

fn parse_record_stream(output: &str) -> Vec<Record> {
    let mut in_block = false;
    let mut records = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line == RECORD_START {
            in_block = true;
            continue;
        }
        if line == RECORD_END {
            in_block = false;
            continue;
        }
        if !in_block {
            continue;
        }
        match parse_record_line(line) {
            Some(Record::Error { module, where_, message }) => {
                warn!(module = %module, location = %where_, "{message}");
            }
            Some(Record::Debug { module, text }) => {
                tracing::debug!(module = %module, "{text}");
            }
            Some(record) => records.push(record),
            None => continue,
        }
    }
    records
}

/// Config-name → platform mapping for `LSPKMP` (§6.2).
fn platform_for_config_name(config_name: &str) -> Option<Platform> {
    let lower = config_name.to_ascii_lowercase();
    if lower.starts_with("jvm") && lower.ends_with("compileclasspath") {
        Some(Platform::Jvm)
    } else if (lower.starts_with("android") || lower.contains("debug") || lower.contains("release"))
        && lower.ends_with("compileclasspath")
    {
        Some(Platform::Android)
    } else if (lower.starts_with("ios")
        || lower.starts_with("native")
        || lower.starts_with("linux")
        || lower.starts_with("macos")
        || lower.starts_with("mingw"))
        && lower.ends_with("compileclasspath")
    {
        Some(Platform::Native)
    } else if (lower.starts_with("js") || lower.starts_with("wasmjs")) && lower.ends_with("compileclasspath")
    {
        Some(Platform::Js)
    } else {
        None
    }
}

/// Merge init-script records into a structural module map (§4.1 step 4).
/// Per-target entries are matched to an existing `KmpTarget` by platform;
/// unmatched KMP config names are silently dropped.
fn merge_records(modules: &mut HashMap<String, Module>, records: Vec<Record>) {
    for record in records {
        match record {
            Record::MainClasspath { module, path } => {
                if let Some(m) = modules.get_mut(&module) {
                    push_unique(&mut m.classpath, path);
                }
            }
            Record::TestClasspath { module, path } => {
                if let Some(m) = modules.get_mut(&module) {
                    push_unique(&mut m.test_classpath, path);
                }
            }
            Record::KmpClasspath { module, config_name, path } => {
                let Some(platform) = platform_for_config_name(&config_name) else { continue };
                if let Some(m) = modules.get_mut(&module) {
                    if let Some(target) = m.targets.iter_mut().find(|t| t.platform == platform) {
                        push_unique(&mut target.classpath, path);
                    }
                }
            }
            Record::Error { .. } | Record::Debug { .. } => unreachable!("filtered in parse_record_stream"),
        }
    }
}

fn push_unique(paths: &mut Vec<PathBuf>, path: PathBuf) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

/// A resolution provider: advertises marker files and, when candidate,
/// attempts to produce a structural `ProjectModel`.
trait Provider {
    fn is_candidate(&self, root: &Path) -> bool;
    fn resolve(&self, root: &Path, variant: &str) -> Option<Vec<Module>>;
}

struct ManualConfigProvider;

impl Provider for ManualConfigProvider {
    fn is_candidate(&self, root: &Path) -> bool {
        root.join(".kotlin-analyzer.json").exists()
    }

    fn resolve(&self, root: &Path, _variant: &str) -> Option<Vec<Module>> {
        let text = fs::read_to_string(root.join(".kotlin-analyzer.json")).ok()?;
        let config: ManualProjectConfig = serde_json::from_str(&text).ok()?;
        Some(
            config
                .modules
                .into_iter()
                .map(|m| {
                    let mut module = Module::new(m.name);
                    module.source_roots = m.source_roots.into_iter().map(|p| root.join(p)).collect();
                    module.classpath = m.classpath.into_iter().map(PathBuf::from).collect();
                    module
                })
                .collect(),
        )
    }
}

#[derive(serde::Deserialize)]
struct ManualProjectConfig {
    modules: Vec<ManualModule>,
}

#[derive(serde::Deserialize)]
struct ManualModule {
    name: String,
    #[serde(default)]
    source_roots: Vec<String>,
    #[serde(default)]
    classpath: Vec<String>,
}

struct GradleProvider;

impl Provider for GradleProvider {
    fn is_candidate(&self, root: &Path) -> bool {
        root.join("build.gradle.kts").exists()
            || root.join("build.gradle").exists()
            || root.join("settings.gradle.kts").exists()
            || root.join("settings.gradle").exists()
    }

    fn resolve(&self, root: &Path, variant: &str) -> Option<Vec<Module>> {
        let wrapper = find_gradle_wrapper(root)?;
        let mut modules = structural_modules_from_disk(root, variant);
        let init_script = root.join(".kotlin-analyzer-init.gradle.kts");
        if fs::write(&init_script, GRADLE_INIT_SCRIPT).is_err() {
            return Some(modules.into_values().collect());
        }

        let output = Command::new(&wrapper)
            .arg("--init-script")
            .arg(&init_script)
            .arg("kotlinAnalyzerExtract")
            .arg("--quiet")
            .current_dir(root)
            .output();
        let _ = fs::remove_file(&init_script);

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let records = parse_record_stream(&stdout);
                merge_records(&mut modules, records);
            }
            Err(e) => {
                warn!(error = %e, "gradle init-script invocation failed; using structural model only");
            }
        }

        detect_kmp_targets(root, &mut modules);
        enrich_android_modules(root, variant, &mut modules);

        Some(modules.into_values().collect())
    }
}

const GRADLE_INIT_SCRIPT: &str = r#"
allprojects {
    tasks.register("kotlinAnalyzerExtract") {
        doLast {
            println("---KOTLIN-ANALYZER-START---")
            configurations.matching { it.isCanBeResolved }.forEach { cfg ->
                try {
                    cfg.resolvedConfiguration.lenientConfiguration.files.forEach { f ->
                        println("LSPCP:${project.name}:${f.absolutePath}")
                    }
                } catch (e: Exception) {
                    println("LSPERR:${project.name}:${cfg.name}:${e.message}")
                }
            }
            println("---KOTLIN-ANALYZER-END---")
        }
    }
}
"#;

struct MavenProvider;

impl Provider for MavenProvider {
    fn is_candidate(&self, root: &Path) -> bool {
        root.join("pom.xml").exists()
    }

    fn resolve(&self, root: &Path, variant: &str) -> Option<Vec<Module>> {
        let mut modules = structural_modules_from_disk(root, variant);
        let output = Command::new("mvn")
            .arg("dependency:build-classpath")
            .arg("-Dmdep.outputFile=/dev/stdout")
            .current_dir(root)
            .output();
        if let Ok(output) = output {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(module) = modules.get_mut("maven-root") {
                for entry in stdout.split(|c| c == ':' || c == '\n') {
                    let trimmed = entry.trim();
                    if trimmed.ends_with(".jar") {
                        push_unique(&mut module.classpath, PathBuf::from(trimmed));
                    }
                }
            }
        }
        Some(modules.into_values().collect())
    }
}

fn find_gradle_wrapper(root: &Path) -> Option<PathBuf> {
    for candidate in ["gradlew", "gradlew.bat"] {
        let path = root.join(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

fn structural_modules_from_disk(root: &Path, variant: &str) -> HashMap<String, Module> {
    let mut modules = HashMap::new();
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("maven-root")
        .to_string();
    let key = if root.join("pom.xml").exists() { "maven-root".to_string() } else { name };
    let mut module = Module::new(key.clone());
    module.source_roots = find_kotlin_source_roots(root, variant, false);
    module.test_source_roots = find_kotlin_source_roots(root, variant, true);
    module.is_android = root.join("src/main/AndroidManifest.xml").exists();
    modules.insert(key, module);
    modules
}

/// Conventional source directories (§4.1 step 3b / §6.3), used both for the
/// fallback provider and as the structural base layered with init-script
/// classpath results.
pub fn find_kotlin_source_roots(root: &Path, variant: &str, test: bool) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    let candidates: Vec<PathBuf> = if test {
        vec![
            root.join("src/test/kotlin"),
            root.join("src/test/java"),
            root.join(format!("src/androidTest/kotlin")),
            root.join(format!("src/androidTest/java")),
        ]
    } else {
        vec![
            root.join("src/main/kotlin"),
            root.join("src/main/java"),
            root.join(format!("src/{variant}/kotlin")),
            root.join(format!("src/{variant}/java")),
        ]
    };
    for candidate in candidates {
        if candidate.is_dir() {
            roots.push(candidate);
        }
    }
    roots
}

/// Android generated-source directories that currently exist on disk
/// (§4.1 step 5).
fn android_generated_source_roots(root: &Path, variant: &str) -> Vec<PathBuf> {
    let bases = [
        format!("build/generated/source/r/{variant}"),
        format!("build/generated/source/buildConfig/{variant}"),
        format!("build/generated/data_binding_base_class_source_out/{variant}/out"),
        format!("build/generated/ksp/{variant}/kotlin"),
        format!("build/generated/source/kapt/{variant}"),
    ];
    bases
        .iter()
        .map(|b| root.join(b))
        .filter(|p| p.is_dir())
        .collect()
}

fn highest_android_platform_jar() -> Option<PathBuf> {
    let sdk_root = std::env::var("ANDROID_HOME").or_else(|_| std::env::var("ANDROID_SDK_ROOT")).ok()?;
    let platforms_dir = PathBuf::from(sdk_root).join("platforms");
    let mut best: Option<(u32, PathBuf)> = None;
    let entries = fs::read_dir(&platforms_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(level) = name.strip_prefix("android-").and_then(|n| n.parse::<u32>().ok()) {
            let jar = entry.path().join("android.jar");
            if jar.exists() && best.as_ref().map(|(l, _)| level > *l).unwrap_or(true) {
                best = Some((level, jar));
            }
        }
    }
    best.map(|(_, jar)| jar)
}

fn enrich_android_modules(root: &Path, variant: &str, modules: &mut HashMap<String, Module>) {
    for module in modules.values_mut() {
        if !module.is_android {
            continue;
        }
        if let Some(android_jar) = highest_android_platform_jar() {
            push_unique(&mut module.classpath, android_jar);
        }
        for generated in android_generated_source_roots(root, variant) {
            if !module.source_roots.contains(&generated) {
                module.source_roots.push(generated);
            }
        }
        if module.source_roots.is_empty() {
            module.source_roots = find_kotlin_source_roots(root, variant, false);
        }
    }
}

const MULTIPLATFORM_MARKERS: [&str; 2] = [
    "kotlin(\"multiplatform\")",
    "org.jetbrains.kotlin.multiplatform",
];

fn module_is_multiplatform(root: &Path) -> bool {
    for name in ["build.gradle.kts", "build.gradle"] {
        if let Ok(text) = fs::read_to_string(root.join(name)) {
            if MULTIPLATFORM_MARKERS.iter().any(|m| text.contains(m)) {
                return true;
            }
        }
    }
    false
}

const KNOWN_LEAF_TARGETS: &[(&str, &str)] = &[
    ("jvmMain", "jvm"),
    ("androidMain", "android"),
    ("jsMain", "js"),
    ("wasmJsMain", "wasmJs"),
    ("iosArm64Main", "iosArm64"),
    ("iosX64Main", "iosX64"),
    ("iosSimulatorArm64Main", "iosSimulatorArm64"),
    ("macosX64Main", "macosX64"),
    ("macosArm64Main", "macosArm64"),
    ("linuxX64Main", "linuxX64"),
    ("mingwX64Main", "mingwX64"),
];

const INTERMEDIATE_SOURCE_SETS: &[&str] = &["nativeMain", "iosMain", "macosMain", "commonMain"];

/// Per-module multiplatform detection (§4.1 step 6): enumerate leaf target
/// source sets by disk convention, folding intermediate sets in as
/// additional source roots on every native leaf they cover.
fn detect_kmp_targets(root: &Path, modules: &mut HashMap<String, Module>) {
    if !module_is_multiplatform(root) {
        return;
    }
    let src_dir = root.join("src");
    if !src_dir.is_dir() {
        return;
    }

    let mut leaf_targets: Vec<KmpTarget> = Vec::new();
    for (dir_name, target_name) in KNOWN_LEAF_TARGETS {
        let main_dir = src_dir.join(dir_name);
        if !main_dir.is_dir() {
            continue;
        }
        let Ok(platform) = platform_for_target_name(target_name) else { continue };
        let mut target = KmpTarget::new(*target_name, platform);
        push_source_dirs(&main_dir, &mut target.source_roots);
        let test_dir_name = dir_name.replacen("Main", "Test", 1);
        let test_dir = src_dir.join(&test_dir_name);
        if test_dir.is_dir() {
            push_source_dirs(&test_dir, &mut target.test_source_roots);
        }
        leaf_targets.push(target);
    }

    // Fold intermediate sets into every native leaf (native/ios/macos share
    // the "native" family; commonMain belongs to every leaf).
    for intermediate in INTERMEDIATE_SOURCE_SETS {
        let dir = src_dir.join(intermediate);
        if !dir.is_dir() {
            continue;
        }
        let mut roots = Vec::new();
        push_source_dirs(&dir, &mut roots);
        for target in leaf_targets.iter_mut() {
            let applies = *intermediate == "commonMain"
                || (target.platform == Platform::Native
                    && (*intermediate == "nativeMain"
                        || (*intermediate == "iosMain" && target.name.starts_with("ios"))
                        || (*intermediate == "macosMain" && target.name.starts_with("macos"))));
            if applies {
                for r in &roots {
                    if !target.source_roots.contains(r) {
                        target.source_roots.push(r.clone());
                    }
                }
            }
        }
    }

    if leaf_targets.is_empty() {
        return;
    }

    // A project being multiplatform implies exactly one logical module in
    // this simplified resolver; attach the targets to whichever structural
    // module we have (there's exactly one from `structural_modules_from_disk`
    // unless a manual config declared more).
    for module in modules.values_mut() {
        module.targets = leaf_targets.clone();
        break;
    }
}

fn push_source_dirs(main_dir: &Path, out: &mut Vec<PathBuf>) {
    for sub in ["kotlin", "java"] {
        let dir = main_dir.join(sub);
        if dir.is_dir() {
            out.push(dir);
        }
    }
}

struct SourceOnlyProvider;

impl Provider for SourceOnlyProvider {
    fn is_candidate(&self, _root: &Path) -> bool {
        true
    }

    fn resolve(&self, root: &Path, variant: &str) -> Option<Vec<Module>> {
        let mut module = Module::new("source-only");
        module.source_roots = find_kotlin_source_roots(root, variant, false);
        module.test_source_roots = find_kotlin_source_roots(root, variant, true);
        Some(vec![module])
    }
}

/// Detects which build system is present, used for diagnostics and for the
/// fallback decision in `resolve_project`.
pub fn detect_build_system(root: &Path) -> BuildSystem {
    if GradleProvider.is_candidate(root) {
        BuildSystem::Gradle
    } else if MavenProvider.is_candidate(root) {
        BuildSystem::Maven
    } else {
        BuildSystem::None
    }
}

/// Resolves a `ProjectModel` for `root` (§4.1). Provider priority, highest
/// first: manual config → Gradle → Maven → source-only fallback. Never
/// fails — a whole-provider failure falls back silently (§4.1 "Failure
/// semantics").
pub fn resolve_project(root: &Path, variant: &str) -> ProjectModel {
    let providers: Vec<Box<dyn Provider>> = vec![
        Box::new(ManualConfigProvider),
        Box::new(GradleProvider),
        Box::new(MavenProvider),
    ];

    for provider in &providers {
        if provider.is_candidate(root) {
            if let Some(modules) = provider.resolve(root, variant) {
                info!(root = %root.display(), modules = modules.len(), "resolved project model");
                match ProjectModel::new(modules, Some(root.to_path_buf()), variant) {
                    Ok(model) => return model,
                    Err(e) => warn!(error = %e, "resolved model failed validation; falling back"),
                }
            }
        }
    }

    let modules = SourceOnlyProvider.resolve(root, variant).unwrap_or_default();
    info!(root = %root.display(), "falling back to source-only model");
    ProjectModel::new(modules, Some(root.to_path_buf()), variant)
        .unwrap_or_else(|_| ProjectModel::source_only(root, variant).expect("source-only model always valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn parses_main_and_test_classpath_records() {
        let output = format!(
            "noise before\n{RECORD_START}\nLSPCP:app:/libs/a.jar\nLSPTCP:app:/libs/test.jar\n{RECORD_END}\nnoise after\n"
        );
        let records = parse_record_stream(&output);
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], Record::MainClasspath { module, path } if module == "app" && path == &PathBuf::from("/libs/a.jar")));
    }

    #[test]
    fn lines_outside_the_sentinel_block_are_ignored() {
        let output = "LSPCP:app:/should/be/ignored.jar\n";
        assert!(parse_record_stream(output).is_empty());
    }

    #[test]
    fn platform_for_config_name_maps_known_prefixes() {
        assert_eq!(platform_for_config_name("jvmCompileClasspath"), Some(Platform::Jvm));
        assert_eq!(platform_for_config_name("androidDebugCompileClasspath"), Some(Platform::Android));
        assert_eq!(platform_for_config_name("iosArm64CompileClasspath"), Some(Platform::Native));
        assert_eq!(platform_for_config_name("jsCompileClasspath"), Some(Platform::Js));
        assert_eq!(platform_for_config_name("unknownCompileClasspath"), None);
    }

    #[test]
    fn detect_build_system_prefers_gradle_markers() {
        let dir = workspace();
        fs::write(dir.path().join("build.gradle.kts"), "").unwrap();
        assert_eq!(detect_build_system(dir.path()), BuildSystem::Gradle);
    }

    #[test]
    fn detect_build_system_falls_back_to_none() {
        let dir = workspace();
        assert_eq!(detect_build_system(dir.path()), BuildSystem::None);
    }

    #[test]
    fn resolve_project_without_build_system_scans_conventional_roots() {
        let dir = workspace();
        fs::create_dir_all(dir.path().join("src/main/kotlin")).unwrap();
        let model = resolve_project(dir.path(), "debug");
        assert_eq!(model.modules.len(), 1);
        assert_eq!(model.modules[0].source_roots.len(), 1);
    }

    #[test]
    fn manual_config_is_highest_priority() {
        let dir = workspace();
        fs::create_dir_all(dir.path().join("src/main/kotlin")).unwrap();
        fs::write(dir.path().join("build.gradle.kts"), "").unwrap();
        fs::write(
            dir.path().join(".kotlin-analyzer.json"),
            r#"{"modules":[{"name":"manual-app","sourceRoots":[],"classpath":["/libs/a.jar"]}]}"#,
        )
        .unwrap();
        let model = resolve_project(dir.path(), "debug");
        assert_eq!(model.modules.len(), 1);
        assert_eq!(model.modules[0].name, "manual-app");
    }

    #[test]
    fn kmp_detection_attaches_leaf_targets_from_disk_layout() {
        let dir = workspace();
        fs::write(
            dir.path().join("build.gradle.kts"),
            "plugins { kotlin(\"multiplatform\") }",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("src/commonMain/kotlin")).unwrap();
        fs::create_dir_all(dir.path().join("src/jvmMain/kotlin")).unwrap();
        fs::create_dir_all(dir.path().join("src/iosArm64Main/kotlin")).unwrap();

        let mut modules = structural_modules_from_disk(dir.path(), "debug");
        detect_kmp_targets(dir.path(), &mut modules);
        let module = modules.values().next().unwrap();
        assert_eq!(module.targets.len(), 2);
        let jvm_target = module.targets.iter().find(|t| t.platform == Platform::Jvm).unwrap();
        assert!(jvm_target.source_roots.iter().any(|r| r.ends_with("commonMain/kotlin")));
    }
}
