//! Routing Layer (§2 item 6, §6.3, §8 property 2): chooses the session for
//! a given file path by convention, and picks the "primary" session for
//! shared source-set files.

use std::path::Path;

use crate::model::Platform;

/// Preference order for the primary session (GLOSSARY "Primary session",
/// §4.8): JVM > ANDROID > any.
fn default_primary_order(available: &[Platform]) -> Option<Platform> {
    for preferred in [Platform::Jvm, Platform::Android] {
        if available.contains(&preferred) {
            return Some(preferred);
        }
    }
    available.first().copied()
}

/// Determines which session should answer a request for `path`, given the
/// set of sessions currently live and an optional configured primary-target
/// override (§6.4 `primary.target`).
pub fn route_for_path(
    path: &Path,
    available: &[Platform],
    primary_override: Option<Platform>,
) -> Option<Platform> {
    if available.is_empty() {
        return None;
    }
    let path_str = path.to_string_lossy();
    for platform in available {
        let platform_lower = platform.as_str().to_ascii_lowercase();
        if path_str.contains(&format!("/{platform_lower}Main/")) || path_str.contains(&format!("/{platform_lower}Test/")) {
            return Some(*platform);
        }
    }
    // Path-convention routing for non-lowercase-platform-name target dirs
    // (iosMain/nativeMain route to NATIVE; jsMain/wasmJsMain to JS; §6.3).
    for (needle, platform) in [
        ("/jvmMain/", Platform::Jvm),
        ("/jvmTest/", Platform::Jvm),
        ("/androidMain/", Platform::Android),
        ("/androidTest/", Platform::Android),
        ("/jsMain/", Platform::Js),
        ("/jsTest/", Platform::Js),
        ("/wasmJsMain/", Platform::Js),
        ("/wasmJsTest/", Platform::Js),
        ("/iosMain/", Platform::Native),
        ("/iosTest/", Platform::Native),
        ("/nativeMain/", Platform::Native),
        ("/nativeTest/", Platform::Native),
        ("/macosMain/", Platform::Native),
        ("/linuxMain/", Platform::Native),
        ("/mingwMain/", Platform::Native),
    ] {
        if path_str.contains(needle) && available.contains(&platform) {
            return Some(platform);
        }
    }
    if path_str.contains("/commonMain/") || path_str.contains("/commonTest/") {
        return primary_override
            .filter(|p| available.contains(p))
            .or_else(|| default_primary_order(available));
    }
    // Non-multiplatform or unrecognized layout: fall back to the primary.
    primary_override
        .filter(|p| available.contains(p))
        .or_else(|| default_primary_order(available))
}

pub fn platform_name_for_file(
    path: &Path,
    available: &[Platform],
    primary_override: Option<Platform>,
    is_multiplatform: bool,
) -> Option<String> {
    if !is_multiplatform {
        return None;
    }
    route_for_path(path, available, primary_override).map(|p| p.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn routes_jvm_main_to_jvm_session() {
        let path = PathBuf::from("/ws/src/jvmMain/kotlin/Foo.kt");
        let available = vec![Platform::Jvm, Platform::Native];
        assert_eq!(route_for_path(&path, &available, None), Some(Platform::Jvm));
    }

    #[test]
    fn routes_android_main_to_android_session() {
        let path = PathBuf::from("/ws/src/androidMain/kotlin/Foo.kt");
        let available = vec![Platform::Android, Platform::Js];
        assert_eq!(route_for_path(&path, &available, None), Some(Platform::Android));
    }

    #[test]
    fn routes_ios_and_native_main_to_native_session() {
        let available = vec![Platform::Native];
        assert_eq!(
            route_for_path(&PathBuf::from("/ws/src/iosMain/kotlin/Foo.kt"), &available, None),
            Some(Platform::Native)
        );
        assert_eq!(
            route_for_path(&PathBuf::from("/ws/src/nativeMain/kotlin/Foo.kt"), &available, None),
            Some(Platform::Native)
        );
    }

    #[test]
    fn common_main_routes_to_configured_primary_target() {
        let path = PathBuf::from("/ws/src/commonMain/kotlin/Foo.kt");
        let available = vec![Platform::Jvm, Platform::Android, Platform::Native];
        assert_eq!(
            route_for_path(&path, &available, Some(Platform::Android)),
            Some(Platform::Android)
        );
    }

    #[test]
    fn common_main_defaults_to_jvm_over_android_when_unconfigured() {
        let path = PathBuf::from("/ws/src/commonMain/kotlin/Foo.kt");
        let available = vec![Platform::Android, Platform::Jvm];
        assert_eq!(route_for_path(&path, &available, None), Some(Platform::Jvm));
    }

    #[test]
    fn platform_name_for_file_is_none_for_non_multiplatform_projects() {
        let path = PathBuf::from("/ws/src/main/kotlin/Foo.kt");
        assert_eq!(platform_name_for_file(&path, &[Platform::Jvm], None, false), None);
    }

    #[test]
    fn platform_name_for_file_returns_display_name_for_multiplatform() {
        let path = PathBuf::from("/ws/src/jsMain/kotlin/Foo.kt");
        assert_eq!(
            platform_name_for_file(&path, &[Platform::Js], None, true),
            Some("JS".to_string())
        );
    }
}
