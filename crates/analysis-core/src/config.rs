use serde::{Deserialize, Serialize};

/// Recognized configuration keys (§6.4). Deserialized from editor
/// `initializationOptions` / `didChangeConfiguration` payloads, which use
/// dotted camelCase-ish keys on the wire; `serde(rename)` maps each one to
/// its field here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "java.home")]
    pub java_home: Option<String>,

    #[serde(rename = "server.jvm-args")]
    pub jvm_args: Vec<String>,

    #[serde(rename = "build.variant")]
    pub variant: String,

    #[serde(rename = "android.auto-generate")]
    pub android_auto_generate: bool,

    #[serde(rename = "primary.target")]
    pub primary_target: Option<String>,

    #[serde(rename = "trace.level")]
    pub trace_level: TraceLevel,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            java_home: None,
            jvm_args: Vec::new(),
            variant: "debug".to_string(),
            android_auto_generate: false,
            primary_target: None,
            trace_level: TraceLevel::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    Off,
    Messages,
    Verbose,
}
