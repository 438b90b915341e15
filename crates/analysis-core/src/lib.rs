//! The analysis core: every semantic operation a Kotlin/JVM-multiplatform
//! language server needs, with zero dependency on any particular LSP
//! transport. `analysis-server` is a thin shim over `facade::CompilerFacade`.

pub mod archive;
pub mod backend;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod facade;
pub mod jsonrpc;
pub mod klib;
pub mod model;
pub mod resolver;
pub mod routing;
pub mod session;

pub use backend::{AnalysisBackend, ProcessBackend, SessionSpec};
pub use config::Config;
pub use error::{CoreError, Result};
pub use facade::{AnalysisCoreFacade, CompilerFacade};
pub use model::{Platform, ProjectModel};
