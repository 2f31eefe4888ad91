//! Compiler configuration.

use kindc_codegen::CodegenOptions;
use serde::{Deserialize, Serialize};

/// Options for one compilation. Every field has a default, so a partial
/// JSON object is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Emit only the code records, without the surrounding template.
    pub short_form: bool,
    /// Upper bound on usage-analysis passes before giving up.
    pub max_discovery_passes: usize,
    /// Reported as the file of every fault.
    pub file_name: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        let codegen = CodegenOptions::default();
        Self {
            short_form: false,
            max_discovery_passes: codegen.max_discovery_passes,
            file_name: codegen.file_name,
        }
    }
}

impl CompileOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub(crate) fn codegen(&self) -> CodegenOptions {
        CodegenOptions {
            file_name: self.file_name.clone(),
            max_discovery_passes: self.max_discovery_passes,
        }
    }
}
