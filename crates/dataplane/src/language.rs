//! Languages a function can be written in.
//!
//! Each variant carries everything the runtime needs to run code in that
//! language: the default execution image, the file extension the code is
//! written with, and the function host command invoked inside the container.

use serde::{Deserialize, Serialize};

/// Directory inside every function image that holds the host and user code.
pub const FUNCTION_DIR: &str = "/function";

/// File stem the user code is written to, inside [`FUNCTION_DIR`].
const CODE_FILE_STEM: &str = "function_code";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Language {
    #[default]
    Python,
    #[strum(to_string = "javascript", serialize = "js")]
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::JavaScript];

    /// Image used when the configuration does not override it.
    pub fn default_image(&self) -> &'static str {
        match self {
            Language::Python => "python-function:latest",
            Language::JavaScript => "javascript-function:latest",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
        }
    }

    /// Name of the code file, e.g. `function_code.py`.
    pub fn code_file_name(&self) -> String {
        format!("{}.{}", CODE_FILE_STEM, self.file_extension())
    }

    /// Absolute path of the code file inside the container.
    pub fn container_code_path(&self) -> String {
        format!("{}/{}", FUNCTION_DIR, self.code_file_name())
    }

    /// Environment the function host reads its invocation from.
    ///
    /// `code_path` is where the code file lives inside the container.
    pub fn host_env(
        &self,
        code_path: &str,
        function_name: &str,
        input: &serde_json::Value,
    ) -> Vec<(String, String)> {
        vec![
            ("FUNCTION_PATH".to_string(), code_path.to_string()),
            ("FUNCTION_NAME".to_string(), function_name.to_string()),
            ("INPUT_DATA".to_string(), input.to_string()),
        ]
    }

    /// Command that runs the function host inside the container.
    pub fn host_command(&self) -> Vec<String> {
        let (interpreter, host) = match self {
            Language::Python => ("python", "function_handler.py"),
            Language::JavaScript => ("node", "function_handler.js"),
        };
        vec![interpreter.to_string(), format!("{}/{}", FUNCTION_DIR, host)]
    }
}
