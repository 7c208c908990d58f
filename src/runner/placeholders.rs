/// Environment variable naming the mounted input directory inside scripts.
pub const INPUT_PATH_VAR: &str = "INPUT_PATH";
/// Environment variable naming the mounted output directory inside scripts.
pub const OUTPUT_PATH_VAR: &str = "OUTPUT_PATH";
/// Environment variable carrying ad-hoc text input into scripts.
pub const TEXT_INPUT_VAR: &str = "TEXT_INPUT";

/// Which resource placeholders a script references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectedPlaceholders {
    pub input_path: bool,
    pub output_path: bool,
    pub text_input: bool,
}

impl DetectedPlaceholders {
    pub fn any(&self) -> bool {
        self.input_path || self.output_path || self.text_input
    }
}

/// Scan a script for placeholder tokens.
///
/// Detection is purely textual substring presence, not semantic parsing: a
/// token mentioned in a comment or string literal still triggers the
/// corresponding resource preparation. Kept this way for compatibility.
pub fn detect(script: &str) -> DetectedPlaceholders {
    DetectedPlaceholders {
        input_path: script.contains(INPUT_PATH_VAR),
        output_path: script.contains(OUTPUT_PATH_VAR),
        text_input: script.contains(TEXT_INPUT_VAR),
    }
}
