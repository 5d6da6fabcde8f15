//! Result container handed back by `OcrSession::run`.

/// Either the generated text or an error message, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcrOutput {
    Text(String),
    Error(String),
}

impl OcrOutput {
    pub fn text(&self) -> Option<&str> {
        match self {
            OcrOutput::Text(text) => Some(text),
            OcrOutput::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            OcrOutput::Text(_) => None,
            OcrOutput::Error(message) => Some(message),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, OcrOutput::Text(_))
    }

    /// Convert into a standard `Result`.
    pub fn into_result(self) -> Result<String, String> {
        match self {
            OcrOutput::Text(text) => Ok(text),
            OcrOutput::Error(message) => Err(message),
        }
    }

    /// Release the output explicitly. Equivalent to dropping it.
    pub fn release(self) {}
}
