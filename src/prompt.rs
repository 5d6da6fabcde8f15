//! Prompt assembly for GOT OCR and inline base64 image handling.

use base64::Engine;

use crate::backend::{ImageEmbed, VisionEncoder};
use crate::OcrError;

/// Chat prefix fed before the image positions. Ends with the opening `<img>`.
pub const SYSTEM_PROMPT: &str = "<|im_start|>system\n\
You should follow the instructions carefully and explain your answers in detail.\
<|im_end|><|im_start|>user<img>";

const OCR_PROMPT: &str = "</img>\nOCR: <|im_end|><|im_start|>assistant";
const OCR_FORMAT_PROMPT: &str = "</img>\nOCR with format: <|im_end|><|im_start|>assistant";
const OCR_CROP_PROMPT: &str =
    "</img>\nOCR upon the patch reference: <|im_end|><|im_start|>assistant";
const OCR_CROP_FORMAT_PROMPT: &str =
    "</img>\nOCR with format upon the patch reference: <|im_end|><|im_start|>assistant";

/// Opening marker of an inline image in free-form prompt text.
pub const IMG_TAG_BEGIN: &str = "<img src=\"data:image/jpeg;base64,";
/// Closing marker of an inline image.
pub const IMG_TAG_END: &str = "\">";

/// OCR task variant. Discriminants match the C ABI mode codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OcrMode {
    Plain = 1,
    Format = 2,
    CropPlain = 3,
    CropFormat = 4,
}

impl OcrMode {
    pub const ALL: [OcrMode; 4] = [
        OcrMode::Plain,
        OcrMode::Format,
        OcrMode::CropPlain,
        OcrMode::CropFormat,
    ];

    /// Instruction suffix placed after the image positions.
    pub fn user_prompt(self) -> &'static str {
        match self {
            OcrMode::Plain => OCR_PROMPT,
            OcrMode::Format => OCR_FORMAT_PROMPT,
            OcrMode::CropPlain => OCR_CROP_PROMPT,
            OcrMode::CropFormat => OCR_CROP_FORMAT_PROMPT,
        }
    }

    pub fn templates(self) -> PromptTemplate {
        PromptTemplate {
            system: SYSTEM_PROMPT,
            user: self.user_prompt(),
        }
    }
}

impl TryFrom<i32> for OcrMode {
    type Error = OcrError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(OcrMode::Plain),
            2 => Ok(OcrMode::Format),
            3 => Ok(OcrMode::CropPlain),
            4 => Ok(OcrMode::CropFormat),
            other => Err(OcrError::InvalidMode(other)),
        }
    }
}

impl std::str::FromStr for OcrMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ocr" | "plain" => Ok(OcrMode::Plain),
            "format" => Ok(OcrMode::Format),
            "crop" | "crop-ocr" => Ok(OcrMode::CropPlain),
            "crop-format" => Ok(OcrMode::CropFormat),
            _ => Err(format!(
                "unknown OCR mode `{s}` (ocr, format, crop-ocr, crop-format)"
            )),
        }
    }
}

/// The text surrounding the image positions for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    pub system: &'static str,
    pub user: &'static str,
}

/// Resolve a raw mode code to its templates.
pub fn templates_for(code: i32) -> Result<PromptTemplate, OcrError> {
    OcrMode::try_from(code).map(OcrMode::templates)
}

/// Byte range of the first inline image tag, from the begin marker to the
/// end of the end marker.
pub fn find_image_tag(prompt: &str) -> Option<std::ops::Range<usize>> {
    let begin = prompt.find(IMG_TAG_BEGIN)?;
    let end = begin + prompt[begin..].find(IMG_TAG_END)?;
    Some(begin..end + IMG_TAG_END.len())
}

pub fn contains_image(prompt: &str) -> bool {
    prompt.contains(IMG_TAG_BEGIN)
}

/// Decode the base64 payload of the first inline image tag.
pub fn extract_image_bytes(prompt: &str) -> Result<Vec<u8>, OcrError> {
    let tag = find_image_tag(prompt).ok_or(OcrError::MissingImageTag)?;
    let payload = &prompt[tag.start + IMG_TAG_BEGIN.len()..tag.end - IMG_TAG_END.len()];
    Ok(base64::engine::general_purpose::STANDARD.decode(payload.trim())?)
}

/// Replace the first inline image tag with `replacement`.
///
/// Text without a complete tag is returned unchanged.
pub fn strip_image(prompt: &str, replacement: &str) -> String {
    match find_image_tag(prompt) {
        Some(tag) => {
            let mut out = String::with_capacity(prompt.len() - tag.len() + replacement.len());
            out.push_str(&prompt[..tag.start]);
            out.push_str(replacement);
            out.push_str(&prompt[tag.end..]);
            out
        }
        None => prompt.to_string(),
    }
}

/// Encode the inline image of `prompt` with an external vision encoder.
pub fn embed_from_prompt<E: VisionEncoder>(
    encoder: &E,
    n_threads: usize,
    prompt: &str,
) -> Result<ImageEmbed, OcrError> {
    let bytes = extract_image_bytes(prompt)?;
    Ok(encoder.embed_image_bytes(n_threads, &bytes)?)
}
