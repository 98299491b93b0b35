//! Media capability classification and upload policy.

use serde::{Deserialize, Serialize};

/// Content types accepted for uploaded attachments.
pub const SUPPORTED_UPLOAD_TYPES: [&str; 16] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "video/mp4",
    "video/avi",
    "video/mov",
    "video/wmv",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "audio/mp3",
    "audio/wav",
    "audio/ogg",
];

/// Per-file upload ceiling (100 MiB).
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;
/// Maximum files accepted in one request.
pub const MAX_UPLOAD_FILES: usize = 10;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Framing options a payload of a given content type may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCapabilities {
    pub document: bool,
    pub sticker: bool,
    pub view_once: bool,
    pub gif: bool,
    pub voice: bool,
}

/// Classifies a MIME type into framing capabilities. Unknown types are document-only.
///
/// ```
/// use wa_core::media::classify;
///
/// let caps = classify("image/png");
/// assert!(caps.sticker && caps.view_once && caps.document);
/// assert!(!classify("application/zip").sticker);
/// ```
pub fn classify(content_type: &str) -> MediaCapabilities {
    let essence = essence(content_type);
    let top = essence.split('/').next().unwrap_or_default();
    MediaCapabilities {
        document: true,
        sticker: top == "image",
        view_once: top == "image" || top == "video",
        gif: top == "video",
        voice: top == "audio",
    }
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_supported_upload(content_type: &str) -> bool {
    let essence = essence(content_type);
    SUPPORTED_UPLOAD_TYPES.contains(&essence.as_str())
}

/// Infers a content type from a file name or URL path extension.
pub fn content_type_for_path(path: &str) -> &'static str {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let ext = match path.rsplit_once('.') {
        Some((_, ext)) if !ext.contains('/') => ext.to_ascii_lowercase(),
        _ => return FALLBACK_CONTENT_TYPE,
    };
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "avi" => "video/avi",
        "mov" => "video/mov",
        "wmv" => "video/wmv",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "mp3" => "audio/mp3",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        _ => FALLBACK_CONTENT_TYPE,
    }
}

/// How a media payload is presented to the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFraming {
    Inline,
    Document,
    Sticker,
    Voice,
    Gif,
}

/// Caller-requested framing flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaFlags {
    pub send_as_document: bool,
    pub send_as_sticker: bool,
    pub send_as_voice: bool,
    pub send_as_gif: bool,
    pub is_view_once: bool,
}

/// Resolved framing plus whether view-once applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingPlan {
    pub framing: MediaFraming,
    pub view_once: bool,
}

impl FramingPlan {
    pub const DOCUMENT: FramingPlan = FramingPlan {
        framing: MediaFraming::Document,
        view_once: false,
    };
}

/// Combines classifier output with caller flags. Flags the type cannot honour are ignored.
pub fn plan_framing(caps: MediaCapabilities, flags: MediaFlags) -> FramingPlan {
    let framing = if flags.send_as_document {
        MediaFraming::Document
    } else if flags.send_as_sticker && caps.sticker {
        MediaFraming::Sticker
    } else if flags.send_as_voice && caps.voice {
        MediaFraming::Voice
    } else if flags.send_as_gif && caps.gif {
        MediaFraming::Gif
    } else if caps.sticker || caps.gif || caps.voice {
        MediaFraming::Inline
    } else {
        MediaFraming::Document
    };
    let view_once = flags.is_view_once
        && caps.view_once
        && matches!(framing, MediaFraming::Inline | MediaFraming::Gif);
    FramingPlan { framing, view_once }
}

/// Static description of accepted media, served to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub supported_types: Vec<&'static str>,
    pub max_file_size_bytes: usize,
    pub max_files: usize,
    pub send_options: Vec<&'static str>,
}

pub fn media_info() -> MediaInfo {
    MediaInfo {
        supported_types: SUPPORTED_UPLOAD_TYPES.to_vec(),
        max_file_size_bytes: MAX_UPLOAD_BYTES,
        max_files: MAX_UPLOAD_FILES,
        send_options: vec![
            "sendAsDocument",
            "sendAsSticker",
            "sendAsVoice",
            "sendAsGif",
            "isViewOnce",
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let video = classify("video/mp4");
        assert!(video.gif && video.view_once && video.document);
        assert!(!video.sticker && !video.voice);

        let audio = classify("audio/ogg; codecs=opus");
        assert!(audio.voice && audio.document);
        assert!(!audio.view_once);

        let pdf = classify("application/pdf");
        assert_eq!(
            pdf,
            MediaCapabilities {
                document: true,
                sticker: false,
                view_once: false,
                gif: false,
                voice: false
            }
        );
        assert_eq!(classify(""), pdf);
    }

    #[test]
    fn upload_allow_list_ignores_parameters_and_case() {
        assert!(is_supported_upload("IMAGE/PNG"));
        assert!(is_supported_upload("audio/ogg; codecs=opus"));
        assert!(!is_supported_upload("application/zip"));
        assert!(!is_supported_upload("text/html"));
    }

    #[test]
    fn extension_inference() {
        assert_eq!(content_type_for_path("photo.JPG"), "image/jpeg");
        assert_eq!(
            content_type_for_path("https://cdn.example.com/a/report.pdf?sig=1"),
            "application/pdf"
        );
        assert_eq!(
            content_type_for_path("https://example.com/download"),
            FALLBACK_CONTENT_TYPE
        );
        assert_eq!(content_type_for_path("archive.tar.gz"), FALLBACK_CONTENT_TYPE);
    }

    #[test]
    fn framing_respects_capabilities() {
        let sticker = MediaFlags {
            send_as_sticker: true,
            ..MediaFlags::default()
        };
        assert_eq!(
            plan_framing(classify("image/webp"), sticker).framing,
            MediaFraming::Sticker
        );
        // sticker flag on a pdf is ignored
        assert_eq!(
            plan_framing(classify("application/pdf"), sticker),
            FramingPlan::DOCUMENT
        );

        let voice_on_video = MediaFlags {
            send_as_voice: true,
            is_view_once: true,
            ..MediaFlags::default()
        };
        let plan = plan_framing(classify("video/mp4"), voice_on_video);
        assert_eq!(plan.framing, MediaFraming::Inline);
        assert!(plan.view_once);
    }

    #[test]
    fn document_flag_wins_and_drops_view_once() {
        let flags = MediaFlags {
            send_as_document: true,
            send_as_sticker: true,
            is_view_once: true,
            ..MediaFlags::default()
        };
        assert_eq!(plan_framing(classify("image/png"), flags), FramingPlan::DOCUMENT);
    }

    #[test]
    fn audio_view_once_is_not_applied() {
        let flags = MediaFlags {
            is_view_once: true,
            ..MediaFlags::default()
        };
        let plan = plan_framing(classify("audio/mp3"), flags);
        assert_eq!(plan.framing, MediaFraming::Inline);
        assert!(!plan.view_once);
    }
}
