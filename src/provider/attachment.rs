use crate::error::LlmError;
use crate::model::Attachment;

/// Prompt-side stand-in for an image when counting tokens locally.
pub(crate) const IMAGE_PROMPT_TEXT: &str = "[image attachment]";

/// What an attachment becomes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttachmentPart<'a> {
    Image { mime_type: String, data: &'a [u8] },
    /// Rendered `[attachment:<file>]` header plus the file content
    Text(String),
}

impl AttachmentPart<'_> {
    /// Text used for the local prompt token estimate.
    pub(crate) fn prompt_text(&self) -> &str {
        match self {
            Self::Image { .. } => IMAGE_PROMPT_TEXT,
            Self::Text(text) => text,
        }
    }
}

pub(crate) fn classify(attachment: &Attachment) -> Result<AttachmentPart<'_>, LlmError> {
    let mut mime_type = attachment.mime_type.trim().to_ascii_lowercase();
    if mime_type.is_empty() {
        mime_type = sniff_mime_type(&attachment.data).to_string();
    }

    if mime_type.starts_with("image/") {
        if attachment.data.is_empty() {
            return Err(LlmError::EmptyAttachment {
                file_name: attachment.file_name.clone(),
            });
        }
        return Ok(AttachmentPart::Image {
            mime_type,
            data: &attachment.data,
        });
    }

    let utf8 = std::str::from_utf8(&attachment.data);
    if is_text_mime_type(&mime_type) || utf8.is_ok() {
        let file_name = if attachment.file_name.is_empty() {
            "attachment.txt"
        } else {
            attachment.file_name.as_str()
        };
        let content = String::from_utf8_lossy(&attachment.data);
        return Ok(AttachmentPart::Text(format!("[attachment:{file_name}]\n{content}")));
    }

    Err(LlmError::UnsupportedAttachment { mime_type })
}

fn is_text_mime_type(mime_type: &str) -> bool {
    mime_type.starts_with("text/")
        || mime_type == "application/json"
        || mime_type.ends_with("+json")
        || mime_type == "application/xml"
        || mime_type.ends_with("+xml")
}

/// Magic-byte sniffing for payloads sent without a MIME type.
fn sniff_mime_type(data: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
    ];
    for (magic, mime) in SIGNATURES {
        if data.starts_with(magic) {
            return mime;
        }
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    if std::str::from_utf8(data).is_ok() {
        return "text/plain";
    }
    "application/octet-stream"
}
