//! Upload validation.
//!
//! A file is accepted only when all of these hold:
//! - it is non-empty and within the size cap
//! - its name has no traversal, separators or NUL bytes, and no dot-segment
//!   after the first is a dangerous extension (`shell.php.png` is refused)
//! - its final extension is allowed
//! - its declared MIME type is allowed and is one the extension stands for
//! - its leading bytes match a known signature for that type
//! - it does not start with an executable signature
//! - textual content carries no script or shell markers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::paths::PathError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Image => "image",
            MediaCategory::Video => "video",
            MediaCategory::Audio => "audio",
            MediaCategory::Document => "document",
        }
    }
}

/// Bytes expected at `offset` for files of type `mime`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagicSignature {
    pub mime: String,
    #[serde(default)]
    pub offset: usize,
    pub bytes: Vec<u8>,
}

impl MagicSignature {
    fn new(mime: &str, offset: usize, bytes: &[u8]) -> Self {
        Self {
            mime: mime.to_string(),
            offset,
            bytes: bytes.to_vec(),
        }
    }

    fn matches(&self, data: &[u8]) -> bool {
        let Some(end) = self.offset.checked_add(self.bytes.len()) else {
            return false;
        };
        data.get(self.offset..end) == Some(self.bytes.as_slice())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    pub max_size_bytes: u64,
    pub max_filename_length: usize,
    pub allowed_image_types: Vec<String>,
    pub allowed_video_types: Vec<String>,
    pub allowed_audio_types: Vec<String>,
    pub allowed_document_types: Vec<String>,
    pub allowed_extensions: Vec<String>,
    /// MIME types each extension may be declared as.
    pub extension_types: BTreeMap<String, Vec<String>>,
    pub dangerous_extensions: Vec<String>,
    pub signatures: Vec<MagicSignature>,
    /// Formats refused whatever type is declared.
    pub executable_signatures: Vec<MagicSignature>,
    /// Declared types scanned for markers even when they have a signature.
    pub text_types: Vec<String>,
    pub dangerous_markers: Vec<String>,
    /// How much of the file the marker scan reads.
    pub scan_bytes: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
        const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
        const OLE: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
        const ZIP: &[u8] = b"PK\x03\x04";
        let extension_types: &[(&str, &[&str])] = &[
            ("jpg", &["image/jpeg"]),
            ("jpeg", &["image/jpeg"]),
            ("png", &["image/png"]),
            ("gif", &["image/gif"]),
            ("webp", &["image/webp"]),
            ("bmp", &["image/bmp"]),
            ("tif", &["image/tiff"]),
            ("tiff", &["image/tiff"]),
            ("mp4", &["video/mp4", "audio/mp4"]),
            ("webm", &["video/webm"]),
            ("mov", &["video/quicktime"]),
            ("avi", &["video/x-msvideo"]),
            ("mp3", &["audio/mpeg"]),
            ("wav", &["audio/wav"]),
            ("ogg", &["audio/ogg"]),
            ("flac", &["audio/flac"]),
            ("m4a", &["audio/mp4"]),
            ("pdf", &["application/pdf"]),
            ("doc", &["application/msword"]),
            ("docx", &[DOCX]),
            ("xls", &["application/vnd.ms-excel"]),
            ("xlsx", &[XLSX]),
            ("txt", &["text/plain"]),
            ("csv", &["text/csv", "text/plain"]),
            ("json", &["application/json"]),
        ];

        Self {
            max_size_bytes: 10 * 1024 * 1024,
            max_filename_length: 255,
            allowed_image_types: strings(&[
                "image/jpeg",
                "image/png",
                "image/gif",
                "image/webp",
                "image/bmp",
                "image/tiff",
            ]),
            allowed_video_types: strings(&["video/mp4", "video/webm", "video/quicktime", "video/x-msvideo"]),
            allowed_audio_types: strings(&["audio/mpeg", "audio/wav", "audio/ogg", "audio/flac", "audio/mp4"]),
            allowed_document_types: strings(&[
                "application/pdf",
                "application/msword",
                DOCX,
                "application/vnd.ms-excel",
                XLSX,
                "text/plain",
                "text/csv",
                "application/json",
            ]),
            allowed_extensions: strings(&[
                "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "mp4", "webm", "mov",
                "avi", "mp3", "wav", "ogg", "flac", "m4a", "pdf", "doc", "docx", "xls", "xlsx",
                "txt", "csv", "json",
            ]),
            extension_types: extension_types
                .iter()
                .map(|(ext, types)| (ext.to_string(), strings(types)))
                .collect(),
            dangerous_extensions: strings(&[
                "exe", "dll", "so", "bat", "cmd", "com", "sh", "bash", "ps1", "psm1", "vbs", "vbe",
                "js", "jse", "mjs", "wsf", "jar", "msi", "scr", "pif", "cpl", "hta", "php", "php3",
                "php4", "php5", "phtml", "phar", "asp", "aspx", "jsp", "jspx", "cgi", "pl", "py",
                "rb", "war", "htaccess", "html", "htm", "shtml", "xhtml", "svg",
            ]),
            signatures: vec![
                MagicSignature::new("image/jpeg", 0, &[0xFF, 0xD8, 0xFF]),
                MagicSignature::new("image/png", 0, &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
                MagicSignature::new("image/gif", 0, b"GIF87a"),
                MagicSignature::new("image/gif", 0, b"GIF89a"),
                MagicSignature::new("image/webp", 8, b"WEBP"),
                MagicSignature::new("image/bmp", 0, b"BM"),
                MagicSignature::new("image/tiff", 0, b"II*\0"),
                MagicSignature::new("image/tiff", 0, b"MM\0*"),
                MagicSignature::new("video/mp4", 4, b"ftyp"),
                MagicSignature::new("video/quicktime", 4, b"ftyp"),
                MagicSignature::new("video/quicktime", 4, b"moov"),
                MagicSignature::new("video/webm", 0, &[0x1A, 0x45, 0xDF, 0xA3]),
                MagicSignature::new("video/x-msvideo", 8, b"AVI "),
                MagicSignature::new("audio/mpeg", 0, b"ID3"),
                MagicSignature::new("audio/mpeg", 0, &[0xFF, 0xFB]),
                MagicSignature::new("audio/mpeg", 0, &[0xFF, 0xF3]),
                MagicSignature::new("audio/mpeg", 0, &[0xFF, 0xF2]),
                MagicSignature::new("audio/wav", 8, b"WAVE"),
                MagicSignature::new("audio/ogg", 0, b"OggS"),
                MagicSignature::new("audio/flac", 0, b"fLaC"),
                MagicSignature::new("audio/mp4", 4, b"ftyp"),
                MagicSignature::new("application/pdf", 0, b"%PDF"),
                MagicSignature::new("application/msword", 0, OLE),
                MagicSignature::new("application/vnd.ms-excel", 0, OLE),
                MagicSignature::new(DOCX, 0, ZIP),
                MagicSignature::new(XLSX, 0, ZIP),
            ],
            executable_signatures: vec![
                MagicSignature::new("application/x-msdownload", 0, b"MZ"),
                MagicSignature::new("application/x-elf", 0, &[0x7F, b'E', b'L', b'F']),
                MagicSignature::new("application/x-mach-binary", 0, &[0xFE, 0xED, 0xFA, 0xCE]),
                MagicSignature::new("application/x-mach-binary", 0, &[0xFE, 0xED, 0xFA, 0xCF]),
                MagicSignature::new("application/x-mach-binary", 0, &[0xCF, 0xFA, 0xED, 0xFE]),
                MagicSignature::new("application/x-mach-binary", 0, &[0xCE, 0xFA, 0xED, 0xFE]),
                MagicSignature::new("application/java-vm", 0, &[0xCA, 0xFE, 0xBA, 0xBE]),
                MagicSignature::new("text/x-shellscript", 0, b"#!"),
            ],
            text_types: strings(&["text/plain", "text/csv", "application/json"]),
            dangerous_markers: strings(&[
                "<script",
                "</script",
                "<?php",
                "<%",
                "<iframe",
                "javascript:",
                "vbscript:",
                "onerror=",
                "onload=",
                "document.cookie",
                "eval(",
                "exec(",
                "system(",
                "passthru(",
                "shell_exec(",
                "base64_decode(",
                "#!/bin/",
                "/bin/sh",
                "/bin/bash",
                "cmd.exe",
                "powershell",
            ]),
            scan_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("file is empty")]
    Empty,

    #[error("file is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("filename is empty")]
    EmptyFilename,

    #[error("filename is {len} characters long, limit is {max}")]
    FilenameTooLong { len: usize, max: usize },

    #[error("filename contains a traversal sequence")]
    PathTraversal,

    #[error("filename contains a path separator")]
    PathSeparator,

    #[error("filename contains a NUL byte")]
    NullByte,

    #[error("filename contains dangerous extension .{0}")]
    DangerousExtension(String),

    #[error("filename has no extension")]
    MissingExtension,

    #[error("extension .{0} is not allowed")]
    ExtensionNotAllowed(String),

    #[error("content type {0} is not allowed")]
    MimeNotAllowed(String),

    #[error("extension .{extension} does not match declared type {declared}")]
    TypeMismatch { extension: String, declared: String },

    #[error("content does not match declared type {declared}")]
    SignatureMismatch { declared: String },

    #[error("content is an executable ({0})")]
    ExecutableContent(String),

    #[error("content contains dangerous marker {0:?}")]
    DangerousContent(String),

    #[error("{0}")]
    UnsafePath(#[from] PathError),
}

impl UploadError {
    pub fn reason(&self) -> &'static str {
        match self {
            UploadError::Empty => "empty",
            UploadError::TooLarge { .. } => "too_large",
            UploadError::EmptyFilename
            | UploadError::FilenameTooLong { .. }
            | UploadError::PathTraversal
            | UploadError::PathSeparator
            | UploadError::NullByte
            | UploadError::UnsafePath(_) => "bad_filename",
            UploadError::DangerousExtension(_)
            | UploadError::MissingExtension
            | UploadError::ExtensionNotAllowed(_) => "bad_extension",
            UploadError::MimeNotAllowed(_) | UploadError::TypeMismatch { .. } => "bad_type",
            UploadError::SignatureMismatch { .. } => "signature_mismatch",
            UploadError::ExecutableContent(_) | UploadError::DangerousContent(_) => "dangerous_content",
        }
    }
}

/// A file as presented by the client.
#[derive(Debug, Clone, Copy)]
pub struct UploadFile<'a> {
    pub filename: &'a str,
    pub content_type: &'a str,
    pub bytes: &'a [u8],
}

/// What an accepted file may be stored as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadDecision {
    pub sanitized_filename: String,
    pub mime: String,
    pub category: MediaCategory,
    pub size: u64,
}

pub struct UploadValidator {
    policy: UploadPolicy,
}

impl UploadValidator {
    pub fn new(mut policy: UploadPolicy) -> Self {
        for list in [
            &mut policy.allowed_image_types,
            &mut policy.allowed_video_types,
            &mut policy.allowed_audio_types,
            &mut policy.allowed_document_types,
            &mut policy.allowed_extensions,
            &mut policy.dangerous_extensions,
            &mut policy.text_types,
            &mut policy.dangerous_markers,
        ] {
            for item in list.iter_mut() {
                *item = item.trim().to_ascii_lowercase();
            }
        }
        for signature in &mut policy.signatures {
            signature.mime = signature.mime.to_ascii_lowercase();
        }
        policy.extension_types = std::mem::take(&mut policy.extension_types)
            .into_iter()
            .map(|(ext, types)| {
                let types = types.iter().map(|t| t.trim().to_ascii_lowercase()).collect();
                (ext.trim().to_ascii_lowercase(), types)
            })
            .collect();
        Self { policy }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn validate(&self, file: &UploadFile<'_>) -> Result<UploadDecision, UploadError> {
        let size = file.bytes.len() as u64;
        if size == 0 {
            return Err(UploadError::Empty);
        }
        if size > self.policy.max_size_bytes {
            return Err(UploadError::TooLarge {
                size,
                max: self.policy.max_size_bytes,
            });
        }

        let extension = self.check_filename(file.filename)?;
        if !self.policy.allowed_extensions.contains(&extension) {
            return Err(UploadError::ExtensionNotAllowed(extension));
        }

        let mime = essence(file.content_type);
        let category = self
            .category_of(&mime)
            .ok_or_else(|| UploadError::MimeNotAllowed(mime.clone()))?;

        let matches_extension = self
            .policy
            .extension_types
            .get(&extension)
            .is_some_and(|types| types.contains(&mime));
        if !matches_extension {
            return Err(UploadError::TypeMismatch {
                extension,
                declared: mime,
            });
        }

        if let Some(executable) = self
            .policy
            .executable_signatures
            .iter()
            .find(|sig| sig.matches(file.bytes))
        {
            return Err(UploadError::ExecutableContent(executable.mime.clone()));
        }

        let mut known = self
            .policy
            .signatures
            .iter()
            .filter(|sig| sig.mime == mime)
            .peekable();
        let has_signature = known.peek().is_some();
        if has_signature && !known.any(|sig| sig.matches(file.bytes)) {
            return Err(UploadError::SignatureMismatch { declared: mime });
        }

        if !has_signature || self.is_text_type(&mime) {
            self.scan_content(file.bytes)?;
        }

        Ok(UploadDecision {
            sanitized_filename: sanitize_filename(file.filename),
            mime,
            category,
            size,
        })
    }

    /// Check the name and return its final extension, lowercased.
    fn check_filename(&self, filename: &str) -> Result<String, UploadError> {
        if filename.trim().is_empty() {
            return Err(UploadError::EmptyFilename);
        }
        let len = filename.chars().count();
        if len > self.policy.max_filename_length {
            return Err(UploadError::FilenameTooLong {
                len,
                max: self.policy.max_filename_length,
            });
        }
        if filename.contains('\0') {
            return Err(UploadError::NullByte);
        }
        if filename.contains("..") {
            return Err(UploadError::PathTraversal);
        }
        if filename.contains('/') || filename.contains('\\') {
            return Err(UploadError::PathSeparator);
        }

        let lower = filename.to_ascii_lowercase();
        let mut segments = lower.split('.');
        segments.next();
        let extensions: Vec<&str> = segments.map(str::trim).collect();
        if let Some(dangerous) = extensions
            .iter()
            .find(|ext| self.policy.dangerous_extensions.iter().any(|d| d == *ext))
        {
            return Err(UploadError::DangerousExtension(dangerous.to_string()));
        }

        match extensions.last() {
            Some(ext) if !ext.is_empty() => Ok(ext.to_string()),
            _ => Err(UploadError::MissingExtension),
        }
    }

    pub fn category_of(&self, mime: &str) -> Option<MediaCategory> {
        let p = &self.policy;
        [
            (&p.allowed_image_types, MediaCategory::Image),
            (&p.allowed_video_types, MediaCategory::Video),
            (&p.allowed_audio_types, MediaCategory::Audio),
            (&p.allowed_document_types, MediaCategory::Document),
        ]
        .into_iter()
        .find(|(types, _)| types.iter().any(|t| t == mime))
        .map(|(_, category)| category)
    }

    fn is_text_type(&self, mime: &str) -> bool {
        mime.starts_with("text/") || self.policy.text_types.iter().any(|t| t == mime)
    }

    fn scan_content(&self, bytes: &[u8]) -> Result<(), UploadError> {
        let window = &bytes[..bytes.len().min(self.policy.scan_bytes)];
        let text = String::from_utf8_lossy(window).to_ascii_lowercase();
        match self
            .policy
            .dangerous_markers
            .iter()
            .find(|marker| text.contains(marker.as_str()))
        {
            Some(marker) => Err(UploadError::DangerousContent(marker.clone())),
            None => Ok(()),
        }
    }
}

/// `image/PNG; charset=x` becomes `image/png`.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Keep ASCII letters, digits, `.`, `-` and `_`; replace everything else.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
