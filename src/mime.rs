//! MIME resolution for library entries.
//!
//! Resolution order: extension table (peeling a trailing `.part` from
//! incomplete downloads), then content sniffing over the first 512 bytes.
//! `video/x-msvideo` is rewritten to `video/avi` because several renderers
//! refuse the canonical name.

use std::fmt;
use std::io::Read;
use std::path::Path;

/// Number of leading bytes consulted by the content sniffer.
const SNIFF_LEN: usize = 512;

const REAL_MEDIA_VBR: &str = "application/vnd.rn-realmedia-vbr";

/// A resolved MIME string, e.g. `video/mpeg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mime(String);

/// Coarse media category, the part before the `/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeCategory {
    Video,
    Audio,
    Image,
    Other,
}

impl Mime {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn category(&self) -> MimeCategory {
        if self.0 == REAL_MEDIA_VBR {
            return MimeCategory::Video;
        }
        match self.0.split('/').next() {
            Some("video") => MimeCategory::Video,
            Some("audio") => MimeCategory::Audio,
            Some("image") => MimeCategory::Image,
            _ => MimeCategory::Other,
        }
    }

    pub fn is_media(&self) -> bool {
        self.category() != MimeCategory::Other
    }
}

impl fmt::Display for Mime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl MimeCategory {
    /// The token used to build `object.item.<x>Item` UPnP classes.
    pub fn as_str(&self) -> &'static str {
        match self {
            MimeCategory::Video => "video",
            MimeCategory::Audio => "audio",
            MimeCategory::Image => "image",
            MimeCategory::Other => "other",
        }
    }
}

fn by_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        // Video formats
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "webm" => "video/webm",
        "m4v" => "video/x-m4v",
        "3gp" => "video/3gpp",
        "mpg" | "mpeg" => "video/mpeg",
        "ts" => "video/mp2t",
        "vob" => "video/mpeg",
        "ogv" => "video/ogg",
        "divx" => "video/x-msvideo",
        "rmvb" => REAL_MEDIA_VBR,

        // Audio formats
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "ogg" | "oga" => "audio/ogg",
        "wma" => "audio/x-ms-wma",
        "m4a" => "audio/mp4",
        "opus" => "audio/opus",
        "aiff" => "audio/aiff",

        // Image formats
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tiff" => "image/tiff",
        "webp" => "image/webp",

        _ => return None,
    };
    Some(mime)
}

/// Guesses a media MIME type from the base name alone, peeling extensions
/// given to incomplete files. Non-media extension hits are ignored so that
/// `movie.mkv.part` resolves while `notes.txt.part` does not.
fn by_base_name(name: &str) -> Option<Mime> {
    let mut name = name;
    while !name.is_empty() {
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !ext.is_empty() => (stem, ext.to_ascii_lowercase()),
            _ => break,
        };
        if let Some(mime) = by_extension(&ext) {
            let mime = Mime(mime.to_string());
            if mime.is_media() {
                return Some(mime);
            }
        }
        if ext != "part" {
            break;
        }
        name = stem;
    }
    None
}

/// A small magic-number sniffer over the leading bytes of a file, covering
/// the containers that matter here plus a text/binary fallback.
fn sniff(data: &[u8]) -> &'static str {
    fn riff_kind(data: &[u8]) -> Option<&'static str> {
        if data.len() >= 12 && &data[..4] == b"RIFF" {
            return match &data[8..12] {
                b"AVI " => Some("video/avi"),
                b"WAVE" => Some("audio/wav"),
                b"WEBP" => Some("image/webp"),
                _ => None,
            };
        }
        None
    }

    if let Some(kind) = riff_kind(data) {
        return kind;
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return match &data[8..11] {
            b"M4A" => "audio/mp4",
            b"qt " | b"qt\0" => "video/quicktime",
            _ => "video/mp4",
        };
    }
    if data.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
        // EBML; the doctype string distinguishes webm from matroska.
        let head = &data[..data.len().min(64)];
        if head.windows(4).any(|w| w == b"webm") {
            return "video/webm";
        }
        return "video/x-matroska";
    }
    if data.starts_with(b"OggS") {
        return "application/ogg";
    }
    if data.starts_with(b"fLaC") {
        return "audio/flac";
    }
    if data.starts_with(b"ID3") || (data.len() >= 2 && data[0] == 0xff && data[1] & 0xe0 == 0xe0) {
        return "audio/mpeg";
    }
    if data.starts_with(&[0xff, 0xd8, 0xff]) {
        return "image/jpeg";
    }
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        return "image/png";
    }
    if data.starts_with(b"GIF8") {
        return "image/gif";
    }
    if data.starts_with(b"BM") {
        return "image/bmp";
    }
    if data.starts_with(b".RMF") {
        return REAL_MEDIA_VBR;
    }
    if data.iter().any(|&b| b == 0) {
        return "application/octet-stream";
    }
    "text/plain; charset=utf-8"
}

fn by_content(path: &Path) -> Option<Mime> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut buf = [0u8; SNIFF_LEN];
    let n = file.read(&mut buf).ok()?;
    Some(Mime(sniff(&buf[..n]).to_string()))
}

fn normalize(mime: Mime) -> Mime {
    if mime.0 == "video/x-msvideo" {
        Mime("video/avi".to_string())
    } else {
        mime
    }
}

/// Determines the MIME type for the given path; `None` when nothing could
/// be read at all.
pub fn mime_type_by_path(path: &Path) -> Option<Mime> {
    let name = path.file_name()?.to_str()?;
    if let Some(mime) = by_base_name(name) {
        return Some(normalize(mime));
    }
    by_content(path).map(normalize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn extension_lookup() {
        let m = mime_type_by_path(Path::new("/media/movie.mkv")).unwrap();
        assert_eq!(m.as_str(), "video/x-matroska");
        assert_eq!(m.category(), MimeCategory::Video);

        let m = mime_type_by_path(Path::new("/media/track.flac")).unwrap();
        assert_eq!(m.category(), MimeCategory::Audio);
    }

    #[test]
    fn avi_is_rewritten() {
        let m = mime_type_by_path(Path::new("clip.avi")).unwrap();
        assert_eq!(m.as_str(), "video/avi");
    }

    #[test]
    fn part_suffix_is_peeled() {
        let m = mime_type_by_path(Path::new("movie.mkv.part")).unwrap();
        assert_eq!(m.as_str(), "video/x-matroska");
        assert_eq!(mime_type_by_path(Path::new("notes.txt.part")), None);
    }

    #[test]
    fn registered_specials() {
        assert_eq!(
            mime_type_by_path(Path::new("cam.rmvb")).unwrap().as_str(),
            REAL_MEDIA_VBR
        );
        assert_eq!(
            mime_type_by_path(Path::new("cast.ogv")).unwrap().as_str(),
            "video/ogg"
        );
    }

    #[test]
    fn real_media_counts_as_video() {
        let m = Mime(REAL_MEDIA_VBR.to_string());
        assert_eq!(m.category(), MimeCategory::Video);
        assert!(m.is_media());
    }

    #[test]
    fn content_sniffing_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mystery");
        let mut f = std::fs::File::create(&path).unwrap();
        // Matroska EBML header with a webm doctype.
        f.write_all(&[0x1a, 0x45, 0xdf, 0xa3]).unwrap();
        f.write_all(b"\x42\x82\x84webm").unwrap();
        drop(f);
        let m = mime_type_by_path(&path).unwrap();
        assert_eq!(m.as_str(), "video/webm");
    }

    #[test]
    fn sniff_magic_numbers() {
        assert_eq!(sniff(b"\xff\xd8\xff\xe0JFIF"), "image/jpeg");
        assert_eq!(sniff(b"RIFF\x00\x00\x00\x00AVI LIST"), "video/avi");
        assert_eq!(sniff(b"RIFF\x00\x00\x00\x00WAVEfmt "), "audio/wav");
        assert_eq!(sniff(b"\x00\x00\x00\x20ftypisom"), "video/mp4");
        assert_eq!(sniff(b"ID3\x04\x00"), "audio/mpeg");
        assert_eq!(sniff(b"plain text here"), "text/plain; charset=utf-8");
        assert_eq!(sniff(b"\x00\x01\x02"), "application/octet-stream");
    }
}
