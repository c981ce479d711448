//! Multipart/form-data intake.
//!
//! Parts arrive through a streaming boundary scanner driven by the request
//! parser. A part with a `filename` streams to a temporary file on disk as
//! its bytes arrive; other parts accumulate in memory and are decoded as
//! UTF-8 when the part ends.
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tempfile::NamedTempFile;

// Matches the two accepted shapes:
//   Content-Disposition: form-data; name="<name>"
//   Content-Disposition: form-data; name="<name>"; filename="<filename>"
// with the quotes optional in both places.
fn disposition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"Content-Disposition: form-data; name="?([^;"]*)"?(?:; filename="?([^;"]*)"?)?"#)
            .expect("disposition regex")
    })
}

/// An uploaded file from a `multipart/form-data` request.
///
/// The content lives in a temporary file that is removed when the
/// [`Request`](crate::Request) owning it is dropped.
#[derive(Debug)]
pub struct FormFile {
    filename: String,
    file: NamedTempFile,
}

impl FormFile {
    /// The filename the client supplied in `Content-Disposition`.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Path of the backing temporary file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Opens an independent handle to the uploaded content.
    pub fn open(&self) -> io::Result<File> {
        self.file.reopen()
    }

    /// Size of the uploaded content in bytes.
    pub fn len(&self) -> io::Result<u64> {
        self.file.as_file().metadata().map(|meta| meta.len())
    }
}

/// The part currently being received.
#[derive(Debug)]
pub(crate) struct PartSink {
    pub(crate) name: String,
    pub(crate) filename: String,
    pub(crate) file: Option<NamedTempFile>,
}

impl PartSink {
    /// Reads `name` and `filename` out of a part's header block. Returns
    /// `None` when the block has no well-formed `Content-Disposition`.
    pub(crate) fn parse_disposition(head: &str) -> Option<(String, String)> {
        let captures = disposition_regex().captures(head)?;
        let name = captures.get(1).map(|m| m.as_str().to_owned()).unwrap_or_default();
        let filename = captures.get(2).map(|m| m.as_str().to_owned()).unwrap_or_default();
        Some((name, filename))
    }

    /// Opens the sink for a part. Parts with a filename get a temporary
    /// file eagerly so content can stream to disk.
    pub(crate) fn open(name: String, filename: String) -> io::Result<PartSink> {
        let file = if filename.is_empty() {
            None
        } else {
            Some(NamedTempFile::new()?)
        };
        Ok(PartSink { name, filename, file })
    }

    /// Appends streamed content. Only file-backed parts stream; in-memory
    /// parts keep their bytes in the scan buffer until the part ends.
    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file {
            Some(ref mut file) => file.write_all(data),
            None => Ok(()),
        }
    }

    /// Completes a file-backed part with its final bytes.
    pub(crate) fn finish_file(mut self, tail: &[u8]) -> io::Result<(String, FormFile)> {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => return Err(io::Error::new(io::ErrorKind::Other, "part has no file")),
        };
        file.write_all(tail)?;
        file.flush()?;
        Ok((
            self.name,
            FormFile {
                filename: self.filename,
                file,
            },
        ))
    }
}
