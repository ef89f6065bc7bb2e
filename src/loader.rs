use std::fs;
use std::path::{Path, PathBuf};

use lopdf::{Document as PdfDocument, Object};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LoadError;

const UNKNOWN: &str = "Unknown";

/// Metadata shared by every page (and every chunk) of one source paper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperMetadata {
    pub source: String,
    pub title: String,
    pub authors: Option<String>,
    pub year: String,
    pub journal: String,
    pub is_main_paper: bool,
}

impl PaperMetadata {
    /// Infers title, year and journal from a `<name>_<journal>_<year>.ext` file name.
    ///
    /// The convention is best effort: the year is the first underscore-delimited
    /// token made of exactly four digits, the journal is the second token.
    pub fn from_file_name(file_name: &str) -> Self {
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name);
        let parts: Vec<&str> = stem.split('_').collect();
        let year = parts
            .iter()
            .find(|part| part.len() == 4 && part.chars().all(|c| c.is_ascii_digit()))
            .map(|part| part.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let journal = parts
            .get(1)
            .map(|part| part.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());

        PaperMetadata {
            source: file_name.to_string(),
            title: stem.to_string(),
            authors: None,
            year,
            journal,
            is_main_paper: true,
        }
    }

    pub fn authors_or_unknown(&self) -> &str {
        self.authors.as_deref().unwrap_or(UNKNOWN)
    }
}

/// Raw text of one source page plus the metadata of its paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub text: String,
    /// Zero-based page number within the source file.
    pub page: usize,
    pub metadata: PaperMetadata,
}

/// Page texts extracted from one file, plus anything the file says about itself.
#[derive(Debug, Default)]
pub struct LoadedFile {
    pub pages: Vec<String>,
    pub authors: Option<String>,
}

/// Extracts page-level text from one kind of file.
pub trait PageReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<LoadedFile, LoadError>;
}

/// Reads PDFs page by page with `lopdf`.
pub struct PdfReader;

impl PageReader for PdfReader {
    fn read(&self, path: &Path) -> Result<LoadedFile, LoadError> {
        let document = PdfDocument::load(path).map_err(|e| LoadError::Pdf {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut pages = Vec::new();
        for (page_number, _) in document.get_pages() {
            match document.extract_text(&[page_number]) {
                Ok(text) => pages.push(text),
                Err(e) => {
                    debug!(path = %path.display(), page_number, error = %e, "page has no extractable text");
                    pages.push(String::new());
                }
            }
        }

        Ok(LoadedFile {
            pages,
            authors: pdf_author(&document),
        })
    }
}

fn pdf_author(document: &PdfDocument) -> Option<String> {
    let info = match document.trailer.get(b"Info").ok()? {
        Object::Reference(id) => document.get_object(*id).ok()?,
        other => other,
    };
    let raw = info.as_dict().ok()?.get(b"Author").ok()?.as_str().ok()?;
    let author = decode_pdf_string(raw);
    let author = author.trim();
    (!author.is_empty()).then(|| author.to_string())
}

fn decode_pdf_string(raw: &[u8]) -> String {
    match raw {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => String::from_utf8_lossy(raw).into_owned(),
    }
}

/// Reads UTF-8 text files; form feeds separate pages.
pub struct TextReader;

impl PageReader for TextReader {
    fn read(&self, path: &Path) -> Result<LoadedFile, LoadError> {
        let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(LoadedFile {
            pages: content.split('\x0c').map(str::to_string).collect(),
            authors: None,
        })
    }
}

/// Result of ingesting a corpus directory.
#[derive(Debug, Default)]
pub struct Corpus {
    pub documents: Vec<DocumentRecord>,
    /// Number of files that loaded successfully.
    pub papers: usize,
    /// Files that were skipped.
    pub failures: Vec<LoadError>,
}

/// Walks a corpus directory and dispatches each file to the reader for its extension.
pub struct Loader {
    readers: Vec<(String, Box<dyn PageReader>)>,
}

impl Default for Loader {
    fn default() -> Self {
        Loader::empty()
            .with_reader("pdf", PdfReader)
            .with_reader("txt", TextReader)
    }
}

impl Loader {
    pub fn empty() -> Self {
        Loader {
            readers: Vec::new(),
        }
    }

    /// Registers (or replaces) the reader used for `extension`.
    pub fn with_reader(mut self, extension: &str, reader: impl PageReader + 'static) -> Self {
        let extension = extension.to_ascii_lowercase();
        self.readers.retain(|(ext, _)| *ext != extension);
        self.readers.push((extension, Box::new(reader)));
        self
    }

    fn reader_for(&self, path: &Path) -> Option<&dyn PageReader> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        self.readers
            .iter()
            .find(|(ext, _)| *ext == extension)
            .map(|(_, reader)| reader.as_ref())
    }

    /// Loads every recognised file in `dir`.
    ///
    /// A missing directory is an empty corpus. A file that fails to load is
    /// logged and recorded in [`Corpus::failures`]; the rest of the batch continues.
    pub fn load_directory(&self, dir: impl AsRef<Path>) -> Result<Corpus, LoadError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            warn!(dir = %dir.display(), "corpus directory does not exist");
            return Ok(Corpus::default());
        }

        let io_err = |source| LoadError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() && self.reader_for(&path).is_some() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut corpus = Corpus::default();
        for path in paths {
            match self.load_file(&path) {
                Ok(records) => {
                    corpus.papers += 1;
                    corpus.documents.extend(records);
                }
                Err(e) => {
                    warn!(error = %e, "skipping unreadable file");
                    corpus.failures.push(e);
                }
            }
        }

        info!(
            skipped = corpus.failures.len(),
            "Loaded {} pages from {} papers",
            corpus.documents.len(),
            corpus.papers
        );
        Ok(corpus)
    }

    /// Loads one file and attaches filename-derived metadata to each page.
    pub fn load_file(&self, path: &Path) -> Result<Vec<DocumentRecord>, LoadError> {
        let reader = self
            .reader_for(path)
            .ok_or_else(|| LoadError::Unsupported(path.to_path_buf()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let loaded = reader.read(path)?;
        let mut metadata = PaperMetadata::from_file_name(&file_name);
        metadata.authors = loaded.authors;

        Ok(loaded
            .pages
            .into_iter()
            .enumerate()
            .map(|(page, text)| DocumentRecord {
                text,
                page,
                metadata: metadata.clone(),
            })
            .collect())
    }
}
