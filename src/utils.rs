use std::fs::DirBuilder;
use std::io;
use std::path::Path;

/// Creates a directory if it doesn't exist
pub fn ensure_dir(path: impl AsRef<Path>) -> io::Result<()> {
    DirBuilder::new().recursive(true).create(path)
}

/// First `max_chars` characters of `text` on one line, for log fields.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
