use crate::error::{BittorrentError, Result};
use crate::torrent::FileEntry;
use std::collections::BTreeSet;
use std::fmt::Write;

/// Indices (into the torrent's file list) of the files to download
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    files: BTreeSet<usize>,
}

impl Selection {
    pub fn all(file_count: usize) -> Self {
        Self {
            files: (0..file_count).collect(),
        }
    }

    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            files: indices.into_iter().collect(),
        }
    }

    /// Parse a menu answer: whitespace-separated entries, each a number or
    /// an inclusive range `a-b`. `0` exits, `1` selects everything, `n`
    /// selects file `n - 2`.
    pub fn parse(input: &str, file_count: usize) -> Result<Self> {
        let highest = file_count + 1;
        let mut choices = Vec::new();
        for token in input.split_whitespace() {
            match token.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse_number(start, highest)?, parse_number(end, highest)?);
                    if start > end {
                        return Err(BittorrentError::SelectionError(format!(
                            "Empty range: {}",
                            token
                        )));
                    }
                    choices.extend(start..=end);
                }
                None => choices.push(parse_number(token, highest)?),
            }
        }

        if choices.is_empty() {
            return Err(BittorrentError::SelectionError("Nothing selected".to_string()));
        }
        if choices.contains(&0) {
            return Err(BittorrentError::SelectionError("Exit requested".to_string()));
        }
        if choices.contains(&1) {
            return Ok(Self::all(file_count));
        }

        Ok(Self::from_indices(choices.into_iter().map(|n| n - 2)))
    }

    /// Reject empty selections and indices past the file list
    pub fn validate(&self, file_count: usize) -> Result<()> {
        if self.files.is_empty() {
            return Err(BittorrentError::SelectionError("No file selected".to_string()));
        }
        if let Some(&index) = self.files.iter().find(|&&index| index >= file_count) {
            return Err(BittorrentError::SelectionError(format!(
                "File index {} out of range ({} files)",
                index, file_count
            )));
        }
        Ok(())
    }

    pub fn indices(&self) -> &BTreeSet<usize> {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// A menu number no greater than `highest`
fn parse_number(token: &str, highest: usize) -> Result<usize> {
    let number: usize = token
        .parse()
        .map_err(|_| BittorrentError::SelectionError(format!("Not a file number: {:?}", token)))?;
    if number > highest {
        return Err(BittorrentError::SelectionError(format!("Wrong file number: {}", number)));
    }
    Ok(number)
}

/// The file menu shown before a download
pub fn menu(files: &[FileEntry]) -> String {
    let mut output = String::from("0. Exit\n1. All");
    for (i, file) in files.iter().enumerate() {
        let _ = write!(
            output,
            "\n{}. \"{}\" {:.2}MB",
            i + 2,
            file.path.display(),
            file.length as f64 / 1024.0 / 1024.0
        );
    }
    output
}
