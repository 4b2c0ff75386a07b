//! Utility functions that may be helpful for implementing
//! and testing MapReduce workloads.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

/// Split `input` into its maximal alphanumeric runs.
///
/// Everything that is not alphanumeric separates tokens and is dropped;
/// empty runs are never produced.
pub fn split(input: &str) -> Vec<String> {
    input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read a file into one `String` per line.
pub fn read_lines<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    BufReader::new(file)
        .lines()
        .map(|line| line.with_context(|| format!("reading {}", path.display())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_alphanumeric_runs() {
        assert_eq!(split("the cat sat"), vec!["the", "cat", "sat"]);
        assert_eq!(split("a1-b2,,c3!"), vec!["a1", "b2", "c3"]);
        assert!(split("...---...").is_empty());
        assert!(split("").is_empty());
    }
}
