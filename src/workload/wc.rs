//! A MapReduce-compatible implementation of word count.
//!
//! Maps each line to `(word, 1)` pairs over alphanumeric runs, combines
//! and reduces by summing counts. Combine and reduce share the summing
//! logic, which is what makes the combine reduction-compatible.

use crate::utils;
use crate::{Combiner, Mapper, Reducer};

#[derive(Default)]
pub struct WordCount;

fn total(values: Vec<u64>) -> u64 {
    values.into_iter().sum()
}

impl Mapper for WordCount {
    type Input = String;
    type Key = String;
    type Value = u64;
    type SideData = ();

    fn map(&mut self, line: String, out: &mut Vec<(String, u64)>) {
        for word in utils::split(&line) {
            out.push((word, 1));
        }
    }
}

impl Reducer for WordCount {
    type Key = String;
    type Value = u64;
    type Output = (String, u64);
    type SideData = ();

    fn reduce(&mut self, key: String, values: Vec<u64>) -> (String, u64) {
        let count = total(values);
        (key, count)
    }
}

impl Combiner for WordCount {
    type Key = String;
    type Value = u64;
    type SideData = ();

    fn combine(&mut self, key: String, values: Vec<u64>) -> (String, u64) {
        let count = total(values);
        (key, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_emits_one_pair_per_word() {
        let mut out = Vec::new();
        WordCount.map("the cat sat".to_string(), &mut out);
        assert_eq!(
            out,
            vec![
                ("the".to_string(), 1),
                ("cat".to_string(), 1),
                ("sat".to_string(), 1)
            ]
        );
    }

    #[test]
    fn reduce_sums_counts() {
        let (word, count) = WordCount.reduce("sat".to_string(), vec![1, 1, 3]);
        assert_eq!((word.as_str(), count), ("sat", 5));
    }
}
