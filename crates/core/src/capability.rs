//! Pluggable capabilities consumed by the engine.
//!
//! `Clock` and `IdGenerator` exist so that record defaults are deterministic
//! under test. `ChunkSplitter` is the text-splitting seam used by import
//! tooling; the embedding capability lives in the `embedding` crate because
//! it is async.

use chrono::NaiveDate;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Source of the current calendar date
pub trait Clock: Send + Sync {
  fn today(&self) -> NaiveDate;
}

/// System wall clock
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn today(&self) -> NaiveDate {
    chrono::Utc::now().date_naive()
  }
}

/// Fixed date for deterministic tests
#[derive(Debug)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
  fn today(&self) -> NaiveDate {
    self.0
  }
}

/// Source of record identifiers
pub trait IdGenerator: Send + Sync {
  fn generate(&self) -> String;
}

/// Random v4 UUIDs (default)
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
  fn generate(&self) -> String {
    Uuid::new_v4().to_string()
  }
}

/// Sequential ids with a fixed prefix, for deterministic tests
#[derive(Debug)]
pub struct SequentialIdGenerator {
  prefix: String,
  counter: AtomicU64,
}

impl SequentialIdGenerator {
  pub fn new(prefix: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      counter: AtomicU64::new(1),
    }
  }
}

impl IdGenerator for SequentialIdGenerator {
  fn generate(&self) -> String {
    let n = self.counter.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", self.prefix, n)
  }
}

/// Splits long text into overlapping chunks
pub trait ChunkSplitter: Send + Sync {
  fn split(&self, text: &str, max_chars: usize, overlap: usize) -> Vec<String>;
}

/// Paragraph- and sentence-aware splitter.
///
/// Splits on blank lines first, falling back to sentence boundaries when a
/// paragraph alone exceeds `max_chars`, and keeps `overlap` trailing
/// characters between consecutive chunks.
#[derive(Debug, Default)]
pub struct SentenceSplitter;

impl ChunkSplitter for SentenceSplitter {
  fn split(&self, text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    if text.is_empty() || max_chars == 0 {
      return chunks;
    }
    if text.len() <= max_chars {
      chunks.push(text.to_string());
      return chunks;
    }

    let mut current = String::new();
    for paragraph in split_paragraphs(text) {
      let pieces: Vec<&str> = if paragraph.len() > max_chars {
        split_sentences(paragraph)
      } else {
        vec![paragraph]
      };

      for piece in pieces {
        if !current.is_empty() && current.len() + piece.len() + 1 > max_chars {
          chunks.push(current.trim().to_string());
          let keep = floor_char_boundary(&current, current.len().saturating_sub(overlap));
          current = current[keep..].to_string();
        }
        if !current.is_empty() {
          current.push(' ');
        }
        current.push_str(piece);
      }
    }

    if !current.trim().is_empty() {
      chunks.push(current.trim().to_string());
    }
    chunks.retain(|c| !c.is_empty());
    chunks
  }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
  while idx > 0 && !s.is_char_boundary(idx) {
    idx -= 1;
  }
  idx
}

fn split_paragraphs(text: &str) -> Vec<&str> {
  text
    .split("\n\n")
    .flat_map(|p| p.split("\r\n\r\n"))
    .map(|p| p.trim())
    .filter(|p| !p.is_empty())
    .collect()
}

fn split_sentences(text: &str) -> Vec<&str> {
  let mut sentences = Vec::new();
  let mut start = 0;
  let bytes = text.as_bytes();

  let mut i = 0;
  while i < bytes.len() {
    if matches!(bytes[i], b'.' | b'!' | b'?') && bytes.get(i + 1).is_none_or(|b| b.is_ascii_whitespace()) {
      let sentence = text[start..=i].trim();
      if !sentence.is_empty() {
        sentences.push(sentence);
      }
      start = i + 1;
      while start < bytes.len() && bytes[start].is_ascii_whitespace() {
        start += 1;
      }
      i = start;
      continue;
    }
    i += 1;
  }

  if start < text.len() {
    let rest = text[start..].trim();
    if !rest.is_empty() {
      sentences.push(rest);
    }
  }
  sentences
}

/// Test-friendly splitter that cuts on fixed character boundaries
#[derive(Debug, Default)]
pub struct FixedSplitter;

impl ChunkSplitter for FixedSplitter {
  fn split(&self, text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() || max_chars == 0 {
      return Vec::new();
    }
    let step = max_chars.saturating_sub(overlap).max(1);
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
      let end = (start + max_chars).min(chars.len());
      out.push(chars[start..end].iter().collect());
      if end == chars.len() {
        break;
      }
      start += step;
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fixed_clock() {
    let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    assert_eq!(FixedClock(date).today(), date);
  }

  #[test]
  fn test_uuid_generator_unique() {
    let generator = UuidGenerator;
    assert_ne!(generator.generate(), generator.generate());
  }

  #[test]
  fn test_sequential_id_generator() {
    let generator = SequentialIdGenerator::new("u");
    assert_eq!(generator.generate(), "u-1");
    assert_eq!(generator.generate(), "u-2");
  }

  #[test]
  fn test_sentence_splitter_small_input() {
    let chunks = SentenceSplitter.split("short text", 100, 20);
    assert_eq!(chunks, vec!["short text".to_string()]);
  }

  #[test]
  fn test_sentence_splitter_breaks_long_text() {
    let text = "First sentence here. Second sentence here. Third sentence here. Fourth sentence here. Fifth one.";
    let chunks = SentenceSplitter.split(text, 50, 10);
    assert!(chunks.len() > 1);
    for chunk in &chunks {
      assert!(!chunk.is_empty());
    }
  }

  #[test]
  fn test_sentence_splitter_empty() {
    assert!(SentenceSplitter.split("", 100, 10).is_empty());
  }

  #[test]
  fn test_split_sentences() {
    let sentences = split_sentences("One. Two! Three? Four");
    assert_eq!(sentences, vec!["One.", "Two!", "Three?", "Four"]);
  }

  #[test]
  fn test_split_paragraphs() {
    let paragraphs = split_paragraphs("a\n\nb\n\nc");
    assert_eq!(paragraphs, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_fixed_splitter_overlap() {
    let chunks = FixedSplitter.split("abcdefghij", 4, 2);
    assert_eq!(chunks[0], "abcd");
    assert_eq!(chunks[1], "cdef");
  }
}
