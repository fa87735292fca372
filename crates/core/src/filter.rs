//! Restricted SQL-like filter expressions.
//!
//! Filters are validated here before being pushed down to the storage layer.
//! The accepted operator set is exactly `=`, `!=`, `<`, `<=`, `IN`, `LIKE`,
//! `IS NULL`, `IS NOT NULL`, combined with `AND`, `OR`, `NOT` and
//! parentheses. Greater-than operators are rejected: every dataset schema
//! carries a blob column, and filtered scans over blob-bearing tables do not
//! support them.

use thiserror::Error;

/// A filter expression that failed to parse, with the byte offset of the
/// offending token.
#[derive(Debug, Clone, Error)]
#[error("filter parse error at position {position}: {message}")]
pub struct FilterError {
  pub position: usize,
  pub message: String,
}

impl FilterError {
  fn new(position: usize, message: impl Into<String>) -> Self {
    Self {
      position,
      message: message.into(),
    }
  }
}

/// A validated filter expression, ready for pushdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter(String);

impl Filter {
  /// Validate `input` against the restricted grammar.
  pub fn parse(input: &str) -> Result<Self, FilterError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.expr()?;
    if let Some(tok) = parser.peek() {
      return Err(FilterError::new(tok.offset, format!("unexpected token '{}'", tok.text)));
    }
    Ok(Self(input.to_string()))
  }

  /// The validated expression text, as the storage layer receives it.
  pub fn as_sql(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for Filter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
  Ident,
  StringLit,
  NumberLit,
  Op,     // = != < <=
  LParen,
  RParen,
  Comma,
  Keyword, // AND OR NOT IN LIKE IS NULL TRUE FALSE
}

#[derive(Debug, Clone)]
struct Token {
  kind: TokenKind,
  text: String,
  offset: usize,
}

const KEYWORDS: &[&str] = &["AND", "OR", "NOT", "IN", "LIKE", "IS", "NULL", "TRUE", "FALSE"];

fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
  let bytes = input.as_bytes();
  let mut tokens = Vec::new();
  let mut i = 0;

  while i < bytes.len() {
    let c = bytes[i] as char;
    match c {
      ' ' | '\t' | '\n' | '\r' => i += 1,
      '(' => {
        tokens.push(Token {
          kind: TokenKind::LParen,
          text: "(".into(),
          offset: i,
        });
        i += 1;
      }
      ')' => {
        tokens.push(Token {
          kind: TokenKind::RParen,
          text: ")".into(),
          offset: i,
        });
        i += 1;
      }
      ',' => {
        tokens.push(Token {
          kind: TokenKind::Comma,
          text: ",".into(),
          offset: i,
        });
        i += 1;
      }
      '=' => {
        tokens.push(Token {
          kind: TokenKind::Op,
          text: "=".into(),
          offset: i,
        });
        i += 1;
      }
      '!' => {
        if bytes.get(i + 1) == Some(&b'=') {
          tokens.push(Token {
            kind: TokenKind::Op,
            text: "!=".into(),
            offset: i,
          });
          i += 2;
        } else {
          return Err(FilterError::new(i, "expected '=' after '!'"));
        }
      }
      '<' => {
        if bytes.get(i + 1) == Some(&b'=') {
          tokens.push(Token {
            kind: TokenKind::Op,
            text: "<=".into(),
            offset: i,
          });
          i += 2;
        } else if bytes.get(i + 1) == Some(&b'>') {
          return Err(FilterError::new(i, "operator '<>' is not supported, use '!='"));
        } else {
          tokens.push(Token {
            kind: TokenKind::Op,
            text: "<".into(),
            offset: i,
          });
          i += 1;
        }
      }
      '>' => return Err(FilterError::new(i, "greater-than operators are not supported")),
      '\'' => {
        let start = i;
        i += 1;
        let mut closed = false;
        while i < bytes.len() {
          if bytes[i] == b'\'' {
            // Doubled quote is an escaped quote inside the literal
            if bytes.get(i + 1) == Some(&b'\'') {
              i += 2;
              continue;
            }
            closed = true;
            i += 1;
            break;
          }
          i += 1;
        }
        if !closed {
          return Err(FilterError::new(start, "unterminated string literal"));
        }
        tokens.push(Token {
          kind: TokenKind::StringLit,
          text: input[start..i].to_string(),
          offset: start,
        });
      }
      '0'..='9' | '-' => {
        let start = i;
        i += 1;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
          i += 1;
        }
        tokens.push(Token {
          kind: TokenKind::NumberLit,
          text: input[start..i].to_string(),
          offset: start,
        });
      }
      c if c.is_ascii_alphabetic() || c == '_' => {
        let start = i;
        i += 1;
        while i < bytes.len() {
          let b = bytes[i];
          if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' {
            i += 1;
          } else {
            break;
          }
        }
        let text = &input[start..i];
        let upper = text.to_ascii_uppercase();
        if KEYWORDS.contains(&upper.as_str()) {
          tokens.push(Token {
            kind: TokenKind::Keyword,
            text: upper,
            offset: start,
          });
        } else {
          tokens.push(Token {
            kind: TokenKind::Ident,
            text: text.to_string(),
            offset: start,
          });
        }
      }
      other => return Err(FilterError::new(i, format!("unexpected character '{}'", other))),
    }
  }

  Ok(tokens)
}

struct Parser {
  tokens: Vec<Token>,
  pos: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn next(&mut self) -> Option<Token> {
    let tok = self.tokens.get(self.pos).cloned();
    if tok.is_some() {
      self.pos += 1;
    }
    tok
  }

  fn eof_offset(&self) -> usize {
    self.tokens.last().map(|t| t.offset + t.text.len()).unwrap_or(0)
  }

  fn expect_keyword(&mut self, kw: &str) -> Result<(), FilterError> {
    match self.next() {
      Some(t) if t.kind == TokenKind::Keyword && t.text == kw => Ok(()),
      Some(t) => Err(FilterError::new(t.offset, format!("expected {}, found '{}'", kw, t.text))),
      None => Err(FilterError::new(self.eof_offset(), format!("expected {}", kw))),
    }
  }

  fn is_keyword(&self, kw: &str) -> bool {
    matches!(self.peek(), Some(t) if t.kind == TokenKind::Keyword && t.text == kw)
  }

  // expr := and_expr (OR and_expr)*
  fn expr(&mut self) -> Result<(), FilterError> {
    self.and_expr()?;
    while self.is_keyword("OR") {
      self.next();
      self.and_expr()?;
    }
    Ok(())
  }

  // and_expr := unary (AND unary)*
  fn and_expr(&mut self) -> Result<(), FilterError> {
    self.unary()?;
    while self.is_keyword("AND") {
      self.next();
      self.unary()?;
    }
    Ok(())
  }

  // unary := NOT unary | primary
  fn unary(&mut self) -> Result<(), FilterError> {
    if self.is_keyword("NOT") {
      self.next();
      return self.unary();
    }
    self.primary()
  }

  // primary := '(' expr ')' | predicate
  fn primary(&mut self) -> Result<(), FilterError> {
    if matches!(self.peek(), Some(t) if t.kind == TokenKind::LParen) {
      self.next();
      self.expr()?;
      match self.next() {
        Some(t) if t.kind == TokenKind::RParen => Ok(()),
        Some(t) => Err(FilterError::new(t.offset, "expected ')'")),
        None => Err(FilterError::new(self.eof_offset(), "expected ')'")),
      }
    } else {
      self.predicate()
    }
  }

  // predicate := ident ( op literal | IS [NOT] NULL | IN '(' literal,* ')' | LIKE string )
  fn predicate(&mut self) -> Result<(), FilterError> {
    let col = match self.next() {
      Some(t) if t.kind == TokenKind::Ident => t,
      Some(t) => return Err(FilterError::new(t.offset, format!("expected column name, found '{}'", t.text))),
      None => return Err(FilterError::new(self.eof_offset(), "expected column name")),
    };

    match self.peek().cloned() {
      Some(t) if t.kind == TokenKind::Op => {
        self.next();
        self.literal()
      }
      Some(t) if t.kind == TokenKind::Keyword && t.text == "IS" => {
        self.next();
        if self.is_keyword("NOT") {
          self.next();
        }
        self.expect_keyword("NULL")
      }
      Some(t) if t.kind == TokenKind::Keyword && t.text == "IN" => {
        self.next();
        match self.next() {
          Some(t) if t.kind == TokenKind::LParen => {}
          Some(t) => return Err(FilterError::new(t.offset, "expected '(' after IN")),
          None => return Err(FilterError::new(self.eof_offset(), "expected '(' after IN")),
        }
        self.literal()?;
        while matches!(self.peek(), Some(t) if t.kind == TokenKind::Comma) {
          self.next();
          self.literal()?;
        }
        match self.next() {
          Some(t) if t.kind == TokenKind::RParen => Ok(()),
          Some(t) => Err(FilterError::new(t.offset, "expected ')' to close IN list")),
          None => Err(FilterError::new(self.eof_offset(), "expected ')' to close IN list")),
        }
      }
      Some(t) if t.kind == TokenKind::Keyword && t.text == "LIKE" => {
        self.next();
        match self.next() {
          Some(t) if t.kind == TokenKind::StringLit => Ok(()),
          Some(t) => Err(FilterError::new(t.offset, "LIKE requires a string pattern")),
          None => Err(FilterError::new(self.eof_offset(), "LIKE requires a string pattern")),
        }
      }
      Some(t) => Err(FilterError::new(
        t.offset,
        format!("expected operator after '{}', found '{}'", col.text, t.text),
      )),
      None => Err(FilterError::new(self.eof_offset(), format!("expected operator after '{}'", col.text))),
    }
  }

  fn literal(&mut self) -> Result<(), FilterError> {
    match self.next() {
      Some(t)
        if t.kind == TokenKind::StringLit
          || t.kind == TokenKind::NumberLit
          || (t.kind == TokenKind::Keyword && matches!(t.text.as_str(), "TRUE" | "FALSE" | "NULL")) =>
      {
        Ok(())
      }
      Some(t) => Err(FilterError::new(t.offset, format!("expected literal, found '{}'", t.text))),
      None => Err(FilterError::new(self.eof_offset(), "expected literal")),
    }
  }
}

/// Builder for constructing safe filter strings programmatically.
///
/// Escapes values so user input cannot break out of string literals. The
/// built expression always satisfies [`Filter::parse`].
#[derive(Default)]
pub struct FilterBuilder {
  conditions: Vec<String>,
}

impl FilterBuilder {
  pub fn new() -> Self {
    Self { conditions: Vec::new() }
  }

  /// Add an equality condition with proper escaping.
  pub fn eq(mut self, column: &str, value: &str) -> Self {
    self.conditions.push(format!("{} = '{}'", column, escape_value(value)));
    self
  }

  /// Add an equality condition only if the value is Some.
  pub fn eq_opt(self, column: &str, value: Option<&str>) -> Self {
    match value {
      Some(v) => self.eq(column, v),
      None => self,
    }
  }

  /// Add an inequality condition with proper escaping.
  pub fn ne(mut self, column: &str, value: &str) -> Self {
    self.conditions.push(format!("{} != '{}'", column, escape_value(value)));
    self
  }

  /// Add a substring LIKE condition.
  pub fn contains(mut self, column: &str, pattern: &str) -> Self {
    self
      .conditions
      .push(format!("{} LIKE '%{}%'", column, escape_like_value(pattern)));
    self
  }

  /// Add an IN clause condition with multiple values.
  pub fn in_list(mut self, column: &str, values: &[&str]) -> Self {
    if values.is_empty() {
      return self;
    }
    let escaped: Vec<String> = values.iter().map(|v| format!("'{}'", escape_value(v))).collect();
    self.conditions.push(format!("{} IN ({})", column, escaped.join(", ")));
    self
  }

  /// Add a IS NULL condition.
  pub fn is_null(mut self, column: &str) -> Self {
    self.conditions.push(format!("{} IS NULL", column));
    self
  }

  /// Add a IS NOT NULL condition.
  pub fn is_not_null(mut self, column: &str) -> Self {
    self.conditions.push(format!("{} IS NOT NULL", column));
    self
  }

  /// Check if any conditions have been added.
  pub fn is_empty(&self) -> bool {
    self.conditions.is_empty()
  }

  /// Build the final filter, or `None` if no conditions were added.
  pub fn build(self) -> Option<Filter> {
    if self.conditions.is_empty() {
      None
    } else {
      Some(Filter(self.conditions.join(" AND ")))
    }
  }
}

/// Escape a string value for use inside a single-quoted SQL literal.
pub fn escape_value(value: &str) -> String {
  value.replace('\'', "''")
}

/// Escape a value for use in a LIKE pattern.
fn escape_like_value(value: &str) -> String {
  value.replace('\'', "''").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_accepted_operators() {
    for expr in [
      "title = 'T'",
      "title != 'T'",
      "position < 5",
      "position <= 5",
      "status IN ('draft', 'published')",
      "title LIKE '%intro%'",
      "author IS NULL",
      "author IS NOT NULL",
      "title = 'T' AND status = 'draft'",
      "title = 'T' OR NOT (position < 3)",
      "collection_id = 'c-1' AND (status != 'archived' OR author IS NULL)",
    ] {
      assert!(Filter::parse(expr).is_ok(), "should accept: {}", expr);
    }
  }

  #[test]
  fn test_rejects_greater_than() {
    let err = Filter::parse("position > 3").unwrap_err();
    assert!(err.message.contains("greater-than"));
    assert!(Filter::parse("position >= 3").is_err());
  }

  #[test]
  fn test_rejects_unknown_tokens() {
    assert!(Filter::parse("title ~ 'T'").is_err());
    assert!(Filter::parse("title BETWEEN 1 AND 2").is_err());
    assert!(Filter::parse("title = 'T'; DROP TABLE frames").is_err());
  }

  #[test]
  fn test_error_position() {
    let err = Filter::parse("title = 'T' AND position > 3").unwrap_err();
    assert_eq!(err.position, 25);
  }

  #[test]
  fn test_unterminated_string() {
    let err = Filter::parse("title = 'oops").unwrap_err();
    assert!(err.message.contains("unterminated"));
  }

  #[test]
  fn test_escaped_quote_in_literal() {
    assert!(Filter::parse("title = 'it''s fine'").is_ok());
  }

  #[test]
  fn test_dotted_identifier() {
    assert!(Filter::parse("relationships.id = 'u-1'").is_ok());
  }

  #[test]
  fn test_like_requires_string() {
    assert!(Filter::parse("title LIKE 3").is_err());
  }

  #[test]
  fn test_in_list_syntax() {
    assert!(Filter::parse("status IN ()").is_err());
    assert!(Filter::parse("status IN ('a',)").is_err());
  }

  #[test]
  fn test_trailing_garbage() {
    assert!(Filter::parse("title = 'T' 'x'").is_err());
  }

  #[test]
  fn test_builder_output_parses() {
    let filter = FilterBuilder::new()
      .eq("collection", "A")
      .in_list("status", &["draft", "published"])
      .is_not_null("text_content")
      .contains("title", "intro")
      .build()
      .unwrap();
    assert!(Filter::parse(filter.as_sql()).is_ok());
  }

  #[test]
  fn test_builder_escaping() {
    let filter = FilterBuilder::new().eq("title", "it's").build().unwrap();
    assert_eq!(filter.as_sql(), "title = 'it''s'");
    assert!(Filter::parse(filter.as_sql()).is_ok());
  }

  #[test]
  fn test_builder_empty() {
    assert!(FilterBuilder::new().build().is_none());
    assert!(FilterBuilder::new().in_list("status", &[]).build().is_none());
  }
}
