//! Recursive-descent parser for beat code.
//!
//! Produces [`Node`] trees from comment-stripped pattern text. Grammar,
//! informally:
//!
//! ```text
//! sequence  := item ((',' | '|') item)*
//! item      := reference | repeat | multiply | cell
//! reference := '$' ('s' | digits)
//! repeat    := '[' sequence ']' count ltm?
//! multiply  := '{' sequence '}' factor
//! cell      := expr ('@' tag)? ( '(' digits ')' ltm? ('@' tag)? )?
//! count     := '(' digits ')' | digits
//! ltm       := ('+' | '-') expr
//! ```
//!
//! Whitespace is insignificant everywhere. Expression and factor text is
//! kept verbatim for the flattening pass; only structure is decided here.

use super::ast::{Node, RefTarget};
use super::error::CompileError;

/// Characters that terminate a free-text region (chunk, factor, ltm).
const DELIMITERS: &[char] = &[',', '|', '[', ']', '{', '}', '$'];

/// Remove `!comment!` spans. An unterminated `!` comments out the rest of
/// the line, matching the forgiving behavior live editing wants.
pub fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut in_comment = false;
    for ch in source.chars() {
        if ch == '!' {
            in_comment = !in_comment;
        } else if !in_comment {
            out.push(ch);
        }
    }
    out
}

/// Parse comment-stripped beat code into a node sequence.
pub fn parse(source: &str) -> Result<Vec<Node>, CompileError> {
    let mut parser = Parser::new(source);
    let nodes = parser.parse_sequence(&[])?;
    if !parser.is_at_end() {
        return Err(CompileError::malformed(
            format!("unexpected '{}'", parser.peek()),
            parser.pos,
        ));
    }
    Ok(nodes)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn parse_sequence(&mut self, closers: &[char]) -> Result<Vec<Node>, CompileError> {
        let mut nodes = Vec::new();
        let mut item_pending = true;

        loop {
            self.skip_whitespace();
            if self.is_at_end() || closers.contains(&self.peek()) {
                break;
            }
            match self.peek() {
                ',' => {
                    if item_pending {
                        return Err(CompileError::malformed("empty cell", self.pos));
                    }
                    self.advance();
                    item_pending = true;
                }
                '|' => {
                    self.advance();
                    nodes.push(Node::Break);
                    item_pending = true;
                }
                '[' => {
                    nodes.push(self.parse_repeat_group()?);
                    item_pending = false;
                }
                '{' => {
                    nodes.push(self.parse_multiply_group()?);
                    item_pending = false;
                }
                '$' => {
                    nodes.push(self.parse_reference()?);
                    item_pending = false;
                }
                ']' | '}' | ')' => {
                    return Err(CompileError::malformed(
                        format!("unmatched '{}'", self.peek()),
                        self.pos,
                    ));
                }
                _ => {
                    nodes.push(self.parse_cell_chunk()?);
                    item_pending = false;
                }
            }
        }
        if item_pending && !nodes.is_empty() {
            return Err(CompileError::malformed("trailing separator", self.pos));
        }
        Ok(nodes)
    }

    fn parse_repeat_group(&mut self) -> Result<Node, CompileError> {
        let open = self.pos;
        self.advance(); // '['
        let body = self.parse_sequence(&[']'])?;
        if self.is_at_end() {
            return Err(CompileError::malformed("unclosed '['", open));
        }
        self.advance(); // ']'
        self.skip_whitespace();

        let times = if !self.is_at_end() && self.peek() == '(' {
            self.advance();
            let n = self.collect_integer()?;
            self.expect(')')?;
            n
        } else {
            self.collect_integer()?
        };
        if times == 0 {
            return Err(CompileError::malformed("repeat count must be >= 1", open));
        }

        let ltm = self.collect_ltm();
        Ok(Node::Repeat { body, times, ltm })
    }

    fn parse_multiply_group(&mut self) -> Result<Node, CompileError> {
        let open = self.pos;
        self.advance(); // '{'
        let body = self.parse_sequence(&['}'])?;
        if self.is_at_end() {
            return Err(CompileError::malformed("unclosed '{'", open));
        }
        self.advance(); // '}'
        let factor = self.collect_free_text(&['(']);
        if factor.is_empty() {
            return Err(CompileError::malformed(
                "multiply group needs a factor",
                self.pos,
            ));
        }
        Ok(Node::Multiply { body, factor })
    }

    fn parse_reference(&mut self) -> Result<Node, CompileError> {
        let start = self.pos;
        self.advance(); // '$'
        if self.is_at_end() {
            return Err(CompileError::malformed("dangling '$'", start));
        }
        if self.peek() == 's' {
            self.advance();
            return Ok(Node::Reference(RefTarget::SelfLayer));
        }
        let mut digits = String::new();
        while !self.is_at_end() && self.peek().is_ascii_digit() {
            digits.push(self.advance());
        }
        if digits.is_empty() {
            return Err(CompileError::malformed(
                "expected layer number or 's' after '$'",
                start,
            ));
        }
        let n: usize = digits
            .parse()
            .map_err(|_| CompileError::malformed("layer number too large", start))?;
        if n == 0 {
            return Err(CompileError::malformed("layer numbers start at 1", start));
        }
        Ok(Node::Reference(RefTarget::Layer(n)))
    }

    /// Parse a literal cell, possibly with a `(N)` repeat suffix. The tag
    /// may appear before the count (`1@3(4)`) or after the modifier
    /// (`1(4)+1/2@3`).
    fn parse_cell_chunk(&mut self) -> Result<Node, CompileError> {
        let start = self.pos;
        let mut expr = String::new();
        let mut tag: Option<String> = None;

        loop {
            self.skip_whitespace();
            if self.is_at_end() || DELIMITERS.contains(&self.peek()) {
                break;
            }
            match self.peek() {
                '@' => {
                    self.advance();
                    tag = Some(self.collect_tag());
                }
                '(' => {
                    self.advance();
                    let times = self.collect_integer()?;
                    self.expect(')')?;
                    if times == 0 {
                        return Err(CompileError::malformed("repeat count must be >= 1", start));
                    }
                    let ltm = self.collect_ltm();
                    if tag.is_none() {
                        self.skip_whitespace();
                        if !self.is_at_end() && self.peek() == '@' {
                            self.advance();
                            tag = Some(self.collect_tag());
                        }
                    }
                    if expr.is_empty() {
                        return Err(CompileError::malformed("repeat of empty cell", start));
                    }
                    return Ok(Node::Repeat {
                        body: vec![Node::Literal { expr, tag }],
                        times,
                        ltm,
                    });
                }
                ')' => {
                    return Err(CompileError::malformed("unmatched ')'", self.pos));
                }
                c => {
                    expr.push(c);
                    self.advance();
                }
            }
        }

        if expr.is_empty() {
            return Err(CompileError::malformed("empty cell", start));
        }
        Ok(Node::Literal { expr, tag })
    }

    /// A tag runs until any structural character.
    fn collect_tag(&mut self) -> String {
        let mut out = String::new();
        while !self.is_at_end() {
            let c = self.peek();
            if DELIMITERS.contains(&c) || c == '(' || c == ')' || c.is_whitespace() {
                break;
            }
            out.push(self.advance());
        }
        out
    }

    /// A last-term modifier: a signed expression. Returns `None` when the
    /// cursor is not at a sign.
    fn collect_ltm(&mut self) -> Option<String> {
        self.skip_whitespace();
        if self.is_at_end() {
            return None;
        }
        let sign = self.peek();
        if sign != '+' && sign != '-' {
            return None;
        }
        let mut out = String::new();
        out.push(self.advance());
        while !self.is_at_end() {
            let c = self.peek();
            if DELIMITERS.contains(&c) || c == '@' || c == '(' || c == ')' {
                break;
            }
            if !c.is_whitespace() {
                out.push(c);
            }
            self.advance();
        }
        Some(out)
    }

    fn collect_free_text(&mut self, extra_stops: &[char]) -> String {
        let mut out = String::new();
        while !self.is_at_end() {
            let c = self.peek();
            if DELIMITERS.contains(&c) || extra_stops.contains(&c) {
                break;
            }
            if !c.is_whitespace() {
                out.push(c);
            }
            self.advance();
        }
        out
    }

    fn collect_integer(&mut self) -> Result<u32, CompileError> {
        self.skip_whitespace();
        let start = self.pos;
        let mut digits = String::new();
        while !self.is_at_end() && self.peek().is_ascii_digit() {
            digits.push(self.advance());
        }
        digits
            .parse()
            .map_err(|_| CompileError::malformed("expected a repeat count", start))
    }

    fn expect(&mut self, c: char) -> Result<(), CompileError> {
        self.skip_whitespace();
        if self.is_at_end() || self.peek() != c {
            return Err(CompileError::malformed(format!("expected '{c}'"), self.pos));
        }
        self.advance();
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while !self.is_at_end() && self.peek().is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> char {
        self.chars[self.pos]
    }

    fn advance(&mut self) -> char {
        let c = self.chars[self.pos];
        self.pos += 1;
        c
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }
}
