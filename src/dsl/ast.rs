//! Abstract syntax tree for beat code.
//!
//! The parser produces these nodes; the flattening pass in
//! [`compile`](super::compile) expands them into the final cell list.
//! Durations stay as expression *text* until the very end so repeat
//! last-term-modifiers and multiply factors compose textually, exactly as
//! the expansion rules require.

/// One parsed beat-code construct.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A single cell: a duration expression plus an optional `@tag`.
    Literal { expr: String, tag: Option<String> },
    /// `expr(N)` or `[ ... ](N)LTM`: N comma-flattened copies of the body.
    /// `ltm` (last-term modifier) is a signed expression appended to the
    /// final cell of the last copy.
    Repeat {
        body: Vec<Node>,
        times: u32,
        ltm: Option<String>,
    },
    /// `{ ... }F`: every top-level additive term of every cell in the body
    /// is multiplied by `factor`.
    Multiply { body: Vec<Node>, factor: String },
    /// `$N` / `$s`: splice in another layer's (or this layer's) beat code.
    Reference(RefTarget),
    /// `|` inside a repeat body: the final repetition replays only the
    /// segment before the break.
    Break,
}

/// Target of a `$` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefTarget {
    /// `$s` — the layer whose code contains the reference.
    SelfLayer,
    /// `$N` — one-based layer number.
    Layer(usize),
}
