//! Reference resolution and AST flattening.
//!
//! The compiler's back half: takes the parsed node tree for one layer,
//! splices in `$N`/`$s` references, expands repeat and multiply groups,
//! and evaluates each resulting chunk into a [`Cell`].
//!
//! References resolve before any expansion. The walk carries the current
//! resolution path; a reference to a layer already on the path is stripped
//! together with its smallest enclosing group. That is a cycle-breaking
//! rule, not an error, so mutually-referencing layers always compile.

use super::ast::{Node, RefTarget};
use super::error::CompileError;
use super::{expr, parser};
use crate::config::ReferencePolicy;
use crate::engine::catalog::SourceCatalog;
use crate::engine::cell::{Cell, SourceTag};

/// The compiled form of one layer's beat code.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledLayer {
    pub cells: Vec<Cell>,
    /// Sum of all cell durations, in quarter notes.
    pub total_quarters: f64,
}

/// Everything reference resolution needs to know about the layer set.
///
/// `codes` holds each layer's current beat code, zero-based. During live
/// playback the transport substitutes a layer's pending shadow code here so
/// references always see the newest text.
#[derive(Debug, Clone, Copy)]
pub struct RefContext<'a> {
    pub codes: &'a [String],
    /// Zero-based index of the layer being compiled.
    pub self_index: usize,
    pub policy: ReferencePolicy,
}

impl<'a> RefContext<'a> {
    pub fn new(codes: &'a [String], self_index: usize, policy: ReferencePolicy) -> Self {
        Self {
            codes,
            self_index,
            policy,
        }
    }
}

/// Compile one layer's beat code into its cell list.
///
/// `base_is_tone` says whether the layer's base source is synthesized;
/// untagged cells then count as tone cells for hi-hat role matching.
pub fn compile(
    source: &str,
    ctx: &RefContext,
    catalog: &SourceCatalog,
    base_is_tone: bool,
) -> Result<CompiledLayer, CompileError> {
    let stripped = parser::strip_comments(source);
    let nodes = parser::parse(&stripped)?;

    // The compiling layer starts on the path, so `$s` strips immediately.
    let mut path = vec![ctx.self_index];
    let (resolved, _) = resolve_nodes(&nodes, ctx, &mut path)?;

    let (chunks, _) = flatten_seq(&resolved)?;
    if chunks.is_empty() {
        return Err(CompileError::malformed("pattern produced no cells", 0));
    }

    let mut cells = Vec::with_capacity(chunks.len());
    let mut total = 0.0;
    for chunk in &chunks {
        let duration = expr::parse(&chunk.expr)?;
        if duration <= 0.0 {
            return Err(CompileError::malformed(
                format!("cell duration must be positive: '{}'", chunk.expr),
                0,
            ));
        }
        let tag = match &chunk.tag {
            Some(raw) => {
                let tag = SourceTag::parse(raw)?;
                if !catalog.knows(&tag) {
                    return Err(CompileError::unknown_source(raw));
                }
                Some(tag)
            }
            None => None,
        };
        let mut cell = Cell::new(duration, tag);
        let id = cell.source_id(base_is_tone);
        cell.is_hihat_open = catalog.is_open_hat(id);
        cell.is_hihat_closed = catalog.is_closed_hat(id);
        total += duration;
        cells.push(cell);
    }

    Ok(CompiledLayer {
        cells,
        total_quarters: total,
    })
}

fn resolve_index(target: RefTarget, ctx: &RefContext) -> Result<usize, CompileError> {
    match target {
        RefTarget::SelfLayer => Ok(ctx.self_index),
        RefTarget::Layer(n) => {
            let idx = n - 1;
            if idx < ctx.codes.len() {
                return Ok(idx);
            }
            match ctx.policy {
                ReferencePolicy::ClampToFirst if !ctx.codes.is_empty() => Ok(0),
                _ => Err(CompileError::bad_reference(n, ctx.codes.len())),
            }
        }
    }
}

/// Resolve references in a node sequence. The second return value reports a
/// revisited reference found *directly* in this sequence; the caller that
/// owns the sequence as a group body drops the whole group in response,
/// while the top level (and splice boundaries) just drop the reference.
fn resolve_nodes(
    nodes: &[Node],
    ctx: &RefContext,
    path: &mut Vec<usize>,
) -> Result<(Vec<Node>, bool), CompileError> {
    let mut out = Vec::with_capacity(nodes.len());
    let mut revisit_here = false;

    for node in nodes {
        match node {
            Node::Literal { .. } | Node::Break => out.push(node.clone()),
            Node::Reference(target) => {
                let idx = resolve_index(*target, ctx)?;
                if path.contains(&idx) {
                    revisit_here = true;
                    continue;
                }
                let code = parser::strip_comments(&ctx.codes[idx]);
                let spliced = parser::parse(&code)?;
                path.push(idx);
                let (resolved, _) = resolve_nodes(&spliced, ctx, path)?;
                path.pop();
                out.extend(resolved);
            }
            Node::Repeat { body, times, ltm } => {
                let (resolved, dropped) = resolve_nodes(body, ctx, path)?;
                if dropped {
                    continue;
                }
                out.push(Node::Repeat {
                    body: resolved,
                    times: *times,
                    ltm: ltm.clone(),
                });
            }
            Node::Multiply { body, factor } => {
                let (resolved, dropped) = resolve_nodes(body, ctx, path)?;
                if dropped {
                    continue;
                }
                out.push(Node::Multiply {
                    body: resolved,
                    factor: factor.clone(),
                });
            }
        }
    }
    Ok((out, revisit_here))
}

/// One comma-separated chunk after expansion: a duration expression plus an
/// optional raw tag. Keeping the tag out of the expression text means
/// multiply factors and last-term modifiers never have to step around it.
#[derive(Debug, Clone)]
struct Chunk {
    expr: String,
    tag: Option<String>,
}

/// Flatten a node sequence into chunks. Returns the chunk index of the
/// first top-level `|` break, which repeat expansion uses as its final-copy
/// cutoff; at the top level breaks are plain separators.
fn flatten_seq(nodes: &[Node]) -> Result<(Vec<Chunk>, Option<usize>), CompileError> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut first_break = None;

    for node in nodes {
        match node {
            Node::Break => {
                if first_break.is_none() {
                    first_break = Some(chunks.len());
                }
            }
            Node::Literal { expr, tag } => chunks.push(Chunk {
                expr: expr.clone(),
                tag: tag.clone(),
            }),
            Node::Multiply { body, factor } => {
                let (inner, _) = flatten_seq(body)?;
                for mut chunk in inner {
                    chunk.expr = expr::multiply_terms(&chunk.expr, factor)?;
                    chunks.push(chunk);
                }
            }
            Node::Repeat { body, times, ltm } => {
                let (inner, brk) = flatten_seq(body)?;
                let pre_len = brk.unwrap_or(inner.len());
                let repeat_start = chunks.len();
                for rep in 1..=*times {
                    if rep == *times {
                        chunks.extend(inner[..pre_len].iter().cloned());
                    } else {
                        chunks.extend(inner.iter().cloned());
                    }
                }
                if let Some(ltm) = ltm {
                    if chunks.len() > repeat_start {
                        if let Some(last) = chunks.last_mut() {
                            last.expr = expr::add_term(&last.expr, ltm);
                        }
                    }
                }
            }
            Node::Reference(_) => {
                // References are spliced away before flattening.
                return Err(CompileError::malformed("unresolved reference", 0));
            }
        }
    }
    Ok((chunks, first_break))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::error::ErrorKind;
    use crate::engine::catalog::SampleData;
    use crate::engine::cell::SourceId;

    fn catalog_with_files(n: usize) -> SourceCatalog {
        let mut catalog = SourceCatalog::new(44100);
        for _ in 0..n {
            catalog.add_file(SampleData::from_mono(vec![0.0; 8], 44100));
        }
        catalog
    }

    fn compile_one(source: &str) -> Result<CompiledLayer, CompileError> {
        let codes = vec![source.to_string()];
        let ctx = RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst);
        compile(source, &ctx, &catalog_with_files(4), false)
    }

    fn durations(layer: &CompiledLayer) -> Vec<f64> {
        layer.cells.iter().map(|c| c.duration).collect()
    }

    #[test]
    fn plain_cells() {
        let layer = compile_one("1,1/2,1+1/4").unwrap();
        assert_eq!(durations(&layer), vec![1.0, 0.5, 1.25]);
        assert!((layer.total_quarters - 2.75).abs() < 1e-12);
    }

    #[test]
    fn comments_are_stripped() {
        let layer = compile_one("1,!kick pattern!1,1,1").unwrap();
        assert_eq!(layer.cells.len(), 4);
    }

    #[test]
    fn single_cell_repeat() {
        let layer = compile_one("1(4)").unwrap();
        assert_eq!(durations(&layer), vec![1.0; 4]);
    }

    #[test]
    fn single_cell_repeat_with_ltm() {
        let layer = compile_one("1(3)-1/2").unwrap();
        assert_eq!(durations(&layer), vec![1.0, 1.0, 0.5]);
    }

    #[test]
    fn bracket_repeat_with_ltm() {
        let layer = compile_one("[1,1/2](2)+1/4").unwrap();
        assert_eq!(durations(&layer), vec![1.0, 0.5, 1.0, 0.75]);
    }

    #[test]
    fn bracket_repeat_break_truncates_final_copy() {
        // body 1,2|3: two full copies then the pre-break segment.
        let layer = compile_one("[1,2|3](3)").unwrap();
        assert_eq!(
            durations(&layer),
            vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 1.0, 2.0]
        );
    }

    #[test]
    fn multiply_group_distributes_over_terms() {
        // 1*2 = 2; 1*2 + 1/2*2 = 3.
        let layer = compile_one("{1,1+1/2}2").unwrap();
        assert_eq!(durations(&layer), vec![2.0, 3.0]);
    }

    #[test]
    fn multiply_group_keeps_tags() {
        let layer = compile_one("{1@a4,1}2").unwrap();
        assert!(matches!(layer.cells[0].tag, Some(SourceTag::Pitch(_))));
        assert_eq!(layer.cells[0].duration, 2.0);
        assert!(layer.cells[1].tag.is_none());
    }

    #[test]
    fn nested_groups() {
        // {1,1}2 -> 2,2; [2,2,1](2) -> 2,2,1,2,2,1
        let layer = compile_one("[{1,1}2,1](2)").unwrap();
        assert_eq!(durations(&layer), vec![2.0, 2.0, 1.0, 2.0, 2.0, 1.0]);
    }

    #[test]
    fn top_level_pipe_is_a_separator() {
        let layer = compile_one("1|2").unwrap();
        assert_eq!(durations(&layer), vec![1.0, 2.0]);
    }

    #[test]
    fn self_reference_is_stripped() {
        let layer = compile_one("1,$s,2").unwrap();
        assert_eq!(durations(&layer), vec![1.0, 2.0]);
    }

    #[test]
    fn self_reference_alone_yields_empty_error() {
        let err = compile_one("$s").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedExpression);
    }

    #[test]
    fn revisited_reference_strips_enclosing_group() {
        let layer = compile_one("1,[$s,2](3)").unwrap();
        assert_eq!(durations(&layer), vec![1.0]);
    }

    #[test]
    fn reference_splices_other_layer() {
        let codes = vec!["1,1".to_string(), "$1,2".to_string()];
        let ctx = RefContext::new(&codes, 1, ReferencePolicy::ClampToFirst);
        let layer = compile(&codes[1], &ctx, &catalog_with_files(0), false).unwrap();
        assert_eq!(durations(&layer), vec![1.0, 1.0, 2.0]);
    }

    #[test]
    fn mutual_references_terminate() {
        let codes = vec!["1,$2".to_string(), "2,$1".to_string()];
        let catalog = catalog_with_files(0);

        let ctx = RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst);
        let layer = compile(&codes[0], &ctx, &catalog, false).unwrap();
        assert_eq!(durations(&layer), vec![1.0, 2.0]);

        let ctx = RefContext::new(&codes, 1, ReferencePolicy::ClampToFirst);
        let layer = compile(&codes[1], &ctx, &catalog, false).unwrap();
        assert_eq!(durations(&layer), vec![2.0, 1.0]);
    }

    #[test]
    fn reference_inside_repeat_expands_each_copy() {
        let codes = vec!["1/2,1/2".to_string(), "[$1](2)".to_string()];
        let ctx = RefContext::new(&codes, 1, ReferencePolicy::ClampToFirst);
        let layer = compile(&codes[1], &ctx, &catalog_with_files(0), false).unwrap();
        assert_eq!(durations(&layer), vec![0.5; 4]);
    }

    #[test]
    fn out_of_range_reference_clamps_by_default() {
        let codes = vec!["3,3".to_string(), "$9".to_string()];
        let ctx = RefContext::new(&codes, 1, ReferencePolicy::ClampToFirst);
        let layer = compile(&codes[1], &ctx, &catalog_with_files(0), false).unwrap();
        assert_eq!(durations(&layer), vec![3.0, 3.0]);
    }

    #[test]
    fn out_of_range_reference_errors_under_strict_policy() {
        let codes = vec!["3,3".to_string(), "$9".to_string()];
        let ctx = RefContext::new(&codes, 1, ReferencePolicy::Error);
        let err = compile(&codes[1], &ctx, &catalog_with_files(0), false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ReferenceOutOfRange);
    }

    #[test]
    fn unknown_file_tag_is_rejected_without_default() {
        let codes = vec!["1@7".to_string()];
        let ctx = RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst);
        let err = compile(&codes[0], &ctx, &catalog_with_files(2), false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownSoundSource);
    }

    #[test]
    fn unknown_file_tag_passes_with_default_substitute() {
        let codes = vec!["1@7".to_string()];
        let ctx = RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst);
        let mut catalog = catalog_with_files(2);
        catalog.set_default_file(SampleData::from_mono(vec![0.0; 8], 44100));
        let layer = compile(&codes[0], &ctx, &catalog, false).unwrap();
        assert_eq!(layer.cells[0].tag, Some(SourceTag::File(7)));
    }

    #[test]
    fn hat_roles_mark_cells() {
        let mut catalog = catalog_with_files(3);
        catalog.set_hat_roles(SourceId::File(0), SourceId::File(1));
        let codes = vec!["1@0,1@1,1@2".to_string()];
        let ctx = RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst);
        let layer = compile(&codes[0], &ctx, &catalog, false).unwrap();
        assert!(layer.cells[0].is_hihat_open);
        assert!(layer.cells[1].is_hihat_closed);
        assert!(!layer.cells[2].is_hihat_open && !layer.cells[2].is_hihat_closed);
    }

    #[test]
    fn non_positive_duration_is_rejected() {
        let err = compile_one("1(2)-2").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedExpression);
        assert!(err.message.contains("positive"));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let err = compile_one("").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedExpression);
    }
}
