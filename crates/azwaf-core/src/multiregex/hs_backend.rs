//! Hyperscan prefilter backend

use crate::{Result, WafError};
use ::hyperscan::prelude::*;

/// Flags every prefilter pattern is compiled with
pub const PREFILTER_FLAGS: u32 = 0x8 | 0x40;

/// Compile prepared expressions into a block database in prefilter mode.
///
/// Pattern ids are the positions in `exprs`.
pub fn compile(exprs: &[&str]) -> Result<BlockDatabase> {
    let patterns = exprs
        .iter()
        .enumerate()
        .map(|(idx, expr)| {
            let mut p = Pattern::with_flags(*expr, CompileFlags::SINGLEMATCH | CompileFlags::PREFILTER)?;
            p.id = Some(idx);
            Ok(p)
        })
        .collect::<std::result::Result<Vec<_>, ::hyperscan::Error>>()
        .map_err(|e| WafError::Regex(format!("failed to build Hyperscan pattern: {e}")))?;

    let count = patterns.len();
    Patterns::from_iter(patterns)
        .build()
        .map_err(|e| WafError::Regex(format!("failed to compile Hyperscan database with {count} patterns: {e}")))
}

pub fn alloc_scratch(db: &BlockDatabase) -> Result<Scratch> {
    db.alloc_scratch()
        .map_err(|e| WafError::Regex(format!("failed to create Hyperscan scratch space: {e}")))
}

/// Collect candidate pattern positions for `input`.
pub fn scan(db: &BlockDatabase, scratch: &Scratch, input: &[u8], candidates: &mut Vec<usize>) -> Result<()> {
    db.scan(input, scratch, |id, _from, _to, _flags| {
        candidates.push(id as usize);
        Matching::Continue
    })
    .map_err(|e| WafError::Regex(format!("failed to invoke Hyperscan: {e}")))
}
