//! Multi-Regex Engine
//!
//! Scans a buffer against a whole set of patterns at once. A prefilter
//! (a `RegexSet`, or Hyperscan with the `hyperscan` feature) reports which
//! patterns may match; each candidate is then re-matched by its own verifier
//! regex, which also extracts capture groups.

pub mod backref;
pub mod cache;
#[cfg(feature = "hyperscan")]
mod hs_backend;
pub mod pcre;

use crate::{Result, WafError};
use backref::BackrefRegex;
use cache::{DbCache, PreparedPattern};
use crossbeam_channel::{Receiver, Sender};
use regex::bytes::{Regex, RegexSet, RegexSetBuilder};
use std::sync::Arc;

const SCRATCH_POOL_SIZE: usize = 64;

/// Expression recorded out-of-band and only reported on empty input
const EMPTY_INPUT_EXPR: &str = "^$";

/// Pattern to compile into a database
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    pub id: usize,
    pub expr: String,
}

/// Verified match
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegexMatch {
    pub id: usize,
    pub start: usize,
    pub end: usize,
    pub data: Vec<u8>,
    /// Group 0 is the whole match
    pub capture_groups: Vec<Vec<u8>>,
}

enum Verifier {
    Plain(Regex),
    Backref { regex: Regex, rewrite: BackrefRegex },
}

impl Verifier {
    fn find(&self, input: &[u8]) -> Option<(usize, usize, Vec<Vec<u8>>)> {
        match self {
            Verifier::Plain(re) => {
                let caps = re.captures(input)?;
                let whole = caps.get(0)?;
                let groups = (0..caps.len())
                    .map(|i| caps.get(i).map_or_else(Vec::new, |m| m.as_bytes().to_vec()))
                    .collect();
                Some((whole.start(), whole.end(), groups))
            }
            Verifier::Backref { regex, rewrite } => rewrite.try_match(regex, input),
        }
    }
}

enum Prefilter {
    Empty,
    Set(RegexSet),
    #[cfg(feature = "hyperscan")]
    Hyperscan(::hyperscan::BlockDatabase),
}

/// Single-owner working memory bound to one engine
pub struct Scratch {
    owner: Arc<()>,
    candidates: Vec<usize>,
    #[cfg(feature = "hyperscan")]
    hs: Option<::hyperscan::Scratch>,
}

/// Compiled pattern database
pub struct MultiRegexEngine {
    token: Arc<()>,
    prefilter: Prefilter,
    /// Prefilter position to pattern id
    ids: Vec<usize>,
    verifiers: Vec<Verifier>,
    empty_input_ids: Vec<usize>,
    pool_tx: Sender<Scratch>,
    pool_rx: Receiver<Scratch>,
}

impl MultiRegexEngine {
    /// Number of patterns handled by the prefilter
    pub fn pattern_count(&self) -> usize {
        self.ids.len() + self.empty_input_ids.len()
    }

    /// Allocate a fresh scratch space for this engine
    pub fn alloc_scratch(&self) -> Result<Scratch> {
        Ok(Scratch {
            owner: Arc::clone(&self.token),
            candidates: Vec::new(),
            #[cfg(feature = "hyperscan")]
            hs: match &self.prefilter {
                Prefilter::Hyperscan(db) => Some(hs_backend::alloc_scratch(db)?),
                _ => None,
            },
        })
    }

    /// Take a scratch space from the pool, allocating when empty
    pub fn acquire_scratch(&self) -> Result<Scratch> {
        match self.pool_rx.try_recv() {
            Ok(s) => Ok(s),
            Err(_) => self.alloc_scratch(),
        }
    }

    /// Return a scratch space to the pool
    pub fn release_scratch(&self, scratch: Scratch) {
        if Arc::ptr_eq(&scratch.owner, &self.token) {
            let _ = self.pool_tx.try_send(scratch);
        }
    }

    /// Scan `input` for all patterns of this engine.
    pub fn scan(&self, input: &[u8], scratch: &mut Scratch) -> Result<Vec<RegexMatch>> {
        if !Arc::ptr_eq(&scratch.owner, &self.token) {
            return Err(WafError::Regex("scratch space belongs to a different database".into()));
        }

        if input.is_empty() {
            return Ok(self
                .empty_input_ids
                .iter()
                .map(|&id| RegexMatch {
                    id,
                    start: 0,
                    end: 0,
                    data: Vec::new(),
                    capture_groups: vec![Vec::new()],
                })
                .collect());
        }

        scratch.candidates.clear();
        match &self.prefilter {
            Prefilter::Empty => return Ok(Vec::new()),
            Prefilter::Set(set) => scratch.candidates.extend(set.matches(input).into_iter()),
            #[cfg(feature = "hyperscan")]
            Prefilter::Hyperscan(db) => {
                let Scratch { candidates, hs, .. } = scratch;
                let hs = hs
                    .as_ref()
                    .ok_or_else(|| WafError::Regex("missing Hyperscan scratch space".into()))?;
                hs_backend::scan(db, hs, input, candidates)?;
            }
        }

        let mut matches = Vec::with_capacity(scratch.candidates.len());
        for &idx in &scratch.candidates {
            let Some(verifier) = self.verifiers.get(idx) else {
                continue;
            };
            if let Some((start, end, capture_groups)) = verifier.find(input) {
                matches.push(RegexMatch {
                    id: self.ids[idx],
                    start,
                    end,
                    data: input[start..end].to_vec(),
                    capture_groups,
                });
            }
        }

        Ok(matches)
    }
}

/// Builds engines, optionally through a persistent cache
#[derive(Clone, Default)]
pub struct MultiRegexEngineFactory {
    cache: Option<Arc<DbCache>>,
}

impl MultiRegexEngineFactory {
    pub fn new(cache: Option<Arc<DbCache>>) -> Self {
        Self { cache }
    }

    fn prefilter_flags() -> u32 {
        #[cfg(feature = "hyperscan")]
        {
            hs_backend::PREFILTER_FLAGS
        }
        #[cfg(not(feature = "hyperscan"))]
        {
            0
        }
    }

    fn prepare_all(patterns: &[Pattern]) -> Result<Vec<PreparedPattern>> {
        patterns
            .iter()
            .map(|p| {
                let prepared = pcre::prepare(&p.expr);
                let backref = backref::rewrite(&prepared.expr)
                    .map_err(|e| WafError::Regex(format!("pattern {}: {e}", p.expr)))?;
                Ok(PreparedPattern {
                    id: p.id,
                    expr: prepared.expr,
                    backref,
                })
            })
            .collect()
    }

    /// Compile a database for `patterns`.
    pub fn build(&self, patterns: &[Pattern]) -> Result<MultiRegexEngine> {
        let cache_id = DbCache::cache_id(patterns, Self::prefilter_flags());

        let cached = self.cache.as_ref().and_then(|c| c.load(&cache_id));
        tracing::trace!(cache_hit = cached.is_some(), patterns = patterns.len(), "Attempted regex database load from cache");

        let prepared = match cached {
            Some(p) if p.len() == patterns.len() => p,
            _ => {
                let p = Self::prepare_all(patterns)?;
                if let Some(cache) = &self.cache {
                    cache.save(&cache_id, &p);
                }
                p
            }
        };

        let mut ids = Vec::new();
        let mut exprs: Vec<&str> = Vec::new();
        let mut verifiers = Vec::new();
        let mut empty_input_ids = Vec::new();

        for p in &prepared {
            if p.expr == EMPTY_INPUT_EXPR {
                empty_input_ids.push(p.id);
                continue;
            }

            let verifier = match &p.backref {
                Some(rewrite) => Verifier::Backref {
                    regex: pcre::compile(&rewrite.expr)?,
                    rewrite: rewrite.clone(),
                },
                None => Verifier::Plain(pcre::compile(&p.expr)?),
            };
            let prefilter_expr = p.backref.as_ref().map_or(p.expr.as_str(), |b| b.expr.as_str());

            ids.push(p.id);
            exprs.push(prefilter_expr);
            verifiers.push(verifier);
        }

        let prefilter = if exprs.is_empty() {
            Prefilter::Empty
        } else {
            Self::build_prefilter(&exprs)?
        };

        let (pool_tx, pool_rx) = crossbeam_channel::bounded(SCRATCH_POOL_SIZE);

        tracing::debug!(patterns = ids.len(), empty_input = empty_input_ids.len(), "Multi-regex database compiled");

        Ok(MultiRegexEngine {
            token: Arc::new(()),
            prefilter,
            ids,
            verifiers,
            empty_input_ids,
            pool_tx,
            pool_rx,
        })
    }

    #[cfg(not(feature = "hyperscan"))]
    fn build_prefilter(exprs: &[&str]) -> Result<Prefilter> {
        RegexSetBuilder::new(exprs)
            .size_limit(512 << 20)
            .dfa_size_limit(256 << 20)
            .build()
            .map(Prefilter::Set)
            .map_err(|e| WafError::Regex(format!("failed to compile prefilter with {} patterns: {e}", exprs.len())))
    }

    #[cfg(feature = "hyperscan")]
    fn build_prefilter(exprs: &[&str]) -> Result<Prefilter> {
        match hs_backend::compile(exprs) {
            Ok(db) => Ok(Prefilter::Hyperscan(db)),
            Err(e) => {
                tracing::warn!(error = %e, "Hyperscan compilation failed, using RegexSet prefilter");
                RegexSetBuilder::new(exprs)
                    .size_limit(512 << 20)
                    .dfa_size_limit(256 << 20)
                    .build()
                    .map(Prefilter::Set)
                    .map_err(|e| WafError::Regex(format!("failed to compile prefilter: {e}")))
            }
        }
    }
}
