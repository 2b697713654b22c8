//! Sources of raw ebuild metadata.
//!
//! Sourcing an ebuild needs a bash interpreter plus the eclass machinery,
//! so extraction is an opaque step behind [`MetadataExtractor`]. The store
//! calls it on a cache miss and owns everything that happens afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::cpv::Cpv;
use crate::record::{eclass_names, parse_key_values};
use crate::repository::RepositoryTree;

/// Phase run to produce metadata.
pub const DEPEND_PHASE: &str = "depend";

/// What an extractor knows about the ebuild it is asked about.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    pub cpv: &'a Cpv,
    /// Tree the ebuild was resolved in.
    pub tree: &'a RepositoryTree,
    pub phase: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// Raw key/value output. `INHERITED` lists eclass names.
    Success(BTreeMap<String, String>),
    /// The ebuild could not be sourced.
    Failure,
}

/// Runs the `depend` phase of one ebuild.
pub trait MetadataExtractor {
    fn extract(&mut self, ebuild: &Path, ctx: &ExtractContext<'_>) -> ExtractOutcome;
}

impl<F> MetadataExtractor for F
where
    F: FnMut(&Path, &ExtractContext<'_>) -> ExtractOutcome,
{
    fn extract(&mut self, ebuild: &Path, ctx: &ExtractContext<'_>) -> ExtractOutcome {
        self(ebuild, ctx)
    }
}

/// Runs an external program as `<program> [args...] <ebuild> depend` and
/// reads `KEY=VALUE` lines from its standard output.
///
/// The program gets `CATEGORY`, `PF`, `EBUILD_PHASE` and `PORTDIR` (the
/// resolving tree) in its environment.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        CommandExtractor {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl MetadataExtractor for CommandExtractor {
    fn extract(&mut self, ebuild: &Path, ctx: &ExtractContext<'_>) -> ExtractOutcome {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(ebuild)
            .arg(ctx.phase)
            .env("CATEGORY", &ctx.cpv.category)
            .env("PF", ctx.cpv.pf())
            .env("EBUILD_PHASE", ctx.phase)
            .env("PORTDIR", &ctx.tree.path)
            .output();
        match output {
            Ok(output) if output.status.success() => {
                ExtractOutcome::Success(parse_key_values(&String::from_utf8_lossy(&output.stdout)))
            }
            Ok(output) => {
                warn!(
                    cpv = %ctx.cpv,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "metadata extraction failed"
                );
                ExtractOutcome::Failure
            }
            Err(err) => {
                warn!(cpv = %ctx.cpv, program = %self.program.display(), %err, "cannot run extractor");
                ExtractOutcome::Failure
            }
        }
    }
}

/// Reads the tree's pre-generated `metadata/md5-cache/<cat>/<pf>` entry
/// instead of sourcing the ebuild.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5CacheExtractor;

impl MetadataExtractor for Md5CacheExtractor {
    fn extract(&mut self, _ebuild: &Path, ctx: &ExtractContext<'_>) -> ExtractOutcome {
        let path = ctx
            .tree
            .path
            .join("metadata/md5-cache")
            .join(&ctx.cpv.category)
            .join(ctx.cpv.pf());
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                debug!(path = %path.display(), %err, "no md5-cache entry");
                return ExtractOutcome::Failure;
            }
        };
        let mut fields = parse_key_values(&text);
        if let Some(eclasses) = fields.remove("_eclasses_") {
            fields
                .entry("INHERITED".to_string())
                .or_insert_with(|| eclass_names(&eclasses).join(" "));
        }
        fields.retain(|key, _| !key.starts_with('_'));
        ExtractOutcome::Success(fields)
    }
}
