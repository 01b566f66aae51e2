/*
Join two directory trees entry by entry: an analyzed tree on one side and
a repository directory already known to duplicate it on the other. Each
name-level join classifies as present on one side only, matching by
content, or matching by content and metadata. Same-named entries with
different bytes (or different kinds) surface as a pair of one-sided
lines.
*/

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use crate::compare::files_equal;
use crate::meta::{FileMeta, MetadataPolicy};
use crate::report::REPORT_SUFFIX;
use crate::repository::{Repository, INDEX_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowSide {
    Both,
    Analyzed,
    Repository,
}

impl FromStr for ShowSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "both" => Ok(ShowSide::Both),
            "analyzed" => Ok(ShowSide::Analyzed),
            "repository" => Ok(ShowSide::Repository),
            other => anyhow::bail!("unknown side: {other}"),
        }
    }
}

pub const DEFAULT_MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct DiffTreeOptions {
    pub hide_content_match: bool,
    /// `None` walks without a depth limit.
    pub max_depth: Option<usize>,
    pub show: ShowSide,
}

impl Default for DiffTreeOptions {
    fn default() -> Self {
        Self {
            hide_content_match: false,
            max_depth: Some(DEFAULT_MAX_DEPTH),
            show: ShowSide::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    OnlyAnalyzed,
    OnlyRepository,
    ContentMatch,
    ContentMetadataMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub kind: JoinKind,
    pub path: String,
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    File,
    Dir,
}

fn entries(dir: &Path) -> Result<BTreeMap<String, Kind>> {
    let mut out = BTreeMap::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == INDEX_DIR || name.ends_with(REPORT_SUFFIX) {
            continue;
        }
        let file_type = entry.file_type()?;
        let kind = if file_type.is_dir() {
            Kind::Dir
        } else if file_type.is_file() {
            Kind::File
        } else {
            continue;
        };
        out.insert(name, kind);
    }
    Ok(out)
}

fn display_path(prefix: &str, name: &str, kind: Kind) -> String {
    let joined = if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    };
    match kind {
        Kind::Dir => format!("{joined}/"),
        Kind::File => joined,
    }
}

fn classify_files(
    analyzed: &Path,
    repository: &Path,
    policy: &MetadataPolicy,
) -> Result<JoinKind> {
    if !files_equal(analyzed, repository)? {
        // same name, different bytes: both sides are unmatched
        return Ok(JoinKind::OnlyAnalyzed);
    }
    let left = FileMeta::read(analyzed)?;
    let right = FileMeta::read(repository)?;
    if left.matches(&right, policy) {
        Ok(JoinKind::ContentMetadataMatch)
    } else {
        Ok(JoinKind::ContentMatch)
    }
}

fn join_trees(
    analyzed: &Path,
    repository: &Path,
    prefix: &str,
    depth: usize,
    opts: &DiffTreeOptions,
    policy: &MetadataPolicy,
    out: &mut Vec<Join>,
) -> Result<()> {
    if let Some(limit) = opts.max_depth {
        if depth >= limit {
            return Ok(());
        }
    }
    let left = entries(analyzed)?;
    let right = entries(repository)?;

    let names: std::collections::BTreeSet<&String> = left.keys().chain(right.keys()).collect();
    for name in names {
        match (left.get(name), right.get(name)) {
            (Some(kind), None) => out.push(Join {
                kind: JoinKind::OnlyAnalyzed,
                path: display_path(prefix, name, *kind),
            }),
            (None, Some(kind)) => out.push(Join {
                kind: JoinKind::OnlyRepository,
                path: display_path(prefix, name, *kind),
            }),
            (Some(Kind::Dir), Some(Kind::Dir)) => {
                let child = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}/{name}")
                };
                join_trees(
                    &analyzed.join(name),
                    &repository.join(name),
                    &child,
                    depth + 1,
                    opts,
                    policy,
                    out,
                )?;
            }
            (Some(Kind::File), Some(Kind::File)) => {
                match classify_files(&analyzed.join(name), &repository.join(name), policy)? {
                    JoinKind::OnlyAnalyzed => {
                        out.push(Join {
                            kind: JoinKind::OnlyAnalyzed,
                            path: display_path(prefix, name, Kind::File),
                        });
                        out.push(Join {
                            kind: JoinKind::OnlyRepository,
                            path: display_path(prefix, name, Kind::File),
                        });
                    }
                    kind => out.push(Join {
                        kind,
                        path: display_path(prefix, name, Kind::File),
                    }),
                }
            }
            (Some(l), Some(r)) => {
                // kind mismatch: a file shadows a directory or vice versa
                out.push(Join {
                    kind: JoinKind::OnlyAnalyzed,
                    path: display_path(prefix, name, *l),
                });
                out.push(Join {
                    kind: JoinKind::OnlyRepository,
                    path: display_path(prefix, name, *r),
                });
            }
            (None, None) => {}
        }
    }
    Ok(())
}

/// Compute the joined classification of the two trees.
pub fn diff_trees(
    repo: &Repository,
    analyzed: &Path,
    repo_dir: &Path,
    opts: &DiffTreeOptions,
) -> Result<Vec<Join>> {
    let analyzed = analyzed
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", analyzed.display()))?;
    // the repository side may be given relative to the repository root
    let repository = if repo_dir.is_absolute() {
        repo_dir.to_path_buf()
    } else {
        repo.root().join(repo_dir)
    };
    let repository = repository
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", repository.display()))?;

    let mut joins = Vec::new();
    join_trees(
        &analyzed,
        &repository,
        "",
        0,
        opts,
        &MetadataPolicy::default(),
        &mut joins,
    )?;
    Ok(joins)
}

/// Print the join stream, honoring the side and match filters.
pub fn diff_tree<W: Write>(
    repo: &Repository,
    analyzed: &Path,
    repo_dir: &Path,
    opts: &DiffTreeOptions,
    out: &mut W,
) -> Result<()> {
    for join in diff_trees(repo, analyzed, repo_dir, opts)? {
        let (marker, shown) = match join.kind {
            JoinKind::OnlyAnalyzed => ("A ", opts.show != ShowSide::Repository),
            JoinKind::OnlyRepository => ("R ", opts.show != ShowSide::Analyzed),
            JoinKind::ContentMatch => ("= ", !opts.hide_content_match),
            JoinKind::ContentMetadataMatch => ("==", true),
        };
        if shown {
            writeln!(out, "{marker} {}", join.path)?;
        }
    }
    Ok(())
}
