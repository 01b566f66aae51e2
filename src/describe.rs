/*
Report reader and printer. Each requested path is resolved to the nearest
enclosing report by upward search; directory reports print their
directory-level aggregates, anything inside an analyzed tree prints its
per-file leaf.
*/

use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use crate::report::{find_enclosing, DirDuplicate, FileDuplicate, ReportReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Size,
    Items,
    Identical,
    Path,
}

impl FromStr for SortBy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "size" => Ok(SortBy::Size),
            "items" => Ok(SortBy::Items),
            "identical" => Ok(SortBy::Identical),
            "path" => Ok(SortBy::Path),
            other => anyhow::bail!("unknown sort key: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortChildren {
    DupSize,
    DupItems,
    TotalSize,
    Name,
}

impl FromStr for SortChildren {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dup-size" => Ok(SortChildren::DupSize),
            "dup-items" => Ok(SortChildren::DupItems),
            "total-size" => Ok(SortChildren::TotalSize),
            "name" => Ok(SortChildren::Name),
            other => anyhow::bail!("unknown children sort key: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DescribeOptions {
    pub directory: bool,
    pub all: bool,
    pub limit: Option<usize>,
    pub sort_by: SortBy,
    pub sort_children: SortChildren,
    pub keep_input_order: bool,
    pub bytes: bool,
    pub details: bool,
}

impl Default for DescribeOptions {
    fn default() -> Self {
        Self {
            directory: false,
            all: false,
            limit: None,
            sort_by: SortBy::Size,
            sort_children: SortChildren::DupSize,
            keep_input_order: false,
            bytes: false,
            details: false,
        }
    }
}

const DEFAULT_LIMIT: usize = 20;

fn format_size(bytes: u64, raw: bool) -> String {
    if raw || bytes < 1024 {
        return format!("{bytes}B");
    }
    let units = ["KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < units.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", units[unit])
}

fn truncate<T>(records: Vec<T>, opts: &DescribeOptions) -> Vec<T> {
    if opts.all {
        return records;
    }
    let limit = opts.limit.unwrap_or(DEFAULT_LIMIT);
    records.into_iter().take(limit).collect()
}

fn sort_file_records(records: &mut [FileDuplicate], opts: &DescribeOptions) {
    if opts.keep_input_order {
        return;
    }
    match opts.sort_by {
        SortBy::Size => records.sort_by(|a, b| b.size.cmp(&a.size)),
        SortBy::Items => {}
        SortBy::Identical => records.sort_by(|a, b| b.identical.cmp(&a.identical)),
        SortBy::Path => records.sort_by(|a, b| a.path.cmp(&b.path)),
    }
}

fn sort_dir_records(records: &mut [DirDuplicate], opts: &DescribeOptions) {
    if opts.keep_input_order {
        return;
    }
    match opts.sort_by {
        SortBy::Size => records.sort_by(|a, b| b.size.cmp(&a.size)),
        SortBy::Items => records.sort_by(|a, b| b.items.cmp(&a.items)),
        SortBy::Identical => records.sort_by(|a, b| b.identical.cmp(&a.identical)),
        SortBy::Path => records.sort_by(|a, b| a.path.cmp(&b.path)),
    }
}

fn print_file_records<W: Write>(
    out: &mut W,
    records: Vec<FileDuplicate>,
    opts: &DescribeOptions,
) -> Result<()> {
    let mut records = records;
    sort_file_records(&mut records, opts);
    for record in truncate(records, opts) {
        let verdict = if record.identical {
            "identical"
        } else {
            "duplicate"
        };
        writeln!(
            out,
            "  {} {} ec={} {}",
            record.path,
            verdict,
            record.ec_id,
            format_size(record.size, opts.bytes)
        )?;
    }
    Ok(())
}

/// Per-child summary for `--details` on a directory report.
struct ChildSummary {
    name: String,
    dup_items: u64,
    dup_size: u64,
    total_size: u64,
}

fn child_summaries(reader: &ReportReader) -> Result<Vec<ChildSummary>> {
    let mut out = Vec::new();
    for rel in reader.leaves()? {
        let records = reader.leaf(&rel)?;
        let dup_items = records.len() as u64;
        let dup_size = records.iter().filter(|r| r.identical).map(|r| r.size).sum();
        let total_size = records.first().map(|r| r.size).unwrap_or(0);
        out.push(ChildSummary {
            name: rel.display().to_string(),
            dup_items,
            dup_size,
            total_size,
        });
    }
    Ok(out)
}

fn print_details<W: Write>(
    out: &mut W,
    reader: &ReportReader,
    opts: &DescribeOptions,
) -> Result<()> {
    let mut children = child_summaries(reader)?;
    match opts.sort_children {
        SortChildren::DupSize => children.sort_by(|a, b| b.dup_size.cmp(&a.dup_size)),
        SortChildren::DupItems => children.sort_by(|a, b| b.dup_items.cmp(&a.dup_items)),
        SortChildren::TotalSize => children.sort_by(|a, b| b.total_size.cmp(&a.total_size)),
        SortChildren::Name => children.sort_by(|a, b| a.name.cmp(&b.name)),
    }
    for child in children {
        writeln!(
            out,
            "    {} dup-items={} dup-size={}",
            child.name,
            child.dup_items,
            format_size(child.dup_size, opts.bytes)
        )?;
    }
    Ok(())
}

/// Print the duplicate records governing each requested path.
pub fn describe<W: Write>(paths: &[PathBuf], opts: &DescribeOptions, out: &mut W) -> Result<()> {
    for path in paths {
        let abs = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        let Some((reader, rel)) = find_enclosing(&abs) else {
            anyhow::bail!(
                "no report covers {}; run `rededup analyze` first",
                path.display()
            );
        };
        let meta = reader.meta()?;

        if meta.directory && (rel.as_os_str().is_empty() || opts.directory) {
            let mut records = reader.dir_duplicates()?;
            sort_dir_records(&mut records, opts);
            let records = truncate(records, opts);
            writeln!(
                out,
                "{}: {} duplicate directories",
                meta.analyzed_path,
                records.len()
            )?;
            for record in &records {
                let verdict = if record.identical {
                    "identical"
                } else {
                    "partial"
                };
                writeln!(
                    out,
                    "  {} {} items={} {}",
                    record.path,
                    verdict,
                    record.items,
                    format_size(record.size, opts.bytes)
                )?;
            }
            if opts.details {
                print_details(out, &reader, opts)?;
            }
        } else if meta.directory {
            let records = reader.leaf(&rel)?;
            writeln!(out, "{}:", abs.display())?;
            print_file_records(out, records, opts)?;
        } else {
            let records = reader.file_duplicates()?;
            writeln!(out, "{}:", meta.analyzed_path)?;
            print_file_records(out, records, opts)?;
        }
    }
    Ok(())
}
