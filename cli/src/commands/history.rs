//! `qvm-remote history` — list recent archived commands.

use std::path::Path;

use anyhow::{Context, Result};

use crate::paths::GuestDirs;

/// Most entries a listing will print.
const MAX_ENTRIES: usize = 50;

struct Entry {
    day: String,
    cid: String,
    exit: String,
    preview: String,
}

pub fn run(dirs: &GuestDirs) -> Result<u8> {
    let mut days = read_sorted_names(&dirs.history)?;
    days.reverse();

    let mut entries = Vec::new();
    'outer: for day in days {
        let day_dir = dirs.history.join(&day);
        if !day_dir.is_dir() {
            continue;
        }
        let mut cids: Vec<String> = read_sorted_names(&day_dir)?
            .into_iter()
            .filter_map(|name| name.strip_suffix(".cmd").map(String::from))
            .collect();
        cids.reverse();
        for cid in cids {
            entries.push(read_entry(&day_dir, &day, &cid));
            if entries.len() >= MAX_ENTRIES {
                break 'outer;
            }
        }
    }

    for e in &entries {
        println!("{}  {}  exit={}  {}", e.day, e.cid, e.exit, e.preview);
    }
    Ok(0)
}

fn read_entry(day_dir: &Path, day: &str, cid: &str) -> Entry {
    let exit = std::fs::read_to_string(day_dir.join(format!("{cid}.exit")))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "?".into());
    let preview = std::fs::read_to_string(day_dir.join(format!("{cid}.cmd")))
        .ok()
        .and_then(|s| s.lines().next().map(str::to_string))
        .unwrap_or_default();
    Entry {
        day: day.to_string(),
        cid: cid.to_string(),
        exit,
        preview,
    }
}

fn read_sorted_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let iter = match std::fs::read_dir(dir) {
        Ok(iter) => iter,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };
    for entry in iter {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
