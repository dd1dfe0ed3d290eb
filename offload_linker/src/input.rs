//! Picking the scannable inputs out of a host-link command line.
//!
//! Positional files and `-l` libraries that turn out to be relocatable
//! objects or `ar` archives are read for scanning. The command line itself
//! is passed to the host linker untouched.

use std::path::{Path, PathBuf};

use object::{FileKind, Object, ObjectKind};
use tracing::debug;

use crate::error::WrapperError;

/// Options whose value is the next argument.
const VALUE_OPTIONS: &[&str] = &[
    "-o",
    "-z",
    "-m",
    "-T",
    "-e",
    "-h",
    "-u",
    "-y",
    "-soname",
    "-rpath",
    "-Map",
    "-Xlinker",
    "--dynamic-linker",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Object,
    Archive,
}

#[derive(Debug, Clone)]
pub struct InputFile {
    pub path: PathBuf,
    pub kind: InputKind,
    pub data: Vec<u8>,
}

enum Candidate {
    File(PathBuf),
    Library(String),
}

fn candidates(args: &[String]) -> (Vec<PathBuf>, Vec<Candidate>) {
    let mut search_dirs = Vec::new();
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-L" {
            search_dirs.extend(iter.next().map(PathBuf::from));
        } else if let Some(dir) = arg.strip_prefix("-L") {
            search_dirs.push(PathBuf::from(dir));
        } else if arg == "-l" {
            out.extend(iter.next().map(|n| Candidate::Library(n.clone())));
        } else if let Some(name) = arg.strip_prefix("-l") {
            out.push(Candidate::Library(name.to_string()));
        } else if VALUE_OPTIONS.contains(&arg.as_str()) {
            iter.next();
        } else if !arg.starts_with('-') {
            out.push(Candidate::File(PathBuf::from(arg)));
        }
    }
    (search_dirs, out)
}

/// Resolve `-l<name>` to a static archive. `-l:<file>` names the file
/// exactly.
pub fn resolve_library(name: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    let file = match name.strip_prefix(':') {
        Some(exact) => exact.to_string(),
        None => format!("lib{name}.a"),
    };
    search_dirs
        .iter()
        .map(|dir| dir.join(&file))
        .find(|p| p.is_file())
}

/// Classify a file's contents; `None` for anything not worth scanning.
pub fn sniff(data: &[u8]) -> Option<InputKind> {
    match FileKind::parse(data).ok()? {
        FileKind::Archive => Some(InputKind::Archive),
        FileKind::Elf64 | FileKind::Elf32 => {
            let file = object::File::parse(data).ok()?;
            (file.kind() == ObjectKind::Relocatable).then_some(InputKind::Object)
        }
        _ => None,
    }
}

fn load(path: &Path) -> Result<Option<InputFile>, WrapperError> {
    if !path.is_file() {
        debug!(path = %path.display(), "not a file, left to the host linker");
        return Ok(None);
    }
    let data = std::fs::read(path).map_err(|e| WrapperError::io(path, e))?;
    let Some(kind) = sniff(&data) else {
        debug!(path = %path.display(), "not a relocatable object or archive");
        return Ok(None);
    };
    Ok(Some(InputFile {
        path: path.to_path_buf(),
        kind,
        data,
    }))
}

/// Read every scannable input named by `args`, in command-line order.
pub fn host_inputs(args: &[String]) -> Result<Vec<InputFile>, WrapperError> {
    let (search_dirs, candidates) = candidates(args);
    let mut inputs = Vec::new();
    for candidate in candidates {
        let path = match candidate {
            Candidate::File(path) => path,
            Candidate::Library(name) => match resolve_library(&name, &search_dirs) {
                Some(path) => path,
                None => {
                    debug!(library = %name, "no static archive found");
                    continue;
                }
            },
        };
        inputs.extend(load(&path)?);
    }
    Ok(inputs)
}
