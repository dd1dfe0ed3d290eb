//! Fat object scanning.
//!
//! One sequential pass over the link inputs. Objects are always loaded;
//! archive members are loaded only once they define something a loaded
//! input still needs, repeated until nothing more is pulled in. Every
//! loaded object contributes its entry records and its device sections.

use std::collections::{BTreeSet, HashMap};

use object::read::archive::ArchiveFile;
use object::read::{Relocation, RelocationTarget, SectionIndex};
use object::{Object, ObjectSection, ObjectSymbol};
use offload_ir::module::is_portable_ir;
use offload_target::TargetId;
use offload_target::entry::{EntryFlags, OffloadEntry};
use offload_target::layout::{self, ENTRY_ADDRESS, ENTRY_NAME, ENTRY_SIZE, RECORD_ALIGN};
use offload_target::section::{DeviceSectionKey, ENTRIES_SECTION};
use tracing::{debug, warn};

use crate::input::{InputFile, InputKind, sniff};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("{origin}: {message}")]
    Parse { origin: String, message: String },
    #[error("{origin}: malformed section '{section}': {reason}")]
    MalformedSection {
        origin: String,
        section: String,
        reason: String,
    },
}

/// An embedded device object found in some input.
#[derive(Debug, Clone)]
pub struct DeviceBlob {
    pub target: TargetId,
    pub disambiguator: Option<String>,
    /// Input (or `archive(member)`) the blob came from.
    pub origin: String,
    pub bytes: Vec<u8>,
}

impl DeviceBlob {
    pub fn is_portable_ir(&self) -> bool {
        is_portable_ir(&self.bytes)
    }
}

/// Everything the scan accumulated, in load order.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub entries: Vec<OffloadEntry>,
    pub blobs: Vec<DeviceBlob>,
    /// Objects and archive members that were loaded.
    pub loaded: Vec<String>,
}

impl ScanResult {
    /// Targets in order of first appearance.
    pub fn targets(&self) -> Vec<TargetId> {
        let mut seen = BTreeSet::new();
        self.blobs
            .iter()
            .filter(|b| seen.insert(&b.target))
            .map(|b| b.target.clone())
            .collect()
    }

    /// Blobs for `target`, in input order.
    pub fn blobs_for(&self, target: &TargetId) -> Vec<DeviceBlob> {
        self.blobs
            .iter()
            .filter(|b| &b.target == target)
            .cloned()
            .collect()
    }
}

/// What one object contributes.
#[derive(Debug, Default)]
pub struct ObjectScan {
    pub entries: Vec<OffloadEntry>,
    pub blobs: Vec<DeviceBlob>,
    pub defined: BTreeSet<String>,
    pub undefined: BTreeSet<String>,
}

fn parse_error(origin: &str, err: impl std::fmt::Display) -> ScanError {
    ScanError::Parse {
        origin: origin.to_string(),
        message: err.to_string(),
    }
}

fn symbol_sets(file: &object::File<'_>) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut defined = BTreeSet::new();
    let mut undefined = BTreeSet::new();
    for sym in file.symbols() {
        let Ok(name) = sym.name() else { continue };
        if name.is_empty() {
            continue;
        }
        if sym.is_undefined() {
            undefined.insert(name.to_string());
        } else if sym.is_global() {
            defined.insert(name.to_string());
        }
    }
    (defined, undefined)
}

struct EntryReader<'a, 'f> {
    file: &'f object::File<'a>,
    origin: &'f str,
}

impl EntryReader<'_, '_> {
    fn malformed(&self, reason: impl Into<String>) -> ScanError {
        ScanError::MalformedSection {
            origin: self.origin.to_string(),
            section: ENTRIES_SECTION.to_string(),
            reason: reason.into(),
        }
    }

    fn symbol_name(&self, reloc: &Relocation) -> Option<String> {
        let RelocationTarget::Symbol(idx) = reloc.target() else {
            return None;
        };
        let name = self.file.symbol_by_index(idx).ok()?.name().ok()?;
        (!name.is_empty()).then(|| name.to_string())
    }

    fn target_location(&self, reloc: &Relocation) -> Option<(SectionIndex, u64)> {
        let (section, base) = match reloc.target() {
            RelocationTarget::Symbol(idx) => {
                let sym = self.file.symbol_by_index(idx).ok()?;
                (sym.section_index()?, sym.address())
            }
            RelocationTarget::Section(idx) => (idx, 0),
            _ => return None,
        };
        let offset = base.checked_add_signed(reloc.addend())?;
        Some((section, offset))
    }

    fn c_string(&self, reloc: &Relocation) -> Option<String> {
        let (section, offset) = self.target_location(reloc)?;
        let data = self.file.section_by_index(section).ok()?.data().ok()?;
        let tail = data.get(usize::try_from(offset).ok()?..)?;
        let len = tail.iter().position(|&b| b == 0)?;
        String::from_utf8(tail[..len].to_vec()).ok()
    }

    fn read(&self, section: &object::Section<'_, '_>) -> Result<Vec<OffloadEntry>, ScanError> {
        let data = section.data().map_err(|e| self.malformed(e.to_string()))?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data.len() % ENTRY_SIZE != 0 {
            return Err(self.malformed(format!(
                "size {} is not a multiple of {ENTRY_SIZE}",
                data.len()
            )));
        }
        if section.align() < RECORD_ALIGN {
            return Err(self.malformed(format!(
                "alignment {} is below {RECORD_ALIGN}",
                section.align()
            )));
        }

        let relocs: HashMap<u64, Relocation> = section.relocations().collect();
        let mut entries = Vec::with_capacity(data.len() / ENTRY_SIZE);
        for (i, record) in data.chunks_exact(ENTRY_SIZE).enumerate() {
            let base = (i * ENTRY_SIZE) as u64;
            let (size, bits, reserved) = layout::decode_entry(record)
                .ok_or_else(|| self.malformed(format!("record {i} is truncated")))?;
            let address = relocs
                .get(&(base + ENTRY_ADDRESS as u64))
                .and_then(|r| self.symbol_name(r))
                .ok_or_else(|| self.malformed(format!("record {i} has no address relocation")))?;
            let name = relocs
                .get(&(base + ENTRY_NAME as u64))
                .and_then(|r| self.c_string(r))
                .ok_or_else(|| self.malformed(format!("record {i} has no readable name")))?;
            let flags = EntryFlags::from_bits(bits, size)
                .map_err(|e| self.malformed(format!("record {i}: {e}")))?;
            let entry = OffloadEntry {
                address,
                name,
                size,
                flags,
                reserved,
            };
            entry
                .validate()
                .map_err(|e| self.malformed(format!("record {i}: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Read the entry records and device sections of one relocatable object.
pub fn scan_object(origin: &str, data: &[u8]) -> Result<ObjectScan, ScanError> {
    let file = object::File::parse(data).map_err(|e| parse_error(origin, e))?;
    let (defined, undefined) = symbol_sets(&file);
    let mut scan = ObjectScan {
        defined,
        undefined,
        ..ObjectScan::default()
    };

    let reader = EntryReader {
        file: &file,
        origin,
    };
    for section in file.sections() {
        let Ok(name) = section.name() else { continue };
        if name == ENTRIES_SECTION {
            scan.entries.extend(reader.read(&section)?);
            continue;
        }
        let malformed = |reason: String| ScanError::MalformedSection {
            origin: origin.to_string(),
            section: name.to_string(),
            reason,
        };
        let Some(key) = DeviceSectionKey::parse(name).map_err(|e| malformed(e.to_string()))? else {
            continue;
        };
        let bytes = section.data().map_err(|e| malformed(e.to_string()))?;
        if bytes.is_empty() {
            return Err(malformed("device section is empty".into()));
        }
        debug!(origin, section = name, size = bytes.len(), "found device section");
        scan.blobs.push(DeviceBlob {
            target: key.target,
            disambiguator: key.disambiguator,
            origin: origin.to_string(),
            bytes: bytes.to_vec(),
        });
    }
    Ok(scan)
}

struct LazyMember<'a> {
    origin: String,
    data: &'a [u8],
    defined: BTreeSet<String>,
}

fn archive_members<'a>(input: &'a InputFile) -> Result<Vec<LazyMember<'a>>, ScanError> {
    let archive_name = input.path.display().to_string();
    let archive = ArchiveFile::parse(&*input.data).map_err(|e| parse_error(&archive_name, e))?;
    let mut members = Vec::new();
    for member in archive.members() {
        let member = member.map_err(|e| parse_error(&archive_name, e))?;
        let origin = format!(
            "{archive_name}({})",
            String::from_utf8_lossy(member.name())
        );
        let data = member
            .data(&*input.data)
            .map_err(|e| parse_error(&origin, e))?;
        if sniff(data) != Some(InputKind::Object) {
            debug!(%origin, "skipping non-object archive member");
            continue;
        }
        let file = object::File::parse(data).map_err(|e| parse_error(&origin, e))?;
        let (defined, _) = symbol_sets(&file);
        members.push(LazyMember {
            origin,
            data,
            defined,
        });
    }
    Ok(members)
}

#[derive(Default)]
struct Scanner {
    result: ScanResult,
    defined: BTreeSet<String>,
    undefined: BTreeSet<String>,
}

impl Scanner {
    fn load(&mut self, origin: String, data: &[u8]) -> Result<(), ScanError> {
        let scan = scan_object(&origin, data)?;
        if scan.entries.is_empty() && scan.blobs.is_empty() {
            debug!(%origin, "no offloading content");
        }
        self.defined.extend(scan.defined);
        self.undefined.extend(scan.undefined);
        self.result.entries.extend(scan.entries);
        self.result.blobs.extend(scan.blobs);
        self.result.loaded.push(origin);
        Ok(())
    }

    fn wants(&self, member: &LazyMember<'_>) -> bool {
        member
            .defined
            .iter()
            .any(|s| self.undefined.contains(s) && !self.defined.contains(s))
    }
}

/// Scan every input, extracting archive members on demand.
pub fn scan_inputs(inputs: &[InputFile]) -> Result<ScanResult, ScanError> {
    let mut scanner = Scanner::default();
    let mut lazy = Vec::new();
    for input in inputs {
        match input.kind {
            InputKind::Object => scanner.load(input.path.display().to_string(), &input.data)?,
            InputKind::Archive => lazy.extend(archive_members(input)?),
        }
    }

    while let Some(pos) = lazy.iter().position(|m| scanner.wants(m)) {
        let member = lazy.remove(pos);
        debug!(origin = %member.origin, "extracting archive member");
        scanner.load(member.origin, member.data)?;
    }
    for member in &lazy {
        let has_offload = object::File::parse(member.data)
            .map(|f| f.section_by_name(ENTRIES_SECTION).is_some())
            .unwrap_or(false);
        if has_offload {
            warn!(origin = %member.origin, "archive member with offload entries was not needed");
        }
    }
    Ok(scanner.result)
}
