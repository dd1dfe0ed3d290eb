//! Section naming contract.
//!
//! The entries table lives in one fixed, C-identifier section so the host
//! linker brackets the concatenation with `__start_`/`__stop_` symbols.
//! Every embedded device blob gets a section whose name encodes its target
//! and an optional disambiguator.

use std::fmt::Write;

use crate::target::TargetId;

pub const ENTRIES_SECTION: &str = "omp_offloading_entries";
pub const ENTRIES_START: &str = "__start_omp_offloading_entries";
pub const ENTRIES_STOP: &str = "__stop_omp_offloading_entries";
/// Zero-sized sentinel placed in the entries section by the wrapper.
pub const ENTRIES_SENTINEL: &str = "__dummy.omp_offloading_entries";
pub const ENTRY_NAMES_SECTION: &str = ".omp_offloading.entry_name";
pub const DEVICE_SECTION_PREFIX: &str = ".omp_offloading.image";

const SEP: char = '$';

/// Decoded device section name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceSectionKey {
    pub target: TargetId,
    pub disambiguator: Option<String>,
}

impl DeviceSectionKey {
    pub fn new(target: TargetId, disambiguator: Option<String>) -> Self {
        Self {
            target,
            disambiguator,
        }
    }

    pub fn section_name(&self) -> String {
        let mut name = String::from(DEVICE_SECTION_PREFIX);
        for part in [Some(&self.target.triple), Some(&self.target.arch)]
            .into_iter()
            .chain([self.disambiguator.as_ref()])
            .flatten()
        {
            name.push(SEP);
            escape_into(&mut name, part);
        }
        name
    }

    /// Parse a section name.
    ///
    /// Returns `Ok(None)` for sections that are not device sections at all.
    pub fn parse(name: &str) -> Result<Option<Self>, SectionError> {
        let Some(rest) = name.strip_prefix(DEVICE_SECTION_PREFIX) else {
            return Ok(None);
        };
        let Some(rest) = rest.strip_prefix(SEP) else {
            return Err(SectionError::MalformedName(name.to_string()));
        };
        let parts: Vec<&str> = rest.split(SEP).collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(SectionError::MalformedName(name.to_string()));
        }
        let unescape_part =
            |p: &str| unescape(p).ok_or_else(|| SectionError::MalformedName(name.to_string()));
        let triple = unescape_part(parts[0])?;
        if triple.is_empty() {
            return Err(SectionError::MalformedName(name.to_string()));
        }
        let arch = unescape_part(parts[1])?;
        let disambiguator = parts.get(2).map(|p| unescape_part(p)).transpose()?;
        Ok(Some(Self {
            target: TargetId::new(triple, arch),
            disambiguator,
        }))
    }
}

fn escape_into(out: &mut String, part: &str) {
    for c in part.chars() {
        if c == '%' || c == SEP {
            let _ = write!(out, "%{:02X}", c as u32);
        } else {
            out.push(c);
        }
    }
}

fn unescape(part: &str) -> Option<String> {
    let mut out = String::with_capacity(part.len());
    let mut chars = part.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() != 2 {
                return None;
            }
            let byte = u8::from_str_radix(&hex, 16).ok()?;
            out.push(byte as char);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SectionError {
    #[error("malformed device section name '{0}'")]
    MalformedName(String),
}
