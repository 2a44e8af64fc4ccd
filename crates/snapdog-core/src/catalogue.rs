//! ETS group-address catalogue.
//!
//! ETS exports a CSV with `Address`, `Description` and `DPT` columns, either
//! semicolon- or comma-separated, optionally quoted.  The loader is lenient:
//! rows that do not carry a parsable group address are skipped with a
//! warning, duplicate addresses are resolved last-wins, and an unknown DPT
//! spelling simply leaves the entry untyped.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

use crate::error::{Error, Result};
use crate::knx::address::GroupAddress;
use crate::knx::dpt::DptId;

#[derive(Debug, Clone, PartialEq)]
pub struct GroupAddressEntry {
    pub address: GroupAddress,
    pub description: Option<String>,
    pub dpt: Option<DptId>,
}

/// Immutable address → entry lookup.  Reloads build a fresh catalogue that
/// replaces the old one atomically at the holder.
#[derive(Debug, Default, Clone)]
pub struct Catalogue {
    entries: HashMap<u16, GroupAddressEntry>,
}

impl Catalogue {
    pub fn new(entries: Vec<GroupAddressEntry>) -> Self {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            if let Some(prev) = map.insert(entry.address.raw(), entry) {
                warn!(
                    "duplicate group address {} in catalogue, keeping the later row",
                    prev.address
                );
            }
        }
        Self { entries: map }
    }

    pub fn lookup(&self, address: GroupAddress) -> Option<&GroupAddressEntry> {
        self.entries.get(&address.raw())
    }

    pub fn dpt_for(&self, address: GroupAddress) -> Option<DptId> {
        self.lookup(address).and_then(|e| e.dpt)
    }

    pub fn description_for(&self, address: GroupAddress) -> Option<&str> {
        self.lookup(address).and_then(|e| e.description.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config("KNX_CSV", format!("cannot read {}: {e}", path.display())))?;
        Ok(Self::new(parse_ets_csv(&content)))
    }
}

// ── CSV parsing ───────────────────────────────────────────────────────────────

/// Parse an ETS export.  Returns the entries in file order (the caller's
/// [`Catalogue::new`] applies last-wins on duplicates).
pub fn parse_ets_csv(content: &str) -> Vec<GroupAddressEntry> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());

    let Some(first) = lines.next() else {
        return Vec::new();
    };

    let sep = detect_separator(first);
    let header = split_row(first, sep);
    let (cols, skip_first) = match column_indices(&header) {
        Some(cols) => (cols, true),
        // no recognizable header: assume Address;Description;DPT order
        None => (Columns { address: 0, description: Some(1), dpt: Some(2) }, false),
    };

    let rows = if skip_first {
        Box::new(lines) as Box<dyn Iterator<Item = &str>>
    } else {
        Box::new(std::iter::once(first).chain(lines))
    };

    let mut entries = Vec::new();
    for (line_no, line) in rows.enumerate() {
        let fields = split_row(line, sep);
        let Some(raw_addr) = fields.get(cols.address) else {
            continue;
        };
        let address = match raw_addr.parse::<GroupAddress>() {
            Ok(a) => a,
            Err(e) => {
                warn!("catalogue row {}: {e}", line_no + 1);
                continue;
            }
        };
        let description = cols
            .description
            .and_then(|i| fields.get(i))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let dpt = cols
            .dpt
            .and_then(|i| fields.get(i))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .and_then(|s| match s.parse::<DptId>() {
                Ok(d) => Some(d),
                Err(_) => {
                    warn!("catalogue row {}: unrecognized DPT '{s}'", line_no + 1);
                    None
                }
            });
        entries.push(GroupAddressEntry {
            address,
            description,
            dpt,
        });
    }
    entries
}

struct Columns {
    address: usize,
    description: Option<usize>,
    dpt: Option<usize>,
}

fn column_indices(header: &[String]) -> Option<Columns> {
    let find = |name: &str| {
        header
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    };
    let address = find("address")?;
    Some(Columns {
        address,
        description: find("description"),
        dpt: find("dpt").or_else(|| find("datapoint type")),
    })
}

fn detect_separator(line: &str) -> char {
    let semicolons = line.matches(';').count();
    let commas = line.matches(',').count();
    if semicolons >= commas {
        ';'
    } else {
        ','
    }
}

/// Split one CSV row, honoring double-quoted fields with `""` escapes.
fn split_row(line: &str, sep: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == sep {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}
