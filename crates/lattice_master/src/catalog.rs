//! Catalog data model: table/region descriptors and the catalog row codec.
//!
//! Region locations live as rows inside two special catalog tables: the root
//! catalog (a single region, never split) stores the rows of the meta
//! catalog's regions, and each meta region stores the rows of user-table
//! regions in its key range. A row is keyed by the region name and carries
//! the serialized descriptor plus assignment and split-lineage cells.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const ROOT_TABLE_NAME: &str = "-ROOT-";
pub const META_TABLE_NAME: &str = ".META.";

/// Column family carrying all catalog bookkeeping cells.
pub const COL_REGIONINFO: &str = "info:regioninfo";
pub const COL_SERVER: &str = "info:server";
pub const COL_STARTCODE: &str = "info:startcode";
pub const COL_SPLIT_A: &str = "info:splitA";
pub const COL_SPLIT_B: &str = "info:splitB";
pub const COL_SPLIT_A_CHECKED: &str = "info:splitA_checked";
pub const COL_SPLIT_B_CHECKED: &str = "info:splitB_checked";

/// All cells of one catalog row, keyed `family:qualifier`.
pub type RowCells = BTreeMap<String, Bytes>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName(pub String);

impl TableName {
    pub fn root() -> Self {
        TableName(ROOT_TABLE_NAME.to_string())
    }

    pub fn meta() -> Self {
        TableName(META_TABLE_NAME.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_TABLE_NAME
    }

    pub fn is_meta(&self) -> bool {
        self.0 == META_TABLE_NAME
    }

    pub fn is_catalog(&self) -> bool {
        self.is_root() || self.is_meta()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Column family schema carried inside a region's descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamilyDescriptor {
    pub name: String,
    pub max_versions: u32,
}

impl ColumnFamilyDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        ColumnFamilyDescriptor {
            name: name.into(),
            max_versions: 3,
        }
    }

    /// Family names are path components and cell-key prefixes; keep them to
    /// a conservative charset.
    pub fn validate_name(name: &str) -> crate::error::Result<()> {
        if name.is_empty()
            || !name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(crate::error::MasterError::InvalidColumn(name.to_string()));
        }
        Ok(())
    }
}

/// One contiguous key-range partition of a table.
///
/// The key range is half-open; an empty `end_key` means unbounded. The
/// descriptor is immutable except for the `offline` and `split` flags, each
/// set exactly once. A region with `split == true` is a split parent and is
/// never served again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub table: TableName,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub region_id: u64,
    pub offline: bool,
    pub split: bool,
    pub families: Vec<ColumnFamilyDescriptor>,
}

impl RegionDescriptor {
    pub fn new(table: TableName, start_key: Vec<u8>, end_key: Vec<u8>, region_id: u64) -> Self {
        RegionDescriptor {
            table,
            start_key,
            end_key,
            region_id,
            offline: false,
            split: false,
            families: vec![ColumnFamilyDescriptor::new("info")],
        }
    }

    pub fn root() -> Self {
        let mut r = RegionDescriptor::new(TableName::root(), Vec::new(), Vec::new(), 0);
        r.families = vec![ColumnFamilyDescriptor::new("info")];
        r
    }

    pub fn first_meta() -> Self {
        RegionDescriptor::new(TableName::meta(), Vec::new(), Vec::new(), 1)
    }

    pub fn is_root(&self) -> bool {
        self.table.is_root()
    }

    pub fn is_meta(&self) -> bool {
        self.table.is_meta()
    }

    pub fn is_catalog(&self) -> bool {
        self.table.is_catalog()
    }

    /// Region name, also the catalog row key: `table,startkey-hex,region_id`.
    ///
    /// Hex-encoding the start key keeps lexicographic row ordering equal to
    /// byte ordering of the original keys.
    pub fn name(&self) -> String {
        format!("{},{},{}", self.table, hex(&self.start_key), self.region_id)
    }

    pub fn name_bytes(&self) -> Vec<u8> {
        self.name().into_bytes()
    }

    /// Stable short identifier used for storage directory names.
    pub fn encoded_name(&self) -> String {
        let mut h = crc32fast::Hasher::new();
        h.update(self.name().as_bytes());
        h.finalize().to_string()
    }

    /// Whether `row` falls inside this region's half-open key range.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_slice() && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }
}

impl fmt::Display for RegionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// First possible catalog row key for a table's regions.
pub fn table_scan_start(table: &TableName) -> Vec<u8> {
    format!("{table},").into_bytes()
}

/// Whether a catalog row key belongs to `table`.
pub fn row_belongs_to_table(table: &TableName, row_key: &[u8]) -> bool {
    let prefix = format!("{table},");
    row_key.starts_with(prefix.as_bytes())
}

/// A catalog region plus the address of the server currently hosting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRegionRef {
    pub region: RegionDescriptor,
    pub server: String,
}

/// Decoded catalog row for one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRow {
    pub info: RegionDescriptor,
    pub server: Option<String>,
    pub start_code: Option<u64>,
    pub split_a: Option<RegionDescriptor>,
    pub split_b: Option<RegionDescriptor>,
    pub split_a_checked: bool,
    pub split_b_checked: bool,
}

/// Result of decoding one scanned row. Rows whose `info:regioninfo` cell is
/// missing or undecodable are surfaced as `Empty` so scans can garbage-collect
/// them instead of aborting.
#[derive(Debug, Clone)]
pub enum RowContent {
    Region(Box<RegionRow>),
    Empty,
}

/// Decode a raw cell map into a `RowContent`.
pub fn decode_row(cells: &RowCells) -> RowContent {
    let info = match cells.get(COL_REGIONINFO) {
        Some(raw) => match serde_json::from_slice::<RegionDescriptor>(raw) {
            Ok(info) => info,
            Err(_) => return RowContent::Empty,
        },
        None => return RowContent::Empty,
    };

    let server = cells
        .get(COL_SERVER)
        .and_then(|v| std::str::from_utf8(v).ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let start_code = cells
        .get(COL_STARTCODE)
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.parse::<u64>().ok());
    let split_a = cells
        .get(COL_SPLIT_A)
        .and_then(|raw| serde_json::from_slice::<RegionDescriptor>(raw).ok());
    let split_b = cells
        .get(COL_SPLIT_B)
        .and_then(|raw| serde_json::from_slice::<RegionDescriptor>(raw).ok());

    RowContent::Region(Box::new(RegionRow {
        info,
        server,
        start_code,
        split_a,
        split_b,
        split_a_checked: cell_is_true(cells, COL_SPLIT_A_CHECKED),
        split_b_checked: cell_is_true(cells, COL_SPLIT_B_CHECKED),
    }))
}

fn cell_is_true(cells: &RowCells, col: &str) -> bool {
    cells
        .get(col)
        .map(|v| v.as_ref() == b"true")
        .unwrap_or(false)
}

/// Serialize a descriptor into its `info:regioninfo` cell payload.
pub fn encode_region_info(info: &RegionDescriptor) -> Bytes {
    Bytes::from(serde_json::to_vec(info).expect("region descriptor serializes"))
}

/// Cells for a freshly created region row: descriptor only, no assignment.
pub fn new_region_cells(info: &RegionDescriptor) -> RowCells {
    let mut cells = RowCells::new();
    cells.insert(COL_REGIONINFO.to_string(), encode_region_info(info));
    cells
}

/// Cells recording an assignment: server address plus process start code.
pub fn assignment_cells(server: &str, start_code: u64) -> Vec<(String, Bytes)> {
    vec![
        (COL_SERVER.to_string(), Bytes::from(server.to_string())),
        (
            COL_STARTCODE.to_string(),
            Bytes::from(start_code.to_string()),
        ),
    ]
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Printable rendering of a row key for log output.
pub fn key_display(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}
