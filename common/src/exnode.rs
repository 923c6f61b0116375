use crate::ExnodeId;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp format used on the allocation wire form.
pub const LIFETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

mod lifetime_ts {
    use super::LIFETIME_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.format(LIFETIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, LIFETIME_FORMAT).map_err(Error::custom)
    }
}

/// Validity window of one allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
    #[serde(with = "lifetime_ts")]
    pub start: NaiveDateTime,
    #[serde(with = "lifetime_ts")]
    pub end: NaiveDateTime,
}

impl Lifetime {
    /// A lifetime starting now and lasting `duration`.
    pub fn starting_now(duration: std::time::Duration) -> Self {
        let start = Utc::now().naive_utc();
        let end = start + chrono::Duration::seconds(duration.as_secs() as i64);
        Self { start, end }
    }
}

/// The three capability tokens granting access to an allocation. Opaque
/// strings here; the owning driver knows how to validate them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub read: String,
    pub write: String,
    pub manage: String,
}

/// One replica of one extent: a byte range of the logical file held on a
/// single depot.
///
/// `parent` is a non-owning back reference, filled in at assembly time.
/// After the allocation is inserted into the registry it is never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Schema URI identifying the backend wire format. Accepts both the
    /// `$schema` and plain `schema` spellings on input.
    #[serde(rename = "$schema", alias = "schema")]
    pub schema: String,
    /// Backend kind tag. Derived from the driver; absent on some wire
    /// forms, so it defaults to empty and is restored at parse time.
    #[serde(default)]
    pub kind: String,
    /// Access point URI of the depot holding this replica.
    pub location: String,
    /// Absolute byte offset within the logical file.
    pub offset: u64,
    /// Byte length. Always greater than zero.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ExnodeId>,
    pub lifetime: Lifetime,
    pub mapping: Mapping,
}

impl Allocation {
    /// Exclusive end offset of the range this allocation covers.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether `offset` falls inside `[self.offset, self.end())`.
    pub fn covers(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    File,
    Directory,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::File => "file",
            Mode::Directory => "directory",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Mode::File),
            "directory" => Ok(Mode::Directory),
            other => Err(format!("unknown exnode mode: {other}")),
        }
    }
}

/// The logical file manifest. A file exnode owns a multiset of extent
/// allocations covering `[0, size)`; a directory exnode owns children.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Exnode {
    pub id: ExnodeId,
    pub name: String,
    pub size: u64,
    pub parent: Option<ExnodeId>,
    pub mode: Mode,
    /// Microseconds since the Unix epoch.
    pub created: i64,
    pub updated: i64,
    pub owner: String,
    pub group: String,
    /// Octal permission string, e.g. `"644"`.
    pub permission: String,
    #[serde(default)]
    pub extents: Vec<Allocation>,
    #[serde(default)]
    pub children: Vec<ExnodeId>,
}

impl Exnode {
    pub fn file(
        name: impl Into<String>,
        size: u64,
        parent: Option<ExnodeId>,
        permission: impl Into<String>,
    ) -> Self {
        let now = Utc::now().timestamp_micros();
        let owner = current_user();
        Self {
            id: ExnodeId::new(),
            name: name.into(),
            size,
            parent,
            mode: Mode::File,
            created: now,
            updated: now,
            owner: owner.clone(),
            group: owner,
            permission: permission.into(),
            extents: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn directory(name: impl Into<String>, parent: Option<ExnodeId>) -> Self {
        let now = Utc::now().timestamp_micros();
        let owner = current_user();
        Self {
            id: ExnodeId::new(),
            name: name.into(),
            size: 0,
            parent,
            mode: Mode::Directory,
            created: now,
            updated: now,
            owner: owner.clone(),
            group: owner,
            permission: "755".to_string(),
            extents: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// Name of the user running this process, for exnode ownership fields.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
