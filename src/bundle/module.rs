use std::collections::BTreeMap;

use camino::Utf8PathBuf;

/// One resolved module of the dependency graph, after source transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub id: String,
    pub file: Utf8PathBuf,
    pub source: String,
    /// Specifier as written in the source, mapped to the id it resolved to.
    /// `None` marks external and ignored dependencies.
    pub deps: BTreeMap<String, Option<String>>,
    pub entry: bool,
}

impl ModuleRecord {
    pub fn new(
        id: impl Into<String>,
        file: impl Into<Utf8PathBuf>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            file: file.into(),
            source: source.into(),
            deps: BTreeMap::new(),
            entry: false,
        }
    }

    pub fn with_dep(mut self, specifier: impl Into<String>, id: Option<&str>) -> Self {
        self.deps.insert(specifier.into(), id.map(str::to_string));
        self
    }

    pub fn as_entry(mut self) -> Self {
        self.entry = true;
        self
    }

    /// Byte length of the source.
    pub fn size(&self) -> usize {
        self.source.len()
    }

    /// Ids of the bundled dependencies, in specifier order.
    pub fn dep_ids(&self) -> impl Iterator<Item = &str> {
        self.deps.values().filter_map(|id| id.as_deref())
    }

    /// Human-readable label used for entry points, the file stem.
    pub fn label(&self) -> &str {
        self.file.file_stem().unwrap_or(self.file.as_str())
    }
}
