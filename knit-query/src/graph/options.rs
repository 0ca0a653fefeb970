//! Switches controlling graph upserts.

use knit_schema::config::UpsertConfig;
use smol_str::SmolStr;

/// A switch that is off, on, or on for some relation paths.
///
/// Paths are relation names from the root joined by `.`, e.g. `"pets"` or
/// `"movies.actors"`. Roots have the empty path and only match [`Toggle::On`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Toggle {
    /// Disabled everywhere.
    #[default]
    Off,
    /// Enabled everywhere.
    On,
    /// Enabled for the listed relation paths only.
    Paths(Vec<SmolStr>),
}

impl Toggle {
    /// Enable for the given relation paths.
    pub fn paths(paths: impl IntoIterator<Item = impl Into<SmolStr>>) -> Self {
        Self::Paths(paths.into_iter().map(Into::into).collect())
    }

    /// Whether the switch applies at `path`.
    pub fn enabled_for(&self, path: &str) -> bool {
        match self {
            Self::Off => false,
            Self::On => true,
            Self::Paths(paths) => !path.is_empty() && paths.iter().any(|p| p == path),
        }
    }

    /// Whether the switch is on anywhere.
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Off => false,
            Self::On => true,
            Self::Paths(paths) => !paths.is_empty(),
        }
    }
}

impl From<bool> for Toggle {
    fn from(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }
}

impl<const N: usize> From<[&str; N]> for Toggle {
    fn from(paths: [&str; N]) -> Self {
        Self::paths(paths)
    }
}

impl From<Vec<String>> for Toggle {
    fn from(paths: Vec<String>) -> Self {
        Self::paths(paths)
    }
}

/// Options of a graph upsert.
///
/// ```rust
/// use knit_query::graph::options::{Toggle, UpsertOptions};
///
/// let options = UpsertOptions::new().relate(["movies"]).no_delete(true);
/// assert!(options.relate.enabled_for("movies"));
/// assert!(!options.relate.enabled_for("pets"));
/// assert!(options.no_delete.enabled_for("pets"));
/// assert_eq!(options.insert_missing, Toggle::On);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Relate rows with an unknown primary key instead of inserting them.
    pub relate: Toggle,
    /// Unrelate missing rows instead of deleting them.
    pub unrelate: Toggle,
    /// Insert rows with an unknown primary key.
    pub insert_missing: Toggle,
    /// Leave missing rows alone.
    pub no_delete: Toggle,
    /// Skip new rows.
    pub no_insert: Toggle,
    /// Skip changed rows.
    pub no_update: Toggle,
    /// Substitute `#ref{..}` templates.
    pub allow_refs: Toggle,
    /// Match keyless rows to persisted rows at the same position.
    pub match_by_position: Toggle,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            relate: Toggle::Off,
            unrelate: Toggle::Off,
            insert_missing: Toggle::On,
            no_delete: Toggle::Off,
            no_insert: Toggle::Off,
            no_update: Toggle::Off,
            allow_refs: Toggle::Off,
            match_by_position: Toggle::Off,
        }
    }
}

impl From<&UpsertConfig> for UpsertOptions {
    fn from(config: &UpsertConfig) -> Self {
        Self {
            relate: config.relate.into(),
            unrelate: config.unrelate.into(),
            insert_missing: config.insert_missing.into(),
            no_delete: config.no_delete.into(),
            no_insert: config.no_insert.into(),
            no_update: config.no_update.into(),
            allow_refs: config.allow_refs.into(),
            match_by_position: config.match_by_position.into(),
        }
    }
}

impl UpsertOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options of an insert-graph run: everything is inserted and templates
    /// are always substituted.
    pub fn insert_graph() -> Self {
        Self {
            allow_refs: Toggle::On,
            ..Self::default()
        }
    }

    /// Set `relate`.
    pub fn relate(mut self, toggle: impl Into<Toggle>) -> Self {
        self.relate = toggle.into();
        self
    }

    /// Set `unrelate`.
    pub fn unrelate(mut self, toggle: impl Into<Toggle>) -> Self {
        self.unrelate = toggle.into();
        self
    }

    /// Set `insert_missing`.
    pub fn insert_missing(mut self, toggle: impl Into<Toggle>) -> Self {
        self.insert_missing = toggle.into();
        self
    }

    /// Set `no_delete`.
    pub fn no_delete(mut self, toggle: impl Into<Toggle>) -> Self {
        self.no_delete = toggle.into();
        self
    }

    /// Set `no_insert`.
    pub fn no_insert(mut self, toggle: impl Into<Toggle>) -> Self {
        self.no_insert = toggle.into();
        self
    }

    /// Set `no_update`.
    pub fn no_update(mut self, toggle: impl Into<Toggle>) -> Self {
        self.no_update = toggle.into();
        self
    }

    /// Set `allow_refs`.
    pub fn allow_refs(mut self, toggle: impl Into<Toggle>) -> Self {
        self.allow_refs = toggle.into();
        self
    }

    /// Set `match_by_position`.
    pub fn match_by_position(mut self, toggle: impl Into<Toggle>) -> Self {
        self.match_by_position = toggle.into();
        self
    }
}
