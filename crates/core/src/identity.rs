use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Placeholder used when an object id normalizes to nothing.
pub const UNKNOWN_GAME: &str = "Unknown_Game";

/// Storefront a game was registered from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shop {
    #[default]
    Steam,
    Gog,
    Epic,
    Custom,
    Unknown,
}

impl Shop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Shop::Steam => "steam",
            Shop::Gog => "gog",
            Shop::Epic => "epic",
            Shop::Custom => "custom",
            Shop::Unknown => "unknown",
        }
    }

    /// Lenient parse; anything unrecognised maps to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "steam" => Shop::Steam,
            "gog" => Shop::Gog,
            "epic" => Shop::Epic,
            "custom" => Shop::Custom,
            _ => Shop::Unknown,
        }
    }
}

impl fmt::Display for Shop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static ILLEGAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).expect("valid regex"));
static WHITESPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static UNDERSCORE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").expect("valid regex"));

/// Make an object id safe to use as a file or cloud folder name.
///
/// Illegal characters become `_`, whitespace runs collapse to a single `_`,
/// repeated underscores are merged and leading/trailing ones dropped. An
/// empty result is replaced with [`UNKNOWN_GAME`].
pub fn normalize_object_id(object_id: &str) -> String {
    let replaced = ILLEGAL_CHARS.replace_all(object_id, "_");
    let replaced = WHITESPACE_RUNS.replace_all(&replaced, "_");
    let replaced = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    let trimmed = replaced.trim_matches('_').trim();

    if trimmed.is_empty() {
        UNKNOWN_GAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// `(shop, objectId)` pair that every backup operation is addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameKey {
    pub shop: Shop,
    pub object_id: String,
}

impl GameKey {
    pub fn new(shop: Shop, object_id: impl Into<String>) -> Self {
        Self {
            shop,
            object_id: object_id.into(),
        }
    }

    pub fn normalized_id(&self) -> String {
        normalize_object_id(&self.object_id)
    }

    /// Canonical folder name, `{shop}-{normalizedObjectId}`.
    pub fn folder_name(&self) -> String {
        format!("{}-{}", self.shop, self.normalized_id())
    }

    /// Folder name used before normalization was introduced.
    pub fn legacy_folder_name(&self) -> String {
        format!("{}-{}", self.shop, self.object_id)
    }

    /// Folder names to search, canonical first. The legacy name is only
    /// included when it differs.
    pub fn candidate_folder_names(&self) -> Vec<String> {
        let canonical = self.folder_name();
        let legacy = self.legacy_folder_name();
        if canonical == legacy {
            vec![canonical]
        } else {
            vec![canonical, legacy]
        }
    }
}

impl fmt::Display for GameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shop, self.object_id)
    }
}
