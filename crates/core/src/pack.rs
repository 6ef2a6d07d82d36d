//! Packs and the inventory they are loaded from.

use serde::{Deserialize, Serialize};

use crate::id::{ItemId, PackId};

/// Display order given to packs that do not specify one.
pub const DEFAULT_ORDER: u32 = 999;

/// A named unit of work made of several items, shown as one progress bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pack {
    /// Stable key
    pub id: PackId,

    /// Name the backend uses for this pack in status queries and commands
    pub name: String,

    /// Human readable title
    #[serde(default)]
    pub title: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Display order (ascending)
    #[serde(default = "default_order")]
    pub order: u32,

    /// Member items, in inventory order
    #[serde(default)]
    pub items: Vec<ItemId>,
}

fn default_order() -> u32 {
    DEFAULT_ORDER
}

impl Pack {
    /// Create a pack whose backend name equals its id.
    pub fn new(id: impl Into<String>, items: impl IntoIterator<Item = impl Into<ItemId>>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            title: id.clone(),
            id: PackId::new(id),
            description: String::new(),
            order: DEFAULT_ORDER,
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    /// Set the backend name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the display order.
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Number of items, never below 1 so it can be used as a denominator.
    pub fn item_total(&self) -> u32 {
        u32::try_from(self.items.len()).unwrap_or(u32::MAX).max(1)
    }

    /// Whether `item` belongs to this pack.
    pub fn contains(&self, item: &ItemId) -> bool {
        self.items.iter().any(|i| i == item)
    }
}

/// All packs known for the session, sorted by display order.
///
/// Immutable once loaded; a reload replaces the whole inventory.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    packs: Vec<Pack>,
}

impl Inventory {
    /// Build an inventory. Later duplicates of an id are dropped.
    pub fn new(packs: impl IntoIterator<Item = Pack>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut packs: Vec<Pack> = packs
            .into_iter()
            .filter(|p| seen.insert(p.id.clone()))
            .collect();
        packs.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        Self { packs }
    }

    /// Look a pack up by id.
    pub fn get(&self, id: &PackId) -> Option<&Pack> {
        self.packs.iter().find(|p| &p.id == id)
    }

    /// Look a pack up by its backend name.
    pub fn find_by_name(&self, name: &str) -> Option<&Pack> {
        self.packs.iter().find(|p| p.name == name)
    }

    /// Packs that list `item` as a member.
    pub fn packs_containing<'a>(&'a self, item: &'a ItemId) -> impl Iterator<Item = &'a Pack> + 'a {
        self.packs.iter().filter(move |p| p.contains(item))
    }

    /// Iterate in display order.
    pub fn iter(&self) -> impl Iterator<Item = &Pack> {
        self.packs.iter()
    }

    /// Number of packs.
    pub fn len(&self) -> usize {
        self.packs.len()
    }

    /// Whether no packs are loaded.
    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}
