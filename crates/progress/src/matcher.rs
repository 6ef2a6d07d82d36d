//! Associates transfer feed entries with the items of a pack.
//!
//! The feed does not reliably carry item ids, so entries are matched in
//! three tiers, each only tried for entries the previous tiers left over:
//!
//! 1. the entry's identifier equals an item id;
//! 2. an item id is a substring of the entry's filename, then of its URI;
//! 3. an item id is a substring of any string-valued field of the entry.
//!
//! Each item is claimed at most once. Entries are considered in feed
//! order, and within an entry, items in pack order.

use std::collections::HashSet;

use packsync_core::{ItemId, TransferState};

/// How an entry was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    /// Identifier equals the item id
    Exact,
    /// Item id found in filename or URI
    NameOrUri,
    /// Item id found in some other string field
    AnyField,
}

/// One matched feed entry.
#[derive(Debug, Clone, Copy)]
pub struct TransferMatch<'a> {
    /// Claimed item
    pub item: &'a ItemId,
    /// Feed entry
    pub state: &'a TransferState,
    /// Tier that produced the match
    pub tier: MatchTier,
}

/// Match feed entries to `items`.
pub fn match_transfers<'a>(items: &'a [ItemId], states: &'a [TransferState]) -> Vec<TransferMatch<'a>> {
    let mut matches = Vec::new();
    let mut claimed: HashSet<&ItemId> = HashSet::new();
    let mut consumed = vec![false; states.len()];

    for (idx, state) in states.iter().enumerate() {
        let Some(identifier) = state.identifier.as_deref() else {
            continue;
        };
        if let Some(item) = items
            .iter()
            .find(|item| !item.is_empty() && item.as_str() == identifier)
        {
            // A duplicate entry for an already claimed item is spent too.
            consumed[idx] = true;
            if claimed.insert(item) {
                matches.push(TransferMatch {
                    item,
                    state,
                    tier: MatchTier::Exact,
                });
            }
        }
    }

    for (idx, state) in states.iter().enumerate() {
        if consumed[idx] {
            continue;
        }

        let by_name = [state.filename.as_deref(), state.uri.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|field| {
                items
                    .iter()
                    .find(|item| is_free(&claimed, item) && field.contains(item.as_str()))
            });

        let (item, tier) = match by_name {
            Some(item) => (item, MatchTier::NameOrUri),
            None => {
                let any = items.iter().find(|item| {
                    is_free(&claimed, item) && state.string_fields().any(|f| f.contains(item.as_str()))
                });
                match any {
                    Some(item) => (item, MatchTier::AnyField),
                    None => continue,
                }
            }
        };

        claimed.insert(item);
        matches.push(TransferMatch { item, state, tier });
    }

    matches
}

fn is_free(claimed: &HashSet<&ItemId>, item: &ItemId) -> bool {
    !item.is_empty() && !claimed.contains(item)
}
