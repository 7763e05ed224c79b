//! Slot classification: which ports this process should be serving, and how.

use crate::types::{ListenerEntry, ServeMode, Slot, SlotStatus, SlotType, SlotView, SlotsDocument};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Decide how a single slot's port is served.
///
/// Only `index.html` presence is read from disk; everything else is taken
/// from the record.
pub fn classify(slot: &Slot) -> ServeMode {
    match slot.status {
        Some(SlotStatus::Empty) | Some(SlotStatus::Error) => ServeMode::Placeholder,
        Some(SlotStatus::Deployed) => {
            let marked_static = slot.slot_type == Some(SlotType::Static);
            let root_is_site = slot
                .static_root
                .as_deref()
                .is_some_and(has_site_index);
            if marked_static || root_is_site {
                ServeMode::Static {
                    static_root: slot.static_root.clone(),
                    spa: slot.spa_mode.unwrap_or(false),
                }
            } else {
                ServeMode::Unmanaged
            }
        }
        Some(SlotStatus::Stopped) | None => ServeMode::Unmanaged,
    }
}

/// True when `root` is a directory holding an `index.html`.
pub fn has_site_index(root: &Path) -> bool {
    root.is_dir() && root.join("index.html").is_file()
}

/// Listener entries for every managed slot, keyed by port.
///
/// Slots without a port are skipped. When two slots claim the same port the
/// first slot id in sort order keeps it.
pub fn desired_entries(doc: &SlotsDocument) -> BTreeMap<u16, ListenerEntry> {
    let mut desired: BTreeMap<u16, ListenerEntry> = BTreeMap::new();
    for (id, slot) in &doc.slots {
        let mode = classify(slot);
        if !mode.is_managed() {
            continue;
        }
        let Some(port) = slot.port else {
            warn!("Slot {} has no valid port; not serving it", id);
            continue;
        };
        if let Some(existing) = desired.get(&port) {
            warn!(
                "Slot {} claims port {} already taken by slot {}; skipping",
                id, port, existing.slot
            );
            continue;
        }
        desired.insert(
            port,
            ListenerEntry {
                port,
                slot: id.clone(),
                mode,
            },
        );
    }
    desired
}

/// Classification of every slot in the document, in slot id order.
pub fn slot_views(doc: &SlotsDocument) -> Vec<SlotView> {
    doc.slots
        .iter()
        .map(|(id, slot)| SlotView {
            slot: id.clone(),
            port: slot.port,
            status: slot.status,
            mode: classify(slot).name().to_string(),
        })
        .collect()
}
