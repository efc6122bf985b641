//! Per-instance change state and change log.

use crate::tracked::ListEdit;
use crate::types::{ObjectId, PropertyKind, PropertyValue};
use std::fmt;

/// Tracking state of one instance within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ChangeState {
    /// Not tracked by any session.
    #[default]
    Unattached,
    /// Attached and not yet persisted.
    New,
    /// Attached, persisted, no recorded changes.
    Unchanged,
    /// Attached, persisted, with recorded changes.
    Changed,
    /// Attached and marked for removal on commit.
    Deleted,
}

impl ChangeState {
    pub fn is_attached(self) -> bool {
        self != ChangeState::Unattached
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeState::Unattached => "unattached",
            ChangeState::New => "new",
            ChangeState::Unchanged => "unchanged",
            ChangeState::Changed => "changed",
            ChangeState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Old and new value of one property.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    /// Value at attach time.
    pub old: PropertyValue,
    /// Latest value.
    pub new: PropertyValue,
}

/// How an association list was edited.
#[derive(Clone, Debug, PartialEq)]
pub enum EditOp {
    /// In-place insert, remove or move.
    List(ListEdit),
    /// The whole list was assigned.
    Replace {
        old: Vec<ObjectId>,
        new: Vec<ObjectId>,
    },
}

/// One entry of the association journal.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionEdit {
    pub property: &'static str,
    pub op: EditOp,
}

/// Ordered record of what happened to an instance since attach.
///
/// Property changes are first-write-wins on `old`; association edits are kept
/// as an ordered journal so they can be undone back to front.
#[derive(Clone, Debug, Default)]
pub struct ChangeLog {
    changes: Vec<(&'static str, Change)>,
    edits: Vec<CollectionEdit>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an assignment. Keeps the first `old`, always takes the latest
    /// `new`. Assignments to association properties also enter the journal.
    pub fn record(&mut self, property: &'static str, old: PropertyValue, new: PropertyValue) {
        if let (PropertyValue::Association(before), PropertyValue::Association(after)) =
            (&old, &new)
        {
            self.edits.push(CollectionEdit {
                property,
                op: EditOp::Replace {
                    old: before.clone(),
                    new: after.clone(),
                },
            });
        }

        match self.changes.iter_mut().find(|(name, _)| *name == property) {
            Some((_, change)) => change.new = new,
            None => self.changes.push((property, Change { old, new })),
        }
    }

    /// Record an in-place association edit.
    pub fn record_edit(&mut self, property: &'static str, edit: ListEdit) {
        self.edits.push(CollectionEdit {
            property,
            op: EditOp::List(edit),
        });
    }

    /// Whether the instance's own row is dirty. Association edits do not count.
    pub fn has_changes(&self) -> bool {
        self.changes
            .iter()
            .any(|(_, change)| change.old.kind() != PropertyKind::Association)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.edits.is_empty()
    }

    pub fn get(&self, property: &str) -> Option<&Change> {
        self.changes
            .iter()
            .find(|(name, _)| *name == property)
            .map(|(_, change)| change)
    }

    /// Recorded property changes in first-write order.
    pub fn changes(&self) -> impl Iterator<Item = (&'static str, &Change)> + '_ {
        self.changes.iter().map(|(name, change)| (*name, change))
    }

    /// Association journal in the order the edits happened.
    pub fn edits(&self) -> &[CollectionEdit] {
        &self.edits
    }

    /// Items that entered `property` since attach and are still there.
    pub fn inserted_items(&self, property: &str) -> Vec<ObjectId> {
        self.net_diff(property).0
    }

    /// Items that left `property` since attach and did not come back.
    pub fn removed_items(&self, property: &str) -> Vec<ObjectId> {
        self.net_diff(property).1
    }

    fn net_diff(&self, property: &str) -> (Vec<ObjectId>, Vec<ObjectId>) {
        let mut inserted: Vec<ObjectId> = Vec::new();
        let mut removed: Vec<ObjectId> = Vec::new();

        for edit in self.edits.iter().filter(|e| e.property == property) {
            match &edit.op {
                EditOp::List(ListEdit::Insert { item, .. }) => {
                    shift(*item, &mut removed, &mut inserted)
                }
                EditOp::List(ListEdit::Remove { item, .. }) => {
                    shift(*item, &mut inserted, &mut removed)
                }
                EditOp::List(ListEdit::Move { .. }) => {}
                EditOp::Replace { old, new } => {
                    for item in old {
                        shift(*item, &mut inserted, &mut removed);
                    }
                    for item in new {
                        shift(*item, &mut removed, &mut inserted);
                    }
                }
            }
        }

        (inserted, removed)
    }
}

/// Cancel `item` out of `from` if present, otherwise note it in `to`.
fn shift(item: ObjectId, from: &mut Vec<ObjectId>, to: &mut Vec<ObjectId>) {
    match from.iter().position(|x| *x == item) {
        Some(i) => {
            from.remove(i);
        }
        None => to.push(item),
    }
}
