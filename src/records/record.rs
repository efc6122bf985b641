//! Flat record shape.
//!
//! A record holds an instance's plain fields inline and every graph edge as a
//! `(tag, id)` pair. Edges are positional: one reference slot per reference
//! property and one list per association property, in descriptor order.

use crate::catalog::TypeDescriptor;
use crate::error::{Result, StoreError};
use crate::tracked::Trackable;
use crate::types::{ObjectId, ObjectKey, PropertyKind, PropertyValue, TypeTag, Value};
use serde::{Deserialize, Serialize};

/// Pointer from one record to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub tag: TypeTag,
    pub id: ObjectId,
}

impl Edge {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.tag, self.id)
    }
}

impl From<ObjectKey> for Edge {
    fn from(key: ObjectKey) -> Self {
        Edge {
            tag: key.tag,
            id: key.id,
        }
    }
}

/// One persisted instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub tag: TypeTag,
    pub id: ObjectId,
    pub fields: Vec<(String, Value)>,
    pub references: Vec<Option<Edge>>,
    pub associations: Vec<Vec<Edge>>,
}

impl StoredRecord {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.tag, self.id)
    }

    /// Flatten `obj` into a record. `tag_of` supplies the tag of every
    /// referenced instance.
    pub fn capture(
        key: ObjectKey,
        descriptor: &TypeDescriptor,
        obj: &dyn Trackable,
        tag_of: impl Fn(ObjectId) -> Result<TypeTag>,
    ) -> Result<Self> {
        let mut record = StoredRecord {
            tag: key.tag,
            id: key.id,
            fields: Vec::new(),
            references: Vec::new(),
            associations: Vec::new(),
        };

        for property in descriptor.properties() {
            match property.kind() {
                PropertyKind::Plain => {
                    record
                        .fields
                        .push((property.name().to_string(), property.plain_value(obj)?));
                }
                PropertyKind::Reference => {
                    let edge = match property.reference_value(obj)? {
                        Some(id) => Some(Edge { tag: tag_of(id)?, id }),
                        None => None,
                    };
                    record.references.push(edge);
                }
                PropertyKind::Association => {
                    let edges = property
                        .association_value(obj)?
                        .iter()
                        .map(|&id| tag_of(id).map(|tag| Edge { tag, id }))
                        .collect::<Result<Vec<_>>>()?;
                    record.associations.push(edges);
                }
            }
        }

        Ok(record)
    }

    /// Write this record's values into a blank instance.
    pub fn restore(&self, descriptor: &TypeDescriptor, obj: &mut dyn Trackable) -> Result<()> {
        let references: Vec<_> = descriptor.of_kind(PropertyKind::Reference).collect();
        let associations: Vec<_> = descriptor.of_kind(PropertyKind::Association).collect();
        if references.len() != self.references.len()
            || associations.len() != self.associations.len()
        {
            return Err(StoreError::Corruption(format!(
                "record {} has {} reference and {} association slots, {} expects {} and {}",
                self.key(),
                self.references.len(),
                self.associations.len(),
                descriptor.type_name(),
                references.len(),
                associations.len()
            )));
        }

        for (name, value) in &self.fields {
            match descriptor.property(name) {
                Some(property) => property.set(obj, PropertyValue::Plain(value.clone()))?,
                None => {
                    tracing::debug!(record = %self.key(), field = %name, "ignoring unknown field")
                }
            }
        }

        for (property, edge) in references.into_iter().zip(&self.references) {
            let target = edge.map(|e| e.id);
            property.set(obj, PropertyValue::Reference(target))?;
        }

        for (property, edges) in associations.into_iter().zip(&self.associations) {
            let items = edges.iter().map(|e| e.id).collect();
            property.set(obj, PropertyValue::Association(items))?;
        }

        Ok(())
    }

    /// Every outgoing edge, references first.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.references
            .iter()
            .flatten()
            .chain(self.associations.iter().flatten())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::Node;
    use crate::tracked::Entity;

    fn capture(node: &Node) -> StoredRecord {
        let descriptor = TypeDescriptor::of::<Node>();
        StoredRecord::capture(
            ObjectKey::new(TypeTag(1), node.id),
            &descriptor,
            node,
            |_| Ok(TypeTag(1)),
        )
        .unwrap()
    }

    #[test]
    fn test_capture_layout() {
        let mut node = Node::new("root");
        node.weight = 4;
        node.scratch = 99;
        node.next = Some(ObjectId::from_u128(1));
        node.children = vec![ObjectId::from_u128(2), ObjectId::from_u128(3)];

        let record = capture(&node);
        assert_eq!(
            record.fields,
            vec![
                ("label".to_string(), Value::Text("root".into())),
                ("weight".to_string(), Value::Int(4)),
            ]
        );
        assert_eq!(record.references.len(), 1);
        assert_eq!(record.associations[0].len(), 2);
        assert_eq!(record.edges().count(), 3);
    }

    #[test]
    fn test_restore_into_blank_instance() {
        let mut node = Node::new("root");
        node.weight = 4;
        node.next = Some(ObjectId::from_u128(1));
        node.children = vec![ObjectId::from_u128(2), ObjectId::from_u128(3)];
        let record = StoredRecord::decode(&capture(&node).encode().unwrap()).unwrap();

        let descriptor = TypeDescriptor::of::<Node>();
        let mut blank = Node::with_id(node.id);
        record.restore(&descriptor, &mut blank).unwrap();

        assert_eq!(blank.label, "root");
        assert_eq!(blank.weight, 4);
        assert_eq!(blank.next, node.next);
        assert_eq!(blank.children, node.children);
        assert_eq!(blank.scratch, 0);
    }

    #[test]
    fn test_restore_rejects_shape_mismatch() {
        let node = Node::new("root");
        let mut record = capture(&node);
        record.references.push(None);

        let descriptor = TypeDescriptor::of::<Node>();
        let mut blank = Node::with_id(node.id);
        assert!(matches!(
            record.restore(&descriptor, &mut blank),
            Err(StoreError::Corruption(_))
        ));
    }
}
