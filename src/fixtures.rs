//! Small entity types shared by the unit tests.

use crate::catalog::Property;
use crate::error::Result;
use crate::tracked::Entity;
use crate::types::{ObjectId, PlainValue, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: ObjectId,
    pub label: String,
    pub weight: i64,
    pub next: Option<ObjectId>,
    pub children: Vec<ObjectId>,
    pub scratch: i64,
}

impl Node {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Self::with_id(ObjectId::new())
        }
    }
}

impl Entity for Node {
    const TYPE_NAME: &'static str = "fixtures.Node";

    fn id(&self) -> ObjectId {
        self.id
    }

    fn with_id(id: ObjectId) -> Self {
        Self {
            id,
            label: String::new(),
            weight: 0,
            next: None,
            children: Vec::new(),
            scratch: 0,
        }
    }

    fn properties() -> Vec<Property<Self>> {
        vec![
            Property::plain(
                "label",
                |n: &Node| n.label.clone().into_value(),
                |n: &mut Node, v: Value| -> Result<()> {
                    n.label = String::from_value(v)?;
                    Ok(())
                },
            ),
            Property::plain(
                "weight",
                |n: &Node| n.weight.into_value(),
                |n: &mut Node, v: Value| -> Result<()> {
                    n.weight = i64::from_value(v)?;
                    Ok(())
                },
            ),
            Property::reference("next", |n: &Node| n.next, |n: &mut Node, v| n.next = v),
            Property::association(
                "children",
                |n: &Node| &n.children,
                |n: &mut Node| &mut n.children,
            ),
            Property::plain(
                "scratch",
                |n: &Node| n.scratch.into_value(),
                |n: &mut Node, v: Value| -> Result<()> {
                    n.scratch = i64::from_value(v)?;
                    Ok(())
                },
            )
            .untracked(),
        ]
    }
}

/// Not updatable: always persisted through `add`.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub id: ObjectId,
    pub value: i64,
}

impl Leaf {
    pub fn new(value: i64) -> Self {
        Self {
            id: ObjectId::new(),
            value,
        }
    }
}

impl Entity for Leaf {
    const TYPE_NAME: &'static str = "fixtures.Leaf";
    const UPDATABLE: bool = false;

    fn id(&self) -> ObjectId {
        self.id
    }

    fn with_id(id: ObjectId) -> Self {
        Self { id, value: 0 }
    }

    fn properties() -> Vec<Property<Self>> {
        vec![Property::plain(
            "value",
            |l: &Leaf| l.value.into_value(),
            |l: &mut Leaf, v: Value| -> Result<()> {
                l.value = i64::from_value(v)?;
                Ok(())
            },
        )]
    }
}

pub fn registry() -> crate::registry::TypeRegistry {
    crate::registry::TypeRegistry::builder()
        .register::<Node>(1)
        .register::<Leaf>(2)
        .build()
        .expect("fixture registry is valid")
}
