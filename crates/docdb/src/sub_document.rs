use crate::primitive_value::PrimitiveValue;
use std::fmt;

/// A document or a part of one, as seen by a read.
#[derive(Debug, Clone, PartialEq)]
pub enum SubDocument {
    Primitive(PrimitiveValue),
    /// Children in key order.
    Object(Vec<(PrimitiveValue, SubDocument)>),
}

impl SubDocument {
    pub fn empty_object() -> Self {
        SubDocument::Object(Vec::new())
    }

    pub fn is_object(&self) -> bool {
        matches!(self, SubDocument::Object(_))
    }

    pub fn as_primitive(&self) -> Option<&PrimitiveValue> {
        match self {
            SubDocument::Primitive(value) => Some(value),
            SubDocument::Object(_) => None,
        }
    }

    pub fn children(&self) -> &[(PrimitiveValue, SubDocument)] {
        match self {
            SubDocument::Object(children) => children,
            SubDocument::Primitive(_) => &[],
        }
    }

    pub fn get(&self, subkey: &PrimitiveValue) -> Option<&SubDocument> {
        self.children()
            .iter()
            .find(|(key, _)| key == subkey)
            .map(|(_, child)| child)
    }

    /// Descend along `path`.
    pub fn get_path(&self, path: &[PrimitiveValue]) -> Option<&SubDocument> {
        path.iter()
            .try_fold(self, |node, subkey| node.get(subkey))
    }

    /// Number of primitive leaves.
    pub fn leaf_count(&self) -> usize {
        match self {
            SubDocument::Primitive(_) => 1,
            SubDocument::Object(children) => {
                children.iter().map(|(_, child)| child.leaf_count()).sum()
            }
        }
    }
}

impl From<PrimitiveValue> for SubDocument {
    fn from(value: PrimitiveValue) -> Self {
        SubDocument::Primitive(value)
    }
}

impl fmt::Display for SubDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubDocument::Primitive(value) => write!(f, "{}", value),
            SubDocument::Object(children) => {
                write!(f, "{{")?;
                for (i, (key, child)) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, child)?;
                }
                write!(f, "}}")
            }
        }
    }
}
