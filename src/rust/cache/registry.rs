use std::collections::HashMap;
use std::fmt;

use log::{info, warn};

/// User-facing identity of a class.
///
/// A placeholder is its own variant so it can never be mistaken for a real
/// name that happens to look like one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClassName {
    /// Name supplied by the project's class list
    Known(String),
    /// No name was available when the id was first seen
    Synthesized(u32),
}

impl ClassName {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(name) => f.write_str(name),
            Self::Synthesized(id) => write!(f, "unknown_{}", id),
        }
    }
}

/// Bidirectional class id ↔ name map that remembers first-seen order.
///
/// Purely additive: once an id is bound to a name the pair never changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassIdentityRegistry {
    order: Vec<u32>,
    names: HashMap<u32, ClassName>,
    ids: HashMap<ClassName, u32>,
}

impl ClassIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `class_id` if unseen and returns its name.
    ///
    /// A new id takes `known_names[class_id]` when present. When that name is
    /// already bound to a different id the new id falls back to a synthesized
    /// name, keeping the map bijective.
    pub fn register(&mut self, class_id: u32, known_names: &[String]) -> ClassName {
        if let Some(name) = self.names.get(&class_id) {
            return name.clone();
        }

        let name = match known_names.get(class_id as usize) {
            Some(known) if !self.ids.contains_key(&ClassName::Known(known.clone())) => {
                ClassName::Known(known.clone())
            }
            Some(known) => {
                warn!(
                    "Class name '{}' is already bound to class {:?}, using a placeholder for class {}",
                    known,
                    self.ids.get(&ClassName::Known(known.clone())),
                    class_id
                );
                ClassName::Synthesized(class_id)
            }
            None => ClassName::Synthesized(class_id),
        };

        info!("Registered class {} as '{}'", class_id, name);
        self.order.push(class_id);
        self.names.insert(class_id, name.clone());
        self.ids.insert(name.clone(), class_id);
        name
    }

    /// Registers every id yielded, in order; returns how many were new
    pub fn register_all(&mut self, class_ids: impl IntoIterator<Item = u32>, known_names: &[String]) -> usize {
        let before = self.len();
        for class_id in class_ids {
            self.register(class_id, known_names);
        }
        self.len() - before
    }

    /// Ids in first-seen sequence
    pub fn order(&self) -> &[u32] {
        &self.order
    }

    pub fn name_of(&self, class_id: u32) -> Option<&ClassName> {
        self.names.get(&class_id)
    }

    pub fn id_of(&self, name: &ClassName) -> Option<u32> {
        self.ids.get(name).copied()
    }

    pub fn contains(&self, class_id: u32) -> bool {
        self.names.contains_key(&class_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of entries in the reverse map, used by the consistency checks
    pub(crate) fn reverse_len(&self) -> usize {
        self.ids.len()
    }

    /// `(id, name)` pairs in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &ClassName)> + '_ {
        self.order.iter().filter_map(move |id| self.names.get(id).map(|name| (*id, name)))
    }
}
