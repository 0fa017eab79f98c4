//! Pre-tag allow-list

/// Allow-list over the tag attached to each record. An empty list accepts
/// every tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    table: Vec<u16>,
}

impl TagFilter {
    pub fn new(tags: impl IntoIterator<Item = u16>) -> Self {
        Self {
            table: tags.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn accepts(&self, tag: u16) -> bool {
        self.table.is_empty() || self.table.contains(&tag)
    }
}
