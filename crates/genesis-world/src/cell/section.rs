//! Vertical 16×16×16 slice of a cell.

use genesis_common::{ContentId, SECTION_VOLUME};

/// A cell section. Storage is allocated on the first non-empty write.
#[derive(Debug, Clone, Default)]
pub struct Section {
    blocks: Option<Box<[ContentId]>>,
    non_empty: u16,
}

impl Section {
    /// Creates an unmaterialized section.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            blocks: None,
            non_empty: 0,
        }
    }

    /// Whether backing storage has been allocated.
    #[must_use]
    pub const fn is_materialized(&self) -> bool {
        self.blocks.is_some()
    }

    /// Whether every block is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.non_empty == 0
    }

    /// Number of non-empty blocks.
    #[must_use]
    pub const fn non_empty_count(&self) -> u16 {
        self.non_empty
    }

    /// Content at a section index (see `BlockPos::section_index`).
    #[must_use]
    pub fn get(&self, index: usize) -> ContentId {
        self.blocks
            .as_ref()
            .and_then(|blocks| blocks.get(index).copied())
            .unwrap_or(ContentId::EMPTY)
    }

    /// Writes content at a section index and returns the previous value.
    pub fn set(&mut self, index: usize, content: ContentId) -> ContentId {
        if index >= SECTION_VOLUME {
            return ContentId::EMPTY;
        }
        if self.blocks.is_none() {
            if content.is_empty() {
                return ContentId::EMPTY;
            }
            self.blocks = Some(vec![ContentId::EMPTY; SECTION_VOLUME].into_boxed_slice());
        }
        let Some(blocks) = self.blocks.as_mut() else {
            return ContentId::EMPTY;
        };
        let old = std::mem::replace(&mut blocks[index], content);
        match (old.is_empty(), content.is_empty()) {
            (true, false) => self.non_empty += 1,
            (false, true) => self.non_empty -= 1,
            _ => {},
        }
        old
    }

    /// Raw ids for persistence; `None` for an unmaterialized section.
    #[must_use]
    pub fn to_raw(&self) -> Option<Vec<u16>> {
        self.blocks
            .as_ref()
            .filter(|_| self.non_empty > 0)
            .map(|blocks| blocks.iter().map(|c| c.raw()).collect())
    }

    /// Rebuilds a section from [`Section::to_raw`] output.
    pub fn from_raw(raw: Option<Vec<u16>>) -> Result<Self, String> {
        let Some(raw) = raw else {
            return Ok(Self::empty());
        };
        if raw.len() != SECTION_VOLUME {
            return Err(format!(
                "section has {} entries, expected {SECTION_VOLUME}",
                raw.len()
            ));
        }
        let non_empty = raw.iter().filter(|&&id| id != 0).count() as u16;
        let blocks = raw.into_iter().map(ContentId::new).collect();
        Ok(Self {
            blocks: Some(blocks),
            non_empty,
        })
    }
}
