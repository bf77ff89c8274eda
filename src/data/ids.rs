use crate::core::errors::{Result, XlbError};
use crate::data::model::{DatumId, NULL_ID};

/// Hands out the ids owned by one server.
///
/// Server `index` of `nservers` issues only ids congruent to `index`, so
/// every issued id hashes back to the server that issued it and no two
/// servers can ever produce the same id.
#[derive(Debug)]
pub struct IdAllocator {
    index: DatumId,
    next: DatumId,
    stride: DatumId,
    limit: DatumId,
    issued: u64,
}

impl IdAllocator {
    pub fn new(index: usize, nservers: usize, limit: DatumId) -> Self {
        let stride = nservers as DatumId;
        let mut first = index as DatumId;
        if first == NULL_ID {
            first += stride;
        }
        Self {
            index: index as DatumId,
            next: first,
            stride,
            limit,
            issued: 0,
        }
    }

    /// Next unused id, or a resource error once the id space is spent
    pub fn allocate(&mut self) -> Result<DatumId> {
        if self.next > self.limit {
            return Err(XlbError::resource_exhausted(
                "datum_ids",
                self.issued + 1,
                self.issued,
            ));
        }
        let id = self.next;
        self.next = self.next.saturating_add(self.stride);
        if self.next == id {
            // saturated: make the next call fail
            self.limit = id - 1;
        }
        self.issued += 1;
        Ok(id)
    }

    /// Skip past an id the caller chose explicitly
    pub fn reserve(&mut self, id: DatumId) {
        if id < self.next {
            return;
        }
        // smallest id of this server's residue class above `id`
        let base = id - id.rem_euclid(self.stride) + self.index;
        let candidate = if base > id {
            Some(base)
        } else {
            base.checked_add(self.stride)
        };
        match candidate {
            Some(next) => self.next = next,
            // nothing representable is left above `id`
            None => self.limit = self.next - 1,
        }
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }
}
