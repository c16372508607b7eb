use crate::OutputCookie;
use chunk::{ChunkId, ChunkTreeId};
use std::collections::HashMap;

/// One position of the user-visible output: either a chunk teleported
/// verbatim into the destination table, or the output of a completed job
/// identified by its cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OutputOrderEntry {
    TeleportChunk(ChunkId),
    Cookie(OutputCookie),
}

/// OutputOrder maintains a stable commit order over teleported chunks and
/// job outputs even though completions arrive out of order.
///
/// Entries live in an arena-backed intrusive list: `pool` stores entries
/// in insertion order and `next_position` links them in output order, so
/// the whole structure relocates trivially under persistence.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutputOrder {
    cookie_to_position: HashMap<i32, usize>,
    teleport_to_position: HashMap<ChunkId, usize>,

    pool: Vec<OutputOrderEntry>,
    next_position: Vec<i32>,

    current_position: i32,
}

impl Default for OutputOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputOrder {
    pub fn new() -> Self {
        Self {
            cookie_to_position: HashMap::new(),
            teleport_to_position: HashMap::new(),
            pool: Vec::new(),
            next_position: Vec::new(),
            current_position: -1,
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Move the insertion cursor onto the given cookie's position, so that
    /// subsequent pushes land right after it.
    pub fn seek_cookie(&mut self, cookie: OutputCookie) {
        let position = *self
            .cookie_to_position
            .get(&cookie.0)
            .expect("seek target cookie is not registered");
        self.current_position = position as i32;
    }

    /// Append an entry after the cursor and advance the cursor onto it.
    pub fn push(&mut self, entry: OutputOrderEntry) {
        let position = self.pool.len();

        match entry {
            OutputOrderEntry::Cookie(cookie) => {
                let previous = self.cookie_to_position.insert(cookie.0, position);
                assert!(previous.is_none(), "cookie {cookie} is already ordered");
            }
            OutputOrderEntry::TeleportChunk(chunk_id) => {
                let previous = self.teleport_to_position.insert(chunk_id, position);
                assert!(previous.is_none(), "chunk {chunk_id} is already ordered");
            }
        }

        self.pool.push(entry);
        if self.current_position < 0 {
            self.next_position.push(-1);
        } else {
            let cursor = self.current_position as usize;
            self.next_position.push(self.next_position[cursor]);
            self.next_position[cursor] = position as i32;
        }
        self.current_position = position as i32;
    }

    /// Entries in output order.
    pub fn to_entry_vector(&self) -> Vec<OutputOrderEntry> {
        self.walk().map(|position| self.pool[position]).collect()
    }

    /// Arrange chunk trees registered per entry into commit order.
    pub fn arrange_output_chunk_trees(
        &self,
        chunk_trees: Vec<(OutputOrderEntry, ChunkTreeId)>,
    ) -> Vec<ChunkTreeId> {
        let mut by_position: HashMap<usize, ChunkTreeId> = HashMap::new();
        for (entry, chunk_tree) in chunk_trees {
            let position = match entry {
                OutputOrderEntry::Cookie(cookie) => self.cookie_to_position.get(&cookie.0),
                OutputOrderEntry::TeleportChunk(chunk_id) => {
                    self.teleport_to_position.get(&chunk_id)
                }
            };
            let position = *position.expect("arranged entry is not registered");
            let previous = by_position.insert(position, chunk_tree);
            assert!(previous.is_none(), "entry registered twice");
        }

        self.walk()
            .filter_map(|position| by_position.get(&position).copied())
            .collect()
    }

    pub fn save(&self, out: &mut Vec<u8>) {
        use crate::persist::{put_chunk_id, put_i64, put_u32, record, tags};
        record(out, tags::OUTPUT_ORDER, |out| {
            put_u32(out, self.pool.len() as u32);
            for entry in &self.pool {
                match entry {
                    OutputOrderEntry::TeleportChunk(chunk_id) => {
                        put_u32(out, 0);
                        put_chunk_id(out, chunk_id);
                    }
                    OutputOrderEntry::Cookie(cookie) => {
                        put_u32(out, 1);
                        put_i64(out, cookie.0 as i64);
                    }
                }
            }
            for next in &self.next_position {
                put_i64(out, *next as i64);
            }
            put_i64(out, self.current_position as i64);
        });
    }

    pub fn load(input: &mut &[u8]) -> Result<Self, crate::persist::PersistError> {
        use crate::persist::{
            expect_record, get_chunk_id, get_i64, get_u32, parse_payload, tags, PersistError,
        };
        let payload = expect_record(input, tags::OUTPUT_ORDER)?;
        parse_payload(payload, |input| {
            let count = get_u32(input)? as usize;
            let mut order = Self::new();
            let mut pool = Vec::with_capacity(count);
            for _ in 0..count {
                pool.push(match get_u32(input)? {
                    0 => OutputOrderEntry::TeleportChunk(get_chunk_id(input)?),
                    1 => OutputOrderEntry::Cookie(OutputCookie(get_i64(input)? as i32)),
                    other => return Err(PersistError::UnknownDiscriminator(other)),
                });
            }
            let mut next_position = Vec::with_capacity(count);
            for _ in 0..count {
                next_position.push(get_i64(input)? as i32);
            }
            let current_position = get_i64(input)? as i32;

            // The indices are derived state; rebuild them from the pool.
            for (position, entry) in pool.iter().enumerate() {
                match entry {
                    OutputOrderEntry::Cookie(cookie) => {
                        order.cookie_to_position.insert(cookie.0, position);
                    }
                    OutputOrderEntry::TeleportChunk(chunk_id) => {
                        order.teleport_to_position.insert(*chunk_id, position);
                    }
                }
            }
            order.pool = pool;
            order.next_position = next_position;
            order.current_position = current_position;
            Ok(order)
        })
    }

    fn walk(&self) -> impl Iterator<Item = usize> + '_ {
        let mut position = if self.pool.is_empty() { -1 } else { 0 };
        std::iter::from_fn(move || {
            if position < 0 {
                return None;
            }
            let current = position as usize;
            position = self.next_position[current];
            Some(current)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cookie(value: i32) -> OutputOrderEntry {
        OutputOrderEntry::Cookie(OutputCookie(value))
    }

    fn teleport(seq: u64) -> OutputOrderEntry {
        OutputOrderEntry::TeleportChunk(ChunkId::from_parts(1, seq))
    }

    #[test]
    fn sequential_pushes_keep_insertion_order() {
        let mut order = OutputOrder::new();
        order.push(teleport(1));
        order.push(cookie(0));
        order.push(cookie(1));

        assert_eq!(
            order.to_entry_vector(),
            vec![teleport(1), cookie(0), cookie(1)]
        );
        insta::assert_snapshot!(
            format!("{:?}", order.to_entry_vector()),
            @"[TeleportChunk(0000000000000001-0000000000000001), Cookie(OutputCookie(0)), Cookie(OutputCookie(1))]"
        );
    }

    #[test]
    fn seek_inserts_after_the_sought_cookie() {
        let mut order = OutputOrder::new();
        order.push(cookie(0));
        order.push(cookie(1));
        order.push(cookie(2));

        // A job split on interruption: its continuation lands right after
        // the original, not at the tail.
        order.seek_cookie(OutputCookie(1));
        order.push(cookie(3));

        assert_eq!(
            order.to_entry_vector(),
            vec![cookie(0), cookie(1), cookie(3), cookie(2)]
        );
    }

    #[test]
    fn walk_yields_every_entry_once() {
        let mut order = OutputOrder::new();
        for value in 0..5 {
            order.push(cookie(value));
        }
        order.seek_cookie(OutputCookie(2));
        order.push(teleport(9));

        let entries = order.to_entry_vector();
        assert_eq!(entries.len(), order.len());
        let mut seen = std::collections::HashSet::new();
        for entry in entries {
            assert!(seen.insert(entry));
        }
    }

    #[test]
    fn arrange_orders_chunk_trees() {
        let mut order = OutputOrder::new();
        order.push(cookie(0));
        order.push(teleport(7));
        order.push(cookie(1));

        // Registration order is completion order, not output order.
        let arranged = order.arrange_output_chunk_trees(vec![
            (cookie(1), ChunkTreeId::from_parts(0, 11)),
            (teleport(7), ChunkTreeId::from_parts(0, 77)),
            (cookie(0), ChunkTreeId::from_parts(0, 10)),
        ]);

        assert_eq!(
            arranged,
            vec![
                ChunkTreeId::from_parts(0, 10),
                ChunkTreeId::from_parts(0, 77),
                ChunkTreeId::from_parts(0, 11),
            ]
        );
    }
}
