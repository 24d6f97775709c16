use super::{EntryIndex, FlowEntry, FlowKey};
use delayprobe_config::FlowVariant;
use thiserror::Error;

/// Hash table of `1 << log2_size` buckets over a pool of the same
/// capacity. Collisions chain through `FlowEntry::next`.
pub struct FlowTable {
    buckets: Vec<Option<EntryIndex>>,
    pool: Vec<Option<FlowEntry>>,
    free: Vec<EntryIndex>,
    capacity: usize,
    mask: u64,
    len: usize,
}

impl FlowTable {
    pub fn new(log2_size: u8) -> Self {
        let capacity = 1usize << log2_size;
        Self {
            buckets: vec![None; capacity],
            pool: Vec::with_capacity(capacity),
            free: Vec::new(),
            capacity,
            mask: (capacity - 1) as u64,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries as a percentage of the pool.
    pub fn utilisation_percent(&self) -> f64 {
        (100 * self.len) as f64 / self.capacity as f64
    }

    fn bucket_of(&self, key: &FlowKey) -> usize {
        (key.bucket_hash() & self.mask) as usize
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<EntryIndex> {
        let mut cursor = self.buckets[self.bucket_of(key)];
        while let Some(index) = cursor {
            let entry = self.pool[index as usize].as_ref()?;
            if entry.key == *key {
                return Some(index);
            }
            cursor = entry.next;
        }
        None
    }

    /// Finds the entry for `key`, creating it if there is none. The
    /// boolean is `true` when the entry was created by this call.
    pub fn lookup_or_create(
        &mut self,
        key: FlowKey,
        variant: FlowVariant,
        now_ns: u64,
    ) -> Result<(EntryIndex, bool), FlowTableError> {
        if let Some(index) = self.lookup(&key) {
            return Ok((index, false));
        }
        let index = self.allocate()?;
        let bucket = self.bucket_of(&key);
        let mut entry = FlowEntry::new(key, variant, now_ns);
        entry.next = self.buckets[bucket];
        self.pool[index as usize] = Some(entry);
        self.buckets[bucket] = Some(index);
        self.len += 1;
        Ok((index, true))
    }

    fn allocate(&mut self) -> Result<EntryIndex, FlowTableError> {
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        if self.pool.len() < self.capacity {
            self.pool.push(None);
            return Ok((self.pool.len() - 1) as EntryIndex);
        }
        Err(FlowTableError::TableFull)
    }

    pub fn get(&self, index: EntryIndex) -> Option<&FlowEntry> {
        self.pool.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: EntryIndex) -> Option<&mut FlowEntry> {
        self.pool.get_mut(index as usize)?.as_mut()
    }

    /// Unlinks an entry from its bucket chain and frees its pool slot.
    pub fn remove(&mut self, index: EntryIndex) -> Option<FlowEntry> {
        let entry = self.pool.get_mut(index as usize)?.take()?;
        let bucket = self.bucket_of(&entry.key);

        if self.buckets[bucket] == Some(index) {
            self.buckets[bucket] = entry.next;
        } else {
            let mut cursor = self.buckets[bucket];
            while let Some(current) = cursor {
                let Some(previous) = self.pool[current as usize].as_mut() else {
                    break;
                };
                if previous.next == Some(index) {
                    previous.next = entry.next;
                    break;
                }
                cursor = previous.next;
            }
        }

        self.free.push(index);
        self.len -= 1;
        Some(entry)
    }

    /// Every live entry with its index.
    pub fn iter(&self) -> impl Iterator<Item = (EntryIndex, &FlowEntry)> {
        self.pool
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|entry| (index as EntryIndex, entry)))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlowTableError {
    #[error("Flow table is full")]
    TableFull,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::test_packets::srv6_packet;
    use std::collections::HashSet;

    fn key(n: u16) -> FlowKey {
        let mut packet = srv6_packet("2001:db8::1", "2001:db8::2", 100);
        packet.src_port = n;
        FlowKey::from_packet(&packet)
    }

    #[test]
    fn distinct_keys_get_distinct_handles() {
        let mut table = FlowTable::new(6);
        let mut seen = HashSet::new();
        for n in 0..64 {
            let (index, created) = table.lookup_or_create(key(n), FlowVariant::Srh, 0).unwrap();
            assert!(created);
            assert!(seen.insert(index));
        }
        for n in 0..64 {
            let (index, created) = table.lookup_or_create(key(n), FlowVariant::Srh, 1).unwrap();
            assert!(!created);
            assert_eq!(table.get(index).unwrap().key, key(n));
        }
        assert_eq!(table.len(), 64);
    }

    #[test]
    fn full_table_rejects_new_flows_only() {
        let mut table = FlowTable::new(4);
        for n in 0..16 {
            table.lookup_or_create(key(n), FlowVariant::Srh, 0).unwrap();
        }
        assert_eq!(
            table.lookup_or_create(key(16), FlowVariant::Srh, 0),
            Err(FlowTableError::TableFull)
        );
        for n in 0..16 {
            assert!(table.lookup(&key(n)).is_some());
        }
        assert!(table.lookup_or_create(key(3), FlowVariant::Srh, 0).is_ok());
        assert_eq!(table.utilisation_percent(), 100.0);
    }

    #[test]
    fn remove_keeps_the_rest_of_the_chain() {
        // A 2-bucket table guarantees collisions.
        let mut table = FlowTable::new(1);
        let (a, _) = table.lookup_or_create(key(1), FlowVariant::Srh, 0).unwrap();
        let (b, _) = table.lookup_or_create(key(2), FlowVariant::Srh, 0).unwrap();
        assert_eq!(table.remove(a).unwrap().key, key(1));
        assert!(table.lookup(&key(1)).is_none());
        assert_eq!(table.lookup(&key(2)), Some(b));
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);

        let (c, created) = table.lookup_or_create(key(3), FlowVariant::Srh, 0).unwrap();
        assert!(created);
        assert_eq!(c, a);
        table.remove(b);
        table.remove(c);
        assert!(table.is_empty());
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn updates_accumulate() {
        let mut table = FlowTable::new(4);
        let (index, _) = table.lookup_or_create(key(1), FlowVariant::Srh, 10).unwrap();
        let lengths = [100u32, 200, 1500];
        for (n, length) in lengths.iter().enumerate() {
            table.get_mut(index).unwrap().update(*length, 20 + n as u64);
        }
        let entry = table.get(index).unwrap();
        assert_eq!(entry.packets, 3);
        assert_eq!(entry.octets, 1800);
        assert_eq!(entry.created_ns, 10);
        assert_eq!(entry.last_seen_ns, 22);
    }
}
