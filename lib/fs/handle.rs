/// Arena of open handles. A handle is `generation << 32 | slot`, the generation of a slot
/// moves on every release so a stale or doubly released handle never reaches a new owner.
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn split(fh: u64) -> (u32, usize) {
    ((fh >> 32) as u32, (fh & 0xffff_ffff) as usize)
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> u64 {
        let idx = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    // never hand out 0, some callers treat it as "no handle"
                    generation: 1,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[idx as usize];
        slot.value = Some(value);
        ((slot.generation as u64) << 32) | idx as u64
    }

    pub fn get(&self, fh: u64) -> Option<&T> {
        let (generation, idx) = split(fh);
        self.slots
            .get(idx)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn remove(&mut self, fh: u64) -> Option<T> {
        let (generation, idx) = split(fh);
        let slot = self.slots.get_mut(idx).filter(|s| s.generation == generation)?;
        let v = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(idx as u32);
        Some(v)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::HandleTable;

    #[test]
    fn test_generations() {
        let mut t = HandleTable::new();
        let a = t.insert("a");
        let b = t.insert("b");
        assert_ne!(a, 0);
        assert_eq!(t.get(a), Some(&"a"));
        assert_eq!(t.len(), 2);

        assert_eq!(t.remove(a), Some("a"));
        // double release
        assert_eq!(t.remove(a), None);
        let c = t.insert("c");
        // same slot, new generation
        assert_eq!(c & 0xffff_ffff, a & 0xffff_ffff);
        assert_ne!(c, a);
        assert_eq!(t.get(a), None);
        assert_eq!(t.get(c), Some(&"c"));
        assert_eq!(t.get(b), Some(&"b"));
        assert_eq!(t.get(u64::MAX), None);
    }
}
