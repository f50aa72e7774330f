//! Fixed-capacity arena of voice slots.

use crate::audio_engine::handle::Handle;
use crate::audio_engine::voice::Voice;

pub struct VoicePool {
    slots: Vec<Option<Voice>>,
    /// One past the highest slot that has been occupied since the last trim.
    highest: usize,
}

impl VoicePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            highest: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Upper bound for slot scans.
    pub fn highest(&self) -> usize {
        self.highest
    }

    pub fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn insert(&mut self, slot: usize, voice: Voice) {
        self.slots[slot] = Some(voice);
        self.highest = self.highest.max(slot + 1);
    }

    /// Removes the voice in `slot`, returning it.
    pub fn take(&mut self, slot: usize) -> Option<Voice> {
        let voice = self.slots.get_mut(slot)?.take();
        while self.highest > 0 && self.slots[self.highest - 1].is_none() {
            self.highest -= 1;
        }
        voice
    }

    /// Resolves a voice handle to its slot if the generation still matches.
    pub fn resolve(&self, handle: Handle) -> Option<usize> {
        let Handle::Voice { slot, generation } = handle else {
            return None;
        };
        let slot = slot as usize;
        match self.slots.get(slot)? {
            Some(voice) if voice.generation == generation => Some(slot),
            _ => None,
        }
    }

    pub fn handle_of(&self, slot: usize) -> Handle {
        match self.slot(slot) {
            Some(voice) => Handle::voice(slot, voice.generation),
            None => Handle::INVALID,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&Voice> {
        self.resolve(handle).and_then(|slot| self.slot(slot))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Voice> {
        self.resolve(handle).and_then(|slot| self.slot_mut(slot))
    }

    pub fn slot(&self, slot: usize) -> Option<&Voice> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut Voice> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Voice)> {
        self.slots[..self.highest]
            .iter()
            .enumerate()
            .filter_map(|(slot, voice)| voice.as_ref().map(|v| (slot, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Voice)> {
        self.slots[..self.highest]
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, voice)| voice.as_mut().map(|v| (slot, v)))
    }

    /// Number of live voices.
    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::bus::Bus;
    use crate::audio_engine::source::{AudioSource, SourceSettings};

    fn voice_with_generation(generation: u32) -> Voice {
        let bus = Bus::new();
        let instance = bus.create_instance().unwrap();
        let mut voice = Voice::new(instance, &SourceSettings::default(), Default::default());
        voice.generation = generation;
        voice
    }

    #[test]
    fn test_resolve_requires_matching_generation() {
        let mut pool = VoicePool::new(4);
        let slot = pool.find_free().unwrap();
        pool.insert(slot, voice_with_generation(7));

        assert_eq!(pool.resolve(Handle::voice(slot, 7)), Some(slot));
        assert_eq!(pool.resolve(Handle::voice(slot, 8)), None);
        assert_eq!(pool.resolve(Handle::INVALID), None);
        assert_eq!(pool.handle_of(slot), Handle::voice(slot, 7));
    }

    #[test]
    fn test_reused_slot_rejects_stale_handle() {
        let mut pool = VoicePool::new(2);
        pool.insert(0, voice_with_generation(1));
        assert!(pool.take(0).is_some());
        pool.insert(0, voice_with_generation(2));

        assert!(pool.get(Handle::voice(0, 1)).is_none());
        assert!(pool.get(Handle::voice(0, 2)).is_some());
    }

    #[test]
    fn test_find_free_and_highest() {
        let mut pool = VoicePool::new(3);
        pool.insert(0, voice_with_generation(1));
        pool.insert(2, voice_with_generation(2));
        assert_eq!(pool.find_free(), Some(1));
        assert_eq!(pool.highest(), 3);
        assert_eq!(pool.count(), 2);

        pool.take(2);
        assert_eq!(pool.highest(), 1);
        pool.insert(1, voice_with_generation(3));
        pool.insert(2, voice_with_generation(4));
        assert_eq!(pool.find_free(), None);
    }
}
