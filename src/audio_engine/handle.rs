//! Voice handles and the voice-group table.
//!
//! A [`Handle`] names either one voice, by slot and generation, or a voice
//! group. Slots are reused, so a handle only resolves while the slot still
//! holds the generation it was issued with.

use crate::audio_engine::errors::{MixerError, Result};

/// Maximum number of voice groups that can exist at once.
pub const MAX_VOICE_GROUPS: usize = 4095;

/// Opaque identifier returned by the engine's play calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Handle {
    /// Never resolves to anything.
    #[default]
    Invalid,
    /// A single voice.
    Voice { slot: u32, generation: u32 },
    /// A voice group created with `create_voice_group`.
    Group { index: u32 },
}

impl Handle {
    /// The handle returned when a play call fails.
    pub const INVALID: Handle = Handle::Invalid;

    pub(crate) fn voice(slot: usize, generation: u32) -> Self {
        Handle::Voice {
            slot: slot as u32,
            generation,
        }
    }

    /// Returns `false` only for [`Handle::INVALID`].
    pub fn is_valid(self) -> bool {
        self != Handle::Invalid
    }

    pub fn is_group(self) -> bool {
        matches!(self, Handle::Group { .. })
    }
}

/// Returns the generation that follows `generation`, skipping zero.
pub(crate) fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Table of voice groups, each an ordered list of voice handles.
#[derive(Debug, Default)]
pub(crate) struct VoiceGroups {
    groups: Vec<Option<Vec<Handle>>>,
}

impl VoiceGroups {
    pub fn create(&mut self) -> Result<Handle> {
        let index = match self.groups.iter().position(Option::is_none) {
            Some(free) => free,
            None if self.groups.len() < MAX_VOICE_GROUPS => {
                self.groups.push(None);
                self.groups.len() - 1
            }
            None => return Err(MixerError::PoolExhausted),
        };
        self.groups[index] = Some(Vec::new());
        Ok(Handle::Group {
            index: index as u32,
        })
    }

    pub fn destroy(&mut self, group: Handle) -> Result<()> {
        let entry = self.entry_mut(group).ok_or(MixerError::InvalidParameter)?;
        *entry = None;
        Ok(())
    }

    /// Adds `voice` to `group`, dropping members for which `is_live` is false.
    pub fn add(
        &mut self,
        group: Handle,
        voice: Handle,
        is_live: impl Fn(Handle) -> bool,
    ) -> Result<()> {
        if !matches!(voice, Handle::Voice { .. }) || !is_live(voice) {
            return Err(MixerError::InvalidParameter);
        }
        let members = self
            .entry_mut(group)
            .and_then(Option::as_mut)
            .ok_or(MixerError::InvalidParameter)?;
        members.retain(|&member| is_live(member));
        if !members.contains(&voice) {
            members.push(voice);
        }
        Ok(())
    }

    pub fn members(&self, group: Handle) -> Option<&[Handle]> {
        match group {
            Handle::Group { index } => self
                .groups
                .get(index as usize)
                .and_then(Option::as_deref),
            _ => None,
        }
    }

    /// Drops stale members and reports whether the group is now empty.
    pub fn trim(&mut self, group: Handle, is_live: impl Fn(Handle) -> bool) -> bool {
        match self.entry_mut(group).and_then(Option::as_mut) {
            Some(members) => {
                members.retain(|&member| is_live(member));
                members.is_empty()
            }
            None => true,
        }
    }

    pub fn is_group(&self, handle: Handle) -> bool {
        self.members(handle).is_some()
    }

    fn entry_mut(&mut self, group: Handle) -> Option<&mut Option<Vec<Handle>>> {
        match group {
            Handle::Group { index } => self.groups.get_mut(index as usize),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_handle_is_invalid() {
        assert_eq!(Handle::default(), Handle::INVALID);
        assert!(!Handle::INVALID.is_valid());
        assert!(Handle::voice(0, 1).is_valid());
    }

    #[test]
    fn test_handles_compare_structurally() {
        assert_eq!(Handle::voice(3, 7), Handle::voice(3, 7));
        assert_ne!(Handle::voice(3, 7), Handle::voice(3, 8));
        assert_ne!(Handle::voice(3, 7), Handle::voice(4, 7));
    }

    #[test]
    fn test_next_generation_skips_zero() {
        assert_eq!(next_generation(1), 2);
        assert_eq!(next_generation(u32::MAX), 1);
    }

    #[test]
    fn test_group_add_and_trim() {
        let mut groups = VoiceGroups::default();
        let group = groups.create().unwrap();
        assert!(groups.is_group(group));

        let a = Handle::voice(0, 1);
        let b = Handle::voice(1, 2);
        groups.add(group, a, |_| true).unwrap();
        groups.add(group, b, |_| true).unwrap();
        groups.add(group, b, |_| true).unwrap();
        assert_eq!(groups.members(group).unwrap(), &[a, b]);

        assert!(!groups.trim(group, |h| h == b));
        assert_eq!(groups.members(group).unwrap(), &[b]);
        assert!(groups.trim(group, |_| false));
    }

    #[test]
    fn test_group_rejects_dead_voice_and_reuses_index() {
        let mut groups = VoiceGroups::default();
        let group = groups.create().unwrap();
        assert_eq!(
            groups.add(group, Handle::voice(0, 1), |_| false),
            Err(MixerError::InvalidParameter)
        );

        groups.destroy(group).unwrap();
        assert!(!groups.is_group(group));
        assert_eq!(groups.create().unwrap(), group);
    }
}
